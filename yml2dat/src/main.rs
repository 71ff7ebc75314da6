use argh::FromArgs;
use log::info;
use marker_rig::{CameraParam, OpenCvCalibration};

#[derive(FromArgs)]
/// Convert an OpenCV YAML camera calibration into a binary camera parameter file.
struct Args {
    /// the OpenCV calibration file (camera_matrix, distortion_coefficients)
    #[argh(positional)]
    yml_file: String,

    /// where to write the camera parameters
    #[argh(option, short = 'o', default = "String::from(\"camera_para.dat\")")]
    output: String,

    /// calibrated image width, overrides image_width from the YAML file
    #[argh(option)]
    width: Option<i32>,

    /// calibrated image height, overrides image_height from the YAML file
    #[argh(option)]
    height: Option<i32>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Args = argh::from_env();
    env_logger::init();

    println!("Reading file {}...", args.yml_file);
    let calib = OpenCvCalibration::load(&args.yml_file)?;

    println!("{}", calib.camera_matrix);
    println!("{:?}", calib.distortion_coefficients);

    let xsize = args
        .width
        .or(calib.image_width.map(|w| w as i32))
        .ok_or("image width unknown, pass --width")?;
    let ysize = args
        .height
        .or(calib.image_height.map(|h| h as i32))
        .ok_or("image height unknown, pass --height")?;

    let param = CameraParam::from_opencv(&calib, xsize, ysize)?;
    param.save(&args.output)?;

    info!("wrote {}x{} camera parameters to {}", xsize, ysize, args.output);
    Ok(())
}
