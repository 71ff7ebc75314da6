use argh::FromArgs;
use log::{error, info, warn};
use marker_rig::{
    CameraParam, DetectedMarker, DetectionRecord, DetectorConfig, MarkerDetector, MarkerInfo,
    PatternTransform, RigError, estimate_square_pose, read_rgb_image,
    rig::{relative_transforms, screen_markers},
    storage::save_markers_xml,
};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use std::{
    fmt::Write,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

#[derive(FromArgs)]
/// Detect markers in every JPEG image of a directory and save their poses.
struct Args {
    /// directory holding the *.jpg images
    #[argh(positional)]
    image_dir: PathBuf,

    /// marker side length, in the unit wanted for the translations
    #[argh(positional)]
    square_size: f64,

    /// marker whose frame the other markers are also expressed in
    #[argh(positional)]
    base_id: Option<i32>,

    /// camera parameter file
    #[argh(option, short = 'c', default = "PathBuf::from(\"camera_para.dat\")")]
    camera: PathBuf,

    /// output XML file
    #[argh(option, short = 'o', default = "PathBuf::from(\"markers.xml\")")]
    output: PathBuf,
}

fn is_jpeg(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
}

/// JPEG files directly inside `dir`, sorted by path.
fn list_images(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut filenames = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_jpeg(path))
        .collect::<Vec<_>>();
    filenames.sort();
    Ok(filenames)
}

fn detect_in_file(
    detector: &mut MarkerDetector,
    cparam: &CameraParam,
    path: &Path,
    square_size: f64,
    base_id: Option<i32>,
) -> Result<(Vec<DetectedMarker>, String), Box<dyn std::error::Error>> {
    let img = read_rgb_image(path)?;
    let param = cparam.fit_to(img.width() as i32, img.height() as i32)?;
    let markers = detector.detect(&img)?;

    let mut report = String::new();
    writeln!(report, "{}", path.display())?;
    let detected = locate_markers(&param, &markers, square_size, base_id, &mut report)?;
    Ok((detected, report))
}

/// Pose of every usable marker. Transforms relative to `base_id` are attached
/// only when the base was seen exactly once.
fn locate_markers(
    param: &CameraParam,
    markers: &[MarkerInfo],
    square_size: f64,
    base_id: Option<i32>,
    report: &mut String,
) -> Result<Vec<DetectedMarker>, std::fmt::Error> {
    writeln!(report, "Detected markers:")?;

    let mut detected = Vec::new();
    let mut transforms = Vec::new();
    for (marker, status) in screen_markers(markers) {
        writeln!(
            report,
            "id {} - [{:.3}, {:.3}]{status}",
            marker.id, marker.center.x, marker.center.y
        )?;
        if !status.is_usable() {
            continue;
        }

        let pose = match estimate_square_pose(param, marker, square_size) {
            Ok(pose) => pose,
            Err(e) => {
                writeln!(report, " {e}")?;
                continue;
            }
        };
        writeln!(report, "rvec {:?}", pose.rvec.as_slice())?;
        writeln!(report, "tvec {:?}", pose.tvec.as_slice())?;

        transforms.push(PatternTransform {
            id: marker.id,
            square_size,
            transform: pose.transform,
        });
        detected.push(DetectedMarker {
            id: marker.id,
            center: marker.center,
            vertices: marker.vertices,
            rvec: pose.rvec,
            tvec: pose.tvec,
            relative: None,
        });
    }

    if let Some(base_id) = base_id {
        match relative_transforms(&transforms, base_id) {
            Ok(relative) => {
                for (marker, t) in detected.iter_mut().zip(relative) {
                    marker.relative = Some(t.transform);
                }
            }
            Err(RigError::BaseNotFound(_)) => writeln!(report, "baseId not found.")?,
            Err(RigError::DuplicateBase(..)) => writeln!(report, "Duplicate baseId.")?,
            Err(e) => writeln!(report, "{e}")?,
        }
    }

    Ok(detected)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Args = argh::from_env();
    env_logger::init();

    let cparam = CameraParam::load(&args.camera)?;
    println!("cparam xsize: {} ysize: {}", cparam.xsize, cparam.ysize);

    let filenames = list_images(&args.image_dir)?;
    if filenames.is_empty() {
        return Err(format!("no JPEG images found in {}", args.image_dir.display()).into());
    }
    info!("{} image(s) to process", filenames.len());

    // create a cancel token to stop before the remaining images
    let cancel_token = Arc::new(AtomicBool::new(false));

    ctrlc::set_handler({
        let cancel_token = cancel_token.clone();
        move || {
            println!("Received Ctrl-C signal. Finishing the images in progress !!");
            cancel_token.store(true, Ordering::SeqCst);
        }
    })?;

    let records = filenames
        .par_iter()
        .map_init(
            || MarkerDetector::new(DetectorConfig::default()),
            |detector, path| {
                if cancel_token.load(Ordering::SeqCst) {
                    return None;
                }

                let markers =
                    match detect_in_file(detector, &cparam, path, args.square_size, args.base_id) {
                        Ok((markers, report)) => {
                            println!("{report}");
                            markers
                        }
                        Err(e) => {
                            error!("{}: {e}", path.display());
                            Vec::new()
                        }
                    };

                Some(DetectionRecord {
                    filename: path.display().to_string(),
                    markers,
                })
            },
        )
        .flatten()
        .collect::<Vec<_>>();

    if records.len() < filenames.len() {
        warn!(
            "stopped early, {} of {} image(s) processed",
            records.len(),
            filenames.len()
        );
    }

    save_markers_xml(&args.output, &records)?;
    println!("Saved {} record(s) to {}", records.len(), args.output.display());

    Ok(())
}
