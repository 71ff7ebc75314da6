use argh::FromArgs;
use log::{error, info, warn};
use marker_rig::{
    CameraParam, DetectorConfig, MarkerDetector, MultiMarkerConfig, RigError, SquareSizes,
    estimate_square_pose,
    overlay::{draw_marker, log_to_rerun, save_overlay},
    read_rgb_image,
    rig::{collect_transforms, screen_markers},
};

#[derive(FromArgs)]
/// Build a multi-marker configuration from the markers visible in one image.
struct Args {
    /// image showing all markers of the rig
    #[argh(positional)]
    image_file: String,

    /// square size used for markers without an entry in the size file
    #[argh(positional)]
    square_size: f64,

    /// marker used as the origin of the rig
    #[argh(positional)]
    base_id: Option<i32>,

    /// camera parameter file
    #[argh(option, short = 'c', default = "String::from(\"camera_para.dat\")")]
    camera: String,

    /// per-marker square sizes
    #[argh(option, short = 's', default = "String::from(\"square_size.yml\")")]
    sizes: String,

    /// multi-marker configuration to write
    #[argh(option, short = 'o', default = "String::from(\"multi.dat\")")]
    output: String,

    /// where to save the annotated image
    #[argh(option, default = "String::from(\"output.png\")")]
    overlay: String,

    /// also send the annotated image to a rerun viewer
    #[argh(switch)]
    rerun: bool,
}

/// Square size overrides, or none when the file cannot be used.
fn load_sizes(path: &str) -> SquareSizes {
    SquareSizes::load(path).unwrap_or_else(|e| {
        warn!("ignoring {path}: {e}, using the default square size for every marker");
        SquareSizes::default()
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Args = argh::from_env();
    env_logger::init();

    let sizes = load_sizes(&args.sizes);
    for (id, size) in sizes.iter() {
        println!("{id}: {size}");
    }

    let mut img = read_rgb_image(&args.image_file)?;

    let cparam = CameraParam::load(&args.camera)?;
    println!("cparam xsize: {} ysize: {}", cparam.xsize, cparam.ysize);
    let cparam = cparam.fit_to(img.width() as i32, img.height() as i32)?;

    let mut detector = MarkerDetector::new(DetectorConfig::default());
    let markers = detector.detect(&img)?;

    println!("Detected markers:");
    for (marker, status) in screen_markers(&markers) {
        println!(
            "id {} - [{:.3}, {:.3}]{status}",
            marker.id, marker.center.x, marker.center.y
        );
    }

    let transforms = collect_transforms(&markers, &sizes, args.square_size, |marker, size| {
        let pose = estimate_square_pose(&cparam, marker, size)?;
        println!("id {} (square size {size}):", marker.id);
        println!("{}", pose.transform);
        Ok(pose.transform)
    });

    let usable = markers
        .into_iter()
        .filter(|m| m.is_usable())
        .collect::<Vec<_>>();
    for marker in &usable {
        draw_marker(&mut img, marker);
    }

    let written = match args.base_id {
        None => {
            println!("baseId not found.");
            false
        }
        Some(base_id) => match MultiMarkerConfig::from_base(&transforms, base_id) {
            Ok(config) => {
                config.save(&args.output)?;
                info!(
                    "wrote {} marker(s) relative to {} into {}",
                    config.markers.len(),
                    base_id,
                    args.output
                );
                true
            }
            Err(RigError::BaseNotFound(_)) => {
                println!("baseId not found.");
                false
            }
            Err(RigError::DuplicateBase(..)) => {
                println!("Duplicate baseId.");
                false
            }
            Err(e) => {
                error!("{e}");
                false
            }
        },
    };

    save_overlay(&args.overlay, &img)?;
    println!("Saved overlay to {}", args.overlay);

    if args.rerun {
        let rec = rerun::RecordingStreamBuilder::new("trainmulti").connect_grpc()?;
        log_to_rerun(&rec, &img, &usable)?;
    }

    if !written {
        return Err(format!("{} was not written", args.output).into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreadable_size_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("square_size.yml");

        std::fs::write(&path, "squares: [ { id: 1, square_size: 80 }").unwrap();
        let sizes = load_sizes(path.to_str().unwrap());
        assert!(sizes.is_empty());
        assert_eq!(sizes.size_for(1, 40.0), 40.0);

        std::fs::write(&path, "squares: 4\n").unwrap();
        assert!(load_sizes(path.to_str().unwrap()).is_empty());
    }

    #[test]
    fn test_size_file_overrides_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("square_size.yml");
        std::fs::write(&path, "squares:\n  - { id: 1, square_size: 80 }\n").unwrap();

        let sizes = load_sizes(path.to_str().unwrap());
        assert_eq!(sizes.size_for(1, 40.0), 80.0);
        assert_eq!(sizes.size_for(2, 40.0), 40.0);
    }
}
