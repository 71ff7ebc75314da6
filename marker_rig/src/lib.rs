pub use nalgebra;

pub mod calibration;
pub mod detect;
pub mod overlay;
pub mod pose;
pub mod rig;
pub mod storage;

pub use calibration::{CalibrationError, CameraParam, Distortion, Intrinsics, OpenCvCalibration};
pub use detect::{
    CutoffPhase, DetectError, DetectorConfig, MarkerDetector, MarkerInfo, RgbImage, read_rgb_image,
};
pub use overlay::OverlayError;
pub use pose::{MarkerPose, PoseError, estimate_square_pose};
pub use rig::{MarkerStatus, MultiMarkerConfig, PatternTransform, RigError, SquareSizes};
pub use storage::{DetectedMarker, DetectionRecord};
