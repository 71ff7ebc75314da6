use log::{debug, warn};
use nalgebra::{Matrix3, Matrix3x4, Point2};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Size of the `xsize`/`ysize` header plus the 3x4 projection matrix.
const HEADER_BYTES: usize = 2 * 4 + 12 * 8;
/// Number of distortion factors stored by each file version (index = version - 1).
const DIST_FACTOR_COUNT: [usize; 4] = [4, 5, 6, 9];
const UNDISTORT_ITERATIONS: usize = 20;

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("camera parameter data has unexpected length {0}")]
    UnexpectedLength(usize),
    #[error("cannot write a version {0} camera parameter record, only version 4 is supported")]
    LegacyWrite(u8),
    #[error("image size must be positive, got {0}x{1}")]
    InvalidSize(i32, i32),
    #[error("invalid OpenCV calibration: {0}")]
    InvalidOpenCv(String),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

/// Lens distortion stored after the projection matrix.
#[derive(Debug, Clone, PartialEq)]
pub enum Distortion {
    /// Version 4: OpenCV radial/tangential model with its own intrinsics.
    OpenCv {
        k1: f64,
        k2: f64,
        p1: f64,
        p2: f64,
        fx: f64,
        fy: f64,
        x0: f64,
        y0: f64,
        s: f64,
    },
    /// Versions 1 to 3, kept as raw factors.
    Legacy { version: u8, factors: Vec<f64> },
}

impl Distortion {
    pub fn version(&self) -> u8 {
        match self {
            Distortion::OpenCv { .. } => 4,
            Distortion::Legacy { version, .. } => *version,
        }
    }

    fn factors(&self) -> Vec<f64> {
        match self {
            Distortion::OpenCv {
                k1,
                k2,
                p1,
                p2,
                fx,
                fy,
                x0,
                y0,
                s,
            } => vec![*k1, *k2, *p1, *p2, *fx, *fy, *x0, *y0, *s],
            Distortion::Legacy { factors, .. } => factors.clone(),
        }
    }

    fn from_factors(version: u8, factors: Vec<f64>) -> Self {
        if version == 4 {
            Distortion::OpenCv {
                k1: factors[0],
                k2: factors[1],
                p1: factors[2],
                p2: factors[3],
                fx: factors[4],
                fy: factors[5],
                x0: factors[6],
                y0: factors[7],
                s: factors[8],
            }
        } else {
            Distortion::Legacy { version, factors }
        }
    }

    /// Map an observed (distorted) pixel to its ideal position.
    ///
    /// The OpenCV model has no closed-form inverse, so the normalized point is
    /// refined by fixed-point iteration. Legacy models return the pixel as is.
    pub fn undistort(&self, observed: Point2<f64>) -> Point2<f64> {
        let Distortion::OpenCv {
            k1,
            k2,
            p1,
            p2,
            fx,
            fy,
            x0,
            y0,
            s,
        } = *self
        else {
            return observed;
        };

        let xd = (observed.x - x0) / fx;
        let yd = (observed.y - y0) / fy;
        let (mut x, mut y) = (xd, yd);

        for _ in 0..UNDISTORT_ITERATIONS {
            let r2 = x * x + y * y;
            let icdist = 1.0 / (1.0 + k1 * r2 + k2 * r2 * r2);
            let dx = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
            let dy = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
            x = (xd - dx) * icdist;
            y = (yd - dy) * icdist;
        }

        Point2::new(x * fx / s + x0, y * fy / s + y0)
    }

    /// Forward model, ideal pixel to observed pixel.
    ///
    /// `s` scales the ideal image plane only, observed pixels use `fx`/`fy` as is.
    pub fn distort(&self, ideal: Point2<f64>) -> Point2<f64> {
        let Distortion::OpenCv {
            k1,
            k2,
            p1,
            p2,
            fx,
            fy,
            x0,
            y0,
            s,
        } = *self
        else {
            return ideal;
        };

        let x = (ideal.x - x0) * s / fx;
        let y = (ideal.y - y0) * s / fy;
        let r2 = x * x + y * y;
        let radial = 1.0 + k1 * r2 + k2 * r2 * r2;
        let xd = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;

        Point2::new(xd * fx + x0, yd * fy + y0)
    }
}

/// Binary camera parameter record, as read from `camera_para.dat`.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraParam {
    pub xsize: i32,
    pub ysize: i32,
    pub mat: Matrix3x4<f64>,
    pub dist: Distortion,
}

/// Pinhole intrinsics taken from the projection matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Intrinsics {
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }
}

impl CameraParam {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CalibrationError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let param = Self::from_bytes(&bytes)?;
        debug!(
            "loaded {} (version {}, {}x{})",
            path.display(),
            param.dist.version(),
            param.xsize,
            param.ysize
        );
        if let Distortion::Legacy { version, .. } = param.dist {
            warn!(
                "{}: version {} distortion is not corrected, detected corners are used as is",
                path.display(),
                version
            );
        }
        Ok(param)
    }

    /// Parse the first record of a (possibly multi-record) parameter file.
    ///
    /// The file version is inferred from its length, newest version first.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CalibrationError> {
        let version = (1..=DIST_FACTOR_COUNT.len())
            .rev()
            .find(|&v| {
                let record = record_len(v as u8);
                !bytes.is_empty() && bytes.len() % record == 0
            })
            .ok_or(CalibrationError::UnexpectedLength(bytes.len()))? as u8;

        let mut reader = BeReader::new(bytes);
        let xsize = reader.i32()?;
        let ysize = reader.i32()?;

        let mut mat = Matrix3x4::zeros();
        for r in 0..3 {
            for c in 0..4 {
                mat[(r, c)] = reader.f64()?;
            }
        }

        let factors = (0..DIST_FACTOR_COUNT[version as usize - 1])
            .map(|_| reader.f64())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            xsize,
            ysize,
            mat,
            dist: Distortion::from_factors(version, factors),
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CalibrationError> {
        let version = self.dist.version();
        if version != 4 {
            return Err(CalibrationError::LegacyWrite(version));
        }

        let mut bytes = Vec::with_capacity(record_len(version));
        bytes.extend_from_slice(&self.xsize.to_be_bytes());
        bytes.extend_from_slice(&self.ysize.to_be_bytes());
        for r in 0..3 {
            for c in 0..4 {
                bytes.extend_from_slice(&self.mat[(r, c)].to_be_bytes());
            }
        }
        for factor in self.dist.factors() {
            bytes.extend_from_slice(&factor.to_be_bytes());
        }

        Ok(bytes)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CalibrationError> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    /// Rescale the parameters to a new image size.
    ///
    /// Only the horizontal ratio is used, for both axes.
    pub fn change_size(&self, xsize: i32, ysize: i32) -> Result<Self, CalibrationError> {
        if xsize <= 0 || ysize <= 0 {
            return Err(CalibrationError::InvalidSize(xsize, ysize));
        }
        if self.xsize <= 0 {
            return Err(CalibrationError::InvalidSize(self.xsize, self.ysize));
        }

        let scale = xsize as f64 / self.xsize as f64;

        let mut mat = self.mat;
        for c in 0..4 {
            mat[(0, c)] *= scale;
            mat[(1, c)] *= scale;
        }

        let dist = match &self.dist {
            Distortion::OpenCv {
                k1,
                k2,
                p1,
                p2,
                fx,
                fy,
                x0,
                y0,
                s,
            } => Distortion::OpenCv {
                k1: *k1,
                k2: *k2,
                p1: *p1,
                p2: *p2,
                fx: fx * scale,
                fy: fy * scale,
                x0: x0 * scale,
                y0: y0 * scale,
                s: *s,
            },
            Distortion::Legacy { version, factors } => {
                let mut factors = factors.clone();
                // center of distortion
                factors[0] *= scale;
                factors[1] *= scale;
                // radial terms are per squared (and fourth power) pixel distance
                factors[2] /= scale * scale;
                if *version >= 2 {
                    factors[3] /= scale.powi(4);
                }
                Distortion::Legacy {
                    version: *version,
                    factors,
                }
            }
        };

        Ok(Self {
            xsize,
            ysize,
            mat,
            dist,
        })
    }

    /// Rescale only when the image size differs from the calibrated one.
    pub fn fit_to(&self, xsize: i32, ysize: i32) -> Result<Self, CalibrationError> {
        if self.xsize == xsize && self.ysize == ysize {
            return Ok(self.clone());
        }
        debug!(
            "rescaling camera parameters from {}x{} to {}x{}",
            self.xsize, self.ysize, xsize, ysize
        );
        self.change_size(xsize, ysize)
    }

    pub fn intrinsics(&self) -> Intrinsics {
        Intrinsics {
            fx: self.mat[(0, 0)],
            fy: self.mat[(1, 1)],
            cx: self.mat[(0, 2)],
            cy: self.mat[(1, 2)],
        }
    }

    /// Build a version 4 record from an OpenCV calibration.
    pub fn from_opencv(
        calib: &OpenCvCalibration,
        xsize: i32,
        ysize: i32,
    ) -> Result<Self, CalibrationError> {
        if xsize <= 0 || ysize <= 0 {
            return Err(CalibrationError::InvalidSize(xsize, ysize));
        }

        let k = &calib.camera_matrix;
        let mut mat = Matrix3x4::zeros();
        mat.fixed_view_mut::<3, 3>(0, 0).copy_from(k);

        let coeffs = &calib.distortion_coefficients;
        if coeffs.len() > 4 && coeffs[4..].iter().any(|c| *c != 0.0) {
            warn!(
                "dropping {} higher order distortion coefficient(s), only k1 k2 p1 p2 are stored",
                coeffs.len() - 4
            );
        }
        let coeff = |i: usize| coeffs.get(i).copied().unwrap_or(0.0);

        Ok(Self {
            xsize,
            ysize,
            mat,
            dist: Distortion::OpenCv {
                k1: coeff(0),
                k2: coeff(1),
                p1: coeff(2),
                p2: coeff(3),
                fx: k[(0, 0)],
                fy: k[(1, 1)],
                x0: k[(0, 2)],
                y0: k[(1, 2)],
                s: 1.0,
            },
        })
    }
}

fn record_len(version: u8) -> usize {
    HEADER_BYTES + DIST_FACTOR_COUNT[version as usize - 1] * 8
}

struct BeReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BeReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], CalibrationError> {
        let end = self.pos + N;
        let chunk = self
            .data
            .get(self.pos..end)
            .ok_or(CalibrationError::UnexpectedLength(self.data.len()))?;
        self.pos = end;
        let mut buf = [0u8; N];
        buf.copy_from_slice(chunk);
        Ok(buf)
    }

    fn i32(&mut self) -> Result<i32, CalibrationError> {
        Ok(i32::from_be_bytes(self.take()?))
    }

    fn f64(&mut self) -> Result<f64, CalibrationError> {
        Ok(f64::from_be_bytes(self.take()?))
    }
}

/// Camera calibration as written by OpenCV's `FileStorage` in YAML.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenCvCalibration {
    pub image_width: Option<u32>,
    pub image_height: Option<u32>,
    pub camera_matrix: Matrix3<f64>,
    pub distortion_coefficients: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct CvMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct CvCalibrationFile {
    image_width: Option<u32>,
    image_height: Option<u32>,
    camera_matrix: CvMatrix,
    distortion_coefficients: Option<CvMatrix>,
}

/// Turn OpenCV's YAML dialect into plain YAML: drop the `%YAML:1.0` directive
/// and the `!!opencv-matrix` tags.
pub(crate) fn plain_yaml(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("%YAML"))
        .map(|line| line.replace("!!opencv-matrix", ""))
        .collect::<Vec<_>>()
        .join("\n")
}

impl OpenCvCalibration {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CalibrationError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, CalibrationError> {
        let file: CvCalibrationFile = serde_yaml::from_str(&plain_yaml(text))?;

        let cm = &file.camera_matrix;
        if cm.rows != 3 || cm.cols != 3 || cm.data.len() != 9 {
            return Err(CalibrationError::InvalidOpenCv(format!(
                "camera_matrix must be 3x3, got {}x{} with {} values",
                cm.rows,
                cm.cols,
                cm.data.len()
            )));
        }
        let camera_matrix = Matrix3::from_row_slice(&cm.data);

        let distortion_coefficients = match file.distortion_coefficients {
            Some(dc) => {
                if (dc.rows != 1 && dc.cols != 1) || dc.rows * dc.cols != dc.data.len() {
                    return Err(CalibrationError::InvalidOpenCv(format!(
                        "distortion_coefficients must be a vector, got {}x{} with {} values",
                        dc.rows,
                        dc.cols,
                        dc.data.len()
                    )));
                }
                dc.data
            }
            None => Vec::new(),
        };

        Ok(Self {
            image_width: file.image_width,
            image_height: file.image_height,
            camera_matrix,
            distortion_coefficients,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPENCV_YAML: &str = "%YAML:1.0
---
calibration_time: \"Tue Mar  1 10:00:00 2016\"
image_width: 640
image_height: 480
camera_matrix: !!opencv-matrix
   rows: 3
   cols: 3
   dt: d
   data: [ 6.0523e+02, 0., 3.195e+02, 0., 6.0611e+02, 2.395e+02, 0., 0.,
       1. ]
distortion_coefficients: !!opencv-matrix
   rows: 5
   cols: 1
   dt: d
   data: [ 1.2e-01, -2.5e-01, 1.0e-03, -2.0e-03, 0. ]
";

    fn sample_param() -> CameraParam {
        let calib = OpenCvCalibration::from_yaml_str(OPENCV_YAML).unwrap();
        CameraParam::from_opencv(&calib, 640, 480).unwrap()
    }

    #[test]
    fn test_parse_opencv_yaml() {
        let calib = OpenCvCalibration::from_yaml_str(OPENCV_YAML).unwrap();
        assert_eq!(calib.image_width, Some(640));
        assert_eq!(calib.image_height, Some(480));
        assert_eq!(calib.camera_matrix[(0, 0)], 605.23);
        assert_eq!(calib.camera_matrix[(1, 2)], 239.5);
        assert_eq!(calib.camera_matrix[(2, 2)], 1.0);
        assert_eq!(calib.distortion_coefficients.len(), 5);
        assert_eq!(calib.distortion_coefficients[1], -0.25);
    }

    #[test]
    fn test_opencv_yaml_rejects_bad_camera_matrix() {
        let text = "camera_matrix:\n  rows: 2\n  cols: 2\n  data: [1, 0, 0, 1]\n";
        assert!(matches!(
            OpenCvCalibration::from_yaml_str(text),
            Err(CalibrationError::InvalidOpenCv(_))
        ));
    }

    #[test]
    fn test_from_opencv_layout() {
        let param = sample_param();
        assert_eq!(param.mat[(0, 0)], 605.23);
        assert_eq!(param.mat[(0, 2)], 319.5);
        assert_eq!(param.mat[(2, 3)], 0.0);
        match param.dist {
            Distortion::OpenCv { k1, p2, x0, y0, s, .. } => {
                assert_eq!(k1, 0.12);
                assert_eq!(p2, -0.002);
                assert_eq!(x0, 319.5);
                assert_eq!(y0, 239.5);
                assert_eq!(s, 1.0);
            }
            Distortion::Legacy { .. } => panic!("expected version 4"),
        }
    }

    #[test]
    fn test_binary_file_round_trip() {
        let param = sample_param();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("camera_para.dat");

        param.save(&path).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 176);

        let loaded = CameraParam::load(&path).unwrap();
        assert_eq!(loaded, param);
    }

    #[test]
    fn test_binary_is_big_endian() {
        let bytes = sample_param().to_bytes().unwrap();
        assert_eq!(&bytes[0..4], &[0, 0, 2, 128]);
        assert_eq!(&bytes[4..8], &[0, 0, 1, 224]);
    }

    #[test]
    fn test_multi_record_file_uses_first_record() {
        let first = sample_param();
        let second = first.change_size(320, 240).unwrap();
        let mut bytes = first.to_bytes().unwrap();
        bytes.extend(second.to_bytes().unwrap());

        assert_eq!(CameraParam::from_bytes(&bytes).unwrap(), first);
    }

    #[test]
    fn test_legacy_record_is_read_but_not_written() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&640i32.to_be_bytes());
        bytes.extend_from_slice(&480i32.to_be_bytes());
        for v in [600.0, 0.0, 320.0, 0.0, 0.0, 600.0, 240.0, 0.0, 0.0, 0.0, 1.0, 0.0] {
            bytes.extend_from_slice(&f64::to_be_bytes(v));
        }
        for v in [320.0, 240.0, 10.0, 1.0] {
            bytes.extend_from_slice(&f64::to_be_bytes(v));
        }
        assert_eq!(bytes.len(), 136);

        let param = CameraParam::from_bytes(&bytes).unwrap();
        assert_eq!(param.dist.version(), 1);
        assert!(matches!(
            param.to_bytes(),
            Err(CalibrationError::LegacyWrite(1))
        ));

        let p = Point2::new(12.5, 40.0);
        assert_eq!(param.dist.undistort(p), p);
    }

    #[test]
    fn test_unexpected_length() {
        assert!(matches!(
            CameraParam::from_bytes(&[0u8; 100]),
            Err(CalibrationError::UnexpectedLength(100))
        ));
        assert!(CameraParam::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_change_size_scales_by_width_ratio() {
        let param = sample_param();
        let half = param.change_size(320, 240).unwrap();

        assert_eq!(half.xsize, 320);
        assert_eq!(half.ysize, 240);
        assert!((half.mat[(0, 0)] - 302.615).abs() < 1e-9);
        assert!((half.mat[(1, 2)] - 119.75).abs() < 1e-9);
        assert_eq!(half.mat[(2, 2)], 1.0);
        match half.dist {
            Distortion::OpenCv { k1, fx, x0, .. } => {
                assert_eq!(k1, 0.12);
                assert!((fx - 302.615).abs() < 1e-9);
                assert!((x0 - 159.75).abs() < 1e-9);
            }
            Distortion::Legacy { .. } => panic!("expected version 4"),
        }

        assert!(param.change_size(0, 240).is_err());
        assert_eq!(param.fit_to(640, 480).unwrap(), param);
    }

    #[test]
    fn test_scale_factor_applies_to_ideal_side() {
        let dist = Distortion::OpenCv {
            k1: 0.0,
            k2: 0.0,
            p1: 0.0,
            p2: 0.0,
            fx: 800.0,
            fy: 800.0,
            x0: 320.0,
            y0: 240.0,
            s: 0.9,
        };

        // observed -> ideal: (ox - x0) / fx, then * fx / s + x0
        let ideal = dist.undistort(Point2::new(400.0, 240.0));
        assert!((ideal.x - (80.0 / 0.9 + 320.0)).abs() < 1e-9, "{ideal:?}");
        assert!((ideal.y - 240.0).abs() < 1e-9);

        // ideal -> observed: (ix - x0) * s / fx, then * fx + x0
        let observed = dist.distort(Point2::new(420.0, 340.0));
        assert!((observed.x - 410.0).abs() < 1e-9, "{observed:?}");
        assert!((observed.y - 330.0).abs() < 1e-9, "{observed:?}");

        let back = dist.undistort(observed);
        assert!((back - Point2::new(420.0, 340.0)).norm() < 1e-9);
    }

    #[test]
    fn test_change_size_rescales_legacy_factors() {
        let mut mat = Matrix3x4::zeros();
        mat[(0, 0)] = 600.0;
        mat[(1, 1)] = 600.0;
        mat[(2, 2)] = 1.0;
        let v1 = CameraParam {
            xsize: 640,
            ysize: 480,
            mat,
            dist: Distortion::Legacy {
                version: 1,
                factors: vec![320.0, 240.0, 10.0, 1.0],
            },
        };
        let half = v1.change_size(320, 240).unwrap();
        assert_eq!(
            half.dist,
            Distortion::Legacy {
                version: 1,
                factors: vec![160.0, 120.0, 40.0, 1.0],
            }
        );

        let v2 = CameraParam {
            dist: Distortion::Legacy {
                version: 2,
                factors: vec![320.0, 240.0, 10.0, 2.0, 1.0],
            },
            ..v1
        };
        let half = v2.change_size(320, 240).unwrap();
        assert_eq!(
            half.dist,
            Distortion::Legacy {
                version: 2,
                factors: vec![160.0, 120.0, 40.0, 32.0, 1.0],
            }
        );
    }

    #[test]
    fn test_undistort_inverts_distort() {
        let param = sample_param();
        for (x, y) in [(10.0, 20.0), (600.0, 450.0), (319.5, 239.5), (100.0, 400.0)] {
            let ideal = Point2::new(x, y);
            let observed = param.dist.distort(ideal);
            let back = param.dist.undistort(observed);
            assert!((back - ideal).norm() < 1e-3, "{ideal:?} -> {back:?}");
        }
    }
}
