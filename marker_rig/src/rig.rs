use crate::{
    calibration::plain_yaml,
    detect::{CutoffPhase, MarkerInfo},
    pose::PoseError,
};
use log::{debug, warn};
use nalgebra::Matrix4;
use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    io::Write,
    path::Path,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RigError {
    #[error("base marker {0} not found")]
    BaseNotFound(i32),
    #[error("base marker {0} detected {1} times")]
    DuplicateBase(i32, usize),
    #[error("transform of base marker {0} is not invertible")]
    SingularBase(i32),
    #[error("invalid square size definition: {0}")]
    InvalidSizes(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Deserialize)]
struct SquareSizeEntry {
    id: i32,
    square_size: f64,
}

/// Per-marker square sizes overriding the default size.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SquareSizes(BTreeMap<i32, f64>);

impl SquareSizes {
    /// Read the definitions file. A missing file means "no overrides".
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RigError> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(
                "{} not found, using the default square size for every marker",
                path.display()
            );
            return Ok(Self::default());
        }
        let sizes = Self::from_yaml_str(&std::fs::read_to_string(path)?)?;
        debug!("{} square size(s) read from {}", sizes.0.len(), path.display());
        Ok(sizes)
    }

    /// The first top-level node must be a sequence of `{ id, square_size }`.
    pub fn from_yaml_str(text: &str) -> Result<Self, RigError> {
        let root: serde_yaml::Mapping = serde_yaml::from_str(&plain_yaml(text))?;
        let (_, first) = root
            .into_iter()
            .next()
            .ok_or_else(|| RigError::InvalidSizes("file has no top-level node".into()))?;
        if !first.is_sequence() {
            return Err(RigError::InvalidSizes(
                "first top-level node is not a sequence".into(),
            ));
        }

        let entries: Vec<SquareSizeEntry> = serde_yaml::from_value(first)?;
        Ok(Self(
            entries
                .into_iter()
                .map(|e| (e.id, e.square_size))
                .collect(),
        ))
    }

    pub fn insert(&mut self, id: i32, size: f64) {
        self.0.insert(id, size);
    }

    pub fn size_for(&self, id: i32, default: f64) -> f64 {
        self.0.get(&id).copied().unwrap_or(default)
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, f64)> + '_ {
        self.0.iter().map(|(id, size)| (*id, *size))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Pose of one marker, either camera-relative or base-relative.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternTransform {
    pub id: i32,
    pub square_size: f64,
    pub transform: Matrix4<f64>,
}

/// How a detected marker is treated when building poses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerStatus {
    Usable,
    /// Usable, but the id was already seen in the same image.
    DuplicateId,
    InvalidId,
    Cutoff(CutoffPhase),
}

impl MarkerStatus {
    pub fn is_usable(self) -> bool {
        matches!(self, MarkerStatus::Usable | MarkerStatus::DuplicateId)
    }
}

/// Suffix printed after the `id N - [x, y]` line, empty for usable markers.
impl fmt::Display for MarkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarkerStatus::Usable => Ok(()),
            MarkerStatus::DuplicateId => f.write_str(" duplicate ID!"),
            MarkerStatus::InvalidId => f.write_str(" invalid ID"),
            MarkerStatus::Cutoff(phase) => write!(f, " cutoff {phase}"),
        }
    }
}

/// Status of every marker, in detection order.
pub fn screen_markers(markers: &[MarkerInfo]) -> Vec<(&MarkerInfo, MarkerStatus)> {
    let mut seen = HashSet::new();

    markers
        .iter()
        .map(|marker| {
            let status = if marker.id < 0 {
                MarkerStatus::InvalidId
            } else if !marker.is_usable() {
                MarkerStatus::Cutoff(marker.cutoff_phase)
            } else if !seen.insert(marker.id) {
                MarkerStatus::DuplicateId
            } else {
                MarkerStatus::Usable
            };
            (marker, status)
        })
        .collect()
}

/// Markers that can be used for pose estimation, in detection order.
/// Repeated ids are kept.
pub fn usable_markers(markers: &[MarkerInfo]) -> Vec<&MarkerInfo> {
    screen_markers(markers)
        .into_iter()
        .filter(|(_, status)| status.is_usable())
        .map(|(marker, _)| marker)
        .collect()
}

/// Estimate a transform for every usable marker, in detection order.
pub fn collect_transforms<F>(
    markers: &[MarkerInfo],
    sizes: &SquareSizes,
    default_size: f64,
    mut estimate: F,
) -> Vec<PatternTransform>
where
    F: FnMut(&MarkerInfo, f64) -> Result<Matrix4<f64>, PoseError>,
{
    usable_markers(markers)
        .into_iter()
        .filter_map(|marker| {
            let square_size = sizes.size_for(marker.id, default_size);
            match estimate(marker, square_size) {
                Ok(transform) => Some(PatternTransform {
                    id: marker.id,
                    square_size,
                    transform,
                }),
                Err(e) => {
                    warn!("pose estimation failed for id {}: {e}", marker.id);
                    None
                }
            }
        })
        .collect()
}

/// The single transform whose id is `base_id`.
pub fn find_base(
    transforms: &[PatternTransform],
    base_id: i32,
) -> Result<&PatternTransform, RigError> {
    let mut matches = transforms.iter().filter(|t| t.id == base_id);
    let base = matches.next().ok_or(RigError::BaseNotFound(base_id))?;
    let extra = matches.count();
    if extra > 0 {
        return Err(RigError::DuplicateBase(base_id, extra + 1));
    }
    Ok(base)
}

/// Express every transform in the frame of the base marker:
/// `inverse(T_base) * T_i`.
pub fn relative_transforms(
    transforms: &[PatternTransform],
    base_id: i32,
) -> Result<Vec<PatternTransform>, RigError> {
    let base = find_base(transforms, base_id)?;
    let base_inv = base
        .transform
        .try_inverse()
        .ok_or(RigError::SingularBase(base_id))?;

    Ok(transforms
        .iter()
        .map(|t| PatternTransform {
            id: t.id,
            square_size: t.square_size,
            transform: base_inv * t.transform,
        })
        .collect())
}

/// Multi-marker configuration file consumed by the tracking library.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiMarkerConfig {
    pub markers: Vec<PatternTransform>,
}

impl MultiMarkerConfig {
    pub fn from_base(transforms: &[PatternTransform], base_id: i32) -> Result<Self, RigError> {
        Ok(Self {
            markers: relative_transforms(transforms, base_id)?,
        })
    }

    pub fn write<W: Write>(&self, mut w: W) -> std::io::Result<()> {
        writeln!(w, "{}", self.markers.len())?;
        writeln!(w)?;
        for marker in &self.markers {
            writeln!(w, "{}", marker.id)?;
            writeln!(w, "{}", marker.square_size)?;
            for r in 0..3 {
                for c in 0..4 {
                    write!(w, "{}\t", marker.transform[(r, c)])?;
                }
                writeln!(w)?;
            }
            writeln!(w)?;
        }
        Ok(())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), RigError> {
        let file = std::fs::File::create(path)?;
        let mut w = std::io::BufWriter::new(file);
        self.write(&mut w)?;
        w.flush()?;
        Ok(())
    }
}
