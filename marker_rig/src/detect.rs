use kornia_apriltag::{
    decode::{DecodeTagsOpts, GrayModelPair, SharpeningBuffer, decode_tags},
    family::TagFamily,
    quad::{FitQuadOpts, fit_quads},
    segmentation::{GradientInfo, find_connected_components, find_gradient_clusters},
    threshold::{TileMinMax, adaptive_threshold},
    union_find::UnionFind,
    utils::Pixel,
};
use kornia_image::{Image, ImageSize, allocator::CpuAllocator};
use kornia_imgproc::color::gray_from_rgb_u8;
use kornia_io::jpeg::read_image_jpeg_rgb8;
use log::debug;
use nalgebra::Point2;
use std::{collections::HashMap, fmt, path::Path};
use thiserror::Error;

pub type RgbImage = Image<u8, 3, CpuAllocator>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("failed to read image {path}: {source}")]
    ReadImage {
        path: String,
        #[source]
        source: BoxError,
    },
    #[error("marker detection failed during {stage}: {source}")]
    Pipeline {
        stage: &'static str,
        #[source]
        source: BoxError,
    },
}

fn pipeline_err<E>(stage: &'static str) -> impl FnOnce(E) -> DetectError
where
    E: std::error::Error + Send + Sync + 'static,
{
    move |e| DetectError::Pipeline {
        stage,
        source: Box::new(e),
    }
}

/// Why a detected marker should not be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CutoffPhase {
    None,
    /// Decoded, but the decision margin is below the configured minimum.
    MatchConfidence,
    /// At least one vertex lies on the image border, the marker may be clipped.
    PartialVisibility,
}

impl fmt::Display for CutoffPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CutoffPhase::None => "none",
            CutoffPhase::MatchConfidence => "match_confidence",
            CutoffPhase::PartialVisibility => "partial_visibility",
        };
        f.write_str(name)
    }
}

/// One detected square marker in image pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerInfo {
    /// Decoded id, `-1` when the code could not be read reliably.
    pub id: i32,
    pub center: Point2<f64>,
    pub vertices: [Point2<f64>; 4],
    pub hamming: u32,
    pub decision_margin: f32,
    pub cutoff_phase: CutoffPhase,
}

impl MarkerInfo {
    pub fn is_usable(&self) -> bool {
        self.id >= 0 && self.cutoff_phase == CutoffPhase::None
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DetectorConfig {
    /// Detections with more corrected bits than this are reported with id `-1`.
    pub max_hamming: u32,
    pub min_decision_margin: f32,
    pub decode_sharpening: f32,
    pub refine_edges: bool,
    pub min_cluster_pixels: usize,
    pub min_white_black_diff: u8,
    pub tile_size: usize,
    /// Distance in pixels from the image edge under which a vertex counts as clipped.
    pub border_margin: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            max_hamming: 2,
            min_decision_margin: 0.0,
            decode_sharpening: 0.25,
            refine_edges: true,
            min_cluster_pixels: 5,
            min_white_black_diff: 20,
            tile_size: 4,
            border_margin: 1.0,
        }
    }
}

/// Raw decoder output before it is classified.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawTag {
    pub id: u32,
    pub hamming: u32,
    pub decision_margin: f32,
    pub corners: [[f64; 2]; 4],
}

/// Intersection of the quad diagonals, falling back to the vertex mean for
/// degenerate quads.
pub(crate) fn quad_center(v: &[Point2<f64>; 4]) -> Point2<f64> {
    let d1 = v[2] - v[0];
    let d2 = v[3] - v[1];
    let denom = d1.x * d2.y - d1.y * d2.x;

    if denom.abs() < f64::EPSILON {
        let sum = v.iter().fold(nalgebra::Vector2::zeros(), |acc, p| acc + p.coords);
        return Point2::from(sum / 4.0);
    }

    let w = v[1] - v[0];
    let t = (w.x * d2.y - w.y * d2.x) / denom;
    v[0] + d1 * t
}

pub(crate) fn classify(raw: RawTag, config: &DetectorConfig, size: ImageSize) -> MarkerInfo {
    let vertices = raw.corners.map(|[x, y]| Point2::new(x, y));
    let center = quad_center(&vertices);

    let id = if raw.hamming > config.max_hamming {
        -1
    } else {
        raw.id as i32
    };

    let max_x = size.width as f64 - 1.0 - config.border_margin;
    let max_y = size.height as f64 - 1.0 - config.border_margin;
    let clipped = vertices.iter().any(|p| {
        p.x < config.border_margin || p.y < config.border_margin || p.x > max_x || p.y > max_y
    });

    let cutoff_phase = if raw.decision_margin < config.min_decision_margin {
        CutoffPhase::MatchConfidence
    } else if clipped {
        CutoffPhase::PartialVisibility
    } else {
        CutoffPhase::None
    };

    MarkerInfo {
        id,
        center,
        vertices,
        hamming: raw.hamming,
        decision_margin: raw.decision_margin,
        cutoff_phase,
    }
}

// Preallocated detector buffers, valid for one image size.
struct DetectorBuffers {
    size: ImageSize,
    grayscale: Image<u8, 1, CpuAllocator>,
    binary: Image<Pixel, 1, CpuAllocator>,
    tile_min_max: TileMinMax,
    uf: UnionFind,
    clusters: HashMap<(usize, usize), Vec<GradientInfo>>,
    gray_model_pair: GrayModelPair,
    sharpening_buffer: SharpeningBuffer,
}

impl DetectorBuffers {
    fn new(size: ImageSize, tile_size: usize) -> Result<Self, DetectError> {
        let grayscale = Image::from_size_val(size, 0u8, CpuAllocator)
            .map_err(pipeline_err("allocation"))?;
        let binary = Image::from_size_val(size, Pixel::Skip, CpuAllocator)
            .map_err(pipeline_err("allocation"))?;

        Ok(Self {
            size,
            grayscale,
            binary,
            tile_min_max: TileMinMax::new(size, tile_size),
            uf: UnionFind::new(size.width * size.height),
            clusters: HashMap::new(),
            gray_model_pair: GrayModelPair::new(),
            sharpening_buffer: SharpeningBuffer::new(&TagFamily::TAG36_H11),
        })
    }

    fn reset(&mut self) {
        self.uf.reset();
        self.clusters.clear();
        self.gray_model_pair.reset();
        self.sharpening_buffer.reset();
    }
}

/// Tag36h11 marker detector reusing its buffers across images of the same size.
pub struct MarkerDetector {
    config: DetectorConfig,
    fit_quad_opts: FitQuadOpts,
    decode_tags_opts: DecodeTagsOpts,
    buffers: Option<DetectorBuffers>,
}

impl MarkerDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            fit_quad_opts: FitQuadOpts::default(),
            decode_tags_opts: DecodeTagsOpts::new(
                &TagFamily::TAG36_H11,
                config.refine_edges,
                config.decode_sharpening,
            ),
            buffers: None,
        }
    }

    pub fn detect(&mut self, img: &RgbImage) -> Result<Vec<MarkerInfo>, DetectError> {
        let size = img.size();
        let buf = match self.buffers.take() {
            Some(b) if b.size.width == size.width && b.size.height == size.height => b,
            _ => {
                debug!("allocating detector buffers for {}x{}", size.width, size.height);
                DetectorBuffers::new(size, self.config.tile_size)?
            }
        };
        let buf = self.buffers.insert(buf);
        buf.reset();

        gray_from_rgb_u8(img, &mut buf.grayscale)
            .map_err(pipeline_err("grayscale"))?;

        adaptive_threshold(
            &buf.grayscale,
            &mut buf.binary,
            &mut buf.tile_min_max,
            self.config.min_white_black_diff,
        )
        .map_err(pipeline_err("threshold"))?;

        find_connected_components(&buf.binary, &mut buf.uf)
            .map_err(pipeline_err("segmentation"))?;
        find_gradient_clusters(&buf.binary, &mut buf.uf, &mut buf.clusters);

        let mut quads = fit_quads(
            &buf.binary,
            &TagFamily::TAG36_H11,
            &mut buf.clusters,
            self.config.min_cluster_pixels,
            self.fit_quad_opts,
        );

        let detections = decode_tags(
            &buf.grayscale,
            &mut quads,
            &self.decode_tags_opts,
            &mut buf.gray_model_pair,
            &mut buf.sharpening_buffer,
        );

        let markers = detections
            .iter()
            .map(|tag| {
                let c = &tag.quad.corners;
                let raw = RawTag {
                    id: tag.id as u32,
                    hamming: tag.hamming as u32,
                    decision_margin: tag.decision_margin,
                    corners: [
                        [c[0].x as f64, c[0].y as f64],
                        [c[1].x as f64, c[1].y as f64],
                        [c[2].x as f64, c[2].y as f64],
                        [c[3].x as f64, c[3].y as f64],
                    ],
                };
                classify(raw, &self.config, size)
            })
            .collect::<Vec<_>>();

        debug!("{} marker(s) decoded", markers.len());
        Ok(markers)
    }
}

pub fn read_rgb_image(path: impl AsRef<Path>) -> Result<RgbImage, DetectError> {
    let path = path.as_ref();
    read_image_jpeg_rgb8(path).map_err(|e| DetectError::ReadImage {
        path: path.display().to_string(),
        source: Box::new(e),
    })
}
