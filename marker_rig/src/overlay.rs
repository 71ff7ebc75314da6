use crate::detect::{MarkerInfo, RgbImage};
use kornia_imgproc::draw::draw_line;
use kornia_io::png::write_image_png_rgb8;
use rand::{Rng, SeedableRng};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("failed to write overlay {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error(transparent)]
    Rerun(#[from] rerun::RecordingStreamError),
}

const LINE_THICKNESS: usize = 2;
const ORIENTATION_COLOR: [u8; 3] = [255, 255, 0];

/// Stable colour for a marker id.
pub fn id_to_color(id: i32) -> [u8; 3] {
    let mut small_rng = rand::rngs::SmallRng::seed_from_u64(id as u64);
    let color_num = small_rng.random_range(0..2u32.pow(24));

    [
        ((color_num >> 16) % 256) as u8,
        ((color_num >> 8) % 256) as u8,
        (color_num % 256) as u8,
    ]
}

fn pixel(p: nalgebra::Point2<f64>) -> (i64, i64) {
    (p.x.round() as i64, p.y.round() as i64)
}

/// Outline a marker and mark its first vertex with a line from the center.
pub fn draw_marker(img: &mut RgbImage, marker: &MarkerInfo) {
    let color = id_to_color(marker.id);

    draw_line(
        img,
        pixel(marker.center),
        pixel(marker.vertices[0]),
        ORIENTATION_COLOR,
        LINE_THICKNESS,
    );

    for j in 0..4 {
        draw_line(
            img,
            pixel(marker.vertices[j]),
            pixel(marker.vertices[(j + 1) % 4]),
            color,
            LINE_THICKNESS,
        );
    }
}

pub fn save_overlay(path: impl AsRef<Path>, img: &RgbImage) -> Result<(), OverlayError> {
    let path = path.as_ref();
    write_image_png_rgb8(path, img).map_err(|e| OverlayError::Write {
        path: path.display().to_string(),
        source: Box::new(e),
    })
}

/// Stream the overlay to a rerun viewer, with the marker ids as labels.
pub fn log_to_rerun(
    rec: &rerun::RecordingStream,
    img: &RgbImage,
    markers: &[MarkerInfo],
) -> Result<(), OverlayError> {
    rec.log(
        "overlay",
        &rerun::Image::from_elements(img.as_slice(), img.size().into(), rerun::ColorModel::RGB),
    )?;

    let mut all_coords = Vec::with_capacity(markers.len());
    let mut all_labels = Vec::with_capacity(markers.len());
    let mut all_colors = Vec::with_capacity(markers.len());

    for marker in markers {
        let v = &marker.vertices;
        let coords = [
            [v[0].x as f32, v[0].y as f32],
            [v[1].x as f32, v[1].y as f32],
            [v[2].x as f32, v[2].y as f32],
            [v[3].x as f32, v[3].y as f32],
            [v[0].x as f32, v[0].y as f32],
        ];
        all_coords.push(coords);
        all_labels.push(marker.id.to_string());
        let [r, g, b] = id_to_color(marker.id);
        all_colors.push(rerun::Color::from_rgb(r, g, b));
    }

    rec.log(
        "overlay/markers",
        &rerun::LineStrips2D::new(all_coords)
            .with_labels(all_labels)
            .with_colors(all_colors),
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::CutoffPhase;
    use kornia_image::{Image, ImageSize, allocator::CpuAllocator};
    use nalgebra::Point2;

    #[test]
    fn test_id_to_color_is_stable() {
        assert_eq!(id_to_color(12), id_to_color(12));
        assert_ne!(id_to_color(1), id_to_color(2));
    }

    #[test]
    fn test_save_overlay_reports_path() {
        let size = ImageSize {
            width: 8,
            height: 8,
        };
        let img = Image::from_size_val(size, 128u8, CpuAllocator).unwrap();
        let dir = tempfile::tempdir().unwrap();

        let path = dir.path().join("output.png");
        save_overlay(&path, &img).unwrap();
        assert!(path.is_file());

        let missing = dir.path().join("missing").join("output.png");
        let err = save_overlay(&missing, &img).unwrap_err();
        assert!(matches!(err, OverlayError::Write { .. }));
        assert!(err.to_string().contains("output.png"));
    }

    #[test]
    fn test_draw_marker_touches_outline_only() {
        let size = ImageSize {
            width: 64,
            height: 64,
        };
        let mut img = Image::from_size_val(size, 0u8, CpuAllocator).unwrap();
        let marker = MarkerInfo {
            id: 4,
            center: Point2::new(32.0, 32.0),
            vertices: [
                Point2::new(16.0, 48.0),
                Point2::new(48.0, 48.0),
                Point2::new(48.0, 16.0),
                Point2::new(16.0, 16.0),
            ],
            hamming: 0,
            decision_margin: 80.0,
            cutoff_phase: CutoffPhase::None,
        };

        draw_marker(&mut img, &marker);

        let at = |x: usize, y: usize| {
            let i = (y * size.width + x) * 3;
            [img.as_slice()[i], img.as_slice()[i + 1], img.as_slice()[i + 2]]
        };
        assert_ne!(at(32, 48), [0, 0, 0]);
        assert_ne!(at(16, 32), [0, 0, 0]);
        assert_eq!(at(2, 2), [0, 0, 0]);
        assert_eq!(at(40, 24), [0, 0, 0]);
    }
}
