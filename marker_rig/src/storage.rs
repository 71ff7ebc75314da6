//! OpenCV `FileStorage` compatible XML output for batch detection results.

use nalgebra::{DMatrix, Matrix4, Point2, Vector3};
use std::{io::Write, path::Path};

/// A marker that passed filtering, with its camera-relative pose.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedMarker {
    pub id: i32,
    pub center: Point2<f64>,
    pub vertices: [Point2<f64>; 4],
    pub rvec: Vector3<f64>,
    pub tvec: Vector3<f64>,
    /// Pose in the frame of the base marker, when one was requested and found.
    pub relative: Option<Matrix4<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionRecord {
    pub filename: String,
    pub markers: Vec<DetectedMarker>,
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn write_matrix<W: Write>(
    w: &mut W,
    indent: &str,
    name: &str,
    m: &DMatrix<f64>,
) -> std::io::Result<()> {
    writeln!(w, "{indent}<{name} type_id=\"opencv-matrix\">")?;
    writeln!(w, "{indent}  <rows>{}</rows>", m.nrows())?;
    writeln!(w, "{indent}  <cols>{}</cols>", m.ncols())?;
    writeln!(w, "{indent}  <dt>d</dt>")?;
    write!(w, "{indent}  <data>")?;
    // FileStorage stores matrices row-major
    let values = (0..m.nrows())
        .flat_map(|r| (0..m.ncols()).map(move |c| (r, c)))
        .map(|(r, c)| format!("{:e}", m[(r, c)]))
        .collect::<Vec<_>>();
    write!(w, "{}", values.join(" "))?;
    writeln!(w, "</data></{name}>")
}

fn points_matrix(points: &[Point2<f64>]) -> DMatrix<f64> {
    DMatrix::from_fn(points.len(), 2, |r, c| points[r][c])
}

/// Write `markers_list`: one entry per image with its file name, the plain
/// list of marker ids, and the per-marker details.
pub fn write_markers_xml<W: Write>(
    mut w: W,
    records: &[DetectionRecord],
) -> std::io::Result<()> {
    writeln!(w, "<?xml version=\"1.0\"?>")?;
    writeln!(w, "<opencv_storage>")?;
    writeln!(w, "<markers_list>")?;

    for record in records {
        writeln!(w, "  <_>")?;
        writeln!(w, "    <filename>\"{}\"</filename>", escape(&record.filename))?;

        let ids = record
            .markers
            .iter()
            .map(|m| m.id.to_string())
            .collect::<Vec<_>>();
        writeln!(w, "    <markers>{}</markers>", ids.join(" "))?;

        writeln!(w, "    <details>")?;
        for marker in &record.markers {
            let indent = "        ";
            writeln!(w, "      <_>")?;
            writeln!(w, "{indent}<id>{}</id>", marker.id)?;
            write_matrix(&mut w, indent, "center", &points_matrix(&[marker.center]))?;
            write_matrix(&mut w, indent, "corners", &points_matrix(&marker.vertices))?;
            write_matrix(
                &mut w,
                indent,
                "rvec",
                &DMatrix::from_column_slice(3, 1, marker.rvec.as_slice()),
            )?;
            write_matrix(
                &mut w,
                indent,
                "tvec",
                &DMatrix::from_column_slice(3, 1, marker.tvec.as_slice()),
            )?;
            if let Some(relative) = &marker.relative {
                let m = DMatrix::from_fn(4, 4, |r, c| relative[(r, c)]);
                write_matrix(&mut w, indent, "relative_transform", &m)?;
            }
            writeln!(w, "      </_>")?;
        }
        writeln!(w, "    </details>")?;
        writeln!(w, "  </_>")?;
    }

    writeln!(w, "</markers_list>")?;
    writeln!(w, "</opencv_storage>")?;
    Ok(())
}

pub fn save_markers_xml(
    path: impl AsRef<Path>,
    records: &[DetectionRecord],
) -> std::io::Result<()> {
    let file = std::fs::File::create(path)?;
    let mut w = std::io::BufWriter::new(file);
    write_markers_xml(&mut w, records)?;
    w.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(id: i32, relative: Option<Matrix4<f64>>) -> DetectedMarker {
        DetectedMarker {
            id,
            center: Point2::new(150.0, 150.0),
            vertices: [
                Point2::new(100.0, 200.0),
                Point2::new(200.0, 200.0),
                Point2::new(200.0, 100.0),
                Point2::new(100.0, 100.0),
            ],
            rvec: Vector3::new(0.1, 0.2, 0.3),
            tvec: Vector3::new(1.0, 2.0, 300.0),
            relative,
        }
    }

    fn render(records: &[DetectionRecord]) -> String {
        let mut out = Vec::new();
        write_markers_xml(&mut out, records).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_xml_lists_ids_per_file() {
        let records = vec![
            DetectionRecord {
                filename: "C:\\shots\\a&b.jpg".into(),
                markers: vec![marker(3, None), marker(8, None)],
            },
            DetectionRecord {
                filename: "empty.jpg".into(),
                markers: vec![],
            },
        ];
        let xml = render(&records);

        assert!(xml.starts_with("<?xml version=\"1.0\"?>\n<opencv_storage>\n<markers_list>\n"));
        assert!(xml.ends_with("</markers_list>\n</opencv_storage>\n"));
        assert!(xml.contains("<filename>\"C:\\shots\\a&amp;b.jpg\"</filename>"));
        assert!(xml.contains("<markers>3 8</markers>"));
        assert!(xml.contains("<markers></markers>"));
        assert_eq!(xml.matches("<id>").count(), 2);
        assert!(!xml.contains("relative_transform"));
    }

    #[test]
    fn test_xml_matrix_nodes() {
        let records = vec![DetectionRecord {
            filename: "a.jpg".into(),
            markers: vec![marker(1, Some(Matrix4::identity()))],
        }];
        let xml = render(&records);

        assert!(xml.contains("<tvec type_id=\"opencv-matrix\">"));
        assert!(xml.contains("<data>1e0 2e0 3e2</data></tvec>"));
        assert!(xml.contains("<data>1e2 2e2 2e2 2e2 2e2 1e2 1e2 1e2</data></corners>"));
        assert!(xml.contains("<relative_transform type_id=\"opencv-matrix\">"));
        assert!(xml.contains("<rows>4</rows>"));
        assert!(xml.contains("<data>1e0 0e0 0e0 0e0 0e0 1e0"));
    }

    #[test]
    fn test_save_markers_xml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("markers.xml");
        save_markers_xml(&path, &[]).unwrap();
        let xml = std::fs::read_to_string(&path).unwrap();
        assert!(xml.contains("<markers_list>\n</markers_list>"));
    }
}
