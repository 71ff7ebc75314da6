use crate::{calibration::CameraParam, detect::MarkerInfo};
use nalgebra::{DMatrix, Matrix3, Matrix3x4, Matrix4, Point2, Point3, Rotation3, Vector3};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoseError {
    #[error("square size must be positive, got {0}")]
    InvalidSquareSize(f64),
    #[error("need at least 4 point correspondences, got {0}")]
    NotEnoughPoints(usize),
    #[error("svd failed")]
    SvdFailed,
    #[error("degenerate marker geometry")]
    Degenerate,
}

/// Marker pose in the camera frame.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerPose {
    /// Homogeneous marker-to-camera transform.
    pub transform: Matrix4<f64>,
    /// Axis-angle rotation vector.
    pub rvec: Vector3<f64>,
    pub tvec: Vector3<f64>,
    /// RMS reprojection error in (undistorted) pixels.
    pub error: f64,
}

/// Corners of a square marker of side `size`, centred on the origin of the
/// marker plane, in detector vertex order.
pub fn square_object_points(size: f64) -> [Point2<f64>; 4] {
    let h = size / 2.0;
    [
        Point2::new(-h, h),
        Point2::new(h, h),
        Point2::new(h, -h),
        Point2::new(-h, -h),
    ]
}

/// Promote a 3x4 `[R | t]` matrix to 4x4 homogeneous form.
pub fn to_homogeneous(conv: &Matrix3x4<f64>) -> Matrix4<f64> {
    let mut hom = Matrix4::identity();
    hom.fixed_view_mut::<3, 4>(0, 0).copy_from(conv);
    hom
}

/// Estimate `H` such that `image ~ H * object` using DLT.
pub fn homography_dlt(
    object: &[Point2<f64>],
    image: &[Point2<f64>],
) -> Result<Matrix3<f64>, PoseError> {
    let n = object.len();
    if n < 4 || image.len() != n {
        return Err(PoseError::NotEnoughPoints(n));
    }

    // Zero rows keep A at least 9x9 so V^T holds the full null space.
    let mut a = DMatrix::<f64>::zeros((2 * n).max(9), 9);

    for (i, (po, pi)) in object.iter().zip(image.iter()).enumerate() {
        let (x, y) = (po.x, po.y);
        let (u, v) = (pi.x, pi.y);
        let r0 = 2 * i;
        let r1 = 2 * i + 1;

        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;

        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t.ok_or(PoseError::SvdFailed)?;
    let h = v_t.row(svd.singular_values.imin());

    let mut h_mat = Matrix3::zeros();
    for r in 0..3 {
        for c in 0..3 {
            h_mat[(r, c)] = h[3 * r + c];
        }
    }

    let scale = h_mat[(2, 2)];
    if scale.abs() > f64::EPSILON {
        h_mat /= scale;
    }

    Ok(h_mat)
}

/// Decompose a plane-to-normalized-image homography into `[R | t]`.
///
/// The plane is `z = 0` in marker coordinates. `t_z` is kept positive so the
/// marker lies in front of the camera.
pub fn pose_from_homography(h: &Matrix3<f64>) -> Result<Matrix3x4<f64>, PoseError> {
    let h1 = h.column(0).into_owned();
    let h2 = h.column(1).into_owned();
    let h3 = h.column(2).into_owned();

    let norms = h1.norm() + h2.norm();
    if norms < f64::EPSILON {
        return Err(PoseError::Degenerate);
    }
    let mut lambda = 2.0 / norms;
    if h3.z < 0.0 {
        lambda = -lambda;
    }

    let r1 = h1 * lambda;
    let r2 = h2 * lambda;
    let r3 = r1.cross(&r2);
    let r = Matrix3::from_columns(&[r1, r2, r3]);

    // nearest rotation
    let svd = r.svd(true, true);
    let u = svd.u.ok_or(PoseError::SvdFailed)?;
    let v_t = svd.v_t.ok_or(PoseError::SvdFailed)?;
    let mut r_orth = u * v_t;
    if r_orth.determinant() < 0.0 {
        let mut u_flipped = u;
        u_flipped.column_mut(2).neg_mut();
        r_orth = u_flipped * v_t;
    }

    let t = h3 * lambda;
    if !t.iter().chain(r_orth.iter()).all(|v| v.is_finite()) {
        return Err(PoseError::Degenerate);
    }

    let mut conv = Matrix3x4::zeros();
    conv.fixed_view_mut::<3, 3>(0, 0).copy_from(&r_orth);
    conv.set_column(3, &t);
    Ok(conv)
}

/// Pose of a square marker of side `square_size` seen by the camera `param`.
pub fn estimate_square_pose(
    param: &CameraParam,
    marker: &MarkerInfo,
    square_size: f64,
) -> Result<MarkerPose, PoseError> {
    if square_size.is_nan() || square_size <= 0.0 {
        return Err(PoseError::InvalidSquareSize(square_size));
    }

    let k = param.intrinsics();
    let ideal = marker.vertices.map(|v| param.dist.undistort(v));
    let normalized = ideal.map(|p| Point2::new((p.x - k.cx) / k.fx, (p.y - k.cy) / k.fy));

    let object = square_object_points(square_size);
    let h = homography_dlt(&object, &normalized)?;
    let conv = pose_from_homography(&h)?;

    let rot = conv.fixed_view::<3, 3>(0, 0).into_owned();
    let tvec: Vector3<f64> = conv.column(3).into_owned();
    let rvec = Rotation3::from_matrix_unchecked(rot).scaled_axis();

    let sq_err = object
        .iter()
        .zip(ideal.iter())
        .map(|(o, p)| {
            let pc = rot * Point3::new(o.x, o.y, 0.0).coords + tvec;
            let u = k.fx * pc.x / pc.z + k.cx;
            let v = k.fy * pc.y / pc.z + k.cy;
            (u - p.x).powi(2) + (v - p.y).powi(2)
        })
        .sum::<f64>();

    Ok(MarkerPose {
        transform: to_homogeneous(&conv),
        rvec,
        tvec,
        error: (sq_err / object.len() as f64).sqrt(),
    })
}
