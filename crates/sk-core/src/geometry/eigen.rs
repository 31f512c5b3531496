//! Symmetric 3x3 eigen-decomposition (cyclic Jacobi)

use glam::{DMat3, DVec3};

const MAX_SWEEPS: usize = 32;

/// Eigenvalues and eigenvectors of a symmetric matrix.
///
/// `vectors.col(i)` belongs to `values[i]`. The input's upper triangle is
/// ignored.
#[derive(Debug, Clone, Copy)]
pub struct SymmetricEigen {
    pub values: [f64; 3],
    pub vectors: DMat3,
}

pub fn symmetric_eigen(m: DMat3) -> SymmetricEigen {
    // a[row][col]
    let mut a = [
        [m.x_axis.x, m.x_axis.y, m.x_axis.z],
        [m.x_axis.y, m.y_axis.y, m.y_axis.z],
        [m.x_axis.z, m.y_axis.z, m.z_axis.z],
    ];
    let mut v = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

    for _ in 0..MAX_SWEEPS {
        let off = a[0][1] * a[0][1] + a[0][2] * a[0][2] + a[1][2] * a[1][2];
        let scale = a[0][0] * a[0][0] + a[1][1] * a[1][1] + a[2][2] * a[2][2];
        if off <= f64::EPSILON * f64::EPSILON * scale.max(f64::MIN_POSITIVE) {
            break;
        }

        for (p, q) in [(0, 1), (0, 2), (1, 2)] {
            if a[p][q].abs() < f64::MIN_POSITIVE {
                continue;
            }
            let theta = (a[q][q] - a[p][p]) / (2.0 * a[p][q]);
            let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
            let c = 1.0 / (t * t + 1.0).sqrt();
            let s = t * c;

            for k in 0..3 {
                let akp = a[k][p];
                let akq = a[k][q];
                a[k][p] = c * akp - s * akq;
                a[k][q] = s * akp + c * akq;
            }
            for k in 0..3 {
                let apk = a[p][k];
                let aqk = a[q][k];
                a[p][k] = c * apk - s * aqk;
                a[q][k] = s * apk + c * aqk;
            }
            for row in &mut v {
                let vp = row[p];
                let vq = row[q];
                row[p] = c * vp - s * vq;
                row[q] = s * vp + c * vq;
            }
        }
    }

    SymmetricEigen {
        values: [a[0][0], a[1][1], a[2][2]],
        vectors: DMat3::from_cols(
            DVec3::new(v[0][0], v[1][0], v[2][0]),
            DVec3::new(v[0][1], v[1][1], v[2][1]),
            DVec3::new(v[0][2], v[1][2], v[2][2]),
        ),
    }
}
