use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array1, Array2, ArrayView2};

/// Eigenvalues below this are treated as zero.
const EIGEN_EPS: f32 = 1e-10;

/// Eigendecomposition of a symmetric matrix.
///
/// The input is symmetrized before decomposing it, so small asymmetries from accumulated rounding
/// do not matter. Eigenvalues below `1e-10` are clamped to zero.
///
/// # Arguments
/// * `a` - A square matrix.
///
/// # Returns
/// The eigenvalues `d` and a matrix `q` with the matching eigenvectors as columns, such that
/// `a = q · diag(d) · qᵀ`.
pub fn symmetric_eigen(a: ArrayView2<f32>) -> (Array1<f32>, Array2<f32>) {
    let n = a.nrows();
    let m = DMatrix::from_fn(n, n, |i, j| 0.5 * (a[[i, j]] + a[[j, i]]));
    let eig = SymmetricEigen::new(m);

    let d = eig
        .eigenvalues
        .iter()
        .map(|&e| if e > EIGEN_EPS { e } else { 0. })
        .collect::<Array1<f32>>();
    let q = Array2::from_shape_fn((n, n), |(i, j)| eig.eigenvectors[(i, j)]);

    (d, q)
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn reconstructs_the_matrix() {
        let a = array![[4., 1., 0.], [1., 3., 1.], [0., 1., 2.]];
        let (d, q) = symmetric_eigen(a.view());
        let rebuilt = q.dot(&Array2::from_diag(&d)).dot(&q.t());

        for (x, y) in rebuilt.iter().zip(a.iter()) {
            assert!((x - y).abs() < 1e-4);
        }
    }

    #[test]
    fn clamps_negative_eigenvalues() {
        let (d, _) = symmetric_eigen(array![[0., 1.], [1., 0.]].view());
        let mut d = d.to_vec();
        d.sort_by(f32::total_cmp);
        assert_eq!(d[0], 0.);
        assert!((d[1] - 1.).abs() < 1e-5);
    }
}
