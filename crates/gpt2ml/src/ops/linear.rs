use nalgebra::{DMatrix, DVector};

/// Affine projection `out = w * x + b`.
///
/// The weight matrix follows the `(out_features, in_features)` orientation, so each
/// column of `x` is one input vector.
pub struct Linear;

impl Linear {
    pub fn run_cpu(
        out: &mut DMatrix<f32>,
        w: &DMatrix<f32>,
        b: Option<&DVector<f32>>,
        x: &DMatrix<f32>,
    ) {
        out.gemm(1.0, w, x, 0.0);
        if let Some(b) = b {
            for mut col in out.column_iter_mut() {
                col += b;
            }
        }
    }

    /// Single-vector variant of [`Linear::run_cpu`].
    pub fn run_cpu_vec(
        out: &mut DVector<f32>,
        w: &DMatrix<f32>,
        b: Option<&DVector<f32>>,
        x: &DVector<f32>,
    ) {
        out.gemv(1.0, w, x, 0.0);
        if let Some(b) = b {
            *out += b;
        }
    }

    /// Allocates the output of [`Linear::run_cpu`].
    pub fn forward(w: &DMatrix<f32>, b: Option<&DVector<f32>>, x: &DMatrix<f32>) -> DMatrix<f32> {
        let mut out = DMatrix::zeros(w.nrows(), x.ncols());
        Self::run_cpu(&mut out, w, b, x);
        out
    }
}
