use nalgebra::{DMatrix, DVector, Dyn, Storage, StorageMut, Vector};

/// The layer normalization kernel.
///
/// Normalizes each vector to zero mean and unit (biased) variance, then applies the
/// learned gain `gamma` and bias `beta`.
pub struct LayerNorm;

impl LayerNorm {
    pub fn run_cpu<SO, SA, SG, SB>(
        out: &mut Vector<f32, Dyn, SO>,
        a: &Vector<f32, Dyn, SA>,
        gamma: &Vector<f32, Dyn, SG>,
        beta: &Vector<f32, Dyn, SB>,
        eps: f32,
    ) where
        SO: StorageMut<f32, Dyn>,
        SA: Storage<f32, Dyn>,
        SG: Storage<f32, Dyn>,
        SB: Storage<f32, Dyn>,
    {
        let len = a.nrows() as f32;
        let mean = a.sum() / len;
        let var = a.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / len;
        let inv_std = 1.0 / (var + eps).sqrt();

        for i in 0..a.nrows() {
            out[i] = (a[i] - mean) * inv_std * gamma[i] + beta[i];
        }
    }

    /// Normalizes every column of `a` independently.
    pub fn run_cpu_columns(
        out: &mut DMatrix<f32>,
        a: &DMatrix<f32>,
        gamma: &DVector<f32>,
        beta: &DVector<f32>,
        eps: f32,
    ) {
        assert_eq!(out.shape(), a.shape(), "LayerNorm: dimension mismatch.");
        for j in 0..a.ncols() {
            Self::run_cpu(&mut out.column_mut(j), &a.column(j), gamma, beta, eps);
        }
    }
}

#[cfg(test)]
mod test {
    use crate::ops::LayerNorm;
    use nalgebra::{DMatrix, DVector};

    #[test]
    fn cpu_layernorm_unit_gain() {
        const LEN: usize = 1757;
        let a = DVector::<f32>::new_random(LEN) * 10.0;
        let gamma = DVector::repeat(LEN, 1.0);
        let beta = DVector::zeros(LEN);
        let mut out = DVector::zeros(LEN);

        LayerNorm::run_cpu(&mut out, &a, &gamma, &beta, 1.0e-5);

        let mean = out.mean();
        let var = out.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / LEN as f32;
        approx::assert_relative_eq!(mean, 0.0, epsilon = 1.0e-4);
        approx::assert_relative_eq!(var, 1.0, epsilon = 1.0e-3);
    }

    #[test]
    fn cpu_layernorm_affine() {
        let a = DVector::from_vec(vec![1.0, 3.0]);
        let gamma = DVector::from_vec(vec![2.0, 0.5]);
        let beta = DVector::from_vec(vec![0.25, -1.0]);
        let mut out = DVector::zeros(2);

        // mean = 2, var = 1: normalized values are -1 and 1.
        LayerNorm::run_cpu(&mut out, &a, &gamma, &beta, 0.0);
        approx::assert_relative_eq!(
            out,
            DVector::from_vec(vec![-1.75, -0.5]),
            epsilon = 1.0e-6
        );
    }

    #[test]
    fn cpu_layernorm_columns_are_independent() {
        let a = DMatrix::<f32>::new_random(64, 5);
        let gamma = DVector::new_random(64);
        let beta = DVector::new_random(64);
        let mut out = DMatrix::zeros(64, 5);
        LayerNorm::run_cpu_columns(&mut out, &a, &gamma, &beta, 1.0e-5);

        for j in 0..5 {
            let mut col = DVector::zeros(64);
            LayerNorm::run_cpu(&mut col, &a.column(j), &gamma, &beta, 1.0e-5);
            approx::assert_relative_eq!(out.column(j).into_owned(), col, epsilon = 1.0e-6);
        }
    }
}
