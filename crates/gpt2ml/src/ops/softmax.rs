use nalgebra::{Dyn, StorageMut, Vector};

/// The softmax kernel.
pub struct SoftMax;

impl SoftMax {
    /// The softmax function.
    ///
    /// Converts a set of real number into a probability distribution.
    /// See <https://fr.wikipedia.org/wiki/Fonction_softmax>
    ///
    /// Entries equal to `-inf` (masked out) end up with a probability of zero
    /// as long as at least one entry is finite.
    pub fn run_cpu<S: StorageMut<f32, Dyn>>(vals: &mut Vector<f32, Dyn, S>) {
        // Shift by the max value for numerical stability, so this effectively computes:
        // softmax(z) = e^(z - max) / e^(z - max).sum()
        let max_val = vals.max();
        let mut sum = 0.0;

        vals.apply(|x| {
            *x = (*x - max_val).exp();
            sum += *x;
        });

        *vals /= sum;
    }

    /// In-place `log(softmax(vals))`, computed with the log-sum-exp trick.
    pub fn log_softmax_cpu<S: StorageMut<f32, Dyn>>(vals: &mut Vector<f32, Dyn, S>) {
        let max_val = vals.max();
        let log_sum = vals.iter().map(|x| (*x - max_val).exp()).sum::<f32>().ln() + max_val;
        vals.apply(|x| *x -= log_sum);
    }
}

#[cfg(test)]
mod test {
    use crate::ops::SoftMax;
    use nalgebra::{DMatrix, DVector};

    #[test]
    fn cpu_softmax() {
        let mut v = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        SoftMax::run_cpu(&mut v);

        let denom = 1.0f32.exp() + 2.0f32.exp() + 3.0f32.exp();
        let expected = DVector::from_vec(vec![
            1.0f32.exp() / denom,
            2.0f32.exp() / denom,
            3.0f32.exp() / denom,
        ]);
        approx::assert_relative_eq!(v, expected, epsilon = 1.0e-6);
    }

    #[test]
    fn cpu_softmax_large_values() {
        let mut v = DVector::from_vec(vec![1000.0, 1000.0]);
        SoftMax::run_cpu(&mut v);
        approx::assert_relative_eq!(v, DVector::from_vec(vec![0.5, 0.5]), epsilon = 1.0e-6);
    }

    #[test]
    fn cpu_softmax_masked_column() {
        let mut m = DMatrix::from_column_slice(3, 1, &[0.5, f32::NEG_INFINITY, 0.5]);
        SoftMax::run_cpu(&mut m.column_mut(0));
        assert_eq!(m[(1, 0)], 0.0);
        approx::assert_relative_eq!(m[(0, 0)], 0.5, epsilon = 1.0e-6);
    }

    #[test]
    fn cpu_log_softmax() {
        let v0 = DVector::<f32>::new_random(37);
        let mut probs = v0.clone();
        let mut logs = v0;
        SoftMax::run_cpu(&mut probs);
        SoftMax::log_softmax_cpu(&mut logs);
        approx::assert_relative_eq!(logs.map(f32::exp), probs, epsilon = 1.0e-6);
    }
}
