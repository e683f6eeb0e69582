use nalgebra::{Dim, Matrix, StorageMut};

/// Element-wise activation functions.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    /// GELU with the tanh approximation used by GPT-2.
    #[default]
    Gelu,
    /// Exact GELU, `x * Φ(x)` computed with `erf`.
    GeluErf,
    /// GELU approximated by `x * sigmoid(1.702 * x)`.
    GeluQuick,
    Relu,
}

impl UnaryOp {
    /// Parses the `activation_function` field of a Hugging Face config.
    pub fn from_hf_name(name: &str) -> Option<Self> {
        match name {
            "gelu_new" | "gelu_pytorch_tanh" => Some(Self::Gelu),
            "gelu" => Some(Self::GeluErf),
            "quick_gelu" => Some(Self::GeluQuick),
            "relu" => Some(Self::Relu),
            _ => None,
        }
    }

    pub fn eval(self, x: f32) -> f32 {
        match self {
            Self::Gelu => {
                // sqrt(2 / pi)
                const SQRT_2_OVER_PI: f32 = 0.797_884_6;
                0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + 0.044715 * x * x * x)).tanh())
            }
            Self::GeluErf => {
                0.5 * x * (1.0 + libm::erff(x * std::f32::consts::FRAC_1_SQRT_2))
            }
            Self::GeluQuick => x / (1.0 + (-1.702 * x).exp()),
            Self::Relu => x.max(0.0),
        }
    }
}

/// Applies a [`UnaryOp`] to every element of a matrix.
pub struct Unary;

impl Unary {
    pub fn run_cpu_inplace<R: Dim, C: Dim, S: StorageMut<f32, R, C>>(
        op: UnaryOp,
        vals: &mut Matrix<f32, R, C, S>,
    ) {
        vals.apply(|x| *x = op.eval(*x));
    }
}
