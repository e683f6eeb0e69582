use thiserror::Error;

/// Errors raised while configuring, loading or running a GPT-2 model.
#[derive(Debug, Error)]
pub enum Gpt2Error {
    #[error("invalid model configuration: {0}")]
    InvalidConfig(String),
    #[error("unknown model type `{0}` (expected gpt2, gpt2-medium, gpt2-large or gpt2-xl)")]
    UnknownModelType(String),
    #[error("the token sequence is empty")]
    EmptySequence,
    #[error("sequence of length {len} exceeds the block size {max}")]
    SequenceTooLong { len: usize, max: usize },
    #[error("token id {token} is out of the vocabulary range (size {n_vocab})")]
    TokenOutOfRange { token: usize, n_vocab: usize },
    #[error("length mismatch: expected {expected}, found {found}")]
    LengthMismatch { expected: usize, found: usize },
    #[error("missing tensors in the weight source: {0:?}")]
    MissingTensors(Vec<String>),
    #[error("unexpected tensors in the weight source: {0:?}")]
    UnexpectedTensors(Vec<String>),
    #[error("unknown parameter `{0}`")]
    UnknownParameter(String),
    #[error("shape mismatch for `{name}`: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("tensor `{name}` has unsupported dtype {dtype}")]
    UnsupportedDtype { name: String, dtype: String },
    #[error(transparent)]
    SafeTensors(#[from] safetensors::SafeTensorError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[cfg(feature = "hub")]
    #[error(transparent)]
    Hub(#[from] hf_hub::api::sync::ApiError),
}
