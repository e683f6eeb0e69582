//! GPT-2 inference on the CPU.

pub use self::config::{Gpt2ModelType, Gpt2Params};
pub use self::pretrained::{SafeTensorsFile, WeightSource};
pub use self::transformer::{Gpt2, Gpt2State};
pub use self::weights::{Gpt2LayerWeights, Gpt2Weights, TensorLayout};

mod config;
pub mod pretrained;
mod transformer;
mod weights;
