pub mod gpt2;
pub mod sampler;
