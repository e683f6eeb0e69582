#![allow(clippy::needless_range_loop)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::result_large_err)]

pub mod error;
#[cfg(feature = "hub")]
pub mod hub;
pub mod models;
pub mod ops;
pub mod tensor;

pub use error::Gpt2Error;
