mod activation;
mod service;

pub use activation::*;
pub use service::*;
