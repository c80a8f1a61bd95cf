pub mod annotate;
pub mod cancel;
pub mod catalog;
pub mod classifier;
pub mod cli;
pub mod commands;
pub mod config;
pub mod detection;
pub mod elongation;
pub mod error;
pub mod filters;
pub mod geometry;
pub mod imaging;
pub mod mask;
pub mod mtf_stretch;
pub mod native_ops;
pub mod operators;
pub mod plot;
pub mod psf;
pub mod psf_fitting;
pub mod reduction;
pub mod resources;
pub mod session;
pub mod star;
pub mod statistics;
pub mod text_render;
pub mod view;

pub use error::{Result, StarError};
pub use session::Session;

#[cfg(test)]
mod test_pipeline;
