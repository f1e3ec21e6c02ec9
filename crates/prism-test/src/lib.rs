//! Test harness for the Prism render hardware interface.
//!
//! Provides end-to-end scenarios (a presented triangle frame loop and an
//! acceleration-structure build with compaction) that run unchanged on
//! every backend.

pub mod acceleration;
pub mod harness;
pub mod shaders;
pub mod triangle;

pub use acceleration::{build_and_compact, CompactionReport};
pub use harness::{TestBackend, TestContext};
pub use shaders::{ShaderSet, SHADER_DIR_ENV};
pub use triangle::{FrameLoop, TriangleScene, CLEAR_COLOR};

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("RHI error: {0}")]
    Rhi(#[from] prism::RhiError),
    #[error("Shader '{}' not found; point {} at the compiled SPIR-V", .0.display(), SHADER_DIR_ENV)]
    MissingShader(PathBuf),
    #[error("{0} validation error(s) reported")]
    Validation(u64),
    #[error("Unexpected result: {0}")]
    Mismatch(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TestError>;
