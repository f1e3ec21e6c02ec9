//! Shader blobs used by the scenarios.

use std::path::{Path, PathBuf};

use prism::{ShaderBlob, ShaderType};

use crate::{Result, TestError};

/// Directory holding compiled SPIR-V for the hardware backends.
pub const SHADER_DIR_ENV: &str = "PRISM_SHADER_DIR";

const TRIANGLE_VERTEX: &str = "triangle.vert.spv";
const TRIANGLE_PIXEL: &str = "triangle.frag.spv";

/// SPIR-V magic number followed by an empty module header. Enough for
/// backends that never compile shaders.
const PLACEHOLDER_SPIRV: [u8; 20] = [
    0x03, 0x02, 0x23, 0x07, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00,
];

/// Vertex and pixel shaders of the triangle scene.
#[derive(Debug, Clone)]
pub struct ShaderSet {
    pub vertex: ShaderBlob,
    pub pixel: ShaderBlob,
}

impl ShaderSet {
    /// Header-only modules for the software backend.
    pub fn placeholder() -> Self {
        Self {
            vertex: ShaderBlob::new(ShaderType::Vertex, "main", &PLACEHOLDER_SPIRV),
            pixel: ShaderBlob::new(ShaderType::Pixel, "main", &PLACEHOLDER_SPIRV),
        }
    }

    /// Load `triangle.vert.spv` and `triangle.frag.spv` from `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        Ok(Self {
            vertex: ShaderBlob::new(ShaderType::Vertex, "main", &read(&dir.join(TRIANGLE_VERTEX))?),
            pixel: ShaderBlob::new(ShaderType::Pixel, "main", &read(&dir.join(TRIANGLE_PIXEL))?),
        })
    }

    /// Load from the directory named by [`SHADER_DIR_ENV`].
    pub fn from_env() -> Result<Self> {
        let dir = std::env::var_os(SHADER_DIR_ENV)
            .map(PathBuf::from)
            .ok_or_else(|| TestError::MissingShader(PathBuf::from(TRIANGLE_VERTEX)))?;
        Self::load(&dir)
    }

    pub fn blobs(&self) -> Vec<ShaderBlob> {
        vec![self.vertex.clone(), self.pixel.clone()]
    }
}

fn read(path: &Path) -> Result<Vec<u8>> {
    if !path.exists() {
        return Err(TestError::MissingShader(path.to_path_buf()));
    }
    let bytes = std::fs::read(path)?;
    tracing::debug!(path = %path.display(), bytes = bytes.len(), "Loaded shader");
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_starts_with_the_spirv_magic() {
        let shaders = ShaderSet::placeholder();
        let magic = u32::from_le_bytes([
            shaders.vertex.bytecode[0],
            shaders.vertex.bytecode[1],
            shaders.vertex.bytecode[2],
            shaders.vertex.bytecode[3],
        ]);
        assert_eq!(magic, 0x0723_0203);
        assert_eq!(shaders.blobs().len(), 2);
    }

    #[test]
    fn missing_directory_names_the_file() {
        let error = ShaderSet::load(Path::new("/nonexistent/prism-shaders")).unwrap_err();
        assert!(matches!(error, TestError::MissingShader(path) if path.ends_with(TRIANGLE_VERTEX)));
    }
}
