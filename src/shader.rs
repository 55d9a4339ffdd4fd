//! Shader loading and compilation.
//!
//! Compute and draw elements treat shaders as opaque SPIR-V blobs with a
//! `main` entry point. Blobs can come from a precompiled `.spv` file or be
//! produced at runtime from WGSL through naga.

use std::path::{Path, PathBuf};

use ash::vk;

use crate::context::DeviceContext;
use crate::error::GraphError;

/// Shader stage selector for WGSL compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

/// Where a shader blob comes from.
#[derive(Debug, Clone)]
pub enum ShaderSource {
    /// A compiled SPIR-V file on disk.
    Path(PathBuf),
    /// SPIR-V words already in memory.
    Words(Vec<u32>),
}

impl ShaderSource {
    pub fn path(p: impl Into<PathBuf>) -> Self {
        Self::Path(p.into())
    }

    /// Resolve the source to SPIR-V words.
    pub fn load(&self) -> Result<Vec<u32>, GraphError> {
        match self {
            Self::Path(p) => read_spv_file(p),
            Self::Words(w) => Ok(w.clone()),
        }
    }
}

/// Read a `.spv` file into SPIR-V words.
pub fn read_spv_file(path: &Path) -> Result<Vec<u32>, GraphError> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| GraphError::Shader(format!("failed to open {}: {e}", path.display())))?;
    ash::util::read_spv(&mut file)
        .map_err(|e| GraphError::Shader(format!("failed to read {}: {e}", path.display())))
}

/// Create a Vulkan shader module from SPIR-V words.
pub fn create_shader_module(
    ctx: &DeviceContext,
    code: &[u32],
) -> Result<vk::ShaderModule, GraphError> {
    let create_info = vk::ShaderModuleCreateInfo::default().code(code);
    unsafe { ctx.device().create_shader_module(&create_info, None) }
        .map_err(|e| GraphError::device("vkCreateShaderModule", e))
}

/// Compile WGSL source to SPIR-V for the given stage and entry point.
pub fn compile_wgsl(
    source: &str,
    stage: ShaderStage,
    entry_point: &str,
) -> Result<Vec<u32>, GraphError> {
    let module = naga::front::wgsl::parse_str(source)
        .map_err(|e| GraphError::Shader(format!("WGSL parse error: {e}")))?;

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    let info = validator
        .validate(&module)
        .map_err(|e| GraphError::Shader(format!("validation error: {e}")))?;

    let naga_stage = match stage {
        ShaderStage::Vertex => naga::ShaderStage::Vertex,
        ShaderStage::Fragment => naga::ShaderStage::Fragment,
        ShaderStage::Compute => naga::ShaderStage::Compute,
    };

    let _entry_point_index = module
        .entry_points
        .iter()
        .position(|ep| ep.name == entry_point && ep.stage == naga_stage)
        .ok_or_else(|| {
            GraphError::Shader(format!(
                "entry point '{entry_point}' not found for stage {stage:?}"
            ))
        })?;

    let options = naga::back::spv::Options {
        lang_version: (1, 3),
        flags: naga::back::spv::WriterFlags::empty(),
        capabilities: None,
        bounds_check_policies: naga::proc::BoundsCheckPolicies::default(),
        binding_map: Default::default(),
        debug_info: None,
        zero_initialize_workgroup_memory: naga::back::spv::ZeroInitializeWorkgroupMemoryMode::None,
    };

    let pipeline_options = naga::back::spv::PipelineOptions {
        shader_stage: naga_stage,
        entry_point: entry_point.to_string(),
    };

    naga::back::spv::write_vec(&module, &info, &options, Some(&pipeline_options))
        .map_err(|e| GraphError::Shader(format!("SPIR-V generation error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOUBLE_WGSL: &str = r#"
@group(0) @binding(0) var<storage, read> input: array<f32>;
@group(0) @binding(1) var<storage, read_write> output: array<f32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x < arrayLength(&input)) {
        output[id.x] = input[id.x] * 2.0;
    }
}
"#;

    #[test]
    fn test_compile_wgsl_compute() {
        let spv = compile_wgsl(DOUBLE_WGSL, ShaderStage::Compute, "main").unwrap();
        assert!(!spv.is_empty());
        // SPIR-V magic number
        assert_eq!(spv[0], 0x0723_0203);
    }

    #[test]
    fn test_compile_wgsl_missing_entry_point() {
        let err = compile_wgsl(DOUBLE_WGSL, ShaderStage::Compute, "not_main").unwrap_err();
        assert!(matches!(err, GraphError::Shader(_)));
    }

    #[test]
    fn test_compile_wgsl_parse_error() {
        let err = compile_wgsl("fn main( {", ShaderStage::Compute, "main").unwrap_err();
        assert!(matches!(err, GraphError::Shader(_)));
    }
}
