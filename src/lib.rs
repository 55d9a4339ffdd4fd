//! Amaranth - a path-buffered GPU compute/draw graph engine on Vulkan
//!
//! A graph of typed GPU work nodes (buffers, tensors, uniforms, compute
//! dispatches, render passes) is wired by input slots, compiled once into
//! per-path command buffers and semaphores, and then resubmitted at
//! steady state with no further host-side allocation or recording.
//!
//! # Concepts
//! - **Element**: a node implementing [`graph::element::GraphElement`];
//!   owns per-path device resources and records its own commands.
//! - **Path**: one frame-in-flight copy of every per-path resource, so
//!   concurrent submissions never alias each other's data.
//! - **Compilation**: [`graph::executor::GraphExecutor::compile_from`]
//!   orders the reachable nodes topologically, sets them up, allocates
//!   one semaphore per dependency edge per path and records one primary
//!   command buffer per (node, path).
//! - **Steady state**: [`graph::executor::GraphExecutor::submit_to`]
//!   batches every prepared submission for a path into one queue submit.

pub mod context;
pub mod elements;
pub mod error;
pub mod graph;
pub mod shader;

pub use context::{DeviceBuffer, DeviceContext};
pub use elements::{
    BufferElement, BufferElementSinglePath, BufferTransformation, CameraBinding, CameraMatrices,
    DrawComponent, GeneralComputation, ImageViewSrc, RenderPassElement, SourceImage,
    TensorElement, UniformBufferObject,
};
pub use error::{ErrorKind, GraphError};
pub use graph::element::{BufferBinding, Capabilities, GraphElement, ImageBinding, ResolvedInputs};
pub use graph::executor::{ExecutorConfig, GraphExecutor};
pub use graph::{Graph, InputBinding, NodeHandle};
pub use shader::{compile_wgsl, create_shader_module, read_spv_file, ShaderSource, ShaderStage};
