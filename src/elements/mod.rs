//! Built-in graph elements: GPU resources and work units.

pub mod buffer;
pub mod computation;
pub mod image;
pub mod render_pass;
pub mod tensor;
pub mod transform;
pub mod uniform;

pub use buffer::{BufferElement, BufferElementSinglePath};
pub use computation::GeneralComputation;
pub use image::{ImageViewSrc, SourceImage};
pub use render_pass::{CameraBinding, CameraMatrices, DrawComponent, RenderPassElement};
pub use tensor::TensorElement;
pub use transform::BufferTransformation;
pub use uniform::UniformBufferObject;
