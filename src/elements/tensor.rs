//! Four-dimensional typed tensors for compute pipelines.

use std::any::Any;
use std::marker::PhantomData;
use std::mem::size_of;

use ash::vk;
use bytemuck::Pod;

use crate::context::{DeviceBuffer, DeviceContext};
use crate::error::GraphError;
use crate::graph::element::{
    BufferBinding, Capabilities, GraphElement, ResolvedInputs,
};

/// A typed tensor with exactly four positive dimensions.
///
/// Owns one shared dimension buffer (the four extents as `u32`, the same
/// for every path) and one data buffer per path holding the product of
/// the dimensions in elements of `T`. Kernels bind the dimension buffer
/// to interpret the flat data.
pub struct TensorElement<T: Pod> {
    name: String,
    dims: [u32; 4],
    len: u64,
    dim_buffer: Option<DeviceBuffer>,
    data: Vec<DeviceBuffer>,
    initialized: bool,
    _marker: PhantomData<T>,
}

impl<T: Pod> TensorElement<T> {
    /// Build a tensor; `dims` must hold exactly four positive extents.
    pub fn new(name: impl Into<String>, dims: &[u32]) -> Result<Self, GraphError> {
        let name = name.into();
        if dims.len() != 4 {
            return Err(GraphError::InvalidElement {
                element: name,
                reason: format!("expected 4 dimensions, got {}", dims.len()),
            });
        }
        if dims.iter().any(|&d| d == 0) {
            return Err(GraphError::InvalidElement {
                element: name,
                reason: format!("dimensions must be positive, got {dims:?}"),
            });
        }
        let len = dims.iter().map(|&d| d as u64).product();
        Ok(Self {
            name,
            dims: [dims[0], dims[1], dims[2], dims[3]],
            len,
            dim_buffer: None,
            data: Vec::new(),
            initialized: false,
            _marker: PhantomData,
        })
    }

    pub fn dims(&self) -> [u32; 4] {
        self.dims
    }

    /// Total element count, the product of the four dimensions.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn byte_size(&self) -> vk::DeviceSize {
        self.len * size_of::<T>() as u64
    }

    fn path_buffer(&self, path: u32) -> Result<&DeviceBuffer, GraphError> {
        if !self.initialized {
            return Err(GraphError::NotInitialized {
                element: self.name.clone(),
            });
        }
        self.data
            .get(path as usize)
            .ok_or(GraphError::PathOutOfRange {
                path,
                paths: self.data.len() as u32,
            })
    }

    /// Host upload into `path`'s data buffer. `data` must hold exactly
    /// `len()` elements.
    pub fn upload(&self, ctx: &DeviceContext, path: u32, data: &[T]) -> Result<(), GraphError> {
        if data.len() as u64 != self.len {
            return Err(GraphError::InvalidUsage {
                element: self.name.clone(),
                reason: format!("upload of {} elements, tensor holds {}", data.len(), self.len),
            });
        }
        self.path_buffer(path)?
            .write_bytes(ctx, bytemuck::cast_slice(data))
    }

    /// Host download of `path`'s entire data buffer.
    pub fn download(&self, ctx: &DeviceContext, path: u32) -> Result<Vec<T>, GraphError> {
        let bytes = self
            .path_buffer(path)?
            .read_bytes(ctx, self.byte_size() as usize)?;
        Ok(bytemuck::cast_slice(&bytes).to_vec())
    }

    /// The shared dimension buffer (four `u32` extents).
    pub fn dimension_buffer(&self) -> Result<BufferBinding, GraphError> {
        let buffer = self.dim_buffer.as_ref().ok_or(GraphError::NotInitialized {
            element: self.name.clone(),
        })?;
        Ok(BufferBinding {
            buffer: buffer.buffer(),
            size: buffer.size(),
        })
    }
}

impl<T: Pod> GraphElement for TensorElement<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::STORAGE_BUFFER
    }

    fn setup(
        &mut self,
        ctx: &DeviceContext,
        number_paths: u32,
        _inputs: &ResolvedInputs,
    ) -> Result<(), GraphError> {
        if self.initialized {
            return Err(GraphError::AlreadyInitialized {
                element: self.name.clone(),
            });
        }
        let dim_buffer =
            DeviceBuffer::host_storage(ctx, (size_of::<u32>() * 4) as vk::DeviceSize)?;
        dim_buffer.write_bytes(ctx, bytemuck::cast_slice(&self.dims))?;
        self.dim_buffer = Some(dim_buffer);

        for _ in 0..number_paths {
            self.data
                .push(DeviceBuffer::host_storage(ctx, self.byte_size())?);
        }
        self.initialized = true;
        Ok(())
    }

    fn record(
        &self,
        _ctx: &DeviceContext,
        _cmd: vk::CommandBuffer,
        path: u32,
        _inputs: &ResolvedInputs,
    ) -> Result<(), GraphError> {
        self.path_buffer(path)?;
        Ok(())
    }

    fn storage_buffer(&self, path: u32) -> Result<BufferBinding, GraphError> {
        let buffer = self.path_buffer(path)?;
        Ok(BufferBinding {
            buffer: buffer.buffer(),
            size: buffer.size(),
        })
    }

    fn destroy(&mut self, ctx: &DeviceContext) {
        if let Some(buffer) = &mut self.dim_buffer {
            buffer.destroy(ctx);
        }
        self.dim_buffer = None;
        for buffer in &mut self.data {
            buffer.destroy(ctx);
        }
        self.data.clear();
        self.initialized = false;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
