//! Typed storage buffers, duplicated per path or shared across paths.

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

/// A typed storage buffer with one copy per path, so work in flight on one
/// path never observes another path's data.
///
/// With [`zero_on_record`](Self::with_zero_on_record) the element's own
/// command buffer clears the buffer, so every submission starts from
/// zeroed contents.
pub struct BufferElement<T: Pod> {
    name: String,
    len: u64,
    zero_on_record: bool,
    buffers: Vec<DeviceBuffer>,
    initialized: bool,
    _marker: PhantomData<T>,
}

impl<T: Pod> BufferElement<T> {
    /// A buffer holding `len` elements of `T` per path.
    pub fn new(name: impl Into<String>, len: u64) -> Self {
        Self {
            name: name.into(),
            len,
            zero_on_record: false,
            buffers: Vec::new(),
            initialized: false,
            _marker: PhantomData,
        }
    }

    /// Clear the buffer at the start of every submission.
    pub fn with_zero_on_record(mut self) -> Self {
        self.zero_on_record = true;
        self
    }

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
        self.buffers
            .get(path as usize)
            .ok_or(GraphError::PathOutOfRange {
                path,
                paths: self.buffers.len() as u32,
            })
    }

    /// Host write into `path`'s copy. The device must be idle on that
    /// path or the write races the GPU.
    pub fn write(&self, ctx: &DeviceContext, path: u32, data: &[T]) -> Result<(), GraphError> {
        if data.len() as u64 > self.len {
            return Err(GraphError::InvalidUsage {
                element: self.name.clone(),
                reason: format!("write of {} elements exceeds length {}", data.len(), self.len),
            });
        }
        self.path_buffer(path)?
            .write_bytes(ctx, bytemuck::cast_slice(data))
    }

    /// Host read of `path`'s entire copy.
    pub fn read(&self, ctx: &DeviceContext, path: u32) -> Result<Vec<T>, GraphError> {
        let bytes = self
            .path_buffer(path)?
            .read_bytes(ctx, self.byte_size() as usize)?;
        Ok(bytemuck::cast_slice(&bytes).to_vec())
    }
}

impl<T: Pod> GraphElement for BufferElement<T> {
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
        if self.len == 0 || size_of::<T>() == 0 {
            return Err(GraphError::InvalidElement {
                element: self.name.clone(),
                reason: "buffer byte size is zero".to_string(),
            });
        }
        for _ in 0..number_paths {
            self.buffers
                .push(DeviceBuffer::host_storage(ctx, self.byte_size())?);
        }
        self.initialized = true;
        Ok(())
    }

    fn record(
        &self,
        ctx: &DeviceContext,
        cmd: vk::CommandBuffer,
        path: u32,
        _inputs: &ResolvedInputs,
    ) -> Result<(), GraphError> {
        let buffer = self.path_buffer(path)?;
        if self.zero_on_record {
            let device = ctx.device();
            let barrier = vk::MemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE);
            unsafe {
                device.cmd_fill_buffer(cmd, buffer.buffer(), 0, vk::WHOLE_SIZE, 0);
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::COMPUTE_SHADER,
                    vk::DependencyFlags::empty(),
                    &[barrier],
                    &[],
                    &[],
                );
            }
        }
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
        for buffer in &mut self.buffers {
            buffer.destroy(ctx);
        }
        self.buffers.clear();
        self.initialized = false;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A typed storage buffer with a single copy shared by every path.
///
/// Useful for read-only data (lookup tables, constants) where per-path
/// duplication would waste memory. The caller is responsible for not
/// writing it while any path is in flight.
pub struct BufferElementSinglePath<T: Pod> {
    name: String,
    len: u64,
    buffer: Option<DeviceBuffer>,
    number_paths: u32,
    _marker: PhantomData<T>,
}

impl<T: Pod> BufferElementSinglePath<T> {
    pub fn new(name: impl Into<String>, len: u64) -> Self {
        Self {
            name: name.into(),
            len,
            buffer: None,
            number_paths: 0,
            _marker: PhantomData,
        }
    }

    pub fn byte_size(&self) -> vk::DeviceSize {
        self.len * size_of::<T>() as u64
    }

    fn shared_buffer(&self) -> Result<&DeviceBuffer, GraphError> {
        self.buffer.as_ref().ok_or(GraphError::NotInitialized {
            element: self.name.clone(),
        })
    }

    pub fn write(&self, ctx: &DeviceContext, data: &[T]) -> Result<(), GraphError> {
        if data.len() as u64 > self.len {
            return Err(GraphError::InvalidUsage {
                element: self.name.clone(),
                reason: format!("write of {} elements exceeds length {}", data.len(), self.len),
            });
        }
        self.shared_buffer()?
            .write_bytes(ctx, bytemuck::cast_slice(data))
    }

    pub fn read(&self, ctx: &DeviceContext) -> Result<Vec<T>, GraphError> {
        let bytes = self
            .shared_buffer()?
            .read_bytes(ctx, self.byte_size() as usize)?;
        Ok(bytemuck::cast_slice(&bytes).to_vec())
    }
}

impl<T: Pod> GraphElement for BufferElementSinglePath<T> {
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
        if self.buffer.is_some() {
            return Err(GraphError::AlreadyInitialized {
                element: self.name.clone(),
            });
        }
        if self.len == 0 || size_of::<T>() == 0 {
            return Err(GraphError::InvalidElement {
                element: self.name.clone(),
                reason: "buffer byte size is zero".to_string(),
            });
        }
        self.buffer = Some(DeviceBuffer::host_storage(ctx, self.byte_size())?);
        self.number_paths = number_paths;
        Ok(())
    }

    fn record(
        &self,
        _ctx: &DeviceContext,
        _cmd: vk::CommandBuffer,
        path: u32,
        _inputs: &ResolvedInputs,
    ) -> Result<(), GraphError> {
        self.shared_buffer()?;
        if path >= self.number_paths {
            return Err(GraphError::PathOutOfRange {
                path,
                paths: self.number_paths,
            });
        }
        Ok(())
    }

    fn storage_buffer(&self, path: u32) -> Result<BufferBinding, GraphError> {
        let buffer = self.shared_buffer()?;
        if path >= self.number_paths {
            return Err(GraphError::PathOutOfRange {
                path,
                paths: self.number_paths,
            });
        }
        Ok(BufferBinding {
            buffer: buffer.buffer(),
            size: buffer.size(),
        })
    }

    fn destroy(&mut self, ctx: &DeviceContext) {
        if let Some(buffer) = &mut self.buffer {
            buffer.destroy(ctx);
        }
        self.buffer = None;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
