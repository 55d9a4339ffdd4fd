//! Host-mirrored uniform buffers with per-path copies.

use std::any::Any;
use std::mem::size_of;

use ash::vk;
use bytemuck::Pod;

use crate::context::{DeviceBuffer, DeviceContext};
use crate::error::GraphError;
use crate::graph::element::{
    BufferBinding, Capabilities, GraphElement, ResolvedInputs,
};

/// A typed uniform block with a host mirror and one persistently mapped,
/// host-coherent device buffer per path.
///
/// Mutate [`ubo`](Self::ubo) and call [`update`](Self::update) for a path
/// that is not currently in flight; the copy is a plain memcpy into the
/// mapping. The element owns a descriptor set layout and per-path sets
/// (binding 0) that consumers and draw components can share.
pub struct UniformBufferObject<T: Pod> {
    /// The host-side value `update` copies to the device.
    pub ubo: T,
    name: String,
    buffers: Vec<DeviceBuffer>,
    mapped: Vec<*mut u8>,
    layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    sets: Vec<vk::DescriptorSet>,
    initialized: bool,
}

impl<T: Pod> UniformBufferObject<T> {
    pub fn new(name: impl Into<String>, initial: T) -> Self {
        Self {
            ubo: initial,
            name: name.into(),
            buffers: Vec::new(),
            mapped: Vec::new(),
            layout: vk::DescriptorSetLayout::null(),
            pool: vk::DescriptorPool::null(),
            sets: Vec::new(),
            initialized: false,
        }
    }

    /// Copy the host mirror into `path`'s mapped buffer.
    pub fn update(&self, path: u32) -> Result<(), GraphError> {
        if !self.initialized {
            return Err(GraphError::NotInitialized {
                element: self.name.clone(),
            });
        }
        let ptr = *self
            .mapped
            .get(path as usize)
            .ok_or(GraphError::PathOutOfRange {
                path,
                paths: self.mapped.len() as u32,
            })?;
        let bytes = bytemuck::bytes_of(&self.ubo);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
        }
        Ok(())
    }

    /// Copy the host mirror into every path's buffer.
    pub fn update_all(&self) -> Result<(), GraphError> {
        for path in 0..self.mapped.len() as u32 {
            self.update(path)?;
        }
        Ok(())
    }
}

impl<T: Pod> GraphElement for UniformBufferObject<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::UNIFORM_BUFFER
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
        let size = size_of::<T>() as vk::DeviceSize;
        if size == 0 {
            return Err(GraphError::InvalidElement {
                element: self.name.clone(),
                reason: "uniform payload is zero sized".to_string(),
            });
        }
        let device = ctx.device();

        for _ in 0..number_paths {
            let buffer = DeviceBuffer::new(
                ctx,
                size,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )?;
            let ptr = buffer.map(ctx)?;
            self.buffers.push(buffer);
            self.mapped.push(ptr);
        }

        let binding = vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(
                vk::ShaderStageFlags::COMPUTE
                    | vk::ShaderStageFlags::VERTEX
                    | vk::ShaderStageFlags::FRAGMENT,
            );
        let bindings = [binding];
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        self.layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }
            .map_err(|e| GraphError::device("vkCreateDescriptorSetLayout", e))?;

        let pool_size = vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(number_paths);
        let pool_sizes = [pool_size];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(&pool_sizes)
            .max_sets(number_paths);
        self.pool = unsafe { device.create_descriptor_pool(&pool_info, None) }
            .map_err(|e| GraphError::device("vkCreateDescriptorPool", e))?;

        let layouts = vec![self.layout; number_paths as usize];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);
        self.sets = unsafe { device.allocate_descriptor_sets(&alloc_info) }
            .map_err(|e| GraphError::device("vkAllocateDescriptorSets", e))?;

        let buffer_infos: Vec<[vk::DescriptorBufferInfo; 1]> = self
            .buffers
            .iter()
            .map(|b| {
                [vk::DescriptorBufferInfo::default()
                    .buffer(b.buffer())
                    .offset(0)
                    .range(size)]
            })
            .collect();
        let writes: Vec<vk::WriteDescriptorSet> = self
            .sets
            .iter()
            .zip(&buffer_infos)
            .map(|(&set, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(0)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(info)
            })
            .collect();
        unsafe { device.update_descriptor_sets(&writes, &[]) };

        self.initialized = true;
        self.update_all()?;
        Ok(())
    }

    fn record(
        &self,
        _ctx: &DeviceContext,
        _cmd: vk::CommandBuffer,
        _path: u32,
        _inputs: &ResolvedInputs,
    ) -> Result<(), GraphError> {
        if !self.initialized {
            return Err(GraphError::NotInitialized {
                element: self.name.clone(),
            });
        }
        Ok(())
    }

    fn uniform_buffer(&self, path: u32) -> Result<BufferBinding, GraphError> {
        if !self.initialized {
            return Err(GraphError::NotInitialized {
                element: self.name.clone(),
            });
        }
        let buffer = self
            .buffers
            .get(path as usize)
            .ok_or(GraphError::PathOutOfRange {
                path,
                paths: self.buffers.len() as u32,
            })?;
        Ok(BufferBinding {
            buffer: buffer.buffer(),
            size: buffer.size(),
        })
    }

    fn descriptor_set_layout(&self) -> Option<vk::DescriptorSetLayout> {
        self.initialized.then_some(self.layout)
    }

    fn descriptor_set(&self, path: u32) -> Option<vk::DescriptorSet> {
        if !self.initialized {
            return None;
        }
        self.sets.get(path as usize).copied()
    }

    fn destroy(&mut self, ctx: &DeviceContext) {
        if !self.initialized {
            return;
        }
        let device = ctx.device();
        for buffer in &mut self.buffers {
            buffer.unmap(ctx);
            buffer.destroy(ctx);
        }
        self.buffers.clear();
        self.mapped.clear();
        self.sets.clear();
        unsafe {
            device.destroy_descriptor_pool(self.pool, None);
            device.destroy_descriptor_set_layout(self.layout, None);
        }
        self.pool = vk::DescriptorPool::null();
        self.layout = vk::DescriptorSetLayout::null();
        self.initialized = false;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_before_setup() {
        let ubo = UniformBufferObject::new("camera", 1.0f32);
        let err = ubo.update(0).unwrap_err();
        assert!(matches!(err, GraphError::NotInitialized { .. }));
    }

    #[test]
    fn test_no_descriptor_set_before_setup() {
        let ubo = UniformBufferObject::new("camera", 1.0f32);
        assert!(ubo.descriptor_set_layout().is_none());
        assert!(ubo.descriptor_set(0).is_none());
    }
}
