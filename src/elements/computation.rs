//! Generalized compute dispatch over heterogeneous inputs.

use std::any::Any;
use std::marker::PhantomData;
use std::mem::size_of;

use ash::vk;
use bytemuck::Pod;

use crate::context::DeviceContext;
use crate::error::GraphError;
use crate::graph::element::{
    Capabilities, GraphElement, ImageBinding, ResolvedInputs,
};
use crate::shader::{create_shader_module, ShaderSource};

/// A compute dispatch binding whatever inputs are wired to it, in slot
/// order, at consecutive shader bindings starting from 0.
///
/// Descriptor types are inferred from each input's capabilities, probing
/// image view, then storage buffer, then uniform buffer. Image inputs get
/// an undefined-to-general layout transition before the dispatch. `P` is
/// an optional push-constant payload with the same once-per-value
/// iteration as `BufferTransformation`.
pub struct GeneralComputation<P: Pod = ()> {
    name: String,
    shader: ShaderSource,
    dispatch: [u32; 3],
    push_values: Vec<P>,

    desc_layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    sets: Vec<vk::DescriptorSet>,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    module: vk::ShaderModule,
    /// Slots whose inputs bound as storage images, for layout barriers.
    image_slots: Vec<u32>,
    initialized: bool,
    _marker: PhantomData<P>,
}

const BINDABLE: Capabilities = Capabilities::IMAGE_VIEW
    .union(Capabilities::STORAGE_BUFFER)
    .union(Capabilities::UNIFORM_BUFFER);

impl<P: Pod> GeneralComputation<P> {
    pub fn new(name: impl Into<String>, shader: ShaderSource) -> Self {
        Self {
            name: name.into(),
            shader,
            dispatch: [1, 1, 1],
            push_values: Vec::new(),
            desc_layout: vk::DescriptorSetLayout::null(),
            pool: vk::DescriptorPool::null(),
            sets: Vec::new(),
            pipeline_layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            module: vk::ShaderModule::null(),
            image_slots: Vec::new(),
            initialized: false,
            _marker: PhantomData,
        }
    }

    pub fn with_dispatch(mut self, groups: [u32; 3]) -> Self {
        self.dispatch = groups;
        self
    }

    pub fn set_push_constants(&mut self, values: Vec<P>) {
        self.push_values = values;
    }

    fn image_barrier(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        binding: &ImageBinding,
    ) {
        let barrier = vk::ImageMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::GENERAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(binding.image)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            );
        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }
}

fn infer_descriptor_type(caps: Capabilities) -> Option<vk::DescriptorType> {
    if caps.contains(Capabilities::IMAGE_VIEW) {
        Some(vk::DescriptorType::STORAGE_IMAGE)
    } else if caps.contains(Capabilities::STORAGE_BUFFER) {
        Some(vk::DescriptorType::STORAGE_BUFFER)
    } else if caps.contains(Capabilities::UNIFORM_BUFFER) {
        Some(vk::DescriptorType::UNIFORM_BUFFER)
    } else {
        None
    }
}

impl<P: Pod> GraphElement for GeneralComputation<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn check_input(&self, slot: u32, candidate: &dyn GraphElement) -> Result<(), GraphError> {
        if candidate.capabilities().intersects(BINDABLE) {
            Ok(())
        } else {
            Err(GraphError::TypeMismatch {
                element: self.name.clone(),
                slot,
                candidate: candidate.name().to_string(),
                reason: "no bindable capability (image, storage or uniform)",
            })
        }
    }

    fn setup(
        &mut self,
        ctx: &DeviceContext,
        number_paths: u32,
        inputs: &ResolvedInputs,
    ) -> Result<(), GraphError> {
        if self.initialized {
            return Err(GraphError::AlreadyInitialized {
                element: self.name.clone(),
            });
        }
        if inputs.is_empty() {
            return Err(GraphError::MissingInput {
                element: self.name.clone(),
                slot: 0,
            });
        }
        let device = ctx.device();

        // Inputs in slot order map to bindings 0..n-1.
        let mut slot_types: Vec<(u32, vk::DescriptorType)> = Vec::new();
        for (slot, element) in inputs.iter() {
            let ty = infer_descriptor_type(element.capabilities()).ok_or_else(|| {
                GraphError::InvalidElement {
                    element: self.name.clone(),
                    reason: format!("input '{}' matches no bindable capability", element.name()),
                }
            })?;
            if ty == vk::DescriptorType::STORAGE_IMAGE {
                self.image_slots.push(slot);
            }
            slot_types.push((slot, ty));
        }

        let bindings: Vec<vk::DescriptorSetLayoutBinding> = slot_types
            .iter()
            .enumerate()
            .map(|(i, &(_, ty))| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(i as u32)
                    .descriptor_type(ty)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
            })
            .collect();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        self.desc_layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }
            .map_err(|e| GraphError::device("vkCreateDescriptorSetLayout", e))?;

        let mut pool_sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for ty in [
            vk::DescriptorType::STORAGE_IMAGE,
            vk::DescriptorType::STORAGE_BUFFER,
            vk::DescriptorType::UNIFORM_BUFFER,
        ] {
            let count = slot_types.iter().filter(|&&(_, t)| t == ty).count() as u32;
            if count > 0 {
                pool_sizes.push(
                    vk::DescriptorPoolSize::default()
                        .ty(ty)
                        .descriptor_count(count * number_paths),
                );
            }
        }
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(&pool_sizes)
            .max_sets(number_paths);
        self.pool = unsafe { device.create_descriptor_pool(&pool_info, None) }
            .map_err(|e| GraphError::device("vkCreateDescriptorPool", e))?;

        let layouts = vec![self.desc_layout; number_paths as usize];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);
        self.sets = unsafe { device.allocate_descriptor_sets(&alloc_info) }
            .map_err(|e| GraphError::device("vkAllocateDescriptorSets", e))?;

        for path in 0..number_paths {
            let set = self.sets[path as usize];
            let mut buffer_infos: Vec<[vk::DescriptorBufferInfo; 1]> = Vec::new();
            let mut image_infos: Vec<[vk::DescriptorImageInfo; 1]> = Vec::new();
            // (binding, type, index into the matching info vec)
            let mut refs: Vec<(u32, vk::DescriptorType, usize)> = Vec::new();

            for (i, &(slot, ty)) in slot_types.iter().enumerate() {
                let element = inputs.get(slot).ok_or(GraphError::MissingInput {
                    element: self.name.clone(),
                    slot,
                })?;
                match ty {
                    vk::DescriptorType::STORAGE_IMAGE => {
                        let image = element.image_view(path)?;
                        image_infos.push([vk::DescriptorImageInfo::default()
                            .image_view(image.view)
                            .image_layout(vk::ImageLayout::GENERAL)]);
                        refs.push((i as u32, ty, image_infos.len() - 1));
                    }
                    vk::DescriptorType::UNIFORM_BUFFER => {
                        let binding = element.uniform_buffer(path)?;
                        buffer_infos.push([vk::DescriptorBufferInfo::default()
                            .buffer(binding.buffer)
                            .offset(0)
                            .range(binding.size)]);
                        refs.push((i as u32, ty, buffer_infos.len() - 1));
                    }
                    _ => {
                        let binding = element.storage_buffer(path)?;
                        buffer_infos.push([vk::DescriptorBufferInfo::default()
                            .buffer(binding.buffer)
                            .offset(0)
                            .range(binding.size)]);
                        refs.push((i as u32, ty, buffer_infos.len() - 1));
                    }
                }
            }

            let writes: Vec<vk::WriteDescriptorSet> = refs
                .iter()
                .map(|&(binding, ty, index)| {
                    let write = vk::WriteDescriptorSet::default()
                        .dst_set(set)
                        .dst_binding(binding)
                        .descriptor_type(ty);
                    if ty == vk::DescriptorType::STORAGE_IMAGE {
                        write.image_info(&image_infos[index])
                    } else {
                        write.buffer_info(&buffer_infos[index])
                    }
                })
                .collect();
            unsafe { device.update_descriptor_sets(&writes, &[]) };
        }

        let set_layouts = [self.desc_layout];
        let push_size = size_of::<P>() as u32;
        let push_ranges = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(push_size)];
        let mut layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        if push_size > 0 {
            layout_info = layout_info.push_constant_ranges(&push_ranges);
        }
        self.pipeline_layout = unsafe { device.create_pipeline_layout(&layout_info, None) }
            .map_err(|e| GraphError::device("vkCreatePipelineLayout", e))?;

        let code = self.shader.load()?;
        self.module = create_shader_module(ctx, &code)?;
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(self.module)
            .name(c"main");
        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(self.pipeline_layout);
        let pipelines = unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_, e)| GraphError::device("vkCreateComputePipelines", e))?;
        self.pipeline = pipelines[0];

        self.initialized = true;
        Ok(())
    }

    fn record(
        &self,
        ctx: &DeviceContext,
        cmd: vk::CommandBuffer,
        path: u32,
        inputs: &ResolvedInputs,
    ) -> Result<(), GraphError> {
        if !self.initialized {
            return Err(GraphError::NotInitialized {
                element: self.name.clone(),
            });
        }
        let device = ctx.device();

        for &slot in &self.image_slots {
            let element = inputs.get(slot).ok_or(GraphError::MissingInput {
                element: self.name.clone(),
                slot,
            })?;
            let image = element.image_view(path)?;
            self.image_barrier(device, cmd, &image);
        }

        let set = *self
            .sets
            .get(path as usize)
            .ok_or(GraphError::PathOutOfRange {
                path,
                paths: self.sets.len() as u32,
            })?;
        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                self.pipeline_layout,
                0,
                &[set],
                &[],
            );
        }

        if size_of::<P>() > 0 {
            if self.push_values.is_empty() {
                return Err(GraphError::MissingPushConstants {
                    element: self.name.clone(),
                });
            }
            let passes = self.push_values.len();
            for (i, value) in self.push_values.iter().enumerate() {
                unsafe {
                    device.cmd_push_constants(
                        cmd,
                        self.pipeline_layout,
                        vk::ShaderStageFlags::COMPUTE,
                        0,
                        bytemuck::bytes_of(value),
                    );
                    device.cmd_dispatch(cmd, self.dispatch[0], self.dispatch[1], self.dispatch[2]);
                }
                if i + 1 < passes {
                    let barrier = vk::MemoryBarrier::default()
                        .src_access_mask(vk::AccessFlags::SHADER_WRITE)
                        .dst_access_mask(
                            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                        );
                    unsafe {
                        device.cmd_pipeline_barrier(
                            cmd,
                            vk::PipelineStageFlags::COMPUTE_SHADER,
                            vk::PipelineStageFlags::COMPUTE_SHADER,
                            vk::DependencyFlags::empty(),
                            &[barrier],
                            &[],
                            &[],
                        );
                    }
                }
            }
        } else {
            unsafe {
                device.cmd_dispatch(cmd, self.dispatch[0], self.dispatch[1], self.dispatch[2]);
            }
        }
        Ok(())
    }

    fn destroy(&mut self, ctx: &DeviceContext) {
        if !self.initialized {
            return;
        }
        let device = ctx.device();
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_shader_module(self.module, None);
            device.destroy_descriptor_pool(self.pool, None);
            device.destroy_descriptor_set_layout(self.desc_layout, None);
        }
        self.pipeline = vk::Pipeline::null();
        self.pipeline_layout = vk::PipelineLayout::null();
        self.module = vk::ShaderModule::null();
        self.pool = vk::DescriptorPool::null();
        self.desc_layout = vk::DescriptorSetLayout::null();
        self.sets.clear();
        self.image_slots.clear();
        self.initialized = false;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
