//! Element-wise compute transformation over storage buffers.

use std::any::Any;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::mem::size_of;

use ash::vk;
use bytemuck::Pod;

use crate::context::{DeviceBuffer, DeviceContext};
use crate::error::GraphError;
use crate::graph::element::{
    BufferBinding, Capabilities, GraphElement, ResolvedInputs,
};
use crate::shader::{create_shader_module, ShaderSource};

const INPUT_SLOT: u32 = 0;

/// A compute dispatch mapping an input storage buffer of `A` to an owned
/// per-path output buffer of `R`.
///
/// - `U` is an optional uniform parameter block, written once at setup;
///   use `()` for none.
/// - `P` is an optional push-constant payload; with a non-void `P` the
///   recorded commands dispatch once per configured value, with a
///   shader-write to shader-read barrier between iterations.
///
/// Additional storage inputs can be declared as scratch slots, optionally
/// zero-filled before every dispatch. The dispatch size defaults to
/// `ceil(input_len / local_size)`, can be overridden explicitly, or can be
/// read from an indirect-arguments buffer wired to a dedicated slot.
pub struct BufferTransformation<A: Pod, R: Pod, U: Pod = (), P: Pod = ()> {
    name: String,
    shader: ShaderSource,
    local_size: u32,
    dispatch_override: Option<[u32; 3]>,
    output_len: Option<u64>,
    uniform_value: U,
    push_values: Vec<P>,
    /// slot -> zero before every dispatch
    scratch_slots: BTreeMap<u32, bool>,
    indirect_slot: Option<u32>,

    outputs: Vec<DeviceBuffer>,
    uniforms: Vec<DeviceBuffer>,
    desc_layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    sets: Vec<vk::DescriptorSet>,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    module: vk::ShaderModule,
    groups: [u32; 3],
    initialized: bool,
    _marker: PhantomData<(A, R)>,
}

impl<A: Pod, R: Pod, U: Pod, P: Pod> BufferTransformation<A, R, U, P> {
    pub fn new(name: impl Into<String>, shader: ShaderSource) -> Self {
        Self {
            name: name.into(),
            shader,
            local_size: 64,
            dispatch_override: None,
            output_len: None,
            uniform_value: U::zeroed(),
            push_values: Vec::new(),
            scratch_slots: BTreeMap::new(),
            indirect_slot: None,
            outputs: Vec::new(),
            uniforms: Vec::new(),
            desc_layout: vk::DescriptorSetLayout::null(),
            pool: vk::DescriptorPool::null(),
            sets: Vec::new(),
            pipeline_layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            module: vk::ShaderModule::null(),
            groups: [1, 1, 1],
            initialized: false,
            _marker: PhantomData,
        }
    }

    /// Workgroup size the kernel was compiled with; the default dispatch
    /// covers the input with `ceil(len / local_size)` groups.
    pub fn with_local_size(mut self, local_size: u32) -> Self {
        self.local_size = local_size.max(1);
        self
    }

    /// Override the dispatch size entirely.
    pub fn with_dispatch(mut self, groups: [u32; 3]) -> Self {
        self.dispatch_override = Some(groups);
        self
    }

    /// Output length in elements of `R`; defaults to the input length.
    pub fn with_output_len(mut self, len: u64) -> Self {
        self.output_len = Some(len);
        self
    }

    /// Uniform block contents, uploaded once at setup.
    pub fn with_uniform(mut self, value: U) -> Self {
        self.uniform_value = value;
        self
    }

    /// Push-constant values; the kernel runs once per value.
    pub fn set_push_constants(&mut self, values: Vec<P>) {
        self.push_values = values;
    }

    /// Declare an extra storage input at `slot` (2 or above). With `zero`
    /// set, the buffer is cleared before every dispatch.
    pub fn declare_scratch(mut self, slot: u32, zero: bool) -> Self {
        self.scratch_slots.insert(slot, zero);
        self
    }

    /// Read dispatch arguments from the buffer wired to `slot` instead of
    /// computing them on the host.
    pub fn with_indirect_dispatch(mut self, slot: u32) -> Self {
        self.indirect_slot = Some(slot);
        self
    }

    /// Host read of `path`'s output buffer.
    pub fn read_output(&self, ctx: &DeviceContext, path: u32) -> Result<Vec<R>, GraphError> {
        self.guard_initialized()?;
        let buffer = self
            .outputs
            .get(path as usize)
            .ok_or(GraphError::PathOutOfRange {
                path,
                paths: self.outputs.len() as u32,
            })?;
        let bytes = buffer.read_bytes(ctx, buffer.size() as usize)?;
        Ok(bytemuck::cast_slice(&bytes).to_vec())
    }

    fn guard_initialized(&self) -> Result<(), GraphError> {
        if self.initialized {
            Ok(())
        } else {
            Err(GraphError::NotInitialized {
                element: self.name.clone(),
            })
        }
    }

    fn input_binding(
        &self,
        inputs: &ResolvedInputs,
        slot: u32,
        path: u32,
    ) -> Result<BufferBinding, GraphError> {
        inputs
            .get(slot)
            .ok_or(GraphError::MissingInput {
                element: self.name.clone(),
                slot,
            })?
            .storage_buffer(path)
    }

    fn zero_scratch(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        zeroed: &[BufferBinding],
    ) {
        if zeroed.is_empty() {
            return;
        }
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE);
        unsafe {
            for binding in zeroed {
                device.cmd_fill_buffer(cmd, binding.buffer, 0, vk::WHOLE_SIZE, 0);
            }
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

    fn dispatch_once(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        indirect: Option<BufferBinding>,
    ) {
        unsafe {
            match indirect {
                Some(binding) => device.cmd_dispatch_indirect(cmd, binding.buffer, 0),
                None => device.cmd_dispatch(cmd, self.groups[0], self.groups[1], self.groups[2]),
            }
        }
    }
}

impl<A: Pod, R: Pod, U: Pod, P: Pod> GraphElement for BufferTransformation<A, R, U, P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::STORAGE_BUFFER
    }

    fn check_input(&self, slot: u32, candidate: &dyn GraphElement) -> Result<(), GraphError> {
        let known = slot == INPUT_SLOT
            || self.scratch_slots.contains_key(&slot)
            || self.indirect_slot == Some(slot);
        if !known {
            return Err(GraphError::SlotOutOfRange {
                element: self.name.clone(),
                slot,
            });
        }
        if !candidate
            .capabilities()
            .contains(Capabilities::STORAGE_BUFFER)
        {
            return Err(GraphError::TypeMismatch {
                element: self.name.clone(),
                slot,
                candidate: candidate.name().to_string(),
                reason: "storage buffer capability required",
            });
        }
        Ok(())
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
        let device = ctx.device();

        // Inputs are set up before us, so sizing off path 0 is valid for
        // every path.
        let input = self.input_binding(inputs, INPUT_SLOT, 0)?;
        let input_len = input.size / size_of::<A>().max(1) as u64;
        if input_len == 0 {
            return Err(GraphError::InvalidElement {
                element: self.name.clone(),
                reason: "input resolves to zero elements".to_string(),
            });
        }

        for &slot in self.scratch_slots.keys() {
            if inputs.get(slot).is_none() {
                return Err(GraphError::MissingInput {
                    element: self.name.clone(),
                    slot,
                });
            }
        }
        if let Some(slot) = self.indirect_slot {
            if inputs.get(slot).is_none() {
                return Err(GraphError::MissingInput {
                    element: self.name.clone(),
                    slot,
                });
            }
        }

        let output_len = self.output_len.unwrap_or(input_len);
        let output_size = output_len * size_of::<R>() as u64;
        if output_size == 0 {
            return Err(GraphError::InvalidElement {
                element: self.name.clone(),
                reason: "output resolves to zero bytes".to_string(),
            });
        }
        for _ in 0..number_paths {
            self.outputs.push(DeviceBuffer::host_storage(ctx, output_size)?);
        }

        let uniform_size = size_of::<U>() as vk::DeviceSize;
        if uniform_size > 0 {
            let bytes = bytemuck::bytes_of(&self.uniform_value).to_vec();
            for _ in 0..number_paths {
                let buffer = DeviceBuffer::new(
                    ctx,
                    uniform_size,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                    vk::MemoryPropertyFlags::HOST_VISIBLE
                        | vk::MemoryPropertyFlags::HOST_COHERENT,
                )?;
                buffer.write_bytes(ctx, &bytes)?;
                self.uniforms.push(buffer);
            }
        }

        // Shader bindings: 0 input, 1 output, then scratch slots in
        // ascending slot order, then the uniform block last.
        let scratch_order: Vec<u32> = self.scratch_slots.keys().copied().collect();
        let storage_bindings = 2 + scratch_order.len() as u32;
        let mut bindings = Vec::new();
        for i in 0..storage_bindings {
            bindings.push(
                vk::DescriptorSetLayoutBinding::default()
                    .binding(i)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE),
            );
        }
        if uniform_size > 0 {
            bindings.push(
                vk::DescriptorSetLayoutBinding::default()
                    .binding(storage_bindings)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE),
            );
        }
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        self.desc_layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }
            .map_err(|e| GraphError::device("vkCreateDescriptorSetLayout", e))?;

        let mut pool_sizes = vec![vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(storage_bindings * number_paths)];
        if uniform_size > 0 {
            pool_sizes.push(
                vk::DescriptorPoolSize::default()
                    .ty(vk::DescriptorType::UNIFORM_BUFFER)
                    .descriptor_count(number_paths),
            );
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
            let mut infos: Vec<[vk::DescriptorBufferInfo; 1]> = Vec::new();
            let input = self.input_binding(inputs, INPUT_SLOT, path)?;
            infos.push([vk::DescriptorBufferInfo::default()
                .buffer(input.buffer)
                .offset(0)
                .range(input.size)]);
            let output = &self.outputs[path as usize];
            infos.push([vk::DescriptorBufferInfo::default()
                .buffer(output.buffer())
                .offset(0)
                .range(output.size())]);
            for &slot in &scratch_order {
                let scratch = self.input_binding(inputs, slot, path)?;
                infos.push([vk::DescriptorBufferInfo::default()
                    .buffer(scratch.buffer)
                    .offset(0)
                    .range(scratch.size)]);
            }
            if uniform_size > 0 {
                let uniform = &self.uniforms[path as usize];
                infos.push([vk::DescriptorBufferInfo::default()
                    .buffer(uniform.buffer())
                    .offset(0)
                    .range(uniform.size())]);
            }

            let set = self.sets[path as usize];
            let writes: Vec<vk::WriteDescriptorSet> = infos
                .iter()
                .enumerate()
                .map(|(binding, info)| {
                    let ty = if uniform_size > 0 && binding as u32 == storage_bindings {
                        vk::DescriptorType::UNIFORM_BUFFER
                    } else {
                        vk::DescriptorType::STORAGE_BUFFER
                    };
                    vk::WriteDescriptorSet::default()
                        .dst_set(set)
                        .dst_binding(binding as u32)
                        .descriptor_type(ty)
                        .buffer_info(info)
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

        self.groups = self.dispatch_override.unwrap_or_else(|| {
            let groups = input_len.div_ceil(self.local_size as u64) as u32;
            [groups.max(1), 1, 1]
        });

        self.initialized = true;
        log::debug!(
            "transformation '{}' ready: {input_len} -> {output_len} elements, groups {:?}",
            self.name,
            self.groups
        );
        Ok(())
    }

    fn record(
        &self,
        ctx: &DeviceContext,
        cmd: vk::CommandBuffer,
        path: u32,
        inputs: &ResolvedInputs,
    ) -> Result<(), GraphError> {
        self.guard_initialized()?;
        let device = ctx.device();

        let set = *self
            .sets
            .get(path as usize)
            .ok_or(GraphError::PathOutOfRange {
                path,
                paths: self.sets.len() as u32,
            })?;

        let mut zeroed = Vec::new();
        for (&slot, &zero) in &self.scratch_slots {
            if zero {
                zeroed.push(self.input_binding(inputs, slot, path)?);
            }
        }
        let indirect = match self.indirect_slot {
            Some(slot) => Some(self.input_binding(inputs, slot, path)?),
            None => None,
        };

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
                self.zero_scratch(device, cmd, &zeroed);
                unsafe {
                    device.cmd_push_constants(
                        cmd,
                        self.pipeline_layout,
                        vk::ShaderStageFlags::COMPUTE,
                        0,
                        bytemuck::bytes_of(value),
                    );
                }
                self.dispatch_once(device, cmd, indirect);
                if i + 1 < passes {
                    // Later passes read what earlier passes wrote.
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
            self.zero_scratch(device, cmd, &zeroed);
            self.dispatch_once(device, cmd, indirect);
        }
        Ok(())
    }

    fn storage_buffer(&self, path: u32) -> Result<BufferBinding, GraphError> {
        self.guard_initialized()?;
        let buffer = self
            .outputs
            .get(path as usize)
            .ok_or(GraphError::PathOutOfRange {
                path,
                paths: self.outputs.len() as u32,
            })?;
        Ok(BufferBinding {
            buffer: buffer.buffer(),
            size: buffer.size(),
        })
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
        for buffer in &mut self.outputs {
            buffer.destroy(ctx);
        }
        self.outputs.clear();
        for buffer in &mut self.uniforms {
            buffer.destroy(ctx);
        }
        self.uniforms.clear();
        self.initialized = false;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
