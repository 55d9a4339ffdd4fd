//! Render pass element: clears a target image and fans out to draw
//! components.

use std::any::Any;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;

use crate::context::DeviceContext;
use crate::error::GraphError;
use crate::graph::element::{Capabilities, GraphElement, ImageBinding, ResolvedInputs};

const TARGET_SLOT: u32 = 0;
const CAMERA_SLOT: u32 = 1;

/// View and projection matrices for the camera uniform.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CameraMatrices {
    pub view: Mat4,
    pub proj: Mat4,
}

impl Default for CameraMatrices {
    fn default() -> Self {
        Self {
            view: Mat4::IDENTITY,
            proj: Mat4::IDENTITY,
        }
    }
}

/// The camera uniform's descriptor interface, shared with every draw
/// component (set 0 in their pipeline layouts).
#[derive(Clone)]
pub struct CameraBinding {
    pub layout: vk::DescriptorSetLayout,
    pub sets: Vec<vk::DescriptorSet>,
}

/// A draw call provider living inside a [`RenderPassElement`].
///
/// `initialize` runs during the element's setup, after the render pass
/// and camera binding exist; `record` runs inside the active render pass.
pub trait DrawComponent: 'static {
    fn initialize(
        &mut self,
        ctx: &DeviceContext,
        render_pass: vk::RenderPass,
        camera: &CameraBinding,
    ) -> Result<(), GraphError>;

    fn record(
        &self,
        ctx: &DeviceContext,
        cmd: vk::CommandBuffer,
        path: u32,
        extent: vk::Extent2D,
        camera: &CameraBinding,
    ) -> Result<(), GraphError>;

    fn destroy(&mut self, ctx: &DeviceContext);
}

/// Renders into an externally provided image (slot 0) through a single
/// subpass, clearing first, then recording every attached draw component
/// in order. Consumes a camera uniform from slot 1, or from any input
/// carrying the uniform capability.
pub struct RenderPassElement {
    name: String,
    clear_color: [f32; 4],
    components: Vec<Box<dyn DrawComponent>>,
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
    extent: vk::Extent2D,
    camera: Option<CameraBinding>,
    initialized: bool,
}

impl RenderPassElement {
    pub fn new(name: impl Into<String>, clear_color: [f32; 4]) -> Self {
        Self {
            name: name.into(),
            clear_color,
            components: Vec::new(),
            render_pass: vk::RenderPass::null(),
            framebuffers: Vec::new(),
            extent: vk::Extent2D::default(),
            camera: None,
            initialized: false,
        }
    }

    pub fn with_component(mut self, component: impl DrawComponent) -> Self {
        self.components.push(Box::new(component));
        self
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    /// Find the camera input: slot 1 if wired, otherwise the first input
    /// with the uniform capability.
    fn find_camera<'a>(
        &self,
        inputs: &ResolvedInputs<'a>,
    ) -> Result<&'a dyn GraphElement, GraphError> {
        if let Some(element) = inputs.get(CAMERA_SLOT) {
            return Ok(element);
        }
        inputs
            .iter()
            .map(|(_, e)| e)
            .find(|e| e.capabilities().contains(Capabilities::UNIFORM_BUFFER))
            .ok_or(GraphError::MissingInput {
                element: self.name.clone(),
                slot: CAMERA_SLOT,
            })
    }

    fn transition_target(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        image: &ImageBinding,
    ) {
        let barrier = vk::ImageMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::GENERAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image.image)
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
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }
}

impl GraphElement for RenderPassElement {
    fn name(&self) -> &str {
        &self.name
    }

    fn check_input(&self, slot: u32, candidate: &dyn GraphElement) -> Result<(), GraphError> {
        match slot {
            TARGET_SLOT => {
                if candidate.capabilities().contains(Capabilities::IMAGE_VIEW) {
                    Ok(())
                } else {
                    Err(GraphError::TypeMismatch {
                        element: self.name.clone(),
                        slot,
                        candidate: candidate.name().to_string(),
                        reason: "image view capability required for the render target",
                    })
                }
            }
            CAMERA_SLOT => {
                if candidate
                    .capabilities()
                    .contains(Capabilities::UNIFORM_BUFFER)
                {
                    Ok(())
                } else {
                    Err(GraphError::TypeMismatch {
                        element: self.name.clone(),
                        slot,
                        candidate: candidate.name().to_string(),
                        reason: "uniform buffer capability required for the camera",
                    })
                }
            }
            _ => Err(GraphError::SlotOutOfRange {
                element: self.name.clone(),
                slot,
            }),
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
        let device = ctx.device();

        let target = inputs.get(TARGET_SLOT).ok_or(GraphError::MissingInput {
            element: self.name.clone(),
            slot: TARGET_SLOT,
        })?;
        let first = target.image_view(0)?;
        self.extent = first.extent;

        let camera_element = self.find_camera(inputs)?;
        let layout = camera_element.descriptor_set_layout().ok_or_else(|| {
            GraphError::InvalidElement {
                element: self.name.clone(),
                reason: format!(
                    "camera input '{}' publishes no descriptor set layout",
                    camera_element.name()
                ),
            }
        })?;
        let mut sets = Vec::with_capacity(number_paths as usize);
        for path in 0..number_paths {
            let set = camera_element
                .descriptor_set(path)
                .ok_or_else(|| GraphError::InvalidElement {
                    element: self.name.clone(),
                    reason: format!(
                        "camera input '{}' publishes no descriptor set for path {path}",
                        camera_element.name()
                    ),
                })?;
            sets.push(set);
        }
        let camera = CameraBinding { layout, sets };

        let attachment = vk::AttachmentDescription::default()
            .format(first.format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::GENERAL)
            .final_layout(vk::ImageLayout::GENERAL);
        let attachments = [attachment];

        let color_ref = vk::AttachmentReference::default()
            .attachment(0)
            .layout(vk::ImageLayout::GENERAL);
        let color_refs = [color_ref];
        let subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        let subpasses = [subpass];

        let render_pass_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses);
        self.render_pass = unsafe { device.create_render_pass(&render_pass_info, None) }
            .map_err(|e| GraphError::device("vkCreateRenderPass", e))?;

        for path in 0..number_paths {
            let binding = target.image_view(path)?;
            let views = [binding.view];
            let framebuffer_info = vk::FramebufferCreateInfo::default()
                .render_pass(self.render_pass)
                .attachments(&views)
                .width(binding.extent.width)
                .height(binding.extent.height)
                .layers(1);
            let framebuffer = unsafe { device.create_framebuffer(&framebuffer_info, None) }
                .map_err(|e| GraphError::device("vkCreateFramebuffer", e))?;
            self.framebuffers.push(framebuffer);
        }

        for component in &mut self.components {
            component.initialize(ctx, self.render_pass, &camera)?;
        }
        self.camera = Some(camera);

        self.initialized = true;
        log::debug!(
            "render pass '{}' ready: {}x{}, {} components",
            self.name,
            self.extent.width,
            self.extent.height,
            self.components.len()
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
        if !self.initialized {
            return Err(GraphError::NotInitialized {
                element: self.name.clone(),
            });
        }
        let device = ctx.device();

        let target = inputs.get(TARGET_SLOT).ok_or(GraphError::MissingInput {
            element: self.name.clone(),
            slot: TARGET_SLOT,
        })?;
        let image = target.image_view(path)?;
        self.transition_target(device, cmd, &image);

        let framebuffer = *self
            .framebuffers
            .get(path as usize)
            .ok_or(GraphError::PathOutOfRange {
                path,
                paths: self.framebuffers.len() as u32,
            })?;

        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.clear_color,
            },
        }];
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(self.render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: image.extent,
            })
            .clear_values(&clear_values);

        unsafe {
            device.cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE);
        }

        let camera = self.camera.as_ref().ok_or(GraphError::NotInitialized {
            element: self.name.clone(),
        })?;
        for component in &self.components {
            component.record(ctx, cmd, path, image.extent, camera)?;
        }

        unsafe {
            device.cmd_end_render_pass(cmd);
        }
        Ok(())
    }

    fn destroy(&mut self, ctx: &DeviceContext) {
        if !self.initialized {
            return;
        }
        for component in &mut self.components {
            component.destroy(ctx);
        }
        let device = ctx.device();
        unsafe {
            for &framebuffer in &self.framebuffers {
                device.destroy_framebuffer(framebuffer, None);
            }
            device.destroy_render_pass(self.render_pass, None);
        }
        self.framebuffers.clear();
        self.render_pass = vk::RenderPass::null();
        self.camera = None;
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
    use crate::elements::ImageViewSrc;
    use crate::elements::UniformBufferObject;
    use crate::graph::testing::StubElement;

    #[test]
    fn test_check_input_slots() {
        let pass = RenderPassElement::new("main pass", [0.0; 4]);
        let image = ImageViewSrc::new("target", Vec::new());
        let camera = UniformBufferObject::new("camera", CameraMatrices::default());
        let buffer = StubElement::new("buffer");

        assert!(pass.check_input(0, &image).is_ok());
        assert!(pass.check_input(1, &camera).is_ok());
        assert!(matches!(
            pass.check_input(0, &camera),
            Err(GraphError::TypeMismatch { .. })
        ));
        assert!(matches!(
            pass.check_input(1, &buffer),
            Err(GraphError::TypeMismatch { .. })
        ));
        assert!(matches!(
            pass.check_input(2, &image),
            Err(GraphError::SlotOutOfRange { slot: 2, .. })
        ));
    }

    #[test]
    fn test_camera_matrices_pod_layout() {
        assert_eq!(std::mem::size_of::<CameraMatrices>(), 128);
        let camera = CameraMatrices::default();
        let bytes = bytemuck::bytes_of(&camera);
        assert_eq!(bytes.len(), 128);
    }
}
