//! Non-owning adapter for externally created images (swapchain style).

use std::any::Any;

use ash::vk;

use crate::context::DeviceContext;
use crate::error::GraphError;
use crate::graph::element::{Capabilities, GraphElement, ImageBinding, ResolvedInputs};

/// One externally owned image slot.
#[derive(Debug, Clone, Copy)]
pub struct SourceImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
}

/// Exposes externally owned images (one per path) to the graph without
/// taking ownership. Records nothing; exists so consumers can bind the
/// image and so the executor can wait on an external acquire semaphore.
pub struct ImageViewSrc {
    name: String,
    images: Vec<SourceImage>,
    waits: Vec<Option<vk::Semaphore>>,
    initialized: bool,
}

impl ImageViewSrc {
    /// Wrap `images`; at least one per path is required at setup.
    pub fn new(name: impl Into<String>, images: Vec<SourceImage>) -> Self {
        let waits = vec![None; images.len()];
        Self {
            name: name.into(),
            images,
            waits,
            initialized: false,
        }
    }

    /// Make `path`'s submission wait on an externally signalled semaphore
    /// (e.g. swapchain image acquisition) before any consumer runs.
    pub fn set_wait_for(&mut self, path: u32, semaphore: vk::Semaphore) -> Result<(), GraphError> {
        let paths = self.waits.len() as u32;
        match self.waits.get_mut(path as usize) {
            Some(slot) => {
                *slot = Some(semaphore);
                Ok(())
            }
            None => Err(GraphError::PathOutOfRange { path, paths }),
        }
    }

    pub fn clear_wait_for(&mut self, path: u32) {
        if let Some(slot) = self.waits.get_mut(path as usize) {
            *slot = None;
        }
    }
}

impl GraphElement for ImageViewSrc {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::IMAGE_VIEW
    }

    fn setup(
        &mut self,
        _ctx: &DeviceContext,
        number_paths: u32,
        _inputs: &ResolvedInputs,
    ) -> Result<(), GraphError> {
        if self.initialized {
            return Err(GraphError::AlreadyInitialized {
                element: self.name.clone(),
            });
        }
        if (self.images.len() as u32) < number_paths {
            return Err(GraphError::InvalidElement {
                element: self.name.clone(),
                reason: format!(
                    "{} images provided for {} paths",
                    self.images.len(),
                    number_paths
                ),
            });
        }
        self.initialized = true;
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

    fn wait_semaphore(&self, path: u32) -> Option<vk::Semaphore> {
        self.waits.get(path as usize).copied().flatten()
    }

    fn image_view(&self, path: u32) -> Result<ImageBinding, GraphError> {
        if !self.initialized {
            return Err(GraphError::NotInitialized {
                element: self.name.clone(),
            });
        }
        let source = self
            .images
            .get(path as usize)
            .ok_or(GraphError::PathOutOfRange {
                path,
                paths: self.images.len() as u32,
            })?;
        Ok(ImageBinding {
            image: source.image,
            view: source.view,
            extent: source.extent,
            format: source.format,
        })
    }

    // Images are externally owned; nothing to release.
    fn destroy(&mut self, _ctx: &DeviceContext) {
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
    use ash::vk::Handle;

    use super::*;

    #[test]
    fn test_wait_semaphore_per_path() {
        let images = vec![
            SourceImage {
                image: vk::Image::null(),
                view: vk::ImageView::null(),
                extent: vk::Extent2D {
                    width: 4,
                    height: 4,
                },
                format: vk::Format::R8G8B8A8_UNORM,
            };
            2
        ];
        let mut src = ImageViewSrc::new("swapchain", images);
        assert!(src.wait_semaphore(0).is_none());

        let sem = vk::Semaphore::from_raw(42);
        src.set_wait_for(1, sem).unwrap();
        assert!(src.wait_semaphore(0).is_none());
        assert_eq!(src.wait_semaphore(1), Some(sem));

        src.clear_wait_for(1);
        assert!(src.wait_semaphore(1).is_none());

        assert!(matches!(
            src.set_wait_for(5, sem),
            Err(GraphError::PathOutOfRange { path: 5, .. })
        ));
    }
}
