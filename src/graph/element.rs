//! The node contract every graph element implements.

use std::any::Any;
use std::collections::BTreeMap;

use ash::vk;
use bitflags::bitflags;

use crate::context::DeviceContext;
use crate::error::GraphError;
use crate::graph::{NodeHandle, NodeSlot};

bitflags! {
    /// Resource interfaces an element can expose to its consumers.
    ///
    /// Available from construction, before any device resources exist, so
    /// wiring-time checks and descriptor type inference can dispatch on
    /// them instead of on concrete types.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const STORAGE_BUFFER = 1 << 0;
        const IMAGE_VIEW = 1 << 1;
        const UNIFORM_BUFFER = 1 << 2;
    }
}

/// A storage or uniform buffer exposed by a producer for one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBinding {
    pub buffer: vk::Buffer,
    /// Byte size of the bound range.
    pub size: vk::DeviceSize,
}

/// An image and view exposed by a producer for one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBinding {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
}

static EMPTY_SLOTS: BTreeMap<u32, NodeHandle> = BTreeMap::new();

/// Read access to a node's resolved input elements, keyed by slot.
///
/// Handed to `setup` and `record` by the executor after all redirections
/// have been resolved to concrete producers.
pub struct ResolvedInputs<'a> {
    slots: &'a BTreeMap<u32, NodeHandle>,
    nodes: &'a [NodeSlot],
}

impl<'a> ResolvedInputs<'a> {
    pub(crate) fn new(slots: &'a BTreeMap<u32, NodeHandle>, nodes: &'a [NodeSlot]) -> Self {
        Self { slots, nodes }
    }

    /// An input set with no wired slots.
    pub fn empty() -> ResolvedInputs<'static> {
        ResolvedInputs {
            slots: &EMPTY_SLOTS,
            nodes: &[],
        }
    }

    /// The producer element wired (directly or through redirection) to
    /// `slot`, if any.
    pub fn get(&self, slot: u32) -> Option<&'a dyn GraphElement> {
        let handle = self.slots.get(&slot)?;
        self.nodes.get(handle.index())?.element.as_deref()
    }

    /// Iterate wired slots in ascending slot order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &'a dyn GraphElement)> + '_ {
        let nodes = self.nodes;
        self.slots.iter().filter_map(move |(&slot, handle)| {
            nodes
                .get(handle.index())
                .and_then(|n| n.element.as_deref())
                .map(|e| (slot, e))
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// A unit of GPU work or a GPU resource living in the graph arena.
///
/// Lifecycle: construction (host only) → `check_input` during wiring →
/// `setup` exactly once during compilation → `record` once per path into a
/// primary command buffer → steady-state resubmission → `destroy`.
///
/// Binding accessors are only valid after `setup`; capability flags are
/// valid from construction.
pub trait GraphElement: Any {
    /// Human-readable name used in logs and errors.
    fn name(&self) -> &str;

    /// The resource interfaces this element exposes to consumers.
    fn capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }

    /// Validate a producer proposed for `slot` at wiring time.
    ///
    /// The default rejects all inputs; elements that consume inputs
    /// override this with their per-slot capability predicate.
    fn check_input(&self, slot: u32, candidate: &dyn GraphElement) -> Result<(), GraphError> {
        Err(GraphError::TypeMismatch {
            element: self.name().to_string(),
            slot,
            candidate: candidate.name().to_string(),
            reason: "element does not accept inputs",
        })
    }

    /// Allocate device resources sized for `number_paths`. Called exactly
    /// once, in topological order, so every input is already set up.
    fn setup(
        &mut self,
        ctx: &DeviceContext,
        number_paths: u32,
        inputs: &ResolvedInputs,
    ) -> Result<(), GraphError>;

    /// Record this element's commands for `path` into `cmd`. Resources may
    /// be recorded-empty (a no-op body).
    fn record(
        &self,
        ctx: &DeviceContext,
        cmd: vk::CommandBuffer,
        path: u32,
        inputs: &ResolvedInputs,
    ) -> Result<(), GraphError>;

    /// An external semaphore this element's submission must wait on for
    /// `path`, in addition to producer edge semaphores.
    fn wait_semaphore(&self, _path: u32) -> Option<vk::Semaphore> {
        None
    }

    /// Storage-buffer binding for `path`. Valid after `setup` on elements
    /// carrying [`Capabilities::STORAGE_BUFFER`].
    fn storage_buffer(&self, _path: u32) -> Result<BufferBinding, GraphError> {
        Err(GraphError::MissingCapability {
            element: self.name().to_string(),
            capability: "storage buffer",
        })
    }

    /// Image-view binding for `path`. Valid after `setup` on elements
    /// carrying [`Capabilities::IMAGE_VIEW`].
    fn image_view(&self, _path: u32) -> Result<ImageBinding, GraphError> {
        Err(GraphError::MissingCapability {
            element: self.name().to_string(),
            capability: "image view",
        })
    }

    /// Uniform-buffer binding for `path`. Valid after `setup` on elements
    /// carrying [`Capabilities::UNIFORM_BUFFER`].
    fn uniform_buffer(&self, _path: u32) -> Result<BufferBinding, GraphError> {
        Err(GraphError::MissingCapability {
            element: self.name().to_string(),
            capability: "uniform buffer",
        })
    }

    /// Descriptor set layout owned by this element, if it publishes one
    /// (uniform elements do, for sharing with draw components).
    fn descriptor_set_layout(&self) -> Option<vk::DescriptorSetLayout> {
        None
    }

    /// Descriptor set for `path`, if this element publishes one.
    fn descriptor_set(&self, _path: u32) -> Option<vk::DescriptorSet> {
        None
    }

    /// Release all device resources. Must run before the device is
    /// destroyed.
    fn destroy(&mut self, ctx: &DeviceContext);

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}
