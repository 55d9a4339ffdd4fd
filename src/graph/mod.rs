//! The node arena and wiring API.
//!
//! A [`Graph`] owns every element; nodes refer to each other only through
//! [`NodeHandle`] indices, so there are no reference cycles to break and no
//! back-pointers to clear. Consumer lists are derived during compilation,
//! never stored here.

pub mod compile;
pub mod element;
pub mod executor;

use std::collections::BTreeMap;

use element::{GraphElement, ResolvedInputs};

use crate::error::GraphError;

/// Index of a node in its graph's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeHandle(u32);

impl NodeHandle {
    pub(crate) fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// What an input slot is wired to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputBinding {
    /// The producer itself.
    Direct(NodeHandle),
    /// Whatever feeds the given slot of another node, resolved at
    /// compile time.
    Redirect(NodeHandle, u32),
}

pub(crate) struct NodeSlot {
    /// Taken out temporarily while the node itself is being set up.
    pub(crate) element: Option<Box<dyn GraphElement>>,
    pub(crate) inputs: BTreeMap<u32, InputBinding>,
}

/// An arena of elements plus the slot wiring between them.
#[derive(Default)]
pub struct Graph {
    pub(crate) nodes: Vec<NodeSlot>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move an element into the arena and return its handle.
    pub fn add(&mut self, element: impl GraphElement) -> NodeHandle {
        let handle = NodeHandle::new(self.nodes.len() as u32);
        log::trace!("graph node {}: '{}'", handle.index(), element.name());
        self.nodes.push(NodeSlot {
            element: Some(Box::new(element)),
            inputs: BTreeMap::new(),
        });
        handle
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Borrow a node's element.
    pub fn element(&self, handle: NodeHandle) -> Result<&dyn GraphElement, GraphError> {
        self.nodes
            .get(handle.index())
            .and_then(|n| n.element.as_deref())
            .ok_or(GraphError::UnknownNode)
    }

    /// Typed access to an element added earlier.
    pub fn get<E: GraphElement>(&self, handle: NodeHandle) -> Option<&E> {
        self.nodes
            .get(handle.index())?
            .element
            .as_deref()?
            .as_any()
            .downcast_ref()
    }

    pub fn get_mut<E: GraphElement>(&mut self, handle: NodeHandle) -> Option<&mut E> {
        self.nodes
            .get_mut(handle.index())?
            .element
            .as_deref_mut()?
            .as_any_mut()
            .downcast_mut()
    }

    /// Wire `producer` into `slot` of `consumer`.
    ///
    /// Runs the consumer's `check_input` against the producer immediately;
    /// a rejected pairing never enters the graph.
    pub fn set_input(
        &mut self,
        consumer: NodeHandle,
        slot: u32,
        producer: NodeHandle,
    ) -> Result<(), GraphError> {
        self.check_binding(consumer, slot, producer)?;
        self.nodes[consumer.index()]
            .inputs
            .insert(slot, InputBinding::Direct(producer));
        Ok(())
    }

    /// Wire `slot` of `consumer` to whatever feeds `source_slot` of
    /// `producer` at compile time.
    ///
    /// The redirect target slot must already be wired so the capability
    /// check can run against the effective producer.
    pub fn set_input_redirect(
        &mut self,
        consumer: NodeHandle,
        slot: u32,
        producer: NodeHandle,
        source_slot: u32,
    ) -> Result<(), GraphError> {
        let resolved = self.resolve_binding(InputBinding::Redirect(producer, source_slot))?;
        self.check_binding(consumer, slot, resolved)?;
        self.nodes[consumer.index()]
            .inputs
            .insert(slot, InputBinding::Redirect(producer, source_slot));
        Ok(())
    }

    fn check_binding(
        &self,
        consumer: NodeHandle,
        slot: u32,
        producer: NodeHandle,
    ) -> Result<(), GraphError> {
        let consumer_el = self.element(consumer)?;
        let producer_el = self.element(producer)?;
        consumer_el.check_input(slot, producer_el)
    }

    /// Follow a binding through any redirection chain to the concrete
    /// producer. The walk is bounded by the node count; exceeding the
    /// bound means the redirects loop.
    pub(crate) fn resolve_binding(
        &self,
        binding: InputBinding,
    ) -> Result<NodeHandle, GraphError> {
        let mut current = binding;
        let mut steps = 0usize;
        loop {
            match current {
                InputBinding::Direct(handle) => {
                    if handle.index() >= self.nodes.len() {
                        return Err(GraphError::UnknownNode);
                    }
                    return Ok(handle);
                }
                InputBinding::Redirect(handle, source_slot) => {
                    steps += 1;
                    if steps > self.nodes.len() {
                        return Err(GraphError::RedirectCycle {
                            element: self
                                .element(handle)
                                .map(|e| e.name().to_string())
                                .unwrap_or_default(),
                            slot: source_slot,
                        });
                    }
                    let node = self.nodes.get(handle.index()).ok_or(GraphError::UnknownNode)?;
                    current = *node.inputs.get(&source_slot).ok_or_else(|| {
                        GraphError::SlotOutOfRange {
                            element: self
                                .element(handle)
                                .map(|e| e.name().to_string())
                                .unwrap_or_default(),
                            slot: source_slot,
                        }
                    })?;
                }
            }
        }
    }

    /// Resolve every wired slot of `handle` to concrete producers.
    pub(crate) fn resolve_inputs(
        &self,
        handle: NodeHandle,
    ) -> Result<BTreeMap<u32, NodeHandle>, GraphError> {
        let node = self.nodes.get(handle.index()).ok_or(GraphError::UnknownNode)?;
        let mut resolved = BTreeMap::new();
        for (&slot, &binding) in &node.inputs {
            resolved.insert(slot, self.resolve_binding(binding)?);
        }
        Ok(resolved)
    }

    pub(crate) fn inputs_view<'a>(
        &'a self,
        resolved: &'a BTreeMap<u32, NodeHandle>,
    ) -> ResolvedInputs<'a> {
        ResolvedInputs::new(resolved, &self.nodes)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::any::Any;

    use ash::vk;

    use crate::context::DeviceContext;
    use crate::error::GraphError;

    use super::element::{Capabilities, GraphElement, ResolvedInputs};

    /// Host-only element for topology tests. Accepts any input on any
    /// slot; never touches the device.
    pub(crate) struct StubElement {
        name: String,
    }

    impl StubElement {
        pub(crate) fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
            }
        }
    }

    impl GraphElement for StubElement {
        fn name(&self) -> &str {
            &self.name
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::STORAGE_BUFFER
        }

        fn check_input(&self, _slot: u32, _candidate: &dyn GraphElement) -> Result<(), GraphError> {
            Ok(())
        }

        fn setup(
            &mut self,
            _ctx: &DeviceContext,
            _number_paths: u32,
            _inputs: &ResolvedInputs,
        ) -> Result<(), GraphError> {
            Ok(())
        }

        fn record(
            &self,
            _ctx: &DeviceContext,
            _cmd: vk::CommandBuffer,
            _path: u32,
            _inputs: &ResolvedInputs,
        ) -> Result<(), GraphError> {
            Ok(())
        }

        fn destroy(&mut self, _ctx: &DeviceContext) {}

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    /// Element that rejects every input, for wiring-error tests.
    pub(crate) struct SealedElement {
        name: String,
    }

    impl SealedElement {
        pub(crate) fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
            }
        }
    }

    impl GraphElement for SealedElement {
        fn name(&self) -> &str {
            &self.name
        }

        fn setup(
            &mut self,
            _ctx: &DeviceContext,
            _number_paths: u32,
            _inputs: &ResolvedInputs,
        ) -> Result<(), GraphError> {
            Ok(())
        }

        fn record(
            &self,
            _ctx: &DeviceContext,
            _cmd: vk::CommandBuffer,
            _path: u32,
            _inputs: &ResolvedInputs,
        ) -> Result<(), GraphError> {
            Ok(())
        }

        fn destroy(&mut self, _ctx: &DeviceContext) {}

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{SealedElement, StubElement};
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_add_and_typed_access() {
        let mut graph = Graph::new();
        let a = graph.add(StubElement::new("a"));
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.element(a).unwrap().name(), "a");
        assert!(graph.get::<StubElement>(a).is_some());
        assert!(graph.get::<SealedElement>(a).is_none());
    }

    #[test]
    fn test_set_input_rejected_by_consumer() {
        let mut graph = Graph::new();
        let producer = graph.add(StubElement::new("producer"));
        let sealed = graph.add(SealedElement::new("sealed"));

        let err = graph.set_input(sealed, 0, producer).unwrap_err();
        assert!(matches!(err, GraphError::TypeMismatch { .. }));
        assert_eq!(err.kind(), ErrorKind::Configuration);
        // rejected pairing must not be recorded
        assert!(graph.resolve_inputs(sealed).unwrap().is_empty());
    }

    #[test]
    fn test_redirect_resolves_to_effective_producer() {
        let mut graph = Graph::new();
        let src = graph.add(StubElement::new("src"));
        let mid = graph.add(StubElement::new("mid"));
        let dst = graph.add(StubElement::new("dst"));

        graph.set_input(mid, 0, src).unwrap();
        // dst slot 0 follows mid's slot 0, landing on src
        graph.set_input_redirect(dst, 0, mid, 0).unwrap();

        let resolved = graph.resolve_inputs(dst).unwrap();
        assert_eq!(resolved.get(&0), Some(&src));
    }

    #[test]
    fn test_redirect_through_redirect() {
        let mut graph = Graph::new();
        let src = graph.add(StubElement::new("src"));
        let a = graph.add(StubElement::new("a"));
        let b = graph.add(StubElement::new("b"));
        let c = graph.add(StubElement::new("c"));

        graph.set_input(a, 3, src).unwrap();
        graph.set_input_redirect(b, 1, a, 3).unwrap();
        graph.set_input_redirect(c, 0, b, 1).unwrap();

        let resolved = graph.resolve_inputs(c).unwrap();
        assert_eq!(resolved.get(&0), Some(&src));
    }

    #[test]
    fn test_redirect_to_unwired_slot() {
        let mut graph = Graph::new();
        let a = graph.add(StubElement::new("a"));
        let b = graph.add(StubElement::new("b"));

        let err = graph.set_input_redirect(b, 0, a, 7).unwrap_err();
        assert!(matches!(err, GraphError::SlotOutOfRange { slot: 7, .. }));
    }

    #[test]
    fn test_redirect_cycle_detected() {
        let mut graph = Graph::new();
        let src = graph.add(StubElement::new("src"));
        let a = graph.add(StubElement::new("a"));
        let b = graph.add(StubElement::new("b"));

        graph.set_input(a, 0, src).unwrap();
        graph.set_input_redirect(b, 0, a, 0).unwrap();
        // rewire a's slot 0 to follow b's slot 0, closing the loop
        graph.nodes[a.index()]
            .inputs
            .insert(0, InputBinding::Redirect(b, 0));

        let err = graph.resolve_inputs(b).unwrap_err();
        assert!(matches!(err, GraphError::RedirectCycle { .. }));
        assert_eq!(err.kind(), ErrorKind::Compile);
    }

    #[test]
    fn test_unknown_handle() {
        let graph = Graph::new();
        let bogus = NodeHandle::new(3);
        assert!(matches!(graph.element(bogus), Err(GraphError::UnknownNode)));
    }
}
