//! Pure topology analysis: reachability, edge collection and topological
//! ordering. No device access happens here, so a cyclic graph is rejected
//! before any GPU resource is allocated.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::error::GraphError;
use crate::graph::{Graph, NodeHandle};

/// The compiled shape of a graph, rooted at one node.
#[derive(Debug)]
pub(crate) struct Topology {
    /// Source-first execution order over the reachable set.
    pub order: Vec<NodeHandle>,
    /// Per-node resolved inputs (redirections already followed).
    pub resolved: HashMap<NodeHandle, BTreeMap<u32, NodeHandle>>,
    /// Dependency edges `(producer, consumer)`, deduplicated: a consumer
    /// reading the same producer through several slots yields one edge.
    pub edges: Vec<(NodeHandle, NodeHandle)>,
    /// Derived consumer lists, the inverse of the resolved inputs.
    pub consumers: HashMap<NodeHandle, Vec<NodeHandle>>,
}

/// Analyze the graph reachable from `root`.
///
/// Walks input chains from the root, resolves every redirection, collects
/// deduplicated edges and runs Kahn's algorithm sink-first from the root.
/// The order is reversed to source-first before returning. A cycle among
/// reachable nodes is a fatal [`GraphError::CyclicDependency`].
pub(crate) fn analyze(graph: &Graph, root: NodeHandle) -> Result<Topology, GraphError> {
    graph.element(root)?;

    // Reachability walk, resolving redirects as we go.
    let mut resolved: HashMap<NodeHandle, BTreeMap<u32, NodeHandle>> = HashMap::new();
    let mut visited: HashSet<NodeHandle> = HashSet::new();
    let mut pending = VecDeque::new();
    pending.push_back(root);
    visited.insert(root);

    let mut edge_set: HashSet<(NodeHandle, NodeHandle)> = HashSet::new();

    while let Some(consumer) = pending.pop_front() {
        let inputs = graph.resolve_inputs(consumer)?;
        for (&slot, &producer) in &inputs {
            // Re-validate the pairing against the effective producer.
            // Wiring-time checks can go stale when a redirection's target
            // slot is rewired afterwards.
            graph
                .element(consumer)?
                .check_input(slot, graph.element(producer)?)?;
            edge_set.insert((producer, consumer));
            if visited.insert(producer) {
                pending.push_back(producer);
            }
        }
        resolved.insert(consumer, inputs);
    }

    // Kahn's algorithm, sink-first. Within the reachable set only the
    // root (and nodes nothing reads) have no outgoing edges.
    let mut out_count: HashMap<NodeHandle, usize> = visited.iter().map(|&h| (h, 0)).collect();
    for &(producer, _) in &edge_set {
        if let Some(count) = out_count.get_mut(&producer) {
            *count += 1;
        }
    }

    let mut queue: VecDeque<NodeHandle> = VecDeque::new();
    let mut roots: Vec<NodeHandle> = out_count
        .iter()
        .filter(|(_, &c)| c == 0)
        .map(|(&h, _)| h)
        .collect();
    roots.sort();
    queue.extend(roots);

    let mut order = Vec::with_capacity(visited.len());
    while let Some(handle) = queue.pop_front() {
        order.push(handle);
        if let Some(inputs) = resolved.get(&handle) {
            let mut producers: Vec<NodeHandle> = inputs.values().copied().collect();
            producers.sort();
            producers.dedup();
            for producer in producers {
                let count = out_count
                    .get_mut(&producer)
                    .ok_or(GraphError::UnknownNode)?;
                *count -= 1;
                if *count == 0 {
                    queue.push_back(producer);
                }
            }
        }
    }

    if order.len() != visited.len() {
        return Err(GraphError::CyclicDependency);
    }

    order.reverse();

    let mut edges: Vec<(NodeHandle, NodeHandle)> = edge_set.into_iter().collect();
    edges.sort();

    let mut consumers: HashMap<NodeHandle, Vec<NodeHandle>> = HashMap::new();
    for &(producer, consumer) in &edges {
        consumers.entry(producer).or_default().push(consumer);
    }

    log::debug!(
        "compiled topology: {} nodes, {} edges",
        order.len(),
        edges.len()
    );

    Ok(Topology {
        order,
        resolved,
        edges,
        consumers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elements::BufferTransformation;
    use crate::error::ErrorKind;
    use crate::graph::testing::{SealedElement, StubElement};
    use crate::shader::ShaderSource;

    fn position(order: &[NodeHandle], h: NodeHandle) -> usize {
        order.iter().position(|&x| x == h).unwrap()
    }

    #[test]
    fn test_linear_chain_order() {
        let mut graph = Graph::new();
        let a = graph.add(StubElement::new("a"));
        let b = graph.add(StubElement::new("b"));
        let c = graph.add(StubElement::new("c"));
        graph.set_input(b, 0, a).unwrap();
        graph.set_input(c, 0, b).unwrap();

        let topo = analyze(&graph, c).unwrap();
        assert_eq!(topo.order, vec![a, b, c]);
        assert_eq!(topo.edges.len(), 2);
    }

    #[test]
    fn test_diamond_order_is_topological() {
        let mut graph = Graph::new();
        let src = graph.add(StubElement::new("src"));
        let left = graph.add(StubElement::new("left"));
        let right = graph.add(StubElement::new("right"));
        let sink = graph.add(StubElement::new("sink"));
        graph.set_input(left, 0, src).unwrap();
        graph.set_input(right, 0, src).unwrap();
        graph.set_input(sink, 0, left).unwrap();
        graph.set_input(sink, 1, right).unwrap();

        let topo = analyze(&graph, sink).unwrap();
        assert_eq!(topo.order.len(), 4);
        assert!(position(&topo.order, src) < position(&topo.order, left));
        assert!(position(&topo.order, src) < position(&topo.order, right));
        assert!(position(&topo.order, left) < position(&topo.order, sink));
        assert!(position(&topo.order, right) < position(&topo.order, sink));
        assert_eq!(topo.edges.len(), 4);
    }

    #[test]
    fn test_cycle_rejected() {
        let mut graph = Graph::new();
        let a = graph.add(StubElement::new("a"));
        let b = graph.add(StubElement::new("b"));
        graph.set_input(a, 0, b).unwrap();
        graph.set_input(b, 0, a).unwrap();

        let err = analyze(&graph, b).unwrap_err();
        assert!(matches!(err, GraphError::CyclicDependency));
    }

    #[test]
    fn test_self_loop_rejected() {
        let mut graph = Graph::new();
        let a = graph.add(StubElement::new("a"));
        graph.set_input(a, 0, a).unwrap();

        let err = analyze(&graph, a).unwrap_err();
        assert!(matches!(err, GraphError::CyclicDependency));
    }

    #[test]
    fn test_unreachable_nodes_excluded() {
        let mut graph = Graph::new();
        let a = graph.add(StubElement::new("a"));
        let b = graph.add(StubElement::new("b"));
        let orphan = graph.add(StubElement::new("orphan"));
        graph.set_input(b, 0, a).unwrap();

        let topo = analyze(&graph, b).unwrap();
        assert_eq!(topo.order, vec![a, b]);
        assert!(!topo.order.contains(&orphan));
    }

    #[test]
    fn test_parallel_edges_deduplicated() {
        let mut graph = Graph::new();
        let src = graph.add(StubElement::new("src"));
        let sink = graph.add(StubElement::new("sink"));
        graph.set_input(sink, 0, src).unwrap();
        graph.set_input(sink, 1, src).unwrap();
        graph.set_input(sink, 2, src).unwrap();

        let topo = analyze(&graph, sink).unwrap();
        assert_eq!(topo.edges, vec![(src, sink)]);
        assert_eq!(topo.consumers[&src], vec![sink]);
    }

    #[test]
    fn test_redirected_inputs_feed_topology() {
        let mut graph = Graph::new();
        let src = graph.add(StubElement::new("src"));
        let mid = graph.add(StubElement::new("mid"));
        let tap = graph.add(StubElement::new("tap"));
        graph.set_input(mid, 0, src).unwrap();
        graph.set_input(tap, 0, mid).unwrap();
        // second slot taps mid's input, resolving straight to src
        graph.set_input_redirect(tap, 1, mid, 0).unwrap();

        let topo = analyze(&graph, tap).unwrap();
        assert_eq!(topo.order, vec![src, mid, tap]);
        // tap has edges from both mid and src
        assert!(topo.edges.contains(&(src, tap)));
        assert!(topo.edges.contains(&(mid, tap)));
        assert_eq!(topo.resolved[&tap][&1], src);
    }

    #[test]
    fn test_rewired_redirect_target_rechecked() {
        let mut graph = Graph::new();
        let storage = graph.add(StubElement::new("storage"));
        let tap = graph.add(StubElement::new("tap"));
        let sealed = graph.add(SealedElement::new("sealed"));
        let consume = graph.add(BufferTransformation::<f32, f32>::new(
            "consume",
            ShaderSource::Words(Vec::new()),
        ));

        graph.set_input(tap, 0, storage).unwrap();
        // valid at wiring time: the redirection lands on a storage producer
        graph.set_input_redirect(consume, 0, tap, 0).unwrap();
        // rewire tap's slot to an element with no storage capability;
        // tap itself accepts anything, so this succeeds
        graph.set_input(tap, 0, sealed).unwrap();

        let err = analyze(&graph, consume).unwrap_err();
        assert!(matches!(err, GraphError::TypeMismatch { .. }));
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_single_node_graph() {
        let mut graph = Graph::new();
        let only = graph.add(StubElement::new("only"));
        let topo = analyze(&graph, only).unwrap();
        assert_eq!(topo.order, vec![only]);
        assert!(topo.edges.is_empty());
    }
}
