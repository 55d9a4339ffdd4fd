//! Graph compilation into per-path submissions, and steady-state submits.

use std::collections::HashMap;

use ash::vk;

use crate::context::DeviceContext;
use crate::error::GraphError;
use crate::graph::compile;
use crate::graph::element::GraphElement;
use crate::graph::{Graph, NodeHandle};

/// Executor options, fixed for the lifetime of the executor.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    /// Number of concurrently in-flight paths. Every element duplicates
    /// its per-path resources this many times.
    pub number_paths: u32,
    /// Upper bound for [`GraphExecutor::submit_and_wait`] fence waits.
    pub fence_timeout_ns: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            number_paths: 2,
            fence_timeout_ns: 10_000_000_000,
        }
    }
}

/// One node's prepared submission for one path. Slices are borrowed by
/// `vk::SubmitInfo` at submit time.
struct Submission {
    cmd: [vk::CommandBuffer; 1],
    waits: Vec<vk::Semaphore>,
    wait_stages: Vec<vk::PipelineStageFlags>,
    signals: Vec<vk::Semaphore>,
}

/// A compiled graph: every element set up, every command buffer recorded,
/// every semaphore allocated. Steady state is pure resubmission; no
/// recompilation, no reallocation, no re-recording.
pub struct GraphExecutor {
    graph: Graph,
    order: Vec<NodeHandle>,
    number_paths: u32,
    fence_timeout_ns: u64,
    command_pool: vk::CommandPool,
    submissions: HashMap<NodeHandle, Vec<Submission>>,
    edge_semaphores: Vec<vk::Semaphore>,
    finished: Vec<vk::Semaphore>,
    destroyed: bool,
}

impl GraphExecutor {
    /// Compile `graph` rooted at `root`.
    ///
    /// Topology analysis (including cycle detection) runs before any
    /// device resource is touched. Then every reachable element is set up
    /// in source-first order, per-edge per-path semaphores are created,
    /// and one primary command buffer per (node, path) is recorded.
    ///
    /// On error the graph is condemned: elements may be partially set up
    /// and the whole thing must be discarded.
    pub fn compile_from(
        ctx: &DeviceContext,
        mut graph: Graph,
        root: NodeHandle,
        config: ExecutorConfig,
    ) -> Result<Self, GraphError> {
        if config.number_paths == 0 {
            return Err(GraphError::InvalidConfiguration(
                "number_paths must be at least 1".to_string(),
            ));
        }
        let paths = config.number_paths;

        let topo = compile::analyze(&graph, root)?;

        // Setup in topological order, so every input an element inspects
        // is already initialized. The element is taken out of the arena
        // for the &mut call; its inputs can never include itself because
        // cycles were just rejected.
        for &handle in &topo.order {
            let mut element = graph.nodes[handle.index()]
                .element
                .take()
                .ok_or(GraphError::UnknownNode)?;
            let inputs_map = topo.resolved.get(&handle).ok_or(GraphError::UnknownNode)?;
            let result = {
                let inputs = graph.inputs_view(inputs_map);
                element.setup(ctx, paths, &inputs)
            };
            let name = element.name().to_string();
            graph.nodes[handle.index()].element = Some(element);
            if let Err(e) = result {
                log::error!("setup failed for '{name}': {e}");
                return Err(e);
            }
            log::trace!("setup complete for '{name}'");
        }

        let device = ctx.device();
        let sem_info = vk::SemaphoreCreateInfo::default();

        // One binary semaphore per consumer edge per path. Never shared
        // between consumers of the same producer.
        let mut edge_sems: HashMap<(NodeHandle, NodeHandle), Vec<vk::Semaphore>> = HashMap::new();
        let mut all_sems = Vec::with_capacity(topo.edges.len() * paths as usize);
        for &edge in &topo.edges {
            let mut per_path = Vec::with_capacity(paths as usize);
            for _ in 0..paths {
                let sem = unsafe { device.create_semaphore(&sem_info, None) }
                    .map_err(|e| GraphError::device("vkCreateSemaphore", e))?;
                per_path.push(sem);
                all_sems.push(sem);
            }
            edge_sems.insert(edge, per_path);
        }

        let mut finished = Vec::with_capacity(paths as usize);
        for _ in 0..paths {
            let sem = unsafe { device.create_semaphore(&sem_info, None) }
                .map_err(|e| GraphError::device("vkCreateSemaphore", e))?;
            finished.push(sem);
        }

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(ctx.queue_family_index())
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }
            .map_err(|e| GraphError::device("vkCreateCommandPool", e))?;

        let mut submissions: HashMap<NodeHandle, Vec<Submission>> = HashMap::new();

        for &handle in &topo.order {
            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(paths);
            let buffers = unsafe { device.allocate_command_buffers(&alloc_info) }
                .map_err(|e| GraphError::device("vkAllocateCommandBuffers", e))?;

            let inputs_map = topo.resolved.get(&handle).ok_or(GraphError::UnknownNode)?;
            let element = graph.element(handle)?;
            let node_consumers = topo.consumers.get(&handle);

            let mut per_path = Vec::with_capacity(paths as usize);
            for (path, &cmd) in buffers.iter().enumerate() {
                let path = path as u32;

                let begin_info = vk::CommandBufferBeginInfo::default()
                    .flags(vk::CommandBufferUsageFlags::SIMULTANEOUS_USE);
                unsafe { device.begin_command_buffer(cmd, &begin_info) }
                    .map_err(|e| GraphError::device("vkBeginCommandBuffer", e))?;

                {
                    let inputs = graph.inputs_view(inputs_map);
                    graph.element(handle)?.record(ctx, cmd, path, &inputs)?;
                }

                unsafe { device.end_command_buffer(cmd) }
                    .map_err(|e| GraphError::device("vkEndCommandBuffer", e))?;

                // Waits: the element's own external semaphore plus one
                // semaphore per producer edge.
                let mut waits = Vec::new();
                if let Some(external) = element.wait_semaphore(path) {
                    waits.push(external);
                }
                let mut producers: Vec<NodeHandle> = inputs_map.values().copied().collect();
                producers.sort();
                producers.dedup();
                for producer in producers {
                    if let Some(sems) = edge_sems.get(&(producer, handle)) {
                        waits.push(sems[path as usize]);
                    }
                }
                let wait_stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; waits.len()];

                // Signals: one semaphore per consumer edge; sinks signal
                // the shared per-path finished semaphore instead.
                let mut signals = Vec::new();
                match node_consumers {
                    Some(consumers) if !consumers.is_empty() => {
                        for &consumer in consumers {
                            if let Some(sems) = edge_sems.get(&(handle, consumer)) {
                                signals.push(sems[path as usize]);
                            }
                        }
                    }
                    _ => signals.push(finished[path as usize]),
                }

                per_path.push(Submission {
                    cmd: [cmd],
                    waits,
                    wait_stages,
                    signals,
                });
            }
            submissions.insert(handle, per_path);
        }

        log::debug!(
            "graph compiled: {} nodes, {} edge semaphores, {} paths",
            topo.order.len(),
            all_sems.len(),
            paths
        );

        Ok(Self {
            graph,
            order: topo.order,
            number_paths: paths,
            fence_timeout_ns: config.fence_timeout_ns,
            command_pool,
            submissions,
            edge_semaphores: all_sems,
            finished,
            destroyed: false,
        })
    }

    /// Submit every node's prepared work for `path` in one batched queue
    /// submission, optionally signalling `fence` on completion of the
    /// batch. Returns the path's finished semaphore.
    pub fn submit_to(
        &self,
        ctx: &DeviceContext,
        path: u32,
        fence: Option<vk::Fence>,
    ) -> Result<vk::Semaphore, GraphError> {
        if self.destroyed {
            return Err(GraphError::NotInitialized {
                element: "graph executor".to_string(),
            });
        }
        if path >= self.number_paths {
            return Err(GraphError::PathOutOfRange {
                path,
                paths: self.number_paths,
            });
        }

        let mut infos = Vec::with_capacity(self.order.len());
        for &handle in &self.order {
            let sub = &self.submissions[&handle][path as usize];
            let mut info = vk::SubmitInfo::default()
                .command_buffers(&sub.cmd)
                .signal_semaphores(&sub.signals);
            if !sub.waits.is_empty() {
                info = info
                    .wait_semaphores(&sub.waits)
                    .wait_dst_stage_mask(&sub.wait_stages);
            }
            infos.push(info);
        }

        log::trace!("submitting {} nodes to path {path}", infos.len());
        unsafe {
            ctx.device()
                .queue_submit(ctx.queue(), &infos, fence.unwrap_or_else(vk::Fence::null))
        }
        .map_err(|e| GraphError::device("vkQueueSubmit", e))?;

        Ok(self.finished[path as usize])
    }

    /// Submit `path` and block until the batch completes, with a bounded
    /// timeout. Timeout is reported as a distinguished device error and
    /// never retried.
    pub fn submit_and_wait(&self, ctx: &DeviceContext, path: u32) -> Result<(), GraphError> {
        let device = ctx.device();
        let fence_info = vk::FenceCreateInfo::default();
        let fence = unsafe { device.create_fence(&fence_info, None) }
            .map_err(|e| GraphError::device("vkCreateFence", e))?;

        let result = self.submit_to(ctx, path, Some(fence)).and_then(|_| {
            match unsafe { device.wait_for_fences(&[fence], true, self.fence_timeout_ns) } {
                Ok(()) => Ok(()),
                Err(vk::Result::TIMEOUT) => Err(GraphError::FenceTimeout(self.fence_timeout_ns)),
                Err(e) => Err(GraphError::device("vkWaitForFences", e)),
            }
        });

        unsafe { device.destroy_fence(fence, None) };
        result
    }

    /// Source-first execution order over the compiled (reachable) nodes.
    pub fn order(&self) -> &[NodeHandle] {
        &self.order
    }

    pub fn number_paths(&self) -> u32 {
        self.number_paths
    }

    /// The semaphore signalled when `path`'s sinks complete.
    pub fn finished_semaphore(&self, path: u32) -> Option<vk::Semaphore> {
        self.finished.get(path as usize).copied()
    }

    /// Semaphores `node`'s submission waits on for `path` (external wait
    /// first, then producer edges).
    pub fn wait_semaphores(&self, node: NodeHandle, path: u32) -> Option<&[vk::Semaphore]> {
        self.submissions
            .get(&node)?
            .get(path as usize)
            .map(|s| s.waits.as_slice())
    }

    /// Semaphores `node`'s submission signals for `path`.
    pub fn signal_semaphores(&self, node: NodeHandle, path: u32) -> Option<&[vk::Semaphore]> {
        self.submissions
            .get(&node)?
            .get(path as usize)
            .map(|s| s.signals.as_slice())
    }

    /// Typed access to a compiled element, e.g. for readback.
    pub fn get<E: GraphElement>(&self, handle: NodeHandle) -> Option<&E> {
        self.graph.get(handle)
    }

    /// Typed mutable access, e.g. for updating a uniform mirror.
    pub fn get_mut<E: GraphElement>(&mut self, handle: NodeHandle) -> Option<&mut E> {
        self.graph.get_mut(handle)
    }

    /// Destroy every element and all synchronization/command resources.
    /// Must run before the device context is destroyed.
    pub fn destroy(&mut self, ctx: &DeviceContext) {
        if self.destroyed {
            return;
        }
        let _ = ctx.wait_idle();

        // Reverse topological order, consumers before their producers.
        for &handle in self.order.iter().rev() {
            if let Some(element) = self.graph.nodes[handle.index()].element.as_deref_mut() {
                element.destroy(ctx);
            }
        }
        // Nodes that were never reachable still get their destroy call.
        for node in &mut self.graph.nodes {
            if let Some(element) = node.element.as_deref_mut() {
                element.destroy(ctx);
            }
        }

        let device = ctx.device();
        unsafe {
            for &sem in &self.edge_semaphores {
                device.destroy_semaphore(sem, None);
            }
            for &sem in &self.finished {
                device.destroy_semaphore(sem, None);
            }
            device.destroy_command_pool(self.command_pool, None);
        }
        self.destroyed = true;
        log::debug!("graph executor destroyed");
    }
}

impl Drop for GraphExecutor {
    fn drop(&mut self) {
        if !self.destroyed {
            log::warn!("GraphExecutor dropped without explicit destroy() call");
        }
    }
}
