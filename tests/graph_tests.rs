//! GPU integration tests for the graph engine.
//!
//! Every test brings up a headless device; when no Vulkan implementation
//! is present the test prints a notice and returns early, so the suite
//! stays green on machines without a GPU.
//!
//! ```bash
//! cargo test --test graph_tests
//! ```

use ash::vk;
use bytemuck::{Pod, Zeroable};
use rstest::rstest;

use amaranth::{
    compile_wgsl, BufferElement, BufferElementSinglePath, BufferTransformation, DeviceContext,
    ErrorKind, ExecutorConfig, GeneralComputation, Graph, GraphElement, GraphError,
    GraphExecutor, ImageViewSrc, RenderPassElement, ResolvedInputs, ShaderSource, ShaderStage,
    TensorElement, UniformBufferObject,
};

fn test_context() -> Option<DeviceContext> {
    let _ = env_logger::builder().is_test(true).try_init();
    match DeviceContext::headless() {
        Ok(ctx) => Some(ctx),
        Err(e) => {
            eprintln!("Vulkan not available, skipping: {e}");
            None
        }
    }
}

fn config(paths: u32) -> ExecutorConfig {
    ExecutorConfig {
        number_paths: paths,
        ..ExecutorConfig::default()
    }
}

const DOUBLE_WGSL: &str = r#"
@group(0) @binding(0) var<storage, read> input: array<f32>;
@group(0) @binding(1) var<storage, read_write> output: array<f32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x < arrayLength(&input)) {
        output[id.x] = input[id.x] * 2.0;
    }
}
"#;

fn double_shader() -> ShaderSource {
    let spv = compile_wgsl(DOUBLE_WGSL, ShaderStage::Compute, "main").unwrap();
    ShaderSource::Words(spv)
}

#[test]
fn test_double_kernel_end_to_end() {
    let Some(mut ctx) = test_context() else {
        return;
    };

    let mut graph = Graph::new();
    let input = graph.add(BufferElement::<f32>::new("input", 7));
    let double = graph.add(BufferTransformation::<f32, f32>::new(
        "double",
        double_shader(),
    ));
    graph.set_input(double, 0, input).unwrap();

    let mut exec = GraphExecutor::compile_from(&ctx, graph, double, config(1)).unwrap();
    assert_eq!(exec.order(), &[input, double]);

    let values: Vec<f32> = (1..=7).map(|v| v as f32).collect();
    exec.get::<BufferElement<f32>>(input)
        .unwrap()
        .write(&ctx, 0, &values)
        .unwrap();

    exec.submit_and_wait(&ctx, 0).unwrap();

    let out = exec
        .get::<BufferTransformation<f32, f32>>(double)
        .unwrap()
        .read_output(&ctx, 0)
        .unwrap();
    let expected: Vec<f32> = values.iter().map(|v| v * 2.0).collect();
    assert_eq!(out, expected);

    exec.destroy(&ctx);
    ctx.destroy();
}

#[rstest]
#[case(2)]
#[case(3)]
fn test_path_isolation(#[case] paths: u32) {
    let Some(mut ctx) = test_context() else {
        return;
    };

    let mut graph = Graph::new();
    let input = graph.add(BufferElement::<f32>::new("input", 4));
    let double = graph.add(BufferTransformation::<f32, f32>::new(
        "double",
        double_shader(),
    ));
    graph.set_input(double, 0, input).unwrap();

    let mut exec = GraphExecutor::compile_from(&ctx, graph, double, config(paths)).unwrap();

    // Distinct data per path; results must never bleed across paths.
    for path in 0..paths {
        let values: Vec<f32> = (0..4).map(|i| (path * 100 + i) as f32).collect();
        exec.get::<BufferElement<f32>>(input)
            .unwrap()
            .write(&ctx, path, &values)
            .unwrap();
    }
    for path in 0..paths {
        exec.submit_and_wait(&ctx, path).unwrap();
    }
    for path in 0..paths {
        let out = exec
            .get::<BufferTransformation<f32, f32>>(double)
            .unwrap()
            .read_output(&ctx, path)
            .unwrap();
        let expected: Vec<f32> = (0..4).map(|i| ((path * 100 + i) * 2) as f32).collect();
        assert_eq!(out, expected, "path {path} observed foreign data");
    }

    exec.destroy(&ctx);
    ctx.destroy();
}

const SCALE_WGSL: &str = r#"
struct Params {
    scale: f32,
}

@group(0) @binding(0) var<storage, read> input: array<f32>;
@group(0) @binding(1) var<storage, read_write> output: array<f32>;
@group(0) @binding(2) var<uniform> params: Params;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x < arrayLength(&input)) {
        output[id.x] = input[id.x] * params.scale;
    }
}
"#;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ScaleParams {
    scale: f32,
}

#[test]
fn test_uniform_parameter_block() {
    let Some(mut ctx) = test_context() else {
        return;
    };

    let spv = compile_wgsl(SCALE_WGSL, ShaderStage::Compute, "main").unwrap();
    let mut graph = Graph::new();
    let input = graph.add(BufferElement::<f32>::new("input", 5));
    let scaled = graph.add(
        BufferTransformation::<f32, f32, ScaleParams>::new("scale", ShaderSource::Words(spv))
            .with_uniform(ScaleParams { scale: 3.0 }),
    );
    graph.set_input(scaled, 0, input).unwrap();

    let mut exec = GraphExecutor::compile_from(&ctx, graph, scaled, config(1)).unwrap();
    exec.get::<BufferElement<f32>>(input)
        .unwrap()
        .write(&ctx, 0, &[1.0, 2.0, 3.0, 4.0, 5.0])
        .unwrap();
    exec.submit_and_wait(&ctx, 0).unwrap();

    let out = exec
        .get::<BufferTransformation<f32, f32, ScaleParams>>(scaled)
        .unwrap()
        .read_output(&ctx, 0)
        .unwrap();
    assert_eq!(out, vec![3.0, 6.0, 9.0, 12.0, 15.0]);

    exec.destroy(&ctx);
    ctx.destroy();
}

const PUSH_SLOT_WGSL: &str = r#"
struct Slot {
    index: u32,
    value: f32,
}

var<push_constant> slot: Slot;

@group(0) @binding(0) var<storage, read> input: array<f32>;
@group(0) @binding(1) var<storage, read_write> output: array<f32>;

@compute @workgroup_size(1)
fn main() {
    output[slot.index] = input[0] + slot.value;
}
"#;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct PushSlot {
    index: u32,
    value: f32,
}

#[test]
fn test_push_constant_iteration_runs_once_per_value() {
    let Some(mut ctx) = test_context() else {
        return;
    };

    let spv = compile_wgsl(PUSH_SLOT_WGSL, ShaderStage::Compute, "main").unwrap();
    let mut graph = Graph::new();
    let input = graph.add(BufferElement::<f32>::new("base", 1));
    let mut fanout = BufferTransformation::<f32, f32, (), PushSlot>::new(
        "fanout",
        ShaderSource::Words(spv),
    )
    .with_output_len(4)
    .with_dispatch([1, 1, 1]);
    // Four values, one dispatch each, each writing its own output slot.
    fanout.set_push_constants(vec![
        PushSlot {
            index: 0,
            value: 10.0,
        },
        PushSlot {
            index: 1,
            value: 20.0,
        },
        PushSlot {
            index: 2,
            value: 30.0,
        },
        PushSlot {
            index: 3,
            value: 40.0,
        },
    ]);
    let fanout = graph.add(fanout);
    graph.set_input(fanout, 0, input).unwrap();

    let mut exec = GraphExecutor::compile_from(&ctx, graph, fanout, config(1)).unwrap();
    exec.get::<BufferElement<f32>>(input)
        .unwrap()
        .write(&ctx, 0, &[1.0])
        .unwrap();
    exec.submit_and_wait(&ctx, 0).unwrap();

    let out = exec
        .get::<BufferTransformation<f32, f32, (), PushSlot>>(fanout)
        .unwrap()
        .read_output(&ctx, 0)
        .unwrap();
    // Every slot written proves every push value got its dispatch.
    assert_eq!(out, vec![11.0, 21.0, 31.0, 41.0]);

    exec.destroy(&ctx);
    ctx.destroy();
}

const CHAIN_WGSL: &str = r#"
struct Stage {
    first: u32,
}

var<push_constant> stage: Stage;

@group(0) @binding(0) var<storage, read> input: array<f32>;
@group(0) @binding(1) var<storage, read_write> output: array<f32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x < arrayLength(&input)) {
        if (stage.first == 1u) {
            output[id.x] = input[id.x];
        } else {
            output[id.x] = output[id.x] * 2.0;
        }
    }
}
"#;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Stage {
    first: u32,
}

#[test]
fn test_push_constant_passes_chain_through_barriers() {
    let Some(mut ctx) = test_context() else {
        return;
    };

    let spv = compile_wgsl(CHAIN_WGSL, ShaderStage::Compute, "main").unwrap();
    let mut graph = Graph::new();
    let input = graph.add(BufferElement::<f32>::new("input", 4));
    let mut chain =
        BufferTransformation::<f32, f32, (), Stage>::new("chain", ShaderSource::Words(spv));
    // The first pass seeds the output in place; every later pass doubles
    // what the previous pass wrote, so a missing shader-write to
    // shader-read barrier between passes corrupts the result.
    chain.set_push_constants(vec![
        Stage { first: 1 },
        Stage { first: 0 },
        Stage { first: 0 },
    ]);
    let chain = graph.add(chain);
    graph.set_input(chain, 0, input).unwrap();

    let mut exec = GraphExecutor::compile_from(&ctx, graph, chain, config(1)).unwrap();
    exec.get::<BufferElement<f32>>(input)
        .unwrap()
        .write(&ctx, 0, &[1.0, 2.0, 3.0, 4.0])
        .unwrap();
    exec.submit_and_wait(&ctx, 0).unwrap();

    let out = exec
        .get::<BufferTransformation<f32, f32, (), Stage>>(chain)
        .unwrap()
        .read_output(&ctx, 0)
        .unwrap();
    assert_eq!(out, vec![4.0, 8.0, 12.0, 16.0]);

    exec.destroy(&ctx);
    ctx.destroy();
}

#[test]
fn test_missing_push_constants_is_usage_error() {
    let Some(mut ctx) = test_context() else {
        return;
    };

    let spv = compile_wgsl(PUSH_SLOT_WGSL, ShaderStage::Compute, "main").unwrap();
    let mut graph = Graph::new();
    let input = graph.add(BufferElement::<f32>::new("base", 1));
    let fanout = graph.add(
        BufferTransformation::<f32, f32, (), PushSlot>::new("fanout", ShaderSource::Words(spv))
            .with_output_len(4),
    );
    graph.set_input(fanout, 0, input).unwrap();

    // Recording happens during compilation; the missing values surface
    // there, before any dispatch.
    let err = GraphExecutor::compile_from(&ctx, graph, fanout, config(1))
        .err()
        .expect("compilation without push values must fail");
    assert!(matches!(err, GraphError::MissingPushConstants { .. }));
    assert_eq!(err.kind(), ErrorKind::Usage);

    ctx.destroy();
}

#[test]
fn test_record_before_setup_fails() {
    let Some(mut ctx) = test_context() else {
        return;
    };

    let empty = ResolvedInputs::empty();
    let cmd = vk::CommandBuffer::null();

    let buffer = BufferElement::<f32>::new("buffer", 4);
    assert!(matches!(
        buffer.record(&ctx, cmd, 0, &empty),
        Err(GraphError::NotInitialized { .. })
    ));

    let transform = BufferTransformation::<f32, f32>::new("t", ShaderSource::Words(Vec::new()));
    assert!(matches!(
        transform.record(&ctx, cmd, 0, &empty),
        Err(GraphError::NotInitialized { .. })
    ));

    let tensor = TensorElement::<f32>::new("tensor", &[1, 1, 1, 4]).unwrap();
    assert!(matches!(
        tensor.record(&ctx, cmd, 0, &empty),
        Err(GraphError::NotInitialized { .. })
    ));

    let ubo = UniformBufferObject::new("ubo", 1.0f32);
    assert!(matches!(
        ubo.record(&ctx, cmd, 0, &empty),
        Err(GraphError::NotInitialized { .. })
    ));

    let shared = BufferElementSinglePath::<f32>::new("shared", 4);
    assert!(matches!(
        shared.record(&ctx, cmd, 0, &empty),
        Err(GraphError::NotInitialized { .. })
    ));

    let image = ImageViewSrc::new("image", Vec::new());
    assert!(matches!(
        image.record(&ctx, cmd, 0, &empty),
        Err(GraphError::NotInitialized { .. })
    ));

    let computation: GeneralComputation =
        GeneralComputation::new("computation", ShaderSource::Words(Vec::new()));
    assert!(matches!(
        computation.record(&ctx, cmd, 0, &empty),
        Err(GraphError::NotInitialized { .. })
    ));

    let pass = RenderPassElement::new("pass", [0.0; 4]);
    assert!(matches!(
        pass.record(&ctx, cmd, 0, &empty),
        Err(GraphError::NotInitialized { .. })
    ));

    ctx.destroy();
}

#[test]
fn test_per_edge_semaphores_in_diamond() {
    let Some(mut ctx) = test_context() else {
        return;
    };

    let mut graph = Graph::new();
    let src = graph.add(BufferElement::<f32>::new("src", 4));
    let left = graph.add(BufferTransformation::<f32, f32>::new(
        "left",
        double_shader(),
    ));
    let right = graph.add(BufferTransformation::<f32, f32>::new(
        "right",
        double_shader(),
    ));
    let sink = graph.add(
        BufferTransformation::<f32, f32>::new("sink", double_shader()).declare_scratch(2, false),
    );
    graph.set_input(left, 0, src).unwrap();
    graph.set_input(right, 0, src).unwrap();
    graph.set_input(sink, 0, left).unwrap();
    graph.set_input(sink, 2, right).unwrap();

    let paths = 2;
    let mut exec = GraphExecutor::compile_from(&ctx, graph, sink, config(paths)).unwrap();

    for path in 0..paths {
        // The source signals one distinct semaphore per consumer edge.
        let src_signals = exec.signal_semaphores(src, path).unwrap();
        assert_eq!(src_signals.len(), 2);
        assert_ne!(src_signals[0], src_signals[1]);

        // Each branch waits on exactly one of them.
        let left_waits = exec.wait_semaphores(left, path).unwrap();
        let right_waits = exec.wait_semaphores(right, path).unwrap();
        assert_eq!(left_waits.len(), 1);
        assert_eq!(right_waits.len(), 1);
        assert_ne!(left_waits[0], right_waits[0]);
        assert!(src_signals.contains(&left_waits[0]));
        assert!(src_signals.contains(&right_waits[0]));

        // The sink waits on both branches and, being the only sink,
        // signals the path's finished semaphore.
        let sink_waits = exec.wait_semaphores(sink, path).unwrap();
        assert_eq!(sink_waits.len(), 2);
        let sink_signals = exec.signal_semaphores(sink, path).unwrap();
        assert_eq!(sink_signals, &[exec.finished_semaphore(path).unwrap()]);
    }

    // Semaphores must not repeat across paths.
    let p0 = exec.signal_semaphores(src, 0).unwrap().to_vec();
    let p1 = exec.signal_semaphores(src, 1).unwrap().to_vec();
    assert!(p0.iter().all(|s| !p1.contains(s)));

    exec.destroy(&ctx);
    ctx.destroy();
}

#[test]
fn test_submit_returns_finished_semaphore() {
    let Some(mut ctx) = test_context() else {
        return;
    };

    let mut graph = Graph::new();
    let input = graph.add(BufferElement::<f32>::new("input", 4));
    let double = graph.add(BufferTransformation::<f32, f32>::new(
        "double",
        double_shader(),
    ));
    graph.set_input(double, 0, input).unwrap();

    let mut exec = GraphExecutor::compile_from(&ctx, graph, double, config(2)).unwrap();

    let sem = exec.submit_to(&ctx, 0, None).unwrap();
    assert_eq!(sem, exec.finished_semaphore(0).unwrap());
    assert_ne!(sem, exec.finished_semaphore(1).unwrap());
    ctx.wait_idle().unwrap();

    let err = exec.submit_to(&ctx, 5, None).unwrap_err();
    assert!(matches!(err, GraphError::PathOutOfRange { path: 5, .. }));

    exec.destroy(&ctx);
    ctx.destroy();
}

#[test]
fn test_cycle_rejected_before_any_setup() {
    let Some(mut ctx) = test_context() else {
        return;
    };

    let mut graph = Graph::new();
    let a = graph.add(BufferTransformation::<f32, f32>::new(
        "a",
        ShaderSource::Words(Vec::new()),
    ));
    let b = graph.add(BufferTransformation::<f32, f32>::new(
        "b",
        ShaderSource::Words(Vec::new()),
    ));
    graph.set_input(a, 0, b).unwrap();
    graph.set_input(b, 0, a).unwrap();

    let err = GraphExecutor::compile_from(&ctx, graph, a, config(1))
        .err()
        .expect("cyclic graph must not compile");
    assert!(matches!(err, GraphError::CyclicDependency));
    assert_eq!(err.kind(), ErrorKind::Compile);

    ctx.destroy();
}

#[test]
fn test_zero_length_input_rejected_at_compile() {
    let Some(mut ctx) = test_context() else {
        return;
    };

    let mut graph = Graph::new();
    let input = graph.add(BufferElement::<f32>::new("empty", 0));
    let double = graph.add(BufferTransformation::<f32, f32>::new(
        "double",
        double_shader(),
    ));
    graph.set_input(double, 0, input).unwrap();

    let err = GraphExecutor::compile_from(&ctx, graph, double, config(1))
        .err()
        .expect("zero-length input must not compile");
    assert!(matches!(err, GraphError::InvalidElement { .. }));
    assert_eq!(err.kind(), ErrorKind::Compile);

    ctx.destroy();
}

#[test]
fn test_tensor_upload_transform_download() {
    let Some(mut ctx) = test_context() else {
        return;
    };

    let mut graph = Graph::new();
    let tensor = graph.add(TensorElement::<f32>::new("tensor", &[1, 2, 2, 2]).unwrap());
    let double = graph.add(BufferTransformation::<f32, f32>::new(
        "double",
        double_shader(),
    ));
    graph.set_input(double, 0, tensor).unwrap();

    let mut exec = GraphExecutor::compile_from(&ctx, graph, double, config(1)).unwrap();

    let values: Vec<f32> = (1..=8).map(|v| v as f32).collect();
    let tensor_el = exec.get::<TensorElement<f32>>(tensor).unwrap();
    tensor_el.upload(&ctx, 0, &values).unwrap();
    assert_eq!(tensor_el.download(&ctx, 0).unwrap(), values);

    exec.submit_and_wait(&ctx, 0).unwrap();

    let out = exec
        .get::<BufferTransformation<f32, f32>>(double)
        .unwrap()
        .read_output(&ctx, 0)
        .unwrap();
    let expected: Vec<f32> = values.iter().map(|v| v * 2.0).collect();
    assert_eq!(out, expected);

    exec.destroy(&ctx);
    ctx.destroy();
}

#[test]
fn test_indirect_dispatch() {
    let Some(mut ctx) = test_context() else {
        return;
    };

    let mut graph = Graph::new();
    let input = graph.add(BufferElement::<f32>::new("input", 4));
    let args = graph.add(BufferElementSinglePath::<u32>::new("args", 3));
    let double = graph.add(
        BufferTransformation::<f32, f32>::new("double", double_shader())
            .with_indirect_dispatch(3),
    );
    graph.set_input(double, 0, input).unwrap();
    graph.set_input(double, 3, args).unwrap();

    let mut exec = GraphExecutor::compile_from(&ctx, graph, double, config(1)).unwrap();

    exec.get::<BufferElementSinglePath<u32>>(args)
        .unwrap()
        .write(&ctx, &[1, 1, 1])
        .unwrap();
    exec.get::<BufferElement<f32>>(input)
        .unwrap()
        .write(&ctx, 0, &[1.0, 2.0, 3.0, 4.0])
        .unwrap();
    exec.submit_and_wait(&ctx, 0).unwrap();

    let out = exec
        .get::<BufferTransformation<f32, f32>>(double)
        .unwrap()
        .read_output(&ctx, 0)
        .unwrap();
    assert_eq!(out, vec![2.0, 4.0, 6.0, 8.0]);

    exec.destroy(&ctx);
    ctx.destroy();
}

const ACCUMULATE_WGSL: &str = r#"
@group(0) @binding(0) var<storage, read> input: array<f32>;
@group(0) @binding(1) var<storage, read_write> output: array<f32>;
@group(0) @binding(2) var<storage, read_write> scratch: array<f32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x < arrayLength(&input)) {
        scratch[id.x] = scratch[id.x] + input[id.x];
        output[id.x] = scratch[id.x];
    }
}
"#;

#[test]
fn test_scratch_zeroed_every_submission() {
    let Some(mut ctx) = test_context() else {
        return;
    };

    let spv = compile_wgsl(ACCUMULATE_WGSL, ShaderStage::Compute, "main").unwrap();
    let mut graph = Graph::new();
    let input = graph.add(BufferElement::<f32>::new("input", 4));
    let scratch = graph.add(BufferElement::<f32>::new("scratch", 4));
    let accum = graph.add(
        BufferTransformation::<f32, f32>::new("accumulate", ShaderSource::Words(spv))
            .declare_scratch(2, true),
    );
    graph.set_input(accum, 0, input).unwrap();
    graph.set_input(accum, 2, scratch).unwrap();

    let mut exec = GraphExecutor::compile_from(&ctx, graph, accum, config(1)).unwrap();
    exec.get::<BufferElement<f32>>(input)
        .unwrap()
        .write(&ctx, 0, &[1.0, 2.0, 3.0, 4.0])
        .unwrap();

    // With the scratch zeroed before every dispatch, resubmission must
    // not accumulate across submissions.
    exec.submit_and_wait(&ctx, 0).unwrap();
    exec.submit_and_wait(&ctx, 0).unwrap();

    let out = exec
        .get::<BufferTransformation<f32, f32>>(accum)
        .unwrap()
        .read_output(&ctx, 0)
        .unwrap();
    assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);

    exec.destroy(&ctx);
    ctx.destroy();
}

#[test]
fn test_redirect_wiring_end_to_end() {
    let Some(mut ctx) = test_context() else {
        return;
    };

    let mut graph = Graph::new();
    let input = graph.add(BufferElement::<f32>::new("input", 4));
    let first = graph.add(BufferTransformation::<f32, f32>::new(
        "first",
        double_shader(),
    ));
    // The second transform redirects through first's input slot, so both
    // read the same source buffer.
    let second = graph.add(BufferTransformation::<f32, f32>::new(
        "second",
        double_shader(),
    ));
    graph.set_input(first, 0, input).unwrap();
    graph.set_input_redirect(second, 0, first, 0).unwrap();

    let mut exec = GraphExecutor::compile_from(&ctx, graph, second, config(1)).unwrap();
    exec.get::<BufferElement<f32>>(input)
        .unwrap()
        .write(&ctx, 0, &[5.0, 6.0, 7.0, 8.0])
        .unwrap();
    exec.submit_and_wait(&ctx, 0).unwrap();

    let out = exec
        .get::<BufferTransformation<f32, f32>>(second)
        .unwrap()
        .read_output(&ctx, 0)
        .unwrap();
    assert_eq!(out, vec![10.0, 12.0, 14.0, 16.0]);

    exec.destroy(&ctx);
    ctx.destroy();
}

#[test]
fn test_uniform_update_per_path() {
    let Some(mut ctx) = test_context() else {
        return;
    };

    // Host-side uniform mirror: update one path, leave the other.
    let mut graph = Graph::new();
    let ubo = graph.add(UniformBufferObject::new("value", 1.0f32));
    let mut exec = GraphExecutor::compile_from(&ctx, graph, ubo, config(2)).unwrap();

    let element = exec.get_mut::<UniformBufferObject<f32>>(ubo).unwrap();
    element.ubo = 9.0;
    element.update(1).unwrap();
    assert!(matches!(
        element.update(7),
        Err(GraphError::PathOutOfRange { path: 7, .. })
    ));

    exec.destroy(&ctx);
    ctx.destroy();
}
