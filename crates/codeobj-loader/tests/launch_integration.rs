//! Integration tests for kernel launch: argument packing, packet contents,
//! completion events and launch hooks.

mod common;

use std::sync::Arc;

use parking_lot::Mutex;

use codeobj_loader::dispatch::{FENCE_SCOPE_AGENT, FENCE_SCOPE_SYSTEM, PACKET_TYPE_KERNEL_DISPATCH};
use codeobj_loader::backends::RuntimeCall;
use codeobj_loader::kernarg::{LAUNCH_PARAM_BUFFER_POINTER, LAUNCH_PARAM_BUFFER_SIZE, LAUNCH_PARAM_END};
use codeobj_loader::{
    ArgInfo, Device, Dim3, ErrorKind, Event, EventRole, FaultPoint, FlushMode, FunctionSymbol, GlobalLaunch,
    KernargReader, KernelArgs, LaunchGeometry, LaunchHooks, LoaderConfig, Module, ModuleError, ModuleLoader,
    QueueHandle,
};
use common::{device_object, Fixture, DEFAULT_QUEUE};

fn loaded(fx: &Fixture) -> (Module, Arc<FunctionSymbol>) {
    let module = fx.loader.load_data(&device_object().build()).unwrap();
    let vadd = fx.loader.get_function(&module, "vadd").unwrap();
    fx.loader.register_kernel_args(
        "vadd",
        vec![
            ArgInfo::of::<u64>().named("a"),
            ArgInfo::of::<u64>().named("b"),
            ArgInfo::of::<u32>().named("n"),
        ],
    );
    (module, vadd)
}

#[test]
fn test_structured_arguments_are_packed_at_layout_offsets() {
    let fx = Fixture::new();
    let (_module, vadd) = loaded(&fx);

    let a = 0x1000u64.to_ne_bytes();
    let b = 0x2000u64.to_ne_bytes();
    let n = 77u32.to_ne_bytes();
    let params: [&[u8]; 3] = [&a, &b, &n];
    fx.loader
        .launch_kernel(&vadd, Dim3::linear(2), Dim3::linear(64), 0, None, &KernelArgs::params(&params))
        .unwrap();

    let submitted = fx.runtime.last_dispatch().unwrap();
    let layout = fx.loader.layouts().get("vadd").unwrap();
    assert_eq!(submitted.kernargs.len(), layout.total_size());
    assert_eq!(layout.total_size(), 24);

    let reader = KernargReader::new(&submitted.kernargs, &layout);
    assert_eq!(reader.read_u64(0), Some(0x1000));
    assert_eq!(reader.read_u64(1), Some(0x2000));
    assert_eq!(reader.read_u32(2), Some(77));
    assert_eq!(submitted.queue, DEFAULT_QUEUE);
}

#[test]
fn test_extra_buffer_is_passed_through() {
    let fx = Fixture::new();
    let (_module, vadd) = loaded(&fx);

    let packed: Vec<u8> = (0u8..24).collect();
    let words = [
        LAUNCH_PARAM_BUFFER_POINTER,
        packed.as_ptr() as usize,
        LAUNCH_PARAM_BUFFER_SIZE,
        packed.len(),
        LAUNCH_PARAM_END,
    ];
    // SAFETY: `words` points at `packed`, which outlives the launch.
    let args = unsafe { KernelArgs::extra(&words) };
    fx.loader
        .launch_kernel(&vadd, Dim3::linear(1), Dim3::linear(32), 0, None, &args)
        .unwrap();

    assert_eq!(fx.runtime.last_dispatch().unwrap().kernargs, packed);
}

#[test]
fn test_malformed_extra_buffer_is_rejected_before_dispatch() {
    let fx = Fixture::new();
    let (_module, vadd) = loaded(&fx);

    let packed = [0u8; 8];
    let size_first = [
        LAUNCH_PARAM_BUFFER_SIZE,
        packed.len(),
        LAUNCH_PARAM_BUFFER_POINTER,
        packed.as_ptr() as usize,
        LAUNCH_PARAM_END,
    ];
    let args = unsafe { KernelArgs::extra(&size_first) };
    let err = fx
        .loader
        .launch_kernel(&vadd, Dim3::linear(1), Dim3::linear(32), 0, None, &args)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidValue);
    assert!(fx.runtime.dispatches().is_empty());
}

#[test]
fn test_argument_mode_errors() {
    let fx = Fixture::new();
    let (_module, vadd) = loaded(&fx);
    let geometry = (Dim3::linear(1), Dim3::linear(32));

    let err = fx
        .loader
        .launch_kernel(&vadd, geometry.0, geometry.1, 0, None, &KernelArgs::none())
        .unwrap_err();
    assert!(matches!(err, ModuleError::MissingKernelArgs));

    let n = 1u32.to_ne_bytes();
    let params: [&[u8]; 1] = [&n];
    let words = [LAUNCH_PARAM_BUFFER_POINTER, 0, LAUNCH_PARAM_BUFFER_SIZE, 0, LAUNCH_PARAM_END];
    let both = unsafe { KernelArgs::params(&params).with_extra(&words) };
    let err = fx
        .loader
        .launch_kernel(&vadd, geometry.0, geometry.1, 0, None, &both)
        .unwrap_err();
    assert!(matches!(err, ModuleError::InvalidLaunchConfig(_)));
    assert!(fx.runtime.dispatches().is_empty());
}

#[test]
fn test_structured_arguments_need_a_layout() {
    let fx = Fixture::new();
    let module = fx.loader.load_data(&device_object().build()).unwrap();
    let scale = fx.loader.get_function(&module, "scale").unwrap();

    let x = 1.5f32.to_ne_bytes();
    let params: [&[u8]; 1] = [&x];
    let err = fx
        .loader
        .launch_kernel(&scale, Dim3::linear(1), Dim3::linear(1), 0, None, &KernelArgs::params(&params))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotInitialized);
}

#[test]
fn test_wrong_argument_count_is_invalid() {
    let fx = Fixture::new();
    let (_module, vadd) = loaded(&fx);
    let a = 0u64.to_ne_bytes();
    let params: [&[u8]; 1] = [&a];
    let err = fx
        .loader
        .launch_kernel(&vadd, Dim3::linear(1), Dim3::linear(1), 0, None, &KernelArgs::params(&params))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidValue);
}

#[test]
fn test_layouts_from_metadata_document() {
    let fx = Fixture::new();
    let module = fx.loader.load_data(&device_object().build()).unwrap();
    let scale = fx.loader.get_function(&module, "scale").unwrap();

    let count = fx
        .loader
        .register_kernel_metadata_json(
            r#"{"kernels":[{"name":"scale","args":[{"name":"x","type":"float","size":4,"align":4},{"name":"out","type":"float*","size":8,"align":8}]}]}"#,
        )
        .unwrap();
    assert_eq!(count, 1);

    let x = 2.0f32.to_ne_bytes();
    let out = 0xdead_0000u64.to_ne_bytes();
    let params: [&[u8]; 2] = [&x, &out];
    fx.loader
        .launch_kernel(&scale, Dim3::linear(1), Dim3::linear(1), 0, None, &KernelArgs::params(&params))
        .unwrap();

    let kernargs = fx.runtime.last_dispatch().unwrap().kernargs;
    assert_eq!(kernargs.len(), 16);
    assert_eq!(&kernargs[0..4], &x);
    assert_eq!(&kernargs[4..8], &[0; 4]);
    assert_eq!(&kernargs[8..16], &out);

    assert!(fx.loader.register_kernel_metadata_json("{not json").is_err());
}

#[test]
fn test_block_count_and_total_grid_conventions_agree() {
    let fx = Fixture::new();
    let (_module, vadd) = loaded(&fx);
    let a = 0u64.to_ne_bytes();
    let n = 0u32.to_ne_bytes();
    let params: [&[u8]; 3] = [&a, &a, &n];
    let args = KernelArgs::params(&params);

    fx.loader
        .launch_kernel(&vadd, Dim3::new(4, 1, 1), Dim3::new(32, 1, 1), 0, None, &args)
        .unwrap();
    fx.loader
        .launch_kernel_global(&vadd, &GlobalLaunch::new(Dim3::new(128, 1, 1), Dim3::new(32, 1, 1)), &args)
        .unwrap();

    let dispatches = fx.runtime.dispatches();
    let (by_blocks, by_total) = (&dispatches[0].packet, &dispatches[1].packet);
    assert_eq!(by_blocks.grid_size(), Dim3::new(128, 1, 1));
    assert_eq!(by_blocks.grid_size(), by_total.grid_size());
    assert_eq!(by_blocks.workgroup_size(), by_total.workgroup_size());
    assert_eq!(by_blocks.header, by_total.header);
    assert_eq!(by_blocks.kernel_object, by_total.kernel_object);
}

#[test]
fn test_packet_carries_kernel_requirements() {
    let fx = Fixture::new();
    fx.runtime.set_segment_sizes("vadd", 1024, 48);
    let (_module, vadd) = loaded(&fx);
    let a = 0u64.to_ne_bytes();
    let n = 0u32.to_ne_bytes();
    let params: [&[u8]; 3] = [&a, &a, &n];

    fx.loader
        .launch_kernel(
            &vadd,
            Dim3::new(8, 4, 2),
            Dim3::new(16, 8, 1),
            512,
            None,
            &KernelArgs::params(&params),
        )
        .unwrap();

    let packet = fx.runtime.last_dispatch().unwrap().packet;
    assert_eq!(packet.packet_type(), PACKET_TYPE_KERNEL_DISPATCH);
    assert!(packet.has_barrier());
    assert_eq!(packet.dimensions(), 3);
    assert_eq!(packet.workgroup_size(), Dim3::new(16, 8, 1));
    assert_eq!(packet.grid_size(), Dim3::new(128, 32, 2));
    assert_eq!(packet.group_segment_size, 1024 + 512);
    assert_eq!(packet.private_segment_size, 48);
    assert_eq!(packet.kernel_object, vadd.kernel_object());
    assert_eq!(packet.acquire_fence_scope(), FENCE_SCOPE_SYSTEM);
    assert_eq!(packet.release_fence_scope(), FENCE_SCOPE_SYSTEM);
    assert_ne!(packet.kernarg_address, 0);
    assert_eq!(packet.completion_signal, 0);
}

#[test]
fn test_agent_flush_mode_narrows_fences() {
    let fx = Fixture::with_config(LoaderConfig::default().with_flush_mode(FlushMode::Agent));
    let (_module, vadd) = loaded(&fx);
    let a = 0u64.to_ne_bytes();
    let n = 0u32.to_ne_bytes();
    let params: [&[u8]; 3] = [&a, &a, &n];
    fx.loader
        .launch_kernel(&vadd, Dim3::linear(1), Dim3::linear(1), 0, None, &KernelArgs::params(&params))
        .unwrap();

    let packet = fx.runtime.last_dispatch().unwrap().packet;
    assert_eq!(packet.acquire_fence_scope(), FENCE_SCOPE_AGENT);
    assert_eq!(packet.release_fence_scope(), FENCE_SCOPE_AGENT);
    assert!(packet.has_barrier());
}

#[test]
fn test_oversized_block_is_invalid_value() {
    let fx = Fixture::new();
    let (_module, vadd) = loaded(&fx);
    let a = 0u64.to_ne_bytes();
    let n = 0u32.to_ne_bytes();
    let params: [&[u8]; 3] = [&a, &a, &n];
    let err = fx
        .loader
        .launch_kernel(&vadd, Dim3::linear(1), Dim3::linear(70_000), 0, None, &KernelArgs::params(&params))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidValue);
    assert!(fx.runtime.dispatches().is_empty());
}

#[test]
fn test_events_receive_completion_handle() {
    let fx = Fixture::new();
    let (_module, vadd) = loaded(&fx);
    let a = 0u64.to_ne_bytes();
    let n = 0u32.to_ne_bytes();
    let params: [&[u8]; 3] = [&a, &a, &n];

    let start = Event::new();
    let stop = Event::new();
    let launch = GlobalLaunch::new(Dim3::linear(256), Dim3::linear(64))
        .queue(QueueHandle(0x77))
        .start_event(&start)
        .stop_event(&stop);
    fx.loader
        .launch_kernel_global(&vadd, &launch, &KernelArgs::params(&params))
        .unwrap();

    let submitted = fx.runtime.last_dispatch().unwrap();
    let start = start.record().unwrap();
    let stop = stop.record().unwrap();
    assert_eq!(start.role, EventRole::Start);
    assert_eq!(stop.role, EventRole::Stop);
    assert_eq!(start.handle, stop.handle);
    assert_eq!(start.handle.id(), submitted.packet.completion_signal);
    assert_eq!(start.queue, QueueHandle(0x77));
    assert_eq!(submitted.queue, QueueHandle(0x77));
}

#[test]
fn test_stop_event_alone_requests_completion() {
    let fx = Fixture::new();
    let (_module, vadd) = loaded(&fx);
    let a = 0u64.to_ne_bytes();
    let n = 0u32.to_ne_bytes();
    let params: [&[u8]; 3] = [&a, &a, &n];

    let stop = Event::new();
    let launch = GlobalLaunch::new(Dim3::linear(64), Dim3::linear(64)).stop_event(&stop);
    fx.loader
        .launch_kernel_global(&vadd, &launch, &KernelArgs::params(&params))
        .unwrap();
    assert!(stop.is_attached());
    assert_ne!(fx.runtime.last_dispatch().unwrap().packet.completion_signal, 0);
}

#[derive(Default)]
struct RecordingHooks {
    calls: Mutex<Vec<String>>,
}

impl LaunchHooks for RecordingHooks {
    fn pre_launch(
        &self,
        device: &Device,
        _requested: Option<QueueHandle>,
        geometry: &mut LaunchGeometry,
        kernel: &str,
    ) -> codeobj_loader::Result<QueueHandle> {
        self.calls.lock().push(format!("pre:{kernel}"));
        geometry.dynamic_shared_mem += 64;
        Ok(QueueHandle(device.default_queue.id() + 1))
    }

    fn post_launch(&self, kernel: &str, queue: QueueHandle, geometry: &LaunchGeometry) {
        self.calls
            .lock()
            .push(format!("post:{kernel}:{}:{}", queue.id(), geometry.dynamic_shared_mem));
    }
}

#[test]
fn test_hooks_choose_queue_and_see_launch() {
    let hooks = Arc::new(RecordingHooks::default());
    let mut fx = Fixture::new();
    fx.loader = ModuleLoader::new(fx.runtime.clone(), fx.devices.clone(), LoaderConfig::default())
        .with_hooks(hooks.clone());

    let (_module, vadd) = loaded(&fx);
    let a = 0u64.to_ne_bytes();
    let n = 0u32.to_ne_bytes();
    let params: [&[u8]; 3] = [&a, &a, &n];
    fx.loader
        .launch_kernel(&vadd, Dim3::linear(1), Dim3::linear(1), 0, None, &KernelArgs::params(&params))
        .unwrap();

    let submitted = fx.runtime.last_dispatch().unwrap();
    assert_eq!(submitted.queue, QueueHandle(DEFAULT_QUEUE.id() + 1));
    // The hook's rewrite reaches post_launch but not the packet.
    assert_eq!(submitted.packet.group_segment_size, 0);
    assert_eq!(
        *hooks.calls.lock(),
        vec!["pre:vadd".to_string(), format!("post:vadd:{}:64", DEFAULT_QUEUE.id() + 1)]
    );
}

struct ResizingHooks;

impl LaunchHooks for ResizingHooks {
    fn pre_launch(
        &self,
        device: &Device,
        requested: Option<QueueHandle>,
        geometry: &mut LaunchGeometry,
        _kernel: &str,
    ) -> codeobj_loader::Result<QueueHandle> {
        geometry.grid = Dim3::linear(1);
        geometry.block = Dim3::linear(70_000);
        geometry.dynamic_shared_mem = usize::MAX;
        Ok(requested.unwrap_or(device.default_queue))
    }

    fn post_launch(&self, _kernel: &str, _queue: QueueHandle, _geometry: &LaunchGeometry) {}
}

#[test]
fn test_hook_rewrites_do_not_reach_packet() {
    let mut fx = Fixture::new();
    fx.loader = ModuleLoader::new(fx.runtime.clone(), fx.devices.clone(), LoaderConfig::default())
        .with_hooks(Arc::new(ResizingHooks));

    let (_module, vadd) = loaded(&fx);
    let a = 0u64.to_ne_bytes();
    let n = 0u32.to_ne_bytes();
    let params: [&[u8]; 3] = [&a, &a, &n];
    fx.loader
        .launch_kernel(&vadd, Dim3::linear(4), Dim3::linear(64), 128, None, &KernelArgs::params(&params))
        .unwrap();

    let packet = fx.runtime.last_dispatch().unwrap().packet;
    assert_eq!(packet.grid_size(), Dim3::linear(256));
    assert_eq!(packet.workgroup_size(), Dim3::linear(64));
    assert_eq!(packet.group_segment_size, 128);
}

#[test]
fn test_failed_dispatch_still_runs_post_launch() {
    let hooks = Arc::new(RecordingHooks::default());
    let mut fx = Fixture::new();
    fx.loader = ModuleLoader::new(fx.runtime.clone(), fx.devices.clone(), LoaderConfig::default())
        .with_hooks(hooks.clone());

    let (_module, vadd) = loaded(&fx);
    let a = 0u64.to_ne_bytes();
    let n = 0u32.to_ne_bytes();
    let params: [&[u8]; 3] = [&a, &a, &n];
    fx.runtime.inject_fault(FaultPoint::Dispatch);
    for _ in 0..2 {
        let err = fx
            .loader
            .launch_kernel(&vadd, Dim3::linear(1), Dim3::linear(1), 0, None, &KernelArgs::params(&params))
            .unwrap_err();
        assert!(matches!(err, ModuleError::Runtime(_)));
    }

    let post = format!("post:vadd:{}:64", DEFAULT_QUEUE.id() + 1);
    assert_eq!(
        *hooks.calls.lock(),
        vec!["pre:vadd".to_string(), post.clone(), "pre:vadd".to_string(), post]
    );
}

#[test]
fn test_invalid_packet_fails_before_hooks() {
    let hooks = Arc::new(RecordingHooks::default());
    let mut fx = Fixture::new();
    fx.loader = ModuleLoader::new(fx.runtime.clone(), fx.devices.clone(), LoaderConfig::default())
        .with_hooks(hooks.clone());

    let (_module, vadd) = loaded(&fx);
    let a = 0u64.to_ne_bytes();
    let n = 0u32.to_ne_bytes();
    let params: [&[u8]; 3] = [&a, &a, &n];
    let dispatches = fx.runtime.dispatches().len();
    for block in [Dim3::linear(70_000), Dim3::new(64, 0, 1)] {
        let launch = GlobalLaunch::new(Dim3::linear(64), block);
        let err = fx
            .loader
            .launch_kernel_global(&vadd, &launch, &KernelArgs::params(&params))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValue);
    }

    assert!(hooks.calls.lock().is_empty());
    assert_eq!(fx.runtime.dispatches().len(), dispatches);
}

#[test]
fn test_completion_released_when_events_drop() {
    let fx = Fixture::new();
    let (_module, vadd) = loaded(&fx);
    let a = 0u64.to_ne_bytes();
    let n = 0u32.to_ne_bytes();
    let params: [&[u8]; 3] = [&a, &a, &n];

    let start = Event::new();
    let stop = Event::new();
    let launch = GlobalLaunch::new(Dim3::linear(64), Dim3::linear(64))
        .start_event(&start)
        .stop_event(&stop);
    fx.loader
        .launch_kernel_global(&vadd, &launch, &KernelArgs::params(&params))
        .unwrap();
    assert_eq!(fx.runtime.outstanding_completions(), 1);

    drop(start);
    assert_eq!(fx.runtime.outstanding_completions(), 1);
    stop.reset();
    assert_eq!(fx.runtime.outstanding_completions(), 0);

    let released = fx
        .runtime
        .calls()
        .into_iter()
        .filter(|c| matches!(c, RuntimeCall::ReleaseCompletion(_)))
        .count();
    assert_eq!(released, 1);
}

#[test]
fn test_dispatch_failure_is_reported() {
    let fx = Fixture::new();
    let (_module, vadd) = loaded(&fx);
    fx.runtime.inject_fault(FaultPoint::Dispatch);
    let a = 0u64.to_ne_bytes();
    let n = 0u32.to_ne_bytes();
    let params: [&[u8]; 3] = [&a, &a, &n];
    let err = fx
        .loader
        .launch_kernel(&vadd, Dim3::linear(1), Dim3::linear(1), 0, None, &KernelArgs::params(&params))
        .unwrap_err();
    assert!(matches!(err, ModuleError::Runtime(_)));
}

#[test]
fn test_launch_requires_current_device() {
    let fx = Fixture::new();
    let (_module, vadd) = loaded(&fx);
    fx.devices.clear_current();
    let a = 0u64.to_ne_bytes();
    let n = 0u32.to_ne_bytes();
    let params: [&[u8]; 3] = [&a, &a, &n];
    let err = fx
        .loader
        .launch_kernel(&vadd, Dim3::linear(1), Dim3::linear(1), 0, None, &KernelArgs::params(&params))
        .unwrap_err();
    assert!(matches!(err, ModuleError::InvalidContext));
}
