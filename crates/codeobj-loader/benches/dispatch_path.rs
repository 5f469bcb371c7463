//! Launch hot-path benchmarks
//!
//! Measures the per-launch work the loader does before handing a packet to
//! the runtime:
//! - Argument packing against a cached layout
//! - Extra-buffer descriptor validation
//! - Dispatch packet construction

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use codeobj_loader::kernarg::{pack_args, LAUNCH_PARAM_BUFFER_POINTER, LAUNCH_PARAM_BUFFER_SIZE, LAUNCH_PARAM_END};
use codeobj_loader::{ArgInfo, ArgLayoutCache, Dim3, DispatchPacket, FlushMode, FunctionSymbol, KernelArgLayout, KernelArgs};

fn mixed_args(count: usize) -> Vec<ArgInfo> {
    (0..count)
        .map(|i| if i % 2 == 0 { ArgInfo::of::<u64>() } else { ArgInfo::of::<u32>() })
        .collect()
}

fn mixed_params(args: &[ArgInfo]) -> Vec<Vec<u8>> {
    args.iter().map(|arg| vec![0xab; arg.size]).collect()
}

fn benchmark_layout_pack(c: &mut Criterion) {
    let mut group = c.benchmark_group("layout_pack");

    for count in [2, 8, 32] {
        let args = mixed_args(count);
        let owned = mixed_params(&args);
        let params: Vec<&[u8]> = owned.iter().map(Vec::as_slice).collect();

        group.bench_with_input(BenchmarkId::new("cached_layout", count), &count, |b, _| {
            let layout = KernelArgLayout::new(args.clone()).unwrap();
            b.iter(|| black_box(layout.pack(black_box(&params)).unwrap()));
        });

        group.bench_with_input(BenchmarkId::new("pack_args", count), &count, |b, _| {
            let cache = ArgLayoutCache::new();
            cache.declare("k", args.clone());
            let kernel_args = KernelArgs::params(&params);
            b.iter(|| black_box(pack_args("k", &kernel_args, &cache).unwrap().as_bytes().len()));
        });
    }

    group.finish();
}

fn benchmark_extra_buffer(c: &mut Criterion) {
    let buffer = vec![0u8; 256];
    let words = [
        LAUNCH_PARAM_BUFFER_POINTER,
        buffer.as_ptr() as usize,
        LAUNCH_PARAM_BUFFER_SIZE,
        buffer.len(),
        LAUNCH_PARAM_END,
    ];
    let cache = ArgLayoutCache::new();

    c.bench_function("extra_buffer_passthrough", |b| {
        // SAFETY: `words` describes `buffer`, which lives for the whole benchmark.
        let args = unsafe { KernelArgs::extra(&words) };
        b.iter(|| black_box(pack_args("k", &args, &cache).unwrap().as_bytes().len()));
    });
}

fn benchmark_packet_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_build");
    let function = FunctionSymbol::new("k", 0x7000_0000, 1024, 64, 24);

    for mode in [FlushMode::System, FlushMode::Agent] {
        group.bench_with_input(BenchmarkId::new("for_kernel", format!("{mode:?}")), &mode, |b, &mode| {
            b.iter(|| {
                black_box(
                    DispatchPacket::for_kernel(
                        &function,
                        black_box(Dim3::new(4096, 64, 1)),
                        black_box(Dim3::new(256, 1, 1)),
                        512,
                        mode,
                    )
                    .unwrap(),
                )
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_layout_pack,
    benchmark_extra_buffer,
    benchmark_packet_build
);
criterion_main!(benches);
