use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use hexkernel::{Attribute, Kernel, KernelConfig, MessageKind, ObjectType, Payload, SubType};

fn kernel() -> Kernel {
    Kernel::init(KernelConfig {
        lock_pages: false,
        ..KernelConfig::default()
    })
    .unwrap()
}

fn benchmark_encrypt(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");

    let kernel = kernel();
    let ctx = kernel
        .create_object(ObjectType::Context, SubType::CTX_CONV, 0)
        .unwrap();
    kernel
        .send_message(ctx, MessageKind::CtxGenKey, &mut Payload::None, 0)
        .unwrap();

    let sizes = [("16B", 16), ("1KB", 1024), ("10KB", 10 * 1024)];

    for (name, size) in sizes {
        let mut buffer = vec![0u8; size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("encrypt", name), &size, |b, &_size| {
            // Each pass re-encrypts the previous ciphertext; only the cost of
            // the dispatch and the cipher matters here.
            b.iter(|| kernel.encrypt(black_box(ctx), black_box(&mut buffer)).unwrap());
        });
    }

    // The ACL path alone: a status query that no object handler sees.
    group.bench_function("get_attribute", |b| {
        b.iter(|| {
            kernel
                .get_attribute(black_box(ctx), black_box(Attribute::Status))
                .unwrap()
        });
    });
    group.finish();
}

fn benchmark_lifecycle(c: &mut Criterion) {
    let kernel = kernel();

    c.bench_function("create_destroy", |b| {
        b.iter(|| {
            let handle = kernel
                .create_object(black_box(ObjectType::Context), SubType::CTX_HASH, 0)
                .unwrap();
            kernel.destroy_object(handle).unwrap();
        });
    });
}

criterion_group!(benches, benchmark_encrypt, benchmark_lifecycle);
criterion_main!(benches);
