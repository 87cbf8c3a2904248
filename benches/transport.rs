use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use simlink::field::{FieldValue, RemoteField, SharedField};

fn bench_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish");
    for &count in &[64usize, 1024, 16384] {
        let positions = vec![[1.0f64, 2.0, 3.0]; count];
        let value = FieldValue::vec3s(&positions);
        let field = SharedField::create("bench_positions", &value).unwrap();

        group.throughput(Throughput::Bytes(value.bytes().len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &value, |b, value| {
            b.iter(|| field.publish(black_box(value)).unwrap());
        });
    }
    group.finish();
}

fn bench_observe(c: &mut Criterion) {
    let mut group = c.benchmark_group("observe");
    for &count in &[64usize, 1024, 16384] {
        let positions = vec![[1.0f64, 2.0, 3.0]; count];
        let value = FieldValue::vec3s(&positions);
        let field = SharedField::create("bench_positions", &value).unwrap();
        let remote = RemoteField::open(field.describe()).unwrap();

        group.throughput(Throughput::Bytes(value.bytes().len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &remote, |b, remote| {
            b.iter(|| black_box(remote.value()));
        });
    }
    group.finish();
}

fn bench_publish_observe_cycle(c: &mut Criterion) {
    let positions = vec![[1.0f64, 2.0, 3.0]; 1024];
    let value = FieldValue::vec3s(&positions);
    let field = SharedField::create("bench_positions", &value).unwrap();
    let remote = RemoteField::open(field.describe()).unwrap();

    c.bench_function("publish_observe_cycle", |b| {
        b.iter(|| {
            field.publish(black_box(&value)).unwrap();
            let observed = remote.value();
            field.clear_dirty();
            black_box(observed)
        });
    });
}

criterion_group!(
    benches,
    bench_publish,
    bench_observe,
    bench_publish_observe_cycle
);
criterion_main!(benches);
