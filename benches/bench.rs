use std::{hint::black_box, time::Duration};

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

use stevedore::cbor::{self, Value};

fn typed_tree(entries: usize) -> Value {
    let mut map = Vec::with_capacity(entries);
    for i in 0..entries {
        map.push((
            Value::Text(format!("field{i}")),
            Value::Array(vec![
                Value::Uint(i as u64),
                Value::Text("payload".to_string()),
                Value::Bool(i % 2 == 0),
                Value::F64(i as f64 * 0.5),
            ]),
        ));
    }
    Value::Map(map)
}

fn bench_cbor_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("cbor_encode");
    group.measurement_time(Duration::from_secs(3));

    for entries in [4usize, 64, 1024] {
        let value = typed_tree(entries);
        group.bench_with_input(BenchmarkId::new("map", entries), &value, |b, input| {
            b.iter(|| {
                let bytes = cbor::encode(black_box(input));
                black_box(bytes);
            });
        });
    }

    group.finish();
}

fn bench_cbor_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("cbor_decode");
    group.measurement_time(Duration::from_secs(3));

    for entries in [4usize, 64, 1024] {
        let bytes = cbor::encode(&typed_tree(entries));
        group.bench_with_input(BenchmarkId::new("map", entries), &bytes, |b, input| {
            b.iter(|| {
                let value = cbor::decode(black_box(input)).expect("bench input must decode");
                black_box(value);
            });
        });
    }

    group.finish();
}

fn bench_cbor_integers(c: &mut Criterion) {
    let mut group = c.benchmark_group("cbor_integers");
    group.measurement_time(Duration::from_secs(3));

    let values: Vec<Value> = (0..1024).map(|i| Value::integer(i * 977)).collect();
    let array = Value::Array(values);
    let encoded = cbor::encode(&array);

    group.bench_function("encode_1024", |b| {
        b.iter(|| black_box(cbor::encode(black_box(&array))));
    });
    group.bench_function("decode_1024", |b| {
        b.iter(|| black_box(cbor::decode(black_box(&encoded)).expect("must decode")));
    });

    group.finish();
}

criterion_group!(benches, bench_cbor_encode, bench_cbor_decode, bench_cbor_integers);
criterion_main!(benches);
