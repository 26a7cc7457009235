use criterion::{Criterion, black_box, criterion_group, criterion_main};

use strata_batch::{Batch, ColumnSpec, DataType, JoinKeySchema, KeyColumn, Value};
use strata_join::{
    BuildSide, CollectSink, HashJoinDesc, HashJoinEngine, JoinType, VecBatchSource,
};

fn specs() -> Vec<ColumnSpec> {
    vec![
        ColumnSpec::new("k", DataType::Int),
        ColumnSpec::new("v", DataType::Int),
    ]
}

fn make_batches(rows: usize, key_domain: i64, salt: i64) -> Vec<Batch> {
    let specs = specs();
    (0..rows)
        .collect::<Vec<_>>()
        .chunks(1024)
        .map(|chunk| {
            let rows: Vec<Vec<Value>> = chunk
                .iter()
                .map(|&n| {
                    let id = n as i64 + salt;
                    vec![Value::Int(id % key_domain), Value::Int(id)]
                })
                .collect();
            Batch::from_rows(&specs, &rows).expect("bench batch")
        })
        .collect()
}

fn run(join_type: JoinType, concurrency: usize, build_rows: usize, probe_rows: usize) -> usize {
    let keys = JoinKeySchema::new(vec![KeyColumn::new(0, DataType::Int)]);
    let desc = HashJoinDesc::new(
        join_type,
        BuildSide::Right,
        specs(),
        specs(),
        keys.clone(),
        keys,
        concurrency,
    );
    let mut engine = HashJoinEngine::new(desc).expect("engine");
    engine
        .build(&mut VecBatchSource::new(make_batches(build_rows, 4096, 0)))
        .expect("build");
    let sink = CollectSink::new();
    engine
        .probe(
            &mut VecBatchSource::new(make_batches(probe_rows, 4096, 17)),
            &sink,
        )
        .expect("probe");
    sink.take_batches().iter().map(Batch::num_rows).sum()
}

fn bench_hash_join(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_join");
    group.sample_size(10);

    group.bench_function("inner_32k_x_32k_1_thread", |b| {
        b.iter(|| black_box(run(JoinType::Inner, 1, 32 * 1024, 32 * 1024)));
    });
    group.bench_function("inner_32k_x_32k_4_threads", |b| {
        b.iter(|| black_box(run(JoinType::Inner, 4, 32 * 1024, 32 * 1024)));
    });
    group.bench_function("right_outer_32k_x_32k_4_threads", |b| {
        b.iter(|| black_box(run(JoinType::RightOuter, 4, 32 * 1024, 32 * 1024)));
    });

    group.finish();
}

criterion_group!(benches, bench_hash_join);
criterion_main!(benches);
