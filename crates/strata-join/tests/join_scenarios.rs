//! End-to-end join scenarios: every join type, residual predicates,
//! composite keys, null semantics, cancellation, quotas, and batching.
//!
//! Output rows are the full `left ++ right` column set for pair-emitting
//! joins and one side's columns for semi/anti joins; comparisons are
//! multiset-based since output order across workers is unspecified.

mod common;

use std::sync::Arc;

use common::{
    ColumnGreaterThan, assert_same_rows, batch_of, i, int_text_specs, null, run_join, sorted, t,
};
use strata_batch::{Batch, ColumnSpec, DataType, JoinKeySchema, KeyColumn, Value};
use strata_error::StrataError;
use strata_join::{
    BuildSide, CollectSink, HashJoinDesc, HashJoinEngine, JoinType, QuotaTracker, ResidualDesc,
    VecBatchSource,
};

fn int_key() -> JoinKeySchema {
    JoinKeySchema::new(vec![KeyColumn::new(0, DataType::Int)])
}

/// Build `[(1,a),(2,b),(2,c)]`, probe `[(2,X),(3,Y)]` on the int key.
fn small_desc(join_type: JoinType, build_side: BuildSide, concurrency: usize) -> HashJoinDesc {
    HashJoinDesc::new(
        join_type,
        build_side,
        int_text_specs(),
        int_text_specs(),
        int_key(),
        int_key(),
        concurrency,
    )
}

fn small_build() -> Vec<Batch> {
    vec![batch_of(
        &int_text_specs(),
        &[
            vec![i(1), t("a")],
            vec![i(2), t("b")],
            vec![i(2), t("c")],
        ],
    )]
}

fn small_probe() -> Vec<Batch> {
    vec![batch_of(
        &int_text_specs(),
        &[vec![i(2), t("X")], vec![i(3), t("Y")]],
    )]
}

#[test]
fn inner_single_int_key() {
    let rows = run_join(
        small_desc(JoinType::Inner, BuildSide::Right, 2),
        small_build(),
        small_probe(),
        None,
    )
    .unwrap();
    assert_same_rows(
        rows,
        vec![
            vec![i(2), t("X"), i(2), t("b")],
            vec![i(2), t("X"), i(2), t("c")],
        ],
    );
}

#[test]
fn left_outer_probe_is_left() {
    let rows = run_join(
        small_desc(JoinType::LeftOuter, BuildSide::Right, 2),
        small_build(),
        small_probe(),
        None,
    )
    .unwrap();
    assert_same_rows(
        rows,
        vec![
            vec![i(2), t("X"), i(2), t("b")],
            vec![i(2), t("X"), i(2), t("c")],
            vec![i(3), t("Y"), null(), null()],
        ],
    );
}

#[test]
fn left_anti() {
    let rows = run_join(
        small_desc(JoinType::LeftAnti, BuildSide::Right, 2),
        small_build(),
        small_probe(),
        None,
    )
    .unwrap();
    assert_same_rows(rows, vec![vec![i(3), t("Y")]]);
}

#[test]
fn left_semi() {
    let rows = run_join(
        small_desc(JoinType::LeftSemi, BuildSide::Right, 2),
        small_build(),
        small_probe(),
        None,
    )
    .unwrap();
    assert_same_rows(rows, vec![vec![i(2), t("X")]]);
}

#[test]
fn right_outer_build_is_right() {
    let rows = run_join(
        small_desc(JoinType::RightOuter, BuildSide::Right, 2),
        small_build(),
        small_probe(),
        None,
    )
    .unwrap();
    assert_same_rows(
        rows,
        vec![
            vec![i(2), t("X"), i(2), t("b")],
            vec![i(2), t("X"), i(2), t("c")],
            vec![null(), null(), i(1), t("a")],
        ],
    );
}

#[test]
fn right_semi_build_is_right() {
    let rows = run_join(
        small_desc(JoinType::RightSemi, BuildSide::Right, 2),
        small_build(),
        small_probe(),
        None,
    )
    .unwrap();
    assert_same_rows(rows, vec![vec![i(2), t("b")], vec![i(2), t("c")]]);
}

#[test]
fn right_anti_build_is_right() {
    let rows = run_join(
        small_desc(JoinType::RightAnti, BuildSide::Right, 2),
        small_build(),
        small_probe(),
        None,
    )
    .unwrap();
    assert_same_rows(rows, vec![vec![i(1), t("a")]]);
}

#[test]
fn left_outer_build_is_left_uses_scan() {
    // The build side is the outer side: matched pairs stream out during
    // probing, unmatched build rows arrive from the scan-row-table pass.
    let rows = run_join(
        small_desc(JoinType::LeftOuter, BuildSide::Left, 2),
        small_build(),
        small_probe(),
        None,
    )
    .unwrap();
    assert_same_rows(
        rows,
        vec![
            vec![i(2), t("b"), i(2), t("X")],
            vec![i(2), t("c"), i(2), t("X")],
            vec![i(1), t("a"), null(), null()],
        ],
    );
}

#[test]
fn inner_with_residual_predicate() {
    let specs = vec![
        ColumnSpec::new("k", DataType::Int),
        ColumnSpec::new("v", DataType::Int),
    ];
    let desc = HashJoinDesc::new(
        JoinType::Inner,
        BuildSide::Right,
        specs.clone(),
        specs.clone(),
        int_key(),
        int_key(),
        2,
    )
    .with_residual(ResidualDesc {
        probe_cols: vec![1],
        build_cols: vec![1],
    });

    let build = vec![batch_of(
        &specs,
        &[
            vec![i(1), i(10)],
            vec![i(1), i(20)],
            vec![i(1), i(30)],
        ],
    )];
    let probe = vec![batch_of(&specs, &[vec![i(1), i(15)], vec![i(1), i(25)]])];

    // Candidate batch is [probe.v, build.v]; keep pairs with build.v >
    // probe.v.
    let rows = run_join(
        desc,
        build,
        probe,
        Some(Arc::new(ColumnGreaterThan { left: 1, right: 0 })),
    )
    .unwrap();
    assert_same_rows(
        rows,
        vec![
            vec![i(1), i(15), i(1), i(20)],
            vec![i(1), i(15), i(1), i(30)],
            vec![i(1), i(25), i(1), i(30)],
        ],
    );
}

#[test]
fn left_outer_with_residual_predicate() {
    // A probe row whose only key matches fail the predicate is unmatched.
    let specs = vec![
        ColumnSpec::new("k", DataType::Int),
        ColumnSpec::new("v", DataType::Int),
    ];
    let desc = HashJoinDesc::new(
        JoinType::LeftOuter,
        BuildSide::Right,
        specs.clone(),
        specs.clone(),
        int_key(),
        int_key(),
        2,
    )
    .with_residual(ResidualDesc {
        probe_cols: vec![1],
        build_cols: vec![1],
    });

    let build = vec![batch_of(&specs, &[vec![i(1), i(10)]])];
    let probe = vec![batch_of(&specs, &[vec![i(1), i(5)], vec![i(1), i(50)]])];

    let rows = run_join(
        desc,
        build,
        probe,
        Some(Arc::new(ColumnGreaterThan { left: 1, right: 0 })),
    )
    .unwrap();
    assert_same_rows(
        rows,
        vec![
            vec![i(1), i(5), i(1), i(10)],
            vec![i(1), i(50), null(), null()],
        ],
    );
}

#[test]
fn composite_variable_key_distinguishes_prefixes() {
    // Length-prefixed serialization keeps ("x") and ("xy") apart even when
    // the composite byte streams would otherwise collide.
    let specs = vec![
        ColumnSpec::new("k", DataType::Int),
        ColumnSpec::new("s", DataType::Text),
        ColumnSpec::new("v", DataType::Text),
    ];
    let keys = JoinKeySchema::new(vec![
        KeyColumn::new(0, DataType::Int),
        KeyColumn::new(1, DataType::Text),
    ]);
    let desc = HashJoinDesc::new(
        JoinType::Inner,
        BuildSide::Right,
        specs.clone(),
        specs.clone(),
        keys.clone(),
        keys,
        2,
    );

    let build = vec![batch_of(
        &specs,
        &[
            vec![i(1), t("x"), t("a")],
            vec![i(1), t("xy"), t("b")],
        ],
    )];
    let probe = vec![batch_of(&specs, &[vec![i(1), t("x"), t("P")]])];

    let rows = run_join(desc, build, probe, None).unwrap();
    assert_same_rows(
        rows,
        vec![vec![i(1), t("x"), t("P"), i(1), t("x"), t("a")]],
    );
}

#[test]
fn null_keys_never_match_by_default() {
    let build = vec![batch_of(
        &int_text_specs(),
        &[vec![i(1), t("a")], vec![null(), t("b")]],
    )];
    let probe = vec![batch_of(
        &int_text_specs(),
        &[vec![null(), t("X")], vec![i(1), t("Y")]],
    )];

    let rows = run_join(
        small_desc(JoinType::Inner, BuildSide::Right, 2),
        build.clone(),
        probe.clone(),
        None,
    )
    .unwrap();
    assert_same_rows(rows, vec![vec![i(1), t("Y"), i(1), t("a")]]);

    // The null-keyed probe row still surfaces from a left outer join.
    let rows = run_join(
        small_desc(JoinType::LeftOuter, BuildSide::Right, 2),
        build,
        probe,
        None,
    )
    .unwrap();
    assert_same_rows(
        rows,
        vec![
            vec![i(1), t("Y"), i(1), t("a")],
            vec![null(), t("X"), null(), null()],
        ],
    );
}

#[test]
fn null_eq_null_joins_nulls_when_asked() {
    let keys = JoinKeySchema::new(vec![
        KeyColumn::new(0, DataType::Int).with_null_eq_null(),
    ]);
    let desc = HashJoinDesc::new(
        JoinType::Inner,
        BuildSide::Right,
        int_text_specs(),
        int_text_specs(),
        keys.clone(),
        keys,
        2,
    );
    let build = vec![batch_of(
        &int_text_specs(),
        &[vec![null(), t("b")], vec![i(0), t("z")]],
    )];
    let probe = vec![batch_of(&int_text_specs(), &[vec![null(), t("X")]])];

    let rows = run_join(desc, build, probe, None).unwrap();
    // Null joins null but not a genuine zero.
    assert_same_rows(rows, vec![vec![null(), t("X"), null(), t("b")]]);
}

#[test]
fn right_outer_with_empty_probe_emits_all_build_rows() {
    let rows = run_join(
        small_desc(JoinType::RightOuter, BuildSide::Right, 2),
        small_build(),
        Vec::new(),
        None,
    )
    .unwrap();
    assert_same_rows(
        rows,
        vec![
            vec![null(), null(), i(1), t("a")],
            vec![null(), null(), i(2), t("b")],
            vec![null(), null(), i(2), t("c")],
        ],
    );
}

#[test]
fn empty_build_side() {
    let rows = run_join(
        small_desc(JoinType::Inner, BuildSide::Right, 2),
        Vec::new(),
        small_probe(),
        None,
    )
    .unwrap();
    assert!(rows.is_empty());

    let rows = run_join(
        small_desc(JoinType::LeftAnti, BuildSide::Right, 2),
        Vec::new(),
        small_probe(),
        None,
    )
    .unwrap();
    assert_same_rows(rows, vec![vec![i(2), t("X")], vec![i(3), t("Y")]]);
}

#[test]
fn output_batches_respect_capacity() {
    // One probe row fanning out against many duplicate build rows.
    let build_rows: Vec<Vec<Value>> = (0..100).map(|n| vec![i(7), t(&format!("b{n}"))]).collect();
    let build = vec![batch_of(&int_text_specs(), &build_rows)];
    let probe = vec![batch_of(&int_text_specs(), &[vec![i(7), t("X")]])];

    let desc = small_desc(JoinType::Inner, BuildSide::Right, 1).with_output_batch_rows(7);
    let mut engine = HashJoinEngine::new(desc).unwrap();
    engine.build(&mut VecBatchSource::new(build)).unwrap();
    let sink = CollectSink::new();
    engine
        .probe(&mut VecBatchSource::new(probe), &sink)
        .unwrap();

    let batches = sink.take_batches();
    let total: usize = batches.iter().map(Batch::num_rows).sum();
    assert_eq!(total, 100);
    assert!(batches.len() > 1);
    assert!(batches.iter().all(|batch| batch.num_rows() <= 7));
}

#[test]
fn multi_batch_parallel_join_matches_single_threaded() {
    let specs = int_text_specs();
    let make_batches = |salt: i64, batches: usize, rows: usize| -> Vec<Batch> {
        (0..batches)
            .map(|b| {
                let rows: Vec<Vec<Value>> = (0..rows)
                    .map(|r| {
                        let id = salt + (b * rows + r) as i64;
                        vec![i(id % 61), t(&format!("p{id}"))]
                    })
                    .collect();
                batch_of(&specs, &rows)
            })
            .collect()
    };

    let single = run_join(
        small_desc(JoinType::LeftOuter, BuildSide::Right, 1),
        make_batches(0, 4, 300),
        make_batches(17, 4, 250),
        None,
    )
    .unwrap();
    let parallel = run_join(
        small_desc(JoinType::LeftOuter, BuildSide::Right, 4),
        make_batches(0, 4, 300),
        make_batches(17, 4, 250),
        None,
    )
    .unwrap();

    // Left outer output covers every probe row at least once.
    assert!(parallel.len() >= 1000);
    assert_eq!(sorted(single), sorted(parallel));
}

#[test]
fn multi_owner_linking_regime_joins_correctly() {
    // More workers than partitions forces the CAS insert path.
    let desc = small_desc(JoinType::Inner, BuildSide::Right, 8).with_partitions(2);
    let specs = int_text_specs();
    let build_rows: Vec<Vec<Value>> = (0..2000).map(|n| vec![i(n % 50), t(&format!("b{n}"))]).collect();
    let probe_rows: Vec<Vec<Value>> = (0..500).map(|n| vec![i(n % 100), t(&format!("p{n}"))]).collect();

    let rows = run_join(
        desc,
        vec![batch_of(&specs, &build_rows)],
        vec![batch_of(&specs, &probe_rows)],
        None,
    )
    .unwrap();

    // Keys 0..50 appear 40x on the build side; probe rows with key >= 50
    // match nothing.
    let expected: usize = probe_rows
        .iter()
        .filter(|row| matches!(row[0], Value::Int(k) if k < 50))
        .count()
        * 40;
    assert_eq!(rows.len(), expected);
}

#[test]
fn probe_before_build_is_rejected() {
    let mut engine =
        HashJoinEngine::new(small_desc(JoinType::Inner, BuildSide::Right, 2)).unwrap();
    let sink = CollectSink::new();
    let err = engine
        .probe(&mut VecBatchSource::new(Vec::new()), &sink)
        .unwrap_err();
    assert!(matches!(err, StrataError::InvariantViolated(_)));
}

#[test]
fn build_twice_is_rejected() {
    let mut engine =
        HashJoinEngine::new(small_desc(JoinType::Inner, BuildSide::Right, 2)).unwrap();
    engine.build(&mut VecBatchSource::new(small_build())).unwrap();
    let err = engine
        .build(&mut VecBatchSource::new(small_build()))
        .unwrap_err();
    assert!(matches!(err, StrataError::InvariantViolated(_)));
}

#[test]
fn missing_residual_filter_is_rejected() {
    let desc = small_desc(JoinType::Inner, BuildSide::Right, 2).with_residual(ResidualDesc {
        probe_cols: vec![0],
        build_cols: vec![0],
    });
    let mut engine = HashJoinEngine::new(desc).unwrap();
    engine.build(&mut VecBatchSource::new(small_build())).unwrap();
    let sink = CollectSink::new();
    let err = engine
        .probe(&mut VecBatchSource::new(small_probe()), &sink)
        .unwrap_err();
    assert!(matches!(err, StrataError::InvariantViolated(_)));
}

#[test]
fn cancellation_stops_the_probe() {
    let mut engine =
        HashJoinEngine::new(small_desc(JoinType::Inner, BuildSide::Right, 2)).unwrap();
    engine.build(&mut VecBatchSource::new(small_build())).unwrap();
    engine.cancel_token().cancel();
    let sink = CollectSink::new();
    let err = engine
        .probe(&mut VecBatchSource::new(small_probe()), &sink)
        .unwrap_err();
    assert!(matches!(err, StrataError::Cancelled));
}

#[test]
fn quota_refusal_surfaces_from_build() {
    let desc = small_desc(JoinType::Inner, BuildSide::Right, 2);
    let mut engine = HashJoinEngine::new(desc)
        .unwrap()
        .with_memory_tracker(Arc::new(QuotaTracker::new(16)));
    let err = engine
        .build(&mut VecBatchSource::new(small_build()))
        .unwrap_err();
    assert!(matches!(err, StrataError::OutOfQuota { .. }));
}

#[test]
fn quota_released_on_engine_drop() {
    let tracker = Arc::new(QuotaTracker::new(1 << 20));
    {
        let desc = small_desc(JoinType::Inner, BuildSide::Right, 2);
        let mut engine = HashJoinEngine::new(desc)
            .unwrap()
            .with_memory_tracker(tracker.clone());
        engine.build(&mut VecBatchSource::new(small_build())).unwrap();
        assert!(tracker.used() > 0);
    }
    assert_eq!(tracker.used(), 0);
}
