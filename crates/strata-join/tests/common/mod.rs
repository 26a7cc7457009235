//! Shared helpers for the join integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use strata_batch::{Batch, ColumnSpec, DataType, Value};
use strata_error::Result;
use strata_join::{
    CollectSink, HashJoinDesc, HashJoinEngine, ResidualFilter, VecBatchSource,
};

pub fn i(v: i64) -> Value {
    Value::Int(v)
}

pub fn t(s: &str) -> Value {
    Value::Text(s.to_owned())
}

pub fn null() -> Value {
    Value::Null
}

pub fn int_text_specs() -> Vec<ColumnSpec> {
    vec![
        ColumnSpec::new("k", DataType::Int),
        ColumnSpec::new("v", DataType::Text),
    ]
}

pub fn batch_of(specs: &[ColumnSpec], rows: &[Vec<Value>]) -> Batch {
    Batch::from_rows(specs, rows).expect("test batch")
}

/// Drive one full build + probe and collect every output row.
pub fn run_join(
    desc: HashJoinDesc,
    build: Vec<Batch>,
    probe: Vec<Batch>,
    residual: Option<Arc<dyn ResidualFilter>>,
) -> Result<Vec<Vec<Value>>> {
    let mut engine = HashJoinEngine::new(desc)?;
    if let Some(filter) = residual {
        engine = engine.with_residual_filter(filter);
    }
    engine.build(&mut VecBatchSource::new(build))?;
    let sink = CollectSink::new();
    engine.probe(&mut VecBatchSource::new(probe), &sink)?;

    let mut rows = Vec::new();
    for batch in sink.take_batches() {
        for row in 0..batch.num_rows() {
            rows.push(batch.row(row).expect("output row"));
        }
    }
    Ok(rows)
}

/// Canonical order for multiset comparison; output row order is
/// unspecified.
pub fn sorted(mut rows: Vec<Vec<Value>>) -> Vec<Vec<Value>> {
    rows.sort_by_key(|row| format!("{row:?}"));
    rows
}

pub fn assert_same_rows(actual: Vec<Vec<Value>>, expected: Vec<Vec<Value>>) {
    assert_eq!(sorted(actual), sorted(expected));
}

/// Residual filter: integer candidate column `left` strictly greater than
/// integer candidate column `right`. Nulls never pass.
pub struct ColumnGreaterThan {
    pub left: usize,
    pub right: usize,
}

impl ResidualFilter for ColumnGreaterThan {
    fn evaluate(&self, candidates: &Batch) -> Result<Vec<bool>> {
        let mut verdict = Vec::with_capacity(candidates.num_rows());
        for row in 0..candidates.num_rows() {
            let lhs = candidates.value(self.left, row)?;
            let rhs = candidates.value(self.right, row)?;
            verdict.push(matches!(
                (lhs, rhs),
                (Value::Int(l), Value::Int(r)) if l > r
            ));
        }
        Ok(verdict)
    }
}
