//! Parallel in-memory hash join engine over columnar batches.
//!
//! The engine consumes two batch streams. The *build* side is drained
//! first: rows are re-encoded into partitioned, append-only byte arenas
//! and linked into one chained hash table per partition. The *probe* side
//! then streams through `C` worker threads, each resolving its rows
//! against the frozen tables; join types whose answer lives on the build
//! side finish with a sweep over the row table's used flags.
//!
//! ```
//! use std::sync::Arc;
//! use strata_batch::{Batch, ColumnSpec, DataType, JoinKeySchema, KeyColumn, Value};
//! use strata_join::{
//!     BuildSide, CollectSink, HashJoinDesc, HashJoinEngine, JoinType, VecBatchSource,
//! };
//!
//! let schema = vec![
//!     ColumnSpec::new("k", DataType::Int),
//!     ColumnSpec::new("v", DataType::Text),
//! ];
//! let keys = JoinKeySchema::new(vec![KeyColumn::new(0, DataType::Int)]);
//! let desc = HashJoinDesc::new(
//!     JoinType::Inner,
//!     BuildSide::Right,
//!     schema.clone(),
//!     schema.clone(),
//!     keys.clone(),
//!     keys,
//!     2,
//! );
//!
//! let build = Batch::from_rows(
//!     &schema,
//!     &[vec![Value::Int(1), Value::Text("a".into())]],
//! )
//! .unwrap();
//! let probe = Batch::from_rows(
//!     &schema,
//!     &[vec![Value::Int(1), Value::Text("x".into())]],
//! )
//! .unwrap();
//!
//! let mut engine = HashJoinEngine::new(desc).unwrap();
//! engine.build(&mut VecBatchSource::new(vec![build])).unwrap();
//! let sink = CollectSink::new();
//! engine.probe(&mut VecBatchSource::new(vec![probe]), &sink).unwrap();
//!
//! let output: usize = sink.take_batches().iter().map(Batch::num_rows).sum();
//! assert_eq!(output, 1);
//! ```

mod build;
mod desc;
mod engine;
mod hash_table;
mod layout;
mod output;
mod probe;
mod row_table;
mod runtime;
mod scan;

pub use desc::{BuildSide, DEFAULT_OUTPUT_BATCH_ROWS, HashJoinDesc, JoinType, ResidualDesc};
pub use engine::HashJoinEngine;
pub use layout::{KeyMode, TableMeta};
pub use runtime::{
    BatchSource, CancelToken, CollectSink, MemoryTracker, OutputSink, QuotaTracker,
    ResidualFilter, UnboundedTracker, VecBatchSource,
};
