//! Columnar batch primitives for the Strata join engine.
//!
//! A [`Batch`] is a fixed set of equal-length [`Column`]s. Values are typed
//! ([`DataType`]), nullable (validity tracked per column in a
//! [`NullBitmap`]), and either fixed-width (8-byte integers and floats) or
//! variable-width (`(length, bytes)` text and binary).
//!
//! The crate also owns the join-key surface consumed by the engine:
//! [`JoinKeySchema`] describes the ordered key tuple and produces, per input
//! row, a serialized key blob whose byte equality coincides with semantic
//! equality, plus a 64-bit hash of that blob.

mod batch;
mod builder;
mod keys;
mod value;

pub use batch::{Batch, BatchFormatError, Column, ColumnData, ColumnSpec, NullBitmap};
pub use builder::ColumnBuilder;
pub use keys::{JoinKeySchema, KeyColumn, SerializedKeys};
pub use value::{DataType, Value};
