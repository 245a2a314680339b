//! Columnar-store access: parameterized analytical SQL with deadlines,
//! duration metrics and NaN/Inf sanitization.

pub mod client;

pub use client::{finite, ColumnarClient};
