//! Minute-level click counting with periodic durable flushes
//!
//! See [`pipeline`] for the architecture.

pub mod pipeline;
