//! Entity query modules for the pipeline database
//!
//! One module per table, runtime-checked queries with explicit binds.

pub mod alerts;
pub mod audit;
pub mod events;
pub mod rules;
pub mod servers;
pub mod trust;
pub mod wal;
