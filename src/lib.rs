//! Write-coalescing occurrence aggregator.
//!
//! High-frequency occurrence events for an (organization, project, entity)
//! triple are combined in a shared cache instead of being written
//! individually to the durable store. A periodic flush job drains the
//! pending set and applies the aggregated counters downstream once per
//! window, bounding write amplification while keeping totals and
//! min/max occurrence bounds eventually correct.

pub mod cache;
pub mod config;
pub mod export;
pub mod job;
pub mod store;
pub mod usage;
