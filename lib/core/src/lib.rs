//! Core types shared across the autorule automation engine.
//!
//! This crate provides the strongly-typed identifiers used by rule
//! definitions, run instances and the reference catalog, plus the
//! rootcause-based `Result` alias used at service boundaries.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{EntityId, EntityTypeId, NodeId, ParseIdError, RuleId, RunInstanceId, TriggerTypeId};
