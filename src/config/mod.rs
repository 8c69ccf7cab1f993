//! Cluster Configuration Module
//!
//! The authoritative record of nodes, instances and disk trees, the store
//! that owns it and the events it emits.

pub mod events;
pub mod model;
pub mod store;

pub use events::*;
pub use model::*;
pub use store::*;
