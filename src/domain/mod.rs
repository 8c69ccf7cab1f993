//! Domain layer - ports to the outside world
//!
//! Defines the node RPC port the orchestration core consumes; transports and
//! test fleets implement it as adapters.

pub mod ports;

pub use ports::*;
