//! Domain types and pure functions shared by every kiln crate.
//!
//! Nothing in here spawns processes, opens sockets or touches the
//! filesystem; that keeps the lifecycle rules and request handling
//! testable in isolation.

pub mod artifact;
pub mod error;
pub mod job;
pub mod lifecycle;
pub mod request;
pub mod types;
pub mod worker;
