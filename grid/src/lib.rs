//! A distributed, in-process key-value storage grid with three distribution strategies
//! (Separated, Replicated, Federated) layered over a shared message bus and a Raft-based
//! coordination plane.

pub mod backup;
mod batch;
pub mod bus;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod grid;
pub mod ids;
pub mod message;
pub mod strategy;

pub use grid::Grid;
