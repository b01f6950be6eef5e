//! Distributed branch-and-bound subproblem farm
//!
//! A [`registry`] tracks live nodes, a [`slave`] agent per machine runs solver workers in
//! a fixed number of slots, and a [`master`] hands subproblem stubs to slaves with free
//! capacity, requeueing whatever fails.

pub mod collector;
pub mod config;
#[cfg(feature = "rusqlite")]
pub mod database;
pub mod liveness;
pub mod logging;
pub mod master;
pub mod protocol;
pub mod registry;
pub mod shutdown;
pub mod slave;
pub mod transport;
