// src/dag/mod.rs

//! Dependency graph resolution.
//!
//! [`graph`] holds the [`DagGraph`] resolver: topological order, execution
//! levels, ready-set queries, ancestor/descendant queries and the
//! would-this-edge-close-a-cycle check. It is pure: no state, no IO.

pub mod graph;

pub use graph::DagGraph;
