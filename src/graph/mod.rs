// Package graph validates service descriptors into an acyclic dependency graph.

pub mod graph;

#[cfg(test)]
mod graph_test;

pub use graph::{GraphError, ServiceGraph};
