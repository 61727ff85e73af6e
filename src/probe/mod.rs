// Package probe checks unit readiness over HTTP, TCP or an exec command.

pub mod prober;

#[cfg(test)]
mod prober_test;

pub use prober::{ProbeOutcome, Prober, ReadinessProber};
