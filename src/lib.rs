//! Library crate for vhost-scan-rs exposing the streaming scan pipeline.
//!
//! Files flow through [`targets::TargetGenerator`] into a bounded queue,
//! a [`workers::WorkerPool`] probes each target with [`probe::Prober`], and
//! matches are drained by the sink inside [`scanner::Scanner::run`].
pub mod client;
pub mod config;
pub mod probe;
pub mod progress;
pub mod ratelimit;
pub mod scanner;
pub mod scratch;
pub mod targets;
pub mod types;
pub mod workers;
