//! # porter
//!
//! Reliable asynchronous job orchestration for code-migration pipelines.
//!
//! Jobs move through an at-least-once delivery queue into a pool of
//! workers, advance through ordered recoverable phases (ingestion →
//! verification → execution → output), and unwind completed phases in
//! reverse order when a failure is terminal. Every transition is an
//! event; job records are a materialized view over the event log.

pub mod api;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod event;
pub mod executor;
pub mod machine;
pub mod model;
pub mod queue;
pub mod record;
pub mod saga;
pub mod telemetry;
