//! Ingestion and sampling core of a distributed-tracing agent.
//!
//! Application tracers on a host submit traces over HTTP; this crate is the
//! pipeline behind the transport. It normalizes incoming traces, pre-samples
//! under CPU pressure, aggregates per-bucket statistics over top-level
//! spans, keeps a controlled-rate sample of complete traces, and assembles
//! the periodic payload handed to the uploader, all without ever letting
//! the agent degrade the host it observes.
//!
//! # Architecture
//!
//! ```text
//! decoded trace → dispatcher → staleness check → filters → pre-sample
//!   → top-level marking + sublayers → quantize → weight
//!   → fan-out (concentrator | score/priority sampler)
//! on tick: concentrator.flush + samplers.flush → payload → uploader
//! ```
//!
//! The HTTP shell, the uploader, and the resource quantizer are external
//! collaborators; their contracts live in [`receiver`], [`payload`] and
//! [`agent::Quantizer`].

#![deny(clippy::all)]
#![deny(unused_extern_crates)]
#![deny(unreachable_pub)]
#![allow(clippy::cast_precision_loss)]

/// Dispatcher loop, per-trace protocol, fan-out and flush assembly.
pub mod agent;

/// Configuration defaults and environment overrides.
pub mod config;

/// Filter chain applied to root spans before sampling.
pub mod filters;

/// Log line formatting.
pub mod logger;

/// Span/trace model, normalization, tree operations and sublayers.
pub mod model;

/// Outbound payload handed to the uploader.
pub mod payload;

/// Process self-metrics from /proc.
pub mod proc;

/// Transport-facing contract surface: channels, counters, languages.
pub mod receiver;

/// Score and priority samplers, pre-sampler, signatures, rate table.
pub mod sampler;

/// Time-bucketed statistics: concentrator, buckets, distributions.
pub mod stats;

/// Watchdog over the agent's own resource usage.
pub mod watchdog;
