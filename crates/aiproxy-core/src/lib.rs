//! # aiproxy-core
//!
//! Core of a multi-upstream AI-API load-balancing proxy: group/key
//! lifecycle management, an asynchronous task engine for long-running
//! bulk operations, buffered request-log aggregation, and adaptive
//! caching.
//!
//! This crate is library-first; a thin binary (`aiproxy-cli`) wires the
//! pieces together for local smoke-testing. HTTP edge serving, auth
//! middleware, credential-encryption primitive selection, per-provider
//! request rewriting, and configuration-file loading are explicitly out
//! of scope (see `spec.md` §1) and are modeled here only as the traits
//! this core calls into (`ChannelRegistry`, `BoundSiteChecker`, ...).
//!
//! ## Layout
//!
//! - [`model`] — persisted and in-flight data entities (§3).
//! - [`validation`] — group/key validators (§4.1.1, §4.1.2).
//! - [`store`] — the ephemeral key/value + set [`store::Store`] trait.
//! - [`db`] — the durable [`db::RelationalStore`] trait over three SQL dialects.
//! - [`cache`] — TTL-extending [`cache::AdaptiveCache`].
//! - [`encryption`] — credential `Encrypt`/`Decrypt`/`Hash`.
//! - [`channel`] — the Channel Registry capability (§2 item 4).
//! - [`key_provider`] — in-memory active-key pool with rotation (§2 item 5).
//! - [`group_manager`] — cached `group_id`/`name` resolver (§4.2).
//! - [`task`] — single-slot async task executor (§4.3).
//! - [`request_log`] — buffered log ingestion + flush (§4.4).
//! - [`log_service`] — filter-and-stream historical logs (§4.5).
//! - [`health`] — dynamic-weight health metrics sink (§3 `DynamicWeightMetric`).
//! - [`group_service`] — the orchestrator composing all of the above (§4.1).
//! - [`config`] — tunables and the static `GroupConfig` option schema.
//! - [`error`] — the error taxonomy and boundary shape (§6, §7).

pub mod cache;
pub mod channel;
pub mod config;
pub mod db;
pub mod encryption;
pub mod error;
pub mod group_manager;
pub mod group_service;
pub mod health;
pub mod key_provider;
pub mod log_service;
pub mod model;
pub mod request_log;
pub mod store;
pub mod task;
pub mod validation;

pub use error::{Error, Result};
