//! Local evaluation of feature flags and experiments.
//!
//! # Overview
//!
//! A [`Client`] downloads flag configs for a deployment, keeps them up to date in the background,
//! and evaluates them for a [`User`] without a network round trip. Each evaluation returns a
//! [`Variant`] per flag.
//!
//! Flag configs are polled from the flag server, or streamed over server-sent events with
//! polling as fallback (see [`Config::stream_updates`]). Flags may target cohorts; with
//! [`CohortSyncConfig`] set, the cohorts referenced by flags are downloaded and refreshed too.
//!
//! Evaluation results can be reported as assignment and exposure events through an
//! [`EventTracker`] (see [`AssignmentConfig`] and [`ExposureConfig`]).
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Only [`Client::start`] talks to the network synchronously. After it succeeds, background
//! failures are logged and retried, and evaluation keeps using the last flag configs stored.
//!
//! # Logging
//!
//! The crate uses the [`log`](https://docs.rs/log/latest/log/) crate with target `experiment`.
//! Consider integrating a `log`-compatible logger implementation for better visibility into
//! flag syncing.
//!
//! # Examples
//!
//! A runnable example lives in the `demos/` directory of the crate repository.

#![warn(rustdoc::missing_crate_level_docs)]

mod assignment;
mod cache;
mod client;
mod cohort;
mod cohort_download_api;
mod cohort_loader;
mod cohort_storage;
mod config;
mod dedup;
mod deployment_runner;
mod error;
pub mod evaluation;
mod exposure;
mod flag_config_api;
mod flag_config_storage;
mod flag_config_stream_api;
mod flag_config_updater;
mod poller;
mod registry;
mod sharder;
mod stream;
#[cfg(test)]
mod test_server;
mod topological_sort;
mod tracker;
mod user;

pub use assignment::{Assignment, AssignmentFilter};
pub use client::{Client, EvaluateOptions};
pub use cohort::Cohort;
pub use config::{AssignmentConfig, CohortSyncConfig, Config, ExposureConfig, ServerZone};
pub use dedup::{DedupFilter, Deduplicate};
pub use error::{Error, Result};
pub use evaluation::{Flag, Variant};
pub use exposure::{Exposure, ExposureFilter};
pub use flag_config_storage::FlagConfigs;
pub use registry::ClientRegistry;
pub use topological_sort::topological_sort;
pub use tracker::{AnalyticsEvent, EventTracker};
pub use user::User;
