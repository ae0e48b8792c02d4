//! Core services of the roster user directory.
//!
//! The interesting part of this crate is the read path: [`reader::UserReader`] serves
//! "get user by id" lookups by coordinating the in-process [`cache::TtlCache`], the
//! [`inflight::InflightRegistry`] and the durable [`store::UserStore`] under a per-request
//! [`deadline::Deadline`]. Everything else is plumbing around it.

#[macro_use]
pub mod metrics;

pub mod cache;
pub mod config;
pub mod deadline;
pub mod inflight;
pub mod logging;
pub mod reader;
pub mod services;
pub mod store;
pub mod types;
pub mod utils;
pub mod writer;
