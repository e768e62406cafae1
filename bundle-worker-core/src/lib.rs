#![doc = "bundle-worker-core: core logic library for the bundle worker."]

//! This crate contains the build job pipeline that turns a
//! (component, version, source commit) tuple into a published static bundle:
//! claiming queued jobs, fetching and extracting sources, running the build
//! toolchain, rewriting asset references and uploading the output.
//!
//! # Usage
//! The binary crate wires concrete adapters from [`store`] into a
//! [`processor::JobProcessor`] and drives its polling loop. Tests substitute
//! the `Mock*` ports generated from [`contract`].

pub mod annotate;
pub mod build_runner;
pub mod config;
pub mod content_type;
pub mod contract;
pub mod credentials;
pub mod download;
pub mod error;
pub mod job_log;
pub mod processor;
pub mod publish;
pub mod rewrite;
pub mod store;
