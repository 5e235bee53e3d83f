//! devcheck library
//!
//! This crate provides the core of the devcheck health-check harness:
//! - Configuration parsing and project discovery
//! - Isolated Python environments with hash-gated dependency installs
//! - CMake toolchain resolution, bootstrap and developer-shell capture
//! - The native build pipeline and the bounded concurrent project runner
//! - Result aggregation and reporting

pub mod cleanup;
pub mod config;
pub mod devshell;
pub mod error;
pub mod exec;
pub mod host;
pub mod native;
pub mod report;
pub mod result;
pub mod runner;
pub mod toolchain;
pub mod venv;
