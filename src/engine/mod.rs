// src/engine/mod.rs

//! Orchestration engine for watchrun.
//!
//! This module ties watchers to tasks:
//! - [`dispatch`] fans one watch event out to every bound task while the
//!   watcher is suppressed
//! - [`discovery`] runs one task across every eligible directory
//! - [`orchestrator`] owns one loop per watcher binding, plus shutdown

pub mod discovery;
pub mod dispatch;
pub mod orchestrator;

pub use discovery::{DirRun, DiscoveryRunner};
pub use dispatch::{TaskRun, dispatch_event};
pub use orchestrator::{Orchestrator, shutdown_channel};
