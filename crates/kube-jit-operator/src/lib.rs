//! kube-jit operator
//!
//! Runs on every target cluster and turns approved `JitRequest` objects into
//! time-boxed RoleBindings:
//!
//! - [`request`]: the JitRequest state machine (validate, grant, revoke)
//! - [`group_cache`]: keeps the `jitgroupcache` singleton in step with
//!   adopted namespaces
//! - [`config`]: follows the `KubeJitConfig` singleton into a file-backed cache
//! - [`callback`]: reports state changes back to the API

#![deny(missing_docs)]

pub mod callback;
pub mod config;
pub mod controller_runner;
pub mod error;
pub mod group_cache;
pub mod request;

pub use error::{ReconcileError, Result};

/// Name the operator reports events and writes as
pub const CONTROLLER_NAME: &str = "kube-jit-operator";
