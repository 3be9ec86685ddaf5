//! kube-jit API
//!
//! Records access requests, collects per-namespace approvals and hands fully
//! approved requests to the target cluster as `JitRequest` objects. The
//! operator on that cluster reports back through a signed callback URL.
//!
//! # Architecture
//!
//! ```text
//! browser ──► server ──► AccessService ──► RequestStore
//!                           │
//!                           ├──► ClusterAccess ──► ClientCache ──► target cluster
//!                           │          └────────► GroupMappingCache
//!                           └──► UrlSigner (callback URLs)
//! operator ──► /k8s-callback (signed) ──► AccessService::callback
//! ```

#![deny(missing_docs)]

pub mod clusters;
pub mod config;
pub mod error;
pub mod groups;
pub mod identity;
pub mod model;
pub mod notify;
pub mod permissions;
pub mod server;
pub mod service;
pub mod session;
pub mod signed_url;
pub mod store;

pub use error::{Error, Result};

/// Path prefix for every API route
pub const API_PREFIX: &str = "/kube-jit-api";

/// Route the operator posts callbacks to, relative to [`API_PREFIX`]
pub const CALLBACK_PATH: &str = "/k8s-callback";

pub(crate) fn hex_encode(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

pub(crate) fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_helpers_agree() {
        let bytes = [0u8, 15, 16, 255];
        assert_eq!(hex_encode(&bytes), "000f10ff");
        assert_eq!(hex_decode("000f10ff").unwrap(), bytes);
        assert_eq!(hex_decode("000F10FF").unwrap(), bytes);
        assert!(hex_decode("abc").is_none());
        assert!(hex_decode("zz").is_none());
    }
}
