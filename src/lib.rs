//! autocert-webhook - Kubernetes admission webhooks with self-managing TLS
//!
//! This crate bootstraps a highly-available admission webhook server whose
//! TLS certificates self-heal. A consuming program supplies a name and one or
//! more admission hooks; the runtime takes care of everything the cluster
//! needs to trust and reach the endpoint:
//!
//! - mints and rotates a self-signed CA, stored in a Secret
//! - mints and rotates a serving keypair signed by that CA
//! - publishes the trust anchor into a CA-bundle ConfigMap and from there
//!   into the `caBundle` field of the webhook configurations
//! - hot-swaps the serving certificate of the live TLS listener, no restart
//! - elects a single writer across replicas via a coordination Lease
//!
//! # Architecture
//!
//! Certificate management is split between leader-only writers and
//! all-replica readers. Every replica runs a [`cert_provider::CertProvider`]
//! that watches the serving Secret and feeds the TLS listener. Exactly one
//! replica additionally runs the [`cert_manager::CertManager`] reconcile loop
//! and the [`ca_bundle::CaBundleSyncer`], gated by
//! [`leader_election::LeaderElector`]. All coordination happens through the
//! cluster object store; replicas never talk to each other directly.
//!
//! # Modules
//!
//! - [`admission`] - The [`Admission`] trait, hooks, and wire types
//! - [`response`] - Helpers for building admission responses
//! - [`config`] - Configuration record, env overlay, and validation
//! - [`runtime`] - [`run`] / [`run_with_shutdown`] entry points
//! - [`cert_manager`] - Leader-only certificate reconcile loop
//! - [`cert_provider`] - Per-replica serving certificate watcher
//! - [`ca_bundle`] - Leader-only webhook configuration patcher
//! - [`leader_election`] - Lease-based leader election
//! - [`pki`] - Certificate minting, parsing, and bundle handling
//! - [`server`] - HTTPS webhook server and plain-HTTP metrics server
//! - [`metrics`] - Certificate expiry gauges
//! - [`error`] - Error types
//!
//! # Example
//!
//! ```ignore
//! use autocert_webhook::{Admission, Config, Hook, HookType, response};
//!
//! struct PodLabeler;
//!
//! impl Admission for PodLabeler {
//!     fn configure(&self) -> Config {
//!         Config {
//!             name: "pod-labeler".to_string(),
//!             ..Config::default()
//!         }
//!     }
//!
//!     fn webhooks(&self) -> Vec<Hook> {
//!         vec![Hook::new("/mutate-pods", HookType::Mutating, |req| {
//!             response::allowed(req)
//!         })]
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> autocert_webhook::Result<()> {
//!     autocert_webhook::run(PodLabeler).await
//! }
//! ```

#![deny(missing_docs)]

pub mod admission;
pub mod ca_bundle;
pub mod cert_manager;
pub mod cert_provider;
pub mod config;
pub mod error;
pub mod leader_election;
pub mod metrics;
pub mod pki;
pub mod response;
pub mod runtime;
pub mod server;

pub use admission::{Admission, AdmitFn, Hook, HookType};
pub use config::Config;
pub use error::Error;
pub use runtime::{run, run_with_shutdown};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Install the default rustls crypto provider.
///
/// Must be called before creating any TLS connections (including kube
/// clients). Safe to call multiple times - subsequent calls are no-ops.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}
