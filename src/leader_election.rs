//! Lease-based leader election
//!
//! Elects exactly one replica to run the certificate writers (CertManager
//! and CaBundleSyncer) using the coordination.k8s.io/v1 Lease API. Readers
//! (CertProvider, the TLS listener) run on every replica regardless.
//!
//! # Split-brain prevention
//!
//! Timing does the work: `lease_duration > renew_deadline > retry_period`
//! means a leader that can no longer renew demotes itself before anyone
//! else can acquire the expired lease. On clean shutdown the holder is
//! cleared so a successor takes over without waiting out the lease.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Error;

const FIELD_MANAGER: &str = "autocert-webhook";

/// Leader election timings.
///
/// Must satisfy `retry_period < renew_deadline < lease_duration`; the
/// configuration resolver enforces this at startup.
#[derive(Clone, Copy, Debug)]
pub struct LeaderElectionTimings {
    /// How long an unrenewed lease stays valid
    pub lease_duration: Duration,
    /// How long renewal may keep failing before self-demotion
    pub renew_deadline: Duration,
    /// Period between acquisition attempts and renewals
    pub retry_period: Duration,
}

impl Default for LeaderElectionTimings {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(30),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(5),
        }
    }
}

/// Callbacks invoked on leadership transitions.
///
/// `on_started_leading` receives a token that is cancelled the moment
/// leadership is lost; everything spawned for the leader role must hang off
/// it. Both callbacks may fire multiple times over the life of a replica.
pub struct LeaderCallbacks {
    /// Invoked when this replica becomes the leader
    pub on_started_leading: Box<dyn Fn(CancellationToken) + Send + Sync>,
    /// Invoked when this replica loses (or releases) leadership
    pub on_stopped_leading: Box<dyn Fn() + Send + Sync>,
}

/// What the current lease state means for this candidate
#[derive(Debug, PartialEq, Eq)]
enum LeaseDisposition {
    /// We hold the lease and should renew it
    HeldByUs,
    /// Someone else holds an unexpired lease
    HeldByOther,
    /// The lease is free for takeover
    Expired {
        /// Transition count to carry forward
        transitions: i32,
    },
}

/// Leader elector using Kubernetes Leases
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    timings: LeaderElectionTimings,
    is_leader: AtomicBool,
}

impl LeaderElector {
    /// Create a new elector for the given lease and identity
    pub fn new(
        client: Client,
        lease_name: &str,
        namespace: &str,
        identity: &str,
        timings: LeaderElectionTimings,
    ) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            timings,
            is_leader: AtomicBool::new(false),
        }
    }

    /// Whether this replica currently holds the lease
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Drive the election until the token is cancelled.
    ///
    /// Acquires the lease (retrying transient API errors), invokes
    /// `on_started_leading` with a leader-scoped token, and renews until
    /// leadership is lost - then demotes and re-enters acquisition. On
    /// shutdown the lease is released if held.
    pub async fn run(&self, shutdown: CancellationToken, callbacks: LeaderCallbacks) {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            "Leader election started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Leader election stopped");
                    return;
                }
                _ = self.acquisition_loop() => {}
            }

            self.is_leader.store(true, Ordering::SeqCst);
            info!(identity = %self.identity, "Leadership acquired");
            let leader_token = shutdown.child_token();

            // The lease must be released even when the callback panics, so a
            // successor does not wait out the full lease duration.
            let started = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                (callbacks.on_started_leading)(leader_token.clone())
            }));
            if let Err(panic) = started {
                leader_token.cancel();
                self.is_leader.store(false, Ordering::SeqCst);
                self.release().await;
                std::panic::resume_unwind(panic);
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    leader_token.cancel();
                    self.is_leader.store(false, Ordering::SeqCst);
                    self.release().await;
                    (callbacks.on_stopped_leading)();
                    info!(identity = %self.identity, "Leadership released on shutdown");
                    return;
                }
                _ = self.renewal_loop() => {
                    leader_token.cancel();
                    self.is_leader.store(false, Ordering::SeqCst);
                    (callbacks.on_stopped_leading)();
                    warn!(identity = %self.identity, "Leadership lost");
                }
            }
        }
    }

    /// Retry acquisition until it succeeds
    async fn acquisition_loop(&self) {
        loop {
            match self.try_acquire().await {
                Ok(true) => return,
                Ok(false) => {
                    debug!(
                        identity = %self.identity,
                        retry_secs = self.timings.retry_period.as_secs(),
                        "Lease held by another, waiting"
                    );
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        "Failed to acquire lease, retrying"
                    );
                }
            }
            tokio::time::sleep(self.timings.retry_period).await;
        }
    }

    /// Renew until leadership is lost.
    ///
    /// A hard "held by other" answer demotes immediately; transient API
    /// errors demote once the renew deadline has elapsed without a
    /// successful renewal.
    async fn renewal_loop(&self) {
        let mut last_renew = tokio::time::Instant::now();
        loop {
            tokio::time::sleep(self.timings.retry_period).await;

            match self.try_acquire().await {
                Ok(true) => {
                    last_renew = tokio::time::Instant::now();
                }
                Ok(false) => return,
                Err(e) => {
                    if last_renew.elapsed() >= self.timings.renew_deadline {
                        warn!(
                            identity = %self.identity,
                            error = %e,
                            "Renew deadline exceeded"
                        );
                        return;
                    }
                    warn!(identity = %self.identity, error = %e, "Lease renewal failed, retrying");
                }
            }
        }
    }

    /// Try to acquire or renew the lease
    async fn try_acquire(&self) -> Result<bool, Error> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);

        match api.get(&self.lease_name).await {
            Ok(lease) => match lease_disposition(&lease, &self.identity, Utc::now()) {
                LeaseDisposition::HeldByUs => self.renew_lease(&api).await,
                LeaseDisposition::HeldByOther => Ok(false),
                LeaseDisposition::Expired { transitions } => {
                    self.take_over_lease(&api, transitions).await
                }
            },
            Err(kube::Error::Api(e)) if e.code == 404 => self.create_lease(&api).await,
            Err(e) => Err(e.into()),
        }
    }

    /// Create a new lease (first leader)
    async fn create_lease(&self, api: &Api<Lease>) -> Result<bool, Error> {
        let now = Utc::now();
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.timings.lease_duration.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };

        match api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(identity = %self.identity, "Created new lease");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Renew an existing lease that we hold
    async fn renew_lease(&self, api: &Api<Lease>) -> Result<bool, Error> {
        let patch = serde_json::json!({
            "apiVersion": "coordination.k8s.io/v1",
            "kind": "Lease",
            "metadata": {
                "name": self.lease_name,
                "namespace": self.namespace,
            },
            "spec": {
                "renewTime": MicroTime(Utc::now()),
            }
        });

        api.patch(
            &self.lease_name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&patch),
        )
        .await?;

        debug!(identity = %self.identity, "Lease renewed");
        Ok(true)
    }

    /// Take over an expired lease
    async fn take_over_lease(&self, api: &Api<Lease>, transitions: i32) -> Result<bool, Error> {
        let now = Utc::now();
        let patch = serde_json::json!({
            "apiVersion": "coordination.k8s.io/v1",
            "kind": "Lease",
            "metadata": {
                "name": self.lease_name,
                "namespace": self.namespace,
            },
            "spec": {
                "holderIdentity": self.identity,
                "acquireTime": MicroTime(now),
                "renewTime": MicroTime(now),
                "leaseDurationSeconds": self.timings.lease_duration.as_secs() as i32,
                "leaseTransitions": transitions + 1,
            }
        });

        match api
            .patch(
                &self.lease_name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&patch),
            )
            .await
        {
            Ok(_) => {
                info!(
                    identity = %self.identity,
                    transitions = transitions + 1,
                    "Took over expired lease"
                );
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Clear the holder so a successor acquires without waiting out the lease
    async fn release(&self) {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let patch = serde_json::json!({
            "spec": {
                "holderIdentity": null,
                "renewTime": null,
            }
        });
        if let Err(e) = api
            .patch(&self.lease_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            warn!(lease = %self.lease_name, error = %e, "Failed to release lease");
        }
    }
}

/// Classify the lease relative to a candidate identity.
///
/// A lease with no holder, no renew time, or no duration counts as expired;
/// that covers both freshly released leases and malformed ones.
fn lease_disposition(lease: &Lease, identity: &str, now: DateTime<Utc>) -> LeaseDisposition {
    let spec = lease.spec.as_ref();
    let holder = spec
        .and_then(|s| s.holder_identity.as_deref())
        .filter(|h| !h.is_empty());

    if holder == Some(identity) {
        return LeaseDisposition::HeldByUs;
    }

    let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
    if holder.is_none() {
        return LeaseDisposition::Expired { transitions };
    }

    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
    let expired = match (renew_time, duration_secs) {
        (Some(rt), Some(duration)) => now > rt.0 + chrono::Duration::seconds(duration as i64),
        _ => true,
    };

    if expired {
        LeaseDisposition::Expired { transitions }
    } else {
        LeaseDisposition::HeldByOther
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(spec: Option<LeaseSpec>) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some("acme-leader".to_string()),
                ..Default::default()
            },
            spec,
        }
    }

    fn held_by(identity: &str, renewed_secs_ago: i64, duration: i32) -> Lease {
        lease(Some(LeaseSpec {
            holder_identity: Some(identity.to_string()),
            lease_duration_seconds: Some(duration),
            renew_time: Some(MicroTime(
                Utc::now() - chrono::Duration::seconds(renewed_secs_ago),
            )),
            lease_transitions: Some(3),
            ..Default::default()
        }))
    }

    #[test]
    fn own_lease_is_held_by_us() {
        let l = held_by("pod-a", 1, 30);
        assert_eq!(
            lease_disposition(&l, "pod-a", Utc::now()),
            LeaseDisposition::HeldByUs
        );
    }

    #[test]
    fn fresh_foreign_lease_is_held_by_other() {
        let l = held_by("pod-a", 1, 30);
        assert_eq!(
            lease_disposition(&l, "pod-b", Utc::now()),
            LeaseDisposition::HeldByOther
        );
    }

    #[test]
    fn stale_foreign_lease_is_expired() {
        let l = held_by("pod-a", 60, 30);
        assert_eq!(
            lease_disposition(&l, "pod-b", Utc::now()),
            LeaseDisposition::Expired { transitions: 3 }
        );
    }

    #[test]
    fn released_lease_is_expired() {
        let l = lease(Some(LeaseSpec {
            holder_identity: None,
            lease_transitions: Some(7),
            ..Default::default()
        }));
        assert_eq!(
            lease_disposition(&l, "pod-b", Utc::now()),
            LeaseDisposition::Expired { transitions: 7 }
        );
    }

    #[test]
    fn empty_holder_identity_counts_as_released() {
        let l = lease(Some(LeaseSpec {
            holder_identity: Some(String::new()),
            ..Default::default()
        }));
        assert_eq!(
            lease_disposition(&l, "pod-b", Utc::now()),
            LeaseDisposition::Expired { transitions: 0 }
        );
    }

    #[test]
    fn lease_without_spec_is_expired() {
        let l = lease(None);
        assert_eq!(
            lease_disposition(&l, "pod-b", Utc::now()),
            LeaseDisposition::Expired { transitions: 0 }
        );
    }

    #[test]
    fn lease_missing_renew_time_is_expired() {
        let l = lease(Some(LeaseSpec {
            holder_identity: Some("pod-a".to_string()),
            lease_duration_seconds: Some(30),
            renew_time: None,
            ..Default::default()
        }));
        assert_eq!(
            lease_disposition(&l, "pod-b", Utc::now()),
            LeaseDisposition::Expired { transitions: 0 }
        );
    }

    #[test]
    fn default_timings_are_ordered() {
        let t = LeaderElectionTimings::default();
        assert!(t.retry_period < t.renew_deadline);
        assert!(t.renew_deadline < t.lease_duration);
    }
}
