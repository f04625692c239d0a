//! Entry points wiring all components together
//!
//! [`run`] is the whole library surface for most programs: resolve and
//! validate configuration, connect to the cluster, start the per-replica
//! pieces (certificate provider, HTTPS server, metrics server), and gate
//! the certificate writers behind leader election.
//!
//! Startup errors (bad configuration, unreachable cluster) propagate out
//! and terminate the process. Once running, reconcile errors are logged
//! and retried internally; only listener failures are fatal.

use std::sync::Arc;

use kube::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::admission::{validate_hooks, Admission};
use crate::ca_bundle::{webhook_refs_from_hooks, CaBundleSyncer};
use crate::cert_manager::{CertManager, CertManagerConfig};
use crate::cert_provider::CertProvider;
use crate::config;
use crate::error::Error;
use crate::leader_election::{LeaderCallbacks, LeaderElectionTimings, LeaderElector};
use crate::server::{start_metrics_server, ServerConfig, WebhookServer};

/// Start the webhook server and block until SIGINT/SIGTERM.
///
/// This is the main entry point for consuming programs.
pub async fn run(admission: impl Admission) -> Result<(), Error> {
    crate::install_crypto_provider();

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    run_with_shutdown(admission, shutdown).await
}

/// Start the webhook server and block until the token is cancelled
pub async fn run_with_shutdown(
    admission: impl Admission,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let cfg = config::resolve(admission.configure())?;
    let hooks = admission.webhooks();
    validate_hooks(&hooks)?;

    info!(
        name = %cfg.name,
        namespace = %cfg.namespace,
        port = cfg.port,
        leader_election = cfg.leader_election,
        "Starting webhook"
    );

    let client = Client::try_default().await?;
    let (err_tx, mut err_rx) = mpsc::channel::<Error>(1);

    // Certificate provider: every replica keeps the serving keypair warm.
    let provider = Arc::new(CertProvider::new(
        client.clone(),
        &cfg.namespace,
        &cfg.cert_secret_name,
    ));
    {
        let provider = Arc::clone(&provider);
        let token = shutdown.child_token();
        tokio::spawn(async move {
            provider.start(token).await;
        });
    }

    // Webhook HTTPS server: every replica serves admission traffic.
    let server = WebhookServer::new(
        provider.store(),
        hooks.clone(),
        ServerConfig {
            port: cfg.port,
            healthz_path: cfg.healthz_path.clone(),
            readyz_path: cfg.readyz_path.clone(),
        },
    );
    {
        let token = shutdown.child_token();
        let err_tx = err_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = server.start(token).await {
                error!(error = %e, "Webhook server error");
                let _ = err_tx.send(e).await;
            }
        });
    }

    if cfg.metrics_enabled {
        let token = shutdown.child_token();
        let err_tx = err_tx.clone();
        let port = cfg.metrics_port;
        let path = cfg.metrics_path.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(port, &path, token).await {
                error!(error = %e, "Metrics server error");
                let _ = err_tx.send(e).await;
            }
        });
    }

    // Certificate writers: leader only, so replicas never fight over
    // secrets or webhook configurations.
    let manager = Arc::new(CertManager::new(
        client.clone(),
        CertManagerConfig::from_resolved(&cfg),
    ));
    let refs = webhook_refs_from_hooks(&cfg.name, &hooks);
    let syncer = Arc::new(CaBundleSyncer::new(
        client.clone(),
        &cfg.namespace,
        &cfg.ca_bundle_configmap_name,
        refs,
    ));

    if cfg.leader_election {
        let elector = LeaderElector::new(
            client.clone(),
            &cfg.leader_election_id,
            &cfg.namespace,
            &config::leader_identity(),
            LeaderElectionTimings {
                lease_duration: cfg.lease_duration,
                renew_deadline: cfg.renew_deadline,
                retry_period: cfg.retry_period,
            },
        );
        let callbacks = LeaderCallbacks {
            on_started_leading: Box::new({
                let manager = Arc::clone(&manager);
                let syncer = Arc::clone(&syncer);
                move |leader_token: CancellationToken| {
                    info!("Became leader, starting certificate management");
                    let manager = Arc::clone(&manager);
                    let manager_token = leader_token.clone();
                    tokio::spawn(async move {
                        manager.start(manager_token).await;
                    });
                    let syncer = Arc::clone(&syncer);
                    tokio::spawn(async move {
                        syncer.start(leader_token).await;
                    });
                }
            }),
            on_stopped_leading: Box::new(|| {
                info!("Lost leadership, certificate management stopped");
            }),
        };
        let token = shutdown.child_token();
        tokio::spawn(async move {
            elector.run(token, callbacks).await;
        });
    } else {
        info!("Running without leader election");
        {
            let manager = Arc::clone(&manager);
            let token = shutdown.child_token();
            tokio::spawn(async move {
                manager.start(token).await;
            });
        }
        {
            let syncer = Arc::clone(&syncer);
            let token = shutdown.child_token();
            tokio::spawn(async move {
                syncer.start(token).await;
            });
        }
    }

    tokio::select! {
        _ = shutdown.cancelled() => {
            info!("Shutting down");
            Ok(())
        }
        Some(e) = err_rx.recv() => {
            error!(error = %e, "Fatal error, shutting down");
            shutdown.cancel();
            Err(e)
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received CTRL+C, shutting down"),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("Received CTRL+C, shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{Hook, HookType};
    use crate::config::Config;
    use kube::core::admission::AdmissionResponse;

    struct Broken {
        config: Config,
        hooks: Vec<Hook>,
    }

    impl Admission for Broken {
        fn configure(&self) -> Config {
            self.config.clone()
        }

        fn webhooks(&self) -> Vec<Hook> {
            self.hooks.clone()
        }
    }

    fn hook() -> Hook {
        Hook::new("/mutate", HookType::Mutating, |req| {
            AdmissionResponse::from(req)
        })
    }

    #[tokio::test]
    async fn missing_name_fails_before_touching_the_cluster() {
        let admission = Broken {
            config: Config::default(),
            hooks: vec![hook()],
        };
        let err = run_with_shutdown(admission, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("name is required"));
    }

    #[tokio::test]
    async fn invalid_durations_fail_before_touching_the_cluster() {
        let admission = Broken {
            config: Config {
                name: "acme".to_string(),
                cert_validity: std::time::Duration::from_secs(3600),
                cert_refresh: std::time::Duration::from_secs(3600),
                ..Config::default()
            },
            hooks: vec![hook()],
        };
        let err = run_with_shutdown(admission, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn empty_hook_set_fails_before_touching_the_cluster() {
        let admission = Broken {
            config: Config {
                name: "acme".to_string(),
                ..Config::default()
            },
            hooks: Vec::new(),
        };
        let err = run_with_shutdown(admission, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("at least one"));
    }
}
