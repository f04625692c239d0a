//! Leader-only CA bundle syncer
//!
//! Propagates the CA-bundle ConfigMap into the `caBundle` field of every
//! referenced admission webhook configuration. Driven by watch events on
//! the ConfigMap; each webhook configuration is patched independently, so
//! one bad configuration never blocks the others.
//!
//! A missing webhook configuration is not an error - the operator may apply
//! it later, and the next bundle event (or the initial sync after restart)
//! picks it up.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::StreamExt;
use json_patch::jsonptr::PointerBuf;
use json_patch::{Patch as JsonPatch, PatchOperation, ReplaceOperation};
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::admission::{Hook, HookType};
use crate::cert_manager::CA_BUNDLE_KEY;
use crate::error::Error;

/// Reference to an admission webhook configuration to keep in sync
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebhookRef {
    /// Name of the webhook configuration object
    pub name: String,
    /// Which kind of configuration it is
    pub hook_type: HookType,
}

/// Derive webhook references from the hook set: at most one per kind,
/// both named after the webhook itself.
pub fn webhook_refs_from_hooks(name: &str, hooks: &[Hook]) -> Vec<WebhookRef> {
    let mut refs = Vec::new();
    for kind in [HookType::Mutating, HookType::Validating] {
        if hooks.iter().any(|h| h.hook_type == kind) {
            refs.push(WebhookRef {
                name: name.to_string(),
                hook_type: kind,
            });
        }
    }
    refs
}

/// Synchronizes the CA bundle into webhook configurations
pub struct CaBundleSyncer {
    client: Client,
    namespace: String,
    configmap_name: String,
    refs: Vec<WebhookRef>,
}

impl CaBundleSyncer {
    /// Create a syncer for the given bundle ConfigMap and webhook references
    pub fn new(
        client: Client,
        namespace: &str,
        configmap_name: &str,
        refs: Vec<WebhookRef>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            configmap_name: configmap_name.to_string(),
            refs,
        }
    }

    /// Sync once best-effort, then follow ConfigMap watch events until the
    /// token is cancelled.
    pub async fn start(&self, shutdown: CancellationToken) {
        if let Err(e) = self.sync_once().await {
            warn!(
                configmap = %self.configmap_name,
                error = %e,
                "Initial CA bundle sync failed, will retry via watch"
            );
        }

        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let config =
            watcher::Config::default().fields(&format!("metadata.name={}", self.configmap_name));
        let stream = watcher(api, config).default_backoff();
        let mut stream = std::pin::pin!(stream);

        info!(
            namespace = %self.namespace,
            configmap = %self.configmap_name,
            webhooks = self.refs.len(),
            "CA bundle syncer watching bundle configmap"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("CA bundle syncer stopped");
                    return;
                }
                event = stream.next() => match event {
                    Some(Ok(watcher::Event::Apply(cm)))
                    | Some(Ok(watcher::Event::InitApply(cm))) => {
                        self.on_configmap(&cm).await;
                    }
                    Some(Ok(watcher::Event::Delete(_)))
                    | Some(Ok(watcher::Event::Init))
                    | Some(Ok(watcher::Event::InitDone)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "Bundle configmap watch error, backing off");
                    }
                    None => {
                        warn!("Bundle configmap watch stream ended");
                        return;
                    }
                }
            }
        }
    }

    async fn sync_once(&self) -> Result<(), Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        match api.get(&self.configmap_name).await {
            Ok(cm) => {
                self.on_configmap(&cm).await;
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(
                    configmap = %self.configmap_name,
                    "CA bundle configmap not found yet"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn on_configmap(&self, cm: &ConfigMap) {
        let bundle = cm
            .data
            .as_ref()
            .and_then(|d| d.get(CA_BUNDLE_KEY))
            .filter(|b| !b.is_empty());
        let Some(bundle) = bundle else {
            debug!(
                configmap = %self.configmap_name,
                "CA bundle configmap has no bundle data yet"
            );
            return;
        };

        for r in &self.refs {
            match self.patch_webhook(r, bundle.as_bytes()).await {
                Ok(true) => {
                    info!(webhook = %r.name, kind = %r.hook_type, "Updated webhook CA bundle");
                }
                Ok(false) => {}
                Err(e) => {
                    error!(
                        webhook = %r.name,
                        kind = %r.hook_type,
                        error = %e,
                        "Failed to patch webhook CA bundle"
                    );
                }
            }
        }
    }

    /// Patch one webhook configuration. Returns false when the object does
    /// not exist or carries no webhook entries.
    async fn patch_webhook(&self, r: &WebhookRef, bundle: &[u8]) -> Result<bool, Error> {
        let count = match r.hook_type {
            HookType::Validating => {
                let api: Api<ValidatingWebhookConfiguration> = Api::all(self.client.clone());
                match api.get(&r.name).await {
                    Ok(cfg) => cfg.webhooks.map(|w| w.len()).unwrap_or(0),
                    Err(kube::Error::Api(ae)) if ae.code == 404 => {
                        debug!(webhook = %r.name, "ValidatingWebhookConfiguration not found");
                        return Ok(false);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            HookType::Mutating => {
                let api: Api<MutatingWebhookConfiguration> = Api::all(self.client.clone());
                match api.get(&r.name).await {
                    Ok(cfg) => cfg.webhooks.map(|w| w.len()).unwrap_or(0),
                    Err(kube::Error::Api(ae)) if ae.code == 404 => {
                        debug!(webhook = %r.name, "MutatingWebhookConfiguration not found");
                        return Ok(false);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };
        if count == 0 {
            return Ok(false);
        }

        let patch = ca_bundle_patch(count, bundle);
        let params = PatchParams::default();
        match r.hook_type {
            HookType::Validating => {
                let api: Api<ValidatingWebhookConfiguration> = Api::all(self.client.clone());
                api.patch(&r.name, &params, &Patch::Json::<()>(patch)).await?;
            }
            HookType::Mutating => {
                let api: Api<MutatingWebhookConfiguration> = Api::all(self.client.clone());
                api.patch(&r.name, &params, &Patch::Json::<()>(patch)).await?;
            }
        }
        Ok(true)
    }
}

/// JSON patch replacing `caBundle` on every embedded webhook entry.
///
/// The value is base64 since `caBundle` is a byte field on the wire.
fn ca_bundle_patch(webhook_count: usize, bundle: &[u8]) -> JsonPatch {
    let encoded = BASE64.encode(bundle);
    let ops = (0..webhook_count)
        .map(|i| {
            let path = PointerBuf::parse(&format!("/webhooks/{}/clientConfig/caBundle", i))
                .expect("valid JSON pointer");
            PatchOperation::Replace(ReplaceOperation {
                path,
                value: json!(encoded),
            })
        })
        .collect();
    JsonPatch(ops)
}
