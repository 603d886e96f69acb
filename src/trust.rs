//! Keeps the webhook's own MutatingWebhookConfiguration trusting the serving
//! certificate's CA.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::{
    api::{admissionregistration::v1::MutatingWebhookConfiguration, core::v1::Secret},
    ByteString,
};
use kube::{
    api::PostParams,
    runtime::{controller::Action, reflector::ObjectRef, watcher::Config, Controller},
    Api, Client, ResourceExt,
};
use log::{debug, error, info};

use crate::Error;

pub const CA_CERT_KEY: &str = "ca.crt";

/// Object access needed by the reconciler.
#[async_trait]
pub trait TrustStore: Send + Sync {
    async fn get_secret(&self, name: &str) -> Result<Secret, Error>;

    async fn get_webhook_config(&self, name: &str) -> Result<MutatingWebhookConfiguration, Error>;

    /// Writes back a previously fetched configuration; a stale
    /// `resourceVersion` is rejected by the API server.
    async fn replace_webhook_config(
        &self,
        config: &MutatingWebhookConfiguration,
    ) -> Result<(), Error>;
}

pub struct KubeTrustStore {
    secrets: Api<Secret>,
    webhooks: Api<MutatingWebhookConfiguration>,
}

impl KubeTrustStore {
    pub fn new(client: Client) -> Self {
        KubeTrustStore {
            secrets: Api::default_namespaced(client.clone()),
            webhooks: Api::all(client),
        }
    }
}

#[async_trait]
impl TrustStore for KubeTrustStore {
    async fn get_secret(&self, name: &str) -> Result<Secret, Error> {
        Ok(self.secrets.get(name).await?)
    }

    async fn get_webhook_config(&self, name: &str) -> Result<MutatingWebhookConfiguration, Error> {
        Ok(self.webhooks.get(name).await?)
    }

    async fn replace_webhook_config(
        &self,
        config: &MutatingWebhookConfiguration,
    ) -> Result<(), Error> {
        self.webhooks
            .replace(&config.name_any(), &PostParams::default(), config)
            .await?;
        Ok(())
    }
}

/// Points every hook named after its configuration at `path` and trusts `ca`.
/// Returns `None` when the configuration already matches.
pub fn apply_trust_bundle(
    config: &MutatingWebhookConfiguration,
    ca: &[u8],
    path: &str,
) -> Result<Option<MutatingWebhookConfiguration>, Error> {
    let name = config.name_any();
    let mut updated = config.clone();
    for hook in updated.webhooks.iter_mut().flatten() {
        if hook.name != name {
            continue;
        }
        hook.client_config.ca_bundle = Some(ByteString(ca.to_vec()));
        let service = hook.client_config.service.as_mut().ok_or_else(|| {
            Error::WebhookConfigError(format!("missing service reference for webhook: {name}"))
        })?;
        service.path = Some(path.to_string());
    }
    Ok((&updated != config).then_some(updated))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustSync {
    Unchanged,
    Updated,
}

pub struct TrustReconciler<S> {
    store: S,
    webhook_name: String,
    secret_name: String,
    path: String,
}

impl<S: TrustStore> TrustReconciler<S> {
    pub fn new(store: S, webhook_name: String, secret_name: String, path: String) -> Self {
        TrustReconciler {
            store,
            webhook_name,
            secret_name,
            path,
        }
    }

    pub async fn reconcile(&self) -> Result<TrustSync, Error> {
        let secret = self.store.get_secret(&self.secret_name).await?;
        let ca = secret
            .data
            .as_ref()
            .and_then(|x| x.get(CA_CERT_KEY))
            .ok_or_else(|| {
                Error::WebhookConfigError(format!(
                    "secret {} is missing {CA_CERT_KEY} key",
                    self.secret_name
                ))
            })?;

        let config = self.store.get_webhook_config(&self.webhook_name).await?;
        match apply_trust_bundle(&config, &ca.0, &self.path)? {
            Some(updated) => {
                self.store.replace_webhook_config(&updated).await?;
                info!("updated trust bundle of webhook {}", self.webhook_name);
                Ok(TrustSync::Updated)
            }
            None => {
                debug!("trust bundle of webhook {} is current", self.webhook_name);
                Ok(TrustSync::Unchanged)
            }
        }
    }
}

async fn reconcile<S: TrustStore>(
    _config: Arc<MutatingWebhookConfiguration>,
    context: Arc<TrustReconciler<S>>,
) -> Result<Action, Error> {
    context.reconcile().await?;
    Ok(Action::await_change())
}

fn on_error<S>(
    config: Arc<MutatingWebhookConfiguration>,
    error: &Error,
    _context: Arc<TrustReconciler<S>>,
) -> Action {
    error!(
        "trust bundle reconciliation error for {}: {error:?}",
        config.name_any()
    );
    Action::requeue(Duration::from_secs(5))
}

/// Runs the reconciler whenever the webhook configuration or the TLS secret
/// changes. Never returns while the watches are healthy.
pub async fn run(client: Client, reconciler: TrustReconciler<KubeTrustStore>) {
    let webhooks: Api<MutatingWebhookConfiguration> = Api::all(client.clone());
    let secrets: Api<Secret> = Api::default_namespaced(client);
    let webhook_name = reconciler.webhook_name.clone();
    let webhook_fields = format!("metadata.name={webhook_name}");
    let secret_fields = format!("metadata.name={}", reconciler.secret_name);

    Controller::new(webhooks, Config::default().fields(&webhook_fields))
        .watches(
            secrets,
            Config::default().fields(&secret_fields),
            move |_| Some(ObjectRef::new(&webhook_name)),
        )
        .run(
            reconcile::<KubeTrustStore>,
            on_error::<KubeTrustStore>,
            Arc::new(reconciler),
        )
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => {
                    debug!("trust reconciliation successful: {object}");
                }
                Err(e) => {
                    error!("trust reconciliation error: {e:?}");
                }
            }
        })
        .await;
}
