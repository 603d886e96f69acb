#![warn(clippy::dbg_macro, clippy::todo)]

use std::sync::Arc;

use cert_injection_webhook::{
    config::{Args, WebhookSettings},
    trust::{self, KubeTrustStore, TrustReconciler},
    webhook,
};
use clap::Parser;
use kube::client::Client;
use log::{error, info};

#[tokio::main]
async fn main() -> Result<(), kube::Error> {
    env_logger::Builder::new()
        .parse_env(env_logger::Env::default().default_filter_or("info"))
        .init();
    let args = Args::parse();

    let settings = match WebhookSettings::load(&args) {
        Ok(x) => x,
        Err(e) => {
            error!("invalid webhook configuration: {e}");
            std::process::exit(1);
        }
    };
    let client = Client::try_default().await?;

    let certificate =
        match webhook::load_cert(client.clone(), &settings.secret_name, &settings.service_name)
            .await
        {
            Ok(x) => x,
            Err(e) => {
                error!("failed to create/load webhook TLS cert: {e:?}");
                std::process::exit(1);
            }
        };

    let controller = Arc::new(settings.admission_controller());
    let port = settings.port;
    tokio::spawn(async move {
        match webhook::run_webhook(&certificate, controller, port).await {
            Ok(()) => {
                error!("webhook terminated successfully");
            }
            Err(e) => {
                error!("webhook failed to run: {e:?}");
            }
        }
    });

    info!(
        "reconciling trust bundle of webhook {}",
        settings.webhook_name
    );
    let reconciler = TrustReconciler::new(
        KubeTrustStore::new(client.clone()),
        settings.webhook_name.clone(),
        settings.secret_name.clone(),
        format!("/{}", webhook::WEBHOOK_PATH),
    );
    trust::run(client, reconciler).await;
    Ok(())
}
