#![warn(clippy::dbg_macro, clippy::todo)]

pub mod admission;
pub mod certs;
pub mod config;
pub mod matcher;
pub mod mutation;
pub mod patch;
pub mod quantity;
pub mod trust;
pub mod webhook;

use kube::core::admission::SerializePatchError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    KubeError {
        #[from]
        source: kube::Error,
    },
    #[error("Invalid configuration: {0}")]
    UserInputError(String),
    #[error("Invalid CA certificate data: {0}")]
    CertError(String),
    #[error("Mutation failed: {0}")]
    MutationError(String),
    #[error("Invalid webhook configuration: {0}")]
    WebhookConfigError(String),
    #[error("Failed to generate certificate: {0}")]
    CertGenError(#[from] rcgen::Error),
    #[error("Failed to serialize patch: {0}")]
    PatchError(#[from] SerializePatchError),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Invalid base64: {0}")]
    Base64Error(#[from] base64::DecodeError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
