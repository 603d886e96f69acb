use std::{collections::BTreeMap, convert::Infallible, net::SocketAddr, sync::Arc};

use base64::{prelude::BASE64_STANDARD, Engine};
use k8s_openapi::{api::core::v1::Secret, ByteString};
use kube::{
    api::PostParams,
    core::{
        admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
        DynamicObject, ObjectMeta,
    },
    Api, Client,
};
use log::{error, info};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use serde_json::Value;
use warp::{
    reply::{self, Reply},
    Filter,
};

use crate::{admission::AdmissionController, trust::CA_CERT_KEY, Error};

pub const WEBHOOK_PATH: &str = "certinjectionwebhook";

const TLS_CERT_KEY: &str = "tls.crt";
const TLS_KEY_KEY: &str = "tls.key";

/// Serving certificate material as stored in the webhook's TLS secret.
pub struct SecretData {
    pub key: Vec<u8>,
    pub cert: Vec<u8>,
    pub ca: Vec<u8>,
}

fn take(secret: &mut Secret, key: &str) -> Result<Vec<u8>, Error> {
    Ok(secret
        .data
        .as_mut()
        .and_then(|x| x.remove(key))
        .ok_or_else(|| Error::UserInputError(format!("missing {key} from secret")))?
        .0)
}

impl TryFrom<Secret> for SecretData {
    type Error = Error;

    fn try_from(mut value: Secret) -> Result<Self, Self::Error> {
        Ok(SecretData {
            key: take(&mut value, TLS_KEY_KEY)?,
            cert: take(&mut value, TLS_CERT_KEY)?,
            ca: take(&mut value, CA_CERT_KEY)?,
        })
    }
}

impl From<SecretData> for BTreeMap<String, ByteString> {
    fn from(value: SecretData) -> Self {
        [
            (TLS_KEY_KEY, value.key),
            (TLS_CERT_KEY, value.cert),
            (CA_CERT_KEY, value.ca),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), ByteString(v)))
        .collect()
    }
}

impl SecretData {
    /// Mints a fresh CA and a serving certificate for `<service>.<namespace>.svc`.
    pub fn generate(service: &str, namespace: &str) -> Result<SecretData, Error> {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, format!("{service}-ca"));
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca_key_pair = KeyPair::generate()?;
        let ca = params.self_signed(&ca_key_pair)?;

        let host = format!("{service}.{namespace}.svc");
        let mut params = CertificateParams::new(vec![host.clone()])?;
        params.distinguished_name.push(DnType::CommonName, host);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let key_pair = KeyPair::generate()?;
        let cert = params.signed_by(&key_pair, &ca, &ca_key_pair)?;

        Ok(SecretData {
            key: key_pair.serialize_pem().into_bytes(),
            cert: cert.pem().into_bytes(),
            ca: ca.pem().into_bytes(),
        })
    }
}

/// Loads the serving certificate, creating the secret on first start.
pub async fn load_cert(
    client: Client,
    secret_name: &str,
    service_name: &str,
) -> Result<SecretData, Error> {
    let secret_api: Api<Secret> = Api::default_namespaced(client.clone());
    if let Some(secret) = secret_api.get_opt(secret_name).await? {
        return secret.try_into();
    };

    let namespace = client.default_namespace().to_string();
    info!("generating serving certificate for {service_name}.{namespace}.svc");
    let generated = SecretData::generate(service_name, &namespace)?;
    let out = secret_api
        .create(
            &PostParams::default(),
            &Secret {
                data: Some(generated.into()),
                immutable: Some(true),
                metadata: ObjectMeta {
                    name: Some(secret_name.to_string()),
                    namespace: Some(namespace),
                    ..Default::default()
                },
                type_: Some("kubernetes.io/tls".to_string()),
                ..Default::default()
            },
        )
        .await;

    match out {
        Ok(out) => out.try_into(),
        Err(e) => {
            // another replica may have won the race
            if let Some(secret) = secret_api.get_opt(secret_name).await? {
                return secret.try_into();
            };
            Err(e.into())
        }
    }
}

pub fn routes(
    controller: Arc<AdmissionController>,
) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone {
    warp::post()
        .and(warp::path(WEBHOOK_PATH))
        .and(warp::path::end())
        .and(warp::body::json())
        .and(warp::any().map(move || controller.clone()))
        .and_then(mutate_handler)
}

pub async fn run_webhook(
    secret: &SecretData,
    controller: Arc<AdmissionController>,
    port: u16,
) -> Result<(), Error> {
    let routes = routes(controller).with(warp::log::log("webhook"));
    let bind = SocketAddr::from(([0, 0, 0, 0], port));

    info!("webhook listening on {bind}");

    warp::serve(routes)
        .tls()
        .cert(&secret.cert)
        .key(&secret.key)
        .run(bind)
        .await;

    Ok(())
}

/// Serialises a review for the wire. The API server expects `patch` as a
/// base64 string, not the byte array `AdmissionResponse` serialises to.
fn review_json(review: &AdmissionReview<DynamicObject>) -> Result<Value, Error> {
    let mut value = serde_json::to_value(review)?;
    if let Some(patch) = value.pointer_mut("/response/patch") {
        if patch.is_array() {
            let bytes: Vec<u8> = serde_json::from_value(patch.take())?;
            *patch = Value::String(BASE64_STANDARD.encode(bytes));
        }
    }
    Ok(value)
}

async fn mutate_handler(
    body: AdmissionReview<DynamicObject>,
    controller: Arc<AdmissionController>,
) -> Result<impl Reply, Infallible> {
    let req: AdmissionRequest<_> = match body.try_into() {
        Ok(req) => req,
        Err(err) => {
            error!("invalid request: {}", err);
            return Ok(reply::json(&AdmissionResponse::invalid(err).into_review()));
        }
    };

    let review = controller.admit(&req).into_review();
    match review_json(&review) {
        Ok(value) => Ok(reply::json(&value)),
        Err(e) => {
            error!("failed to encode admission review: {e}");
            Ok(reply::json(&AdmissionResponse::invalid(e).into_review()))
        }
    }
}
