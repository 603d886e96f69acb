//! Process configuration, read once at start and immutable afterwards.

use std::path::{Path, PathBuf};

use base64::{prelude::BASE64_STANDARD, Engine};
use clap::Parser;
use k8s_openapi::api::core::v1::EnvVar;
use log::info;

use crate::{
    admission::AdmissionController,
    matcher::Matcher,
    mutation::{InjectionSpec, ResourceOverrides},
    Error,
};

pub const DEFAULT_WEBHOOK_NAME: &str = "defaults.webhook.cert-injection.tanzu.vmware.com";
pub const DEFAULT_WEBHOOK_SECRET_NAME: &str = "cert-injection-webhook-tls";
pub const DEFAULT_WEBHOOK_SERVICE_NAME: &str = "cert-injection-webhook";
pub const DEFAULT_WEBHOOK_PORT: u16 = 8443;

const CA_CERT_FILE: &str = "ca_cert/ca.crt";
const PROXY_FILES: [(&str, &str, &str); 3] = [
    ("http_proxy/value", "HTTP_PROXY", "http_proxy"),
    ("https_proxy/value", "HTTPS_PROXY", "https_proxy"),
    ("no_proxy/value", "NO_PROXY", "no_proxy"),
];

/// Mutating admission webhook injecting proxy settings and CA certificates into pods
#[derive(Parser, Debug)]
#[command(name = "cert-injection-webhook", version, about, long_about = None)]
pub struct Args {
    /// Label to monitor, as `key` or `key=value` (can be specified multiple times)
    #[arg(long = "label", env = "WEBHOOK_LABELS")]
    pub labels: Vec<String>,

    /// Annotation to monitor, as `key` or `key=value` (can be specified multiple times).
    /// Values may contain commas.
    #[arg(long = "annotation", env = "WEBHOOK_ANNOTATIONS")]
    pub annotations: Vec<String>,

    /// Also mutate pods on UPDATE operations
    #[arg(long, env = "WEBHOOK_HANDLE_UPDATES")]
    pub handle_updates: bool,

    /// Name of the MutatingWebhookConfiguration kept in sync with the serving CA
    #[arg(long, env = "WEBHOOK_NAME", default_value = DEFAULT_WEBHOOK_NAME)]
    pub webhook_name: String,

    /// Secret holding the serving certificate
    #[arg(long, env = "WEBHOOK_SECRET_NAME", default_value = DEFAULT_WEBHOOK_SECRET_NAME)]
    pub secret_name: String,

    /// Service fronting the webhook, used for the serving certificate's name
    #[arg(long, env = "WEBHOOK_SERVICE_NAME", default_value = DEFAULT_WEBHOOK_SERVICE_NAME)]
    pub service_name: String,

    /// HTTPS port; anything that is not a port number falls back to 8443
    #[arg(long, env = "WEBHOOK_PORT")]
    pub port: Option<String>,

    /// Image of the injected setup-ca-certs init container
    #[arg(long, env = "SETUP_CA_CERTS_IMAGE", default_value = "")]
    pub setup_ca_certs_image: String,

    /// Image pull secret appended to pods receiving the init container
    #[arg(long, env = "SYSTEM_REGISTRY_SECRET")]
    pub system_registry_secret: Option<String>,

    #[arg(long, env = "INIT_CONTAINER_CPU_REQUEST")]
    pub init_container_cpu_request: Option<String>,

    #[arg(long, env = "INIT_CONTAINER_MEMORY_REQUEST")]
    pub init_container_memory_request: Option<String>,

    #[arg(long, env = "INIT_CONTAINER_CPU_LIMIT")]
    pub init_container_cpu_limit: Option<String>,

    #[arg(long, env = "INIT_CONTAINER_MEMORY_LIMIT")]
    pub init_container_memory_limit: Option<String>,

    /// Directory the CA and proxy config maps are mounted under
    #[arg(long, env = "CONFIG_MAPS_DIR", default_value = "/run/config_maps")]
    pub config_maps_dir: PathBuf,
}

impl Args {
    pub fn port(&self) -> u16 {
        self.port
            .as_deref()
            .and_then(|x| x.trim().parse().ok())
            .unwrap_or(DEFAULT_WEBHOOK_PORT)
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|x| !x.is_empty()).cloned()
}

/// Reads a mounted config map value. Missing files are an error, surrounding
/// whitespace is dropped.
fn read_value(path: &Path) -> Result<String, Error> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        Error::UserInputError(format!("failed to read {}: {e}", path.display()))
    })?;
    Ok(raw.trim().to_string())
}

fn read_base64(path: &Path) -> Result<String, Error> {
    let encoded: String = read_value(path)?.split_whitespace().collect();
    if encoded.is_empty() {
        return Ok(String::new());
    }
    let decoded = BASE64_STANDARD.decode(encoded)?;
    String::from_utf8(decoded)
        .map_err(|_| Error::UserInputError(format!("invalid UTF-8 in {}", path.display())))
}

/// Proxy variables in upper- then lower-case form, for every configured proxy.
pub fn load_proxy_env(dir: &Path) -> Result<Vec<EnvVar>, Error> {
    let mut out = vec![];
    for (file, upper, lower) in PROXY_FILES {
        let value = read_value(&dir.join(file))?;
        if value.is_empty() {
            continue;
        }
        for name in [upper, lower] {
            out.push(EnvVar {
                name: name.to_string(),
                value: Some(value.clone()),
                ..Default::default()
            });
        }
    }
    Ok(out)
}

pub fn load_ca_certs(dir: &Path) -> Result<String, Error> {
    read_base64(&dir.join(CA_CERT_FILE))
}

#[derive(Debug, Clone)]
pub struct WebhookSettings {
    pub webhook_name: String,
    pub secret_name: String,
    pub service_name: String,
    pub port: u16,
    pub handle_updates: bool,
    pub matcher: Matcher,
    pub injection: InjectionSpec,
}

impl WebhookSettings {
    pub fn load(args: &Args) -> Result<Self, Error> {
        let matcher = Matcher::parse(args.labels.as_slice(), args.annotations.as_slice())?;
        let env_vars = load_proxy_env(&args.config_maps_dir)?;
        let ca_certs_data = load_ca_certs(&args.config_maps_dir)?;
        info!(
            "loaded {} proxy variables and {} bytes of CA certificates",
            env_vars.len(),
            ca_certs_data.len()
        );

        Ok(WebhookSettings {
            webhook_name: args.webhook_name.clone(),
            secret_name: args.secret_name.clone(),
            service_name: args.service_name.clone(),
            port: args.port(),
            handle_updates: args.handle_updates,
            matcher,
            injection: InjectionSpec {
                env_vars,
                setup_ca_certs_image: args.setup_ca_certs_image.clone(),
                ca_certs_data,
                image_pull_secret: non_empty(&args.system_registry_secret),
                resources: ResourceOverrides {
                    cpu_request: non_empty(&args.init_container_cpu_request),
                    memory_request: non_empty(&args.init_container_memory_request),
                    cpu_limit: non_empty(&args.init_container_cpu_limit),
                    memory_limit: non_empty(&args.init_container_memory_limit),
                },
            },
        })
    }

    pub fn admission_controller(&self) -> AdmissionController {
        AdmissionController::new(
            self.matcher.clone(),
            self.injection.clone(),
            self.handle_updates,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, fs};

    use super::*;

    struct ConfigDir(PathBuf);

    impl ConfigDir {
        fn new(name: &str) -> Self {
            let dir = std::env::temp_dir().join(format!(
                "cert-injection-webhook-{name}-{}",
                std::process::id()
            ));
            let _ = fs::remove_dir_all(&dir);
            for sub in ["ca_cert", "http_proxy", "https_proxy", "no_proxy"] {
                fs::create_dir_all(dir.join(sub)).unwrap();
            }
            ConfigDir(dir)
        }

        fn write(&self, file: &str, contents: &str) -> &Self {
            fs::write(self.0.join(file), contents).unwrap();
            self
        }

        fn write_all_empty(&self) -> &Self {
            self.write(CA_CERT_FILE, "")
                .write("http_proxy/value", "")
                .write("https_proxy/value", "")
                .write("no_proxy/value", "")
        }
    }

    impl Drop for ConfigDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }

    fn names_and_values(vars: &[EnvVar]) -> Vec<(&str, &str)> {
        vars.iter()
            .map(|x| (x.name.as_str(), x.value.as_deref().unwrap_or_default()))
            .collect()
    }

    #[test]
    fn proxy_values_produce_both_cases() {
        let dir = ConfigDir::new("proxy-both");
        dir.write_all_empty()
            .write("http_proxy/value", "http://my.proxy.com\n")
            .write("no_proxy/value", "http://my.local.com");
        let vars = load_proxy_env(&dir.0).unwrap();
        assert_eq!(
            names_and_values(&vars),
            [
                ("HTTP_PROXY", "http://my.proxy.com"),
                ("http_proxy", "http://my.proxy.com"),
                ("NO_PROXY", "http://my.local.com"),
                ("no_proxy", "http://my.local.com"),
            ]
        );
    }

    #[test]
    fn missing_proxy_file_fails() {
        let dir = ConfigDir::new("proxy-missing");
        dir.write("http_proxy/value", "").write("no_proxy/value", "");
        assert!(matches!(
            load_proxy_env(&dir.0),
            Err(Error::UserInputError(_))
        ));
    }

    #[test]
    fn ca_certs_are_base64_decoded() {
        let dir = ConfigDir::new("ca-decode");
        let pem = "-----BEGIN CERTIFICATE-----\n-----END CERTIFICATE-----\n";
        let encoded = BASE64_STANDARD.encode(pem);
        let (head, tail) = encoded.split_at(10);
        dir.write(CA_CERT_FILE, &format!("{head}\n{tail}\n"));
        assert_eq!(load_ca_certs(&dir.0).unwrap(), pem);

        dir.write(CA_CERT_FILE, "");
        assert_eq!(load_ca_certs(&dir.0).unwrap(), "");

        dir.write(CA_CERT_FILE, "not base64!");
        assert!(matches!(load_ca_certs(&dir.0), Err(Error::Base64Error(_))));
    }

    #[test]
    fn settings_from_args() {
        let dir = ConfigDir::new("settings");
        dir.write_all_empty()
            .write("https_proxy/value", "https://my.proxy.com");
        let args = Args::try_parse_from([
            "cert-injection-webhook",
            "--label",
            "some-label-1",
            "--annotation",
            "team=payments",
            "--port",
            "not-a-port",
            "--init-container-cpu-request",
            "100m",
            "--config-maps-dir",
            dir.0.to_str().unwrap(),
        ])
        .unwrap();
        let settings = WebhookSettings::load(&args).unwrap();
        assert_eq!(settings.port, DEFAULT_WEBHOOK_PORT);
        assert!(!settings.handle_updates);
        assert_eq!(settings.injection.env_vars.len(), 2);
        assert_eq!(settings.injection.ca_certs_data, "");
        assert_eq!(settings.injection.image_pull_secret, None);
        assert_eq!(
            settings.injection.resources.cpu_request.as_deref(),
            Some("100m")
        );
    }

    #[test]
    fn rule_values_keep_their_commas() {
        let args = Args::try_parse_from([
            "cert-injection-webhook",
            "--annotation",
            "example.com/teams=payments,checkout",
            "--label",
            "tier=web,api",
        ])
        .unwrap();
        assert_eq!(args.annotations, ["example.com/teams=payments,checkout"]);
        assert_eq!(args.labels, ["tier=web,api"]);

        let matcher = Matcher::parse(args.labels.as_slice(), args.annotations.as_slice()).unwrap();
        let annotations = |value: &str| -> Option<BTreeMap<String, String>> {
            Some([("example.com/teams".to_string(), value.to_string())].into())
        };
        assert!(matcher.matches(None, annotations("payments,checkout").as_ref()));
        assert!(!matcher.matches(None, annotations("payments").as_ref()));
        assert!(!matcher.matches(None, annotations("checkout").as_ref()));
    }

    #[test]
    fn settings_require_a_rule() {
        let dir = ConfigDir::new("no-rules");
        dir.write_all_empty();
        let args = Args::try_parse_from([
            "cert-injection-webhook",
            "--config-maps-dir",
            dir.0.to_str().unwrap(),
        ])
        .unwrap();
        assert!(matches!(
            WebhookSettings::load(&args),
            Err(Error::UserInputError(_))
        ));
    }

    #[test]
    fn port_parsing() {
        let args = Args::try_parse_from(["cert-injection-webhook", "--port", "9443"]).unwrap();
        assert_eq!(args.port(), 9443);
        let args = Args::try_parse_from(["cert-injection-webhook", "--port", "99999"]).unwrap();
        assert_eq!(args.port(), DEFAULT_WEBHOOK_PORT);
    }
}
