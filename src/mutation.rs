//! Rewrites a matched pod: proxy environment on every container and, when a CA
//! bundle is configured, the `setup-ca-certs` init container with its shared
//! certificate volume.
//!
//! The planner never touches the pod it is given; it clones the raw object and
//! returns the mutated copy so the caller can diff the two.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{
        Capabilities, Container, EmptyDirVolumeSource, EnvVar, LocalObjectReference,
        ResourceRequirements, SeccompProfile, SecurityContext, Volume, VolumeMount,
    },
    apimachinery::pkg::api::resource::Quantity,
};
use log::warn;
use serde_json::{Map, Value};

use crate::{
    certs::{self, CA_CERTS_ENV_PREFIX},
    quantity::parse_quantity,
    Error,
};

pub const CA_CERTS_VOLUME_NAME: &str = "ca-certs";
pub const CA_CERTS_MOUNT_PATH: &str = "/etc/ssl/certs";
pub const SETUP_CA_CERTS_CONTAINER_NAME: &str = "setup-ca-certs";
pub const SETUP_CA_CERTS_WORKING_DIR: &str = "/workspace";

/// Optional resource overrides for the injected init container, kept as the
/// raw strings the operator supplied.
#[derive(Debug, Clone, Default)]
pub struct ResourceOverrides {
    pub cpu_request: Option<String>,
    pub memory_request: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_limit: Option<String>,
}

impl ResourceOverrides {
    fn quantity(name: &str, value: Option<&String>) -> Option<Quantity> {
        let value = value.filter(|x| !x.is_empty())?;
        match parse_quantity(value) {
            Ok(x) => Some(x),
            Err(e) => {
                warn!("ignoring init container {name} override: {e}");
                None
            }
        }
    }

    fn list(cpu: Option<Quantity>, memory: Option<Quantity>) -> Option<BTreeMap<String, Quantity>> {
        let list: BTreeMap<String, Quantity> = [("cpu", cpu), ("memory", memory)]
            .into_iter()
            .filter_map(|(k, v)| Some((k.to_string(), v?)))
            .collect();
        (!list.is_empty()).then_some(list)
    }

    /// Malformed quantities are logged and left out; never an error.
    pub fn requirements(&self) -> Option<ResourceRequirements> {
        let requests = Self::list(
            Self::quantity("cpu request", self.cpu_request.as_ref()),
            Self::quantity("memory request", self.memory_request.as_ref()),
        );
        let limits = Self::list(
            Self::quantity("cpu limit", self.cpu_limit.as_ref()),
            Self::quantity("memory limit", self.memory_limit.as_ref()),
        );
        if requests.is_none() && limits.is_none() {
            return None;
        }
        Some(ResourceRequirements {
            requests,
            limits,
            ..Default::default()
        })
    }
}

/// Static description of what gets injected into matched pods.
#[derive(Debug, Clone, Default)]
pub struct InjectionSpec {
    pub env_vars: Vec<EnvVar>,
    pub setup_ca_certs_image: String,
    pub ca_certs_data: String,
    pub image_pull_secret: Option<String>,
    pub resources: ResourceOverrides,
}

fn spec_mut(pod: &mut Value) -> Result<&mut Map<String, Value>, Error> {
    pod.get_mut("spec")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| Error::MutationError("pod has no spec".to_string()))
}

/// The list under `key`, created when absent or null.
fn list_mut<'a>(
    object: &'a mut Map<String, Value>,
    key: &str,
) -> Result<&'a mut Vec<Value>, Error> {
    let entry = object.entry(key).or_insert(Value::Null);
    if entry.is_null() {
        *entry = Value::Array(vec![]);
    }
    entry
        .as_array_mut()
        .ok_or_else(|| Error::MutationError(format!("{key} is not a list")))
}

/// Every container and init container of `spec`.
fn containers_mut(spec: &mut Map<String, Value>) -> impl Iterator<Item = &mut Map<String, Value>> {
    spec.iter_mut()
        .filter(|(k, _)| *k == "containers" || *k == "initContainers")
        .filter_map(|(_, v)| v.as_array_mut())
        .flatten()
        .filter_map(Value::as_object_mut)
}

impl InjectionSpec {
    /// Returns a mutated copy of the raw pod object.
    ///
    /// Works on the object as received so fields this crate does not model
    /// are carried through untouched.
    pub fn plan(&self, pod: &Value) -> Result<Value, Error> {
        let mut after = pod.clone();
        self.set_env_vars(&mut after)?;
        self.set_ca_certs(&mut after)?;
        Ok(after)
    }

    fn set_env_vars(&self, pod: &mut Value) -> Result<(), Error> {
        if self.env_vars.is_empty() {
            return Ok(());
        }
        let env = self
            .env_vars
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        for container in containers_mut(spec_mut(pod)?) {
            list_mut(container, "env")?.extend(env.iter().cloned());
        }
        Ok(())
    }

    fn ca_env_vars(&self) -> Vec<EnvVar> {
        certs::split(&self.ca_certs_data)
            .into_iter()
            .enumerate()
            .map(|(i, cert)| EnvVar {
                name: certs::fragment_name(CA_CERTS_ENV_PREFIX, i),
                value: Some(cert),
                ..Default::default()
            })
            .collect()
    }

    fn setup_container(&self) -> Container {
        Container {
            name: SETUP_CA_CERTS_CONTAINER_NAME.to_string(),
            image: Some(self.setup_ca_certs_image.clone()),
            env: Some(self.ca_env_vars()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            working_dir: Some(SETUP_CA_CERTS_WORKING_DIR.to_string()),
            volume_mounts: Some(vec![VolumeMount {
                name: CA_CERTS_VOLUME_NAME.to_string(),
                mount_path: SETUP_CA_CERTS_WORKING_DIR.to_string(),
                ..Default::default()
            }]),
            resources: self.resources.requirements(),
            security_context: Some(SecurityContext {
                run_as_non_root: Some(true),
                allow_privilege_escalation: Some(false),
                privileged: Some(false),
                seccomp_profile: Some(SeccompProfile {
                    type_: "RuntimeDefault".to_string(),
                    ..Default::default()
                }),
                capabilities: Some(Capabilities {
                    drop: Some(vec!["ALL".to_string()]),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn set_ca_certs(&self, pod: &mut Value) -> Result<(), Error> {
        if self.ca_certs_data.is_empty() {
            return Ok(());
        }
        let volume = serde_json::to_value(Volume {
            name: CA_CERTS_VOLUME_NAME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        })?;
        let mount = serde_json::to_value(VolumeMount {
            name: CA_CERTS_VOLUME_NAME.to_string(),
            mount_path: CA_CERTS_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        })?;
        let setup = serde_json::to_value(self.setup_container())?;

        let spec = spec_mut(pod)?;
        list_mut(spec, "volumes")?.push(volume);
        for container in containers_mut(spec) {
            list_mut(container, "volumeMounts")?.push(mount.clone());
        }

        if let Some(secret) = &self.image_pull_secret {
            let secret = serde_json::to_value(LocalObjectReference {
                name: Some(secret.clone()),
            })?;
            list_mut(spec, "imagePullSecrets")?.push(secret);
        }

        list_mut(spec, "initContainers")?.insert(0, setup);
        Ok(())
    }
}
