//! The per-request admission decision.
//!
//! Anything that is not a pod create (or update, when enabled) passes through
//! untouched. A pod that cannot be decoded is let through with a diagnostic
//! status. A matching pod is planned and diffed, and any failure in that step
//! is a hard admission error so a partial patch is never returned.

use json_patch::Patch;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    core::{
        admission::{AdmissionRequest, AdmissionResponse, Operation},
        DynamicObject, GroupVersionResource,
    },
    ResourceExt,
};
use log::{error, info};
use serde_json::Value;

use crate::{matcher::Matcher, mutation::InjectionSpec, patch::create_patch, Error};

const OS_SELECTOR: &str = "kubernetes.io/os";

fn is_pod_resource(resource: &GroupVersionResource) -> bool {
    resource.group.is_empty() && resource.version == "v1" && resource.resource == "pods"
}

/// Decodes the request object as a `v1` Pod; an `apiVersion` or `kind` that
/// says otherwise is rejected. The raw object is returned alongside so the
/// patch is computed against exactly what was submitted.
fn decode_pod(object: Option<&DynamicObject>) -> Result<(Value, Pod), Error> {
    let object = object
        .ok_or_else(|| Error::UserInputError("the new object may not be nil".to_string()))?;
    let raw = serde_json::to_value(object)?;
    let pod = serde_json::from_value(raw.clone())?;
    Ok((raw, pod))
}

fn is_windows(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|x| x.node_selector.as_ref())
        .and_then(|x| x.get(OS_SELECTOR))
        .map(|x| x == "windows")
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct AdmissionController {
    matcher: Matcher,
    injection: InjectionSpec,
    handle_updates: bool,
}

impl AdmissionController {
    pub fn new(matcher: Matcher, injection: InjectionSpec, handle_updates: bool) -> Self {
        AdmissionController {
            matcher,
            injection,
            handle_updates,
        }
    }

    fn handles(&self, operation: &Operation) -> bool {
        match operation {
            Operation::Create => true,
            Operation::Update => self.handle_updates,
            _ => false,
        }
    }

    pub fn admit(&self, req: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        let res = AdmissionResponse::from(req);

        if !is_pod_resource(&req.resource) {
            info!(
                "expected resource to be pods, got {:?}, letting it through",
                req.resource
            );
            return res;
        }
        if !self.handles(&req.operation) {
            info!(
                "unhandled webhook operation, letting it through {:?}",
                req.operation
            );
            return res;
        }

        let (raw, pod) = match decode_pod(req.object.as_ref()) {
            Ok(x) => x,
            Err(e) => {
                let reason = format!("could not deserialize pod object: {e}");
                error!("{reason}");
                let mut res = res.deny(reason);
                res.allowed = true;
                res.result.reason = "BadRequest".to_string();
                res.result.code = 400;
                return res;
            }
        };
        let name = pod.name_any();

        if is_windows(&pod) {
            info!("pod {name} targets windows nodes, letting it through");
            return res;
        }
        if !self
            .matcher
            .matches(pod.metadata.labels.as_ref(), pod.metadata.annotations.as_ref())
        {
            info!("pod {name} does not contain matching labels or annotations, letting it through");
            return res;
        }

        let result = self.mutate(&raw).and_then(|patch| {
            let len = patch.0.len();
            if len == 0 {
                return Ok((res.clone(), 0));
            }
            Ok((res.clone().with_patch(patch)?, len))
        });
        match result {
            Ok((res, len)) => {
                info!(
                    "accepted: {:?} on Pod {name} with {len} patch operations",
                    req.operation
                );
                res
            }
            Err(e) => {
                error!("mutation failed: {:?} on Pod {name}: {e}", req.operation);
                res.deny(format!("mutation failed: {e}"))
            }
        }
    }

    fn mutate(&self, raw: &Value) -> Result<Patch, Error> {
        let after = self.injection.plan(raw)?;
        create_patch(raw, &after)
    }
}
