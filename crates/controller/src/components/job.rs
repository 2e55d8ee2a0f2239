//! Runs a primary's workload as a `batch/v1` Job.
//!
//! Reads `spec.replicas` (completions and parallelism, default 1),
//! `spec.image` (required) and `spec.command` (optional list of strings).

use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use serde_json::{json, Value as Json};

use crate::component::{DesiredStateError, ManagedComponent};
use crate::status::Health;

pub const JOB_KIND: &str = "Job";

const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
const INSTANCE: &str = "app.kubernetes.io/instance";

#[derive(Debug, Clone)]
pub struct JobComponent {
    ar: ApiResource,
    manager: String,
}

impl Default for JobComponent {
    fn default() -> Self { Self::new("reko") }
}

impl JobComponent {
    /// `manager` is written to the `app.kubernetes.io/managed-by` label.
    pub fn new(manager: impl Into<String>) -> Self {
        Self { ar: ApiResource::from_gvk(&GroupVersionKind::gvk("batch", "v1", JOB_KIND)), manager: manager.into() }
    }
}

fn replicas(spec: &Json) -> Result<i64, DesiredStateError> {
    match spec.get("replicas") {
        None | Some(Json::Null) => Ok(1),
        Some(v) => match v.as_i64() {
            Some(n) if n >= 0 => Ok(n),
            _ => Err(DesiredStateError::field("replicas", format!("expected a non-negative integer, got {v}"))),
        },
    }
}

fn command(spec: &Json) -> Result<Option<Vec<String>>, DesiredStateError> {
    let Some(raw) = spec.get("command").filter(|v| !v.is_null()) else { return Ok(None) };
    let items = raw.as_array().ok_or_else(|| DesiredStateError::field("command", "expected a list of strings"))?;
    items
        .iter()
        .map(|v| v.as_str().map(str::to_string).ok_or_else(|| DesiredStateError::field("command", "expected a list of strings")))
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

fn count(status: &Json, field: &str) -> i64 { status.get(field).and_then(|v| v.as_i64()).unwrap_or(0) }

impl ManagedComponent for JobComponent {
    fn name(&self) -> &str { "job" }

    fn kinds(&self) -> Vec<String> { vec![JOB_KIND.to_string()] }

    fn desired(&self, primary: &DynamicObject) -> Result<Vec<DynamicObject>, DesiredStateError> {
        let name = primary.metadata.name.as_deref().ok_or_else(|| DesiredStateError::Invalid("primary has no name".into()))?;
        let spec = primary.data.get("spec").cloned().unwrap_or(Json::Null);
        let replicas = replicas(&spec)?;
        let image = spec
            .get("image")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DesiredStateError::field("image", "required"))?;

        let mut container = json!({ "name": "main", "image": image });
        if let Some(cmd) = command(&spec)? {
            container["command"] = json!(cmd);
        }
        let mut labels = serde_json::Map::new();
        labels.insert(MANAGED_BY.to_string(), json!(self.manager));
        labels.insert(INSTANCE.to_string(), json!(name));
        let mut job = DynamicObject::new(&format!("{name}-job"), &self.ar).data(json!({
            "spec": {
                "completions": replicas,
                "parallelism": replicas,
                "template": {
                    "metadata": { "labels": labels },
                    "spec": { "restartPolicy": "Never", "containers": [container] }
                }
            }
        }));
        job.metadata.namespace = primary.metadata.namespace.clone();
        job.metadata.labels = Some(
            [(MANAGED_BY.to_string(), self.manager.clone()), (INSTANCE.to_string(), name.to_string())].into_iter().collect(),
        );
        Ok(vec![job])
    }

    // a Job's pod template and completions are fixed once created
    fn immutable_fields(&self) -> &[&'static str] { &["/spec/template", "/spec/completions"] }

    fn observe(&self, object: &DynamicObject) -> Health {
        let Some(status) = object.data.get("status").filter(|s| !s.is_null()) else { return Health::Pending };
        let conditions = status.get("conditions").and_then(|c| c.as_array()).cloned().unwrap_or_default();
        let holds = |type_: &str| conditions.iter().any(|c| c["type"] == type_ && c["status"] == "True");

        if holds("Failed") {
            let cond = conditions.iter().find(|c| c["type"] == "Failed");
            let reason = cond.and_then(|c| c["reason"].as_str()).unwrap_or("JobFailed");
            let message = cond.and_then(|c| c["message"].as_str()).unwrap_or("job failed");
            return Health::failed(reason, message);
        }
        let completions = object.data.pointer("/spec/completions").and_then(|v| v.as_i64()).unwrap_or(1);
        if holds("Complete") || count(status, "succeeded") >= completions.max(1) {
            return Health::Complete;
        }
        if count(status, "active") > 0 || count(status, "succeeded") > 0 || count(status, "failed") > 0 {
            return Health::Progressing;
        }
        Health::Pending
    }
}
