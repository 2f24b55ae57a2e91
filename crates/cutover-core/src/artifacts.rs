//! Revision artifacts produced by the source stage.
//!
//! A revision is one container image plus the task spec that runs it and
//! an app spec per deployment group. The task spec is a template: the
//! `<ImageURI>` placeholder is filled with the image, and the account
//! segment of any ARN can be rewritten for the target account.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Placeholder in the task spec that receives the image reference.
pub const IMAGE_PLACEHOLDER: &str = "<ImageURI>";

/// Everything a deploy stage needs to roll a revision out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionArtifacts {
    /// Short content digest identifying this revision.
    pub revision: String,
    /// Image reference (e.g. `registry/app:latest`).
    pub image: String,
    /// Rendered task spec.
    pub task_spec: serde_json::Value,
    /// App spec text keyed by deployment group id.
    pub app_specs: BTreeMap<String, String>,
}

impl RevisionArtifacts {
    /// Build artifacts from a task spec template, rendering the image into it.
    pub fn new(
        image: impl Into<String>,
        task_spec_template: serde_json::Value,
        app_specs: BTreeMap<String, String>,
    ) -> Self {
        let image = image.into();
        let task_spec = render_image(task_spec_template, &image);
        let revision = revision_digest(&image, &task_spec);
        Self {
            revision,
            image,
            task_spec,
            app_specs,
        }
    }

    /// The app spec for a deployment group, if the source provided one.
    pub fn app_spec_for(&self, group_id: &str) -> Option<&str> {
        self.app_specs.get(group_id).map(String::as_str)
    }
}

/// First 12 hex characters of SHA-256 over the image and the task spec.
pub fn revision_digest(image: &str, task_spec: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image.as_bytes());
    hasher.update(b"\n");
    hasher.update(task_spec.to_string().as_bytes());
    let full = hex::encode(hasher.finalize());
    full[..12].to_string()
}

/// Replace every occurrence of [`IMAGE_PLACEHOLDER`] in string values.
pub fn render_image(value: serde_json::Value, image: &str) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::String(s) => Value::String(s.replace(IMAGE_PLACEHOLDER, image)),
        Value::Array(items) => Value::Array(items.into_iter().map(|v| render_image(v, image)).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, render_image(v, image)))
                .collect(),
        ),
        other => other,
    }
}

/// Rewrite the account segment of ARNs (`arn:aws:iam::<account>:...`).
///
/// Only the segment directly after a `::` is replaced.
pub fn substitute_account(template: &str, account: &str) -> anyhow::Result<String> {
    let re = Regex::new(r"::\d*:")?;
    Ok(re
        .replace_all(template, format!("::{account}:").as_str())
        .into_owned())
}
