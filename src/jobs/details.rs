//! Job descriptors.
//!
//! A [`JobDetails`] names the registered handler type, the method to invoke
//! on it and the captured argument values. It is the persistent, serializable
//! description of the work; resolving it to executable code is the dispatch
//! registry's concern.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_METHOD: &str = "run";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDetails {
    pub class_name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub static_field_name: Option<String>,
    pub method_name: String,
    pub params: Vec<JobParameter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobParameter {
    pub class_name: String,
    pub value: Value,
}

impl JobDetails {
    pub fn new(
        class_name: impl Into<String>,
        method_name: impl Into<String>,
        params: Vec<JobParameter>,
    ) -> Self {
        Self {
            class_name: class_name.into(),
            static_field_name: None,
            method_name: method_name.into(),
            params,
        }
    }

    /// Stable textual signature used to deduplicate concurrent instances of
    /// the same recurring job.
    pub fn signature(&self) -> String {
        let params = self
            .params
            .iter()
            .map(|p| p.class_name.as_str())
            .collect::<Vec<_>>()
            .join(",");
        format!("{}.{}({})", self.class_name, self.method_name, params)
    }
}

impl JobParameter {
    pub fn new(class_name: impl Into<String>, value: Value) -> Self {
        Self {
            class_name: class_name.into(),
            value,
        }
    }
}
