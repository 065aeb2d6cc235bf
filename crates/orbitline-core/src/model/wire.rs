//! Wire format of operations as produced by ingestion modules.
//!
//! These structs mirror the JSON exactly and stay loose on purpose: enumerated
//! fields (`mode`, `insertion_type`, `link_mode`, value `type`) are kept as
//! strings and raw values as `serde_json::Value`, so that the validation stage
//! can report the precise error kind instead of a generic decode failure.
//!
//! Only structural problems (missing required fields, wrong JSON types for
//! container fields) fail at decode time, as `ErrorParsingDictionary`.

use serde::{Deserialize, Serialize};

fn default_mode() -> String {
    "insert".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireOperation {
    #[serde(default = "default_mode")]
    pub mode: String,
    pub dim_signature: WireDimSignature,
    pub source: WireSource,
    #[serde(default)]
    pub explicit_references: Vec<WireExplicitRef>,
    #[serde(default)]
    pub events: Vec<WireEvent>,
    #[serde(default)]
    pub annotations: Vec<WireAnnotation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireDimSignature {
    pub name: String,
    pub exec: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireSource {
    pub name: String,
    #[serde(default)]
    pub reception_time: Option<String>,
    pub generation_time: String,
    #[serde(default)]
    pub validity_start: Option<String>,
    #[serde(default)]
    pub validity_stop: Option<String>,
    #[serde(default)]
    pub reported_validity_start: Option<String>,
    #[serde(default)]
    pub reported_validity_stop: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireExplicitRef {
    pub name: String,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub links: Vec<WireErLink>,
}

/// `{name: <target explicit reference>, link: <link name>, back_ref?}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireErLink {
    pub name: String,
    pub link: String,
    #[serde(default)]
    pub back_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireGauge {
    pub name: String,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub insertion_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    #[serde(default)]
    pub link_ref: Option<String>,
    #[serde(default)]
    pub explicit_reference: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    pub gauge: WireGauge,
    pub start: String,
    pub stop: String,
    #[serde(default)]
    pub links: Vec<WireLink>,
    #[serde(default)]
    pub values: Vec<WireValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireLink {
    /// A `link_ref` or an event uuid, depending on `link_mode`.
    pub link: String,
    pub link_mode: String,
    pub name: String,
    #[serde(default)]
    pub back_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireValue {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub values: Option<Vec<WireValue>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireAnnotation {
    pub explicit_reference: String,
    #[serde(alias = "gauge")]
    pub annotation_cnf: WireGauge,
    #[serde(default)]
    pub values: Vec<WireValue>,
}
