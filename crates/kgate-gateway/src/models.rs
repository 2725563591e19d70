//! Gateway REST payloads.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kgate_core::{ExecutionState, KernelId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A running kernel as the gateway reports it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KernelModel {
    /// Kernel id.
    pub id: KernelId,
    /// Kernel spec name.
    pub name: String,
    /// Last message seen by the gateway.
    #[serde(default)]
    pub last_activity: Option<DateTime<Utc>>,
    /// Execution state as the gateway last saw it.
    #[serde(default)]
    pub execution_state: ExecutionState,
    /// Open WebSocket connections.
    #[serde(default)]
    pub connections: u32,
}

/// `POST /api/kernels` body.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CreateKernelRequest {
    /// Spec to launch.
    pub name: String,
    /// Environment for the kernel process.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// One installable kernel spec.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KernelSpec {
    /// Spec name, e.g. `python3`.
    pub name: String,
    /// The `kernel.json` body.
    #[serde(default)]
    pub spec: KernelSpecFile,
    /// Logo and other resource URLs.
    #[serde(default)]
    pub resources: BTreeMap<String, Value>,
}

/// The interesting part of a `kernel.json`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelSpecFile {
    /// Human-readable name.
    pub display_name: String,
    /// Language the kernel runs.
    pub language: String,
    /// Launch command.
    pub argv: Vec<String>,
    /// Extra metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// `GET /api/kernelspecs` response.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelSpecs {
    /// Name of the default spec.
    #[serde(default)]
    pub default: String,
    /// Every installed spec by name.
    #[serde(default)]
    pub kernelspecs: BTreeMap<String, KernelSpec>,
}
