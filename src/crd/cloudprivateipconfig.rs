//! CloudPrivateIPConfig Custom Resource Definition
//!
//! A CloudPrivateIPConfig assigns a private IP address (IPv4 or IPv6) to the
//! primary network interface of the cloud VM backing a Kubernetes node. By
//! convention the object's name is the requested IP literal; `spec.node`
//! names the target node and `status` reports where the IP currently lives
//! in the cloud. Consumers must only treat the request as fulfilled when
//! `spec.node == status.node` and the `Assigned` condition is `True`.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type reported in `status.conditions[0]`
pub const ASSIGNED_CONDITION_TYPE: &str = "Assigned";

/// Finalizer blocking object deletion until the cloud confirms the IP removal
pub const CLOUD_PRIVATE_IP_CONFIG_FINALIZER: &str =
    "cloudprivateipconfig.cloud.network.openshift.io/finalizer";

/// Condition reason: the cloud API request is in flight
pub const CLOUD_RESPONSE_REASON_PENDING: &str = "CloudResponsePending";

/// Condition reason: the cloud API returned an error
pub const CLOUD_RESPONSE_REASON_ERROR: &str = "CloudResponseError";

/// Condition reason: the cloud API confirmed the request
pub const CLOUD_RESPONSE_REASON_SUCCESS: &str = "CloudResponseSuccess";

/// Specification of the desired private IP assignment
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cloud.network.openshift.io",
    version = "v1",
    kind = "CloudPrivateIPConfig",
    plural = "cloudprivateipconfigs",
    shortname = "cpip",
    status = "CloudPrivateIPConfigStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Node Request","type":"string","jsonPath":".spec.node"}"#,
    printcolumn = r#"{"name":"Node Assignment","type":"string","jsonPath":".status.node"}"#,
    printcolumn = r#"{"name":"Assigned","type":"string","jsonPath":".status.conditions[0].status"}"#
)]
pub struct CloudPrivateIPConfigSpec {
    /// Name of the node the IP should be assigned to
    pub node: String,
}

/// Observed state of a CloudPrivateIPConfig. Only written by this controller.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct CloudPrivateIPConfigStatus {
    /// Node the IP is currently believed to live on in the cloud. Set to the
    /// intended destination before the cloud confirms, so that an interrupted
    /// sync is recognizable as an assignment in flight.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node: String,

    /// Condition list; element 0 is the `Assigned` condition
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Status of a condition (mirrors the metav1 wire values)
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A single condition in the object's status
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (always `Assigned` for this resource)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Counter incremented on every status write by this controller.
    /// Monotonically non-decreasing for the lifetime of the object.
    pub observed_generation: i64,

    /// Last time the condition transitioned
    pub last_transition_time: DateTime<Utc>,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message, set on errors for operator diagnosis
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Condition {
    /// Create an `Assigned` condition stamped with the current time
    pub fn assigned(
        status: ConditionStatus,
        reason: &str,
        observed_generation: i64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: ASSIGNED_CONDITION_TYPE.to_string(),
            status,
            observed_generation,
            last_transition_time: Utc::now(),
            reason: reason.to_string(),
            message: message.into(),
        }
    }
}

impl CloudPrivateIPConfig {
    /// The `Assigned` condition, if the status carries one yet
    pub fn assigned_condition(&self) -> Option<&Condition> {
        self.status.as_ref().and_then(|s| s.conditions.first())
    }

    /// Node the IP currently lives on according to the status ("" if none)
    pub fn status_node(&self) -> &str {
        self.status.as_ref().map(|s| s.node.as_str()).unwrap_or("")
    }

    /// The last observed generation recorded by this controller (0 if none)
    pub fn observed_generation(&self) -> i64 {
        self.assigned_condition()
            .map(|c| c.observed_generation)
            .unwrap_or(0)
    }

    /// Whether the controller's finalizer is present on the object
    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|s| s == CLOUD_PRIVATE_IP_CONFIG_FINALIZER))
    }

    /// Add the controller's finalizer (idempotent)
    pub fn add_finalizer(&mut self) {
        if !self.has_finalizer() {
            self.metadata
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(CLOUD_PRIVATE_IP_CONFIG_FINALIZER.to_string());
        }
    }

    /// Remove the controller's finalizer (idempotent)
    pub fn remove_finalizer(&mut self) {
        if let Some(finalizers) = self.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != CLOUD_PRIVATE_IP_CONFIG_FINALIZER);
        }
    }
}
