use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::store::EventCategory;

/// Caller-supplied context travelling with a completed action.
///
/// Known keys are typed; anything else lands in `extra` and is stored with
/// the event untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phi_justification: Option<String>,
    #[serde(
        default,
        deserialize_with = "issue_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub issue_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<EventCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Set by the compliance layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phi_detected: Option<bool>,
    /// Overrides the derived flow token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_token: Option<String>,
    /// Delivery key: a retried dispatch with the same key records nothing new.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SyncContext {
    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value)
    }

    /// Whether the caller gave any source a justification can be drawn from
    /// other than the generic actor/action fallback.
    pub fn has_explicit_justification(&self) -> bool {
        self.phi_justification.is_some()
            || self.issue_number.is_some()
            || self
                .commit_message
                .as_deref()
                .is_some_and(|m| !m.trim().is_empty())
    }
}

/// Accept `161`, `"161"` or `"#161"`.
fn issue_number<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Number(n)) => Some(n),
        Some(Raw::Text(s)) => s.trim().trim_start_matches('#').parse().ok(),
        None => None,
    })
}
