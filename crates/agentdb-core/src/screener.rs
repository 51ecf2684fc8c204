//! Sensitive-content screening for recorded payloads.
//!
//! Screening is conservative: over-flagging is acceptable, missing sensitive
//! content is not. A flagged payload is still recorded, carrying a
//! justification for later audit.

use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};
use serde::Serialize;
use serde_json::Value;

use crate::context::SyncContext;
use crate::error::{Result, SyncError};

/// Payload key that explicitly marks content as sensitive.
pub const EXPLICIT_MARKER: &str = "_contains_phi";

const FIELD_PATTERNS: &[&str] = &[
    r"patient_?id",
    r"mrn",
    r"medical_?record",
    r"ssn",
    r"social_?security",
    r"dob",
    r"date_?of_?birth",
    r"diagnosis",
    r"treatment",
    r"prescription",
    r"icd_?code",
    r"health_?record",
    r"medical_?history",
    r"patient_?name",
    r"provider_?name",
    r"insurance",
    r"claim_?number",
];

const PATH_PATTERNS: &[&str] = &[
    r"/data/protected/",
    r"/phi/",
    r"/medical/",
    r"/patient/",
    r"/health_?records?/",
];

const VALUE_PATTERN: &str = r"\b\d{3}-?\d{2}-?\d{4}\b";

const COMMIT_LINE_MAX: usize = 100;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// The rule that flagged a payload. `field` is a dotted path into the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum Detection {
    ExplicitMarker { field: String },
    SensitiveField { field: String, pattern: String },
    SensitiveValue { field: String },
    SensitivePath { field: String, pattern: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JustificationSource {
    Explicit,
    IssueNumber,
    CommitMessage,
    /// Synthesized from actor and action; recording this is a compliance
    /// violation.
    Generic,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScreenResult {
    pub flagged: bool,
    pub detection: Option<Detection>,
    pub justification: Option<String>,
    pub source: Option<JustificationSource>,
}

impl ScreenResult {
    pub fn clean() -> Self {
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Screener
// ---------------------------------------------------------------------------

pub trait Screener: Send + Sync {
    fn screen(
        &self,
        payload: &Value,
        ctx: &SyncContext,
        actor: &str,
        action: &str,
    ) -> Result<ScreenResult>;
}

/// Fixed field-name, value and path rules, checked in that order after the
/// explicit marker. Nested objects and arrays are searched too.
pub struct PatternScreener {
    fields: Vec<(&'static str, Regex)>,
    paths: Vec<(&'static str, Regex)>,
}

impl PatternScreener {
    pub fn new() -> Result<Self> {
        let compile = |patterns: &[&'static str]| -> Result<Vec<(&'static str, Regex)>> {
            patterns
                .iter()
                .map(|p| {
                    RegexBuilder::new(p)
                        .case_insensitive(true)
                        .build()
                        .map(|re| (*p, re))
                        .map_err(|e| SyncError::Screening(e.to_string()))
                })
                .collect()
        };
        Ok(Self {
            fields: compile(FIELD_PATTERNS)?,
            paths: compile(PATH_PATTERNS)?,
        })
    }

    /// First detection in rule order, or `None` for clean content.
    pub fn detect(&self, payload: &Value) -> Option<Detection> {
        let mut leaves = Vec::new();
        collect(payload, String::new(), &mut leaves);

        if let Some(leaf) = leaves.iter().find(|l| l.is_marker()) {
            return Some(Detection::ExplicitMarker {
                field: leaf.path.clone(),
            });
        }
        for leaf in &leaves {
            let Some(key) = leaf.key else { continue };
            if let Some((pattern, _)) = self.fields.iter().find(|(_, re)| re.is_match(key)) {
                return Some(Detection::SensitiveField {
                    field: leaf.path.clone(),
                    pattern: pattern.to_string(),
                });
            }
        }
        for leaf in &leaves {
            if leaf.text().is_some_and(|s| value_re().is_match(s)) {
                return Some(Detection::SensitiveValue {
                    field: leaf.path.clone(),
                });
            }
        }
        for leaf in &leaves {
            let Some(text) = leaf.text() else { continue };
            if let Some((pattern, _)) = self.paths.iter().find(|(_, re)| re.is_match(text)) {
                return Some(Detection::SensitivePath {
                    field: leaf.path.clone(),
                    pattern: pattern.to_string(),
                });
            }
        }
        None
    }
}

impl Screener for PatternScreener {
    fn screen(
        &self,
        payload: &Value,
        ctx: &SyncContext,
        actor: &str,
        action: &str,
    ) -> Result<ScreenResult> {
        let Some(detection) = self.detect(payload) else {
            return Ok(ScreenResult::clean());
        };
        tracing::warn!(actor, action, detection = ?detection, "sensitive content detected");
        let (justification, source) = justify(ctx, actor, action);
        Ok(ScreenResult {
            flagged: true,
            detection: Some(detection),
            justification: Some(justification),
            source: Some(source),
        })
    }
}

static VALUE_RE: OnceLock<Regex> = OnceLock::new();

fn value_re() -> &'static Regex {
    VALUE_RE.get_or_init(|| Regex::new(VALUE_PATTERN).unwrap())
}

// ---------------------------------------------------------------------------
// Justification
// ---------------------------------------------------------------------------

/// Justification for flagged content, by priority: explicit field, issue
/// number, commit subject, then a generic line naming actor and action.
pub fn justify(ctx: &SyncContext, actor: &str, action: &str) -> (String, JustificationSource) {
    if let Some(explicit) = &ctx.phi_justification {
        return (explicit.clone(), JustificationSource::Explicit);
    }
    if let Some(issue) = ctx.issue_number {
        return (
            format!("Development work for issue #{issue}"),
            JustificationSource::IssueNumber,
        );
    }
    if let Some(subject) = ctx
        .commit_message
        .as_deref()
        .and_then(|m| m.lines().next())
        .map(str::trim)
        .filter(|l| !l.is_empty())
    {
        let subject: String = subject.chars().take(COMMIT_LINE_MAX).collect();
        return (
            format!("Code change: {subject}"),
            JustificationSource::CommitMessage,
        );
    }
    let generic = match ctx.user.as_deref() {
        Some(user) if user != actor => format!("{user} via {actor} performing {action}"),
        _ => format!("{actor} performing {action}"),
    };
    (generic, JustificationSource::Generic)
}

// ---------------------------------------------------------------------------
// Payload traversal
// ---------------------------------------------------------------------------

struct Leaf<'a> {
    path: String,
    key: Option<&'a str>,
    value: &'a Value,
}

impl Leaf<'_> {
    fn is_marker(&self) -> bool {
        self.key == Some(EXPLICIT_MARKER) && self.value.as_bool() == Some(true)
    }

    fn text(&self) -> Option<&str> {
        self.value.as_str()
    }
}

/// Every keyed entry and every array element, depth-first in document order.
fn collect<'a>(value: &'a Value, path: String, out: &mut Vec<Leaf<'a>>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                out.push(Leaf {
                    path: child_path.clone(),
                    key: Some(key),
                    value: child,
                });
                collect(child, child_path, out);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                let child_path = format!("{path}[{i}]");
                if !child.is_object() && !child.is_array() {
                    out.push(Leaf {
                        path: child_path.clone(),
                        key: None,
                        value: child,
                    });
                }
                collect(child, child_path, out);
            }
        }
        // A bare scalar payload is screened as a single value.
        other if path.is_empty() => out.push(Leaf {
            path: String::new(),
            key: None,
            value: other,
        }),
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn screener() -> PatternScreener {
        PatternScreener::new().unwrap()
    }

    fn screen(payload: Value, ctx: &SyncContext) -> ScreenResult {
        screener().screen(&payload, ctx, "commit_agent", "phase_4_implement").unwrap()
    }

    #[test]
    fn field_named_patient_id_is_flagged() {
        let r = screen(json!({"patient_id": "12345"}), &SyncContext::default());
        assert!(r.flagged);
        assert!(matches!(r.detection, Some(Detection::SensitiveField { .. })));
    }

    #[test]
    fn ordinary_payload_is_clean() {
        let r = screen(
            json!({"commit_sha": "a1b2c3d4e5f6", "coverage": 87.5}),
            &SyncContext::default(),
        );
        assert_eq!(r, ScreenResult::clean());
    }

    #[test]
    fn explicit_marker_wins() {
        let r = screen(
            json!({"_contains_phi": true, "patient_id": "x"}),
            &SyncContext::default(),
        );
        assert_eq!(
            r.detection,
            Some(Detection::ExplicitMarker {
                field: "_contains_phi".into()
            })
        );
        let r = screen(json!({"_contains_phi": false}), &SyncContext::default());
        assert!(!r.flagged);
    }

    #[test]
    fn field_names_are_case_insensitive() {
        let r = screen(json!({"Patient_Name": "x"}), &SyncContext::default());
        assert!(r.flagged);
    }

    #[test]
    fn identifier_shaped_values_are_flagged() {
        for notes in ["SSN: 123-45-6789", "ref 123456789 attached"] {
            let r = screen(json!({"notes": notes}), &SyncContext::default());
            assert_eq!(
                r.detection,
                Some(Detection::SensitiveValue {
                    field: "notes".into()
                })
            );
        }
    }

    #[test]
    fn protected_paths_are_flagged() {
        let r = screen(
            json!({"files": ["src/lib.rs", "/srv/Data/Protected/export.csv"]}),
            &SyncContext::default(),
        );
        assert_eq!(
            r.detection,
            Some(Detection::SensitivePath {
                field: "files[1]".into(),
                pattern: "/data/protected/".into()
            })
        );
    }

    #[test]
    fn nested_keys_are_searched() {
        let r = screen(
            json!({"batch": {"records": [{"mrn": "A1"}]}}),
            &SyncContext::default(),
        );
        assert_eq!(
            r.detection,
            Some(Detection::SensitiveField {
                field: "batch.records[0].mrn".into(),
                pattern: "mrn".into()
            })
        );
    }

    #[test]
    fn explicit_justification_carried_verbatim() {
        let ctx = SyncContext {
            phi_justification: Some("IRB #12345".into()),
            issue_number: Some(7),
            ..SyncContext::default()
        };
        let r = screen(json!({"patient_id": "1"}), &ctx);
        assert_eq!(r.justification.as_deref(), Some("IRB #12345"));
        assert_eq!(r.source, Some(JustificationSource::Explicit));
    }

    #[test]
    fn justification_priority() {
        let issue = SyncContext {
            issue_number: Some(161),
            commit_message: Some("fix: schema".into()),
            ..SyncContext::default()
        };
        assert_eq!(
            justify(&issue, "a", "b"),
            ("Development work for issue #161".to_string(), JustificationSource::IssueNumber)
        );

        let long = "x".repeat(150);
        let commit = SyncContext {
            commit_message: Some(format!("{long}\n\nbody")),
            ..SyncContext::default()
        };
        let (text, source) = justify(&commit, "a", "b");
        assert_eq!(source, JustificationSource::CommitMessage);
        assert_eq!(text, format!("Code change: {}", &long[..100]));
    }

    #[test]
    fn generic_justification_names_actor_and_action() {
        let r = screen(json!({"diagnosis": "x"}), &SyncContext::default());
        let text = r.justification.clone().unwrap();
        assert!(text.contains("commit_agent"));
        assert!(text.contains("phase_4_implement"));
        assert_eq!(r.source, Some(JustificationSource::Generic));

        let ctx = SyncContext {
            user: Some("alice".into()),
            ..SyncContext::default()
        };
        let (text, _) = justify(&ctx, "commit_agent", "phase_4_implement");
        assert_eq!(text, "alice via commit_agent performing phase_4_implement");
    }
}
