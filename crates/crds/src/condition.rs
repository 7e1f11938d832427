//! Status conditions shared by all SDN CRDs.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type reported when a resource converged
pub const CONDITION_READY: &str = "Ready";

/// Condition type reported when a resource failed validation
pub const CONDITION_VALIDATED: &str = "Validated";

/// A single status condition, modelled after `metav1.Condition`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (e.g. "Ready", "Validated")
    #[serde(rename = "type")]
    pub type_: String,

    /// "True", "False" or "Unknown"
    pub status: String,

    /// Machine readable reason
    #[serde(default)]
    pub reason: String,

    /// Human readable message
    #[serde(default)]
    pub message: String,

    /// Last time the status flipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    /// Builds a condition with `status` "True" or "False".
    pub fn new(type_: &str, ok: bool, reason: &str, message: impl Into<String>) -> Self {
        Self {
            type_: type_.to_string(),
            status: if ok { "True" } else { "False" }.to_string(),
            reason: reason.to_string(),
            message: message.into(),
            last_transition_time: Some(Utc::now()),
        }
    }

    /// True when the condition reports "True".
    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// Inserts or replaces the condition with the same type.
///
/// The transition time is only bumped when the status value changes, so
/// re-writing an identical condition never produces a new status patch.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

/// Returns true when the two condition lists differ in anything but timestamps.
pub fn conditions_differ(a: &[Condition], b: &[Condition]) -> bool {
    if a.len() != b.len() {
        return true;
    }
    a.iter().any(|ca| {
        !b.iter().any(|cb| {
            cb.type_ == ca.type_
                && cb.status == ca.status
                && cb.reason == ca.reason
                && cb.message == ca.message
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_condition_keeps_transition_time_when_status_unchanged() {
        let mut conditions = vec![Condition::new(CONDITION_READY, true, "Ok", "first")];
        let original = conditions[0].last_transition_time;

        set_condition(&mut conditions, Condition::new(CONDITION_READY, true, "Ok", "second"));

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].message, "second");
        assert_eq!(conditions[0].last_transition_time, original);
    }

    #[test]
    fn test_set_condition_appends_new_type() {
        let mut conditions = vec![Condition::new(CONDITION_READY, true, "Ok", "")];
        set_condition(&mut conditions, Condition::new(CONDITION_VALIDATED, false, "InvalidCIDR", "bad"));
        assert_eq!(conditions.len(), 2);
        assert!(!conditions[1].is_true());
    }

    #[test]
    fn test_conditions_differ_ignores_timestamps() {
        let a = vec![Condition::new(CONDITION_READY, true, "Ok", "m")];
        let mut b = a.clone();
        b[0].last_transition_time = None;
        assert!(!conditions_differ(&a, &b));

        b[0].message = "other".to_string();
        assert!(conditions_differ(&a, &b));
    }
}
