use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
    Progressing,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub last_transition_time: String,
    pub last_update_time: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

impl Condition {
    pub fn new(type_: &str, now: &str) -> Self {
        Condition {
            type_: type_.to_string(),
            status: ConditionStatus::Unknown,
            last_transition_time: now.to_string(),
            last_update_time: now.to_string(),
            reason: String::new(),
            message: String::new(),
        }
    }

    /// Returns the condition with the given values. The transition time only
    /// moves when the status changes.
    pub fn updated(
        mut self,
        status: ConditionStatus,
        reason: &str,
        message: &str,
        now: &str,
    ) -> Self {
        if self.status != status {
            self.last_transition_time = now.to_string();
        }
        self.status = status;
        self.reason = reason.to_string();
        self.message = message.to_string();
        self.last_update_time = now.to_string();
        self
    }
}

pub fn get_or_init_condition(conditions: &[Condition], type_: &str, now: &str) -> Condition {
    conditions
        .iter()
        .find(|c| c.type_ == type_)
        .cloned()
        .unwrap_or_else(|| Condition::new(type_, now))
}

/// Replaces the condition of the same type or appends it.
pub fn merge_conditions(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => *existing = condition,
        None => conditions.push(condition),
    }
}
