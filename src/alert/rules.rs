//! Alert rule definitions and the seeded rule set.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::defaults::METER_OUTAGE_SILENCE_MS;
use crate::types::Severity;

/// Comparison operator for a rule condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    Neq,
    Contains,
    NotContains,
}

/// Aggregation applied over a condition's time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Count,
    Avg,
    Sum,
    Max,
    Min,
}

/// One condition; a rule fires only when all of its conditions hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub field: String,
    pub operator: Op,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<Aggregation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window_ms: Option<u64>,
}

impl Condition {
    pub fn simple(field: &str, operator: Op, value: Value) -> Self {
        Self {
            field: field.to_string(),
            operator,
            value,
            aggregation: None,
            time_window_ms: None,
        }
    }
}

/// In-memory alert rule. Rule configuration is seeded at boot; persisted
/// rule management belongs to the admin surface, not this engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRule {
    pub id: String,
    pub rule_type: String,
    pub enabled: bool,
    pub severity: Severity,
    pub conditions: Vec<Condition>,
    pub cooldown_ms: u64,
}

impl AlertRule {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// The rule set every engine instance boots with.
pub fn seed_rules() -> Vec<AlertRule> {
    vec![
        AlertRule {
            id: "regional_overload".to_string(),
            rule_type: "regional_overload".to_string(),
            enabled: true,
            severity: Severity::Critical,
            conditions: vec![Condition::simple("load_percentage", Op::Gt, json!(90.0))],
            cooldown_ms: 5 * 60 * 1000,
        },
        AlertRule {
            id: "meter_outage".to_string(),
            rule_type: "meter_outage".to_string(),
            enabled: true,
            severity: Severity::High,
            conditions: vec![Condition::simple(
                "last_seen_ago_ms",
                Op::Gt,
                json!(METER_OUTAGE_SILENCE_MS),
            )],
            cooldown_ms: 60 * 1000,
        },
        AlertRule {
            id: "high_consumption".to_string(),
            rule_type: "high_consumption".to_string(),
            enabled: true,
            severity: Severity::Medium,
            conditions: vec![Condition {
                field: "consumption".to_string(),
                operator: Op::Gt,
                value: json!(1000.0),
                aggregation: Some(Aggregation::Avg),
                time_window_ms: Some(60 * 60 * 1000),
            }],
            cooldown_ms: 30 * 60 * 1000,
        },
        AlertRule {
            id: "low_generation".to_string(),
            rule_type: "low_generation".to_string(),
            enabled: true,
            severity: Severity::Medium,
            conditions: vec![Condition::simple(
                "generation_percentage",
                Op::Lt,
                json!(30.0),
            )],
            cooldown_ms: 10 * 60 * 1000,
        },
        AlertRule {
            id: "anomaly_forward".to_string(),
            rule_type: "anomaly_forward".to_string(),
            enabled: true,
            severity: Severity::Medium,
            conditions: vec![Condition::simple("event_type", Op::Eq, json!("ANOMALY"))],
            cooldown_ms: 0,
        },
    ]
}
