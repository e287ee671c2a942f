//! Rule condition evaluation.
//!
//! Contexts are a typed envelope (scope + timestamp) around a string-keyed
//! data bag. Conditions with an aggregation keep a per `(rule, field,
//! scope)` ring buffer of timestamped samples, trimmed to the condition's
//! time window, so `avg consumption over 1h` really is an hourly average
//! rather than the instantaneous value.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use super::rules::{Aggregation, AlertRule, Condition, Op};

/// Evaluation input: where the observation came from plus its fields.
#[derive(Debug, Clone)]
pub struct EvalContext {
    pub region: Option<String>,
    pub meter_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub data: HashMap<String, Value>,
}

impl EvalContext {
    pub fn new(region: Option<String>, meter_id: Option<String>) -> Self {
        Self {
            region,
            meter_id,
            timestamp: Utc::now(),
            data: HashMap::new(),
        }
    }

    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.data.insert(field.to_string(), value.into());
        self
    }

    /// Scope key for cooldowns and history buffers.
    pub fn scope_key(&self) -> String {
        format!(
            "{}/{}",
            self.region.as_deref().unwrap_or("-"),
            self.meter_id.as_deref().unwrap_or("-")
        )
    }
}

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("field {field} is not numeric (operator {operator:?})")]
    NotNumeric { field: String, operator: Op },
    #[error("condition value for {field} is not numeric")]
    ThresholdNotNumeric { field: String },
}

/// Stateful evaluator owning the aggregation history buffers.
#[derive(Debug, Default)]
pub struct RuleEvaluator {
    /// `(rule_id, field, scope)` → timestamped numeric samples.
    history: HashMap<(String, String, String), VecDeque<(i64, f64)>>,
}

impl RuleEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate every condition of `rule` against `ctx` (implicit AND).
    /// A missing field makes the condition false, not an error.
    pub fn evaluate(&mut self, rule: &AlertRule, ctx: &EvalContext) -> Result<bool, EvalError> {
        for condition in &rule.conditions {
            if !self.eval_condition(&rule.id, condition, ctx)? {
                return Ok(false);
            }
        }
        Ok(!rule.conditions.is_empty())
    }

    fn eval_condition(
        &mut self,
        rule_id: &str,
        condition: &Condition,
        ctx: &EvalContext,
    ) -> Result<bool, EvalError> {
        let Some(observed) = ctx.data.get(&condition.field) else {
            return Ok(false);
        };

        let observed = match (condition.aggregation, condition.time_window_ms) {
            (Some(aggregation), Some(window_ms)) => {
                let sample = as_f64(observed).ok_or_else(|| EvalError::NotNumeric {
                    field: condition.field.clone(),
                    operator: condition.operator,
                })?;
                Value::from(self.aggregate(
                    rule_id,
                    &condition.field,
                    &ctx.scope_key(),
                    ctx.timestamp,
                    sample,
                    aggregation,
                    window_ms,
                ))
            }
            _ => observed.clone(),
        };

        compare(&condition.field, condition.operator, &observed, &condition.value)
    }

    /// Record a sample and compute the aggregation over the surviving
    /// window.
    #[allow(clippy::too_many_arguments)]
    fn aggregate(
        &mut self,
        rule_id: &str,
        field: &str,
        scope: &str,
        at: DateTime<Utc>,
        sample: f64,
        aggregation: Aggregation,
        window_ms: u64,
    ) -> f64 {
        let buffer = self
            .history
            .entry((rule_id.to_string(), field.to_string(), scope.to_string()))
            .or_default();
        let now_ms = at.timestamp_millis();
        buffer.push_back((now_ms, sample));
        let cutoff = now_ms - window_ms as i64;
        while buffer.front().is_some_and(|(ts, _)| *ts < cutoff) {
            buffer.pop_front();
        }

        let values = buffer.iter().map(|(_, v)| *v);
        match aggregation {
            Aggregation::Count => buffer.len() as f64,
            Aggregation::Sum => values.sum(),
            Aggregation::Avg => {
                let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
                if n == 0 {
                    0.0
                } else {
                    sum / n as f64
                }
            }
            Aggregation::Max => values.fold(f64::MIN, f64::max),
            Aggregation::Min => values.fold(f64::MAX, f64::min),
        }
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn compare(field: &str, operator: Op, observed: &Value, expected: &Value) -> Result<bool, EvalError> {
    match operator {
        Op::Gt | Op::Gte | Op::Lt | Op::Lte => {
            let left = as_f64(observed).ok_or_else(|| EvalError::NotNumeric {
                field: field.to_string(),
                operator,
            })?;
            let right = as_f64(expected).ok_or_else(|| EvalError::ThresholdNotNumeric {
                field: field.to_string(),
            })?;
            Ok(match operator {
                Op::Gt => left > right,
                Op::Gte => left >= right,
                Op::Lt => left < right,
                Op::Lte => left <= right,
                _ => unreachable!(),
            })
        }
        Op::Eq => Ok(observed == expected),
        Op::Neq => Ok(observed != expected),
        Op::Contains | Op::NotContains => {
            let contains = match (observed, expected) {
                (Value::String(haystack), Value::String(needle)) => haystack.contains(needle),
                (Value::Array(items), needle) => items.contains(needle),
                _ => false,
            };
            Ok(if operator == Op::Contains {
                contains
            } else {
                !contains
            })
        }
    }
}
