use super::template::field_value;
use crate::action::{
    ActionError, ActionHandler, ActionOutput, ExecutionContext, SyncActionHandler, parse_config,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Operator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    Contains,
    In,
    IsNull,
    IsNotNull,
}

impl Operator {
    fn needs_value(self) -> bool {
        !matches!(self, Self::IsNull | Self::IsNotNull)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Logic {
    #[default]
    And,
    Or,
}

#[derive(Debug, Deserialize)]
struct Condition {
    field: String,
    operator: Operator,
    #[serde(default)]
    value: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct ConditionConfig {
    conditions: Vec<Condition>,
    #[serde(default)]
    logic: Logic,
}

/// Branches on comparisons against the triggering record.
///
/// Exits through `true` when the conditions hold and `false` otherwise.
pub struct EvaluateCondition;

impl EvaluateCondition {
    fn evaluate(condition: &Condition, data: &JsonValue) -> bool {
        let actual = field_value(data, &condition.field).filter(|v| !v.is_null());
        let expected = condition.value.as_ref();

        match condition.operator {
            Operator::IsNull => actual.is_none(),
            Operator::IsNotNull => actual.is_some(),
            Operator::Equals => matches!((actual, expected), (Some(a), Some(e)) if loosely_equal(a, e)),
            Operator::NotEquals => {
                !matches!((actual, expected), (Some(a), Some(e)) if loosely_equal(a, e))
            }
            Operator::GreaterThan => compare(actual, expected) == Some(Ordering::Greater),
            Operator::LessThan => compare(actual, expected) == Some(Ordering::Less),
            Operator::Contains => match (actual, expected) {
                (Some(JsonValue::String(a)), Some(JsonValue::String(e))) => a.contains(e.as_str()),
                (Some(JsonValue::Array(items)), Some(e)) => {
                    items.iter().any(|item| loosely_equal(item, e))
                }
                _ => false,
            },
            Operator::In => match (actual, expected) {
                (Some(a), Some(JsonValue::Array(options))) => {
                    options.iter().any(|option| loosely_equal(a, option))
                }
                _ => false,
            },
        }
    }
}

fn as_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Numbers compare numerically even when one side arrived as a string.
fn loosely_equal(a: &JsonValue, b: &JsonValue) -> bool {
    if a == b {
        return true;
    }
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) if a.is_number() || b.is_number() => x == y,
        _ => false,
    }
}

fn compare(actual: Option<&JsonValue>, expected: Option<&JsonValue>) -> Option<Ordering> {
    let (actual, expected) = (actual?, expected?);
    if let (Some(a), Some(e)) = (as_number(actual), as_number(expected)) {
        return a.partial_cmp(&e);
    }
    match (actual, expected) {
        (JsonValue::String(a), JsonValue::String(e)) => Some(a.cmp(e)),
        _ => None,
    }
}

impl ActionHandler for EvaluateCondition {
    fn action_type(&self) -> &str {
        "evaluate_condition"
    }

    fn validate(&self, config: &JsonValue) -> Result<(), ActionError> {
        let config: ConditionConfig = parse_config(config)?;
        if config.conditions.is_empty() {
            return Err(ActionError::validation("at least one condition is required"));
        }
        for condition in &config.conditions {
            if condition.operator.needs_value() && condition.value.is_none() {
                return Err(ActionError::validation(format!(
                    "condition on '{}' needs a value",
                    condition.field
                )));
            }
            if condition.operator == Operator::In
                && !matches!(condition.value, Some(JsonValue::Array(_)))
            {
                return Err(ActionError::validation(format!(
                    "'in' condition on '{}' needs a list value",
                    condition.field
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SyncActionHandler for EvaluateCondition {
    async fn execute(
        &self,
        config: &JsonValue,
        ctx: &ExecutionContext,
    ) -> Result<ActionOutput, ActionError> {
        let config: ConditionConfig = parse_config(config)?;
        let results: Vec<bool> = config
            .conditions
            .iter()
            .map(|c| Self::evaluate(c, &ctx.raw_data))
            .collect();
        let matched = match config.logic {
            Logic::And => results.iter().all(|&r| r),
            Logic::Or => results.iter().any(|&r| r),
        };

        let port = if matched { "true" } else { "false" };
        Ok(ActionOutput::new(json!({ "matched": matched, "results": results })).via(port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::tests::context;

    async fn run(config: JsonValue, data: JsonValue) -> ActionOutput {
        EvaluateCondition
            .execute(&config, &context(data))
            .await
            .expect("evaluate")
    }

    #[tokio::test]
    async fn numeric_comparison_selects_true_port() {
        let output = run(
            json!({ "conditions": [{ "field": "score", "operator": "less_than", "value": 3 }] }),
            json!({ "score": 2 }),
        )
        .await;
        assert_eq!(output.port.as_deref(), Some("true"));
        assert_eq!(output.result["matched"], true);
    }

    #[tokio::test]
    async fn failed_condition_selects_false_port() {
        let output = run(
            json!({ "conditions": [{ "field": "score", "operator": "greater_than", "value": "3" }] }),
            json!({ "score": "2" }),
        )
        .await;
        assert_eq!(output.port.as_deref(), Some("false"));
    }

    #[tokio::test]
    async fn or_logic_and_nested_fields() {
        let config = json!({
            "logic": "or",
            "conditions": [
                { "field": "status", "operator": "equals", "value": "closed" },
                { "field": "location.site", "operator": "in", "value": ["North", "East"] }
            ]
        });
        let output = run(config, json!({ "status": "open", "location": { "site": "East" } })).await;
        assert_eq!(output.port.as_deref(), Some("true"));
        assert_eq!(output.result["results"], json!([false, true]));
    }

    #[tokio::test]
    async fn null_checks_treat_missing_as_null() {
        let config = json!({
            "conditions": [
                { "field": "notes", "operator": "is_null" },
                { "field": "tags", "operator": "contains", "value": "urgent" }
            ]
        });
        let output = run(config, json!({ "notes": null, "tags": ["urgent", "field"] })).await;
        assert_eq!(output.port.as_deref(), Some("true"));
    }

    #[test]
    fn validate_requires_values() {
        let missing_value = json!({ "conditions": [{ "field": "a", "operator": "equals" }] });
        assert!(EvaluateCondition.validate(&missing_value).is_err());

        let scalar_in = json!({ "conditions": [{ "field": "a", "operator": "in", "value": 1 }] });
        assert!(EvaluateCondition.validate(&scalar_in).is_err());

        let ok = json!({ "conditions": [{ "field": "a", "operator": "is_not_null" }] });
        assert!(EvaluateCondition.validate(&ok).is_ok());
    }
}
