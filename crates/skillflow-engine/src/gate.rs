//! Quality gate criteria.

use serde_json::Value;
use skillflow_domain::{is_truthy, GateAction, GateFailPolicy, GateResult, StateMap};

/// Evaluate gate criteria against step outputs (merged with the validator report).
///
/// `attempt` is 1-based. Under `retry`, the final attempt degrades to `block`.
#[must_use]
pub fn check_gate(
    criteria: &[String],
    outputs: &StateMap,
    on_fail: GateFailPolicy,
    attempt: u32,
    max_iterations: u32,
) -> GateResult {
    let failed_criteria: Vec<String> = criteria
        .iter()
        .filter(|criterion| !evaluate_criterion(criterion, outputs))
        .cloned()
        .collect();
    let errors = validator_errors(outputs);
    let passed = failed_criteria.is_empty() && errors.is_empty();

    let action = if passed {
        GateAction::Continue
    } else {
        match on_fail {
            GateFailPolicy::Retry if attempt < max_iterations => GateAction::Retry,
            GateFailPolicy::Retry | GateFailPolicy::Block => GateAction::Block,
            GateFailPolicy::Warn => GateAction::Warn,
        }
    };

    GateResult {
        passed,
        failed_criteria,
        errors,
        attempt,
        action,
    }
}

#[must_use]
pub fn evaluate_criterion(name: &str, outputs: &StateMap) -> bool {
    match name {
        "no_critical" => {
            count_is_zero(outputs.get("critical_count"))
                && is_empty_or_absent(outputs.get("critical_issues"))
        }
        "no_high" => {
            count_is_zero(outputs.get("high_count"))
                && is_empty_or_absent(outputs.get("high_issues"))
        }
        "tests_pass" => outputs.get("tests_passed").is_some_and(is_truthy),
        "no_warnings" => {
            count_is_zero(outputs.get("warning_count"))
                && is_empty_or_absent(outputs.get("warnings"))
        }
        "has_tests" => {
            outputs.get("has_tests").is_some_and(is_truthy)
                || !is_empty_or_absent(outputs.get("tests"))
                || outputs
                    .get("test_count")
                    .and_then(Value::as_f64)
                    .is_some_and(|count| count > 0.0)
        }
        "has_docs" => {
            outputs.get("has_docs").is_some_and(is_truthy)
                || !is_empty_or_absent(outputs.get("docs"))
                || !is_empty_or_absent(outputs.get("documentation"))
        }
        other => outputs.get(other).is_some_and(is_truthy),
    }
}

fn count_is_zero(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::Number(number)) => number.as_f64().is_some_and(|n| n == 0.0),
        Some(other) => !is_truthy(other),
    }
}

fn is_empty_or_absent(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
        Some(Value::String(text)) => text.is_empty(),
        Some(other) => !is_truthy(other),
    }
}

/// Validation errors reported under `errors` or `validation_errors`.
fn validator_errors(outputs: &StateMap) -> Vec<String> {
    let mut out = Vec::new();
    for key in ["errors", "validation_errors"] {
        match outputs.get(key) {
            Some(Value::Array(items)) => out.extend(items.iter().map(|item| match item {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })),
            Some(Value::String(text)) if !text.is_empty() => out.push(text.clone()),
            _ => {}
        }
    }
    out
}
