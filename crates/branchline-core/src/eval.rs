//! Variable substitution and guard-condition evaluation.
//!
//! Two small facilities used by the cursor interpreter:
//! - `substitute` resolves `${field}` references in textual command
//!   arguments against the current workitem; unknown references are left
//!   as-is (not an error).
//! - `ConditionEvaluator` wraps `jexl_eval::Evaluator` for boolean `if`
//!   guards, with workitem fields passed as the evaluation context.

use branchline_types::workitem::Workitem;
use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during condition evaluation.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("condition evaluation failed: {0}")]
    EvalFailed(String),

    #[error("workitem fields did not serialize to an object")]
    InvalidContext,
}

// ---------------------------------------------------------------------------
// Variable substitution
// ---------------------------------------------------------------------------

/// Resolve `${field}` references in `text` from the workitem's fields.
///
/// Values substitute as their display form (strings bare, everything else
/// compact JSON). A reference to a missing field is left untouched.
pub fn substitute(text: &str, workitem: &Workitem) -> String {
    let mut result = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("${") {
        let Some(close) = rest[start..].find('}') else {
            break;
        };
        let close = start + close;
        let key = &rest[start + 2..close];

        result.push_str(&rest[..start]);
        match workitem.field(key) {
            Some(value) => result.push_str(&value_to_string(value)),
            None => result.push_str(&rest[start..=close]),
        }
        rest = &rest[close + 1..];
    }

    result.push_str(rest);
    result
}

/// Convert a JSON value to its substitution string.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// ConditionEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator for command `if` guards.
///
/// The workitem's fields form the evaluation context, so `approved == true`
/// tests the `approved` field directly. Fields are passed as context values,
/// never interpolated into the expression string.
pub struct ConditionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ConditionEvaluator {
    /// Create an evaluator with the standard transforms registered.
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.len(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
            .with_transform("contains", |args: &[Value]| {
                let subject = args.first().and_then(Value::as_str).unwrap_or("");
                let search = args.get(1).and_then(Value::as_str).unwrap_or("");
                Ok(json!(subject.contains(search)))
            });

        Self { evaluator }
    }

    /// Evaluate a guard expression against a workitem.
    ///
    /// Results are coerced to boolean with JavaScript-like truthiness.
    pub fn holds(&self, expression: &str, workitem: &Workitem) -> Result<bool, EvalError> {
        let context = json!(workitem.fields);
        if !context.is_object() {
            return Err(EvalError::InvalidContext);
        }

        let result = self
            .evaluator
            .eval_in_context(expression, &context)
            .map_err(|e| EvalError::EvalFailed(e.to_string()))?;

        Ok(truthy(&result))
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use branchline_types::fei::Fei;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn workitem_with(fields: &[(&str, Value)]) -> Workitem {
        let mut wi = Workitem::new(Fei::root(Uuid::now_v7()), HashMap::new());
        for (k, v) in fields {
            wi.set_field(*k, v.clone());
        }
        wi
    }

    // -------------------------------------------------------------------
    // substitute
    // -------------------------------------------------------------------

    #[test]
    fn substitute_string_field() {
        let wi = workitem_with(&[("target", json!("review"))]);
        assert_eq!(substitute("${target}", &wi), "review");
        assert_eq!(substitute("go to ${target} now", &wi), "go to review now");
    }

    #[test]
    fn substitute_number_field() {
        let wi = workitem_with(&[("n", json!(2))]);
        assert_eq!(substitute("${n}", &wi), "2");
    }

    #[test]
    fn substitute_unknown_left_as_is() {
        let wi = workitem_with(&[]);
        assert_eq!(substitute("${missing}", &wi), "${missing}");
    }

    #[test]
    fn substitute_multiple_references() {
        let wi = workitem_with(&[("a", json!("x")), ("b", json!("y"))]);
        assert_eq!(substitute("${a}-${b}-${a}", &wi), "x-y-x");
    }

    #[test]
    fn substitute_unterminated_reference() {
        let wi = workitem_with(&[("a", json!("x"))]);
        assert_eq!(substitute("${a", &wi), "${a");
    }

    // -------------------------------------------------------------------
    // ConditionEvaluator
    // -------------------------------------------------------------------

    #[test]
    fn holds_boolean_field() {
        let eval = ConditionEvaluator::new();
        let wi = workitem_with(&[("approved", json!(true))]);
        assert!(eval.holds("approved == true", &wi).unwrap());
        assert!(!eval.holds("approved == false", &wi).unwrap());
    }

    #[test]
    fn holds_numeric_comparison() {
        let eval = ConditionEvaluator::new();
        let wi = workitem_with(&[("n", json!(3))]);
        assert!(eval.holds("n >= 3", &wi).unwrap());
        assert!(!eval.holds("n > 3", &wi).unwrap());
    }

    #[test]
    fn holds_with_transform() {
        let eval = ConditionEvaluator::new();
        let wi = workitem_with(&[("name", json!("review-step"))]);
        assert!(eval.holds("name|contains('review')", &wi).unwrap());
    }

    #[test]
    fn malformed_expression_is_an_error() {
        let eval = ConditionEvaluator::new();
        let wi = workitem_with(&[]);
        assert!(eval.holds("((", &wi).is_err());
    }
}
