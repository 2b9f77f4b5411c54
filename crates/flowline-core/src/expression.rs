//! Branch expression evaluation.
//!
//! Branch steps carry an infix expression (identifiers, literals,
//! comparison and boolean operators) evaluated against the instance's
//! merged context. The result must be a boolean; anything else is an
//! execution error that sends the instance into rollback.

use flowline_types::ContextMap;
use serde_json::Value;

use crate::error::EngineError;

/// Evaluator for branch expressions.
///
/// Identifiers resolve against the context mapping; a small set of
/// transforms is available (`lower`, `upper`, `length`).
pub struct ExpressionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ExpressionEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(Value::String(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(Value::String(s.to_uppercase()))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.len(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(Value::from(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate `expression` against `ctx`, requiring a boolean result.
    pub fn evaluate_bool(&self, expression: &str, ctx: &ContextMap) -> Result<bool, EngineError> {
        let mut context = Value::Object(ctx.clone());
        // Expression literals parse as floats; align context numbers so
        // `k == 1` holds for an integer-valued `k`.
        normalize_numbers(&mut context);

        let result = self
            .evaluator
            .eval_in_context(expression, &context)
            .map_err(|e| EngineError::Expression {
                expression: expression.to_string(),
                message: e.to_string(),
            })?;

        match result {
            Value::Bool(b) => Ok(b),
            other => Err(EngineError::NotBoolean {
                expression: expression.to_string(),
                value: other,
            }),
        }
    }
}

impl Default for ExpressionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_numbers(value: &mut Value) {
    match value {
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                if let Some(float) = serde_json::Number::from_f64(f) {
                    *value = Value::Number(float);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(normalize_numbers),
        Value::Object(map) => map.values_mut().for_each(normalize_numbers),
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
