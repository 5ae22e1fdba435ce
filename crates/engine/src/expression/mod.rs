//! Expression evaluation behind a narrow trait
//!
//! Conditions and mappings use `${...}` syntax. The engine only needs to know
//! whether a string is an expression and what it evaluates to against a
//! variable map; the grammar belongs to the implementation.

mod jinja;

use serde_json::{Map, Value};

use crate::runtime::VariableType;

pub use jinja::MiniJinjaEvaluator;

/// Expression evaluation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExpressionError {
    #[error("invalid expression {expression}: {message}")]
    Syntax { expression: String, message: String },

    #[error("failed to evaluate {expression}: {message}")]
    Evaluation { expression: String, message: String },

    #[error("expression {expression} did not produce a {expected:?}")]
    TypeMismatch {
        expression: String,
        expected: VariableType,
    },
}

/// Evaluates `${...}` expressions against variables
pub trait ExpressionEvaluator: Send + Sync {
    /// Whether `source` uses expression syntax
    fn is_expression(&self, source: &str) -> bool {
        let trimmed = source.trim();
        trimmed.starts_with("${") && trimmed.ends_with('}')
    }

    /// Evaluate to an untyped value
    fn evaluate(&self, expression: &str, variables: &Map<String, Value>)
        -> Result<Value, ExpressionError>;

    /// Evaluate a condition
    ///
    /// Undefined and null results are false; any other non-boolean result is
    /// a type mismatch.
    fn evaluate_boolean(
        &self,
        expression: &str,
        variables: &Map<String, Value>,
    ) -> Result<bool, ExpressionError> {
        match self.evaluate(expression, variables)? {
            Value::Bool(b) => Ok(b),
            Value::Null => Ok(false),
            _ => Err(ExpressionError::TypeMismatch {
                expression: expression.to_string(),
                expected: VariableType::Boolean,
            }),
        }
    }

    /// Evaluate and check the result against `expected`
    fn evaluate_as(
        &self,
        expression: &str,
        variables: &Map<String, Value>,
        expected: VariableType,
    ) -> Result<Value, ExpressionError> {
        let value = self.evaluate(expression, variables)?;
        let actual = VariableType::infer(&value);
        let compatible = match expected {
            VariableType::Long => matches!(actual, VariableType::Integer | VariableType::Long),
            VariableType::Double | VariableType::Float => matches!(
                actual,
                VariableType::Integer | VariableType::Long | VariableType::Double
            ),
            other => actual == other || actual == VariableType::Null,
        };
        if compatible {
            Ok(value)
        } else {
            Err(ExpressionError::TypeMismatch {
                expression: expression.to_string(),
                expected,
            })
        }
    }

    /// Evaluate expressions, pass literals through as strings
    fn resolve(&self, source: &str, variables: &Map<String, Value>) -> Result<Value, ExpressionError> {
        if self.is_expression(source) {
            self.evaluate(source, variables)
        } else {
            Ok(Value::String(source.to_string()))
        }
    }
}
