//! minijinja-backed evaluator

use minijinja::Environment;
use serde_json::{Map, Value};

use super::{ExpressionError, ExpressionEvaluator};

/// Evaluator using minijinja's expression language
///
/// `&&`, `||` and `!` are accepted as aliases of `and`, `or` and `not`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MiniJinjaEvaluator;

impl MiniJinjaEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Strip `${}` and rewrite C-style logical operators outside string literals
    fn normalize(expression: &str) -> String {
        let trimmed = expression.trim();
        let body = trimmed
            .strip_prefix("${")
            .and_then(|s| s.strip_suffix('}'))
            .unwrap_or(trimmed);

        let mut out = String::with_capacity(body.len() + 8);
        let mut chars = body.chars().peekable();
        let mut quote: Option<char> = None;

        while let Some(c) = chars.next() {
            if let Some(q) = quote {
                out.push(c);
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                } else if c == q {
                    quote = None;
                }
                continue;
            }

            match c {
                '"' | '\'' => {
                    quote = Some(c);
                    out.push(c);
                }
                '&' if chars.peek() == Some(&'&') => {
                    chars.next();
                    out.push_str(" and ");
                }
                '|' if chars.peek() == Some(&'|') => {
                    chars.next();
                    out.push_str(" or ");
                }
                '!' if chars.peek() != Some(&'=') => out.push_str(" not "),
                _ => out.push(c),
            }
        }
        out
    }
}

impl ExpressionEvaluator for MiniJinjaEvaluator {
    fn evaluate(
        &self,
        expression: &str,
        variables: &Map<String, Value>,
    ) -> Result<Value, ExpressionError> {
        let source = Self::normalize(expression);
        let env = Environment::new();

        let compiled = env
            .compile_expression(&source)
            .map_err(|e| ExpressionError::Syntax {
                expression: expression.to_string(),
                message: e.to_string(),
            })?;

        let result = compiled
            .eval(variables)
            .map_err(|e| ExpressionError::Evaluation {
                expression: expression.to_string(),
                message: e.to_string(),
            })?;

        if result.is_undefined() || result.is_none() {
            return Ok(Value::Null);
        }

        serde_json::to_value(&result).map_err(|e| ExpressionError::Evaluation {
            expression: expression.to_string(),
            message: e.to_string(),
        })
    }
}
