//! Process variables and scope resolution
//!
//! Values are stored string-encoded with a type tag so any store can persist
//! them in a single text column. A variable belongs to the scope named by its
//! `execution_definition_id`: the process definition key for process-level
//! variables, an activity id for activity-local ones.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use uuid::Uuid;

/// Variable type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    Null,
    Integer,
    Long,
    Boolean,
    Double,
    Float,
    String,
    List,
    Map,
}

impl VariableType {
    /// Infer the tag from a value
    ///
    /// Whole numbers inside the 32-bit range are integers, other whole numbers
    /// longs, fractional numbers doubles. The strings `"true"` and `"false"`
    /// are booleans.
    pub fn infer(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(_) => Self::Boolean,
            Value::Number(n) => match n.as_i64() {
                Some(i) if i32::try_from(i).is_ok() => Self::Integer,
                Some(_) => Self::Long,
                None if n.is_u64() => Self::Long,
                None => Self::Double,
            },
            Value::String(s) if s == "true" || s == "false" => Self::Boolean,
            Value::String(_) => Self::String,
            Value::Array(_) => Self::List,
            Value::Object(_) => Self::Map,
        }
    }
}

/// A stored variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub key: String,

    /// String-encoded value
    pub value: String,

    pub var_type: VariableType,
    pub process_id: Uuid,

    /// Process id, or the activity execution id for activity-local variables
    pub execution_id: Uuid,

    /// Scope identifier used for resolution and correlation
    pub execution_definition_id: String,
}

impl Variable {
    /// Encode `value` with an inferred type
    pub fn new(
        key: impl Into<String>,
        value: &Value,
        process_id: Uuid,
        execution_id: Uuid,
        scope: impl Into<String>,
    ) -> Self {
        Self::typed(key, value, VariableType::infer(value), process_id, execution_id, scope)
    }

    /// Encode `value` with an explicit type
    pub fn typed(
        key: impl Into<String>,
        value: &Value,
        var_type: VariableType,
        process_id: Uuid,
        execution_id: Uuid,
        scope: impl Into<String>,
    ) -> Self {
        let value = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Self {
            key: key.into(),
            value,
            var_type,
            process_id,
            execution_id,
            execution_definition_id: scope.into(),
        }
    }

    /// Decode the stored value
    ///
    /// A value that no longer parses as its tag decodes as a plain string.
    pub fn to_value(&self) -> Value {
        let raw = || Value::String(self.value.clone());
        match self.var_type {
            VariableType::Null => Value::Null,
            VariableType::Integer | VariableType::Long => match self.value.parse::<i64>() {
                Ok(n) => Value::from(n),
                Err(_) => self.value.parse::<u64>().map(Value::from).unwrap_or_else(|_| raw()),
            },
            VariableType::Boolean => self
                .value
                .parse::<bool>()
                .map(Value::Bool)
                .unwrap_or_else(|_| raw()),
            VariableType::Double | VariableType::Float => self
                .value
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .unwrap_or_else(raw),
            VariableType::String => raw(),
            VariableType::List | VariableType::Map => {
                serde_json::from_str(&self.value).unwrap_or_else(|_| raw())
            }
        }
    }

    pub fn in_scope(&self, scope: &str) -> bool {
        self.execution_definition_id == scope
    }
}

/// Encode a map of values into variables of one scope
pub fn from_map(
    values: &Map<String, Value>,
    process_id: Uuid,
    execution_id: Uuid,
    scope: &str,
) -> Vec<Variable> {
    values
        .iter()
        .map(|(key, value)| Variable::new(key, value, process_id, execution_id, scope))
        .collect()
}

/// Merge variables along a scope chain, nearest scope winning
///
/// `scope` is ordered nearest first. Variables outside the chain are ignored.
pub fn to_map(variables: &[Variable], scope: &[String]) -> Map<String, Value> {
    let mut resolved = Map::new();
    for scope_id in scope {
        for variable in variables.iter().filter(|v| v.in_scope(scope_id)) {
            if !resolved.contains_key(&variable.key) {
                resolved.insert(variable.key.clone(), variable.to_value());
            }
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn var(key: &str, value: Value, scope: &str) -> Variable {
        let id = Uuid::nil();
        Variable::new(key, &value, id, id, scope)
    }

    #[test]
    fn test_unsigned_long_decodes_as_number() {
        let big = var("big", json!(u64::MAX), "order");
        assert_eq!(big.var_type, VariableType::Long);
        assert_eq!(big.to_value(), json!(u64::MAX));
    }

    #[test]
    fn test_type_inference() {
        assert_eq!(VariableType::infer(&json!(null)), VariableType::Null);
        assert_eq!(VariableType::infer(&json!(42)), VariableType::Integer);
        assert_eq!(VariableType::infer(&json!(5_000_000_000i64)), VariableType::Long);
        assert_eq!(VariableType::infer(&json!(1.5)), VariableType::Double);
        assert_eq!(VariableType::infer(&json!("hi")), VariableType::String);
        assert_eq!(VariableType::infer(&json!([1, 2])), VariableType::List);
        assert_eq!(VariableType::infer(&json!({"a": 1})), VariableType::Map);
    }

    #[test]
    fn test_boolean_strings_are_booleans() {
        let variable = var("flag", json!("true"), "p");
        assert_eq!(variable.var_type, VariableType::Boolean);
        assert_eq!(variable.to_value(), json!(true));

        let variable = var("flag", json!("false"), "p");
        assert_eq!(variable.to_value(), json!(false));
    }

    #[test]
    fn test_round_trip_every_type() {
        let values = json!({
            "nothing": null,
            "int": 7,
            "long": 9_000_000_000i64,
            "bool": true,
            "double": 2.25,
            "text": "hello",
            "list": [1, "two", 3.5],
            "map": {"nested": {"deep": [true]}}
        });
        let map = values.as_object().unwrap().clone();

        let variables = from_map(&map, Uuid::nil(), Uuid::nil(), "p");
        let resolved = to_map(&variables, &["p".to_string()]);

        assert_eq!(Value::Object(resolved), values);
    }

    #[test]
    fn test_explicit_float() {
        let id = Uuid::nil();
        let variable = Variable::typed("f", &json!(0.5), VariableType::Float, id, id, "p");
        assert_eq!(variable.var_type, VariableType::Float);
        assert_eq!(variable.to_value(), json!(0.5));
    }

    #[test]
    fn test_nearest_scope_wins() {
        let variables = vec![
            var("foo", json!("process"), "proc"),
            var("foo", json!("local"), "task"),
            var("bar", json!(1), "proc"),
        ];

        let inside = to_map(&variables, &["task".into(), "sub".into(), "proc".into()]);
        assert_eq!(inside["foo"], json!("local"));
        assert_eq!(inside["bar"], json!(1));

        let outside = to_map(&variables, &["other".into(), "proc".into()]);
        assert_eq!(outside["foo"], json!("process"));
    }

    #[test]
    fn test_unparseable_value_decodes_as_string() {
        let mut variable = var("n", json!(3), "p");
        variable.value = "three".into();
        assert_eq!(variable.to_value(), json!("three"));
    }
}
