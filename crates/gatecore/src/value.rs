use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Token payload: variable name to value, in a stable order.
pub type Variables = BTreeMap<String, Value>;

/// Dynamic value carried in instance payloads and messages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Follow a dotted path such as `order.customer.id`.
    pub fn lookup<'a>(variables: &'a Variables, path: &str) -> Option<&'a Value> {
        let mut segments = path.split('.');
        let mut current = variables.get(segments.next()?)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or_default()),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(fields) => Value::Object(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Convert a JSON object into variables; anything else is rejected.
pub fn variables_from_json(json: serde_json::Value) -> Option<Variables> {
    match Value::from(json) {
        Value::Object(fields) => Some(fields),
        Value::Null => Some(Variables::new()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn converts_plain_json_documents() {
        let variables = variables_from_json(json!({
            "foo": 4,
            "name": "order",
            "items": [1, "two", null],
            "nested": { "flag": true }
        }))
        .unwrap();

        assert_eq!(variables["foo"], Value::Number(4.0));
        assert_eq!(variables["name"].as_str(), Some("order"));
        assert_eq!(variables["items"].as_array().map(|a| a.len()), Some(3));
        assert_eq!(
            Value::lookup(&variables, "nested.flag").and_then(Value::as_bool),
            Some(true)
        );
        assert!(variables_from_json(json!([1, 2])).is_none());
    }

    #[test]
    fn serializes_as_natural_json() {
        let mut variables = Variables::new();
        variables.insert("key1".into(), "val1".into());
        variables.insert("list".into(), Value::Array(vec![1i64.into(), Value::Null]));

        let text = serde_json::to_string(&variables).unwrap();
        assert_eq!(text, r#"{"key1":"val1","list":[1.0,null]}"#);

        let back: Variables = serde_json::from_str(&text).unwrap();
        assert_eq!(back, variables);
    }
}
