use std::str::FromStr;

use serde_json::{Map, Number, Value};

use crate::config::TrainingError;

/// A `key.path=value` assignment applied to the merged configuration tree.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigOverride {
    pub path: String,
    pub value: String,
}

impl FromStr for ConfigOverride {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

impl ConfigOverride {
    pub fn apply(&self, tree: &mut Value) -> Result<(), TrainingError> {
        let segments = parse_path(&self.path)?;
        if segments.is_empty() {
            return Err(TrainingError::ConfigFormat(
                "override path must not be empty".into(),
            ));
        }
        assign_at_path(tree, &segments, parse_override_value(&self.value))
    }
}

/// Deep-merges `overlay` into `base`: maps merge key by key, anything else replaces.
pub fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

pub fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") || trimmed.eq_ignore_ascii_case("none") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

#[derive(Debug)]
struct PathSegment {
    key: String,
    index: Option<usize>,
}

fn parse_path(path: &str) -> Result<Vec<PathSegment>, TrainingError> {
    path.split('.')
        .map(|segment| {
            if let Some((base, idx_part)) = segment.split_once('[') {
                let idx_str = idx_part.trim_end_matches(']');
                let index = idx_str.parse::<usize>().map_err(|err| {
                    TrainingError::ConfigFormat(format!(
                        "invalid index in override path '{}': {}",
                        segment, err
                    ))
                })?;
                Ok(PathSegment {
                    key: base.to_string(),
                    index: Some(index),
                })
            } else if segment.is_empty() {
                Err(TrainingError::ConfigFormat(format!(
                    "empty segment in override path '{}'",
                    path
                )))
            } else {
                Ok(PathSegment {
                    key: segment.to_string(),
                    index: None,
                })
            }
        })
        .collect()
}

fn object_at<'a>(
    value: &'a mut Value,
    key: &str,
) -> Result<&'a mut Map<String, Value>, TrainingError> {
    if value.is_null() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(TrainingError::ConfigFormat(format!(
            "override path segment '{}' points into a non-object value",
            key
        ))),
    }
}

fn array_at<'a>(value: &'a mut Value, key: &str) -> Result<&'a mut Vec<Value>, TrainingError> {
    if value.is_null() {
        *value = Value::Array(Vec::new());
    }
    match value {
        Value::Array(items) => Ok(items),
        _ => Err(TrainingError::ConfigFormat(format!(
            "override path segment '{}' expects array value",
            key
        ))),
    }
}

fn assign_at_path(
    target: &mut Value,
    segments: &[PathSegment],
    new_value: Value,
) -> Result<(), TrainingError> {
    let Some((segment, rest)) = segments.split_first() else {
        *target = new_value;
        return Ok(());
    };

    let entry = object_at(target, &segment.key)?
        .entry(segment.key.clone())
        .or_insert(Value::Null);

    let slot = match segment.index {
        Some(array_index) => {
            let array = array_at(entry, &segment.key)?;
            while array.len() <= array_index {
                array.push(Value::Null);
            }
            &mut array[array_index]
        }
        None => entry,
    };
    assign_at_path(slot, rest, new_value)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn apply(tree: &mut Value, raw: &str) {
        raw.parse::<ConfigOverride>().unwrap().apply(tree).unwrap();
    }

    #[test]
    fn values_are_typed() {
        assert_eq!(parse_override_value("TRUE"), json!(true));
        assert_eq!(parse_override_value("none"), Value::Null);
        assert_eq!(parse_override_value("12"), json!(12));
        assert_eq!(parse_override_value("1e-4"), json!(1e-4));
        assert_eq!(parse_override_value("[1, 2]"), json!([1, 2]));
        assert_eq!(parse_override_value("gpt2-small"), json!("gpt2-small"));
    }

    #[test]
    fn nested_and_indexed_paths_are_created() {
        let mut tree = json!({"model": {"id": "gpt2-small"}});
        apply(&mut tree, "model.seq_len=128");
        apply(&mut tree, "dataset.files.train[1]=b.txt");
        assert_eq!(
            tree,
            json!({
                "model": {"id": "gpt2-small", "seq_len": 128},
                "dataset": {"files": {"train": [null, "b.txt"]}}
            })
        );
    }

    #[test]
    fn scalar_in_the_way_is_an_error() {
        let mut tree = json!({"seed": 3});
        let err = "seed.value=1"
            .parse::<ConfigOverride>()
            .unwrap()
            .apply(&mut tree)
            .unwrap_err();
        assert!(err.to_string().contains("non-object"));
        assert!("novalue".parse::<ConfigOverride>().is_err());
    }

    #[test]
    fn merge_is_deep_for_maps_only() {
        let mut base = json!({"a": {"x": 1, "y": [1, 2]}, "b": 1});
        merge_values(&mut base, json!({"a": {"y": [3]}, "c": true}));
        assert_eq!(base, json!({"a": {"x": 1, "y": [3]}, "b": 1, "c": true}));
    }
}
