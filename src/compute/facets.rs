//! Structured-output handling: schema validation and JSON-path facet
//! materialization.
//!
//! The path dialect is deliberately closed: dotted keys plus `[]` for array
//! flattening. `people[].name` visits every element of `people` and extracts
//! its `name`. Nothing else is supported.

use crate::error::{ComputeError, Result};
use crate::store::analysis::AnalysisType;
use serde_json::Value;

/// Extract every value at `path`, paired with the concrete source path that
/// produced it (array segments become indices).
pub fn extract_path(root: &Value, path: &str) -> Vec<(String, String)> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    walk(root, &segments, String::new(), &mut out);
    out
}

fn walk(value: &Value, segments: &[&str], trail: String, out: &mut Vec<(String, String)>) {
    let Some((segment, rest)) = segments.split_first() else {
        if let Some(text) = scalar_to_string(value) {
            out.push((text, trail));
        }
        return;
    };

    let (key, flatten) = match segment.strip_suffix("[]") {
        Some(key) => (key, true),
        None => (*segment, false),
    };

    let Some(child) = value.get(key) else {
        return;
    };
    let child_trail = if trail.is_empty() {
        key.to_string()
    } else {
        format!("{trail}.{key}")
    };

    if flatten {
        if let Value::Array(items) = child {
            for (index, item) in items.iter().enumerate() {
                walk(item, rest, format!("{child_trail}[{index}]"), out);
            }
        }
    } else {
        walk(child, rest, child_trail, out);
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Validate model output against the analysis type's stored schema. The
/// schema dialect is a closed subset: `type`, `required`, `properties`, and
/// `items`.
pub fn validate_output(schema: &Value, output: &Value) -> Result<()> {
    check(schema, output, "$").map_err(|message| ComputeError::Schema(message).into())
}

fn check(schema: &Value, output: &Value, at: &str) -> std::result::Result<(), String> {
    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        let actual = json_type(output);
        if expected != actual {
            return Err(format!("{at}: expected {expected}, got {actual}"));
        }
    }

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if output.get(key).is_none() {
                return Err(format!("{at}: missing required key {key}"));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (key, subschema) in properties {
            if let Some(child) = output.get(key) {
                check(subschema, child, &format!("{at}.{key}"))?;
            }
        }
    }

    if let Some(items) = schema.get("items")
        && let Value::Array(elements) = output
    {
        for (index, element) in elements.iter().enumerate() {
            check(items, element, &format!("{at}[{index}]"))?;
        }
    }

    Ok(())
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Materialize facets from validated output per the type's mapping config.
/// Returns (facet_type, value, confidence, source_path) tuples ready for the
/// batch writer.
pub fn materialize(
    definition: &AnalysisType,
    output: &Value,
) -> Vec<(String, String, f64, String)> {
    let mut facets = Vec::new();
    for mapping in &definition.facet_mappings {
        for (value, source_path) in extract_path(output, &mapping.path) {
            if value.trim().is_empty() {
                continue;
            }
            facets.push((
                mapping.facet_type.clone(),
                value,
                mapping.confidence,
                source_path,
            ));
        }
    }
    facets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::analysis::FacetMapping;
    use serde_json::json;

    #[test]
    fn dotted_path_extracts_nested_scalar() {
        let output = json!({ "summary": { "topic": "travel plans" } });
        assert_eq!(
            extract_path(&output, "summary.topic"),
            vec![("travel plans".to_string(), "summary.topic".to_string())]
        );
    }

    #[test]
    fn array_segment_flattens_with_indices() {
        let output = json!({
            "people": [
                { "name": "Alice", "employer": "Initrode" },
                { "name": "Bob" },
            ]
        });
        assert_eq!(
            extract_path(&output, "people[].name"),
            vec![
                ("Alice".to_string(), "people[0].name".to_string()),
                ("Bob".to_string(), "people[1].name".to_string()),
            ]
        );
        // Missing keys inside elements just skip.
        assert_eq!(extract_path(&output, "people[].employer").len(), 1);
    }

    #[test]
    fn missing_path_yields_nothing() {
        let output = json!({ "a": 1 });
        assert!(extract_path(&output, "b.c").is_empty());
    }

    #[test]
    fn schema_validation_checks_types_and_required() {
        let schema = json!({
            "type": "object",
            "required": ["topics"],
            "properties": {
                "topics": { "type": "array", "items": { "type": "string" } },
                "sentiment": { "type": "string" },
            }
        });

        assert!(validate_output(&schema, &json!({ "topics": ["a", "b"] })).is_ok());
        assert!(validate_output(&schema, &json!({ "sentiment": "warm" })).is_err());
        assert!(validate_output(&schema, &json!({ "topics": [1] })).is_err());
    }

    #[test]
    fn materialize_applies_mapping_confidence() {
        let definition = AnalysisType {
            name: "insights".to_string(),
            version: 1,
            prompt_template: String::new(),
            output_schema: json!({}),
            facet_mappings: vec![FacetMapping {
                path: "people[].name".to_string(),
                facet_type: "mentioned_person".to_string(),
                confidence: 0.8,
            }],
            model: "m".to_string(),
        };
        let output = json!({ "people": [{ "name": "Alice" }] });

        let facets = materialize(&definition, &output);
        assert_eq!(facets.len(), 1);
        assert_eq!(facets[0].0, "mentioned_person");
        assert_eq!(facets[0].1, "Alice");
        assert!((facets[0].2 - 0.8).abs() < f64::EPSILON);
        assert_eq!(facets[0].3, "people[0].name");
    }
}
