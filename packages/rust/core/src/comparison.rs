//! Per-field extraction confidence measured against an acceptance threshold.
//!
//! The mapping step reports a confidence for every field it produced under
//! the key `<field>_confidence`, where `<field>` is the dotted path of the
//! value inside the mapped result. Evaluation pairs each extracted value
//! with its confidence and flags the fields that clear the threshold.

use docpipe_shared::{DocPipeError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One evaluated field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExtractionComparisonItem {
    pub field: String,
    pub extracted: Value,
    /// Percentage with two decimals, e.g. `95.00%`.
    pub confidence: String,
    pub is_above_threshold: bool,
}

/// Every evaluated field of one document, in path order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionComparisonData {
    pub items: Vec<ExtractionComparisonItem>,
}

impl ExtractionComparisonData {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| DocPipeError::Storage(format!("failed to serialize comparison: {e}")))
    }

    /// Fields whose confidence cleared the threshold.
    pub fn accepted(&self) -> impl Iterator<Item = &ExtractionComparisonItem> {
        self.items.iter().filter(|item| item.is_above_threshold)
    }
}

/// Key under which the confidence of `field` is reported.
pub fn confidence_key(field: &str) -> String {
    format!("{field}_confidence")
}

pub fn format_confidence(confidence: f64) -> String {
    format!("{:.2}%", confidence * 100.0)
}

/// Reported confidence for `field`; unreported fields count as 0.
pub fn field_confidence(confidence: &Map<String, Value>, field: &str) -> f64 {
    confidence
        .get(&confidence_key(field))
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
}

/// Leaf values of `value` keyed by dotted path. Arrays are leaves.
pub fn flatten_fields(value: &Value) -> Vec<(String, Value)> {
    fn walk(prefix: &str, value: &Value, out: &mut Vec<(String, Value)>) {
        match value {
            Value::Object(map) => {
                for (key, inner) in map {
                    let path = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{prefix}.{key}")
                    };
                    walk(&path, inner, out);
                }
            }
            other if !prefix.is_empty() => out.push((prefix.to_string(), other.clone())),
            _ => {}
        }
    }

    let mut out = Vec::new();
    walk("", value, &mut out);
    out
}

/// Pair every field of `actual` with its confidence.
///
/// A field is above the threshold when its confidence is at least `threshold`.
pub fn get_extraction_comparison_data(
    actual: &Value,
    confidence: &Map<String, Value>,
    threshold: f64,
) -> ExtractionComparisonData {
    let items = flatten_fields(actual)
        .into_iter()
        .map(|(field, extracted)| {
            let score = field_confidence(confidence, &field);
            ExtractionComparisonItem {
                confidence: format_confidence(score),
                is_above_threshold: score >= threshold,
                field,
                extracted,
            }
        })
        .collect();
    ExtractionComparisonData { items }
}

/// Mean confidence over the fields of `data`; 0 when there are none.
pub fn overall_confidence(data: &ExtractionComparisonData, confidence: &Map<String, Value>) -> f64 {
    if data.items.is_empty() {
        return 0.0;
    }
    let total: f64 = data
        .items
        .iter()
        .map(|item| field_confidence(confidence, &item.field))
        .sum();
    total / data.items.len() as f64
}
