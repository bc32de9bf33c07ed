//! Built-in steps and the registry that resolves a step name to its logic.
//!
//! The steps are small and deterministic. Extraction reads labelled fields,
//! mapping projects them onto a registered schema, evaluation compares each
//! field's confidence against a threshold and saving keeps what passed.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use docpipe_shared::{ArtifactType, DocPipeError, Result};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::comparison::{
    ExtractionComparisonData, confidence_key, flatten_fields, get_extraction_comparison_data,
    overall_confidence,
};
use crate::content_process::ContentProcess;
use crate::handler::{Executable, MessageContext};
use crate::pipeline::{JSON_MIME_TYPE, Schema, StepResult};

pub const EXTRACT_STEP: &str = "extract";
pub const MAP_STEP: &str = "map";
pub const EVALUATE_STEP: &str = "evaluate";
pub const SAVE_STEP: &str = "save";

/// Characters of text kept in an extraction preview.
const PREVIEW_CHARS: usize = 200;

/// Longer labels are prose, not field names.
const MAX_KEY_CHARS: usize = 40;

/// Confidence a field needs for `evaluate` to accept it.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.5;

fn parse_json(step: &str, name: &str, text: &str) -> Result<Value> {
    serde_json::from_str(text)
        .map_err(|e| DocPipeError::step(step, format!("Failed to parse {name}: {e}")))
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Step name to step logic.
#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: BTreeMap<String, Arc<dyn Executable>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding `extract`, `map`, `evaluate` and `save`.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(EXTRACT_STEP, Arc::new(ExtractStep));
        registry.register(MAP_STEP, Arc::new(MapStep));
        registry.register(
            EVALUATE_STEP,
            Arc::new(EvaluateStep::new(DEFAULT_CONFIDENCE_THRESHOLD)),
        );
        registry.register(SAVE_STEP, Arc::new(SaveStep));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, step: Arc<dyn Executable>) {
        self.steps.insert(name.into(), step);
    }

    /// Look up `name`; unknown names are a configuration error.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Executable>> {
        self.steps.get(name).cloned().ok_or_else(|| {
            DocPipeError::config(format!(
                "no step named '{name}' (known: {})",
                self.names().join(", ")
            ))
        })
    }

    pub fn names(&self) -> Vec<&str> {
        self.steps.keys().map(String::as_str).collect()
    }
}

// ---------------------------------------------------------------------------
// extract
// ---------------------------------------------------------------------------

/// Describes every source file and collects its labelled fields.
///
/// JSON sources contribute their top-level object, text sources their
/// `Key: value` lines.
pub struct ExtractStep;

/// Normalize a label to `snake_case`.
fn normalize_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for c in key.trim().chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

/// `Key: value` lines of a text document. The first occurrence of a key wins.
fn key_values(text: &str) -> Map<String, Value> {
    let mut fields = Map::new();
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = normalize_key(key);
        let value = value.trim();
        if key.is_empty() || value.is_empty() || key.chars().count() > MAX_KEY_CHARS {
            continue;
        }
        fields
            .entry(key)
            .or_insert_with(|| Value::String(value.to_string()));
    }
    fields
}

fn source_fields(mime_type: Option<&str>, bytes: &[u8]) -> Map<String, Value> {
    match mime_type {
        Some(JSON_MIME_TYPE) => match serde_json::from_slice(bytes) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        },
        Some(mime) if !mime.starts_with("text/") => Map::new(),
        _ => key_values(&String::from_utf8_lossy(bytes)),
    }
}

#[async_trait]
impl Executable for ExtractStep {
    async fn execute(&self, context: &mut MessageContext) -> Result<StepResult> {
        let process_id = context.process_id()?.to_string();
        let sources: Vec<_> = context
            .pipeline
            .get_source_files()
            .into_iter()
            .cloned()
            .collect();
        if sources.is_empty() {
            return Err(DocPipeError::step(EXTRACT_STEP, "no source files to extract"));
        }

        let mut written = Vec::new();
        for source in sources {
            let bytes = source.download_stream(context.blobs()).await?;
            let text = String::from_utf8_lossy(&bytes);
            let extracted = json!({
                "name": source.name,
                "size": bytes.len(),
                "mime_type": source.mime_type,
                "line_count": text.lines().count(),
                "word_count": text.split_whitespace().count(),
                "preview": text.chars().take(PREVIEW_CHARS).collect::<String>(),
                "fields": source_fields(source.mime_type.as_deref(), &bytes),
            });

            let name = format!("{}.extracted.json", source.name);
            context
                .upload_output_json(&name, ArtifactType::ExtractedContent, &extracted)
                .await?;
            debug!(source = %source.name, output = %name, "extracted");
            written.push(name);
        }

        Ok(StepResult::new(process_id, EXTRACT_STEP, json!({ "files": written })))
    }
}

// ---------------------------------------------------------------------------
// map
// ---------------------------------------------------------------------------

/// Projects the extraction onto the work item's schema and reports a
/// confidence for every mapped field.
///
/// Without a schema, or with one listing no fields, every extracted field
/// is kept.
pub struct MapStep;

/// 1 when the value carries data, 0 when it is null or empty.
fn presence_confidence(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::String(s) if s.trim().is_empty() => 0.0,
        Value::Array(items) if items.is_empty() => 0.0,
        _ => 1.0,
    }
}

fn json_pointer(path: &str) -> String {
    path.split('.')
        .map(|segment| format!("/{}", segment.replace('~', "~0").replace('/', "~1")))
        .collect()
}

/// Set `value` at dotted `path`, creating intermediate objects.
fn insert_path(root: &mut Map<String, Value>, path: &str, value: Value) {
    let mut segments = path.split('.').peekable();
    let mut current = root;
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            current.insert(segment.to_string(), value);
            return;
        }
        let slot = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        let Value::Object(next) = slot else {
            return;
        };
        current = next;
    }
}

/// Mapped result and its `<field>_confidence` map.
fn map_fields(extracted: &Value, schema: Option<&Schema>) -> (Value, Map<String, Value>) {
    let result = match schema {
        Some(schema) if !schema.fields.is_empty() => {
            let mut mapped = Map::new();
            for path in &schema.fields {
                let value = extracted
                    .pointer(&json_pointer(path))
                    .cloned()
                    .unwrap_or(Value::Null);
                insert_path(&mut mapped, path, value);
            }
            Value::Object(mapped)
        }
        _ => extracted.clone(),
    };

    let confidence = flatten_fields(&result)
        .into_iter()
        .map(|(field, value)| (confidence_key(&field), json!(presence_confidence(&value))))
        .collect();
    (result, confidence)
}

#[async_trait]
impl Executable for MapStep {
    async fn execute(&self, context: &mut MessageContext) -> Result<StepResult> {
        let process_id = context.process_id()?.to_string();
        let text = context
            .download_output_file_to_json_string(EXTRACT_STEP, ArtifactType::ExtractedContent)
            .await?;
        let extracted = parse_json(MAP_STEP, "extracted content", &text)?;

        let schema_id = context.pipeline.schema_id.clone();
        let schema = match schema_id.as_deref() {
            Some(id) => Some(
                Schema::get_schema(
                    context.ctx.documents.as_ref(),
                    context.ctx.schema_collection(),
                    Some(id),
                )
                .await?,
            ),
            None => None,
        };

        let (result, confidence) = map_fields(&extracted, schema.as_ref());
        let field_count = confidence.len();

        let name = format!("{process_id}.mapped.json");
        context
            .upload_output_json(
                &name,
                ArtifactType::SchemaMappedData,
                &json!({
                    "schema_id": schema_id,
                    "result": result,
                    "confidence": confidence,
                }),
            )
            .await?;

        Ok(StepResult::new(
            process_id,
            MAP_STEP,
            json!({ "file": name, "schema_id": schema_id, "field_count": field_count }),
        ))
    }
}

// ---------------------------------------------------------------------------
// evaluate
// ---------------------------------------------------------------------------

/// Compares each mapped field's confidence against the threshold.
pub struct EvaluateStep {
    threshold: f64,
}

impl EvaluateStep {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

#[async_trait]
impl Executable for EvaluateStep {
    async fn execute(&self, context: &mut MessageContext) -> Result<StepResult> {
        let process_id = context.process_id()?.to_string();
        let text = context
            .download_output_file_to_json_string(MAP_STEP, ArtifactType::SchemaMappedData)
            .await?;
        let mapped = parse_json(EVALUATE_STEP, "mapped data", &text)?;

        let result = mapped
            .get("result")
            .ok_or_else(|| DocPipeError::step(EVALUATE_STEP, "mapped data has no result"))?;
        let confidence = mapped
            .get("confidence")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let comparison = get_extraction_comparison_data(result, &confidence, self.threshold);
        let overall = overall_confidence(&comparison, &confidence);
        let accepted = comparison.accepted().count();

        let name = format!("{process_id}.evaluated.json");
        context
            .upload_output_json(
                &name,
                ArtifactType::ScoreMergedData,
                &json!({
                    "schema_id": mapped.get("schema_id").cloned().unwrap_or(Value::Null),
                    "threshold": self.threshold,
                    "overall_confidence": overall,
                    "items": comparison.items,
                }),
            )
            .await?;

        Ok(StepResult::new(
            process_id,
            EVALUATE_STEP,
            json!({
                "file": name,
                "overall_confidence": overall,
                "accepted_fields": accepted,
            }),
        ))
    }
}

// ---------------------------------------------------------------------------
// save
// ---------------------------------------------------------------------------

/// Persists accepted fields and reports them on the process record.
pub struct SaveStep;

#[async_trait]
impl Executable for SaveStep {
    async fn execute(&self, context: &mut MessageContext) -> Result<StepResult> {
        let process_id = context.process_id()?.to_string();
        let text = context
            .download_output_file_to_json_string(EVALUATE_STEP, ArtifactType::ScoreMergedData)
            .await?;
        let evaluated = parse_json(SAVE_STEP, "evaluated data", &text)?;
        let comparison: ExtractionComparisonData = serde_json::from_value(evaluated.clone())
            .map_err(|e| DocPipeError::step(SAVE_STEP, format!("Failed to parse comparison: {e}")))?;

        let accepted: Map<String, Value> = comparison
            .accepted()
            .map(|item| (item.field.clone(), item.extracted.clone()))
            .collect();

        let saved = json!({
            "process_id": process_id,
            "schema_id": evaluated.get("schema_id").cloned().unwrap_or(Value::Null),
            "overall_confidence": evaluated.get("overall_confidence").cloned().unwrap_or(Value::Null),
            "fields": accepted,
        });
        let name = format!("{process_id}.saved.json");
        context
            .upload_output_json(&name, ArtifactType::SavedContent, &saved)
            .await?;

        let documents = context.ctx.documents.clone();
        let collection = context.ctx.process_collection().to_string();
        let mut record = ContentProcess::load(documents.as_ref(), &collection, &process_id)
            .await?
            .unwrap_or_else(|| ContentProcess::new(process_id.clone(), SAVE_STEP));
        record.add_step_output(SAVE_STEP, saved.clone());
        record
            .update_process_status(documents.as_ref(), &collection)
            .await?;

        Ok(StepResult::new(
            process_id,
            SAVE_STEP,
            json!({ "file": name, "saved_fields": accepted.len() }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_resolves_default_steps() {
        let registry = StepRegistry::builtin();
        for name in [EXTRACT_STEP, MAP_STEP, EVALUATE_STEP, SAVE_STEP] {
            assert!(registry.get(name).is_ok(), "{name} missing");
        }
        assert_eq!(registry.names(), vec!["evaluate", "extract", "map", "save"]);
    }

    #[test]
    fn unknown_step_is_config_error() {
        let err = StepRegistry::builtin().get("translate").err().unwrap();
        assert!(matches!(err, DocPipeError::Config { .. }));
        assert!(err.to_string().contains("translate"));
    }

    #[test]
    fn labels_become_snake_case_keys() {
        assert_eq!(normalize_key(" Invoice Number "), "invoice_number");
        assert_eq!(normalize_key("Due-Date (UTC)"), "due_date_utc");
        assert_eq!(normalize_key("--"), "");
    }

    #[test]
    fn key_value_lines_are_collected() {
        let fields = key_values("Invoice 42\nCustomer: Contoso\nTotal: 1200 EUR\nTotal: 5\nNote:\n");
        assert_eq!(
            Value::Object(fields),
            json!({"customer": "Contoso", "total": "1200 EUR"})
        );
    }

    #[test]
    fn source_fields_depend_on_mime_type() {
        let json_fields = source_fields(Some(JSON_MIME_TYPE), br#"{"customer": "Contoso"}"#);
        assert_eq!(json_fields.get("customer"), Some(&json!("Contoso")));
        assert!(source_fields(Some("application/pdf"), b"Customer: x").is_empty());
        assert_eq!(source_fields(None, b"Customer: x").len(), 1);
        assert_eq!(source_fields(Some("text/plain"), b"Customer: x").len(), 1);
    }

    #[test]
    fn insert_path_builds_nested_objects() {
        let mut root = Map::new();
        insert_path(&mut root, "fields.customer", json!("Contoso"));
        insert_path(&mut root, "fields.total", json!("1200"));
        insert_path(&mut root, "name", json!("a.txt"));
        assert_eq!(
            Value::Object(root),
            json!({"fields": {"customer": "Contoso", "total": "1200"}, "name": "a.txt"})
        );
    }

    #[test]
    fn mapping_without_schema_keeps_every_field() {
        let extracted = json!({"name": "a.txt", "fields": {"customer": "Contoso", "note": ""}});
        let (result, confidence) = map_fields(&extracted, None);
        assert_eq!(result, extracted);
        assert_eq!(confidence.get("name_confidence"), Some(&json!(1.0)));
        assert_eq!(confidence.get("fields.customer_confidence"), Some(&json!(1.0)));
        assert_eq!(confidence.get("fields.note_confidence"), Some(&json!(0.0)));
    }

    #[test]
    fn mapping_with_schema_projects_listed_fields() {
        let extracted = json!({"name": "a.txt", "fields": {"customer": "Contoso", "total": "12"}});
        let schema = Schema {
            id: "invoice".into(),
            fields: vec!["fields.customer".into(), "fields.due_date".into()],
            ..Schema::default()
        };
        let (result, confidence) = map_fields(&extracted, Some(&schema));
        assert_eq!(
            result,
            json!({"fields": {"customer": "Contoso", "due_date": null}})
        );
        assert_eq!(confidence.len(), 2);
        assert_eq!(confidence.get("fields.due_date_confidence"), Some(&json!(0.0)));

        let comparison = get_extraction_comparison_data(&result, &confidence, DEFAULT_CONFIDENCE_THRESHOLD);
        let accepted: Vec<_> = comparison.accepted().map(|i| i.field.as_str()).collect();
        assert_eq!(accepted, vec!["fields.customer"]);
    }

    #[test]
    fn json_pointer_escapes_segments() {
        assert_eq!(json_pointer("a.b"), "/a/b");
        assert_eq!(json_pointer("a~b/c"), "/a~0b~1c");
    }
}
