//! Registered target schemas the mapping step projects documents onto.

use chrono::{DateTime, Utc};
use docpipe_shared::{DocPipeError, DocumentStore, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// A schema record, stored as `{"Id": .., "ClassName": .., ..}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Schema {
    pub id: String,
    pub class_name: String,
    pub description: String,
    pub file_name: String,
    pub content_type: String,
    #[serde(rename = "Created_On", skip_serializing_if = "Option::is_none")]
    pub created_on: Option<DateTime<Utc>>,
    #[serde(rename = "Updated_On", skip_serializing_if = "Option::is_none")]
    pub updated_on: Option<DateTime<Utc>>,
    /// Dotted field paths kept by the mapping step, in output order.
    pub fields: Vec<String>,
}

fn id_filter(schema_id: &str) -> Map<String, Value> {
    let mut filter = Map::new();
    filter.insert("Id".into(), Value::String(schema_id.to_string()));
    filter
}

fn require_id(schema_id: Option<&str>) -> Result<&str> {
    match schema_id.map(str::trim) {
        Some(id) if !id.is_empty() => Ok(id),
        _ => Err(DocPipeError::validation("Schema Id is not provided")),
    }
}

impl Schema {
    /// Look up the schema with `schema_id` in `collection`.
    pub async fn get_schema(
        documents: &dyn DocumentStore,
        collection: &str,
        schema_id: Option<&str>,
    ) -> Result<Self> {
        let schema_id = require_id(schema_id)?;
        let found = documents.find(collection, &id_filter(schema_id)).await?;
        let Some(document) = found.into_iter().next() else {
            return Err(DocPipeError::not_found(format!(
                "Schema {schema_id} not found in {collection}"
            )));
        };
        serde_json::from_value(document)
            .map_err(|e| DocPipeError::parse(format!("Failed to parse schema {schema_id}: {e}")))
    }

    /// Insert or replace this schema, stamping its timestamps.
    pub async fn register(&mut self, documents: &dyn DocumentStore, collection: &str) -> Result<()> {
        let schema_id = require_id(Some(&self.id))?.to_string();
        let filter = id_filter(&schema_id);
        let existing = documents.find(collection, &filter).await?;

        let now = Utc::now();
        self.updated_on = Some(now);
        if self.created_on.is_none() {
            self.created_on = existing
                .first()
                .and_then(|doc| doc.get("Created_On"))
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .or(Some(now));
        }

        let document = serde_json::to_value(&*self)
            .map_err(|e| DocPipeError::Storage(format!("failed to serialize schema: {e}")))?;
        if existing.is_empty() {
            documents.insert(collection, &document).await?;
        } else {
            documents.update(collection, &filter, &document).await?;
        }
        debug!(schema_id = %schema_id, fields = self.fields.len(), "schema registered");
        Ok(())
    }
}
