//! End-to-end run of the built-in pipeline through the handler protocol.

use std::sync::Arc;

use docpipe_core::content_process::{self, ContentProcess};
use docpipe_core::{Handler, MessageOutcome, Pipeline, Schema, StepRegistry, submit_document};
use docpipe_shared::{AppConfig, ArtifactType, BlobStore, QueueService, request_queue_name};
use docpipe_storage::Storage;
use docpipe_storage::memory::MemoryBackend;
use serde_json::Value;

async fn run_all_steps(ctx: Arc<docpipe_shared::ProcessContext>, schema_id: Option<&str>) -> String {
    let registry = StepRegistry::builtin();
    let mut handlers = Vec::new();
    for step in ctx.steps() {
        let executable = registry.get(step).expect("builtin step");
        handlers.push(Handler::new(ctx.clone(), step.clone(), executable).await.expect("handler"));
    }

    let submission = submit_document(
        &ctx,
        "invoice.txt",
        b"Invoice 42\nCustomer: Contoso\nTotal: 1200 EUR\n",
        schema_id,
    )
    .await
    .expect("submit");

    let last = handlers.len() - 1;
    for (i, handler) in handlers.iter().enumerate() {
        let outcome = handler.process_next_message().await.expect("cycle");
        if i == last {
            assert_eq!(outcome, MessageOutcome::Completed);
        } else {
            assert_eq!(
                outcome,
                MessageOutcome::Forwarded {
                    next: ctx.steps()[i + 1].clone()
                }
            );
        }
    }

    for handler in &handlers {
        assert_eq!(handler.show_queue_information().await.unwrap(), 0);
    }
    submission.process_id
}

async fn assert_completed(ctx: &docpipe_shared::ProcessContext, process_id: &str) {
    let blobs = ctx.blobs.as_ref();
    let pipeline = Pipeline::load_from_persistent_storage(blobs, process_id)
        .await
        .unwrap()
        .expect("pipeline stored");

    let status = &pipeline.pipeline_status;
    assert!(status.completed);
    assert_eq!(status.completed_steps, ctx.steps());
    assert!(status.remaining_steps.is_empty());
    assert_eq!(status.process_results.len(), ctx.steps().len());

    let kinds: Vec<ArtifactType> = pipeline.files.iter().map(|f| f.artifact_type).collect();
    assert_eq!(
        kinds,
        vec![
            ArtifactType::SourceContent,
            ArtifactType::ExtractedContent,
            ArtifactType::SchemaMappedData,
            ArtifactType::ScoreMergedData,
            ArtifactType::SavedContent,
        ]
    );

    for step in ctx.steps() {
        assert!(
            blobs
                .exists(process_id, &format!("{step}-result.json"))
                .await
                .unwrap()
        );
    }

    let saved = blobs
        .download(process_id, &format!("{process_id}.saved.json"))
        .await
        .unwrap();
    let saved: Value = serde_json::from_slice(&saved).unwrap();
    assert_eq!(saved["fields"]["name"], "invoice.txt");
    assert_eq!(saved["fields"]["fields.customer"], "Contoso");
    assert_eq!(saved["fields"]["fields.total"], "1200 EUR");

    let record = ContentProcess::load(ctx.documents.as_ref(), ctx.process_collection(), process_id)
        .await
        .unwrap()
        .expect("record");
    assert_eq!(record.status.as_deref(), Some(content_process::STATUS_COMPLETED));
    assert_eq!(record.processed_file_mime_type.as_deref(), Some("text/plain"));
    assert_eq!(record.process_output.len(), 1);
    assert_eq!(record.process_output[0].step_name, "save");
}

#[tokio::test]
async fn document_flows_through_memory_backend() {
    let backend = MemoryBackend::new();
    let ctx = Arc::new(backend.process_context(AppConfig::default()));

    let process_id = run_all_steps(ctx.clone(), None).await;
    assert_completed(&ctx, &process_id).await;
}

#[tokio::test]
async fn document_flows_through_libsql_storage() {
    let path = std::env::temp_dir().join(format!("docpipe_flow_{}.db", uuid::Uuid::now_v7()));
    let storage = Storage::open(&path).await.expect("open db");
    let ctx = Arc::new(storage.process_context(AppConfig::default(), None));

    let process_id = run_all_steps(ctx.clone(), None).await;
    assert_completed(&ctx, &process_id).await;
}

#[tokio::test]
async fn schema_limits_saved_fields() {
    let backend = MemoryBackend::new();
    let ctx = Arc::new(backend.process_context(AppConfig::default()));
    let mut schema = Schema {
        id: "invoice".into(),
        class_name: "Invoice".into(),
        fields: vec![
            "fields.customer".into(),
            "fields.total".into(),
            "fields.due_date".into(),
        ],
        ..Schema::default()
    };
    schema
        .register(ctx.documents.as_ref(), ctx.schema_collection())
        .await
        .unwrap();

    let process_id = run_all_steps(ctx.clone(), Some("invoice")).await;

    let evaluated = backend
        .download(&process_id, &format!("{process_id}.evaluated.json"))
        .await
        .unwrap();
    let evaluated: Value = serde_json::from_slice(&evaluated).unwrap();
    let items = evaluated["items"].as_array().unwrap();
    assert_eq!(items.len(), 3);
    let due = items
        .iter()
        .find(|i| i["Field"] == "fields.due_date")
        .unwrap();
    assert_eq!(due["Confidence"], "0.00%");
    assert_eq!(due["IsAboveThreshold"], false);

    let saved = backend
        .download(&process_id, &format!("{process_id}.saved.json"))
        .await
        .unwrap();
    let saved: Value = serde_json::from_slice(&saved).unwrap();
    assert_eq!(saved["schema_id"], "invoice");
    assert_eq!(
        saved["fields"],
        serde_json::json!({"fields.customer": "Contoso", "fields.total": "1200 EUR"})
    );
}

#[tokio::test]
async fn redelivered_message_does_not_double_advance() {
    let backend = MemoryBackend::new();
    let ctx = Arc::new(backend.process_context(AppConfig::default()));
    let registry = StepRegistry::builtin();
    let extract = Handler::new(ctx.clone(), "extract", registry.get("extract").unwrap())
        .await
        .unwrap();

    let submission = submit_document(&ctx, "a.txt", b"hello", None).await.unwrap();
    let body = backend.peek_all(&submission.queue_name).unwrap().remove(0);

    extract.process_next_message().await.unwrap();
    ctx.queues
        .create_or_get(&request_queue_name("extract"))
        .await
        .unwrap()
        .enqueue(&body)
        .await
        .unwrap();

    assert_eq!(
        extract.process_next_message().await.unwrap(),
        MessageOutcome::Skipped
    );
    assert_eq!(backend.peek_all(&request_queue_name("map")).unwrap().len(), 2);

    let stored = Pipeline::load_from_persistent_storage(ctx.blobs.as_ref(), &submission.process_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.pipeline_status.completed_steps, vec!["extract"]);

    let map = Handler::new(ctx.clone(), "map", registry.get("map").unwrap())
        .await
        .unwrap();
    assert_eq!(
        map.process_next_message().await.unwrap(),
        MessageOutcome::Forwarded {
            next: "evaluate".into()
        }
    );
    assert_eq!(map.process_next_message().await.unwrap(), MessageOutcome::Skipped);

    let stored = Pipeline::load_from_persistent_storage(ctx.blobs.as_ref(), &submission.process_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.pipeline_status.completed_steps, vec!["extract", "map"]);
}
