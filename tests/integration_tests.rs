use async_trait::async_trait;
use extraction_prompt_optimizer::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const RENT_START: &str = "Find rent.";
const RENT_FIXED: &str = "Return the monthly base rent exactly as written, including the currency symbol.";
const DEPOSIT_START: &str = "Find deposit.";
const DEPOSIT_RETRY: &str = "Return the security deposit amount stated in the lease summary.";
const LANDLORD_START: &str = "Who is the landlord?";
const LANDLORD_FIXED: &str = "Return the legal name of the landlord entity as written in the signature block.";

/// Answers from a (prompt, document) table. Fields listed in `failing_fields`
/// make the whole call fail.
struct TableExtraction {
    answers: HashMap<(String, String), String>,
    failing_fields: Vec<String>,
    calls: AtomicUsize,
}

impl TableExtraction {
    fn new(entries: &[(&str, &str, &str)]) -> Self {
        Self {
            answers: entries
                .iter()
                .map(|(p, d, v)| ((p.to_string(), d.to_string()), v.to_string()))
                .collect(),
            failing_fields: Vec::new(),
            calls: AtomicUsize::new(0),
        }
    }

    fn failing(mut self, field: &str) -> Self {
        self.failing_fields.push(field.to_string());
        self
    }
}

#[async_trait]
impl ExtractionService for TableExtraction {
    async fn extract(&self, request: &ExtractionRequest) -> std::result::Result<BTreeMap<String, String>, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2)).await;
        let mut values = BTreeMap::new();
        for field in &request.fields {
            if self.failing_fields.contains(&field.key) {
                return Err(ServiceError::Request(format!("{} is unreadable", field.key)));
            }
            let value = self
                .answers
                .get(&(field.prompt.clone(), request.document_id.clone()))
                .cloned()
                .unwrap_or_else(|| "unknown".to_string());
            values.insert(field.key.clone(), value);
        }
        Ok(values)
    }
}

/// Judge and synthesis model in one. Synthesis replies are keyed by the field
/// key found in the request; judge calls match when the extracted value
/// mentions Acme.
struct ScriptedModel {
    suggestions: HashMap<String, String>,
    expire_first_judge_context: bool,
    judge_calls: AtomicUsize,
    synthesis_calls: Mutex<Vec<String>>,
    placeholders: AtomicUsize,
}

impl ScriptedModel {
    fn new(suggestions: &[(&str, &str)]) -> Self {
        Self {
            suggestions: suggestions
                .iter()
                .map(|(k, p)| (k.to_string(), p.to_string()))
                .collect(),
            expire_first_judge_context: false,
            judge_calls: AtomicUsize::new(0),
            synthesis_calls: Mutex::new(Vec::new()),
            placeholders: AtomicUsize::new(0),
        }
    }
}

fn section<'a>(prompt: &'a str, heading: &str) -> Option<&'a str> {
    let start = prompt.find(heading)? + heading.len();
    prompt[start..].lines().find(|l| !l.trim().is_empty())
}

#[async_trait]
impl ModelService for ScriptedModel {
    async fn generate(&self, _model: &str, prompt: &str, contexts: &[ContextRef]) -> std::result::Result<String, ServiceError> {
        assert!(!contexts.is_empty(), "every call binds a context");

        if prompt.contains("## COMPARISON CRITERIA") {
            let call = self.judge_calls.fetch_add(1, Ordering::SeqCst);
            if self.expire_first_judge_context && call == 0 {
                return Err(ServiceError::NotFound(format!("{} was deleted", contexts[0].id)));
            }
            let extracted = section(prompt, "## EXTRACTED VALUE").unwrap_or_default();
            return Ok(if extracted.to_lowercase().contains("acme") {
                "MATCH\nReason: same company".to_string()
            } else {
                "NO_MATCH\nReason: different entity".to_string()
            });
        }

        let key = section(prompt, "Key:").unwrap_or_default().trim().to_string();
        self.synthesis_calls.lock().unwrap().push(key.clone());
        match self.suggestions.get(&key) {
            Some(p) => Ok(format!(
                "```json\n{{\"new_prompt\": \"{}\", \"reasoning\": \"tightened the wording\"}}\n```",
                p
            )),
            None => Ok("I could not think of anything.".to_string()),
        }
    }

    async fn create_placeholder_context(&self) -> std::result::Result<ContextRef, ServiceError> {
        let n = self.placeholders.fetch_add(1, Ordering::SeqCst);
        Ok(ContextRef {
            id: format!("files/placeholder-{}", n),
            uri: format!("https://files/placeholder-{}", n),
        })
    }
}

fn row(field: &str, doc: &str, truth: &str, extracted: &str, is_match: bool) -> ComparisonRow {
    ComparisonRow {
        field_key: field.to_string(),
        document_id: doc.to_string(),
        document_name: format!("{}.pdf", doc),
        model: "gemini-2.5-flash".to_string(),
        extracted_value: extracted.to_string(),
        ground_truth_value: truth.to_string(),
        outcome: if is_match {
            ComparisonOutcome::matched(MatchType::Exact, Confidence::High)
        } else {
            ComparisonOutcome::unmatched(MatchType::Mismatch, Confidence::High)
        },
    }
}

/// rent fails on d2, deposit fails on d1, tenant is solved.
fn lease_snapshot() -> AccuracySnapshot {
    AccuracySnapshot {
        template_key: "lease".to_string(),
        test_model: "gemini-2.5-flash".to_string(),
        fields: vec![
            FieldDefinition::new("rent", "Monthly Rent", FieldType::Currency),
            FieldDefinition::new("deposit", "Security Deposit", FieldType::Currency),
            FieldDefinition::new("tenant", "Tenant", FieldType::Text),
        ],
        rows: vec![
            row("rent", "d1", "$1,000", "$1,000", true),
            row("rent", "d2", "$2,000", "$200", false),
            row("deposit", "d1", "$500", "$50", false),
            row("deposit", "d2", "$300", "$300", true),
            row("tenant", "d1", "Ann", "Ann", true),
            row("tenant", "d2", "Bob", "Bob", true),
        ],
    }
}

fn lease_extraction() -> TableExtraction {
    TableExtraction::new(&[
        (RENT_START, "d1", "$1,000"),
        (RENT_START, "d2", "$200"),
        (RENT_FIXED, "d1", "$1,000"),
        (RENT_FIXED, "d2", "$2,000"),
        (DEPOSIT_START, "d1", "$50"),
        (DEPOSIT_START, "d2", "$300"),
        (DEPOSIT_RETRY, "d1", "$5"),
        (DEPOSIT_RETRY, "d2", "$300"),
    ])
}

fn lease_store() -> Arc<InMemoryPromptStore> {
    Arc::new(
        InMemoryPromptStore::new()
            .with_prompt("lease", "rent", RENT_START)
            .with_prompt("lease", "deposit", DEPOSIT_START),
    )
}

fn result_for<'a>(summary: &'a RunSummary, key: &str) -> &'a FieldResult {
    summary
        .field_results
        .iter()
        .find(|r| r.field_key == key)
        .unwrap_or_else(|| panic!("no result for {}", key))
}

#[tokio::test]
async fn test_full_run_converges_and_saves() -> anyhow::Result<()> {
    let store = lease_store();
    let model = Arc::new(ScriptedModel::new(&[("rent", RENT_FIXED), ("deposit", DEPOSIT_RETRY)]));
    let optimizer = PromptOptimizer::new(
        OptimizerConfig::default(),
        Arc::new(lease_extraction()),
        model.clone(),
        store.clone(),
    )?;

    let summary = optimizer.run(&lease_snapshot()).await?;

    assert!(summary.run_id.starts_with("run-"));
    assert_eq!(summary.sampled_document_ids, vec!["d1", "d2"]);
    assert_eq!(summary.sampled_document_names, vec!["d1.pdf", "d2.pdf"]);
    assert_eq!(summary.field_results.len(), 2);
    assert!(summary.untested_fields.is_empty());
    assert!(summary.finished_at >= summary.started_at);
    assert!(summary.estimated_seconds > 0.0);

    let rent = result_for(&summary, "rent");
    assert_eq!(rent.outcome, FieldOutcome::Converged);
    assert!(rent.converged);
    assert_eq!(rent.iteration_count, 2);
    assert!(rent.improved);
    assert_eq!(rent.initial_accuracy, 0.5);
    assert_eq!(rent.iterations[0].accuracy, 0.5);
    assert_eq!(rent.final_accuracy, 1.0);
    assert_eq!(rent.final_prompt, RENT_FIXED);

    // The retry still misses d1, so the stored prompt stays.
    let deposit = result_for(&summary, "deposit");
    assert_eq!(deposit.outcome, FieldOutcome::Exhausted);
    assert_eq!(deposit.iteration_count, 3);
    assert!(!deposit.improved);
    assert_eq!(deposit.final_prompt, DEPOSIT_START);

    assert_eq!(store.current_prompt("rent", "lease").await?.as_deref(), Some(RENT_FIXED));
    let versions = store.versions("lease", "rent");
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].history.len(), 2);
    assert_eq!(versions[0].history[0].prompt, RENT_START);
    assert!(store.versions("lease", "deposit").is_empty());

    assert_eq!(summary.improved_count(), 1);
    assert_eq!(summary.converged_count(), 1);

    let mut synthesized = model.synthesis_calls.lock().unwrap().clone();
    synthesized.sort();
    assert_eq!(synthesized, vec!["deposit", "deposit", "rent"]);
    Ok(())
}

#[tokio::test]
async fn test_failed_field_does_not_stop_the_run() -> anyhow::Result<()> {
    let store = lease_store();
    let model = Arc::new(ScriptedModel::new(&[("rent", RENT_FIXED)]));
    let optimizer = PromptOptimizer::new(
        OptimizerConfig::default(),
        Arc::new(lease_extraction().failing("deposit")),
        model,
        store.clone(),
    )?;

    let summary = optimizer.run(&lease_snapshot()).await?;
    assert_eq!(summary.field_results.len(), 2);

    let deposit = result_for(&summary, "deposit");
    assert_eq!(deposit.outcome, FieldOutcome::Errored);
    assert!(deposit.error.as_deref().unwrap().contains("deposit is unreadable"));
    assert_eq!(deposit.final_prompt, DEPOSIT_START);
    assert!(!deposit.improved);

    let rent = result_for(&summary, "rent");
    assert_eq!(rent.outcome, FieldOutcome::Converged);
    assert_eq!(store.current_prompt("deposit", "lease").await?.as_deref(), Some(DEPOSIT_START));
    Ok(())
}

#[tokio::test]
async fn test_solved_template_gives_empty_summary() -> anyhow::Result<()> {
    let snapshot = AccuracySnapshot {
        template_key: "lease".to_string(),
        test_model: "gemini-2.5-flash".to_string(),
        fields: vec![FieldDefinition::new("tenant", "Tenant", FieldType::Text)],
        rows: vec![row("tenant", "d1", "Ann", "Ann", true)],
    };
    let extraction = Arc::new(TableExtraction::new(&[]));
    let optimizer = PromptOptimizer::new(
        OptimizerConfig::default(),
        extraction.clone(),
        Arc::new(ScriptedModel::new(&[])),
        Arc::new(InMemoryPromptStore::new()),
    )?;

    let summary = optimizer.run(&snapshot).await?;
    assert!(summary.field_results.is_empty());
    assert!(summary.sampled_document_ids.is_empty());
    assert_eq!(summary.estimated_seconds, 0.0);
    assert_eq!(extraction.calls.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn test_missing_comparison_data_fails_fast() {
    let snapshot = AccuracySnapshot {
        template_key: "lease".to_string(),
        test_model: "gemini-2.5-flash".to_string(),
        fields: vec![FieldDefinition::new("tenant", "Tenant", FieldType::Text)],
        rows: Vec::new(),
    };
    let optimizer = PromptOptimizer::new(
        OptimizerConfig::default(),
        Arc::new(TableExtraction::new(&[])),
        Arc::new(ScriptedModel::new(&[])),
        Arc::new(InMemoryPromptStore::new()),
    )
    .unwrap();

    let err = optimizer.run(&snapshot).await.unwrap_err();
    assert!(matches!(err, OptimizerError::NoComparisonData(_)));
    assert!(err.to_string().contains("lease"));
}

#[tokio::test]
async fn test_judge_field_recovers_from_expired_context() -> anyhow::Result<()> {
    let snapshot = AccuracySnapshot {
        template_key: "lease".to_string(),
        test_model: "gemini-2.5-flash".to_string(),
        fields: vec![FieldDefinition::new("landlord", "Landlord", FieldType::Text).with_comparison(
            ComparisonStrategy::LlmJudge {
                criteria: "Same legal entity".to_string(),
            },
        )],
        rows: vec![row("landlord", "d1", "Acme Corporation", "Landlord LLC", false)],
    };
    let extraction = TableExtraction::new(&[
        (LANDLORD_START, "d1", "Landlord LLC"),
        (LANDLORD_FIXED, "d1", "ACME Corp"),
    ]);
    let mut model = ScriptedModel::new(&[("landlord", LANDLORD_FIXED)]);
    model.expire_first_judge_context = true;
    let model = Arc::new(model);
    let store = Arc::new(InMemoryPromptStore::new().with_prompt("lease", "landlord", LANDLORD_START));

    let optimizer = PromptOptimizer::new(OptimizerConfig::default(), Arc::new(extraction), model.clone(), store)?;
    let summary = optimizer.run(&snapshot).await?;

    let landlord = result_for(&summary, "landlord");
    assert_eq!(landlord.outcome, FieldOutcome::Converged);
    assert_eq!(landlord.iteration_count, 2);
    assert_eq!(landlord.final_prompt, LANDLORD_FIXED);
    // One retry after the not-found error, then one call per later comparison.
    assert_eq!(model.judge_calls.load(Ordering::SeqCst), 3);
    assert_eq!(model.placeholders.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn test_events_and_progress() -> anyhow::Result<()> {
    let (tx, mut rx) = tokio::sync::mpsc::channel(256);
    let progress_calls = Arc::new(AtomicUsize::new(0));
    let counter = progress_calls.clone();

    let optimizer = PromptOptimizer::new(
        OptimizerConfig::default(),
        Arc::new(lease_extraction()),
        Arc::new(ScriptedModel::new(&[("rent", RENT_FIXED), ("deposit", DEPOSIT_RETRY)])),
        lease_store(),
    )?
    .with_events(tx)
    .with_extraction_progress(Arc::new(move |p: &BatchProgress<'_>| {
        assert!(p.completed <= p.total);
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    optimizer.run(&lease_snapshot()).await?;
    drop(optimizer);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    assert!(matches!(
        events.first(),
        Some(OptimizationEvent::PlanReady { fields: 2, documents: 2, .. })
    ));
    assert!(matches!(
        events.last(),
        Some(OptimizationEvent::RunFinished { improved: 1, converged: 1, .. })
    ));
    let finished = events
        .iter()
        .filter(|e| matches!(e, OptimizationEvent::FieldFinished { .. }))
        .count();
    assert_eq!(finished, 2);

    // rent: 2 passes over 2 documents, deposit: 3 passes over 2 documents.
    assert_eq!(progress_calls.load(Ordering::SeqCst), 10);
    Ok(())
}

#[tokio::test]
async fn test_full_event_channel_does_not_block_the_run() -> anyhow::Result<()> {
    let (tx, mut rx) = tokio::sync::mpsc::channel(1);
    let optimizer = PromptOptimizer::new(
        OptimizerConfig::default(),
        Arc::new(lease_extraction()),
        Arc::new(ScriptedModel::new(&[("rent", RENT_FIXED), ("deposit", DEPOSIT_RETRY)])),
        lease_store(),
    )?
    .with_events(tx);

    let summary = tokio::time::timeout(Duration::from_secs(10), optimizer.run(&lease_snapshot())).await??;
    assert_eq!(summary.converged_count(), 1);
    assert!(matches!(rx.try_recv(), Ok(OptimizationEvent::PlanReady { .. })));
    assert!(rx.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn test_batch_slots_are_independent() {
    let service = Arc::new(TableExtraction::new(&[("p", "ok-1", "a"), ("p", "ok-2", "b")]).failing("broken"));
    let job = |doc: &str, field: &str| ExtractionJob {
        document_id: doc.to_string(),
        document_name: format!("{}.pdf", doc),
        model: "gemini-2.5-flash".to_string(),
        fields: vec![FieldSpec {
            key: field.to_string(),
            name: field.to_string(),
            field_type: FieldType::Text,
            prompt: "p".to_string(),
            system_prompt: None,
        }],
        template_key: "lease".to_string(),
    };

    for limit in [1, 2, 5] {
        let extractor = BatchExtractor::new(service.clone(), limit, Duration::from_secs(1));
        let records = extractor
            .run(vec![job("bad", "broken"), job("ok-1", "value"), job("ok-2", "value")])
            .await;
        assert!(records[0].error.as_deref().unwrap().contains("broken is unreadable"));
        assert_eq!(records[1].value("value"), Some("a"));
        assert_eq!(records[2].value("value"), Some("b"));

        let records = extractor
            .run(vec![job("ok-2", "value"), job("ok-1", "value"), job("bad", "broken")])
            .await;
        assert_eq!(records[0].value("value"), Some("b"));
        assert_eq!(records[1].value("value"), Some("a"));
        assert!(!records[2].is_success());
    }
}

#[test]
fn test_sampler_covers_every_field_with_two_documents() {
    let failure = |doc: &str| FailureRecord {
        document_id: doc.to_string(),
        document_name: format!("{}.pdf", doc),
        ground_truth_value: "x".to_string(),
        extracted_value: "y".to_string(),
        comparison_reason: "mismatch".to_string(),
    };
    let mut failures = FieldFailureMap::new();
    failures.insert("A".to_string(), vec![failure("doc1"), failure("doc2")]);
    failures.insert("B".to_string(), vec![failure("doc2"), failure("doc3")]);
    failures.insert("C".to_string(), vec![failure("doc1")]);

    let result = sample_documents(&failures, 2);
    assert_eq!(result.documents.len(), 2);
    assert_eq!(result.field_to_document_ids.len(), 3);
}
