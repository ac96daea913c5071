//! The per-field refinement loop and the run that drives it across fields.

use crate::concurrency::run_with_concurrency;
use crate::config::{ModelCatalog, OptimizerConfig};
use crate::error::{OptimizerError, Result, ServiceError};
use crate::extraction::{BatchExtractor, ExtractionJob, ProgressCallback};
use crate::judge::{LlmJudge, PlaceholderContextCache};
use crate::metrics::{MetricsEngine, MetricsReport};
use crate::planner::WorkPlanBuilder;
use crate::schema::{
    AccuracySnapshot, ComparisonStrategy, DocumentRef, FieldOutcome, FieldPlan, FieldResult,
    IterationResult, PromptAttempt, RunSummary, WorkPlan,
};
use crate::services::{ExtractionService, FieldSpec, ModelService, PromptHistoryStore};
use crate::synthesis::{fallback_prompt, PromptSynthesizer, SynthesisRequest};
use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldState {
    Pending,
    Testing,
    Converged,
    ImprovedRetry,
    Exhausted,
    Errored,
}

impl FieldState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FieldState::Converged | FieldState::Exhausted | FieldState::Errored
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum OptimizationEvent {
    PlanReady {
        run_id: String,
        fields: usize,
        documents: usize,
        untested_fields: Vec<String>,
        estimated_seconds: f64,
    },
    FieldStarted {
        field_key: String,
        initial_accuracy: f64,
    },
    IterationCompleted {
        field_key: String,
        iteration: u32,
        accuracy: f64,
        converged: bool,
    },
    FieldFinished {
        field_key: String,
        outcome: FieldOutcome,
        final_accuracy: f64,
        improved: bool,
    },
    RunFinished {
        run_id: String,
        improved: usize,
        converged: usize,
        actual_seconds: f64,
    },
}

/// Never waits on the receiver: a full channel drops the event.
fn send_event(sender: Option<&Sender<OptimizationEvent>>, event: OptimizationEvent) {
    let Some(tx) = sender else { return };
    match tx.try_send(event) {
        Ok(()) | Err(TrySendError::Closed(_)) => {}
        Err(TrySendError::Full(event)) => warn!("Event channel full, dropping {:?}", event),
    }
}

/// Drives one field from `Pending` to a terminal state.
///
/// Iteration `k` always tests the prompt produced by iteration `k - 1`. The
/// initial prompt and accuracy are read once and never change.
pub struct IterationController<'a> {
    field: &'a FieldPlan,
    documents: Vec<DocumentRef>,
    template_key: &'a str,
    test_model: &'a str,
    extractor: &'a BatchExtractor,
    metrics: &'a MetricsEngine,
    synthesizer: &'a PromptSynthesizer,
    config: &'a OptimizerConfig,
    events: Option<&'a Sender<OptimizationEvent>>,
    state: FieldState,
}

struct Best {
    accuracy: f64,
    prompt: String,
}

impl<'a> IterationController<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        field: &'a FieldPlan,
        plan: &'a WorkPlan,
        test_model: &'a str,
        extractor: &'a BatchExtractor,
        metrics: &'a MetricsEngine,
        synthesizer: &'a PromptSynthesizer,
        config: &'a OptimizerConfig,
    ) -> Self {
        // Only sampled documents that have ground truth for this field.
        let documents = plan
            .sampled_documents
            .iter()
            .filter(|d| field.ground_truth.contains_key(&d.id))
            .cloned()
            .collect();
        Self {
            field,
            documents,
            template_key: &plan.template_key,
            test_model,
            extractor,
            metrics,
            synthesizer,
            config,
            events: None,
            state: FieldState::Pending,
        }
    }

    pub fn with_events(mut self, events: Option<&'a Sender<OptimizationEvent>>) -> Self {
        self.events = events;
        self
    }

    pub fn state(&self) -> FieldState {
        self.state
    }

    fn transition(&mut self, next: FieldState) {
        debug!("Field '{}': {:?} -> {:?}", self.field.field_key, self.state, next);
        self.state = next;
    }

    pub async fn run(mut self, initial_prompt: String) -> FieldResult {
        let key = self.field.field_key.clone();
        let initial_accuracy = self.field.initial_accuracy;
        let max_iterations = self.config.max_iterations.max(1);

        send_event(
            self.events,
            OptimizationEvent::FieldStarted {
                field_key: key.clone(),
                initial_accuracy,
            },
        );
        info!(
            "Optimizing '{}' on {} document(s), starting at {:.1}%",
            key,
            self.documents.len(),
            initial_accuracy * 100.0
        );

        let mut current_prompt = initial_prompt.clone();
        let mut iterations: Vec<IterationResult> = Vec::new();
        let mut attempts: Vec<PromptAttempt> = Vec::new();
        let mut best: Option<Best> = None;
        let mut failure: Option<OptimizerError> = None;
        let mut converged_accuracy: Option<f64> = None;

        for iteration in 1..=max_iterations {
            self.transition(FieldState::Testing);

            let report = match self.test_prompt(&current_prompt).await {
                Ok(report) => report,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            };
            let accuracy = report.metrics.accuracy;
            let converged = accuracy >= self.config.target_accuracy;

            if best.as_ref().map_or(true, |b| accuracy > b.accuracy) {
                best = Some(Best {
                    accuracy,
                    prompt: current_prompt.clone(),
                });
            }
            attempts.push(PromptAttempt {
                iteration,
                prompt: current_prompt.clone(),
                accuracy,
                reasoning: iterations.last().and_then(|i| i.reasoning.clone()),
            });
            send_event(
                self.events,
                OptimizationEvent::IterationCompleted {
                    field_key: key.clone(),
                    iteration,
                    accuracy,
                    converged,
                },
            );

            let failures = report.failure_examples();
            let mut result = IterationResult {
                iteration,
                tested_prompt: current_prompt.clone(),
                new_prompt: current_prompt.clone(),
                accuracy,
                converged,
                reasoning: None,
                failure_examples: (!failures.is_empty()).then(|| failures.clone()),
            };

            if converged {
                iterations.push(result);
                converged_accuracy = Some(accuracy);
                self.transition(FieldState::Converged);
                break;
            }
            if iteration == max_iterations {
                iterations.push(result);
                self.transition(FieldState::Exhausted);
                break;
            }

            let successes = report.success_examples();
            let request = SynthesisRequest {
                field: &self.field.field_definition,
                current_prompt: &current_prompt,
                current_accuracy: accuracy,
                previous_attempts: &attempts,
                failures: &failures,
                successes: &successes,
                iteration,
                max_iterations,
            };
            match self.synthesizer.synthesize(&request).await {
                Ok(suggestion) => {
                    result.new_prompt = suggestion.new_prompt;
                    result.reasoning = Some(suggestion.reasoning);
                    current_prompt = result.new_prompt.clone();
                    iterations.push(result);
                    self.transition(FieldState::ImprovedRetry);
                }
                Err(err) => {
                    iterations.push(result);
                    failure = Some(err);
                    break;
                }
            }
        }

        let iteration_count = attempts.len() as u32;
        let sampled_document_ids: Vec<String> = self.documents.iter().map(|d| d.id.clone()).collect();

        let (outcome, final_prompt, final_accuracy, error) = match (failure, converged_accuracy) {
            (Some(err), _) => {
                self.transition(FieldState::Errored);
                error!("Field '{}' errored: {}", key, err);
                (FieldOutcome::Errored, initial_prompt.clone(), initial_accuracy, Some(err.to_string()))
            }
            (None, Some(accuracy)) => (FieldOutcome::Converged, current_prompt, accuracy, None),
            (None, None) => match best {
                Some(best) if best.accuracy > initial_accuracy => {
                    (FieldOutcome::Exhausted, best.prompt, best.accuracy, None)
                }
                _ => (FieldOutcome::Exhausted, initial_prompt.clone(), initial_accuracy, None),
            },
        };

        let improved = final_accuracy > initial_accuracy;
        info!(
            "Field '{}' finished {:?} after {} iteration(s): {:.1}% -> {:.1}%",
            key,
            outcome,
            iteration_count,
            initial_accuracy * 100.0,
            final_accuracy * 100.0
        );
        send_event(
            self.events,
            OptimizationEvent::FieldFinished {
                field_key: key.clone(),
                outcome,
                final_accuracy,
                improved,
            },
        );

        FieldResult {
            field_key: key,
            field_name: self.field.field_definition.name.clone(),
            initial_accuracy,
            final_accuracy,
            iteration_count,
            final_prompt,
            initial_prompt,
            converged: outcome == FieldOutcome::Converged,
            sampled_document_ids,
            improved,
            outcome,
            error,
            iterations,
        }
    }

    /// Extracts the field from every test document with `prompt` and scores it.
    ///
    /// A failed extraction counts as an absent prediction; only a pass where
    /// every extraction failed is an error.
    async fn test_prompt(&self, prompt: &str) -> Result<MetricsReport> {
        let definition = &self.field.field_definition;
        let spec = FieldSpec {
            key: definition.key.clone(),
            name: definition.name.clone(),
            field_type: definition.field_type,
            prompt: prompt.to_string(),
            system_prompt: self.config.system_prompt_for(&definition.key).map(str::to_string),
        };
        let jobs: Vec<ExtractionJob> = self
            .documents
            .iter()
            .map(|doc| ExtractionJob {
                document_id: doc.id.clone(),
                document_name: doc.name.clone(),
                model: self.test_model.to_string(),
                fields: vec![spec.clone()],
                template_key: self.template_key.to_string(),
            })
            .collect();

        let records = self.extractor.run(jobs).await;
        if let Some(first) = records.first().filter(|_| records.iter().all(|r| !r.is_success())) {
            return Err(OptimizerError::Service(ServiceError::Request(format!(
                "all {} extraction(s) failed, first error: {}",
                records.len(),
                first.error.as_deref().unwrap_or("unknown")
            ))));
        }

        let predictions: Vec<String> = records
            .iter()
            .map(|r| r.value(&definition.key).unwrap_or_default().to_string())
            .collect();
        let ground_truths: Vec<String> = self
            .documents
            .iter()
            .map(|d| self.field.ground_truth.get(&d.id).cloned().unwrap_or_default())
            .collect();
        let document_ids: Vec<String> = self.documents.iter().map(|d| d.id.clone()).collect();

        self.metrics
            .evaluate(
                &definition.key,
                &predictions,
                &ground_truths,
                &definition.comparison,
                Some(&document_ids),
            )
            .await
    }
}

/// Runs whole optimization passes over an accuracy snapshot.
pub struct PromptOptimizer {
    config: OptimizerConfig,
    catalog: Arc<ModelCatalog>,
    model_service: Arc<dyn ModelService>,
    synthesis_service: Option<Arc<dyn ModelService>>,
    contexts: Arc<PlaceholderContextCache>,
    extractor: BatchExtractor,
    metrics: MetricsEngine,
    synthesizer: PromptSynthesizer,
    prompts: Arc<dyn PromptHistoryStore>,
    events: Option<Sender<OptimizationEvent>>,
    fill_sample_budget: bool,
}

impl PromptOptimizer {
    /// `model_service` serves both judge and synthesis calls unless
    /// [`with_synthesis_service`](Self::with_synthesis_service) is used.
    pub fn new(
        config: OptimizerConfig,
        extraction: Arc<dyn ExtractionService>,
        model_service: Arc<dyn ModelService>,
        prompts: Arc<dyn PromptHistoryStore>,
    ) -> Result<Self> {
        config.validate()?;
        let catalog = Arc::new(ModelCatalog::default());
        let contexts = Arc::new(PlaceholderContextCache::new());

        let judge = LlmJudge::new(model_service.clone(), config.judge_model.clone(), config.call_timeout())
            .with_context_cache(contexts.clone());
        let metrics = MetricsEngine::new(config.not_present_marker.clone(), config.comparison_concurrency)
            .with_judge(judge);
        let synthesizer = PromptSynthesizer::new(model_service.clone(), catalog.clone(), &config)
            .with_context_cache(contexts.clone());
        let extractor = BatchExtractor::new(extraction, config.extraction_concurrency, config.call_timeout());

        Ok(Self {
            config,
            catalog,
            model_service,
            synthesis_service: None,
            contexts,
            extractor,
            metrics,
            synthesizer,
            prompts,
            events: None,
            fill_sample_budget: false,
        })
    }

    pub fn with_catalog(mut self, catalog: ModelCatalog) -> Self {
        self.catalog = Arc::new(catalog);
        self.rebuild_synthesizer();
        self
    }

    /// Sends synthesis calls to a different service than judge calls.
    pub fn with_synthesis_service(mut self, service: Arc<dyn ModelService>) -> Self {
        self.synthesis_service = Some(service);
        self.rebuild_synthesizer();
        self
    }

    /// Progress events for this optimizer. Sending never blocks the run;
    /// events that do not fit in the channel are dropped with a warning.
    pub fn with_events(mut self, sender: Sender<OptimizationEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Called after every extraction job of every field.
    pub fn with_extraction_progress(mut self, progress: ProgressCallback) -> Self {
        self.extractor = self.extractor.with_progress(progress);
        self
    }

    pub fn with_fill_sample_budget(mut self, fill: bool) -> Self {
        self.fill_sample_budget = fill;
        self
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    fn rebuild_synthesizer(&mut self) {
        let service = self
            .synthesis_service
            .clone()
            .unwrap_or_else(|| self.model_service.clone());
        self.synthesizer = PromptSynthesizer::new(service, self.catalog.clone(), &self.config)
            .with_context_cache(self.contexts.clone());
    }

    pub fn plan(&self, snapshot: &AccuracySnapshot) -> Result<WorkPlan> {
        WorkPlanBuilder::new(&self.config)
            .with_fill_sample_budget(self.fill_sample_budget)
            .build(snapshot)
    }

    /// Worst-case wall time for a plan, assuming every field uses its full
    /// iteration budget.
    pub fn estimate_seconds(&self, plan: &WorkPlan) -> f64 {
        if plan.is_empty() {
            return 0.0;
        }
        let per_call = self.config.estimated_seconds_per_call;
        let field_seconds: f64 = plan
            .fields
            .iter()
            .map(|field| {
                let documents = field.ground_truth.len().max(1) as f64;
                let extraction_rounds = (documents / self.config.extraction_concurrency as f64).ceil();
                let judge_rounds = match field.field_definition.comparison {
                    ComparisonStrategy::LlmJudge { .. } => {
                        (documents / self.config.comparison_concurrency as f64).ceil()
                    }
                    _ => 0.0,
                };
                let iterations = self.config.max_iterations as f64;
                // One synthesis call between consecutive tests.
                (iterations * (extraction_rounds + judge_rounds) + (iterations - 1.0)) * per_call
            })
            .sum();
        let parallel = self.config.field_concurrency.min(plan.fields.len()).max(1) as f64;
        field_seconds / parallel
    }

    /// Plans and runs a full pass. Only a snapshot with no comparison data
    /// fails the run; field-level problems are reported per field.
    pub async fn run(&self, snapshot: &AccuracySnapshot) -> Result<RunSummary> {
        let plan = self.plan(snapshot)?;
        Ok(self.run_plan(&plan).await)
    }

    /// Runs an already built plan.
    pub async fn run_plan(&self, plan: &WorkPlan) -> RunSummary {
        let started_at = Utc::now();
        let clock = Instant::now();
        let estimated_seconds = self.estimate_seconds(plan);
        let test_model = if plan.test_model.trim().is_empty() {
            self.config.default_test_model.as_str()
        } else {
            plan.test_model.as_str()
        };
        if !self.catalog.is_known_model(test_model) {
            warn!("Test model '{}' is not in catalog {}", test_model, self.catalog.version);
        }

        send_event(
            self.events.as_ref(),
            OptimizationEvent::PlanReady {
                run_id: plan.run_id.clone(),
                fields: plan.fields.len(),
                documents: plan.sampled_document_ids.len(),
                untested_fields: plan.untested_fields.clone(),
                estimated_seconds,
            },
        );
        info!(
            "Run {}: optimizing {} field(s) of '{}' with {} (estimated {:.0}s)",
            plan.run_id,
            plan.fields.len(),
            plan.template_key,
            test_model,
            estimated_seconds
        );

        let slots = run_with_concurrency(
            plan.fields.iter().collect::<Vec<_>>(),
            self.config.field_concurrency,
            |field| async move { Ok::<_, Infallible>(self.optimize_field(plan, field, test_model).await) },
        )
        .await;

        let field_results: Vec<FieldResult> = slots
            .into_iter()
            .zip(&plan.fields)
            .map(|(slot, field)| {
                slot.unwrap_or_else(|e| {
                    error!("Optimization of '{}' aborted: {}", field.field_key, e);
                    errored_result(field, String::new(), e.to_string())
                })
            })
            .collect();

        let finished_at = Utc::now();
        let summary = RunSummary {
            run_id: plan.run_id.clone(),
            template_key: plan.template_key.clone(),
            test_model: test_model.to_string(),
            field_results,
            sampled_document_ids: plan.sampled_document_ids.clone(),
            sampled_document_names: plan.sampled_documents.iter().map(|d| d.name.clone()).collect(),
            untested_fields: plan.untested_fields.clone(),
            started_at,
            finished_at,
            estimated_seconds,
            actual_seconds: clock.elapsed().as_secs_f64(),
        };

        info!(
            "Run {} finished in {:.1}s: {} improved, {} converged",
            summary.run_id,
            summary.actual_seconds,
            summary.improved_count(),
            summary.converged_count()
        );
        send_event(
            self.events.as_ref(),
            OptimizationEvent::RunFinished {
                run_id: summary.run_id.clone(),
                improved: summary.improved_count(),
                converged: summary.converged_count(),
                actual_seconds: summary.actual_seconds,
            },
        );

        summary
    }

    async fn optimize_field(&self, plan: &WorkPlan, field: &FieldPlan, test_model: &str) -> FieldResult {
        let initial_prompt = match self
            .prompts
            .current_prompt(&field.field_key, &plan.template_key)
            .await
        {
            Ok(Some(prompt)) if !prompt.trim().is_empty() => prompt,
            Ok(_) => {
                debug!("No stored prompt for '{}'; starting from the fallback", field.field_key);
                fallback_prompt(&field.field_definition, &self.config.not_present_marker)
            }
            Err(err) => {
                error!("Could not read the prompt for '{}': {}", field.field_key, err);
                return errored_result(field, String::new(), OptimizerError::from(err).to_string());
            }
        };

        let mut result = IterationController::new(
            field,
            plan,
            test_model,
            &self.extractor,
            &self.metrics,
            &self.synthesizer,
            &self.config,
        )
        .with_events(self.events.as_ref())
        .run(initial_prompt)
        .await;

        if result.improved && result.final_prompt != result.initial_prompt {
            let history: Vec<PromptAttempt> = result
                .iterations
                .iter()
                .map(|i| PromptAttempt {
                    iteration: i.iteration,
                    prompt: i.tested_prompt.clone(),
                    accuracy: i.accuracy,
                    reasoning: i.reasoning.clone(),
                })
                .collect();
            if let Err(err) = self
                .prompts
                .save_version(&field.field_key, &result.final_prompt, &history, &plan.template_key)
                .await
            {
                error!("Could not save the new prompt for '{}': {}", field.field_key, err);
                result.outcome = FieldOutcome::Errored;
                result.converged = false;
                result.improved = false;
                result.final_prompt = result.initial_prompt.clone();
                result.final_accuracy = result.initial_accuracy;
                result.error = Some(format!("failed to save prompt: {}", err));
            }
        }

        result
    }
}

fn errored_result(field: &FieldPlan, initial_prompt: String, error: String) -> FieldResult {
    FieldResult {
        field_key: field.field_key.clone(),
        field_name: field.field_definition.name.clone(),
        initial_accuracy: field.initial_accuracy,
        final_accuracy: field.initial_accuracy,
        iteration_count: 0,
        final_prompt: initial_prompt.clone(),
        initial_prompt,
        converged: false,
        sampled_document_ids: field.ground_truth.keys().cloned().collect(),
        improved: false,
        outcome: FieldOutcome::Errored,
        error: Some(error),
        iterations: Vec::new(),
    }
}
