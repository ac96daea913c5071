//! # Extraction Prompt Optimizer
//!
//! Closed-loop evaluation and refinement of the natural-language prompts an
//! LLM extraction service uses to pull fields out of documents.
//!
//! ## Core Concepts
//!
//! - **Accuracy snapshot**: per-field, per-document comparison rows from a previous run
//! - **Work plan**: the fields below target and a small set of documents that exhibits every failure
//! - **Refinement loop**: test the prompt, score it, synthesize a revision from the failures, repeat
//! - **Comparison**: exact, near-exact, numeric-tolerance rules or an LLM judge
//! - **Bounded concurrency**: every external call goes through a fixed-size in-flight budget
//!
//! ## Example
//!
//! ```rust,ignore
//! use extraction_prompt_optimizer::*;
//! use std::sync::Arc;
//!
//! let optimizer = PromptOptimizer::new(
//!     OptimizerConfig::default(),
//!     Arc::new(my_extraction_service),
//!     Arc::new(my_model_service),
//!     Arc::new(InMemoryPromptStore::new()),
//! )?;
//!
//! let summary = optimizer.run(&snapshot).await?;
//! for field in &summary.field_results {
//!     println!(
//!         "{}: {:.0}% -> {:.0}% ({:?})",
//!         field.field_name,
//!         field.initial_accuracy * 100.0,
//!         field.final_accuracy * 100.0,
//!         field.outcome
//!     );
//! }
//! ```

pub mod concurrency;
pub mod config;
pub mod controller;
pub mod error;
pub mod extraction;
pub mod judge;
pub mod metrics;
pub mod planner;
pub mod prompts;
pub mod sampler;
pub mod schema;
pub mod services;
pub mod synthesis;
pub mod utils;

#[cfg(feature = "gemini")]
pub mod llm;

pub use concurrency::{run_with_concurrency, TaskError, TaskResult};
pub use config::{FieldTypeHeuristic, ModelCatalog, OptimizerConfig, DEFAULT_NOT_PRESENT_MARKER};
pub use controller::{FieldState, IterationController, OptimizationEvent, PromptOptimizer};
pub use error::{OptimizerError, Result, ServiceError};
pub use extraction::{BatchExtractor, BatchProgress, ExtractionJob, ExtractionRecord, ProgressCallback};
pub use judge::{parse_judge_response, JudgeVerdict, LlmJudge, PlaceholderContextCache};
pub use metrics::{FieldMetrics, MetricsEngine, MetricsReport, PairClass};
pub use planner::WorkPlanBuilder;
pub use sampler::{sample_documents, DocumentSampler};
pub use schema::*;
pub use services::*;
pub use synthesis::{
    build_synthesis_prompt, fallback_prompt, parse_synthesis_response, PromptSuggestion,
    PromptSynthesizer, SynthesisOptions, SynthesisRequest,
};
