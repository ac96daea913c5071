use crate::config::OptimizerConfig;
use crate::error::{OptimizerError, Result};
use crate::sampler::DocumentSampler;
use crate::schema::{
    AccuracySnapshot, ComparisonRow, DocumentRef, FailureRecord, FieldFailureMap, FieldPlan,
    WorkPlan,
};
use crate::services::GroundTruthStore;
use crate::utils::new_run_id;
use log::{debug, info, warn};
use std::collections::BTreeMap;

/// Turns an accuracy snapshot into the fields to optimize and the documents to test on.
///
/// Pure: reads only the snapshot and the ground-truth store.
pub struct WorkPlanBuilder<'a> {
    config: &'a OptimizerConfig,
    fill_sample_budget: bool,
}

impl<'a> WorkPlanBuilder<'a> {
    pub fn new(config: &'a OptimizerConfig) -> Self {
        Self {
            config,
            fill_sample_budget: false,
        }
    }

    pub fn with_fill_sample_budget(mut self, fill: bool) -> Self {
        self.fill_sample_budget = fill;
        self
    }

    pub fn build(&self, snapshot: &AccuracySnapshot) -> Result<WorkPlan> {
        self.build_with_truth(snapshot, snapshot)
    }

    pub fn build_with_truth(
        &self,
        snapshot: &AccuracySnapshot,
        truth: &dyn GroundTruthStore,
    ) -> Result<WorkPlan> {
        if !snapshot.rows.iter().any(|r| r.model == snapshot.test_model) {
            return Err(OptimizerError::NoComparisonData(snapshot.template_key.clone()));
        }

        let mut plan = WorkPlan {
            run_id: new_run_id(),
            template_key: snapshot.template_key.clone(),
            test_model: snapshot.test_model.clone(),
            sampled_document_ids: Vec::new(),
            sampled_documents: Vec::new(),
            fields: Vec::new(),
            untested_fields: Vec::new(),
        };

        let mut initial_accuracy: BTreeMap<&str, f64> = BTreeMap::new();
        for field in &snapshot.fields {
            match snapshot.field_accuracy(&field.key) {
                Some(accuracy) if accuracy < self.config.target_accuracy => {
                    initial_accuracy.insert(field.key.as_str(), accuracy);
                }
                Some(_) => {}
                None => debug!("Field '{}' has no comparison rows; skipping", field.key),
            }
        }

        if initial_accuracy.is_empty() {
            info!(
                "All fields of template '{}' meet the {:.0}% target; nothing to optimize",
                snapshot.template_key,
                self.config.target_accuracy * 100.0
            );
            return Ok(plan);
        }

        let mut failures: FieldFailureMap = initial_accuracy
            .keys()
            .map(|key| {
                let records = snapshot
                    .rows_for(key)
                    .filter(|r| !r.outcome.is_match)
                    .map(failure_record)
                    .collect();
                (key.to_string(), records)
            })
            .collect();

        failures.retain(|key, records| {
            if records.is_empty() {
                warn!("Field '{}' is below target but has no failing rows; dropping it", key);
            }
            !records.is_empty()
        });

        let sampling = DocumentSampler::new(self.config.max_sampled_documents)
            .with_fill_remaining_budget(self.fill_sample_budget)
            .sample(&failures);

        plan.sampled_document_ids = sampling.document_ids();
        plan.sampled_documents = sampling
            .documents
            .iter()
            .map(|d| DocumentRef {
                id: d.document_id.clone(),
                name: d.document_name.clone(),
            })
            .collect();
        plan.untested_fields = sampling.uncovered_fields.clone();

        for field in &snapshot.fields {
            if !failures.contains_key(&field.key) || plan.untested_fields.contains(&field.key) {
                continue;
            }
            let ground_truth: BTreeMap<String, String> = plan
                .sampled_document_ids
                .iter()
                .filter_map(|doc| truth.get(doc, &field.key).map(|v| (doc.clone(), v)))
                .collect();
            if ground_truth.is_empty() {
                warn!("No ground truth for field '{}' on sampled documents", field.key);
                plan.untested_fields.push(field.key.clone());
                continue;
            }
            plan.fields.push(FieldPlan {
                field_key: field.key.clone(),
                field_definition: field.clone(),
                initial_accuracy: initial_accuracy[field.key.as_str()],
                ground_truth,
            });
        }

        info!(
            "Work plan {}: {} field(s) to optimize on {} document(s), {} untested",
            plan.run_id,
            plan.fields.len(),
            plan.sampled_document_ids.len(),
            plan.untested_fields.len()
        );

        Ok(plan)
    }
}

fn failure_record(row: &ComparisonRow) -> FailureRecord {
    let reason = row
        .outcome
        .error
        .clone()
        .or_else(|| row.outcome.details.clone())
        .unwrap_or_else(|| format!("{:?}", row.outcome.match_type));
    FailureRecord {
        document_id: row.document_id.clone(),
        document_name: row.document_name.clone(),
        ground_truth_value: row.ground_truth_value.clone(),
        extracted_value: row.extracted_value.clone(),
        comparison_reason: reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ComparisonOutcome, Confidence, FieldDefinition, FieldType, MatchType};

    fn row(field: &str, doc: &str, truth: &str, extracted: &str) -> ComparisonRow {
        let is_match = truth == extracted;
        ComparisonRow {
            field_key: field.to_string(),
            document_id: doc.to_string(),
            document_name: format!("{}.pdf", doc),
            model: "model-a".to_string(),
            extracted_value: extracted.to_string(),
            ground_truth_value: truth.to_string(),
            outcome: if is_match {
                ComparisonOutcome::matched(MatchType::Exact, Confidence::High)
            } else {
                ComparisonOutcome::unmatched(MatchType::Mismatch, Confidence::High)
            },
        }
    }

    fn snapshot(rows: Vec<ComparisonRow>) -> AccuracySnapshot {
        AccuracySnapshot {
            template_key: "lease".to_string(),
            test_model: "model-a".to_string(),
            fields: vec![
                FieldDefinition::new("rent", "Monthly Rent", FieldType::Currency),
                FieldDefinition::new("tenant", "Tenant", FieldType::Text),
                FieldDefinition::new("start", "Start Date", FieldType::Date),
            ],
            rows,
        }
    }

    #[test]
    fn test_no_comparison_data_is_an_error() {
        let config = OptimizerConfig::default();
        let err = WorkPlanBuilder::new(&config).build(&snapshot(vec![])).unwrap_err();
        assert!(matches!(err, OptimizerError::NoComparisonData(ref t) if t == "lease"));
    }

    #[test]
    fn test_all_fields_solved_gives_empty_plan() {
        let config = OptimizerConfig::default();
        let plan = WorkPlanBuilder::new(&config)
            .build(&snapshot(vec![
                row("rent", "d1", "100", "100"),
                row("tenant", "d1", "Bob", "Bob"),
            ]))
            .unwrap();
        assert!(plan.is_empty());
        assert!(plan.sampled_document_ids.is_empty());
        assert!(plan.run_id.starts_with("run-"));
    }

    #[test]
    fn test_plan_covers_failing_fields() {
        let config = OptimizerConfig::default();
        let plan = WorkPlanBuilder::new(&config)
            .build(&snapshot(vec![
                row("rent", "d1", "100", "100"),
                row("rent", "d2", "200", "20"),
                row("tenant", "d1", "Bob", "Rob"),
                row("tenant", "d2", "Ann", "Anne"),
                row("start", "d1", "2024-01-01", "2024-01-01"),
                row("start", "d2", "2024-02-01", "2024-02-01"),
            ]))
            .unwrap();

        assert_eq!(plan.sampled_document_ids, vec!["d2"]);
        let keys: Vec<&str> = plan.fields.iter().map(|f| f.field_key.as_str()).collect();
        assert_eq!(keys, vec!["rent", "tenant"]);
        assert_eq!(plan.fields[0].initial_accuracy, 0.5);
        assert_eq!(plan.fields[0].ground_truth.get("d2").map(String::as_str), Some("200"));
        assert_eq!(plan.fields[1].ground_truth.len(), 1);
        assert!(plan.untested_fields.is_empty());
    }

    #[test]
    fn test_lower_target_and_small_budget() {
        let config = OptimizerConfig {
            target_accuracy: 0.5,
            max_sampled_documents: 1,
            ..Default::default()
        };
        let plan = WorkPlanBuilder::new(&config)
            .build(&snapshot(vec![
                row("rent", "d1", "100", "100"),
                row("rent", "d2", "200", "20"),
                row("tenant", "d1", "Bob", "Rob"),
                row("start", "d2", "2024-02-01", "2024-03-01"),
            ]))
            .unwrap();

        // rent at 0.5 meets the lowered target; tenant and start need disjoint documents.
        assert_eq!(plan.sampled_document_ids.len(), 1);
        assert_eq!(plan.fields.len(), 1);
        assert_eq!(plan.untested_fields.len(), 1);
    }
}
