//! Picks a small set of documents that exhibits every failing field.
//!
//! Greedy approximation of set cover: repeatedly take the document that fails
//! the most still-uncovered fields. Ties go to the document seen first when
//! walking the failure map in key order, so identical input always yields an
//! identical selection.

use crate::schema::{FieldFailureMap, SampledDocument, SamplingResult};
use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentSampler {
    pub max_documents: usize,
    /// After full coverage, keep adding the documents with the most failing
    /// fields until the budget is used up.
    pub fill_remaining_budget: bool,
}

struct Candidate {
    id: String,
    name: String,
    fields: BTreeSet<String>,
}

impl DocumentSampler {
    pub fn new(max_documents: usize) -> Self {
        Self {
            max_documents,
            fill_remaining_budget: false,
        }
    }

    pub fn with_fill_remaining_budget(mut self, fill: bool) -> Self {
        self.fill_remaining_budget = fill;
        self
    }

    pub fn sample(&self, failures: &FieldFailureMap) -> SamplingResult {
        let candidates = collect_candidates(failures);
        let mut uncovered: BTreeSet<String> = failures
            .iter()
            .filter(|(_, records)| !records.is_empty())
            .map(|(key, _)| key.clone())
            .collect();

        if uncovered.is_empty() {
            return SamplingResult::default();
        }

        let mut selected: Vec<usize> = Vec::new();

        while !uncovered.is_empty() && selected.len() < self.max_documents {
            let best = best_candidate(&candidates, &selected, |c| {
                c.fields.intersection(&uncovered).count()
            });
            let Some(idx) = best else { break };
            for field in &candidates[idx].fields {
                uncovered.remove(field);
            }
            debug!(
                "Sampler picked {} covering {:?}",
                candidates[idx].id, candidates[idx].fields
            );
            selected.push(idx);
        }

        if self.fill_remaining_budget {
            while selected.len() < self.max_documents {
                let Some(idx) = best_candidate(&candidates, &selected, |c| c.fields.len()) else {
                    break;
                };
                selected.push(idx);
            }
        }

        if !uncovered.is_empty() {
            warn!(
                "Document budget of {} leaves {} failing field(s) without a sampled document: {:?}",
                self.max_documents,
                uncovered.len(),
                uncovered
            );
        }

        let mut field_to_document_ids: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let documents = selected
            .iter()
            .map(|&idx| {
                let candidate = &candidates[idx];
                for field in &candidate.fields {
                    field_to_document_ids
                        .entry(field.clone())
                        .or_default()
                        .insert(candidate.id.clone());
                }
                SampledDocument {
                    document_id: candidate.id.clone(),
                    document_name: candidate.name.clone(),
                    covered_field_keys: candidate.fields.clone(),
                }
            })
            .collect();

        SamplingResult {
            documents,
            field_to_document_ids,
            uncovered_fields: uncovered.into_iter().collect(),
        }
    }
}

pub fn sample_documents(failures: &FieldFailureMap, max_documents: usize) -> SamplingResult {
    DocumentSampler::new(max_documents).sample(failures)
}

/// Unique failing documents in first-seen order with the fields each one fails.
fn collect_candidates(failures: &FieldFailureMap) -> Vec<Candidate> {
    let mut order: Vec<Candidate> = Vec::new();
    let mut index: BTreeMap<String, usize> = BTreeMap::new();

    for (field_key, records) in failures {
        for record in records {
            let idx = *index.entry(record.document_id.clone()).or_insert_with(|| {
                order.push(Candidate {
                    id: record.document_id.clone(),
                    name: record.document_name.clone(),
                    fields: BTreeSet::new(),
                });
                order.len() - 1
            });
            order[idx].fields.insert(field_key.clone());
        }
    }

    order
}

/// Highest-scoring unselected candidate with a positive score; earliest wins ties.
fn best_candidate<F>(candidates: &[Candidate], selected: &[usize], score: F) -> Option<usize>
where
    F: Fn(&Candidate) -> usize,
{
    let mut best: Option<(usize, usize)> = None;
    for (idx, candidate) in candidates.iter().enumerate() {
        if selected.contains(&idx) {
            continue;
        }
        let value = score(candidate);
        if value == 0 {
            continue;
        }
        if best.map_or(true, |(_, top)| value > top) {
            best = Some((idx, value));
        }
    }
    best.map(|(idx, _)| idx)
}
