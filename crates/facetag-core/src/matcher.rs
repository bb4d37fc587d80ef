//! Gallery matching with a similarity threshold and an ambiguity margin.

use crate::config::PipelineConfig;
use crate::types::{Embedding, EventId, GalleryEntry, TagId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Which gallery entries a recognition may consider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecognitionContext {
    pub event: EventId,
    pub valid_tags: HashSet<TagId>,
}

impl RecognitionContext {
    pub fn new(event: impl Into<EventId>, tags: impl IntoIterator<Item = TagId>) -> Self {
        Self {
            event: event.into(),
            valid_tags: tags.into_iter().collect(),
        }
    }

    pub fn admits(&self, entry: &GalleryEntry) -> bool {
        entry.event == self.event && self.valid_tags.contains(&entry.tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchParams {
    pub threshold: f32,
    pub ambiguity_margin: f32,
}

impl Default for MatchParams {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for MatchParams {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            threshold: config.match_threshold,
            ambiguity_margin: config.ambiguity_margin,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchOutcome {
    Matched {
        tag: TagId,
        similarity: f32,
    },
    /// Best tag cleared the threshold but another tag was within the margin.
    Ambiguous {
        best: TagId,
        runner_up: TagId,
        similarity: f32,
        runner_up_similarity: f32,
    },
    /// `None` when nothing comparable was in the gallery.
    Unmatched { best_similarity: Option<f32> },
}

impl MatchOutcome {
    pub fn tag(&self) -> Option<&TagId> {
        match self {
            MatchOutcome::Matched { tag, .. } => Some(tag),
            _ => None,
        }
    }

    pub fn best_similarity(&self) -> Option<f32> {
        match self {
            MatchOutcome::Matched { similarity, .. } => Some(*similarity),
            MatchOutcome::Ambiguous { similarity, .. } => Some(*similarity),
            MatchOutcome::Unmatched { best_similarity } => *best_similarity,
        }
    }
}

pub trait Matcher {
    fn compare(
        &self,
        query: &Embedding,
        gallery: &[GalleryEntry],
        context: &RecognitionContext,
        params: &MatchParams,
    ) -> MatchOutcome;
}

/// Cosine similarity matcher.
///
/// Scores every admissible entry, keeps the best score per tag, then applies
/// the threshold and the margin between the best and second-best tag. Two
/// entries of the same tag never make a match ambiguous.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(
        &self,
        query: &Embedding,
        gallery: &[GalleryEntry],
        context: &RecognitionContext,
        params: &MatchParams,
    ) -> MatchOutcome {
        let mut per_tag: BTreeMap<&TagId, f32> = BTreeMap::new();

        for entry in gallery {
            if !context.admits(entry) || entry.embedding.model_version != query.model_version {
                continue;
            }
            let sim = query.similarity(&entry.embedding);
            per_tag
                .entry(&entry.tag)
                .and_modify(|best| *best = best.max(sim))
                .or_insert(sim);
        }

        // Highest score first; ties resolve to the lexicographically smaller tag.
        let mut ranked: Vec<(&TagId, f32)> = per_tag.into_iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

        let Some(&(best_tag, best)) = ranked.first() else {
            return MatchOutcome::Unmatched {
                best_similarity: None,
            };
        };

        if best < params.threshold {
            return MatchOutcome::Unmatched {
                best_similarity: Some(best),
            };
        }

        match ranked.get(1) {
            Some(&(runner_tag, runner)) if best - runner < params.ambiguity_margin => {
                MatchOutcome::Ambiguous {
                    best: best_tag.clone(),
                    runner_up: runner_tag.clone(),
                    similarity: best,
                    runner_up_similarity: runner,
                }
            }
            _ => MatchOutcome::Matched {
                tag: best_tag.clone(),
                similarity: best,
            },
        }
    }
}
