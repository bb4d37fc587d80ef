//! Per-tag gallery of representative embeddings.
//!
//! Each tag keeps a bounded set of fused embeddings (oldest evicted first)
//! behind its own lock, so writes to one tag never block another and readers
//! always see a consistent per-tag snapshot.

use crate::config::PipelineConfig;
use crate::matcher::RecognitionContext;
use crate::types::{Embedding, EventId, Face, FaceId, GalleryEntry, TagId};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery io: {0}")]
    Io(#[from] std::io::Error),
    #[error("gallery json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("gallery lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GalleryPolicy {
    /// Entries kept per tag.
    pub capacity: usize,
    /// New entries must reach this similarity to at least one existing entry.
    pub outlier_threshold: f32,
}

impl Default for GalleryPolicy {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for GalleryPolicy {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            capacity: config.gallery_capacity,
            outlier_threshold: config.outlier_threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdateOrigin {
    /// High-confidence automatic match.
    Automatic { similarity: f32 },
    /// A human labelled or confirmed the face.
    Manual,
}

/// Request to add a face's fused embedding to a tag's gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryUpdate {
    pub face: FaceId,
    pub tag: TagId,
    pub event: EventId,
    pub embedding: Embedding,
    pub origin: UpdateOrigin,
}

impl GalleryUpdate {
    /// Manual label. `None` if the face has no fused embedding.
    pub fn manual(face: &Face, tag: TagId, event: EventId) -> Option<Self> {
        Some(Self {
            face: face.id,
            tag,
            event,
            embedding: face.fused_embedding.clone()?,
            origin: UpdateOrigin::Manual,
        })
    }

    /// Human label: resolves the face to `tag` and builds the matching
    /// manual update. `None` (face untouched) if there is no fused embedding.
    pub fn label(face: &mut Face, tag: TagId, event: EventId) -> Option<Self> {
        let update = Self::manual(face, tag.clone(), event)?;
        face.resolve_manually(Some(tag));
        Some(update)
    }

    /// Automatic match feedback. `None` unless the face is matched with a
    /// fused embedding and score.
    pub fn automatic(face: &Face, event: EventId) -> Option<Self> {
        Some(Self {
            face: face.id,
            tag: face.recognized_tag.clone()?,
            event,
            embedding: face.fused_embedding.clone()?,
            origin: UpdateOrigin::Automatic {
                similarity: face.fused_score?,
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum GalleryRejection {
    /// The tag's entries belong to a different event.
    ScopeMismatch { expected: EventId, got: EventId },
    /// This face already contributed to the tag.
    Duplicate,
    /// Produced by a different model or fusion version than the tag's entries.
    VersionMismatch {
        expected: Option<String>,
        got: Option<String>,
    },
    /// Too dissimilar from every existing entry.
    Outlier { max_similarity: f32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum IncorporateOutcome {
    Added { entry: Uuid, evicted: Option<Uuid> },
    Rejected(GalleryRejection),
}

#[derive(Debug)]
struct TagGallery {
    event: EventId,
    entries: VecDeque<GalleryEntry>,
    /// Set once the slot has been unlinked from the store; writers that
    /// still hold it must look the tag up again.
    retired: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct GalleryFile {
    entries: Vec<GalleryEntry>,
}

type TagSlot = Arc<RwLock<TagGallery>>;

pub struct GalleryStore {
    policy: GalleryPolicy,
    tags: RwLock<HashMap<TagId, TagSlot>>,
}

impl GalleryStore {
    pub fn new(policy: GalleryPolicy) -> Self {
        Self {
            policy,
            tags: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> GalleryPolicy {
        self.policy
    }

    fn slot(&self, tag: &TagId) -> Result<Option<TagSlot>, GalleryError> {
        let tags = self.tags.read().map_err(|_| GalleryError::Poisoned)?;
        Ok(tags.get(tag).cloned())
    }

    fn slot_or_insert(&self, tag: &TagId, event: &EventId) -> Result<TagSlot, GalleryError> {
        if let Some(slot) = self.slot(tag)? {
            return Ok(slot);
        }
        let mut tags = self.tags.write().map_err(|_| GalleryError::Poisoned)?;
        let slot = tags.entry(tag.clone()).or_insert_with(|| {
            Arc::new(RwLock::new(TagGallery {
                event: event.clone(),
                entries: VecDeque::new(),
                retired: false,
            }))
        });
        Ok(Arc::clone(slot))
    }

    /// Apply the gallery policy to one update.
    pub fn incorporate(&self, update: GalleryUpdate) -> Result<IncorporateOutcome, GalleryError> {
        let slot = self.slot_or_insert(&update.tag, &update.event)?;
        let mut gallery = slot.write().map_err(|_| GalleryError::Poisoned)?;
        if gallery.retired {
            // Unlinked after lookup; the next lookup sees the current slot.
            drop(gallery);
            return self.incorporate(update);
        }

        if gallery.entries.is_empty() {
            gallery.event = update.event.clone();
        }

        if let Some(rejection) = self.check(&gallery, &update) {
            tracing::warn!(
                tag = %update.tag,
                face = %update.face,
                ?rejection,
                "gallery update rejected"
            );
            return Ok(IncorporateOutcome::Rejected(rejection));
        }

        let tag = update.tag.clone();
        let entry = GalleryEntry {
            id: Uuid::new_v4(),
            tag: update.tag,
            event: update.event,
            embedding: update.embedding,
            source_face: update.face,
            created_at: Utc::now(),
        };
        let entry_id = entry.id;
        gallery.entries.push_back(entry);

        let evicted = if gallery.entries.len() > self.policy.capacity {
            gallery.entries.pop_front().map(|e| e.id)
        } else {
            None
        };

        tracing::debug!(
            %tag,
            entries = gallery.entries.len(),
            evicted = ?evicted,
            origin = ?update.origin,
            "gallery entry added"
        );

        Ok(IncorporateOutcome::Added {
            entry: entry_id,
            evicted,
        })
    }

    fn check(&self, gallery: &TagGallery, update: &GalleryUpdate) -> Option<GalleryRejection> {
        if gallery.event != update.event {
            return Some(GalleryRejection::ScopeMismatch {
                expected: gallery.event.clone(),
                got: update.event.clone(),
            });
        }

        if gallery.entries.iter().any(|e| e.source_face == update.face) {
            return Some(GalleryRejection::Duplicate);
        }

        // First entry is always accepted.
        let first = gallery.entries.front()?;
        if first.embedding.model_version != update.embedding.model_version {
            return Some(GalleryRejection::VersionMismatch {
                expected: first.embedding.model_version.clone(),
                got: update.embedding.model_version.clone(),
            });
        }

        let max_similarity = gallery
            .entries
            .iter()
            .map(|e| e.embedding.similarity(&update.embedding))
            .fold(f32::NEG_INFINITY, f32::max);
        if max_similarity < self.policy.outlier_threshold {
            return Some(GalleryRejection::Outlier { max_similarity });
        }

        None
    }

    /// Entries admissible under `context`, grouped by tag in tag order.
    pub fn snapshot(&self, context: &RecognitionContext) -> Result<Vec<GalleryEntry>, GalleryError> {
        let mut tags: Vec<&TagId> = context.valid_tags.iter().collect();
        tags.sort();

        let mut out = Vec::new();
        for tag in tags {
            let Some(slot) = self.slot(tag)? else {
                continue;
            };
            let gallery = slot.read().map_err(|_| GalleryError::Poisoned)?;
            out.extend(gallery.entries.iter().filter(|e| context.admits(e)).cloned());
        }
        Ok(out)
    }

    /// All entries of one tag, oldest first.
    pub fn entries_for(&self, tag: &TagId) -> Result<Vec<GalleryEntry>, GalleryError> {
        let Some(slot) = self.slot(tag)? else {
            return Ok(Vec::new());
        };
        let gallery = slot.read().map_err(|_| GalleryError::Poisoned)?;
        Ok(gallery.entries.iter().cloned().collect())
    }

    pub fn tags(&self) -> Result<Vec<TagId>, GalleryError> {
        let tags = self.tags.read().map_err(|_| GalleryError::Poisoned)?;
        let mut ids: Vec<TagId> = tags.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    /// Drop a tag and all its entries. Returns the number of entries removed.
    pub fn remove_tag(&self, tag: &TagId) -> Result<usize, GalleryError> {
        let removed = {
            let mut tags = self.tags.write().map_err(|_| GalleryError::Poisoned)?;
            tags.remove(tag)
        };
        let Some(slot) = removed else {
            return Ok(0);
        };
        let mut gallery = slot.write().map_err(|_| GalleryError::Poisoned)?;
        gallery.retired = true;
        tracing::info!(%tag, entries = gallery.entries.len(), "gallery tag removed");
        Ok(gallery.entries.len())
    }

    /// Remove every entry sourced from `face` (e.g., after the face was
    /// relabelled). Tags left without entries are dropped.
    pub fn remove_face_contributions(&self, face: FaceId) -> Result<usize, GalleryError> {
        let slots: Vec<(TagId, TagSlot)> = {
            let tags = self.tags.read().map_err(|_| GalleryError::Poisoned)?;
            tags.iter().map(|(t, s)| (t.clone(), Arc::clone(s))).collect()
        };

        let mut removed = 0;
        let mut emptied = Vec::new();
        for (tag, slot) in slots {
            let mut gallery = slot.write().map_err(|_| GalleryError::Poisoned)?;
            let before = gallery.entries.len();
            gallery.entries.retain(|e| e.source_face != face);
            if gallery.entries.len() < before {
                removed += before - gallery.entries.len();
                if gallery.entries.is_empty() {
                    emptied.push((tag, Arc::clone(&slot)));
                }
            }
        }

        if !emptied.is_empty() {
            let mut tags = self.tags.write().map_err(|_| GalleryError::Poisoned)?;
            for (tag, slot) in emptied {
                if !tags.get(&tag).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
                    continue;
                }
                // A concurrent update may have refilled it meanwhile.
                let mut gallery = slot.write().map_err(|_| GalleryError::Poisoned)?;
                if gallery.entries.is_empty() {
                    gallery.retired = true;
                    tags.remove(&tag);
                    tracing::debug!(%tag, "emptied gallery tag dropped");
                }
            }
        }
        Ok(removed)
    }

    pub fn len(&self) -> Result<usize, GalleryError> {
        let slots: Vec<TagSlot> = {
            let tags = self.tags.read().map_err(|_| GalleryError::Poisoned)?;
            tags.values().cloned().collect()
        };
        let mut total = 0;
        for slot in slots {
            total += slot.read().map_err(|_| GalleryError::Poisoned)?.entries.len();
        }
        Ok(total)
    }

    pub fn is_empty(&self) -> Result<bool, GalleryError> {
        Ok(self.len()? == 0)
    }

    /// Write the whole store as JSON, replacing `path` atomically.
    pub fn save(&self, path: &Path) -> Result<(), GalleryError> {
        let mut entries = Vec::new();
        for tag in self.tags()? {
            entries.extend(self.entries_for(&tag)?);
        }

        let tmp = path.with_extension("json.tmp");
        {
            let writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer_pretty(writer, &GalleryFile { entries })?;
        }
        std::fs::rename(&tmp, path)?;
        tracing::info!(path = %path.display(), "gallery saved");
        Ok(())
    }

    /// Load a store written by [`GalleryStore::save`]. Entries are restored
    /// as-is, without re-running the admission policy.
    pub fn load(path: &Path, policy: GalleryPolicy) -> Result<Self, GalleryError> {
        let reader = BufReader::new(File::open(path)?);
        let file: GalleryFile = serde_json::from_reader(reader)?;

        let mut tags: HashMap<TagId, TagGallery> = HashMap::new();
        for entry in file.entries {
            let gallery = tags.entry(entry.tag.clone()).or_insert_with(|| TagGallery {
                event: entry.event.clone(),
                entries: VecDeque::new(),
                retired: false,
            });
            gallery.entries.push_back(entry);
        }

        let count: usize = tags.values().map(|g| g.entries.len()).sum();
        tracing::info!(path = %path.display(), tags = tags.len(), entries = count, "gallery loaded");

        Ok(Self {
            policy,
            tags: RwLock::new(
                tags.into_iter()
                    .map(|(tag, gallery)| (tag, Arc::new(RwLock::new(gallery))))
                    .collect(),
            ),
        })
    }
}
