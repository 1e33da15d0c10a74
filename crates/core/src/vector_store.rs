use crate::error::RagError;
use crate::models::{Chunk, Document};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectionRecord {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectionManifest {
    pub name: String,
    pub document: Document,
    pub model_version: String,
    pub dimensions: usize,
    pub record_count: usize,
    pub sealed_at: DateTime<Utc>,
}

/// A sealed, read-only collection. Records keep their insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct Collection {
    manifest: CollectionManifest,
    records: Vec<CollectionRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub relevance: f32,
}

impl Collection {
    pub fn from_parts(
        manifest: CollectionManifest,
        records: Vec<CollectionRecord>,
    ) -> Result<Self, RagError> {
        if manifest.record_count != records.len() {
            return Err(RagError::Store(format!(
                "collection {} lists {} records but holds {}",
                manifest.name,
                manifest.record_count,
                records.len()
            )));
        }
        Ok(Self { manifest, records })
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn manifest(&self) -> &CollectionManifest {
        &self.manifest
    }

    pub fn records(&self) -> &[CollectionRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Diversity-aware top-`k`: MMR over the `fetch_k` most similar records.
    pub fn search_mmr(&self, query: &[f32], k: usize, fetch_k: usize, lambda: f32) -> Vec<ScoredChunk> {
        let vectors = self
            .records
            .iter()
            .map(|record| record.vector.as_slice())
            .collect::<Vec<_>>();

        mmr_select(query, &vectors, k, fetch_k, lambda)
            .into_iter()
            .map(|(index, relevance)| ScoredChunk {
                chunk: self.records[index].chunk.clone(),
                relevance,
            })
            .collect()
    }
}

/// Append-only staging area for a collection under construction.
#[derive(Debug)]
pub struct CollectionWriter {
    name: String,
    dimensions: usize,
    records: Vec<CollectionRecord>,
}

impl CollectionWriter {
    pub fn new(name: impl Into<String>, dimensions: usize) -> Self {
        Self {
            name: name.into(),
            dimensions,
            records: Vec::new(),
        }
    }

    pub fn append(&mut self, chunk: Chunk, vector: Vec<f32>) -> Result<(), RagError> {
        if vector.len() != self.dimensions {
            return Err(RagError::Store(format!(
                "vector for chunk {} has dimension {} != {}",
                chunk.sequence,
                vector.len(),
                self.dimensions
            )));
        }
        self.records.push(CollectionRecord { chunk, vector });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn seal(self, document: Document, model_version: &str) -> Result<Collection, RagError> {
        if self.records.is_empty() {
            return Err(RagError::EmptyContent(format!(
                "collection {} has no records",
                self.name
            )));
        }

        let manifest = CollectionManifest {
            name: self.name,
            document,
            model_version: model_version.to_string(),
            dimensions: self.dimensions,
            record_count: self.records.len(),
            sealed_at: Utc::now(),
        };
        Collection::from_parts(manifest, self.records)
    }
}

/// Storage for named collections. Replacing a collection is atomic: readers see either the
/// previous sealed collection or the new one, never a partial write.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn replace_collection(&self, collection: Collection) -> Result<Arc<Collection>, RagError>;

    async fn load_collection(&self, name: &str) -> Result<Option<Arc<Collection>>, RagError>;

    /// Returns whether a collection existed.
    async fn drop_collection(&self, name: &str) -> Result<bool, RagError>;

    async fn list_collections(&self) -> Result<Vec<String>, RagError>;
}

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }

    let dot = left.iter().zip(right).map(|(a, b)| a * b).sum::<f32>();
    let left_norm = left.iter().map(|value| value * value).sum::<f32>().sqrt();
    let right_norm = right.iter().map(|value| value * value).sum::<f32>().sqrt();

    if left_norm <= f32::EPSILON || right_norm <= f32::EPSILON {
        return 0.0;
    }

    let similarity = dot / (left_norm * right_norm);
    if similarity.is_finite() {
        similarity
    } else {
        0.0
    }
}

/// Maximal Marginal Relevance selection.
///
/// Takes the `fetch_k` vectors most similar to `query`, then greedily picks `k` of them
/// maximizing `lambda * relevance - (1 - lambda) * max_similarity_to_selected`.
/// Equal scores resolve to the lower index, i.e. insertion order. Returns
/// `(index, relevance)` pairs in selection order.
pub fn mmr_select(
    query: &[f32],
    vectors: &[&[f32]],
    k: usize,
    fetch_k: usize,
    lambda: f32,
) -> Vec<(usize, f32)> {
    if k == 0 || vectors.is_empty() {
        return Vec::new();
    }

    let mut pool = vectors
        .iter()
        .enumerate()
        .map(|(index, vector)| (index, cosine_similarity(query, vector)))
        .collect::<Vec<_>>();
    // Stable sort keeps insertion order among equal relevance.
    pool.sort_by(|left, right| right.1.partial_cmp(&left.1).unwrap_or(Ordering::Equal));
    pool.truncate(fetch_k.max(k));

    let mut selected: Vec<(usize, f32)> = Vec::with_capacity(k.min(pool.len()));
    while selected.len() < k && !pool.is_empty() {
        let mut best: Option<(usize, f32)> = None;

        for (position, (index, relevance)) in pool.iter().enumerate() {
            let redundancy = selected
                .iter()
                .map(|(chosen, _)| cosine_similarity(vectors[*index], vectors[*chosen]))
                .fold(0.0f32, f32::max);
            let score = lambda * relevance - (1.0 - lambda) * redundancy;

            let better = match best {
                None => true,
                Some((best_position, best_score)) => {
                    score > best_score || (score == best_score && *index < pool[best_position].0)
                }
            };
            if better {
                best = Some((position, score));
            }
        }

        match best {
            Some((position, _)) => selected.push(pool.remove(position)),
            None => break,
        }
    }

    selected
}
