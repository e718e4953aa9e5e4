//! In-memory vector index — flat embedding storage with exact cosine top-k.
//!
//! Embeddings live in one contiguous `Vec<f32>` of `len * dim` floats with a
//! parallel passage vector, so search is a cache-friendly scan of dot
//! products (vectors are L2-normalized, dot product = cosine similarity).
//! Exact search over a few hundred thousand chunks is comfortably inside the
//! service's sub-second latency budget.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A chunk as stored in an index: text plus display metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredChunk {
    pub text: String,
    /// Originating source filename (display only — never part of identity).
    pub source: String,
    /// 1-based page number, when the source text carried page breaks.
    pub page: usize,
    /// Position of the chunk within its source.
    pub ordinal: usize,
}

/// A search hit: similarity score plus the owned passage.
#[derive(Clone, Debug)]
pub struct ScoredPassage {
    pub score: f32,
    pub text: String,
    pub source: String,
    pub page: usize,
    pub ordinal: usize,
}

/// Searchable index over embedded chunks.
#[derive(Debug)]
pub struct VectorIndex {
    embeddings: Vec<f32>,
    chunks: Vec<StoredChunk>,
    dim: usize,
    model_id: String,
}

impl VectorIndex {
    /// Assemble an index from parallel chunk and vector lists.
    pub fn from_parts(
        chunks: Vec<StoredChunk>,
        vectors: Vec<Vec<f32>>,
        dim: usize,
        model_id: String,
    ) -> Result<Self> {
        if chunks.len() != vectors.len() {
            return Err(Error::EmbeddingFailure(format!(
                "{} chunks but {} vectors",
                chunks.len(),
                vectors.len()
            )));
        }
        let mut embeddings = Vec::with_capacity(chunks.len() * dim);
        for v in &vectors {
            if v.len() != dim {
                return Err(Error::EmbeddingFailure(format!(
                    "vector of dim {} in index of dim {dim}",
                    v.len()
                )));
            }
            embeddings.extend_from_slice(v);
        }
        Ok(Self { embeddings, chunks, dim, model_id })
    }

    /// Rehydrate an index from its persisted flat representation.
    pub fn from_flat(
        chunks: Vec<StoredChunk>,
        embeddings: Vec<f32>,
        dim: usize,
        model_id: String,
    ) -> Result<Self> {
        if dim == 0 || embeddings.len() != chunks.len() * dim {
            return Err(Error::EmbeddingFailure(format!(
                "flat embedding length {} does not match {} chunks of dim {dim}",
                embeddings.len(),
                chunks.len()
            )));
        }
        Ok(Self { embeddings, chunks, dim, model_id })
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn chunks(&self) -> &[StoredChunk] {
        &self.chunks
    }

    pub fn embeddings(&self) -> &[f32] {
        &self.embeddings
    }

    /// Exact top-k search by descending cosine similarity. Ties resolve by
    /// ascending chunk ordinal so results are deterministic.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredPassage>> {
        if query.len() != self.dim {
            return Err(Error::EmbeddingFailure(format!(
                "query vector dim {} does not match index dim {}",
                query.len(),
                self.dim
            )));
        }

        let mut scores: Vec<(usize, f32)> = Vec::with_capacity(self.chunks.len());
        for i in 0..self.chunks.len() {
            let offset = i * self.dim;
            let row = &self.embeddings[offset..offset + self.dim];
            let dot: f32 = query.iter().zip(row).map(|(a, b)| a * b).sum();
            scores.push((i, dot));
        }

        scores.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| self.chunks[a.0].ordinal.cmp(&self.chunks[b.0].ordinal))
        });
        scores.truncate(k);

        Ok(scores
            .into_iter()
            .map(|(i, score)| {
                let chunk = &self.chunks[i];
                ScoredPassage {
                    score,
                    text: chunk.text.clone(),
                    source: chunk.source.clone(),
                    page: chunk.page,
                    ordinal: chunk.ordinal,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::{Embedder, HashEmbedder};

    fn chunk(text: &str, ordinal: usize) -> StoredChunk {
        StoredChunk { text: text.to_string(), source: "doc.pdf".into(), page: 1, ordinal }
    }

    fn build_index(texts: &[&str]) -> (VectorIndex, HashEmbedder) {
        let embedder = HashEmbedder::new(64);
        let vectors = embedder.embed(texts).unwrap();
        let chunks = texts.iter().enumerate().map(|(i, t)| chunk(t, i)).collect();
        let index =
            VectorIndex::from_parts(chunks, vectors, 64, embedder.model_id().into()).unwrap();
        (index, embedder)
    }

    #[test]
    fn search_returns_best_match_first() {
        let (index, embedder) = build_index(&[
            "the cat sat on the mat",
            "stellar nucleosynthesis in red giants",
            "a cat sat quietly on a mat",
        ]);
        let q = &embedder.embed(&["cat on the mat"]).unwrap()[0];
        let hits = index.search(q, 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].score >= hits[1].score);
        assert!(hits[0].text.contains("cat"));
    }

    #[test]
    fn search_scores_are_monotonically_non_increasing() {
        let (index, embedder) =
            build_index(&["alpha beta", "beta gamma", "gamma delta", "delta epsilon"]);
        let q = &embedder.embed(&["beta"]).unwrap()[0];
        let hits = index.search(q, 4).unwrap();
        for pair in hits.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn k_larger_than_index_returns_all() {
        let (index, embedder) = build_index(&["one", "two"]);
        let q = &embedder.embed(&["one"]).unwrap()[0];
        assert_eq!(index.search(q, 10).unwrap().len(), 2);
    }

    #[test]
    fn mismatched_query_dim_is_rejected() {
        let (index, _) = build_index(&["one"]);
        assert!(index.search(&[0.0; 8], 1).is_err());
    }

    #[test]
    fn from_flat_validates_length() {
        let chunks = vec![chunk("a", 0), chunk("b", 1)];
        assert!(VectorIndex::from_flat(chunks.clone(), vec![0.0; 7], 4, "m".into()).is_err());
        assert!(VectorIndex::from_flat(chunks, vec![0.0; 8], 4, "m".into()).is_ok());
    }
}
