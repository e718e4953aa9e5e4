//! Embedding model access — one model per process.
//!
//! Loading the model costs seconds and dominates cold start, so the process
//! holds a single lazily-initialized [`Embedder`] behind [`global`]. All
//! index builds, loads, and query embeddings share it; fanning out over N
//! shards therefore pays for one model load, not N.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tokenizers::Tokenizer;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Default embedding model.
pub const DEFAULT_MODEL: &str = "sentence-transformers/all-MiniLM-L6-v2";

/// Embedding width for known models; unrecognized HuggingFace IDs are
/// assumed BERT-base width.
fn resolve_dim(model_id: &str) -> usize {
    match model_id {
        "sentence-transformers/all-MiniLM-L6-v2" | "sentence-transformers/all-MiniLM-L12-v2" => 384,
        _ => 768,
    }
}

/// Texts embedded per model invocation during index builds.
pub const EMBED_BATCH: usize = 32;

/// A batch text-to-vector encoder. Vectors are L2-normalized, so dot product
/// equals cosine similarity and scores are comparable across indices built
/// with the same model.
pub trait Embedder: Send + Sync {
    fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;
    fn dimension(&self) -> usize;
    fn model_id(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Process-wide singleton
// ---------------------------------------------------------------------------

/// A const-constructible once cell with fallible initialization. Concurrent
/// first callers serialize on one mutex; exactly one factory call runs.
pub struct Lazy<T: ?Sized> {
    cell: OnceLock<Arc<T>>,
    init: Mutex<()>,
}

impl<T: ?Sized> Lazy<T> {
    pub const fn new() -> Self {
        Self { cell: OnceLock::new(), init: Mutex::new(()) }
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.cell.get().cloned()
    }

    pub fn get_or_try_init<E>(&self, f: impl FnOnce() -> Result<Arc<T>, E>) -> Result<Arc<T>, E> {
        if let Some(v) = self.cell.get() {
            return Ok(Arc::clone(v));
        }
        let _guard = self.init.lock().unwrap();
        if let Some(v) = self.cell.get() {
            return Ok(Arc::clone(v));
        }
        let v = f()?;
        let _ = self.cell.set(Arc::clone(&v));
        Ok(v)
    }
}

static GLOBAL: Lazy<dyn Embedder> = Lazy::new();

/// Return the process-wide embedder, loading the model on first call.
///
/// The handle lives for the process lifetime; there is no teardown. If the
/// singleton was already initialized with a different model id, the existing
/// handle is returned and a warning is logged — mixed-model indices are
/// rejected at load time instead.
pub fn global(model_id: &str) -> Result<Arc<dyn Embedder>> {
    let handle = GLOBAL.get_or_try_init(|| -> Result<Arc<dyn Embedder>, Error> {
        let start = Instant::now();
        let embedder = CandleEmbedder::load(model_id)?;
        info!(
            model = model_id,
            dim = embedder.dimension(),
            load_ms = start.elapsed().as_millis() as u64,
            "embedding model loaded"
        );
        Ok(Arc::new(embedder) as Arc<dyn Embedder>)
    })?;
    if handle.model_id() != model_id {
        warn!(
            requested = model_id,
            loaded = handle.model_id(),
            "embedding model already loaded, ignoring requested model"
        );
    }
    Ok(handle)
}

// ---------------------------------------------------------------------------
// BERT embedder (candle)
// ---------------------------------------------------------------------------

/// Sentence embedder backed by a BERT model with mean pooling.
pub struct CandleEmbedder {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    dim: usize,
    model_id: String,
}

impl CandleEmbedder {
    /// Fetch config, tokenizer, and weights from the HuggingFace Hub (cached
    /// under the hub's default cache dir) and load the model on CPU.
    pub fn load(model_id: &str) -> Result<Self> {
        let device = Device::Cpu;
        let api = Api::new()?;
        let repo =
            api.repo(Repo::with_revision(model_id.to_string(), RepoType::Model, "main".into()));

        let config_path = repo.get("config.json")?;
        let tokenizer_path = repo.get("tokenizer.json")?;
        let weights_path = repo.get("model.safetensors")?;

        let config: BertConfig = serde_json::from_str(&std::fs::read_to_string(&config_path)?)?;
        let dim = resolve_dim(model_id);

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| Error::EmbeddingFailure(format!("tokenizer: {e}")))?;

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path], DType::F32, &device)?
        };
        let model = BertModel::load(vb, &config)?;

        Ok(Self { model, tokenizer, device, dim, model_id: model_id.to_string() })
    }

    /// Tokenize with padding and run a forward pass, mean-pooling the output
    /// over the attention mask.
    fn encode(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| Error::EmbeddingFailure(format!("tokenization: {e}")))?;

        let max_len = encodings.iter().map(|e| e.get_ids().len()).max().unwrap_or(0);
        let batch = texts.len();

        let mut ids = Vec::with_capacity(batch * max_len);
        let mut mask = Vec::with_capacity(batch * max_len);
        let mut type_ids = Vec::with_capacity(batch * max_len);
        for enc in &encodings {
            let pad = max_len - enc.get_ids().len();
            ids.extend_from_slice(enc.get_ids());
            ids.extend(std::iter::repeat(0_u32).take(pad));
            mask.extend_from_slice(enc.get_attention_mask());
            mask.extend(std::iter::repeat(0_u32).take(pad));
            type_ids.extend_from_slice(enc.get_type_ids());
            type_ids.extend(std::iter::repeat(0_u32).take(pad));
        }

        let input_ids = Tensor::from_vec(ids, (batch, max_len), &self.device)?;
        let token_type_ids = Tensor::from_vec(type_ids, (batch, max_len), &self.device)?;
        let mask_f32: Vec<f32> = mask.iter().map(|&m| m as f32).collect();
        let attention_mask = Tensor::from_vec(mask_f32, (batch, max_len), &self.device)?;

        let hidden = self.model.forward(&input_ids, &token_type_ids, Some(&attention_mask))?;

        // Mean pooling: sum(hidden * mask) / sum(mask), per sequence.
        let mask_t = attention_mask.unsqueeze(2)?.broadcast_as(hidden.shape())?;
        let summed = hidden.mul(&mask_t)?.sum(1)?;
        let counts = mask_t.sum(1)?.clamp(1e-9, f64::MAX)?;
        let pooled = summed.div(&counts)?.to_vec2::<f32>()?;

        Ok(pooled.into_iter().map(|row| l2_normalize(row)).collect())
    }
}

impl Embedder for CandleEmbedder {
    fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.encode(texts)
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

/// Normalize a vector to unit length. Zero vectors are returned unchanged.
pub fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-12 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

// ---------------------------------------------------------------------------
// Deterministic hash embedder (tests, offline smoke runs)
// ---------------------------------------------------------------------------

/// Model-free embedder: each whitespace token is hashed into a fixed-dim
/// bucket. Deterministic across runs and machines, cosine-meaningful enough
/// that identical texts score 1.0 and disjoint texts near 0.
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            let mut v = vec![0.0_f32; self.dim];
            for token in text.split_whitespace() {
                let mut hasher = DefaultHasher::new();
                token.to_lowercase().hash(&mut hasher);
                let h = hasher.finish();
                let bucket = (h % self.dim as u64) as usize;
                let sign = if h & (1 << 63) == 0 { 1.0 } else { -1.0 };
                v[bucket] += sign;
            }
            if v.iter().all(|&x| x == 0.0) {
                v[0] = 1.0;
            }
            out.push(l2_normalize(v));
        }
        Ok(out)
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    fn model_id(&self) -> &str {
        "hash-embedder"
    }
}
