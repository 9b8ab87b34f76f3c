//! An embeddable CPU inference engine for small decoder-only language
//! models.
//!
//! `emberlm` loads quantized weights through a pluggable loader, tokenizes
//! text, runs autoregressive forward passes on the CPU, samples under a
//! configurable policy, and returns completions as whole strings or
//! streamed token events. It is library-first: the engine lives inside the
//! host process and serves many independent sessions concurrently while
//! bounding KV cache memory.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use emberlm::{Engine, EngineConfig, GenerationRequest, SessionOptions};
//! use emberlm::loader::{LoadContext, LoadError, LoadedModel, ModelLoader};
//!
//! // The GGUF parser lives outside the engine; anything that can produce
//! // a model bundle plugs in here.
//! struct MyLoader;
//! impl ModelLoader for MyLoader {
//!     fn load(&self, path: &std::path::Path, ctx: &LoadContext) -> Result<LoadedModel, LoadError> {
//!         unimplemented!("parse a model file")
//!     }
//! }
//!
//! let engine = Engine::load(
//!     EngineConfig {
//!         model_path: "/path/to/model".into(),
//!         ..Default::default()
//!     },
//!     &MyLoader,
//! )
//! .unwrap_or_else(|err| panic!("failed to load model: {err}"));
//!
//! let mut session = engine.create_session(SessionOptions::default()).unwrap();
//! let result = session
//!     .generate(&GenerationRequest::text("Rust is a cool language because", 64))
//!     .unwrap();
//! println!("{}", result.text);
//! ```
#![deny(missing_docs)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;

// This is the user-facing API; the split into base and math crates is an
// implementation detail.
pub use emberlm_base::{
    error, loader, sampler, session, telemetry, tokenizer, CancellationToken, ChatMessage,
    ContextPolicy, ErrorKind, FinishReason, GenerationRequest, GenerationResult, Hyperparameters,
    InferenceError, KvBudget, KvStore, LayerWeights, LoadContext, LoadError, LoadedModel,
    ModelBundle, ModelFingerprint, ModelLoader, Prompt, Role, SamplerParams, Session,
    SessionConfig, SessionId, SessionSnapshot, SessionState, TelemetryEvent, TelemetrySink,
    Timings, TokenEvent, TokenId, TokenStream, Tokenizer, Usage, Weight,
};
pub use emberlm_math::{Scheme, Shape, Tensor};

use emberlm_base::telemetry::LogSink;
use emberlm_base::{check_tokenizer, KvEntry};

/// Engine-level configuration, usually deserialized from the host's config
/// file.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Path of the model file handed to the loader.
    pub model_path: PathBuf,
    /// Cap the context window below what the model file declares.
    pub max_context_tokens: Option<usize>,
    /// When disabled, every token re-runs the whole context; correctness
    /// is preserved, throughput collapses. Debugging aid.
    pub enable_kv_cache: bool,
    /// Worker threads for kernel tile parallelism; `None` uses the
    /// processor count.
    pub thread_count: Option<usize>,
    /// Per-request wall-clock deadline.
    pub request_timeout_ms: Option<u64>,
    /// KV budget: bytes one session's cache may occupy.
    pub kv_max_bytes_per_session: usize,
    /// KV budget: bytes all caches together may occupy.
    pub kv_max_bytes_total: usize,
    /// KV budget: number of live sessions.
    pub kv_max_sessions: usize,
    /// Permit importing foreign GGUF files. Imports are cached by a
    /// content hash of the file, so identical bytes load once.
    pub allow_gguf_import: bool,
    /// Where the loader may cache converted imports.
    pub gguf_cache_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let kv = KvBudget::default();
        EngineConfig {
            model_path: PathBuf::new(),
            max_context_tokens: None,
            enable_kv_cache: true,
            thread_count: None,
            request_timeout_ms: None,
            kv_max_bytes_per_session: kv.max_bytes_per_session,
            kv_max_bytes_total: kv.max_bytes_total,
            kv_max_sessions: kv.max_sessions,
            allow_gguf_import: false,
            gguf_cache_dir: None,
        }
    }
}

/// Per-session options accepted by [`Engine::create_session`].
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Default sampler parameters; requests may override.
    pub sampler: Option<SamplerParams>,
    /// Context-window policy; defaults to a sliding window.
    pub context_policy: Option<ContextPolicy>,
    /// Prefill batch size.
    pub n_batch: Option<usize>,
    /// Bind to an existing session id, picking its KV entry back up if it
    /// is still resident; otherwise a fresh id is assigned.
    pub session_id: Option<SessionId>,
}

/// What this engine build can do, for host feature negotiation.
#[derive(Debug, Clone, PartialEq)]
pub struct Capabilities {
    /// Token-by-token streaming is available.
    pub supports_streaming: bool,
    /// The embedding surface is available.
    pub supports_embeddings: bool,
    /// The model's context window.
    pub max_model_tokens: usize,
    /// Weight schemes present in the loaded model.
    pub available_quantizations: Vec<Scheme>,
}

/// Errors surfaced at the engine boundary.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Model loading failed; see the wrapped loader error.
    #[error(transparent)]
    Load(#[from] LoadError),
    /// Engine or session options failed validation.
    #[error("invalid options: {0}")]
    InvalidOptions(String),
    /// The worker pool could not be built.
    #[error("failed to build worker pool: {0}")]
    WorkerPool(String),
    /// An inference-side failure crossed the engine boundary.
    #[error(transparent)]
    Inference(#[from] InferenceError),
}

/// A process-wide cache of loaded models, keyed by content fingerprint.
///
/// Deliberately explicit rather than a hidden singleton: hosts that load
/// several engines share one of these by reference.
#[derive(Default)]
pub struct ModelCache {
    inner: Mutex<HashMap<ModelFingerprint, LoadedModel>>,
}

impl ModelCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, fp: &ModelFingerprint) -> Option<LoadedModel> {
        self.inner.lock().unwrap().get(fp).cloned()
    }

    fn insert(&self, fp: ModelFingerprint, model: LoadedModel) {
        self.inner.lock().unwrap().insert(fp, model);
    }

    /// Number of cached models.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The engine: one loaded model, one KV store, one worker pool, and a
/// factory for sessions.
///
/// Thread-safe for session creation; individual sessions are not shared
/// between threads. Teardown order follows field order: the KV store
/// first, then the worker pool (whose threads own the scratch arenas),
/// then the model bundle.
pub struct Engine {
    kv: Arc<KvStore>,
    pool: Arc<rayon::ThreadPool>,
    tokenizer: Arc<dyn Tokenizer>,
    model: Arc<ModelBundle>,
    telemetry: Arc<dyn TelemetrySink>,
    config: EngineConfig,
    next_session: AtomicU64,
}

impl Engine {
    /// Load a model through `loader` and assemble the runtime around it.
    pub fn load(config: EngineConfig, loader: &dyn ModelLoader) -> Result<Engine, EngineError> {
        Self::load_with(config, loader, None, Arc::new(LogSink))
    }

    /// [`Engine::load`] with an import cache and a custom telemetry sink.
    pub fn load_with(
        config: EngineConfig,
        loader: &dyn ModelLoader,
        cache: Option<&ModelCache>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Result<Engine, EngineError> {
        validate_config(&config)?;

        let threads = config.thread_count.unwrap_or_else(num_cpus::get).max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("emberlm-worker-{i}"))
            .build()
            .map_err(|e| EngineError::WorkerPool(e.to_string()))?;

        let ctx = LoadContext {
            allow_gguf_import: config.allow_gguf_import,
            cache_dir: config.gguf_cache_dir.clone(),
            max_context_tokens: config.max_context_tokens,
        };

        let loaded = match cache.filter(|_| config.allow_gguf_import) {
            Some(cache) => {
                let fp = ModelFingerprint::of_file(&config.model_path)?;
                match cache.get(&fp) {
                    Some(hit) => {
                        log::debug!("model cache hit for {}", fp.to_hex());
                        hit
                    }
                    None => {
                        let fresh = loader.load(&config.model_path, &ctx)?;
                        cache.insert(fp, fresh.clone());
                        fresh
                    }
                }
            }
            None => loader.load(&config.model_path, &ctx)?,
        };

        loaded
            .bundle
            .validate()
            .map_err(LoadError::InvariantBroken)?;
        check_tokenizer(&loaded.bundle, loaded.tokenizer.as_ref())?;

        if let Some(cap) = config.max_context_tokens {
            if loaded.bundle.hyperparameters.n_ctx > cap {
                return Err(EngineError::Load(LoadError::InvariantBroken(format!(
                    "loader kept a context of {} above the configured cap of {cap}",
                    loaded.bundle.hyperparameters.n_ctx
                ))));
            }
        }

        let budget = KvBudget {
            max_bytes_per_session: config.kv_max_bytes_per_session,
            max_bytes_total: config.kv_max_bytes_total,
            max_sessions: config.kv_max_sessions,
        };

        log::info!(
            "engine ready: {} layers, {} context tokens, {} weight bytes, {threads} workers",
            loaded.bundle.hyperparameters.n_layer,
            loaded.bundle.hyperparameters.n_ctx,
            loaded.bundle.weight_bytes(),
        );

        Ok(Engine {
            kv: Arc::new(KvStore::new(budget, Arc::clone(&telemetry))),
            pool: Arc::new(pool),
            tokenizer: loaded.tokenizer,
            model: loaded.bundle,
            telemetry,
            config,
            next_session: AtomicU64::new(1),
        })
    }

    /// What this engine supports, for host feature negotiation.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_streaming: true,
            supports_embeddings: true,
            max_model_tokens: self.model.hyperparameters.n_ctx,
            available_quantizations: self.model.schemes(),
        }
    }

    /// Create a session. Fails on invalid options; the KV entry itself is
    /// admitted lazily on first prefill.
    pub fn create_session(&self, options: SessionOptions) -> Result<Session, EngineError> {
        if let Some(sampler) = &options.sampler {
            sampler.validate().map_err(EngineError::InvalidOptions)?;
        }
        if options.n_batch == Some(0) {
            return Err(EngineError::InvalidOptions(
                "prefill batch size must be at least 1".into(),
            ));
        }

        let id = options
            .session_id
            .unwrap_or_else(|| SessionId(self.next_session.fetch_add(1, Ordering::Relaxed)));

        let mut session_config = SessionConfig::default();
        if let Some(sampler) = options.sampler {
            session_config.sampler = sampler;
        }
        if let Some(policy) = options.context_policy {
            session_config.context_policy = policy;
        }
        if let Some(n_batch) = options.n_batch {
            session_config.n_batch = n_batch;
        }
        session_config.request_timeout = self
            .config
            .request_timeout_ms
            .map(std::time::Duration::from_millis);

        Ok(Session::new(
            id,
            Arc::clone(&self.model),
            Arc::clone(&self.tokenizer),
            Arc::clone(&self.kv),
            Some(Arc::clone(&self.pool)),
            Arc::clone(&self.telemetry),
            session_config,
            self.config.enable_kv_cache,
        ))
    }

    /// Embed `text`: the final-norm hidden state of its last token.
    pub fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError> {
        let mut session = self.create_session(SessionOptions::default())?;
        Ok(session.embed(text)?)
    }

    /// The loaded model, shared read-only.
    pub fn model(&self) -> &Arc<ModelBundle> {
        &self.model
    }

    /// The tokenizer the loader supplied.
    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }

    /// The KV store, for host-side inspection.
    pub fn kv_store(&self) -> &Arc<KvStore> {
        &self.kv
    }

    /// Bytes one session's full KV entry occupies under this model.
    pub fn kv_entry_bytes(&self) -> usize {
        KvEntry::bytes_for(&self.model.hyperparameters)
    }
}

fn validate_config(config: &EngineConfig) -> Result<(), EngineError> {
    if config.thread_count == Some(0) {
        return Err(EngineError::InvalidOptions(
            "thread_count must be at least 1".into(),
        ));
    }
    if config.kv_max_sessions == 0 {
        return Err(EngineError::InvalidOptions(
            "kv_max_sessions must be at least 1".into(),
        ));
    }
    if config.kv_max_bytes_total < config.kv_max_bytes_per_session {
        return Err(EngineError::InvalidOptions(
            "kv_max_bytes_total cannot be below kv_max_bytes_per_session".into(),
        ));
    }
    Ok(())
}
