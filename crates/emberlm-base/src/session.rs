//! The per-request session runtime.
//!
//! A session owns the text-generation state for one conversation: the fed
//! token history, the last logits row, and the handle to its KV entry in
//! the shared store. It drives prefill and the decode loop, samples through
//! the configured pipeline, watches for stop sequences on the decoded byte
//! stream, and reports usage and timings.
//!
//! # Safety
//! A session can be sent to another thread but not shared between threads;
//! spawn one session per logical thread, or serialize access. Streaming
//! consumes the session and hands it back when the stream finishes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_bytes::ByteBuf;

use crate::error::{ErrorKind, FinishReason, InferenceError};
use crate::kv::{KvEntry, KvStore, SessionId};
use crate::model::{ModelBundle, TokenId};
use crate::sampler::{self, SamplerParams, SamplerState};
use crate::telemetry::{TelemetryEvent, TelemetrySink};
use crate::tokenizer::{TokenBuffer, Tokenizer};
use crate::transformer::{evaluate, OutputRequest};

/// Longest permitted stop sequence, in bytes.
pub const MAX_STOP_LEN: usize = 64;

/// Default prefill batch size.
pub const DEFAULT_BATCH: usize = 8;

/// Where a session is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No tokens fed yet.
    Fresh,
    /// The prompt has been fed; no token sampled yet.
    Prefilled,
    /// At least one token has been sampled.
    Decoding,
    /// The last request reached a terminal condition.
    Terminated,
}

/// A chat role, used by the context policy to pin system messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// The prompt of a generation request.
#[derive(Debug, Clone)]
pub enum Prompt {
    Text(String),
    /// Pre-encoded tokens; the tokenizer is bypassed on the way in.
    Tokens(Vec<TokenId>),
    /// Structured messages, giving [`ContextPolicy::KeepLastNTurns`] its
    /// turn boundaries.
    Messages(Vec<ChatMessage>),
}

impl From<&str> for Prompt {
    fn from(s: &str) -> Self {
        Prompt::Text(s.to_owned())
    }
}

/// What to do when the prompt plus requested output exceeds the context
/// window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextPolicy {
    /// Keep system messages and at most the last `n` other messages, then
    /// keep dropping the oldest non-system message until the budget fits.
    /// The final message is never dropped; failure is `ContextOverflow`.
    KeepLastNTurns(usize),
    /// Drop oldest tokens until the prompt fits the remaining budget.
    SlidingWindow,
}

/// Per-session configuration, fixed at creation.
#[derive(Clone)]
pub struct SessionConfig {
    pub sampler: SamplerParams,
    pub context_policy: ContextPolicy,
    /// Prefill batch size.
    pub n_batch: usize,
    /// Wall-clock deadline for a single request.
    pub request_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            sampler: SamplerParams::default(),
            context_policy: ContextPolicy::SlidingWindow,
            n_batch: DEFAULT_BATCH,
            request_timeout: None,
        }
    }
}

/// One generation request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: Prompt,
    pub max_new_tokens: usize,
    pub stop_sequences: Vec<String>,
    /// Seed for the sampler PRNG; a random seed is drawn when absent.
    pub seed: Option<u64>,
    /// Overrides the session's sampler parameters for this request.
    pub sampler: Option<SamplerParams>,
}

impl GenerationRequest {
    pub fn text(prompt: impl Into<String>, max_new_tokens: usize) -> Self {
        GenerationRequest {
            prompt: Prompt::Text(prompt.into()),
            max_new_tokens,
            stop_sequences: Vec::new(),
            seed: None,
            sampler: None,
        }
    }
}

/// Token counts for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

/// Wall-clock measurements for one request.
#[derive(Debug, Clone, Copy, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct Timings {
    /// Request entry to the first streamed token.
    pub ttft_ms: Option<u64>,
    pub total_ms: u64,
    pub tokens_per_second: f64,
}

/// A streamed generation event. Strictly ordered; exactly one terminal
/// `Completed` or `Error` per request.
#[derive(Debug, Clone)]
pub enum TokenEvent {
    Token {
        id: TokenId,
        /// Decoded bytes released by this token. May be empty while the
        /// UTF-8 buffer or stop matcher holds bytes back, and may lag the
        /// token that produced them.
        bytes: Vec<u8>,
    },
    Completed {
        reason: FinishReason,
        usage: Usage,
        timings: Timings,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

/// The aggregate result of a request.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub text: String,
    pub finish_reason: FinishReason,
    pub usage: Usage,
    pub timings: Timings,
}

/// Cooperative cancellation flag, checked before every sampled token and
/// between prefill layers.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Detects stop sequences on the decoded byte stream.
///
/// Bytes are released only once they can no longer begin a stop match, so
/// emitted text never contains a stop sequence, and the match point is
/// exactly where the stream truncates.
pub struct StopMatcher {
    stops: Vec<Vec<u8>>,
    hold: usize,
    pending: Vec<u8>,
}

/// Result of feeding bytes to a [`StopMatcher`].
pub struct StopScan {
    /// Bytes now safe to emit.
    pub released: Vec<u8>,
    /// Whether a stop sequence was found; the stream must terminate.
    pub matched: bool,
}

impl StopMatcher {
    pub fn new(stops: &[String]) -> Self {
        let stops: Vec<Vec<u8>> = stops.iter().map(|s| s.as_bytes().to_vec()).collect();
        let hold = stops.iter().map(|s| s.len()).max().unwrap_or(0).saturating_sub(1);
        StopMatcher { stops, hold, pending: Vec::new() }
    }

    pub fn push(&mut self, bytes: &[u8]) -> StopScan {
        if self.stops.is_empty() {
            return StopScan { released: bytes.to_vec(), matched: false };
        }
        self.pending.extend_from_slice(bytes);

        // Earliest match across all stop strings wins.
        let mut hit: Option<usize> = None;
        for stop in &self.stops {
            if let Some(at) = find(&self.pending, stop) {
                hit = Some(hit.map_or(at, |prev| prev.min(at)));
            }
        }
        if let Some(at) = hit {
            let released = self.pending[..at].to_vec();
            self.pending.clear();
            return StopScan { released, matched: true };
        }

        // No complete stop inside pending; everything beyond the longest
        // possible partial match is safe.
        let safe = self.pending.len().saturating_sub(self.hold);
        let released = self.pending.drain(..safe).collect();
        StopScan { released, matched: false }
    }

    /// Release held bytes at end of stream. After an unmatched scan the
    /// pending tail cannot contain a complete stop sequence.
    pub fn flush(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// A text-generation session bound to one model and one KV slot.
pub struct Session {
    id: SessionId,
    model: Arc<ModelBundle>,
    tokenizer: Arc<dyn Tokenizer>,
    kv: Arc<KvStore>,
    pool: Option<Arc<rayon::ThreadPool>>,
    telemetry: Arc<dyn TelemetrySink>,
    config: SessionConfig,
    enable_kv_cache: bool,

    state: SessionState,
    /// Every token successfully evaluated into the context, prompt and
    /// generated alike. Re-fed wholesale if the KV entry was evicted.
    tokens: Vec<TokenId>,
    last_logits: Vec<f32>,
    logits_scratch: Vec<f32>,
    /// Private context memory when the KV cache is disabled.
    local_entry: Option<Box<KvEntry>>,
    cancel: CancellationToken,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: SessionId,
        model: Arc<ModelBundle>,
        tokenizer: Arc<dyn Tokenizer>,
        kv: Arc<KvStore>,
        pool: Option<Arc<rayon::ThreadPool>>,
        telemetry: Arc<dyn TelemetrySink>,
        config: SessionConfig,
        enable_kv_cache: bool,
    ) -> Self {
        let n_vocab = model.hyperparameters.n_vocab;
        Session {
            id,
            model,
            tokenizer,
            kv,
            pool,
            telemetry,
            config,
            enable_kv_cache,
            state: SessionState::Fresh,
            tokens: Vec::new(),
            last_logits: vec![0.0; n_vocab],
            logits_scratch: vec![0.0; n_vocab],
            local_entry: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Tokens evaluated into the context so far.
    pub fn context_len(&self) -> usize {
        self.tokens.len()
    }

    /// A handle that cancels the in-flight or next request.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run a request to completion, collecting the generated text.
    pub fn generate(&mut self, request: &GenerationRequest) -> Result<GenerationResult, InferenceError> {
        self.run_request(request, &mut |_| true)
    }

    /// Run a request, forwarding every event to `callback`, for hosts
    /// that want tokens without a channel. Returning `false` stops the
    /// generation as if cancelled.
    pub fn generate_with(
        &mut self,
        request: &GenerationRequest,
        callback: impl FnMut(TokenEvent) -> bool,
    ) -> Result<GenerationResult, InferenceError> {
        let mut callback = callback;
        self.run_request(request, &mut callback)
    }

    /// Run a request on a worker thread, streaming events through a
    /// bounded channel. The stream yields the session back when finished.
    pub fn stream(mut self, request: GenerationRequest) -> TokenStream {
        let (tx, rx) = flume::bounded(32);
        let cancel = self.cancel.clone();
        let handle = std::thread::spawn(move || {
            let _ = self.run_request(&request, &mut |event| tx.send(event).is_ok());
            self
        });
        TokenStream { rx, cancel, handle: Some(handle) }
    }

    /// Drop this session's KV entry, freeing its budget immediately.
    pub fn release_cache(&mut self) {
        self.kv.release(self.id);
        self.tokens.clear();
        self.local_entry = None;
        self.state = SessionState::Fresh;
    }

    fn run_request(
        &mut self,
        request: &GenerationRequest,
        emit: &mut dyn FnMut(TokenEvent) -> bool,
    ) -> Result<GenerationResult, InferenceError> {
        let started = Instant::now();
        let outcome = self.run_request_inner(request, emit, started);
        match outcome {
            Ok(result) => {
                emit(TokenEvent::Completed {
                    reason: result.finish_reason,
                    usage: result.usage,
                    timings: result.timings,
                });
                self.state = SessionState::Terminated;
                self.telemetry.emit(TelemetryEvent::GenerationFinished {
                    session: self.id,
                    reason: result.finish_reason,
                    prompt_tokens: result.usage.prompt_tokens,
                    completion_tokens: result.usage.completion_tokens,
                    total_ms: result.timings.total_ms,
                });
                Ok(result)
            }
            Err(err) => {
                emit(TokenEvent::Error {
                    kind: err.kind(),
                    message: err.to_string(),
                });
                self.state = SessionState::Terminated;
                Err(err)
            }
        }
    }

    fn run_request_inner(
        &mut self,
        request: &GenerationRequest,
        emit: &mut dyn FnMut(TokenEvent) -> bool,
        started: Instant,
    ) -> Result<GenerationResult, InferenceError> {
        let params = request.sampler.unwrap_or(self.config.sampler);
        validate_request(request, &params)?;
        self.cancel.reset();

        let deadline = self.config.request_timeout.map(|t| started + t);
        let prompt_tokens = self.resolve_prompt(request)?;

        let n_ctx = self.model.hyperparameters.n_ctx;
        let n_vocab = self.model.hyperparameters.n_vocab;
        let eos = self.model.hyperparameters.eos_token_id;

        // Prefill. Cancellation and deadline expiry here are terminal
        // events with usage intact, not thrown errors.
        self.state = SessionState::Fresh;
        match self.feed_prompt(&prompt_tokens, deadline) {
            Ok(()) => {}
            Err(e @ (InferenceError::RequestCancelled | InferenceError::Timeout)) => {
                let reason = match e {
                    InferenceError::Timeout => FinishReason::Timeout,
                    _ => FinishReason::Cancelled,
                };
                return Ok(GenerationResult {
                    text: String::new(),
                    finish_reason: reason,
                    usage: Usage { prompt_tokens: prompt_tokens.len(), completion_tokens: 0 },
                    timings: Timings {
                        ttft_ms: None,
                        total_ms: started.elapsed().as_millis() as u64,
                        tokens_per_second: 0.0,
                    },
                });
            }
            Err(e) => return Err(e),
        }
        self.state = SessionState::Prefilled;
        let prefill_done = Instant::now();

        let seed = request.seed.unwrap_or_else(rand::random);
        let mut sampler_state = SamplerState::new(seed, n_vocab, params.repetition_window);
        let mut stop = StopMatcher::new(&request.stop_sequences);
        let mut utf8 = TokenBuffer::new();
        let mut text: Vec<u8> = Vec::new();
        let mut usage = Usage { prompt_tokens: prompt_tokens.len(), completion_tokens: 0 };
        let mut ttft: Option<u64> = None;
        let mut reason = FinishReason::Length;
        let mut last_id: TokenId = eos;

        while usage.completion_tokens < request.max_new_tokens {
            if self.cancel.is_cancelled() {
                reason = FinishReason::Cancelled;
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                reason = FinishReason::Timeout;
                break;
            }
            if self.tokens.len() + 1 > n_ctx {
                // Out of context mid-generation; what was produced stands.
                break;
            }

            self.logits_scratch.copy_from_slice(&self.last_logits);
            let id = sampler::sample(&mut self.logits_scratch, &params, &mut sampler_state);
            sampler_state.push(id);

            if id == eos {
                reason = FinishReason::Completed;
                break;
            }

            self.forward(&[id], deadline)?;
            self.state = SessionState::Decoding;
            usage.completion_tokens += 1;
            last_id = id;

            let mut released = Vec::new();
            let mut matched = false;
            if let Some(piece) = utf8.push(self.tokenizer.token_bytes(id)) {
                let scan = stop.push(piece.as_bytes());
                released = scan.released;
                matched = scan.matched;
            }
            if ttft.is_none() {
                ttft = Some(started.elapsed().as_millis() as u64);
            }
            text.extend_from_slice(&released);
            if !emit(TokenEvent::Token { id, bytes: released }) {
                reason = FinishReason::Cancelled;
                break;
            }
            if matched {
                reason = FinishReason::StopSequence;
                break;
            }
        }

        // Release what the UTF-8 buffer and stop matcher still hold, except
        // after a stop match (truncation point) or cancellation.
        if matches!(reason, FinishReason::Length | FinishReason::Completed) {
            if let Some(tail) = utf8.flush() {
                let scan = stop.push(tail.as_bytes());
                text.extend_from_slice(&scan.released);
                if scan.matched {
                    reason = FinishReason::StopSequence;
                } else {
                    let rest = stop.flush();
                    text.extend_from_slice(&rest);
                    if !rest.is_empty() {
                        emit(TokenEvent::Token { id: last_id, bytes: rest });
                    }
                }
            } else {
                let rest = stop.flush();
                text.extend_from_slice(&rest);
                if !rest.is_empty() {
                    emit(TokenEvent::Token { id: last_id, bytes: rest });
                }
            }
        }

        let total_ms = started.elapsed().as_millis() as u64;
        let decode_secs = prefill_done.elapsed().as_secs_f64();
        let timings = Timings {
            ttft_ms: ttft,
            total_ms,
            tokens_per_second: if decode_secs > 0.0 {
                usage.completion_tokens as f64 / decode_secs
            } else {
                0.0
            },
        };

        Ok(GenerationResult {
            text: String::from_utf8_lossy(&text).into_owned(),
            finish_reason: reason,
            usage,
            timings,
        })
    }

    /// Feed prompt tokens in batches, committing the KV cache per batch.
    fn feed_prompt(
        &mut self,
        prompt: &[TokenId],
        deadline: Option<Instant>,
    ) -> Result<(), InferenceError> {
        for batch in prompt.chunks(self.config.n_batch.max(1)) {
            if self.cancel.is_cancelled() {
                return Err(InferenceError::RequestCancelled);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(InferenceError::Timeout);
            }
            self.forward(batch, deadline)?;
        }
        Ok(())
    }

    /// One forward pass over `new_tokens`, against the store entry or the
    /// private context when the KV cache is disabled. Appends to the fed
    /// history on success.
    fn forward(&mut self, new_tokens: &[TokenId], deadline: Option<Instant>) -> Result<(), InferenceError> {
        let model = Arc::clone(&self.model);
        let hp = &model.hyperparameters;
        let cancel = self.cancel.clone();
        let abort = move || {
            if cancel.is_cancelled() {
                Some(InferenceError::RequestCancelled)
            } else if deadline.is_some_and(|d| Instant::now() >= d) {
                Some(InferenceError::Timeout)
            } else {
                None
            }
        };

        if self.enable_kv_cache {
            let entry = self
                .kv
                .get_or_create(self.id, hp)
                .map_err(|e| InferenceError::BudgetExceeded(e.to_string()))?;
            {
                let mut guard = entry.lock().map_err(|_| {
                    InferenceError::InternalError("kv entry lock poisoned".into())
                })?;
                // An evicted-and-recreated entry starts empty; replay the
                // fed history before the new tokens.
                if guard.t_filled() != self.tokens.len() {
                    guard.reset();
                    if !self.tokens.is_empty() {
                        let history = self.tokens.clone();
                        self.evaluate_in_pool(&model, &mut guard, &history, &abort)?;
                    }
                }
                self.evaluate_in_pool(&model, &mut guard, new_tokens, &abort)?;
            }
            self.kv.touch(self.id);
        } else {
            // No cache: re-run the whole context every step.
            let mut entry = self
                .local_entry
                .take()
                .unwrap_or_else(|| Box::new(KvEntry::new(hp)));
            entry.reset();
            let mut all = self.tokens.clone();
            all.extend_from_slice(new_tokens);
            let result = self.evaluate_in_pool(&model, &mut entry, &all, &abort);
            self.local_entry = Some(entry);
            result?;
        }

        self.tokens.extend_from_slice(new_tokens);
        Ok(())
    }

    fn evaluate_in_pool(
        &mut self,
        model: &ModelBundle,
        entry: &mut KvEntry,
        tokens: &[TokenId],
        abort: &(dyn Fn() -> Option<InferenceError> + Send + Sync),
    ) -> Result<(), InferenceError> {
        let pool = self.pool.clone();
        let mut output = OutputRequest::default();
        let logits = self.last_logits.as_mut_slice();
        match pool {
            Some(pool) => pool.install(|| {
                evaluate(model, entry, tokens, logits, &mut output, abort)
            }),
            None => evaluate(model, entry, tokens, logits, &mut output, abort),
        }
    }

    /// Final-norm hidden state of the last context position; backs the
    /// engine's embedding surface.
    pub fn embed(&mut self, text: &str) -> Result<Vec<f32>, InferenceError> {
        let tokens = self
            .tokenizer
            .encode(text)
            .map_err(|e| InferenceError::TokenizationFailed(e.to_string()))?;
        if tokens.is_empty() {
            return Err(InferenceError::EmbeddingFailed("empty input".into()));
        }
        let hp = &self.model.hyperparameters;
        if tokens.len() > hp.n_ctx {
            return Err(InferenceError::ContextOverflow {
                needed: tokens.len(),
                available: hp.n_ctx,
            });
        }
        let model = Arc::clone(&self.model);
        let pool = self.pool.clone();
        // A throwaway context: embedding never disturbs the session's own
        // cache or logits.
        let mut entry = KvEntry::new(&model.hyperparameters);
        let mut logits = vec![0.0; model.hyperparameters.n_vocab];
        let mut output = OutputRequest {
            all_logits: None,
            embeddings: Some(Vec::new()),
        };
        let result = match pool {
            Some(pool) => pool.install(|| {
                evaluate(&model, &mut entry, &tokens, &mut logits, &mut output, || None)
            }),
            None => evaluate(&model, &mut entry, &tokens, &mut logits, &mut output, || None),
        };
        result.map_err(|e| InferenceError::EmbeddingFailed(e.to_string()))?;
        output
            .embeddings
            .ok_or_else(|| InferenceError::EmbeddingFailed("no embedding produced".into()))
    }

    fn resolve_prompt(&self, request: &GenerationRequest) -> Result<Vec<TokenId>, InferenceError> {
        let hp = &self.model.hyperparameters;
        let history = self.tokens.len();
        let bos_extra = usize::from(history == 0 && hp.bos_token_id.is_some());
        let budget = hp
            .n_ctx
            .checked_sub(request.max_new_tokens + history + bos_extra)
            .filter(|&b| b > 0)
            .ok_or(InferenceError::ContextOverflow {
                needed: request.max_new_tokens + history + 1,
                available: hp.n_ctx,
            })?;

        let mut tokens = match (&request.prompt, self.config.context_policy) {
            (Prompt::Tokens(ids), ContextPolicy::SlidingWindow) => {
                let mut ids = ids.clone();
                if ids.len() > budget {
                    ids.drain(..ids.len() - budget);
                }
                ids
            }
            (Prompt::Tokens(ids), ContextPolicy::KeepLastNTurns(_)) => {
                // A raw token prompt is a single turn; it cannot shrink.
                if ids.len() > budget {
                    return Err(InferenceError::ContextOverflow {
                        needed: ids.len() + request.max_new_tokens,
                        available: hp.n_ctx,
                    });
                }
                ids.clone()
            }
            (Prompt::Text(text), policy) => {
                let single = vec![ChatMessage { role: Role::User, content: text.clone() }];
                self.apply_policy(&single, policy, budget)?
            }
            (Prompt::Messages(messages), policy) => {
                self.apply_policy(messages, policy, budget)?
            }
        };

        if bos_extra == 1 {
            if let Some(bos) = hp.bos_token_id {
                tokens.insert(0, bos);
            }
        }
        if tokens.is_empty() {
            return Err(InferenceError::InvalidOptions("empty prompt".into()));
        }
        Ok(tokens)
    }

    /// Shrink the message list under the policy until the encoded prompt
    /// fits `budget` tokens. Deterministic: the same input always yields
    /// the same surviving prompt.
    fn apply_policy(
        &self,
        messages: &[ChatMessage],
        policy: ContextPolicy,
        budget: usize,
    ) -> Result<Vec<TokenId>, InferenceError> {
        let encode = |msgs: &[&ChatMessage]| -> Result<Vec<TokenId>, InferenceError> {
            let joined = msgs
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            self.tokenizer
                .encode(&joined)
                .map_err(|e| InferenceError::TokenizationFailed(e.to_string()))
        };

        match policy {
            ContextPolicy::SlidingWindow => {
                let all: Vec<&ChatMessage> = messages.iter().collect();
                let mut tokens = encode(&all)?;
                if tokens.len() > budget {
                    tokens.drain(..tokens.len() - budget);
                }
                Ok(tokens)
            }
            ContextPolicy::KeepLastNTurns(n) => {
                let mut kept: Vec<&ChatMessage> = Vec::new();
                let mut turns = 0;
                // Walk backwards keeping system messages and the last n
                // other turns.
                for msg in messages.iter().rev() {
                    if msg.role == Role::System {
                        kept.push(msg);
                    } else if turns < n {
                        kept.push(msg);
                        turns += 1;
                    }
                }
                kept.reverse();

                loop {
                    let tokens = encode(&kept)?;
                    if tokens.len() <= budget {
                        return Ok(tokens);
                    }
                    // Drop the oldest non-system message, never the last.
                    let victim = kept
                        .iter()
                        .enumerate()
                        .filter(|(_, m)| m.role != Role::System)
                        .map(|(i, _)| i)
                        .take(2)
                        .collect::<Vec<_>>();
                    match victim.as_slice() {
                        // Two or more droppable messages: drop the oldest.
                        [oldest, _second] => {
                            kept.remove(*oldest);
                        }
                        // Only pinned messages plus the final turn remain.
                        _ => {
                            return Err(InferenceError::ContextOverflow {
                                needed: tokens.len(),
                                available: budget,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Serializable snapshot of this session's context, including the raw
    /// KV tables. Fails when the entry was evicted.
    pub fn snapshot(&self) -> Result<SessionSnapshot, InferenceError> {
        let layers = if self.enable_kv_cache {
            let entry = self
                .kv
                .get_or_create(self.id, &self.model.hyperparameters)
                .map_err(|e| InferenceError::BudgetExceeded(e.to_string()))?;
            let guard = entry
                .lock()
                .map_err(|_| InferenceError::InternalError("kv entry lock poisoned".into()))?;
            if guard.t_filled() != self.tokens.len() {
                return Err(InferenceError::InternalError(
                    "kv entry no longer holds this session's context".into(),
                ));
            }
            snapshot_layers(&guard)
        } else {
            match &self.local_entry {
                Some(entry) => snapshot_layers(entry),
                None => Vec::new(),
            }
        };
        Ok(SessionSnapshot {
            tokens: self.tokens.clone(),
            last_logits: self.last_logits.clone(),
            t_filled: self.tokens.len(),
            layers,
        })
    }

    /// Restore a snapshot into this session, replacing its context.
    pub fn restore(&mut self, snapshot: &SessionSnapshot) -> Result<(), InferenceError> {
        let hp = &self.model.hyperparameters;
        if snapshot.last_logits.len() != hp.n_vocab {
            return Err(InferenceError::InvalidOptions(
                "snapshot logits do not match model vocabulary".into(),
            ));
        }
        let layers: Vec<crate::kv::KvLayer> = snapshot
            .layers
            .iter()
            .map(|l| crate::kv::KvLayer {
                keys: bytemuck::pod_collect_to_vec::<u8, f32>(l.keys.as_ref()),
                values: bytemuck::pod_collect_to_vec::<u8, f32>(l.values.as_ref()),
            })
            .collect();

        if self.enable_kv_cache {
            let entry = self
                .kv
                .get_or_create(self.id, hp)
                .map_err(|e| InferenceError::BudgetExceeded(e.to_string()))?;
            let mut guard = entry
                .lock()
                .map_err(|_| InferenceError::InternalError("kv entry lock poisoned".into()))?;
            guard
                .restore(layers, snapshot.t_filled)
                .map_err(InferenceError::InvalidOptions)?;
        } else {
            let mut entry = Box::new(KvEntry::new(hp));
            entry
                .restore(layers, snapshot.t_filled)
                .map_err(InferenceError::InvalidOptions)?;
            self.local_entry = Some(entry);
        }
        self.tokens = snapshot.tokens.clone();
        self.last_logits = snapshot.last_logits.clone();
        self.state = if self.tokens.is_empty() {
            SessionState::Fresh
        } else {
            SessionState::Prefilled
        };
        Ok(())
    }
}

fn snapshot_layers(entry: &KvEntry) -> Vec<KvLayerSnapshot> {
    entry
        .layers()
        .iter()
        .map(|l| KvLayerSnapshot {
            keys: ByteBuf::from(bytemuck::cast_slice::<f32, u8>(&l.keys).to_vec()),
            values: ByteBuf::from(bytemuck::cast_slice::<f32, u8>(&l.values).to_vec()),
        })
        .collect()
}

fn validate_request(request: &GenerationRequest, params: &SamplerParams) -> Result<(), InferenceError> {
    if request.max_new_tokens == 0 {
        return Err(InferenceError::InvalidOptions(
            "max_new_tokens must be at least 1".into(),
        ));
    }
    for stop in &request.stop_sequences {
        if stop.is_empty() {
            return Err(InferenceError::InvalidOptions("empty stop sequence".into()));
        }
        if stop.len() > MAX_STOP_LEN {
            return Err(InferenceError::InvalidOptions(format!(
                "stop sequence of {} bytes exceeds the {MAX_STOP_LEN}-byte limit",
                stop.len()
            )));
        }
    }
    params.validate().map_err(InferenceError::InvalidOptions)
}

/// One layer's KV tables as raw bytes. Binary-efficient serializers only;
/// textual formats will balloon.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
pub struct KvLayerSnapshot {
    pub keys: ByteBuf,
    pub values: ByteBuf,
}

/// A serializable snapshot of a session's generation state. Restore with
/// [`Session::restore`].
#[derive(Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionSnapshot {
    pub tokens: Vec<TokenId>,
    pub last_logits: Vec<f32>,
    pub t_filled: usize,
    pub layers: Vec<KvLayerSnapshot>,
}

/// The consuming half of [`Session::stream`]: a finite, ordered sequence
/// of [`TokenEvent`]s, single consumer, ending with exactly one terminal
/// event.
pub struct TokenStream {
    rx: flume::Receiver<TokenEvent>,
    cancel: CancellationToken,
    handle: Option<std::thread::JoinHandle<Session>>,
}

impl TokenStream {
    /// Block for the next event; `None` after the terminal event.
    pub fn recv(&self) -> Option<TokenEvent> {
        self.rx.recv().ok()
    }

    /// Request cooperative cancellation of the producing session.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the producer and take the session back for a follow-up
    /// request.
    pub fn into_session(mut self) -> Session {
        // Drain so the bounded producer can finish.
        while self.rx.recv().is_ok() {}
        self.handle
            .take()
            .expect("stream already joined")
            .join()
            .expect("session thread panicked")
    }
}

impl Iterator for TokenStream {
    type Item = TokenEvent;

    fn next(&mut self) -> Option<TokenEvent> {
        self.recv()
    }
}
