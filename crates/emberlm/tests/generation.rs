//! End-to-end generation scenarios against the synthetic model.

mod common;

use std::sync::Arc;

use common::SyntheticLoader;
use emberlm::telemetry::{TelemetryEvent, TelemetrySink};
use emberlm::{
    ContextPolicy, Engine, EngineConfig, FinishReason, GenerationRequest, InferenceError,
    SamplerParams, SessionId, SessionOptions, TokenEvent,
};

/// Collects telemetry events for assertions.
#[derive(Default)]
struct RecordingSink {
    events: std::sync::Mutex<Vec<TelemetryEvent>>,
}

impl RecordingSink {
    fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl TelemetrySink for RecordingSink {
    fn emit(&self, event: TelemetryEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn engine_with(config: EngineConfig, seed: u64) -> Engine {
    Engine::load(config, &SyntheticLoader::new(seed)).unwrap()
}

fn greedy(prompt: &str, max_new: usize, seed: u64) -> GenerationRequest {
    GenerationRequest {
        prompt: prompt.into(),
        max_new_tokens: max_new,
        stop_sequences: Vec::new(),
        seed: Some(seed),
        sampler: Some(SamplerParams {
            temperature: 0.001,
            top_k: 0,
            repetition_penalty: 1.0,
            ..Default::default()
        }),
    }
}

#[test]
fn greedy_generation_reruns_bit_identical() {
    // Same model, same prompt, same seed: token-for-token identical runs.
    let run = || {
        let engine = engine_with(EngineConfig::default(), 0x51);
        let mut session = engine.create_session(SessionOptions::default()).unwrap();
        session
            .generate(&greedy("The capital of France is", 4, 42))
            .unwrap()
    };
    let a = run();
    let b = run();
    assert_eq!(a.text, b.text);
    assert_eq!(a.usage, b.usage);
    assert_eq!(a.finish_reason, b.finish_reason);
}

#[test]
fn sampling_under_penalties_is_deterministic_without_runs() {
    let request = GenerationRequest {
        prompt: "Tell me a story.".into(),
        max_new_tokens: 48,
        stop_sequences: Vec::new(),
        seed: Some(42),
        sampler: Some(SamplerParams {
            temperature: 0.7,
            top_p: 0.9,
            repetition_penalty: 1.1,
            frequency_penalty: 0.6,
            repetition_window: 64,
            ..Default::default()
        }),
    };
    let run = || {
        let engine = engine_with(EngineConfig::default(), 0x52);
        let mut session = engine.create_session(SessionOptions::default()).unwrap();
        let mut ids = Vec::new();
        session
            .generate_with(&request, |event| {
                if let TokenEvent::Token { id, .. } = &event {
                    ids.push(*id);
                }
                true
            })
            .map(|result| (ids, result.text))
            .unwrap()
    };
    let (ids_a, text_a) = run();
    let (ids_b, text_b) = run();
    assert_eq!(ids_a, ids_b);
    assert_eq!(text_a, text_b);

    // The frequency penalty forbids long runs of one token.
    for window in ids_a.windows(10) {
        assert!(
            window.iter().any(|&t| t != window[0]),
            "10-token run of {} in {ids_a:?}",
            window[0]
        );
    }
}

#[test]
fn kv_eviction_under_global_budget() {
    // Room for two entries, three sessions: admitting the third evicts
    // the least recently used (session A).
    let sink = Arc::new(RecordingSink::default());
    let loader = SyntheticLoader::new(0x53);
    let probe = Engine::load(EngineConfig::default(), &loader).unwrap();
    let entry_bytes = probe.kv_entry_bytes();
    drop(probe);

    let config = EngineConfig {
        kv_max_bytes_per_session: entry_bytes,
        kv_max_bytes_total: entry_bytes * 2,
        kv_max_sessions: 3,
        ..Default::default()
    };
    let engine =
        Engine::load_with(config, &loader, None, sink.clone() as Arc<dyn TelemetrySink>).unwrap();

    let mut a = engine.create_session(SessionOptions::default()).unwrap();
    let mut b = engine.create_session(SessionOptions::default()).unwrap();
    let mut c = engine.create_session(SessionOptions::default()).unwrap();
    a.generate(&greedy("aaaa", 1, 1)).unwrap();
    b.generate(&greedy("bbbb", 1, 1)).unwrap();
    c.generate(&greedy("cccc", 1, 1)).unwrap();

    let store = engine.kv_store();
    store.check_invariants().unwrap();
    assert!(!store.contains(a.id()), "A must be evicted");
    assert!(store.contains(b.id()));
    assert!(store.contains(c.id()));

    let evictions: Vec<SessionId> = sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            TelemetryEvent::KvEvicted { session, .. } => Some(session),
            _ => None,
        })
        .collect();
    assert_eq!(evictions, vec![a.id()], "exactly one eviction, of session A");
}

#[test]
fn context_overflow_fails_fast_before_kv_mutation() {
    let engine = engine_with(EngineConfig::default(), 0x54);
    let mut session = engine
        .create_session(SessionOptions {
            context_policy: Some(ContextPolicy::KeepLastNTurns(1)),
            ..Default::default()
        })
        .unwrap();

    // A single-turn prompt far beyond the 64-token window cannot shrink.
    let long_prompt = "x".repeat(200);
    let err = session.generate(&greedy(&long_prompt, 8, 1)).unwrap_err();
    assert!(matches!(err, InferenceError::ContextOverflow { .. }));
    assert!(engine.kv_store().is_empty(), "no KV entry was created");
}

#[test]
fn sliding_window_policy_recovers_instead() {
    let engine = engine_with(EngineConfig::default(), 0x54);
    let mut session = engine
        .create_session(SessionOptions {
            context_policy: Some(ContextPolicy::SlidingWindow),
            ..Default::default()
        })
        .unwrap();
    let long_prompt = "x".repeat(200);
    let result = session.generate(&greedy(&long_prompt, 8, 1)).unwrap();
    assert!(result.usage.prompt_tokens <= 64);
}

#[test]
fn disabling_the_kv_cache_preserves_output() {
    let cached = {
        let engine = engine_with(EngineConfig::default(), 0x55);
        let mut session = engine.create_session(SessionOptions::default()).unwrap();
        session.generate(&greedy("same input", 6, 9)).unwrap().text
    };
    let uncached = {
        let engine = engine_with(
            EngineConfig { enable_kv_cache: false, ..Default::default() },
            0x55,
        );
        let mut session = engine.create_session(SessionOptions::default()).unwrap();
        session.generate(&greedy("same input", 6, 9)).unwrap().text
    };
    assert_eq!(cached, uncached);
}

#[test]
fn stream_carries_usage_and_timings_in_terminal() {
    let engine = engine_with(EngineConfig::default(), 0x56);
    let session = engine.create_session(SessionOptions::default()).unwrap();
    let stream = session.stream(greedy("stream", 5, 3));

    let mut tokens = 0usize;
    let mut terminal = None;
    for event in stream {
        match event {
            TokenEvent::Token { .. } => {
                assert!(terminal.is_none(), "token after terminal event");
                tokens += 1;
            }
            TokenEvent::Completed { reason, usage, timings } => {
                assert!(terminal.is_none(), "second terminal event");
                terminal = Some((reason, usage, timings));
            }
            TokenEvent::Error { message, .. } => panic!("unexpected error: {message}"),
        }
    }
    let (reason, usage, timings) = terminal.expect("stream must end with a terminal event");
    assert!(matches!(reason, FinishReason::Length | FinishReason::Completed));
    assert!(usage.prompt_tokens > 0);
    assert!(usage.completion_tokens <= 5);
    if tokens > 0 {
        assert!(timings.ttft_ms.is_some());
    }
    assert!(timings.tokens_per_second >= 0.0);
}

#[test]
fn follow_up_request_reuses_the_context() {
    let engine = engine_with(EngineConfig::default(), 0x57);
    let mut session = engine.create_session(SessionOptions::default()).unwrap();
    let first = session.generate(&greedy("one", 3, 5)).unwrap();
    let len_after_first = session.context_len();
    assert!(len_after_first >= first.usage.prompt_tokens);

    let second = session.generate(&greedy(" two", 3, 5)).unwrap();
    assert!(session.context_len() > len_after_first);
    // The follow-up prompt does not re-count the first request's tokens.
    assert!(second.usage.prompt_tokens < session.context_len());
}
