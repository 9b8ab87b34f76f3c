//! Telemetry events emitted by the runtime.
//!
//! The core only defines the interface; hosts plug in their own sink. The
//! default forwards everything to the `log` facade at debug level.

use crate::error::FinishReason;
use crate::kv::SessionId;

/// Events the core emits. Sinks must tolerate new variants.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    /// A KV entry was admitted for a session.
    KvAdmitted { session: SessionId, bytes: usize },
    /// A KV entry was evicted to make room; emitted before the evicting
    /// operation returns.
    KvEvicted { session: SessionId, bytes: usize },
    /// A KV entry was released by its owner.
    KvReleased { session: SessionId, bytes: usize },
    /// A generation request reached a terminal state.
    GenerationFinished {
        session: SessionId,
        reason: FinishReason,
        prompt_tokens: usize,
        completion_tokens: usize,
        total_ms: u64,
    },
}

/// A sink for runtime telemetry. Implementations must be cheap; events are
/// emitted from the hot loop.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

/// Forwards events to the `log` facade.
#[derive(Default)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn emit(&self, event: TelemetryEvent) {
        match &event {
            TelemetryEvent::KvEvicted { session, bytes } => {
                log::debug!("kv store evicted session {session} ({bytes} bytes)");
            }
            TelemetryEvent::KvAdmitted { session, bytes } => {
                log::trace!("kv store admitted session {session} ({bytes} bytes)");
            }
            TelemetryEvent::KvReleased { session, bytes } => {
                log::trace!("kv store released session {session} ({bytes} bytes)");
            }
            TelemetryEvent::GenerationFinished {
                session,
                reason,
                prompt_tokens,
                completion_tokens,
                total_ms,
            } => {
                log::debug!(
                    "session {session} finished ({reason:?}): {prompt_tokens} prompt + \
                     {completion_tokens} completion tokens in {total_ms}ms"
                );
            }
        }
    }
}

/// Collects events into a vector; test support.
#[derive(Default)]
pub struct VecSink {
    events: std::sync::Mutex<Vec<TelemetryEvent>>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl TelemetrySink for VecSink {
    fn emit(&self, event: TelemetryEvent) {
        self.events.lock().unwrap().push(event);
    }
}
