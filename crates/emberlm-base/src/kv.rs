//! The KV cache store: per-session key/value memory under byte budgets.
//!
//! Each live session owns one [`KvEntry`] holding, for every layer, key and
//! value tables of logical shape `[n_ctx, n_head_kv, head_dim]` plus the
//! filled length. The store tracks bytes per session and globally, keeps an
//! LRU order over sessions, and evicts cold sessions when admission would
//! break the global budget.
//!
//! Locking: one store mutex serializes admission, touch and eviction; each
//! entry carries its own mutex so concurrent requests for different
//! sessions run forward passes without contending on the store. An entry
//! whose mutex is held (an in-flight forward) is never evicted.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::model::Hyperparameters;
use crate::telemetry::{TelemetryEvent, TelemetrySink};

/// Identifies a session for the lifetime of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

#[derive(Error, Debug)]
pub enum KvError {
    /// Admission failed against the per-session or global budget.
    #[error("kv budget exceeded: {0}")]
    BudgetExceeded(String),
}

/// Key and value tables for one layer, row-major `[n_ctx, n_head_kv * head_dim]`.
#[derive(Clone, Debug)]
pub struct KvLayer {
    pub keys: Vec<f32>,
    pub values: Vec<f32>,
}

/// A session's cache: one [`KvLayer`] per transformer layer plus the number
/// of positions already filled.
#[derive(Debug)]
pub struct KvEntry {
    layers: Vec<KvLayer>,
    t_filled: usize,
    n_ctx: usize,
    kv_row: usize,
}

impl KvEntry {
    pub fn new(hp: &Hyperparameters) -> Self {
        let kv_row = hp.n_head_kv * hp.head_dim();
        let layers = (0..hp.n_layer)
            .map(|_| KvLayer {
                keys: vec![0.0; hp.n_ctx * kv_row],
                values: vec![0.0; hp.n_ctx * kv_row],
            })
            .collect();
        KvEntry { layers, t_filled: 0, n_ctx: hp.n_ctx, kv_row }
    }

    /// Bytes a full entry occupies for the given model shape.
    pub fn bytes_for(hp: &Hyperparameters) -> usize {
        hp.n_layer * 2 * hp.n_ctx * hp.n_head_kv * hp.head_dim() * std::mem::size_of::<f32>()
    }

    pub fn t_filled(&self) -> usize {
        self.t_filled
    }

    pub fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    /// Elements per cached position (all KV heads concatenated).
    pub fn kv_row(&self) -> usize {
        self.kv_row
    }

    pub fn layer(&self, il: usize) -> &KvLayer {
        &self.layers[il]
    }

    /// Write the key/value rows for `pos` in layer `il`. Positions at or
    /// beyond `t_filled` are staging writes, invisible until committed.
    pub fn write_position(&mut self, il: usize, pos: usize, key: &[f32], value: &[f32]) {
        debug_assert!(pos < self.n_ctx);
        debug_assert_eq!(key.len(), self.kv_row);
        debug_assert_eq!(value.len(), self.kv_row);
        let off = pos * self.kv_row;
        let layer = &mut self.layers[il];
        layer.keys[off..off + self.kv_row].copy_from_slice(key);
        layer.values[off..off + self.kv_row].copy_from_slice(value);
    }

    /// Commit `n` staged positions. Called once per fully successful
    /// forward pass; a failed or cancelled pass leaves `t_filled` alone and
    /// its staged writes are overwritten by the next attempt.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.t_filled + n <= self.n_ctx);
        self.t_filled += n;
    }

    /// Forget all cached positions, keeping the allocation.
    pub fn reset(&mut self) {
        self.t_filled = 0;
    }

    /// Raw table access for snapshots.
    pub fn layers(&self) -> &[KvLayer] {
        &self.layers
    }

    pub fn restore(&mut self, layers: Vec<KvLayer>, t_filled: usize) -> Result<(), String> {
        if layers.len() != self.layers.len() {
            return Err("snapshot layer count mismatch".into());
        }
        for (have, want) in layers.iter().zip(&self.layers) {
            if have.keys.len() != want.keys.len() || have.values.len() != want.values.len() {
                return Err("snapshot table size mismatch".into());
            }
        }
        if t_filled > self.n_ctx {
            return Err("snapshot fill exceeds context".into());
        }
        self.layers = layers;
        self.t_filled = t_filled;
        Ok(())
    }
}

/// Budgets applied at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct KvBudget {
    pub max_bytes_per_session: usize,
    pub max_bytes_total: usize,
    pub max_sessions: usize,
}

impl Default for KvBudget {
    fn default() -> Self {
        KvBudget {
            max_bytes_per_session: 256 << 20,
            max_bytes_total: 2 << 30,
            max_sessions: 64,
        }
    }
}

struct Slot {
    entry: Arc<Mutex<KvEntry>>,
    bytes: usize,
}

struct StoreInner {
    slots: HashMap<SessionId, Slot>,
    /// Session ids ordered cold to hot.
    lru: Vec<SessionId>,
    global_bytes: usize,
}

/// The engine-wide store of session KV entries.
pub struct KvStore {
    inner: Mutex<StoreInner>,
    budget: KvBudget,
    telemetry: Arc<dyn TelemetrySink>,
}

impl KvStore {
    pub fn new(budget: KvBudget, telemetry: Arc<dyn TelemetrySink>) -> Self {
        KvStore {
            inner: Mutex::new(StoreInner {
                slots: HashMap::new(),
                lru: Vec::new(),
                global_bytes: 0,
            }),
            budget,
            telemetry,
        }
    }

    /// Fetch the session's entry, creating it on first use.
    ///
    /// Admission order: the per-session budget is checked first (a single
    /// entry that cannot ever fit fails immediately), then cold sessions
    /// are evicted until the global budget and session count allow the new
    /// entry. The requesting session itself is never a victim, nor is any
    /// entry whose lock is held by an in-flight forward pass.
    pub fn get_or_create(
        &self,
        session: SessionId,
        hp: &Hyperparameters,
    ) -> Result<Arc<Mutex<KvEntry>>, KvError> {
        let bytes = KvEntry::bytes_for(hp);
        let mut inner = self.inner.lock().unwrap();

        if let Some(slot) = inner.slots.get(&session) {
            let entry = Arc::clone(&slot.entry);
            Self::mark_used(&mut inner.lru, session);
            return Ok(entry);
        }

        if bytes > self.budget.max_bytes_per_session {
            return Err(KvError::BudgetExceeded(format!(
                "entry of {bytes} bytes exceeds per-session budget {}",
                self.budget.max_bytes_per_session
            )));
        }

        let mut evicted = Vec::new();
        while inner.global_bytes + bytes > self.budget.max_bytes_total
            || inner.slots.len() + 1 > self.budget.max_sessions
        {
            match self.pick_victim(&inner, session) {
                Some(victim) => {
                    let slot = inner.slots.remove(&victim).expect("victim must be live");
                    inner.lru.retain(|&id| id != victim);
                    inner.global_bytes -= slot.bytes;
                    evicted.push((victim, slot.bytes));
                }
                None => {
                    // Roll nothing back: evictions already made are real.
                    for (victim, freed) in &evicted {
                        self.telemetry.emit(TelemetryEvent::KvEvicted {
                            session: *victim,
                            bytes: *freed,
                        });
                    }
                    return Err(KvError::BudgetExceeded(format!(
                        "cannot admit {bytes} bytes: {} live bytes of {} budget and no evictable session",
                        inner.global_bytes, self.budget.max_bytes_total
                    )));
                }
            }
        }

        let entry = Arc::new(Mutex::new(KvEntry::new(hp)));
        inner.slots.insert(
            session,
            Slot { entry: Arc::clone(&entry), bytes },
        );
        inner.lru.push(session);
        inner.global_bytes += bytes;
        drop(inner);

        for (victim, freed) in evicted {
            self.telemetry.emit(TelemetryEvent::KvEvicted { session: victim, bytes: freed });
        }
        self.telemetry.emit(TelemetryEvent::KvAdmitted { session, bytes });
        Ok(entry)
    }

    fn pick_victim(&self, inner: &StoreInner, caller: SessionId) -> Option<SessionId> {
        for &candidate in &inner.lru {
            if candidate == caller {
                continue;
            }
            let slot = &inner.slots[&candidate];
            // A held lock or a second Arc holder means an in-flight
            // forward pass; skip such entries.
            if Arc::strong_count(&slot.entry) == 1 && slot.entry.try_lock().is_ok() {
                return Some(candidate);
            }
        }
        None
    }

    /// Move the session to the hot end of the LRU order. Called after
    /// every successful forward pass.
    pub fn touch(&self, session: SessionId) {
        let mut inner = self.inner.lock().unwrap();
        Self::mark_used(&mut inner.lru, session);
    }

    fn mark_used(lru: &mut Vec<SessionId>, session: SessionId) {
        if let Some(idx) = lru.iter().position(|&id| id == session) {
            lru.remove(idx);
            lru.push(session);
        }
    }

    /// Drop a session's entry and return its bytes to the budget.
    pub fn release(&self, session: SessionId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.slots.remove(&session) {
            inner.lru.retain(|&id| id != session);
            inner.global_bytes -= slot.bytes;
            let bytes = slot.bytes;
            drop(inner);
            self.telemetry.emit(TelemetryEvent::KvReleased { session, bytes });
        }
    }

    pub fn contains(&self, session: SessionId) -> bool {
        self.inner.lock().unwrap().slots.contains_key(&session)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn global_bytes(&self) -> usize {
        self.inner.lock().unwrap().global_bytes
    }

    pub fn budget(&self) -> KvBudget {
        self.budget
    }

    /// Check the structural invariants: byte counters sum, LRU membership
    /// matches the live set, budget respected. Cheap; tests call this after
    /// every mutation.
    pub fn check_invariants(&self) -> Result<(), String> {
        let inner = self.inner.lock().unwrap();
        let sum: usize = inner.slots.values().map(|s| s.bytes).sum();
        if sum != inner.global_bytes {
            return Err(format!(
                "per-session bytes sum {sum} != global counter {}",
                inner.global_bytes
            ));
        }
        if inner.global_bytes > self.budget.max_bytes_total {
            return Err("global bytes exceed budget".into());
        }
        if inner.lru.len() != inner.slots.len() {
            return Err("LRU order and live set diverge in size".into());
        }
        for id in &inner.lru {
            if !inner.slots.contains_key(id) {
                return Err(format!("LRU contains dead session {id}"));
            }
        }
        if inner.slots.len() > self.budget.max_sessions {
            return Err("live sessions exceed budget".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::VecSink;

    fn tiny_hp() -> Hyperparameters {
        Hyperparameters {
            n_vocab: 16,
            n_ctx: 8,
            n_embd: 8,
            n_head: 2,
            n_head_kv: 2,
            n_mlp: 16,
            n_layer: 2,
            rope_base: 10000.0,
            bos_token_id: None,
            eos_token_id: 3,
        }
    }

    fn store_for(n_entries: usize, max_sessions: usize) -> (KvStore, Arc<VecSink>) {
        let hp = tiny_hp();
        let sink = Arc::new(VecSink::new());
        let budget = KvBudget {
            max_bytes_per_session: KvEntry::bytes_for(&hp),
            max_bytes_total: KvEntry::bytes_for(&hp) * n_entries,
            max_sessions,
        };
        (KvStore::new(budget, sink.clone()), sink)
    }

    #[test]
    fn entry_bytes_formula() {
        let hp = tiny_hp();
        // L * 2 * n_ctx * n_head_kv * head_dim * 4
        assert_eq!(KvEntry::bytes_for(&hp), 2 * 2 * 8 * 2 * 4 * 4);
    }

    #[test]
    fn commit_is_the_visibility_boundary() {
        let hp = tiny_hp();
        let mut entry = KvEntry::new(&hp);
        let row = vec![1.0; entry.kv_row()];
        entry.write_position(0, 0, &row, &row);
        assert_eq!(entry.t_filled(), 0);
        entry.commit(1);
        assert_eq!(entry.t_filled(), 1);
        entry.reset();
        assert_eq!(entry.t_filled(), 0);
    }

    #[test]
    fn admission_and_reuse() {
        let (store, _) = store_for(2, 4);
        let hp = tiny_hp();
        let a = store.get_or_create(SessionId(1), &hp).unwrap();
        let a2 = store.get_or_create(SessionId(1), &hp).unwrap();
        assert!(Arc::ptr_eq(&a, &a2));
        assert_eq!(store.len(), 1);
        store.check_invariants().unwrap();
    }

    #[test]
    fn lru_eviction_drops_coldest() {
        let (store, sink) = store_for(2, 3);
        let hp = tiny_hp();
        let a = store.get_or_create(SessionId(1), &hp).unwrap();
        let b = store.get_or_create(SessionId(2), &hp).unwrap();
        drop(a);
        drop(b);
        store.check_invariants().unwrap();

        // Admitting a third evicts session 1, the coldest.
        let _c = store.get_or_create(SessionId(3), &hp).unwrap();
        store.check_invariants().unwrap();
        assert!(!store.contains(SessionId(1)));
        assert!(store.contains(SessionId(2)));
        assert!(store.contains(SessionId(3)));

        let evictions: Vec<_> = sink
            .events()
            .into_iter()
            .filter(|e| matches!(e, TelemetryEvent::KvEvicted { .. }))
            .collect();
        assert_eq!(
            evictions,
            vec![TelemetryEvent::KvEvicted {
                session: SessionId(1),
                bytes: KvEntry::bytes_for(&hp),
            }]
        );
    }

    #[test]
    fn touch_reorders_lru() {
        let (store, _) = store_for(2, 3);
        let hp = tiny_hp();
        let a = store.get_or_create(SessionId(1), &hp).unwrap();
        let b = store.get_or_create(SessionId(2), &hp).unwrap();
        drop(a);
        drop(b);
        // Warm session 1; session 2 becomes the eviction victim.
        store.touch(SessionId(1));
        let _c = store.get_or_create(SessionId(3), &hp).unwrap();
        assert!(store.contains(SessionId(1)));
        assert!(!store.contains(SessionId(2)));
        store.check_invariants().unwrap();
    }

    #[test]
    fn in_flight_entries_are_not_victims() {
        let (store, _) = store_for(1, 2);
        let hp = tiny_hp();
        let a = store.get_or_create(SessionId(1), &hp).unwrap();
        let _guard = a.lock().unwrap();
        // Session 1 is mid-forward (lock held, Arc cloned); admission for
        // session 2 must fail rather than evict it.
        let err = store.get_or_create(SessionId(2), &hp).unwrap_err();
        assert!(matches!(err, KvError::BudgetExceeded(_)));
        assert!(store.contains(SessionId(1)));
        store.check_invariants().unwrap();
    }

    #[test]
    fn per_session_budget_precedes_eviction() {
        let hp = tiny_hp();
        let sink = Arc::new(VecSink::new());
        let budget = KvBudget {
            max_bytes_per_session: KvEntry::bytes_for(&hp) - 1,
            max_bytes_total: usize::MAX,
            max_sessions: 8,
        };
        let store = KvStore::new(budget, sink);
        let err = store.get_or_create(SessionId(1), &hp).unwrap_err();
        assert!(matches!(err, KvError::BudgetExceeded(_)));
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn release_returns_bytes() {
        let (store, _) = store_for(2, 4);
        let hp = tiny_hp();
        let a = store.get_or_create(SessionId(1), &hp).unwrap();
        drop(a);
        assert!(store.global_bytes() > 0);
        store.release(SessionId(1));
        assert_eq!(store.global_bytes(), 0);
        assert!(store.is_empty());
        store.check_invariants().unwrap();
    }

    #[test]
    fn max_sessions_forces_eviction() {
        let (store, _) = store_for(10, 2);
        let hp = tiny_hp();
        drop(store.get_or_create(SessionId(1), &hp).unwrap());
        drop(store.get_or_create(SessionId(2), &hp).unwrap());
        drop(store.get_or_create(SessionId(3), &hp).unwrap());
        assert_eq!(store.len(), 2);
        assert!(!store.contains(SessionId(1)));
        store.check_invariants().unwrap();
    }
}
