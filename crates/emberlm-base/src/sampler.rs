//! Logit sampling: penalties, filtering, and the seeded multinomial draw.
//!
//! The pipeline applies, in this fixed order: repetition / presence /
//! frequency penalties over the recent-token window, temperature, top-k,
//! top-p, min-p, then softmax and a draw from the session PRNG. For a fixed
//! seed, model and prompt the emitted sequence is bit-identical across
//! runs on the same build.

use partial_sort::PartialSort;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::model::TokenId;

/// Temperatures at or below this behave as greedy argmax.
pub const GREEDY_TEMPERATURE: f32 = 1e-3;

/// Sampling policy for a request.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SamplerParams {
    /// Softmax temperature, `[0, 2]`. At or below [`GREEDY_TEMPERATURE`]
    /// the argmax is taken and the filtering steps are skipped.
    pub temperature: f32,
    /// Keep only the k most likely candidates; `0` disables.
    pub top_k: usize,
    /// Nucleus mass, `(0, 1]`; `1.0` disables.
    pub top_p: f32,
    /// Drop candidates below `min_p * p_max`; `0.0` disables.
    pub min_p: f32,
    /// Multiplicative repetition penalty from the CTRL paper; `1.0`
    /// disables.
    pub repetition_penalty: f32,
    /// Flat penalty subtracted from any recently seen token; `0.0`
    /// disables.
    pub presence_penalty: f32,
    /// Penalty subtracted per occurrence in the window; `0.0` disables.
    pub frequency_penalty: f32,
    /// How many recent tokens the penalties look back over.
    pub repetition_window: usize,
}

impl Default for SamplerParams {
    fn default() -> Self {
        SamplerParams {
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.0,
            repetition_penalty: 1.1,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            repetition_window: 64,
        }
    }
}

impl SamplerParams {
    /// Validate the documented ranges. Called before any inference work.
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=2.0).contains(&self.temperature) || self.temperature.is_nan() {
            return Err(format!("temperature {} outside [0, 2]", self.temperature));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(format!("top_p {} outside (0, 1]", self.top_p));
        }
        if !(0.0..=1.0).contains(&self.min_p) {
            return Err(format!("min_p {} outside [0, 1]", self.min_p));
        }
        if self.repetition_penalty < 1.0 || self.repetition_penalty.is_nan() {
            return Err(format!("repetition_penalty {} below 1.0", self.repetition_penalty));
        }
        if self.presence_penalty < 0.0 || self.frequency_penalty < 0.0 {
            return Err("presence and frequency penalties must be non-negative".into());
        }
        Ok(())
    }
}

/// Per-session sampling state: the seeded PRNG, the window of recent
/// tokens, and per-token occurrence counts within that window.
pub struct SamplerState {
    rng: StdRng,
    recent: std::collections::VecDeque<TokenId>,
    counts: Vec<u32>,
    window: usize,
}

impl SamplerState {
    pub fn new(seed: u64, vocab_size: usize, window: usize) -> Self {
        SamplerState {
            rng: StdRng::seed_from_u64(seed),
            recent: std::collections::VecDeque::with_capacity(window),
            counts: vec![0; vocab_size],
            window,
        }
    }

    /// Record an accepted token; the oldest falls out of the window.
    pub fn push(&mut self, token: TokenId) {
        if self.window == 0 {
            return;
        }
        if self.recent.len() == self.window {
            if let Some(old) = self.recent.pop_front() {
                self.counts[old as usize] = self.counts[old as usize].saturating_sub(1);
            }
        }
        self.recent.push_back(token);
        self.counts[token as usize] += 1;
    }

    pub fn recent(&self) -> impl Iterator<Item = TokenId> + '_ {
        self.recent.iter().copied()
    }

    fn count(&self, token: TokenId) -> u32 {
        self.counts[token as usize]
    }
}

/// Apply the pipeline to a logits row and draw the next token.
///
/// `logits` is mutated in place by the penalty and temperature steps; the
/// filtering steps operate on a candidate list so disabled steps cost
/// nothing.
pub fn sample(logits: &mut [f32], params: &SamplerParams, state: &mut SamplerState) -> TokenId {
    apply_penalties(logits, params, state);

    if params.temperature <= GREEDY_TEMPERATURE {
        return argmax(logits);
    }

    let scale = 1.0 / params.temperature;
    for l in logits.iter_mut() {
        *l *= scale;
    }

    // Candidate list sorted hottest first; ties resolve to the lowest id
    // so boundary draws are reproducible.
    let mut candidates: Vec<(f32, TokenId)> = logits
        .iter()
        .copied()
        .enumerate()
        .map(|(i, l)| (l, i as TokenId))
        .collect();

    if params.top_k > 0 && params.top_k < candidates.len() {
        candidates.partial_sort(params.top_k, |a, b| {
            b.0.total_cmp(&a.0).then(a.1.cmp(&b.1))
        });
        candidates.truncate(params.top_k);
    } else {
        candidates.sort_unstable_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
    }

    // Softmax over the surviving candidates.
    let max = candidates[0].0;
    let mut probs: Vec<f32> = candidates.iter().map(|&(l, _)| (l - max).exp()).collect();
    let sum: f32 = probs.iter().sum();
    for p in probs.iter_mut() {
        *p /= sum;
    }

    if params.top_p < 1.0 {
        let mut cumsum = 0.0;
        for i in 0..probs.len() {
            cumsum += probs[i];
            if cumsum >= params.top_p {
                probs.truncate(i + 1);
                candidates.truncate(i + 1);
                break;
            }
        }
        let renorm = 1.0 / probs.iter().sum::<f32>();
        for p in probs.iter_mut() {
            *p *= renorm;
        }
    }

    if params.min_p > 0.0 {
        let p_max = probs[0];
        let cutoff = params.min_p * p_max;
        let keep = probs.iter().take_while(|&&p| p >= cutoff).count().max(1);
        probs.truncate(keep);
        candidates.truncate(keep);
        let renorm = 1.0 / probs.iter().sum::<f32>();
        for p in probs.iter_mut() {
            *p *= renorm;
        }
    }

    let dist = WeightedIndex::new(&probs).expect("candidate probabilities must be positive");
    let idx = dist.sample(&mut state.rng);
    candidates[idx].1
}

fn apply_penalties(logits: &mut [f32], params: &SamplerParams, state: &SamplerState) {
    let neutral = params.repetition_penalty == 1.0
        && params.presence_penalty == 0.0
        && params.frequency_penalty == 0.0;
    if neutral || params.repetition_window == 0 {
        return;
    }
    let mut seen: Vec<TokenId> = state.recent().collect();
    seen.sort_unstable();
    seen.dedup();
    for t in seen {
        let l = &mut logits[t as usize];
        if params.repetition_penalty > 1.0 {
            if *l > 0.0 {
                *l /= params.repetition_penalty;
            } else {
                *l *= params.repetition_penalty;
            }
        }
        *l -= params.presence_penalty;
        *l -= params.frequency_penalty * state.count(t) as f32;
    }
}

/// Greedy selection; ties resolve to the lowest id.
pub fn argmax(logits: &[f32]) -> TokenId {
    let mut best = 0usize;
    for (i, &l) in logits.iter().enumerate().skip(1) {
        if l > logits[best] {
            best = i;
        }
    }
    best as TokenId
}
