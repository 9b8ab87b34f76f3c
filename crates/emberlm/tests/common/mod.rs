//! Shared fixtures: a deterministic synthetic model and a loader for it.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use emberlm::loader::{LoadContext, LoadError, LoadedModel, ModelLoader};
use emberlm::tokenizer::{ByteTokenizer, BYTE_BOS, BYTE_EOS};
use emberlm::{Hyperparameters, LayerWeights, ModelBundle, Scheme, Weight};

/// A 260-vocabulary, two-layer decoder with grouped-query attention and
/// quantized weights, fully determined by `seed`. Matches the
/// [`ByteTokenizer`] specials.
pub fn tiny_model(seed: u64) -> ModelBundle {
    let hp = Hyperparameters {
        n_vocab: 260,
        n_ctx: 64,
        n_embd: 16,
        n_head: 4,
        n_head_kv: 2,
        n_mlp: 32,
        n_layer: 2,
        rope_base: 10000.0,
        bos_token_id: Some(BYTE_BOS),
        eos_token_id: BYTE_EOS,
    };
    let mut rng = StdRng::seed_from_u64(seed);
    let d = hp.n_embd;
    let kv_dim = hp.n_head_kv * (hp.n_embd / hp.n_head);

    let mut mat = |rows: usize, cols: usize| -> Vec<f32> {
        let scale = 1.0 / (cols as f32).sqrt();
        (0..rows * cols).map(|_| rng.gen_range(-scale..scale)).collect()
    };

    let tok_embeddings = Weight::dense(hp.n_vocab, d, mat(hp.n_vocab, d));
    let mut layers = Vec::with_capacity(hp.n_layer);
    for _ in 0..hp.n_layer {
        layers.push(LayerWeights {
            attn_norm_g: vec![1.0; d],
            attn_norm_b: vec![0.0; d],
            wq: Weight::quantized(Scheme::Q8_0, d, d, &mat(d, d)),
            wk: Weight::quantized(Scheme::Q8_0, kv_dim, d, &mat(kv_dim, d)),
            wv: Weight::quantized(Scheme::Q8_0, kv_dim, d, &mat(kv_dim, d)),
            wo: Weight::quantized(Scheme::Q8_0, d, d, &mat(d, d)),
            ffn_norm_g: vec![1.0; d],
            ffn_norm_b: vec![0.0; d],
            w_gate: Weight::quantized(Scheme::Q4_0, hp.n_mlp, d, &mat(hp.n_mlp, d)),
            w_up: Weight::quantized(Scheme::Q4_0, hp.n_mlp, d, &mat(hp.n_mlp, d)),
            w_down: Weight::quantized(Scheme::Q4_0, d, hp.n_mlp, &mat(d, hp.n_mlp)),
        });
    }

    let bundle = ModelBundle {
        hyperparameters: hp,
        tok_embeddings,
        layers,
        final_norm_g: vec![1.0; d],
        final_norm_b: vec![0.0; d],
        lm_head: None,
    };
    bundle.validate().expect("synthetic model must be consistent");
    bundle
}

/// Loads [`tiny_model`] regardless of the path, counting invocations so
/// cache tests can observe hits.
pub struct SyntheticLoader {
    seed: u64,
    loads: AtomicUsize,
}

impl SyntheticLoader {
    pub fn new(seed: u64) -> Self {
        SyntheticLoader { seed, loads: AtomicUsize::new(0) }
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ModelLoader for SyntheticLoader {
    fn load(&self, _path: &Path, _ctx: &LoadContext) -> Result<LoadedModel, LoadError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(LoadedModel {
            bundle: Arc::new(tiny_model(self.seed)),
            tokenizer: Arc::new(ByteTokenizer::new()),
        })
    }
}
