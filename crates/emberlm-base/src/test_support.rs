//! Deterministic synthetic models for unit tests.

use emberlm_math::Scheme;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::model::{Hyperparameters, LayerWeights, ModelBundle, Weight};
use crate::tokenizer::{BYTE_BOS, BYTE_EOS};

/// A small decoder compatible with [`crate::tokenizer::ByteTokenizer`]:
/// 260 vocabulary entries, two layers, grouped-query attention, quantized
/// attention and MLP weights. Fully determined by `seed`.
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
    let kv_dim = hp.n_head_kv * hp.head_dim();

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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiny_model_is_deterministic() {
        let a = tiny_model(7);
        let b = tiny_model(7);
        assert_eq!(a.tok_embeddings.to_fp32(), b.tok_embeddings.to_fp32());
        assert_eq!(a.layers[0].wq.to_fp32(), b.layers[0].wq.to_fp32());
    }

    #[test]
    fn tiny_model_reports_mixed_schemes() {
        let m = tiny_model(9);
        let schemes = m.schemes();
        assert!(schemes.contains(&Scheme::F32));
        assert!(schemes.contains(&Scheme::Q8_0));
        assert!(schemes.contains(&Scheme::Q4_0));
    }
}
