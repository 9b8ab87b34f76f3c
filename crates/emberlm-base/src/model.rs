//! The immutable model bundle: hyperparameters and weights.
//!
//! A bundle is produced by a loader once, wrapped in an `Arc`, and shared
//! read-only across every session. There is no training path: weights carry
//! no gradients and no mutability.

use emberlm_math::{gemm, QTensor, Scheme};
use half::f16;

/// A vocabulary index.
pub type TokenId = u32;

/// Architectural hyperparameters of a decoder-only model.
#[derive(Debug, Clone, PartialEq)]
pub struct Hyperparameters {
    /// Vocabulary size.
    pub n_vocab: usize,
    /// Context window length.
    pub n_ctx: usize,
    /// Embedding dimension.
    pub n_embd: usize,
    /// Query head count.
    pub n_head: usize,
    /// Key/value head count; smaller than `n_head` under grouped-query
    /// attention.
    pub n_head_kv: usize,
    /// Hidden dimension of the gated MLP.
    pub n_mlp: usize,
    /// Transformer layer count.
    pub n_layer: usize,
    /// RoPE base frequency.
    pub rope_base: f32,
    /// Beginning-of-sequence token, when the tokenizer uses one.
    pub bos_token_id: Option<TokenId>,
    /// End-of-sequence token.
    pub eos_token_id: TokenId,
}

impl Hyperparameters {
    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    /// Check internal consistency. Loaders call this before handing a
    /// bundle to the engine.
    pub fn validate(&self) -> Result<(), String> {
        if self.n_head == 0 || self.n_embd % self.n_head != 0 {
            return Err(format!(
                "embedding dim {} is not divisible by head count {}",
                self.n_embd, self.n_head
            ));
        }
        if self.n_head_kv == 0 || self.n_head % self.n_head_kv != 0 {
            return Err(format!(
                "head count {} is not divisible by KV head count {}",
                self.n_head, self.n_head_kv
            ));
        }
        if self.head_dim() % 2 != 0 {
            return Err(format!("head dim {} must be even for RoPE", self.head_dim()));
        }
        if self.n_ctx == 0 || self.n_layer == 0 || self.n_vocab == 0 {
            return Err("context, layer and vocab sizes must be non-zero".into());
        }
        if self.eos_token_id as usize >= self.n_vocab {
            return Err(format!(
                "eos token {} outside vocabulary of {}",
                self.eos_token_id, self.n_vocab
            ));
        }
        Ok(())
    }
}

/// A weight matrix in whichever scheme the model file stored it.
///
/// The capability set is deliberately small: a fused matmul for the hot
/// path, a row gather for embeddings, and a diagnostic fp32 dump. Dispatch
/// happens once per call at this boundary rather than through any module
/// hierarchy.
#[derive(Debug, Clone)]
pub enum Weight {
    /// Dense fp32, stored row-major `[rows, cols]` (output rows).
    F32 { rows: usize, cols: usize, data: Vec<f32> },
    /// Block-quantized Q8_0 or Q4_0.
    Quantized(QTensor),
}

impl Weight {
    /// Build an fp32 weight from `[rows, cols]` data.
    pub fn dense(rows: usize, cols: usize, data: Vec<f32>) -> Self {
        assert_eq!(data.len(), rows * cols);
        Weight::F32 { rows, cols, data }
    }

    /// Convert fp16 payloads to fp32 at load time; the kernels never
    /// compute in half precision.
    pub fn from_f16(rows: usize, cols: usize, data: &[f16]) -> Self {
        assert_eq!(data.len(), rows * cols);
        Weight::F32 {
            rows,
            cols,
            data: data.iter().map(|v| v.to_f32()).collect(),
        }
    }

    /// Quantize fp32 data into the given scheme (loader-side path).
    pub fn quantized(scheme: Scheme, rows: usize, cols: usize, data: &[f32]) -> Self {
        Weight::Quantized(QTensor::quantize(scheme, rows, cols, data))
    }

    /// Output dimension.
    pub fn rows(&self) -> usize {
        match self {
            Weight::F32 { rows, .. } => *rows,
            Weight::Quantized(q) => q.rows(),
        }
    }

    /// Input dimension.
    pub fn cols(&self) -> usize {
        match self {
            Weight::F32 { cols, .. } => *cols,
            Weight::Quantized(q) => q.cols(),
        }
    }

    pub fn scheme(&self) -> Scheme {
        match self {
            Weight::F32 { .. } => Scheme::F32,
            Weight::Quantized(q) => q.scheme(),
        }
    }

    /// `out[m, rows] += a[m, cols] * W^T`. The single matmul entry point
    /// the forward pass uses; no allocation in either arm.
    pub fn matmul(&self, a: &[f32], out: &mut [f32], m: usize) {
        match self {
            Weight::F32 { rows, cols, data } => {
                gemm::gemm_transposed_b(out, a, data, m, *cols, *rows);
            }
            Weight::Quantized(q) => q.matmul(a, out, m),
        }
    }

    /// Copy logical row `j` into `out` (dequantizing when needed).
    pub fn copy_row(&self, j: usize, out: &mut [f32]) {
        match self {
            Weight::F32 { cols, data, .. } => {
                out.copy_from_slice(&data[j * cols..(j + 1) * cols]);
            }
            Weight::Quantized(q) => q.dequantize_row_into(j, out),
        }
    }

    /// Diagnostic fp32 materialization.
    pub fn to_fp32(&self) -> Vec<f32> {
        match self {
            Weight::F32 { data, .. } => data.clone(),
            Weight::Quantized(q) => q.to_fp32(),
        }
    }

    /// Approximate resident bytes.
    pub fn storage_bytes(&self) -> usize {
        match self {
            Weight::F32 { data, .. } => data.len() * 4,
            Weight::Quantized(q) => q.storage_bytes(),
        }
    }
}

/// Weights of one transformer layer (pre-norm, gated MLP).
#[derive(Debug, Clone)]
pub struct LayerWeights {
    pub attn_norm_g: Vec<f32>,
    pub attn_norm_b: Vec<f32>,
    pub wq: Weight,
    pub wk: Weight,
    pub wv: Weight,
    pub wo: Weight,
    pub ffn_norm_g: Vec<f32>,
    pub ffn_norm_b: Vec<f32>,
    pub w_gate: Weight,
    pub w_up: Weight,
    pub w_down: Weight,
}

/// A loaded model: hyperparameters plus every named weight, immutable for
/// the lifetime of the engine.
#[derive(Debug)]
pub struct ModelBundle {
    pub hyperparameters: Hyperparameters,
    /// Token embedding table, `[n_vocab, n_embd]`.
    pub tok_embeddings: Weight,
    pub layers: Vec<LayerWeights>,
    pub final_norm_g: Vec<f32>,
    pub final_norm_b: Vec<f32>,
    /// LM head; `None` means the output projection is tied to
    /// `tok_embeddings`.
    pub lm_head: Option<Weight>,
}

impl ModelBundle {
    /// The weight used to project hidden states to logits.
    pub fn output_weight(&self) -> &Weight {
        self.lm_head.as_ref().unwrap_or(&self.tok_embeddings)
    }

    /// Schemes present anywhere in the bundle, deduplicated.
    pub fn schemes(&self) -> Vec<Scheme> {
        let mut found = Vec::new();
        let mut push = |s: Scheme| {
            if !found.contains(&s) {
                found.push(s);
            }
        };
        push(self.tok_embeddings.scheme());
        for layer in &self.layers {
            for w in [
                &layer.wq, &layer.wk, &layer.wv, &layer.wo,
                &layer.w_gate, &layer.w_up, &layer.w_down,
            ] {
                push(w.scheme());
            }
        }
        if let Some(head) = &self.lm_head {
            push(head.scheme());
        }
        found
    }

    /// Structural validation: every weight shape must agree with the
    /// hyperparameters.
    pub fn validate(&self) -> Result<(), String> {
        let hp = &self.hyperparameters;
        hp.validate()?;
        let d = hp.n_embd;
        let kv_dim = hp.n_head_kv * hp.head_dim();

        if self.tok_embeddings.rows() != hp.n_vocab || self.tok_embeddings.cols() != d {
            return Err("token embedding shape mismatch".into());
        }
        if self.layers.len() != hp.n_layer {
            return Err(format!(
                "expected {} layers, bundle has {}",
                hp.n_layer,
                self.layers.len()
            ));
        }
        for (i, layer) in self.layers.iter().enumerate() {
            let check = |name: &str, w: &Weight, rows: usize, cols: usize| {
                if w.rows() != rows || w.cols() != cols {
                    Err(format!(
                        "layer {i} {name}: expected [{rows}, {cols}], found [{}, {}]",
                        w.rows(),
                        w.cols()
                    ))
                } else {
                    Ok(())
                }
            };
            check("wq", &layer.wq, d, d)?;
            check("wk", &layer.wk, kv_dim, d)?;
            check("wv", &layer.wv, kv_dim, d)?;
            check("wo", &layer.wo, d, d)?;
            check("w_gate", &layer.w_gate, hp.n_mlp, d)?;
            check("w_up", &layer.w_up, hp.n_mlp, d)?;
            check("w_down", &layer.w_down, d, hp.n_mlp)?;
            if layer.attn_norm_g.len() != d || layer.ffn_norm_g.len() != d {
                return Err(format!("layer {i} norm weights must match embedding dim"));
            }
        }
        if self.final_norm_g.len() != d || self.final_norm_b.len() != d {
            return Err("final norm weights must match embedding dim".into());
        }
        if let Some(head) = &self.lm_head {
            if head.rows() != hp.n_vocab || head.cols() != d {
                return Err("LM head shape mismatch".into());
            }
        }
        Ok(())
    }

    /// Total resident weight bytes, for capability reporting.
    pub fn weight_bytes(&self) -> usize {
        let mut total = self.tok_embeddings.storage_bytes();
        for layer in &self.layers {
            for w in [
                &layer.wq, &layer.wk, &layer.wv, &layer.wo,
                &layer.w_gate, &layer.w_up, &layer.w_down,
            ] {
                total += w.storage_bytes();
            }
            total += (layer.attn_norm_g.len() + layer.attn_norm_b.len()) * 4;
            total += (layer.ffn_norm_g.len() + layer.ffn_norm_b.len()) * 4;
        }
        total += (self.final_norm_g.len() + self.final_norm_b.len()) * 4;
        if let Some(head) = &self.lm_head {
            total += head.storage_bytes();
        }
        total
    }
}
