//! The decoder-only forward pass.
//!
//! One call to [`evaluate`] consumes a batch of token ids (the whole prompt
//! during prefill, a single token during decode), runs every layer against
//! the session's KV entry, and leaves the last position's logits in the
//! caller's buffer. Scratch tensors come from the thread arena and are
//! returned on every exit path; after warmup a decode step allocates
//! nothing.
//!
//! KV writes for the new positions are staged into the entry as each layer
//! runs but only become visible when `t_filled` is committed after the full
//! pass succeeds, so an abort mid-pass never corrupts the cache.

use emberlm_math::arena::scratch;
use emberlm_math::kernels;
use emberlm_math::Shape;

use crate::error::InferenceError;
use crate::kv::KvEntry;
use crate::model::{ModelBundle, TokenId};

const NORM_EPS: f32 = 1e-5;

/// Optional extra outputs of a forward pass, filled only when the host
/// asks; the hot decode path leaves both unset.
#[derive(Debug, Default)]
pub struct OutputRequest {
    /// When set, receives logits for every position of the batch
    /// (`[t_new, n_vocab]`), used for prompt scoring.
    pub all_logits: Option<Vec<f32>>,
    /// When set, receives the final-norm hidden state of the last position
    /// (`[n_embd]`).
    pub embeddings: Option<Vec<f32>>,
}

impl OutputRequest {
    pub fn wants_all_logits(&self) -> bool {
        self.all_logits.is_some()
    }

    pub fn wants_embeddings(&self) -> bool {
        self.embeddings.is_some()
    }
}

/// Run the transformer over `tokens`, appending to `entry`.
///
/// `abort` is polled before each layer; returning an error unwinds the
/// pass before the KV commit. `last_logits` must hold `n_vocab` elements.
pub fn evaluate(
    model: &ModelBundle,
    entry: &mut KvEntry,
    tokens: &[TokenId],
    last_logits: &mut [f32],
    output_request: &mut OutputRequest,
    mut abort: impl FnMut() -> Option<InferenceError>,
) -> Result<(), InferenceError> {
    let hp = &model.hyperparameters;
    let t_new = tokens.len();
    let t_past = entry.t_filled();
    let t_total = t_past + t_new;
    let d = hp.n_embd;
    let d_h = hp.head_dim();
    let kv_row = entry.kv_row();

    if t_new == 0 {
        return Err(InferenceError::InternalError("empty token batch".into()));
    }
    if t_total > hp.n_ctx {
        return Err(InferenceError::ContextOverflow {
            needed: t_total,
            available: hp.n_ctx,
        });
    }
    if last_logits.len() != hp.n_vocab {
        return Err(InferenceError::InternalError(
            "logits buffer does not match vocabulary".into(),
        ));
    }
    for &t in tokens {
        if t as usize >= hp.n_vocab {
            return Err(InferenceError::InferenceFailed(format!(
                "token id {t} outside vocabulary of {}",
                hp.n_vocab
            )));
        }
    }

    let oom = |e: emberlm_math::ArenaError| InferenceError::InferenceFailed(e.to_string());

    // Residual stream and per-step scratch.
    let mut x = scratch(Shape::d2(t_new, d)).map_err(oom)?;
    let mut x_norm = scratch(Shape::d2(t_new, d)).map_err(oom)?;
    let mut q = scratch(Shape::d2(t_new, d)).map_err(oom)?;
    let mut k = scratch(Shape::d2(t_new, kv_row)).map_err(oom)?;
    let mut v = scratch(Shape::d2(t_new, kv_row)).map_err(oom)?;
    let mut attn_ctx = scratch(Shape::d2(t_new, d)).map_err(oom)?;
    let mut ctx_head = scratch(Shape::d2(t_new, d_h)).map_err(oom)?;
    let mut scores = scratch(Shape::d2(t_new, t_total)).map_err(oom)?;
    let mut gate = scratch(Shape::d2(t_new, hp.n_mlp)).map_err(oom)?;
    let mut up = scratch(Shape::d2(t_new, hp.n_mlp)).map_err(oom)?;
    let mut mlp_out = scratch(Shape::d2(t_new, d)).map_err(oom)?;

    // Embedding gather.
    for (i, &t) in tokens.iter().enumerate() {
        model
            .tok_embeddings
            .copy_row(t as usize, &mut x.as_mut_slice()[i * d..(i + 1) * d]);
    }

    for (il, layer) in model.layers.iter().enumerate() {
        if let Some(err) = abort() {
            return Err(err);
        }

        // Attention block, pre-norm.
        for i in 0..t_new {
            kernels::layer_norm(
                &mut x_norm.as_mut_slice()[i * d..(i + 1) * d],
                &x.as_slice()[i * d..(i + 1) * d],
                &layer.attn_norm_g,
                &layer.attn_norm_b,
                NORM_EPS,
            );
        }

        q.clear();
        k.clear();
        v.clear();
        layer.wq.matmul(x_norm.as_slice(), q.as_mut_slice(), t_new);
        layer.wk.matmul(x_norm.as_slice(), k.as_mut_slice(), t_new);
        layer.wv.matmul(x_norm.as_slice(), v.as_mut_slice(), t_new);

        for i in 0..t_new {
            let pos = t_past + i;
            kernels::rope(
                &mut q.as_mut_slice()[i * d..(i + 1) * d],
                hp.n_head,
                d_h,
                pos,
                hp.rope_base,
            );
            kernels::rope(
                &mut k.as_mut_slice()[i * kv_row..(i + 1) * kv_row],
                hp.n_head_kv,
                d_h,
                pos,
                hp.rope_base,
            );
        }

        // Stage the new keys and values; visible to this pass, committed
        // only at the end.
        for i in 0..t_new {
            entry.write_position(
                il,
                t_past + i,
                &k.as_slice()[i * kv_row..(i + 1) * kv_row],
                &v.as_slice()[i * kv_row..(i + 1) * kv_row],
            );
        }

        let cache = entry.layer(il);
        attn_ctx.clear();
        for h in 0..hp.n_head {
            // Grouped-query attention: several query heads share a KV head.
            let g = h * hp.n_head_kv / hp.n_head;
            kernels::attention_scores(
                scores.as_mut_slice(),
                &q.as_slice()[h * d_h..],
                d,
                &cache.keys[g * d_h..],
                kv_row,
                t_new,
                t_total,
                t_past,
                d_h,
            );
            kernels::softmax_rows(scores.as_mut_slice(), t_total);
            ctx_head.clear();
            kernels::attention_mix(
                ctx_head.as_mut_slice(),
                scores.as_slice(),
                &cache.values[g * d_h..],
                kv_row,
                t_new,
                t_total,
                d_h,
            );
            for i in 0..t_new {
                let dst = i * d + h * d_h;
                attn_ctx.as_mut_slice()[dst..dst + d_h]
                    .copy_from_slice(&ctx_head.as_slice()[i * d_h..(i + 1) * d_h]);
            }
        }

        // Output projection straight onto the residual stream.
        layer.wo.matmul(attn_ctx.as_slice(), x.as_mut_slice(), t_new);

        // Gated MLP block, pre-norm.
        for i in 0..t_new {
            kernels::layer_norm(
                &mut x_norm.as_mut_slice()[i * d..(i + 1) * d],
                &x.as_slice()[i * d..(i + 1) * d],
                &layer.ffn_norm_g,
                &layer.ffn_norm_b,
                NORM_EPS,
            );
        }
        gate.clear();
        up.clear();
        layer.w_gate.matmul(x_norm.as_slice(), gate.as_mut_slice(), t_new);
        layer.w_up.matmul(x_norm.as_slice(), up.as_mut_slice(), t_new);
        kernels::gelu(gate.as_mut_slice());
        for (g_val, u_val) in gate.as_mut_slice().iter_mut().zip(up.as_slice()) {
            *g_val *= u_val;
        }
        mlp_out.clear();
        layer.w_down.matmul(gate.as_slice(), mlp_out.as_mut_slice(), t_new);
        emberlm_math::simd::add_assign(x.as_mut_slice(), mlp_out.as_slice());
    }

    if let Some(err) = abort() {
        return Err(err);
    }

    // Final norm over every position (cheap; the last row feeds the head,
    // the rest are needed only for all-position scoring).
    for i in 0..t_new {
        kernels::layer_norm(
            &mut x_norm.as_mut_slice()[i * d..(i + 1) * d],
            &x.as_slice()[i * d..(i + 1) * d],
            &model.final_norm_g,
            &model.final_norm_b,
            NORM_EPS,
        );
    }

    let head = model.output_weight();
    last_logits.fill(0.0);
    head.matmul(
        &x_norm.as_slice()[(t_new - 1) * d..t_new * d],
        last_logits,
        1,
    );
    sanity_check(last_logits)?;

    if output_request.wants_all_logits() {
        let all = output_request.all_logits.get_or_insert_with(Vec::new);
        all.clear();
        all.resize(t_new * hp.n_vocab, 0.0);
        head.matmul(x_norm.as_slice(), all, t_new);
    }
    if output_request.wants_embeddings() {
        let emb = output_request.embeddings.get_or_insert_with(Vec::new);
        emb.clear();
        emb.extend_from_slice(&x_norm.as_slice()[(t_new - 1) * d..t_new * d]);
    }

    entry.commit(t_new);
    Ok(())
}

fn sanity_check(logits: &[f32]) -> Result<(), InferenceError> {
    if logits.iter().any(|l| l.is_nan()) {
        return Err(InferenceError::InferenceFailed(
            "non-finite logits produced".into(),
        ));
    }
    Ok(())
}
