//! Block-quantized weight tensors.
//!
//! Both schemes group 32 logical elements into a block that shares one fp16
//! scale. Q8_0 stores a signed byte per element (34 bytes per block); Q4_0
//! packs two elements per byte, low nibble for element `i`, high nibble for
//! element `i + 16`, each an unsigned 0-15 shifted to signed -8..7
//! (18 bytes per block).
//!
//! Weight matrices are stored as quantized rows of the output dimension,
//! quantized along the input dimension, so the fused matmul reduces each
//! output element with block-local dot products and never materializes an
//! fp32 copy of the weight.

use half::f16;

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;

use crate::simd;
use crate::tensor::Scheme;

/// Logical elements per quantization block.
pub const QK: usize = 32;

/// One Q8_0 block: fp16 scale plus 32 signed bytes.
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(C)]
pub struct BlockQ8_0 {
    pub d: f16,
    pub qs: [i8; QK],
}

/// One Q4_0 block: fp16 scale plus 16 nibble-packed bytes.
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(C)]
pub struct BlockQ4_0 {
    pub d: f16,
    pub qs: [u8; QK / 2],
}

/// Quantize one block of exactly [`QK`] values.
pub fn quantize_block_q8_0(x: &[f32; QK]) -> BlockQ8_0 {
    let amax = x.iter().fold(0.0f32, |m, v| m.max(v.abs()));
    let d = amax / 127.0;
    let inv = if d != 0.0 { 1.0 / d } else { 0.0 };
    let mut qs = [0i8; QK];
    for (q, &v) in qs.iter_mut().zip(x.iter()) {
        *q = (v * inv).round().clamp(-127.0, 127.0) as i8;
    }
    BlockQ8_0 { d: f16::from_f32(d), qs }
}

/// Quantize one block of exactly [`QK`] values.
///
/// The scale is the extreme value over -8 (sign preserved), matching the
/// GGML family layout, so the full signed nibble range is used.
pub fn quantize_block_q4_0(x: &[f32; QK]) -> BlockQ4_0 {
    let mut amax = 0.0f32;
    let mut max = 0.0f32;
    for &v in x.iter() {
        if v.abs() > amax {
            amax = v.abs();
            max = v;
        }
    }
    let d = max / -8.0;
    let inv = if d != 0.0 { 1.0 / d } else { 0.0 };
    let mut qs = [0u8; QK / 2];
    for i in 0..QK / 2 {
        let lo = ((x[i] * inv + 8.5) as i32).clamp(0, 15) as u8;
        let hi = ((x[i + QK / 2] * inv + 8.5) as i32).clamp(0, 15) as u8;
        qs[i] = lo | (hi << 4);
    }
    BlockQ4_0 { d: f16::from_f32(d), qs }
}

pub fn dequantize_block_q8_0(block: &BlockQ8_0, out: &mut [f32; QK]) {
    let d = block.d.to_f32();
    for (o, &q) in out.iter_mut().zip(block.qs.iter()) {
        *o = d * q as f32;
    }
}

pub fn dequantize_block_q4_0(block: &BlockQ4_0, out: &mut [f32; QK]) {
    let d = block.d.to_f32();
    for i in 0..QK / 2 {
        let byte = block.qs[i];
        out[i] = d * ((byte & 0x0F) as i32 - 8) as f32;
        out[i + QK / 2] = d * ((byte >> 4) as i32 - 8) as f32;
    }
}

#[derive(Clone)]
enum QData {
    Q8(Vec<BlockQ8_0>),
    Q4(Vec<BlockQ4_0>),
}

/// A block-quantized weight matrix of logical shape `[rows, cols]`, rows
/// being the output dimension. `cols` is padded up to a whole number of
/// blocks in storage; padding elements quantize to zero with scale zero.
#[derive(Clone)]
pub struct QTensor {
    rows: usize,
    cols: usize,
    blocks_per_row: usize,
    data: QData,
}

impl QTensor {
    /// Quantize a row-major `[rows, cols]` fp32 matrix.
    pub fn quantize(scheme: Scheme, rows: usize, cols: usize, data: &[f32]) -> QTensor {
        assert_eq!(data.len(), rows * cols, "matrix data must be rows*cols");
        let blocks_per_row = (cols + QK - 1) / QK;
        let mut padded = [0.0f32; QK];
        match scheme {
            Scheme::Q8_0 => {
                let mut blocks = Vec::with_capacity(rows * blocks_per_row);
                for r in 0..rows {
                    let row = &data[r * cols..(r + 1) * cols];
                    for b in 0..blocks_per_row {
                        let start = b * QK;
                        let take = (cols - start).min(QK);
                        padded.fill(0.0);
                        padded[..take].copy_from_slice(&row[start..start + take]);
                        blocks.push(quantize_block_q8_0(&padded));
                    }
                }
                QTensor { rows, cols, blocks_per_row, data: QData::Q8(blocks) }
            }
            Scheme::Q4_0 => {
                let mut blocks = Vec::with_capacity(rows * blocks_per_row);
                for r in 0..rows {
                    let row = &data[r * cols..(r + 1) * cols];
                    for b in 0..blocks_per_row {
                        let start = b * QK;
                        let take = (cols - start).min(QK);
                        padded.fill(0.0);
                        padded[..take].copy_from_slice(&row[start..start + take]);
                        blocks.push(quantize_block_q4_0(&padded));
                    }
                }
                QTensor { rows, cols, blocks_per_row, data: QData::Q4(blocks) }
            }
            other => panic!("{other} is not a quantized scheme"),
        }
    }

    pub fn scheme(&self) -> Scheme {
        match self.data {
            QData::Q8(_) => Scheme::Q8_0,
            QData::Q4(_) => Scheme::Q4_0,
        }
    }

    /// Output dimension.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Input dimension (logical, unpadded).
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Packed storage size in bytes.
    pub fn storage_bytes(&self) -> usize {
        self.rows * self.blocks_per_row * self.scheme().block_bytes()
    }

    /// Fused matmul: `out[m, rows] += a[m, cols] * self^T`, dequantizing
    /// each block into registers on the fly. The hot path; no allocation.
    pub fn matmul(&self, a: &[f32], out: &mut [f32], m: usize) {
        let k = self.cols;
        let n = self.rows;
        assert_eq!(a.len(), m * k, "activations must be m*cols");
        assert_eq!(out.len(), m * n, "output must be m*rows");

        for i in 0..m {
            let a_row = &a[i * k..(i + 1) * k];
            let out_row = &mut out[i * n..(i + 1) * n];
            for j in 0..n {
                out_row[j] += self.dot_row(j, a_row);
            }
        }
    }

    /// Dot product of quantized row `j` against `a` (`a.len() == cols`).
    fn dot_row(&self, j: usize, a: &[f32]) -> f32 {
        debug_assert_eq!(a.len(), self.cols);
        let start = j * self.blocks_per_row;
        let full = self.cols / QK;
        let tail = self.cols - full * QK;
        match &self.data {
            QData::Q8(blocks) => {
                let row = &blocks[start..start + self.blocks_per_row];
                let mut sum = 0.0;
                for (b, block) in row.iter().take(full).enumerate() {
                    sum += dot_block_q8_0(block, &a[b * QK..(b + 1) * QK]);
                }
                if tail > 0 {
                    sum += dot_block_q8_0_partial(&row[full], &a[full * QK..], tail);
                }
                sum
            }
            QData::Q4(blocks) => {
                let row = &blocks[start..start + self.blocks_per_row];
                let mut sum = 0.0;
                for (b, block) in row.iter().take(full).enumerate() {
                    sum += dot_block_q4_0(block, &a[b * QK..(b + 1) * QK]);
                }
                if tail > 0 {
                    sum += dot_block_q4_0_partial(&row[full], &a[full * QK..], tail);
                }
                sum
            }
        }
    }

    /// Dequantize one logical row into `out` (`out.len() == cols`).
    pub fn dequantize_row_into(&self, j: usize, out: &mut [f32]) {
        assert_eq!(out.len(), self.cols);
        let start = j * self.blocks_per_row;
        let mut scratch = [0.0f32; QK];
        for b in 0..self.blocks_per_row {
            match &self.data {
                QData::Q8(blocks) => dequantize_block_q8_0(&blocks[start + b], &mut scratch),
                QData::Q4(blocks) => dequantize_block_q4_0(&blocks[start + b], &mut scratch),
            }
            let off = b * QK;
            let take = (self.cols - off).min(QK);
            out[off..off + take].copy_from_slice(&scratch[..take]);
        }
    }

    /// Full fp32 materialization. Diagnostic only; the inference path never
    /// calls this.
    pub fn to_fp32(&self) -> Vec<f32> {
        let mut out = vec![0.0; self.rows * self.cols];
        for j in 0..self.rows {
            self.dequantize_row_into(j, &mut out[j * self.cols..(j + 1) * self.cols]);
        }
        out
    }
}

impl std::fmt::Debug for QTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QTensor")
            .field("scheme", &self.scheme())
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .finish()
    }
}

#[inline]
fn dot_block_q8_0(block: &BlockQ8_0, a: &[f32]) -> f32 {
    #[cfg(target_arch = "x86_64")]
    {
        if is_avx2() {
            // Safety: feature presence checked.
            return unsafe { dot_block_q8_0_avx2(block, a) };
        }
    }
    dot_block_q8_0_portable(block, a)
}

#[inline]
fn dot_block_q8_0_portable(block: &BlockQ8_0, a: &[f32]) -> f32 {
    let d = block.d.to_f32();
    let mut acc = [0.0f32; simd::LANES];
    for c in 0..QK / simd::LANES {
        let off = c * simd::LANES;
        for l in 0..simd::LANES {
            acc[l] += block.qs[off + l] as f32 * a[off + l];
        }
    }
    d * simd::lane_sum(&acc)
}

fn dot_block_q8_0_partial(block: &BlockQ8_0, a: &[f32], len: usize) -> f32 {
    let d = block.d.to_f32();
    let mut sum = 0.0;
    for i in 0..len {
        sum += block.qs[i] as f32 * a[i];
    }
    d * sum
}

#[inline]
fn dot_block_q4_0(block: &BlockQ4_0, a: &[f32]) -> f32 {
    let d = block.d.to_f32();
    let half = QK / 2;
    let mut acc = [0.0f32; simd::LANES];
    for c in 0..half / simd::LANES {
        let off = c * simd::LANES;
        for l in 0..simd::LANES {
            let byte = block.qs[off + l];
            acc[l] += ((byte & 0x0F) as i32 - 8) as f32 * a[off + l];
            acc[l] += ((byte >> 4) as i32 - 8) as f32 * a[half + off + l];
        }
    }
    d * simd::lane_sum(&acc)
}

fn dot_block_q4_0_partial(block: &BlockQ4_0, a: &[f32], len: usize) -> f32 {
    let d = block.d.to_f32();
    let half = QK / 2;
    let mut sum = 0.0;
    for i in 0..len {
        let byte = block.qs[i % half];
        let nib = if i < half { byte & 0x0F } else { byte >> 4 };
        sum += (nib as i32 - 8) as f32 * a[i];
    }
    d * sum
}

#[cfg(target_arch = "x86_64")]
#[inline]
fn is_avx2() -> bool {
    use std::sync::OnceLock;
    static DETECTED: OnceLock<bool> = OnceLock::new();
    *DETECTED.get_or_init(|| {
        is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma")
    })
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
unsafe fn dot_block_q8_0_avx2(block: &BlockQ8_0, a: &[f32]) -> f32 {
    let mut acc = _mm256_setzero_ps();
    for g in 0..QK / 8 {
        // Sign-extend eight quants to i32 lanes, convert, fuse-multiply.
        let qi = _mm_loadl_epi64(block.qs.as_ptr().add(g * 8) as *const __m128i);
        let qf = _mm256_cvtepi32_ps(_mm256_cvtepi8_epi32(qi));
        let va = _mm256_loadu_ps(a.as_ptr().add(g * 8));
        acc = _mm256_fmadd_ps(qf, va, acc);
    }
    block.d.to_f32() * simd::hsum256(acc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row(n: usize, seed: u32) -> Vec<f32> {
        // Deterministic pseudo-random values in [-1, 1].
        (0..n)
            .map(|i| {
                let h = (i as u32).wrapping_mul(2654435761).wrapping_add(seed);
                (h % 2000) as f32 / 1000.0 - 1.0
            })
            .collect()
    }

    #[test]
    fn block_sizes_match_layout() {
        assert_eq!(std::mem::size_of::<BlockQ8_0>(), 34);
        assert_eq!(std::mem::size_of::<BlockQ4_0>(), 18);
    }

    #[test]
    fn q8_0_round_trip_bound() {
        let row = sample_row(QK, 11);
        let mut x = [0.0f32; QK];
        x.copy_from_slice(&row);
        let block = quantize_block_q8_0(&x);
        let mut back = [0.0f32; QK];
        dequantize_block_q8_0(&block, &mut back);
        let scale = block.d.to_f32();
        for (orig, deq) in x.iter().zip(&back) {
            assert!((orig - deq).abs() <= scale, "{orig} vs {deq} (scale {scale})");
        }
    }

    #[test]
    fn q4_0_round_trip_bound() {
        let row = sample_row(QK, 23);
        let mut x = [0.0f32; QK];
        x.copy_from_slice(&row);
        let block = quantize_block_q4_0(&x);
        let mut back = [0.0f32; QK];
        dequantize_block_q4_0(&block, &mut back);
        let bound = block.d.to_f32().abs() * 8.0;
        for (orig, deq) in x.iter().zip(&back) {
            assert!((orig - deq).abs() <= bound, "{orig} vs {deq} (bound {bound})");
        }
    }

    #[test]
    fn q4_0_matrix_round_trip_bound() {
        // 64x64 uniform-ish in [-1, 1]; bound is max_scale * 8.
        let data = sample_row(64 * 64, 7);
        let qt = QTensor::quantize(Scheme::Q4_0, 64, 64, &data);
        let back = qt.to_fp32();
        let max_scale = match &qt.data {
            QData::Q4(blocks) => blocks.iter().map(|b| b.d.to_f32().abs()).fold(0.0f32, f32::max),
            _ => unreachable!(),
        };
        let mut max_err = 0.0f32;
        for (orig, deq) in data.iter().zip(&back) {
            max_err = max_err.max((orig - deq).abs());
        }
        assert!(max_err <= max_scale * 8.0, "max err {max_err}, bound {}", max_scale * 8.0);
    }

    #[test]
    fn zero_block_has_zero_scale() {
        let x = [0.0f32; QK];
        let q8 = quantize_block_q8_0(&x);
        assert_eq!(q8.d.to_f32(), 0.0);
        let q4 = quantize_block_q4_0(&x);
        assert_eq!(q4.d.to_f32(), 0.0);
        let mut back = [1.0f32; QK];
        dequantize_block_q4_0(&q4, &mut back);
        assert!(back.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn ragged_rows_pad_to_block() {
        // 40 columns: one full block plus an 8-element tail.
        let data = sample_row(3 * 40, 5);
        let qt = QTensor::quantize(Scheme::Q8_0, 3, 40, &data);
        assert_eq!(qt.blocks_per_row, 2);
        let back = qt.to_fp32();
        assert_eq!(back.len(), 3 * 40);
        for (orig, deq) in data.iter().zip(&back) {
            assert!((orig - deq).abs() <= 0.02, "{orig} vs {deq}");
        }
    }

    #[test]
    fn quantized_matmul_agrees_with_dequantized() {
        for scheme in [Scheme::Q8_0, Scheme::Q4_0] {
            let (m, k, n) = (3, 64, 17);
            let a = sample_row(m * k, 31);
            let w = sample_row(n * k, 37);
            let qt = QTensor::quantize(scheme, n, k, &w);

            let mut fused = vec![0.0; m * n];
            qt.matmul(&a, &mut fused, m);

            // Reference: dequantize then dense transposed-B product.
            let dense = qt.to_fp32();
            let mut reference = vec![0.0; m * n];
            crate::gemm::gemm_transposed_b(&mut reference, &a, &dense, m, k, n);

            for (f, r) in fused.iter().zip(&reference) {
                assert!((f - r).abs() < 1e-3, "{scheme}: {f} vs {r}");
            }
        }
    }

    #[test]
    fn matmul_with_ragged_k() {
        let (m, k, n) = (2, 40, 5);
        let a = sample_row(m * k, 41);
        let w = sample_row(n * k, 43);
        let qt = QTensor::quantize(Scheme::Q4_0, n, k, &w);
        let mut fused = vec![0.0; m * n];
        qt.matmul(&a, &mut fused, m);

        let dense = qt.to_fp32();
        let mut reference = vec![0.0; m * n];
        crate::gemm::gemm_transposed_b(&mut reference, &a, &dense, m, k, n);
        for (f, r) in fused.iter().zip(&reference) {
            assert!((f - r).abs() < 1e-3);
        }
    }
}
