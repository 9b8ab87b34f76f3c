//! fp32 matrix multiplication.
//!
//! Two storage conventions are supported: `gemm` takes B row-major as
//! `[k, n]` and walks it with an axpy per A element, which vectorizes along
//! the output row; `gemm_transposed_b` takes B stored as `[n, k]` (weight
//! rows, and Q against K in attention) and reduces with dot products, four
//! output columns at a time.
//!
//! Both accumulate into C; callers clear C first when they want a plain
//! product. Above [`PAR_FLOP_THRESHOLD`] the output rows are split into
//! [`TILE_ROWS`]-row tiles and dispatched onto the ambient rayon pool.
//! Row tiles write disjoint slices of C and each tile accumulates in a
//! fixed order, so the result does not depend on scheduling.

use rayon::prelude::*;

use crate::simd;

/// `m * k * n` above which tile parallelism pays for itself.
pub const PAR_FLOP_THRESHOLD: usize = 1 << 18;

/// Rows of C per parallel tile.
pub const TILE_ROWS: usize = 64;

/// `C[m,n] += A[m,k] * B[k,n]`, all row-major.
pub fn gemm(c: &mut [f32], a: &[f32], b: &[f32], m: usize, k: usize, n: usize) {
    assert_eq!(a.len(), m * k, "A must be m*k");
    assert_eq!(b.len(), k * n, "B must be k*n");
    assert_eq!(c.len(), m * n, "C must be m*n");

    if m * k * n >= PAR_FLOP_THRESHOLD && m > 1 {
        c.par_chunks_mut(TILE_ROWS * n)
            .zip(a.par_chunks(TILE_ROWS * k))
            .for_each(|(c_tile, a_tile)| {
                gemm_serial(c_tile, a_tile, b, a_tile.len() / k, k, n);
            });
    } else {
        gemm_serial(c, a, b, m, k, n);
    }
}

fn gemm_serial(c: &mut [f32], a: &[f32], b: &[f32], m: usize, k: usize, n: usize) {
    for i in 0..m {
        let a_row = &a[i * k..(i + 1) * k];
        let c_row = &mut c[i * n..(i + 1) * n];
        for (l, &a_il) in a_row.iter().enumerate() {
            if a_il != 0.0 {
                simd::axpy(c_row, a_il, &b[l * n..(l + 1) * n]);
            }
        }
    }
}

/// `C[m,n] += A[m,k] * B^T` where B is stored row-major as `[n, k]`.
pub fn gemm_transposed_b(c: &mut [f32], a: &[f32], bt: &[f32], m: usize, k: usize, n: usize) {
    assert_eq!(a.len(), m * k, "A must be m*k");
    assert_eq!(bt.len(), n * k, "B^T must be n*k");
    assert_eq!(c.len(), m * n, "C must be m*n");

    if m * k * n >= PAR_FLOP_THRESHOLD && m > 1 {
        c.par_chunks_mut(TILE_ROWS * n)
            .zip(a.par_chunks(TILE_ROWS * k))
            .for_each(|(c_tile, a_tile)| {
                gemm_transposed_b_serial(c_tile, a_tile, bt, a_tile.len() / k, k, n);
            });
    } else {
        gemm_transposed_b_serial(c, a, bt, m, k, n);
    }
}

fn gemm_transposed_b_serial(c: &mut [f32], a: &[f32], bt: &[f32], m: usize, k: usize, n: usize) {
    for i in 0..m {
        let a_row = &a[i * k..(i + 1) * k];
        let c_row = &mut c[i * n..(i + 1) * n];
        let mut j = 0;
        // 4-way register blocking amortizes the horizontal sums.
        while j + 4 <= n {
            let sums = simd::dot4(
                a_row,
                [
                    &bt[j * k..(j + 1) * k],
                    &bt[(j + 1) * k..(j + 2) * k],
                    &bt[(j + 2) * k..(j + 3) * k],
                    &bt[(j + 3) * k..(j + 4) * k],
                ],
            );
            c_row[j] += sums[0];
            c_row[j + 1] += sums[1];
            c_row[j + 2] += sums[2];
            c_row[j + 3] += sums[3];
            j += 4;
        }
        while j < n {
            c_row[j] += simd::dot(a_row, &bt[j * k..(j + 1) * k]);
            j += 1;
        }
    }
}
