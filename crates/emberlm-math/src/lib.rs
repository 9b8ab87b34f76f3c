//! CPU tensor math for the `emberlm` inference engine.
//!
//! This crate provides the compute substrate the higher layers build on:
//!
//! - [`Tensor`] and [`Shape`]: dense row-major fp32 views over pooled
//!   backing buffers.
//! - [`arena`]: per-thread, size-bucketed buffer pools with scoped rental,
//!   so the steady inference path performs no allocation.
//! - [`gemm`]: fp32 matrix multiplication, including the transposed-B
//!   variant used for attention, with tile parallelism over a rayon pool.
//! - [`kernels`]: softmax, layer normalization, GELU, RoPE and residual
//!   passes.
//! - [`quant`]: Q4_0 / Q8_0 block-quantized weight tensors with fused
//!   matmul entry points that dequantize per block in registers.
//!
//! All kernels are deterministic for a fixed build: reductions accumulate
//! in a fixed lane order, and parallel GEMM splits work along output rows
//! only, so no result ever depends on thread scheduling.

pub mod arena;
pub mod gemm;
pub mod kernels;
pub mod quant;
pub mod simd;
pub mod tensor;

pub use arena::{Arena, ArenaError, Scratch};
pub use quant::{BlockQ4_0, BlockQ8_0, QTensor, QK};
pub use tensor::{Scheme, Shape, Tensor};
