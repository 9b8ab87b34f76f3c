//! Dense row-major tensors over pooled fp32 buffers.

use std::fmt;

/// Element storage scheme of a tensor or weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// 32-bit float, one element per value.
    F32,
    /// 16-bit float; converted to fp32 at load time, never computed on.
    F16,
    /// 8-bit block quantization: 32 elements share one fp16 scale.
    Q8_0,
    /// 4-bit block quantization: 32 elements share one fp16 scale.
    Q4_0,
}

impl Scheme {
    /// Logical elements per storage block.
    pub fn block_elements(self) -> usize {
        match self {
            Scheme::F32 | Scheme::F16 => 1,
            Scheme::Q8_0 | Scheme::Q4_0 => crate::quant::QK,
        }
    }

    /// Bytes per storage block.
    pub fn block_bytes(self) -> usize {
        match self {
            Scheme::F32 => 4,
            Scheme::F16 => 2,
            // fp16 scale + packed quants
            Scheme::Q8_0 => 2 + 32,
            Scheme::Q4_0 => 2 + 16,
        }
    }

    /// Bytes needed to store `elements` logical values in this scheme.
    /// Quantized schemes round up to a whole number of blocks.
    pub fn row_bytes(self, elements: usize) -> usize {
        let per = self.block_elements();
        ((elements + per - 1) / per) * self.block_bytes()
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Scheme::F32 => "f32",
            Scheme::F16 => "f16",
            Scheme::Q8_0 => "q8_0",
            Scheme::Q4_0 => "q4_0",
        };
        write!(f, "{name}")
    }
}

/// Row-major shape of up to four dimensions.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Shape {
    dims: [usize; 4],
    n_dims: usize,
}

impl Shape {
    pub fn d1(a: usize) -> Self {
        Shape { dims: [a, 1, 1, 1], n_dims: 1 }
    }

    pub fn d2(a: usize, b: usize) -> Self {
        Shape { dims: [a, b, 1, 1], n_dims: 2 }
    }

    pub fn d3(a: usize, b: usize, c: usize) -> Self {
        Shape { dims: [a, b, c, 1], n_dims: 3 }
    }

    pub fn d4(a: usize, b: usize, c: usize, d: usize) -> Self {
        Shape { dims: [a, b, c, d], n_dims: 4 }
    }

    /// Total number of logical elements.
    pub fn product(&self) -> usize {
        self.dims[..self.n_dims].iter().product()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims[..self.n_dims]
    }

    pub fn n_dims(&self) -> usize {
        self.n_dims
    }

    /// First dimension; rows for a 2-D shape.
    pub fn rows(&self) -> usize {
        self.dims[0]
    }

    /// Last dimension; columns for a 2-D shape.
    pub fn cols(&self) -> usize {
        self.dims[self.n_dims - 1]
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape{:?}", self.dims())
    }
}

/// A dense, row-major fp32 tensor.
///
/// The backing buffer comes from an [`crate::Arena`] and may be larger than
/// the logical shape; `shape.product() <= capacity` always holds. Reshaping
/// through [`Tensor::view`] is free and never reallocates.
pub struct Tensor {
    data: Box<[f32]>,
    shape: Shape,
}

impl Tensor {
    /// Wrap an existing buffer. The buffer must be at least as large as the
    /// shape; the arena is the usual way to obtain one.
    pub fn from_buffer(data: Box<[f32]>, shape: Shape) -> Self {
        assert!(
            shape.product() <= data.len(),
            "tensor shape {:?} exceeds buffer capacity {}",
            shape,
            data.len()
        );
        Tensor { data, shape }
    }

    /// Allocate a zeroed tensor outside the arena. Load-time only; the
    /// steady inference path rents scratch from the arena instead.
    pub fn zeros(shape: Shape) -> Self {
        Tensor {
            data: vec![0.0; shape.product()].into_boxed_slice(),
            shape,
        }
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn len(&self) -> usize {
        self.shape.product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The logical elements, in row-major order.
    pub fn as_slice(&self) -> &[f32] {
        &self.data[..self.shape.product()]
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data[..self.shape.product()]
    }

    /// Cheap reshape. The element count must not change.
    pub fn view(&mut self, shape: Shape) {
        assert_eq!(
            self.shape.product(),
            shape.product(),
            "view must preserve the element count ({:?} -> {:?})",
            self.shape,
            shape
        );
        self.shape = shape;
    }

    /// Zero the logical elements.
    pub fn clear(&mut self) {
        self.as_mut_slice().fill(0.0);
    }

    /// Zero the whole backing buffer, including slack capacity.
    pub(crate) fn scrub(&mut self) {
        self.data.fill(0.0);
    }

    pub(crate) fn into_buffer(self) -> Box<[f32]> {
        self.data
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("capacity", &self.data.len())
            .finish()
    }
}
