//! Registry of element types a tensor can store.
//!
//! Besides plain scalars this includes block-quantized formats whose average
//! width is less than a byte per element, so byte sizes are always computed
//! through [`DataType::buffer_size`] rather than a per-element width.

/// Element type of a tensor's buffer.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum DataType {
    /// 32-bit float
    #[default]
    F32,
    /// 16-bit float
    F16,
    /// 32-bit signed integer
    I32,
    /// 8-bit signed integer
    I8,
    /// 8-bit unsigned integer
    U8,
    /// 4-bit quantized, blocks of 32 elements
    Q4_0,
    /// 8-bit quantized, blocks of 32 elements
    Q8_0,
    /// 4-bit K-quantized, super-blocks of 256 elements
    Q4K,
    /// 6-bit K-quantized, super-blocks of 256 elements
    Q6K,
}

impl DataType {
    /// Return the element count per quantization block and the byte size of
    /// one block.
    ///
    /// Scalar types are treated as blocks of one element.
    fn block_layout(self) -> (usize, usize) {
        match self {
            DataType::F32 | DataType::I32 => (1, 4),
            DataType::F16 => (1, 2),
            DataType::I8 | DataType::U8 => (1, 1),
            // One f16 scale plus 32 packed 4-bit values.
            DataType::Q4_0 => (32, 18),
            // One f16 scale plus 32 8-bit values.
            DataType::Q8_0 => (32, 34),
            DataType::Q4K => (256, 144),
            DataType::Q6K => (256, 210),
        }
    }

    /// Return the number of bytes needed to store `count` elements.
    ///
    /// For block-quantized types the count is rounded up to whole blocks.
    pub fn buffer_size(self, count: usize) -> usize {
        let (block_elems, block_bytes) = self.block_layout();
        count.div_ceil(block_elems) * block_bytes
    }

    /// Return the per-element width in bytes, or `None` for block-quantized
    /// types where elements are not individually addressable.
    pub fn scalar_width(self) -> Option<usize> {
        match self.block_layout() {
            (1, bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Return true if this is a block-quantized format.
    pub fn is_quantized(self) -> bool {
        self.block_layout().0 > 1
    }

    /// Return the byte alignment buffers of this type are allocated at.
    ///
    /// Wide enough for vectorized kernels to load full registers from any
    /// block start.
    pub fn alignment(self) -> usize {
        if self.is_quantized() {
            64
        } else {
            32
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            fmt,
            "{}",
            match self {
                DataType::F32 => "f32",
                DataType::F16 => "f16",
                DataType::I32 => "i32",
                DataType::I8 => "i8",
                DataType::U8 => "u8",
                DataType::Q4_0 => "q4_0",
                DataType::Q8_0 => "q8_0",
                DataType::Q4K => "q4_k",
                DataType::Q6K => "q6_k",
            }
        )
    }
}

/// Scalar types that can be read from and written to tensor storage.
pub trait Element: Copy + std::fmt::Debug + 'static {
    /// Get the [`DataType`] that corresponds to this type.
    fn dtype() -> DataType;
}

macro_rules! impl_element {
    ($type:ty, $dtype:ident) => {
        impl Element for $type {
            fn dtype() -> DataType {
                DataType::$dtype
            }
        }
    };
}

impl_element!(f32, F32);
impl_element!(i32, I32);
impl_element!(i8, I8);
impl_element!(u8, U8);
