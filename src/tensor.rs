use crate::dtype::DType;
use half::{bf16, f16};
use ndarray::{ArrayD, IxDyn};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum TensorError {
    #[error("Expected dtype {expected}, got {actual}")]
    DTypeMismatch { expected: DType, actual: DType },
    #[error("Raw data length {0} does not match dtype {1} with shape {2:?}")]
    RawDataLength(usize, DType, Vec<u64>),
    #[error(transparent)]
    ShapeError(#[from] ndarray::ShapeError),
}

/// Plain-old-data element types a [`TensorValue`] can be built from or viewed as.
pub trait Element: bytemuck::Pod {
    const DTYPE: DType;
}

macro_rules! impl_element {
    ($t:ty, $dtype:expr) => {
        impl Element for $t {
            const DTYPE: DType = $dtype;
        }
    };
}

impl_element!(f64, DType::F64);
impl_element!(f32, DType::F32);
impl_element!(bf16, DType::BF16);
impl_element!(f16, DType::F16);
impl_element!(u64, DType::U64);
impl_element!(i64, DType::I64);
impl_element!(u32, DType::U32);
impl_element!(i32, DType::I32);
impl_element!(u16, DType::U16);
impl_element!(i16, DType::I16);
impl_element!(u8, DType::U8);
impl_element!(i8, DType::I8);

/// Identity of a tensor's backing buffer. Two values share an identity only
/// when they share the same allocation.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub struct BufferIdentity(usize);

/// An immutable tensor value: dtype, shape, and a shared byte buffer.
///
/// Cloning is cheap and preserves buffer identity.
#[derive(Clone, Debug, PartialEq)]
pub struct TensorValue {
    dtype: DType,
    shape: Vec<u64>,
    data: Arc<Vec<u8>>,
}

impl TensorValue {
    pub fn from_raw_data(data: &[u8], dtype: DType, shape: Vec<u64>) -> Result<Self, TensorError> {
        let expected = shape.iter().product::<u64>() as usize * dtype.size();
        if data.len() != expected {
            return Err(TensorError::RawDataLength(data.len(), dtype, shape));
        }
        Ok(Self {
            dtype,
            shape,
            data: Arc::new(data.to_vec()),
        })
    }

    pub fn from_vec_shape<T: Element>(values: Vec<T>, shape: Vec<u64>) -> Result<Self, TensorError> {
        let expected = shape.iter().product::<u64>() as usize;
        if values.len() != expected {
            return Err(TensorError::RawDataLength(
                values.len() * size_of::<T>(),
                T::DTYPE,
                shape,
            ));
        }
        Ok(Self {
            dtype: T::DTYPE,
            shape,
            data: Arc::new(bytemuck::cast_slice(&values).to_vec()),
        })
    }

    pub fn from_ndarray<T: Element>(array: &ArrayD<T>) -> Self {
        let shape = array.shape().iter().map(|x| *x as u64).collect();
        let values: Vec<T> = array.iter().copied().collect();
        Self {
            dtype: T::DTYPE,
            shape,
            data: Arc::new(bytemuck::cast_slice(&values).to_vec()),
        }
    }

    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>, TensorError> {
        if self.dtype != T::DTYPE {
            return Err(TensorError::DTypeMismatch {
                expected: T::DTYPE,
                actual: self.dtype,
            });
        }
        // Copy through a typed buffer; the byte storage carries no alignment
        // guarantee for T.
        let count = self.data.len() / size_of::<T>();
        let mut out = vec![<T as bytemuck::Zeroable>::zeroed(); count];
        bytemuck::cast_slice_mut::<T, u8>(&mut out).copy_from_slice(&self.data);
        Ok(out)
    }

    pub fn to_ndarray<T: Element>(&self) -> Result<ArrayD<T>, TensorError> {
        let values = self.to_vec::<T>()?;
        let shape: Vec<usize> = self.shape.iter().map(|x| *x as usize).collect();
        Ok(ArrayD::from_shape_vec(IxDyn(&shape), values)?)
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    pub fn num_elements(&self) -> u64 {
        self.shape.iter().product()
    }

    pub fn raw_data(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn identity(&self) -> BufferIdentity {
        BufferIdentity(Arc::as_ptr(&self.data) as *const u8 as usize)
    }

    pub fn shares_buffer_with(&self, other: &TensorValue) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}
