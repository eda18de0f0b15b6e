use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ndarray::{ArrayD, ArrayView4, ArrayViewD, ArrayViewMut4, ArrayViewMutD, Axis, Ix4, IxDyn, Slice};

use crate::error::{Error, Result};
use crate::layout::tensor_layout::TensorShape;
use crate::model::DataType;

/// Shared handle to a workspace-owned tensor
pub type TensorHandle = Arc<Tensor>;

/// Backing storage of a tensor, sized by its storage dimensions
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Float32(ArrayD<f32>),
    Int32(ArrayD<i32>),
}

impl TensorData {
    /// Zero-filled storage for a shape
    pub fn zeros(shape: &TensorShape, data_type: DataType) -> Self {
        let dims = IxDyn(&shape.storage_dims());
        match data_type {
            DataType::Float32 => TensorData::Float32(ArrayD::zeros(dims)),
            DataType::Int32 => TensorData::Int32(ArrayD::zeros(dims)),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            TensorData::Float32(_) => DataType::Float32,
            TensorData::Int32(_) => DataType::Int32,
        }
    }

    /// Number of stored elements, padding included
    pub fn len(&self) -> usize {
        match self {
            TensorData::Float32(a) => a.len(),
            TensorData::Int32(a) => a.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_f32(&self) -> Result<&ArrayD<f32>> {
        match self {
            TensorData::Float32(a) => Ok(a),
            TensorData::Int32(_) => Err(type_mismatch(DataType::Float32, DataType::Int32)),
        }
    }

    pub fn as_f32_mut(&mut self) -> Result<&mut ArrayD<f32>> {
        match self {
            TensorData::Float32(a) => Ok(a),
            TensorData::Int32(_) => Err(type_mismatch(DataType::Float32, DataType::Int32)),
        }
    }

    pub fn as_i32(&self) -> Result<&ArrayD<i32>> {
        match self {
            TensorData::Int32(a) => Ok(a),
            TensorData::Float32(_) => Err(type_mismatch(DataType::Int32, DataType::Float32)),
        }
    }

    pub fn as_i32_mut(&mut self) -> Result<&mut ArrayD<i32>> {
        match self {
            TensorData::Int32(a) => Ok(a),
            TensorData::Float32(_) => Err(type_mismatch(DataType::Int32, DataType::Float32)),
        }
    }
}

fn type_mismatch(expected: DataType, found: DataType) -> Error {
    Error::ValidationError(format!(
        "Expected {:?} tensor data, found {:?}",
        expected, found
    ))
}

/// View of the logical region of a storage buffer (alignment tail excluded)
pub fn logical_view<'a, A>(array: &'a ArrayD<A>, shape: &TensorShape) -> ArrayViewD<'a, A> {
    match shape.dims().last() {
        Some(&last) => array.slice_axis(Axis(shape.ndims() - 1), Slice::from(0..last)),
        None => array.view(),
    }
}

/// Mutable view of the logical region of a storage buffer
pub fn logical_view_mut<'a, A>(array: &'a mut ArrayD<A>, shape: &TensorShape) -> ArrayViewMutD<'a, A> {
    match shape.dims().last() {
        Some(&last) => array.slice_axis_mut(Axis(shape.ndims() - 1), Slice::from(0..last)),
        None => array.view_mut(),
    }
}

/// Logical region of a 4-D buffer
pub fn logical_view4<'a, A>(array: &'a ArrayD<A>, shape: &TensorShape) -> Result<ArrayView4<'a, A>> {
    Ok(logical_view(array, shape).into_dimensionality::<Ix4>()?)
}

/// Mutable logical region of a 4-D buffer
pub fn logical_view4_mut<'a, A>(
    array: &'a mut ArrayD<A>,
    shape: &TensorShape,
) -> Result<ArrayViewMut4<'a, A>> {
    Ok(logical_view_mut(array, shape).into_dimensionality::<Ix4>()?)
}

/// A named tensor owned by a workspace.
///
/// Storage sits behind a lock so that the producing operator can write it
/// in place while other operators read different tensors. The shape never
/// changes after construction.
pub struct Tensor {
    name: String,
    shape: TensorShape,
    data: RwLock<TensorData>,
    dead: AtomicBool,
}

impl Tensor {
    /// Create a zero-filled float tensor
    pub fn new(name: impl Into<String>, shape: TensorShape) -> Self {
        Self::with_data_type(name, shape, DataType::Float32)
    }

    /// Create a zero-filled tensor of the given element type
    pub fn with_data_type(name: impl Into<String>, shape: TensorShape, data_type: DataType) -> Self {
        let data = TensorData::zeros(&shape, data_type);
        Self {
            name: name.into(),
            shape,
            data: RwLock::new(data),
            dead: AtomicBool::new(false),
        }
    }

    /// Create a float tensor from logical values in row-major order
    pub fn from_values(name: impl Into<String>, shape: TensorShape, values: &[f32]) -> Result<Self> {
        let tensor = Self::new(name, shape);
        tensor.fill_logical(values)?;
        Ok(tensor)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &TensorShape {
        &self.shape
    }

    pub fn data_type(&self) -> DataType {
        // The variant is fixed at construction
        match self.data.read() {
            Ok(data) => data.data_type(),
            Err(poisoned) => poisoned.into_inner().data_type(),
        }
    }

    /// Bytes occupied by the backing buffer
    pub fn size_in_bytes(&self) -> usize {
        self.shape.size_in_bytes(self.data_type())
    }

    pub fn read(&self) -> Result<RwLockReadGuard<'_, TensorData>> {
        self.data.read().map_err(|_| {
            Error::ExecutionError(format!("Failed to acquire read lock on tensor '{}'", self.name))
        })
    }

    pub fn write(&self) -> Result<RwLockWriteGuard<'_, TensorData>> {
        self.data.write().map_err(|_| {
            Error::ExecutionError(format!("Failed to acquire write lock on tensor '{}'", self.name))
        })
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub fn set_dead(&self, dead: bool) {
        self.dead.store(dead, Ordering::Release);
    }

    /// Overwrite the logical elements, leaving the alignment tail untouched.
    /// Values are converted for integer tensors.
    pub fn fill_logical(&self, values: &[f32]) -> Result<()> {
        if values.len() != self.shape.logical_size() {
            return Err(Error::ValidationError(format!(
                "Tensor '{}' holds {} elements, got {} values",
                self.name,
                self.shape.logical_size(),
                values.len()
            )));
        }

        let mut data = self.write()?;
        match &mut *data {
            TensorData::Float32(array) => {
                for (dst, &src) in logical_view_mut(array, &self.shape).iter_mut().zip(values) {
                    *dst = src;
                }
            }
            TensorData::Int32(array) => {
                for (dst, &src) in logical_view_mut(array, &self.shape).iter_mut().zip(values) {
                    *dst = src as i32;
                }
            }
        }
        Ok(())
    }

    /// Logical elements in row-major order, converted to `f32`
    pub fn logical_values(&self) -> Result<Vec<f32>> {
        let data = self.read()?;
        Ok(match &*data {
            TensorData::Float32(array) => logical_view(array, &self.shape).iter().copied().collect(),
            TensorData::Int32(array) => {
                logical_view(array, &self.shape).iter().map(|&v| v as f32).collect()
            }
        })
    }

    /// Copy raw storage values into the buffer, starting at element 0.
    /// The source may be shorter than the storage but never longer.
    pub fn fill_storage(&self, values: &TensorData) -> Result<()> {
        if values.len() > self.shape.storage_size() {
            return Err(Error::ValidationError(format!(
                "{} values do not fit into tensor '{}' of storage size {}",
                values.len(),
                self.name,
                self.shape.storage_size()
            )));
        }

        let mut data = self.write()?;
        match (&mut *data, values) {
            (TensorData::Float32(dst), TensorData::Float32(src)) => {
                dst.iter_mut().zip(src.iter()).for_each(|(d, &s)| *d = s);
            }
            (TensorData::Int32(dst), TensorData::Int32(src)) => {
                dst.iter_mut().zip(src.iter()).for_each(|(d, &s)| *d = s);
            }
            (dst, src) => return Err(type_mismatch(dst.data_type(), src.data_type())),
        }
        Ok(())
    }

    /// Snapshot of the whole backing buffer, padding included
    pub fn storage_values(&self) -> Result<TensorData> {
        Ok(self.read()?.clone())
    }

    /// Copy the logical contents of another tensor with identical dimensions
    pub fn copy_from(&self, source: &Tensor) -> Result<()> {
        if std::ptr::eq(self, source) {
            return Ok(());
        }
        if self.shape.dims() != source.shape.dims() {
            return Err(Error::ValidationError(format!(
                "Cannot copy tensor '{}' {:?} into '{}' {:?}",
                source.name, source.shape, self.name, self.shape
            )));
        }

        let src = source.read()?;
        let mut dst = self.write()?;
        match (&mut *dst, &*src) {
            (TensorData::Float32(d), TensorData::Float32(s)) => {
                logical_view_mut(d, &self.shape).assign(&logical_view(s, &source.shape));
            }
            (TensorData::Int32(d), TensorData::Int32(s)) => {
                logical_view_mut(d, &self.shape).assign(&logical_view(s, &source.shape));
            }
            (d, s) => return Err(type_mismatch(d.data_type(), s.data_type())),
        }
        Ok(())
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("name", &self.name)
            .field("shape", &self.shape)
            .field("data_type", &self.data_type())
            .field("dead", &self.is_dead())
            .finish()
    }
}
