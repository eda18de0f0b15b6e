use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{DataLayout, DataType, PaddingType};

/// The shape of a tensor together with its layout tag and the alignment
/// its backend requires.
///
/// The innermost dimension is padded in storage so that it becomes a
/// multiple of the alignment. Logical indexing never sees that padding.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorShape {
    dims: Vec<usize>,
    layout: DataLayout,
    alignment: usize,
    padding: usize,
}

/// Elements needed to round `value` up to a multiple of `alignment`
pub fn calc_padding(value: usize, alignment: usize) -> usize {
    if alignment == 0 || value % alignment == 0 {
        0
    } else {
        alignment - value % alignment
    }
}

impl TensorShape {
    /// Create a new shape. `alignment` of 0 means no alignment requirement.
    pub fn new(dims: &[usize], layout: DataLayout, alignment: usize) -> Self {
        let padding = dims.last().map(|&d| calc_padding(d, alignment)).unwrap_or(0);
        Self {
            dims: dims.to_vec(),
            layout,
            alignment,
            padding,
        }
    }

    /// Same dimensions and layout under a different alignment
    pub fn with_alignment(&self, alignment: usize) -> Self {
        Self::new(&self.dims, self.layout, alignment)
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn dim(&self, index: usize) -> usize {
        self.dims.get(index).copied().unwrap_or(0)
    }

    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    pub fn layout(&self) -> DataLayout {
        self.layout
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Extra elements appended to the innermost dimension in storage
    pub fn padding(&self) -> usize {
        self.padding
    }

    /// Dimensions of the backing buffer, innermost one padded
    pub fn storage_dims(&self) -> Vec<usize> {
        let mut dims = self.dims.clone();
        if let Some(last) = dims.last_mut() {
            *last += self.padding;
        }
        dims
    }

    /// Number of logical elements
    pub fn logical_size(&self) -> usize {
        self.dims.iter().product()
    }

    /// Number of elements in the backing buffer, padding included
    pub fn storage_size(&self) -> usize {
        self.storage_dims().iter().product()
    }

    pub fn size_in_bytes(&self, data_type: DataType) -> usize {
        self.storage_size() * data_type.size_in_bytes()
    }

    /// Two shapes are layout-compatible when they carry the same layout tag
    pub fn is_layout_compatible(&self, other: &TensorShape) -> bool {
        self.layout == other.layout
    }

    /// Indices of the (rows, cols) dimensions for 4-D image layouts
    pub fn spatial_indices(&self) -> Result<(usize, usize)> {
        match (self.layout, self.dims.len()) {
            (DataLayout::NCHW, 4) => Ok((2, 3)),
            (DataLayout::NHWC, 4) => Ok((1, 2)),
            _ => Err(Error::UnsupportedFeature(format!(
                "Shape {:?} has no spatial dimensions",
                self
            ))),
        }
    }

    /// Index of the channel dimension for 4-D image layouts
    pub fn channel_index(&self) -> Result<usize> {
        match (self.layout, self.dims.len()) {
            (DataLayout::NCHW, 4) => Ok(1),
            (DataLayout::NHWC, 4) => Ok(3),
            _ => Err(Error::UnsupportedFeature(format!(
                "Shape {:?} has no channel dimension",
                self
            ))),
        }
    }
}

impl fmt::Debug for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}", self.dims, self.layout)?;
        if self.alignment > 0 {
            write!(f, " align={} pad={}", self.alignment, self.padding)?;
        }
        Ok(())
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Output size along one spatial dimension of a windowed operator.
///
/// `Valid` gives `(input - kernel) / stride + 1`; `Same` pads by
/// `kernel - 1` first.
pub fn compute_output_dim(
    input: usize,
    kernel: usize,
    stride: usize,
    padding: PaddingType,
) -> Result<usize> {
    if stride == 0 {
        return Err(Error::ValidationError("Stride must be positive".to_string()));
    }
    if kernel == 0 {
        return Err(Error::ValidationError("Kernel size must be positive".to_string()));
    }

    let padded = match padding {
        PaddingType::Valid => {
            if kernel > input {
                return Err(Error::ValidationError(format!(
                    "Kernel size {} exceeds input size {} without padding",
                    kernel, input
                )));
            }
            input - kernel
        }
        PaddingType::Same => {
            if input == 0 {
                return Err(Error::ValidationError("Input size must be positive".to_string()));
            }
            input + kernel - 1 - kernel
        }
    };

    Ok(padded / stride + 1)
}
