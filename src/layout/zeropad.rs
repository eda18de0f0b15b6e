//! Zero padding of NCHW feature maps.
//!
//! The padded buffer holds the source rows and columns shifted by the pad
//! amounts. Everything else is zero, including the alignment tail of every
//! destination row.

use ndarray::{s, ArrayD, Ix4};
use num_traits::Zero;

use crate::error::{Error, Result};
use crate::layout::tensor_layout::TensorShape;
use crate::model::DataLayout;
use crate::ops::tensor::{Tensor, TensorData};

/// Symmetric pad applied on each side for `Same` padding
pub fn same_padding_amount(kernel: usize) -> usize {
    kernel / 2
}

/// Shape of `source` grown by `2 * pad_rows` rows and `2 * pad_cols` columns
pub fn padded_shape(source: &TensorShape, pad_rows: usize, pad_cols: usize) -> Result<TensorShape> {
    if source.layout() != DataLayout::NCHW || source.ndims() != 4 {
        return Err(Error::UnsupportedFeature(format!(
            "Zero padding is only implemented for 4-D NCHW tensors, got {:?}",
            source
        )));
    }

    let dims = source.dims();
    Ok(TensorShape::new(
        &[dims[0], dims[1], dims[2] + 2 * pad_rows, dims[3] + 2 * pad_cols],
        DataLayout::NCHW,
        source.alignment(),
    ))
}

fn copy_zero_padded<A: Clone + Zero>(
    src: &ArrayD<A>,
    src_shape: &TensorShape,
    pad_rows: usize,
    pad_cols: usize,
    dst: &mut ArrayD<A>,
) -> Result<()> {
    let src = src.view().into_dimensionality::<Ix4>()?;
    let mut dst = dst.view_mut().into_dimensionality::<Ix4>()?;
    let rows = src_shape.dim(2);
    let cols = src_shape.dim(3);

    // Storage views: the destination tail columns are zeroed along with the margins
    dst.fill(A::zero());
    for (mut dst_image, src_image) in dst.outer_iter_mut().zip(src.outer_iter()) {
        for (mut dst_map, src_map) in dst_image.outer_iter_mut().zip(src_image.outer_iter()) {
            dst_map
                .slice_mut(s![pad_rows..pad_rows + rows, pad_cols..pad_cols + cols])
                .assign(&src_map.slice(s![.., ..cols]));
        }
    }
    Ok(())
}

/// Write a zero-padded copy of `source` into an existing tensor
pub fn zero_pad_into(source: &Tensor, pad_rows: usize, pad_cols: usize, dest: &Tensor) -> Result<()> {
    let expected = padded_shape(source.shape(), pad_rows, pad_cols)?;
    if dest.shape().dims() != expected.dims() {
        return Err(Error::ValidationError(format!(
            "Padding destination '{}' has shape {:?}, expected {:?}",
            dest.name(),
            dest.shape(),
            expected
        )));
    }

    let src = source.read()?;
    let mut dst = dest.write()?;
    match (&*src, &mut *dst) {
        (TensorData::Float32(s), TensorData::Float32(d)) => {
            copy_zero_padded(s, source.shape(), pad_rows, pad_cols, d)
        }
        (TensorData::Int32(s), TensorData::Int32(d)) => {
            copy_zero_padded(s, source.shape(), pad_rows, pad_cols, d)
        }
        (s, d) => Err(Error::ValidationError(format!(
            "Cannot pad {:?} tensor '{}' into {:?} tensor '{}'",
            s.data_type(),
            source.name(),
            d.data_type(),
            dest.name()
        ))),
    }
}

/// Produce a new tensor holding `source` with `pad` zeros on every side of
/// each feature map.
pub fn materialize_zero_padding(source: &Tensor, pad: usize, name: impl Into<String>) -> Result<Tensor> {
    let shape = padded_shape(source.shape(), pad, pad)?;
    let padded = Tensor::with_data_type(name, shape, source.data_type());
    zero_pad_into(source, pad, pad, &padded)?;
    Ok(padded)
}
