//! # Convolution operator
//!
//! A 3-D convolution in the accelerator sense: every output feature map is
//! the correlation of one `[channels, rows, cols]` kernel with the whole
//! input volume.
//!
//! - Input: NCHW `[batch, channels, rows, cols]`
//! - Kernels: `[ofmaps, channels, weight_rows, weight_cols]`, owned by the
//!   operator and registered as `<name>/kernels`
//! - Output: `[batch, ofmaps, out_rows, out_cols]`, registered as `<name>`
//!
//! `Same` padding is realised by copying the input into a zero-padded
//! scratch tensor (`<name>/padded`) before each run, after which the
//! backend performs a valid convolution.

use log::debug;

use crate::backend::{kernels_for, ConvJob};
use crate::error::{Error, Result};
use crate::execution::context::ExecutionContext;
use crate::layout::tensor_layout::{compute_output_dim, TensorShape};
use crate::layout::zeropad::{padded_shape, same_padding_amount, zero_pad_into};
use crate::memory::workspace::Workspace;
use crate::model::{DataLayout, OpType, PaddingType};
use crate::ops::registry::{NodeParams, Operator, OperatorBase};
use crate::ops::tensor::{logical_view4, logical_view4_mut, Tensor, TensorHandle};

/// Convolution operator
///
/// Parameters left unset are stored as zero and make [`Operator::validate`]
/// return `false`.
#[derive(Debug)]
pub struct ConvolutionOp {
    base: OperatorBase,
    weight_rows: usize,
    weight_cols: usize,
    num_ofmaps: usize,
    row_stride: usize,
    col_stride: usize,
    padding: Option<PaddingType>,
    padded: Option<TensorHandle>,
}

impl ConvolutionOp {
    pub const INPUTS: usize = 0;
    pub const KERNELS: usize = 1;
    pub const OUTPUTS: usize = 0;

    pub fn new(
        name: impl Into<String>,
        weight_rows: usize,
        weight_cols: usize,
        num_ofmaps: usize,
        stride: (usize, usize),
        padding: PaddingType,
    ) -> Self {
        Self {
            base: OperatorBase::new(name, OpType::Convolution3d, 2, 1),
            weight_rows,
            weight_cols,
            num_ofmaps,
            row_stride: stride.0,
            col_stride: stride.1,
            padding: Some(padding),
            padded: None,
        }
    }

    pub fn create(name: &str, params: &NodeParams) -> Result<Box<dyn Operator>> {
        Ok(Box::new(Self {
            base: OperatorBase::new(name, OpType::Convolution3d, 2, 1),
            weight_rows: params.weight_rows.unwrap_or(0),
            weight_cols: params.weight_cols.unwrap_or(0),
            num_ofmaps: params.num_ofmaps.unwrap_or(0),
            row_stride: params.stride_rows.unwrap_or(0),
            col_stride: params.stride_cols.unwrap_or(0),
            padding: params.padding,
            padded: None,
        }))
    }

    pub fn weights_name(&self) -> String {
        format!("{}/kernels", self.base.name())
    }

    fn padding(&self) -> Result<PaddingType> {
        self.padding.ok_or_else(|| {
            Error::ValidationError(format!("Convolution '{}' has no padding type", self.base.name()))
        })
    }

    /// Zero padding applied on each side of (rows, cols) before the valid
    /// convolution
    pub fn pad_amounts(&self) -> (usize, usize) {
        match self.padding {
            Some(PaddingType::Same) => (
                same_padding_amount(self.weight_rows),
                same_padding_amount(self.weight_cols),
            ),
            _ => (0, 0),
        }
    }

    /// The zero-padded scratch copy of the input, once created
    pub fn padded_input(&self) -> Option<&TensorHandle> {
        self.padded.as_ref()
    }

    pub fn infer_weights_shape(&self) -> Result<TensorShape> {
        let input = self.base.input(Self::INPUTS)?.shape();
        let channels = input.dim(input.channel_index()?);
        let dims = match input.layout() {
            DataLayout::NHWC => [self.num_ofmaps, self.weight_rows, self.weight_cols, channels],
            _ => [self.num_ofmaps, channels, self.weight_rows, self.weight_cols],
        };
        Ok(TensorShape::new(&dims, input.layout(), self.base.backend().alignment()))
    }
}

impl Operator for ConvolutionOp {
    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    fn validate(&self) -> bool {
        self.weight_rows > 0
            && self.weight_cols > 0
            && self.num_ofmaps > 0
            && self.row_stride > 0
            && self.col_stride > 0
            && self.padding.is_some()
            && self.base.is_known_type()
    }

    fn infer_output_shape(&self) -> Result<TensorShape> {
        let input = self.base.input(Self::INPUTS)?.shape();
        let (row_idx, col_idx) = input.spatial_indices()?;
        let padding = self.padding()?;

        let rows = compute_output_dim(input.dim(row_idx), self.weight_rows, self.row_stride, padding)?;
        let cols = compute_output_dim(input.dim(col_idx), self.weight_cols, self.col_stride, padding)?;
        let batch = input.dim(0);

        let dims = match input.layout() {
            DataLayout::NHWC => [batch, rows, cols, self.num_ofmaps],
            _ => [batch, self.num_ofmaps, rows, cols],
        };
        Ok(TensorShape::new(&dims, input.layout(), self.base.backend().alignment()))
    }

    fn create_all_tensors(&mut self, workspace: &mut Workspace) -> Result<()> {
        if !self.base.has_input(Self::KERNELS) {
            let shape = self.infer_weights_shape()?;
            let kernels = workspace.add_tensor(Tensor::new(self.weights_name(), shape))?;
            self.base.set_input(Self::KERNELS, kernels)?;
        }

        if !self.base.has_output(Self::OUTPUTS) {
            let shape = self.infer_output_shape()?;
            let output = workspace.add_tensor(Tensor::new(self.base.name(), shape))?;
            self.base.set_output(Self::OUTPUTS, output)?;
        }

        let (pad_rows, pad_cols) = self.pad_amounts();
        if self.padded.is_none() && (pad_rows > 0 || pad_cols > 0) {
            let input = self.base.input(Self::INPUTS)?;
            let shape = padded_shape(input.shape(), pad_rows, pad_cols)?;
            let name = format!("{}/padded", self.base.name());
            let padded = Tensor::with_data_type(name, shape, input.data_type());
            self.padded = Some(workspace.add_tensor(padded)?);
        }

        Ok(())
    }

    fn run(&self, context: &ExecutionContext) -> Result<()> {
        let input = self.base.input(Self::INPUTS)?;
        let kernels = self.base.input(Self::KERNELS)?;
        let output = self.base.output(Self::OUTPUTS)?;

        if input.shape().layout() != DataLayout::NCHW {
            return Err(Error::UnsupportedFeature(format!(
                "Convolution '{}' only runs on NCHW inputs, got {}",
                self.base.name(),
                input.shape().layout()
            )));
        }

        let source = match &self.padded {
            Some(padded) => {
                let (pad_rows, pad_cols) = self.pad_amounts();
                zero_pad_into(input, pad_rows, pad_cols, padded)?;
                padded
            }
            None => input,
        };

        let source_data = source.read()?;
        let kernel_data = kernels.read()?;
        let mut output_data = output.write()?;

        let job = ConvJob {
            input: logical_view4(source_data.as_f32()?, source.shape())?,
            kernels: logical_view4(kernel_data.as_f32()?, kernels.shape())?,
            stride: (self.row_stride, self.col_stride),
        };
        let out_view = logical_view4_mut(output_data.as_f32_mut()?, output.shape())?;

        let backend = kernels_for(self.base.backend());
        let ctx = self.kernel_context(context);
        let report = context.install(|| backend.convolution(&job, out_view, &ctx))?;

        debug!(
            "Convolution '{}' ran {}/{} tiles on {}",
            self.base.name(),
            report.tiles_run,
            report.tiles_total,
            backend.backend()
        );
        self.base.record_tiles(report)
    }

    fn is_sampling_supported(&self) -> bool {
        true
    }

    fn parameterizable_inputs(&self) -> Vec<TensorHandle> {
        self.base.input(Self::KERNELS).map(|k| vec![k.clone()]).unwrap_or_default()
    }
}
