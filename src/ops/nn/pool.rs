use log::debug;

use crate::backend::{kernels_for, PoolJob, PoolKind};
use crate::error::{Error, Result};
use crate::execution::context::ExecutionContext;
use crate::layout::tensor_layout::{compute_output_dim, TensorShape};
use crate::memory::workspace::Workspace;
use crate::model::{DataLayout, OpType, PaddingType};
use crate::ops::registry::{NodeParams, Operator, OperatorBase};
use crate::ops::tensor::{logical_view4, logical_view4_mut, Tensor};

/// Max or average pooling over NCHW feature maps, without padding
#[derive(Debug)]
pub struct PoolingOp {
    base: OperatorBase,
    kind: PoolKind,
    pool_rows: usize,
    pool_cols: usize,
    row_stride: usize,
    col_stride: usize,
}

impl PoolingOp {
    pub const INPUTS: usize = 0;
    pub const OUTPUTS: usize = 0;

    pub fn new(
        name: impl Into<String>,
        kind: PoolKind,
        window: (usize, usize),
        stride: (usize, usize),
    ) -> Self {
        let op_type = match kind {
            PoolKind::Max => OpType::MaxPooling,
            PoolKind::Average => OpType::AveragePooling,
        };
        Self {
            base: OperatorBase::new(name, op_type, 1, 1),
            kind,
            pool_rows: window.0,
            pool_cols: window.1,
            row_stride: stride.0,
            col_stride: stride.1,
        }
    }

    fn from_params(name: &str, kind: PoolKind, params: &NodeParams) -> Self {
        Self::new(
            name,
            kind,
            (params.pool_rows.unwrap_or(0), params.pool_cols.unwrap_or(0)),
            (params.stride_rows.unwrap_or(0), params.stride_cols.unwrap_or(0)),
        )
    }

    pub fn create_max(name: &str, params: &NodeParams) -> Result<Box<dyn Operator>> {
        Ok(Box::new(Self::from_params(name, PoolKind::Max, params)))
    }

    pub fn create_average(name: &str, params: &NodeParams) -> Result<Box<dyn Operator>> {
        Ok(Box::new(Self::from_params(name, PoolKind::Average, params)))
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }
}

impl Operator for PoolingOp {
    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    fn validate(&self) -> bool {
        self.pool_rows > 0
            && self.pool_cols > 0
            && self.row_stride > 0
            && self.col_stride > 0
            && self.base.is_known_type()
    }

    fn infer_output_shape(&self) -> Result<TensorShape> {
        let input = self.base.input(Self::INPUTS)?.shape();
        let (row_idx, col_idx) = input.spatial_indices()?;
        let rows = compute_output_dim(input.dim(row_idx), self.pool_rows, self.row_stride, PaddingType::Valid)?;
        let cols = compute_output_dim(input.dim(col_idx), self.pool_cols, self.col_stride, PaddingType::Valid)?;
        let channels = input.dim(input.channel_index()?);

        let dims = match input.layout() {
            DataLayout::NHWC => [input.dim(0), rows, cols, channels],
            _ => [input.dim(0), channels, rows, cols],
        };
        Ok(TensorShape::new(&dims, input.layout(), self.base.backend().alignment()))
    }

    fn create_all_tensors(&mut self, workspace: &mut Workspace) -> Result<()> {
        if self.base.has_output(Self::OUTPUTS) {
            return Ok(());
        }
        let shape = self.infer_output_shape()?;
        let output = workspace.add_tensor(Tensor::new(self.base.name(), shape))?;
        self.base.set_output(Self::OUTPUTS, output)
    }

    fn run(&self, context: &ExecutionContext) -> Result<()> {
        let input = self.base.input(Self::INPUTS)?;
        let output = self.base.output(Self::OUTPUTS)?;
        if input.shape().layout() != DataLayout::NCHW {
            return Err(Error::UnsupportedFeature(format!(
                "Pooling '{}' only runs on NCHW inputs",
                self.base.name()
            )));
        }

        let input_data = input.read()?;
        let mut output_data = output.write()?;
        let job = PoolJob {
            input: logical_view4(input_data.as_f32()?, input.shape())?,
            kind: self.kind,
            window: (self.pool_rows, self.pool_cols),
            stride: (self.row_stride, self.col_stride),
        };
        let out_view = logical_view4_mut(output_data.as_f32_mut()?, output.shape())?;

        let backend = kernels_for(self.base.backend());
        let ctx = self.kernel_context(context);
        let report = backend.pooling(&job, out_view, &ctx)?;
        debug!(
            "{:?} pooling '{}' ran {}/{} feature maps",
            self.kind,
            self.base.name(),
            report.tiles_run,
            report.tiles_total
        );
        self.base.record_tiles(report)
    }

    fn is_sampling_supported(&self) -> bool {
        true
    }
}
