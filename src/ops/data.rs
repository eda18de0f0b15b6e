use log::trace;

use crate::error::{Error, Result};
use crate::execution::context::ExecutionContext;
use crate::layout::tensor_layout::TensorShape;
use crate::memory::workspace::Workspace;
use crate::model::{DataLayout, DataType, OpType};
use crate::ops::registry::{NodeParams, Operator, OperatorBase};
use crate::ops::tensor::{Tensor, TensorHandle};

/// Exposes an externally supplied tensor to the network
#[derive(Debug)]
pub struct DataOp {
    base: OperatorBase,
    shape: Option<Vec<usize>>,
    layout: DataLayout,
    data_type: DataType,
}

impl DataOp {
    pub const OUTPUT: usize = 0;

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            base: OperatorBase::new(name, OpType::Data, 0, 1),
            shape: None,
            layout: DataLayout::NCHW,
            data_type: DataType::Float32,
        }
    }

    /// Data operator whose output tensor will be created from `shape`
    pub fn with_shape(name: impl Into<String>, shape: &[usize], layout: DataLayout) -> Self {
        let mut op = Self::new(name);
        op.shape = Some(shape.to_vec());
        op.layout = layout;
        op
    }

    /// Data operator exposing an existing tensor
    pub fn with_tensor(name: impl Into<String>, tensor: TensorHandle) -> Result<Self> {
        let mut op = Self::new(name);
        op.shape = Some(tensor.shape().dims().to_vec());
        op.layout = tensor.shape().layout();
        op.data_type = tensor.data_type();
        op.base.set_output(Self::OUTPUT, tensor)?;
        Ok(op)
    }

    pub fn create(name: &str, params: &NodeParams) -> Result<Box<dyn Operator>> {
        let mut op = Self::new(name);
        op.shape = params.shape.clone();
        op.layout = params.layout.unwrap_or(DataLayout::NCHW);
        op.data_type = params.data_type.unwrap_or(DataType::Float32);
        Ok(Box::new(op))
    }
}

impl Operator for DataOp {
    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    fn validate(&self) -> bool {
        let has_shape = match &self.shape {
            Some(dims) => !dims.is_empty() && dims.iter().all(|&d| d > 0),
            None => self.base.has_output(Self::OUTPUT),
        };
        has_shape && self.base.is_known_type()
    }

    fn infer_output_shape(&self) -> Result<TensorShape> {
        if let Ok(tensor) = self.base.output(Self::OUTPUT) {
            return Ok(tensor.shape().clone());
        }
        let dims = self.shape.as_ref().ok_or_else(|| {
            Error::ValidationError(format!("Data operator '{}' has no shape", self.base.name()))
        })?;
        Ok(TensorShape::new(dims, self.layout, self.base.backend().alignment()))
    }

    fn create_all_tensors(&mut self, workspace: &mut Workspace) -> Result<()> {
        if self.base.has_output(Self::OUTPUT) {
            return Ok(());
        }
        let shape = self.infer_output_shape()?;
        let tensor = Tensor::with_data_type(self.base.name(), shape, self.data_type);
        let handle = workspace.add_tensor(tensor)?;
        self.base.set_output(Self::OUTPUT, handle)
    }

    fn run(&self, _context: &ExecutionContext) -> Result<()> {
        trace!("Data operator '{}' has nothing to compute", self.base.name());
        Ok(())
    }
}
