use crate::backend::kernels_for;
use crate::error::Result;
use crate::execution::context::ExecutionContext;
use crate::layout::tensor_layout::TensorShape;
use crate::memory::workspace::Workspace;
use crate::model::OpType;
use crate::ops::registry::{NodeParams, Operator, OperatorBase};
use crate::ops::tensor::{logical_view, logical_view_mut, Tensor};

/// ReLU activation function
pub fn relu(x: f32) -> f32 {
    if x > 0.0 { x } else { 0.0 }
}

/// Sigmoid activation function
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Tanh activation function
pub fn tanh(x: f32) -> f32 {
    x.tanh()
}

/// Unary activation operator; the function is fixed by the operator type
#[derive(Debug)]
pub struct ActivationOp {
    base: OperatorBase,
    activation_fn: fn(f32) -> f32,
}

impl ActivationOp {
    pub const INPUTS: usize = 0;
    pub const OUTPUTS: usize = 0;

    fn new(name: &str, op_type: OpType, activation_fn: fn(f32) -> f32) -> Self {
        Self {
            base: OperatorBase::new(name, op_type, 1, 1),
            activation_fn,
        }
    }

    pub fn relu(name: &str) -> Self {
        Self::new(name, OpType::ReLU, relu)
    }

    pub fn sigmoid(name: &str) -> Self {
        Self::new(name, OpType::Sigmoid, sigmoid)
    }

    pub fn tanh(name: &str) -> Self {
        Self::new(name, OpType::Tanh, tanh)
    }

    pub fn create_relu(name: &str, _params: &NodeParams) -> Result<Box<dyn Operator>> {
        Ok(Box::new(Self::relu(name)))
    }

    pub fn create_sigmoid(name: &str, _params: &NodeParams) -> Result<Box<dyn Operator>> {
        Ok(Box::new(Self::sigmoid(name)))
    }

    pub fn create_tanh(name: &str, _params: &NodeParams) -> Result<Box<dyn Operator>> {
        Ok(Box::new(Self::tanh(name)))
    }
}

impl Operator for ActivationOp {
    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    fn infer_output_shape(&self) -> Result<TensorShape> {
        // Activation functions preserve input shape
        let shape = self.base.input(Self::INPUTS)?.shape();
        Ok(shape.with_alignment(self.base.backend().alignment()))
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

        let input_data = input.read()?;
        let mut output_data = output.write()?;
        let in_view = logical_view(input_data.as_f32()?, input.shape());
        let out_view = logical_view_mut(output_data.as_f32_mut()?, output.shape());

        let backend = kernels_for(self.base.backend());
        let ctx = self.kernel_context(context);
        let activation_fn = self.activation_fn;
        let report = context.install(move || backend.activation(activation_fn, in_view, out_view, &ctx))?;
        self.base.record_tiles(report)
    }
}
