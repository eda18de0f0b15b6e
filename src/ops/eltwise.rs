use std::sync::Arc;

use crate::backend::{kernels_for, EltwiseKind};
use crate::error::{Error, Result};
use crate::execution::context::ExecutionContext;
use crate::layout::tensor_layout::TensorShape;
use crate::memory::workspace::Workspace;
use crate::model::OpType;
use crate::ops::registry::{NodeParams, Operator, OperatorBase};
use crate::ops::tensor::{logical_view, logical_view_mut, Tensor};

/// Elementwise binary operator over two tensors of identical dimensions
#[derive(Debug)]
pub struct EltwiseOp {
    base: OperatorBase,
    kind: EltwiseKind,
}

impl EltwiseOp {
    pub const OUTPUTS: usize = 0;

    pub fn new(name: impl Into<String>, kind: EltwiseKind) -> Self {
        let op_type = match kind {
            EltwiseKind::Add => OpType::EltwiseAdd,
            EltwiseKind::Mul => OpType::EltwiseMul,
        };
        Self {
            base: OperatorBase::new(name, op_type, 2, 1),
            kind,
        }
    }

    pub fn create_add(name: &str, _params: &NodeParams) -> Result<Box<dyn Operator>> {
        Ok(Box::new(Self::new(name, EltwiseKind::Add)))
    }

    pub fn create_mul(name: &str, _params: &NodeParams) -> Result<Box<dyn Operator>> {
        Ok(Box::new(Self::new(name, EltwiseKind::Mul)))
    }
}

impl Operator for EltwiseOp {
    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    fn infer_output_shape(&self) -> Result<TensorShape> {
        let shape = self.base.input(0)?.shape();
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
        let a = self.base.input(0)?;
        let b = self.base.input(1)?;
        let output = self.base.output(Self::OUTPUTS)?;
        if a.shape().dims() != b.shape().dims() {
            return Err(Error::ValidationError(format!(
                "'{}' inputs differ: {:?} vs {:?}",
                self.base.name(),
                a.shape(),
                b.shape()
            )));
        }

        // Both inputs may be the same tensor; lock it once
        let a_data = a.read()?;
        let b_guard = if Arc::ptr_eq(a, b) { None } else { Some(b.read()?) };
        let b_data = b_guard.as_deref().unwrap_or(&*a_data);
        let mut out_data = output.write()?;

        let a_view = logical_view(a_data.as_f32()?, a.shape());
        let b_view = logical_view(b_data.as_f32()?, b.shape());
        let out_view = logical_view_mut(out_data.as_f32_mut()?, output.shape());

        let backend = kernels_for(self.base.backend());
        let ctx = self.kernel_context(context);
        let kind = self.kind;
        let report = context.install(move || backend.eltwise(kind, a_view, b_view, out_view, &ctx))?;
        self.base.record_tiles(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DataLayout;

    #[test]
    fn test_add_and_mul() {
        let mut workspace = Workspace::new();
        let shape = TensorShape::new(&[1, 1, 1, 3], DataLayout::NCHW, 0);
        let a = workspace
            .add_tensor(Tensor::from_values("a", shape.clone(), &[1.0, 2.0, 3.0]).unwrap())
            .unwrap();
        let b = workspace
            .add_tensor(Tensor::from_values("b", shape, &[4.0, 5.0, 6.0]).unwrap())
            .unwrap();

        for (kind, expected) in [
            (EltwiseKind::Add, vec![5.0, 7.0, 9.0]),
            (EltwiseKind::Mul, vec![4.0, 10.0, 18.0]),
        ] {
            let mut op = EltwiseOp::new(format!("{:?}", kind), kind);
            op.base_mut().set_input(0, a.clone()).unwrap();
            op.base_mut().set_input(1, b.clone()).unwrap();
            op.create_all_tensors(&mut workspace).unwrap();
            op.run(&ExecutionContext::default()).unwrap();
            assert_eq!(op.base().output(0).unwrap().logical_values().unwrap(), expected);
        }
    }

    #[test]
    fn test_same_tensor_twice() {
        let mut workspace = Workspace::new();
        let a = workspace
            .add_tensor(Tensor::from_values("a", TensorShape::new(&[2], DataLayout::X, 0), &[3.0, -1.0]).unwrap())
            .unwrap();
        let mut op = EltwiseOp::new("square", EltwiseKind::Mul);
        op.base_mut().set_input(0, a.clone()).unwrap();
        op.base_mut().set_input(1, a).unwrap();
        op.create_all_tensors(&mut workspace).unwrap();
        op.run(&ExecutionContext::default()).unwrap();
        assert_eq!(op.base().output(0).unwrap().logical_values().unwrap(), vec![9.0, 1.0]);
    }
}
