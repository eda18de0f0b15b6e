use log::trace;

use crate::error::{Error, Result};
use crate::execution::context::ExecutionContext;
use crate::layout::tensor_layout::TensorShape;
use crate::memory::workspace::Workspace;
use crate::model::OpType;
use crate::ops::registry::{NodeParams, Operator, OperatorBase};
use crate::ops::tensor::{Tensor, TensorData};

/// Routes its input to one of two outputs depending on a predicate.
///
/// The output that is not selected is marked dead, so operators fed only by
/// it produce dead values as well.
#[derive(Debug)]
pub struct SwitchOp {
    base: OperatorBase,
}

impl SwitchOp {
    pub const INPUT: usize = 0;
    pub const PREDICATE: usize = 1;
    pub const IF_FALSE: usize = 0;
    pub const IF_TRUE: usize = 1;

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            base: OperatorBase::new(name, OpType::Switch, 2, 2),
        }
    }

    pub fn create(name: &str, _params: &NodeParams) -> Result<Box<dyn Operator>> {
        Ok(Box::new(Self::new(name)))
    }

    /// Current value of the predicate: its first element is non-zero
    pub fn predicate(&self) -> Result<bool> {
        let predicate = self.base.input(Self::PREDICATE)?;
        let data = predicate.read()?;
        let first = match &*data {
            TensorData::Float32(a) => a.iter().next().map(|&v| v != 0.0),
            TensorData::Int32(a) => a.iter().next().map(|&v| v != 0),
        };
        first.ok_or_else(|| {
            Error::ValidationError(format!("Predicate of switch '{}' is empty", self.base.name()))
        })
    }
}

impl Operator for SwitchOp {
    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    fn infer_output_shape(&self) -> Result<TensorShape> {
        Ok(self.base.input(Self::INPUT)?.shape().clone())
    }

    fn create_all_tensors(&mut self, workspace: &mut Workspace) -> Result<()> {
        let data_type = self.base.input(Self::INPUT)?.data_type();
        for (slot, suffix) in [(Self::IF_FALSE, "false"), (Self::IF_TRUE, "true")] {
            if !self.base.has_output(slot) {
                let name = format!("{}/{}", self.base.name(), suffix);
                let tensor = Tensor::with_data_type(name, self.infer_output_shape()?, data_type);
                let handle = workspace.add_tensor(tensor)?;
                self.base.set_output(slot, handle)?;
            }
        }
        Ok(())
    }

    fn run(&self, _context: &ExecutionContext) -> Result<()> {
        let input = self.base.input(Self::INPUT)?;
        let taken = if self.predicate()? { Self::IF_TRUE } else { Self::IF_FALSE };
        trace!("Switch '{}' forwards to output {}", self.base.name(), taken);
        self.base.output(taken)?.copy_from(input)
    }

    fn propagate_dead(&self) -> Result<()> {
        let if_false = self.base.output(Self::IF_FALSE)?;
        let if_true = self.base.output(Self::IF_TRUE)?;
        if self.is_dead() {
            if_false.set_dead(true);
            if_true.set_dead(true);
            return Ok(());
        }

        let taken = self.predicate()?;
        if_false.set_dead(taken);
        if_true.set_dead(!taken);
        Ok(())
    }
}

/// Forwards the first live input. A merge is never dead.
#[derive(Debug)]
pub struct MergeOp {
    base: OperatorBase,
}

impl MergeOp {
    pub const OUTPUTS: usize = 0;

    pub fn new(name: impl Into<String>, num_inputs: usize) -> Self {
        Self {
            base: OperatorBase::new(name, OpType::Merge, num_inputs, 1),
        }
    }

    pub fn create(name: &str, params: &NodeParams) -> Result<Box<dyn Operator>> {
        Ok(Box::new(Self::new(name, params.num_inputs.unwrap_or(2))))
    }
}

impl Operator for MergeOp {
    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    fn validate(&self) -> bool {
        !self.base.inputs().is_empty() && self.base.is_known_type()
    }

    fn infer_output_shape(&self) -> Result<TensorShape> {
        Ok(self.base.input(0)?.shape().clone())
    }

    fn create_all_tensors(&mut self, workspace: &mut Workspace) -> Result<()> {
        if self.base.has_output(Self::OUTPUTS) {
            return Ok(());
        }
        let data_type = self.base.input(0)?.data_type();
        let tensor = Tensor::with_data_type(self.base.name(), self.infer_output_shape()?, data_type);
        let output = workspace.add_tensor(tensor)?;
        self.base.set_output(Self::OUTPUTS, output)
    }

    fn run(&self, _context: &ExecutionContext) -> Result<()> {
        let output = self.base.output(Self::OUTPUTS)?;
        match self.base.inputs().iter().flatten().find(|t| !t.is_dead()) {
            Some(live) => {
                trace!("Merge '{}' forwards '{}'", self.base.name(), live.name());
                output.copy_from(live)
            }
            None => {
                trace!("Merge '{}' has no live input", self.base.name());
                Ok(())
            }
        }
    }

    fn is_dead(&self) -> bool {
        false
    }
}
