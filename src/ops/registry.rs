use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::backend::{BackendConfig, BackendType, KernelContext};
use crate::error::{Error, Result};
use crate::execution::context::ExecutionContext;
use crate::layout::tensor_layout::TensorShape;
use crate::memory::workspace::Workspace;
use crate::model::{DataLayout, DataType, MemoryAssignment, OpType, PaddingType, SamplingInfo, TileReport};
use crate::ops::tensor::TensorHandle;

/// Lifecycle of an operator within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpState {
    Pending = 0,
    Ready = 1,
    Running = 2,
    Done = 3,
}

impl OpState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => OpState::Ready,
            2 => OpState::Running,
            3 => OpState::Done,
            _ => OpState::Pending,
        }
    }
}

/// Where an operator runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendAssignment {
    pub backend: BackendType,
    /// Instance index; out-of-range values resolve to instance 0
    pub instance: i64,
    pub num_cores: usize,
}

impl Default for BackendAssignment {
    fn default() -> Self {
        Self {
            backend: BackendType::Reference,
            instance: 0,
            num_cores: 1,
        }
    }
}

/// Construction parameters of an operator. Unused fields are ignored by
/// operators that do not need them; missing required ones make the
/// operator fail validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeParams {
    pub weight_rows: Option<usize>,
    pub weight_cols: Option<usize>,
    pub num_ofmaps: Option<usize>,
    pub pool_rows: Option<usize>,
    pub pool_cols: Option<usize>,
    pub stride_rows: Option<usize>,
    pub stride_cols: Option<usize>,
    pub padding: Option<PaddingType>,
    /// Shape of the tensor exposed by a data operator
    pub shape: Option<Vec<usize>>,
    pub layout: Option<DataLayout>,
    pub data_type: Option<DataType>,
    /// Number of inputs of a merge operator
    pub num_inputs: Option<usize>,
}

/// State shared by every operator: identity, tensor slots, scheduling
/// bookkeeping and backend placement.
#[derive(Debug)]
pub struct OperatorBase {
    name: String,
    op_type: OpType,
    inputs: Vec<Option<TensorHandle>>,
    outputs: Vec<Option<TensorHandle>>,
    assignment: BackendAssignment,
    memory: MemoryAssignment,
    resources: BackendConfig,
    sampling: Option<SamplingInfo>,
    pending_inputs: AtomicUsize,
    state: AtomicU8,
    tiles: Mutex<TileReport>,
}

impl OperatorBase {
    pub fn new(name: impl Into<String>, op_type: OpType, num_inputs: usize, num_outputs: usize) -> Self {
        let assignment = BackendAssignment::default();
        Self {
            name: name.into(),
            op_type,
            inputs: vec![None; num_inputs],
            outputs: vec![None; num_outputs],
            memory: MemoryAssignment::default_for(assignment.backend),
            resources: BackendConfig::default_for(assignment.backend),
            assignment,
            sampling: None,
            pending_inputs: AtomicUsize::new(0),
            state: AtomicU8::new(OpState::Pending as u8),
            tiles: Mutex::new(TileReport::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn op_type(&self) -> OpType {
        self.op_type
    }

    /// Base validity: the operator type is known
    pub fn is_known_type(&self) -> bool {
        self.op_type != OpType::Unknown
    }

    pub fn inputs(&self) -> &[Option<TensorHandle>] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Option<TensorHandle>] {
        &self.outputs
    }

    /// Tensor bound to an input slot
    pub fn input(&self, index: usize) -> Result<&TensorHandle> {
        self.inputs.get(index).and_then(|t| t.as_ref()).ok_or_else(|| {
            Error::InvalidOperator(format!("Operator '{}' has no tensor at input {}", self.name, index))
        })
    }

    /// Tensor bound to an output slot
    pub fn output(&self, index: usize) -> Result<&TensorHandle> {
        self.outputs.get(index).and_then(|t| t.as_ref()).ok_or_else(|| {
            Error::InvalidOperator(format!("Operator '{}' has no tensor at output {}", self.name, index))
        })
    }

    pub fn has_input(&self, index: usize) -> bool {
        matches!(self.inputs.get(index), Some(Some(_)))
    }

    pub fn has_output(&self, index: usize) -> bool {
        matches!(self.outputs.get(index), Some(Some(_)))
    }

    pub fn set_input(&mut self, index: usize, tensor: TensorHandle) -> Result<()> {
        let slots = self.inputs.len();
        let slot = self.inputs.get_mut(index).ok_or_else(|| {
            Error::InvalidOperator(format!(
                "Operator '{}' has {} input slots, cannot bind slot {}",
                self.name, slots, index
            ))
        })?;
        *slot = Some(tensor);
        Ok(())
    }

    pub fn set_output(&mut self, index: usize, tensor: TensorHandle) -> Result<()> {
        let slots = self.outputs.len();
        let slot = self.outputs.get_mut(index).ok_or_else(|| {
            Error::InvalidOperator(format!(
                "Operator '{}' has {} output slots, cannot bind slot {}",
                self.name, slots, index
            ))
        })?;
        *slot = Some(tensor);
        Ok(())
    }

    pub fn assignment(&self) -> BackendAssignment {
        self.assignment
    }

    pub fn backend(&self) -> BackendType {
        self.assignment.backend
    }

    pub fn set_backend(&mut self, assignment: BackendAssignment) {
        self.assignment = assignment;
    }

    pub fn memory(&self) -> MemoryAssignment {
        self.memory
    }

    pub fn set_memory(&mut self, memory: MemoryAssignment) {
        self.memory = memory;
    }

    /// Resources recorded when the operator was placed
    pub fn resources(&self) -> BackendConfig {
        self.resources
    }

    pub fn annotate(&mut self, resources: BackendConfig) {
        self.resources = resources;
    }

    pub fn sampling(&self) -> Option<SamplingInfo> {
        self.sampling
    }

    pub fn set_sampling(&mut self, sampling: SamplingInfo) {
        self.sampling = Some(sampling);
    }

    pub fn num_pending_inputs(&self) -> usize {
        self.pending_inputs.load(Ordering::Acquire)
    }

    /// Decrement the pending count and return how many inputs remain.
    ///
    /// Exactly one caller observes the transition to zero.
    pub fn decr_num_pending_inputs(&self) -> Result<usize> {
        self.pending_inputs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map(|previous| previous - 1)
            .map_err(|_| {
                Error::ExecutionError(format!(
                    "Operator '{}' was notified more often than it has inputs",
                    self.name
                ))
            })
    }

    pub fn state(&self) -> OpState {
        OpState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`; fails if another thread got there first
    pub fn transition(&self, from: OpState, to: OpState) -> Result<()> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| {
                Error::ExecutionError(format!(
                    "Operator '{}' cannot move from {:?} to {:?}: it is {:?}",
                    self.name,
                    from,
                    to,
                    OpState::from_u8(actual)
                ))
            })
    }

    pub(crate) fn reset_schedule(&self, pending: usize) {
        self.pending_inputs.store(pending, Ordering::Release);
        self.state.store(OpState::Pending as u8, Ordering::Release);
    }

    pub fn record_tiles(&self, report: TileReport) -> Result<()> {
        let mut tiles = self.tiles.lock().map_err(|_| {
            Error::ExecutionError(format!("Failed to acquire tile report lock of '{}'", self.name))
        })?;
        *tiles = report;
        Ok(())
    }

    pub fn tile_report(&self) -> TileReport {
        match self.tiles.lock() {
            Ok(tiles) => *tiles,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// An operator of the dataflow network
pub trait Operator: Send + Sync + Debug {
    fn base(&self) -> &OperatorBase;

    fn base_mut(&mut self) -> &mut OperatorBase;

    fn name(&self) -> &str {
        self.base().name()
    }

    fn op_type(&self) -> OpType {
        self.base().op_type()
    }

    /// Check parameters. Missing or inconsistent parameters yield `false`.
    fn validate(&self) -> bool {
        self.base().is_known_type()
    }

    /// Shape of the primary output, derived from the bound inputs and the
    /// operator's parameters
    fn infer_output_shape(&self) -> Result<TensorShape>;

    /// Create every tensor the operator owns and bind it to its slot.
    /// Slots that are already bound are left alone.
    fn create_all_tensors(&mut self, workspace: &mut Workspace) -> Result<()>;

    /// Execute on the assigned backend. Runs regardless of dead inputs.
    fn run(&self, context: &ExecutionContext) -> Result<()>;

    /// Whether the values this operator produces are dead
    fn is_dead(&self) -> bool {
        self.base().inputs().iter().flatten().any(|t| t.is_dead())
    }

    /// Record the dead status on the output tensors
    fn propagate_dead(&self) -> Result<()> {
        let dead = self.is_dead();
        for output in self.base().outputs().iter().flatten() {
            output.set_dead(dead);
        }
        Ok(())
    }

    fn is_sampling_supported(&self) -> bool {
        false
    }

    fn set_sampling_info(&mut self, sampling: SamplingInfo) {
        if self.is_sampling_supported() {
            self.base_mut().set_sampling(sampling);
        }
    }

    /// Inputs holding trained parameters
    fn parameterizable_inputs(&self) -> Vec<TensorHandle> {
        Vec::new()
    }

    fn num_parameters(&self) -> usize {
        self.parameterizable_inputs()
            .iter()
            .map(|t| t.shape().logical_size())
            .sum()
    }

    /// Bytes this operator keeps in its backend's local memory during one
    /// run. Tensor groups routed through the cache are not counted.
    fn local_footprint_bytes(&self) -> usize {
        let base = self.base();
        let memory = base.memory();
        let weights = self.parameterizable_inputs();
        let inputs: usize = base
            .inputs()
            .iter()
            .flatten()
            .map(|t| {
                let routing = if weights.iter().any(|w| Arc::ptr_eq(w, t)) {
                    memory.weights
                } else {
                    memory.inputs
                };
                if routing.uses_local_memory() {
                    t.size_in_bytes()
                } else {
                    0
                }
            })
            .sum();
        let outputs: usize = if memory.outputs.uses_local_memory() {
            base.outputs().iter().flatten().map(|t| t.size_in_bytes()).sum()
        } else {
            0
        };
        inputs + outputs
    }

    /// Kernel parameters for one dispatch
    fn kernel_context(&self, context: &ExecutionContext) -> KernelContext {
        let base = self.base();
        let assignment = base.assignment();
        let sampling = if self.is_sampling_supported() {
            base.sampling().unwrap_or_else(|| context.options().sampling)
        } else {
            SamplingInfo::default()
        };
        KernelContext {
            resources: context.resources().lookup(assignment.backend, assignment.instance),
            num_cores: assignment.num_cores,
            memory: base.memory(),
            sampling,
        }
    }
}

/// Constructor of an operator from its name and parameters
pub type OperatorConstructor = fn(&str, &NodeParams) -> Result<Box<dyn Operator>>;

/// Maps operator types onto constructors
#[derive(Default)]
pub struct OperatorRegistry {
    constructors: HashMap<OpType, OperatorConstructor>,
}

impl Debug for OperatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.constructors.keys()).finish()
    }
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    pub fn register_operator(&mut self, op_type: OpType, constructor: OperatorConstructor) -> Result<()> {
        if self.constructors.contains_key(&op_type) {
            return Err(Error::InvalidOperator(format!(
                "Operator {} is already registered",
                op_type
            )));
        }

        self.constructors.insert(op_type, constructor);
        Ok(())
    }

    pub fn is_registered(&self, op_type: OpType) -> bool {
        self.constructors.contains_key(&op_type)
    }

    /// Registry with every built-in operator
    pub fn initialize_standard_operators() -> Self {
        use crate::ops::activations::ActivationOp;
        use crate::ops::control_flow::{MergeOp, SwitchOp};
        use crate::ops::data::DataOp;
        use crate::ops::eltwise::EltwiseOp;
        use crate::ops::nn::conv::ConvolutionOp;
        use crate::ops::nn::pool::PoolingOp;

        let standard: [(OpType, OperatorConstructor); 11] = [
            (OpType::Data, DataOp::create),
            (OpType::Convolution3d, ConvolutionOp::create),
            (OpType::MaxPooling, PoolingOp::create_max),
            (OpType::AveragePooling, PoolingOp::create_average),
            (OpType::EltwiseAdd, EltwiseOp::create_add),
            (OpType::EltwiseMul, EltwiseOp::create_mul),
            (OpType::ReLU, ActivationOp::create_relu),
            (OpType::Sigmoid, ActivationOp::create_sigmoid),
            (OpType::Tanh, ActivationOp::create_tanh),
            (OpType::Switch, SwitchOp::create),
            (OpType::Merge, MergeOp::create),
        ];

        Self {
            constructors: standard.into_iter().collect(),
        }
    }

    pub fn create_operator(&self, op_type: OpType, name: &str, params: &NodeParams) -> Result<Box<dyn Operator>> {
        let constructor = self.constructors.get(&op_type).ok_or_else(|| {
            Error::InvalidOperator(format!(
                "No operator registered for type {} (node '{}')",
                op_type, name
            ))
        })?;
        constructor(name, params)
    }
}
