use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use crate::backend::BackendType;
use crate::error::{Error, Result};
use crate::ops::registry::{OpState, Operator};

/// Index of an operator inside a [`Network`]
pub type NodeId = usize;

/// Element type of a tensor buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
pub enum DataType {
    #[strum(serialize = "float")]
    Float32,
    #[strum(serialize = "int")]
    Int32,
}

impl Default for DataType {
    fn default() -> Self {
        DataType::Float32
    }
}

impl DataType {
    /// Size of one element in bytes
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::Float32 => std::mem::size_of::<f32>(),
            DataType::Int32 => std::mem::size_of::<i32>(),
        }
    }

    /// Check if the data type is floating point
    pub fn is_floating_point(&self) -> bool {
        matches!(self, DataType::Float32)
    }
}

/// Dimension ordering of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
pub enum DataLayout {
    NCHW,
    NHWC,
    NC,
    X,
}

impl Default for DataLayout {
    fn default() -> Self {
        DataLayout::NCHW
    }
}

/// Padding policy of a windowed operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
pub enum PaddingType {
    /// No padding; the window never leaves the input
    #[serde(alias = "None")]
    #[strum(serialize = "Valid", serialize = "None")]
    Valid,
    /// Output keeps the input's spatial size for unit strides
    Same,
}

/// How an operator's tensors are moved to and from its backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum MemoryType {
    Dma,
    Acp,
    Cache,
}

impl MemoryType {
    /// Memory interface a backend uses when nothing else is configured
    pub fn default_for(backend: BackendType) -> Self {
        match backend {
            BackendType::Smv => MemoryType::Dma,
            BackendType::Reference | BackendType::Cpu => MemoryType::Cache,
        }
    }

    /// Whether tensors routed this way occupy the backend's local memory.
    /// Cache-routed tensors are read through the coherent cache in place.
    pub fn uses_local_memory(self) -> bool {
        !matches!(self, MemoryType::Cache)
    }
}

/// Memory interface per tensor group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryAssignment {
    pub inputs: MemoryType,
    pub weights: MemoryType,
    pub outputs: MemoryType,
}

impl MemoryAssignment {
    pub fn uniform(memory: MemoryType) -> Self {
        Self {
            inputs: memory,
            weights: memory,
            outputs: memory,
        }
    }

    pub fn default_for(backend: BackendType) -> Self {
        Self::uniform(MemoryType::default_for(backend))
    }
}

/// Operator kinds understood by the engine.
///
/// The numeric codes are the ones used by layer configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter)]
pub enum OpType {
    Unknown = 0,
    Data = 1,
    ReLU = 2,
    Convolution3d = 3,
    MaxPooling = 4,
    AveragePooling = 5,
    EltwiseAdd = 6,
    EltwiseMul = 7,
    Sigmoid = 8,
    Tanh = 9,
    Switch = 10,
    Merge = 11,
}

impl OpType {
    pub const MIN_CODE: i64 = OpType::Unknown as i64;
    pub const MAX_CODE: i64 = OpType::Merge as i64;

    /// Map a numeric code onto an operator type; codes outside the known
    /// range become `Unknown`.
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => OpType::Data,
            2 => OpType::ReLU,
            3 => OpType::Convolution3d,
            4 => OpType::MaxPooling,
            5 => OpType::AveragePooling,
            6 => OpType::EltwiseAdd,
            7 => OpType::EltwiseMul,
            8 => OpType::Sigmoid,
            9 => OpType::Tanh,
            10 => OpType::Switch,
            11 => OpType::Merge,
            _ => OpType::Unknown,
        }
    }

    pub fn code(&self) -> i64 {
        *self as i64
    }
}

/// Granularity at which a sampled loop may be truncated
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SamplingLevel {
    NoSampling,
    Low,
    Medium,
    High,
}

impl Default for SamplingLevel {
    fn default() -> Self {
        SamplingLevel::NoSampling
    }
}

impl FromStr for SamplingLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "no" => Ok(SamplingLevel::NoSampling),
            "low" => Ok(SamplingLevel::Low),
            "medium" => Ok(SamplingLevel::Medium),
            "high" => Ok(SamplingLevel::High),
            other => Err(Error::ConfigError(format!(
                "Invalid sampling level '{}', expected one of: no, low, medium, high",
                other
            ))),
        }
    }
}

impl fmt::Display for SamplingLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SamplingLevel::NoSampling => "no",
            SamplingLevel::Low => "low",
            SamplingLevel::Medium => "medium",
            SamplingLevel::High => "high",
        };
        write!(f, "{}", name)
    }
}

/// Sampling configuration handed to operators that support it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingInfo {
    pub level: SamplingLevel,
    pub num_sample_iterations: usize,
}

impl Default for SamplingInfo {
    fn default() -> Self {
        Self {
            level: SamplingLevel::NoSampling,
            num_sample_iterations: 1,
        }
    }
}

impl SamplingInfo {
    pub fn new(level: SamplingLevel, num_sample_iterations: usize) -> Self {
        Self { level, num_sample_iterations }
    }

    /// Number of iterations of a loop of `total` iterations that actually run.
    ///
    /// A loop tagged with `loop_level` is truncated once the configured level
    /// reaches it. At least one iteration always runs.
    pub fn iterations_to_run(&self, loop_level: SamplingLevel, total: usize) -> usize {
        if self.level == SamplingLevel::NoSampling || self.level < loop_level {
            return total;
        }
        total.min(self.num_sample_iterations.max(1))
    }
}

/// Tiling statistics recorded by an operator run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileReport {
    pub tiles_total: usize,
    pub tiles_run: usize,
}

impl TileReport {
    pub fn new(tiles_total: usize, tiles_run: usize) -> Self {
        Self { tiles_total, tiles_run }
    }

    /// Whether sampling skipped any tile
    pub fn is_sampled(&self) -> bool {
        self.tiles_run < self.tiles_total
    }
}

/// A dataflow network: an arena of operators plus the dependency edges
/// derived from the tensors they share.
#[derive(Debug, Default)]
pub struct Network {
    name: String,
    operators: Vec<Box<dyn Operator>>,
    index: HashMap<String, NodeId>,
    // consumers[p] lists one entry per edge from p
    consumers: Vec<Vec<NodeId>>,
    initial_pending: Vec<usize>,
    compiled: bool,
}

impl Network {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled
    }

    /// Add an operator. Operators are numbered in insertion order.
    pub fn add_operator(&mut self, operator: Box<dyn Operator>) -> Result<NodeId> {
        let name = operator.name().to_string();
        if self.index.contains_key(&name) {
            return Err(Error::InvalidGraph(format!(
                "Operator '{}' is already part of network '{}'",
                name, self.name
            )));
        }

        let id = self.operators.len();
        self.operators.push(operator);
        self.index.insert(name, id);
        self.compiled = false;
        Ok(id)
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.index.get(name).copied()
    }

    pub fn operator(&self, id: NodeId) -> Result<&dyn Operator> {
        self.operators
            .get(id)
            .map(|op| op.as_ref())
            .ok_or_else(|| Error::InvalidGraph(format!("No operator with id {}", id)))
    }

    pub fn operator_mut(&mut self, id: NodeId) -> Result<&mut dyn Operator> {
        self.compiled = false;
        match self.operators.get_mut(id) {
            Some(op) => Ok(op.as_mut()),
            None => Err(Error::InvalidGraph(format!("No operator with id {}", id))),
        }
    }

    pub fn get_operator(&self, name: &str) -> Result<&dyn Operator> {
        let id = self.find(name).ok_or_else(|| {
            Error::InvalidOperator(format!("Operator '{}' not found in network", name))
        })?;
        self.operator(id)
    }

    pub fn operators(&self) -> impl Iterator<Item = &dyn Operator> {
        self.operators.iter().map(|op| op.as_ref())
    }

    /// Consumers of an operator's outputs, one entry per edge
    pub fn consumers(&self, id: NodeId) -> &[NodeId] {
        self.consumers.get(id).map(|c| c.as_slice()).unwrap_or(&[])
    }

    /// Number of in-network producers feeding this operator
    pub fn initial_pending(&self, id: NodeId) -> usize {
        self.initial_pending.get(id).copied().unwrap_or(0)
    }

    /// Operators none of whose outputs feed another operator
    pub fn sink_operators(&self) -> Vec<NodeId> {
        (0..self.operators.len())
            .filter(|&id| self.consumers(id).is_empty())
            .collect()
    }

    /// Build the dependency edges from tensor identity.
    ///
    /// Each input slot bound to a tensor produced by another operator in the
    /// network becomes one edge. A tensor with two producers or a cycle is
    /// a configuration error.
    pub fn compile(&mut self) -> Result<()> {
        let mut producers: HashMap<&str, NodeId> = HashMap::new();
        for (id, op) in self.operators.iter().enumerate() {
            for output in op.base().outputs().iter().flatten() {
                if let Some(previous) = producers.insert(output.name(), id) {
                    return Err(Error::InvalidGraph(format!(
                        "Tensor '{}' is produced by both '{}' and '{}'",
                        output.name(),
                        self.operators[previous].name(),
                        op.name()
                    )));
                }
            }
        }

        let n = self.operators.len();
        let mut consumers = vec![Vec::new(); n];
        let mut pending = vec![0usize; n];
        for (id, op) in self.operators.iter().enumerate() {
            for input in op.base().inputs().iter().flatten() {
                if let Some(&producer) = producers.get(input.name()) {
                    consumers[producer].push(id);
                    pending[id] += 1;
                }
            }
        }

        // Kahn's algorithm over a copy of the pending counts
        let mut in_degree = pending.clone();
        let mut queue: VecDeque<NodeId> = (0..n).filter(|&id| in_degree[id] == 0).collect();
        let mut visited = 0;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for &consumer in &consumers[id] {
                in_degree[consumer] -= 1;
                if in_degree[consumer] == 0 {
                    queue.push_back(consumer);
                }
            }
        }

        if visited != n {
            let stuck: Vec<&str> = (0..n)
                .filter(|&id| in_degree[id] > 0)
                .map(|id| self.operators[id].name())
                .collect();
            return Err(Error::InvalidGraph(format!(
                "Network '{}' contains a cycle through: {}",
                self.name,
                stuck.join(", ")
            )));
        }

        debug!(
            "Compiled network '{}': {} operators, {} edges",
            self.name,
            n,
            consumers.iter().map(|c| c.len()).sum::<usize>()
        );

        self.consumers = consumers;
        self.initial_pending = pending;
        self.compiled = true;
        self.reset_schedule();
        Ok(())
    }

    /// Check every operator before anything runs.
    ///
    /// Memory capacity is only checked against the operator's resource
    /// annotation and reported as a warning.
    pub fn validate(&self) -> Result<()> {
        for op in self.operators.iter() {
            if !op.validate() {
                return Err(Error::ValidationError(format!(
                    "Operator '{}' ({}) failed validation",
                    op.name(),
                    op.op_type()
                )));
            }

            let base = op.base();
            if let Some(slot) = base.inputs().iter().position(|t| t.is_none()) {
                return Err(Error::ValidationError(format!(
                    "Operator '{}' has no tensor bound to input slot {}",
                    op.name(),
                    slot
                )));
            }
            if let Some(slot) = base.outputs().iter().position(|t| t.is_none()) {
                return Err(Error::ValidationError(format!(
                    "Operator '{}' has no tensor bound to output slot {}",
                    op.name(),
                    slot
                )));
            }

            let footprint = op.local_footprint_bytes();
            let capacity = base.resources().mem_size;
            if base.backend() == BackendType::Smv && footprint as u64 > capacity {
                warn!(
                    "Operator '{}' touches {} bytes but {} instance {} holds {} bytes; it will be tiled",
                    op.name(),
                    footprint,
                    base.backend(),
                    base.assignment().instance,
                    capacity
                );
            }
        }
        Ok(())
    }

    /// Restore pending counts and lifecycle states so the network can run again
    pub fn reset_schedule(&self) {
        for (id, op) in self.operators.iter().enumerate() {
            op.base().reset_schedule(self.initial_pending(id));
        }
    }

    /// Whether every operator reached `Done`
    pub fn all_done(&self) -> bool {
        self.operators.iter().all(|op| op.base().state() == OpState::Done)
    }
}
