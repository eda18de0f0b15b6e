//! Build a [`Network`] and its [`Workspace`] from a topology description.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::backend::{BackendResourceModel, BackendType};
use crate::error::{Error, Result};
use crate::memory::workspace::Workspace;
use crate::model::{MemoryAssignment, Network, OpType, SamplingInfo};
use crate::ops::registry::{BackendAssignment, NodeParams, OperatorRegistry};
use crate::parser::archive::TensorArchive;
use crate::parser::network_config::NetworkConfig;

/// One operator of a topology
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDesc {
    pub name: String,
    pub op: OpType,
    /// Producers of the input slots, in slot order: `"<op>"` for output 0
    /// of `<op>`, `"<op>:<k>"` for output `k`
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub params: NodeParams,
    /// Backend used when the layer configuration does not place the node
    #[serde(default)]
    pub backend: Option<BackendType>,
    #[serde(default)]
    pub memory: Option<MemoryAssignment>,
}

impl NodeDesc {
    pub fn new(name: impl Into<String>, op: OpType) -> Self {
        Self {
            name: name.into(),
            op,
            inputs: Vec::new(),
            params: NodeParams::default(),
            backend: None,
            memory: None,
        }
    }

    pub fn with_inputs(mut self, inputs: &[&str]) -> Self {
        self.inputs = inputs.iter().map(|i| i.to_string()).collect();
        self
    }

    pub fn with_params(mut self, params: NodeParams) -> Self {
        self.params = params;
        self
    }
}

/// Operators of a network in declaration order. Producers must be declared
/// before their consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkTopology {
    pub name: String,
    #[serde(default)]
    pub backend: BackendType,
    pub nodes: Vec<NodeDesc>,
}

impl NetworkTopology {
    pub fn new(name: impl Into<String>, backend: BackendType) -> Self {
        Self {
            name: name.into(),
            backend,
            nodes: Vec::new(),
        }
    }

    pub fn push(&mut self, node: NodeDesc) {
        self.nodes.push(node);
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::LoadError(path.to_path_buf(), e.to_string()))?;
        Self::from_json_str(&text)
    }
}

/// Values of externally supplied tensors, keyed by tensor name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkParameters {
    pub tensors: HashMap<String, Vec<f32>>,
}

impl NetworkParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tensor: impl Into<String>, values: Vec<f32>) {
        self.tensors.insert(tensor.into(), values);
    }

    pub fn get(&self, tensor: &str) -> Option<&[f32]> {
        self.tensors.get(tensor).map(|v| v.as_slice())
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Split `"<op>:<k>"` into the producer name and output slot
fn parse_input_ref(input: &str) -> Result<(&str, usize)> {
    match input.rsplit_once(':') {
        Some((producer, slot)) => {
            let slot = slot.parse().map_err(|_| {
                Error::InvalidGraph(format!("Invalid output slot in input reference '{}'", input))
            })?;
            Ok((producer, slot))
        }
        None => Ok((input, 0)),
    }
}

/// Turns a [`NetworkTopology`] into a compiled [`Network`] whose tensors
/// live in a fresh [`Workspace`].
///
/// Placement of each node: the layer configuration if it names the node,
/// otherwise the node's own backend, otherwise the topology's. Instances of
/// a backend are handed out round-robin.
#[derive(Debug)]
pub struct NetworkBuilder<'a> {
    registry: OperatorRegistry,
    config: Option<&'a NetworkConfig>,
    resources: &'a BackendResourceModel,
    sampling: Option<SamplingInfo>,
}

impl<'a> NetworkBuilder<'a> {
    pub fn new(resources: &'a BackendResourceModel) -> Self {
        Self {
            registry: OperatorRegistry::initialize_standard_operators(),
            config: None,
            resources,
            sampling: None,
        }
    }

    pub fn with_registry(mut self, registry: OperatorRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_config(mut self, config: &'a NetworkConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Sampling handed to every operator that supports it
    pub fn with_sampling(mut self, sampling: SamplingInfo) -> Self {
        self.sampling = Some(sampling);
        self
    }

    fn placement(&self, node: &NodeDesc, topology: &NetworkTopology) -> (BackendType, usize) {
        if let Some(layer) = self.config.and_then(|c| c.get(&node.name)) {
            if layer.op_type != node.op {
                warn!(
                    "Layer config for '{}' names op type {} but the node is {}",
                    node.name, layer.op_type, node.op
                );
            }
            return (layer.backend, layer.num_cores);
        }
        (node.backend.unwrap_or(topology.backend), 1)
    }

    pub fn build(
        &self,
        topology: &NetworkTopology,
        parameters: &NetworkParameters,
    ) -> Result<(Network, Workspace)> {
        let mut network = Network::new(&topology.name);
        let mut workspace = Workspace::new();
        let mut next_instance: HashMap<BackendType, usize> = HashMap::new();
        let mut used_parameters = 0;

        for node in &topology.nodes {
            // A merge takes one slot per declared input
            let sized;
            let params = if node.op == OpType::Merge && node.params.num_inputs.is_none() {
                sized = NodeParams {
                    num_inputs: Some(node.inputs.len()),
                    ..node.params.clone()
                };
                &sized
            } else {
                &node.params
            };
            let mut op = self.registry.create_operator(node.op, &node.name, params)?;

            let (backend, num_cores) = self.placement(node, topology);
            let counter = next_instance.entry(backend).or_insert(0);
            let instance = *counter % self.resources.instance_count(backend).max(1);
            *counter += 1;

            let assignment = BackendAssignment {
                backend,
                instance: instance as i64,
                num_cores,
            };
            let base = op.base_mut();
            base.set_backend(assignment);
            base.annotate(self.resources.lookup(backend, assignment.instance));
            base.set_memory(node.memory.unwrap_or_else(|| MemoryAssignment::default_for(backend)));
            if let Some(sampling) = self.sampling {
                op.set_sampling_info(sampling);
            }

            for (slot, input) in node.inputs.iter().enumerate() {
                let (producer_name, output) = parse_input_ref(input)?;
                let producer = network
                    .find(producer_name)
                    .and_then(|id| network.operator(id).ok())
                    .ok_or_else(|| {
                        Error::InvalidGraph(format!(
                            "Node '{}' reads from unknown operator '{}'",
                            node.name, producer_name
                        ))
                    })?;
                let tensor = producer.base().output(output)?.clone();
                op.base_mut().set_input(slot, tensor)?;
            }

            op.create_all_tensors(&mut workspace)?;

            let mut targets = op.parameterizable_inputs();
            if node.op == OpType::Data {
                targets.extend(op.base().outputs().iter().flatten().cloned());
            }
            for tensor in targets {
                if let Some(values) = parameters.get(tensor.name()) {
                    tensor.fill_logical(values)?;
                    used_parameters += 1;
                }
            }

            debug!(
                "Placed '{}' ({}) on {} instance {} with {} core(s)",
                node.name, node.op, backend, instance, num_cores
            );
            network.add_operator(op)?;
        }

        if used_parameters < parameters.tensors.len() {
            warn!(
                "{} parameter tensor(s) did not match any tensor of network '{}'",
                parameters.tensors.len() - used_parameters,
                topology.name
            );
        }

        network.compile()?;
        info!(
            "Built network '{}': {} operators, {} tensors, {} bytes",
            network.name(),
            network.len(),
            workspace.len(),
            workspace.total_storage_bytes()
        );
        Ok((network, workspace))
    }
}

/// Fill workspace tensors from archive sections, one section per tensor
pub fn load_archive_sections(
    archive: &TensorArchive,
    workspace: &Workspace,
    sections: &[(&str, &str)],
) -> Result<()> {
    for (section, tensor) in sections {
        let tensor = workspace.get_tensor(tensor)?;
        archive.load_tensor(section, &tensor)?;
        debug!("Loaded section '{}' into '{}'", section, tensor.name());
    }
    Ok(())
}
