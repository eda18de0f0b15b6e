use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use rand::prelude::*;

use nnsim::{
    error::Error,
    execution::scheduler::Scheduler,
    layout::tensor_layout::TensorShape,
    memory::workspace::Workspace,
    model::{DataLayout, Network, OpType, PaddingType},
    ops::registry::{NodeParams, OpState, Operator, OperatorBase},
    ops::tensor::Tensor,
    BackendResourceModel, BackendType, ExecutionContext, ExecutionOptions, NetworkBuilder,
    NetworkParameters, NetworkTopology, NodeDesc,
};

/// Writes `1 + max(inputs)` and logs its name, so the output of every
/// operator is the length of the longest path ending at it
#[derive(Debug)]
struct DepthOp {
    base: OperatorBase,
    log: Arc<Mutex<Vec<String>>>,
}

impl DepthOp {
    fn new(name: &str, num_inputs: usize, log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            base: OperatorBase::new(name, OpType::Unknown, num_inputs, 1),
            log,
        }
    }
}

impl Operator for DepthOp {
    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    fn validate(&self) -> bool {
        true
    }

    fn infer_output_shape(&self) -> nnsim::Result<TensorShape> {
        Ok(TensorShape::new(&[1], DataLayout::X, 0))
    }

    fn create_all_tensors(&mut self, workspace: &mut Workspace) -> nnsim::Result<()> {
        if !self.base.has_output(0) {
            let tensor = Tensor::new(self.base.name(), self.infer_output_shape()?);
            let handle = workspace.add_tensor(tensor)?;
            self.base.set_output(0, handle)?;
        }
        Ok(())
    }

    fn run(&self, _context: &ExecutionContext) -> nnsim::Result<()> {
        let mut depth = 0.0f32;
        for input in self.base.inputs().iter().flatten() {
            depth = depth.max(input.logical_values()?[0]);
        }
        self.base.output(0)?.fill_logical(&[depth + 1.0])?;
        self.log.lock().unwrap().push(self.base.name().to_string());
        Ok(())
    }
}

struct RandomDag {
    network: Network,
    _workspace: Workspace,
    edges: Vec<(String, String)>,
    depth: HashMap<String, f32>,
    log: Arc<Mutex<Vec<String>>>,
}

/// A random DAG of depth operators added to the network in shuffled order. A node
/// may read the same producer through several slots.
fn random_dag(seed: u64, num_nodes: usize) -> Result<RandomDag> {
    let mut rng = StdRng::seed_from_u64(seed);
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut workspace = Workspace::new();
    let mut ops = Vec::new();
    let mut edges = Vec::new();
    let mut depth: HashMap<String, f32> = HashMap::new();

    for i in 0..num_nodes {
        let name = format!("n{}", i);
        let producers: Vec<usize> = if i == 0 {
            Vec::new()
        } else {
            let count = rng.gen_range(0..=3);
            (0..count).map(|_| rng.gen_range(0..i)).collect()
        };

        let mut op = DepthOp::new(&name, producers.len(), log.clone());
        let mut node_depth = 0.0f32;
        for (slot, &p) in producers.iter().enumerate() {
            let producer = format!("n{}", p);
            op.base_mut().set_input(slot, workspace.get_tensor(&producer)?)?;
            node_depth = node_depth.max(depth[&producer]);
            edges.push((producer, name.clone()));
        }
        op.create_all_tensors(&mut workspace)?;
        depth.insert(name, node_depth + 1.0);
        ops.push(op);
    }

    ops.shuffle(&mut rng);
    let mut network = Network::new(format!("random-{}", seed));
    for op in ops {
        network.add_operator(Box::new(op))?;
    }
    network.compile()?;

    Ok(RandomDag {
        network,
        _workspace: workspace,
        edges,
        depth,
        log,
    })
}

fn check_run(dag: &RandomDag, context: &ExecutionContext) -> Result<()> {
    dag.log.lock().unwrap().clear();
    let summary = Scheduler::new(&dag.network, context).run()?;
    let log = dag.log.lock().unwrap().clone();

    // Every operator ran exactly once
    assert_eq!(log.len(), dag.network.len());
    assert_eq!(summary.order.len(), dag.network.len());
    let position: HashMap<&str, usize> = log.iter().enumerate().map(|(i, n)| (n.as_str(), i)).collect();
    assert_eq!(position.len(), dag.network.len());

    // Producers finish before their consumers start
    for (producer, consumer) in &dag.edges {
        assert!(position[producer.as_str()] < position[consumer.as_str()], "{} -> {}", producer, consumer);
        let p = dag.network.find(producer).unwrap();
        let c = dag.network.find(consumer).unwrap();
        assert!(summary.position(p).unwrap() < summary.position(c).unwrap());
    }

    for op in dag.network.operators() {
        assert_eq!(op.base().state(), OpState::Done);
        assert_eq!(op.base().num_pending_inputs(), 0);
        let value = op.base().output(0)?.logical_values()?[0];
        assert_eq!(value, dag.depth[op.name()], "{}", op.name());
    }
    Ok(())
}

#[test]
fn test_random_dags_sequential() -> Result<()> {
    let context = ExecutionContext::default();
    for seed in 0..20 {
        let dag = random_dag(seed, 25)?;
        check_run(&dag, &context)?;
    }
    Ok(())
}

#[test]
fn test_random_dags_parallel() -> Result<()> {
    let context = ExecutionContext::new(
        ExecutionOptions::new().set_thread_count(4).enable_parallel_dispatch(true),
        BackendResourceModel::default(),
    )?;
    for seed in 100..110 {
        let dag = random_dag(seed, 40)?;
        check_run(&dag, &context)?;
        // Reset between runs
        check_run(&dag, &context)?;
    }
    Ok(())
}

#[test]
fn test_pending_counts_follow_edges() -> Result<()> {
    let dag = random_dag(7, 30)?;
    let mut expected: HashMap<&str, usize> = HashMap::new();
    for (_, consumer) in &dag.edges {
        *expected.entry(consumer.as_str()).or_default() += 1;
    }
    for op in dag.network.operators() {
        let id = dag.network.find(op.name()).unwrap();
        let edges = expected.get(op.name()).copied().unwrap_or(0);
        assert_eq!(dag.network.initial_pending(id), edges);
        assert_eq!(op.base().num_pending_inputs(), edges);
    }
    Ok(())
}

#[test]
fn test_cycle_is_rejected() -> Result<()> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut workspace = Workspace::new();
    let mut a = DepthOp::new("a", 1, log.clone());
    let mut b = DepthOp::new("b", 1, log);
    a.create_all_tensors(&mut workspace)?;
    b.create_all_tensors(&mut workspace)?;
    a.base_mut().set_input(0, workspace.get_tensor("b")?)?;
    b.base_mut().set_input(0, workspace.get_tensor("a")?)?;

    let mut network = Network::new("cycle");
    network.add_operator(Box::new(a))?;
    network.add_operator(Box::new(b))?;
    match network.compile() {
        Err(Error::InvalidGraph(message)) => assert!(message.contains("cycle")),
        other => panic!("expected a cycle error, got {:?}", other),
    }

    let context = ExecutionContext::default();
    assert!(Scheduler::new(&network, &context).run().is_err());
    Ok(())
}

#[test]
fn test_duplicate_operator_name() -> Result<()> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut network = Network::new("dup");
    network.add_operator(Box::new(DepthOp::new("a", 0, log.clone())))?;
    assert!(matches!(
        network.add_operator(Box::new(DepthOp::new("a", 0, log))),
        Err(Error::InvalidGraph(_))
    ));
    Ok(())
}

fn switch_topology() -> Result<NetworkTopology> {
    Ok(NetworkTopology::from_json_str(
        r#"{
            "name": "branches",
            "backend": "Reference",
            "nodes": [
                {"name": "input", "op": "Data", "params": {"shape": [1, 4], "layout": "NC"}},
                {"name": "pred", "op": "Data", "params": {"shape": [1], "layout": "X"}},
                {"name": "switch", "op": "Switch", "inputs": ["input", "pred"]},
                {"name": "on_false", "op": "Tanh", "inputs": ["switch:0"]},
                {"name": "on_true", "op": "ReLU", "inputs": ["switch:1"]},
                {"name": "after_true", "op": "Sigmoid", "inputs": ["on_true"]},
                {"name": "merge", "op": "Merge", "inputs": ["on_false", "after_true"]}
            ]
        }"#,
    )?)
}

fn run_switch(predicate: f32, parallel: bool) -> Result<(Network, Vec<f32>)> {
    let resources = BackendResourceModel::default();
    let mut parameters = NetworkParameters::new();
    parameters.insert("input", vec![-1.0, 0.5, 2.0, -3.0]);
    parameters.insert("pred", vec![predicate]);

    let (network, _workspace) = NetworkBuilder::new(&resources).build(&switch_topology()?, &parameters)?;
    let context = ExecutionContext::new(
        ExecutionOptions::new().set_thread_count(2).enable_parallel_dispatch(parallel),
        resources,
    )?;
    let summary = Scheduler::new(&network, &context).run()?;
    assert_eq!(summary.outputs.len(), 1);
    let values = summary.output("merge").unwrap().logical_values()?;
    Ok((network, values))
}

fn is_dead(network: &Network, name: &str) -> bool {
    network.get_operator(name).unwrap().base().output(0).unwrap().is_dead()
}

#[test]
fn test_dead_values_follow_untaken_branch() -> Result<()> {
    for parallel in [false, true] {
        let (network, values) = run_switch(1.0, parallel)?;
        assert!(is_dead(&network, "on_false"));
        assert!(!is_dead(&network, "on_true"));
        assert!(!is_dead(&network, "after_true"));
        assert!(!is_dead(&network, "merge"));
        let expected: Vec<f32> = [-1.0f32, 0.5, 2.0, -3.0]
            .iter()
            .map(|&x| 1.0 / (1.0 + (-x.max(0.0)).exp()))
            .collect();
        for (v, e) in values.iter().zip(&expected) {
            assert!((v - e).abs() < 1e-6);
        }

        let (network, values) = run_switch(0.0, parallel)?;
        assert!(!is_dead(&network, "on_false"));
        assert!(is_dead(&network, "on_true"));
        // Dead values propagate through every operator downstream
        assert!(is_dead(&network, "after_true"));
        assert!(!is_dead(&network, "merge"));
        for (v, x) in values.iter().zip([-1.0f32, 0.5, 2.0, -3.0]) {
            assert!((v - x.tanh()).abs() < 1e-6);
        }

        // Every operator still ran exactly once
        assert!(network.all_done());
    }
    Ok(())
}

#[test]
fn test_three_way_merge_forwards_live_branch() -> Result<()> {
    let topology = NetworkTopology::from_json_str(
        r#"{
            "name": "three-way",
            "backend": "Reference",
            "nodes": [
                {"name": "input", "op": "Data", "params": {"shape": [1, 4], "layout": "NC"}},
                {"name": "pred", "op": "Data", "params": {"shape": [1], "layout": "X"}},
                {"name": "switch", "op": "Switch", "inputs": ["input", "pred"]},
                {"name": "on_true", "op": "ReLU", "inputs": ["switch:1"]},
                {"name": "after_true", "op": "Sigmoid", "inputs": ["on_true"]},
                {"name": "on_false", "op": "Tanh", "inputs": ["switch:0"]},
                {"name": "merge", "op": "Merge", "inputs": ["on_true", "after_true", "on_false"]}
            ]
        }"#,
    )?;
    let resources = BackendResourceModel::default();
    let mut parameters = NetworkParameters::new();
    parameters.insert("input", vec![-1.0, 0.5, 2.0, -3.0]);
    parameters.insert("pred", vec![0.0]);

    let (network, _workspace) = NetworkBuilder::new(&resources).build(&topology, &parameters)?;
    assert_eq!(network.initial_pending(network.find("merge").unwrap()), 3);

    for parallel in [false, true] {
        let context = ExecutionContext::new(
            ExecutionOptions::new().set_thread_count(2).enable_parallel_dispatch(parallel),
            resources.clone(),
        )?;
        let summary = Scheduler::new(&network, &context).run()?;
        assert!(is_dead(&network, "on_true"));
        assert!(is_dead(&network, "after_true"));
        assert!(!is_dead(&network, "merge"));

        // Only the last input is live
        let values = summary.output("merge").unwrap().logical_values()?;
        for (v, x) in values.iter().zip([-1.0f32, 0.5, 2.0, -3.0]) {
            assert!((v - x.tanh()).abs() < 1e-6);
        }
    }
    Ok(())
}

#[test]
fn test_invalid_network_is_refused_before_running() -> Result<()> {
    let resources = BackendResourceModel::default();
    let mut topology = NetworkTopology::new("bad", BackendType::Reference);
    topology.push(NodeDesc::new("input", OpType::Data).with_params(NodeParams {
        shape: Some(vec![1, 1, 4, 4]),
        ..Default::default()
    }));
    topology.push(NodeDesc::new("relu", OpType::ReLU).with_inputs(&["input"]));
    // A convolution without output feature maps builds but fails validation
    topology.push(
        NodeDesc::new("conv", OpType::Convolution3d)
            .with_inputs(&["relu"])
            .with_params(NodeParams {
                weight_rows: Some(3),
                weight_cols: Some(3),
                stride_rows: Some(1),
                stride_cols: Some(1),
                padding: Some(PaddingType::Valid),
                ..Default::default()
            }),
    );

    let (network, _workspace) = NetworkBuilder::new(&resources).build(&topology, &NetworkParameters::new())?;

    let context = ExecutionContext::default();
    assert!(matches!(Scheduler::new(&network, &context).run(), Err(Error::ValidationError(_))));
    for op in network.operators() {
        assert_ne!(op.base().state(), OpState::Done);
    }
    Ok(())
}
