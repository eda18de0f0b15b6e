use std::fs;

use anyhow::Result;
use rand::prelude::*;

use nnsim::{
    backend::BackendOverrides,
    error::Error,
    layout::tensor_layout::TensorShape,
    model::{DataLayout, OpType, PaddingType, SamplingInfo, SamplingLevel},
    ops::registry::NodeParams,
    ops::tensor::Tensor,
    parser::archive::{self, TensorArchive, WEIGHTS_SECTION},
    parser::network_builder::load_archive_sections,
    BackendResourceModel, BackendType, ExecutionContext, ExecutionOptions, NetworkBuilder,
    NetworkConfig, NetworkParameters, NetworkTopology, NodeDesc, Scheduler,
};

fn conv(name: &str, input: &str, ofmaps: usize, padding: PaddingType) -> NodeDesc {
    NodeDesc::new(name, OpType::Convolution3d)
        .with_inputs(&[input])
        .with_params(NodeParams {
            weight_rows: Some(3),
            weight_cols: Some(3),
            num_ofmaps: Some(ofmaps),
            stride_rows: Some(1),
            stride_cols: Some(1),
            padding: Some(padding),
            ..Default::default()
        })
}

/// input [1,3,8,8] -> conv1 (same, 4) -> relu -> max pool 2x2 -> conv2 (valid, 2)
///                                                            -> sigmoid -> mul
fn small_cnn(backend: BackendType) -> NetworkTopology {
    let mut topology = NetworkTopology::new("small-cnn", backend);
    topology.push(NodeDesc::new("input", OpType::Data).with_params(NodeParams {
        shape: Some(vec![1, 3, 8, 8]),
        layout: Some(DataLayout::NCHW),
        ..Default::default()
    }));
    topology.push(conv("conv1", "input", 4, PaddingType::Same));
    topology.push(NodeDesc::new("relu", OpType::ReLU).with_inputs(&["conv1"]));
    topology.push(
        NodeDesc::new("pool", OpType::MaxPooling)
            .with_inputs(&["relu"])
            .with_params(NodeParams {
                pool_rows: Some(2),
                pool_cols: Some(2),
                stride_rows: Some(2),
                stride_cols: Some(2),
                ..Default::default()
            }),
    );
    topology.push(conv("conv2", "pool", 2, PaddingType::Valid));
    topology.push(NodeDesc::new("sigmoid", OpType::Sigmoid).with_inputs(&["conv2"]));
    topology.push(NodeDesc::new("mul", OpType::EltwiseMul).with_inputs(&["conv2", "sigmoid"]));
    topology
}

fn random_values(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

fn small_cnn_parameters(seed: u64) -> NetworkParameters {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut parameters = NetworkParameters::new();
    parameters.insert("input", random_values(&mut rng, 3 * 8 * 8));
    parameters.insert("conv1/kernels", random_values(&mut rng, 4 * 3 * 3 * 3));
    parameters.insert("conv2/kernels", random_values(&mut rng, 2 * 4 * 3 * 3));
    parameters
}

/// Resources with an SMV scratchpad small enough to force tiling
fn tight_resources() -> Result<BackendResourceModel> {
    Ok(BackendResourceModel::from_json_str(2, 2, r#"{"smv": {"mem_size": 1024}}"#)?)
}

fn run_small_cnn(
    backend: BackendType,
    resources: BackendResourceModel,
    options: ExecutionOptions,
    seed: u64,
) -> Result<Vec<f32>> {
    let (network, _workspace) =
        NetworkBuilder::new(&resources).build(&small_cnn(backend), &small_cnn_parameters(seed))?;
    let context = ExecutionContext::new(options, resources)?;
    let summary = Scheduler::new(&network, &context).run()?;
    assert_eq!(summary.outputs.len(), 1);
    Ok(summary.output("mul").unwrap().logical_values()?)
}

fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() < 1e-4, "element {}: {} vs {}", i, a, e);
    }
}

#[test]
fn test_backends_agree() -> Result<()> {
    let expected = run_small_cnn(BackendType::Reference, tight_resources()?, ExecutionOptions::new(), 42)?;
    assert_eq!(expected.len(), 2 * 2 * 2);
    assert!(expected.iter().any(|&v| v != 0.0));

    let cpu = run_small_cnn(
        BackendType::Cpu,
        tight_resources()?,
        ExecutionOptions::new().set_thread_count(3).enable_parallel_dispatch(true),
        42,
    )?;
    assert_close(&cpu, &expected);

    let smv = run_small_cnn(BackendType::Smv, tight_resources()?, ExecutionOptions::new(), 42)?;
    assert_close(&smv, &expected);
    Ok(())
}

#[test]
fn test_smv_sampling_reports_skipped_tiles() -> Result<()> {
    let resources = tight_resources()?;
    let (network, _workspace) = NetworkBuilder::new(&resources)
        .with_sampling(SamplingInfo::new(SamplingLevel::Low, 1))
        .build(&small_cnn(BackendType::Smv), &small_cnn_parameters(1))?;
    let context = ExecutionContext::new(ExecutionOptions::new(), resources)?;
    let summary = Scheduler::new(&network, &context).run()?;

    let (_, conv1) = summary.tiles.iter().find(|(name, _)| name == "conv1").unwrap();
    // 3 channel tiles x 2 output-map tiles; Low sampling keeps one channel tile
    assert_eq!(conv1.tiles_total, 6);
    assert_eq!(conv1.tiles_run, 2);
    assert!(conv1.is_sampled());

    let (_, relu) = summary.tiles.iter().find(|(name, _)| name == "relu").unwrap();
    assert!(!relu.is_sampled());
    Ok(())
}

#[test]
fn test_smv_tile_that_cannot_fit_fails() -> Result<()> {
    let resources = BackendResourceModel::from_json_str(1, 1, r#"{"smv": {"mem_size": 256}}"#)?;
    let (network, _workspace) =
        NetworkBuilder::new(&resources).build(&small_cnn(BackendType::Smv), &small_cnn_parameters(3))?;
    let context = ExecutionContext::new(ExecutionOptions::new(), resources)?;
    assert!(matches!(Scheduler::new(&network, &context).run(), Err(Error::ResourceExhausted(_))));
    Ok(())
}

#[test]
fn test_instance_lookup_falls_back_to_first() -> Result<()> {
    let resources = BackendResourceModel::with_defaults(2, 3);
    for backend in [BackendType::Reference, BackendType::Cpu, BackendType::Smv] {
        let first = resources.lookup(backend, 0);
        let count = resources.instance_count(backend) as i64;
        assert_eq!(resources.lookup(backend, -1), first);
        assert_eq!(resources.lookup(backend, count), first);
    }
    Ok(())
}

#[test]
fn test_file_backed_configuration() -> Result<()> {
    let dir = tempfile::tempdir()?;

    let config_path = dir.path().join("layers.cfg");
    fs::write(&config_path, "conv1 3 SMV 2\nconv2 3 SMV 9\nnot a layer\nrelu 2 CPU 1\n")?;
    let overrides_path = dir.path().join("resources.json");
    fs::write(&overrides_path, r#"{"smv": {"mem_size": 2048, "num_pes": 4}, "cpu": {"mem_size": 65536}}"#)?;

    let config = NetworkConfig::from_file(&config_path)?;
    assert_eq!(config.len(), 3);
    let resources = BackendResourceModel::from_file(1, 2, &overrides_path)?;
    assert_eq!(resources.lookup(BackendType::Smv, 1).mem_size, 2048);
    assert_eq!(resources.lookup(BackendType::Smv, 1).num_pes, 4);
    assert_eq!(resources.lookup(BackendType::Cpu, 0).mem_size, 65536);
    assert_eq!(resources.lookup(BackendType::Reference, 0).mem_size, 128 * 1024);

    // Kernels of conv1 come from an archive instead of the parameter set
    let mut parameters = small_cnn_parameters(9);
    let kernels = parameters.tensors.remove("conv1/kernels").unwrap();
    let staged = Tensor::from_values(
        "staged",
        TensorShape::new(&[4, 3, 3, 3], DataLayout::NCHW, BackendType::Smv.alignment()),
        &kernels,
    )?;
    let archive_path = dir.path().join("weights.txt");
    let mut file = fs::File::create(&archive_path)?;
    archive::write_tensor(&mut file, WEIGHTS_SECTION, &staged)?;
    drop(file);

    let (network, workspace) = NetworkBuilder::new(&resources)
        .with_config(&config)
        .build(&small_cnn(BackendType::Reference), &parameters)?;
    let conv1 = network.get_operator("conv1")?.base();
    assert_eq!(conv1.backend(), BackendType::Smv);
    assert_eq!(conv1.assignment().num_cores, 2);
    assert_eq!(conv1.resources().mem_size, 2048);
    let conv2 = network.get_operator("conv2")?.base();
    assert_eq!(conv2.assignment().num_cores, 1);
    assert_eq!(conv2.assignment().instance, 1);
    assert_eq!(network.get_operator("relu")?.base().backend(), BackendType::Cpu);

    let archive = TensorArchive::from_file(&archive_path)?;
    load_archive_sections(&archive, &workspace, &[(WEIGHTS_SECTION, "conv1/kernels")])?;
    // Values are archived with eight decimals
    assert_close(&workspace.get_tensor("conv1/kernels")?.logical_values()?, &kernels);

    let context = ExecutionContext::new(ExecutionOptions::new(), resources)?;
    let summary = Scheduler::new(&network, &context).run()?;
    let expected = run_small_cnn(
        BackendType::Reference,
        BackendResourceModel::default(),
        ExecutionOptions::new(),
        9,
    )?;
    assert_close(&summary.output("mul").unwrap().logical_values()?, &expected);
    Ok(())
}

#[test]
fn test_archive_missing_file() {
    let result = TensorArchive::from_file("/nonexistent/weights.txt");
    assert!(matches!(result, Err(Error::LoadError(_, _))));
}

#[test]
fn test_overrides_reject_unknown_keys() {
    assert!(BackendOverrides::from_json_str(r#"{"gpu": {"mem_size": 1}}"#).is_err());
    assert!(BackendOverrides::from_json_str(r#"{"smv": {"memsize": 1}}"#).is_err());
}
