//! Execution strategies for the simulated backends.
//!
//! Each backend provides the same kernels behind the [`Kernels`] trait.
//! Results are identical across backends; they differ in how the work is
//! split (threads, tiles) and in the alignment they impose on tensors.

pub mod config;
pub mod cpu;
pub mod reference;
pub mod smv;

use std::str::FromStr;

use ndarray::{ArrayView4, ArrayViewD, ArrayViewMut4, ArrayViewMutD};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use crate::error::Result;
use crate::model::{MemoryAssignment, SamplingInfo, TileReport};

pub use config::{BackendConfig, BackendOverride, BackendOverrides, BackendResourceModel};

/// Hardware target of an operator
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(ascii_case_insensitive)]
pub enum BackendType {
    #[strum(to_string = "Reference", serialize = "REF")]
    #[serde(alias = "REF", alias = "Ref")]
    Reference,
    #[strum(to_string = "SMV")]
    #[serde(alias = "SMV")]
    Smv,
    #[strum(to_string = "CPU")]
    #[serde(alias = "CPU")]
    Cpu,
}

impl Default for BackendType {
    fn default() -> Self {
        BackendType::Reference
    }
}

impl BackendType {
    /// Resolve a backend name from a layer configuration. Unrecognised
    /// names select the CPU backend.
    pub fn from_config_name(name: &str) -> Self {
        BackendType::from_str(name).unwrap_or(BackendType::Cpu)
    }

    /// Element alignment of the innermost tensor dimension
    pub fn alignment(&self) -> usize {
        match self {
            BackendType::Smv => 8,
            BackendType::Reference | BackendType::Cpu => 0,
        }
    }
}

/// Per-dispatch parameters handed to a kernel
#[derive(Debug, Clone, Copy)]
pub struct KernelContext {
    pub resources: BackendConfig,
    pub num_cores: usize,
    pub memory: MemoryAssignment,
    pub sampling: SamplingInfo,
}

/// A valid (unpadded) convolution over logical NCHW views
#[derive(Debug, Clone, Copy)]
pub struct ConvJob<'a> {
    pub input: ArrayView4<'a, f32>,
    /// `[ofmaps, channels, rows, cols]`
    pub kernels: ArrayView4<'a, f32>,
    pub stride: (usize, usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Max,
    Average,
}

#[derive(Debug, Clone, Copy)]
pub struct PoolJob<'a> {
    pub input: ArrayView4<'a, f32>,
    pub kind: PoolKind,
    pub window: (usize, usize),
    pub stride: (usize, usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EltwiseKind {
    Add,
    Mul,
}

impl EltwiseKind {
    pub fn apply(&self, a: f32, b: f32) -> f32 {
        match self {
            EltwiseKind::Add => a + b,
            EltwiseKind::Mul => a * b,
        }
    }
}

/// Kernels a backend must provide. Output views are the logical regions of
/// the destination tensors.
pub trait Kernels: Send + Sync {
    fn backend(&self) -> BackendType;

    fn convolution(
        &self,
        job: &ConvJob<'_>,
        output: ArrayViewMut4<'_, f32>,
        ctx: &KernelContext,
    ) -> Result<TileReport>;

    fn pooling(
        &self,
        job: &PoolJob<'_>,
        output: ArrayViewMut4<'_, f32>,
        ctx: &KernelContext,
    ) -> Result<TileReport> {
        reference::pooling(job, output, &ctx.sampling)
    }

    fn eltwise(
        &self,
        kind: EltwiseKind,
        a: ArrayViewD<'_, f32>,
        b: ArrayViewD<'_, f32>,
        output: ArrayViewMutD<'_, f32>,
        _ctx: &KernelContext,
    ) -> Result<TileReport> {
        reference::eltwise(kind, a, b, output)
    }

    fn activation(
        &self,
        function: fn(f32) -> f32,
        input: ArrayViewD<'_, f32>,
        output: ArrayViewMutD<'_, f32>,
        _ctx: &KernelContext,
    ) -> Result<TileReport> {
        reference::activation(function, input, output)
    }
}

/// Kernel implementation for a backend type
pub fn kernels_for(backend: BackendType) -> &'static dyn Kernels {
    match backend {
        BackendType::Reference => &reference::ReferenceKernels,
        BackendType::Cpu => &cpu::CpuKernels,
        BackendType::Smv => &smv::SmvKernels,
    }
}
