//! Tiled execution on the SMV accelerator model.
//!
//! The accelerator only sees what fits in its local memory. Convolutions
//! are split into tiles of input channels and output feature maps so that
//! the input slice, the kernel slice and the partial output slice of one
//! tile fit in `mem_size` bytes together. Partial sums are accumulated
//! across channel tiles. Tensor groups routed through the cache do not
//! take local memory and are left out of the budget.

use std::mem::size_of;

use log::debug;
use ndarray::{s, ArrayViewD, ArrayViewMut4, ArrayViewMutD, Axis};

use crate::backend::reference::{self, accumulate_feature_map, check_conv_shapes};
use crate::backend::{BackendType, ConvJob, EltwiseKind, KernelContext, Kernels};
use crate::error::{Error, Result};
use crate::model::{MemoryAssignment, SamplingLevel, TileReport};

const ELEMENT_BYTES: u64 = size_of::<f32>() as u64;

#[derive(Debug, Clone, Copy, Default)]
pub struct SmvKernels;

/// Split of a convolution into accelerator tiles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvTiling {
    pub channels_per_tile: usize,
    pub ofmaps_per_tile: usize,
    pub channel_tiles: usize,
    pub ofmap_tiles: usize,
}

impl ConvTiling {
    pub fn tiles_per_image(&self) -> usize {
        self.channel_tiles * self.ofmap_tiles
    }
}

/// Choose the largest tiles that fit `mem_size` bytes.
///
/// `input` is `(channels, rows, cols)` of one image, `kernel` is
/// `(rows, cols)` and `output` is `(ofmaps, rows, cols)`. Only the tensor
/// groups `memory` places in local memory count against `mem_size`.
pub fn plan_conv_tiles(
    input: (usize, usize, usize),
    kernel: (usize, usize),
    output: (usize, usize, usize),
    mem_size: u64,
    memory: MemoryAssignment,
) -> Result<ConvTiling> {
    let (channels, rows, cols) = input;
    let (ofmaps, out_rows, out_cols) = output;
    if channels == 0 || ofmaps == 0 {
        return Err(Error::ResourceExhausted(format!(
            "Cannot tile a convolution with {} channel(s) and {} output map(s)",
            channels, ofmaps
        )));
    }

    let local = |elements: usize, routed: bool| if routed { elements as u64 * ELEMENT_BYTES } else { 0 };
    let map_bytes = local(rows * cols, memory.inputs.uses_local_memory());
    let kernel_bytes = local(kernel.0 * kernel.1, memory.weights.uses_local_memory());
    let out_map_bytes = local(out_rows * out_cols, memory.outputs.uses_local_memory());

    // One output map must fit next to at least one input channel
    let per_channel = map_bytes + kernel_bytes;
    if mem_size < per_channel + out_map_bytes {
        return Err(Error::ResourceExhausted(format!(
            "A single convolution tile needs {} bytes but only {} are available",
            per_channel + out_map_bytes,
            mem_size
        )));
    }

    let channels_per_tile = match per_channel {
        0 => channels,
        bytes => (((mem_size - out_map_bytes) / bytes) as usize).min(channels),
    };
    let input_bytes = channels_per_tile as u64 * map_bytes;
    let ofmaps_per_tile = match channels_per_tile as u64 * kernel_bytes + out_map_bytes {
        0 => ofmaps,
        bytes => (((mem_size - input_bytes) / bytes) as usize).clamp(1, ofmaps),
    };

    Ok(ConvTiling {
        channels_per_tile,
        ofmaps_per_tile,
        channel_tiles: (channels + channels_per_tile - 1) / channels_per_tile,
        ofmap_tiles: (ofmaps + ofmaps_per_tile - 1) / ofmaps_per_tile,
    })
}

/// Number of tiles needed to stream `elements` through local memory with
/// `buffers` live arrays per tile
fn streaming_tiles(elements: usize, buffers: u64, mem_size: u64) -> Result<usize> {
    if buffers == 0 {
        return Ok(1);
    }
    let per_tile = (mem_size / (buffers * ELEMENT_BYTES)) as usize;
    if per_tile == 0 {
        return Err(Error::ResourceExhausted(format!(
            "{} bytes cannot hold one element of {} buffers",
            mem_size, buffers
        )));
    }
    Ok(((elements + per_tile - 1) / per_tile).max(1))
}

/// Arrays of an elementwise kernel that live in local memory
fn local_buffers(memory: &MemoryAssignment, inputs: u64) -> u64 {
    let inputs = if memory.inputs.uses_local_memory() { inputs } else { 0 };
    inputs + u64::from(memory.outputs.uses_local_memory())
}

impl Kernels for SmvKernels {
    fn backend(&self) -> BackendType {
        BackendType::Smv
    }

    fn convolution(
        &self,
        job: &ConvJob<'_>,
        mut output: ArrayViewMut4<'_, f32>,
        ctx: &KernelContext,
    ) -> Result<TileReport> {
        check_conv_shapes(job, &output)?;

        let (batches, channels, rows, cols) = job.input.dim();
        let (_, _, kr, kc) = job.kernels.dim();
        let (_, ofmaps, out_rows, out_cols) = output.dim();
        let tiling = plan_conv_tiles(
            (channels, rows, cols),
            (kr, kc),
            (ofmaps, out_rows, out_cols),
            ctx.resources.mem_size,
            ctx.memory,
        )?;
        debug!(
            "SMV convolution tiling {:?} over {} core(s) with {} bytes",
            tiling, ctx.num_cores, ctx.resources.mem_size
        );

        let sampling = &ctx.sampling;
        let batches_run = sampling.iterations_to_run(SamplingLevel::High, batches);
        let ofmap_tiles_run = sampling.iterations_to_run(SamplingLevel::Medium, tiling.ofmap_tiles);
        let channel_tiles_run = sampling.iterations_to_run(SamplingLevel::Low, tiling.channel_tiles);

        for b in 0..batches_run {
            let image = job.input.index_axis(Axis(0), b);
            let mut out_image = output.index_axis_mut(Axis(0), b);

            for ot in 0..ofmap_tiles_run {
                let k0 = ot * tiling.ofmaps_per_tile;
                let k1 = (k0 + tiling.ofmaps_per_tile).min(ofmaps);
                out_image.slice_mut(s![k0..k1, .., ..]).fill(0.0);

                for ct in 0..channel_tiles_run {
                    let c0 = ct * tiling.channels_per_tile;
                    let c1 = (c0 + tiling.channels_per_tile).min(channels);
                    let input_tile = image.slice(s![c0..c1, .., ..]);

                    for k in k0..k1 {
                        let kernel_tile = job.kernels.slice(s![k, c0..c1, .., ..]);
                        accumulate_feature_map(
                            input_tile,
                            kernel_tile,
                            job.stride,
                            out_image.index_axis_mut(Axis(0), k),
                        );
                    }
                }
            }
        }

        Ok(TileReport::new(
            batches * tiling.tiles_per_image(),
            batches_run * ofmap_tiles_run * channel_tiles_run,
        ))
    }

    fn eltwise(
        &self,
        kind: EltwiseKind,
        a: ArrayViewD<'_, f32>,
        b: ArrayViewD<'_, f32>,
        output: ArrayViewMutD<'_, f32>,
        ctx: &KernelContext,
    ) -> Result<TileReport> {
        let tiles = streaming_tiles(a.len(), local_buffers(&ctx.memory, 2), ctx.resources.mem_size)?;
        reference::eltwise(kind, a, b, output)?;
        Ok(TileReport::new(tiles, tiles))
    }

    fn activation(
        &self,
        function: fn(f32) -> f32,
        input: ArrayViewD<'_, f32>,
        output: ArrayViewMutD<'_, f32>,
        ctx: &KernelContext,
    ) -> Result<TileReport> {
        let tiles = streaming_tiles(input.len(), local_buffers(&ctx.memory, 1), ctx.resources.mem_size)?;
        reference::activation(function, input, output)?;
        Ok(TileReport::new(tiles, tiles))
    }
}
