use log::trace;
use ndarray::parallel::prelude::*;
use ndarray::{ArrayViewD, ArrayViewMut4, ArrayViewMutD, Axis, Zip};

use crate::backend::reference::{check_conv_shapes, convolve_feature_map};
use crate::backend::{BackendType, ConvJob, EltwiseKind, KernelContext, Kernels};
use crate::error::{Error, Result};
use crate::model::{SamplingLevel, TileReport};

/// Multi-core kernels; output feature maps are computed in parallel on the
/// current rayon pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuKernels;

impl Kernels for CpuKernels {
    fn backend(&self) -> BackendType {
        BackendType::Cpu
    }

    fn convolution(
        &self,
        job: &ConvJob<'_>,
        mut output: ArrayViewMut4<'_, f32>,
        ctx: &KernelContext,
    ) -> Result<TileReport> {
        check_conv_shapes(job, &output)?;

        let batches = output.len_of(Axis(0));
        let batches_run = ctx.sampling.iterations_to_run(SamplingLevel::High, batches);
        trace!(
            "CPU convolution: {} of {} images on {} core(s)",
            batches_run,
            batches,
            ctx.num_cores
        );

        let kernels = job.kernels;
        let stride = job.stride;
        for b in 0..batches_run {
            let image = job.input.index_axis(Axis(0), b);
            output
                .index_axis_mut(Axis(0), b)
                .axis_iter_mut(Axis(0))
                .into_par_iter()
                .enumerate()
                .for_each(|(k, out_map)| {
                    convolve_feature_map(image, kernels.index_axis(Axis(0), k), stride, out_map)
                });
        }

        Ok(TileReport::new(batches, batches_run))
    }

    fn eltwise(
        &self,
        kind: EltwiseKind,
        a: ArrayViewD<'_, f32>,
        b: ArrayViewD<'_, f32>,
        mut output: ArrayViewMutD<'_, f32>,
        _ctx: &KernelContext,
    ) -> Result<TileReport> {
        if a.shape() != b.shape() || a.shape() != output.shape() {
            return Err(Error::ValidationError(format!(
                "Elementwise operands have different shapes: {:?}, {:?} -> {:?}",
                a.shape(),
                b.shape(),
                output.shape()
            )));
        }

        Zip::from(&mut output)
            .and(&a)
            .and(&b)
            .par_for_each(|o, &x, &y| *o = kind.apply(x, y));
        Ok(TileReport::new(1, 1))
    }

    fn activation(
        &self,
        function: fn(f32) -> f32,
        input: ArrayViewD<'_, f32>,
        mut output: ArrayViewMutD<'_, f32>,
        _ctx: &KernelContext,
    ) -> Result<TileReport> {
        if input.shape() != output.shape() {
            return Err(Error::ValidationError(format!(
                "Activation input {:?} and output {:?} differ",
                input.shape(),
                output.shape()
            )));
        }

        Zip::from(&mut output).and(&input).par_for_each(|o, &x| *o = function(x));
        Ok(TileReport::new(1, 1))
    }
}
