use ndarray::{s, ArrayView3, ArrayViewD, ArrayViewMut2, ArrayViewMut4, ArrayViewMutD, Axis, Zip};

use crate::backend::{BackendType, ConvJob, EltwiseKind, KernelContext, Kernels, PoolJob, PoolKind};
use crate::error::{Error, Result};
use crate::model::{SamplingInfo, SamplingLevel, TileReport};

/// Straightforward single-threaded kernels
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceKernels;

impl Kernels for ReferenceKernels {
    fn backend(&self) -> BackendType {
        BackendType::Reference
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
        for b in 0..batches_run {
            let image = job.input.index_axis(Axis(0), b);
            let mut out_image = output.index_axis_mut(Axis(0), b);
            for (k, out_map) in out_image.outer_iter_mut().enumerate() {
                convolve_feature_map(image, job.kernels.index_axis(Axis(0), k), job.stride, out_map);
            }
        }

        Ok(TileReport::new(batches, batches_run))
    }
}

/// Verify that a valid convolution of `job` fits the output view
pub(crate) fn check_conv_shapes(job: &ConvJob<'_>, output: &ArrayViewMut4<'_, f32>) -> Result<()> {
    let (n, c, rows, cols) = job.input.dim();
    let (ofmaps, kc, kr, kcols) = job.kernels.dim();
    let (on, ok, orows, ocols) = output.dim();
    let (sr, sc) = job.stride;

    if c != kc {
        return Err(Error::ValidationError(format!(
            "Input has {} channels but kernels expect {}",
            c, kc
        )));
    }
    if n != on || ofmaps != ok {
        return Err(Error::ValidationError(format!(
            "Output {:?} does not match {} images x {} output maps",
            output.dim(),
            n,
            ofmaps
        )));
    }
    if sr == 0 || sc == 0 || kr == 0 || kcols == 0 {
        return Err(Error::ValidationError("Kernel and stride sizes must be positive".to_string()));
    }
    if orows > 0 && (orows - 1) * sr + kr > rows || ocols > 0 && (ocols - 1) * sc + kcols > cols {
        return Err(Error::ValidationError(format!(
            "Output {}x{} needs more than the {}x{} input",
            orows, ocols, rows, cols
        )));
    }
    Ok(())
}

/// Accumulate the valid correlation of one kernel over `input` into `out`
pub(crate) fn accumulate_feature_map(
    input: ArrayView3<'_, f32>,
    kernel: ArrayView3<'_, f32>,
    stride: (usize, usize),
    mut out: ArrayViewMut2<'_, f32>,
) {
    let (_, kr, kc) = kernel.dim();
    let (sr, sc) = stride;
    for ((r, c), o) in out.indexed_iter_mut() {
        let window = input.slice(s![.., r * sr..r * sr + kr, c * sc..c * sc + kc]);
        *o += window.iter().zip(kernel.iter()).map(|(a, b)| a * b).sum::<f32>();
    }
}

/// Overwrite `out` with the valid correlation of one kernel over `input`
pub(crate) fn convolve_feature_map(
    input: ArrayView3<'_, f32>,
    kernel: ArrayView3<'_, f32>,
    stride: (usize, usize),
    mut out: ArrayViewMut2<'_, f32>,
) {
    out.fill(0.0);
    accumulate_feature_map(input, kernel, stride, out);
}

pub(crate) fn pooling(
    job: &PoolJob<'_>,
    mut output: ArrayViewMut4<'_, f32>,
    sampling: &SamplingInfo,
) -> Result<TileReport> {
    let (n, c, rows, cols) = job.input.dim();
    let (on, oc, orows, ocols) = output.dim();
    let (pr, pc) = job.window;
    let (sr, sc) = job.stride;

    if n != on || c != oc {
        return Err(Error::ValidationError(format!(
            "Pooling output {:?} does not match input {:?}",
            output.dim(),
            job.input.dim()
        )));
    }
    if pr == 0 || pc == 0 || sr == 0 || sc == 0 {
        return Err(Error::ValidationError("Pool window and stride must be positive".to_string()));
    }
    if orows > 0 && (orows - 1) * sr + pr > rows || ocols > 0 && (ocols - 1) * sc + pc > cols {
        return Err(Error::ValidationError(format!(
            "Pooling output {}x{} needs more than the {}x{} input",
            orows, ocols, rows, cols
        )));
    }

    let batches_run = sampling.iterations_to_run(SamplingLevel::High, n);
    let channels_run = sampling.iterations_to_run(SamplingLevel::Low, c);
    for b in 0..batches_run {
        for ch in 0..channels_run {
            let map = job.input.slice(s![b, ch, .., ..]);
            for ((r, col), o) in output.slice_mut(s![b, ch, .., ..]).indexed_iter_mut() {
                let window = map.slice(s![r * sr..r * sr + pr, col * sc..col * sc + pc]);
                *o = match job.kind {
                    PoolKind::Max => window.iter().copied().fold(f32::NEG_INFINITY, f32::max),
                    PoolKind::Average => window.sum() / window.len() as f32,
                };
            }
        }
    }

    Ok(TileReport::new(n * c, batches_run * channels_run))
}

fn check_same_shape(what: &str, a: &[usize], b: &[usize]) -> Result<()> {
    if a != b {
        return Err(Error::ValidationError(format!(
            "{} operands have different shapes: {:?} vs {:?}",
            what, a, b
        )));
    }
    Ok(())
}

pub(crate) fn eltwise(
    kind: EltwiseKind,
    a: ArrayViewD<'_, f32>,
    b: ArrayViewD<'_, f32>,
    mut output: ArrayViewMutD<'_, f32>,
) -> Result<TileReport> {
    check_same_shape("Elementwise", a.shape(), b.shape())?;
    check_same_shape("Elementwise", a.shape(), output.shape())?;

    Zip::from(&mut output)
        .and(&a)
        .and(&b)
        .for_each(|o, &x, &y| *o = kind.apply(x, y));
    Ok(TileReport::new(1, 1))
}

pub(crate) fn activation(
    function: fn(f32) -> f32,
    input: ArrayViewD<'_, f32>,
    mut output: ArrayViewMutD<'_, f32>,
) -> Result<TileReport> {
    check_same_shape("Activation", input.shape(), output.shape())?;

    Zip::from(&mut output).and(&input).for_each(|o, &x| *o = function(x));
    Ok(TileReport::new(1, 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendConfig;
    use crate::model::MemoryAssignment;
    use ndarray::{Array, Array4};

    fn ctx() -> KernelContext {
        KernelContext {
            resources: BackendConfig::default(),
            num_cores: 1,
            memory: MemoryAssignment::default_for(BackendType::Reference),
            sampling: SamplingInfo::default(),
        }
    }

    #[test]
    fn test_convolution_sums_windows() {
        let input = Array::from_shape_vec((1, 1, 3, 3), (1..=9).map(|v| v as f32).collect()).unwrap();
        let kernels = Array4::<f32>::ones((2, 1, 2, 2));
        let mut output = Array4::<f32>::zeros((1, 2, 2, 2));

        let job = ConvJob { input: input.view(), kernels: kernels.view(), stride: (1, 1) };
        let report = ReferenceKernels.convolution(&job, output.view_mut(), &ctx()).unwrap();

        assert_eq!(report, TileReport::new(1, 1));
        for k in 0..2 {
            assert_eq!(output[[0, k, 0, 0]], 12.0);
            assert_eq!(output[[0, k, 0, 1]], 16.0);
            assert_eq!(output[[0, k, 1, 0]], 24.0);
            assert_eq!(output[[0, k, 1, 1]], 28.0);
        }
    }

    #[test]
    fn test_convolution_rejects_channel_mismatch() {
        let input = Array4::<f32>::zeros((1, 2, 3, 3));
        let kernels = Array4::<f32>::zeros((1, 3, 2, 2));
        let mut output = Array4::<f32>::zeros((1, 1, 2, 2));
        let job = ConvJob { input: input.view(), kernels: kernels.view(), stride: (1, 1) };
        assert!(ReferenceKernels.convolution(&job, output.view_mut(), &ctx()).is_err());
    }

    #[test]
    fn test_batch_sampling() {
        let input = Array4::<f32>::ones((4, 1, 2, 2));
        let kernels = Array4::<f32>::ones((1, 1, 2, 2));
        let mut output = Array4::<f32>::zeros((4, 1, 1, 1));
        let job = ConvJob { input: input.view(), kernels: kernels.view(), stride: (1, 1) };

        let mut sampled = ctx();
        sampled.sampling = SamplingInfo::new(SamplingLevel::High, 1);
        let report = ReferenceKernels.convolution(&job, output.view_mut(), &sampled).unwrap();

        assert_eq!(report, TileReport::new(4, 1));
        assert!(report.is_sampled());
        assert_eq!(output[[0, 0, 0, 0]], 4.0);
        assert_eq!(output[[1, 0, 0, 0]], 0.0);
    }

    #[test]
    fn test_pooling() {
        let input = Array::from_shape_vec((1, 1, 2, 4), vec![1.0, 5.0, 2.0, 0.0, 3.0, 4.0, 8.0, 6.0]).unwrap();
        let mut max_out = Array4::<f32>::zeros((1, 1, 1, 2));
        let mut avg_out = Array4::<f32>::zeros((1, 1, 1, 2));

        let max_job = PoolJob { input: input.view(), kind: PoolKind::Max, window: (2, 2), stride: (2, 2) };
        pooling(&max_job, max_out.view_mut(), &SamplingInfo::default()).unwrap();
        assert_eq!(max_out.iter().copied().collect::<Vec<_>>(), vec![5.0, 8.0]);

        let avg_job = PoolJob { kind: PoolKind::Average, ..max_job };
        pooling(&avg_job, avg_out.view_mut(), &SamplingInfo::default()).unwrap();
        assert_eq!(avg_out.iter().copied().collect::<Vec<_>>(), vec![3.25, 4.0]);
    }

    #[test]
    fn test_eltwise_shape_mismatch() {
        let a = Array::<f32, _>::zeros(ndarray::IxDyn(&[2, 2]));
        let b = Array::<f32, _>::zeros(ndarray::IxDyn(&[2, 3]));
        let mut out = Array::<f32, _>::zeros(ndarray::IxDyn(&[2, 2]));
        assert!(eltwise(EltwiseKind::Add, a.view(), b.view(), out.view_mut()).is_err());
    }
}
