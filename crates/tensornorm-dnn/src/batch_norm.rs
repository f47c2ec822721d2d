//! Batch Normalization - Accelerated Forward, Backward and Inference
//!
//! Runs batch normalization through a [`BatchNormPrimitive`], reconciling
//! arbitrary caller tensors with what the primitive needs: contiguous
//! memory, per-channel buffers in the statistics precision, and running
//! statistics that are updated in place.
//!
//! # Operations
//! - [`BatchNorm::forward`] - Normalize with batch statistics, update running statistics
//! - [`BatchNorm::backward`] - Gradients of input, scale and shift from forward's state
//! - [`BatchNorm::fixed_forward`] - Normalize with given statistics
//!
//! # Example
//! ```rust
//! use tensornorm_dnn::{BatchNorm, BatchNormForwardArgs};
//! use tensornorm_tensor::{empty_like, ones, zeros, Axes, DType, Device, Tensor};
//!
//! let bn = BatchNorm::host();
//! let x = Tensor::from_vec((0..16).map(|i| i as f32).collect::<Vec<_>>(), &[2, 2, 2, 2]).unwrap();
//! let gamma = ones(&[1, 2, 1, 1], DType::F32, Device::Cpu);
//! let beta = zeros(&[1, 2, 1, 1], DType::F32, Device::Cpu);
//! let running_mean = zeros(&[2], DType::F32, Device::Cpu);
//! let running_var = ones(&[2], DType::F32, Device::Cpu);
//! let out = empty_like(&x);
//! let axis = Axes::from([0, 2, 3]);
//!
//! let state = bn
//!     .forward(
//!         &BatchNormForwardArgs {
//!             x: &x,
//!             gamma: &gamma,
//!             beta: &beta,
//!             running_mean: &running_mean,
//!             running_var: &running_var,
//!             eps: 2e-5,
//!             decay: 0.9,
//!             axis: &axis,
//!             out: &out,
//!         },
//!         true,
//!     )
//!     .unwrap();
//! assert!(state.is_some());
//! ```
//!
//! @version 0.1.0

use tracing::{debug, trace};

use tensornorm_core::dtype::DType;
use tensornorm_core::error::{Error, Result};
use tensornorm_core::DeviceScope;
use tensornorm_tensor::{empty_like, Axes, Tensor};

use crate::config::BatchNormConfig;
use crate::descriptor::{BnTensorDescriptor, TensorDescriptor};
use crate::host::HostPrimitive;
use crate::mode::{resolve_mode, BatchNormMode};
use crate::primitive::{
    BackwardArgs, BatchNormPrimitive, Coefficient, ForwardInferenceArgs, ForwardTrainingArgs,
};
use crate::state::{BatchNormState, OpState};

// =============================================================================
// Arguments
// =============================================================================

/// Arguments of [`BatchNorm::forward`].
#[derive(Debug, Clone, Copy)]
pub struct BatchNormForwardArgs<'a> {
    /// Input.
    pub x: &'a Tensor,
    /// Scale, shaped like `x` reduced over `axis` with kept dimensions.
    pub gamma: &'a Tensor,
    /// Shift, shaped like `gamma`.
    pub beta: &'a Tensor,
    /// Running mean, contiguous, as many elements as `gamma`. Updated in place.
    pub running_mean: &'a Tensor,
    /// Running variance, contiguous, as many elements as `gamma`. Updated in place.
    pub running_var: &'a Tensor,
    /// Variance epsilon.
    pub eps: f64,
    /// Weight of the old running value in the running average.
    pub decay: f64,
    /// Reduction axes.
    pub axis: &'a Axes,
    /// Receives the normalized output, shaped like `x`.
    pub out: &'a Tensor,
}

/// Arguments of [`BatchNorm::backward`].
#[derive(Debug, Clone, Copy)]
pub struct BatchNormBackwardArgs<'a> {
    /// Scale used in forward.
    pub gamma: &'a Tensor,
    /// Gradient of the forward output.
    pub gout: &'a Tensor,
    /// Variance epsilon used in forward.
    pub eps: f64,
    /// Reduction axes used in forward.
    pub axis: &'a Axes,
    /// Receives the input gradient.
    pub gx: &'a Tensor,
    /// Receives the scale gradient.
    pub ggamma: &'a Tensor,
    /// Receives the shift gradient.
    pub gbeta: &'a Tensor,
}

/// Arguments of [`BatchNorm::fixed_forward`].
#[derive(Debug, Clone, Copy)]
pub struct FixedBatchNormArgs<'a> {
    /// Input.
    pub x: &'a Tensor,
    /// Scale.
    pub gamma: &'a Tensor,
    /// Shift.
    pub beta: &'a Tensor,
    /// Fixed mean.
    pub mean: &'a Tensor,
    /// Fixed variance.
    pub var: &'a Tensor,
    /// Variance epsilon.
    pub eps: f64,
    /// Reduction axes.
    pub axis: &'a Axes,
    /// Receives the normalized output, shaped like `x`.
    pub out: &'a Tensor,
}

// =============================================================================
// BatchNorm
// =============================================================================

/// Batch normalization backed by a primitive library.
#[derive(Debug)]
pub struct BatchNorm<P: BatchNormPrimitive = HostPrimitive> {
    primitive: P,
    config: BatchNormConfig,
}

impl BatchNorm<HostPrimitive> {
    /// Creates batch normalization over the host primitive.
    #[must_use]
    pub fn host() -> Self {
        Self::new(HostPrimitive::new())
    }
}

impl<P: BatchNormPrimitive> BatchNorm<P> {
    /// Creates batch normalization over `primitive` with default settings.
    pub fn new(primitive: P) -> Self {
        Self::with_config(primitive, BatchNormConfig::default())
    }

    /// Creates batch normalization over `primitive` with `config`.
    pub fn with_config(primitive: P, config: BatchNormConfig) -> Self {
        Self { primitive, config }
    }

    /// Returns the primitive library.
    pub fn primitive(&self) -> &P {
        &self.primitive
    }

    /// Returns the settings.
    pub fn config(&self) -> &BatchNormConfig {
        &self.config
    }

    // =========================================================================
    // Forward (training)
    // =========================================================================

    /// Normalizes `x` with its batch statistics and updates the running
    /// statistics in place.
    ///
    /// With `retain_state` the returned state carries what
    /// [`BatchNorm::backward`] needs.
    pub fn forward(
        &self,
        args: &BatchNormForwardArgs<'_>,
        retain_state: bool,
    ) -> Result<Option<OpState>> {
        if self.config.checks_enabled() {
            check_forward_args(args)?;
        }
        check_epsilon(args.eps, self.primitive.min_epsilon())?;
        if !args.running_mean.is_contiguous() {
            return Err(Error::layout(
                "Running mean must be contiguous to be updated in place.",
            ));
        }
        if !args.running_var.is_contiguous() {
            return Err(Error::layout(
                "Running variance must be contiguous to be updated in place.",
            ));
        }

        let _scope = DeviceScope::enter(args.x.device())?;

        let x_cont = args.x.as_contiguous();
        let x_desc = TensorDescriptor::new(&self.primitive, &x_cont)?;
        let mode = resolve_mode(args.axis)?;
        let bn_desc = BnTensorDescriptor::new(&self.primitive, &x_desc, mode)?;
        let stats_dtype = bn_desc.dtype()?;
        log_entry("batch_norm_forward", mode, &x_cont, stats_dtype);

        let gamma = cast_param("gamma", args.gamma, stats_dtype);
        let beta = cast_param("beta", args.beta, stats_dtype);
        let running_mean = cast_running("running_mean", args.running_mean, stats_dtype);
        let running_var = cast_running("running_var", args.running_var, stats_dtype);

        let x_mean = empty_like(&gamma);
        let x_inv_std = empty_like(&gamma);
        let out = OutputTarget::new(args.out, &x_cont);

        let channels = bn_desc.numel()?;
        ensure_numel("out", out.tensor(), x_cont.numel())?;
        for (name, t) in [
            ("gamma", &gamma),
            ("beta", &beta),
            ("running_mean", &running_mean),
            ("running_var", &running_var),
        ] {
            ensure_numel(name, t, channels)?;
        }

        let dtype = x_cont.dtype();
        let call = ForwardTrainingArgs {
            mode,
            alpha: Coefficient::one(dtype),
            beta: Coefficient::zero(dtype),
            x_desc: x_desc.handle(),
            x: x_cont.data_ptr()?.cast_const(),
            y: out.tensor().data_ptr()?,
            bn_desc: bn_desc.handle(),
            scale: gamma.data_ptr()?.cast_const(),
            bias: beta.data_ptr()?.cast_const(),
            exponential_average_factor: 1.0 - args.decay,
            running_mean: running_mean.data_ptr()?,
            running_var: running_var.data_ptr()?,
            epsilon: args.eps,
            save_mean: x_mean.data_ptr()?,
            save_inv_std: x_inv_std.data_ptr()?,
        };
        // SAFETY: every buffer is contiguous, alive until the end of this
        // function, and holds as many elements as its descriptor describes.
        unsafe { self.primitive.forward_training(&call) }?;

        out.finish()?;
        update_running(args.running_mean, &running_mean)?;
        update_running(args.running_var, &running_var)?;

        Ok(retain_state.then(|| OpState::new(BatchNormState::new(x_cont, x_mean, x_inv_std))))
    }

    // =========================================================================
    // Backward
    // =========================================================================

    /// Computes the gradients of the input, scale and shift.
    ///
    /// `state` must be the state returned by [`BatchNorm::forward`] with
    /// `retain_state`; statistics are never recomputed.
    pub fn backward(&self, args: &BatchNormBackwardArgs<'_>, state: Option<&OpState>) -> Result<()> {
        let state = state
            .ok_or(Error::MissingState)?
            .downcast_ref::<BatchNormState>()?;
        let x_cont = state.x_cont();

        if self.config.checks_enabled() {
            check_backward_args(args, x_cont)?;
        }
        check_epsilon(args.eps, self.primitive.min_epsilon())?;

        let _scope = DeviceScope::enter(x_cont.device())?;

        let gout_cont = args.gout.as_contiguous_with_dtype(x_cont.dtype());
        let gx_cont = empty_like(x_cont);

        let x_desc = TensorDescriptor::new(&self.primitive, x_cont)?;
        let mode = resolve_mode(args.axis)?;
        let bn_desc = BnTensorDescriptor::new(&self.primitive, &x_desc, mode)?;
        let stats_dtype = bn_desc.dtype()?;
        log_entry("batch_norm_backward", mode, x_cont, stats_dtype);

        let gamma = cast_param("gamma", args.gamma, stats_dtype);
        let ggamma_cast = empty_like(&gamma);
        let gbeta_cast = empty_like(&gamma);

        let channels = bn_desc.numel()?;
        ensure_numel("gout", &gout_cont, x_cont.numel())?;
        for (name, t) in [
            ("gamma", &gamma),
            ("x_mean", state.x_mean()),
            ("x_inv_std", state.x_inv_std()),
        ] {
            ensure_numel(name, t, channels)?;
        }
        for (name, t) in [("x_mean", state.x_mean()), ("x_inv_std", state.x_inv_std())] {
            if t.dtype() != stats_dtype || !t.is_contiguous() {
                return Err(Error::invalid_operation(format!(
                    "{name} in the op state does not match the statistics layout"
                )));
            }
        }

        let dtype = x_cont.dtype();
        let call = BackwardArgs {
            mode,
            alpha_data: Coefficient::one(dtype),
            beta_data: Coefficient::zero(dtype),
            alpha_param: Coefficient::one(dtype),
            beta_param: Coefficient::zero(dtype),
            x_desc: x_desc.handle(),
            x: x_cont.data_ptr()?.cast_const(),
            dy: gout_cont.data_ptr()?.cast_const(),
            dx: gx_cont.data_ptr()?,
            bn_desc: bn_desc.handle(),
            scale: gamma.data_ptr()?.cast_const(),
            scale_grad: ggamma_cast.data_ptr()?,
            bias_grad: gbeta_cast.data_ptr()?,
            epsilon: args.eps,
            saved_mean: state.x_mean().data_ptr()?.cast_const(),
            saved_inv_std: state.x_inv_std().data_ptr()?.cast_const(),
        };
        // SAFETY: as in `forward`.
        unsafe { self.primitive.backward(&call) }?;

        gx_cont.cast_into(args.gx)?;
        ggamma_cast.cast_into(args.ggamma)?;
        gbeta_cast.cast_into(args.gbeta)?;
        Ok(())
    }

    // =========================================================================
    // Forward (inference)
    // =========================================================================

    /// Normalizes `x` with the given mean and variance.
    pub fn fixed_forward(&self, args: &FixedBatchNormArgs<'_>) -> Result<()> {
        if self.config.checks_enabled() {
            check_fixed_args(args)?;
        }
        check_epsilon(args.eps, self.primitive.min_epsilon())?;

        let _scope = DeviceScope::enter(args.x.device())?;

        let x_cont = args.x.as_contiguous();
        let x_desc = TensorDescriptor::new(&self.primitive, &x_cont)?;
        let mode = resolve_mode(args.axis)?;
        let bn_desc = BnTensorDescriptor::new(&self.primitive, &x_desc, mode)?;
        let stats_dtype = bn_desc.dtype()?;
        log_entry("fixed_batch_norm_forward", mode, &x_cont, stats_dtype);

        let gamma = cast_param("gamma", args.gamma, stats_dtype);
        let beta = cast_param("beta", args.beta, stats_dtype);
        let mean = cast_param("mean", args.mean, stats_dtype);
        let var = cast_param("var", args.var, stats_dtype);
        let out = OutputTarget::new(args.out, &x_cont);

        let channels = bn_desc.numel()?;
        ensure_numel("out", out.tensor(), x_cont.numel())?;
        for (name, t) in [("gamma", &gamma), ("beta", &beta), ("mean", &mean), ("var", &var)] {
            ensure_numel(name, t, channels)?;
        }

        let dtype = x_cont.dtype();
        let call = ForwardInferenceArgs {
            mode,
            alpha: Coefficient::one(dtype),
            beta: Coefficient::zero(dtype),
            x_desc: x_desc.handle(),
            x: x_cont.data_ptr()?.cast_const(),
            y: out.tensor().data_ptr()?,
            bn_desc: bn_desc.handle(),
            scale: gamma.data_ptr()?.cast_const(),
            bias: beta.data_ptr()?.cast_const(),
            estimated_mean: mean.data_ptr()?.cast_const(),
            estimated_var: var.data_ptr()?.cast_const(),
            epsilon: args.eps,
        };
        // SAFETY: as in `forward`.
        unsafe { self.primitive.forward_inference(&call) }?;

        out.finish()
    }
}

// =============================================================================
// Shared Helpers
// =============================================================================

/// Fails unless `eps` is at least the primitive's minimum. NaN always fails.
pub fn check_epsilon(eps: f64, min: f64) -> Result<()> {
    if eps.is_nan() || eps < min {
        return Err(Error::Epsilon { min, found: eps });
    }
    Ok(())
}

/// Writes running statistics updated in the statistics dtype back into the
/// caller's buffer.
///
/// When the dtypes agree the primitive already updated `running` in place
/// and nothing is copied.
pub fn update_running(running: &Tensor, running_updated: &Tensor) -> Result<()> {
    if running.dtype() == running_updated.dtype() {
        debug_assert!(running.shares_data_with(running_updated));
        return Ok(());
    }
    debug!(
        from = %running_updated.dtype(),
        to = %running.dtype(),
        numel = running.numel(),
        "writing back running statistics"
    );
    let back = running_updated.astype(running.dtype());
    running.memory_copy_from(&back)
}

fn cast_param(name: &str, t: &Tensor, dtype: DType) -> Tensor {
    if t.dtype() != dtype {
        trace!(param = name, from = %t.dtype(), to = %dtype, "casting to statistics dtype");
    }
    t.as_contiguous_with_dtype(dtype)
}

fn cast_running(name: &str, running: &Tensor, dtype: DType) -> Tensor {
    if running.dtype() == dtype {
        return running.clone();
    }
    trace!(param = name, from = %running.dtype(), to = %dtype, "casting running statistics");
    running.astype(dtype)
}

fn ensure_numel(name: &str, t: &Tensor, expected: usize) -> Result<()> {
    if t.numel() != expected {
        return Err(Error::invalid_operation(format!(
            "{name} holds {} elements, expected {expected}",
            t.numel()
        )));
    }
    Ok(())
}

fn log_entry(op: &str, mode: BatchNormMode, x: &Tensor, stats_dtype: DType) {
    debug!(
        op,
        %mode,
        dtype = %x.dtype(),
        %stats_dtype,
        shape = ?x.shape(),
        device = %x.device(),
        "batch normalization"
    );
}

/// Where the primitive writes an output: the caller's tensor when it has
/// the primitive's layout, a scratch buffer copied into it otherwise.
struct OutputTarget<'a> {
    out: &'a Tensor,
    scratch: Option<Tensor>,
}

impl<'a> OutputTarget<'a> {
    fn new(out: &'a Tensor, like: &Tensor) -> Self {
        let direct = out.is_contiguous() && out.dtype() == like.dtype();
        Self {
            out,
            scratch: (!direct).then(|| empty_like(like)),
        }
    }

    fn tensor(&self) -> &Tensor {
        self.scratch.as_ref().unwrap_or(self.out)
    }

    fn finish(self) -> Result<()> {
        match self.scratch {
            Some(scratch) => scratch.cast_into(self.out),
            None => Ok(()),
        }
    }
}

// =============================================================================
// Argument Checks
// =============================================================================

fn check_shape(name: &str, t: &Tensor, expected: &[usize]) -> Result<()> {
    if t.shape() != expected {
        return Err(annotate(name, Error::shape_mismatch(expected, t.shape())));
    }
    Ok(())
}

fn check_device(name: &str, t: &Tensor, like: &Tensor) -> Result<()> {
    if t.device() != like.device() {
        return Err(annotate(
            name,
            Error::DeviceMismatch {
                expected: like.device(),
                actual: t.device(),
            },
        ));
    }
    Ok(())
}

fn check_float(name: &str, t: &Tensor) -> Result<()> {
    if !t.dtype().is_float() {
        return Err(Error::unsupported_dtype(format!(
            "{name} must be floating point, found {}",
            t.dtype()
        )));
    }
    Ok(())
}

fn annotate(name: &str, err: Error) -> Error {
    debug!(argument = name, error = %err, "argument check failed");
    err
}

fn check_forward_args(args: &BatchNormForwardArgs<'_>) -> Result<()> {
    let reduced = args.x.reduced_shape(args.axis, true)?;
    let channels: usize = reduced.iter().product();
    check_shape("gamma", args.gamma, &reduced)?;
    check_shape("beta", args.beta, &reduced)?;
    check_shape("out", args.out, args.x.shape())?;
    for (name, t) in [
        ("running_mean", args.running_mean),
        ("running_var", args.running_var),
    ] {
        ensure_numel(name, t, channels)?;
    }
    for (name, t) in [
        ("gamma", args.gamma),
        ("beta", args.beta),
        ("running_mean", args.running_mean),
        ("running_var", args.running_var),
        ("out", args.out),
    ] {
        check_device(name, t, args.x)?;
        check_float(name, t)?;
    }
    check_float("x", args.x)
}

fn check_backward_args(args: &BatchNormBackwardArgs<'_>, x_cont: &Tensor) -> Result<()> {
    let reduced = x_cont.reduced_shape(args.axis, true)?;
    check_shape("gamma", args.gamma, &reduced)?;
    check_shape("gout", args.gout, x_cont.shape())?;
    check_shape("gx", args.gx, x_cont.shape())?;
    check_shape("ggamma", args.ggamma, &reduced)?;
    check_shape("gbeta", args.gbeta, &reduced)?;
    for (name, t) in [
        ("gamma", args.gamma),
        ("gout", args.gout),
        ("gx", args.gx),
        ("ggamma", args.ggamma),
        ("gbeta", args.gbeta),
    ] {
        check_device(name, t, x_cont)?;
        check_float(name, t)?;
    }
    Ok(())
}

fn check_fixed_args(args: &FixedBatchNormArgs<'_>) -> Result<()> {
    let reduced = args.x.reduced_shape(args.axis, true)?;
    check_shape("out", args.out, args.x.shape())?;
    for (name, t) in [
        ("gamma", args.gamma),
        ("beta", args.beta),
        ("mean", args.mean),
        ("var", args.var),
    ] {
        check_shape(name, t, &reduced)?;
    }
    for (name, t) in [
        ("gamma", args.gamma),
        ("beta", args.beta),
        ("mean", args.mean),
        ("var", args.var),
        ("out", args.out),
    ] {
        check_device(name, t, args.x)?;
        check_float(name, t)?;
    }
    check_float("x", args.x)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitive::{
        DataType, DescriptorHandle, PrimitiveResult, TensorDescriptorInfo,
    };
    use half::f16;
    use parking_lot::Mutex;
    use tensornorm_core::device::{current_device, scope_depth};
    use tensornorm_core::Device;
    use tensornorm_tensor::{empty, full, ones, zeros};

    const EPS: f64 = 2e-5;

    fn sample(shape: &[usize], seed: usize) -> Tensor {
        let n: usize = shape.iter().product();
        let data: Vec<f64> = (0..n)
            .map(|i| ((i * 37 + seed * 11) % 23) as f64 * 0.17 - 1.9)
            .collect();
        Tensor::from_vec(data, shape).unwrap()
    }

    fn on_device(t: &Tensor, device: Device) -> Tensor {
        Tensor::from_vec_on(t.to_vec::<f64>(), t.shape(), device).unwrap()
    }

    fn spatial() -> Axes {
        Axes::from([0, 2, 3])
    }

    struct Fixture {
        x: Tensor,
        gamma: Tensor,
        beta: Tensor,
        running_mean: Tensor,
        running_var: Tensor,
        out: Tensor,
        axis: Axes,
    }

    impl Fixture {
        fn new(x: Tensor, axis: Axes) -> Self {
            let reduced = x.reduced_shape(&axis, true).unwrap();
            let channels: usize = reduced.iter().product();
            Self {
                gamma: on_device(&sample(&reduced, 1), x.device()),
                beta: on_device(&sample(&reduced, 2), x.device()),
                running_mean: zeros(&[channels], DType::F64, x.device()),
                running_var: ones(&[channels], DType::F64, x.device()),
                out: empty_like(&x),
                x,
                axis,
            }
        }

        fn args(&self) -> BatchNormForwardArgs<'_> {
            BatchNormForwardArgs {
                x: &self.x,
                gamma: &self.gamma,
                beta: &self.beta,
                running_mean: &self.running_mean,
                running_var: &self.running_var,
                eps: EPS,
                decay: 0.9,
                axis: &self.axis,
                out: &self.out,
            }
        }
    }

    /// Per-channel batch mean and biased variance for spatial axes.
    fn channel_stats(x: &Tensor) -> (Vec<f64>, Vec<f64>) {
        let shape = x.shape();
        let channels = shape[1];
        let mut sums = vec![0.0; channels];
        let mut sq = vec![0.0; channels];
        let mut count = vec![0usize; channels];
        let values = x.to_f64_vec();
        let inner: usize = shape[2..].iter().product();
        for (i, v) in values.iter().enumerate() {
            let c = (i / inner) % channels;
            sums[c] += v;
            count[c] += 1;
        }
        let mean: Vec<f64> = sums.iter().zip(&count).map(|(s, &n)| s / n as f64).collect();
        for (i, v) in values.iter().enumerate() {
            let c = (i / inner) % channels;
            sq[c] += (v - mean[c]).powi(2);
        }
        let var = sq.iter().zip(&count).map(|(s, &n)| s / n as f64).collect();
        (mean, var)
    }

    #[test]
    fn test_forward_normalizes_per_channel() {
        let bn = BatchNorm::host();
        let f = Fixture::new(sample(&[3, 2, 2, 2], 0), spatial());
        let state = bn.forward(&f.args(), false).unwrap();
        assert!(state.is_none());

        let (mean, var) = channel_stats(&f.x);
        let gamma = f.gamma.to_f64_vec();
        let beta = f.beta.to_f64_vec();
        for n in 0..3 {
            for c in 0..2 {
                for h in 0..2 {
                    for w in 0..2 {
                        let x = f.x.get(&[n, c, h, w]).unwrap();
                        let expected = gamma[c] * (x - mean[c]) / (var[c] + EPS).sqrt() + beta[c];
                        let y = f.out.get(&[n, c, h, w]).unwrap();
                        assert!((y - expected).abs() < 1e-10);
                    }
                }
            }
        }
    }

    #[test]
    fn test_running_statistics_update() {
        let bn = BatchNorm::host();
        let f = Fixture::new(sample(&[4, 3, 2, 1], 5), spatial());
        f.running_mean.set(&[1], 0.5).unwrap();
        bn.forward(&f.args(), false).unwrap();

        let (mean, var) = channel_stats(&f.x);
        let m = 8.0;
        let rm = f.running_mean.to_f64_vec();
        let rv = f.running_var.to_f64_vec();
        for c in 0..3 {
            let old_mean = if c == 1 { 0.5 } else { 0.0 };
            assert!((rm[c] - (0.9 * old_mean + 0.1 * mean[c])).abs() < 1e-12);
            assert!((rv[c] - (0.9 + 0.1 * var[c] * m / (m - 1.0))).abs() < 1e-12);
        }
    }

    #[test]
    fn test_running_statistics_in_other_precision() {
        let bn = BatchNorm::host();
        let x = sample(&[4, 2, 2, 2], 3).astype(DType::F32);
        let gamma = ones(&[1, 2, 1, 1], DType::F32, Device::Cpu);
        let beta = zeros(&[1, 2, 1, 1], DType::F32, Device::Cpu);
        let running_mean = full(&[2], 0.25, DType::F16, Device::Cpu);
        let running_var = ones(&[2], DType::F16, Device::Cpu);
        let out = empty_like(&x);
        let axis = spatial();

        bn.forward(
            &BatchNormForwardArgs {
                x: &x,
                gamma: &gamma,
                beta: &beta,
                running_mean: &running_mean,
                running_var: &running_var,
                eps: EPS,
                decay: 0.9,
                axis: &axis,
                out: &out,
            },
            false,
        )
        .unwrap();

        assert_eq!(running_mean.dtype(), DType::F16);
        let (mean, var) = channel_stats(&x);
        let rm = running_mean.to_vec::<f16>();
        let rv = running_var.to_vec::<f16>();
        for c in 0..2 {
            let expected_mean = 0.9 * 0.25 + 0.1 * mean[c];
            let expected_var = 0.9 + 0.1 * var[c] * 16.0 / 15.0;
            assert!((rm[c].to_f64() - expected_mean).abs() < 1e-3);
            assert!((rv[c].to_f64() - expected_var).abs() < 2e-3);
        }
    }

    #[test]
    fn test_half_input_uses_float_statistics() {
        let bn = BatchNorm::host();
        let x = sample(&[2, 3, 2, 2], 4).astype(DType::F16);
        let gamma = ones(&[1, 3, 1, 1], DType::F16, Device::Cpu);
        let beta = zeros(&[1, 3, 1, 1], DType::F16, Device::Cpu);
        let running_mean = zeros(&[3], DType::F16, Device::Cpu);
        let running_var = ones(&[3], DType::F16, Device::Cpu);
        let out = empty_like(&x);
        let axis = spatial();

        let state = bn
            .forward(
                &BatchNormForwardArgs {
                    x: &x,
                    gamma: &gamma,
                    beta: &beta,
                    running_mean: &running_mean,
                    running_var: &running_var,
                    eps: EPS,
                    decay: 0.9,
                    axis: &axis,
                    out: &out,
                },
                true,
            )
            .unwrap()
            .unwrap();
        let saved = state.downcast_ref::<BatchNormState>().unwrap();
        assert_eq!(saved.x_mean().dtype(), DType::F32);
        assert_eq!(saved.x_inv_std().dtype(), DType::F32);
        assert_eq!(out.dtype(), DType::F16);

        let (mean, _) = channel_stats(&x);
        for (c, m) in saved.x_mean().to_f64_vec().iter().enumerate() {
            assert!((m - mean[c]).abs() < 1e-5);
        }
    }

    #[test]
    fn test_per_activation_on_matrix() {
        let bn = BatchNorm::host();
        let f = Fixture::new(sample(&[5, 3], 7), Axes::from([0]));
        bn.forward(&f.args(), false).unwrap();

        for c in 0..3 {
            let column: Vec<f64> = (0..5).map(|n| f.x.get(&[n, c]).unwrap()).collect();
            let mean = column.iter().sum::<f64>() / 5.0;
            let var = column.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / 5.0;
            let g = f.gamma.get(&[0, c]).unwrap();
            let b = f.beta.get(&[0, c]).unwrap();
            for n in 0..5 {
                let expected = g * (column[n] - mean) / (var + EPS).sqrt() + b;
                assert!((f.out.get(&[n, c]).unwrap() - expected).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn test_per_activation_on_images() {
        let bn = BatchNorm::host();
        let f = Fixture::new(sample(&[3, 2, 2, 2], 4), Axes::from([0]));
        assert_eq!(f.gamma.shape(), &[1, 2, 2, 2]);
        bn.forward(&f.args(), false).unwrap();

        let rm = f.running_mean.to_f64_vec();
        for c in 0..2 {
            for h in 0..2 {
                for w in 0..2 {
                    let column: Vec<f64> = (0..3).map(|n| f.x.get(&[n, c, h, w]).unwrap()).collect();
                    let mean = column.iter().sum::<f64>() / 3.0;
                    let var = column.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / 3.0;
                    let g = f.gamma.get(&[0, c, h, w]).unwrap();
                    let b = f.beta.get(&[0, c, h, w]).unwrap();
                    for n in 0..3 {
                        let expected = g * (column[n] - mean) / (var + EPS).sqrt() + b;
                        assert!((f.out.get(&[n, c, h, w]).unwrap() - expected).abs() < 1e-10);
                    }
                    assert!((rm[c * 4 + h * 2 + w] - 0.1 * mean).abs() < 1e-12);
                }
            }
        }
    }

    #[test]
    fn test_unit_channel_with_zero_stride() {
        let bn = BatchNorm::host();
        let base = sample(&[2, 1, 2, 2], 6);
        let expected = Fixture::new(base.clone(), spatial());
        bn.forward(&expected.args(), false).unwrap();

        let x = base.as_strided(&[2, 1, 2, 2], &[4, 0, 2, 1], 0).unwrap();
        assert!(x.is_contiguous());
        let f = Fixture::new(x, spatial());
        let state = bn.forward(&f.args(), true).unwrap();
        assert!(state.is_some());
        assert_eq!(f.out.to_f64_vec(), expected.out.to_f64_vec());
        assert_eq!(bn.primitive().live_descriptors(), 0);
    }

    #[test]
    fn test_strided_input_and_output() {
        let bn = BatchNorm::host();
        let base = sample(&[2, 3, 2, 2], 9);
        let f = Fixture::new(base.clone(), spatial());
        bn.forward(&f.args(), false).unwrap();

        // Same values reached through non-contiguous views.
        let x_t = base.as_contiguous().transpose(2, 3).unwrap().as_contiguous().transpose(2, 3).unwrap();
        assert!(!x_t.is_contiguous());
        let out_base = empty(&[2, 3, 2, 2], DType::F32, Device::Cpu);
        let out_t = out_base.transpose(2, 3).unwrap();
        assert!(!out_t.is_contiguous());
        let g = Fixture::new(x_t, spatial());
        let args = BatchNormForwardArgs {
            gamma: &f.gamma,
            beta: &f.beta,
            out: &out_t,
            ..g.args()
        };
        bn.forward(&args, false).unwrap();

        for (a, b) in f.out.to_f64_vec().iter().zip(out_t.to_f64_vec()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_epsilon_below_minimum() {
        let bn = BatchNorm::host();
        let f = Fixture::new(sample(&[2, 2, 1, 1], 0), spatial());
        let args = BatchNormForwardArgs { eps: 1e-6, ..f.args() };
        assert_eq!(
            bn.forward(&args, true).unwrap_err(),
            Error::Epsilon {
                min: 1e-5,
                found: 1e-6
            }
        );
        assert_eq!(bn.primitive().call_count(), 0);
        assert_eq!(check_epsilon(1e-5, 1e-5), Ok(()));
    }

    #[test]
    fn test_nan_epsilon_rejected() {
        let bn = BatchNorm::host();
        let f = Fixture::new(sample(&[2, 2, 1, 1], 0), spatial());
        let args = BatchNormForwardArgs { eps: f64::NAN, ..f.args() };
        assert!(matches!(
            bn.forward(&args, false),
            Err(Error::Epsilon { min, found }) if min == 1e-5 && found.is_nan()
        ));
        assert_eq!(bn.primitive().call_count(), 0);
        assert_eq!(f.running_mean.to_f64_vec(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_non_contiguous_running_mean() {
        let bn = BatchNorm::host();
        let f = Fixture::new(sample(&[2, 2, 2, 2], 1), spatial());
        let backing = full(&[4], 3.0, DType::F64, Device::Cpu);
        let strided = backing.as_strided(&[2], &[2], 0).unwrap();
        let args = BatchNormForwardArgs {
            running_mean: &strided,
            ..f.args()
        };
        assert!(matches!(
            bn.forward(&args, false),
            Err(Error::Layout { .. })
        ));
        assert_eq!(bn.primitive().call_count(), 0);
        assert_eq!(bn.primitive().live_descriptors(), 0);
        assert_eq!(backing.to_vec::<f64>(), vec![3.0; 4]);
        assert_eq!(f.running_var.to_vec::<f64>(), vec![1.0; 2]);
    }

    #[test]
    fn test_invalid_axis_releases_descriptors_and_scope() {
        let bn = BatchNorm::host();
        let x = empty(&[2, 3, 2, 2], DType::F64, Device::Cuda(1));
        let f = Fixture::new(x, Axes::from([0, 2]));
        assert_eq!(scope_depth(), 0);
        assert!(matches!(
            bn.forward(&f.args(), false),
            Err(Error::Dimension { .. })
        ));
        assert_eq!(bn.primitive().live_descriptors(), 0);
        assert_eq!(scope_depth(), 0);
        assert_eq!(current_device(), Device::Cpu);
    }

    #[test]
    fn test_integer_input_rejected() {
        let config = BatchNormConfig::default().with_debug_checks(false);
        let bn = BatchNorm::with_config(HostPrimitive::new(), config);
        let x = zeros(&[2, 2, 1, 1], DType::I32, Device::Cpu);
        let f = Fixture::new(x, spatial());
        assert!(matches!(
            bn.forward(&f.args(), false),
            Err(Error::UnsupportedDType { .. })
        ));
        assert_eq!(bn.primitive().live_descriptors(), 0);
    }

    #[test]
    fn test_debug_checks_catch_shape_mismatch() {
        let bn = BatchNorm::with_config(
            HostPrimitive::new(),
            BatchNormConfig::default().with_debug_checks(true),
        );
        let f = Fixture::new(sample(&[2, 3, 2, 2], 0), spatial());
        let wrong = ones(&[3], DType::F64, Device::Cpu);
        let args = BatchNormForwardArgs {
            gamma: &wrong,
            ..f.args()
        };
        if cfg!(debug_assertions) {
            assert!(matches!(
                bn.forward(&args, false),
                Err(Error::ShapeMismatch { .. })
            ));
        }
    }

    #[test]
    fn test_backward_requires_state() {
        let bn = BatchNorm::host();
        let f = Fixture::new(sample(&[2, 2, 1, 1], 0), spatial());
        let gx = empty_like(&f.x);
        let ggamma = empty_like(&f.gamma);
        let gbeta = empty_like(&f.gamma);
        let args = BatchNormBackwardArgs {
            gamma: &f.gamma,
            gout: &f.x,
            eps: EPS,
            axis: &f.axis,
            gx: &gx,
            ggamma: &ggamma,
            gbeta: &gbeta,
        };
        assert_eq!(bn.backward(&args, None), Err(Error::MissingState));

        let foreign = OpState::new(String::from("not a batch norm state"));
        assert!(matches!(
            bn.backward(&args, Some(&foreign)),
            Err(Error::StateMismatch { .. })
        ));
        assert_eq!(bn.primitive().call_count(), 0);
    }

    /// Loss `sum(w * y)` of a forward pass with fresh running statistics.
    fn loss(bn: &BatchNorm, x: &Tensor, gamma: &Tensor, beta: &Tensor, w: &[f64]) -> f64 {
        let mut f = Fixture::new(x.clone(), spatial());
        f.gamma = gamma.clone();
        f.beta = beta.clone();
        bn.forward(&f.args(), false).unwrap();
        f.out.to_f64_vec().iter().zip(w).map(|(y, w)| y * w).sum()
    }

    fn perturbed(t: &Tensor, i: usize, delta: f64) -> Tensor {
        let copy = t.astype(t.dtype());
        let values = copy.to_f64_vec();
        let indices = tensornorm_tensor::shape::unravel_index(i, copy.shape());
        copy.set(&indices, values[i] + delta).unwrap();
        copy
    }

    #[test]
    fn test_backward_matches_numerical_gradient() {
        let bn = BatchNorm::host();
        let f = Fixture::new(sample(&[3, 2, 2, 1], 2), spatial());
        let w: Vec<f64> = (0..12).map(|i| ((i * 5) % 7) as f64 * 0.3 - 0.8).collect();
        let gout = Tensor::from_vec(w.clone(), &[3, 2, 2, 1]).unwrap();

        let state = bn.forward(&f.args(), true).unwrap();
        let gx = empty_like(&f.x);
        let ggamma = empty_like(&f.gamma);
        let gbeta = empty_like(&f.gamma);
        bn.backward(
            &BatchNormBackwardArgs {
                gamma: &f.gamma,
                gout: &gout,
                eps: EPS,
                axis: &f.axis,
                gx: &gx,
                ggamma: &ggamma,
                gbeta: &gbeta,
            },
            state.as_ref(),
        )
        .unwrap();
        assert_eq!(bn.primitive().live_descriptors(), 0);

        let h = 1e-6;
        let numeric = |x: &Tensor, gamma: &Tensor, beta: &Tensor, which: usize, i: usize| {
            let (xp, gp, bp, xm, gm, bm) = match which {
                0 => (perturbed(x, i, h), gamma.clone(), beta.clone(), perturbed(x, i, -h), gamma.clone(), beta.clone()),
                1 => (x.clone(), perturbed(gamma, i, h), beta.clone(), x.clone(), perturbed(gamma, i, -h), beta.clone()),
                _ => (x.clone(), gamma.clone(), perturbed(beta, i, h), x.clone(), gamma.clone(), perturbed(beta, i, -h)),
            };
            (loss(&bn, &xp, &gp, &bp, &w) - loss(&bn, &xm, &gm, &bm, &w)) / (2.0 * h)
        };

        for (i, analytic) in gx.to_f64_vec().iter().enumerate() {
            let n = numeric(&f.x, &f.gamma, &f.beta, 0, i);
            assert!((analytic - n).abs() < 1e-5, "gx[{i}]: {analytic} vs {n}");
        }
        for (i, analytic) in ggamma.to_f64_vec().iter().enumerate() {
            let n = numeric(&f.x, &f.gamma, &f.beta, 1, i);
            assert!((analytic - n).abs() < 1e-5, "ggamma[{i}]: {analytic} vs {n}");
        }
        for (i, analytic) in gbeta.to_f64_vec().iter().enumerate() {
            let n = numeric(&f.x, &f.gamma, &f.beta, 2, i);
            assert!((analytic - n).abs() < 1e-5, "gbeta[{i}]: {analytic} vs {n}");
        }
    }

    #[test]
    fn test_backward_casts_into_caller_dtype() {
        let bn = BatchNorm::host();
        let x = sample(&[2, 2, 2, 2], 6).astype(DType::F16);
        let gamma = ones(&[1, 2, 1, 1], DType::F16, Device::Cpu);
        let beta = zeros(&[1, 2, 1, 1], DType::F16, Device::Cpu);
        let running_mean = zeros(&[2], DType::F32, Device::Cpu);
        let running_var = ones(&[2], DType::F32, Device::Cpu);
        let out = empty_like(&x);
        let axis = spatial();
        let state = bn
            .forward(
                &BatchNormForwardArgs {
                    x: &x,
                    gamma: &gamma,
                    beta: &beta,
                    running_mean: &running_mean,
                    running_var: &running_var,
                    eps: EPS,
                    decay: 0.9,
                    axis: &axis,
                    out: &out,
                },
                true,
            )
            .unwrap();

        let gout = ones(&[2, 2, 2, 2], DType::F16, Device::Cpu);
        let gx = empty_like(&x);
        let ggamma = empty(&[1, 2, 1, 1], DType::F16, Device::Cpu);
        let gbeta = empty(&[1, 2, 1, 1], DType::F16, Device::Cpu);
        bn.backward(
            &BatchNormBackwardArgs {
                gamma: &gamma,
                gout: &gout,
                eps: EPS,
                axis: &axis,
                gx: &gx,
                ggamma: &ggamma,
                gbeta: &gbeta,
            },
            state.as_ref(),
        )
        .unwrap();

        assert_eq!(gx.dtype(), DType::F16);
        // Constant upstream gradient: dbeta counts elements, dx vanishes.
        assert_eq!(gbeta.to_vec::<f32>(), vec![8.0, 8.0]);
        assert!(gx.to_f64_vec().iter().all(|v| v.abs() < 1e-2));
    }

    #[test]
    fn test_fixed_forward_with_batch_statistics() {
        let bn = BatchNorm::host();
        let x = sample(&[3, 2, 2, 2], 8);
        let (mean, var) = channel_stats(&x);
        let mean = Tensor::from_vec(mean, &[1, 2, 1, 1]).unwrap();
        let var = Tensor::from_vec(var, &[1, 2, 1, 1]).unwrap();
        let gamma = sample(&[1, 2, 1, 1], 1);
        let beta = sample(&[1, 2, 1, 1], 2);
        let out = empty_like(&x);
        let axis = spatial();
        bn.fixed_forward(&FixedBatchNormArgs {
            x: &x,
            gamma: &gamma,
            beta: &beta,
            mean: &mean,
            var: &var,
            eps: 1e-5,
            axis: &axis,
            out: &out,
        })
        .unwrap();

        let xs = x.to_f64_vec();
        let ys = out.to_f64_vec();
        for (i, (x, y)) in xs.iter().zip(&ys).enumerate() {
            let c = (i / 4) % 2;
            let g = gamma.to_f64_vec()[c];
            let b = beta.to_f64_vec()[c];
            let m = mean.to_f64_vec()[c];
            let v = var.to_f64_vec()[c];
            let expected = (x - m) / v.sqrt() * g + b;
            assert!((y - expected).abs() < 1e-4);
        }
        assert_eq!(bn.primitive().live_descriptors(), 0);
    }

    #[test]
    fn test_fixed_forward_casts_statistics() {
        let bn = BatchNorm::host();
        let x = sample(&[2, 2, 1, 1], 3).astype(DType::F32);
        let gamma = ones(&[1, 2, 1, 1], DType::F64, Device::Cpu);
        let beta = zeros(&[1, 2, 1, 1], DType::F16, Device::Cpu);
        let mean = zeros(&[1, 2, 1, 1], DType::F64, Device::Cpu);
        let var = ones(&[1, 2, 1, 1], DType::F16, Device::Cpu);
        let out = empty_like(&x);
        let axis = spatial();
        bn.fixed_forward(&FixedBatchNormArgs {
            x: &x,
            gamma: &gamma,
            beta: &beta,
            mean: &mean,
            var: &var,
            eps: 1e-5,
            axis: &axis,
            out: &out,
        })
        .unwrap();
        for (x, y) in x.to_f64_vec().iter().zip(out.to_f64_vec()) {
            assert!((x / (1.0_f64 + 1e-5).sqrt() - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_update_running_aliasing_and_write_back() {
        let running = full(&[3], 1.0, DType::F16, Device::Cpu);
        update_running(&running, &running.clone()).unwrap();

        let updated = Tensor::from_vec(vec![0.5_f32, 1.5, -2.0], &[3]).unwrap();
        update_running(&running, &updated).unwrap();
        assert_eq!(running.to_vec::<f32>(), vec![0.5, 1.5, -2.0]);
    }

    /// Delegates to the host primitive and records the current device at
    /// each batch-norm call.
    struct RecordingPrimitive {
        inner: HostPrimitive,
        devices: Mutex<Vec<Device>>,
    }

    impl BatchNormPrimitive for RecordingPrimitive {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn min_epsilon(&self) -> f64 {
            self.inner.min_epsilon()
        }

        fn create_tensor_descriptor(&self) -> PrimitiveResult<DescriptorHandle> {
            self.inner.create_tensor_descriptor()
        }

        fn set_tensor_descriptor(
            &self,
            handle: DescriptorHandle,
            data_type: DataType,
            dims: &[usize],
            strides: &[isize],
        ) -> PrimitiveResult<()> {
            self.inner.set_tensor_descriptor(handle, data_type, dims, strides)
        }

        fn derive_bn_descriptor(
            &self,
            derived: DescriptorHandle,
            x_desc: DescriptorHandle,
            mode: BatchNormMode,
        ) -> PrimitiveResult<()> {
            self.inner.derive_bn_descriptor(derived, x_desc, mode)
        }

        fn tensor_descriptor_info(
            &self,
            handle: DescriptorHandle,
        ) -> PrimitiveResult<TensorDescriptorInfo> {
            self.inner.tensor_descriptor_info(handle)
        }

        fn destroy_tensor_descriptor(&self, handle: DescriptorHandle) -> PrimitiveResult<()> {
            self.inner.destroy_tensor_descriptor(handle)
        }

        unsafe fn forward_training(&self, args: &ForwardTrainingArgs) -> PrimitiveResult<()> {
            self.devices.lock().push(current_device());
            self.inner.forward_training(args)
        }

        unsafe fn backward(&self, args: &BackwardArgs) -> PrimitiveResult<()> {
            self.devices.lock().push(current_device());
            self.inner.backward(args)
        }

        unsafe fn forward_inference(&self, args: &ForwardInferenceArgs) -> PrimitiveResult<()> {
            self.devices.lock().push(current_device());
            self.inner.forward_inference(args)
        }
    }

    #[test]
    fn test_primitive_runs_under_input_device() {
        let bn = BatchNorm::new(RecordingPrimitive {
            inner: HostPrimitive::new(),
            devices: Mutex::new(Vec::new()),
        });
        let x = on_device(&sample(&[2, 2, 1, 1], 0), Device::Cuda(0));
        let f = Fixture::new(x, spatial());
        bn.forward(&f.args(), false).unwrap();
        assert_eq!(*bn.primitive().devices.lock(), vec![Device::Cuda(0)]);
        assert_eq!(current_device(), Device::Cpu);
        assert_eq!(bn.primitive().inner.live_descriptors(), 0);
    }
}
