//! Functional API - Allocating Batch-Normalization Routines
//!
//! Routines that allocate their outputs and fill in defaults (axes from the
//! input rank, epsilon and decay from the `BatchNormConfig`) before
//! delegating to a `BatchNorm`.
//!
//! @version 0.1.0

use tracing::debug;

use tensornorm_core::error::{Error, Result};
use tensornorm_dnn::{
    default_axes, BatchNorm, BatchNormBackwardArgs, BatchNormForwardArgs, BatchNormPrimitive,
    FixedBatchNormArgs, OpState,
};
use tensornorm_tensor::{empty_like, Axes, Tensor};

// =============================================================================
// Training
// =============================================================================

/// Normalizes `x` with batch statistics, updating the running statistics.
///
/// Returns the output and the state [`batch_norm_grad`] needs. `axis`
/// defaults to every axis but the channel axis 1.
#[allow(clippy::too_many_arguments)]
pub fn batch_norm<P: BatchNormPrimitive>(
    ctx: &BatchNorm<P>,
    x: &Tensor,
    gamma: &Tensor,
    beta: &Tensor,
    running_mean: &Tensor,
    running_var: &Tensor,
    eps: Option<f64>,
    decay: Option<f64>,
    axis: Option<&Axes>,
) -> Result<(Tensor, OpState)> {
    let axis = axis.cloned().unwrap_or_else(|| default_axes(x.ndim()));
    let eps = eps.unwrap_or(ctx.config().default_eps);
    let decay = decay.unwrap_or(ctx.config().default_decay);
    debug!(%axis, eps, decay, "batch_norm");

    let out = empty_like(x);
    let state = ctx
        .forward(
            &BatchNormForwardArgs {
                x,
                gamma,
                beta,
                running_mean,
                running_var,
                eps,
                decay,
                axis: &axis,
                out: &out,
            },
            true,
        )?
        .ok_or_else(|| Error::internal("forward returned no state"))?;
    Ok((out, state))
}

/// Computes `(gx, ggamma, gbeta)` from the state of [`batch_norm`].
pub fn batch_norm_grad<P: BatchNormPrimitive>(
    ctx: &BatchNorm<P>,
    gamma: &Tensor,
    gout: &Tensor,
    eps: Option<f64>,
    axis: Option<&Axes>,
    state: &OpState,
) -> Result<(Tensor, Tensor, Tensor)> {
    let axis = axis.cloned().unwrap_or_else(|| default_axes(gout.ndim()));
    let eps = eps.unwrap_or(ctx.config().default_eps);

    let gx = empty_like(gout);
    let ggamma = empty_like(gamma);
    let gbeta = empty_like(gamma);
    ctx.backward(
        &BatchNormBackwardArgs {
            gamma,
            gout,
            eps,
            axis: &axis,
            gx: &gx,
            ggamma: &ggamma,
            gbeta: &gbeta,
        },
        Some(state),
    )?;
    Ok((gx, ggamma, gbeta))
}

// =============================================================================
// Inference
// =============================================================================

/// Normalizes `x` with fixed statistics.
#[allow(clippy::too_many_arguments)]
pub fn fixed_batch_norm<P: BatchNormPrimitive>(
    ctx: &BatchNorm<P>,
    x: &Tensor,
    gamma: &Tensor,
    beta: &Tensor,
    mean: &Tensor,
    var: &Tensor,
    eps: Option<f64>,
    axis: Option<&Axes>,
) -> Result<Tensor> {
    let axis = axis.cloned().unwrap_or_else(|| default_axes(x.ndim()));
    let eps = eps.unwrap_or(ctx.config().default_eps);

    let out = empty_like(x);
    ctx.fixed_forward(&FixedBatchNormArgs {
        x,
        gamma,
        beta,
        mean,
        var,
        eps,
        axis: &axis,
        out: &out,
    })?;
    Ok(out)
}

// =============================================================================
// Tests
// =============================================================================
