//! Host Primitive - Reference Batch-Normalization Library
//!
//! A primitive library that runs on host memory and follows the documented
//! contract of accelerated batch-normalization libraries: 4-5 dimensional
//! descriptors, float statistics for half data, unbiased running variance,
//! and `beta == 0` meaning the destination is not read.
//!
//! Every call is counted and every live descriptor tracked, so callers can
//! observe what reached the library and that nothing leaked.
//!
//! @version 0.1.0

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use half::f16;
use parking_lot::Mutex;
use tracing::trace;

use crate::mode::BatchNormMode;
use crate::primitive::{
    BackwardArgs, BatchNormPrimitive, Coefficient, DataType, DescriptorHandle,
    ForwardInferenceArgs, ForwardTrainingArgs, PrimitiveError, PrimitiveResult, Status,
    TensorDescriptorInfo,
};

/// Smallest epsilon accepted by batch-normalization entry points.
pub const MIN_EPSILON: f64 = 1e-5;

const MIN_DIMS: usize = 4;
const MAX_DIMS: usize = 5;

// =============================================================================
// HostPrimitive
// =============================================================================

/// Batch normalization on host memory.
#[derive(Debug, Default)]
pub struct HostPrimitive {
    descriptors: Mutex<HashMap<DescriptorHandle, Option<TensorDescriptorInfo>>>,
    next_handle: AtomicU64,
    calls: AtomicUsize,
}

impl HostPrimitive {
    /// Creates a primitive with no descriptors.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many descriptors are created and not yet destroyed.
    #[must_use]
    pub fn live_descriptors(&self) -> usize {
        self.descriptors.lock().len()
    }

    /// Returns how many batch-normalization entry points were invoked.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    fn described(&self, handle: DescriptorHandle) -> PrimitiveResult<TensorDescriptorInfo> {
        match self.descriptors.lock().get(&handle) {
            Some(Some(info)) => Ok(info.clone()),
            Some(None) => Err(PrimitiveError::bad_param(format!(
                "{handle} has not been set"
            ))),
            None => Err(PrimitiveError::bad_param(format!("{handle} does not exist"))),
        }
    }

    fn store(&self, handle: DescriptorHandle, info: TensorDescriptorInfo) -> PrimitiveResult<()> {
        match self.descriptors.lock().get_mut(&handle) {
            Some(slot) => {
                *slot = Some(info);
                Ok(())
            }
            None => Err(PrimitiveError::bad_param(format!("{handle} does not exist"))),
        }
    }

    fn layout(
        &self,
        mode: BatchNormMode,
        x_desc: DescriptorHandle,
        bn_desc: DescriptorHandle,
        epsilon: f64,
    ) -> PrimitiveResult<Layout> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if epsilon < MIN_EPSILON {
            return Err(PrimitiveError::bad_param(format!(
                "epsilon {epsilon} is below {MIN_EPSILON}"
            )));
        }

        let x = self.described(x_desc)?;
        let bn = self.described(bn_desc)?;
        if !x.data_type.is_float() {
            return Err(PrimitiveError::new(
                Status::NotSupported,
                format!("batch normalization of {}", x.data_type),
            ));
        }
        if bn.data_type != statistics_type(x.data_type) || bn.dims != statistics_dims(&x.dims, mode) {
            return Err(PrimitiveError::bad_param(
                "statistics descriptor does not match the data descriptor",
            ));
        }
        Ok(Layout { x, bn, mode })
    }
}

// =============================================================================
// Primitive Implementation
// =============================================================================

impl BatchNormPrimitive for HostPrimitive {
    fn name(&self) -> &'static str {
        "host"
    }

    fn min_epsilon(&self) -> f64 {
        MIN_EPSILON
    }

    fn create_tensor_descriptor(&self) -> PrimitiveResult<DescriptorHandle> {
        let handle = DescriptorHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.descriptors.lock().insert(handle, None);
        trace!(%handle, "created tensor descriptor");
        Ok(handle)
    }

    fn set_tensor_descriptor(
        &self,
        handle: DescriptorHandle,
        data_type: DataType,
        dims: &[usize],
        strides: &[isize],
    ) -> PrimitiveResult<()> {
        if !(MIN_DIMS..=MAX_DIMS).contains(&dims.len()) {
            return Err(PrimitiveError::new(
                Status::NotSupported,
                format!("{} dimensional tensor descriptor", dims.len()),
            ));
        }
        if dims.len() != strides.len() || dims.contains(&0) || strides.iter().any(|&s| s <= 0) {
            return Err(PrimitiveError::bad_param(format!(
                "dims {dims:?} with strides {strides:?}"
            )));
        }
        self.store(
            handle,
            TensorDescriptorInfo {
                data_type,
                dims: dims.to_vec(),
                strides: strides.to_vec(),
            },
        )
    }

    fn derive_bn_descriptor(
        &self,
        derived: DescriptorHandle,
        x_desc: DescriptorHandle,
        mode: BatchNormMode,
    ) -> PrimitiveResult<()> {
        let x = self.described(x_desc)?;
        let dims = statistics_dims(&x.dims, mode);
        let strides = contiguous_strides(&dims);
        self.store(
            derived,
            TensorDescriptorInfo {
                data_type: statistics_type(x.data_type),
                dims,
                strides,
            },
        )
    }

    fn tensor_descriptor_info(
        &self,
        handle: DescriptorHandle,
    ) -> PrimitiveResult<TensorDescriptorInfo> {
        self.described(handle)
    }

    fn destroy_tensor_descriptor(&self, handle: DescriptorHandle) -> PrimitiveResult<()> {
        match self.descriptors.lock().remove(&handle) {
            Some(_) => {
                trace!(%handle, "destroyed tensor descriptor");
                Ok(())
            }
            None => Err(PrimitiveError::bad_param(format!("{handle} does not exist"))),
        }
    }

    unsafe fn forward_training(&self, args: &ForwardTrainingArgs) -> PrimitiveResult<()> {
        let layout = self.layout(args.mode, args.x_desc, args.bn_desc, args.epsilon)?;
        layout.check_coefficients(&[args.alpha, args.beta])?;
        let (xd, bd) = (&layout.x, &layout.bn);

        let x = gather(args.x, xd);
        let scale = gather(args.scale, bd);
        let bias = gather(args.bias, bd);

        let channels = bd.numel();
        let count = layout.count();
        let mut mean = vec![0.0; channels];
        let mut var = vec![0.0; channels];
        for (i, &v) in x.iter().enumerate() {
            mean[layout.channel(i)] += v;
        }
        for m in &mut mean {
            *m /= count as f64;
        }
        for (i, &v) in x.iter().enumerate() {
            let c = layout.channel(i);
            var[c] += (v - mean[c]) * (v - mean[c]);
        }
        for v in &mut var {
            *v /= count as f64;
        }
        let inv_std: Vec<f64> = var.iter().map(|v| 1.0 / (v + args.epsilon).sqrt()).collect();

        let y: Vec<f64> = x
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                let c = layout.channel(i);
                scale[c] * (v - mean[c]) * inv_std[c] + bias[c]
            })
            .collect();
        scatter(args.y, xd, &y, args.alpha, args.beta);

        let factor = args.exponential_average_factor;
        let unbias = if count > 1 {
            count as f64 / (count - 1) as f64
        } else {
            1.0
        };
        if !args.running_mean.is_null() {
            let running = gather(args.running_mean, bd);
            let updated: Vec<f64> = running
                .iter()
                .zip(&mean)
                .map(|(r, m)| (1.0 - factor) * r + factor * m)
                .collect();
            store_contiguous(args.running_mean, bd.data_type, &updated);
        }
        if !args.running_var.is_null() {
            let running = gather(args.running_var, bd);
            let updated: Vec<f64> = running
                .iter()
                .zip(&var)
                .map(|(r, v)| (1.0 - factor) * r + factor * v * unbias)
                .collect();
            store_contiguous(args.running_var, bd.data_type, &updated);
        }
        if !args.save_mean.is_null() {
            store_contiguous(args.save_mean, bd.data_type, &mean);
        }
        if !args.save_inv_std.is_null() {
            store_contiguous(args.save_inv_std, bd.data_type, &inv_std);
        }
        Ok(())
    }

    unsafe fn backward(&self, args: &BackwardArgs) -> PrimitiveResult<()> {
        let layout = self.layout(args.mode, args.x_desc, args.bn_desc, args.epsilon)?;
        layout.check_coefficients(&[
            args.alpha_data,
            args.beta_data,
            args.alpha_param,
            args.beta_param,
        ])?;
        let (xd, bd) = (&layout.x, &layout.bn);

        let x = gather(args.x, xd);
        let dy = gather(args.dy, xd);
        let scale = gather(args.scale, bd);
        let mean = gather(args.saved_mean, bd);
        let inv_std = gather(args.saved_inv_std, bd);

        let channels = bd.numel();
        let count = layout.count() as f64;
        let xhat = |i: usize, v: f64| {
            let c = layout.channel(i);
            (v - mean[c]) * inv_std[c]
        };

        let mut dbias = vec![0.0; channels];
        let mut dscale = vec![0.0; channels];
        for (i, (&v, &g)) in x.iter().zip(&dy).enumerate() {
            let c = layout.channel(i);
            dbias[c] += g;
            dscale[c] += g * xhat(i, v);
        }

        let dx: Vec<f64> = x
            .iter()
            .zip(&dy)
            .enumerate()
            .map(|(i, (&v, &g))| {
                let c = layout.channel(i);
                scale[c] * inv_std[c] / count * (count * g - dbias[c] - xhat(i, v) * dscale[c])
            })
            .collect();

        scatter(args.dx, xd, &dx, args.alpha_data, args.beta_data);
        scatter(args.scale_grad, bd, &dscale, args.alpha_param, args.beta_param);
        scatter(args.bias_grad, bd, &dbias, args.alpha_param, args.beta_param);
        Ok(())
    }

    unsafe fn forward_inference(&self, args: &ForwardInferenceArgs) -> PrimitiveResult<()> {
        let layout = self.layout(args.mode, args.x_desc, args.bn_desc, args.epsilon)?;
        layout.check_coefficients(&[args.alpha, args.beta])?;
        let (xd, bd) = (&layout.x, &layout.bn);

        let x = gather(args.x, xd);
        let scale = gather(args.scale, bd);
        let bias = gather(args.bias, bd);
        let mean = gather(args.estimated_mean, bd);
        let var = gather(args.estimated_var, bd);

        let y: Vec<f64> = x
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                let c = layout.channel(i);
                scale[c] * (v - mean[c]) / (var[c] + args.epsilon).sqrt() + bias[c]
            })
            .collect();
        scatter(args.y, xd, &y, args.alpha, args.beta);
        Ok(())
    }
}

// =============================================================================
// Layout Helpers
// =============================================================================

/// Statistics precision for a data type: half data keeps float statistics.
fn statistics_type(data_type: DataType) -> DataType {
    match data_type {
        DataType::Half => DataType::Float,
        other => other,
    }
}

/// `[1, C, 1, 1(, 1)]` for spatial, `[1, C, H, W(, D)]` per activation.
fn statistics_dims(dims: &[usize], mode: BatchNormMode) -> Vec<usize> {
    dims.iter()
        .enumerate()
        .map(|(i, &d)| match (i, mode) {
            (0, _) => 1,
            (1, _) | (_, BatchNormMode::PerActivation) => d,
            (_, BatchNormMode::Spatial) => 1,
        })
        .collect()
}

fn contiguous_strides(dims: &[usize]) -> Vec<isize> {
    let mut strides = vec![1isize; dims.len()];
    for i in (0..dims.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * dims[i + 1] as isize;
    }
    strides
}

/// Storage offsets of every element, in row-major logical order.
fn offsets(info: &TensorDescriptorInfo) -> impl Iterator<Item = usize> + '_ {
    (0..info.numel()).map(move |mut linear| {
        let mut offset = 0usize;
        for (&dim, &stride) in info.dims.iter().zip(&info.strides).rev() {
            offset += (linear % dim) * stride as usize;
            linear /= dim;
        }
        offset
    })
}

struct Layout {
    x: TensorDescriptorInfo,
    bn: TensorDescriptorInfo,
    mode: BatchNormMode,
}

impl Layout {
    /// Number of data elements reduced into each statistic.
    fn count(&self) -> usize {
        self.x.numel() / self.bn.numel()
    }

    /// Statistic index of the data element at logical position `i`.
    fn channel(&self, i: usize) -> usize {
        let dims = &self.x.dims;
        let inner: usize = dims[2..].iter().product();
        match self.mode {
            BatchNormMode::Spatial => (i / inner) % dims[1],
            BatchNormMode::PerActivation => i % (dims[1] * inner),
        }
    }

    fn check_coefficients(&self, coefficients: &[Coefficient]) -> PrimitiveResult<()> {
        if coefficients.iter().all(|c| c.matches(self.x.data_type)) {
            Ok(())
        } else {
            Err(PrimitiveError::bad_param(format!(
                "scaling coefficients do not have the compute type of {}",
                self.x.data_type
            )))
        }
    }
}

// =============================================================================
// Raw Memory Access
// =============================================================================

unsafe fn load(ptr: *const u8, data_type: DataType, index: usize) -> f64 {
    let p = ptr.add(index * data_type.size_of());
    match data_type {
        DataType::Half => p.cast::<f16>().read_unaligned().to_f64(),
        DataType::Float => f64::from(p.cast::<f32>().read_unaligned()),
        DataType::Double => p.cast::<f64>().read_unaligned(),
        DataType::Int8 => f64::from(p.cast::<i8>().read_unaligned()),
        DataType::Int32 => f64::from(p.cast::<i32>().read_unaligned()),
        DataType::UInt8 => f64::from(p.read()),
    }
}

unsafe fn put(ptr: *mut u8, data_type: DataType, index: usize, value: f64) {
    let p = ptr.add(index * data_type.size_of());
    match data_type {
        DataType::Half => p.cast::<f16>().write_unaligned(f16::from_f64(value)),
        DataType::Float => p.cast::<f32>().write_unaligned(value as f32),
        DataType::Double => p.cast::<f64>().write_unaligned(value),
        DataType::Int8 => p.cast::<i8>().write_unaligned(value as i8),
        DataType::Int32 => p.cast::<i32>().write_unaligned(value as i32),
        DataType::UInt8 => p.write(value as u8),
    }
}

unsafe fn gather(ptr: *const u8, info: &TensorDescriptorInfo) -> Vec<f64> {
    offsets(info).map(|o| load(ptr, info.data_type, o)).collect()
}

/// Writes `alpha * value + beta * prior`, reading the prior only when
/// `beta` is non-zero.
unsafe fn scatter(
    ptr: *mut u8,
    info: &TensorDescriptorInfo,
    values: &[f64],
    alpha: Coefficient,
    beta: Coefficient,
) {
    let (alpha, beta) = (alpha.value(), beta.value());
    for (offset, &value) in offsets(info).zip(values) {
        let mut out = alpha * value;
        if beta != 0.0 {
            out += beta * load(ptr, info.data_type, offset);
        }
        put(ptr, info.data_type, offset, out);
    }
}

unsafe fn store_contiguous(ptr: *mut u8, data_type: DataType, values: &[f64]) {
    for (i, &value) in values.iter().enumerate() {
        put(ptr, data_type, i, value);
    }
}

// =============================================================================
// Tests
// =============================================================================
