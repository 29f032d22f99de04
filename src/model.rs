//! Model capability trait and backend loading
//!
//! Everything in the analysis pipeline talks to the model through
//! [`MathsBackend`]: dimension metadata plus one hooked forward pass.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use tracing::info;

use crate::forward_hooked::HookedTransformer;
use crate::hooks::{HookCache, HookPoint, HookSpec};
use crate::node::NodeLocation;

/// Unified backend trait for arithmetic transformers.
///
/// Implementing this trait is the only requirement for running the
/// intervention engine against a new model.
pub trait MathsBackend {
    // --- Metadata ---
    fn n_layers(&self) -> usize;
    fn n_heads(&self) -> usize;
    fn d_head(&self) -> usize;
    fn d_mlp(&self) -> usize;
    fn d_model(&self) -> usize;
    fn d_vocab(&self) -> usize;
    fn n_ctx(&self) -> usize;
    fn device(&self) -> &Device;

    /// Run `tokens` (`[batch, seq]`, u32) with the given hooks.
    ///
    /// The cache output is the `[batch, seq, d_vocab]` logits. Hooks live
    /// only for the duration of this call.
    fn forward(&self, tokens: &Tensor, hooks: &HookSpec) -> Result<HookCache>;

    /// Hook point holding the activation of a node
    fn node_hook_point(&self, location: &NodeLocation) -> HookPoint {
        if location.is_head {
            HookPoint::AttnZ(location.layer)
        } else {
            HookPoint::MlpPost(location.layer)
        }
    }
}

/// Pick CUDA when available unless `force_cpu` is set
pub fn select_device(force_cpu: bool) -> (Device, DType) {
    if force_cpu {
        info!("Forcing CPU mode");
        return (Device::Cpu, DType::F32);
    }
    match Device::cuda_if_available(0) {
        Ok(dev) if dev.is_cuda() => {
            info!("Using CUDA device");
            (dev, DType::F32)
        }
        _ => {
            info!("CUDA not available, using CPU");
            (Device::Cpu, DType::F32)
        }
    }
}

/// Load a hooked transformer from a local directory, a safetensors file or
/// a HuggingFace repo id
pub fn load_backend(source: &str, force_cpu: bool) -> Result<Box<dyn MathsBackend>> {
    let (device, dtype) = select_device(force_cpu);
    info!("Loading model: {}", source);
    info!("Device: {:?}", device);
    Ok(Box::new(HookedTransformer::load(source, &device, dtype)?))
}
