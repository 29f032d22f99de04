//! Hook points, activation patches and per-call hook specifications
//!
//! A [`HookSpec`] is an argument of every forward call. It names the
//! activations to capture and the patches to apply; nothing is ever
//! installed on the model itself. The forward pass returns a
//! [`HookCache`] holding the logits and the captured tensors.

use anyhow::Result;
use candle_core::{DType, Tensor};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// Named location in a forward pass, using TransformerLens names
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// `hook_embed`
    Embed,
    /// `hook_pos_embed`
    PosEmbed,
    /// `blocks.{l}.hook_resid_pre`
    ResidPre(usize),
    /// `blocks.{l}.attn.hook_pattern`, shape `[batch, heads, query, key]`
    AttnPattern(usize),
    /// `blocks.{l}.attn.hook_z`, shape `[batch, seq, heads, d_head]`
    AttnZ(usize),
    /// `blocks.{l}.hook_attn_out`
    AttnOut(usize),
    /// `blocks.{l}.hook_resid_mid`
    ResidMid(usize),
    /// `blocks.{l}.mlp.hook_pre`
    MlpPre(usize),
    /// `blocks.{l}.mlp.hook_post`, shape `[batch, seq, d_mlp]`
    MlpPost(usize),
    /// `blocks.{l}.hook_mlp_out`
    MlpOut(usize),
    /// `blocks.{l}.hook_resid_post`
    ResidPost(usize),
    /// Anything else
    Custom(String),
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embed => write!(f, "hook_embed"),
            Self::PosEmbed => write!(f, "hook_pos_embed"),
            Self::ResidPre(l) => write!(f, "blocks.{l}.hook_resid_pre"),
            Self::AttnPattern(l) => write!(f, "blocks.{l}.attn.hook_pattern"),
            Self::AttnZ(l) => write!(f, "blocks.{l}.attn.hook_z"),
            Self::AttnOut(l) => write!(f, "blocks.{l}.hook_attn_out"),
            Self::ResidMid(l) => write!(f, "blocks.{l}.hook_resid_mid"),
            Self::MlpPre(l) => write!(f, "blocks.{l}.mlp.hook_pre"),
            Self::MlpPost(l) => write!(f, "blocks.{l}.mlp.hook_post"),
            Self::MlpOut(l) => write!(f, "blocks.{l}.hook_mlp_out"),
            Self::ResidPost(l) => write!(f, "blocks.{l}.hook_resid_post"),
            Self::Custom(s) => write!(f, "{s}"),
        }
    }
}

impl FromStr for HookPoint {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(parse_hook_string(s))
    }
}

impl From<&str> for HookPoint {
    fn from(s: &str) -> Self {
        parse_hook_string(s)
    }
}

fn parse_hook_string(s: &str) -> HookPoint {
    match s {
        "hook_embed" => return HookPoint::Embed,
        "hook_pos_embed" => return HookPoint::PosEmbed,
        _ => {}
    }

    if let Some((layer, suffix)) = s
        .strip_prefix("blocks.")
        .and_then(|rest| rest.split_once('.'))
    {
        if let Ok(layer) = layer.parse::<usize>() {
            return match suffix {
                "hook_resid_pre" => HookPoint::ResidPre(layer),
                "attn.hook_pattern" => HookPoint::AttnPattern(layer),
                "attn.hook_z" => HookPoint::AttnZ(layer),
                "hook_attn_out" => HookPoint::AttnOut(layer),
                "hook_resid_mid" => HookPoint::ResidMid(layer),
                "mlp.hook_pre" => HookPoint::MlpPre(layer),
                "mlp.hook_post" => HookPoint::MlpPost(layer),
                "hook_mlp_out" => HookPoint::MlpOut(layer),
                "hook_resid_post" => HookPoint::ResidPost(layer),
                _ => HookPoint::Custom(s.to_string()),
            };
        }
    }

    HookPoint::Custom(s.to_string())
}

/// Where replacement values come from
#[derive(Debug, Clone)]
pub enum PatchSource {
    Zero,
    /// Activation with the hooked shape; batch size 1 broadcasts
    Tensor(Tensor),
}

/// Overwrite of one position (and optionally one head or neuron)
#[derive(Debug, Clone)]
pub struct Patch {
    pub position: usize,
    /// Head index for `hook_z`, neuron index for `mlp.hook_post`.
    /// `None` patches the whole position.
    pub unit: Option<usize>,
    pub source: PatchSource,
}

impl Patch {
    pub fn zero(position: usize, unit: Option<usize>) -> Self {
        Self {
            position,
            unit,
            source: PatchSource::Zero,
        }
    }

    pub fn from_tensor(position: usize, unit: Option<usize>, source: Tensor) -> Self {
        Self {
            position,
            unit,
            source: PatchSource::Tensor(source),
        }
    }
}

/// Apply patches to an activation laid out as `[batch, seq, units, ...]`
///
/// A unit covers the trailing dimensions after the unit axis, so a head in
/// `hook_z` is `d_head` values wide and a neuron in `mlp.hook_post` is one.
pub fn apply_patches(tensor: &Tensor, patches: &[&Patch]) -> Result<Tensor> {
    if patches.is_empty() {
        return Ok(tensor.clone());
    }

    let dims = tensor.dims().to_vec();
    anyhow::ensure!(
        dims.len() >= 2,
        "Cannot patch activation of shape {dims:?}, expected [batch, seq, ...]"
    );
    let (batch, seq) = (dims[0], dims[1]);
    let row: usize = dims[2..].iter().product();
    let unit_width: usize = dims.get(3..).map_or(1, |d| d.iter().product());

    let dtype = tensor.dtype();
    let mut data: Vec<f32> = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;

    for patch in patches {
        assert!(
            patch.position < seq,
            "Patch position {} outside sequence of length {seq}",
            patch.position
        );
        let (offset, width) = match patch.unit {
            Some(unit) => {
                assert!(
                    dims.len() > 2 && unit < dims[2],
                    "Patch unit {unit} outside activation of shape {dims:?}"
                );
                (unit * unit_width, unit_width)
            }
            None => (0, row),
        };

        match &patch.source {
            PatchSource::Zero => {
                for b in 0..batch {
                    let start = (b * seq + patch.position) * row + offset;
                    data[start..start + width].fill(0.0);
                }
            }
            PatchSource::Tensor(source) => {
                let src_dims = source.dims();
                anyhow::ensure!(
                    src_dims.len() == dims.len() && src_dims[1..] == dims[1..],
                    "Patch source shape {src_dims:?} does not match activation {dims:?}"
                );
                let src_batch = src_dims[0];
                anyhow::ensure!(
                    src_batch == 1 || src_batch == batch,
                    "Patch source batch {src_batch} cannot broadcast to {batch}"
                );
                let src: Vec<f32> = source.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
                for b in 0..batch {
                    let sb = if src_batch == 1 { 0 } else { b };
                    let start = (b * seq + patch.position) * row + offset;
                    let src_start = (sb * seq + patch.position) * row + offset;
                    data[start..start + width]
                        .copy_from_slice(&src[src_start..src_start + width]);
                }
            }
        }
    }

    Ok(Tensor::from_vec(data, dims, tensor.device())?.to_dtype(dtype)?)
}

/// Captures and patches for a single forward call
#[derive(Debug, Clone, Default)]
pub struct HookSpec {
    captures: HashSet<HookPoint>,
    patches: Vec<(HookPoint, Patch)>,
}

impl HookSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request capture of the activation at a hook point
    pub fn capture<H: Into<HookPoint>>(&mut self, hook: H) -> &mut Self {
        self.captures.insert(hook.into());
        self
    }

    /// Register a patch at a hook point
    pub fn patch<H: Into<HookPoint>>(&mut self, hook: H, patch: Patch) -> &mut Self {
        self.patches.push((hook.into(), patch));
        self
    }

    pub fn is_captured(&self, hook: &HookPoint) -> bool {
        self.captures.contains(hook)
    }

    pub fn is_empty(&self) -> bool {
        self.captures.is_empty() && self.patches.is_empty()
    }

    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }

    pub fn num_patches(&self) -> usize {
        self.patches.len()
    }

    pub fn patches_at(&self, hook: &HookPoint) -> Vec<&Patch> {
        self.patches
            .iter()
            .filter(|(h, _)| h == hook)
            .map(|(_, p)| p)
            .collect()
    }

    pub fn has_patch_at(&self, hook: &HookPoint) -> bool {
        self.patches.iter().any(|(h, _)| h == hook)
    }

    /// Patch then (if requested) capture the activation flowing through `hook`
    ///
    /// Backends call this at every hook point they expose.
    pub fn run_hook(
        &self,
        hook: HookPoint,
        activation: Tensor,
        captures: &mut HashMap<HookPoint, Tensor>,
    ) -> Result<Tensor> {
        let patches = self.patches_at(&hook);
        let activation = if patches.is_empty() {
            activation
        } else {
            apply_patches(&activation, &patches)?
        };
        if self.is_captured(&hook) {
            captures.insert(hook, activation.clone());
        }
        Ok(activation)
    }
}

/// Output logits plus the activations captured during one forward call
#[derive(Debug)]
pub struct HookCache {
    output: Tensor,
    captures: HashMap<HookPoint, Tensor>,
}

impl HookCache {
    pub fn new(output: Tensor) -> Self {
        Self {
            output,
            captures: HashMap::new(),
        }
    }

    pub fn with_captures(output: Tensor, captures: HashMap<HookPoint, Tensor>) -> Self {
        Self { output, captures }
    }

    /// Logits `[batch, seq, d_vocab]`
    pub fn output(&self) -> &Tensor {
        &self.output
    }

    pub fn into_output(self) -> Tensor {
        self.output
    }

    pub fn get(&self, hook: &HookPoint) -> Option<&Tensor> {
        self.captures.get(hook)
    }

    pub fn require(&self, hook: &HookPoint) -> Result<&Tensor> {
        self.captures
            .get(hook)
            .ok_or_else(|| anyhow::anyhow!("Hook point `{hook}` was not captured"))
    }

    pub fn store(&mut self, hook: HookPoint, tensor: Tensor) {
        self.captures.insert(hook, tensor);
    }

    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }
}
