//! Hooked transformer forward pass for small arithmetic models
//!
//! Pre-LN attention-only-then-MLP blocks with learned positional
//! embeddings, laid out with TransformerLens tensor names so checkpoints
//! exported from a `HookedTransformer` load directly:
//! - `embed.W_E`, `pos_embed.W_pos`
//! - `blocks.{l}.ln1.{w,b}`, `blocks.{l}.attn.{W_Q,W_K,W_V,W_O,b_Q,b_K,b_V,b_O}`
//! - `blocks.{l}.ln2.{w,b}`, `blocks.{l}.mlp.{W_in,b_in,W_out,b_out}`
//! - `ln_final.{w,b}`, `unembed.{W_U,b_U}`
//!
//! Every intermediate passes through [`HookSpec::run_hook`] so any
//! TransformerLens hook point can be captured or patched.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Embedding, Init, LayerNorm, VarBuilder};
use hf_hub::{api::sync::Api, Repo, RepoType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::hooks::{HookCache, HookPoint, HookSpec};
use crate::masks::create_causal_mask;
use crate::model::MathsBackend;

const WEIGHTS_FILE: &str = "model.safetensors";
const CONFIG_FILE: &str = "config.json";

/// Model configuration (subset of a TransformerLens `config.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookedConfig {
    pub n_layers: usize,
    pub n_heads: usize,
    pub d_model: usize,
    pub d_head: usize,
    pub d_mlp: usize,
    pub d_vocab: usize,
    pub n_ctx: usize,
    /// `"LN"` for layer norm with bias, `None` for no normalization
    #[serde(default = "default_normalization_type")]
    pub normalization_type: Option<String>,
    #[serde(default = "default_act_fn")]
    pub act_fn: String,
    #[serde(default = "default_eps")]
    pub eps: f64,
}

fn default_normalization_type() -> Option<String> {
    Some("LN".to_string())
}

fn default_act_fn() -> String {
    "relu".to_string()
}

fn default_eps() -> f64 {
    1e-5
}

impl HookedConfig {
    fn has_layer_norm(&self) -> bool {
        self.normalization_type.is_some()
    }

    /// Recover the configuration from tensor shapes in a safetensors file
    pub fn infer_from_safetensors(path: &Path) -> Result<Self> {
        let buffer = std::fs::read(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let tensors = safetensors::SafeTensors::deserialize(&buffer)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        let shape = |name: &str| -> Result<Vec<usize>> {
            Ok(tensors
                .tensor(name)
                .with_context(|| format!("Missing tensor {name} in {}", path.display()))?
                .shape()
                .to_vec())
        };

        let w_e = shape("embed.W_E")?;
        let w_pos = shape("pos_embed.W_pos")?;
        let w_q = shape("blocks.0.attn.W_Q")?;
        let w_in = shape("blocks.0.mlp.W_in")?;
        anyhow::ensure!(
            w_e.len() == 2 && w_pos.len() == 2 && w_q.len() == 3 && w_in.len() == 2,
            "Unexpected tensor ranks in {}",
            path.display()
        );
        let n_layers = (0..)
            .take_while(|l| tensors.tensor(&format!("blocks.{l}.attn.W_Q")).is_ok())
            .count();
        let normalization_type = tensors
            .tensor("blocks.0.ln1.w")
            .is_ok()
            .then(|| "LN".to_string());

        Ok(Self {
            n_layers,
            n_heads: w_q[0],
            d_model: w_e[1],
            d_head: w_q[2],
            d_mlp: w_in[1],
            d_vocab: w_e[0],
            n_ctx: w_pos[0],
            normalization_type,
            act_fn: default_act_fn(),
            eps: default_eps(),
        })
    }
}

fn weight(vb: &VarBuilder, shape: &[usize], name: &str) -> Result<Tensor> {
    Ok(vb.get_with_hints(shape, name, Init::Randn { mean: 0., stdev: 0.02 })?)
}

fn bias(vb: &VarBuilder, shape: &[usize], name: &str) -> Result<Tensor> {
    Ok(vb.get_with_hints(shape, name, Init::Const(0.))?)
}

fn layer_norm(vb: VarBuilder, config: &HookedConfig) -> Result<Option<LayerNorm>> {
    if !config.has_layer_norm() {
        return Ok(None);
    }
    let w = vb.get_with_hints(config.d_model, "w", Init::Const(1.))?;
    let b = vb.get_with_hints(config.d_model, "b", Init::Const(0.))?;
    Ok(Some(LayerNorm::new(w, b, config.eps)))
}

fn apply_norm(norm: &Option<LayerNorm>, x: &Tensor) -> Result<Tensor> {
    match norm {
        Some(ln) => Ok(ln.forward(x)?),
        None => Ok(x.clone()),
    }
}

/// `[heads, d_model, d_head]` to `[d_model, heads * d_head]`
fn flatten_in_proj(w: &Tensor) -> Result<Tensor> {
    let (h, d, k) = w.dims3()?;
    Ok(w.permute((1, 0, 2))?.contiguous()?.reshape((d, h * k))?)
}

/// Multi-head attention with per-head TransformerLens weights
struct Attention {
    w_q: Tensor,
    w_k: Tensor,
    w_v: Tensor,
    b_q: Tensor,
    b_k: Tensor,
    b_v: Tensor,
    w_o: Tensor,
    b_o: Tensor,
    n_heads: usize,
    d_head: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &HookedConfig) -> Result<Self> {
        let (h, d, k) = (config.n_heads, config.d_model, config.d_head);
        let w_q = weight(&vb, &[h, d, k], "W_Q")?;
        let w_k = weight(&vb, &[h, d, k], "W_K")?;
        let w_v = weight(&vb, &[h, d, k], "W_V")?;
        let w_o = weight(&vb, &[h, k, d], "W_O")?;
        Ok(Self {
            w_q: flatten_in_proj(&w_q)?,
            w_k: flatten_in_proj(&w_k)?,
            w_v: flatten_in_proj(&w_v)?,
            b_q: bias(&vb, &[h, k], "b_Q")?.flatten_all()?,
            b_k: bias(&vb, &[h, k], "b_K")?.flatten_all()?,
            b_v: bias(&vb, &[h, k], "b_V")?.flatten_all()?,
            w_o: w_o.reshape((h * k, d))?,
            b_o: bias(&vb, &[d], "b_O")?,
            n_heads: h,
            d_head: k,
        })
    }

    /// `[b, p, d_model]` to `[b, heads, p, d_head]`
    fn project(&self, x: &Tensor, w: &Tensor, b: &Tensor) -> Result<Tensor> {
        let (batch, seq, _) = x.dims3()?;
        Ok(x
            .broadcast_matmul(w)?
            .broadcast_add(b)?
            .reshape((batch, seq, self.n_heads, self.d_head))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    fn forward(
        &self,
        x: &Tensor,
        layer: usize,
        hooks: &HookSpec,
        captures: &mut HashMap<HookPoint, Tensor>,
    ) -> Result<Tensor> {
        let (batch, seq, _) = x.dims3()?;

        let q = self.project(x, &self.w_q, &self.b_q)?;
        let k = self.project(x, &self.w_k, &self.b_k)?;
        let v = self.project(x, &self.w_v, &self.b_v)?;

        let scale = 1.0 / (self.d_head as f64).sqrt();
        let scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let mask = create_causal_mask(seq, x.device(), x.dtype())?;
        let scores = scores.broadcast_add(&mask)?;

        let pattern = candle_nn::ops::softmax_last_dim(&scores)?;
        let pattern = hooks.run_hook(HookPoint::AttnPattern(layer), pattern, captures)?;

        // z: [b, p, heads, d_head]
        let z = pattern.matmul(&v)?.transpose(1, 2)?.contiguous()?;
        let z = hooks.run_hook(HookPoint::AttnZ(layer), z, captures)?;

        let out = z
            .reshape((batch, seq, self.n_heads * self.d_head))?
            .broadcast_matmul(&self.w_o)?
            .broadcast_add(&self.b_o)?;
        hooks.run_hook(HookPoint::AttnOut(layer), out, captures)
    }
}

struct Mlp {
    w_in: Tensor,
    b_in: Tensor,
    w_out: Tensor,
    b_out: Tensor,
    act_fn: String,
}

impl Mlp {
    fn load(vb: VarBuilder, config: &HookedConfig) -> Result<Self> {
        let (d, m) = (config.d_model, config.d_mlp);
        Ok(Self {
            w_in: weight(&vb, &[d, m], "W_in")?,
            b_in: bias(&vb, &[m], "b_in")?,
            w_out: weight(&vb, &[m, d], "W_out")?,
            b_out: bias(&vb, &[d], "b_out")?,
            act_fn: config.act_fn.clone(),
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        layer: usize,
        hooks: &HookSpec,
        captures: &mut HashMap<HookPoint, Tensor>,
    ) -> Result<Tensor> {
        let pre = x.broadcast_matmul(&self.w_in)?.broadcast_add(&self.b_in)?;
        let pre = hooks.run_hook(HookPoint::MlpPre(layer), pre, captures)?;

        let post = match self.act_fn.as_str() {
            "gelu" | "gelu_new" => pre.gelu()?,
            _ => pre.relu()?,
        };
        let post = hooks.run_hook(HookPoint::MlpPost(layer), post, captures)?;

        let out = post
            .broadcast_matmul(&self.w_out)?
            .broadcast_add(&self.b_out)?;
        hooks.run_hook(HookPoint::MlpOut(layer), out, captures)
    }
}

struct Block {
    ln1: Option<LayerNorm>,
    attn: Attention,
    ln2: Option<LayerNorm>,
    mlp: Mlp,
}

impl Block {
    fn load(vb: VarBuilder, config: &HookedConfig) -> Result<Self> {
        Ok(Self {
            ln1: layer_norm(vb.pp("ln1"), config)?,
            attn: Attention::load(vb.pp("attn"), config)?,
            ln2: layer_norm(vb.pp("ln2"), config)?,
            mlp: Mlp::load(vb.pp("mlp"), config)?,
        })
    }

    fn forward(
        &self,
        resid: Tensor,
        layer: usize,
        hooks: &HookSpec,
        captures: &mut HashMap<HookPoint, Tensor>,
    ) -> Result<Tensor> {
        let resid = hooks.run_hook(HookPoint::ResidPre(layer), resid, captures)?;

        let attn_out = self
            .attn
            .forward(&apply_norm(&self.ln1, &resid)?, layer, hooks, captures)?;
        let resid = hooks.run_hook(HookPoint::ResidMid(layer), (resid + attn_out)?, captures)?;

        let mlp_out = self
            .mlp
            .forward(&apply_norm(&self.ln2, &resid)?, layer, hooks, captures)?;
        hooks.run_hook(HookPoint::ResidPost(layer), (resid + mlp_out)?, captures)
    }
}

/// Small transformer with TransformerLens hook points
pub struct HookedTransformer {
    embed: Embedding,
    w_pos: Tensor,
    blocks: Vec<Block>,
    ln_final: Option<LayerNorm>,
    w_u: Tensor,
    b_u: Tensor,
    config: HookedConfig,
    device: Device,
}

impl HookedTransformer {
    /// Build from any var builder (safetensors-backed or a fresh `VarMap`)
    pub fn from_var_builder(config: HookedConfig, vb: VarBuilder) -> Result<Self> {
        let w_e = weight(&vb.pp("embed"), &[config.d_vocab, config.d_model], "W_E")?;
        let embed = Embedding::new(w_e, config.d_model);
        let w_pos = weight(&vb.pp("pos_embed"), &[config.n_ctx, config.d_model], "W_pos")?;

        let mut blocks = Vec::with_capacity(config.n_layers);
        for l in 0..config.n_layers {
            blocks.push(Block::load(vb.pp(format!("blocks.{l}")), &config)?);
        }

        let ln_final = layer_norm(vb.pp("ln_final"), &config)?;
        let unembed = vb.pp("unembed");
        let w_u = weight(&unembed, &[config.d_model, config.d_vocab], "W_U")?;
        let b_u = bias(&unembed, &[config.d_vocab], "b_U")?;

        Ok(Self {
            embed,
            w_pos,
            blocks,
            ln_final,
            w_u,
            b_u,
            device: vb.device().clone(),
            config,
        })
    }

    /// Load from a local directory, a local safetensors file or a HF repo id
    pub fn load(source: &str, device: &Device, dtype: DType) -> Result<Self> {
        let (weights_path, config_path) = resolve_files(source)?;

        let config = match config_path {
            Some(path) => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("Failed to parse {}", path.display()))?
            }
            None => {
                info!("No {CONFIG_FILE}, inferring configuration from tensor shapes");
                HookedConfig::infer_from_safetensors(&weights_path)?
            }
        };

        info!(
            "Model config: {} layers, {} heads, d_model {}, d_mlp {}, n_ctx {}",
            config.n_layers, config.n_heads, config.d_model, config.d_mlp, config.n_ctx
        );

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], dtype, device)? };
        let model = Self::from_var_builder(config, vb)?;
        info!("Model loaded successfully");
        Ok(model)
    }

    pub fn config(&self) -> &HookedConfig {
        &self.config
    }
}

fn resolve_files(source: &str) -> Result<(PathBuf, Option<PathBuf>)> {
    let path = Path::new(source);
    if path.is_dir() {
        let config = path.join(CONFIG_FILE);
        return Ok((path.join(WEIGHTS_FILE), config.exists().then_some(config)));
    }
    if path.is_file() {
        let config = path.with_file_name(CONFIG_FILE);
        return Ok((path.to_path_buf(), config.exists().then_some(config)));
    }

    debug!("{source} is not a local path, trying HuggingFace");
    let api = Api::new()?;
    let repo = api.repo(Repo::new(source.to_string(), RepoType::Model));
    let weights = repo
        .get(WEIGHTS_FILE)
        .with_context(|| format!("Failed to download {WEIGHTS_FILE}"))?;
    Ok((weights, repo.get(CONFIG_FILE).ok()))
}

impl MathsBackend for HookedTransformer {
    fn n_layers(&self) -> usize {
        self.config.n_layers
    }
    fn n_heads(&self) -> usize {
        self.config.n_heads
    }
    fn d_head(&self) -> usize {
        self.config.d_head
    }
    fn d_mlp(&self) -> usize {
        self.config.d_mlp
    }
    fn d_model(&self) -> usize {
        self.config.d_model
    }
    fn d_vocab(&self) -> usize {
        self.config.d_vocab
    }
    fn n_ctx(&self) -> usize {
        self.config.n_ctx
    }
    fn device(&self) -> &Device {
        &self.device
    }

    fn forward(&self, tokens: &Tensor, hooks: &HookSpec) -> Result<HookCache> {
        let (batch, seq) = tokens.dims2()?;
        anyhow::ensure!(
            seq <= self.config.n_ctx,
            "Sequence length {seq} exceeds n_ctx {}",
            self.config.n_ctx
        );
        let mut captures = HashMap::new();

        let embed = self.embed.forward(tokens)?;
        let embed = hooks.run_hook(HookPoint::Embed, embed, &mut captures)?;

        let pos = self
            .w_pos
            .narrow(0, 0, seq)?
            .unsqueeze(0)?
            .broadcast_as((batch, seq, self.config.d_model))?
            .contiguous()?;
        let pos = hooks.run_hook(HookPoint::PosEmbed, pos, &mut captures)?;

        let mut resid = (embed + pos)?;
        for (l, block) in self.blocks.iter().enumerate() {
            resid = block.forward(resid, l, hooks, &mut captures)?;
        }

        let logits = apply_norm(&self.ln_final, &resid)?
            .broadcast_matmul(&self.w_u)?
            .broadcast_add(&self.b_u)?;
        Ok(HookCache::with_captures(logits, captures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::Patch;
    use candle_nn::VarMap;

    fn tiny_config() -> HookedConfig {
        HookedConfig {
            n_layers: 2,
            n_heads: 3,
            d_model: 12,
            d_head: 4,
            d_mlp: 16,
            d_vocab: 14,
            n_ctx: 10,
            normalization_type: default_normalization_type(),
            act_fn: default_act_fn(),
            eps: default_eps(),
        }
    }

    fn tiny_model() -> HookedTransformer {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        HookedTransformer::from_var_builder(tiny_config(), vb).unwrap()
    }

    fn tokens() -> Tensor {
        Tensor::new(&[[1u32, 2, 3, 10, 4, 5, 6, 12, 11, 0]], &Device::Cpu).unwrap()
    }

    #[test]
    fn test_forward_shapes() {
        let model = tiny_model();
        let mut hooks = HookSpec::new();
        hooks
            .capture(HookPoint::AttnZ(1))
            .capture(HookPoint::MlpPost(0))
            .capture(HookPoint::AttnPattern(0));
        let cache = model.forward(&tokens(), &hooks).unwrap();
        assert_eq!(cache.output().dims(), &[1, 10, 14]);
        assert_eq!(cache.require(&HookPoint::AttnZ(1)).unwrap().dims(), &[1, 10, 3, 4]);
        assert_eq!(cache.require(&HookPoint::MlpPost(0)).unwrap().dims(), &[1, 10, 16]);
        assert_eq!(
            cache.require(&HookPoint::AttnPattern(0)).unwrap().dims(),
            &[1, 3, 10, 10]
        );
        assert!(cache.get(&HookPoint::ResidPost(1)).is_none());
    }

    #[test]
    fn test_attention_pattern_is_causal() {
        let model = tiny_model();
        let mut hooks = HookSpec::new();
        hooks.capture(HookPoint::AttnPattern(0));
        let cache = model.forward(&tokens(), &hooks).unwrap();
        let pattern: Vec<f32> = cache
            .require(&HookPoint::AttnPattern(0))
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        for head in 0..3 {
            for q in 0..10 {
                let row = &pattern[(head * 10 + q) * 10..(head * 10 + q + 1) * 10];
                assert!(row[q + 1..].iter().all(|&w| w == 0.0));
                let total: f32 = row.iter().sum();
                assert!((total - 1.0).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_patch_only_affects_later_positions() {
        let model = tiny_model();
        let clean = model.forward(&tokens(), &HookSpec::new()).unwrap();

        let mut hooks = HookSpec::new();
        hooks.patch(HookPoint::AttnZ(0), Patch::zero(6, Some(1)));
        let patched = model.forward(&tokens(), &hooks).unwrap();

        let a: Vec<f32> = clean.output().flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = patched.output().flatten_all().unwrap().to_vec1().unwrap();
        // Positions 0..6 cover the first 6 * 14 logits
        for i in 0..6 * 14 {
            assert!((a[i] - b[i]).abs() < 1e-6, "logit {i} changed");
        }
    }
}
