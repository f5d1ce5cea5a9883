// Decoder-only transformer (Mistral / Llama / Qwen2)
//
// RMSNorm, rotary embeddings, grouped-query attention and a SwiGLU MLP, with
// every projection wrapped in a LoraLinear. Attention masks are built from
// per-token segment ids so packed windows never attend across examples.

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{Embedding, Linear, VarBuilder};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::lora::{ATTENTION_PROJECTIONS, MLP_PROJECTIONS};
use super::lora_impl::{LoraBuilder, LoraLinear};

/// Supported model families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    Mistral,
    Llama,
    Qwen2,
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f64 {
    10_000.0
}

/// Fields of a Hugging Face `config.json` the decoder needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureConfig {
    pub model_type: String,
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    #[serde(default)]
    pub head_dim: Option<usize>,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default)]
    pub max_position_embeddings: Option<usize>,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub attention_bias: bool,
}

impl ArchitectureConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn family(&self) -> Result<ModelFamily> {
        match self.model_type.as_str() {
            "mistral" => Ok(ModelFamily::Mistral),
            "llama" => Ok(ModelFamily::Llama),
            "qwen2" => Ok(ModelFamily::Qwen2),
            other => bail!(
                "unsupported model_type '{}' (supported: mistral, llama, qwen2)",
                other
            ),
        }
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads.max(1))
    }

    pub fn validate(&self) -> Result<()> {
        self.family()?;
        if self.num_attention_heads == 0 || self.num_hidden_layers == 0 || self.vocab_size == 0 {
            bail!("config.json has zero heads, layers or vocabulary");
        }
        if self.num_attention_heads % self.num_kv_heads() != 0 {
            bail!(
                "num_attention_heads ({}) is not a multiple of num_key_value_heads ({})",
                self.num_attention_heads,
                self.num_kv_heads()
            );
        }
        if self.head_dim() % 2 != 0 {
            bail!("head_dim {} must be even for rotary embeddings", self.head_dim());
        }
        Ok(())
    }

    /// q/k/v carry a bias (always on Qwen2, opt-in on Llama)
    pub fn has_qkv_bias(&self) -> bool {
        self.model_type == "qwen2" || self.attention_bias
    }

    /// Projection layers every decoder layer has
    pub fn projection_names(&self) -> Vec<&'static str> {
        ATTENTION_PROJECTIONS
            .iter()
            .chain(MLP_PROJECTIONS.iter())
            .copied()
            .collect()
    }

    /// (out, in) of a projection weight
    pub fn projection_dims(&self, name: &str) -> Option<(usize, usize)> {
        let attn = self.num_attention_heads * self.head_dim();
        let kv = self.num_kv_heads() * self.head_dim();
        match name {
            "q_proj" => Some((attn, self.hidden_size)),
            "k_proj" | "v_proj" => Some((kv, self.hidden_size)),
            "o_proj" => Some((self.hidden_size, attn)),
            "gate_proj" | "up_proj" => Some((self.intermediate_size, self.hidden_size)),
            "down_proj" => Some((self.hidden_size, self.intermediate_size)),
            _ => None,
        }
    }

    pub fn projection_has_bias(&self, name: &str) -> bool {
        matches!(name, "q_proj" | "k_proj" | "v_proj") && self.has_qkv_bias()
    }

    /// Weight prefix of a projection, e.g. "model.layers.3.mlp.up_proj"
    pub fn module_path(&self, layer: usize, name: &str) -> String {
        let block = if ATTENTION_PROJECTIONS.contains(&name) {
            "self_attn"
        } else {
            "mlp"
        };
        format!("model.layers.{}.{}.{}", layer, block, name)
    }

    /// Shape summary two checkpoints must share for an adapter to transfer
    pub fn fingerprint(&self) -> String {
        format!(
            "{}:L{}:H{}:I{}:A{}:KV{}:D{}:V{}",
            self.model_type,
            self.num_hidden_layers,
            self.hidden_size,
            self.intermediate_size,
            self.num_attention_heads,
            self.num_kv_heads(),
            self.head_dim(),
            self.vocab_size
        )
    }

    /// Approximate base parameter count
    pub fn parameter_count(&self) -> usize {
        let embeddings = self.vocab_size * self.hidden_size;
        let head = if self.tie_word_embeddings { 0 } else { embeddings };
        let per_layer: usize = self
            .projection_names()
            .iter()
            .filter_map(|name| self.projection_dims(name))
            .map(|(out, inp)| out * inp)
            .sum::<usize>()
            + 2 * self.hidden_size;
        embeddings + head + per_layer * self.num_hidden_layers + self.hidden_size
    }
}

/// Token positions and segment ids of a batch of windows.
///
/// Segment 0 marks padding; every packed example gets its own non-zero id.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceLayout {
    batch: usize,
    seq_len: usize,
    positions: Vec<u32>,
    segments: Vec<u32>,
}

impl SequenceLayout {
    pub fn new(batch: usize, seq_len: usize, positions: Vec<u32>, segments: Vec<u32>) -> Result<Self> {
        if positions.len() != batch * seq_len || segments.len() != batch * seq_len {
            bail!(
                "layout for {}x{} needs {} entries, got {} positions and {} segments",
                batch,
                seq_len,
                batch * seq_len,
                positions.len(),
                segments.len()
            );
        }
        Ok(Self {
            batch,
            seq_len,
            positions,
            segments,
        })
    }

    /// One unpadded sequence per row
    pub fn causal(batch: usize, seq_len: usize) -> Self {
        let positions = (0..batch)
            .flat_map(|_| 0..seq_len as u32)
            .collect::<Vec<_>>();
        Self {
            batch,
            seq_len,
            positions,
            segments: vec![1; batch * seq_len],
        }
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn positions(&self) -> &[u32] {
        &self.positions
    }

    pub fn segments(&self) -> &[u32] {
        &self.segments
    }

    /// Position i may attend to j when j <= i inside the same non-padding
    /// segment. Padding attends only to itself so no softmax row is empty.
    pub fn attention_mask(&self, dtype: DType, device: &Device) -> Result<Tensor> {
        let t = self.seq_len;
        let mut mask = vec![0f32; self.batch * t * t];
        for b in 0..self.batch {
            let seg = &self.segments[b * t..(b + 1) * t];
            for i in 0..t {
                for j in 0..t {
                    let allowed = j == i || (j < i && seg[i] != 0 && seg[j] == seg[i]);
                    if !allowed {
                        mask[(b * t + i) * t + j] = f32::NEG_INFINITY;
                    }
                }
            }
        }
        Ok(Tensor::from_vec(mask, (self.batch, 1, t, t), device)?.to_dtype(dtype)?)
    }

    fn positions_tensor(&self, device: &Device) -> Result<Tensor> {
        let positions: Vec<f32> = self.positions.iter().map(|&p| p as f32).collect();
        Ok(Tensor::from_vec(positions, (self.batch, self.seq_len), device)?)
    }
}

/// Keys and values of already-processed positions, one slot per layer
#[derive(Debug, Default)]
pub struct KvCache {
    layers: Vec<Option<(Tensor, Tensor)>>,
}

impl KvCache {
    pub fn new(num_layers: usize) -> Self {
        Self {
            layers: vec![None; num_layers],
        }
    }

    /// Cached sequence length
    pub fn len(&self) -> usize {
        self.layers
            .first()
            .and_then(|slot| slot.as_ref())
            .and_then(|(k, _)| k.dim(2).ok())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    fn load(size: usize, eps: f64, vb: VarBuilder, dtype: DType) -> Result<Self> {
        let weight = vb.get(size, "weight")?.to_dtype(dtype)?;
        Ok(Self { weight, eps })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let variance = x.sqr()?.mean_keepdim(D::Minus1)?;
        let x = x.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        Ok(x.to_dtype(dtype)?.broadcast_mul(&self.weight)?)
    }
}

struct Rotary {
    /// (1, 1, head_dim / 2)
    inv_freq: Tensor,
}

impl Rotary {
    fn new(config: &ArchitectureConfig, device: &Device) -> Result<Self> {
        let dim = config.head_dim();
        let inv_freq: Vec<f32> = (0..dim / 2)
            .map(|i| 1.0 / config.rope_theta.powf(2.0 * i as f64 / dim as f64) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, 1, dim / 2), device)?;
        Ok(Self { inv_freq })
    }

    /// cos and sin, each (b, 1, t, head_dim)
    fn cos_sin(&self, positions: &Tensor, dtype: DType) -> Result<(Tensor, Tensor)> {
        let freqs = positions.unsqueeze(2)?.broadcast_mul(&self.inv_freq)?;
        let emb = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;
        let cos = emb.cos()?.to_dtype(dtype)?.unsqueeze(1)?;
        let sin = emb.sin()?.to_dtype(dtype)?.unsqueeze(1)?;
        Ok((cos, sin))
    }
}

fn rotate_half(x: &Tensor) -> Result<Tensor> {
    let half = x.dim(D::Minus1)? / 2;
    let x1 = x.narrow(D::Minus1, 0, half)?;
    let x2 = x.narrow(D::Minus1, half, half)?;
    Ok(Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?)
}

fn apply_rotary(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    Ok((x.broadcast_mul(cos)? + rotate_half(x)?.broadcast_mul(sin)?)?)
}

struct Attention {
    q_proj: LoraLinear,
    k_proj: LoraLinear,
    v_proj: LoraLinear,
    o_proj: LoraLinear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(
        config: &ArchitectureConfig,
        layer: usize,
        vb: VarBuilder,
        lora: &mut LoraBuilder,
    ) -> Result<Self> {
        let mut proj = |name: &str| -> Result<LoraLinear> {
            let (out_dim, in_dim) = config
                .projection_dims(name)
                .with_context(|| format!("unknown projection {}", name))?;
            let pvb = vb.pp(name);
            let weight = pvb.get((out_dim, in_dim), "weight")?;
            let bias = if config.projection_has_bias(name) {
                Some(pvb.get(out_dim, "bias")?)
            } else {
                None
            };
            lora.linear(&config.module_path(layer, name), name, weight, bias)
        };

        Ok(Self {
            q_proj: proj("q_proj")?,
            k_proj: proj("k_proj")?,
            v_proj: proj("v_proj")?,
            o_proj: proj("o_proj")?,
            num_heads: config.num_attention_heads,
            num_kv_heads: config.num_kv_heads(),
            head_dim: config.head_dim(),
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        mask: Option<&Tensor>,
        train: bool,
        cache: Option<&mut Option<(Tensor, Tensor)>>,
    ) -> Result<Tensor> {
        let (b, t, _) = x.dims3()?;
        let heads = |proj: &LoraLinear, n: usize| -> Result<Tensor> {
            Ok(proj
                .forward(x, train)?
                .reshape((b, t, n, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };

        let q = apply_rotary(&heads(&self.q_proj, self.num_heads)?, cos, sin)?;
        let k = apply_rotary(&heads(&self.k_proj, self.num_kv_heads)?, cos, sin)?;
        let v = heads(&self.v_proj, self.num_kv_heads)?;

        let (k, v) = match cache {
            Some(slot) => {
                let (k, v) = match slot.take() {
                    Some((prev_k, prev_v)) => (
                        Tensor::cat(&[&prev_k, &k], 2)?,
                        Tensor::cat(&[&prev_v, &v], 2)?,
                    ),
                    None => (k, v),
                };
                *slot = Some((k.clone(), v.clone()));
                (k, v)
            }
            None => (k, v),
        };

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = candle_transformers::utils::repeat_kv(k, n_rep)?.contiguous()?;
        let v = candle_transformers::utils::repeat_kv(v, n_rep)?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?)? * scale)?;
        let scores = match mask {
            Some(mask) => scores.broadcast_add(mask)?,
            None => scores,
        };
        let probs = candle_nn::ops::softmax(&scores.to_dtype(DType::F32)?, D::Minus1)?
            .to_dtype(v.dtype())?;

        let y = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, t, self.num_heads * self.head_dim))?;
        self.o_proj.forward(&y, train)
    }
}

struct Mlp {
    gate_proj: LoraLinear,
    up_proj: LoraLinear,
    down_proj: LoraLinear,
}

impl Mlp {
    fn load(
        config: &ArchitectureConfig,
        layer: usize,
        vb: VarBuilder,
        lora: &mut LoraBuilder,
    ) -> Result<Self> {
        let mut proj = |name: &str| -> Result<LoraLinear> {
            let (out_dim, in_dim) = config
                .projection_dims(name)
                .with_context(|| format!("unknown projection {}", name))?;
            let weight = vb.pp(name).get((out_dim, in_dim), "weight")?;
            lora.linear(&config.module_path(layer, name), name, weight, None)
        };
        Ok(Self {
            gate_proj: proj("gate_proj")?,
            up_proj: proj("up_proj")?,
            down_proj: proj("down_proj")?,
        })
    }

    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let gate = self.gate_proj.forward(x, train)?.silu()?;
        let up = self.up_proj.forward(x, train)?;
        self.down_proj.forward(&(gate * up)?, train)
    }
}

struct DecoderLayer {
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn forward(
        &self,
        x: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        mask: Option<&Tensor>,
        train: bool,
        cache: Option<&mut Option<(Tensor, Tensor)>>,
    ) -> Result<Tensor> {
        let residual = x;
        let h = self.input_layernorm.forward(x)?;
        let h = self.self_attn.forward(&h, cos, sin, mask, train, cache)?;
        let x = (residual + h)?;
        let h = self.post_attention_layernorm.forward(&x)?;
        let h = self.mlp.forward(&h, train)?;
        Ok((x + h)?)
    }
}

/// Base model with LoRA-wrapped projections
pub struct DecoderModel {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Tensor,
    rotary: Rotary,
    config: ArchitectureConfig,
    dtype: DType,
    device: Device,
}

impl DecoderModel {
    /// Build from HF-named weights; adapters are created through `lora`
    pub fn load(
        config: &ArchitectureConfig,
        vb: VarBuilder,
        lora: &mut LoraBuilder,
        dtype: DType,
    ) -> Result<Self> {
        let device = vb.device().clone();
        let model_vb = vb.pp("model");

        let embeddings = model_vb
            .pp("embed_tokens")
            .get((config.vocab_size, config.hidden_size), "weight")
            .context("Failed to load token embeddings")?
            .to_dtype(dtype)?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for idx in 0..config.num_hidden_layers {
            let lvb = model_vb.pp(format!("layers.{}", idx));
            let layer = DecoderLayer {
                self_attn: Attention::load(config, idx, lvb.pp("self_attn"), lora)
                    .with_context(|| format!("Failed to load attention of layer {}", idx))?,
                mlp: Mlp::load(config, idx, lvb.pp("mlp"), lora)
                    .with_context(|| format!("Failed to load MLP of layer {}", idx))?,
                input_layernorm: RmsNorm::load(
                    config.hidden_size,
                    config.rms_norm_eps,
                    lvb.pp("input_layernorm"),
                    dtype,
                )?,
                post_attention_layernorm: RmsNorm::load(
                    config.hidden_size,
                    config.rms_norm_eps,
                    lvb.pp("post_attention_layernorm"),
                    dtype,
                )?,
            };
            layers.push(layer);
        }

        let norm = RmsNorm::load(config.hidden_size, config.rms_norm_eps, model_vb.pp("norm"), dtype)?;
        let lm_head = if config.tie_word_embeddings {
            embeddings.clone()
        } else {
            vb.pp("lm_head")
                .get((config.vocab_size, config.hidden_size), "weight")
                .context("Failed to load lm_head")?
                .to_dtype(dtype)?
        };

        Ok(Self {
            embed_tokens: Embedding::new(embeddings, config.hidden_size),
            layers,
            norm,
            lm_head,
            rotary: Rotary::new(config, &device)?,
            config: config.clone(),
            dtype,
            device,
        })
    }

    pub fn config(&self) -> &ArchitectureConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    fn hidden_states(
        &self,
        input_ids: &Tensor,
        positions: &Tensor,
        mask: Option<&Tensor>,
        train: bool,
        cache: Option<&mut KvCache>,
    ) -> Result<Tensor> {
        let mut x = self.embed_tokens.forward(input_ids)?;
        let (cos, sin) = self.rotary.cos_sin(positions, self.dtype)?;

        match cache {
            Some(cache) => {
                for (layer, slot) in self.layers.iter().zip(cache.layers.iter_mut()) {
                    x = layer.forward(&x, &cos, &sin, mask, train, Some(slot))?;
                }
            }
            None => {
                for layer in &self.layers {
                    x = layer.forward(&x, &cos, &sin, mask, train, None)?;
                }
            }
        }
        self.norm.forward(&x)
    }

    fn logits(&self, hidden: &Tensor) -> Result<Tensor> {
        let logits = Linear::new(self.lm_head.clone(), None).forward(hidden)?;
        Ok(logits.to_dtype(DType::F32)?)
    }

    /// Full-window forward pass; returns f32 logits (b, t, vocab)
    pub fn forward(&self, input_ids: &Tensor, layout: &SequenceLayout, train: bool) -> Result<Tensor> {
        let positions = layout.positions_tensor(&self.device)?;
        let mask = layout.attention_mask(self.dtype, &self.device)?;
        let hidden = self.hidden_states(input_ids, &positions, Some(&mask), train, None)?;
        self.logits(&hidden)
    }

    /// Incremental forward for generation; returns f32 logits (b, vocab) of
    /// the last input position
    pub fn forward_cached(&self, input_ids: &Tensor, cache: &mut KvCache) -> Result<Tensor> {
        let (b, t) = input_ids.dims2()?;
        let offset = cache.len();

        let positions: Vec<f32> = (0..b)
            .flat_map(|_| (offset..offset + t).map(|p| p as f32))
            .collect();
        let positions = Tensor::from_vec(positions, (b, t), &self.device)?;

        let mask = if t > 1 {
            let total = offset + t;
            let mask: Vec<f32> = (0..t)
                .flat_map(|i| {
                    (0..total).map(move |j| if j > offset + i { f32::NEG_INFINITY } else { 0.0 })
                })
                .collect();
            Some(Tensor::from_vec(mask, (1, 1, t, total), &self.device)?.to_dtype(self.dtype)?)
        } else {
            None
        };

        let hidden = self.hidden_states(input_ids, &positions, mask.as_ref(), false, Some(cache))?;
        let last = hidden.narrow(1, t - 1, 1)?;
        self.logits(&last)?.squeeze(1).map_err(Into::into)
    }

    /// Frozen parameter count
    pub fn frozen_params(&self) -> usize {
        let per_layer: usize = self
            .layers
            .iter()
            .map(|l| {
                l.self_attn.q_proj.frozen_params()
                    + l.self_attn.k_proj.frozen_params()
                    + l.self_attn.v_proj.frozen_params()
                    + l.self_attn.o_proj.frozen_params()
                    + l.mlp.gate_proj.frozen_params()
                    + l.mlp.up_proj.frozen_params()
                    + l.mlp.down_proj.frozen_params()
                    + 2 * self.config.hidden_size
            })
            .sum();
        let embeddings = self.config.vocab_size * self.config.hidden_size;
        let head = if self.config.tie_word_embeddings { 0 } else { embeddings };
        embeddings + head + per_layer + self.config.hidden_size
    }
}
