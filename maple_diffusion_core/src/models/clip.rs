use candle_core::{DType, Device, Tensor, D};
use candle_nn::{layer_norm, linear, LayerNorm, Linear, Module, VarBuilder};

use crate::error::Result;
use crate::tokenizer::PROMPT_LENGTH;
use crate::weights::ModelWeights;

const PREFIX: &str = "cond_stage_model.transformer.text_model";
const WIDTH: usize = 768;
const LAYERS: usize = 12;
const HEADS: usize = 12;
const HEAD_DIM: usize = WIDTH / HEADS;
const MLP_WIDTH: usize = 4 * WIDTH;
const VOCAB_SIZE: usize = 49_408;
const LN_EPS: f64 = 1e-5;

/// Guidance embeddings for one prompt pair, each `[1, 77, 768]`.
pub struct ConditioningPair {
    pub cond: Tensor,
    pub uncond: Tensor,
}

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
}

impl Attention {
    fn new(vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            q_proj: linear(WIDTH, WIDTH, vb.pp("q_proj"))?,
            k_proj: linear(WIDTH, WIDTH, vb.pp("k_proj"))?,
            v_proj: linear(WIDTH, WIDTH, vb.pp("v_proj"))?,
            out_proj: linear(WIDTH, WIDTH, vb.pp("out_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (b, t, _) = x.dims3()?;
        let split = |t: Tensor| -> candle_core::Result<Tensor> {
            t.reshape((b, PROMPT_LENGTH, HEADS, HEAD_DIM))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = split(self.q_proj.forward(x)?)?;
        let k = split(self.k_proj.forward(x)?)?;
        let v = split(self.v_proj.forward(x)?)?;

        let scale = 1.0 / (HEAD_DIM as f64).sqrt();
        let scores = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
        let scores = scores.broadcast_add(mask)?;
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let out = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, t, WIDTH))?;
        Ok(self.out_proj.forward(&out)?)
    }
}

struct EncoderLayer {
    layer_norm1: LayerNorm,
    attn: Attention,
    layer_norm2: LayerNorm,
    fc1: Linear,
    fc2: Linear,
}

impl EncoderLayer {
    fn new(vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            layer_norm1: layer_norm(WIDTH, LN_EPS, vb.pp("layer_norm1"))?,
            attn: Attention::new(vb.pp("self_attn"))?,
            layer_norm2: layer_norm(WIDTH, LN_EPS, vb.pp("layer_norm2"))?,
            fc1: linear(WIDTH, MLP_WIDTH, vb.pp("mlp.fc1"))?,
            fc2: linear(MLP_WIDTH, WIDTH, vb.pp("mlp.fc2"))?,
        })
    }

    fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let x = (x + self.attn.forward(&self.layer_norm1.forward(x)?, mask)?)?;
        let mlp = self
            .fc2
            .forward(&self.fc1.forward(&self.layer_norm2.forward(&x)?)?.gelu_erf()?)?;
        Ok((x + mlp)?)
    }
}

/// The prompt encoder: a 12-layer causally-masked transformer producing one
/// `[1, 77, 768]` embedding per token sequence.
pub struct TextEncoder {
    token_embedding: Tensor,
    position_embedding: Tensor,
    layers: Vec<EncoderLayer>,
    final_norm: LayerNorm,
    causal_mask: Tensor,
    device: Device,
}

impl TextEncoder {
    pub fn new(weights: &ModelWeights, device: &Device) -> Result<Self> {
        let vb = weights.var_builder(DType::F32, device);
        let vb = vb.pp(PREFIX);
        let token_embedding =
            vb.get((VOCAB_SIZE, WIDTH), "embeddings.token_embedding.weight")?;
        let position_embedding =
            vb.get((PROMPT_LENGTH, WIDTH), "embeddings.position_embedding.weight")?;
        let mut layers = Vec::with_capacity(LAYERS);
        for i in 0..LAYERS {
            layers.push(EncoderLayer::new(vb.pp(format!("encoder.layers.{i}")))?);
        }
        let final_norm = layer_norm(WIDTH, LN_EPS, vb.pp("final_layer_norm"))?;
        let causal_mask = weights
            .load("causal_mask", &[1, 1, PROMPT_LENGTH, PROMPT_LENGTH], device)?
            .to_dtype(DType::F32)?;
        Ok(Self {
            token_embedding,
            position_embedding,
            layers,
            final_norm,
            causal_mask,
            device: device.clone(),
        })
    }

    /// Embed the negative and positive prompts of one request as a single
    /// batch-of-2 pass, sliced back into two `[1, 77, 768]` embeddings.
    pub fn forward_pair(
        &self,
        uncond: &[u32; PROMPT_LENGTH],
        cond: &[u32; PROMPT_LENGTH],
    ) -> Result<ConditioningPair> {
        let _span = tracing::span!(tracing::Level::TRACE, "text-encoder").entered();
        let mut ids = Vec::with_capacity(2 * PROMPT_LENGTH);
        ids.extend_from_slice(uncond);
        ids.extend_from_slice(cond);
        let ids = Tensor::from_vec(ids, 2 * PROMPT_LENGTH, &self.device)?;
        let embedded = self
            .token_embedding
            .index_select(&ids, 0)?
            .reshape((2, PROMPT_LENGTH, WIDTH))?;
        let mut x = embedded.broadcast_add(&self.position_embedding)?;
        for layer in &self.layers {
            x = layer.forward(&x, &self.causal_mask)?;
        }
        let x = self.final_norm.forward(&x)?;
        Ok(ConditioningPair {
            uncond: x.narrow(0, 0, 1)?.contiguous()?,
            cond: x.narrow(0, 1, 1)?.contiguous()?,
        })
    }
}
