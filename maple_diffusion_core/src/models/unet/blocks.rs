use candle_core::{Tensor, D};
use candle_nn::{
    conv2d, group_norm, layer_norm, linear, linear_no_bias, Conv2d, Conv2dConfig, GroupNorm,
    LayerNorm, Linear, Module, VarBuilder,
};

use crate::error::Result;

const GN_GROUPS: usize = 32;
const NORM_EPS: f64 = 1e-5;
const ATTN_HEADS: usize = 8;
/// Channel width of the prompt embeddings fed to cross-attention.
pub const CONTEXT_WIDTH: usize = 768;
/// Channel width of the projected timestep embedding.
pub const EMB_WIDTH: usize = 1280;

pub fn conv3x3(in_c: usize, out_c: usize, vb: VarBuilder) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: 1,
        ..Default::default()
    };
    Ok(conv2d(in_c, out_c, 3, cfg, vb)?)
}

pub fn conv3x3_stride2(in_c: usize, out_c: usize, vb: VarBuilder) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: 1,
        stride: 2,
        ..Default::default()
    };
    Ok(conv2d(in_c, out_c, 3, cfg, vb)?)
}

fn conv1x1(in_c: usize, out_c: usize, vb: VarBuilder) -> Result<Conv2d> {
    Ok(conv2d(in_c, out_c, 1, Conv2dConfig::default(), vb)?)
}

/// Project the `[1, 320]` time feature up to the `[1, 1280]` embedding shared
/// by every residual block.
pub struct TimeEmbed {
    fc0: Linear,
    fc2: Linear,
}

impl TimeEmbed {
    pub fn new(vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc0: linear(320, EMB_WIDTH, vb.pp("0"))?,
            fc2: linear(EMB_WIDTH, EMB_WIDTH, vb.pp("2"))?,
        })
    }

    pub fn forward(&self, temb: &Tensor) -> Result<Tensor> {
        Ok(self.fc2.forward(&self.fc0.forward(temb)?.silu()?)?)
    }
}

/// Residual block conditioned on the timestep embedding.
pub struct ResBlock {
    in_norm: GroupNorm,
    in_conv: Conv2d,
    emb_proj: Linear,
    out_norm: GroupNorm,
    out_conv: Conv2d,
    skip_connection: Option<Conv2d>,
}

impl ResBlock {
    pub fn new(in_c: usize, out_c: usize, vb: VarBuilder) -> Result<Self> {
        let skip_connection = if in_c != out_c {
            Some(conv1x1(in_c, out_c, vb.pp("skip_connection"))?)
        } else {
            None
        };
        Ok(Self {
            in_norm: group_norm(GN_GROUPS, in_c, NORM_EPS, vb.pp("in_layers.0"))?,
            in_conv: conv3x3(in_c, out_c, vb.pp("in_layers.2"))?,
            emb_proj: linear(EMB_WIDTH, out_c, vb.pp("emb_layers.1"))?,
            out_norm: group_norm(GN_GROUPS, out_c, NORM_EPS, vb.pp("out_layers.0"))?,
            out_conv: conv3x3(out_c, out_c, vb.pp("out_layers.3"))?,
            skip_connection,
        })
    }

    pub fn forward(&self, x: &Tensor, emb: &Tensor) -> Result<Tensor> {
        let h = self.in_conv.forward(&self.in_norm.forward(x)?.silu()?)?;
        let e = self.emb_proj.forward(&emb.silu()?)?;
        let e = e.reshape((e.dim(0)?, (), 1, 1))?;
        let h = h.broadcast_add(&e)?;
        let h = self.out_conv.forward(&self.out_norm.forward(&h)?.silu()?)?;
        let skip = match &self.skip_connection {
            Some(conv) => conv.forward(x)?,
            None => x.clone(),
        };
        Ok((h + skip)?)
    }
}

/// Multi-head attention over spatial tokens. Self-attention when no context
/// is given, cross-attention against the prompt embedding otherwise.
struct CrossAttention {
    to_q: Linear,
    to_k: Linear,
    to_v: Linear,
    to_out: Linear,
    head_dim: usize,
}

impl CrossAttention {
    fn new(channels: usize, context_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            to_q: linear_no_bias(channels, channels, vb.pp("to_q"))?,
            to_k: linear_no_bias(context_dim, channels, vb.pp("to_k"))?,
            to_v: linear_no_bias(context_dim, channels, vb.pp("to_v"))?,
            to_out: linear(channels, channels, vb.pp("to_out.0"))?,
            head_dim: channels / ATTN_HEADS,
        })
    }

    fn forward(&self, x: &Tensor, context: Option<&Tensor>) -> Result<Tensor> {
        let (n, hw, c) = x.dims3()?;
        let context = context.unwrap_or(x);
        let t = context.dim(1)?;
        let split = |t: Tensor, len: usize| -> candle_core::Result<Tensor> {
            t.reshape((n, len, ATTN_HEADS, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = split(self.to_q.forward(x)?, hw)?;
        let k = split(self.to_k.forward(context)?, t)?;
        let v = split(self.to_v.forward(context)?, t)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let att = q.matmul(&(k.t()?.contiguous()? * scale)?)?;
        let att = candle_nn::ops::softmax(&att, D::Minus1)?;
        let out = att.matmul(&v)?.transpose(1, 2)?.reshape((n, hw, c))?;
        Ok(self.to_out.forward(&out)?)
    }
}

/// Gated-GELU feed-forward: one projection to twice the hidden width, the
/// upper half gating the lower.
struct FeedForward {
    proj: Linear,
    out: Linear,
}

impl FeedForward {
    fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            proj: linear(channels, channels * 8, vb.pp("0.proj"))?,
            out: linear(channels * 4, channels, vb.pp("2"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = self.proj.forward(x)?;
        let width = hidden.dim(D::Minus1)? / 2;
        let value = hidden.narrow(D::Minus1, 0, width)?;
        let gate = hidden.narrow(D::Minus1, width, width)?;
        Ok(self.out.forward(&(value * gate.gelu_erf()?)?)?)
    }
}

struct TransformerBlock {
    norm1: LayerNorm,
    attn1: CrossAttention,
    norm2: LayerNorm,
    attn2: CrossAttention,
    norm3: LayerNorm,
    ff: FeedForward,
}

impl TransformerBlock {
    fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm1: layer_norm(channels, NORM_EPS, vb.pp("norm1"))?,
            attn1: CrossAttention::new(channels, channels, vb.pp("attn1"))?,
            norm2: layer_norm(channels, NORM_EPS, vb.pp("norm2"))?,
            attn2: CrossAttention::new(channels, CONTEXT_WIDTH, vb.pp("attn2"))?,
            norm3: layer_norm(channels, NORM_EPS, vb.pp("norm3"))?,
            ff: FeedForward::new(channels, vb.pp("ff.net"))?,
        })
    }

    fn forward(&self, x: &Tensor, cond: &Tensor) -> Result<Tensor> {
        let x = (self.attn1.forward(&self.norm1.forward(x)?, None)? + x)?;
        let x = (self.attn2.forward(&self.norm2.forward(&x)?, Some(cond))? + x)?;
        Ok((self.ff.forward(&self.norm3.forward(&x)?)? + x)?)
    }
}

/// Channel-preserving attention block: flatten the spatial grid to tokens,
/// run one transformer block against the prompt, fold back and add.
pub struct SpatialTransformer {
    norm: GroupNorm,
    proj_in: Conv2d,
    block: TransformerBlock,
    proj_out: Conv2d,
}

impl SpatialTransformer {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm: group_norm(GN_GROUPS, channels, NORM_EPS, vb.pp("norm"))?,
            proj_in: conv1x1(channels, channels, vb.pp("proj_in"))?,
            block: TransformerBlock::new(channels, vb.pp("transformer_blocks.0"))?,
            proj_out: conv1x1(channels, channels, vb.pp("proj_out"))?,
        })
    }

    pub fn forward(&self, x: &Tensor, cond: &Tensor) -> Result<Tensor> {
        let (n, c, h, w) = x.dims4()?;
        let tokens = self
            .proj_in
            .forward(&self.norm.forward(x)?)?
            .reshape((n, c, h * w))?
            .transpose(1, 2)?
            .contiguous()?;
        let tokens = self.block.forward(&tokens, cond)?;
        let out = tokens
            .transpose(1, 2)?
            .reshape((n, c, h, w))?
            .contiguous()?;
        Ok((self.proj_out.forward(&out)? + x)?)
    }
}

/// One decoder-side block: residual on the skip-concatenated input, optional
/// attention, optional nearest-neighbor upsample.
pub struct OutputBlock {
    res: ResBlock,
    attn: Option<SpatialTransformer>,
    upsample: Option<Conv2d>,
}

impl OutputBlock {
    pub fn new(
        in_c: usize,
        out_c: usize,
        attention: bool,
        upsample: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let attn = if attention {
            Some(SpatialTransformer::new(out_c, vb.pp("1"))?)
        } else {
            None
        };
        let upsample = if upsample {
            let conv_vb = vb.pp(if attention { "2.conv" } else { "1.conv" });
            Some(conv3x3(out_c, out_c, conv_vb)?)
        } else {
            None
        };
        Ok(Self {
            res: ResBlock::new(in_c, out_c, vb.pp("0"))?,
            attn,
            upsample,
        })
    }

    pub fn forward(&self, x: &Tensor, emb: &Tensor, cond: &Tensor) -> Result<Tensor> {
        let mut x = self.res.forward(x, emb)?;
        if let Some(attn) = &self.attn {
            x = attn.forward(&x, cond)?;
        }
        if let Some(conv) = &self.upsample {
            let (_n, _c, h, w) = x.dims4()?;
            x = conv.forward(&x.upsample_nearest2d(h * 2, w * 2)?)?;
        }
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};

    fn zeros_vb() -> VarBuilder<'static> {
        VarBuilder::zeros(DType::F32, &Device::Cpu)
    }

    #[test]
    fn res_block_projects_channel_mismatch() {
        let vb = zeros_vb();
        let block = ResBlock::new(32, 64, vb).unwrap();
        let x = Tensor::zeros((2, 32, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let emb = Tensor::zeros((1, EMB_WIDTH), DType::F32, &Device::Cpu).unwrap();
        let y = block.forward(&x, &emb).unwrap();
        assert_eq!(y.dims(), [2, 64, 4, 4]);
    }

    #[test]
    fn spatial_transformer_preserves_shape() {
        let vb = zeros_vb();
        let block = SpatialTransformer::new(32, vb).unwrap();
        let x = Tensor::zeros((2, 32, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let cond = Tensor::zeros((2, 77, CONTEXT_WIDTH), DType::F32, &Device::Cpu).unwrap();
        let y = block.forward(&x, &cond).unwrap();
        assert_eq!(y.dims(), [2, 32, 4, 4]);
    }

    #[test]
    fn output_block_upsamples_after_attention() {
        let vb = zeros_vb();
        let block = OutputBlock::new(96, 32, true, true, vb).unwrap();
        let x = Tensor::zeros((1, 96, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let emb = Tensor::zeros((1, EMB_WIDTH), DType::F32, &Device::Cpu).unwrap();
        let cond = Tensor::zeros((1, 77, CONTEXT_WIDTH), DType::F32, &Device::Cpu).unwrap();
        let y = block.forward(&x, &emb, &cond).unwrap();
        assert_eq!(y.dims(), [1, 32, 8, 8]);
    }

    #[test]
    fn feed_forward_gates_and_projects_back() {
        let vb = zeros_vb();
        let ff = FeedForward::new(16, vb).unwrap();
        let x = Tensor::zeros((1, 3, 16), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(ff.forward(&x).unwrap().dims(), [1, 3, 16]);
    }
}
