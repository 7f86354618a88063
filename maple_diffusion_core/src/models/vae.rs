use candle_core::{DType, Device, Tensor, D};
use candle_nn::{
    conv2d, group_norm, linear, linear_no_bias, Conv2d, Conv2dConfig, GroupNorm, Linear, Module,
    VarBuilder,
};
use image::RgbaImage;

use crate::error::Result;
use crate::weights::ModelWeights;

/// Latents are stored rescaled by this factor; encoding multiplies by it and
/// decoding divides it back out.
pub const LATENT_SCALE: f64 = 0.18215;

const GN_GROUPS: usize = 32;
const GN_EPS: f64 = 1e-5;
const BASE_CHANNELS: usize = 128;
const MID_CHANNELS: usize = 512;
/// Channel width per resolution level, finest first.
const LEVEL_CHANNELS: [usize; 4] = [128, 256, 512, 512];

fn conv3x3(in_c: usize, out_c: usize, vb: VarBuilder) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: 1,
        ..Default::default()
    };
    Ok(conv2d(in_c, out_c, 3, cfg, vb)?)
}

fn conv1x1(in_c: usize, out_c: usize, vb: VarBuilder) -> Result<Conv2d> {
    Ok(conv2d(in_c, out_c, 1, Conv2dConfig::default(), vb)?)
}

struct ResnetBlock {
    norm1: GroupNorm,
    conv1: Conv2d,
    norm2: GroupNorm,
    conv2: Conv2d,
    nin_shortcut: Option<Conv2d>,
}

impl ResnetBlock {
    fn new(in_c: usize, out_c: usize, vb: VarBuilder) -> Result<Self> {
        let nin_shortcut = if in_c != out_c {
            Some(conv1x1(in_c, out_c, vb.pp("nin_shortcut"))?)
        } else {
            None
        };
        Ok(Self {
            norm1: group_norm(GN_GROUPS, in_c, GN_EPS, vb.pp("norm1"))?,
            conv1: conv3x3(in_c, out_c, vb.pp("conv1"))?,
            norm2: group_norm(GN_GROUPS, out_c, GN_EPS, vb.pp("norm2"))?,
            conv2: conv3x3(out_c, out_c, vb.pp("conv2"))?,
            nin_shortcut,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.conv1.forward(&self.norm1.forward(x)?.silu()?)?;
        let h = self.conv2.forward(&self.norm2.forward(&h)?.silu()?)?;
        let skip = match &self.nin_shortcut {
            Some(conv) => conv.forward(x)?,
            None => x.clone(),
        };
        Ok((skip + h)?)
    }
}

/// Single-head self-attention over all spatial positions, used only at the
/// coarsest resolution.
struct AttnBlock {
    norm: GroupNorm,
    q: Linear,
    k: Linear,
    v: Linear,
    proj_out: Linear,
}

impl AttnBlock {
    fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm: group_norm(GN_GROUPS, channels, GN_EPS, vb.pp("norm"))?,
            q: linear_no_bias(channels, channels, vb.pp("q"))?,
            k: linear_no_bias(channels, channels, vb.pp("k"))?,
            v: linear_no_bias(channels, channels, vb.pp("v"))?,
            proj_out: linear(channels, channels, vb.pp("proj_out"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = x.dims4()?;
        let tokens = self
            .norm
            .forward(x)?
            .reshape((b, c, h * w))?
            .transpose(1, 2)?
            .contiguous()?;
        let q = self.q.forward(&tokens)?;
        let k = (self.k.forward(&tokens)? * (1.0 / (c as f64).sqrt()))?;
        let v = self.v.forward(&tokens)?;
        let att = candle_nn::ops::softmax(&q.matmul(&k.t()?.contiguous()?)?, D::Minus1)?;
        let out = self.proj_out.forward(&att.matmul(&v)?)?;
        let out = out.transpose(1, 2)?.reshape((b, c, h, w))?;
        Ok((out + x)?)
    }
}

struct MidBlock {
    block_1: ResnetBlock,
    attn_1: AttnBlock,
    block_2: ResnetBlock,
}

impl MidBlock {
    fn new(vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            block_1: ResnetBlock::new(MID_CHANNELS, MID_CHANNELS, vb.pp("block_1"))?,
            attn_1: AttnBlock::new(MID_CHANNELS, vb.pp("attn_1"))?,
            block_2: ResnetBlock::new(MID_CHANNELS, MID_CHANNELS, vb.pp("block_2"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.block_2
            .forward(&self.attn_1.forward(&self.block_1.forward(x)?)?)
    }
}

/// Nearest-neighbor halving. The sample point for output pixel `i` lies
/// between inputs `2i` and `2i + 1` and rounds up.
fn downsample_nearest_half(x: &Tensor) -> Result<Tensor> {
    let (_b, _c, h, w) = x.dims4()?;
    let rows: Vec<u32> = (0..h as u32 / 2).map(|i| 2 * i + 1).collect();
    let cols: Vec<u32> = (0..w as u32 / 2).map(|i| 2 * i + 1).collect();
    let rows = Tensor::new(rows, x.device())?;
    let cols = Tensor::new(cols, x.device())?;
    Ok(x.index_select(&rows, 2)?.index_select(&cols, 3)?)
}

fn upsample_nearest_double(x: &Tensor) -> Result<Tensor> {
    let (_b, _c, h, w) = x.dims4()?;
    Ok(x.upsample_nearest2d(h * 2, w * 2)?)
}

/// Draw from the distribution parameterized by `moments` (mean and log
/// variance stacked on the channel axis) using caller-provided noise.
pub fn sample_diagonal_gaussian(moments: &Tensor, noise: &Tensor) -> Result<Tensor> {
    let channels = moments.dim(1)? / 2;
    let mean = moments.narrow(1, 0, channels)?;
    let logvar = moments.narrow(1, channels, channels)?.clamp(-30f32, 20f32)?;
    let std = (logvar * 0.5)?.exp()?;
    Ok((mean + (std * noise)?)?)
}

/// RGBA image to a `[1, 3, h, w]` tensor in `[-1, 1]`. Alpha is dropped.
pub fn image_to_input(image: &RgbaImage, device: &Device) -> Result<Tensor> {
    let (w, h) = image.dimensions();
    let mut data = Vec::with_capacity((w * h * 3) as usize);
    for px in image.pixels() {
        data.extend_from_slice(&[px[0] as f32, px[1] as f32, px[2] as f32]);
    }
    let x = Tensor::from_vec(data, (h as usize, w as usize, 3), device)?
        .permute((2, 0, 1))?
        .unsqueeze(0)?;
    Ok((((x / 255.)? * 2.)? - 1.)?)
}

/// `[1, 3, h, w]` tensor in `[0, 1]` to an opaque RGBA image. Values are
/// clamped, scaled to bytes and rounded.
pub fn tensor_to_rgba(x: &Tensor) -> Result<RgbaImage> {
    let (_b, _c, h, w) = x.dims4()?;
    let bytes = (x.clamp(0f32, 1f32)? * 255.)?
        .round()?
        .to_dtype(DType::U8)?
        .squeeze(0)?
        .permute((1, 2, 0))?
        .contiguous()?
        .flatten_all()?
        .to_vec1::<u8>()?;
    let mut rgba = Vec::with_capacity(h * w * 4);
    for px in bytes.chunks_exact(3) {
        rgba.extend_from_slice(px);
        rgba.push(255);
    }
    RgbaImage::from_raw(w as u32, h as u32, rgba)
        .ok_or_else(|| candle_core::Error::Msg("pixel buffer does not match dimensions".into()).into())
}

struct EncoderDown {
    block_0: ResnetBlock,
    block_1: ResnetBlock,
    downsample: Option<Conv2d>,
}

/// Image-to-latent half of the autoencoder.
pub struct Encoder {
    conv_in: Conv2d,
    down: Vec<EncoderDown>,
    mid: MidBlock,
    norm_out: GroupNorm,
    conv_out: Conv2d,
    quant_conv: Conv2d,
}

impl Encoder {
    pub fn new(weights: &ModelWeights, device: &Device) -> Result<Self> {
        let root = weights.var_builder(DType::F32, device).pp("first_stage_model");
        let vb = root.pp("encoder");
        let mut down = Vec::with_capacity(LEVEL_CHANNELS.len());
        let mut in_c = BASE_CHANNELS;
        for (i, &out_c) in LEVEL_CHANNELS.iter().enumerate() {
            let level = vb.pp(format!("down.{i}"));
            let downsample = if i + 1 < LEVEL_CHANNELS.len() {
                Some(conv3x3(out_c, out_c, level.pp("downsample.conv"))?)
            } else {
                None
            };
            down.push(EncoderDown {
                block_0: ResnetBlock::new(in_c, out_c, level.pp("block.0"))?,
                block_1: ResnetBlock::new(out_c, out_c, level.pp("block.1"))?,
                downsample,
            });
            in_c = out_c;
        }
        Ok(Self {
            conv_in: conv3x3(3, BASE_CHANNELS, vb.pp("conv_in"))?,
            down,
            mid: MidBlock::new(vb.pp("mid"))?,
            norm_out: group_norm(GN_GROUPS, MID_CHANNELS, GN_EPS, vb.pp("norm_out"))?,
            conv_out: conv3x3(MID_CHANNELS, 8, vb.pp("conv_out"))?,
            quant_conv: conv1x1(8, 8, root.pp("quant_conv"))?,
        })
    }

    /// Encode a `[1, 3, h, w]` image in `[-1, 1]` into a rescaled `[1, 4,
    /// h/8, w/8]` latent, sampling the posterior with the given noise.
    pub fn encode(&self, image: &Tensor, noise: &Tensor) -> Result<Tensor> {
        let _span = tracing::span!(tracing::Level::TRACE, "vae-encode").entered();
        let mut x = self.conv_in.forward(image)?;
        for level in &self.down {
            x = level.block_1.forward(&level.block_0.forward(&x)?)?;
            if let Some(conv) = &level.downsample {
                x = conv.forward(&downsample_nearest_half(&x)?)?;
            }
        }
        let x = self.mid.forward(&x)?;
        let x = self.conv_out.forward(&self.norm_out.forward(&x)?.silu()?)?;
        let moments = self.quant_conv.forward(&x)?;
        Ok((sample_diagonal_gaussian(&moments, noise)? * LATENT_SCALE)?)
    }
}

struct DecoderUp {
    blocks: Vec<ResnetBlock>,
    upsample: Option<Conv2d>,
}

/// Latent-to-image half of the autoencoder.
pub struct Decoder {
    post_quant_conv: Conv2d,
    conv_in: Conv2d,
    mid: MidBlock,
    up: Vec<DecoderUp>,
    norm_out: GroupNorm,
    conv_out: Conv2d,
}

impl Decoder {
    pub fn new(weights: &ModelWeights, device: &Device) -> Result<Self> {
        let root = weights.var_builder(DType::F32, device).pp("first_stage_model");
        let vb = root.pp("decoder");
        // Levels run coarsest to finest: up.3 down to up.0.
        let mut up = Vec::with_capacity(LEVEL_CHANNELS.len());
        let mut in_c = MID_CHANNELS;
        for i in (0..LEVEL_CHANNELS.len()).rev() {
            let out_c = LEVEL_CHANNELS[i];
            let level = vb.pp(format!("up.{i}"));
            let mut blocks = Vec::with_capacity(3);
            for j in 0..3 {
                blocks.push(ResnetBlock::new(
                    if j == 0 { in_c } else { out_c },
                    out_c,
                    level.pp(format!("block.{j}")),
                )?);
            }
            let upsample = if i > 0 {
                Some(conv3x3(out_c, out_c, level.pp("upsample.conv"))?)
            } else {
                None
            };
            up.push(DecoderUp { blocks, upsample });
            in_c = out_c;
        }
        Ok(Self {
            post_quant_conv: conv1x1(4, 4, root.pp("post_quant_conv"))?,
            conv_in: conv3x3(4, MID_CHANNELS, vb.pp("conv_in"))?,
            mid: MidBlock::new(vb.pp("mid"))?,
            up,
            norm_out: group_norm(GN_GROUPS, BASE_CHANNELS, GN_EPS, vb.pp("norm_out"))?,
            conv_out: conv3x3(BASE_CHANNELS, 3, vb.pp("conv_out"))?,
        })
    }

    /// Decode a rescaled `[1, 4, h/8, w/8]` latent into an opaque RGBA image.
    pub fn decode(&self, latent: &Tensor) -> Result<RgbaImage> {
        let _span = tracing::span!(tracing::Level::TRACE, "vae-decode").entered();
        let x = (latent / LATENT_SCALE)?;
        let x = self.conv_in.forward(&self.post_quant_conv.forward(&x)?)?;
        let mut x = self.mid.forward(&x)?;
        for level in &self.up {
            for block in &level.blocks {
                x = block.forward(&x)?;
            }
            if let Some(conv) = &level.upsample {
                x = conv.forward(&upsample_nearest_double(&x)?)?;
            }
        }
        let x = self.conv_out.forward(&self.norm_out.forward(&x)?.silu()?)?;
        tensor_to_rgba(&((x + 1.)? * 0.5)?)
    }
}
