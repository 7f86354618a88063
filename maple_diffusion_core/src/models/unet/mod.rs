//! The denoiser, split into three stages along its skip-connection
//! boundaries so intermediate activations of one stage can be dropped before
//! the next begins. Stage handoffs travel as flat tensor vectors reordered by
//! a [`FeedPlan`] fixed at construction.

mod blocks;
mod routing;

use candle_core::{DType, Device, Tensor};
use candle_nn::{Conv2d, GroupNorm, Module, VarBuilder};

pub use routing::FeedPlan;

use crate::error::{DiffusionError, Result};
use crate::weights::ModelWeights;
use blocks::{
    conv3x3, conv3x3_stride2, OutputBlock, ResBlock, SpatialTransformer, TimeEmbed, CONTEXT_WIDTH,
    EMB_WIDTH,
};

const PREFIX: &str = "model.diffusion_model";
const PROMPT_LENGTH: usize = 77;

/// Output size of a stride-2 convolution with 3x3 kernel and padding 1.
fn half(d: usize) -> usize {
    (d + 1) / 2
}

fn pop(feeds: &mut Vec<Tensor>) -> Result<Tensor> {
    feeds
        .pop()
        .ok_or_else(|| DiffusionError::Routing("stage feed underrun".into()))
}

/// Shapes of the first handoff vector: the twelve saved inputs in emission
/// order, the projected time embedding, the bottleneck, then the prompt
/// embedding appended by the runner.
fn stage_a_handoff_shapes(n: usize, lh: usize, lw: usize) -> Vec<Vec<usize>> {
    let (h2, w2) = (half(lh), half(lw));
    let (h4, w4) = (half(h2), half(w2));
    let (h8, w8) = (half(h4), half(w4));
    let mut shapes = vec![
        vec![n, 320, lh, lw],
        vec![n, 320, lh, lw],
        vec![n, 320, lh, lw],
        vec![n, 320, h2, w2],
        vec![n, 640, h2, w2],
        vec![n, 640, h2, w2],
        vec![n, 640, h4, w4],
        vec![n, 1280, h4, w4],
        vec![n, 1280, h4, w4],
        vec![n, 1280, h8, w8],
        vec![n, 1280, h8, w8],
        vec![n, 1280, h8, w8],
    ];
    shapes.push(vec![1, EMB_WIDTH]);
    shapes.push(vec![n, 1280, h8, w8]);
    shapes.push(vec![n, PROMPT_LENGTH, CONTEXT_WIDTH]);
    shapes
}

/// Slot order of the second stage: prompt embedding first, then the time
/// embedding, saved inputs in emission order, bottleneck last. Same-shaped
/// slots stay in emission order so shape matching resolves them correctly.
fn stage_b_slot_shapes(n: usize, lh: usize, lw: usize) -> Vec<Vec<usize>> {
    let produced = stage_a_handoff_shapes(n, lh, lw);
    let mut slots = Vec::with_capacity(produced.len());
    slots.push(produced[14].clone()); // cond
    slots.push(produced[12].clone()); // emb
    slots.extend(produced[..12].iter().cloned());
    slots.push(produced[13].clone()); // bottleneck
    slots
}

/// Slot-to-index map for the third stage. Its feed vector is the second
/// stage's output (seven unclaimed saved inputs, time embedding, running
/// tensor) plus the prompt embedding appended by the runner.
fn stage_c_index_map() -> Vec<usize> {
    vec![9, 7, 0, 1, 2, 3, 4, 5, 6, 8]
}

enum InputStep {
    Pair { res: ResBlock, attn: SpatialTransformer },
    Res(ResBlock),
    Down(Conv2d),
}

/// Contracting path: input blocks and the middle block. Emits every saved
/// input alongside the time embedding and bottleneck.
struct StageA {
    time_embed: TimeEmbed,
    conv_in: Conv2d,
    steps: Vec<InputStep>,
    mid_res1: ResBlock,
    mid_attn: SpatialTransformer,
    mid_res2: ResBlock,
}

impl StageA {
    fn new(vb: &VarBuilder) -> Result<Self> {
        let pair = |i: usize, in_c: usize, out_c: usize| -> Result<InputStep> {
            let block = vb.pp(format!("input_blocks.{i}"));
            Ok(InputStep::Pair {
                res: ResBlock::new(in_c, out_c, block.pp("0"))?,
                attn: SpatialTransformer::new(out_c, block.pp("1"))?,
            })
        };
        let down = |i: usize, c: usize| -> Result<InputStep> {
            Ok(InputStep::Down(conv3x3_stride2(
                c,
                c,
                vb.pp(format!("input_blocks.{i}.0.op")),
            )?))
        };
        let res = |i: usize, c: usize| -> Result<InputStep> {
            Ok(InputStep::Res(ResBlock::new(
                c,
                c,
                vb.pp(format!("input_blocks.{i}.0")),
            )?))
        };
        let steps = vec![
            pair(1, 320, 320)?,
            pair(2, 320, 320)?,
            down(3, 320)?,
            pair(4, 320, 640)?,
            pair(5, 640, 640)?,
            down(6, 640)?,
            pair(7, 640, 1280)?,
            pair(8, 1280, 1280)?,
            down(9, 1280)?,
            res(10, 1280)?,
            res(11, 1280)?,
        ];
        let mid = vb.pp("middle_block");
        Ok(Self {
            time_embed: TimeEmbed::new(vb.pp("time_embed"))?,
            conv_in: conv3x3(4, 320, vb.pp("input_blocks.0.0"))?,
            steps,
            mid_res1: ResBlock::new(1280, 1280, mid.pp("0"))?,
            mid_attn: SpatialTransformer::new(1280, mid.pp("1"))?,
            mid_res2: ResBlock::new(1280, 1280, mid.pp("2"))?,
        })
    }

    fn forward(&self, latent: &Tensor, temb: &Tensor, cond: &Tensor) -> Result<Vec<Tensor>> {
        let _span = tracing::span!(tracing::Level::TRACE, "unet-stage-a").entered();
        let emb = self.time_embed.forward(temb)?;
        let n = cond.dim(0)?;
        let mut x = if latent.dim(0)? == n {
            latent.clone()
        } else {
            // Batched guidance: replicate the latent across the batch.
            let (_, c, h, w) = latent.dims4()?;
            latent.expand((n, c, h, w))?.contiguous()?
        };
        let mut saved = Vec::with_capacity(14);
        x = self.conv_in.forward(&x)?;
        saved.push(x.clone());
        for step in &self.steps {
            x = match step {
                InputStep::Pair { res, attn } => attn.forward(&res.forward(&x, &emb)?, cond)?,
                InputStep::Res(res) => res.forward(&x, &emb)?,
                InputStep::Down(conv) => conv.forward(&x)?,
            };
            saved.push(x.clone());
        }
        x = self.mid_res1.forward(&x, &emb)?;
        x = self.mid_attn.forward(&x, cond)?;
        x = self.mid_res2.forward(&x, &emb)?;
        saved.push(emb);
        saved.push(x);
        Ok(saved)
    }
}

/// First half of the expanding path: output blocks 0-4 at the coarsest
/// widths. Passes unclaimed saved inputs straight through.
struct StageB {
    blocks: Vec<OutputBlock>,
    plan: FeedPlan,
}

impl StageB {
    fn new(vb: &VarBuilder, n: usize, lh: usize, lw: usize) -> Result<Self> {
        let layout: [(bool, bool); 5] = [
            (false, false),
            (false, false),
            (false, true),
            (true, false),
            (true, false),
        ];
        let mut blocks = Vec::with_capacity(layout.len());
        for (i, (attention, upsample)) in layout.into_iter().enumerate() {
            blocks.push(OutputBlock::new(
                2560,
                1280,
                attention,
                upsample,
                vb.pp(format!("output_blocks.{i}")),
            )?);
        }
        let plan = FeedPlan::by_shape(
            &stage_a_handoff_shapes(n, lh, lw),
            &stage_b_slot_shapes(n, lh, lw),
        )?;
        Ok(Self { blocks, plan })
    }

    fn forward(&self, feeds: Vec<Tensor>) -> Result<Vec<Tensor>> {
        let _span = tracing::span!(tracing::Level::TRACE, "unet-stage-b").entered();
        let mut slots = self.plan.route(feeds)?;
        let mut x = pop(&mut slots)?;
        let cond = slots.remove(0);
        let emb = slots.remove(0);
        for block in &self.blocks {
            let skip = pop(&mut slots)?;
            x = block.forward(&Tensor::cat(&[&x, &skip], 1)?, &emb, &cond)?;
        }
        let mut out = slots;
        out.push(emb);
        out.push(x);
        Ok(out)
    }
}

/// Second half of the expanding path: output blocks 5-11 plus the output
/// head projecting back to four latent channels.
struct StageC {
    blocks: Vec<OutputBlock>,
    out_norm: GroupNorm,
    out_conv: Conv2d,
    plan: FeedPlan,
}

impl StageC {
    fn new(vb: &VarBuilder) -> Result<Self> {
        let layout: [(usize, usize, bool); 7] = [
            (1920, 1280, true),
            (1920, 640, false),
            (1280, 640, false),
            (960, 640, true),
            (960, 320, false),
            (640, 320, false),
            (640, 320, false),
        ];
        let mut blocks = Vec::with_capacity(layout.len());
        for (i, (in_c, out_c, upsample)) in layout.into_iter().enumerate() {
            blocks.push(OutputBlock::new(
                in_c,
                out_c,
                true,
                upsample,
                vb.pp(format!("output_blocks.{}", i + 5)),
            )?);
        }
        Ok(Self {
            blocks,
            out_norm: candle_nn::group_norm(32, 320, 1e-5, vb.pp("out.0"))?,
            out_conv: conv3x3(320, 4, vb.pp("out.2"))?,
            plan: FeedPlan::by_index(stage_c_index_map())?,
        })
    }

    fn forward(&self, feeds: Vec<Tensor>) -> Result<Tensor> {
        let _span = tracing::span!(tracing::Level::TRACE, "unet-stage-c").entered();
        let mut slots = self.plan.route(feeds)?;
        let mut x = pop(&mut slots)?;
        let cond = slots.remove(0);
        let emb = slots.remove(0);
        for block in &self.blocks {
            let skip = pop(&mut slots)?;
            x = block.forward(&Tensor::cat(&[&x, &skip], 1)?, &emb, &cond)?;
        }
        let x = self.out_conv.forward(&self.out_norm.forward(&x)?.silu()?)?;
        Ok(x)
    }
}

/// The full three-stage denoiser for a fixed latent size and guidance batch.
pub struct DenoiserStaged {
    stage_a: StageA,
    stage_b: StageB,
    stage_c: StageC,
}

impl DenoiserStaged {
    /// `cond_batch` is the guidance batch the stages are planned for: 2 when
    /// both guidance branches run in one batched pass, 1 when they run
    /// sequentially. `height`/`width` are latent dimensions.
    pub fn new(
        weights: &ModelWeights,
        device: &Device,
        cond_batch: usize,
        height: usize,
        width: usize,
    ) -> Result<Self> {
        Self::new_with_progress(weights, device, cond_batch, height, width, &mut |_| {})
    }

    /// Like [`DenoiserStaged::new`], reporting each finished stage (1 through
    /// 3) as it loads.
    pub fn new_with_progress(
        weights: &ModelWeights,
        device: &Device,
        cond_batch: usize,
        height: usize,
        width: usize,
        progress: &mut dyn FnMut(usize),
    ) -> Result<Self> {
        let vb = weights.var_builder(DType::F32, device).pp(PREFIX);
        let stage_a = StageA::new(&vb)?;
        progress(1);
        let stage_b = StageB::new(&vb, cond_batch, height, width)?;
        progress(2);
        let stage_c = StageC::new(&vb)?;
        progress(3);
        Ok(Self {
            stage_a,
            stage_b,
            stage_c,
        })
    }

    /// Predict noise for `latent` (`[1, 4, h, w]`) under the given guidance
    /// embeddings (`[n, 77, 768]`) at the timestep encoded by `temb`
    /// (`[1, 320]`). Returns `[n, 4, h, w]`.
    pub fn forward(&self, latent: &Tensor, temb: &Tensor, cond: &Tensor) -> Result<Tensor> {
        let mut handoff = self.stage_a.forward(latent, temb, cond)?;
        handoff.push(cond.clone());
        let mut handoff = self.stage_b.forward(handoff)?;
        handoff.push(cond.clone());
        self.stage_c.forward(handoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_stage_plan_lifts_trailing_prompt_to_front() {
        let produced = stage_a_handoff_shapes(2, 64, 64);
        let slots = stage_b_slot_shapes(2, 64, 64);
        let plan = FeedPlan::by_shape(&produced, &slots).unwrap();
        // cond, emb, the twelve saved inputs, then the bottleneck, which
        // shares a shape with the deepest saved inputs but is emitted after
        // them.
        assert_eq!(
            plan.order(),
            [14, 12, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 13]
        );
    }

    #[test]
    fn second_stage_plan_handles_odd_latents() {
        // 3 halves to 2, then 1, then 1.
        let produced = stage_a_handoff_shapes(1, 3, 5);
        let slots = stage_b_slot_shapes(1, 3, 5);
        let plan = FeedPlan::by_shape(&produced, &slots).unwrap();
        assert_eq!(plan.order()[0], 14);
        assert_eq!(plan.order()[1], 12);
    }

    #[test]
    fn third_stage_map_is_a_permutation() {
        assert!(FeedPlan::by_index(stage_c_index_map()).is_ok());
    }
}
