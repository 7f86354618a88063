use candle_core::{DType, Device, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, Module};
use image::RgbaImage;

use crate::error::Result;
use crate::models::vae::tensor_to_rgba;
use crate::weights::ModelWeights;

const ALPHA_COUNT: usize = 1000;
const PREVIEW_UPSCALE: usize = 8;

/// Deterministic guided denoising steps over the cumulative-alpha table.
///
/// Guidance uses a tanh soft clamp on the conditional delta; plain linear
/// extrapolation diverges at large scales.
pub struct Sampler {
    alphas_cumprod: Vec<f32>,
    preview_conv: Option<Conv2d>,
}

impl Sampler {
    pub fn new(weights: &ModelWeights, device: &Device) -> Result<Self> {
        let alphas_cumprod = weights.read_f16_values("alphas_cumprod", ALPHA_COUNT)?;
        // The cheap preview projection ships with some weight sets only.
        let preview_conv = if weights.contains("aux_output_conv.weight") {
            let vb = weights.var_builder(DType::F32, device);
            Some(conv2d(
                4,
                3,
                1,
                Conv2dConfig::default(),
                vb.pp("aux_output_conv"),
            )?)
        } else {
            None
        };
        Ok(Self {
            alphas_cumprod,
            preview_conv,
        })
    }

    #[cfg(test)]
    fn with_table(alphas_cumprod: Vec<f32>) -> Self {
        Self {
            alphas_cumprod,
            preview_conv: None,
        }
    }

    /// Cumulative alpha at `t`, with `alpha(-1) = 1` for the step past the
    /// start of the schedule.
    pub fn alpha(&self, t: i64) -> f32 {
        if t < 0 {
            1.0
        } else {
            self.alphas_cumprod[t as usize]
        }
    }

    /// One guided update of the latent from timestep `t` toward `t_prev`
    /// (which may be negative on the final step).
    pub fn step(
        &self,
        latent: &Tensor,
        eta_uncond: &Tensor,
        eta_cond: &Tensor,
        t: usize,
        t_prev: i64,
        guidance_scale: f32,
    ) -> Result<Tensor> {
        let delta = ((eta_cond - eta_uncond)? * guidance_scale as f64)?.tanh()?;
        let eta = (eta_uncond + delta)?;

        let alpha = self.alpha(t as i64) as f64;
        let alpha_prev = self.alpha(t_prev) as f64;
        let pred_x0 = ((latent - (&eta * (1.0 - alpha).sqrt())?)? / alpha.sqrt())?;
        let dir_x = (&eta * (1.0 - alpha_prev).sqrt())?;
        Ok(((pred_x0 * alpha_prev.sqrt())? + dir_x)?)
    }

    /// Forward-diffuse an encoded latent to the noise level of timestep `t`,
    /// seeding partial denoising.
    pub fn stochastic_encode(&self, latent: &Tensor, noise: &Tensor, t: usize) -> Result<Tensor> {
        let alpha = self.alpha(t as i64) as f64;
        Ok(((latent * alpha.sqrt())? + (noise * (1.0 - alpha).sqrt())?)?)
    }

    /// Low-fidelity per-step preview: a learned 1x1 projection of the latent
    /// to RGB, upsampled to pixel resolution. `None` when the weight set has
    /// no preview projection.
    pub fn preview(&self, latent: &Tensor) -> Result<Option<RgbaImage>> {
        let Some(conv) = &self.preview_conv else {
            return Ok(None);
        };
        let x = conv.forward(latent)?;
        let (_b, _c, h, w) = x.dims4()?;
        let x = x.upsample_nearest2d(h * PREVIEW_UPSCALE, w * PREVIEW_UPSCALE)?;
        Ok(Some(tensor_to_rgba(&x)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_table(value: f32) -> Sampler {
        Sampler::with_table(vec![value; ALPHA_COUNT])
    }

    fn tensor(values: &[f32]) -> Tensor {
        Tensor::from_vec(values.to_vec(), (1, values.len(), 1, 1), &Device::Cpu).unwrap()
    }

    #[test]
    fn equal_etas_reduce_to_unconditional_prediction() {
        let sampler = flat_table(0.5);
        let latent = tensor(&[1.0, -2.0]);
        let eta = tensor(&[0.3, 0.7]);
        // delta = tanh(g * 0) = 0 for any guidance scale.
        let a = sampler.step(&latent, &eta, &eta, 500, 450, 20.0).unwrap();
        let b = sampler.step(&latent, &eta, &eta, 500, 450, 0.0).unwrap();
        let (a, b) = (
            a.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            b.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
        );
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn equal_alphas_make_the_step_an_identity() {
        let sampler = flat_table(0.37);
        let latent = tensor(&[0.9, -1.4, 0.05]);
        let eta_uncond = tensor(&[2.0, -3.0, 0.5]);
        let eta_cond = tensor(&[-1.0, 4.0, 0.25]);
        let next = sampler
            .step(&latent, &eta_uncond, &eta_cond, 700, 600, 7.5)
            .unwrap();
        let before = latent.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let after = next.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (x, y) in before.iter().zip(&after) {
            assert!((x - y).abs() < 1e-4);
        }
    }

    #[test]
    fn alpha_before_schedule_start_is_one() {
        let mut table = vec![0.5; ALPHA_COUNT];
        table[0] = 0.99;
        let sampler = Sampler::with_table(table);
        assert_eq!(sampler.alpha(-1), 1.0);
        assert_eq!(sampler.alpha(0), 0.99);
    }

    #[test]
    fn stochastic_encode_blends_by_alpha() {
        let mut table = vec![0.0; ALPHA_COUNT];
        table[10] = 0.25;
        let sampler = Sampler::with_table(table);
        let latent = tensor(&[2.0]);
        let noise = tensor(&[4.0]);
        let mixed = sampler.stochastic_encode(&latent, &noise, 10).unwrap();
        let v = mixed.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        // sqrt(0.25) * 2 + sqrt(0.75) * 4
        assert!((v[0] - (1.0 + 0.75f32.sqrt() * 4.0)).abs() < 1e-5);
    }
}
