//! Request orchestration: owns the subgraphs, walks one request through
//! tokenize, encode, denoise and decode, and keeps resident memory inside the
//! configured budget by releasing subgraphs between phases.

mod sampler;
mod scheduler;

use candle_core::{Device, Tensor};
use image::RgbaImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use tracing::info;

pub use sampler::Sampler;
pub use scheduler::Scheduler;

use crate::error::{DiffusionError, Result};
use crate::model_source::ModelSource;
use crate::models::clip::TextEncoder;
use crate::models::unet::DenoiserStaged;
use crate::models::vae::{image_to_input, Decoder, Encoder};
use crate::tokenizer::ClipTokenizer;
use crate::weights::ModelWeights;

pub const LATENT_CHANNELS: usize = 4;
/// Pixels per latent cell along each axis.
pub const LATENT_FACTOR: usize = 8;
const DEFAULT_STRENGTH: f32 = 0.75;

/// How aggressively the pipeline trades speed for resident memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryMode {
    /// Run the two guidance branches sequentially and release each subgraph
    /// as soon as its phase ends. Fits in roughly half the footprint of
    /// [`MemoryMode::Performance`] at about half the step rate.
    #[default]
    Low,
    /// Batch both guidance branches through the denoiser and keep subgraphs
    /// resident for the whole request.
    Performance,
}

/// Settings fixed for the lifetime of a [`Pipeline`]. The output size is
/// baked into the denoiser's stage plans, so changing it means rebuilding the
/// pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub memory_mode: MemoryMode,
    /// Wait for the device after each model invocation. Keeps command queues
    /// from piling up whole-step workloads on memory-starved devices.
    pub synchronize: bool,
    /// Output image height in pixels, a multiple of [`LATENT_FACTOR`].
    pub height: usize,
    /// Output image width in pixels, a multiple of [`LATENT_FACTOR`].
    pub width: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            memory_mode: MemoryMode::Low,
            synchronize: true,
            height: 512,
            width: 512,
        }
    }
}

/// One generation request. Build with [`SampleRequest::text_to_image`] or
/// [`SampleRequest::image_to_image`] and adjust through the `with_` methods.
#[derive(Debug, Clone)]
pub struct SampleRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub init_image: Option<RgbaImage>,
    /// How much of the schedule an init image runs through, in `[0, 1]`.
    /// 0 reproduces the input, 1 ignores it.
    pub strength: Option<f32>,
    pub seed: u64,
    pub steps: usize,
    pub guidance_scale: f32,
}

impl SampleRequest {
    pub fn text_to_image(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: String::new(),
            init_image: None,
            strength: None,
            seed: 0,
            steps: 20,
            guidance_scale: 7.5,
        }
    }

    pub fn image_to_image(prompt: impl Into<String>, init_image: RgbaImage) -> Self {
        Self {
            init_image: Some(init_image),
            strength: Some(DEFAULT_STRENGTH),
            guidance_scale: 5.0,
            ..Self::text_to_image(prompt)
        }
    }

    pub fn with_negative_prompt(mut self, negative_prompt: impl Into<String>) -> Self {
        self.negative_prompt = negative_prompt.into();
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_guidance_scale(mut self, guidance_scale: f32) -> Self {
        self.guidance_scale = guidance_scale;
        self
    }

    pub fn with_strength(mut self, strength: f32) -> Self {
        self.strength = Some(strength);
        self
    }

    fn validate(&self, config: &PipelineConfig) -> Result<()> {
        if self.steps == 0 || self.steps > 1000 {
            return Err(DiffusionError::InvalidRequest(format!(
                "steps must be in 1..=1000, got {}",
                self.steps
            )));
        }
        if let Some(strength) = self.strength {
            if !(0.0..=1.0).contains(&strength) {
                return Err(DiffusionError::InvalidRequest(format!(
                    "strength must be in [0, 1], got {strength}"
                )));
            }
            if self.init_image.is_none() {
                return Err(DiffusionError::InvalidRequest(
                    "strength only applies to requests with an init image".into(),
                ));
            }
        }
        if let Some(image) = &self.init_image {
            let (w, h) = image.dimensions();
            if (w as usize, h as usize) != (config.width, config.height) {
                return Err(DiffusionError::InvalidRequest(format!(
                    "init image is {w}x{h}, the pipeline renders {}x{}",
                    config.width, config.height
                )));
            }
        }
        Ok(())
    }
}

/// A progress report streamed during loading and generation. `image` carries
/// a per-step preview when the weight set ships one, and the final image on
/// the last update.
#[derive(Debug, Clone)]
pub struct GenerationUpdate {
    pub image: Option<RgbaImage>,
    pub fraction: f32,
    pub stage: String,
}

impl GenerationUpdate {
    fn stage(fraction: f32, stage: impl Into<String>) -> Self {
        Self {
            image: None,
            fraction,
            stage: stage.into(),
        }
    }
}

/// A lazily-built model component that can be dropped to reclaim memory.
enum Subgraph<T> {
    Unloaded,
    Loading,
    Resident(T),
}

impl<T> Subgraph<T> {
    fn is_resident(&self) -> bool {
        matches!(self, Self::Resident(_))
    }

    fn release(&mut self) {
        *self = Self::Unloaded;
    }

    fn load(&mut self, label: &str, build: impl FnOnce() -> Result<T>) -> Result<()> {
        if self.is_resident() {
            return Ok(());
        }
        info!("loading {label}");
        *self = Self::Loading;
        match build() {
            Ok(value) => {
                *self = Self::Resident(value);
                Ok(())
            }
            Err(err) => {
                *self = Self::Unloaded;
                Err(err)
            }
        }
    }

    fn get(&self, label: &str) -> Result<&T> {
        match self {
            Self::Resident(value) => Ok(value),
            _ => Err(candle_core::Error::Msg(format!("{label} is not loaded")).into()),
        }
    }

    fn get_or_load(&mut self, label: &str, build: impl FnOnce() -> Result<T>) -> Result<&T> {
        self.load(label, build)?;
        self.get(label)
    }
}

/// Which subgraphs are resident, captured on entry to `generate` and restored
/// on exit so one request never changes the pipeline's standing footprint.
#[derive(Clone, Copy)]
struct Residency {
    text_encoder: bool,
    denoiser: bool,
    encoder: bool,
    decoder: bool,
}

/// A loaded model directory plus the subgraphs built from it, configured for
/// one fixed output size and memory mode.
pub struct Pipeline {
    weights: ModelWeights,
    device: Device,
    config: PipelineConfig,
    tokenizer: ClipTokenizer,
    sampler: Sampler,
    text_encoder: Subgraph<TextEncoder>,
    denoiser: Subgraph<DenoiserStaged>,
    encoder: Subgraph<Encoder>,
    decoder: Subgraph<Decoder>,
}

impl Pipeline {
    pub fn new(weights: ModelWeights, device: Device, config: PipelineConfig) -> Result<Self> {
        if config.height == 0
            || config.width == 0
            || config.height % LATENT_FACTOR != 0
            || config.width % LATENT_FACTOR != 0
        {
            return Err(DiffusionError::InvalidRequest(format!(
                "output size {}x{} must be a positive multiple of {LATENT_FACTOR}",
                config.width, config.height
            )));
        }
        let tokenizer = ClipTokenizer::new(&weights)?;
        let sampler = Sampler::new(&weights, &device)?;
        Ok(Self {
            weights,
            device,
            config,
            tokenizer,
            sampler,
            text_encoder: Subgraph::Unloaded,
            denoiser: Subgraph::Unloaded,
            encoder: Subgraph::Unloaded,
            decoder: Subgraph::Unloaded,
        })
    }

    /// Resolve a [`ModelSource`] and build a pipeline over it. `progress`
    /// reports the fetch (extraction) fraction.
    pub fn from_source(
        source: &ModelSource,
        device: Device,
        config: PipelineConfig,
        progress: &mut dyn FnMut(f32),
    ) -> Result<Self> {
        let dir = source.fetch(progress)?;
        Self::new(ModelWeights::new(dir)?, device, config)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Labels of the currently resident subgraphs, for footprint assertions.
    pub fn resident(&self) -> Vec<&'static str> {
        let mut parts = Vec::new();
        if self.text_encoder.is_resident() {
            parts.push("text-encoder");
        }
        if self.denoiser.is_resident() {
            parts.push("denoiser");
        }
        if self.encoder.is_resident() {
            parts.push("image-encoder");
        }
        if self.decoder.is_resident() {
            parts.push("image-decoder");
        }
        parts
    }

    /// Latent height and width for the configured output size.
    fn latent_size(&self) -> (usize, usize) {
        (
            self.config.height / LATENT_FACTOR,
            self.config.width / LATENT_FACTOR,
        )
    }

    /// Guidance batch the denoiser is planned for.
    fn cond_batch(&self) -> usize {
        match self.config.memory_mode {
            MemoryMode::Low => 1,
            MemoryMode::Performance => 2,
        }
    }

    /// Preload the denoiser so the first request does not pay its build cost.
    /// The remaining subgraphs are cheap by comparison and stay lazy. A
    /// preloaded denoiser stays resident across requests even in
    /// [`MemoryMode::Low`], trading its phase release for speed.
    pub fn load_models(&mut self, progress: &mut dyn FnMut(GenerationUpdate)) -> Result<()> {
        let (lh, lw) = self.latent_size();
        let cond_batch = self.cond_batch();
        let weights = &self.weights;
        let device = &self.device;
        self.denoiser.load("denoiser", || {
            DenoiserStaged::new_with_progress(weights, device, cond_batch, lh, lw, &mut |stage| {
                progress(GenerationUpdate::stage(
                    0.25 * stage as f32,
                    format!("Loading UNet part {stage}/3"),
                ))
            })
        })?;
        progress(GenerationUpdate::stage(1.0, "Loaded models"));
        Ok(())
    }

    /// Run one request, streaming progress updates, and return the image.
    /// Subgraphs loaded on behalf of the request are released before
    /// returning, whether it succeeds or fails.
    pub fn generate(
        &mut self,
        request: &SampleRequest,
        progress: &mut dyn FnMut(GenerationUpdate),
    ) -> Result<RgbaImage> {
        request.validate(&self.config)?;
        let snapshot = self.residency();
        let result = self.run_request(request, &snapshot, progress);
        self.restore(snapshot);
        result
    }

    fn run_request(
        &mut self,
        request: &SampleRequest,
        snapshot: &Residency,
        progress: &mut dyn FnMut(GenerationUpdate),
    ) -> Result<RgbaImage> {
        let _span =
            tracing::span!(tracing::Level::INFO, "generate", seed = request.seed).entered();
        let mut rng = StdRng::seed_from_u64(request.seed);
        let (lh, lw) = self.latent_size();
        let low_memory = self.config.memory_mode == MemoryMode::Low;

        progress(GenerationUpdate::stage(0.0, "Tokenizing..."));
        let uncond_ids = self.tokenizer.encode(&request.negative_prompt)?;
        let cond_ids = self.tokenizer.encode(&request.prompt)?;
        let guidance = {
            let weights = &self.weights;
            let device = &self.device;
            let encoder = self
                .text_encoder
                .get_or_load("text encoder", || TextEncoder::new(weights, device))?;
            encoder.forward_pair(&uncond_ids, &cond_ids)?
        };
        // A subgraph that was already resident on entry is the caller's
        // choice to keep warm; phase releases only cover what this request
        // loaded, so residency is identical before and after the call.
        if low_memory && !snapshot.text_encoder {
            self.text_encoder.release();
        }
        self.maybe_synchronize()?;

        progress(GenerationUpdate::stage(0.0, "Generating noise..."));
        let scheduler = Scheduler::new(&self.weights, &self.device, request.steps)?;
        let strength = request
            .init_image
            .as_ref()
            .map(|_| request.strength.unwrap_or(DEFAULT_STRENGTH));
        let timesteps = scheduler.consumed(strength);
        let noise = self.randn(&mut rng, (1, LATENT_CHANNELS, lh, lw))?;

        let mut latent = match &request.init_image {
            None => noise,
            Some(image) => {
                let input = image_to_input(image, &self.device)?;
                let encoded = {
                    let weights = &self.weights;
                    let device = &self.device;
                    let encoder = self
                        .encoder
                        .get_or_load("image encoder", || Encoder::new(weights, device))?;
                    encoder.encode(&input, &noise)?
                };
                if low_memory && !snapshot.encoder {
                    self.encoder.release();
                }
                self.maybe_synchronize()?;
                match timesteps.first() {
                    Some(&t) => {
                        // Forward-diffusion noise is drawn independently of
                        // the posterior sample noise.
                        let mix_noise = self.randn(&mut rng, (1, LATENT_CHANNELS, lh, lw))?;
                        self.sampler.stochastic_encode(&encoded, &mix_noise, t)?
                    }
                    // Strength 0: no sampling steps, decode the encoding.
                    None => encoded,
                }
            }
        };

        progress(GenerationUpdate::stage(0.0, "Starting diffusion..."));
        {
            let weights = &self.weights;
            let device = &self.device;
            let cond_batch = self.cond_batch();
            self.denoiser.load("denoiser", || {
                DenoiserStaged::new(weights, device, cond_batch, lh, lw)
            })?;
        }
        let denoiser = self.denoiser.get("denoiser")?;
        let batched = match self.config.memory_mode {
            MemoryMode::Low => None,
            MemoryMode::Performance => {
                Some(Tensor::cat(&[&guidance.uncond, &guidance.cond], 0)?)
            }
        };
        let total = timesteps.len();
        for (i, &t) in timesteps.iter().enumerate() {
            let temb = scheduler.time_feature(t)?;
            let (eta_uncond, eta_cond) = match &batched {
                None => (
                    denoiser.forward(&latent, &temb, &guidance.uncond)?,
                    denoiser.forward(&latent, &temb, &guidance.cond)?,
                ),
                Some(cond) => {
                    let eta = denoiser.forward(&latent, &temb, cond)?;
                    (eta.narrow(0, 0, 1)?, eta.narrow(0, 1, 1)?)
                }
            };
            let t_prev = t as i64 - scheduler.stride() as i64;
            latent = self.sampler.step(
                &latent,
                &eta_uncond,
                &eta_cond,
                t,
                t_prev,
                request.guidance_scale,
            )?;
            self.maybe_synchronize()?;
            progress(GenerationUpdate {
                image: self.sampler.preview(&latent)?,
                fraction: (i + 1) as f32 / total as f32,
                stage: format!("Step {}/{total}", i + 1),
            });
        }
        if low_memory && !snapshot.denoiser {
            self.denoiser.release();
        }

        progress(GenerationUpdate::stage(1.0, "Decoding..."));
        let image = {
            let weights = &self.weights;
            let device = &self.device;
            let decoder = self
                .decoder
                .get_or_load("image decoder", || Decoder::new(weights, device))?;
            decoder.decode(&latent)?
        };
        if low_memory && !snapshot.decoder {
            self.decoder.release();
        }
        self.maybe_synchronize()?;
        progress(GenerationUpdate {
            image: Some(image.clone()),
            fraction: 1.0,
            stage: "Cooling down...".into(),
        });
        Ok(image)
    }

    fn residency(&self) -> Residency {
        Residency {
            text_encoder: self.text_encoder.is_resident(),
            denoiser: self.denoiser.is_resident(),
            encoder: self.encoder.is_resident(),
            decoder: self.decoder.is_resident(),
        }
    }

    fn restore(&mut self, snapshot: Residency) {
        if !snapshot.text_encoder {
            self.text_encoder.release();
        }
        if !snapshot.denoiser {
            self.denoiser.release();
        }
        if !snapshot.encoder {
            self.encoder.release();
        }
        if !snapshot.decoder {
            self.decoder.release();
        }
    }

    /// Host-generated noise keeps a seed deterministic across devices.
    fn randn(&self, rng: &mut StdRng, shape: (usize, usize, usize, usize)) -> Result<Tensor> {
        let count = shape.0 * shape.1 * shape.2 * shape.3;
        let values: Vec<f32> = (0..count).map(|_| rng.sample(StandardNormal)).collect();
        Ok(Tensor::from_vec(values, shape, &self.device)?)
    }

    fn maybe_synchronize(&self) -> Result<()> {
        if self.config.synchronize {
            self.device.synchronize()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subgraphs_load_once_and_release() {
        let mut subgraph: Subgraph<u32> = Subgraph::Unloaded;
        assert!(!subgraph.is_resident());
        assert_eq!(*subgraph.get_or_load("n", || Ok(7)).unwrap(), 7);
        assert!(subgraph.is_resident());
        // Already resident: the builder must not run again.
        assert_eq!(*subgraph.get_or_load("n", || panic!("rebuilt")).unwrap(), 7);
        subgraph.release();
        assert!(!subgraph.is_resident());
    }

    #[test]
    fn failed_loads_leave_the_subgraph_unloaded() {
        let mut subgraph: Subgraph<u32> = Subgraph::Unloaded;
        let result = subgraph.get_or_load("n", || {
            Err(DiffusionError::InvalidRequest("no weights".into()))
        });
        assert!(result.is_err());
        assert!(!subgraph.is_resident());
        assert!(subgraph.get("n").is_err());
    }

    #[test]
    fn requests_validate_steps_strength_and_image_size() {
        let config = PipelineConfig::default();
        assert!(SampleRequest::text_to_image("a cat").validate(&config).is_ok());

        let zero = SampleRequest::text_to_image("a cat").with_steps(0);
        assert!(matches!(
            zero.validate(&config),
            Err(DiffusionError::InvalidRequest(_))
        ));
        let too_many = SampleRequest::text_to_image("a cat").with_steps(1001);
        assert!(too_many.validate(&config).is_err());

        let dangling_strength = SampleRequest::text_to_image("a cat").with_strength(0.5);
        assert!(dangling_strength.validate(&config).is_err());

        let i2i = SampleRequest::image_to_image("a cat", RgbaImage::new(512, 512));
        assert!(i2i.validate(&config).is_ok());
        assert!(i2i.clone().with_strength(1.5).validate(&config).is_err());

        let wrong_size = SampleRequest::image_to_image("a cat", RgbaImage::new(256, 512));
        assert!(wrong_size.validate(&config).is_err());
    }

    #[test]
    fn request_builders_fill_mode_defaults() {
        let t2i = SampleRequest::text_to_image("x");
        assert_eq!(t2i.steps, 20);
        assert_eq!(t2i.guidance_scale, 7.5);
        assert!(t2i.init_image.is_none());
        assert!(t2i.strength.is_none());

        let i2i = SampleRequest::image_to_image("x", RgbaImage::new(8, 8));
        assert_eq!(i2i.guidance_scale, 5.0);
        assert_eq!(i2i.strength, Some(DEFAULT_STRENGTH));

        let config = PipelineConfig::default();
        assert_eq!(config.memory_mode, MemoryMode::Low);
        assert!(config.synchronize);
        assert_eq!((config.width, config.height), (512, 512));
    }
}
