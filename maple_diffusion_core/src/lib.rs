//! Latent diffusion inference under a tight memory budget.
//!
//! The denoiser is split into three stages that load, run and release
//! independently, so a full Stable Diffusion generation fits on devices that
//! cannot hold the whole model at once. Model weights come from a flat
//! directory of raw per-tensor dumps (see [`ModelWeights`]); the [`Pipeline`]
//! drives text-to-image and image-to-image requests over them.
//!
//! ```no_run
//! use maple_diffusion_core::{Pipeline, PipelineConfig, ModelWeights, SampleRequest};
//!
//! # fn main() -> maple_diffusion_core::Result<()> {
//! let weights = ModelWeights::new("/path/to/model")?;
//! let device = candle_core::Device::Cpu;
//! let mut pipeline = Pipeline::new(weights, device, PipelineConfig::default())?;
//! let request = SampleRequest::text_to_image("a photo of a corgi").with_seed(42);
//! let image = pipeline.generate(&request, &mut |update| {
//!     println!("{} ({:.0}%)", update.stage, update.fraction * 100.0);
//! })?;
//! image.save("corgi.png").map_err(std::io::Error::other)?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod model_source;
pub mod models;
pub mod pipelines;
pub mod tokenizer;
pub mod weights;

pub use candle_core::Device;
pub use error::{DiffusionError, FetchError, Result};
pub use model_source::ModelSource;
pub use pipelines::{
    GenerationUpdate, MemoryMode, Pipeline, PipelineConfig, SampleRequest, LATENT_FACTOR,
};
pub use tokenizer::ClipTokenizer;
pub use weights::ModelWeights;

/// The best device this build can use: CUDA or Metal when compiled in, CPU
/// otherwise.
pub fn best_device() -> Result<Device> {
    #[cfg(feature = "cuda")]
    return Ok(Device::new_cuda(0)?);
    #[cfg(all(feature = "metal", not(feature = "cuda")))]
    return Ok(Device::new_metal(0)?);
    #[cfg(not(any(feature = "cuda", feature = "metal")))]
    Ok(Device::Cpu)
}
