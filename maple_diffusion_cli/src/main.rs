use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use maple_diffusion_core::{
    best_device, MemoryMode, ModelSource, Pipeline, PipelineConfig, SampleRequest,
};
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Subcommand)]
enum SourceCommand {
    /// Load the model from an already-extracted weight directory.
    Dir {
        /// Model directory path
        #[arg(short, long)]
        path: PathBuf,
    },

    /// Load the model from a zip archive of the weight directory, extracting
    /// it on first use.
    Zip {
        /// Archive path
        #[arg(short, long)]
        file: PathBuf,

        /// Where to extract the archive. Defaults to a per-user cache
        /// directory.
        #[arg(long)]
        extract_to: Option<PathBuf>,
    },
}

#[derive(Parser)]
#[command(version, about = "Stable Diffusion image generation under a memory budget")]
struct Args {
    #[clap(subcommand)]
    source: SourceCommand,

    /// The prompt to render.
    #[arg(short, long)]
    prompt: String,

    /// What the image should steer away from.
    #[arg(long, default_value = "")]
    negative_prompt: String,

    /// RNG seed. The same seed and settings reproduce the same image.
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Number of denoising steps. A higher number of steps often means higher quality.
    #[arg(short = 'n', long, default_value_t = 20)]
    steps: usize,

    /// Guidance scale. Defaults to 7.5, or 5.0 when an init image is given.
    #[arg(short, long)]
    guidance: Option<f32>,

    /// Start from this image instead of noise. Must match the output size.
    #[arg(long)]
    init_image: Option<PathBuf>,

    /// How far to diffuse the init image, in [0, 1]. 0 reproduces the input,
    /// 1 ignores it. Defaults to 0.75.
    #[arg(long, requires = "init_image")]
    strength: Option<f32>,

    /// Output image height in pixels (multiple of 8).
    #[arg(long, default_value_t = 512)]
    height: usize,

    /// Output image width in pixels (multiple of 8).
    #[arg(long, default_value_t = 512)]
    width: usize,

    /// Keep every model part resident and batch the guidance branches.
    /// Roughly twice the memory of the default mode, for speed.
    #[arg(long)]
    performance: bool,

    /// Where to save the image.
    #[arg(short, long, default_value = "output.png")]
    output: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let source = match args.source {
        SourceCommand::Dir { path } => ModelSource::directory(path),
        SourceCommand::Zip { file, extract_to } => {
            let extract_to = match extract_to {
                Some(dir) => dir,
                None => dirs::cache_dir()
                    .context("no cache directory on this platform; pass --extract-to")?
                    .join("maple-diffusion")
                    .join("model"),
            };
            ModelSource::zip_archive(file, extract_to)
        }
    };

    let config = PipelineConfig {
        memory_mode: if args.performance {
            MemoryMode::Performance
        } else {
            MemoryMode::Low
        },
        height: args.height,
        width: args.width,
        ..PipelineConfig::default()
    };

    let bar = ProgressBar::new(100);
    bar.set_style(ProgressStyle::with_template(
        "{bar:40.cyan/blue} {percent:>3}% {msg}",
    )?);

    bar.set_message("Fetching model");
    let device = best_device()?;
    let mut pipeline = Pipeline::from_source(&source, device, config, &mut |fraction| {
        bar.set_position((fraction * 100.0) as u64)
    })?;

    let init_image = match &args.init_image {
        Some(path) => Some(
            image::open(path)
                .with_context(|| format!("failed to open init image {path:?}"))?
                .into_rgba8(),
        ),
        None => None,
    };

    let mut request = match init_image {
        Some(image) => SampleRequest::image_to_image(&args.prompt, image),
        None => SampleRequest::text_to_image(&args.prompt),
    }
    .with_negative_prompt(&args.negative_prompt)
    .with_seed(args.seed)
    .with_steps(args.steps);
    if let Some(guidance) = args.guidance {
        request = request.with_guidance_scale(guidance);
    }
    if let Some(strength) = args.strength {
        request = request.with_strength(strength);
    }

    let start = Instant::now();
    let image = pipeline.generate(&request, &mut |update| {
        bar.set_position((update.fraction * 100.0) as u64);
        bar.set_message(update.stage);
    })?;
    bar.finish_with_message("Done");
    info!(
        "image generation took {:.2}s",
        start.elapsed().as_secs_f32()
    );

    image
        .save(&args.output)
        .with_context(|| format!("failed to save image to {:?}", args.output))?;
    info!("saved image to {:?}", args.output);
    Ok(())
}
