//! Studio: compose images region by region.
//!
//! A chat model writes a canvas (a global description plus positioned local
//! descriptions), which is compiled into regional conditioning and rendered
//! with SDXL.
//!
//! # Usage
//!
//! ```bash
//! # Ask the model for a canvas
//! cargo run --release --example studio -- --llm omost-llama-3-8b.Q4_K_M.gguf \
//!     chat --prompt "a red barn in a green field at sunset"
//!
//! # Render a saved reply
//! cargo run --release --example studio -- --checkpoint models/checkpoints/sdxl \
//!     render --canvas reply.md --width 1152 --height 896 --preview layout.png
//!
//! # Chat, then render the resulting canvas
//! cargo run --release --example studio -- --llm model.gguf --checkpoint models/checkpoints/sdxl \
//!     session --prompt "a cat reading on a windowsill" --highres-scale 1.5
//! ```

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

mod chat;
mod render;

use anyhow::Result;
use candle::{DType, Device};
use canvas_diffusion::config::StudioConfig;
use canvas_diffusion::models::residency::ModelRegistry;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "studio",
    about = "Chat a region canvas with an LLM, then render it with regional SDXL",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Run on CPU instead of GPU.
    #[arg(long, global = true)]
    cpu: bool,

    /// Use F32 dtype instead of F16.
    #[arg(long, global = true)]
    use_f32: bool,

    /// Enable Chrome tracing profiler.
    #[arg(long, global = true)]
    tracing: bool,

    /// Log every denoising step and model move.
    #[arg(long, global = true)]
    verbose: bool,

    /// Studio configuration (JSON). Flags override its values.
    #[arg(long, global = true)]
    config: Option<String>,

    /// Diffusers-layout SDXL checkpoint directory, or its name under the checkpoint folder.
    #[arg(long, global = true)]
    checkpoint: Option<String>,

    /// GGUF weights of the chat model.
    #[arg(long, global = true)]
    llm: Option<String>,

    /// tokenizer.json of the chat model, downloaded from the hub when absent.
    #[arg(long, global = true)]
    llm_tokenizer: Option<String>,

    #[arg(long, global = true)]
    use_flash_attn: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Ask the chat model for a canvas.
    Chat {
        #[command(flatten)]
        chat: chat::ChatArgs,
    },

    /// Render a canvas from a saved chat reply.
    Render {
        /// File holding the reply with the canvas code block.
        #[arg(long)]
        canvas: String,

        #[command(flatten)]
        render: render::RenderArgs,
    },

    /// Chat, then render the canvas of the reply.
    Session {
        #[command(flatten)]
        chat: chat::ChatArgs,

        #[command(flatten)]
        render: render::RenderArgs,
    },
}

/// State shared by the subcommands of one invocation.
pub struct Studio {
    pub config: StudioConfig,
    pub registry: ModelRegistry,
    pub dtype: DType,
    pub checkpoint: Option<String>,
    pub llm: Option<String>,
    pub llm_tokenizer: Option<String>,
    pub use_flash_attn: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = canvas_examples::setup_tracing(cli.tracing, cli.verbose);

    let config = match &cli.config {
        Some(path) => StudioConfig::from_file(path)?,
        None => StudioConfig::default(),
    };
    let device = canvas_examples::device(cli.cpu)?;
    let dtype = if cli.use_f32 || matches!(device, Device::Cpu) {
        DType::F32
    } else {
        DType::F16
    };
    tracing::info!("device {device:?}, dtype {dtype:?}, eviction {:?}", config.eviction);

    let mut studio = Studio {
        registry: ModelRegistry::new(device, config.eviction),
        config,
        dtype,
        checkpoint: cli.checkpoint,
        llm: cli.llm,
        llm_tokenizer: cli.llm_tokenizer,
        use_flash_attn: cli.use_flash_attn,
    };

    match cli.command {
        Command::Chat { chat } => {
            chat::run(&chat, &mut studio)?;
        }
        Command::Render { canvas, render } => {
            let reply = std::fs::read_to_string(&canvas)?;
            let canvas = canvas_diffusion::models::canvas::parse(&reply)?;
            render::run(&render, canvas, &mut studio)?;
        }
        Command::Session { chat, render } => {
            let outcome = chat::run(&chat, &mut studio)?;
            match outcome.into_result() {
                Ok(canvas) => render::run(&render, canvas, &mut studio)?,
                Err(e) => anyhow::bail!("nothing to render: {e}"),
            }
        }
    }
    Ok(())
}
