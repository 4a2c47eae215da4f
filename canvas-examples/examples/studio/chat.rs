//! Canvas authoring with the chat model.

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use canvas_diffusion::models::canvas::{Canvas, CodeBlockGrammar, ParseOutcome};
use canvas_diffusion::models::chat::{
    ChatStream, ChatTemplate, Conversation, SamplingGenerator, SamplingParams, SharedGenerator,
    StreamEvent,
};
use canvas_diffusion::models::pipeline::resolve_seed;
use canvas_diffusion::models::residency::ComponentKind;
use canvas_diffusion::models::sdxl::llm_component;

use crate::Studio;

const DEFAULT_TOKENIZER_REPO: &str = "lllyasviel/omost-llama-3-8b";

#[derive(clap::Args)]
pub struct ChatArgs {
    /// What the image should show.
    #[arg(long)]
    prompt: String,

    /// Sampling temperature, 0 for greedy decoding.
    #[arg(long)]
    temperature: Option<f64>,

    /// Nucleus sampling probability cutoff.
    #[arg(long)]
    top_p: Option<f64>,

    #[arg(long)]
    max_new_tokens: Option<usize>,

    /// Sampling seed, -1 for a random one.
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    chat_seed: i64,

    /// Also write the reply to this file.
    #[arg(long)]
    reply: Option<String>,
}

/// Streams a reply to stdout and looks for a canvas in it.
pub fn run(args: &ChatArgs, studio: &mut Studio) -> Result<ParseOutcome> {
    let Some(weights) = studio.llm.clone() else {
        anyhow::bail!("chat needs --llm <gguf weights>");
    };
    let tokenizer = canvas_examples::hub_or_local(
        studio.llm_tokenizer.as_deref(),
        DEFAULT_TOKENIZER_REPO,
        "tokenizer.json",
    )?;
    let tokenizer = tokenizers::Tokenizer::from_file(tokenizer).map_err(anyhow::Error::msg)?;

    studio.registry.register_llm(llm_component(PathBuf::from(weights)));
    studio.registry.ensure_resident(&[ComponentKind::Llm])?;
    let lm = studio.registry.llm()?;

    let defaults = &studio.config.chat;
    let params = SamplingParams {
        temperature: args.temperature.unwrap_or(defaults.temperature),
        top_p: args.top_p.unwrap_or(defaults.top_p),
        max_new_tokens: args.max_new_tokens.unwrap_or(defaults.max_new_tokens),
        seed: resolve_seed(args.chat_seed)?,
    };
    tracing::info!("chat seed {}", params.seed);

    let template = ChatTemplate::Llama3;
    let generator: SharedGenerator = Arc::new(Mutex::new(Box::new(SamplingGenerator::new(
        lm, tokenizer, template, params,
    ))));
    let prompt = Conversation::default().prompt(template, &args.prompt);

    let mut reply = String::new();
    for event in ChatStream::start(generator, prompt, defaults.poll_interval()?) {
        match event? {
            StreamEvent::Fragment(text) => {
                print!("{text}");
                std::io::stdout().flush()?;
                reply.push_str(&text);
            }
            StreamEvent::Waiting => tracing::info!("still generating"),
        }
    }
    println!();

    if let Some(path) = &args.reply {
        std::fs::write(path, &reply).map_err(|e| anyhow!("cannot write {path}: {e}"))?;
    }

    let outcome = Canvas::from_response(&reply, &CodeBlockGrammar);
    match &outcome {
        ParseOutcome::Valid(canvas) => println!("canvas with {} regions", canvas.regions().len()),
        ParseOutcome::Malformed(reason) => println!("not a valid canvas: {reason}"),
        ParseOutcome::NoCanvas => println!("the reply holds no canvas"),
    }
    Ok(outcome)
}
