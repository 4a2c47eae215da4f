//! Conversational canvas authoring.
//!
//! A [`TextGenerator`] runs on a worker thread and pushes text fragments
//! through a channel. The caller drains them with [`ChatStream`], which waits
//! at most one poll interval per event and yields [`StreamEvent::Waiting`]
//! when nothing arrived in time. Generation stops at the next step boundary
//! once the stream's [`CancellationToken`] is set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use candle::{DType, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};

use super::canvas::vocab::{AREAS, LOCATIONS, OFFSETS};
use super::residency::SharedLm;
use crate::{Error, Result};

/// An autoregressive language model with an internal KV cache.
pub trait CausalLm {
    /// Logits for the token following `tokens`, which start at position
    /// `index_pos` of the running sequence. Returns a 1-D tensor.
    fn forward(&mut self, tokens: &[u32], index_pos: usize) -> Result<Tensor>;
}

/// Shared cancel flag, checked by generators between steps.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Opaque producer of text fragments.
pub trait TextGenerator: Send {
    /// Generates a reply to `prompt`, calling `emit` for each fragment.
    /// Must return promptly once `cancel` is set.
    fn generate(&mut self, prompt: &str, cancel: &CancellationToken, emit: &mut dyn FnMut(String)) -> Result<()>;
}

pub type SharedGenerator = Arc<Mutex<Box<dyn TextGenerator>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Fragment(String),
    /// The poll interval elapsed without new text.
    Waiting,
}

enum Message {
    Fragment(String),
    Finished(Result<()>),
}

/// Streaming handle over one generation request.
///
/// Iterating yields events until the generator finishes or observes
/// cancellation; a generator error is yielded once as the last item.
pub struct ChatStream {
    generator: SharedGenerator,
    prompt: String,
    poll_interval: Duration,
    cancel: CancellationToken,
    receiver: Receiver<Message>,
    worker: Option<JoinHandle<()>>,
    finished: bool,
}

impl ChatStream {
    pub fn start(generator: SharedGenerator, prompt: impl Into<String>, poll_interval: Duration) -> Self {
        let prompt = prompt.into();
        let cancel = CancellationToken::new();
        let (sender, receiver) = mpsc::channel();
        let worker = spawn_worker(generator.clone(), prompt.clone(), cancel.clone(), sender);
        Self {
            generator,
            prompt,
            poll_interval,
            cancel,
            receiver,
            worker: Some(worker),
            finished: false,
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel()
    }

    /// Cancels the running generation and starts the same request again.
    pub fn restart(&mut self) -> Result<()> {
        self.stop()?;
        tracing::info!("restarting generation");
        self.cancel = CancellationToken::new();
        let (sender, receiver) = mpsc::channel();
        self.receiver = receiver;
        self.worker = Some(spawn_worker(
            self.generator.clone(),
            self.prompt.clone(),
            self.cancel.clone(),
            sender,
        ));
        self.finished = false;
        Ok(())
    }

    /// Drains the stream and returns the full reply.
    pub fn collect_text(self) -> Result<String> {
        let mut text = String::new();
        for event in self {
            if let StreamEvent::Fragment(fragment) = event? {
                text.push_str(&fragment);
            }
        }
        Ok(text)
    }

    fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();
        self.finished = true;
        match self.worker.take() {
            Some(worker) => worker
                .join()
                .map_err(|_| Error::Worker("generation thread panicked".to_string())),
            None => Ok(()),
        }
    }
}

impl Iterator for ChatStream {
    type Item = Result<StreamEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.receiver.recv_timeout(self.poll_interval) {
            Ok(Message::Fragment(text)) => Some(Ok(StreamEvent::Fragment(text))),
            Err(RecvTimeoutError::Timeout) => Some(Ok(StreamEvent::Waiting)),
            Ok(Message::Finished(result)) => {
                let joined = self.stop();
                result.and(joined).err().map(Err)
            }
            Err(RecvTimeoutError::Disconnected) => self.stop().err().map(Err),
        }
    }
}

impl Drop for ChatStream {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!("{e}");
        }
    }
}

fn spawn_worker(
    generator: SharedGenerator,
    prompt: String,
    cancel: CancellationToken,
    sender: Sender<Message>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let result = match generator.lock() {
            Ok(mut generator) => {
                let mut emit = |text: String| {
                    // The receiver is gone once the stream is dropped.
                    let _ = sender.send(Message::Fragment(text));
                };
                generator.generate(&prompt, &cancel, &mut emit)
            }
            Err(_) => Err(Error::Worker("generator lock poisoned".to_string())),
        };
        if cancel.is_cancelled() {
            tracing::debug!("generation cancelled");
        }
        let _ = sender.send(Message::Finished(result));
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// Prompt format of the chat model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChatTemplate {
    #[default]
    Llama3,
}

impl ChatTemplate {
    /// Renders the turns and opens an assistant turn.
    pub fn render(&self, turns: &[(Role, &str)]) -> String {
        match self {
            Self::Llama3 => {
                let mut prompt = String::from("<|begin_of_text|>");
                for (role, text) in turns {
                    prompt.push_str("<|start_header_id|>");
                    prompt.push_str(role.as_str());
                    prompt.push_str("<|end_header_id|>\n\n");
                    prompt.push_str(text.trim());
                    prompt.push_str("<|eot_id|>");
                }
                prompt.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
                prompt
            }
        }
    }

    /// Tokens that end an assistant turn.
    pub fn stop_tokens(&self) -> &'static [&'static str] {
        match self {
            Self::Llama3 => &["<|eot_id|>", "<|end_of_text|>"],
        }
    }
}

/// Instructions teaching the model the canvas format.
pub fn system_prompt() -> String {
    let list = |table: &[(&str, (i32, i32))]| {
        table
            .iter()
            .map(|(name, _)| format!("'{name}'"))
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!(
        "You are a helpful AI assistant that composes images by writing Python code.\n\
         Reply with one ```python code block that builds a canvas:\n\n\
         canvas = Canvas()\n\
         canvas.set_global_description(description='...', detailed_descriptions=['...'], tags='...', HTML_web_color_name='...')\n\
         canvas.add_local_description(location='...', offset='...', area='...', distance_to_viewer=1.0, \
         description='...', detailed_descriptions=['...'], tags='...', atmosphere='...', style='...', \
         quality_meta='...', HTML_web_color_name='...')\n\n\
         Add one local description per object, from the farthest to the nearest.\n\
         `distance_to_viewer` is a positive number; larger means farther away.\n\
         Valid locations: {}.\n\
         Valid offsets: {}.\n\
         Valid areas: {}.\n\
         Colors are HTML web color names in lowercase.",
        list(LOCATIONS),
        list(OFFSETS),
        list(AREAS),
    )
}

/// Chat history. Only complete exchanges are replayed to the model.
#[derive(Debug, Clone)]
pub struct Conversation {
    system: String,
    history: Vec<(String, String)>,
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new(system_prompt())
    }
}

impl Conversation {
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            history: Vec::new(),
        }
    }

    pub fn push(&mut self, user: impl Into<String>, assistant: impl Into<String>) {
        self.history.push((user.into(), assistant.into()))
    }

    pub fn history(&self) -> &[(String, String)] {
        &self.history
    }

    pub fn clear(&mut self) {
        self.history.clear()
    }

    /// Prompt for the next reply to `message`.
    pub fn prompt(&self, template: ChatTemplate, message: &str) -> String {
        let mut turns = vec![(Role::System, self.system.as_str())];
        for (user, assistant) in &self.history {
            if user.trim().is_empty() || assistant.trim().is_empty() {
                continue;
            }
            turns.push((Role::User, user.as_str()));
            turns.push((Role::Assistant, assistant.as_str()));
        }
        turns.push((Role::User, message));
        template.render(&turns)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    /// `0` samples greedily.
    pub temperature: f64,
    pub top_p: f64,
    pub max_new_tokens: usize,
    pub seed: u64,
}

impl SamplingParams {
    fn sampling(&self) -> Sampling {
        if self.temperature <= 0.0 {
            Sampling::ArgMax
        } else {
            Sampling::TopP {
                p: self.top_p,
                temperature: self.temperature,
            }
        }
    }
}

/// Turns token ids into text as they arrive.
///
/// Text is only released once it ends in an alphanumeric character, so
/// multi-token characters and leading spaces come out whole.
struct TokenDecoder<'a> {
    tokenizer: &'a tokenizers::Tokenizer,
    tokens: Vec<u32>,
    prev_index: usize,
    current_index: usize,
}

impl<'a> TokenDecoder<'a> {
    fn new(tokenizer: &'a tokenizers::Tokenizer) -> Self {
        Self {
            tokenizer,
            tokens: Vec::new(),
            prev_index: 0,
            current_index: 0,
        }
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(tokens, true)
            .map_err(|e| Error::Tokenizer(e.to_string()))
    }

    fn next_token(&mut self, token: u32) -> Result<Option<String>> {
        let prev_text = self.decode(&self.tokens[self.prev_index..self.current_index])?;
        self.tokens.push(token);
        let text = self.decode(&self.tokens[self.prev_index..])?;
        if text.len() > prev_text.len() && text.chars().last().is_some_and(char::is_alphanumeric) {
            let fresh = text.get(prev_text.len()..).unwrap_or_default().to_string();
            self.prev_index = self.current_index;
            self.current_index = self.tokens.len();
            Ok(Some(fresh))
        } else {
            Ok(None)
        }
    }

    fn flush(&self) -> Result<Option<String>> {
        let prev_text = self.decode(&self.tokens[self.prev_index..self.current_index])?;
        let text = self.decode(&self.tokens[self.prev_index..])?;
        Ok((text.len() > prev_text.len()).then(|| text.get(prev_text.len()..).unwrap_or_default().to_string()))
    }
}

/// Samples a [`CausalLm`] token by token.
pub struct SamplingGenerator {
    lm: SharedLm,
    tokenizer: tokenizers::Tokenizer,
    stop_tokens: Vec<u32>,
    params: SamplingParams,
}

impl SamplingGenerator {
    pub fn new(
        lm: SharedLm,
        tokenizer: tokenizers::Tokenizer,
        template: ChatTemplate,
        params: SamplingParams,
    ) -> Self {
        let stop_tokens = template
            .stop_tokens()
            .iter()
            .filter_map(|t| tokenizer.token_to_id(t))
            .collect();
        Self {
            lm,
            tokenizer,
            stop_tokens,
            params,
        }
    }

    pub fn params_mut(&mut self) -> &mut SamplingParams {
        &mut self.params
    }
}

impl TextGenerator for SamplingGenerator {
    fn generate(&mut self, prompt: &str, cancel: &CancellationToken, emit: &mut dyn FnMut(String)) -> Result<()> {
        let mut lm = self
            .lm
            .lock()
            .map_err(|_| Error::Worker("language model lock poisoned".to_string()))?;
        let mut tokens = self
            .tokenizer
            .encode(prompt, false)
            .map_err(|e| Error::Tokenizer(e.to_string()))?
            .get_ids()
            .to_vec();
        if tokens.is_empty() {
            return Err(Error::invalid("prompt", "encodes to no tokens"));
        }
        let mut processor = LogitsProcessor::from_sampling(self.params.seed, self.params.sampling());
        let mut decoder = TokenDecoder::new(&self.tokenizer);
        tracing::info!(prompt_tokens = tokens.len(), seed = self.params.seed, "generating reply");

        let mut index_pos = 0;
        for step in 0..self.params.max_new_tokens {
            if cancel.is_cancelled() {
                break;
            }
            let context = if step == 0 { &tokens[..] } else { &tokens[tokens.len() - 1..] };
            let logits = lm.forward(context, index_pos)?.to_dtype(DType::F32)?;
            index_pos += context.len();
            let next = processor.sample(&logits)?;
            if self.stop_tokens.contains(&next) {
                tracing::debug!(step, "stop token");
                break;
            }
            tokens.push(next);
            if let Some(text) = decoder.next_token(next)? {
                emit(text);
            }
        }
        if let Some(rest) = decoder.flush()? {
            emit(rest);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use candle::Device;

    struct Scripted {
        fragments: Vec<&'static str>,
        delay: Duration,
        runs: Arc<AtomicUsize>,
    }

    impl TextGenerator for Scripted {
        fn generate(&mut self, _prompt: &str, cancel: &CancellationToken, emit: &mut dyn FnMut(String)) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            for fragment in &self.fragments {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                std::thread::sleep(self.delay);
                emit(fragment.to_string());
            }
            Ok(())
        }
    }

    struct Endless;

    impl TextGenerator for Endless {
        fn generate(&mut self, _prompt: &str, cancel: &CancellationToken, emit: &mut dyn FnMut(String)) -> Result<()> {
            while !cancel.is_cancelled() {
                emit("x".to_string());
                std::thread::sleep(Duration::from_millis(2));
            }
            Ok(())
        }
    }

    struct Failing;

    impl TextGenerator for Failing {
        fn generate(&mut self, _: &str, _: &CancellationToken, emit: &mut dyn FnMut(String)) -> Result<()> {
            emit("partial".to_string());
            Err(Error::Tokenizer("bad input".to_string()))
        }
    }

    fn shared(generator: impl TextGenerator + 'static) -> SharedGenerator {
        Arc::new(Mutex::new(Box::new(generator)))
    }

    #[test]
    fn stream_yields_all_fragments_then_ends() -> Result<()> {
        let generator = shared(Scripted {
            fragments: vec!["a canvas", " with", " a cat"],
            delay: Duration::ZERO,
            runs: Arc::default(),
        });
        let text = ChatStream::start(generator, "draw a cat", Duration::from_secs(10)).collect_text()?;
        assert_eq!(text, "a canvas with a cat");
        Ok(())
    }

    #[test]
    fn slow_generation_reports_waiting() -> Result<()> {
        let generator = shared(Scripted {
            fragments: vec!["slow"],
            delay: Duration::from_millis(200),
            runs: Arc::default(),
        });
        let events: Vec<StreamEvent> =
            ChatStream::start(generator, "", Duration::from_millis(10)).collect::<Result<_>>()?;
        assert!(events.contains(&StreamEvent::Waiting));
        assert_eq!(events.last(), Some(&StreamEvent::Fragment("slow".to_string())));
        Ok(())
    }

    #[test]
    fn cancellation_ends_the_stream() -> Result<()> {
        let mut stream = ChatStream::start(shared(Endless), "", Duration::from_secs(10));
        let mut fragments = 0;
        while fragments < 3 {
            if let Some(StreamEvent::Fragment(_)) = stream.next().transpose()? {
                fragments += 1;
            }
        }
        stream.cancel();
        // Whatever was already queued drains, then the stream is exhausted.
        assert!(stream.by_ref().count() < 10_000);
        assert!(stream.next().is_none());
        Ok(())
    }

    #[test]
    fn restart_reruns_the_request() -> Result<()> {
        let runs = Arc::new(AtomicUsize::new(0));
        let generator = shared(Scripted {
            fragments: vec!["one", "two"],
            delay: Duration::from_millis(1),
            runs: runs.clone(),
        });
        let mut stream = ChatStream::start(generator, "again", Duration::from_secs(10));
        stream.restart()?;
        let text = stream.collect_text()?;
        assert_eq!(text, "onetwo");
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn generator_errors_surface_last() {
        let mut stream = ChatStream::start(shared(Failing), "", Duration::from_secs(10));
        assert_eq!(
            stream.next().map(|e| e.ok()),
            Some(Some(StreamEvent::Fragment("partial".to_string())))
        );
        assert!(matches!(stream.next(), Some(Err(Error::Tokenizer(_)))));
        assert!(stream.next().is_none());
    }

    #[test]
    fn incomplete_exchanges_are_not_replayed() {
        let mut conversation = Conversation::new("sys");
        conversation.push("a forest", "```python\ncanvas = Canvas()\n```");
        conversation.push("interrupted", "");
        conversation.push("", "orphan");
        let prompt = conversation.prompt(ChatTemplate::Llama3, "add a deer");
        assert!(prompt.starts_with("<|begin_of_text|><|start_header_id|>system<|end_header_id|>\n\nsys<|eot_id|>"));
        assert!(prompt.contains("a forest"));
        assert!(!prompt.contains("interrupted"));
        assert!(!prompt.contains("orphan"));
        assert_eq!(prompt.matches("<|start_header_id|>user").count(), 2);
        assert!(prompt.ends_with("add a deer<|eot_id|><|start_header_id|>assistant<|end_header_id|>\n\n"));
    }

    #[test]
    fn system_prompt_lists_the_vocabulary() {
        let prompt = system_prompt();
        assert!(prompt.contains("'in the center'"));
        assert!(prompt.contains("'no offset'"));
        assert!(prompt.contains("add_local_description"));
    }

    /// Emits a fixed token sequence regardless of input.
    struct Replay {
        script: Vec<u32>,
        vocab: usize,
        calls: Vec<(usize, usize)>,
    }

    impl CausalLm for Replay {
        fn forward(&mut self, tokens: &[u32], index_pos: usize) -> Result<Tensor> {
            let step = self.calls.len();
            self.calls.push((tokens.len(), index_pos));
            let mut logits = vec![0f32; self.vocab];
            logits[self.script[step.min(self.script.len() - 1)] as usize] = 10.0;
            Ok(Tensor::new(logits, &Device::Cpu)?)
        }
    }

    fn word_tokenizer(words: &[&str]) -> Result<tokenizers::Tokenizer> {
        let vocab: serde_json::Map<String, serde_json::Value> = words
            .iter()
            .enumerate()
            .map(|(i, w)| (w.to_string(), serde_json::json!(i)))
            .collect();
        let config = serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": { "type": "Whitespace" },
            "post_processor": null,
            "decoder": null,
            "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "<unk>" }
        });
        tokenizers::Tokenizer::from_bytes(config.to_string()).map_err(|e| Error::Tokenizer(e.to_string()))
    }

    #[test]
    fn greedy_sampling_stops_at_eot() -> Result<()> {
        let words = ["<unk>", "<|eot_id|>", "red", "barn", "field", "draw"];
        let tokenizer = word_tokenizer(&words)?;
        let lm: Box<dyn CausalLm + Send> = Box::new(Replay {
            script: vec![2, 3, 4, 1, 2],
            vocab: words.len(),
            calls: Vec::new(),
        });
        let lm: SharedLm = Arc::new(Mutex::new(lm));
        let params = SamplingParams {
            temperature: 0.0,
            top_p: 0.9,
            max_new_tokens: 16,
            seed: 7,
        };
        let mut generator = SamplingGenerator::new(lm, tokenizer, ChatTemplate::Llama3, params);
        let mut text = String::new();
        generator.generate("draw draw", &CancellationToken::new(), &mut |t| text.push_str(&t))?;
        assert_eq!(text, "red barn field");
        Ok(())
    }

    #[test]
    fn generation_respects_the_token_limit_and_cancellation() -> Result<()> {
        let words = ["<unk>", "red"];
        let lm: Box<dyn CausalLm + Send> = Box::new(Replay {
            script: vec![1],
            vocab: words.len(),
            calls: Vec::new(),
        });
        let lm: SharedLm = Arc::new(Mutex::new(lm));
        let params = SamplingParams {
            temperature: 0.0,
            top_p: 0.9,
            max_new_tokens: 3,
            seed: 7,
        };
        let mut generator = SamplingGenerator::new(lm, word_tokenizer(&words)?, ChatTemplate::Llama3, params);
        let mut text = String::new();
        generator.generate("red", &CancellationToken::new(), &mut |t| text.push_str(&t))?;
        assert_eq!(text, "red red red");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut text = String::new();
        generator.generate("red", &cancel, &mut |t| text.push_str(&t))?;
        assert!(text.is_empty());
        Ok(())
    }
}
