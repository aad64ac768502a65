//! Streaming answer generation.
//!
//! Answers are produced as an ordered stream of text segments over a
//! bounded channel. The consumer side is [`AnswerStream`]; dropping it is
//! the cancellation signal. Because the channel holds at most one segment,
//! a producer notices cancellation at its next send and stops calling the
//! upstream model.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::config::{PersonaConfig, ProviderConfig};
use crate::retrieval::{NO_CONTEXT, RetrievedContext};
use crate::types::{ConversationTurn, LoreError, Role};

/// Fixed text streamed when generation fails after the stream has started.
/// Consumers always receive a well-formed answer, never a broken stream.
pub const APOLOGY: &str = "Sorry, I couldn't process your request.";

/// Consumer half of an answer stream. Segments arrive in order; dropping
/// the stream cancels generation.
pub struct AnswerStream {
    rx: flume::Receiver<String>,
}

impl AnswerStream {
    /// Creates a connected producer/consumer pair. Capacity one: the
    /// producer blocks until the consumer takes the previous segment, which
    /// is what makes consumer drop observable mid-generation.
    pub fn channel() -> (flume::Sender<String>, AnswerStream) {
        let (tx, rx) = flume::bounded(1);
        (tx, AnswerStream { rx })
    }

    /// A stream that yields the given segments and completes. Useful for
    /// fixed answers that bypass the model.
    pub fn from_segments(segments: Vec<String>) -> AnswerStream {
        let (tx, stream) = Self::channel();
        tokio::spawn(async move {
            for segment in segments {
                if tx.send_async(segment).await.is_err() {
                    break;
                }
            }
        });
        stream
    }

    /// Next segment, or `None` once the answer is complete.
    pub async fn next_segment(&self) -> Option<String> {
        self.rx.recv_async().await.ok()
    }

    /// Drains the stream into one string.
    pub async fn collect_text(&self) -> String {
        let mut out = String::new();
        while let Some(segment) = self.next_segment().await {
            out.push_str(&segment);
        }
        out
    }
}

/// Produces answer segments from a prompt and conversation history.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Starts generating and feeds segments into `tx` in order. Returning
    /// `Ok` means the stream completed (possibly with an apology segment);
    /// `Err` is reserved for failures before any segment was produced.
    async fn stream_answer(
        &self,
        system_prompt: &str,
        history: &[ConversationTurn],
        tx: flume::Sender<String>,
    ) -> Result<(), LoreError>;

    /// Single-shot completion, for non-streamed transforms.
    async fn complete(
        &self,
        system_prompt: &str,
        input: &str,
    ) -> Result<String, LoreError>;
}

#[derive(Debug, Serialize)]
struct GenerationMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct GenerationRequest<'a> {
    model: &'a str,
    system: &'a str,
    messages: Vec<GenerationMessage<'a>>,
    temperature: f32,
    #[serde(rename = "topP")]
    top_p: f32,
    #[serde(rename = "maxTokens")]
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    delta: String,
}

#[derive(Debug, Deserialize)]
struct CompleteResponse {
    output: String,
}

/// HTTP generation provider speaking a converse-style streaming protocol:
/// one POST with the message list and inference knobs, newline-delimited
/// JSON deltas back.
pub struct HttpGenerationProvider {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
    call_timeout: std::time::Duration,
}

impl HttpGenerationProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.generation_endpoint.clone(),
            model: config.generation_model.clone(),
            api_key: config.api_key.clone(),
            temperature: config.temperature,
            top_p: config.top_p,
            max_tokens: config.max_tokens,
            call_timeout: config.generation_timeout,
        }
    }

    fn request(
        &self,
        path: &str,
        system_prompt: &str,
        messages: Vec<GenerationMessage<'_>>,
        stream: bool,
    ) -> reqwest::RequestBuilder {
        let url = format!("{}/{path}", self.endpoint.trim_end_matches('/'));
        let body = GenerationRequest {
            model: &self.model,
            system: system_prompt,
            messages,
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens: self.max_tokens,
            stream,
        };
        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }
        request
    }
}

#[async_trait]
impl GenerationProvider for HttpGenerationProvider {
    async fn stream_answer(
        &self,
        system_prompt: &str,
        history: &[ConversationTurn],
        tx: flume::Sender<String>,
    ) -> Result<(), LoreError> {
        let messages: Vec<GenerationMessage<'_>> = history
            .iter()
            .map(|turn| GenerationMessage {
                role: match turn.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                },
                content: &turn.content,
            })
            .collect();

        let response = timeout(
            self.call_timeout,
            self.request("converse-stream", system_prompt, messages, true).send(),
        )
        .await
        .map_err(|_| LoreError::Timeout {
            operation: "generation stream start",
            seconds: self.call_timeout.as_secs(),
        })??;

        if !response.status().is_success() {
            let status = response.status();
            return Err(LoreError::Upstream(format!(
                "generation endpoint returned {status}"
            )));
        }

        let mut body = response.bytes_stream();
        let mut buffer = String::new();
        loop {
            let next = match timeout(self.call_timeout, body.next()).await {
                Ok(next) => next,
                Err(_) => {
                    // Stream stalled mid-answer; close it gracefully.
                    let _ = tx.send_async(APOLOGY.to_string()).await;
                    return Ok(());
                }
            };
            let Some(bytes) = next else { break };
            let bytes = match bytes {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::warn!(error = %err, "generation stream broke mid-answer");
                    let _ = tx.send_async(APOLOGY.to_string()).await;
                    return Ok(());
                }
            };

            buffer.push_str(&String::from_utf8_lossy(&bytes));
            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim().to_string();
                buffer.drain(..=newline);
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<StreamDelta>(&line) {
                    Ok(delta) if !delta.delta.is_empty() => {
                        if tx.send_async(delta.delta).await.is_err() {
                            // Consumer dropped the stream; stop reading.
                            return Ok(());
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "unparseable stream line, skipping");
                    }
                }
            }
        }
        Ok(())
    }

    async fn complete(&self, system_prompt: &str, input: &str) -> Result<String, LoreError> {
        let messages = vec![GenerationMessage {
            role: "user",
            content: input,
        }];
        let response = timeout(
            self.call_timeout,
            self.request("converse", system_prompt, messages, false).send(),
        )
        .await
        .map_err(|_| LoreError::Timeout {
            operation: "generation call",
            seconds: self.call_timeout.as_secs(),
        })??;

        if !response.status().is_success() {
            let status = response.status();
            return Err(LoreError::Upstream(format!(
                "generation endpoint returned {status}"
            )));
        }

        let parsed: CompleteResponse = response
            .json()
            .await
            .map_err(|err| LoreError::Upstream(format!("malformed generation response: {err}")))?;
        Ok(parsed.output)
    }
}

/// One scripted step of a mock generation run.
#[derive(Clone, Debug)]
pub enum MockStep {
    /// Emit this segment.
    Segment(String),
    /// Simulate an upstream failure at this point in the stream.
    Fail,
}

/// Scripted in-process generation provider for tests.
///
/// Plays back a fixed sequence of segments, optionally failing partway
/// through. Records whether the consumer cancelled before the script
/// finished.
pub struct MockGenerationProvider {
    script: Mutex<Vec<MockStep>>,
    aborted: Arc<AtomicBool>,
    calls: AtomicUsize,
    last_system_prompt: Mutex<Option<String>>,
}

impl MockGenerationProvider {
    pub fn new(segments: Vec<&str>) -> Self {
        Self::scripted(
            segments
                .into_iter()
                .map(|s| MockStep::Segment(s.to_string()))
                .collect(),
        )
    }

    pub fn scripted(script: Vec<MockStep>) -> Self {
        Self {
            script: Mutex::new(script),
            aborted: Arc::new(AtomicBool::new(false)),
            calls: AtomicUsize::new(0),
            last_system_prompt: Mutex::new(None),
        }
    }

    /// `true` when a consumer dropped the stream before the script ended.
    pub fn was_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The system prompt passed to the most recent call.
    pub fn last_system_prompt(&self) -> Option<String> {
        self.last_system_prompt.lock().clone()
    }
}

#[async_trait]
impl GenerationProvider for MockGenerationProvider {
    async fn stream_answer(
        &self,
        system_prompt: &str,
        _history: &[ConversationTurn],
        tx: flume::Sender<String>,
    ) -> Result<(), LoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_system_prompt.lock() = Some(system_prompt.to_string());

        let script = self.script.lock().clone();
        for step in script {
            match step {
                MockStep::Segment(segment) => {
                    if tx.send_async(segment).await.is_err() {
                        self.aborted.store(true, Ordering::SeqCst);
                        return Ok(());
                    }
                }
                MockStep::Fail => {
                    let _ = tx.send_async(APOLOGY.to_string()).await;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn complete(&self, system_prompt: &str, input: &str) -> Result<String, LoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_system_prompt.lock() = Some(system_prompt.to_string());

        let script = self.script.lock().clone();
        let mut out = String::new();
        for step in script {
            match step {
                MockStep::Segment(segment) => out.push_str(&segment),
                MockStep::Fail => {
                    return Err(LoreError::Upstream("injected generation failure".into()));
                }
            }
        }
        if out.is_empty() {
            out = input.to_string();
        }
        Ok(out)
    }
}

/// Builds prompts and drives the generation provider.
pub struct AnswerGenerator {
    provider: Arc<dyn GenerationProvider>,
    persona: PersonaConfig,
}

impl AnswerGenerator {
    pub fn new(provider: Arc<dyn GenerationProvider>, persona: PersonaConfig) -> Self {
        Self { provider, persona }
    }

    /// Whether `question` asks who the assistant is. Matched
    /// case-insensitively against a small fixed set of phrasings. Such
    /// questions are answered directly and never reach retrieval or the
    /// model.
    #[must_use]
    pub fn is_identity_question(question: &str) -> bool {
        let normalized: String = question
            .to_lowercase()
            .chars()
            .filter(|c| !c.is_ascii_punctuation())
            .collect();
        let normalized = normalized.trim();
        matches!(
            normalized,
            "who are you"
                | "what are you"
                | "who r u"
                | "what is your name"
                | "whats your name"
                | "introduce yourself"
        )
    }

    /// Fixed self-identification, bypassing retrieval and the model.
    fn identity_answer(&self) -> String {
        format!(
            "I'm {}, your helpful assistant for the {} platform.",
            self.persona.assistant_name, self.persona.platform_name
        )
    }

    fn system_prompt(&self, context: &RetrievedContext) -> String {
        format!(
            "You are {assistant}, a helpful assistant for the {platform} platform. \
             Answer the user's question using the reference material below. \
             If the reference material is exactly \"{marker}\", no relevant \
             material was found; answer briefly from general knowledge and say \
             you could not find this in the {platform} knowledge base. Keep \
             answers concise and factual.\n\nReference material:\n{context}",
            assistant = self.persona.assistant_name,
            platform = self.persona.platform_name,
            marker = NO_CONTEXT,
            context = context.context_text,
        )
    }

    /// Streams an answer to the last user turn in `history`, grounded in
    /// `context`. Identity questions short-circuit to a fixed answer
    /// without calling the model.
    pub async fn answer(
        &self,
        history: &[ConversationTurn],
        context: &RetrievedContext,
    ) -> Result<AnswerStream, LoreError> {
        let question = history
            .iter()
            .rev()
            .find(|turn| turn.role == Role::User)
            .map(|turn| turn.content.as_str())
            .ok_or_else(|| {
                LoreError::Validation("conversation has no user turn to answer".into())
            })?;

        if Self::is_identity_question(question) {
            tracing::debug!("identity question answered without generation");
            return Ok(AnswerStream::from_segments(vec![self.identity_answer()]));
        }

        let system_prompt = self.system_prompt(context);
        let history = history.to_vec();
        let provider = self.provider.clone();
        let (tx, stream) = AnswerStream::channel();

        tokio::spawn(async move {
            if let Err(err) = provider.stream_answer(&system_prompt, &history, tx.clone()).await {
                tracing::error!(error = %err, "generation failed before streaming");
                let _ = tx.send_async(APOLOGY.to_string()).await;
            }
        });
        Ok(stream)
    }

    /// Rewrites rough text into a clear, self-contained question.
    pub async fn enhance(&self, text: &str) -> Result<String, LoreError> {
        if text.trim().is_empty() {
            return Err(LoreError::Validation("text to enhance must not be empty".into()));
        }
        let prompt = format!(
            "Rewrite the user's text as a single clear, grammatical, \
             self-contained question about the {} platform. Return only the \
             rewritten question.",
            self.persona.platform_name
        );
        self.provider.complete(&prompt, text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_turn(content: &str) -> Vec<ConversationTurn> {
        vec![ConversationTurn {
            role: Role::User,
            content: content.to_string(),
        }]
    }

    fn generator(provider: Arc<MockGenerationProvider>) -> AnswerGenerator {
        AnswerGenerator::new(provider, PersonaConfig::default())
    }

    #[tokio::test]
    async fn segments_arrive_in_order() {
        let provider = Arc::new(MockGenerationProvider::new(vec!["Refunds ", "take ", "5 days."]));
        let generator = generator(provider);

        let stream = generator
            .answer(&user_turn("refund timing?"), &RetrievedContext::no_context())
            .await
            .unwrap();
        assert_eq!(stream.collect_text().await, "Refunds take 5 days.");
    }

    #[tokio::test]
    async fn dropping_the_stream_cancels_generation() {
        let provider = Arc::new(MockGenerationProvider::new(vec!["one", "two", "three"]));
        let generator = generator(provider.clone());

        let stream = generator
            .answer(&user_turn("question"), &RetrievedContext::no_context())
            .await
            .unwrap();
        assert_eq!(stream.next_segment().await.unwrap(), "one");
        drop(stream);

        // The producer observes the drop at its next blocked send.
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while !provider.was_aborted() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn mid_stream_failure_ends_with_apology() {
        let provider = Arc::new(MockGenerationProvider::scripted(vec![
            MockStep::Segment("The answer is".to_string()),
            MockStep::Fail,
        ]));
        let generator = generator(provider);

        let stream = generator
            .answer(&user_turn("question"), &RetrievedContext::no_context())
            .await
            .unwrap();
        let text = stream.collect_text().await;
        assert!(text.starts_with("The answer is"));
        assert!(text.ends_with(APOLOGY));
    }

    #[tokio::test]
    async fn identity_question_bypasses_the_model() {
        let provider = Arc::new(MockGenerationProvider::new(vec!["should not appear"]));
        let generator = generator(provider.clone());

        let stream = generator
            .answer(&user_turn("Who are you?"), &RetrievedContext::no_context())
            .await
            .unwrap();
        assert_eq!(
            stream.collect_text().await,
            "I'm Lorebot, your helpful assistant for the Loresmith platform."
        );
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn non_identity_question_reaches_the_model() {
        let provider = Arc::new(MockGenerationProvider::new(vec!["answer"]));
        let generator = generator(provider.clone());

        let stream = generator
            .answer(
                &user_turn("Who are you voting for?"),
                &RetrievedContext::no_context(),
            )
            .await
            .unwrap();
        stream.collect_text().await;
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn no_context_marker_is_passed_through_to_the_prompt() {
        let provider = Arc::new(MockGenerationProvider::new(vec!["answer"]));
        let generator = generator(provider.clone());

        let stream = generator
            .answer(&user_turn("anything?"), &RetrievedContext::no_context())
            .await
            .unwrap();
        stream.collect_text().await;

        let prompt = provider.last_system_prompt().unwrap();
        assert!(prompt.contains(NO_CONTEXT));
        assert!(prompt.contains("Lorebot"));
    }

    #[tokio::test]
    async fn enhance_rejects_empty_text() {
        let provider = Arc::new(MockGenerationProvider::new(vec![]));
        let generator = generator(provider);
        assert!(generator.enhance("  ").await.is_err());
    }

    #[tokio::test]
    async fn enhance_makes_one_provider_call() {
        let provider = Arc::new(MockGenerationProvider::new(vec!["What is the refund window?"]));
        let generator = generator(provider.clone());

        let enhanced = generator.enhance("refund how long??").await.unwrap();
        assert_eq!(enhanced, "What is the refund window?");
        assert_eq!(provider.call_count(), 1);
    }
}
