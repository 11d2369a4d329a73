//! Turn driver.
//!
//! [`ChatController`] owns a [`Session`] and runs the collaborator pipeline
//! for each requested turn: prompt lookup, similarity search, context
//! assembly, then the streaming generation call. Every state change goes
//! through [`Session::apply`]; the controller only translates collaborator
//! outcomes into events and effects into [`SessionObserver`] calls.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collaborators::{ApiClient, CompletionBackend, DocumentSearch, PromptSource};
use crate::config::{ChatConfig, RetrievalConfig};
use crate::context::ContextAssembler;
use crate::error::{SessionError, TurnError};
use crate::prompt::{build_request, default_prompt};
use crate::session::{Effect, Phase, Session, SessionEvent};
use crate::stream::StreamConsumer;
use crate::tokenizer::{TokenCounter, TokenEstimator};
use crate::types::ChatMessage;

/// Receives session changes and the effects they request.
///
/// This is the presentation seam: a terminal front end prints increments,
/// a test records everything.
#[async_trait]
pub trait SessionObserver: Send + Sync {
    /// Called after every transition that was applied.
    async fn on_session_changed(&self, session: &Session);

    /// Called with each text increment as it is appended to the draft.
    async fn on_increment(&self, text: &str);

    async fn scroll_to_bottom(&self) {}

    async fn focus_input(&self) {}

    async fn reset_input(&self) {}
}

/// An observer that ignores everything.
pub struct NoOpObserver;

#[async_trait]
impl SessionObserver for NoOpObserver {
    async fn on_session_changed(&self, _session: &Session) {}
    async fn on_increment(&self, _text: &str) {}
}

/// An observer that records everything for testing.
pub struct RecordingObserver {
    phases: tokio::sync::Mutex<Vec<Phase>>,
    increments: tokio::sync::Mutex<Vec<String>>,
    effects: tokio::sync::Mutex<Vec<Effect>>,
    errors: tokio::sync::Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self {
            phases: tokio::sync::Mutex::new(Vec::new()),
            increments: tokio::sync::Mutex::new(Vec::new()),
            effects: tokio::sync::Mutex::new(Vec::new()),
            errors: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Distinct phases in the order they were entered.
    pub async fn phases(&self) -> Vec<Phase> {
        self.phases.lock().await.clone()
    }

    pub async fn increments(&self) -> Vec<String> {
        self.increments.lock().await.clone()
    }

    pub async fn effects(&self) -> Vec<Effect> {
        self.effects.lock().await.clone()
    }

    pub async fn errors(&self) -> Vec<String> {
        self.errors.lock().await.clone()
    }
}

impl Default for RecordingObserver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionObserver for RecordingObserver {
    async fn on_session_changed(&self, session: &Session) {
        let mut phases = self.phases.lock().await;
        if phases.last() != Some(&session.phase()) {
            phases.push(session.phase());
            if let Some(error) = session.error() {
                self.errors.lock().await.push(error.message.clone());
            }
        }
    }

    async fn on_increment(&self, text: &str) {
        self.increments.lock().await.push(text.to_string());
    }

    async fn scroll_to_bottom(&self) {
        self.effects.lock().await.push(Effect::ScrollToBottom);
    }

    async fn focus_input(&self) {
        self.effects.lock().await.push(Effect::FocusInput);
    }

    async fn reset_input(&self) {
        self.effects.lock().await.push(Effect::ResetInput);
    }
}

/// Cancels the controller's in-flight request from another task.
///
/// Cloned out of the controller before a turn starts, so a signal handler can
/// stop a turn while the controller itself is busy driving it.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    active: Arc<Mutex<Option<CancellationToken>>>,
}

impl StopHandle {
    /// Cancel the active request. Returns false when nothing was running.
    pub fn stop(&self) -> bool {
        match self.slot().as_ref() {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.slot()
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    fn set(&self, token: Option<CancellationToken>) {
        *self.slot() = token;
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The three collaborators a turn talks to.
pub struct Collaborators {
    pub prompts: Arc<dyn PromptSource>,
    pub search: Arc<dyn DocumentSearch>,
    pub backend: Arc<dyn CompletionBackend>,
}

impl Collaborators {
    /// Use one HTTP client for all three endpoints.
    pub fn from_client(client: Arc<ApiClient>) -> Self {
        Self {
            prompts: client.clone(),
            search: client.clone(),
            backend: client,
        }
    }
}

/// Drives a [`Session`] against its collaborators.
pub struct ChatController {
    session: Session,
    prompts: Arc<dyn PromptSource>,
    backend: Arc<dyn CompletionBackend>,
    assembler: ContextAssembler,
    observer: Arc<dyn SessionObserver>,
    retrieval: RetrievalConfig,
    prompt_name: Option<String>,
    stop: StopHandle,
}

impl ChatController {
    pub fn new(
        session: Session,
        collaborators: Collaborators,
        estimator: Arc<dyn TokenEstimator>,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        Self {
            session,
            prompts: collaborators.prompts,
            backend: collaborators.backend,
            assembler: ContextAssembler::new(collaborators.search, estimator),
            observer,
            retrieval: RetrievalConfig::default(),
            prompt_name: None,
            stop: StopHandle::default(),
        }
    }

    /// Validate `config` and wire a controller to its HTTP endpoints with the
    /// GPT-3 token counter.
    pub fn from_config(
        config: &ChatConfig,
        session: Session,
        observer: Arc<dyn SessionObserver>,
    ) -> crate::error::Result<Self> {
        config.ensure_valid()?;
        let estimator = Arc::new(TokenCounter::gpt3()?);
        let client = Arc::new(ApiClient::new(config.endpoint.clone()));
        Ok(Self::new(session, Collaborators::from_client(client), estimator, observer)
            .with_config(config))
    }

    /// Take retrieval parameters and the prompt name from `config`.
    pub fn with_config(mut self, config: &ChatConfig) -> Self {
        self.retrieval = config.retrieval.clone();
        self.prompt_name = config.prompt.name.clone();
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Send a question and drive the resulting turn to completion.
    pub async fn submit(&mut self, text: impl Into<String>) -> Result<(), SessionError> {
        self.dispatch(SessionEvent::Submit(text.into())).await
    }

    /// Re-run the last question, replacing the answer it produced.
    pub async fn retry(&mut self) -> Result<(), SessionError> {
        self.dispatch(SessionEvent::Retry).await
    }

    pub async fn stop(&mut self) -> Result<(), SessionError> {
        self.dispatch(SessionEvent::UserStop).await
    }

    pub async fn clear(&mut self) -> Result<(), SessionError> {
        self.dispatch(SessionEvent::Clear).await
    }

    pub async fn set_stick_to_bottom(&mut self, stick: bool) -> Result<(), SessionError> {
        self.dispatch(SessionEvent::SetStickToBottom(stick)).await
    }

    /// Apply `event` and carry out its effects, running a full turn if one
    /// was requested. Empty input is dropped without touching the session.
    pub async fn dispatch(&mut self, event: SessionEvent) -> Result<(), SessionError> {
        let effects = match self.transition(event).await {
            Ok(effects) => effects,
            Err(SessionError::EmptyInput) => {
                debug!("Ignoring empty input");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        for effect in effects {
            if let Effect::RequestTurn { question } = effect {
                self.run_turn(question).await;
            }
        }
        Ok(())
    }

    async fn transition(&mut self, event: SessionEvent) -> Result<Vec<Effect>, SessionError> {
        let effects = self.session.apply(event)?;
        self.stop.set(self.session.active_request().cloned());

        self.observer.on_session_changed(&self.session).await;
        for effect in &effects {
            match effect {
                Effect::ScrollToBottom => self.observer.scroll_to_bottom().await,
                Effect::FocusInput => self.observer.focus_input().await,
                Effect::ResetInput => self.observer.reset_input().await,
                Effect::RequestTurn { .. } => {}
            }
        }
        Ok(effects)
    }

    /// Apply an event produced by the turn itself. These never violate the
    /// state machine, so a rejection is only logged.
    async fn record(&mut self, event: SessionEvent) {
        if let Err(e) = self.transition(event).await {
            warn!(error = %e, "Turn event rejected");
        }
    }

    async fn run_turn(&mut self, question: String) {
        let Some(cancel) = self.session.active_request().cloned() else {
            return;
        };
        let started = Instant::now();
        info!(
            question_chars = question.chars().count(),
            prompt = self.prompt_name.as_deref().unwrap_or("default"),
            "Turn started"
        );

        let prepared = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            prepared = self.prepare_messages(&question) => Some(prepared),
        };
        let messages = match prepared {
            None => return self.record(SessionEvent::UserStop).await,
            Some(Err(e)) => return self.fail(e).await,
            Some(Ok(messages)) => messages,
        };
        self.record(SessionEvent::ContextReady).await;

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            opened = self.backend.generate(&messages) => Some(opened),
        };
        let body = match opened {
            None => return self.record(SessionEvent::UserStop).await,
            Some(Err(e)) => return self.fail(e).await,
            Some(Ok(body)) => body,
        };

        let mut consumer = StreamConsumer::new(body, cancel);
        loop {
            match consumer.next_increment().await {
                Ok(Some(text)) => {
                    self.record(SessionEvent::Increment(text.clone())).await;
                    self.observer.on_increment(&text).await;
                }
                Ok(None) if consumer.was_cancelled() => {
                    self.record(SessionEvent::UserStop).await;
                    break;
                }
                Ok(None) => {
                    self.record(SessionEvent::StreamComplete).await;
                    break;
                }
                Err(e) => return self.fail(e).await,
            }
        }

        info!(
            phase = %self.session.phase(),
            messages = self.session.messages().len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Turn finished"
        );
    }

    async fn fail(&mut self, error: TurnError) {
        warn!(error = %error, "Turn failed");
        self.record(SessionEvent::Failure(error.into())).await;
    }

    async fn prepare_messages(&self, question: &str) -> Result<Vec<ChatMessage>, TurnError> {
        let prompt = match &self.prompt_name {
            Some(name) => self.prompts.fetch_prompt(name).await?,
            None => default_prompt(),
        };
        let context = self.assembler.assemble(question, &self.retrieval).await?;
        debug!(
            prompt_messages = prompt.len(),
            sources = context.sources.len(),
            "Request prepared"
        );
        Ok(build_request(&prompt, &context))
    }
}
