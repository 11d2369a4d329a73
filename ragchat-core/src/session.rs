//! Session state and its transition function.
//!
//! [`Session::apply`] is the only way the session changes. It is synchronous
//! and performs no I/O: side effects the caller must carry out (start a turn,
//! scroll, focus the input) are returned as [`Effect`]s. Events that no longer
//! apply to the current phase, such as an increment arriving after the user
//! pressed stop, are ignored.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::SessionError;
use crate::persistence::RestoredState;
use crate::types::{ChatMessage, ErrorMessage, Role};

/// Lifecycle phase of the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    /// Prompt lookup and similarity search are in flight.
    AwaitingContext,
    /// The generation response body is being consumed.
    Streaming,
    Error,
    /// The user cancelled the request.
    Stopped,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Idle => write!(f, "idle"),
            Phase::AwaitingContext => write!(f, "awaiting context"),
            Phase::Streaming => write!(f, "streaming"),
            Phase::Error => write!(f, "error"),
            Phase::Stopped => write!(f, "stopped"),
        }
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The user sent a question.
    Submit(String),
    /// Prompt and context are assembled; generation is about to start.
    ContextReady,
    /// A decoded chunk of the answer arrived.
    Increment(String),
    /// The generation stream ended normally.
    StreamComplete,
    /// The user asked to stop the active request.
    UserStop,
    /// A collaborator or transport failure ended the turn.
    Failure(ErrorMessage),
    /// Re-run the last question.
    Retry,
    /// Discard the conversation.
    Clear,
    SetStickToBottom(bool),
}

/// Side effects requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Run the prompt → search → generate pipeline for `question`.
    RequestTurn { question: String },
    ScrollToBottom,
    FocusInput,
    ResetInput,
}

/// The conversation and the state of its in-flight request.
///
/// `active_request` is set exactly while `is_loading` is true.
#[derive(Debug, Clone, Default)]
pub struct Session {
    messages: Vec<ChatMessage>,
    draft: String,
    is_loading: bool,
    error: Option<ErrorMessage>,
    stick_to_bottom: bool,
    active_request: Option<CancellationToken>,
    phase: Phase,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild an idle session from persisted state.
    pub fn restored(state: RestoredState) -> Self {
        Self {
            messages: state.messages,
            stick_to_bottom: state.stick_to_bottom,
            ..Self::default()
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// The in-progress assistant answer, if any text has arrived.
    pub fn draft(&self) -> Option<&str> {
        if self.draft.is_empty() {
            None
        } else {
            Some(&self.draft)
        }
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    pub fn error(&self) -> Option<&ErrorMessage> {
        self.error.as_ref()
    }

    pub fn stick_to_bottom(&self) -> bool {
        self.stick_to_bottom
    }

    pub fn active_request(&self) -> Option<&CancellationToken> {
        self.active_request.as_ref()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether a retry would resubmit anything: some question is on record
    /// and no request is running.
    pub fn can_retry(&self) -> bool {
        !self.is_loading && self.retry_target().is_some()
    }

    /// Apply one event and return the side effects it requests.
    ///
    /// Only a submit while a request is in flight is rejected; the caller is
    /// expected to disable input while loading.
    pub fn apply(&mut self, event: SessionEvent) -> Result<Vec<Effect>, SessionError> {
        let effects = match event {
            SessionEvent::Submit(text) => self.submit(text)?,
            SessionEvent::ContextReady => {
                if self.phase == Phase::AwaitingContext {
                    self.phase = Phase::Streaming;
                } else {
                    debug!(phase = %self.phase, "Ignoring stale ContextReady");
                }
                Vec::new()
            }
            SessionEvent::Increment(text) => {
                if self.phase != Phase::Streaming {
                    debug!(phase = %self.phase, "Ignoring stale increment");
                    Vec::new()
                } else {
                    self.draft.push_str(&text);
                    self.scroll_if_sticky()
                }
            }
            SessionEvent::StreamComplete => {
                if self.phase == Phase::Streaming {
                    self.finish_request(Phase::Idle)
                } else {
                    debug!(phase = %self.phase, "Ignoring stale StreamComplete");
                    Vec::new()
                }
            }
            SessionEvent::UserStop => match self.active_request.take() {
                Some(token) => {
                    token.cancel();
                    info!(draft_chars = self.draft.len(), "Request stopped by user");
                    self.finish_request(Phase::Stopped)
                }
                None => Vec::new(),
            },
            SessionEvent::Failure(error) => {
                if self.is_loading {
                    info!(code = %error.code, "Turn failed");
                    // Text that already arrived is kept, as on a manual stop.
                    self.archive_draft();
                    self.is_loading = false;
                    self.active_request = None;
                    self.error = Some(error);
                    self.phase = Phase::Error;
                } else {
                    debug!(phase = %self.phase, "Ignoring failure with no active request");
                }
                Vec::new()
            }
            SessionEvent::Retry => self.retry(),
            SessionEvent::Clear => {
                if let Some(token) = self.active_request.take() {
                    token.cancel();
                }
                self.messages.clear();
                self.draft.clear();
                self.error = None;
                self.is_loading = false;
                self.phase = Phase::Idle;
                vec![Effect::ResetInput]
            }
            SessionEvent::SetStickToBottom(stick) => {
                self.stick_to_bottom = stick;
                self.scroll_if_sticky()
            }
        };

        debug_assert_eq!(self.active_request.is_some(), self.is_loading);
        Ok(effects)
    }

    fn submit(&mut self, text: String) -> Result<Vec<Effect>, SessionError> {
        if text.trim().is_empty() {
            return Err(SessionError::EmptyInput);
        }
        if self.is_loading {
            return Err(SessionError::Busy);
        }
        self.messages.push(ChatMessage::user(text.clone()));
        self.begin_request();
        Ok(vec![
            Effect::ResetInput,
            Effect::ScrollToBottom,
            Effect::RequestTurn { question: text },
        ])
    }

    /// Index of the message a retry resubmits: the one before a trailing
    /// answer, otherwise the last one.
    fn retry_target(&self) -> Option<usize> {
        if self.ends_with_answer() {
            self.messages.len().checked_sub(2)
        } else {
            self.messages.len().checked_sub(1)
        }
    }

    fn ends_with_answer(&self) -> bool {
        self.messages
            .last()
            .is_some_and(|m| m.role == Role::Assistant)
    }

    fn retry(&mut self) -> Vec<Effect> {
        let Some(index) = self.retry_target() else {
            return Vec::new();
        };
        let ends_with_answer = self.ends_with_answer();

        if let Some(token) = self.active_request.take() {
            token.cancel();
        }
        if ends_with_answer {
            self.messages.pop();
        }
        let question = self.messages[index].content.clone();
        self.begin_request();
        vec![Effect::ScrollToBottom, Effect::RequestTurn { question }]
    }

    fn begin_request(&mut self) {
        self.draft.clear();
        self.error = None;
        self.is_loading = true;
        self.active_request = Some(CancellationToken::new());
        self.phase = Phase::AwaitingContext;
    }

    fn finish_request(&mut self, phase: Phase) -> Vec<Effect> {
        self.archive_draft();
        self.is_loading = false;
        self.active_request = None;
        self.phase = phase;
        let mut effects = vec![Effect::FocusInput];
        effects.extend(self.scroll_if_sticky());
        effects
    }

    fn archive_draft(&mut self) {
        if !self.draft.is_empty() {
            let content = std::mem::take(&mut self.draft);
            self.messages.push(ChatMessage::assistant(content));
        }
    }

    fn scroll_if_sticky(&self) -> Vec<Effect> {
        if self.stick_to_bottom {
            vec![Effect::ScrollToBottom]
        } else {
            Vec::new()
        }
    }
}
