//! # Ragchat Core
//!
//! Session engine for a retrieval-augmented chat client.
//! Provides the session state machine, context assembly under a token budget,
//! incremental decoding of streamed answers, collaborator seams, persistence,
//! and configuration.

pub mod collaborators;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod persistence;
pub mod prompt;
pub mod session;
pub mod stream;
pub mod tokenizer;
pub mod types;

// Re-export commonly used types at the crate root.
pub use collaborators::{
    ApiClient, ByteStream, CompletionBackend, DocumentSearch, PromptSource, SearchRequest,
};
pub use config::{ChatConfig, EndpointConfig, RetrievalConfig, load_config};
pub use context::{AssembledContext, ContextAssembler, assemble_documents};
pub use controller::{
    ChatController, Collaborators, NoOpObserver, RecordingObserver, SessionObserver, StopHandle,
};
pub use error::{
    ConfigError, PersistenceError, RagchatError, Result, SessionError, TurnError,
};
pub use persistence::{FileStore, KeyValueStore, MemoryStore, RestoredState, SessionStore};
pub use session::{Effect, Phase, Session, SessionEvent};
pub use stream::{StreamConsumer, Utf8Decoder};
pub use tokenizer::{MAX_CONTEXT_TOKENS, TokenCounter, TokenEstimator};
pub use types::{ChatMessage, ErrorMessage, RetrievedDocument, Role};
