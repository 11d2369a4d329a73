//! Integration tests for the chat session engine.
//!
//! These drive whole turns through `ChatController` with in-memory
//! collaborators, covering the normal answer path, user stop, retry,
//! collaborator failures, and persistence across restarts.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ragchat_core::collaborators::{ByteStream, SearchRequest};
use ragchat_core::{
    ChatController, ChatMessage, Collaborators, CompletionBackend, DocumentSearch, FileStore,
    Phase, PromptSource, RecordingObserver, RetrievedDocument, Session, SessionError,
    SessionStore, TokenEstimator, TurnError,
};

struct WordEstimator;

impl TokenEstimator for WordEstimator {
    fn estimate(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

struct UnusedPrompts;

#[async_trait]
impl PromptSource for UnusedPrompts {
    async fn fetch_prompt(&self, _name: &str) -> Result<Vec<ChatMessage>, TurnError> {
        Err(TurnError::collaborator("Prompt not found."))
    }
}

enum SearchBehavior {
    Documents(Vec<RetrievedDocument>),
    Fail(TurnError),
    Hang,
}

struct FakeSearch {
    behavior: SearchBehavior,
    requests: Mutex<Vec<SearchRequest>>,
}

impl FakeSearch {
    fn new(behavior: SearchBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            requests: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl DocumentSearch for FakeSearch {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<RetrievedDocument>, TurnError> {
        self.requests.lock().unwrap().push(request.clone());
        match &self.behavior {
            SearchBehavior::Documents(docs) => Ok(docs.clone()),
            SearchBehavior::Fail(err) => Err(err.clone()),
            SearchBehavior::Hang => futures::future::pending().await,
        }
    }
}

/// Streams scripted items per call; each call pops the next script.
struct FakeBackend {
    scripts: Mutex<Vec<Vec<Result<&'static str, TurnError>>>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl FakeBackend {
    fn new(scripts: Vec<Vec<Result<&'static str, TurnError>>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into_iter().rev().collect()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl CompletionBackend for FakeBackend {
    async fn generate(&self, messages: &[ChatMessage]) -> Result<ByteStream, TurnError> {
        self.requests.lock().unwrap().push(messages.to_vec());
        let script = self.scripts.lock().unwrap().pop().unwrap_or_default();
        let items: Vec<Result<Bytes, TurnError>> = script
            .into_iter()
            .map(|item| item.map(|text| Bytes::from_static(text.as_bytes())))
            .collect();
        Ok(Box::pin(stream::iter(items)))
    }
}

fn nextjs_docs() -> Vec<RetrievedDocument> {
    vec![RetrievedDocument::new(
        "Next.js is a React framework for creating production-ready web applications.",
        "https://nextjs.org/docs/faq",
    )]
}

fn create_controller(
    search: Arc<FakeSearch>,
    backend: Arc<FakeBackend>,
    session: Session,
) -> (ChatController, Arc<RecordingObserver>) {
    let observer = Arc::new(RecordingObserver::new());
    let collaborators = Collaborators {
        prompts: Arc::new(UnusedPrompts),
        search,
        backend,
    };
    let controller = ChatController::new(
        session,
        collaborators,
        Arc::new(WordEstimator),
        observer.clone(),
    );
    (controller, observer)
}

#[tokio::test]
async fn test_nextjs_question_is_answered_with_sources() {
    let search = FakeSearch::new(SearchBehavior::Documents(nextjs_docs()));
    let backend = FakeBackend::new(vec![vec![Ok("Next.js is a frame"), Ok("work...")]]);
    let (mut controller, observer) = create_controller(search.clone(), backend.clone(), Session::new());

    controller.submit("what is nextjs?").await.unwrap();

    assert_eq!(
        controller.session().messages(),
        &[
            ChatMessage::user("what is nextjs?"),
            ChatMessage::assistant("Next.js is a framework..."),
        ]
    );
    assert_eq!(controller.session().phase(), Phase::Idle);
    assert_eq!(
        observer.increments().await,
        vec!["Next.js is a frame".to_string(), "work...".to_string()]
    );

    let search_requests = search.requests.lock().unwrap();
    assert_eq!(
        search_requests[0],
        SearchRequest {
            message: "what is nextjs?".into(),
            similarity: 0.1,
            limit: 3,
        }
    );

    let sent = backend.requests.lock().unwrap();
    let question = &sent[0].last().unwrap().content;
    assert_eq!(
        question,
        "CONTEXT:\nNext.js is a React framework for creating production-ready web applications.\n\
         SOURCE: https://nextjs.org/docs/faq\n---\n\n\nUSER QUESTION:\nwhat is nextjs?\n"
    );
}

#[tokio::test]
async fn test_search_failure_enters_error_and_retry_reruns() {
    let search = FakeSearch::new(SearchBehavior::Fail(TurnError::collaborator(
        "No input text.",
    )));
    let backend = FakeBackend::new(vec![]);
    let (mut controller, observer) = create_controller(search, backend.clone(), Session::new());

    controller.submit("q").await.unwrap();

    assert_eq!(controller.session().phase(), Phase::Error);
    assert_eq!(
        controller.session().error().map(|e| e.message.clone()),
        Some("No input text.".to_string())
    );
    assert_eq!(observer.errors().await, vec!["No input text.".to_string()]);
    assert!(controller.session().can_retry());
    assert_eq!(backend.request_count(), 0);

    // Retry re-runs the same failing pipeline without duplicating the question.
    controller.retry().await.unwrap();
    assert_eq!(controller.session().messages(), &[ChatMessage::user("q")]);
    assert_eq!(controller.session().phase(), Phase::Error);
}

#[tokio::test]
async fn test_transport_failure_mid_stream_keeps_partial_answer() {
    let search = FakeSearch::new(SearchBehavior::Documents(nextjs_docs()));
    let backend = FakeBackend::new(vec![vec![
        Ok("Half of "),
        Ok("an answer"),
        Err(TurnError::transport("connection reset")),
        Ok("never seen"),
    ]]);
    let (mut controller, _observer) = create_controller(search, backend, Session::new());

    controller.submit("q").await.unwrap();

    let session = controller.session();
    assert_eq!(session.phase(), Phase::Error);
    assert_eq!(
        session.messages(),
        &[
            ChatMessage::user("q"),
            ChatMessage::assistant("Half of an answer"),
        ]
    );
    let error = session.error().unwrap();
    assert_eq!(error.code, "transport_error");
    assert_eq!(error.message, "connection reset");
}

#[tokio::test]
async fn test_retry_replaces_answer_with_fresh_one() {
    let search = FakeSearch::new(SearchBehavior::Documents(nextjs_docs()));
    let backend = FakeBackend::new(vec![vec![Ok("first answer")], vec![Ok("second answer")]]);
    let (mut controller, _observer) = create_controller(search, backend.clone(), Session::new());

    controller.submit("q").await.unwrap();
    controller.retry().await.unwrap();

    assert_eq!(
        controller.session().messages(),
        &[ChatMessage::user("q"), ChatMessage::assistant("second answer")]
    );
    assert_eq!(backend.request_count(), 2);
}

#[tokio::test]
async fn test_stop_while_awaiting_context() {
    let search = FakeSearch::new(SearchBehavior::Hang);
    let backend = FakeBackend::new(vec![]);
    let (mut controller, observer) = create_controller(search, backend.clone(), Session::new());

    let handle = controller.stop_handle();
    let stopper = tokio::spawn(async move {
        while !handle.stop() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });

    controller.submit("q").await.unwrap();
    stopper.await.unwrap();

    assert_eq!(controller.session().phase(), Phase::Stopped);
    assert_eq!(controller.session().messages(), &[ChatMessage::user("q")]);
    assert!(!controller.session().is_loading());
    assert_eq!(backend.request_count(), 0);
    assert_eq!(
        observer.phases().await,
        vec![Phase::AwaitingContext, Phase::Stopped]
    );
}

#[tokio::test]
async fn test_submit_rejected_while_loading() {
    let mut session = Session::new();
    session
        .apply(ragchat_core::SessionEvent::Submit("first".into()))
        .unwrap();
    let search = FakeSearch::new(SearchBehavior::Documents(Vec::new()));
    let backend = FakeBackend::new(vec![]);
    let (mut controller, _observer) = create_controller(search, backend, session);

    let err = controller.submit("second").await.unwrap_err();
    assert_eq!(err, SessionError::Busy);
}

#[tokio::test]
async fn test_session_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.json");

    let search = FakeSearch::new(SearchBehavior::Documents(nextjs_docs()));
    let backend = FakeBackend::new(vec![vec![Ok("A React framework.")]]);
    let (mut controller, _observer) = create_controller(search, backend, Session::new());
    controller.set_stick_to_bottom(true).await.unwrap();
    controller.submit("what is nextjs?").await.unwrap();

    SessionStore::new(FileStore::new(&path))
        .save(controller.session())
        .unwrap();
    drop(controller);

    let restored = SessionStore::new(FileStore::new(&path)).restore();
    let session = Session::restored(restored);
    assert_eq!(
        session.messages(),
        &[
            ChatMessage::user("what is nextjs?"),
            ChatMessage::assistant("A React framework."),
        ]
    );
    assert!(session.stick_to_bottom());
    assert_eq!(session.phase(), Phase::Idle);
}

#[tokio::test]
async fn test_stream_with_blank_line_artifacts() {
    let search = FakeSearch::new(SearchBehavior::Documents(nextjs_docs()));
    let backend = FakeBackend::new(vec![vec![Ok("para one\n"), Ok("\n"), Ok("para two")]]);
    let (mut controller, observer) = create_controller(search, backend, Session::new());

    controller.submit("q").await.unwrap();

    assert_eq!(
        controller.session().messages()[1].content,
        "para one\npara two"
    );
    assert_eq!(observer.increments().await.len(), 2);
}

#[tokio::test]
async fn test_empty_stream_leaves_no_answer() {
    let search = FakeSearch::new(SearchBehavior::Documents(nextjs_docs()));
    let backend = FakeBackend::new(vec![vec![]]);
    let (mut controller, _observer) = create_controller(search, backend, Session::new());

    controller.submit("q").await.unwrap();

    assert_eq!(controller.session().messages(), &[ChatMessage::user("q")]);
    assert_eq!(controller.session().phase(), Phase::Idle);
}
