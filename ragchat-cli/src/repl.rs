//! Interactive REPL and single-question mode.

use async_trait::async_trait;
use ragchat_core::{
    ChatConfig, ChatController, KeyValueStore, Phase, Session, SessionObserver, SessionStore,
    StopHandle,
};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use crate::commands::{open_store, transcript};

/// Prints streamed answers and phase changes to the terminal.
struct TerminalObserver {
    last_phase: Mutex<Phase>,
}

impl TerminalObserver {
    fn new() -> Self {
        Self {
            last_phase: Mutex::new(Phase::Idle),
        }
    }
}

#[async_trait]
impl SessionObserver for TerminalObserver {
    async fn on_session_changed(&self, session: &Session) {
        let phase = session.phase();
        let previous = {
            let mut last = self.last_phase.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *last, phase)
        };
        if previous == phase {
            return;
        }
        match phase {
            Phase::AwaitingContext => {
                print!("\x1b[90msearching...\x1b[0m");
            }
            Phase::Streaming => {
                print!("\r\x1b[2K\x1b[32mAssistant:\x1b[0m ");
            }
            Phase::Idle if previous == Phase::Streaming => println!("\n"),
            Phase::Stopped => println!("\n\x1b[33m[stopped]\x1b[0m\n"),
            Phase::Error => {
                if let Some(error) = session.error() {
                    println!("\r\x1b[2K\x1b[31mError:\x1b[0m {}", error);
                    println!("  Type /retry to try again.\n");
                }
            }
            _ => {}
        }
        let _ = io::stdout().flush();
    }

    async fn on_increment(&self, text: &str) {
        print!("{}", text);
        let _ = io::stdout().flush();
    }
}

fn build_controller(config: &ChatConfig, session: Session) -> anyhow::Result<ChatController> {
    Ok(ChatController::from_config(
        config,
        session,
        Arc::new(TerminalObserver::new()),
    )?)
}

fn save(sessions: &SessionStore<Box<dyn KeyValueStore>>, session: &Session) {
    if let Err(e) = sessions.save(session) {
        tracing::warn!(error = %e, "Failed to save conversation");
    }
}

/// Route Ctrl-C to the active request. With nothing running, print a hint.
fn spawn_stop_on_ctrl_c(handle: StopHandle) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if !handle.stop() {
                eprintln!("\n(nothing to stop; type /quit or press Ctrl-D to exit)");
            }
        }
    })
}

/// Ask one question, print the answer, and save the conversation.
pub async fn run_single_question(
    question: &str,
    config: ChatConfig,
    persist: bool,
) -> anyhow::Result<()> {
    let sessions = open_store(&config, persist);
    let mut controller = build_controller(&config, Session::restored(sessions.restore()))?;
    let ctrl_c = spawn_stop_on_ctrl_c(controller.stop_handle());

    controller.submit(question).await?;
    ctrl_c.abort();
    save(&sessions, controller.session());

    match controller.session().error() {
        Some(error) => anyhow::bail!("{}", error),
        None => Ok(()),
    }
}

pub async fn run_interactive(config: ChatConfig, persist: bool) -> anyhow::Result<()> {
    println!("\x1b[1;32m  ragchat\x1b[0m");
    println!(
        "  Server: {} | Prompt: {}",
        config.endpoint.base_url,
        config.prompt.name.as_deref().unwrap_or("built-in")
    );
    println!("  Type /help for commands, /quit to exit\n");

    let sessions = open_store(&config, persist);
    let mut controller = build_controller(&config, Session::restored(sessions.restore()))?;
    if !controller.session().messages().is_empty() {
        print!("{}", transcript(controller.session().messages()));
    }
    let ctrl_c = spawn_stop_on_ctrl_c(controller.stop_handle());

    let result = run_repl(
        &mut controller,
        &sessions,
        BufReader::new(tokio::io::stdin()),
    )
    .await;

    ctrl_c.abort();
    save(&sessions, controller.session());
    result
}

/// Read lines from `input` until `/quit` or end of input, saving after
/// every command and turn.
async fn run_repl<R>(
    controller: &mut ChatController,
    sessions: &SessionStore<Box<dyn KeyValueStore>>,
    input: R,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    loop {
        print!("\x1b[1;34m> \x1b[0m");
        io::stdout().flush()?;

        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read input");
                break;
            }
        };

        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        if input.starts_with('/') {
            let parts: Vec<&str> = input.splitn(2, ' ').collect();
            let cmd = parts[0];
            let arg = parts.get(1).copied().unwrap_or("").trim();

            match cmd {
                "/quit" | "/exit" | "/q" => {
                    println!("Goodbye!");
                    break;
                }
                "/help" | "/?" => {
                    println!("{}", help_text());
                }
                "/retry" => {
                    if controller.session().can_retry() {
                        controller.retry().await?;
                    } else {
                        println!("Nothing to retry.");
                    }
                }
                "/clear" => {
                    controller.clear().await?;
                    print!("\x1b[2J\x1b[H");
                }
                "/stick" => {
                    let stick = match arg {
                        "on" => true,
                        "off" => false,
                        "" => !controller.session().stick_to_bottom(),
                        other => {
                            println!("Usage: /stick [on|off] (got '{}')", other);
                            continue;
                        }
                    };
                    controller.set_stick_to_bottom(stick).await?;
                    println!(
                        "Stick to bottom: {}",
                        if stick { "on" } else { "off" }
                    );
                }
                "/history" => {
                    print!("{}", transcript(controller.session().messages()));
                }
                _ => {
                    println!("Unknown command: {}. Type /help for commands.", cmd);
                    continue;
                }
            }
            save(sessions, controller.session());
            continue;
        }

        println!();
        controller.submit(input).await?;
        save(sessions, controller.session());
    }
    Ok(())
}

fn help_text() -> &'static str {
    "Commands:
  /retry          Ask the last question again
  /clear          Start a new conversation
  /stick [on|off] Keep the view pinned to the newest output
  /history        Print the conversation so far
  /quit           Save and exit

Press Ctrl-C while an answer is streaming to stop it."
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use ragchat_core::{
        ByteStream, ChatMessage, Collaborators, CompletionBackend, DocumentSearch, MemoryStore,
        NoOpObserver, PromptSource, RestoredState, RetrievedDocument, SearchRequest,
        TokenEstimator, TurnError,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Offline {
        generate_calls: AtomicUsize,
    }

    #[async_trait]
    impl PromptSource for Offline {
        async fn fetch_prompt(&self, _name: &str) -> Result<Vec<ChatMessage>, TurnError> {
            Err(TurnError::transport("offline"))
        }
    }

    #[async_trait]
    impl DocumentSearch for Offline {
        async fn search(
            &self,
            _request: &SearchRequest,
        ) -> Result<Vec<RetrievedDocument>, TurnError> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl CompletionBackend for Offline {
        async fn generate(&self, _messages: &[ChatMessage]) -> Result<ByteStream, TurnError> {
            self.generate_calls.fetch_add(1, Ordering::SeqCst);
            Err(TurnError::transport("offline"))
        }
    }

    struct CharEstimator;

    impl TokenEstimator for CharEstimator {
        fn estimate(&self, text: &str) -> usize {
            text.len()
        }
    }

    fn offline_controller(session: Session) -> (ChatController, Arc<Offline>) {
        let offline = Arc::new(Offline {
            generate_calls: AtomicUsize::new(0),
        });
        let collaborators = Collaborators {
            prompts: offline.clone(),
            search: offline.clone(),
            backend: offline.clone(),
        };
        let controller = ChatController::new(
            session,
            collaborators,
            Arc::new(CharEstimator),
            Arc::new(NoOpObserver),
        );
        (controller, offline)
    }

    fn memory_sessions() -> SessionStore<Box<dyn KeyValueStore>> {
        SessionStore::new(Box::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_repl_retries_unanswered_question_and_saves() {
        let session = Session::restored(RestoredState {
            messages: vec![ChatMessage::user("what is nextjs?")],
            stick_to_bottom: false,
        });
        let (mut controller, offline) = offline_controller(session);
        let sessions = memory_sessions();

        run_repl(
            &mut controller,
            &sessions,
            &b"/retry\n/stick on\n/quit\n/stick off\n"[..],
        )
        .await
        .unwrap();

        assert_eq!(offline.generate_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            controller.session().messages(),
            &[ChatMessage::user("what is nextjs?")]
        );
        assert!(controller.session().error().is_some());
        assert!(controller.session().stick_to_bottom());

        let saved = sessions.restore();
        assert_eq!(saved.messages, vec![ChatMessage::user("what is nextjs?")]);
        assert!(saved.stick_to_bottom);
    }

    #[tokio::test]
    async fn test_repl_stops_at_end_of_input() {
        let (mut controller, offline) = offline_controller(Session::new());
        let sessions = memory_sessions();

        run_repl(&mut controller, &sessions, &b"\n   \n/retry\n"[..])
            .await
            .unwrap();

        assert_eq!(offline.generate_calls.load(Ordering::SeqCst), 0);
        assert!(controller.session().messages().is_empty());
        assert!(sessions.restore().messages.is_empty());
    }
}
