//! Subcommand handlers and shared session storage setup.

use ragchat_core::persistence::{MESSAGES_KEY, STICK_KEY};
use ragchat_core::{ChatConfig, ChatMessage, FileStore, KeyValueStore, MemoryStore, Role, SessionStore};

use crate::Commands;

/// Open the configured session store, or an in-memory one when persistence
/// is off or the platform has no data directory.
pub fn open_store(config: &ChatConfig, persist: bool) -> SessionStore<Box<dyn KeyValueStore>> {
    if !persist {
        return SessionStore::new(Box::new(MemoryStore::new()));
    }
    let store: Box<dyn KeyValueStore> = match config.storage.resolved_path() {
        Some(path) => {
            tracing::debug!(path = %path.display(), "Using session file");
            Box::new(FileStore::new(path))
        }
        None => {
            tracing::warn!("No data directory available; the conversation will not be saved");
            Box::new(MemoryStore::new())
        }
    };
    SessionStore::new(store)
}

pub fn handle_command(command: Commands, config: &ChatConfig) -> anyhow::Result<()> {
    match command {
        Commands::Config => {
            print!("{}", toml::to_string_pretty(config)?);
            Ok(())
        }
        Commands::History { json } => {
            let restored = open_store(config, true).restore();
            if json {
                println!("{}", serde_json::to_string_pretty(&restored.messages)?);
            } else if restored.messages.is_empty() {
                println!("No saved conversation.");
            } else {
                print!("{}", transcript(&restored.messages));
            }
            Ok(())
        }
        Commands::Reset => {
            let sessions = open_store(config, true);
            sessions.inner().remove(MESSAGES_KEY)?;
            sessions.inner().remove(STICK_KEY)?;
            println!("Saved conversation deleted.");
            Ok(())
        }
    }
}

/// Render messages as a plain-text transcript.
pub fn transcript(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    for message in messages {
        let speaker = match message.role {
            Role::User => "You",
            Role::Assistant => "Assistant",
            Role::System => "System",
        };
        out.push_str(&format!("{speaker}: {}\n\n", message.content.trim_end()));
    }
    out
}
