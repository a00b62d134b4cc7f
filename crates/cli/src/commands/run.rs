//! `runloop run`: execute one run and stream its events to stdout.

use runloop_config::AppConfig;
use runloop_core::message::{Conversation, Message, Role};
use runloop_core::run::NewRun;
use runloop_core::StreamEvent;
use runloop_engine::{EngineSettings, RunExecutor};
use runloop_store::InMemoryRunStore;
use serde::Deserialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::offline::{self, OfflineProvider};

pub struct RunOptions {
    pub message: Option<String>,
    pub conversation: Option<PathBuf>,
    pub model: Option<String>,
    pub instructions: Option<String>,
    pub max_steps: Option<u32>,
    pub no_truncation: bool,
    pub text: bool,
}

/// One entry of a conversation file.
#[derive(Debug, Deserialize)]
struct InputMessage {
    role: Role,
    content: String,
    #[serde(default)]
    tool_call_id: Option<String>,
}

impl From<InputMessage> for Message {
    fn from(input: InputMessage) -> Self {
        match input.role {
            Role::User => Message::user(input.content),
            Role::Assistant => Message::assistant(input.content),
            Role::System => Message::system(input.content),
            Role::Tool => {
                Message::tool_result(input.tool_call_id.unwrap_or_default(), input.content)
            }
        }
    }
}

fn load_conversation(path: &Path) -> Result<Vec<Message>, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
    let inputs: Vec<InputMessage> = serde_json::from_str(&content)
        .map_err(|e| format!("Failed to parse {}: {e}", path.display()))?;
    Ok(inputs.into_iter().map(Message::from).collect())
}

pub async fn run(options: RunOptions) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    if let Some(max_steps) = options.max_steps {
        config.engine.max_steps = max_steps;
    }
    if options.no_truncation {
        config.truncation.enabled = false;
    }
    config.validate()?;

    let messages = match (&options.message, &options.conversation) {
        (Some(text), _) => vec![Message::user(text.clone())],
        (None, Some(path)) => load_conversation(path)?,
        (None, None) => return Err("Pass --message or --conversation".into()),
    };

    let store = InMemoryRunStore::new();
    let mut conversation = Conversation::new();
    for message in messages {
        conversation.push(message);
    }
    let conversation_id = store.create_conversation(conversation).await;

    let model = options
        .model
        .unwrap_or_else(|| config.default_model.clone());
    let mut new_run = NewRun::new(conversation_id, model);
    if let Some(instructions) = options.instructions {
        new_run = new_run.with_instructions(instructions);
    }
    let run = store.create_run(new_run).await?;

    let executor = RunExecutor::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(OfflineProvider),
        Arc::new(offline::registry()),
        EngineSettings::from(&config),
    );

    let mut handle = executor.start(&run.id).await?;
    let mut stdout = std::io::stdout().lock();
    while let Some(event) = handle.recv().await {
        if options.text {
            if let StreamEvent::MessageDelta { delta, .. } = &event
                && let Some(text) = delta.text()
            {
                write!(stdout, "{text}")?;
                stdout.flush()?;
            }
        } else {
            writeln!(stdout, "{}", serde_json::to_string(&event)?)?;
        }
    }
    if options.text {
        writeln!(stdout)?;
    }

    let outcome = handle.join().await?;
    info!(
        run_id = %run.id,
        status = ?outcome.status,
        steps = outcome.steps,
        "Run finished"
    );

    match outcome.error {
        Some(error) => Err(format!("Run failed ({:?}): {}", error.code, error.message).into()),
        None => Ok(()),
    }
}
