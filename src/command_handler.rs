// src/command_handler.rs
// Command Handler: typed dispatch surface over a ProcessWrapper, with a
// per-process command history.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::SupervisorError;
use crate::process_wrapper::{LifecycleState, ProcessWrapper};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Pause,
    Resume,
    Kill,
    SendInput { text: String },
    SendSignal { signal: String },
    GetState,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandResponse {
    pub ok: bool,
    pub message: String,
    pub state: Option<String>,
}

impl CommandResponse {
    fn ok(message: impl Into<String>, state: LifecycleState) -> Self {
        CommandResponse {
            ok: true,
            message: message.into(),
            state: Some(state.as_str().to_string()),
        }
    }

    fn err(message: impl Into<String>) -> Self {
        CommandResponse {
            ok: false,
            message: message.into(),
            state: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandLogEntry {
    pub timestamp: DateTime<Utc>,
    pub command: Command,
    pub response: CommandResponse,
}

/// Dispatches `Command`s against a `ProcessWrapper` and keeps a history of
/// every command handled, in issue order.
pub struct CommandHandler {
    process: Arc<ProcessWrapper>,
    history: Mutex<Vec<CommandLogEntry>>,
}

impl CommandHandler {
    pub fn new(process: Arc<ProcessWrapper>) -> Self {
        CommandHandler {
            process,
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn handle(&self, command: Command) -> CommandResponse {
        let response = self.dispatch(&command);
        self.history.lock().unwrap().push(CommandLogEntry {
            timestamp: Utc::now(),
            command,
            response: response.clone(),
        });
        response
    }

    fn dispatch(&self, command: &Command) -> CommandResponse {
        match command {
            Command::Pause => {
                if self.process.is_paused() {
                    return CommandResponse::err("Process is already paused");
                }
                match self.process.pause() {
                    Ok(()) => CommandResponse::ok("paused", self.process.get_state()),
                    Err(SupervisorError::ProcessNotRunning) => {
                        CommandResponse::err("Process is not running")
                    }
                    Err(e) => CommandResponse::err(e.to_string()),
                }
            }
            Command::Resume => {
                if !self.process.is_paused() {
                    return CommandResponse::err("Process is not paused");
                }
                match self.process.resume() {
                    Ok(()) => CommandResponse::ok("resumed", self.process.get_state()),
                    Err(SupervisorError::ProcessNotRunning) => {
                        CommandResponse::err("Process is not running")
                    }
                    Err(e) => CommandResponse::err(e.to_string()),
                }
            }
            Command::Kill => match self.process.stop() {
                Ok(code) => CommandResponse::ok(format!("killed, exit_code={code}"), self.process.get_state()),
                Err(e) => CommandResponse::err(e.to_string()),
            },
            Command::SendInput { text } => match self.process.send_input(text) {
                Ok(n) => CommandResponse::ok(format!("wrote {n} bytes"), self.process.get_state()),
                Err(SupervisorError::ProcessNotRunning) => {
                    CommandResponse::err("Process is not running")
                }
                Err(e) => CommandResponse::err(e.to_string()),
            },
            Command::SendSignal { signal } => match self.process.send_signal(signal) {
                Ok(()) => CommandResponse::ok(format!("sent {signal}"), self.process.get_state()),
                Err(SupervisorError::UnknownSignal(name)) => {
                    CommandResponse::err(format!("unknown signal: {name}"))
                }
                Err(SupervisorError::ProcessNotRunning) => {
                    CommandResponse::err("Process is not running")
                }
                Err(e) => CommandResponse::err(e.to_string()),
            },
            Command::GetState => {
                CommandResponse::ok("state", self.process.get_state())
            }
        }
    }

    pub fn history(&self) -> Vec<CommandLogEntry> {
        self.history.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn s6_double_pause_is_rejected_with_exact_message() {
        let dir = tempdir().unwrap();
        let wrapper = Arc::new(
            ProcessWrapper::new(
                "agent-a",
                dir.path(),
                None,
                "/bin/sleep",
                &["2".to_string()],
                None,
                None,
                None,
                crate::extractor::DEFAULT_BATCH_SIZE,
                crate::extractor::DEFAULT_FLUSH_INTERVAL,
            )
                .unwrap(),
        );
        wrapper.start().unwrap();
        let handler = CommandHandler::new(wrapper.clone());

        let first = handler.handle(Command::Pause);
        assert!(first.ok);
        let second = handler.handle(Command::Pause);
        assert!(!second.ok);
        assert_eq!(second.message, "Process is already paused");

        handler.handle(Command::Resume);
        wrapper.stop().unwrap();

        assert_eq!(handler.history().len(), 3);
    }

    #[tokio::test]
    async fn unknown_signal_is_rejected() {
        let dir = tempdir().unwrap();
        let wrapper = Arc::new(
            ProcessWrapper::new(
                "agent-b",
                dir.path(),
                None,
                "/bin/sleep",
                &["1".to_string()],
                None,
                None,
                None,
                crate::extractor::DEFAULT_BATCH_SIZE,
                crate::extractor::DEFAULT_FLUSH_INTERVAL,
            )
                .unwrap(),
        );
        wrapper.start().unwrap();
        let handler = CommandHandler::new(wrapper.clone());

        let response = handler.handle(Command::SendSignal { signal: "SIGBOGUS".to_string() });
        assert!(!response.ok);
        wrapper.stop().unwrap();
    }
}
