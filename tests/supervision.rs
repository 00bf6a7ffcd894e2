// End-to-end tests that launch real child processes under a PTY
// (/bin/sh and coreutils only, no network) and exercise the full
// supervise -> extract -> persist path plus the pause/resume command flow.

use std::sync::Arc;
use std::time::Duration;

use ptysup::command_handler::{Command, CommandHandler};
use ptysup::process_wrapper::{LifecycleState, ProcessWrapper};
use ptysup::store::{ExtractionStore, FileExtractionStore, FileSessionStore, SessionStore};
use tempfile::tempdir;

#[tokio::test]
async fn basic_supervision_extracts_and_persists_session() {
    let logs_dir = tempdir().unwrap();
    let data_dir = tempdir().unwrap();

    let session_store: Arc<dyn SessionStore> = Arc::new(FileSessionStore::new(data_dir.path()));
    let extraction_store: Arc<dyn ExtractionStore> = Arc::new(FileExtractionStore::new(data_dir.path()));

    let wrapper = ProcessWrapper::new(
        "agent-e2e",
        logs_dir.path(),
        None,
        "/bin/sh",
        &["-c".to_string(), "echo 'tokens used 1,377'".to_string()],
        None,
        Some(session_store),
        Some(extraction_store),
        1,
        Duration::from_millis(0),
    )
    .unwrap();

    wrapper.start().unwrap();
    let exit_code = wrapper.wait().unwrap();

    assert_eq!(exit_code, 0);
    assert_eq!(wrapper.get_state(), LifecycleState::Completed);

    let sessions = std::fs::read_to_string(data_dir.path().join("sessions.jsonl")).unwrap();
    assert!(sessions.contains("session_start"));
    assert!(sessions.contains("session_complete"));

    let extractions = std::fs::read_to_string(data_dir.path().join("extractions.jsonl")).unwrap();
    assert!(extractions.contains("tokens_used"));
    assert!(extractions.contains("1377"));
}

#[tokio::test]
async fn pause_resume_then_stop_runs_against_a_real_child() {
    let logs_dir = tempdir().unwrap();

    let wrapper = Arc::new(
        ProcessWrapper::new(
            "agent-e2e-pause",
            logs_dir.path(),
            None,
            "/bin/sleep",
            &["2".to_string()],
            None,
            None,
            None,
            ptysup::extractor::DEFAULT_BATCH_SIZE,
            ptysup::extractor::DEFAULT_FLUSH_INTERVAL,
        )
        .unwrap(),
    );
    wrapper.start().unwrap();
    let handler = CommandHandler::new(wrapper.clone());

    let first_pause = handler.handle(Command::Pause);
    assert!(first_pause.ok);
    let second_pause = handler.handle(Command::Pause);
    assert!(!second_pause.ok);
    assert_eq!(second_pause.message, "Process is already paused");

    let resume = handler.handle(Command::Resume);
    assert!(resume.ok);

    let kill = handler.handle(Command::Kill);
    assert!(kill.ok);

    assert_eq!(handler.history().len(), 4);
}
