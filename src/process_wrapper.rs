// src/process_wrapper.rs
// Process Wrapper: launches and supervises one child under a PTY, streaming
// its combined output through the Terminal Cleaner, Stream Logger, Extractor
// and Broadcaster.

use std::io::{Read, Write as IoWrite};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};

use crate::broadcaster::Broadcaster;
use crate::environment::EnvironmentManager;
use crate::errors::{Result, SupervisorError};
use crate::extractor::{ConfigurableExtractor, Extractor};
use crate::feedback::FeedbackTracker;
use crate::patterns::PatternCatalog;
use crate::store::{ExtractionStore, SessionStats, SessionStore};
use crate::stream_log::StreamLogger;

const GRACE_PERIOD: Duration = Duration::from_secs(5);
const SENTINEL_EXIT_CODE: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    NotStarted,
    Running,
    Paused,
    Resumed,
    Completed,
    Failed,
    SignalSent,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::NotStarted => "not_started",
            LifecycleState::Running => "running",
            LifecycleState::Paused => "paused",
            LifecycleState::Resumed => "resumed",
            LifecycleState::Completed => "completed",
            LifecycleState::Failed => "failed",
            LifecycleState::SignalSent => "signal_sent",
        }
    }
}

pub fn new_session_id(agent: &str) -> String {
    format!("{agent}-{}", Utc::now().format("%Y%m%d-%H%M%S"))
}

pub fn signal_from_name(name: &str) -> Result<nix::sys::signal::Signal> {
    use nix::sys::signal::Signal;
    match name {
        "SIGINT" => Ok(Signal::SIGINT),
        "SIGTERM" => Ok(Signal::SIGTERM),
        "SIGKILL" => Ok(Signal::SIGKILL),
        "SIGHUP" => Ok(Signal::SIGHUP),
        "SIGUSR1" => Ok(Signal::SIGUSR1),
        "SIGUSR2" => Ok(Signal::SIGUSR2),
        other => Err(SupervisorError::UnknownSignal(other.to_string())),
    }
}

struct RunningChild {
    child: Box<dyn Child + Send + Sync>,
    writer: Mutex<Box<dyn IoWrite + Send>>,
    pid: Option<u32>,
}

/// Supervises a single child process launched under a PTY.
pub struct ProcessWrapper {
    agent_name: String,
    logs_dir: PathBuf,
    environment_name: Option<String>,
    command: String,
    args: Vec<String>,
    session_id: String,

    broadcaster: Arc<Broadcaster>,
    environment: Option<EnvironmentManager>,
    feedback: Option<Mutex<FeedbackTracker>>,
    extractor: Arc<Mutex<Extractor>>,
    configurable_extractor: Option<Arc<Mutex<ConfigurableExtractor>>>,
    session_store: Option<Arc<dyn SessionStore>>,

    running: Mutex<Option<RunningChild>>,
    stdout_logger: Arc<Mutex<Option<StreamLogger>>>,
    stderr_logger: Arc<Mutex<Option<StreamLogger>>>,
    streaming_handle: Mutex<Option<thread::JoinHandle<()>>>,

    start_instant: Mutex<Option<Instant>>,
    exit_code: AtomicI32,
    total_extractions: AtomicU64,
    total_feedback: AtomicU64,
    paused: AtomicBool,
    state: Mutex<LifecycleState>,
}

impl ProcessWrapper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent_name: &str,
        logs_dir: &Path,
        environment_name: Option<&str>,
        command: &str,
        args: &[String],
        environment_config_path: Option<&Path>,
        session_store: Option<Arc<dyn SessionStore>>,
        extraction_store: Option<Arc<dyn ExtractionStore>>,
        batch_size: usize,
        flush_interval: Duration,
    ) -> Result<Self> {
        let session_id = new_session_id(agent_name);

        let environment = match (environment_config_path, environment_name) {
            (Some(path), name) => match EnvironmentManager::load(path, name) {
                Ok(manager) => {
                    if let Err(e) = manager.setup(agent_name) {
                        tracing::warn!("environment setup failed, continuing without it: {e}");
                    }
                    if let Err(e) = manager.enforce_working_directory() {
                        tracing::warn!("failed to enter environment working directory: {e}");
                    }
                    Some(manager)
                }
                Err(e) => {
                    tracing::warn!("environment manager unavailable: {e}");
                    None
                }
            },
            (None, _) => None,
        };

        let feedback = environment
            .as_ref()
            .filter(|e| e.environment().feedback_config.track_outcomes)
            .and_then(|e| {
                let path = PathBuf::from(&e.environment().working_dir).join("data/feedback");
                FeedbackTracker::new(&path, agent_name, environment_name.unwrap_or("default")).ok()
            })
            .map(Mutex::new);

        let broadcaster = Arc::new(Broadcaster::new());

        let configurable_extractor = environment
            .as_ref()
            .map(|e| PathBuf::from(&e.environment().working_dir).join("config/extraction_patterns.json"))
            .filter(|p| p.exists())
            .and_then(|p| PatternCatalog::load(&p).ok())
            .and_then(|catalog| ConfigurableExtractor::new(agent_name, catalog).ok())
            .map(|ex| Arc::new(Mutex::new(ex)));

        let extractor = Arc::new(Mutex::new(
            Extractor::new(agent_name, &session_id, Some(broadcaster.clone()), extraction_store)
                .with_batch_size(batch_size)
                .with_flush_interval(flush_interval),
        ));

        Ok(ProcessWrapper {
            agent_name: agent_name.to_string(),
            logs_dir: logs_dir.to_path_buf(),
            environment_name: environment_name.map(String::from),
            command: command.to_string(),
            args: args.to_vec(),
            session_id,
            broadcaster,
            environment,
            feedback,
            extractor,
            configurable_extractor,
            session_store,
            running: Mutex::new(None),
            stdout_logger: Arc::new(Mutex::new(None)),
            stderr_logger: Arc::new(Mutex::new(None)),
            streaming_handle: Mutex::new(None),
            start_instant: Mutex::new(None),
            exit_code: AtomicI32::new(SENTINEL_EXIT_CODE),
            total_extractions: AtomicU64::new(0),
            total_feedback: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            state: Mutex::new(LifecycleState::NotStarted),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn broadcaster(&self) -> Arc<Broadcaster> {
        self.broadcaster.clone()
    }

    pub fn start(&self) -> Result<()> {
        let stdout_logger = StreamLogger::new(&self.agent_name, "stdout", &self.logs_dir)?;
        let stderr_logger = StreamLogger::new(&self.agent_name, "stderr", &self.logs_dir)?;
        *self.stdout_logger.lock().unwrap() = Some(stdout_logger);
        *self.stderr_logger.lock().unwrap() = Some(stderr_logger);

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SupervisorError::Lifecycle(format!("failed to open pty: {e}")))?;

        let mut cmd = CommandBuilder::new(&self.command);
        cmd.args(&self.args);
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SupervisorError::Lifecycle(format!("failed to spawn child: {e}")))?;
        let pid = child.process_id();
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SupervisorError::Lifecycle(format!("failed to clone pty reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SupervisorError::Lifecycle(format!("failed to take pty writer: {e}")))?;

        *self.running.lock().unwrap() = Some(RunningChild {
            child,
            writer: Mutex::new(writer),
            pid,
        });
        *self.start_instant.lock().unwrap() = Some(Instant::now());
        *self.state.lock().unwrap() = LifecycleState::Running;

        if let Some(store) = &self.session_store {
            if let Err(e) = store.session_start(
                &self.session_id,
                &self.agent_name,
                self.environment_name.as_deref().unwrap_or("default"),
            ) {
                tracing::warn!("session_start persistence failed: {e}");
            }
        }
        self.broadcaster.emit_state("started", &self.session_id);

        self.spawn_streaming_task(reader, pair.master);
        Ok(())
    }

    fn spawn_streaming_task(&self, mut reader: Box<dyn Read + Send>, master: Box<dyn MasterPty + Send>) {
        let broadcaster = self.broadcaster.clone();
        let stdout_logger = self.stdout_logger.clone();
        let extractor = self.extractor.clone();
        let configurable_extractor = self.configurable_extractor.clone();

        let handle = thread::spawn(move || {
            let _keep_master_alive = master;
            let mut buffer = [0u8; 4096];
            let mut pending = String::new();
            let mut line_num: u64 = 0;

            let process_line = |line: &str| {
                extractor.lock().unwrap().extract(line);
                if let Some(cex) = &configurable_extractor {
                    if let Err(e) = cex.lock().unwrap().extract(line) {
                        tracing::warn!("configurable extraction failed: {e}");
                    }
                }
            };

            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        let bytes = &buffer[..n];
                        print!("{}", String::from_utf8_lossy(bytes));
                        let _ = std::io::stdout().flush();

                        if let Some(logger) = stdout_logger.lock().unwrap().as_mut() {
                            if let Err(e) = logger.write(bytes) {
                                tracing::warn!("stdout logger write failed: {e}");
                            }
                        }

                        pending.push_str(&String::from_utf8_lossy(bytes));
                        while let Some(pos) = pending.find('\n') {
                            let line: String = pending.drain(..=pos).collect();
                            let line = line.trim_end_matches('\n').to_string();
                            line_num += 1;
                            process_line(&line);
                            broadcaster.emit_log("stdout", &line, line_num);
                        }
                    }
                    Err(_) => break,
                }
            }

            if !pending.is_empty() {
                line_num += 1;
                process_line(&pending);
                broadcaster.emit_log("stdout", &pending, line_num);
            }

            if let Some(logger) = stdout_logger.lock().unwrap().as_mut() {
                let _ = logger.flush();
            }
        });

        *self.streaming_handle.lock().unwrap() = Some(handle);
    }

    pub fn wait(&self) -> Result<i32> {
        let exit_code = {
            let mut guard = self.running.lock().unwrap();
            match guard.as_mut() {
                Some(running) => match running.child.wait() {
                    Ok(status) => status.exit_code() as i32,
                    Err(_) => SENTINEL_EXIT_CODE,
                },
                None => return Err(SupervisorError::ProcessNotRunning),
            }
        };
        self.exit_code.store(exit_code, Ordering::SeqCst);

        if let Some(handle) = self.streaming_handle.lock().unwrap().take() {
            let _ = handle.join();
        }

        *self.state.lock().unwrap() = if exit_code == 0 {
            LifecycleState::Completed
        } else {
            LifecycleState::Failed
        };

        let duration_ms = self
            .start_instant
            .lock()
            .unwrap()
            .map(|t| t.elapsed().as_millis() as i64)
            .unwrap_or(0);

        let stats = {
            let ex = self.extractor.lock().unwrap();
            SessionStats {
                total_lines: ex.line_count(),
                total_extractions: ex.match_count() as u64,
                total_feedback: self.total_feedback.load(Ordering::SeqCst),
            }
        };
        if let Some(store) = &self.session_store {
            if let Err(e) = store.session_complete(&self.session_id, &stats) {
                tracing::warn!("session_complete persistence failed: {e}");
            }
        }

        self.broadcaster.emit_complete(exit_code, duration_ms);

        if let Some(logger) = self.stdout_logger.lock().unwrap().as_mut() {
            let _ = logger.close();
        }
        if let Some(logger) = self.stderr_logger.lock().unwrap().as_mut() {
            let _ = logger.close();
        }

        if let Some(feedback) = &self.feedback {
            let mut f = feedback.lock().unwrap();
            println!("{}", f.generate_report());
            let _ = f.close();
        }

        Ok(exit_code)
    }

    pub fn stop(&self) -> Result<i32> {
        if let Some(pid) = self.running.lock().unwrap().as_ref().and_then(|r| r.pid) {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGTERM,
            );
        }

        let deadline = Instant::now() + GRACE_PERIOD;
        loop {
            {
                let mut guard = self.running.lock().unwrap();
                if let Some(running) = guard.as_mut() {
                    if let Ok(Some(status)) = running.child.try_wait() {
                        drop(guard);
                        return self.wait_after_exit(status.exit_code() as i32);
                    }
                }
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(Duration::from_millis(100));
        }

        if let Some(mut running) = self.running.lock().unwrap().take() {
            let _ = running.child.kill();
            *self.running.lock().unwrap() = Some(running);
        }
        self.wait()
    }

    fn wait_after_exit(&self, exit_code: i32) -> Result<i32> {
        self.exit_code.store(exit_code, Ordering::SeqCst);
        self.wait().or(Ok(exit_code))
    }

    fn require_running(&self) -> Result<()> {
        if self.running.lock().unwrap().is_some() {
            Ok(())
        } else {
            Err(SupervisorError::ProcessNotRunning)
        }
    }

    pub fn pause(&self) -> Result<()> {
        self.require_running()?;
        self.send_raw_signal(nix::sys::signal::Signal::SIGSTOP)?;
        *self.state.lock().unwrap() = LifecycleState::Paused;
        if let Some(store) = &self.session_store {
            let _ = store.session_state_change(&self.session_id, "paused");
        }
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        self.require_running()?;
        self.send_raw_signal(nix::sys::signal::Signal::SIGCONT)?;
        *self.state.lock().unwrap() = LifecycleState::Resumed;
        if let Some(store) = &self.session_store {
            let _ = store.session_state_change(&self.session_id, "resumed");
        }
        Ok(())
    }

    pub fn send_signal(&self, name: &str) -> Result<()> {
        self.require_running()?;
        let signal = signal_from_name(name)?;
        self.send_raw_signal(signal)?;
        *self.state.lock().unwrap() = LifecycleState::SignalSent;
        if let Some(store) = &self.session_store {
            let _ = store.session_state_change(&self.session_id, "signal_sent");
        }
        Ok(())
    }

    fn send_raw_signal(&self, signal: nix::sys::signal::Signal) -> Result<()> {
        let pid = self
            .running
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|r| r.pid)
            .ok_or(SupervisorError::ProcessNotRunning)?;
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), signal)
            .map_err(|e| SupervisorError::Lifecycle(format!("signal delivery failed: {e}")))
    }

    pub fn send_input(&self, input: &str) -> Result<usize> {
        let guard = self.running.lock().unwrap();
        let running = guard.as_ref().ok_or(SupervisorError::ProcessNotRunning)?;
        let mut writer = running.writer.lock().unwrap();
        let payload = format!("{input}\n");
        writer
            .write_all(payload.as_bytes())
            .map_err(|_| SupervisorError::StdinUnavailable)?;
        let _ = writer.flush();
        Ok(payload.len())
    }

    pub fn get_state(&self) -> LifecycleState {
        let running = self.running.lock().unwrap().is_some();
        let exit_code = self.exit_code.load(Ordering::SeqCst);
        if !running && exit_code == SENTINEL_EXIT_CODE {
            return LifecycleState::NotStarted;
        }
        if exit_code == SENTINEL_EXIT_CODE {
            return *self.state.lock().unwrap();
        }
        if exit_code == 0 {
            LifecycleState::Completed
        } else {
            LifecycleState::Failed
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.state.lock().unwrap() == LifecycleState::Paused
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }

    /// Best-effort read of the last `n` bytes of the on-disk stdout log.
    pub fn get_recent_output(&self, n: usize) -> String {
        self.stdout_logger
            .lock()
            .unwrap()
            .as_ref()
            .map(|l| l.tail(n))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor;
    use tempfile::tempdir;

    #[tokio::test]
    async fn echo_command_runs_and_completes() {
        let dir = tempdir().unwrap();
        let wrapper = ProcessWrapper::new(
            "agent-a",
            dir.path(),
            None,
            "/bin/echo",
            &["hello".to_string()],
            None,
            None,
            None,
            extractor::DEFAULT_BATCH_SIZE,
            extractor::DEFAULT_FLUSH_INTERVAL,
        )
        .unwrap();

        wrapper.start().unwrap();
        let exit_code = wrapper.wait().unwrap();
        assert_eq!(exit_code, 0);
        assert_eq!(wrapper.get_state(), LifecycleState::Completed);
    }

    #[tokio::test]
    async fn streamed_extractions_are_visible_on_the_shared_extractor() {
        let dir = tempdir().unwrap();
        let wrapper = ProcessWrapper::new(
            "agent-extract",
            dir.path(),
            None,
            "/bin/echo",
            &["tokens used 1,377".to_string()],
            None,
            None,
            None,
            extractor::DEFAULT_BATCH_SIZE,
            extractor::DEFAULT_FLUSH_INTERVAL,
        )
        .unwrap();

        wrapper.start().unwrap();
        wrapper.wait().unwrap();

        let ex = wrapper.extractor.lock().unwrap();
        assert_eq!(ex.match_count(), 1);
    }

    #[tokio::test]
    async fn s6_pause_resume_scenario() {
        let dir = tempdir().unwrap();
        let wrapper = ProcessWrapper::new(
            "agent-b",
            dir.path(),
            None,
            "/bin/sleep",
            &["2".to_string()],
            None,
            None,
            None,
            extractor::DEFAULT_BATCH_SIZE,
            extractor::DEFAULT_FLUSH_INTERVAL,
        )
        .unwrap();
        wrapper.start().unwrap();

        wrapper.pause().unwrap();
        assert!(wrapper.is_paused());
        assert!(wrapper.pause().is_ok()); // sending SIGSTOP again is harmless at this layer

        wrapper.resume().unwrap();
        assert!(!wrapper.is_paused());

        wrapper.stop().unwrap();
    }

    #[test]
    fn unknown_signal_name_rejected() {
        assert!(signal_from_name("SIGBOGUS").is_err());
        assert!(signal_from_name("SIGKILL").is_ok());
    }
}
