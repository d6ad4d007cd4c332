//! Individual agent session
//!
//! Owns one launched terminal agent and the single command spawned inside it.
//! Handles the full lifecycle: open, input routing, resize and cleanup.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::pty::{AgentConfig, AgentHandle, ChildHandle, PtyAgent, SpawnRequest, TerminalSize};

/// Size the agent is launched with; callers apply the real size right after open
pub const PLACEHOLDER_SIZE: TerminalSize = TerminalSize { cols: 40, rows: 40 };

/// Errors that can occur during agent session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to launch terminal agent: {0}")]
    AgentLaunch(String),

    #[error("Failed to open terminal endpoint: {0}")]
    HandleOpen(String),

    #[error("Failed to spawn command: {0}")]
    Spawn(String),

    #[error("Session closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Configuration for spawning a command in a new session
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Command line to run inside the terminal
    pub command_line: String,
    /// Working directory for the command
    pub working_dir: Option<PathBuf>,
}

impl SpawnConfig {
    /// Create a new spawn config
    pub fn new(command_line: impl Into<String>) -> Self {
        Self {
            command_line: command_line.into(),
            working_dir: None,
        }
    }

    /// Set the working directory
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Everything a session has acquired so far
///
/// Shared by the failure paths of `open` and by `close`, so every handle goes
/// through the same release routine.
#[derive(Default)]
struct Acquired {
    agent: Option<Box<dyn AgentHandle>>,
    input: Option<Box<dyn Write + Send>>,
    output: Option<Box<dyn Read + Send>>,
    child: Option<Box<dyn ChildHandle>>,
}

impl Acquired {
    /// Release the child and the agent
    fn release_processes(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.release() {
                debug!("Failed to release child process: {}", e);
            }
        }
        if let Some(mut agent) = self.agent.take() {
            if let Err(e) = agent.release() {
                debug!("Failed to release terminal agent: {}", e);
            }
        }
    }

    /// Release every acquired resource
    fn release(&mut self) {
        self.release_processes();
        if let Some(mut input) = self.input.take() {
            if let Err(e) = input.flush() {
                debug!("Failed to flush terminal input: {}", e);
            }
        }
        self.output = None;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A terminal agent plus the command running inside it
pub struct AgentSession {
    /// Unique identifier for this session
    id: Uuid,
    agent: Mutex<Option<Box<dyn AgentHandle>>>,
    input: Mutex<Option<Box<dyn Write + Send>>>,
    output: Mutex<Option<Box<dyn Read + Send>>>,
    child: Mutex<Option<Box<dyn ChildHandle>>>,
    /// Last size the agent accepted
    size: Mutex<TerminalSize>,
    closed: AtomicBool,
    /// Flips to `true` once `close` has run
    closed_tx: watch::Sender<bool>,
}

impl AgentSession {
    /// Launch an agent and spawn the configured command inside it
    ///
    /// Any resource acquired before a failing step is released before the
    /// error is returned.
    pub fn open(agent: &dyn PtyAgent, config: &SpawnConfig) -> SessionResult<Self> {
        let id = Uuid::new_v4();

        let mut handle = agent
            .launch(&AgentConfig::new(PLACEHOLDER_SIZE))
            .map_err(|e| SessionError::AgentLaunch(e.message().to_string()))?;

        let request = SpawnRequest {
            command_line: config.command_line.clone(),
            working_dir: config.working_dir.clone(),
            auto_shutdown: true,
        };

        let mut acquired = Acquired::default();
        let child = match Self::acquire(handle.as_mut(), &request, &mut acquired) {
            Ok(child) => child,
            Err(e) => {
                acquired.agent = Some(handle);
                acquired.release();
                return Err(e);
            }
        };

        info!(
            "Session {} spawned `{}` (pid {:?})",
            id,
            config.command_line,
            child.process_id()
        );

        Ok(Self {
            id,
            agent: Mutex::new(Some(handle)),
            input: Mutex::new(acquired.input.take()),
            output: Mutex::new(acquired.output.take()),
            child: Mutex::new(Some(child)),
            size: Mutex::new(PLACEHOLDER_SIZE),
            closed: AtomicBool::new(false),
            closed_tx: watch::Sender::new(false),
        })
    }

    /// Open both endpoints and spawn the command, recording each acquisition
    fn acquire(
        handle: &mut dyn AgentHandle,
        request: &SpawnRequest,
        acquired: &mut Acquired,
    ) -> SessionResult<Box<dyn ChildHandle>> {
        let input = handle
            .open_input()
            .map_err(|e| SessionError::HandleOpen(format!("input: {}", e)))?;
        acquired.input = Some(input);

        let output = handle
            .open_output()
            .map_err(|e| SessionError::HandleOpen(format!("output: {}", e)))?;
        acquired.output = Some(output);

        handle
            .spawn(request)
            .map_err(|e| SessionError::Spawn(e.message().to_string()))
    }

    /// Get the session ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Get the last applied terminal size
    pub fn size(&self) -> TerminalSize {
        *lock(&self.size)
    }

    /// Check if the session has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait until the session has been closed
    ///
    /// Resolves immediately if it already is. Lets async consumers stop without
    /// depending on a blocked read ever returning.
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Hand the output endpoint to its reader
    ///
    /// Returns `None` once taken or after close. The reader owns the endpoint
    /// from then on and drops it when its read reports EOF.
    pub fn take_output(&self) -> Option<Box<dyn Read + Send>> {
        if self.is_closed() {
            return None;
        }
        lock(&self.output).take()
    }

    /// Write raw bytes to the terminal input
    pub fn write_input(&self, data: &[u8]) -> SessionResult<()> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let mut input = lock(&self.input);
        let writer = input.as_mut().ok_or(SessionError::Closed)?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    /// Resize the terminal viewport
    ///
    /// Zero dimensions are ignored. A rejection from the agent is logged and
    /// leaves the session running with its previous size.
    pub fn set_size(&self, cols: u16, rows: u16) {
        let size = TerminalSize::new(cols, rows);
        if size.is_empty() {
            debug!("Session {}: ignoring resize to {}x{}", self.id, cols, rows);
            return;
        }
        if self.is_closed() {
            return;
        }

        let mut agent = lock(&self.agent);
        let Some(agent) = agent.as_mut() else {
            return;
        };
        match agent.resize(size) {
            Ok(()) => {
                *lock(&self.size) = size;
                debug!("Session {} resized to {}x{}", self.id, cols, rows);
            }
            Err(e) => {
                warn!("Session {}: resize to {}x{} failed: {}", self.id, cols, rows, e);
            }
        }
    }

    /// Release every handle owned by the session
    ///
    /// Safe to call any number of times from any thread; only the first call
    /// does anything.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut acquired = Acquired {
            child: lock(&self.child).take(),
            agent: lock(&self.agent).take(),
            ..Acquired::default()
        };
        // A write stuck on a full input pipe only returns once the child is gone.
        acquired.release_processes();
        acquired.input = lock(&self.input).take();
        acquired.output = lock(&self.output).take();
        acquired.release();
        self.closed_tx.send_replace(true);

        info!("Session {} closed", self.id);
    }
}

impl Drop for AgentSession {
    fn drop(&mut self) {
        self.close();
    }
}


#[cfg(test)]
mod tests {
    use super::fake::{FailAt, FakeAgent, Tally};
    use super::*;
    use std::sync::Arc;

    fn open(agent: &FakeAgent) -> SessionResult<AgentSession> {
        AgentSession::open(agent, &SpawnConfig::new("cmd"))
    }

    #[test]
    fn test_spawn_config_new() {
        let config = SpawnConfig::new("powershell -NoLogo");
        assert_eq!(config.command_line, "powershell -NoLogo");
        assert!(config.working_dir.is_none());
    }

    #[test]
    fn test_spawn_config_with_working_dir() {
        let config = SpawnConfig::new("cmd").with_working_dir("/srv/app");
        assert_eq!(config.working_dir, Some(PathBuf::from("/srv/app")));
    }

    #[test]
    fn test_open_success() {
        let agent = FakeAgent::new();
        let session = open(&agent).unwrap();
        assert!(!session.is_closed());
        assert_eq!(session.size(), PLACEHOLDER_SIZE);
        assert_eq!(Tally::count(&agent.tally.launched), 1);
        assert_eq!(Tally::count(&agent.tally.agent_released), 0);
    }

    #[test]
    fn test_open_launch_failure() {
        let agent = FakeAgent::new().failing_at(FailAt::Launch);
        match open(&agent) {
            Err(SessionError::AgentLaunch(msg)) => assert_eq!(msg, "agent binary not found"),
            _ => panic!("Expected AgentLaunch error"),
        }
        assert_eq!(Tally::count(&agent.tally.agent_released), 0);
    }

    #[test]
    fn test_open_input_failure_releases_agent() {
        let agent = FakeAgent::new().failing_at(FailAt::Input);
        match open(&agent) {
            Err(SessionError::HandleOpen(msg)) => assert!(msg.contains("input pipe busy")),
            _ => panic!("Expected HandleOpen error"),
        }
        assert_eq!(Tally::count(&agent.tally.agent_released), 1);
    }

    #[test]
    fn test_open_output_failure_releases_agent_and_input() {
        let agent = FakeAgent::new().failing_at(FailAt::Output);
        match open(&agent) {
            Err(SessionError::HandleOpen(msg)) => assert!(msg.contains("output pipe busy")),
            _ => panic!("Expected HandleOpen error"),
        }
        assert_eq!(Tally::count(&agent.tally.agent_released), 1);
        assert_eq!(Tally::count(&agent.tally.input_dropped), 1);
    }

    #[test]
    fn test_open_spawn_failure_releases_everything() {
        let agent = FakeAgent::new().failing_at(FailAt::Spawn);
        match open(&agent) {
            Err(SessionError::Spawn(msg)) => assert_eq!(msg, "command not found"),
            _ => panic!("Expected Spawn error"),
        }
        assert_eq!(Tally::count(&agent.tally.agent_released), 1);
        assert_eq!(Tally::count(&agent.tally.input_dropped), 1);
        assert_eq!(Tally::count(&agent.tally.output_dropped), 1);
        assert_eq!(Tally::count(&agent.tally.child_released), 0);
    }

    #[test]
    fn test_close_is_idempotent() {
        let agent = FakeAgent::new();
        let session = open(&agent).unwrap();

        session.close();
        session.close();
        session.close();
        drop(session);

        let tally = &agent.tally;
        assert_eq!(Tally::count(&tally.agent_released), 1);
        assert_eq!(Tally::count(&tally.child_released), 1);
        assert_eq!(Tally::count(&tally.input_dropped), 1);
        assert_eq!(Tally::count(&tally.output_dropped), 1);
    }

    #[test]
    fn test_concurrent_close() {
        let agent = FakeAgent::new();
        let session = Arc::new(open(&agent).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let session = Arc::clone(&session);
                std::thread::spawn(move || session.close())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(session.is_closed());
        assert_eq!(Tally::count(&agent.tally.agent_released), 1);
        assert_eq!(Tally::count(&agent.tally.child_released), 1);
    }

    #[test]
    fn test_close_after_output_taken() {
        let agent = FakeAgent::new();
        let session = open(&agent).unwrap();
        let output = session.take_output();
        assert!(output.is_some());
        assert!(session.take_output().is_none());

        session.close();
        assert_eq!(Tally::count(&agent.tally.output_dropped), 0);
        drop(output);
        assert_eq!(Tally::count(&agent.tally.output_dropped), 1);
    }

    #[test]
    fn test_close_unblocks_output_reader() {
        let agent = FakeAgent::new();
        let session = open(&agent).unwrap();
        let mut output = session.take_output().unwrap();

        let reader = std::thread::spawn(move || {
            let mut buffer = [0u8; 16];
            output.read(&mut buffer).unwrap()
        });
        session.close();
        assert_eq!(reader.join().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_closed_resolves_on_close() {
        let agent = FakeAgent::new().holding_output_open();
        let session = Arc::new(open(&agent).unwrap());

        let waiter = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.closed().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        session.close();
        tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();

        // Already closed: resolves right away
        session.closed().await;
    }

    #[test]
    fn test_held_output_survives_release() {
        let agent = FakeAgent::new().holding_output_open();
        let session = open(&agent).unwrap();
        let mut output = session.take_output().unwrap();

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let mut buffer = [0u8; 16];
            let _ = done_tx.send(output.read(&mut buffer).ok());
        });
        session.close();
        assert!(done_rx
            .recv_timeout(std::time::Duration::from_millis(200))
            .is_err());

        drop(agent);
        assert_eq!(done_rx.recv().unwrap(), Some(0));
    }

    #[test]
    fn test_write_input() {
        let agent = FakeAgent::new();
        let session = open(&agent).unwrap();
        session.write_input(b"dir\r\n").unwrap();
        assert_eq!(agent.tally.written(), b"dir\r\n");
    }

    #[test]
    fn test_write_after_close() {
        let agent = FakeAgent::new();
        let session = open(&agent).unwrap();
        session.close();
        assert!(matches!(
            session.write_input(b"dir\r\n"),
            Err(SessionError::Closed)
        ));
        assert!(agent.tally.written().is_empty());
    }

    #[test]
    fn test_set_size() {
        let agent = FakeAgent::new();
        let session = open(&agent).unwrap();
        session.set_size(200, 60);
        assert_eq!(session.size(), TerminalSize::new(200, 60));
        assert_eq!(agent.tally.resizes(), vec![TerminalSize::new(200, 60)]);
    }

    #[test]
    fn test_zero_size_is_ignored() {
        let agent = FakeAgent::new();
        let session = open(&agent).unwrap();
        session.set_size(120, 40);

        session.set_size(0, 40);
        session.set_size(120, 0);
        session.set_size(0, 0);

        assert_eq!(session.size(), TerminalSize::new(120, 40));
        assert_eq!(agent.tally.resizes().len(), 1);
    }

    #[test]
    fn test_rejected_resize_is_not_fatal() {
        let agent = FakeAgent::new().failing_at(FailAt::Resize);
        let session = open(&agent).unwrap();
        session.set_size(120, 40);

        assert_eq!(session.size(), PLACEHOLDER_SIZE);
        assert!(!session.is_closed());
        assert!(session.write_input(b"x").is_ok());
    }

    #[test]
    fn test_resize_after_close_is_ignored() {
        let agent = FakeAgent::new();
        let session = open(&agent).unwrap();
        session.close();
        session.set_size(120, 40);
        assert!(agent.tally.resizes().is_empty());
    }
}
