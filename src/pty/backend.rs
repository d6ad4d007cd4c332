//! Pseudo-terminal agent contract
//!
//! The session layer only talks to a terminal agent through these traits, so the
//! concrete backend (portable-pty in production, in-memory fakes in tests) is
//! chosen once at startup and passed in explicitly.

use std::io::{Read, Write};
use std::path::PathBuf;
use thiserror::Error;

/// Error reported by a terminal agent
///
/// Carries the agent's own diagnostic message so callers can fold it into
/// their own error values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct AgentError {
    message: String,
}

impl AgentError {
    /// Create a new agent error from a diagnostic message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Human-readable diagnostic message
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Result type for agent operations
pub type AgentResult<T> = Result<T, AgentError>;

/// Terminal size configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl TerminalSize {
    /// Create a new terminal size
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Whether either dimension is zero
    pub fn is_empty(&self) -> bool {
        self.cols == 0 || self.rows == 0
    }
}

/// Configuration used to launch an agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Viewport size the agent starts with
    pub initial_size: TerminalSize,
}

impl AgentConfig {
    pub fn new(initial_size: TerminalSize) -> Self {
        Self { initial_size }
    }
}

/// Request to start a command inside a launched agent
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Full command line, program first
    pub command_line: String,
    /// Working directory for the child, inherited when `None`
    pub working_dir: Option<PathBuf>,
    /// Shut the agent down once the child is released
    pub auto_shutdown: bool,
}

/// Entry point of a terminal agent binding
pub trait PtyAgent: Send + Sync {
    /// Start a new agent with the given configuration
    fn launch(&self, config: &AgentConfig) -> AgentResult<Box<dyn AgentHandle>>;
}

/// A running terminal agent
pub trait AgentHandle: Send {
    /// Open the agent's input endpoint for exclusive writing
    fn open_input(&mut self) -> AgentResult<Box<dyn Write + Send>>;

    /// Open the agent's output endpoint for exclusive reading
    fn open_output(&mut self) -> AgentResult<Box<dyn Read + Send>>;

    /// Spawn a command attached to the emulated terminal
    fn spawn(&mut self, request: &SpawnRequest) -> AgentResult<Box<dyn ChildHandle>>;

    /// Resize the terminal viewport
    fn resize(&mut self, size: TerminalSize) -> AgentResult<()>;

    /// Release the agent and everything it still owns
    fn release(&mut self) -> AgentResult<()>;
}

/// The child command running inside an agent
pub trait ChildHandle: Send {
    /// OS process id, when the backend exposes one
    fn process_id(&self) -> Option<u32>;

    /// Release the child process handle
    fn release(&mut self) -> AgentResult<()>;
}
