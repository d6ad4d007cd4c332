//! Native terminal agent backed by portable-pty
//!
//! Uses ConPTY on Windows and openpty on Unix. With auto-shutdown the slave side
//! is dropped as soon as the child is spawned, so the master reader reports EOF
//! (or EIO) once the child is gone; killing the child on release is what
//! unblocks a pending read. Without it the reader stays open until the agent
//! itself is released.

use portable_pty::{
    native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize, SlavePty,
};
use std::ffi::OsString;
use std::io::{Read, Write};
use tracing::debug;

use super::backend::{
    AgentConfig, AgentError, AgentHandle, AgentResult, ChildHandle, PtyAgent, SpawnRequest,
    TerminalSize,
};

fn to_pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn agent_error<E: std::fmt::Display>(error: E) -> AgentError {
    AgentError::new(error.to_string())
}

/// Terminal agent using the platform's native PTY system
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePtyAgent;

impl NativePtyAgent {
    pub fn new() -> Self {
        Self
    }
}

impl PtyAgent for NativePtyAgent {
    fn launch(&self, config: &AgentConfig) -> AgentResult<Box<dyn AgentHandle>> {
        let pair = native_pty_system()
            .openpty(to_pty_size(config.initial_size))
            .map_err(agent_error)?;

        Ok(Box::new(NativeAgentHandle {
            master: Some(pair.master),
            slave: Some(pair.slave),
            spawned: false,
        }))
    }
}

/// A launched native PTY pair
struct NativeAgentHandle {
    master: Option<Box<dyn MasterPty + Send>>,
    /// Kept after spawn only when the agent must outlive its child
    slave: Option<Box<dyn SlavePty + Send>>,
    spawned: bool,
}

impl NativeAgentHandle {
    fn master(&self) -> AgentResult<&(dyn MasterPty + Send)> {
        self.master
            .as_deref()
            .ok_or_else(|| AgentError::new("terminal agent already released"))
    }
}

impl AgentHandle for NativeAgentHandle {
    fn open_input(&mut self) -> AgentResult<Box<dyn Write + Send>> {
        self.master()?.take_writer().map_err(agent_error)
    }

    fn open_output(&mut self) -> AgentResult<Box<dyn Read + Send>> {
        self.master()?.try_clone_reader().map_err(agent_error)
    }

    fn spawn(&mut self, request: &SpawnRequest) -> AgentResult<Box<dyn ChildHandle>> {
        if self.spawned {
            return Err(AgentError::new("terminal agent already has a child"));
        }
        let argv = split_command_line(&request.command_line)?;

        let mut cmd = CommandBuilder::from_argv(argv.into_iter().map(OsString::from).collect());
        if let Some(dir) = &request.working_dir {
            cmd.cwd(dir);
        }

        let slave = self
            .slave
            .as_ref()
            .ok_or_else(|| AgentError::new("terminal agent already released"))?;
        let child = slave.spawn_command(cmd).map_err(agent_error)?;
        self.spawned = true;

        if request.auto_shutdown {
            // With only the child holding the slave side, reads end when it exits.
            self.slave = None;
        }

        Ok(Box::new(NativeChild { child }))
    }

    fn resize(&mut self, size: TerminalSize) -> AgentResult<()> {
        self.master()?
            .resize(to_pty_size(size))
            .map_err(agent_error)
    }

    fn release(&mut self) -> AgentResult<()> {
        if self.master.is_none() {
            return Err(AgentError::new("terminal agent already released"));
        }
        debug!(
            holding_slave = self.slave.is_some(),
            "Releasing native PTY"
        );
        self.slave = None;
        self.master = None;
        Ok(())
    }
}

/// Split a command line into program and arguments
///
/// POSIX shell quoting applies on Unix. On Windows the line is split with the
/// rules `CommandLineToArgvW` uses, which portable-pty's own quoting reverses,
/// so the child sees the arguments the line was written with.
fn split_command_line(line: &str) -> AgentResult<Vec<String>> {
    #[cfg(windows)]
    let argv = split_windows_command_line(line);
    #[cfg(not(windows))]
    let argv = shell_words::split(line)
        .map_err(|e| AgentError::new(format!("invalid command line `{}`: {}", line, e)))?;

    if argv.is_empty() {
        return Err(AgentError::new("command line is empty"));
    }
    Ok(argv)
}

#[cfg(any(windows, test))]
fn split_windows_command_line(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                let mut backslashes = 1;
                while chars.peek() == Some(&'\\') {
                    chars.next();
                    backslashes += 1;
                }
                if chars.peek() == Some(&'"') {
                    // 2n backslashes before a quote are n literal ones; an odd
                    // count escapes the quote itself.
                    current.push_str(&"\\".repeat(backslashes / 2));
                    if backslashes % 2 == 1 {
                        chars.next();
                        current.push('"');
                    }
                } else {
                    current.push_str(&"\\".repeat(backslashes));
                }
                in_arg = true;
            }
            '"' => {
                if in_quotes && chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = !in_quotes;
                }
                in_arg = true;
            }
            ' ' | '\t' if !in_quotes => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            _ => {
                current.push(c);
                in_arg = true;
            }
        }
    }
    if in_arg {
        args.push(current);
    }
    args
}

/// Child process spawned on a native PTY
struct NativeChild {
    child: Box<dyn Child + Send + Sync>,
}

impl ChildHandle for NativeChild {
    fn process_id(&self) -> Option<u32> {
        self.child.process_id()
    }

    fn release(&mut self) -> AgentResult<()> {
        if let Ok(Some(status)) = self.child.try_wait() {
            debug!("Child already exited: {:?}", status);
            return Ok(());
        }
        self.child.kill().map_err(agent_error)?;
        // Reap if it is already gone; a still-running child is left to the OS.
        let _ = self.child.try_wait();
        Ok(())
    }
}


#[cfg(test)]
mod command_line_tests {
    use super::*;

    fn split(line: &str) -> Vec<String> {
        split_windows_command_line(line)
    }

    #[test]
    fn test_windows_plain_words() {
        assert_eq!(split("cmd /k  dir"), vec!["cmd", "/k", "dir"]);
    }

    #[test]
    fn test_windows_quoted_argument() {
        assert_eq!(
            split(r#"powershell -Command "Get-Date; ls""#),
            vec!["powershell", "-Command", "Get-Date; ls"]
        );
        assert_eq!(
            split(r#""C:\Program Files\app.exe" --flag"#),
            vec![r"C:\Program Files\app.exe", "--flag"]
        );
    }

    #[test]
    fn test_windows_backslashes_before_quotes() {
        assert_eq!(split(r#"a\"b"#), vec![r#"a"b"#]);
        assert_eq!(split(r#""a\\" b"#), vec![r"a\", "b"]);
        assert_eq!(split(r"C:\dir\ x"), vec![r"C:\dir\", "x"]);
    }

    #[test]
    fn test_windows_empty_quoted_argument() {
        assert_eq!(split(r#"app "" last"#), vec!["app", "", "last"]);
    }

    #[test]
    fn test_empty_command_line_is_rejected() {
        assert!(split_command_line("   ").is_err());
        assert!(split("  \t ").is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_posix_quoting() {
        assert_eq!(
            split_command_line(r#"sh -c "echo 'hi there'""#).unwrap(),
            vec!["sh", "-c", "echo 'hi there'"]
        );
    }
}
