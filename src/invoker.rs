use crate::config::Config;
use std::error::Error;
use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;

pub const DEFAULT_AGENT_COMMAND: &str = "claude";

#[derive(Debug)]
pub enum InvokeError {
    DirectoryMissing(PathBuf),
    AgentNotFound(String),
    InvalidCommand(String),
    Capture(String),
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl fmt::Display for InvokeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvokeError::DirectoryMissing(path) => {
                write!(f, "conversation directory does not exist: {}", path.display())
            }
            InvokeError::AgentNotFound(program) => {
                write!(f, "agent executable not found: {}", program)
            }
            InvokeError::InvalidCommand(message) => {
                write!(f, "invalid agent command: {}", message)
            }
            InvokeError::Capture(message) => write!(f, "output capture failed: {}", message),
            InvokeError::Io { path, source } => {
                write!(f, "agent io error at {}: {}", path.display(), source)
            }
        }
    }
}

impl Error for InvokeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            InvokeError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// One completed child invocation. The captured stream interleaves the
/// child's stderr into stdout so failure notices printed on either reach
/// the retry classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub stdout: String,
    pub exit_code: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct InvokeOptions {
    /// Pass `-c` so the agent continues the conversation keyed on the
    /// working directory.
    pub use_context: bool,
    pub skip_permissions: bool,
}

impl Default for InvokeOptions {
    fn default() -> Self {
        Self {
            use_context: true,
            skip_permissions: true,
        }
    }
}

pub trait Invoke {
    fn invoke(
        &self,
        prompt: &str,
        conversation_dir: &Path,
        options: &InvokeOptions,
    ) -> Result<Invocation, InvokeError>;
}

/// Spawns the external agent CLI and captures its combined output. Stateless:
/// conversation continuity lives entirely in the agent's working directory.
#[derive(Debug, Clone)]
pub struct AgentInvoker {
    program: String,
    leading_args: Vec<String>,
}

impl AgentInvoker {
    pub fn new() -> Self {
        Self {
            program: DEFAULT_AGENT_COMMAND.to_string(),
            leading_args: Vec::new(),
        }
    }

    /// Builds an invoker from a shell-style command string, e.g.
    /// `"claude --model sonnet"`. The first word is the program, the rest
    /// become leading arguments.
    pub fn with_command(command: &str) -> Result<Self, InvokeError> {
        let mut parts = shell_words::split(command)
            .map_err(|err| InvokeError::InvalidCommand(err.to_string()))?;
        if parts.is_empty() {
            return Err(InvokeError::InvalidCommand(
                "agent command is empty".to_string(),
            ));
        }
        let program = parts.remove(0);
        Ok(Self {
            program,
            leading_args: parts,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, InvokeError> {
        match config.get("agent.command") {
            Some(command) if !command.trim().is_empty() => Self::with_command(&command),
            _ => Ok(Self::new()),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Default for AgentInvoker {
    fn default() -> Self {
        Self::new()
    }
}

impl Invoke for AgentInvoker {
    fn invoke(
        &self,
        prompt: &str,
        conversation_dir: &Path,
        options: &InvokeOptions,
    ) -> Result<Invocation, InvokeError> {
        if !conversation_dir.is_dir() {
            return Err(InvokeError::DirectoryMissing(
                conversation_dir.to_path_buf(),
            ));
        }

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args);
        cmd.current_dir(conversation_dir);
        if options.use_context {
            cmd.arg("-c");
        }
        cmd.arg("-p").arg(prompt);
        if options.skip_permissions {
            cmd.arg("--dangerously-skip-permissions");
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                InvokeError::AgentNotFound(self.program.clone())
            } else {
                InvokeError::Io {
                    path: PathBuf::from(&self.program),
                    source,
                }
            }
        })?;

        let stdout = capture_merged_output(&mut child)?;
        let status = child.wait().map_err(|source| InvokeError::Io {
            path: PathBuf::from(&self.program),
            source,
        })?;

        Ok(Invocation {
            stdout,
            exit_code: status.code().unwrap_or(-1),
        })
    }
}

fn capture_merged_output(child: &mut Child) -> Result<String, InvokeError> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| InvokeError::Capture("failed to capture stdout".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| InvokeError::Capture("failed to capture stderr".to_string()))?;

    let (tx, rx) = mpsc::channel();
    let stdout_handle = spawn_reader(stdout, tx.clone());
    let stderr_handle = spawn_reader(stderr, tx);

    let mut captured = String::new();
    for line in rx {
        captured.push_str(&line);
    }

    let _ = stdout_handle.join();
    let _ = stderr_handle.join();

    Ok(captured)
}

fn spawn_reader<R: Read + Send + 'static>(
    reader: R,
    sender: mpsc::Sender<String>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut buffer = Vec::new();
        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buffer).to_string();
                    if sender.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    })
}
