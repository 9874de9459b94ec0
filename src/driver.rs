use crate::history::{FailureReason, History, IterationRecord, RunOutcome};
use crate::invoker::{AgentInvoker, Invoke, InvokeError, InvokeOptions};
use crate::lock::DirLock;
use crate::memory::{DEFAULT_RELEVANCE_THRESHOLD, MemoryProvider};
use crate::retry::{RetryPolicy, Verdict};
use chrono::{Local, NaiveDateTime};
use std::error::Error;
use std::fmt;
use std::fs;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const DEFAULT_MAX_ITERATIONS: u32 = 25;
pub const DEFAULT_EXIT_SIGNAL: &str = "EXIT_LOOP_NOW";
/// Task file written into the conversation directory; the agent re-reads it
/// through its own continuation mechanism on later iterations.
pub const PROMPT_FILE_NAME: &str = "USER_PROMPT.md";

const CONTINUATION_DIRECTIVE: &str =
    "Continue working on the task. Your previous output is already part of this conversation's context.";

#[derive(Debug)]
pub enum DriverError {
    DirectoryMissing(PathBuf),
    Io {
        path: PathBuf,
        source: io::Error,
    },
    InvalidInput(String),
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverError::DirectoryMissing(path) => {
                write!(f, "conversation directory does not exist: {}", path.display())
            }
            DriverError::Io { path, source } => {
                write!(f, "driver io error at {}: {}", path.display(), source)
            }
            DriverError::InvalidInput(message) => write!(f, "invalid input: {}", message),
        }
    }
}

impl Error for DriverError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DriverError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Cooperative cancellation flag shared between the caller and a running
/// driver. Checked before each child spawn, at sleep wakeups and between
/// iterations; a child already running is never killed.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    Elapsed,
    Cancelled,
}

/// Time source for the driver. All wall-clock reads and waits go through
/// this trait so retry timing is fully deterministic under test.
pub trait Clock {
    fn system_now(&self) -> SystemTime;
    fn local_now(&self) -> NaiveDateTime;
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> SleepOutcome;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn system_now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn local_now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> SleepOutcome {
        // Short slices keep cancellation responsive during long waits.
        let slice = Duration::from_millis(200);
        let mut remaining = duration;
        while !remaining.is_zero() {
            if cancel.is_cancelled() {
                return SleepOutcome::Cancelled;
            }
            let step = remaining.min(slice);
            std::thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
        if cancel.is_cancelled() {
            SleepOutcome::Cancelled
        } else {
            SleepOutcome::Elapsed
        }
    }
}

/// Requested verbosity; `Auto` resolves from terminal attachment once, at
/// driver construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    #[default]
    Auto,
    Quiet,
    Verbose,
}

impl Verbosity {
    fn resolve(self) -> bool {
        match self {
            Verbosity::Auto => io::stdout().is_terminal(),
            Verbosity::Quiet => false,
            Verbosity::Verbose => true,
        }
    }
}

/// Supervises one task: writes the task into the conversation directory,
/// invokes the agent in a bounded loop, waits out transient failures and
/// stops when the exit signal shows up in the agent's output.
pub struct Driver {
    system_prompt: String,
    conversation_dir: PathBuf,
    ephemeral: bool,
    max_iterations: u32,
    exit_signal: String,
    verbose: bool,
    cleanup: bool,
    retry_policy: RetryPolicy,
    invoker: Box<dyn Invoke>,
    clock: Box<dyn Clock>,
    memory: Option<Box<dyn MemoryProvider>>,
    memory_threshold: f64,
}

impl Driver {
    /// Driver over a caller-owned conversation directory, which must exist.
    pub fn new(
        system_prompt: impl Into<String>,
        conversation_dir: impl Into<PathBuf>,
    ) -> Result<Self, DriverError> {
        let conversation_dir = conversation_dir.into();
        if !conversation_dir.is_dir() {
            return Err(DriverError::DirectoryMissing(conversation_dir));
        }
        let conversation_dir =
            conversation_dir
                .canonicalize()
                .map_err(|source| DriverError::Io {
                    path: conversation_dir.clone(),
                    source,
                })?;
        Ok(Self::with_dir(system_prompt.into(), conversation_dir, false))
    }

    /// Driver over a synthesized temporary conversation directory, removed
    /// on every exit path.
    pub fn ephemeral(system_prompt: impl Into<String>) -> Result<Self, DriverError> {
        let conversation_dir = create_conversation_dir()?;
        let conversation_dir =
            conversation_dir
                .canonicalize()
                .map_err(|source| DriverError::Io {
                    path: conversation_dir.clone(),
                    source,
                })?;
        Ok(Self::with_dir(system_prompt.into(), conversation_dir, true))
    }

    fn with_dir(system_prompt: String, conversation_dir: PathBuf, ephemeral: bool) -> Self {
        Self {
            system_prompt,
            conversation_dir,
            ephemeral,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            exit_signal: DEFAULT_EXIT_SIGNAL.to_string(),
            verbose: Verbosity::Auto.resolve(),
            cleanup: false,
            retry_policy: RetryPolicy::default(),
            invoker: Box::new(AgentInvoker::new()),
            clock: Box::new(SystemClock),
            memory: None,
            memory_threshold: DEFAULT_RELEVANCE_THRESHOLD,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn with_exit_signal(mut self, exit_signal: impl Into<String>) -> Self {
        self.exit_signal = exit_signal.into();
        self
    }

    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbose = verbosity.resolve();
        self
    }

    pub fn with_cleanup(mut self, cleanup: bool) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_invoker(mut self, invoker: Box<dyn Invoke>) -> Self {
        self.invoker = invoker;
        self
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_memory(mut self, provider: Box<dyn MemoryProvider>, threshold: f64) -> Self {
        self.memory = Some(provider);
        self.memory_threshold = threshold;
        self
    }

    pub fn conversation_dir(&self) -> &Path {
        &self.conversation_dir
    }

    pub fn prompt_file_path(&self) -> PathBuf {
        self.conversation_dir.join(PROMPT_FILE_NAME)
    }

    /// Runs `task_text` to completion. Never fails across this boundary:
    /// every failure mode is reported inside the returned outcome.
    pub fn run(&self, task_text: &str, cancel: &CancelToken) -> RunOutcome {
        let run_start = self.clock.system_now();
        let mut history = History::new();
        let terminal = self.drive(task_text, cancel, &mut history);

        if self.cleanup && terminal.success {
            let prompt_path = self.prompt_file_path();
            if let Err(err) = fs::remove_file(&prompt_path) {
                eprintln!(
                    "Warning: failed to remove {}: {}",
                    prompt_path.display(),
                    err
                );
            }
        }
        if self.ephemeral {
            if let Err(err) = fs::remove_dir_all(&self.conversation_dir) {
                eprintln!(
                    "Warning: failed to remove {}: {}",
                    self.conversation_dir.display(),
                    err
                );
            }
        }

        let duration_seconds = self
            .clock
            .system_now()
            .duration_since(run_start)
            .unwrap_or_else(|_| Duration::from_secs(0))
            .as_secs_f64();

        if self.verbose {
            match (terminal.success, terminal.reason) {
                (true, _) => eprintln!("Done: {}", history.summary()),
                (false, Some(reason)) => {
                    eprintln!("Failed ({}): {}", reason.as_str(), history.summary())
                }
                (false, None) => eprintln!("Failed: {}", history.summary()),
            }
        }

        RunOutcome {
            success: terminal.success,
            iterations: history.len() as u32,
            output: terminal.output,
            duration_seconds,
            context: history.into_records(),
            reason: terminal.reason,
            error_detail: terminal.detail,
        }
    }

    fn drive(&self, task_text: &str, cancel: &CancelToken, history: &mut History) -> Terminal {
        if task_text.trim().is_empty() {
            return Terminal::failed(
                FailureReason::IoError,
                "task text is required".to_string(),
                String::new(),
            );
        }

        let _lock = match DirLock::acquire(&self.conversation_dir) {
            Ok(lock) => lock,
            Err(err) => {
                return Terminal::failed(FailureReason::IoError, err.to_string(), String::new());
            }
        };

        let system_prompt = self.effective_system_prompt(task_text);

        let prompt_path = self.prompt_file_path();
        if let Err(source) = fs::write(&prompt_path, task_text) {
            return Terminal::failed(
                FailureReason::IoError,
                format!("failed to write {}: {}", prompt_path.display(), source),
                String::new(),
            );
        }

        let mut last_output = String::new();
        for iteration in 1..=self.max_iterations {
            if cancel.is_cancelled() {
                return Terminal::cancelled(last_output);
            }
            if self.verbose {
                eprintln!("Iteration {}/{}", iteration, self.max_iterations);
            }

            let prompt_text = if iteration == 1 {
                format!(
                    "{}\n\nRead {} in the current directory and carry out the task it describes.",
                    system_prompt, PROMPT_FILE_NAME
                )
            } else {
                CONTINUATION_DIRECTIVE.to_string()
            };

            let started_at = self.clock.system_now();
            let mut attempt: u32 = 1;
            let invocation = loop {
                if cancel.is_cancelled() {
                    return Terminal::cancelled(last_output);
                }

                let invocation = match self.invoker.invoke(
                    &prompt_text,
                    &self.conversation_dir,
                    &InvokeOptions::default(),
                ) {
                    Ok(invocation) => invocation,
                    Err(InvokeError::AgentNotFound(program)) => {
                        return Terminal::failed(
                            FailureReason::ChildNotFound,
                            format!("agent executable not found: {}", program),
                            last_output,
                        );
                    }
                    Err(err) => {
                        return Terminal::failed(
                            FailureReason::IoError,
                            err.to_string(),
                            last_output,
                        );
                    }
                };

                match self.retry_policy.classify(
                    &invocation.stdout,
                    invocation.exit_code,
                    attempt,
                    self.clock.local_now(),
                ) {
                    Verdict::Done => break invocation,
                    Verdict::Wait { class, delay } => {
                        if self.verbose {
                            eprintln!(
                                "Waiting {}s before retry ({})",
                                delay.as_secs(),
                                class.as_str()
                            );
                        }
                        if self.clock.sleep(delay, cancel) == SleepOutcome::Cancelled {
                            return Terminal::cancelled(last_output);
                        }
                        attempt += 1;
                    }
                }
            };
            let ended_at = self.clock.system_now();

            history.add(IterationRecord {
                iteration,
                started_at,
                ended_at,
                stdout: invocation.stdout.clone(),
                exit_code: invocation.exit_code,
                retried: attempt - 1,
            });
            last_output = invocation.stdout;

            if last_output.contains(&self.exit_signal) {
                return Terminal::succeeded(last_output);
            }
        }

        Terminal::exhausted(last_output)
    }

    // Memory is consulted at most once per run; the recalled context only
    // augments the first iteration's system prompt.
    fn effective_system_prompt(&self, task_text: &str) -> String {
        let Some(provider) = self.memory.as_ref() else {
            return self.system_prompt.clone();
        };
        match provider.recall(task_text) {
            Some(recall) if recall.relevance >= self.memory_threshold => {
                if self.verbose {
                    eprintln!("Attached memory context (relevance {:.2})", recall.relevance);
                }
                format!("{}\n\n{}", self.system_prompt, recall.context)
            }
            _ => self.system_prompt.clone(),
        }
    }
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("conversation_dir", &self.conversation_dir)
            .field("ephemeral", &self.ephemeral)
            .field("max_iterations", &self.max_iterations)
            .field("exit_signal", &self.exit_signal)
            .field("cleanup", &self.cleanup)
            .finish_non_exhaustive()
    }
}

struct Terminal {
    success: bool,
    output: String,
    reason: Option<FailureReason>,
    detail: Option<String>,
}

impl Terminal {
    fn succeeded(output: String) -> Self {
        Self {
            success: true,
            output,
            reason: None,
            detail: None,
        }
    }

    fn exhausted(output: String) -> Self {
        Self {
            success: false,
            output,
            reason: Some(FailureReason::MaxIterations),
            detail: None,
        }
    }

    fn cancelled(output: String) -> Self {
        Self {
            success: false,
            output,
            reason: Some(FailureReason::Cancelled),
            detail: None,
        }
    }

    fn failed(reason: FailureReason, detail: String, output: String) -> Self {
        Self {
            success: false,
            output,
            reason: Some(reason),
            detail: Some(detail),
        }
    }
}

fn create_conversation_dir() -> Result<PathBuf, DriverError> {
    let base_dir = std::env::temp_dir();
    for attempt in 0..10u32 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0))
            .as_secs();
        let name = format!("atom-conv-{}-{}-{}", std::process::id(), now, attempt);
        let path = base_dir.join(name);
        match fs::create_dir(&path) {
            Ok(()) => return Ok(path),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(source) => return Err(DriverError::Io { path, source }),
        }
    }
    Err(DriverError::InvalidInput(
        "failed to create a conversation directory".to_string(),
    ))
}
