//! Runs external programs.
//!
//! Every disk and filesystem operation in stampr is delegated to an existing
//! tool (`parted`, `resize2fs`, `dd`, ...). The [`CommandRunner`] trait is the
//! single seam through which those tools are invoked, so the pipeline can be
//! exercised against a scripted fake in tests.

use crate::error::RunnerError;
use async_trait::async_trait;
use std::fmt;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info};

/// A single invocation of an external program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Text written to the program's stdin, which is then closed.
    pub stdin: Option<String>,
    /// Forward output to the log line by line while the program runs.
    pub stream: bool,
    /// Prefix for streamed log lines; the program name when unset.
    pub label: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            stream: false,
            label: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn streamed(mut self) -> Self {
        self.stream = true;
        self
    }

    /// Streams output with every line prefixed by `label`.
    pub fn streamed_as(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self.streamed()
    }

    fn log_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.program)
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// What a program left behind: its exit code and everything it printed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the program was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Convenience constructor, mostly for scripted runners.
    pub fn with_code(code: i32) -> Self {
        Self {
            code: Some(code),
            ..Self::default()
        }
    }

    pub fn ok_with_stdout(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// The captured stderr, trimmed, or a placeholder when the tool printed nothing.
    pub fn error_text(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            "(no output)"
        } else {
            stderr
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs a program to completion.
    ///
    /// A non-zero exit is *not* an error here; `Err` means the program could
    /// not be started or waited on.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunnerError>;

    /// Whether `program` can be found on `PATH`.
    fn locate(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

/// Runs `spec`, folding a failure to start the program into a
/// [`CommandOutput`] with no exit code and the error text as stderr.
///
/// Stage code only cares whether a tool succeeded and what it printed; this
/// keeps a missing binary from looking different to a failing one.
pub async fn invoke(runner: &dyn CommandRunner, spec: &CommandSpec) -> CommandOutput {
    match runner.run(spec).await {
        Ok(output) => output,
        Err(e) => CommandOutput {
            code: None,
            stdout: String::new(),
            stderr: e.to_string(),
        },
    }
}

/// Runs programs on the host with `tokio::process`.
#[derive(Clone, Debug, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunnerError> {
        debug!("Executing: {spec}");

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                program: spec.program.clone(),
                source,
            })?;

        if let (Some(input), Some(mut stdin)) = (spec.stdin.as_ref(), child.stdin.take()) {
            // A tool that exits before reading everything closes the pipe;
            // its exit code tells the real story.
            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                debug!("{}: stdin closed early: {e}", spec.program);
            }
            drop(stdin);
        }

        let stdout_buf = Arc::new(Mutex::new(String::new()));
        let stderr_buf = Arc::new(Mutex::new(String::new()));

        let label = spec.log_label().to_string();
        let stdout_task = child.stdout.take().map(|out| {
            tokio::spawn(drain(out, label.clone(), spec.stream, stdout_buf.clone()))
        });
        let stderr_task = child.stderr.take().map(|err| {
            tokio::spawn(drain(err, label.clone(), spec.stream, stderr_buf.clone()))
        });

        let status = child.wait().await.map_err(|source| RunnerError::Wait {
            program: spec.program.clone(),
            source,
        })?;

        for task in [stdout_task, stderr_task].into_iter().flatten() {
            let _ = task.await;
        }

        Ok(CommandOutput {
            code: status.code(),
            stdout: take_buffer(&stdout_buf),
            stderr: take_buffer(&stderr_buf),
        })
    }
}

fn take_buffer(buf: &Mutex<String>) -> String {
    match buf.lock() {
        Ok(mut guard) => std::mem::take(&mut *guard),
        Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
    }
}

/// Reads a pipe to the end, capturing everything and optionally logging
/// each line. `dd status=progress` redraws with `\r`, so both `\r` and `\n`
/// end a line.
async fn drain<R>(mut reader: R, label: String, stream: bool, sink: Arc<Mutex<String>>)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    let mut pending = String::new();

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let text = String::from_utf8_lossy(&chunk[..n]);
        if let Ok(mut captured) = sink.lock() {
            captured.push_str(&text);
        }
        if !stream {
            continue;
        }

        pending.push_str(&text);
        while let Some(idx) = pending.find(['\r', '\n']) {
            let line: String = pending.drain(..=idx).collect();
            let line = line.trim();
            if !line.is_empty() {
                info!("{label}: {line}");
            }
        }
    }

    if stream {
        let line = pending.trim();
        if !line.is_empty() {
            info!("{label}: {line}");
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! A scripted [`CommandRunner`] for tests.

    use super::*;
    use std::collections::{HashMap, HashSet, VecDeque};

    /// Returns queued outputs per program (falling back to a plain success)
    /// and records every invocation in order.
    #[derive(Default)]
    pub(crate) struct FakeRunner {
        calls: Mutex<Vec<CommandSpec>>,
        script: Mutex<HashMap<String, VecDeque<CommandOutput>>>,
        missing: Mutex<HashSet<String>>,
        unspawnable: Mutex<HashSet<String>>,
        panicking: Mutex<HashSet<String>>,
    }

    impl FakeRunner {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        /// Queues `output` for the next call to `program`.
        pub(crate) fn push(&self, program: &str, output: CommandOutput) -> &Self {
            self.script
                .lock()
                .unwrap()
                .entry(program.to_string())
                .or_default()
                .push_back(output);
            self
        }

        pub(crate) fn fail(&self, program: &str, code: i32) -> &Self {
            self.push(
                program,
                CommandOutput {
                    code: Some(code),
                    stdout: String::new(),
                    stderr: format!("{program}: simulated failure"),
                },
            )
        }

        /// Makes `locate(program)` report the program as absent.
        pub(crate) fn hide(&self, program: &str) -> &Self {
            self.missing.lock().unwrap().insert(program.to_string());
            self
        }

        /// Makes every call to `program` fail to spawn.
        pub(crate) fn break_spawn(&self, program: &str) -> &Self {
            self.unspawnable
                .lock()
                .unwrap()
                .insert(program.to_string());
            self
        }

        /// Makes every call to `program` panic, as a bug in a stage would.
        pub(crate) fn panic_on(&self, program: &str) -> &Self {
            self.panicking.lock().unwrap().insert(program.to_string());
            self
        }

        pub(crate) fn calls(&self) -> Vec<CommandSpec> {
            self.calls.lock().unwrap().clone()
        }

        pub(crate) fn programs(&self) -> Vec<String> {
            self.calls().into_iter().map(|c| c.program).collect()
        }

        pub(crate) fn count(&self, program: &str) -> usize {
            self.calls()
                .iter()
                .filter(|c| c.program == program)
                .count()
        }

        /// Position of the first call whose program and leading args match.
        pub(crate) fn position(&self, program: &str, leading: &[&str]) -> Option<usize> {
            self.calls().iter().position(|c| {
                c.program == program
                    && c.args.len() >= leading.len()
                    && c.args.iter().zip(leading).all(|(a, b)| a == b)
            })
        }
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunnerError> {
            self.calls.lock().unwrap().push(spec.clone());

            let panics = self.panicking.lock().unwrap().contains(&spec.program);
            if panics {
                panic!("{} blew up", spec.program);
            }

            if self.unspawnable.lock().unwrap().contains(&spec.program) {
                return Err(RunnerError::Spawn {
                    program: spec.program.clone(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                });
            }

            let queued = self
                .script
                .lock()
                .unwrap()
                .get_mut(&spec.program)
                .and_then(VecDeque::pop_front);
            Ok(queued.unwrap_or_else(|| CommandOutput::with_code(0)))
        }

        fn locate(&self, program: &str) -> bool {
            !self.missing.lock().unwrap().contains(program)
        }
    }
}
