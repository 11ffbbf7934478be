use crate::error::{CraftsbotError, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::LazyLock;
use std::thread;

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").unwrap());

/// An external command to run: program, arguments, working directory and
/// extra environment on top of the inherited one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            env: BTreeMap::new(),
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

    pub fn current_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn envs(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stdout => f.write_str("STDOUT"),
            StreamKind::Stderr => f.write_str("STDERR"),
        }
    }
}

/// Exit status and captured, ANSI-stripped output of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub lines: Vec<(StreamKind, String)>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn describe_status(&self) -> String {
        match self.code {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Seam for running external commands so plans can be executed without Docker.
pub trait CommandRunner: Send + Sync {
    /// Run to completion. `Err` only when the command could not be started;
    /// a non-zero exit is reported through [`CommandOutput::code`].
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput>;
}

/// Runs commands on the host, streaming their output into the log.
#[derive(Debug, Default)]
pub struct SystemCommandRunner;

impl SystemCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for SystemCommandRunner {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        tracing::info!("Executing: {}", invocation);

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &invocation.current_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| CraftsbotError::CommandSpawn {
            command: invocation.to_string(),
            source,
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // stderr is drained on its own thread so neither pipe can fill up and block the child
        let (mut lines, stderr_lines) = thread::scope(|scope| {
            let stderr_handle =
                scope.spawn(move || stderr.map(|s| read_lines(s, StreamKind::Stderr)));
            let stdout_lines = stdout
                .map(|s| read_lines(s, StreamKind::Stdout))
                .unwrap_or_default();
            let stderr_lines = stderr_handle.join().ok().flatten().unwrap_or_default();
            (stdout_lines, stderr_lines)
        });
        lines.extend(stderr_lines);

        let status = child.wait()?;

        Ok(CommandOutput {
            code: status.code(),
            lines,
        })
    }
}

fn read_lines<R: Read>(reader: R, kind: StreamKind) -> Vec<(StreamKind, String)> {
    let mut lines = Vec::new();
    for chunk in BufReader::new(reader).split(b'\n') {
        let Ok(chunk) = chunk else { break };
        let line = strip_ansi(String::from_utf8_lossy(&chunk).trim_end_matches('\r'));
        match kind {
            StreamKind::Stdout => tracing::debug!("{}: {}", kind, line),
            StreamKind::Stderr => tracing::warn!("{}: {}", kind, line),
        }
        lines.push((kind, line));
    }
    lines
}

pub fn strip_ansi(line: &str) -> String {
    ANSI_ESCAPE.replace_all(line, "").into_owned()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_ansi_sequences() {
        assert_eq!(strip_ansi("\x1b[1;32mStep 1/3\x1b[0m : FROM alpine"), "Step 1/3 : FROM alpine");
    }

    #[test]
    fn displays_invocation() {
        let invocation = Invocation::new("docker")
            .args(["build", "-t", "alpine:3.14.2"])
            .arg(".");
        assert_eq!(invocation.to_string(), "docker build -t alpine:3.14.2 .");
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let err = SystemCommandRunner::new()
            .run(&Invocation::new("craftsbot-definitely-missing-binary"))
            .unwrap_err();
        assert!(matches!(err, CraftsbotError::CommandSpawn { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn captures_both_streams_and_exit_code() {
        let output = SystemCommandRunner::new()
            .run(&Invocation::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]))
            .unwrap();
        assert_eq!(output.code, Some(3));
        assert!(!output.success());
        assert!(output.lines.contains(&(StreamKind::Stdout, "out".to_string())));
        assert!(output.lines.contains(&(StreamKind::Stderr, "err".to_string())));
    }

    #[cfg(unix)]
    #[test]
    fn passes_extra_environment() {
        let mut env = BTreeMap::new();
        env.insert("CRAFTSBOT_TEST_VALUE".to_string(), "hello".to_string());
        let output = SystemCommandRunner::new()
            .run(&Invocation::new("sh").args(["-c", "echo $CRAFTSBOT_TEST_VALUE"]).envs(env))
            .unwrap();
        assert!(output.success());
        assert_eq!(output.lines, vec![(StreamKind::Stdout, "hello".to_string())]);
    }
}
