//! Subprocess supervision for running bricks.
//!
//! A [`BrickProcess`] owns the OS process of one brick: its pipes, the
//! optional management console connection and, for privileged bricks, the
//! pid file used to signal the real program behind `sudo`.

use crate::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

/// Polling interval while waiting for a process to exit.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Privilege escalation details.
#[derive(Debug, Clone)]
pub struct SudoSpec {
    /// Escalation program and its arguments, e.g. `["sudo"]`.
    pub prefix: Vec<String>,
    /// Switch asking the program to write its pid (`-P`, `-pidfile`).
    pub pidfile_flag: String,
    pub pidfile: PathBuf,
}

/// Everything needed to start one brick process.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub brick: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub sudo: Option<SudoSpec>,
    /// Redirect stdout/stderr to this file instead of the log.
    pub output: Option<PathBuf>,
    /// Management socket to connect to once the process is up.
    pub console: Option<PathBuf>,
    pub console_retries: u32,
    pub console_backoff: Duration,
}

impl SpawnRequest {
    /// Program and arguments as run, including the escalation wrapper.
    pub fn command_line(&self) -> Vec<String> {
        let mut direct = vec![self.program.display().to_string()];
        direct.extend(self.args.iter().cloned());
        let Some(sudo) = &self.sudo else {
            return direct;
        };
        direct.push(sudo.pidfile_flag.clone());
        direct.push(sudo.pidfile.display().to_string());
        let quoted: Vec<String> = direct.iter().map(|a| shell_quote(a)).collect();
        let mut wrapped = sudo.prefix.clone();
        wrapped.extend(["sh".to_string(), "-c".to_string(), quoted.join(" ")]);
        wrapped
    }
}

/// Quote `arg` for `sh -c`.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,+@%".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

/// A running brick process.
#[derive(Debug)]
pub struct BrickProcess {
    brick: String,
    child: Child,
    sudo: Option<SudoSpec>,
    console: Option<UnixStream>,
    started_at: DateTime<Utc>,
}

impl BrickProcess {
    /// Spawn the process and connect to its management console.
    ///
    /// Console connection failures are logged; the process keeps running
    /// without one.
    pub fn spawn(req: SpawnRequest) -> Result<Self> {
        let argv = req.command_line();
        tracing::info!(brick = %req.brick, command = %argv.join(" "), "Starting brick process");

        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]).stdin(Stdio::piped());
        match &req.output {
            Some(path) => {
                let file = std::fs::File::create(path)?;
                command.stdout(file.try_clone()?).stderr(file);
            }
            None => {
                command.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
        }

        let mut child = command.spawn().map_err(|source| CoreError::Spawn {
            program: argv[0].clone(),
            source,
        })?;
        let pid = child.id();

        if let Some(out) = child.stdout.take() {
            drain(&req.brick, "stdout", out);
        }
        if let Some(err) = child.stderr.take() {
            drain(&req.brick, "stderr", err);
        }

        let console = req
            .console
            .as_deref()
            .and_then(|path| connect_console(&req.brick, path, req.console_retries, req.console_backoff));

        tracing::info!(brick = %req.brick, pid, console = console.is_some(), "Brick process started");
        Ok(Self {
            brick: req.brick,
            child,
            sudo: req.sudo,
            console,
            started_at: Utc::now(),
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn has_console(&self) -> bool {
        self.console.is_some()
    }

    /// Send a management command, one line per `\n`.
    pub fn send_console(&mut self, command: &str) -> Result<()> {
        let Some(console) = self.console.as_mut() else {
            return Err(CoreError::NotFound(format!("console of {}", self.brick)));
        };
        console.write_all(command.as_bytes())?;
        console.write_all(b"\n")?;
        tracing::debug!(brick = %self.brick, command, "Console command sent");
        Ok(())
    }

    /// Exit status if the process has already exited.
    pub fn try_wait(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Stop the process and wait for it.
    ///
    /// Sends SIGTERM, polls until `timeout`, then sends SIGKILL.
    pub fn terminate(mut self, timeout: Duration) -> Result<Option<ExitStatus>> {
        self.console.take();
        if let Some(status) = self.try_wait() {
            self.cleanup();
            return Ok(Some(status));
        }

        self.signal(Signal::SIGTERM);
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(status) = self.try_wait() {
                tracing::info!(brick = %self.brick, %status, "Brick process exited");
                self.cleanup();
                return Ok(Some(status));
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        tracing::warn!(brick = %self.brick, pid = self.pid(), "Brick process ignored SIGTERM, killing");
        self.signal(Signal::SIGKILL);
        if self.sudo.is_none() {
            let _ = self.child.kill();
        }
        let status = self.child.wait()?;
        self.cleanup();
        Ok(Some(status))
    }

    fn signal(&self, sig: Signal) {
        match &self.sudo {
            Some(sudo) => {
                let target = read_pidfile(&sudo.pidfile).unwrap_or_else(|| self.child.id());
                let mut argv = sudo.prefix.clone();
                argv.extend([
                    "kill".to_string(),
                    format!("-{}", sig.as_str().trim_start_matches("SIG")),
                    target.to_string(),
                ]);
                if let Err(e) = run_host_command(&self.brick, &argv) {
                    tracing::warn!(brick = %self.brick, error = %e, "Privileged kill failed");
                }
            }
            None => {
                let pid = Pid::from_raw(self.child.id() as i32);
                if let Err(e) = signal::kill(pid, sig) {
                    tracing::debug!(brick = %self.brick, signal = %sig, error = %e, "Signal not delivered");
                }
            }
        }
    }

    fn cleanup(&mut self) {
        if let Some(sudo) = &self.sudo {
            let _ = std::fs::remove_file(&sudo.pidfile);
        }
    }
}

fn read_pidfile(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Log every line the process writes on one of its pipes.
fn drain(brick: &str, stream: &'static str, pipe: impl Read + Send + 'static) {
    let brick = brick.to_string();
    std::thread::spawn(move || {
        for line in BufReader::new(pipe).lines() {
            match line {
                Ok(line) => tracing::debug!(brick = %brick, stream, "{line}"),
                Err(_) => break,
            }
        }
    });
}

/// Connect to a management socket, doubling the delay between attempts.
fn connect_console(brick: &str, path: &Path, retries: u32, backoff: Duration) -> Option<UnixStream> {
    let mut delay = backoff;
    for attempt in 1..=retries {
        std::thread::sleep(delay);
        match UnixStream::connect(path) {
            Ok(stream) => {
                tracing::debug!(brick, path = %path.display(), attempt, "Console connected");
                return Some(stream);
            }
            Err(e) => {
                tracing::trace!(brick, attempt, error = %e, "Console not ready");
                delay *= 2;
            }
        }
    }
    tracing::warn!(brick, path = %path.display(), retries, "Console unavailable");
    None
}

/// Run a host command to completion, logging its outcome.
pub fn run_host_command(brick: &str, argv: &[String]) -> Result<ExitStatus> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| CoreError::invalid_value("command", "empty command line"))?;
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .status()
        .map_err(|source| CoreError::Spawn {
            program: program.clone(),
            source,
        })?;
    if status.success() {
        tracing::debug!(brick, command = %argv.join(" "), "Host command done");
    } else {
        tracing::warn!(brick, command = %argv.join(" "), %status, "Host command failed");
    }
    Ok(status)
}
