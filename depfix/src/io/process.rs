//! Child process execution with timeouts and bounded output.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// stdout followed by stderr, lossily decoded, with truncation notices.
    ///
    /// Installers split diagnostics across both streams, so classification
    /// always works on the combined text.
    pub fn combined_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        if self.stdout_truncated > 0 {
            text.push_str(&format!(
                "\n[stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&String::from_utf8_lossy(&self.stderr));
        }
        if self.stderr_truncated > 0 {
            text.push_str(&format!(
                "\n[stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        text
    }
}

/// Bytes kept from one output stream plus the count of bytes dropped past the limit.
#[derive(Debug, Default)]
struct Capture {
    kept: Vec<u8>,
    dropped: usize,
}

impl Capture {
    fn absorb(&mut self, chunk: &[u8], limit: usize) {
        let room = limit.saturating_sub(self.kept.len());
        let take = chunk.len().min(room);
        self.kept.extend_from_slice(&chunk[..take]);
        self.dropped += chunk.len() - take;
    }
}

/// Drains a pipe on its own thread so a chatty child never blocks on a full buffer.
struct Drain(thread::JoinHandle<Result<Capture>>);

impl Drain {
    fn start<R: Read + Send + 'static>(source: Option<R>, name: &'static str, limit: usize) -> Result<Self> {
        let mut source = source.ok_or_else(|| anyhow!("{name} is not piped"))?;
        Ok(Self(thread::spawn(move || {
            let mut capture = Capture::default();
            let mut block = [0u8; 8192];
            loop {
                let read = source
                    .read(&mut block)
                    .with_context(|| format!("read child {name}"))?;
                if read == 0 {
                    return Ok(capture);
                }
                capture.absorb(&block[..read], limit);
            }
        })))
    }

    fn finish(self, name: &str) -> Result<Capture> {
        self.0
            .join()
            .map_err(|_| anyhow!("{name} drain thread panicked"))?
    }
}

/// Kill the child and whatever it started.
///
/// On unix the child leads its own process group, so grandchildren still
/// holding the output pipes are killed too and the drains can finish.
fn kill_tree(child: &mut Child, program: &str) -> Result<()> {
    #[cfg(unix)]
    {
        let group = format!("-{}", child.id());
        match Command::new("kill")
            .args(["-KILL", "--", &group])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) if status.success() => return Ok(()),
            Ok(status) => warn!(%program, ?status, "process group kill failed"),
            Err(err) => warn!(%err, %program, "process group kill failed"),
        }
    }
    child.kill().with_context(|| format!("kill {program}"))
}

/// Spawn `cmd`, optionally feed it `stdin`, and wait at most `timeout` for it to exit.
///
/// At most `output_limit_bytes` per stream are kept; the rest is counted and
/// discarded. A child still running at the deadline is killed together with
/// its process group and reported with `timed_out = true` rather than as an
/// error.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes = output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!(%program, "spawning child process");
    let mut child = cmd.spawn().map_err(|err| {
        error!(%err, %program, "failed to spawn command");
        anyhow::Error::new(err).context(format!("spawn {program}"))
    })?;

    let out_drain = Drain::start(child.stdout.take(), "stdout", output_limit_bytes)?;
    let err_drain = Drain::start(child.stderr.take(), "stderr", output_limit_bytes)?;

    if let Some(input) = stdin
        && let Some(mut pipe) = child.stdin.take()
    {
        // A child that exits without reading stdin closes the pipe early.
        if let Err(err) = pipe.write_all(input) {
            warn!(%err, %program, "child did not accept all of stdin");
        }
    }

    let (status, timed_out) = match child
        .wait_timeout(timeout)
        .with_context(|| format!("wait for {program}"))?
    {
        Some(status) => (status, false),
        None => {
            warn!(%program, timeout_secs = timeout.as_secs(), "deadline passed, killing child");
            kill_tree(&mut child, &program)?;
            (child.wait().with_context(|| format!("reap {program}"))?, true)
        }
    };

    let out = out_drain.finish("stdout")?;
    let err = err_drain.finish("stderr")?;
    if out.dropped + err.dropped > 0 {
        warn!(stdout_dropped = out.dropped, stderr_dropped = err.dropped, "child output exceeded limit");
    }
    debug!(%program, exit_code = ?status.code(), timed_out, "child exited");

    Ok(CommandOutput {
        status,
        stdout: out.kept,
        stderr: err.kept,
        stdout_truncated: out.dropped,
        stderr_truncated: err.dropped,
        timed_out,
    })
}
