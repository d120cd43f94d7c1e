//! Wall-clock supervision of one engine process and everything it forks.
//!
//! Every blocking pipe operation runs on its own thread and reports back over a
//! single channel, so the deadline holds even while the engine ignores its
//! request or leaves workers holding the pipes.

use std::io::{self, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use crate::EngineError;

const MAX_STDOUT_BYTES: usize = 16_777_216;
const MAX_STDERR_BYTES: usize = 1_048_576;
const READ_CHUNK_BYTES: usize = 8192;
const EVENT_POLL: Duration = Duration::from_millis(10);
/// How long workers may keep the output pipes open after the engine's main
/// process has exited before the process group is torn down.
const POST_EXIT_DRAIN: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pipe {
    Stdout,
    Stderr,
}

impl Pipe {
    const fn label(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }

    const fn cap(self) -> usize {
        match self {
            Self::Stdout => MAX_STDOUT_BYTES,
            Self::Stderr => MAX_STDERR_BYTES,
        }
    }
}

#[derive(Debug)]
enum PipeEvent {
    Drained { pipe: Pipe, bytes: Vec<u8> },
    ReadFailed { pipe: Pipe, error: io::Error },
    Overflowed { pipe: Pipe, seen: usize },
    RequestDelivered(io::Result<()>),
}

/// Exit status plus the full contents of both output pipes.
#[derive(Debug)]
pub(crate) struct Completed {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Spawns `command` in its own process group, feeds it `request` on stdin and
/// collects its output, all inside `timeout`. On timeout or overflow the whole
/// group is killed and the pipe threads are left to finish on their own.
pub(crate) fn run_to_completion(
    mut command: Command,
    request: Vec<u8>,
    timeout: Duration,
) -> Result<Completed, EngineError> {
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    own_process_group(&mut command);

    let mut child = command.spawn().map_err(|error| EngineError::Spawn {
        program: command.get_program().to_string_lossy().into_owned(),
        reason: error.to_string(),
    })?;

    let (Some(stdin), Some(stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        kill_process_tree(&mut child);
        return Err(EngineError::Io("engine stdio pipes unavailable".to_string()));
    };

    let (events_tx, events) = mpsc::channel();
    drain_pipe(Pipe::Stdout, stdout, events_tx.clone());
    drain_pipe(Pipe::Stderr, stderr, events_tx.clone());
    std::thread::spawn(move || {
        let mut stdin = stdin;
        let delivered = stdin.write_all(&request).and_then(|()| stdin.flush());
        drop(stdin);
        let _ = events_tx.send(PipeEvent::RequestDelivered(delivered));
    });

    Supervisor {
        child,
        events,
        deadline: Instant::now() + timeout,
        timeout,
    }
    .run()
}

struct Supervisor {
    child: Child,
    events: Receiver<PipeEvent>,
    deadline: Instant,
    timeout: Duration,
}

impl Supervisor {
    fn run(mut self) -> Result<Completed, EngineError> {
        let mut status: Option<ExitStatus> = None;
        let mut exited_at: Option<Instant> = None;
        let mut group_reaped = false;
        let mut stdout: Option<Vec<u8>> = None;
        let mut stderr: Option<Vec<u8>> = None;

        loop {
            if status.is_none() {
                match self.child.try_wait() {
                    Ok(Some(exit)) => {
                        status = Some(exit);
                        exited_at = Some(Instant::now());
                    }
                    Ok(None) => {}
                    Err(error) => {
                        return Err(self.abort(EngineError::Io(format!(
                            "engine process wait failed: {error}"
                        ))));
                    }
                }
            }

            if let Some(exit) = status {
                if stdout.is_some() && stderr.is_some() {
                    return Ok(Completed {
                        status: exit,
                        stdout: stdout.take().unwrap_or_default(),
                        stderr: stderr.take().unwrap_or_default(),
                    });
                }
            }

            let now = Instant::now();
            if now >= self.deadline {
                let millis = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
                return Err(self.abort(EngineError::Timeout { millis }));
            }
            // Workers that outlive the main process would otherwise hold the
            // pipes open until the deadline.
            let drain_expired =
                exited_at.is_some_and(|exited| now.duration_since(exited) >= POST_EXIT_DRAIN);
            if drain_expired && !group_reaped {
                signal_process_group(self.child.id());
                group_reaped = true;
            }

            match self.events.recv_timeout((self.deadline - now).min(EVENT_POLL)) {
                Ok(PipeEvent::Drained { pipe, bytes }) => match pipe {
                    Pipe::Stdout => stdout = Some(bytes),
                    Pipe::Stderr => stderr = Some(bytes),
                },
                Ok(PipeEvent::ReadFailed { pipe, error }) => {
                    return Err(self.abort(EngineError::Io(format!(
                        "engine {} read failed: {error}",
                        pipe.label()
                    ))));
                }
                Ok(PipeEvent::Overflowed { pipe, seen }) => {
                    return Err(self.abort(EngineError::StreamOverflow {
                        stream: pipe.label(),
                        actual: seen,
                        max: pipe.cap(),
                    }));
                }
                // An engine may exit without reading its request; it is then
                // judged by exit status and output alone.
                Ok(PipeEvent::RequestDelivered(Err(error)))
                    if error.kind() != io::ErrorKind::BrokenPipe =>
                {
                    return Err(self.abort(EngineError::Io(format!(
                        "engine stdin write failed: {error}"
                    ))));
                }
                Ok(PipeEvent::RequestDelivered(_)) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => std::thread::sleep(EVENT_POLL),
            }
        }
    }

    fn abort(&mut self, error: EngineError) -> EngineError {
        kill_process_tree(&mut self.child);
        error
    }
}

fn drain_pipe<R>(pipe: Pipe, mut reader: R, events: Sender<PipeEvent>)
where
    R: Read + Send + 'static,
{
    std::thread::spawn(move || {
        let mut bytes = Vec::new();
        let mut chunk = [0_u8; READ_CHUNK_BYTES];
        let event = loop {
            match reader.read(&mut chunk) {
                Ok(0) => break PipeEvent::Drained { pipe, bytes },
                Ok(read) => {
                    let seen = bytes.len() + read;
                    if seen > pipe.cap() {
                        break PipeEvent::Overflowed { pipe, seen };
                    }
                    bytes.extend_from_slice(&chunk[..read]);
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => break PipeEvent::ReadFailed { pipe, error },
            }
        };
        let _ = events.send(event);
    });
}

#[cfg(unix)]
fn own_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_command: &mut Command) {}

/// Sends SIGKILL to every process in the group led by `leader`.
#[cfg(unix)]
fn signal_process_group(leader: u32) {
    let group = format!("-{leader}");
    let quiet = |command: &mut Command| {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
    };
    if quiet(Command::new("kill").args(["-s", "KILL", "--", &group])).is_err() {
        let _ = quiet(Command::new("sh").args(["-c", "kill -s KILL -- \"$0\"", &group]));
    }
}

#[cfg(not(unix))]
fn signal_process_group(_leader: u32) {}

fn kill_process_tree(child: &mut Child) {
    signal_process_group(child.id());
    let _ = child.kill();
    let _ = child.wait();
}
