use std::io::{self, Read, Write};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Cap on captured stderr, and on stdout unless the caller lifts it.
pub(crate) const MAX_CAPTURE_BYTES: usize = 1024 * 1024;
const WAIT_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Set when stdout exceeded the capture limit; `stdout` is then a prefix.
    pub stdout_truncated: bool,
}

/// Raw result of a finished child.
#[derive(Debug)]
pub(crate) struct Captured {
    pub code: i32,
    pub stdout: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr: String,
}

impl Captured {
    pub(crate) fn into_output(self) -> RunOutput {
        RunOutput {
            code: self.code,
            stdout: String::from_utf8_lossy(&self.stdout).into_owned(),
            stderr: self.stderr,
            stdout_truncated: self.stdout_truncated,
        }
    }
}

/// Outcome of a bounded child process.
pub(crate) enum Bounded {
    Finished(Captured),
    TimedOut,
}

/// How much of the child's streams to keep and what to feed it.
#[derive(Debug, Default)]
pub(crate) struct Capture {
    /// `None` keeps all of stdout.
    pub stdout_limit: Option<usize>,
    pub stdin: Option<Vec<u8>>,
}

impl Capture {
    pub(crate) fn limited() -> Self {
        Self {
            stdout_limit: Some(MAX_CAPTURE_BYTES),
            stdin: None,
        }
    }
}

/// Runs `command` to completion or until `timeout` passes, killing the child
/// in the latter case. Streams are pumped on background threads so a chatty
/// child cannot block on a full pipe.
pub(crate) fn run_bounded(
    mut command: Command,
    timeout: Option<Duration>,
    capture: Capture,
) -> io::Result<Bounded> {
    command.stdin(if capture.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let mut child = command.spawn()?;
    let writer = spawn_writer(child.stdin.take(), capture.stdin);
    let stdout = spawn_reader(child.stdout.take(), capture.stdout_limit);
    let stderr = spawn_reader(child.stderr.take(), Some(MAX_CAPTURE_BYTES));

    let Some(code) = wait_with_deadline(&mut child, timeout)? else {
        let _ = child.kill();
        let _ = child.wait();
        // Grandchildren may still hold the pipes; leave the pumps detached.
        drop((writer, stdout, stderr));
        return Ok(Bounded::TimedOut);
    };

    join_writer(writer)?;
    let (stdout, stdout_truncated) = join_reader(stdout)?;
    let (stderr, stderr_truncated) = join_reader(stderr)?;
    let mut stderr = String::from_utf8_lossy(&stderr).into_owned();
    if stderr_truncated {
        stderr.push_str("\n[...truncated...]\n");
    }
    Ok(Bounded::Finished(Captured {
        code,
        stdout,
        stdout_truncated,
        stderr,
    }))
}

fn wait_with_deadline(child: &mut Child, timeout: Option<Duration>) -> io::Result<Option<i32>> {
    let Some(timeout) = timeout else {
        return child.wait().map(|status| Some(status.code().unwrap_or(-1)));
    };
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status.code().unwrap_or(-1)));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        thread::sleep(WAIT_POLL.min(deadline - now));
    }
}

type Writer = Option<JoinHandle<io::Result<()>>>;
type Reader = Option<JoinHandle<io::Result<(Vec<u8>, bool)>>>;

fn spawn_writer<W: Write + Send + 'static>(stream: Option<W>, input: Option<Vec<u8>>) -> Writer {
    let (mut stream, input) = (stream?, input?);
    Some(thread::spawn(move || {
        // Dropping `stream` at the end closes the child's stdin.
        match stream.write_all(&input) {
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(()),
            other => other,
        }
    }))
}

fn join_writer(writer: Writer) -> io::Result<()> {
    match writer {
        Some(handle) => handle
            .join()
            .map_err(|_| io::Error::other("input writer thread panicked"))?,
        None => Ok(()),
    }
}

fn spawn_reader<R: Read + Send + 'static>(stream: Option<R>, limit: Option<usize>) -> Reader {
    stream.map(|stream| thread::spawn(move || read_limited(stream, limit)))
}

fn join_reader(reader: Reader) -> io::Result<(Vec<u8>, bool)> {
    let Some(handle) = reader else {
        return Ok((Vec::new(), false));
    };
    handle
        .join()
        .map_err(|_| io::Error::other("output reader thread panicked"))?
}

/// Reads `reader` to the end, keeping at most `limit` bytes. The rest is
/// drained and discarded so the writer never blocks.
fn read_limited(mut reader: impl Read, limit: Option<usize>) -> io::Result<(Vec<u8>, bool)> {
    let Some(limit) = limit else {
        let mut buffer = Vec::new();
        reader.read_to_end(&mut buffer)?;
        return Ok((buffer, false));
    };
    let mut buffer = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        let read = reader.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        let room = limit.saturating_sub(buffer.len());
        if read > room {
            truncated = true;
        }
        buffer.extend_from_slice(&chunk[..read.min(room)]);
    }
    Ok((buffer, truncated))
}
