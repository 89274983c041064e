use std::{
    io::{BufRead, BufReader, Read},
    process::{Child, Command, Stdio},
    thread,
    time::Duration,
};

use futures::stream::{self, BoxStream, StreamExt};
use tokio::{
    sync::mpsc,
    time::{timeout_at, Instant},
};
use tracing::{info, warn};

const QUEUE_DEPTH: usize = 256;

pub type LineStream = BoxStream<'static, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// `Closed` is the per-pipe end marker
#[derive(Debug)]
enum Feed {
    Line(String),
    Closed,
}

/// Merged stdout/stderr of one process. Deadline runs from launch; dropping early kills it.
pub struct ProcessStream {
    spec: CommandSpec,
    timeout: Duration,
    deadline: Instant,
    child: Option<Child>,
    rx: Option<mpsc::Receiver<Feed>>,
    open_pipes: usize,
    pending: Option<String>,
    done: bool,
}

impl ProcessStream {
    pub fn spawn(spec: CommandSpec, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        info!(command = %spec.program, args = ?spec.args, "audit: launching external tool");

        let spawned = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                warn!(error = %e, command = %spec.program, "failed to launch external tool");
                let line = format!("[!] Execution Error: {e} | Command: {}", spec.display());
                return Self {
                    spec,
                    timeout,
                    deadline,
                    child: None,
                    rx: None,
                    open_pipes: 0,
                    pending: Some(line),
                    done: false,
                };
            }
        };

        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let mut open_pipes = 0;
        if let Some(stdout) = child.stdout.take() {
            open_pipes += usize::from(spawn_reader("stdout", stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            open_pipes += usize::from(spawn_reader("stderr", stderr, tx.clone()));
        }

        Self {
            spec,
            timeout,
            deadline,
            child: Some(child),
            rx: Some(rx),
            open_pipes,
            pending: None,
            done: false,
        }
    }

    pub async fn next_line(&mut self) -> Option<String> {
        if self.done {
            return None;
        }
        if let Some(line) = self.pending.take() {
            self.done = true;
            return Some(line);
        }

        loop {
            if self.open_pipes == 0 {
                self.finish();
                return None;
            }
            let Some(rx) = self.rx.as_mut() else {
                self.finish();
                return None;
            };
            let next = timeout_at(self.deadline, rx.recv()).await;
            match next {
                Ok(Some(Feed::Line(line))) => return Some(line),
                Ok(Some(Feed::Closed)) => self.open_pipes -= 1,
                // every reader hung up without its end marker
                Ok(None) => self.open_pipes = 0,
                Err(_) => {
                    warn!(
                        command = %self.spec.program,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "external tool timed out, killing"
                    );
                    self.kill();
                    self.done = true;
                    return Some(format!(
                        "[!] Error: Command timed out after {}.",
                        describe_timeout(self.timeout)
                    ));
                }
            }
        }
    }

    pub fn into_lines(self) -> LineStream {
        stream::unfold(self, |mut proc| async move {
            let line = proc.next_line().await?;
            Some((line, proc))
        })
        .boxed()
    }

    fn finish(&mut self) {
        self.done = true;
        self.rx = None;
        if let Some(child) = self.child.take() {
            reap(child);
        }
    }

    fn kill(&mut self) {
        self.rx = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            reap(child);
        }
    }
}

impl Drop for ProcessStream {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if matches!(child.try_wait(), Ok(None)) {
                let _ = child.kill();
            }
            reap(child);
        }
    }
}

pub fn spawn_lines(spec: CommandSpec, timeout: Duration) -> LineStream {
    ProcessStream::spawn(spec, timeout).into_lines()
}

pub fn single_line(line: impl Into<String>) -> LineStream {
    stream::once(futures::future::ready(line.into())).boxed()
}

fn spawn_reader<R>(name: &str, pipe: R, tx: mpsc::Sender<Feed>) -> bool
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("sentra-{name}-reader"))
        .spawn(move || {
            let mut reader = BufReader::new(pipe);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if tx.blocking_send(Feed::Line(decode_line(&buf))).is_err() {
                            return;
                        }
                    }
                }
            }
            let _ = tx.blocking_send(Feed::Closed);
        })
        .map_err(|e| warn!(error = %e, "failed to start pipe reader thread"))
        .is_ok()
}

fn reap(mut child: Child) {
    // wait() blocks, keep it off the scheduler
    let _ = thread::Builder::new()
        .name("sentra-reaper".to_string())
        .spawn(move || {
            let _ = child.wait();
        });
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

fn describe_timeout(timeout: Duration) -> String {
    if timeout.subsec_millis() == 0 {
        format!("{} seconds", timeout.as_secs())
    } else {
        format!("{} milliseconds", timeout.as_millis())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Instant as StdInstant;

    use super::*;

    async fn collect(spec: CommandSpec, timeout: Duration) -> Vec<String> {
        spawn_lines(spec, timeout).collect().await
    }

    #[tokio::test]
    async fn merges_stdout_and_stderr() {
        let lines = collect(
            CommandSpec::new("sh", ["-c", "echo one; echo two 1>&2; echo three"]),
            Duration::from_secs(10),
        )
        .await;
        assert_eq!(lines.len(), 3);
        assert!(lines.contains(&"two".to_string()));
        let one = lines.iter().position(|l| l == "one").expect("one");
        let three = lines.iter().position(|l| l == "three").expect("three");
        assert!(one < three);
    }

    #[tokio::test]
    async fn empty_lines_are_not_end_of_stream() {
        let lines = collect(
            CommandSpec::new("printf", ["a\\n\\nb\\n"]),
            Duration::from_secs(10),
        )
        .await;
        assert_eq!(lines, vec!["a", "", "b"]);
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced() {
        let lines = collect(
            CommandSpec::new("printf", ["ok\\377\\n"]),
            Duration::from_secs(10),
        )
        .await;
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("ok"));
        assert!(lines[0].contains('\u{FFFD}'));
    }

    #[tokio::test]
    async fn launch_failure_yields_single_error_line() {
        let mut proc = ProcessStream::spawn(
            CommandSpec::new("/nonexistent/sentra-missing-tool", ["-x"]),
            Duration::from_secs(1),
        );
        let line = proc.next_line().await.expect("synthetic line");
        assert!(line.starts_with("[!] Execution Error"));
        assert!(line.contains("/nonexistent/sentra-missing-tool -x"));
        assert_eq!(proc.next_line().await, None);
    }

    #[tokio::test]
    async fn silent_process_times_out_and_is_killed() {
        let started = StdInstant::now();
        let lines = collect(
            CommandSpec::new("sleep", ["30"]),
            Duration::from_millis(200),
        )
        .await;
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("timed out after 200 milliseconds"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn timeout_is_measured_from_launch_not_last_line() {
        let lines = collect(
            CommandSpec::new("sh", ["-c", "while true; do echo tick; sleep 0.05; done"]),
            Duration::from_millis(400),
        )
        .await;
        assert!(lines.len() > 1);
        assert!(lines.last().expect("last").contains("timed out"));
    }

    #[tokio::test]
    async fn early_drop_does_not_hang() {
        let mut proc = ProcessStream::spawn(
            CommandSpec::new("sh", ["-c", "while true; do echo y; done"]),
            Duration::from_secs(30),
        );
        for _ in 0..3 {
            assert_eq!(proc.next_line().await.as_deref(), Some("y"));
        }
        drop(proc);
    }

    #[tokio::test]
    async fn single_line_stream_ends() {
        let lines: Vec<String> = single_line("skipped").collect().await;
        assert_eq!(lines, vec!["skipped"]);
    }
}
