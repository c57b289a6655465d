//! Supervisor for the long-lived capture process.
//!
//! Spawns the capture command, forwards its stdout lines to a bounded
//! channel, and restarts it with exponential backoff when it exits. Runs
//! that die inside the grace period without producing output count as
//! failed starts; too many in a row (or a missing binary) stop the
//! supervisor for good.

use rand::Rng;
use std::io::ErrorKind;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{CaptureCommand, CaptureState};
use crate::error::CaptureError;

const LINE_CHANNEL_CAPACITY: usize = 4096;
const TERM_WAIT: Duration = Duration::from_secs(2);

/// Informational stderr lines tcpdump prints on every run.
const STDERR_NOISE: &[&str] = &[
    "listening on",
    "verbose output suppressed",
    "use -v",
    "packets captured",
    "packets received by filter",
    "packets dropped by kernel",
];

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub grace: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub max_start_failures: u32,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(2000),
            backoff_base: Duration::from_millis(1000),
            backoff_max: Duration::from_millis(30_000),
            max_start_failures: 5,
        }
    }
}

struct Shared {
    state: watch::Sender<CaptureState>,
    restarts: AtomicU64,
    lines: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    fn new() -> Self {
        let (state, _) = watch::channel(CaptureState::Stopped);
        Self {
            state,
            restarts: AtomicU64::new(0),
            lines: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    fn set_state(&self, state: CaptureState) {
        self.state.send_if_modified(|current| {
            if *current != state {
                debug!("Capture state {} -> {}", current, state);
                *current = state;
                true
            } else {
                false
            }
        });
    }

    fn set_error(&self, error: Option<String>) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = error;
    }
}

/// Read-only view of the supervisor used for status reporting.
#[derive(Clone)]
pub struct CaptureHandle {
    shared: Arc<Shared>,
}

impl CaptureHandle {
    pub fn state(&self) -> CaptureState {
        *self.shared.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == CaptureState::Running
    }

    pub fn restarts(&self) -> u64 {
        self.shared.restarts.load(Ordering::Relaxed)
    }

    /// Total stdout lines forwarded since start.
    pub fn line_count(&self) -> u64 {
        self.shared.lines.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared
            .last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Subscribes to state transitions.
    pub fn watch_state(&self) -> watch::Receiver<CaptureState> {
        self.shared.state.subscribe()
    }

    /// Resolves once the state satisfies `pred`.
    pub async fn wait_for_state(&self, pred: impl FnMut(&CaptureState) -> bool) -> CaptureState {
        let mut rx = self.watch_state();
        let state = match rx.wait_for(pred).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }
}

/// The capture output as a single-consumer stream of lines. Ends only when
/// the supervisor stops for good.
pub struct CaptureLines {
    rx: mpsc::Receiver<String>,
}

impl CaptureLines {
    pub async fn next_line(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// Returns a handle that reports a permanent `Stopped` state with `reason`
/// and a line stream that is already finished.
pub fn disabled(reason: &CaptureError) -> (CaptureHandle, CaptureLines) {
    let shared = Arc::new(Shared::new());
    shared.set_error(Some(format!("{}: {}", reason.code(), reason)));
    let (_tx, rx) = mpsc::channel(1);
    (CaptureHandle { shared }, CaptureLines { rx })
}

/// Starts supervising `command`.
pub fn spawn(
    command: CaptureCommand,
    settings: SupervisorSettings,
    cancel: CancellationToken,
) -> (CaptureHandle, CaptureLines) {
    let shared = Arc::new(Shared::new());
    let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);

    let supervisor = Supervisor {
        command,
        settings,
        shared: Arc::clone(&shared),
        tx,
        cancel,
    };
    tokio::spawn(supervisor.run());

    (CaptureHandle { shared }, CaptureLines { rx })
}

enum RunOutcome {
    /// Shutdown requested or the line consumer went away.
    Cancelled,
    Exited { healthy: bool, status: String },
}

struct Supervisor {
    command: CaptureCommand,
    settings: SupervisorSettings,
    shared: Arc<Shared>,
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl Supervisor {
    #[instrument(skip(self), fields(command = %self.command))]
    async fn run(self) {
        let mut backoff = self.settings.backoff_base;
        let mut failed_starts = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.shared.set_state(CaptureState::Starting);

            let outcome = match self.start_child() {
                Ok(child) => self.run_child(child).await,
                Err(e) if is_permanent_spawn_error(&e) => {
                    let err = if e.kind() == ErrorKind::NotFound {
                        CaptureError::BinaryNotFound(self.command.program.clone())
                    } else {
                        CaptureError::Spawn(e)
                    };
                    warn!("Capture cannot start: {}", err);
                    self.shared.set_error(Some(format!("{}: {}", err.code(), err)));
                    break;
                }
                Err(e) => {
                    let err = CaptureError::Spawn(e);
                    warn!("Capture spawn failed: {}", err);
                    self.shared.set_error(Some(format!("{}: {}", err.code(), err)));
                    RunOutcome::Exited {
                        healthy: false,
                        status: "spawn failed".into(),
                    }
                }
            };

            match outcome {
                RunOutcome::Cancelled => break,
                RunOutcome::Exited { healthy, status } => {
                    if healthy {
                        failed_starts = 0;
                        backoff = self.settings.backoff_base;
                        warn!("Capture process exited ({}), restarting", status);
                    } else {
                        failed_starts += 1;
                        warn!(
                            "Capture failed to start ({}), attempt {}/{}",
                            status, failed_starts, self.settings.max_start_failures
                        );
                        if failed_starts >= self.settings.max_start_failures {
                            warn!("Giving up on capture after {} failed starts", failed_starts);
                            break;
                        }
                    }
                }
            }

            self.shared.set_state(CaptureState::Backoff);
            let delay = with_jitter(backoff);
            debug!("Capture backoff {:?}", delay);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            backoff = (backoff * 2).min(self.settings.backoff_max);
            self.shared.restarts.fetch_add(1, Ordering::Relaxed);
        }

        self.shared.set_state(CaptureState::Stopped);
        info!("Capture supervisor stopped");
    }

    fn start_child(&self) -> std::io::Result<Child> {
        let child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        info!("Capture process started (pid {:?})", child.id());
        Ok(child)
    }

    async fn run_child(&self, mut child: Child) -> RunOutcome {
        let started = Instant::now();
        let mut stdout = child.stdout.take().map(|s| RawLines::new(BufReader::new(s)));
        let mut stderr = child.stderr.take().map(|s| RawLines::new(BufReader::new(s)));

        let grace = tokio::time::sleep(self.settings.grace);
        tokio::pin!(grace);

        let mut running = false;
        let mut emitted = false;
        let mut stderr_recorded = false;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    terminate(&mut child).await;
                    return RunOutcome::Cancelled;
                }
                _ = &mut grace, if !running => {
                    running = true;
                    self.shared.set_state(CaptureState::Running);
                }
                line = next_line(&mut stdout), if stdout.is_some() => match line {
                    Some(line) => {
                        if !emitted {
                            emitted = true;
                            self.shared.set_error(None);
                        }
                        if !running {
                            running = true;
                            self.shared.set_state(CaptureState::Running);
                        }
                        self.shared.lines.fetch_add(1, Ordering::Relaxed);
                        if self.tx.send(line).await.is_err() {
                            debug!("Capture line consumer dropped");
                            terminate(&mut child).await;
                            return RunOutcome::Cancelled;
                        }
                    }
                    None => stdout = None,
                },
                line = next_line(&mut stderr), if stderr.is_some() => match line {
                    Some(line) => {
                        if !stderr_recorded && is_meaningful_stderr(&line) {
                            stderr_recorded = true;
                            warn!("Capture stderr: {}", line.trim());
                            self.shared.set_error(Some(line.trim().to_string()));
                        }
                    }
                    None => stderr = None,
                },
                status = child.wait(), if stdout.is_none() && stderr.is_none() => {
                    let status = match status {
                        Ok(s) => s.to_string(),
                        Err(e) => e.to_string(),
                    };
                    let healthy = emitted || started.elapsed() >= self.settings.grace;
                    return RunOutcome::Exited { healthy, status };
                }
            }
        }
    }
}

/// Newline-delimited reader that tolerates bytes which are not UTF-8.
/// Partial lines survive a cancelled read, so it is safe inside `select!`.
struct RawLines<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> RawLines<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    /// Next line with invalid sequences replaced. `None` only at end of
    /// stream or on a read error.
    async fn next_line(&mut self) -> Option<String> {
        loop {
            match self.reader.read_until(b'\n', &mut self.buf).await {
                Ok(0) if self.buf.is_empty() => return None,
                Ok(_) => return Some(self.take_line()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Capture pipe read failed: {}", e);
                    return None;
                }
            }
        }
    }

    fn take_line(&mut self) -> String {
        let mut end = self.buf.len();
        while end > 0 && matches!(self.buf[end - 1], b'\n' | b'\r') {
            end -= 1;
        }
        let line = String::from_utf8_lossy(&self.buf[..end]).into_owned();
        self.buf.clear();
        line
    }
}

async fn next_line<R: AsyncBufRead + Unpin>(lines: &mut Option<RawLines<R>>) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await,
        None => None,
    }
}

fn is_permanent_spawn_error(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::NotFound | ErrorKind::PermissionDenied)
}

fn is_meaningful_stderr(line: &str) -> bool {
    let line = line.trim();
    !line.is_empty() && !STDERR_NOISE.iter().any(|noise| line.contains(noise))
}

/// Adds up to 10% random jitter.
fn with_jitter(delay: Duration) -> Duration {
    let max_jitter = (delay.as_millis() as u64 / 10).max(1);
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter))
}

/// SIGTERM, then SIGKILL if the child has not exited shortly after.
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        let pid = nix::unistd::Pid::from_raw(pid as i32);
        if let Err(e) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
            debug!("SIGTERM to capture process failed: {}", e);
        }
    }
    match tokio::time::timeout(TERM_WAIT, child.wait()).await {
        Ok(_) => debug!("Capture process terminated"),
        Err(_) => {
            warn!("Capture process ignored SIGTERM, killing");
            if let Err(e) = child.kill().await {
                debug!("Kill failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CaptureCommand {
        CaptureCommand {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }

    fn fast_settings() -> SupervisorSettings {
        SupervisorSettings {
            grace: Duration::from_millis(300),
            backoff_base: Duration::from_millis(20),
            backoff_max: Duration::from_millis(100),
            max_start_failures: 3,
        }
    }

    async fn next_within(lines: &mut CaptureLines) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(3), lines.next_line())
            .await
            .ok()
            .flatten()
    }

    #[test]
    fn test_stderr_filter() {
        assert!(!is_meaningful_stderr(
            "listening on eth0, link-type EN10MB (Ethernet), snapshot length 262144 bytes"
        ));
        assert!(!is_meaningful_stderr("12 packets captured"));
        assert!(!is_meaningful_stderr("   "));
        assert!(is_meaningful_stderr(
            "tcpdump: eth0: You don't have permission to capture on that device"
        ));
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_millis(1000);
        for _ in 0..50 {
            let d = with_jitter(base);
            assert!(d >= base && d <= base + Duration::from_millis(100));
        }
    }

    #[tokio::test]
    async fn test_lines_are_forwarded() {
        let cancel = CancellationToken::new();
        let (handle, mut lines) = spawn(
            sh("echo one; echo two; sleep 5"),
            fast_settings(),
            cancel.clone(),
        );

        assert_eq!(lines.next_line().await.as_deref(), Some("one"));
        assert_eq!(lines.next_line().await.as_deref(), Some("two"));
        assert!(handle.is_running());
        assert_eq!(handle.line_count(), 2);

        cancel.cancel();
        let state = handle
            .wait_for_state(|s| *s == CaptureState::Stopped)
            .await;
        assert_eq!(state, CaptureState::Stopped);
    }

    #[tokio::test]
    async fn test_raw_lines_replace_invalid_bytes() {
        let input: &[u8] = b"first\r\n\xff\xfe bad\nlast";
        let mut lines = RawLines::new(input);
        assert_eq!(lines.next_line().await.as_deref(), Some("first"));
        assert_eq!(lines.next_line().await.as_deref(), Some("\u{fffd}\u{fffd} bad"));
        assert_eq!(lines.next_line().await.as_deref(), Some("last"));
        assert_eq!(lines.next_line().await, None);
    }

    #[tokio::test]
    async fn test_invalid_utf8_does_not_end_stream() {
        let cancel = CancellationToken::new();
        let (handle, mut lines) = spawn(
            sh("echo first; printf '\\377\\376 bad\\n'; echo after; sleep 5"),
            fast_settings(),
            cancel.clone(),
        );

        assert_eq!(next_within(&mut lines).await.as_deref(), Some("first"));
        let garbled = next_within(&mut lines).await.unwrap();
        assert!(garbled.ends_with(" bad"), "{garbled}");
        assert_eq!(next_within(&mut lines).await.as_deref(), Some("after"));
        assert_eq!(handle.line_count(), 3);
        assert_eq!(handle.restarts(), 0);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_restarts_after_exit() {
        let cancel = CancellationToken::new();
        let (handle, mut lines) = spawn(sh("echo tick; exit 0"), fast_settings(), cancel.clone());

        assert_eq!(lines.next_line().await.as_deref(), Some("tick"));
        assert_eq!(lines.next_line().await.as_deref(), Some("tick"));
        assert!(handle.restarts() >= 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_missing_binary_stops_permanently() {
        let cancel = CancellationToken::new();
        let command = CaptureCommand {
            program: "hostpulse-no-such-capture-tool".into(),
            args: vec![],
        };
        let (handle, mut lines) = spawn(command, fast_settings(), cancel);

        assert_eq!(lines.next_line().await, None);
        let state = handle
            .wait_for_state(|s| *s == CaptureState::Stopped)
            .await;
        assert_eq!(state, CaptureState::Stopped);
        let err = handle.last_error().unwrap();
        assert!(err.starts_with("capture-binary-not-installed"), "{err}");
        assert_eq!(handle.restarts(), 0);
    }

    #[tokio::test]
    async fn test_repeated_failed_starts_stop_supervisor() {
        let cancel = CancellationToken::new();
        let (handle, mut lines) = spawn(
            sh("echo 'listening on eth9' >&2; echo 'tcpdump: eth9: No such device exists' >&2; exit 1"),
            fast_settings(),
            cancel,
        );

        assert_eq!(lines.next_line().await, None);
        assert_eq!(
            handle.wait_for_state(|s| *s == CaptureState::Stopped).await,
            CaptureState::Stopped
        );
        assert_eq!(handle.restarts(), 2);
        assert!(handle.last_error().unwrap().contains("No such device"));
    }

    #[test]
    fn test_disabled_handle() {
        let (handle, _lines) = disabled(&CaptureError::Disabled);
        assert_eq!(handle.state(), CaptureState::Stopped);
        assert!(handle.last_error().unwrap().starts_with("capture-disabled"));
    }
}
