//! A single multiplexed session: one long-lived child "play server" process
//! plus the bookkeeping the router needs to arbitrate, time out, and talk to
//! it.
//!
//! Subprocess I/O is serialized per session through `inner`'s mutex, not
//! through the multiplexer's session-table lock, so a `talk()` blocked on a
//! slow child does not stall queries against unrelated sessions (§5
//! Concurrency & Resource Model).

use std::process::Stdio;
use std::time::{Duration, Instant};

use forge_protocol::line::{parse_conflict_marker, ConflictMarker};
use forge_protocol::ServiceError;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Inactive,
    Running,
    Terminated,
}

struct SessionInner {
    state: SessionState,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<BufReader<ChildStdout>>,
    pid: Option<u32>,
    last_access: Instant,
    used: bool,
    modified: bool,
}

impl SessionInner {
    fn fresh() -> Self {
        Self {
            state: SessionState::Inactive,
            child: None,
            stdin: None,
            stdout: None,
            pid: None,
            last_access: Instant::now(),
            used: false,
            modified: false,
        }
    }
}

/// A snapshot of a session's state, cheap to clone, used for `LIST`/`INFO`
/// replies which must not hold the session's mutex while formatting output.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: String,
    pub pid: u32,
    pub age_secs: u64,
    pub used: bool,
    pub modified: bool,
    pub args: Vec<String>,
}

pub struct Session {
    pub id: String,
    pub args: Vec<String>,
    markers: Vec<ConflictMarker>,
    created_at: Instant,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub fn new(id: String, args: Vec<String>) -> Self {
        let markers = args.iter().filter_map(|a| parse_conflict_marker(a)).collect();
        Self { id, args, markers, created_at: Instant::now(), inner: Mutex::new(SessionInner::fresh()) }
    }

    pub fn markers(&self) -> &[ConflictMarker] {
        &self.markers
    }

    /// Spawns the child process and waits for its startup greeting. A
    /// session that is already `Running` is left untouched (idempotent, used
    /// by `restart` after a fresh `stop`).
    pub async fn start(&self, play_server_path: &str) -> Result<(), ServiceError> {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Running {
            return Ok(());
        }

        let mut command = Command::new(play_server_path);
        command.args(&self.args);
        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::null());

        let mut child = command.spawn().map_err(|err| {
            tracing::warn!(session_id = %self.id, error = %err, "failed to spawn play server");
            ServiceError::cannot_start_session()
        })?;
        let pid = child.id();
        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let mut reader = BufReader::new(stdout);

        let mut greeting = String::new();
        let started = match reader.read_line(&mut greeting).await {
            Ok(0) | Err(_) => false,
            Ok(_) => greeting.trim_end_matches(['\r', '\n']).starts_with("100"),
        };

        if !started {
            tracing::trace!(session_id = %self.id, line = %greeting.trim_end(), "play server rejected startup");
            drain_rejected_startup(&self.id, &mut reader).await;
            let _ = child.kill().await;
            return Err(ServiceError::cannot_start_session());
        }

        inner.child = Some(child);
        inner.stdin = Some(stdin);
        inner.stdout = Some(reader);
        inner.pid = pid;
        inner.state = SessionState::Running;
        inner.last_access = Instant::now();
        inner.used = false;
        inner.modified = false;
        tracing::info!(session_id = %self.id, pid, "play server started");
        Ok(())
    }

    /// Sends one command to the child and returns its reply (header, plus
    /// body if the header is a `2xx`). Any I/O failure stops the session and
    /// surfaces a session-timeout error, per §4.1 Session command protocol.
    pub async fn talk(&self, cmd: &str) -> Result<String, ServiceError> {
        let mut inner = self.inner.lock().await;
        Self::talk_locked(&self.id, &mut inner, cmd).await
    }

    /// `save(notify)` is a no-op if the session has not been modified since
    /// its last save. Returns whether a `SAVE` was actually sent, so the
    /// caller can decide whether a `forgetDirectory` notification applies.
    pub async fn save(&self) -> Result<bool, ServiceError> {
        let mut inner = self.inner.lock().await;
        if !inner.modified {
            return Ok(false);
        }
        Self::talk_locked(&self.id, &mut inner, "SAVE").await?;
        Ok(true)
    }

    async fn talk_locked(id: &str, inner: &mut SessionInner, raw_cmd: &str) -> Result<String, ServiceError> {
        if inner.state != SessionState::Running {
            return Err(ServiceError::session_timed_out());
        }

        let mut command = raw_cmd.to_string();
        if !command.ends_with('\n') {
            command.push('\n');
        }
        if raw_cmd.trim_start().to_ascii_uppercase().starts_with("POST") {
            command.push_str(".\n");
        }

        inner.last_access = Instant::now();
        inner.used = true;
        inner.modified = !raw_cmd.trim_start().to_ascii_uppercase().starts_with("SAVE");

        let stdin = inner.stdin.as_mut().expect("running session retains stdin");
        if stdin.write_all(command.as_bytes()).await.is_err() {
            tracing::warn!(session_id = %id, "write to play server failed, stopping session");
            Self::stop_locked(id, inner).await;
            return Err(ServiceError::session_timed_out());
        }

        let reader = inner.stdout.as_mut().expect("running session retains stdout");
        let mut header = String::new();
        match reader.read_line(&mut header).await {
            Ok(0) | Err(_) => {
                tracing::warn!(session_id = %id, "play server closed its reply stream");
                Self::stop_locked(id, inner).await;
                return Err(ServiceError::session_timed_out());
            }
            Ok(_) => {}
        }
        let header = header.trim_end_matches(['\r', '\n']).to_string();
        if header.is_empty() {
            tracing::warn!(session_id = %id, "play server sent an empty header");
            Self::stop_locked(id, inner).await;
            return Err(ServiceError::session_timed_out());
        }

        let mut reply = header.clone();
        if header.starts_with('2') {
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => {
                        tracing::warn!(session_id = %id, "play server truncated a multi-line reply");
                        Self::stop_locked(id, inner).await;
                        return Err(ServiceError::session_timed_out());
                    }
                    Ok(_) => {}
                }
                let trimmed = line.trim_end_matches(['\r', '\n']);
                if trimmed == "." {
                    break;
                }
                reply.push('\n');
                reply.push_str(trimmed);
            }
        }
        Ok(reply)
    }

    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        Self::stop_locked(&self.id, &mut inner).await;
    }

    async fn stop_locked(id: &str, inner: &mut SessionInner) {
        if inner.state == SessionState::Terminated {
            return;
        }
        // Dropping stdin sends EOF, the agreed-upon graceful shutdown signal
        // for this line-protocol child; give it a grace period before a
        // hard kill.
        inner.stdin = None;
        if let Some(mut child) = inner.child.take() {
            match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                Ok(Ok(status)) => tracing::info!(session_id = %id, ?status, "play server exited"),
                Ok(Err(err)) => tracing::warn!(session_id = %id, error = %err, "error waiting for play server"),
                Err(_) => {
                    tracing::warn!(session_id = %id, "play server did not exit in time, killing");
                    let _ = child.kill().await;
                }
            }
        }
        inner.stdout = None;
        inner.state = SessionState::Terminated;
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub async fn used(&self) -> bool {
        self.inner.lock().await.used
    }

    pub async fn idle_for(&self) -> Duration {
        self.inner.lock().await.last_access.elapsed()
    }

    pub async fn summary(&self) -> SessionSummary {
        let inner = self.inner.lock().await;
        SessionSummary {
            id: self.id.clone(),
            pid: inner.pid.unwrap_or(0),
            age_secs: self.created_at.elapsed().as_secs(),
            used: inner.used,
            modified: inner.modified,
            args: self.args.clone(),
        }
    }
}

async fn drain_rejected_startup(id: &str, reader: &mut BufReader<ChildStdout>) {
    loop {
        let mut extra = String::new();
        match tokio::time::timeout(Duration::from_millis(200), reader.read_line(&mut extra)).await {
            Ok(Ok(n)) if n > 0 => tracing::trace!(session_id = %id, line = %extra.trim_end(), "play server startup output"),
            _ => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn talk_on_inactive_session_returns_session_timed_out() {
        let session = Session::new("1".to_string(), vec!["-WDIR=x".to_string()]);
        let err = session.talk("GET /").await.unwrap_err();
        assert_eq!(err.code, 600);
    }

    #[tokio::test]
    async fn save_on_unmodified_session_is_a_no_op() {
        let session = Session::new("1".to_string(), vec![]);
        // Never started, never modified -- save must short-circuit before
        // attempting any I/O against an absent child.
        assert_eq!(session.save().await.unwrap(), false);
    }

    #[tokio::test]
    async fn markers_are_parsed_once_from_args() {
        let session = Session::new("1".to_string(), vec!["-WDIR=x/y".to_string(), "-Rgame/1".to_string(), "plain".to_string()]);
        assert_eq!(session.markers().len(), 2);
    }

    #[tokio::test]
    async fn start_against_nonexistent_binary_fails_cleanly() {
        let session = Session::new("1".to_string(), vec![]);
        let err = session.start("/nonexistent/forge-playserver-binary").await.unwrap_err();
        assert_eq!(err.code, 601);
        assert_eq!(session.state().await, SessionState::Inactive);
    }
}
