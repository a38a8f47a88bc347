//! The session pool: creation policy, conflict arbitration, timeout sweeps,
//! and the group-action wildcard resolution described in §4.1.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use forge_common::IdGenerator;
use forge_protocol::line::{markers_conflict, ConflictKind, ConflictMarker};
use forge_protocol::{RespClient, RouterConfig, ServiceError};
use tokio::sync::RwLock;

use crate::session::{Session, SessionState, SessionSummary};

pub struct SessionMultiplexer {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    config: RouterConfig,
    id_generator: Arc<dyn IdGenerator>,
}

impl SessionMultiplexer {
    pub fn new(config: RouterConfig, id_generator: Arc<dyn IdGenerator>) -> Self {
        Self { sessions: RwLock::new(HashMap::new()), config, id_generator }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Opportunistic timeout sweep: stops any `Running` session whose idle
    /// time exceeds its applicable (virgin or normal) timeout. Called at the
    /// top of most commands rather than on a separate timer, per §4.1
    /// Timeout.
    pub async fn cleanup(&self) {
        let snapshot: Vec<(String, Arc<Session>)> =
            self.sessions.read().await.iter().map(|(id, session)| (id.clone(), session.clone())).collect();
        for (id, session) in snapshot {
            if session.state().await != SessionState::Running {
                continue;
            }
            let timeout = if session.used().await {
                Duration::from_secs(self.config.normal_timeout)
            } else {
                Duration::from_secs(self.config.virgin_timeout)
            };
            if session.idle_for().await >= timeout {
                tracing::info!(session_id = %id, "session idle timeout exceeded, stopping");
                self.stop_and_remove(&id).await;
            }
        }
    }

    /// Implements the three-step creation policy of §4.1: conflict
    /// arbitration against every running session, a capacity check with a
    /// cleanup retry, then subprocess startup.
    pub async fn create_session(&self, args: Vec<String>) -> Result<String, ServiceError> {
        let candidate_markers: Vec<ConflictMarker> =
            args.iter().filter_map(|a| forge_protocol::line::parse_conflict_marker(a)).collect();

        let mut conflicting = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for (id, session) in sessions.iter() {
                if session.state().await != SessionState::Running {
                    continue;
                }
                let conflicts = candidate_markers
                    .iter()
                    .any(|m| session.markers().iter().any(|existing| markers_conflict(m, existing)));
                if conflicts {
                    if self.config.new_sessions_win {
                        conflicting.push(id.clone());
                    } else {
                        return Err(ServiceError::session_conflict());
                    }
                }
            }
        }
        for id in &conflicting {
            self.stop_and_remove(id).await;
        }

        self.cleanup().await;
        if self.sessions.read().await.len() >= self.config.max_sessions {
            return Err(ServiceError::too_many_sessions());
        }

        let id = self.id_generator.create_id();
        let session = Arc::new(Session::new(id.clone(), args));
        session.start(&self.config.play_server_path).await?;
        self.sessions.write().await.insert(id.clone(), session);
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Arc<Session>, ServiceError> {
        self.sessions.read().await.get(id).cloned().ok_or_else(ServiceError::session_timed_out)
    }

    async fn stop_and_remove(&self, id: &str) {
        let session = self.sessions.write().await.remove(id);
        if let Some(session) = session {
            session.stop().await;
        }
    }

    pub async fn talk(&self, id: &str, cmd: &str) -> Result<String, ServiceError> {
        self.cleanup().await;
        let session = self.get(id).await?;
        session.talk(cmd).await
    }

    /// Saves one session, notifying the file service's `FORGET` for its
    /// `-WDIR=<path>` marker (if any) when `notify` is true and the session
    /// actually had unsaved changes. The notification is best-effort: a
    /// failure is logged, never surfaced (§4.1 Save semantics).
    pub async fn save(&self, id: &str, notify: bool) -> Result<(), ServiceError> {
        self.cleanup().await;
        let session = self.get(id).await?;
        let saved = session.save().await?;
        if saved && notify {
            if let Some(path) = wdir_path(&session.args) {
                let address = self.config.file_server_address.clone();
                if let Err(err) = RespClient::call(&address, &["FORGET", &path]).await {
                    tracing::warn!(session_id = %id, %path, error = %err, "forgetDirectory notification failed");
                }
            }
        }
        Ok(())
    }

    pub async fn close(&self, id: &str) -> Result<(), ServiceError> {
        self.cleanup().await;
        let _ = self.get(id).await?;
        self.stop_and_remove(id).await;
        Ok(())
    }

    /// Restart = stop then start, same session id and args, per §4.1 Group
    /// actions.
    pub async fn restart(&self, id: &str) -> Result<(), ServiceError> {
        self.cleanup().await;
        let session = self.get(id).await?;
        session.stop().await;
        session.start(&self.config.play_server_path).await?;
        Ok(())
    }

    /// Resolves a group-action target: a bare session id, or (prefixed with
    /// `-`) a conflict-key wildcard matching every session whose markers
    /// conflict with it. A bare id that does not name a running session is
    /// an error; a wildcard with no matches is simply an empty list.
    pub async fn resolve_targets(&self, target: &str) -> Result<Vec<String>, ServiceError> {
        if let Some(key) = target.strip_prefix('-') {
            let query = ConflictMarker { kind: ConflictKind::Write, key: key.to_string() };
            let sessions = self.sessions.read().await;
            Ok(sessions
                .iter()
                .filter(|(_, session)| session.markers().iter().any(|m| markers_conflict(&query, m)))
                .map(|(id, _)| id.clone())
                .collect())
        } else if self.sessions.read().await.contains_key(target) {
            Ok(vec![target.to_string()])
        } else {
            Err(ServiceError::session_timed_out())
        }
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(sessions.len());
        for session in sessions {
            summaries.push(session.summary().await);
        }
        summaries
    }

    pub async fn info(&self, id: &str) -> Result<Vec<String>, ServiceError> {
        let session = self.get(id).await?;
        Ok(session.args.clone())
    }

    /// Stops every live session -- called on process shutdown (§5
    /// Cancellation & timeouts).
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for id in ids {
            self.stop_and_remove(&id).await;
        }
    }
}

fn wdir_path(args: &[String]) -> Option<String> {
    args.iter().find_map(|a| a.strip_prefix("-WDIR=").map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_common::NumericalIdGenerator;

    fn multiplexer(new_sessions_win: bool) -> SessionMultiplexer {
        let config = RouterConfig {
            new_sessions_win,
            play_server_path: "/nonexistent/forge-playserver-binary".to_string(),
            max_sessions: 2,
            ..RouterConfig::default()
        };
        SessionMultiplexer::new(config, Arc::new(NumericalIdGenerator::new()))
    }

    /// A shell script that sends the `100` startup greeting a play server is
    /// expected to, then acks every line it reads with another `1xx` reply
    /// (never `2xx`, so `talk` never blocks waiting for a body). Good enough
    /// to let the conflict-arbitration scenario exercise a session that
    /// actually reaches `Running`, without needing a real play server binary.
    #[cfg(unix)]
    fn fake_play_server() -> (tempfile::TempDir, std::path::PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake-playserver.sh");
        std::fs::write(&path, "#!/bin/sh\necho \"100 ready\"\nwhile IFS= read -r line; do\n  echo \"100 ack\"\ndone\n").unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        (dir, path)
    }

    fn multiplexer_with_fake_server(new_sessions_win: bool, play_server_path: &std::path::Path) -> SessionMultiplexer {
        let config = RouterConfig {
            new_sessions_win,
            play_server_path: play_server_path.to_string_lossy().into_owned(),
            max_sessions: 2,
            ..RouterConfig::default()
        };
        SessionMultiplexer::new(config, Arc::new(NumericalIdGenerator::new()))
    }

    /// Scenario: starting a second session with the same `-WDIR=x/y` marker
    /// either rejects outright (`newSessionsWin=false`) or evicts the first
    /// and proceeds (`newSessionsWin=true`); either way `LIST` shows exactly
    /// one live session afterward.
    #[tokio::test]
    async fn scenario_conflicting_wdir_sessions_under_both_arbitration_policies() {
        let (_dir, script) = fake_play_server();

        let reject = multiplexer_with_fake_server(false, &script);
        let first = reject.create_session(vec!["-WDIR=x/y".to_string()]).await.unwrap();
        let err = reject.create_session(vec!["-WDIR=x/y".to_string()]).await.unwrap_err();
        assert_eq!(err.code, 609);
        let summaries = reject.list().await;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].id, first);

        let evict = multiplexer_with_fake_server(true, &script);
        let first = evict.create_session(vec!["-WDIR=x/y".to_string()]).await.unwrap();
        let second = evict.create_session(vec!["-WDIR=x/y".to_string()]).await.unwrap();
        assert_ne!(first, second);
        let summaries = evict.list().await;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].id, second);
    }

    #[tokio::test]
    async fn create_session_fails_cleanly_when_play_server_binary_is_missing() {
        let mux = multiplexer(true);
        let err = mux.create_session(vec!["-WDIR=x/y".to_string()]).await.unwrap_err();
        assert_eq!(err.code, 601);
        assert_eq!(mux.list().await.len(), 0);
    }

    #[tokio::test]
    async fn resolve_targets_errors_on_unknown_bare_id() {
        let mux = multiplexer(true);
        let err = mux.resolve_targets("missing").await.unwrap_err();
        assert_eq!(err.code, 600);
    }

    #[tokio::test]
    async fn resolve_targets_wildcard_with_no_matches_is_empty_not_an_error() {
        let mux = multiplexer(true);
        let ids = mux.resolve_targets("-game/1*").await.unwrap();
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn talk_against_unknown_session_is_session_timed_out() {
        let mux = multiplexer(true);
        let err = mux.talk("missing", "GET /").await.unwrap_err();
        assert_eq!(err.code, 600);
    }
}
