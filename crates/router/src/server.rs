//! The router's plain-text line protocol (§6 Multiplexer wire protocol).
//!
//! Unlike the RESP-framed file/user services, each router connection
//! carries exactly one request and its response; a multi-line response is
//! simply terminated by the connection closing, not by any in-band marker.

use std::sync::Arc;

use forge_protocol::line::{append_body, needs_body, read_body, split_command};
use forge_protocol::ServiceError;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::multiplexer::SessionMultiplexer;

pub async fn run(listener: TcpListener, multiplexer: Arc<SessionMultiplexer>) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let multiplexer = multiplexer.clone();
                tokio::spawn(async move {
                    tracing::debug!(%peer, "connection accepted");
                    if let Err(err) = handle_connection(stream, multiplexer).await {
                        tracing::warn!(%peer, error = %err, "connection ended with error");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received, stopping every live session");
                multiplexer.shutdown().await;
                return Ok(());
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, multiplexer: Arc<SessionMultiplexer>) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut line = String::new();
    if tokio::io::AsyncBufReadExt::read_line(&mut reader, &mut line).await? == 0 {
        return Ok(());
    }
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return Ok(());
    }

    let mut parts = line.splitn(2, ' ');
    let verb = parts.next().unwrap_or("").to_ascii_uppercase();
    let rest = parts.next().unwrap_or("");

    let response = match verb.as_str() {
        "PING" => "PONG\n".to_string(),
        "LIST" => render_list(&multiplexer).await,
        "INFO" => render_info(&multiplexer, rest.trim()).await,
        "S" => handle_talk(&multiplexer, rest, &mut reader).await,
        "CLOSE" | "RESTART" | "SAVE" | "SAVENN" => {
            handle_group_action(&multiplexer, &verb, rest.trim()).await
        }
        "NEW" => handle_new(&multiplexer, rest).await,
        "CONFIG" => render_config(&multiplexer),
        _ => format!("{}\n", ServiceError::bad_request()),
    };

    write_half.write_all(response.as_bytes()).await?;
    write_half.shutdown().await?;
    Ok(())
}

async fn render_list(multiplexer: &SessionMultiplexer) -> String {
    let summaries = multiplexer.list().await;
    let mut out = format!("200 OK, {} sessions\n", summaries.len());
    for s in summaries {
        out.push_str(&format!(
            "{} {} {} {} {} {}\n",
            s.id,
            s.pid,
            s.age_secs,
            s.used as u8,
            s.modified as u8,
            s.args.join(" ")
        ));
    }
    out
}

async fn render_info(multiplexer: &SessionMultiplexer, id: &str) -> String {
    match multiplexer.info(id).await {
        Ok(args) => {
            let mut out = "200 OK\n".to_string();
            for arg in args {
                out.push_str(&arg);
                out.push('\n');
            }
            out
        }
        Err(err) => format!("{err}\n"),
    }
}

fn render_config(multiplexer: &SessionMultiplexer) -> String {
    let config = multiplexer.config();
    format!(
        "200 OK\n\
         listen.address={}\n\
         listen.port={}\n\
         normal_timeout={}\n\
         virgin_timeout={}\n\
         max_sessions={}\n\
         new_sessions_win={}\n\
         play_server_path={}\n\
         file_server_address={}\n",
        config.listen.address,
        config.listen.port,
        config.normal_timeout,
        config.virgin_timeout,
        config.max_sessions,
        config.new_sessions_win,
        config.play_server_path,
        config.file_server_address,
    )
}

async fn handle_new(multiplexer: &SessionMultiplexer, rest: &str) -> String {
    let args = split_command(rest);
    match multiplexer.create_session(args).await {
        Ok(id) => format!("201 {id} Created\n"),
        Err(err) => format!("{err}\n"),
    }
}

/// `S <id> <child-command...>`. If the embedded child command is `POST`, the
/// dot-terminated body that follows on the wire is read and folded into the
/// text handed to `Session::talk`.
async fn handle_talk<R>(multiplexer: &SessionMultiplexer, rest: &str, reader: &mut R) -> String
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut parts = rest.splitn(2, ' ');
    let id = parts.next().unwrap_or("").to_string();
    let mut cmd = parts.next().unwrap_or("").to_string();

    if let Some(first_word) = cmd.split_whitespace().next() {
        if needs_body(first_word) {
            match read_body(reader).await {
                Ok(body) => append_body(&mut cmd, &body),
                Err(err) => return format!("{}\n", io_error_to_service_error(&err)),
            }
        }
    }

    match multiplexer.talk(&id, &cmd).await {
        Ok(reply) => format!("{reply}\n"),
        Err(err) => format!("{err}\n"),
    }
}

fn io_error_to_service_error(err: &std::io::Error) -> ServiceError {
    tracing::warn!(error = %err, "failed to read POST body");
    ServiceError::session_timed_out()
}

async fn handle_group_action(multiplexer: &SessionMultiplexer, verb: &str, target: &str) -> String {
    let ids = match multiplexer.resolve_targets(target).await {
        Ok(ids) => ids,
        Err(err) => return format!("{err}\n"),
    };

    for id in &ids {
        let result = match verb {
            "CLOSE" => multiplexer.close(id).await,
            "RESTART" => multiplexer.restart(id).await,
            "SAVE" => multiplexer.save(id, true).await,
            "SAVENN" => multiplexer.save(id, false).await,
            _ => unreachable!("dispatch only reaches here for the four group-action verbs"),
        };
        if let Err(err) = result {
            tracing::warn!(session_id = %id, verb, error = %err, "group action failed for session");
        }
    }

    let mut out = "200 OK\n".to_string();
    for id in ids {
        out.push_str(&id);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_common::NumericalIdGenerator;
    use forge_protocol::RouterConfig;
    use std::sync::Arc;
    use tokio::io::BufReader;

    /// A fake play server that distinguishes a completed `POST` (consumes
    /// lines up to a lone `.`, then acks with the command line it started
    /// with) from any other command (acked immediately with the line it
    /// received). If framing ever emits a stray extra `.` line after a
    /// POST's real terminator, this script reads it back as a brand-new,
    /// unsolicited command and queues a reply nobody asked for -- which then
    /// desyncs the very next `talk()`, caught by the test below.
    #[cfg(unix)]
    fn echoing_play_server() -> (tempfile::TempDir, std::path::PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo-playserver.sh");
        std::fs::write(
            &path,
            "#!/bin/sh\n\
             echo \"100 ready\"\n\
             while IFS= read -r line; do\n\
             \x20\x20case \"$line\" in\n\
             \x20\x20\x20\x20POST*)\n\
             \x20\x20\x20\x20\x20\x20while IFS= read -r bline; do\n\
             \x20\x20\x20\x20\x20\x20\x20\x20[ \"$bline\" = \".\" ] && break\n\
             \x20\x20\x20\x20\x20\x20done\n\
             \x20\x20\x20\x20\x20\x20echo \"100 posted:$line\"\n\
             \x20\x20\x20\x20\x20\x20;;\n\
             \x20\x20\x20\x20*)\n\
             \x20\x20\x20\x20\x20\x20echo \"100 got:$line\"\n\
             \x20\x20\x20\x20\x20\x20;;\n\
             \x20\x20esac\n\
             done\n",
        )
        .unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn post_body_carries_exactly_one_dot_terminator() {
        let (_dir, script) = echoing_play_server();
        let config = RouterConfig { play_server_path: script.to_string_lossy().into_owned(), ..RouterConfig::default() };
        let multiplexer = Arc::new(SessionMultiplexer::new(config, Arc::new(NumericalIdGenerator::new())));
        let id = multiplexer.create_session(vec![]).await.unwrap();

        let mut body_reader = BufReader::new(std::io::Cursor::new(b"line one\n.\n".to_vec()));
        let post_reply = handle_talk(&multiplexer, &format!("{id} POST somepath"), &mut body_reader).await;
        assert_eq!(post_reply, "100 posted:POST somepath\n");

        let mut empty_reader = BufReader::new(std::io::Cursor::new(Vec::new()));
        let next_reply = handle_talk(&multiplexer, &format!("{id} GET /"), &mut empty_reader).await;
        assert_eq!(
            next_reply, "100 got:GET /\n",
            "a stray extra dot line after the POST terminator would have queued a phantom reply here"
        );
    }
}
