//! Line-oriented protocol helpers for the session router.
//!
//! Most router commands are a single line (`verb arg arg...`); `POST` carries
//! a multi-line body terminated by a line containing a lone `.`, mirroring
//! SMTP-style dot-terminated bodies. This module only deals with framing --
//! splitting a line into tokens, detecting which verbs carry a body, reading
//! that body off the wire, and the conflict-key wildcard matching rule used
//! by session arbitration.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Splits a command line into whitespace-separated tokens. No quoting is
/// supported -- arguments containing spaces are not expressible on the wire,
/// matching the plain-text nature of the protocol.
pub fn split_command(line: &str) -> Vec<String> {
    line.split_whitespace().map(str::to_string).collect()
}

/// True if `verb` introduces a command whose body is a dot-terminated block
/// of additional lines rather than being fully contained in the command line
/// itself.
pub fn needs_body(verb: &str) -> bool {
    verb.eq_ignore_ascii_case("POST")
}

/// Reads a dot-terminated multi-line body, excluding the terminating `.`
/// line. Returns the body with internal newlines preserved and no trailing
/// newline.
pub async fn read_body<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<String> {
    let mut body = String::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            break;
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed == "." {
            break;
        }
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str(trimmed);
    }
    Ok(body)
}

/// Folds a just-read body onto its command line, producing `"<cmd>\n<body>"`
/// with no trailing newline. The dot terminator itself is added exactly
/// once, by the session's `talk()` when it detects the command is a `POST`
/// (see `Session::talk_locked`) -- adding it here too would leave a stray
/// lone-`.` line after the body terminator on the wire.
pub fn append_body(command: &mut String, body: &str) {
    command.push('\n');
    command.push_str(body);
}

/// A conflict marker is a `-R<key>` (read) or `-W<key>` (write) prefixed
/// argument on a session's command line, used to detect when two sessions
/// would step on the same resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictMarker {
    pub kind: ConflictKind,
    pub key: String,
}

/// Parses a single argument as a conflict marker, if it is one.
pub fn parse_conflict_marker(arg: &str) -> Option<ConflictMarker> {
    if let Some(key) = arg.strip_prefix("-R") {
        Some(ConflictMarker { kind: ConflictKind::Read, key: key.to_string() })
    } else if let Some(key) = arg.strip_prefix("-W") {
        Some(ConflictMarker { kind: ConflictKind::Write, key: key.to_string() })
    } else {
        None
    }
}

/// Matches two conflict keys under the wildcard rule: a key ending in `*`
/// matches any key sharing its prefix up to (and including) the next `/`
/// boundary, or being exactly that prefix. Two keys with no wildcard must
/// match exactly.
pub fn keys_conflict(a: &str, b: &str) -> bool {
    match (a.strip_suffix('*'), b.strip_suffix('*')) {
        (None, None) => a == b,
        (Some(prefix), None) => prefix_matches(prefix, b),
        (None, Some(prefix)) => prefix_matches(prefix, a),
        (Some(prefix_a), Some(prefix_b)) => {
            prefix_a.starts_with(prefix_b) || prefix_b.starts_with(prefix_a)
        }
    }
}

fn prefix_matches(prefix: &str, key: &str) -> bool {
    if !key.starts_with(prefix) {
        return false;
    }
    let rest = &key[prefix.len()..];
    rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/')
}

/// Two conflict markers conflict if their keys conflict and at least one of
/// them is a write -- two concurrent readers of the same key never conflict.
pub fn markers_conflict(a: &ConflictMarker, b: &ConflictMarker) -> bool {
    if a.kind == ConflictKind::Read && b.kind == ConflictKind::Read {
        return false;
    }
    keys_conflict(&a.key, &b.key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_command_tokenizes_on_whitespace() {
        assert_eq!(split_command("S 12 LIST /"), vec!["S", "12", "LIST", "/"]);
    }

    #[test]
    fn post_needs_body_case_insensitively() {
        assert!(needs_body("post"));
        assert!(needs_body("POST"));
        assert!(!needs_body("SAVE"));
    }

    #[tokio::test]
    async fn read_body_stops_at_lone_dot() {
        let mut reader = tokio::io::BufReader::new(std::io::Cursor::new(
            b"line one\nline two\n.\nextra\n".to_vec(),
        ));
        let body = read_body(&mut reader).await.unwrap();
        assert_eq!(body, "line one\nline two");
    }

    #[test]
    fn parse_conflict_marker_recognizes_read_and_write() {
        assert_eq!(
            parse_conflict_marker("-Rgame/1"),
            Some(ConflictMarker { kind: ConflictKind::Read, key: "game/1".to_string() })
        );
        assert_eq!(
            parse_conflict_marker("-Wgame/1"),
            Some(ConflictMarker { kind: ConflictKind::Write, key: "game/1".to_string() })
        );
        assert_eq!(parse_conflict_marker("game/1"), None);
    }

    #[test]
    fn exact_keys_require_equality() {
        assert!(keys_conflict("game/1", "game/1"));
        assert!(!keys_conflict("game/1", "game/2"));
    }

    #[test]
    fn wildcard_matches_on_slash_boundary() {
        assert!(keys_conflict("game/*", "game/1"));
        assert!(keys_conflict("game/*", "game/1/turn"));
        assert!(keys_conflict("game/*", "game/"));
        assert!(!keys_conflict("game/*", "gamex/1"));
    }

    #[test]
    fn two_wildcards_match_on_shared_prefix() {
        assert!(keys_conflict("game/*", "game/sub*"));
        assert!(!keys_conflict("game/*", "other/*"));
    }

    #[test]
    fn readers_of_same_key_never_conflict() {
        let a = ConflictMarker { kind: ConflictKind::Read, key: "game/1".to_string() };
        let b = ConflictMarker { kind: ConflictKind::Read, key: "game/1".to_string() };
        assert!(!markers_conflict(&a, &b));
    }

    #[test]
    fn writer_conflicts_with_reader_of_same_key() {
        let w = ConflictMarker { kind: ConflictKind::Write, key: "game/1".to_string() };
        let r = ConflictMarker { kind: ConflictKind::Read, key: "game/1".to_string() };
        assert!(markers_conflict(&w, &r));
    }
}
