//! RESP-style (Redis-like) wire framing used by the file and user services.
//!
//! A command is an array of bulk strings: `*<n>\r\n($<len>\r\n<bytes>\r\n)+`.
//! A reply is one of the five RESP value kinds below. The framing is
//! intentionally a subset of real RESP -- just enough to carry argv-style
//! commands and scalar/array/error replies over a `TcpStream`.

use std::fmt;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ServiceError;

#[derive(Debug, thiserror::Error)]
pub enum RespError {
    #[error("connection closed mid-frame")]
    UnexpectedEof,
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A parsed RESP reply value.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    Simple(String),
    Error(ServiceError),
    Integer(i64),
    /// `None` is RESP's nil bulk string (`$-1\r\n`).
    Bulk(Option<Vec<u8>>),
    Array(Vec<RespValue>),
}

impl RespValue {
    pub fn ok() -> Self {
        RespValue::Simple("OK".to_string())
    }

    pub fn bulk(s: impl Into<Vec<u8>>) -> Self {
        RespValue::Bulk(Some(s.into()))
    }

    pub fn nil() -> Self {
        RespValue::Bulk(None)
    }

    pub fn error(err: ServiceError) -> Self {
        RespValue::Error(err)
    }

    /// Returns the bulk payload as a UTF-8 string, if this value is a
    /// non-nil bulk string containing valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::Bulk(Some(bytes)) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    /// Converts an error reply into `Err`, passing everything else through.
    pub fn into_result(self) -> Result<RespValue, ServiceError> {
        match self {
            RespValue::Error(err) => Err(err),
            other => Ok(other),
        }
    }
}

/// Reads one command: a RESP array of bulk strings, returned as plain
/// `String`s for ease of dispatch. Returns `Ok(None)` on a clean EOF between
/// commands (no bytes read at all); any other truncation is an error.
pub async fn read_command<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<String>>, RespError> {
    let mut header = String::new();
    let n = reader.read_line(&mut header).await?;
    if n == 0 {
        return Ok(None);
    }
    let header = header.trim_end_matches(['\r', '\n']);
    let count: usize = match header.strip_prefix('*') {
        Some(rest) => rest
            .parse()
            .map_err(|_| RespError::Malformed(format!("bad array header: {header:?}")))?,
        None => return Err(RespError::Malformed(format!("expected array header, got {header:?}"))),
    };

    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        let mut len_line = String::new();
        if reader.read_line(&mut len_line).await? == 0 {
            return Err(RespError::UnexpectedEof);
        }
        let len_line = len_line.trim_end_matches(['\r', '\n']);
        let len: usize = len_line
            .strip_prefix('$')
            .and_then(|rest| rest.parse().ok())
            .ok_or_else(|| RespError::Malformed(format!("bad bulk header: {len_line:?}")))?;

        let mut buf = vec![0u8; len + 2];
        tokio::io::AsyncReadExt::read_exact(reader, &mut buf)
            .await
            .map_err(|_| RespError::UnexpectedEof)?;
        buf.truncate(len);
        let s = String::from_utf8(buf).map_err(|e| RespError::Malformed(e.to_string()))?;
        args.push(s);
    }
    Ok(Some(args))
}

/// Writes a command as a RESP array of bulk strings.
pub async fn write_command<W: AsyncWrite + Unpin>(
    writer: &mut W,
    args: &[impl AsRef<str>],
) -> Result<(), RespError> {
    let mut buf = format!("*{}\r\n", args.len());
    for arg in args {
        let arg = arg.as_ref();
        buf.push_str(&format!("${}\r\n{}\r\n", arg.len(), arg));
    }
    writer.write_all(buf.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Writes a reply value in RESP form.
pub async fn write_value<W: AsyncWrite + Unpin>(
    writer: &mut W,
    value: &RespValue,
) -> Result<(), RespError> {
    let mut buf = Vec::new();
    encode_value(value, &mut buf);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

fn encode_value(value: &RespValue, buf: &mut Vec<u8>) {
    match value {
        RespValue::Simple(s) => {
            buf.extend_from_slice(b"+");
            buf.extend_from_slice(s.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        RespValue::Error(err) => {
            buf.extend_from_slice(b"-");
            buf.extend_from_slice(err.to_string().as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        RespValue::Integer(i) => {
            buf.extend_from_slice(format!(":{i}\r\n").as_bytes());
        }
        RespValue::Bulk(None) => {
            buf.extend_from_slice(b"$-1\r\n");
        }
        RespValue::Bulk(Some(bytes)) => {
            buf.extend_from_slice(format!("${}\r\n", bytes.len()).as_bytes());
            buf.extend_from_slice(bytes);
            buf.extend_from_slice(b"\r\n");
        }
        RespValue::Array(items) => {
            buf.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
            for item in items {
                encode_value(item, buf);
            }
        }
    }
}

/// Reads a single reply value off the wire. Used by clients that call
/// another service (the router calling the file service's `FORGET`, for
/// instance) rather than by the command dispatch loop itself.
pub async fn read_value<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<RespValue, RespError> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(RespError::UnexpectedEof);
    }
    let line = line.trim_end_matches(['\r', '\n']);
    let (tag, rest) = line
        .split_at_checked(1)
        .ok_or_else(|| RespError::Malformed("empty reply line".to_string()))?;
    match tag {
        "+" => Ok(RespValue::Simple(rest.to_string())),
        "-" => Ok(RespValue::Error(ServiceError::parse(rest))),
        ":" => rest
            .parse()
            .map(RespValue::Integer)
            .map_err(|_| RespError::Malformed(format!("bad integer: {rest:?}"))),
        "$" => {
            let len: i64 = rest
                .parse()
                .map_err(|_| RespError::Malformed(format!("bad bulk header: {rest:?}")))?;
            if len < 0 {
                return Ok(RespValue::Bulk(None));
            }
            let mut buf = vec![0u8; len as usize + 2];
            tokio::io::AsyncReadExt::read_exact(reader, &mut buf)
                .await
                .map_err(|_| RespError::UnexpectedEof)?;
            buf.truncate(len as usize);
            Ok(RespValue::Bulk(Some(buf)))
        }
        "*" => {
            let count: i64 = rest
                .parse()
                .map_err(|_| RespError::Malformed(format!("bad array header: {rest:?}")))?;
            if count < 0 {
                return Ok(RespValue::Array(Vec::new()));
            }
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                items.push(Box::pin(read_value(reader)).await?);
            }
            Ok(RespValue::Array(items))
        }
        other => Err(RespError::Malformed(format!("unknown reply tag: {other:?}"))),
    }
}

/// A minimal RESP client for service-to-service calls, e.g. the router
/// notifying the file service of a `FORGET` after a session save. Opens one
/// connection per call -- these are low-frequency, best-effort
/// notifications, not a hot path worth pooling.
pub struct RespClient;

impl RespClient {
    pub async fn call(address: &str, args: &[impl AsRef<str>]) -> Result<RespValue, RespError> {
        let stream = tokio::net::TcpStream::connect(address).await?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = tokio::io::BufReader::new(read_half);
        write_command(&mut write_half, args).await?;
        read_value(&mut reader).await
    }
}

impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespValue::Simple(s) => write!(f, "+{s}"),
            RespValue::Error(e) => write!(f, "-{e}"),
            RespValue::Integer(i) => write!(f, ":{i}"),
            RespValue::Bulk(None) => write!(f, "$-1"),
            RespValue::Bulk(Some(b)) => write!(f, "${}", String::from_utf8_lossy(b)),
            RespValue::Array(items) => write!(f, "*{}", items.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn command_roundtrips() {
        let mut buf = Vec::new();
        write_command(&mut buf, &["SET", "k", "v"]).await.unwrap();
        let mut reader = BufReader::new(Cursor::new(buf));
        let args = read_command(&mut reader).await.unwrap().unwrap();
        assert_eq!(args, vec!["SET", "k", "v"]);
    }

    #[tokio::test]
    async fn read_command_returns_none_on_clean_eof() {
        let mut reader = BufReader::new(Cursor::new(Vec::<u8>::new()));
        assert!(read_command(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_command_rejects_non_array_header() {
        let mut reader = BufReader::new(Cursor::new(b"hello\r\n".to_vec()));
        assert!(read_command(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn read_command_errors_on_truncated_bulk() {
        let mut reader = BufReader::new(Cursor::new(b"*1\r\n$5\r\nhi\r\n".to_vec()));
        assert!(matches!(
            read_command(&mut reader).await,
            Err(RespError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn value_roundtrips_nested_array() {
        let value = RespValue::Array(vec![
            RespValue::bulk("alpha"),
            RespValue::Integer(42),
            RespValue::nil(),
        ]);
        let mut buf = Vec::new();
        write_value(&mut buf, &value).await.unwrap();
        let mut reader = BufReader::new(Cursor::new(buf));
        let decoded = read_value(&mut reader).await.unwrap();
        assert_eq!(decoded, value);
    }

    #[tokio::test]
    async fn error_value_roundtrips_through_service_error() {
        let value = RespValue::error(ServiceError::permission_denied());
        let mut buf = Vec::new();
        write_value(&mut buf, &value).await.unwrap();
        let mut reader = BufReader::new(Cursor::new(buf));
        match read_value(&mut reader).await.unwrap() {
            RespValue::Error(err) => assert_eq!(err.code, 403),
            other => panic!("expected error value, got {other:?}"),
        }
    }

    #[test]
    fn into_result_surfaces_errors() {
        let value = RespValue::error(ServiceError::not_found());
        assert!(value.into_result().is_err());
    }

    #[tokio::test]
    async fn resp_client_round_trips_a_command_against_a_real_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let args = read_command(&mut reader).await.unwrap().unwrap();
            assert_eq!(args, vec!["FORGET", "x/y"]);
            write_value(&mut write_half, &RespValue::ok()).await.unwrap();
        });

        let reply = RespClient::call(&address, &["FORGET", "x/y"]).await.unwrap();
        assert_eq!(reply, RespValue::ok());
    }
}
