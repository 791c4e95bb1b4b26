//! Streaming RESP Decoder
//!
//! The decoder reads a byte source line by line and yields a lazy
//! sequence of payloads: each payload is either a decoded [`RespValue`]
//! or an error. Protocol errors (a malformed length, an unparsable
//! integer) are reported in-band and the stream keeps going; I/O errors
//! and end-of-stream are reported and the stream closes.
//!
//! Decoding runs in a spawned task that feeds an `mpsc` channel, so the
//! consumer sees payloads as they arrive without owning the read loop:
//!
//! ```ignore
//! let mut payloads = parse_stream(socket);
//! while let Some(payload) = payloads.recv().await {
//!     match payload {
//!         Ok(reply) => handle(reply),
//!         Err(ParseError::Eof) => break,
//!         Err(err) => return Err(err.into()),
//!     }
//! }
//! ```
//!
//! Lines that are too short to carry a frame or that lack the `\r\n`
//! terminator are skipped: replication traffic interleaves empty
//! keep-alive lines between records, and they are not errors.

use crate::protocol::types::RespValue;
use bytes::Bytes;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::trace;

/// Errors surfaced by the decoder.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Malformed framing; the stream continues past it.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The byte source reached end-of-stream; the stream closes.
    #[error("end of stream")]
    Eof,

    /// The byte source failed; the stream closes.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One item of the decoded sequence: a reply or the error that stopped
/// (or interrupted) decoding.
pub type Payload = Result<RespValue, ParseError>;

/// Channel capacity between the decode task and its consumer.
const PAYLOAD_BUFFER: usize = 64;

/// Decodes a byte source into a stream of payloads.
///
/// A background task owns the reader and pushes payloads into the
/// returned channel as records complete. After an [`ParseError::Eof`] or
/// [`ParseError::Io`] payload the channel closes; dropping the receiver
/// stops the task.
pub fn parse_stream<R>(reader: R) -> mpsc::Receiver<Payload>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(PAYLOAD_BUFFER);
    tokio::spawn(decode_loop(BufReader::new(reader), tx));
    rx
}

/// Decodes the first payload of `data`.
pub async fn parse_one(data: &[u8]) -> Result<RespValue, ParseError> {
    let mut payloads = parse_stream(io::Cursor::new(data.to_vec()));
    match payloads.recv().await {
        Some(Ok(reply)) => Ok(reply),
        Some(Err(err)) => Err(err),
        None => Err(ParseError::Eof),
    }
}

/// Decodes every payload of `data`, draining the source to end-of-stream.
pub async fn parse_all(data: &[u8]) -> Result<Vec<RespValue>, ParseError> {
    let mut payloads = parse_stream(io::Cursor::new(data.to_vec()));
    let mut replies = Vec::new();
    while let Some(payload) = payloads.recv().await {
        match payload {
            Ok(reply) => replies.push(reply),
            Err(ParseError::Eof) => break,
            Err(err) => return Err(err),
        }
    }
    Ok(replies)
}

/// Reads records until the source ends, fails, or the receiver is
/// dropped.
async fn decode_loop<R>(mut reader: BufReader<R>, tx: mpsc::Sender<Payload>)
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => {
                let _ = tx.send(Err(ParseError::Eof)).await;
                return;
            }
            Ok(_) => {}
            Err(err) => {
                let _ = tx.send(Err(ParseError::Io(err))).await;
                return;
            }
        }

        let len = line.len();
        if len <= 2 || line[len - 2] != b'\r' {
            // Keep-alive noise between records; not a frame.
            trace!(len, "skipping non-frame line");
            continue;
        }
        let rest = &line[1..len - 2];

        let alive = match line[0] {
            b'+' => {
                send(&tx, Ok(RespValue::SimpleString(lossy(rest)))).await
            }
            b'-' => send(&tx, Ok(RespValue::Error(lossy(rest)))).await,
            b':' => match parse_i64(rest) {
                Some(n) => send(&tx, Ok(RespValue::Integer(n))).await,
                None => protocol_error(&tx, format!("illegal number {}", lossy(rest))).await,
            },
            b'$' => match decode_bulk(rest, &mut reader, &tx).await {
                Ok(alive) => alive,
                Err(()) => return,
            },
            b'*' => match decode_array(rest, &mut reader, &tx).await {
                Ok(alive) => alive,
                Err(()) => return,
            },
            _ => {
                // No sigil: an inline command, split on single spaces.
                let tokens = line[..len - 2]
                    .split(|&b| b == b' ')
                    .map(|token| RespValue::BulkString(Bytes::copy_from_slice(token)))
                    .collect();
                send(&tx, Ok(RespValue::Array(tokens))).await
            }
        };
        if !alive {
            return;
        }
    }
}

/// Decodes a bulk string body after its `$<len>` header line.
///
/// `Ok(alive)` keeps the stream open; `Err(())` closes it (the error
/// payload has already been sent).
async fn decode_bulk<R>(
    header: &[u8],
    reader: &mut BufReader<R>,
    tx: &mpsc::Sender<Payload>,
) -> Result<bool, ()>
where
    R: AsyncRead + Unpin,
{
    let len = match parse_i64(header) {
        Some(len) if len >= -1 => len,
        _ => {
            return Ok(protocol_error(tx, format!("illegal bulk string header ${}", lossy(header)))
                .await)
        }
    };
    if len == -1 {
        return Ok(send(tx, Ok(RespValue::Null)).await);
    }

    let mut body = vec![0u8; len as usize + 2];
    if let Err(err) = reader.read_exact(&mut body).await {
        // A truncated body is unrecoverable; report and close.
        let _ = tx.send(Err(ParseError::Io(err))).await;
        return Err(());
    }
    if &body[body.len() - 2..] != b"\r\n" {
        return Ok(protocol_error(tx, "bulk string missing trailing CRLF".to_string()).await);
    }
    body.truncate(len as usize);
    Ok(send(tx, Ok(RespValue::BulkString(Bytes::from(body)))).await)
}

/// Decodes a multi-bulk body after its `*<count>` header line. Every
/// inner element must be a bulk string.
async fn decode_array<R>(
    header: &[u8],
    reader: &mut BufReader<R>,
    tx: &mpsc::Sender<Payload>,
) -> Result<bool, ()>
where
    R: AsyncRead + Unpin,
{
    let count = match parse_i64(header) {
        Some(count) if count >= 0 => count,
        _ => {
            return Ok(protocol_error(tx, format!("illegal array header *{}", lossy(header)))
                .await)
        }
    };
    if count == 0 {
        return Ok(send(tx, Ok(RespValue::Array(Vec::new()))).await);
    }

    let mut items = Vec::with_capacity(count as usize);
    let mut line = Vec::new();
    for _ in 0..count {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => {
                let _ = tx.send(Err(ParseError::Eof)).await;
                return Err(());
            }
            Ok(_) => {}
            Err(err) => {
                let _ = tx.send(Err(ParseError::Io(err))).await;
                return Err(());
            }
        }

        let len = line.len();
        if len < 4 || line[len - 2] != b'\r' || line[0] != b'$' {
            // Abandon the partial array; the stream itself survives.
            return Ok(
                protocol_error(tx, format!("illegal bulk string header {}", lossy(&line)))
                    .await,
            );
        }
        let inner_len = match parse_i64(&line[1..len - 2]) {
            Some(inner_len) if inner_len >= -1 => inner_len,
            _ => {
                return Ok(protocol_error(
                    tx,
                    format!("illegal bulk string header {}", lossy(&line)),
                )
                .await)
            }
        };

        if inner_len == -1 {
            items.push(RespValue::Null);
            continue;
        }
        let mut body = vec![0u8; inner_len as usize + 2];
        if let Err(err) = reader.read_exact(&mut body).await {
            let _ = tx.send(Err(ParseError::Io(err))).await;
            return Err(());
        }
        if &body[body.len() - 2..] != b"\r\n" {
            return Ok(protocol_error(tx, "bulk string missing trailing CRLF".to_string()).await);
        }
        body.truncate(inner_len as usize);
        items.push(RespValue::BulkString(Bytes::from(body)));
    }
    Ok(send(tx, Ok(RespValue::Array(items))).await)
}

/// Sends one payload; `false` means the receiver is gone and decoding
/// should stop.
async fn send(tx: &mpsc::Sender<Payload>, payload: Payload) -> bool {
    tx.send(payload).await.is_ok()
}

async fn protocol_error(tx: &mpsc::Sender<Payload>, msg: String) -> bool {
    send(tx, Err(ParseError::Protocol(msg))).await
}

fn parse_i64(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn one(data: &[u8]) -> RespValue {
        parse_one(data).await.unwrap()
    }

    #[tokio::test]
    async fn test_parse_simple_string() {
        assert_eq!(
            one(b"+OK\r\n").await,
            RespValue::SimpleString("OK".to_string())
        );
    }

    #[tokio::test]
    async fn test_parse_error_reply() {
        assert_eq!(
            one(b"-ERR unknown command\r\n").await,
            RespValue::Error("ERR unknown command".to_string())
        );
    }

    #[tokio::test]
    async fn test_parse_integer() {
        assert_eq!(one(b":1000\r\n").await, RespValue::Integer(1000));
        assert_eq!(one(b":-42\r\n").await, RespValue::Integer(-42));
    }

    #[tokio::test]
    async fn test_parse_bulk_string() {
        assert_eq!(
            one(b"$5\r\nhello\r\n").await,
            RespValue::BulkString(Bytes::from("hello"))
        );
    }

    #[tokio::test]
    async fn test_parse_empty_bulk_string() {
        assert_eq!(
            one(b"$0\r\n\r\n").await,
            RespValue::BulkString(Bytes::new())
        );
    }

    #[tokio::test]
    async fn test_parse_null_bulk_string() {
        assert_eq!(one(b"$-1\r\n").await, RespValue::Null);
    }

    #[tokio::test]
    async fn test_parse_binary_safe_bulk() {
        assert_eq!(
            one(b"$5\r\nhe\x00lo\r\n").await,
            RespValue::BulkString(Bytes::from(&b"he\x00lo"[..]))
        );
    }

    #[tokio::test]
    async fn test_parse_array() {
        assert_eq!(
            one(b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n").await,
            RespValue::Array(vec![
                RespValue::BulkString(Bytes::from("GET")),
                RespValue::BulkString(Bytes::from("foo")),
            ])
        );
    }

    #[tokio::test]
    async fn test_parse_empty_array() {
        assert_eq!(one(b"*0\r\n").await, RespValue::Array(vec![]));
    }

    #[tokio::test]
    async fn test_parse_array_with_null_element() {
        assert_eq!(
            one(b"*2\r\n$1\r\na\r\n$-1\r\n").await,
            RespValue::Array(vec![
                RespValue::BulkString(Bytes::from("a")),
                RespValue::Null,
            ])
        );
    }

    #[tokio::test]
    async fn test_parse_inline_command() {
        assert_eq!(
            one(b"PING\r\n").await,
            RespValue::Array(vec![RespValue::BulkString(Bytes::from("PING"))])
        );
        assert_eq!(
            one(b"SET key value\r\n").await,
            RespValue::Array(vec![
                RespValue::BulkString(Bytes::from("SET")),
                RespValue::BulkString(Bytes::from("key")),
                RespValue::BulkString(Bytes::from("value")),
            ])
        );
    }

    #[tokio::test]
    async fn test_noise_lines_are_skipped() {
        // Bare newlines and \n-only lines between records are tolerated.
        let replies = parse_all(b"\n\n+OK\r\n\n:1\r\n").await.unwrap();
        assert_eq!(
            replies,
            vec![
                RespValue::SimpleString("OK".to_string()),
                RespValue::Integer(1),
            ]
        );
    }

    #[tokio::test]
    async fn test_malformed_integer_continues_stream() {
        let mut payloads = parse_stream(io::Cursor::new(b":abc\r\n+OK\r\n".to_vec()));

        let first = payloads.recv().await.unwrap();
        assert!(matches!(first, Err(ParseError::Protocol(_))));

        let second = payloads.recv().await.unwrap();
        assert_eq!(second.unwrap(), RespValue::SimpleString("OK".to_string()));

        assert!(matches!(
            payloads.recv().await.unwrap(),
            Err(ParseError::Eof)
        ));
    }

    #[tokio::test]
    async fn test_negative_bulk_length_is_protocol_error() {
        let mut payloads = parse_stream(io::Cursor::new(b"$-2\r\n+OK\r\n".to_vec()));
        assert!(matches!(
            payloads.recv().await.unwrap(),
            Err(ParseError::Protocol(_))
        ));
        // The stream continues past the bad header.
        assert_eq!(
            payloads.recv().await.unwrap().unwrap(),
            RespValue::SimpleString("OK".to_string())
        );
    }

    #[tokio::test]
    async fn test_negative_array_count_is_protocol_error() {
        let mut payloads = parse_stream(io::Cursor::new(b"*-1\r\n".to_vec()));
        assert!(matches!(
            payloads.recv().await.unwrap(),
            Err(ParseError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_array_with_non_bulk_element_is_protocol_error() {
        let mut payloads = parse_stream(io::Cursor::new(b"*1\r\n:5\r\n+OK\r\n".to_vec()));
        assert!(matches!(
            payloads.recv().await.unwrap(),
            Err(ParseError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_bulk_closes_stream() {
        let mut payloads = parse_stream(io::Cursor::new(b"$10\r\nshort\r\n".to_vec()));
        assert!(matches!(
            payloads.recv().await.unwrap(),
            Err(ParseError::Io(_))
        ));
        assert!(payloads.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_eof_payload_closes_stream() {
        let mut payloads = parse_stream(io::Cursor::new(b"+OK\r\n".to_vec()));
        assert!(payloads.recv().await.unwrap().is_ok());
        assert!(matches!(
            payloads.recv().await.unwrap(),
            Err(ParseError::Eof)
        ));
        assert!(payloads.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_parse_all_drains_pipeline() {
        let replies = parse_all(b"+OK\r\n:7\r\n$3\r\nfoo\r\n*1\r\n$1\r\nx\r\n")
            .await
            .unwrap();
        assert_eq!(replies.len(), 4);
        assert_eq!(replies[1], RespValue::Integer(7));
    }

    #[tokio::test]
    async fn test_parse_one_empty_input() {
        assert!(matches!(parse_one(b"").await, Err(ParseError::Eof)));
    }

    #[tokio::test]
    async fn test_round_trip_every_reply_kind() {
        let replies = vec![
            RespValue::simple_string("OK"),
            RespValue::error("ERR bad"),
            RespValue::integer(-7),
            RespValue::bulk_string(Bytes::from("payload")),
            RespValue::bulk_string(Bytes::new()),
            RespValue::null(),
            RespValue::array(vec![
                RespValue::bulk_string(Bytes::from("GET")),
                RespValue::bulk_string(Bytes::from("foo")),
            ]),
            RespValue::array(vec![]),
        ];
        for reply in replies {
            let encoded = reply.serialize();
            assert_eq!(parse_one(&encoded).await.unwrap(), reply, "{reply:?}");
        }
    }

    #[tokio::test]
    async fn test_decode_then_encode_is_identity() {
        // A decoded request re-encodes to the same bytes.
        let wire = b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n";
        let decoded = parse_one(wire).await.unwrap();
        assert_eq!(decoded.serialize(), wire);
    }
}
