//! RESP reply types and encoders.
//!
//! Every RESP frame starts with a type prefix byte and every logical
//! component ends with CRLF:
//!
//! - `+OK\r\n` simple status
//! - `-ERR unknown command\r\n` error
//! - `:1000\r\n` integer
//! - `$5\r\nhello\r\n` bulk string (`$-1\r\n` for the null bulk)
//! - `*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n` array
//!
//! Bulk strings are binary safe; everything else is ASCII framing.

use bytes::Bytes;

/// The CRLF terminator every RESP component ends with.
pub const CRLF: &[u8] = b"\r\n";

/// RESP type prefix bytes.
pub mod prefix {
    pub const SIMPLE_STRING: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK_STRING: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// A decoded RESP value, usable for both requests and replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// Non-binary-safe one-line string: `+<string>\r\n`.
    SimpleString(String),

    /// Error condition: `-<message>\r\n`.
    Error(String),

    /// Signed 64-bit integer: `:<n>\r\n`.
    Integer(i64),

    /// Binary-safe string: `$<len>\r\n<data>\r\n`.
    BulkString(Bytes),

    /// The null bulk string, `$-1\r\n`.
    Null,

    /// Array of values: `*<count>\r\n<elements>`. Requests arrive as
    /// arrays of bulk strings (a multi-bulk).
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Creates a simple string reply.
    pub fn simple_string(s: impl Into<String>) -> Self {
        RespValue::SimpleString(s.into())
    }

    /// Creates an error reply.
    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    /// Creates an integer reply.
    pub fn integer(n: i64) -> Self {
        RespValue::Integer(n)
    }

    /// Creates a bulk string reply.
    pub fn bulk_string(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(data.into())
    }

    /// Creates the null bulk reply.
    pub fn null() -> Self {
        RespValue::Null
    }

    /// Creates an array reply.
    pub fn array(values: Vec<RespValue>) -> Self {
        RespValue::Array(values)
    }

    /// The canonical `+OK\r\n` reply.
    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    /// Encodes the value into its wire form.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Encodes the value into an existing buffer, which is cheaper when a
    /// buffer is being reused across replies.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        match self {
            RespValue::SimpleString(s) => {
                buf.push(prefix::SIMPLE_STRING);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::Error(s) => {
                buf.push(prefix::ERROR);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::Integer(n) => {
                buf.push(prefix::INTEGER);
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::BulkString(data) => {
                buf.push(prefix::BULK_STRING);
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                buf.extend_from_slice(data);
                buf.extend_from_slice(CRLF);
            }
            RespValue::Null => {
                buf.push(prefix::BULK_STRING);
                buf.extend_from_slice(b"-1");
                buf.extend_from_slice(CRLF);
            }
            RespValue::Array(values) => {
                buf.push(prefix::ARRAY);
                buf.extend_from_slice(values.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                for value in values {
                    value.serialize_into(buf);
                }
            }
        }
    }

    /// Returns `true` if this is the null bulk.
    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::Null)
    }

    /// Returns `true` if this is an error reply.
    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// Returns the inner bytes of a bulk string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::BulkString(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the inner string of a simple string or UTF-8 bulk.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::SimpleString(s) => Some(s),
            RespValue::BulkString(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Returns the inner integer.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the inner elements of an array.
    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self {
            RespValue::Array(values) => Some(values),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_string_serialize() {
        assert_eq!(RespValue::simple_string("OK").serialize(), b"+OK\r\n");
    }

    #[test]
    fn test_error_serialize() {
        assert_eq!(
            RespValue::error("ERR unknown command").serialize(),
            b"-ERR unknown command\r\n"
        );
    }

    #[test]
    fn test_integer_serialize() {
        assert_eq!(RespValue::integer(1000).serialize(), b":1000\r\n");
        assert_eq!(RespValue::integer(-42).serialize(), b":-42\r\n");
        assert_eq!(RespValue::integer(0).serialize(), b":0\r\n");
    }

    #[test]
    fn test_bulk_string_serialize() {
        assert_eq!(
            RespValue::bulk_string(Bytes::from("hello")).serialize(),
            b"$5\r\nhello\r\n"
        );
        // Bulk strings are binary safe, including interior CRLF and NUL.
        assert_eq!(
            RespValue::bulk_string(Bytes::from(&b"a\r\n\x00b"[..])).serialize(),
            b"$5\r\na\r\n\x00b\r\n"
        );
    }

    #[test]
    fn test_empty_bulk_serialize() {
        assert_eq!(
            RespValue::bulk_string(Bytes::new()).serialize(),
            b"$0\r\n\r\n"
        );
    }

    #[test]
    fn test_null_serialize() {
        assert_eq!(RespValue::null().serialize(), b"$-1\r\n");
    }

    #[test]
    fn test_array_serialize() {
        let value = RespValue::array(vec![
            RespValue::bulk_string(Bytes::from("GET")),
            RespValue::bulk_string(Bytes::from("foo")),
        ]);
        assert_eq!(value.serialize(), b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n");
    }

    #[test]
    fn test_empty_array_serialize() {
        assert_eq!(RespValue::array(vec![]).serialize(), b"*0\r\n");
    }

    #[test]
    fn test_array_with_null_element() {
        let value = RespValue::array(vec![
            RespValue::bulk_string(Bytes::from("a")),
            RespValue::Null,
        ]);
        assert_eq!(value.serialize(), b"*2\r\n$1\r\na\r\n$-1\r\n");
    }

    #[test]
    fn test_nested_array_serialize() {
        let value = RespValue::array(vec![
            RespValue::integer(1),
            RespValue::array(vec![RespValue::integer(2), RespValue::integer(3)]),
        ]);
        assert_eq!(value.serialize(), b"*2\r\n:1\r\n*2\r\n:2\r\n:3\r\n");
    }

    #[test]
    fn test_accessors() {
        assert_eq!(RespValue::integer(7).as_integer(), Some(7));
        assert_eq!(RespValue::simple_string("PONG").as_str(), Some("PONG"));
        assert_eq!(
            RespValue::bulk_string(Bytes::from("x")).as_bytes(),
            Some(&b"x"[..])
        );
        assert!(RespValue::null().is_null());
        assert!(RespValue::error("ERR").is_error());
        assert!(RespValue::array(vec![]).as_array().unwrap().is_empty());
    }
}
