//! RESP Reply Values
//!
//! Every reply pocketkv sends is a [`RespValue`]. Each variant maps to one
//! wire form, identified by its leading type byte and terminated by CRLF:
//!
//! | Variant        | Wire form              |
//! |----------------|------------------------|
//! | `SimpleString` | `+OK\r\n`              |
//! | `Error`        | `-ERR message\r\n`     |
//! | `Integer`      | `:42\r\n`              |
//! | `BulkString`   | `$5\r\nhello\r\n`      |
//! | `Null`         | `$-1\r\n`              |
//! | `Array`        | `*2\r\n...elements...` |
//!
//! Requests arrive as arrays of bulk strings, which is why `Array` is kept
//! here even though no command in the supported subset replies with one.

use bytes::Bytes;
use std::fmt;

/// Line terminator shared by every RESP frame.
pub const CRLF: &[u8] = b"\r\n";

/// Leading type bytes.
pub mod prefix {
    pub const SIMPLE_STRING: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK_STRING: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// A single RESP value, either decoded from a client or about to be sent to one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// Status reply. Must not contain CR or LF.
    SimpleString(String),

    /// Error reply. By convention the first word is an error class such as `ERR`.
    Error(String),

    /// Signed 64-bit integer.
    Integer(i64),

    /// Binary-safe, length-prefixed string.
    BulkString(Bytes),

    /// The null bulk string, used to report an absent key.
    Null,

    /// Ordered sequence of values.
    Array(Vec<RespValue>),
}

impl RespValue {
    pub fn simple_string(s: impl Into<String>) -> Self {
        RespValue::SimpleString(s.into())
    }

    /// Builds an error reply from a full message, class prefix included.
    ///
    /// ```
    /// use pocketkv::protocol::RespValue;
    /// assert_eq!(RespValue::error("ERR syntax error").serialize(), b"-ERR syntax error\r\n");
    /// ```
    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    pub fn integer(n: i64) -> Self {
        RespValue::Integer(n)
    }

    /// Builds a bulk string reply.
    ///
    /// ```
    /// use pocketkv::protocol::RespValue;
    /// assert_eq!(RespValue::bulk_string("hi").serialize(), b"$2\r\nhi\r\n");
    /// ```
    pub fn bulk_string(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(data.into())
    }

    pub fn null() -> Self {
        RespValue::Null
    }

    pub fn array(values: Vec<RespValue>) -> Self {
        RespValue::Array(values)
    }

    /// `+OK`
    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    /// `+PONG`
    pub fn pong() -> Self {
        RespValue::SimpleString("PONG".to_string())
    }

    /// Bulk string when a value is present, null bulk string otherwise.
    pub fn from_optional(value: Option<Bytes>) -> Self {
        match value {
            Some(v) => RespValue::BulkString(v),
            None => RespValue::Null,
        }
    }

    /// Encodes the value into a freshly allocated buffer.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len_hint());
        self.serialize_into(&mut buf);
        buf
    }

    /// Appends the wire encoding of this value to `buf`.
    ///
    /// The connection handler uses this to batch several pipelined replies
    /// into one write.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        match self {
            RespValue::SimpleString(s) => write_line(buf, prefix::SIMPLE_STRING, s.as_bytes()),
            RespValue::Error(s) => write_line(buf, prefix::ERROR, s.as_bytes()),
            RespValue::Integer(n) => write_line(buf, prefix::INTEGER, n.to_string().as_bytes()),
            RespValue::BulkString(data) => {
                write_line(buf, prefix::BULK_STRING, data.len().to_string().as_bytes());
                buf.extend_from_slice(data);
                buf.extend_from_slice(CRLF);
            }
            RespValue::Null => write_line(buf, prefix::BULK_STRING, b"-1"),
            RespValue::Array(values) => {
                write_line(buf, prefix::ARRAY, values.len().to_string().as_bytes());
                for value in values {
                    value.serialize_into(buf);
                }
            }
        }
    }

    fn encoded_len_hint(&self) -> usize {
        match self {
            RespValue::BulkString(data) => data.len() + 16,
            RespValue::SimpleString(s) | RespValue::Error(s) => s.len() + 3,
            _ => 16,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::Null)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::BulkString(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(n) => Some(*n),
            _ => None,
        }
    }
}

#[inline]
fn write_line(buf: &mut Vec<u8>, type_byte: u8, body: &[u8]) {
    buf.push(type_byte);
    buf.extend_from_slice(body);
    buf.extend_from_slice(CRLF);
}

/// Human-readable rendering in the style of `redis-cli`.
impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespValue::SimpleString(s) => write!(f, "{}", s),
            RespValue::Error(s) => write!(f, "(error) {}", s),
            RespValue::Integer(n) => write!(f, "(integer) {}", n),
            RespValue::BulkString(data) => match std::str::from_utf8(data) {
                Ok(s) => write!(f, "\"{}\"", s),
                Err(_) => write!(f, "(binary, {} bytes)", data.len()),
            },
            RespValue::Null => write!(f, "(nil)"),
            RespValue::Array(values) => {
                write!(f, "[")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_and_error_replies() {
        assert_eq!(RespValue::ok().serialize(), b"+OK\r\n");
        assert_eq!(RespValue::pong().serialize(), b"+PONG\r\n");
        assert_eq!(
            RespValue::error("ERR unknown command").serialize(),
            b"-ERR unknown command\r\n"
        );
    }

    #[test]
    fn test_integer_reply() {
        assert_eq!(RespValue::integer(0).serialize(), b":0\r\n");
        assert_eq!(RespValue::integer(-42).serialize(), b":-42\r\n");
        assert_eq!(
            RespValue::integer(i64::MIN).serialize(),
            b":-9223372036854775808\r\n"
        );
    }

    #[test]
    fn test_bulk_and_null_replies() {
        assert_eq!(RespValue::bulk_string("hello").serialize(), b"$5\r\nhello\r\n");
        assert_eq!(RespValue::bulk_string("").serialize(), b"$0\r\n\r\n");
        assert_eq!(RespValue::null().serialize(), b"$-1\r\n");
    }

    #[test]
    fn test_bulk_reply_is_binary_safe() {
        let value = RespValue::bulk_string(Bytes::from_static(b"a\r\n\x00b"));
        assert_eq!(value.serialize(), b"$5\r\na\r\n\x00b\r\n");
    }

    #[test]
    fn test_from_optional() {
        assert_eq!(
            RespValue::from_optional(Some(Bytes::from("v"))),
            RespValue::BulkString(Bytes::from("v"))
        );
        assert!(RespValue::from_optional(None).is_null());
    }

    #[test]
    fn test_array_encoding() {
        let value = RespValue::array(vec![
            RespValue::bulk_string("GET"),
            RespValue::bulk_string("name"),
        ]);
        assert_eq!(value.serialize(), b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n");
    }

    #[test]
    fn test_serialize_into_appends() {
        let mut buf = Vec::new();
        RespValue::ok().serialize_into(&mut buf);
        RespValue::integer(1).serialize_into(&mut buf);
        assert_eq!(buf, b"+OK\r\n:1\r\n");
    }

    #[test]
    fn test_display() {
        assert_eq!(RespValue::null().to_string(), "(nil)");
        assert_eq!(RespValue::integer(3).to_string(), "(integer) 3");
        assert_eq!(RespValue::bulk_string("x").to_string(), "\"x\"");
    }
}
