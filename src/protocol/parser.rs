//! Incremental RESP Decoder
//!
//! Decoding is a pure function of the bytes buffered so far. Each call returns
//! one of:
//!
//! - `Ok(Some((value, consumed)))`: a complete frame occupying the first
//!   `consumed` bytes of the buffer
//! - `Ok(None)`: the frame is not complete yet, read more and call again
//! - `Err(ParseError)`: the bytes cannot be RESP; the stream is desynchronized
//!
//! Nothing is remembered between calls, so the caller simply retries with a
//! longer buffer after each socket read and advances past `consumed` bytes on
//! success.
//!
//! A retry first walks the frame's headers to find where it ends, skipping
//! bulk payloads by their declared length, and builds values only once the
//! whole frame is buffered. Payload bytes are therefore copied once, but the
//! headers of a large array arriving over many reads are rescanned on each
//! read.
//!
//! Two entry points exist: [`decode_command`] for client requests (arrays of
//! bulk strings, or inline commands) and [`parse_message`] for arbitrary RESP
//! values, which is what a client of the server needs to read replies.

use crate::protocol::types::{prefix, RespValue, CRLF};
use bytes::Bytes;
use thiserror::Error;

/// Largest accepted bulk string payload (512 MB, same as Redis).
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Largest accepted element count in a single array.
pub const MAX_ARRAY_LEN: usize = 1024 * 1024;

/// Longest header or inline-command line accepted before giving up on
/// finding its CRLF.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Maximum array nesting depth.
pub const MAX_NESTING_DEPTH: usize = 32;

/// Longest slice of a rejected header quoted back in an error.
const MAX_ERROR_EXCERPT: usize = 32;

/// Irrecoverable decoding failures. Once one of these is returned the frame
/// boundary is unknown and the connection cannot continue.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid bulk length")]
    InvalidBulkLength,

    #[error("invalid multibulk length")]
    InvalidMultibulkLength,

    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("bulk string missing trailing CRLF")]
    MissingCrlf,

    #[error("too big inline request")]
    LineTooLong,

    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("maximum nesting depth exceeded")]
    NestingTooDeep,
}

pub type ParseResult<T> = Result<T, ParseError>;

/// A complete client request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Command name followed by its arguments. Empty for blank inline lines
    /// and null or empty arrays, which are skipped.
    Command(Vec<Bytes>),

    /// A well-formed RESP value that is not a valid request. Its boundary is
    /// known, so the connection can report the problem and keep going.
    Invalid(&'static str),
}

/// Decodes one client request from the front of `buf`.
///
/// ```
/// use pocketkv::protocol::{decode_command, Frame};
///
/// let (frame, consumed) = decode_command(b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n").unwrap().unwrap();
/// assert_eq!(consumed, 20);
/// assert_eq!(frame, Frame::Command(vec!["GET".into(), "k".into()]));
/// ```
pub fn decode_command(buf: &[u8]) -> ParseResult<Option<(Frame, usize)>> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };

    match first {
        prefix::ARRAY => {
            let Some((value, consumed)) = parse_complete(buf)? else {
                return Ok(None);
            };
            Ok(Some((into_command(value), consumed)))
        }
        prefix::SIMPLE_STRING | prefix::ERROR | prefix::INTEGER | prefix::BULK_STRING => {
            Ok(parse_value(buf, 0)?.map(|(_, consumed)| {
                (Frame::Invalid("expected an array of bulk strings"), consumed)
            }))
        }
        _ => parse_inline(buf),
    }
}

/// Decodes any single RESP value from the front of `buf`.
pub fn parse_message(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }
    parse_complete(buf)
}

/// Builds the value at the front of `buf` once all of it has arrived.
fn parse_complete(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    match frame_len(buf, 0)? {
        Some(len) => parse_value(&buf[..len], 0),
        None => Ok(None),
    }
}

/// Length of the complete value at the front of `buf`, found without
/// building it. Structural errors are reported as soon as they are seen;
/// the contents of simple strings, errors and integers are checked later by
/// [`parse_value`].
fn frame_len(buf: &[u8], depth: usize) -> ParseResult<Option<usize>> {
    if depth > MAX_NESTING_DEPTH {
        return Err(ParseError::NestingTooDeep);
    }

    let Some(line_end) = find_line_end(&buf[1..])? else {
        return Ok(None);
    };
    let header = &buf[1..1 + line_end];
    let after_header = 1 + line_end + CRLF.len();

    match buf[0] {
        prefix::SIMPLE_STRING | prefix::ERROR | prefix::INTEGER => Ok(Some(after_header)),
        prefix::BULK_STRING => {
            let Some(length) = bulk_len(header)? else {
                return Ok(Some(after_header));
            };
            let total = after_header + length + CRLF.len();
            if buf.len() < total {
                return Ok(None);
            }
            if &buf[after_header + length..total] != CRLF {
                return Err(ParseError::MissingCrlf);
            }
            Ok(Some(total))
        }
        prefix::ARRAY => {
            let Some(count) = array_len(header)? else {
                return Ok(Some(after_header));
            };
            let mut consumed = after_header;
            for _ in 0..count {
                if consumed >= buf.len() {
                    return Ok(None);
                }
                match frame_len(&buf[consumed..], depth + 1)? {
                    Some(used) => consumed += used,
                    None => return Ok(None),
                }
            }
            Ok(Some(consumed))
        }
        _ => Err(ParseError::InvalidMultibulkLength),
    }
}

/// Declared payload length of a bulk string; `None` for the null bulk.
fn bulk_len(header: &[u8]) -> ParseResult<Option<usize>> {
    let length = parse_i64(header).ok_or(ParseError::InvalidBulkLength)?;

    if length == -1 {
        return Ok(None);
    }
    if length < 0 {
        return Err(ParseError::InvalidBulkLength);
    }

    let length = length as usize;
    if length > MAX_BULK_SIZE {
        return Err(ParseError::MessageTooLarge {
            size: length,
            max: MAX_BULK_SIZE,
        });
    }
    Ok(Some(length))
}

/// Declared element count of an array; `None` for the null array.
fn array_len(header: &[u8]) -> ParseResult<Option<usize>> {
    let count = parse_i64(header).ok_or(ParseError::InvalidMultibulkLength)?;

    if count == -1 {
        return Ok(None);
    }
    if count < 0 || count as u64 > MAX_ARRAY_LEN as u64 {
        return Err(ParseError::InvalidMultibulkLength);
    }
    Ok(Some(count as usize))
}

fn into_command(value: RespValue) -> Frame {
    match value {
        RespValue::Null => Frame::Command(Vec::new()),
        RespValue::Array(elements) => {
            let mut args = Vec::with_capacity(elements.len());
            for element in elements {
                match element {
                    RespValue::BulkString(b) => args.push(b),
                    _ => return Frame::Invalid("expected '$' for every request argument"),
                }
            }
            Frame::Command(args)
        }
        _ => Frame::Invalid("expected an array of bulk strings"),
    }
}

fn parse_value(buf: &[u8], depth: usize) -> ParseResult<Option<(RespValue, usize)>> {
    if depth > MAX_NESTING_DEPTH {
        return Err(ParseError::NestingTooDeep);
    }

    let Some(line_end) = find_line_end(&buf[1..])? else {
        return Ok(None);
    };
    let header = &buf[1..1 + line_end];
    let after_header = 1 + line_end + CRLF.len();

    match buf[0] {
        prefix::SIMPLE_STRING => {
            let s = to_str(header, "simple string")?;
            Ok(Some((RespValue::SimpleString(s.to_string()), after_header)))
        }
        prefix::ERROR => {
            let s = to_str(header, "error")?;
            Ok(Some((RespValue::Error(s.to_string()), after_header)))
        }
        prefix::INTEGER => {
            let n = parse_i64(header).ok_or_else(|| ParseError::InvalidInteger(excerpt(header)))?;
            Ok(Some((RespValue::Integer(n), after_header)))
        }
        prefix::BULK_STRING => parse_bulk_body(buf, header, after_header),
        prefix::ARRAY => parse_array_body(buf, header, after_header, depth),
        // Inside an array every element must carry a type byte.
        _ => Err(ParseError::InvalidMultibulkLength),
    }
}

fn parse_bulk_body(
    buf: &[u8],
    header: &[u8],
    data_start: usize,
) -> ParseResult<Option<(RespValue, usize)>> {
    let Some(length) = bulk_len(header)? else {
        return Ok(Some((RespValue::Null, data_start)));
    };

    let total = data_start + length + CRLF.len();
    if buf.len() < total {
        return Ok(None);
    }
    if &buf[data_start + length..total] != CRLF {
        return Err(ParseError::MissingCrlf);
    }

    let data = Bytes::copy_from_slice(&buf[data_start..data_start + length]);
    Ok(Some((RespValue::BulkString(data), total)))
}

fn parse_array_body(
    buf: &[u8],
    header: &[u8],
    mut consumed: usize,
    depth: usize,
) -> ParseResult<Option<(RespValue, usize)>> {
    let Some(count) = array_len(header)? else {
        return Ok(Some((RespValue::Null, consumed)));
    };
    // Capacity is bounded by what could possibly be buffered, not by the
    // advertised count.
    let mut elements = Vec::with_capacity(count.min(buf.len() / 4 + 1));

    for _ in 0..count {
        if consumed >= buf.len() {
            return Ok(None);
        }
        match parse_value(&buf[consumed..], depth + 1)? {
            Some((value, used)) => {
                elements.push(value);
                consumed += used;
            }
            None => return Ok(None),
        }
    }

    Ok(Some((RespValue::Array(elements), consumed)))
}

/// Inline commands are single whitespace separated lines, as typed into a
/// telnet session. A bare `\n` terminator is tolerated.
fn parse_inline(buf: &[u8]) -> ParseResult<Option<(Frame, usize)>> {
    let Some(newline) = buf.iter().position(|&b| b == b'\n') else {
        if buf.len() > MAX_LINE_LEN {
            return Err(ParseError::LineTooLong);
        }
        return Ok(None);
    };
    if newline > MAX_LINE_LEN {
        return Err(ParseError::LineTooLong);
    }

    let line = &buf[..newline];
    let line = line.strip_suffix(b"\r").unwrap_or(line);

    let args = line
        .split(|b| b.is_ascii_whitespace())
        .filter(|part| !part.is_empty())
        .map(Bytes::copy_from_slice)
        .collect();

    Ok(Some((Frame::Command(args), newline + 1)))
}

/// Finds the CRLF ending the line at the start of `buf`.
fn find_line_end(buf: &[u8]) -> ParseResult<Option<usize>> {
    match buf.windows(2).position(|w| w == CRLF) {
        Some(pos) if pos > MAX_LINE_LEN => Err(ParseError::LineTooLong),
        Some(pos) => Ok(Some(pos)),
        None if buf.len() > MAX_LINE_LEN => Err(ParseError::LineTooLong),
        None => Ok(None),
    }
}

fn parse_i64(digits: &[u8]) -> Option<i64> {
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// Error text ends up in a status reply, which must stay on one line.
fn excerpt(bytes: &[u8]) -> String {
    String::from_utf8_lossy(&bytes[..bytes.len().min(MAX_ERROR_EXCERPT)])
        .chars()
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .collect()
}

fn to_str<'a>(bytes: &'a [u8], what: &'static str) -> ParseResult<&'a str> {
    std::str::from_utf8(bytes).map_err(|_| ParseError::InvalidUtf8(what))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(parts: &[&str]) -> Frame {
        Frame::Command(parts.iter().map(|p| Bytes::from(p.to_string())).collect())
    }

    #[test]
    fn test_decode_set_command() {
        let input = b"*3\r\n$3\r\nSET\r\n$8\r\nuser:101\r\n$4\r\nAriz\r\n";
        let (frame, consumed) = decode_command(input).unwrap().unwrap();
        assert_eq!(frame, command(&["SET", "user:101", "Ariz"]));
        assert_eq!(consumed, input.len());
    }

    #[test]
    fn test_decode_waits_for_every_split_point() {
        let input = b"*2\r\n$3\r\nGET\r\n$5\r\nhello\r\n";
        for cut in 0..input.len() {
            assert_eq!(decode_command(&input[..cut]), Ok(None), "cut at {}", cut);
        }
        assert!(decode_command(input).unwrap().is_some());
    }

    #[test]
    fn test_decode_leaves_pipelined_remainder() {
        let input = b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nPI";
        let (frame, consumed) = decode_command(input).unwrap().unwrap();
        assert_eq!(frame, command(&["PING"]));
        assert_eq!(consumed, 14);
        assert_eq!(decode_command(&input[consumed..]), Ok(None));
    }

    #[test]
    fn test_decode_binary_argument() {
        let input = b"*2\r\n$3\r\nGET\r\n$5\r\nhe\r\no\r\n";
        let (frame, _) = decode_command(input).unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::Command(vec![
                Bytes::from_static(b"GET"),
                Bytes::from_static(b"he\r\no")
            ])
        );
    }

    #[test]
    fn test_decode_inline_command() {
        let (frame, consumed) = decode_command(b"SET  key   value\r\nGET").unwrap().unwrap();
        assert_eq!(frame, command(&["SET", "key", "value"]));
        assert_eq!(consumed, 18);

        let (frame, consumed) = decode_command(b"\r\n").unwrap().unwrap();
        assert_eq!(frame, Frame::Command(vec![]));
        assert_eq!(consumed, 2);
    }

    #[test]
    fn test_frame_len_skips_bulk_payloads() {
        let input = b"*3\r\n$3\r\nDEL\r\n$2\r\nk1\r\n$2\r\nk2\r\n";
        assert_eq!(frame_len(input, 0), Ok(Some(input.len())));
        for cut in 1..input.len() {
            assert_eq!(frame_len(&input[..cut], 0), Ok(None), "cut at {}", cut);
        }

        // A large argument list arriving piecemeal is only measured.
        let mut partial = format!("*{}\r\n", MAX_ARRAY_LEN).into_bytes();
        for _ in 0..1000 {
            partial.extend_from_slice(b"$3\r\nkey\r\n");
        }
        assert_eq!(frame_len(&partial, 0), Ok(None));
        assert_eq!(decode_command(&partial), Ok(None));

        // Structural errors surface before the frame is complete.
        partial.extend_from_slice(b"$-7\r\n");
        assert_eq!(decode_command(&partial), Err(ParseError::InvalidBulkLength));
    }

    #[test]
    fn test_decode_non_array_frame_is_recoverable() {
        let (frame, consumed) = decode_command(b":5\r\n*1\r\n$4\r\nPING\r\n").unwrap().unwrap();
        assert!(matches!(frame, Frame::Invalid(_)));
        assert_eq!(consumed, 4);

        let (frame, consumed) = decode_command(b"*2\r\n$3\r\nGET\r\n:1\r\n").unwrap().unwrap();
        assert!(matches!(frame, Frame::Invalid(_)));
        assert_eq!(consumed, 17);
    }

    #[test]
    fn test_decode_rejects_malformed_lengths() {
        assert_eq!(
            decode_command(b"*x\r\n"),
            Err(ParseError::InvalidMultibulkLength)
        );
        assert_eq!(
            decode_command(b"*1\r\n$abc\r\n"),
            Err(ParseError::InvalidBulkLength)
        );
        assert_eq!(
            decode_command(b"*1\r\n$-5\r\n"),
            Err(ParseError::InvalidBulkLength)
        );
        assert_eq!(
            decode_command(b"*-3\r\n"),
            Err(ParseError::InvalidMultibulkLength)
        );
    }

    #[test]
    fn test_decode_rejects_truncated_bulk() {
        // Declared length 3 but 5 bytes precede the terminator.
        assert_eq!(
            decode_command(b"*1\r\n$3\r\nhello\r\n"),
            Err(ParseError::MissingCrlf)
        );
    }

    #[test]
    fn test_decode_rejects_oversized_input() {
        let header = format!("*1\r\n${}\r\n", MAX_BULK_SIZE + 1);
        assert!(matches!(
            decode_command(header.as_bytes()),
            Err(ParseError::MessageTooLarge { .. })
        ));

        let endless = vec![b'a'; MAX_LINE_LEN + 2];
        assert_eq!(decode_command(&endless), Err(ParseError::LineTooLong));
    }

    #[test]
    fn test_null_and_empty_arrays_are_empty_commands() {
        assert_eq!(
            decode_command(b"*-1\r\n").unwrap().unwrap(),
            (Frame::Command(vec![]), 5)
        );
        assert_eq!(
            decode_command(b"*0\r\n").unwrap().unwrap(),
            (Frame::Command(vec![]), 4)
        );
    }

    #[test]
    fn test_parse_message_reply_types() {
        assert_eq!(
            parse_message(b"+OK\r\n").unwrap().unwrap(),
            (RespValue::SimpleString("OK".into()), 5)
        );
        assert_eq!(
            parse_message(b"-ERR boom\r\n").unwrap().unwrap(),
            (RespValue::Error("ERR boom".into()), 11)
        );
        assert_eq!(
            parse_message(b":-42\r\n").unwrap().unwrap(),
            (RespValue::Integer(-42), 6)
        );
        assert_eq!(
            parse_message(b"$-1\r\n").unwrap().unwrap(),
            (RespValue::Null, 5)
        );
        assert_eq!(
            parse_message(b"$0\r\n\r\n").unwrap().unwrap(),
            (RespValue::BulkString(Bytes::new()), 6)
        );
        assert!(matches!(
            parse_message(b":nope\r\n"),
            Err(ParseError::InvalidInteger(_))
        ));
    }

    #[test]
    fn test_invalid_integer_error_is_single_line() {
        assert_eq!(
            parse_message(b":1\n2\r\n"),
            Err(ParseError::InvalidInteger("1 2".into()))
        );

        let long = format!(":{}\r\n", "9".repeat(100));
        match parse_message(long.as_bytes()) {
            Err(ParseError::InvalidInteger(text)) => assert_eq!(text.len(), MAX_ERROR_EXCERPT),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_nested_array() {
        let (value, _) = parse_message(b"*2\r\n:1\r\n*1\r\n:2\r\n").unwrap().unwrap();
        assert_eq!(
            value,
            RespValue::Array(vec![
                RespValue::Integer(1),
                RespValue::Array(vec![RespValue::Integer(2)]),
            ])
        );
    }

    #[test]
    fn test_nesting_limit() {
        let deep = "*1\r\n".repeat(MAX_NESTING_DEPTH + 2);
        assert_eq!(
            parse_message(deep.as_bytes()),
            Err(ParseError::NestingTooDeep)
        );
    }

    #[test]
    fn test_encoded_request_decodes_back() {
        let request = RespValue::array(vec![
            RespValue::bulk_string("GETSET"),
            RespValue::bulk_string("k"),
            RespValue::bulk_string("v"),
        ]);
        let (frame, consumed) = decode_command(&request.serialize()).unwrap().unwrap();
        assert_eq!(frame, command(&["GETSET", "k", "v"]));
        assert_eq!(consumed, request.serialize().len());
    }
}
