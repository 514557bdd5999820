//! RESP codec.
//!
//! - `types`: [`RespValue`] and its wire encoding
//! - `parser`: incremental decoding of requests and replies
//!
//! Both halves are stateless; one connection can decode and encode any
//! number of frames without carrying codec state between them.

pub mod parser;
pub mod types;

pub use parser::{decode_command, parse_message, Frame, ParseError, ParseResult};
pub use types::RespValue;
