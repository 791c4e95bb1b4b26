//! RESP wire protocol: reply types, encoders, and the streaming decoder.
//!
//! RESP is the framed, ASCII-prefixed format Redis clients and servers
//! exchange. [`types`] defines the [`RespValue`] reply union and its
//! encoders; [`parser`] decodes a byte source into a lazy sequence of
//! payloads.
//!
//! ```ignore
//! use corekv::protocol::{parse_one, RespValue};
//!
//! let request = parse_one(b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n").await?;
//! let response = RespValue::bulk_string("bar").serialize();
//! ```

pub mod parser;
pub mod types;

pub use parser::{parse_all, parse_one, parse_stream, ParseError, Payload};
pub use types::RespValue;
