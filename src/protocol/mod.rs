// src/protocol/mod.rs

//! Line protocol spoken between a proc subsystem and its runner child:
//! newline-delimited UTF-8 JSON objects over stdin/stdout.

pub mod line;

pub use line::{
    Line, LogPayload, StartPayload, decode_line, encode_line, messages, read_raw_line, write_line,
};

/// Fresh correlation token (UUID v4, simple form).
pub fn new_req_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
