//! Wire protocol layer
//!
//! This module implements the symmetric request/response protocol: two
//! interchangeable textual encodings over one uniform structured
//! representation, the message envelope, and the streaming response writer.

pub mod codec;
pub mod message;
pub mod writer;

use std::collections::HashMap;

// Re-export commonly used types
pub use codec::{
    decode, encode, parameter_map_from_structured, structured_from_parameter_map,
};
pub use message::{field, WireMessage};
pub use writer::{MergeMode, ResponseWriter, WriterState};

/// Flat multi-valued parameter map shared by requests, responses and the
/// transport collaborator interface.
pub type ParamMap = HashMap<String, Vec<String>>;

/// The two supported structured text encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    Json,
    Xml,
}

impl Default for Encoding {
    fn default() -> Self {
        Encoding::Json
    }
}

impl Encoding {
    /// Parse an encoding name as carried in the `encoding-in`/`encoding-out`
    /// parameters.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Encoding::Json),
            "xml" => Some(Encoding::Xml),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Encoding::Json => "json",
            Encoding::Xml => "xml",
        }
    }

    /// Detect the encoding of previously-produced bytes.
    ///
    /// The first non-whitespace byte decides: `<` means XML, anything else
    /// JSON.
    pub fn sniff(bytes: &[u8]) -> Self {
        for b in bytes {
            if b.is_ascii_whitespace() {
                continue;
            }
            return if *b == b'<' {
                Encoding::Xml
            } else {
                Encoding::Json
            };
        }
        Encoding::Json
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Peek the wire error code out of a framed response without decoding it.
///
/// The protocol guarantees `error-code` is the earliest field in both
/// encodings, so a bounded prefix scan is enough. Returns `None` when the
/// bytes do not look like a framed message.
pub fn peek_error_code(bytes: &[u8]) -> Option<u32> {
    let prefix_len = bytes.len().min(96);
    let prefix = std::str::from_utf8(&bytes[..prefix_len]).ok()?;
    let digits = match Encoding::sniff(bytes) {
        Encoding::Json => prefix.split("\"error-code\":").nth(1)?,
        Encoding::Xml => prefix.split("<error-code>").nth(1)?,
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end].parse().ok()
}
