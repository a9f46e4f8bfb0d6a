//! Command model and wire codec.
//!
//! A frame is a 4-byte big-endian length followed by exactly that many payload
//! bytes. The payload is a [`Command`] written field by field with bincode in
//! big-endian fixed-width layout: `code:i32`, `correlation_id:i32`, `flags:u8`,
//! `remark`, `headers`, `body`, `serialize_type:u8`. Strings, byte strings and
//! the header map carry a u64 length prefix.

use std::collections::HashMap;

use bincode::Options;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

use crate::error::{RemotingError, Result};

/// Largest payload a frame may carry.
pub const MAX_FRAME_LENGTH: usize = i32::MAX as usize;

/// Width of the frame length prefix in bytes.
pub const LENGTH_FIELD_LENGTH: usize = 4;

/// Status codes carried in the `code` field of response commands.
pub mod response_code {
    /// The request succeeded.
    pub const SUCCESS: i32 = 0;
    /// The processor failed.
    pub const SYSTEM_ERROR: i32 = 1;
    /// The peer refused the work for lack of capacity.
    pub const SYSTEM_BUSY: i32 = 2;
    /// No processor is registered for the request code.
    pub const REQUEST_CODE_NOT_SUPPORTED: i32 = 3;
}

/// Command flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandFlags(u8);

impl CommandFlags {
    /// Set on responses; clear on requests.
    pub const RESPONSE: CommandFlags = CommandFlags(0x01);
    /// Set on requests that expect no response.
    pub const ONEWAY: CommandFlags = CommandFlags(0x02);

    /// Returns true if every bit of `flag` is set.
    pub fn contains(&self, flag: CommandFlags) -> bool {
        (self.0 & flag.0) == flag.0
    }

    /// Returns a copy with `flag` set.
    pub fn with(mut self, flag: CommandFlags) -> Self {
        self.0 |= flag.0;
        self
    }

    /// Returns a copy with `flag` cleared.
    pub fn without(mut self, flag: CommandFlags) -> Self {
        self.0 &= !flag.0;
        self
    }

    /// Raw bits.
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Builds flags from raw bits.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }
}

/// A request or response exchanged between two remoting peers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Command {
    /// Request type for requests, status for responses.
    pub code: i32,
    /// Matches a response to its pending request.
    pub correlation_id: i32,
    /// Request/response and one-way bits.
    pub flags: CommandFlags,
    /// Free-form text, typically an error reason on responses.
    pub remark: String,
    /// Extension headers.
    pub headers: HashMap<String, String>,
    /// Opaque payload.
    pub body: Bytes,
    /// Serialization format of `body`, interpreted by the application.
    pub serialize_type: u8,
}

impl Command {
    /// Creates a request with the given code and body.
    pub fn request(code: i32, body: impl Into<Bytes>) -> Self {
        Self {
            code,
            body: body.into(),
            ..Self::default()
        }
    }

    /// Creates a response with the given status code and body.
    pub fn response(code: i32, body: impl Into<Bytes>) -> Self {
        Self {
            code,
            flags: CommandFlags::RESPONSE,
            body: body.into(),
            ..Self::default()
        }
    }

    /// Creates a bodiless response carrying `remark`, addressed to `correlation_id`.
    pub fn error_response(code: i32, correlation_id: i32, remark: impl Into<String>) -> Self {
        Self {
            code,
            correlation_id,
            flags: CommandFlags::RESPONSE,
            remark: remark.into(),
            ..Self::default()
        }
    }

    /// Sets the remark.
    pub fn with_remark(mut self, remark: impl Into<String>) -> Self {
        self.remark = remark.into();
        self
    }

    /// Adds a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Returns true for responses.
    pub fn is_response(&self) -> bool {
        self.flags.contains(CommandFlags::RESPONSE)
    }

    /// Returns true for one-way requests.
    pub fn is_oneway(&self) -> bool {
        self.flags.contains(CommandFlags::ONEWAY)
    }

    /// Converts an engine-generated error response into the matching error.
    ///
    /// Non-error codes pass through unchanged; application-defined statuses
    /// other than the reserved ones are left for the caller to interpret.
    pub fn into_result(self) -> Result<Command> {
        match self.code {
            response_code::SYSTEM_ERROR if self.is_response() => {
                Err(RemotingError::Processor(self.remark))
            }
            response_code::SYSTEM_BUSY if self.is_response() => {
                Err(RemotingError::SystemBusy { reason: self.remark })
            }
            response_code::REQUEST_CODE_NOT_SUPPORTED if self.is_response() => {
                let code = self
                    .headers
                    .get(REQUEST_CODE_HEADER)
                    .and_then(|c| c.parse().ok())
                    .unwrap_or_default();
                Err(RemotingError::UnsupportedRequestCode { code })
            }
            _ => Ok(self),
        }
    }
}

/// Header naming the rejected request code on `REQUEST_CODE_NOT_SUPPORTED` responses.
pub const REQUEST_CODE_HEADER: &str = "request_code";

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_big_endian()
        .with_fixint_encoding()
        .with_limit(MAX_FRAME_LENGTH as u64)
}

/// Serializes a command into a frame payload.
pub fn encode_command(command: &Command) -> Result<Bytes> {
    wire_options()
        .serialize(command)
        .map(Bytes::from)
        .map_err(|e| RemotingError::ProtocolEncode {
            reason: e.to_string(),
        })
}

/// Parses a frame payload into a command.
pub fn decode_command(payload: &[u8]) -> Result<Command> {
    wire_options()
        .deserialize(payload)
        .map_err(|e| RemotingError::ProtocolDecode {
            reason: e.to_string(),
        })
}

/// Length-prefix codec: 4-byte big-endian unsigned length, payload up to `i32::MAX`.
pub fn frame_codec() -> LengthDelimitedCodec {
    frame_codec_with_limit(MAX_FRAME_LENGTH)
}

/// Length-prefix codec accepting payloads up to `max_frame_length` bytes.
///
/// The decoder reserves buffer space for the declared length as soon as the
/// header arrives, so a peer can make a reader allocate up to this limit
/// before sending any payload. Longer declared lengths fail with
/// `InvalidData` without reserving anything.
pub fn frame_codec_with_limit(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(LENGTH_FIELD_LENGTH)
        .big_endian()
        .max_frame_length(max_frame_length.min(MAX_FRAME_LENGTH))
        .new_codec()
}
