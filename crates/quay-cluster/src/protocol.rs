//! Wire protocol for cluster config propagation
//!
//! Frames are a big-endian `u32` length followed by a `postcard` body.

use crate::error::{ClusterError, Result};
use crate::topology::ClusterConfig;
use serde::{Deserialize, Serialize};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u16 = 1;

/// Minimum protocol version we can interoperate with
pub const MIN_PROTOCOL_VERSION: u16 = 1;

/// Maximum message size (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Error codes for protocol-level errors
pub mod error_codes {
    /// Unsupported protocol version
    pub const UNSUPPORTED_VERSION: u16 = 1;
    /// Message too large
    pub const MESSAGE_TOO_LARGE: u16 = 2;
    /// The receiver rejected the request
    pub const REJECTED: u16 = 3;
}

/// Request header included in all requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestHeader {
    /// Protocol version
    pub version: u16,
    /// Correlation ID for matching responses
    pub correlation_id: u64,
    /// Advertised uri of the sender
    pub source: String,
}

impl RequestHeader {
    pub fn new(correlation_id: u64, source: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            correlation_id,
            source: source.into(),
        }
    }

    /// Validate that the protocol version is supported.
    /// Returns an error ResponseHeader if the version is out of range.
    pub fn validate_version(&self) -> std::result::Result<(), ResponseHeader> {
        if self.version < MIN_PROTOCOL_VERSION || self.version > PROTOCOL_VERSION {
            Err(ResponseHeader::error(
                self.correlation_id,
                error_codes::UNSUPPORTED_VERSION,
                format!(
                    "unsupported protocol version {}: supported range [{}, {}]",
                    self.version, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION
                ),
            ))
        } else {
            Ok(())
        }
    }
}

/// Response header included in all responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseHeader {
    /// Correlation ID matching the request
    pub correlation_id: u64,
    /// Error code (0 = success)
    pub error_code: u16,
    /// Error message (if any)
    pub error_message: Option<String>,
}

impl ResponseHeader {
    pub fn success(correlation_id: u64) -> Self {
        Self {
            correlation_id,
            error_code: 0,
            error_message: None,
        }
    }

    pub fn error(correlation_id: u64, code: u16, message: impl Into<String>) -> Self {
        Self {
            correlation_id,
            error_code: code,
            error_message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error_code == 0
    }
}

/// Requests exchanged between controllers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[allow(clippy::large_enum_variant)]
pub enum ClusterRequest {
    // ==================== Two-Phase Apply ====================
    /// Accept a candidate config for a later commit
    Prepare {
        header: RequestHeader,
        config: ClusterConfig,
    },

    /// Make the prepared candidate visible
    Commit { header: RequestHeader, version: u64 },

    /// Drop the prepared candidate
    Abort { header: RequestHeader, version: u64 },

    // ==================== Catch-up ====================
    /// Ask for the committed config
    FetchConfig { header: RequestHeader },
}

impl ClusterRequest {
    pub fn header(&self) -> &RequestHeader {
        match self {
            ClusterRequest::Prepare { header, .. }
            | ClusterRequest::Commit { header, .. }
            | ClusterRequest::Abort { header, .. }
            | ClusterRequest::FetchConfig { header } => header,
        }
    }

    /// Operation name for logs
    pub fn name(&self) -> &'static str {
        match self {
            ClusterRequest::Prepare { .. } => "prepare",
            ClusterRequest::Commit { .. } => "commit",
            ClusterRequest::Abort { .. } => "abort",
            ClusterRequest::FetchConfig { .. } => "fetch_config",
        }
    }
}

/// Responses to [`ClusterRequest`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[allow(clippy::large_enum_variant)]
pub enum ClusterResponse {
    Prepared { header: ResponseHeader, version: u64 },
    Committed { header: ResponseHeader, version: u64 },
    Aborted { header: ResponseHeader, version: u64 },
    Config {
        header: ResponseHeader,
        config: ClusterConfig,
    },
    Error { header: ResponseHeader },
}

impl ClusterResponse {
    pub fn header(&self) -> &ResponseHeader {
        match self {
            ClusterResponse::Prepared { header, .. }
            | ClusterResponse::Committed { header, .. }
            | ClusterResponse::Aborted { header, .. }
            | ClusterResponse::Config { header, .. }
            | ClusterResponse::Error { header } => header,
        }
    }

    /// Build an error response from a rejected request
    pub fn rejected(correlation_id: u64, err: &ClusterError) -> Self {
        ClusterResponse::Error {
            header: ResponseHeader::error(correlation_id, error_codes::REJECTED, err.to_string()),
        }
    }

    /// Turn an error response into `Err`, keeping the peer's message
    pub fn into_result(self) -> Result<ClusterResponse> {
        match self {
            ClusterResponse::Error { header } => Err(ClusterError::Rejected(
                header
                    .error_message
                    .unwrap_or_else(|| format!("error code {}", header.error_code)),
            )),
            other => Ok(other),
        }
    }
}

/// Encode a request to bytes
pub fn encode_request(request: &ClusterRequest) -> Result<Vec<u8>> {
    postcard::to_allocvec(request).map_err(|e| ClusterError::Serialization(e.to_string()))
}

/// Decode a request from bytes
pub fn decode_request(bytes: &[u8]) -> Result<ClusterRequest> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(ClusterError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    postcard::from_bytes(bytes).map_err(|e| ClusterError::Deserialization(e.to_string()))
}

/// Encode a response to bytes
pub fn encode_response(response: &ClusterResponse) -> Result<Vec<u8>> {
    postcard::to_allocvec(response).map_err(|e| ClusterError::Serialization(e.to_string()))
}

/// Decode a response from bytes
pub fn decode_response(bytes: &[u8]) -> Result<ClusterResponse> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(ClusterError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    postcard::from_bytes(bytes).map_err(|e| ClusterError::Deserialization(e.to_string()))
}

/// Frame a message with length prefix for TCP transmission
pub fn frame_message(data: &[u8]) -> Vec<u8> {
    let len = data.len() as u32;
    let mut framed = Vec::with_capacity(4 + data.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(data);
    framed
}

/// Extract message length from frame header
pub fn frame_length(header: &[u8; 4]) -> usize {
    u32::from_be_bytes(*header) as usize
}
