//! Framed messages of the agent socket protocol.
//!
//! Every message travels as `[u32 big-endian payload length][payload]` where
//! the payload is a fixed sequence of msgpack values. Two messages exist: the
//! request header a client sends first, and the response summary an agent sends
//! back (also used as the preamble of a retrieve).

use std::fmt;
use std::str::FromStr;

use jade_storage::StorageFormat;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

/// Size of the length prefix in bytes.
pub const FRAME_SIZE_PREFIX: usize = 4;

/// Largest accepted payload. Headers and responses are small; anything bigger
/// is a corrupt or hostile length prefix.
pub const MAX_FRAME_SIZE: u32 = 1 << 20;

/// Operation requested by a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    /// Client streams a bundle to the agent.
    PersistData,
    /// Agent streams a bundle to the client.
    RetrieveData,
    /// Liveness check, no data phase.
    Ping,
}

impl Operation {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::PersistData => "PERSIST_DATA",
            Operation::RetrieveData => "RETRIEVE_DATA",
            Operation::Ping => "PING",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PERSIST_DATA" => Ok(Operation::PersistData),
            "RETRIEVE_DATA" => Ok(Operation::RetrieveData),
            "PING" => Ok(Operation::Ping),
            other => Err(TransportError::UnknownOperation {
                name: other.to_string(),
            }),
        }
    }
}

/// Request header sent by a client at the start of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageMessageHeader {
    /// Requested operation.
    pub operation: Operation,
    /// Storage format of the bundle; absent for pings.
    pub format: Option<StorageFormat>,
    /// Bundle location on the agent.
    pub location: String,
    /// Bearer token authorizing the request.
    pub auth_token: String,
    /// Free-form note.
    pub message: Option<String>,
    /// Bundle the data belongs to.
    pub data_bundle_id: Option<u64>,
}

impl StorageMessageHeader {
    /// Header asking the agent to store a bundle at `location`.
    pub fn persist(format: StorageFormat, location: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self::data_op(Operation::PersistData, format, location.into(), auth_token.into())
    }

    /// Header asking the agent to stream the bundle at `location`.
    pub fn retrieve(format: StorageFormat, location: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self::data_op(Operation::RetrieveData, format, location.into(), auth_token.into())
    }

    /// Liveness check header.
    pub fn ping() -> Self {
        Self {
            operation: Operation::Ping,
            format: None,
            location: String::new(),
            auth_token: String::new(),
            message: None,
            data_bundle_id: None,
        }
    }

    /// Attaches the bundle id.
    pub fn with_bundle_id(mut self, id: u64) -> Self {
        self.data_bundle_id = Some(id);
        self
    }

    fn data_op(operation: Operation, format: StorageFormat, location: String, auth_token: String) -> Self {
        Self {
            operation,
            format: Some(format),
            location,
            auth_token,
            message: None,
            data_bundle_id: None,
        }
    }
}

/// Outcome status carried by a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    /// Success.
    Ok,
    /// Failure, see the message.
    Error,
}

impl ResponseStatus {
    /// Wire code: 0 for OK, 1 for ERROR.
    pub fn code(&self) -> i32 {
        match self {
            ResponseStatus::Ok => 0,
            ResponseStatus::Error => 1,
        }
    }

    /// Any nonzero code is an error.
    pub fn from_code(code: i32) -> Self {
        if code == 0 {
            ResponseStatus::Ok
        } else {
            ResponseStatus::Error
        }
    }
}

/// Summary of a finished (or refused) operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageMessageResponse {
    /// Outcome.
    pub status: ResponseStatus,
    /// Human readable detail.
    pub message: String,
    /// Bytes that crossed the wire.
    pub transferred_bytes: i64,
    /// Bytes stored on disk.
    pub persisted_bytes: i64,
    /// Checksum of the transferred stream.
    pub checksum: Vec<u8>,
}

impl StorageMessageResponse {
    /// Successful response without counters.
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Ok,
            message: message.into(),
            transferred_bytes: 0,
            persisted_bytes: 0,
            checksum: Vec::new(),
        }
    }

    /// Failed response.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            ..Self::ok(message)
        }
    }

    /// Sets the byte counters and checksum.
    pub fn with_counts(mut self, transferred: u64, persisted: u64, checksum: Vec<u8>) -> Self {
        self.transferred_bytes = i64::try_from(transferred).unwrap_or(i64::MAX);
        self.persisted_bytes = i64::try_from(persisted).unwrap_or(i64::MAX);
        self.checksum = checksum;
        self
    }

    /// True for OK responses.
    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }
}

/// Encodes and decodes one message type.
pub trait MessageCodec<M>: Send + Sync {
    /// Encodes `message` as a complete frame, length prefix included.
    fn encode(&self, message: &M) -> Result<Vec<u8>>;

    /// Decodes a payload (without its length prefix).
    fn decode(&self, payload: &[u8]) -> Result<M>;
}

/// Codec for [`StorageMessageHeader`].
#[derive(Debug, Default, Clone, Copy)]
pub struct HeaderCodec;

/// Codec for [`StorageMessageResponse`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ResponseCodec;

impl MessageCodec<StorageMessageHeader> for HeaderCodec {
    fn encode(&self, header: &StorageMessageHeader) -> Result<Vec<u8>> {
        let mut payload = Vec::with_capacity(64 + header.location.len() + header.auth_token.len());
        write_str(&mut payload, header.operation.as_str())?;
        write_str(&mut payload, header.format.map(|f| f.as_str()).unwrap_or(""))?;
        write_str(&mut payload, &header.location)?;
        write_str(&mut payload, &header.auth_token)?;
        match &header.message {
            Some(message) => write_str(&mut payload, message)?,
            None => write_nil(&mut payload)?,
        }
        match header.data_bundle_id {
            Some(id) => {
                rmp::encode::write_uint(&mut payload, id).map_err(encode_err)?;
            }
            None => write_nil(&mut payload)?,
        }
        frame(payload)
    }

    fn decode(&self, payload: &[u8]) -> Result<StorageMessageHeader> {
        let mut rd = PayloadReader::new(payload);
        let operation = rd
            .string("operation")?
            .parse::<Operation>()
            .map_err(|e| malformed(e.to_string()))?;
        let format = match rd.string("storage format")?.as_str() {
            "" => None,
            name => Some(
                name.parse::<StorageFormat>()
                    .map_err(|e| malformed(e.to_string()))?,
            ),
        };
        let location = rd.string("location")?;
        let auth_token = rd.string("auth token")?;
        let message = rd.opt_string("message")?;
        let data_bundle_id = rd.opt_u64("data bundle id")?;
        rd.finish()?;
        Ok(StorageMessageHeader {
            operation,
            format,
            location,
            auth_token,
            message,
            data_bundle_id,
        })
    }
}

impl MessageCodec<StorageMessageResponse> for ResponseCodec {
    fn encode(&self, response: &StorageMessageResponse) -> Result<Vec<u8>> {
        let mut payload = Vec::with_capacity(64 + response.message.len() + response.checksum.len());
        rmp::encode::write_i32(&mut payload, response.status.code()).map_err(encode_err)?;
        write_str(&mut payload, &response.message)?;
        rmp::encode::write_i64(&mut payload, response.transferred_bytes).map_err(encode_err)?;
        rmp::encode::write_i64(&mut payload, response.persisted_bytes).map_err(encode_err)?;
        rmp::encode::write_bin(&mut payload, &response.checksum).map_err(encode_err)?;
        frame(payload)
    }

    fn decode(&self, payload: &[u8]) -> Result<StorageMessageResponse> {
        let mut rd = PayloadReader::new(payload);
        let code = rd.int("status")?;
        let status = ResponseStatus::from_code(
            i32::try_from(code).map_err(|_| malformed(format!("status {} out of range", code)))?,
        );
        let message = rd.string("message")?;
        let transferred_bytes = rd.int("transferred bytes")?;
        let persisted_bytes = rd.int("persisted bytes")?;
        let checksum = rd.bin("checksum")?;
        rd.finish()?;
        Ok(StorageMessageResponse {
            status,
            message,
            transferred_bytes,
            persisted_bytes,
            checksum,
        })
    }
}

/// Prefixes `payload` with its big-endian length.
pub fn frame(payload: Vec<u8>) -> Result<Vec<u8>> {
    let size = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    if size > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size,
            max_size: MAX_FRAME_SIZE,
        });
    }
    let mut out = Vec::with_capacity(FRAME_SIZE_PREFIX + payload.len());
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

fn malformed(reason: impl Into<String>) -> TransportError {
    TransportError::MalformedFrame {
        reason: reason.into(),
    }
}

fn encode_err(e: impl fmt::Display) -> TransportError {
    malformed(format!("encode failed: {}", e))
}

fn write_str(payload: &mut Vec<u8>, value: &str) -> Result<()> {
    rmp::encode::write_str(payload, value).map_err(encode_err)
}

fn write_nil(payload: &mut Vec<u8>) -> Result<()> {
    rmp::encode::write_nil(payload).map_err(encode_err)
}

const MSGPACK_NIL: u8 = 0xc0;

/// Cursor over a payload that checks every field against the remaining bytes.
struct PayloadReader<'a> {
    rd: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    fn new(payload: &'a [u8]) -> Self {
        Self { rd: payload }
    }

    fn take(&mut self, len: usize, field: &str) -> Result<&'a [u8]> {
        if self.rd.len() < len {
            return Err(malformed(format!(
                "{} needs {} bytes but only {} remain",
                field,
                len,
                self.rd.len()
            )));
        }
        let (head, rest) = self.rd.split_at(len);
        self.rd = rest;
        Ok(head)
    }

    fn string(&mut self, field: &str) -> Result<String> {
        let len = rmp::decode::read_str_len(&mut self.rd)
            .map_err(|e| malformed(format!("{}: {}", field, e)))?;
        let bytes = self.take(len as usize, field)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| malformed(format!("{}: {}", field, e)))
    }

    fn opt_string(&mut self, field: &str) -> Result<Option<String>> {
        if self.skip_nil() {
            return Ok(None);
        }
        self.string(field).map(Some)
    }

    fn int(&mut self, field: &str) -> Result<i64> {
        rmp::decode::read_int::<i64, _>(&mut self.rd)
            .map_err(|e| malformed(format!("{}: {}", field, e)))
    }

    fn opt_u64(&mut self, field: &str) -> Result<Option<u64>> {
        if self.skip_nil() {
            return Ok(None);
        }
        rmp::decode::read_int::<u64, _>(&mut self.rd)
            .map(Some)
            .map_err(|e| malformed(format!("{}: {}", field, e)))
    }

    fn bin(&mut self, field: &str) -> Result<Vec<u8>> {
        let len = rmp::decode::read_bin_len(&mut self.rd)
            .map_err(|e| malformed(format!("{}: {}", field, e)))?;
        Ok(self.take(len as usize, field)?.to_vec())
    }

    fn skip_nil(&mut self) -> bool {
        if self.rd.first() == Some(&MSGPACK_NIL) {
            self.rd = &self.rd[1..];
            true
        } else {
            false
        }
    }

    fn finish(self) -> Result<()> {
        if self.rd.is_empty() {
            Ok(())
        } else {
            Err(malformed(format!("{} trailing bytes after last field", self.rd.len())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_of(frame: &[u8]) -> &[u8] {
        let size = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(size, frame.len() - FRAME_SIZE_PREFIX);
        &frame[FRAME_SIZE_PREFIX..]
    }

    #[test]
    fn test_header_round_trip() {
        let header = StorageMessageHeader::persist(StorageFormat::DataDirectory, "/data/x", "tok")
            .with_bundle_id(42);
        let encoded = HeaderCodec.encode(&header).unwrap();
        let decoded = HeaderCodec.decode(payload_of(&encoded)).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_ping_round_trip() {
        let encoded = HeaderCodec.encode(&StorageMessageHeader::ping()).unwrap();
        let decoded = HeaderCodec.decode(payload_of(&encoded)).unwrap();
        assert_eq!(decoded.operation, Operation::Ping);
        assert_eq!(decoded.format, None);
    }

    #[test]
    fn test_response_round_trip() {
        let response = StorageMessageResponse::ok("done").with_counts(10, 12, vec![1, 2, 3]);
        let encoded = ResponseCodec.encode(&response).unwrap();
        let decoded = ResponseCodec.decode(payload_of(&encoded)).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_header_field_order() {
        let header = StorageMessageHeader::retrieve(StorageFormat::SingleDataFile, "p", "t");
        let encoded = HeaderCodec.encode(&header).unwrap();
        let payload = payload_of(&encoded);
        // fixstr "RETRIEVE_DATA" comes first
        assert_eq!(payload[0], 0xa0 | 13);
        assert_eq!(&payload[1..14], b"RETRIEVE_DATA");
    }

    #[test]
    fn test_truncated_payload_is_malformed() {
        let encoded = ResponseCodec.encode(&StorageMessageResponse::error("nope")).unwrap();
        let payload = payload_of(&encoded);
        let err = ResponseCodec.decode(&payload[..payload.len() - 1]).unwrap_err();
        assert!(matches!(err, TransportError::MalformedFrame { .. }));
    }

    #[test]
    fn test_trailing_bytes_are_malformed() {
        let encoded = HeaderCodec.encode(&StorageMessageHeader::ping()).unwrap();
        let mut payload = payload_of(&encoded).to_vec();
        payload.push(0x01);
        assert!(matches!(
            HeaderCodec.decode(&payload),
            Err(TransportError::MalformedFrame { .. })
        ));
    }

    #[test]
    fn test_unknown_operation_is_malformed() {
        let mut payload = Vec::new();
        for field in ["DELETE_DATA", "", "", ""] {
            write_str(&mut payload, field).unwrap();
        }
        write_nil(&mut payload).unwrap();
        write_nil(&mut payload).unwrap();
        let err = HeaderCodec.decode(&payload).unwrap_err();
        assert!(err.to_string().contains("DELETE_DATA"));
    }

    #[test]
    fn test_nonzero_status_is_error() {
        assert_eq!(ResponseStatus::from_code(0), ResponseStatus::Ok);
        assert_eq!(ResponseStatus::from_code(7), ResponseStatus::Error);
        assert_eq!(ResponseStatus::from_code(-1), ResponseStatus::Error);
    }
}
