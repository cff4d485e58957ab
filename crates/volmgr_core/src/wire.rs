//! Replication-configuration wire protocol.
//!
//! One connection carries exactly one exchange: the target sends a JSON
//! `ReplicaUpdate` terminated by `\r\n`, the server answers `Ok\r\n` or
//! `Err\r\n` and closes the connection.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// End-of-message marker.
pub const TERMINATOR: &[u8] = b"\r\n";
/// Largest request payload accepted before the marker.
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;

/// Replica-membership update sent by the storage target.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReplicaUpdate {
    pub volume_name: String,
    pub replica_id: String,
    pub replica_guid: String,
    pub replication_factor: u32,
    pub consistency_factor: u32,
}

/// Single-token reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Err,
}

impl Reply {
    pub fn as_str(self) -> &'static str {
        match self {
            Reply::Ok => "Ok",
            Reply::Err => "Err",
        }
    }

    fn parse(token: &[u8]) -> Option<Self> {
        match token {
            b"Ok" => Some(Reply::Ok),
            b"Err" => Some(Reply::Err),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed before end-of-message marker ({0} bytes pending)")]
    MissingTerminator(usize),
    #[error("message exceeds {limit} bytes without end-of-message marker")]
    TooLarge { limit: usize },
    #[error("malformed request payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unknown reply token {0:?}")]
    UnknownReply(String),
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(TERMINATOR.len()).position(|w| w == TERMINATOR)
}

/// Split off one `\r\n`-terminated frame, enforcing the size limit.
fn take_frame(src: &mut BytesMut, limit: usize) -> Result<Option<BytesMut>, WireError> {
    match find_terminator(src) {
        Some(pos) => {
            let frame = src.split_to(pos);
            src.advance(TERMINATOR.len());
            Ok(Some(frame))
        }
        None if src.len() > limit => Err(WireError::TooLarge { limit }),
        None => Ok(None),
    }
}

/// Server-side codec: decodes requests, encodes replies.
#[derive(Clone, Debug)]
pub struct TargetServerCodec {
    max_request_bytes: usize,
}

impl TargetServerCodec {
    pub fn new(max_request_bytes: usize) -> Self {
        Self { max_request_bytes }
    }
}

impl Default for TargetServerCodec {
    fn default() -> Self {
        Self::new(MAX_REQUEST_BYTES)
    }
}

impl Decoder for TargetServerCodec {
    type Item = ReplicaUpdate;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = take_frame(src, self.max_request_bytes)? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&frame)?))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None if src.is_empty() => Ok(None),
            None => Err(WireError::MissingTerminator(src.len())),
        }
    }
}

impl Encoder<Reply> for TargetServerCodec {
    type Error = WireError;

    fn encode(&mut self, item: Reply, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.as_str().len() + TERMINATOR.len());
        dst.put_slice(item.as_str().as_bytes());
        dst.put_slice(TERMINATOR);
        Ok(())
    }
}

/// Client-side codec used by `volctl` and tests: encodes requests, decodes replies.
#[derive(Clone, Debug, Default)]
pub struct TargetClientCodec;

impl Decoder for TargetClientCodec {
    type Item = Reply;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = take_frame(src, MAX_REQUEST_BYTES)? else {
            return Ok(None);
        };
        Reply::parse(&frame)
            .map(Some)
            .ok_or_else(|| WireError::UnknownReply(String::from_utf8_lossy(&frame).into_owned()))
    }
}

impl<'a> Encoder<&'a ReplicaUpdate> for TargetClientCodec {
    type Error = WireError;

    fn encode(&mut self, item: &'a ReplicaUpdate, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(item)?;
        dst.reserve(payload.len() + TERMINATOR.len());
        dst.put_slice(&payload);
        dst.put_slice(TERMINATOR);
        Ok(())
    }
}
