//! Wire protocol spoken between the controller and worker services.
//!
//! Every exchange is a single request frame answered by a single response
//! frame over the same connection. Frames are length-prefixed (u32 big
//! endian) JSON documents; the prefix is handled by a `LengthDelimitedCodec`
//! and the payload by serde.

use anyhow::{ensure, Context};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::replica::ReplicaInfo;

/// Upper bound on a single frame payload.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Wrap a connected stream with the length-delimited framing.
pub fn framed(stream: TcpStream) -> Framed<TcpStream, LengthDelimitedCodec> {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_BYTES)
        .new_framed(stream)
}

/// Completion status reported by a worker for a queued request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtoStatus {
    Queued,
    InProgress,
    IsCancelling,
    Cancelled,
    Success,
    Bad,
    Failed,
}

/// Extra detail qualifying a `Bad` or `Failed` status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtoStatusExt {
    #[default]
    None,
    InvalidParam,
    InvalidId,
    Duplicate,
    NoSuchFile,
    NoSuchFolder,
    FileCopy,
    FileDelete,
    FolderRead,
}

/// A request frame as placed on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub body: RequestBody,
}

/// The operation carried by a request frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RequestBody {
    Replicate {
        priority: i32,
        database: String,
        chunk: u32,
        source_worker: String,
    },
    Delete {
        priority: i32,
        database: String,
        chunk: u32,
    },
    Find {
        priority: i32,
        database: String,
        chunk: u32,
        compute_cs: bool,
    },
    FindAll {
        priority: i32,
        database: String,
    },
    Echo {
        priority: i32,
        data: Vec<u8>,
        delay_ms: u64,
    },
    /// Report the current status of a previously submitted request.
    Status { target_id: String },
    /// Dequeue or cancel a previously submitted request.
    Stop { target_id: String },
    ServiceStatus,
    ServiceDrain,
}

impl RequestBody {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            RequestBody::Replicate { .. } => "REPLICATE",
            RequestBody::Delete { .. } => "DELETE",
            RequestBody::Find { .. } => "FIND",
            RequestBody::FindAll { .. } => "FIND_ALL",
            RequestBody::Echo { .. } => "ECHO",
            RequestBody::Status { .. } => "STATUS",
            RequestBody::Stop { .. } => "STOP",
            RequestBody::ServiceStatus => "SERVICE_STATUS",
            RequestBody::ServiceDrain => "SERVICE_DRAIN",
        }
    }
}

/// Worker-side timestamps for one request (epoch milliseconds, 0 = unset).
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct WirePerformance {
    pub receive_time: u64,
    pub start_time: u64,
    pub finish_time: u64,
}

/// Snapshot of a worker processor's queues.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceState {
    pub is_running: bool,
    pub start_time: u64,
    pub num_new: usize,
    pub num_in_progress: usize,
    pub num_finished: usize,
}

/// Status of the target of a `Stop` request, carried as its payload. The
/// stop itself reports `Success`; this is what happened to the target.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TargetStatus {
    pub status: ProtoStatus,
    pub status_ext: ProtoStatusExt,
}

/// Payload of a response frame, depending on the request kind.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ResponseResult {
    None,
    Replica(ReplicaInfo),
    Replicas(Vec<ReplicaInfo>),
    Echo(Vec<u8>),
    Service(ServiceState),
    Target(TargetStatus),
}

/// A response frame as placed on the wire.
///
/// `id` always echoes the id of the request frame being answered; for
/// `Status`/`Stop` requests the status fields describe the target request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    pub status: ProtoStatus,
    pub status_ext: ProtoStatusExt,
    pub performance: WirePerformance,
    /// Id of the already-queued request that collides with this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_request_id: Option<String>,
    pub result: ResponseResult,
}

impl ResponseFrame {
    /// Build a response with no payload.
    pub fn bare(id: &str, status: ProtoStatus, status_ext: ProtoStatusExt) -> Self {
        Self {
            id: id.to_string(),
            status,
            status_ext,
            performance: WirePerformance::default(),
            duplicate_request_id: None,
            result: ResponseResult::None,
        }
    }
}

/// Serialize a request frame into a codec-ready payload.
pub fn encode_request(frame: &RequestFrame) -> anyhow::Result<Bytes> {
    let buf = serde_json::to_vec(frame).context("serializing request frame")?;
    ensure!(buf.len() <= MAX_FRAME_BYTES, "request frame too large: {} bytes", buf.len());
    Ok(Bytes::from(buf))
}

/// Deserialize a request frame from a codec payload.
pub fn decode_request(buf: &[u8]) -> anyhow::Result<RequestFrame> {
    serde_json::from_slice(buf).context("parsing request frame")
}

/// Serialize a response frame into a codec-ready payload.
pub fn encode_response(frame: &ResponseFrame) -> anyhow::Result<Bytes> {
    let buf = serde_json::to_vec(frame).context("serializing response frame")?;
    ensure!(buf.len() <= MAX_FRAME_BYTES, "response frame too large: {} bytes", buf.len());
    Ok(Bytes::from(buf))
}

/// Deserialize a response frame from a codec payload.
pub fn decode_response(buf: &[u8]) -> anyhow::Result<ResponseFrame> {
    serde_json::from_slice(buf).context("parsing response frame")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_round_trip() {
        let frame = RequestFrame {
            id: "req-000000000001".into(),
            body: RequestBody::Replicate {
                priority: -2,
                database: "sky_dr1".into(),
                chunk: 187,
                source_worker: "worker-a".into(),
            },
        };
        let bytes = encode_request(&frame).unwrap();
        let back = decode_request(&bytes).unwrap();
        assert_eq!(back.id, frame.id);
        match back.body {
            RequestBody::Replicate { chunk, ref source_worker, .. } => {
                assert_eq!(chunk, 187);
                assert_eq!(source_worker, "worker-a");
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn response_frame_carries_duplicate_id() {
        let mut frame = ResponseFrame::bare("req-2", ProtoStatus::Bad, ProtoStatusExt::Duplicate);
        frame.duplicate_request_id = Some("req-1".into());
        let bytes = encode_response(&frame).unwrap();
        let back = decode_response(&bytes).unwrap();
        assert_eq!(back.status, ProtoStatus::Bad);
        assert_eq!(back.status_ext, ProtoStatusExt::Duplicate);
        assert_eq!(back.duplicate_request_id.as_deref(), Some("req-1"));
    }

    #[test]
    fn bare_response_omits_duplicate_id() {
        let frame = ResponseFrame::bare("req-3", ProtoStatus::Success, ProtoStatusExt::None);
        let bytes = encode_response(&frame).unwrap();
        assert!(!String::from_utf8_lossy(&bytes).contains("duplicate_request_id"));
    }
}
