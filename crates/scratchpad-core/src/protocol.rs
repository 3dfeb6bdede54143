//! IPC protocol messages between the host and a worker process.
//!
//! Uses length-prefixed rkyv messages over a Unix domain socket.
//! Format: 4-byte length (u32 LE) + rkyv-encoded [`Message`].
//!
//! Requests and responses are matched by correlation id. Events flow from
//! the worker to the host without a reply.

use rkyv::{Archive, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::dump::DumpEvent;
use crate::error::{Error, Result};
use crate::resolver::ResolverConfig;

/// Frames larger than this are rejected (100MB).
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// A single frame on the wire.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum Message {
    /// Host to worker call.
    Request { id: u64, call: Call },
    /// Worker to host reply for the request with the same id.
    Response { id: u64, outcome: Outcome },
    /// Worker to host notification.
    Event(Event),
}

/// Calls the host can make on a worker.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum Call {
    /// Configure the compile/run context for the lifetime of the process.
    Initialize(InitializeParams),
    /// Compile and run a piece of script code.
    Execute { code: String },
}

/// Parameters of the one-time `Initialize` call.
#[derive(Debug, Clone, Default, PartialEq, Archive, Serialize, Deserialize)]
pub struct InitializeParams {
    /// Script files loaded ahead of every execution.
    pub references: Vec<String>,
    /// Modules the script may use (`math`, `text`).
    pub imports: Vec<String>,
    /// Resolver settings.
    pub resolver: ResolverConfig,
    /// Directory references are resolved against.
    pub working_directory: String,
}

/// Result of a call.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum Outcome {
    Ok,
    /// The worker failed to handle the call.
    Fault { message: String },
}

/// Notifications from the worker.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum Event {
    /// A batch of script output, in production order.
    Dump { batch: Vec<DumpEvent> },
}

/// Encode a message into a complete frame (length prefix included).
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    let body = rkyv::to_bytes::<rkyv::rancor::Error>(message)
        .map_err(|e| Error::Serialization(format!("Failed to encode IPC message: {}", e)))?;

    if body.len() > MAX_FRAME_LEN {
        return Err(Error::Ipc(format!(
            "IPC message too large: {} bytes",
            body.len()
        )));
    }

    let len = body.len() as u32;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a frame body (without the length prefix).
pub fn decode(body: &[u8]) -> Result<Message> {
    // rkyv needs the archive to be aligned; a plain Vec<u8> gives no guarantee.
    let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(body.len());
    aligned.extend_from_slice(body);

    // SAFETY: frames only come from our own host or worker processes over a
    // private socket. Using unchecked deserialization avoids CheckBytes bounds.
    unsafe { rkyv::from_bytes_unchecked::<Message, rkyv::rancor::Error>(&aligned) }
        .map_err(|e| Error::Deserialization(format!("Failed to decode IPC message: {}", e)))
}

/// Write a message to a writer using length-prefixed rkyv encoding.
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    let frame = encode(message)?;
    writer
        .write_all(&frame)
        .await
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))?;

    Ok(())
}

/// Read a message from a reader using length-prefixed rkyv encoding.
///
/// Returns `Ok(None)` when the peer closed the stream between frames.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Message>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => {
            return Err(Error::Ipc(format!(
                "Failed to read IPC message length: {}",
                e
            )));
        }
    }
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_FRAME_LEN {
        return Err(Error::Ipc(format!("IPC message too large: {} bytes", len)));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message body: {}", e)))?;

    decode(&body).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dump::{DiagnosticRecord, Location};

    #[tokio::test]
    async fn test_initialize_request_roundtrip() {
        let msg = Message::Request {
            id: 7,
            call: Call::Initialize(InitializeParams {
                references: vec!["consts.pad".to_string()],
                imports: vec!["math".to_string()],
                resolver: ResolverConfig {
                    search_paths: vec!["/opt/pad".to_string()],
                },
                working_directory: "/tmp/work".to_string(),
            }),
        };

        let mut buf = Vec::new();
        write_message(&mut buf, &msg).await.unwrap();

        let mut reader = buf.as_slice();
        let decoded = read_message(&mut reader).await.unwrap();
        assert_eq!(decoded, Some(msg));
    }

    #[tokio::test]
    async fn test_frames_are_read_in_sequence() {
        let batch = vec![
            DumpEvent::value("int", "1"),
            DumpEvent::diagnostic(DiagnosticRecord::error(
                "expected `;`",
                Some(Location {
                    source: None,
                    line: 1,
                    column: 4,
                }),
            )),
        ];
        let event = Message::Event(Event::Dump {
            batch: batch.clone(),
        });
        let response = Message::Response {
            id: 1,
            outcome: Outcome::Ok,
        };

        let mut buf = Vec::new();
        write_message(&mut buf, &event).await.unwrap();
        write_message(&mut buf, &response).await.unwrap();

        let mut reader = buf.as_slice();
        match read_message(&mut reader).await.unwrap() {
            Some(Message::Event(Event::Dump { batch: decoded })) => assert_eq!(decoded, batch),
            other => panic!("Wrong message: {:?}", other),
        }
        assert_eq!(read_message(&mut reader).await.unwrap(), Some(response));
        assert_eq!(read_message(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let len = (MAX_FRAME_LEN as u32 + 1).to_le_bytes();
        let mut reader = &len[..];
        let err = read_message(&mut reader).await.unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[tokio::test]
    async fn test_truncated_body_is_an_error() {
        let frame = encode(&Message::Request {
            id: 1,
            call: Call::Execute {
                code: "1 + 1".to_string(),
            },
        })
        .unwrap();

        let mut reader = &frame[..frame.len() - 2];
        assert!(read_message(&mut reader).await.is_err());
    }
}
