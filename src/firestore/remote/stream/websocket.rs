use async_lock::Mutex;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use super::{FrameKind, StreamId, StreamTransport, TransportFrame};
use crate::firestore::error::{
    internal_error, invalid_argument, unavailable, FirestoreError, FirestoreErrorCode,
    FirestoreResult,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Carries transport frames as JSON text messages over one websocket.
pub struct WebSocketTransport {
    sink: Mutex<SplitSink<Socket, Message>>,
    reader: Mutex<SplitStream<Socket>>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFrame {
    stream: StreamId,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auth_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl WebSocketTransport {
    pub async fn connect(url: &str) -> FirestoreResult<Self> {
        let url = url::Url::parse(url)
            .map_err(|err| invalid_argument(format!("invalid backend url {url}: {err}")))?;
        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|err| unavailable(format!("failed to connect websocket: {err}")))?;
        let (sink, reader) = stream.split();
        Ok(Self {
            sink: Mutex::new(sink),
            reader: Mutex::new(reader),
        })
    }
}

fn encode_frame(frame: TransportFrame) -> FirestoreResult<String> {
    let stream = frame.stream_id();
    let mut wire = WireFrame {
        stream,
        kind: String::new(),
        channel: None,
        auth_token: None,
        payload: None,
        code: None,
        message: None,
    };
    match frame.into_kind() {
        FrameKind::Open {
            channel,
            auth_token,
        } => {
            wire.kind = "open".to_string();
            wire.channel = Some(channel);
            wire.auth_token = auth_token;
        }
        FrameKind::Data(payload) => {
            wire.kind = "data".to_string();
            wire.payload = Some(STANDARD.encode(payload));
        }
        FrameKind::Close => wire.kind = "close".to_string(),
        FrameKind::Error(err) => {
            wire.kind = "error".to_string();
            wire.code = Some(err.code.grpc_status());
            wire.message = Some(err.message().to_string());
        }
    }
    serde_json::to_string(&wire)
        .map_err(|err| internal_error(format!("failed to encode transport frame: {err}")))
}

fn decode_frame(text: &str) -> FirestoreResult<TransportFrame> {
    let wire: WireFrame = serde_json::from_str(text)
        .map_err(|err| internal_error(format!("malformed transport frame: {err}")))?;
    let kind = match wire.kind.as_str() {
        "open" => FrameKind::Open {
            channel: wire.channel.unwrap_or_default(),
            auth_token: wire.auth_token,
        },
        "data" => {
            let payload = STANDARD
                .decode(wire.payload.unwrap_or_default())
                .map_err(|err| internal_error(format!("malformed frame payload: {err}")))?;
            FrameKind::Data(payload)
        }
        "close" => FrameKind::Close,
        "error" => FrameKind::Error(FirestoreError::new(
            FirestoreErrorCode::from_grpc_status(wire.code.unwrap_or(2)),
            wire.message.unwrap_or_default(),
        )),
        other => return Err(internal_error(format!("unknown transport frame type {other}"))),
    };
    Ok(TransportFrame::new(wire.stream, kind))
}

#[async_trait]
impl StreamTransport for WebSocketTransport {
    async fn send(&self, frame: TransportFrame) -> FirestoreResult<()> {
        let payload = encode_frame(frame)?;
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(payload))
            .await
            .map_err(|err| unavailable(format!("failed to send websocket frame: {err}")))
    }

    async fn next(&self) -> FirestoreResult<TransportFrame> {
        let mut reader = self.reader.lock().await;
        while let Some(message) = reader.next().await {
            match message {
                Ok(Message::Text(text)) => return decode_frame(&text),
                Ok(Message::Binary(payload)) => {
                    let Ok(text) = String::from_utf8(payload) else {
                        log::warn!("dropping non-UTF8 binary websocket frame");
                        continue;
                    };
                    return decode_frame(&text);
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(err) => return Err(unavailable(format!("websocket read failed: {err}"))),
            }
        }
        Err(unavailable("websocket closed"))
    }
}
