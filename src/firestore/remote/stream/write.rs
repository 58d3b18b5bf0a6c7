use std::sync::Arc;

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::Mutation;
use crate::firestore::remote::serializer::{JsonProtoSerializer, WriteResponse};
use crate::firestore::remote::stream::PersistentStream;

/// The write protocol on top of a [`PersistentStream`].
///
/// Every stream starts with a handshake carrying only the database name. The
/// first response completes it and hands out the stream token that each
/// later write request echoes back.
pub struct WriteStream {
    stream: PersistentStream,
    serializer: Arc<JsonProtoSerializer>,
    handshake_complete: bool,
    last_stream_token: Vec<u8>,
}

impl WriteStream {
    pub fn new(stream: PersistentStream, serializer: Arc<JsonProtoSerializer>) -> Self {
        Self {
            stream,
            serializer,
            handshake_complete: false,
            last_stream_token: Vec::new(),
        }
    }

    pub fn stream(&self) -> &PersistentStream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut PersistentStream {
        &mut self.stream
    }

    pub fn handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    pub fn last_stream_token(&self) -> &[u8] {
        &self.last_stream_token
    }

    pub fn set_last_stream_token(&mut self, token: Vec<u8>) {
        self.last_stream_token = token;
    }

    /// Forgets the handshake of a stream that closed.
    pub fn reset(&mut self) {
        self.handshake_complete = false;
    }

    pub async fn write_handshake(&mut self) -> FirestoreResult<()> {
        if self.handshake_complete {
            log::error!("write handshake sent twice");
        }
        log::debug!("sending write stream handshake");
        let payload = encode(&self.serializer.encode_handshake())?;
        self.stream.send(payload).await
    }

    pub async fn write_mutations(&mut self, mutations: &[Mutation]) -> FirestoreResult<()> {
        if !self.handshake_complete {
            log::error!("mutations written before the handshake completed");
        }
        let request = self
            .serializer
            .encode_write_request(&self.last_stream_token, mutations);
        let payload = encode(&request)?;
        self.stream.send(payload).await
    }

    /// Decodes a response and records its stream token. Returns `None` for
    /// the handshake response, which carries no results.
    pub fn handle_response(&mut self, payload: &[u8]) -> FirestoreResult<Option<WriteResponse>> {
        let value: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|err| invalid_argument(format!("Malformed write response: {err}")))?;
        let response = self.serializer.decode_write_response(&value)?;
        self.last_stream_token = response.stream_token.clone();
        if !self.handshake_complete {
            self.handshake_complete = true;
            return Ok(None);
        }
        Ok(Some(response))
    }
}

fn encode(value: &serde_json::Value) -> FirestoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|err| invalid_argument(format!("Unencodable write request: {err}")))
}
