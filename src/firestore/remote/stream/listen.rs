use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{json, Value as JsonValue};

use crate::firestore::core::TargetData;
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{SnapshotVersion, TargetId};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::stream::PersistentStream;
use crate::firestore::remote::watch_change::{
    decode_watch_change, snapshot_version_from_listen_response, WatchChange,
};

#[derive(Clone, Debug)]
enum PendingRequest {
    Watch(TargetData),
    Unwatch(TargetId),
}

impl PendingRequest {
    fn target_id(&self) -> TargetId {
        match self {
            PendingRequest::Watch(data) => data.target_id,
            PendingRequest::Unwatch(target_id) => *target_id,
        }
    }
}

/// The listen protocol on top of a [`PersistentStream`].
///
/// Target additions and removals are recorded and sent together by
/// [`WatchStream::flush`], one `{"addTargets", "removeTargets"}` message per
/// batch. A batch is split only where the same target is both removed and
/// re-added, which keeps the order of requests for each target.
pub struct WatchStream {
    stream: PersistentStream,
    serializer: Arc<JsonProtoSerializer>,
    pending: Vec<PendingRequest>,
}

impl WatchStream {
    pub fn new(stream: PersistentStream, serializer: Arc<JsonProtoSerializer>) -> Self {
        Self {
            stream,
            serializer,
            pending: Vec::new(),
        }
    }

    pub fn stream(&self) -> &PersistentStream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut PersistentStream {
        &mut self.stream
    }

    pub fn watch(&mut self, target_data: TargetData) {
        log::debug!("watch target {} requested", target_data.target_id);
        self.pending.push(PendingRequest::Watch(target_data));
    }

    pub fn unwatch(&mut self, target_id: TargetId) {
        log::debug!("unwatch target {target_id} requested");
        self.pending.push(PendingRequest::Unwatch(target_id));
    }

    pub fn has_pending_requests(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Requests recorded for a stream that closed are dropped; a reopened
    /// stream re-sends every active target.
    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    /// Sends all recorded requests. Does nothing until the stream is open.
    pub async fn flush(&mut self) -> FirestoreResult<()> {
        if !self.stream.is_open() || self.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending);
        for message in self.batch_messages(&pending) {
            let payload = serde_json::to_vec(&message)
                .map_err(|err| invalid_argument(format!("Unencodable listen request: {err}")))?;
            self.stream.send(payload).await?;
        }
        Ok(())
    }

    fn batch_messages(&self, pending: &[PendingRequest]) -> Vec<JsonValue> {
        let mut messages = Vec::new();
        let mut seen = BTreeSet::new();
        let mut add_targets = Vec::new();
        let mut remove_targets = Vec::new();

        for request in pending {
            if !seen.insert(request.target_id()) {
                messages.push(self.listen_request(
                    std::mem::take(&mut add_targets),
                    std::mem::take(&mut remove_targets),
                ));
                seen.clear();
                seen.insert(request.target_id());
            }
            match request {
                PendingRequest::Watch(data) => add_targets.push(self.encode_added_target(data)),
                PendingRequest::Unwatch(target_id) => remove_targets.push(json!(target_id)),
            }
        }
        if !add_targets.is_empty() || !remove_targets.is_empty() {
            messages.push(self.listen_request(add_targets, remove_targets));
        }
        messages
    }

    fn encode_added_target(&self, target_data: &TargetData) -> JsonValue {
        let mut target = self.serializer.encode_target(target_data);
        if let (Some(labels), JsonValue::Object(fields)) = (
            self.serializer.encode_listen_labels(target_data.purpose),
            &mut target,
        ) {
            fields.insert("labels".to_string(), labels);
        }
        target
    }

    fn listen_request(&self, add_targets: Vec<JsonValue>, remove_targets: Vec<JsonValue>) -> JsonValue {
        json!({
            "database": self.serializer.database_name(),
            "addTargets": add_targets,
            "removeTargets": remove_targets,
        })
    }

    /// Decodes one listen response into its change and the global snapshot
    /// version it establishes, if any.
    pub fn decode(&self, payload: &[u8]) -> FirestoreResult<(WatchChange, SnapshotVersion)> {
        let value: JsonValue = serde_json::from_slice(payload)
            .map_err(|err| invalid_argument(format!("Malformed listen response: {err}")))?;
        let change = decode_watch_change(&self.serializer, &value)?;
        let version = snapshot_version_from_listen_response(&self.serializer, &value)?;
        Ok((change, version))
    }
}
