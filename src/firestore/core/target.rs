use serde::{Deserialize, Serialize};

use crate::firestore::core::query::{
    bound_canonical_id, filters_canonical_id, order_by_canonical_id, Bound, Filter, OrderBy,
};
use crate::firestore::model::{DocumentKey, ListenSequenceNumber, ResourcePath, SnapshotVersion, TargetId};

/// What the backend is asked to watch: the normalized form of a query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Target {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<Filter>,
    order_by: Vec<OrderBy>,
    limit: Option<u32>,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
    canonical_id: String,
}

impl Target {
    pub fn new(
        path: ResourcePath,
        collection_group: Option<String>,
        filters: Vec<Filter>,
        order_by: Vec<OrderBy>,
        limit: Option<u32>,
        start_at: Option<Bound>,
        end_at: Option<Bound>,
    ) -> Self {
        let mut canonical_id = path.canonical_string();
        if let Some(group) = &collection_group {
            canonical_id.push_str("|cg:");
            canonical_id.push_str(group);
        }
        canonical_id.push_str("|f:");
        canonical_id.push_str(&filters_canonical_id(&filters));
        canonical_id.push_str("|ob:");
        canonical_id.push_str(&order_by_canonical_id(&order_by));
        if let Some(limit) = limit {
            canonical_id.push_str(&format!("|l:{limit}"));
        }
        if let Some(bound) = &start_at {
            canonical_id.push_str(if bound.inclusive { "|lb:b:" } else { "|lb:a:" });
            canonical_id.push_str(&bound_canonical_id(bound));
        }
        if let Some(bound) = &end_at {
            canonical_id.push_str(if bound.inclusive { "|ub:a:" } else { "|ub:b:" });
            canonical_id.push_str(&bound_canonical_id(bound));
        }
        Self {
            path,
            collection_group,
            filters,
            order_by,
            limit,
            start_at,
            end_at,
            canonical_id,
        }
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn order_by(&self) -> &[OrderBy] {
        &self.order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn canonical_id(&self) -> &str {
        &self.canonical_id
    }

    pub fn is_document_target(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    /// Collection group the target reads from.
    pub fn collection_group_id(&self) -> String {
        match &self.collection_group {
            Some(group) => group.clone(),
            None => self.path.last_segment().unwrap_or_default().to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetPurpose {
    Listen,
    /// Re-listen after an existence filter mismatch that could not be
    /// resolved locally.
    ExistenceFilterMismatch,
    /// Re-listen after a bloom filter removed stale documents.
    ExistenceFilterMismatchBloom,
    LimboResolution,
}

/// Local bookkeeping for one allocated target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetData {
    pub target: Target,
    pub target_id: TargetId,
    pub purpose: TargetPurpose,
    pub sequence_number: ListenSequenceNumber,
    /// Latest version at which the target's results were consistent.
    pub snapshot_version: SnapshotVersion,
    /// Latest consistent version at which the view had no limbo documents.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    pub resume_token: Vec<u8>,
    /// Expected result count sent when resuming, so the backend can flag
    /// mismatches with an existence filter.
    pub expected_count: Option<i32>,
}

impl TargetData {
    pub fn new(
        target: Target,
        target_id: TargetId,
        purpose: TargetPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: Vec::new(),
            expected_count: None,
        }
    }

    pub fn with_sequence_number(mut self, sequence_number: ListenSequenceNumber) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    /// Records a new resume token. Any expected count is cleared because it
    /// described the previous token.
    pub fn with_resume_token(mut self, resume_token: Vec<u8>, snapshot_version: SnapshotVersion) -> Self {
        self.resume_token = resume_token;
        self.snapshot_version = snapshot_version;
        self.expected_count = None;
        self
    }

    pub fn with_expected_count(mut self, expected_count: i32) -> Self {
        self.expected_count = Some(expected_count);
        self
    }

    pub fn with_last_limbo_free_snapshot_version(mut self, version: SnapshotVersion) -> Self {
        self.last_limbo_free_snapshot_version = version;
        self
    }

    pub fn with_purpose(mut self, purpose: TargetPurpose) -> Self {
        self.purpose = purpose;
        self
    }
}

/// Hands out target ids from one of two disjoint sequences: even ids for
/// query targets and odd ids for limbo resolutions.
#[derive(Clone, Debug)]
pub struct TargetIdGenerator {
    next_id: TargetId,
}

impl TargetIdGenerator {
    const GENERATOR_ID_MASK: TargetId = 1;
    const RESERVED_BITS: u32 = 1;

    fn new(generator_id: TargetId, seed: TargetId) -> Self {
        let mut generator = Self { next_id: 0 };
        generator.seek(generator_id, seed);
        generator
    }

    /// Generator for query targets that continues after `highest_target_id`.
    pub fn for_target_cache(highest_target_id: TargetId) -> Self {
        let mut generator = Self::new(0, highest_target_id);
        // The cache reports the last id handed out; skip past it.
        generator.next();
        generator
    }

    pub fn for_sync_engine() -> Self {
        Self::new(1, 1)
    }

    fn seek(&mut self, generator_id: TargetId, seed: TargetId) {
        let id = seed & !Self::GENERATOR_ID_MASK | generator_id;
        self.next_id = if id >= seed { id } else { id + (1 << Self::RESERVED_BITS) };
    }

    pub fn next(&mut self) -> TargetId {
        let id = self.next_id;
        self.next_id += 1 << Self::RESERVED_BITS;
        id
    }
}
