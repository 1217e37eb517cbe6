//! Mutation events that can invalidate cached query results.

use time::OffsetDateTime;
use uuid::Uuid;

use super::keys::{ObjectId, TenantId};

/// Where a write came from.
///
/// Only authoritative writes may disturb the shared cache; the rest are
/// speculative copies nobody else queries against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WriteOrigin {
    #[default]
    Authoritative,
    /// A draft preview request.
    Preview,
    /// A background automatic save.
    Autosave,
    /// A stored revision copy of an object.
    Revision,
}

impl WriteOrigin {
    pub fn is_authoritative(self) -> bool {
        matches!(self, Self::Authoritative)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Authoritative => "authoritative",
            Self::Preview => "preview",
            Self::Autosave => "autosave",
            Self::Revision => "revision",
        }
    }
}

/// Types of mutation signals the router understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// A content object was created, updated or deleted. `content_type` is
    /// what the emitter knew; `None` makes the router look the object up.
    ObjectChanged {
        id: ObjectId,
        content_type: Option<String>,
    },
    /// Membership of one or more terms in a grouping (taxonomy) changed.
    GroupingChanged {
        ids: Vec<ObjectId>,
        grouping: String,
    },
    /// Metadata attached to an object was added, updated or deleted.
    MetadataChanged { object_id: ObjectId },
    /// A benign aggregate recount is starting; suppress invalidation.
    RecountBegin,
    /// The recount is over; invalidation is allowed again.
    RecountEnd,
    /// The active tenant changed.
    TenantSwitched {
        new: TenantId,
        previous: Option<TenantId>,
    },
    /// A write the router cannot classify.
    Unclassified { description: String },
}

/// Mutation event with identity for log correlation.
#[derive(Debug, Clone)]
pub struct MutationEvent {
    pub id: Uuid,
    pub kind: EventKind,
    pub origin: WriteOrigin,
    pub timestamp: OffsetDateTime,
}

impl MutationEvent {
    /// An authoritative event.
    pub fn new(kind: EventKind) -> Self {
        Self::with_origin(kind, WriteOrigin::Authoritative)
    }

    pub fn with_origin(kind: EventKind, origin: WriteOrigin) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            origin,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_default_to_authoritative() {
        let event = MutationEvent::new(EventKind::RecountBegin);
        assert!(event.origin.is_authoritative());
        assert!(!event.id.is_nil());
    }

    #[test]
    fn speculative_origins_are_not_authoritative() {
        for origin in [WriteOrigin::Preview, WriteOrigin::Autosave, WriteOrigin::Revision] {
            assert!(!origin.is_authoritative(), "{}", origin.as_str());
        }
    }

    #[test]
    fn each_event_gets_a_distinct_id() {
        let a = MutationEvent::new(EventKind::MetadataChanged { object_id: 1 });
        let b = MutationEvent::new(EventKind::MetadataChanged { object_id: 1 });
        assert_eq!(a.kind, b.kind);
        assert_ne!(a.id, b.id);
    }
}
