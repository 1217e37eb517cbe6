//! What the cache needs to know about the host's content model.

use super::events::WriteOrigin;
use super::keys::ObjectId;

/// A stored object as seen by the invalidation router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub id: ObjectId,
    pub content_type: String,
    /// Revisions and autosave copies report a non-authoritative origin.
    pub origin: WriteOrigin,
}

/// Read-only view of the host's content types, groupings and objects.
pub trait ContentCatalog: Send + Sync {
    /// Every content type currently registered.
    fn content_types(&self) -> Vec<String>;

    fn type_exists(&self, name: &str) -> bool {
        self.content_types().iter().any(|known| known == name)
    }

    /// Content types a grouping (taxonomy) is attached to, or `None` when the
    /// grouping itself is unknown.
    fn grouping_types(&self, grouping: &str) -> Option<Vec<String>>;

    fn lookup_object(&self, id: ObjectId) -> Option<ObjectInfo>;
}

/// Turns identifiers back into full records.
pub trait Hydrator<R>: Send + Sync {
    /// Returns the records for `ids` in the same order. Identifiers with no
    /// backing record are skipped.
    fn hydrate(&self, ids: &[ObjectId]) -> Vec<R>;
}
