//! Cache key definitions.
//!
//! Defines invalidation [`Scope`]s, query [`Fingerprint`]s and the
//! [`CompositeKey`] a result entry is stored under.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::salt::GenerationToken;

/// Identifier of a stored object, as handed out by the host.
pub type ObjectId = u64;

/// Identifier of the active tenant (site, workspace, blog...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub u64);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An invalidation domain.
///
/// Either the catch-all `any` scope or the name of one content type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope(String);

impl Scope {
    pub const ANY: &'static str = "any";

    pub fn any() -> Self {
        Self(Self::ANY.to_string())
    }

    /// Scope of a single content type. The reserved name `any` maps to the
    /// catch-all scope.
    pub fn content_type(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn is_any(&self) -> bool {
        self.0 == Self::ANY
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Digest of a canonicalized query text. Independent of scope and tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fingerprint plus the generation token of the scope it was resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompositeKey(String);

impl CompositeKey {
    pub fn new(fingerprint: &Fingerprint, token: GenerationToken) -> Self {
        Self(format!("{fingerprint}.{token}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key under which a scope's generation token lives in the salt namespace.
pub(crate) fn salt_key(scope: &Scope) -> String {
    format!("incrementor:{scope}")
}

/// Store namespace for one tenant.
pub(crate) fn tenant_namespace(base: &str, tenant: TenantId) -> String {
    format!("{base}:{tenant}")
}

// ============================================================================
// Fingerprinting
// ============================================================================

/// Produces stable fingerprints from backend query text.
///
/// Some backends escape literal `%` characters into a per-process random
/// placeholder before the text is finalized. Two otherwise identical search
/// queries would then never collide, so every configured marker is turned back
/// into `%` before hashing.
#[derive(Debug, Clone, Default)]
pub struct Fingerprinter {
    placeholder_markers: Vec<String>,
}

impl Fingerprinter {
    pub fn new(placeholder_markers: Vec<String>) -> Self {
        let placeholder_markers = placeholder_markers
            .into_iter()
            .filter(|marker| !marker.is_empty())
            .collect();
        Self {
            placeholder_markers,
        }
    }

    pub fn canonicalize(&self, query_text: &str) -> String {
        let mut canonical = query_text.trim().to_string();
        for marker in &self.placeholder_markers {
            if canonical.contains(marker.as_str()) {
                canonical = canonical.replace(marker.as_str(), "%");
            }
        }
        canonical
    }

    pub fn fingerprint(&self, query_text: &str) -> Fingerprint {
        let digest = Sha256::digest(self.canonicalize(query_text).as_bytes());
        Fingerprint(hex::encode(digest))
    }
}
