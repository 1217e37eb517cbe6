//! Invalidation plan generation.
//!
//! Resolves mutation events to the set of scopes whose salts must advance.
//! Several events in one batch that touch the same scope collapse into a
//! single bump.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use uuid::Uuid;

use super::catalog::ContentCatalog;
use super::error::CacheError;
use super::events::{EventKind, MutationEvent, WriteOrigin};
use super::keys::{ObjectId, Scope};

/// Why an event produced no bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SkipReason {
    Preview,
    Autosave,
    Revision,
    /// Recount markers and tenant switches are control events, not writes.
    Control,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preview => "preview",
            Self::Autosave => "autosave",
            Self::Revision => "revision",
            Self::Control => "control",
        }
    }

    fn from_origin(origin: WriteOrigin) -> Option<Self> {
        match origin {
            WriteOrigin::Authoritative => None,
            WriteOrigin::Preview => Some(Self::Preview),
            WriteOrigin::Autosave => Some(Self::Autosave),
            WriteOrigin::Revision => Some(Self::Revision),
        }
    }
}

/// Scopes to advance for a batch of events.
#[derive(Debug, Default)]
pub struct InvalidationPlan {
    /// Scopes to bump. When `any` is present it already covers everything.
    pub scopes: BTreeSet<Scope>,
    /// Events that resolved to no scope and fell back to `any`.
    pub fail_open: Vec<CacheError>,
    /// Events skipped without touching any salt, by reason.
    pub skipped: BTreeMap<SkipReason, usize>,
}

impl fmt::Display for InvalidationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scopes: Vec<&str> = self.scopes.iter().map(Scope::as_str).collect();
        write!(
            f,
            "InvalidationPlan {{ scopes: [{}], fail_open: {}, skipped: {} }}",
            scopes.join(", "),
            self.fail_open.len(),
            self.skipped.values().sum::<usize>(),
        )
    }
}

impl InvalidationPlan {
    /// Resolve a batch of events against the host catalog.
    ///
    /// Events are deduplicated by id. Control events (recount markers, tenant
    /// switches) are the router's business and are counted as skipped here.
    pub fn from_events(events: &[MutationEvent], catalog: &dyn ContentCatalog) -> Self {
        let mut plan = Self::default();
        let mut seen: HashSet<Uuid> = HashSet::new();

        for event in events.iter().filter(|event| seen.insert(event.id)) {
            if let Some(reason) = SkipReason::from_origin(event.origin) {
                plan.skip(reason);
                continue;
            }

            match &event.kind {
                EventKind::ObjectChanged { id, content_type } => {
                    plan.object(*id, content_type.as_deref(), catalog);
                }
                EventKind::MetadataChanged { object_id } => {
                    plan.object(*object_id, None, catalog);
                }
                EventKind::GroupingChanged { grouping, .. } => plan.grouping(grouping, catalog),
                EventKind::Unclassified { description } => {
                    plan.fail_open(CacheError::unknown_scope(format!(
                        "unclassified write ({description})"
                    )));
                }
                EventKind::RecountBegin
                | EventKind::RecountEnd
                | EventKind::TenantSwitched { .. } => plan.skip(SkipReason::Control),
            }
        }

        plan
    }

    /// Check if the plan advances nothing.
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Scopes in the order they should be bumped. A plan that contains `any`
    /// collapses to `any` alone.
    pub fn bump_order(&self) -> Vec<Scope> {
        if self.scopes.iter().any(Scope::is_any) {
            return vec![Scope::any()];
        }
        self.scopes.iter().cloned().collect()
    }

    fn skip(&mut self, reason: SkipReason) {
        *self.skipped.entry(reason).or_default() += 1;
    }

    fn fail_open(&mut self, error: CacheError) {
        self.scopes.insert(Scope::any());
        self.fail_open.push(error);
    }

    /// Content-object rule: bump the object's type, resolving it through the
    /// catalog when the emitter did not know it or named an unknown type.
    fn object(&mut self, id: ObjectId, declared: Option<&str>, catalog: &dyn ContentCatalog) {
        if let Some(name) = declared
            && catalog.type_exists(name)
        {
            self.scopes.insert(Scope::content_type(name));
            return;
        }

        match catalog.lookup_object(id) {
            Some(info) => {
                if let Some(reason) = SkipReason::from_origin(info.origin) {
                    self.skip(reason);
                } else if catalog.type_exists(&info.content_type) {
                    self.scopes.insert(Scope::content_type(info.content_type));
                } else {
                    self.fail_open(CacheError::unknown_scope(format!(
                        "object {id} of unregistered type `{}`",
                        info.content_type
                    )));
                }
            }
            None => self.fail_open(CacheError::unknown_scope(format!("object {id}"))),
        }
    }

    fn grouping(&mut self, grouping: &str, catalog: &dyn ContentCatalog) {
        let types: Vec<String> = catalog
            .grouping_types(grouping)
            .unwrap_or_default()
            .into_iter()
            .filter(|name| catalog.type_exists(name))
            .collect();

        if types.is_empty() {
            self.fail_open(CacheError::unknown_scope(format!("grouping `{grouping}`")));
            return;
        }
        self.scopes
            .extend(types.into_iter().map(Scope::content_type));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::catalog::ObjectInfo;
    use crate::cache::keys::TenantId;

    struct Catalog;

    impl ContentCatalog for Catalog {
        fn content_types(&self) -> Vec<String> {
            vec!["post".into(), "page".into(), "product".into()]
        }

        fn grouping_types(&self, grouping: &str) -> Option<Vec<String>> {
            match grouping {
                "category" => Some(vec!["post".into()]),
                "brand" => Some(vec!["product".into(), "page".into()]),
                "legacy" => Some(vec!["retired_type".into()]),
                _ => None,
            }
        }

        fn lookup_object(&self, id: ObjectId) -> Option<ObjectInfo> {
            match id {
                1 => Some(ObjectInfo {
                    id,
                    content_type: "post".into(),
                    origin: WriteOrigin::Authoritative,
                }),
                2 => Some(ObjectInfo {
                    id,
                    content_type: "post".into(),
                    origin: WriteOrigin::Revision,
                }),
                3 => Some(ObjectInfo {
                    id,
                    content_type: "ghost".into(),
                    origin: WriteOrigin::Authoritative,
                }),
                _ => None,
            }
        }
    }

    fn plan(kinds: Vec<EventKind>) -> InvalidationPlan {
        let events: Vec<_> = kinds.into_iter().map(MutationEvent::new).collect();
        InvalidationPlan::from_events(&events, &Catalog)
    }

    fn scopes(names: &[&str]) -> BTreeSet<Scope> {
        names.iter().map(|name| Scope::content_type(*name)).collect()
    }

    #[test]
    fn object_with_known_type_bumps_that_type() {
        let plan = plan(vec![EventKind::ObjectChanged {
            id: 99,
            content_type: Some("page".into()),
        }]);
        assert_eq!(plan.scopes, scopes(&["page"]));
        assert!(plan.fail_open.is_empty());
    }

    #[test]
    fn object_without_type_is_looked_up() {
        let plan = plan(vec![EventKind::ObjectChanged {
            id: 1,
            content_type: None,
        }]);
        assert_eq!(plan.scopes, scopes(&["post"]));
    }

    #[test]
    fn unresolvable_object_fails_open() {
        let plan = plan(vec![
            EventKind::ObjectChanged {
                id: 404,
                content_type: Some("nope".into()),
            },
            EventKind::ObjectChanged {
                id: 3,
                content_type: None,
            },
        ]);
        assert_eq!(plan.bump_order(), vec![Scope::any()]);
        assert_eq!(plan.fail_open.len(), 2);
    }

    #[test]
    fn revision_objects_are_skipped() {
        let plan = plan(vec![EventKind::MetadataChanged { object_id: 2 }]);
        assert!(plan.is_empty());
        assert_eq!(plan.skipped.get(&SkipReason::Revision), Some(&1));
    }

    #[test]
    fn metadata_change_follows_owning_object() {
        let plan = plan(vec![EventKind::MetadataChanged { object_id: 1 }]);
        assert_eq!(plan.scopes, scopes(&["post"]));
    }

    #[test]
    fn grouping_bumps_each_associated_type() {
        let plan = plan(vec![EventKind::GroupingChanged {
            ids: vec![7],
            grouping: "brand".into(),
        }]);
        assert_eq!(plan.scopes, scopes(&["page", "product"]));
    }

    #[test]
    fn unknown_or_empty_grouping_fails_open() {
        for grouping in ["mystery", "legacy"] {
            let plan = plan(vec![EventKind::GroupingChanged {
                ids: vec![],
                grouping: grouping.into(),
            }]);
            assert_eq!(plan.bump_order(), vec![Scope::any()], "{grouping}");
        }
    }

    #[test]
    fn unclassified_write_fails_open() {
        let plan = plan(vec![EventKind::Unclassified {
            description: "bulk sql".into(),
        }]);
        assert!(plan.scopes.contains(&Scope::any()));
        assert!(matches!(plan.fail_open[0], CacheError::UnknownScope { .. }));
    }

    #[test]
    fn speculative_origins_and_control_events_are_skipped() {
        let events = vec![
            MutationEvent::with_origin(
                EventKind::ObjectChanged {
                    id: 1,
                    content_type: Some("post".into()),
                },
                WriteOrigin::Preview,
            ),
            MutationEvent::with_origin(
                EventKind::ObjectChanged {
                    id: 1,
                    content_type: Some("post".into()),
                },
                WriteOrigin::Autosave,
            ),
            MutationEvent::new(EventKind::RecountBegin),
            MutationEvent::new(EventKind::TenantSwitched {
                new: TenantId(2),
                previous: Some(TenantId(1)),
            }),
        ];
        let plan = InvalidationPlan::from_events(&events, &Catalog);
        assert!(plan.is_empty());
        assert_eq!(plan.skipped.values().sum::<usize>(), 4);
    }

    #[test]
    fn batch_collapses_duplicate_scopes() {
        let event = MutationEvent::new(EventKind::ObjectChanged {
            id: 1,
            content_type: Some("post".into()),
        });
        let events = vec![
            event.clone(),
            event,
            MutationEvent::new(EventKind::GroupingChanged {
                ids: vec![1],
                grouping: "category".into(),
            }),
        ];
        let plan = InvalidationPlan::from_events(&events, &Catalog);
        assert_eq!(plan.bump_order(), vec![Scope::content_type("post")]);
        assert!(plan.to_string().contains("scopes: [post]"));
    }
}
