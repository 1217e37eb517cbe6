//! Invalidation trigger router.
//!
//! Turns mutation events into salt bumps. Writes are planned in batches (see
//! [`InvalidationPlan`]); control events toggle suppression or reload the
//! Scope Map and split a batch into segments so ordering is respected.
//!
//! Suppression is a depth counted per calling thread: a recount window or a
//! [`SuppressionGuard`] only silences the writes of the thread that opened
//! it, and nested windows close in any order.

use std::sync::Arc;
use std::thread::{self, ThreadId};

use dashmap::DashMap;
use metrics::counter;
use tracing::{debug, info, instrument, warn};

use super::catalog::ContentCatalog;
use super::config::CacheConfig;
use super::events::{EventKind, MutationEvent, WriteOrigin};
use super::keys::{ObjectId, Scope, TenantId};
use super::planner::InvalidationPlan;
use super::salt::{GenerationToken, SaltRegistry};

const METRIC_BUMP_SUPPRESSED: &str = "postcache_bump_suppressed_total";

/// Routes mutation events to the scopes they invalidate.
///
/// # Usage
///
/// ```ignore
/// // After a successful object update:
/// router.object_changed(object.id, Some(&object.content_type));
///
/// // Around a benign aggregate recount:
/// let _guard = router.suppress();
/// recount_comment_totals();
/// ```
pub struct InvalidationRouter {
    config: CacheConfig,
    salts: Arc<SaltRegistry>,
    catalog: Arc<dyn ContentCatalog>,
    suppression: DashMap<ThreadId, usize>,
}

impl InvalidationRouter {
    pub fn new(
        config: CacheConfig,
        salts: Arc<SaltRegistry>,
        catalog: Arc<dyn ContentCatalog>,
    ) -> Self {
        Self {
            config,
            salts,
            catalog,
            suppression: DashMap::new(),
        }
    }

    /// Handle one event.
    pub fn handle(&self, event: MutationEvent) -> Vec<(Scope, GenerationToken)> {
        self.handle_batch(std::slice::from_ref(&event))
    }

    /// Handle events in order, returning every scope that was advanced.
    #[instrument(skip_all, fields(events = events.len()))]
    pub fn handle_batch(&self, events: &[MutationEvent]) -> Vec<(Scope, GenerationToken)> {
        let mut bumped = Vec::new();
        let mut segment_start = 0;

        for (index, event) in events.iter().enumerate() {
            if !is_control(&event.kind) {
                continue;
            }
            bumped.extend(self.flush(&events[segment_start..index]));
            self.apply_control(event);
            segment_start = index + 1;
        }
        bumped.extend(self.flush(&events[segment_start..]));
        bumped
    }

    /// A content object changed.
    pub fn object_changed(
        &self,
        id: ObjectId,
        content_type: Option<&str>,
    ) -> Vec<(Scope, GenerationToken)> {
        self.object_changed_from(id, content_type, WriteOrigin::Authoritative)
    }

    /// A content object changed through a possibly speculative write.
    pub fn object_changed_from(
        &self,
        id: ObjectId,
        content_type: Option<&str>,
        origin: WriteOrigin,
    ) -> Vec<(Scope, GenerationToken)> {
        self.handle(MutationEvent::with_origin(
            EventKind::ObjectChanged {
                id,
                content_type: content_type.map(str::to_string),
            },
            origin,
        ))
    }

    /// Grouping membership changed for the given terms.
    pub fn grouping_changed(
        &self,
        ids: Vec<ObjectId>,
        grouping: &str,
    ) -> Vec<(Scope, GenerationToken)> {
        self.handle(MutationEvent::new(EventKind::GroupingChanged {
            ids,
            grouping: grouping.to_string(),
        }))
    }

    /// Metadata attached to `object_id` changed.
    pub fn metadata_changed(&self, object_id: ObjectId) -> Vec<(Scope, GenerationToken)> {
        self.handle(MutationEvent::new(EventKind::MetadataChanged { object_id }))
    }

    /// A write nothing more is known about.
    pub fn unclassified(&self, description: &str) -> Vec<(Scope, GenerationToken)> {
        self.handle(MutationEvent::new(EventKind::Unclassified {
            description: description.to_string(),
        }))
    }

    pub fn recount_begin(&self) {
        self.handle(MutationEvent::new(EventKind::RecountBegin));
    }

    pub fn recount_end(&self) {
        self.handle(MutationEvent::new(EventKind::RecountEnd));
    }

    /// The active tenant changed; reloads the Scope Map unless it did not.
    pub fn tenant_switched(&self, new: TenantId, previous: Option<TenantId>) {
        self.handle(MutationEvent::new(EventKind::TenantSwitched { new, previous }));
    }

    /// Disable invalidation on the calling thread until the returned guard
    /// is dropped.
    pub fn suppress(&self) -> SuppressionGuard<'_> {
        let thread = thread::current().id();
        self.enter_suppression(thread);
        SuppressionGuard {
            router: self,
            thread,
        }
    }

    /// Whether writes reported from the calling thread advance salts.
    pub fn invalidation_allowed(&self) -> bool {
        self.suppression_depth(thread::current().id()) == 0
    }

    fn suppression_depth(&self, thread: ThreadId) -> usize {
        self.suppression.get(&thread).map_or(0, |depth| *depth)
    }

    fn enter_suppression(&self, thread: ThreadId) -> usize {
        let mut depth = self.suppression.entry(thread).or_insert(0);
        *depth += 1;
        *depth
    }

    /// Returns the remaining depth, or `None` when nothing was suppressed.
    fn leave_suppression(&self, thread: ThreadId) -> Option<usize> {
        let remaining = {
            let mut depth = self.suppression.get_mut(&thread)?;
            *depth = depth.saturating_sub(1);
            *depth
        };
        if remaining == 0 {
            self.suppression.remove_if(&thread, |_, depth| *depth == 0);
        }
        Some(remaining)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn apply_control(&self, event: &MutationEvent) {
        match &event.kind {
            EventKind::RecountBegin => {
                let depth = self.enter_suppression(thread::current().id());
                debug!(event_id = %event.id, depth, "Invalidation suppressed for recount");
            }
            EventKind::RecountEnd => match self.leave_suppression(thread::current().id()) {
                Some(depth) => {
                    debug!(event_id = %event.id, depth, "Recount window closed");
                }
                None => {
                    warn!(event_id = %event.id, "Recount end without a matching begin ignored");
                }
            },
            EventKind::TenantSwitched { new, previous } => {
                if *previous == Some(*new) {
                    debug!(tenant = %new, "Tenant switch to the same tenant ignored");
                } else {
                    self.salts.reload(*new);
                }
            }
            _ => {}
        }
    }

    fn flush(&self, events: &[MutationEvent]) -> Vec<(Scope, GenerationToken)> {
        if events.is_empty() {
            return Vec::new();
        }
        if !self.config.enabled {
            debug!(events = events.len(), "Invalidation skipped: cache disabled");
            return Vec::new();
        }

        let plan = InvalidationPlan::from_events(events, self.catalog.as_ref());
        for (reason, count) in &plan.skipped {
            counter!(METRIC_BUMP_SUPPRESSED, "reason" => reason.as_str()).increment(*count as u64);
        }
        for error in &plan.fail_open {
            warn!(error = %error, "Failing open to the `any` scope");
            error.record();
        }
        if plan.is_empty() {
            return Vec::new();
        }

        if !self.invalidation_allowed() {
            counter!(METRIC_BUMP_SUPPRESSED, "reason" => "recount").increment(1);
            info!(plan = %plan, "Invalidation suppressed");
            return Vec::new();
        }

        debug!(plan = %plan, "Executing invalidation plan");
        plan.bump_order()
            .into_iter()
            .map(|scope| {
                let token = self.salts.bump(&scope);
                (scope, token)
            })
            .collect()
    }
}

fn is_control(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::RecountBegin | EventKind::RecountEnd | EventKind::TenantSwitched { .. }
    )
}

/// Leaves one level of suppression for the thread that created it when
/// dropped.
#[must_use = "invalidation is re-enabled as soon as the guard is dropped"]
pub struct SuppressionGuard<'a> {
    router: &'a InvalidationRouter,
    thread: ThreadId,
}

impl Drop for SuppressionGuard<'_> {
    fn drop(&mut self) {
        self.router.leave_suppression(self.thread);
    }
}
