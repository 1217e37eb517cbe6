//! In-memory reference host.
//!
//! [`Repository`] is a tiny multi-tenant content store that answers the
//! cache's catalog and hydration questions. [`MemoryHost`] plays the query
//! engine around it: it renders deterministic query text, drives the
//! [`QueryHooks`] in engine order and reports every write to the router.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::cache::lock::{rw_read, rw_write};
use crate::cache::{
    CacheConfig, CacheManager, ContentCatalog, FoundCount, Hydrator, Identified, KeyValueStore,
    ObjectId, ObjectInfo, Outcome, Projection, QueryDescriptor, QueryHooks, ResultRows,
    ResultSet, TenantId, WriteOrigin, max_pages,
};

const SOURCE: &str = "host";
const COUNT_QUERY: &str = "SELECT FOUND_ROWS()";

/// A stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: ObjectId,
    pub content_type: String,
    pub title: String,
    pub origin: WriteOrigin,
    /// Object a preview, autosave or revision copy belongs to.
    pub parent: Option<ObjectId>,
    /// Term slugs by grouping.
    pub terms: BTreeMap<String, BTreeSet<String>>,
    pub meta: BTreeMap<String, String>,
    pub comment_count: u64,
}

impl Identified for Record {
    fn object_id(&self) -> ObjectId {
        self.id
    }
}

type Objects = BTreeMap<ObjectId, Record>;

/// Multi-tenant object store. Content types and groupings are shared by all
/// tenants; objects are not.
pub struct Repository {
    tenant: RwLock<TenantId>,
    objects: RwLock<BTreeMap<TenantId, Objects>>,
    types: RwLock<BTreeSet<String>>,
    groupings: RwLock<BTreeMap<String, BTreeSet<String>>>,
    term_ids: RwLock<BTreeMap<(String, String), ObjectId>>,
    next_id: AtomicU64,
}

impl Repository {
    pub fn new(tenant: TenantId) -> Self {
        Self {
            tenant: RwLock::new(tenant),
            objects: RwLock::new(BTreeMap::new()),
            types: RwLock::new(BTreeSet::new()),
            groupings: RwLock::new(BTreeMap::new()),
            term_ids: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Blog-shaped defaults: `post` and `page`, with `category` and `tag`
    /// groupings attached to posts.
    pub fn with_defaults(tenant: TenantId) -> Self {
        let repo = Self::new(tenant);
        repo.register_type("post");
        repo.register_type("page");
        repo.register_grouping("category", &["post"]);
        repo.register_grouping("tag", &["post"]);
        repo
    }

    pub fn register_type(&self, name: &str) {
        rw_write(&self.types, SOURCE, "register_type").insert(name.to_string());
    }

    pub fn register_grouping(&self, grouping: &str, types: &[&str]) {
        rw_write(&self.groupings, SOURCE, "register_grouping").insert(
            grouping.to_string(),
            types.iter().map(|name| name.to_string()).collect(),
        );
    }

    pub fn tenant(&self) -> TenantId {
        *rw_read(&self.tenant, SOURCE, "tenant")
    }

    /// Look at a record of the active tenant, whatever its origin.
    pub fn get(&self, id: ObjectId) -> Option<Record> {
        let tenant = self.tenant();
        rw_read(&self.objects, SOURCE, "get")
            .get(&tenant)
            .and_then(|objects| objects.get(&id))
            .cloned()
    }

    fn set_tenant(&self, tenant: TenantId) -> TenantId {
        std::mem::replace(&mut *rw_write(&self.tenant, SOURCE, "set_tenant"), tenant)
    }

    fn allocate_id(&self) -> ObjectId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn term_id(&self, grouping: &str, slug: &str) -> ObjectId {
        let mut term_ids = rw_write(&self.term_ids, SOURCE, "term_id");
        *term_ids
            .entry((grouping.to_string(), slug.to_string()))
            .or_insert_with(|| self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn put(&self, record: Record) {
        let tenant = self.tenant();
        rw_write(&self.objects, SOURCE, "put")
            .entry(tenant)
            .or_default()
            .insert(record.id, record);
    }

    /// Apply `change` to a record of the active tenant and return its type.
    fn modify(&self, id: ObjectId, change: impl FnOnce(&mut Record)) -> Option<String> {
        let tenant = self.tenant();
        let mut objects = rw_write(&self.objects, SOURCE, "modify");
        let record = objects.get_mut(&tenant)?.get_mut(&id)?;
        change(record);
        Some(record.content_type.clone())
    }

    fn remove(&self, id: ObjectId) -> Option<Record> {
        let tenant = self.tenant();
        rw_write(&self.objects, SOURCE, "remove")
            .get_mut(&tenant)?
            .remove(&id)
    }

    /// Run `query` for real: matching authoritative ids, newest first, for the
    /// requested page, plus the total match count.
    fn execute(&self, query: &ListQuery) -> (Vec<ObjectId>, u64) {
        let tenant = self.tenant();
        let objects = rw_read(&self.objects, SOURCE, "execute");
        let needle = query.search.as_ref().map(|search| search.to_lowercase());

        let matched: Vec<ObjectId> = objects
            .get(&tenant)
            .into_iter()
            .flat_map(|objects| objects.values().rev())
            .filter(|record| record.origin.is_authoritative())
            .filter(|record| {
                query.content_types.is_empty() || query.content_types.contains(&record.content_type)
            })
            .filter(|record| match &query.term {
                Some((grouping, slug)) => record
                    .terms
                    .get(grouping)
                    .is_some_and(|slugs| slugs.contains(slug)),
                None => true,
            })
            .filter(|record| match &needle {
                Some(needle) => record.title.to_lowercase().contains(needle.as_str()),
                None => true,
            })
            .map(|record| record.id)
            .collect();

        let total = matched.len() as u64;
        let page = match usize::try_from(query.page_size) {
            Ok(size) if size > 0 => {
                let offset = query.offset().min(matched.len());
                matched[offset..].iter().copied().take(size).collect()
            }
            _ => matched,
        };
        (page, total)
    }
}

impl ContentCatalog for Repository {
    fn content_types(&self) -> Vec<String> {
        rw_read(&self.types, SOURCE, "content_types")
            .iter()
            .cloned()
            .collect()
    }

    fn type_exists(&self, name: &str) -> bool {
        rw_read(&self.types, SOURCE, "type_exists").contains(name)
    }

    fn grouping_types(&self, grouping: &str) -> Option<Vec<String>> {
        rw_read(&self.groupings, SOURCE, "grouping_types")
            .get(grouping)
            .map(|types| types.iter().cloned().collect())
    }

    fn lookup_object(&self, id: ObjectId) -> Option<ObjectInfo> {
        self.get(id).map(|record| ObjectInfo {
            id,
            content_type: record.content_type,
            origin: record.origin,
        })
    }
}

impl Hydrator<Record> for Repository {
    fn hydrate(&self, ids: &[ObjectId]) -> Vec<Record> {
        let tenant = self.tenant();
        let objects = rw_read(&self.objects, SOURCE, "hydrate");
        let Some(objects) = objects.get(&tenant) else {
            return Vec::new();
        };
        ids.iter().filter_map(|id| objects.get(id).cloned()).collect()
    }
}

/// A list query as the host's callers express it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub content_types: Vec<String>,
    /// `(grouping, slug)` filter.
    pub term: Option<(String, String)>,
    /// Case-insensitive title substring.
    pub search: Option<String>,
    /// 1-based page number.
    pub page: u64,
    pub page_size: i64,
    pub track_found: bool,
    pub projection: Projection,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            content_types: Vec::new(),
            term: None,
            search: None,
            page: 1,
            page_size: 10,
            track_found: true,
            projection: Projection::Records,
        }
    }
}

impl ListQuery {
    pub fn of_type(content_type: &str) -> Self {
        Self {
            content_types: vec![content_type.to_string()],
            ..Default::default()
        }
    }

    pub fn page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn page(mut self, page: u64) -> Self {
        self.page = page;
        self
    }

    pub fn with_term(mut self, grouping: &str, slug: &str) -> Self {
        self.term = Some((grouping.to_string(), slug.to_string()));
        self
    }

    pub fn search(mut self, text: &str) -> Self {
        self.search = Some(text.to_string());
        self
    }

    pub fn ids_only(mut self) -> Self {
        self.projection = Projection::Ids;
        self
    }

    pub fn without_found_count(mut self) -> Self {
        self.track_found = false;
        self
    }

    pub fn descriptor(&self) -> QueryDescriptor {
        QueryDescriptor {
            content_types: self.content_types.clone(),
            page_size: self.page_size,
            track_found: self.track_found,
            projection: self.projection,
        }
    }

    fn offset(&self) -> usize {
        let size = usize::try_from(self.page_size).unwrap_or(0);
        let page = usize::try_from(self.page.saturating_sub(1)).unwrap_or(usize::MAX);
        page.saturating_mul(size)
    }

    /// Deterministic query text. LIKE wildcards are written as `wildcard`,
    /// which lets a host escape them with a per-process marker.
    pub fn to_query_text(&self, wildcard: &str) -> String {
        let columns = match self.projection {
            Projection::Ids => "objects.id",
            Projection::Records => "objects.*",
        };
        let calc = if self.track_found {
            "SQL_CALC_FOUND_ROWS "
        } else {
            ""
        };

        let mut clauses = vec!["objects.origin = 'authoritative'".to_string()];
        if !self.content_types.is_empty() {
            let types: Vec<String> = self
                .content_types
                .iter()
                .map(|name| format!("'{}'", quote(name)))
                .collect();
            clauses.push(format!("objects.type IN ({})", types.join(", ")));
        }
        if let Some((grouping, slug)) = &self.term {
            clauses.push(format!(
                "terms.grouping = '{}' AND terms.slug = '{}'",
                quote(grouping),
                quote(slug)
            ));
        }
        if let Some(search) = &self.search {
            clauses.push(format!(
                "objects.title LIKE '{wildcard}{}{wildcard}'",
                quote(search)
            ));
        }

        let limit = if self.page_size > 0 {
            format!(" LIMIT {}, {}", self.offset(), self.page_size)
        } else {
            String::new()
        };

        format!(
            "SELECT {calc}{columns} FROM objects WHERE {} ORDER BY objects.id DESC{limit}",
            clauses.join(" AND ")
        )
    }
}

fn quote(value: &str) -> String {
    value.replace('\'', "''")
}

/// Outcome of one list query run through the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRun {
    pub result: ResultSet<Record>,
    pub outcome: Outcome,
    /// Whether the engine actually executed the query.
    pub executed: bool,
}

impl QueryRun {
    pub fn ids(&self) -> Vec<ObjectId> {
        self.result.rows.ids()
    }

    pub fn found(&self) -> Option<u64> {
        self.result.found.counted()
    }

    pub fn max_pages(&self) -> Option<u64> {
        self.result.max_pages
    }
}

/// Query engine plus write path over a [`Repository`], with the cache wired in.
pub struct MemoryHost {
    repo: Arc<Repository>,
    cache: CacheManager,
    wildcard: String,
    executions: AtomicUsize,
}

impl MemoryHost {
    pub fn new(config: CacheConfig, store: Arc<dyn KeyValueStore>, repo: Arc<Repository>) -> Self {
        let tenant = repo.tenant();
        let catalog: Arc<dyn ContentCatalog> = repo.clone();
        Self {
            cache: CacheManager::new(config, store, catalog, tenant),
            repo,
            wildcard: "%".to_string(),
            executions: AtomicUsize::new(0),
        }
    }

    /// Escape LIKE wildcards with `marker` in generated query text.
    pub fn with_wildcard_marker(mut self, marker: impl Into<String>) -> Self {
        self.wildcard = marker.into();
        self
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    /// Number of queries the engine actually executed.
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    pub fn query_text(&self, query: &ListQuery) -> String {
        query.to_query_text(&self.wildcard)
    }

    /// Run a list query: `before_execute`, execute, `before_count`, count,
    /// `after_count`, `after_execute`.
    pub fn query(&self, query: &ListQuery) -> QueryRun {
        let mut hooks = self
            .cache
            .begin_query::<Record>(&query.descriptor(), self.repo.as_ref());

        let mut result = ResultSet {
            rows: empty_rows(query.projection),
            found: FoundCount::NotTracked,
            max_pages: None,
        };
        let mut total = 0;
        let executed = hooks.before_execute(self.query_text(query)).is_some();
        if executed {
            self.executions.fetch_add(1, Ordering::SeqCst);
            let (ids, matched) = self.repo.execute(query);
            total = matched;
            result.rows = match query.projection {
                Projection::Ids => ResultRows::Ids(ids),
                Projection::Records => ResultRows::Records(self.repo.hydrate(&ids)),
            };
        }

        if query.track_found {
            let counted = match hooks.before_count(COUNT_QUERY.to_string()) {
                Some(_) => total,
                None => 0,
            };
            let found = hooks.after_count(counted);
            result.found = FoundCount::Counted(found);
            if executed {
                result.max_pages = max_pages(found, query.page_size);
            }
        }

        let result = hooks.after_execute(result);
        QueryRun {
            result,
            outcome: hooks.outcome(),
            executed,
        }
    }

    /// Create an authoritative object.
    pub fn insert(&self, content_type: &str, title: &str) -> ObjectId {
        let id = self.repo.allocate_id();
        self.repo.put(Record {
            id,
            content_type: content_type.to_string(),
            title: title.to_string(),
            origin: WriteOrigin::Authoritative,
            parent: None,
            terms: BTreeMap::new(),
            meta: BTreeMap::new(),
            comment_count: 0,
        });
        debug!(id, content_type, "Object inserted");
        self.cache.router().object_changed(id, Some(content_type));
        id
    }

    pub fn update_title(&self, id: ObjectId, title: &str) -> bool {
        let Some(content_type) = self.repo.modify(id, |record| record.title = title.to_string())
        else {
            return false;
        };
        self.cache.router().object_changed(id, Some(&content_type));
        true
    }

    pub fn delete(&self, id: ObjectId) -> bool {
        let Some(record) = self.repo.remove(id) else {
            return false;
        };
        self.cache
            .router()
            .object_changed(id, Some(&record.content_type));
        true
    }

    /// Attach a term of `grouping` to an object.
    pub fn assign_term(&self, id: ObjectId, grouping: &str, slug: &str) -> bool {
        let changed = self.repo.modify(id, |record| {
            record
                .terms
                .entry(grouping.to_string())
                .or_default()
                .insert(slug.to_string());
        });
        if changed.is_none() {
            return false;
        }
        let term_id = self.repo.term_id(grouping, slug);
        self.cache.router().grouping_changed(vec![term_id], grouping);
        true
    }

    pub fn set_meta(&self, id: ObjectId, key: &str, value: &str) -> bool {
        let changed = self.repo.modify(id, |record| {
            record.meta.insert(key.to_string(), value.to_string());
        });
        if changed.is_none() {
            return false;
        }
        self.cache.router().metadata_changed(id);
        true
    }

    /// Store a draft preview of `id`; the visible record is untouched.
    pub fn save_preview(&self, id: ObjectId, title: &str) -> Option<ObjectId> {
        self.speculative_copy(id, title, WriteOrigin::Preview)
    }

    /// Store an autosave copy of `id`; the visible record is untouched.
    pub fn autosave(&self, id: ObjectId, title: &str) -> Option<ObjectId> {
        self.speculative_copy(id, title, WriteOrigin::Autosave)
    }

    /// Snapshot `id` as a revision. The router resolves the copy through the
    /// catalog and finds a revision.
    pub fn save_revision(&self, id: ObjectId) -> Option<ObjectId> {
        let original = self.repo.get(id)?;
        let copy_id = self.repo.allocate_id();
        self.repo.put(Record {
            id: copy_id,
            origin: WriteOrigin::Revision,
            parent: Some(id),
            ..original
        });
        self.cache.router().object_changed(copy_id, None);
        Some(copy_id)
    }

    /// Recount comments on `id`. The write itself never invalidates.
    pub fn recount_comments(&self, id: ObjectId, count: u64) -> bool {
        let router = self.cache.router();
        router.recount_begin();
        let changed = self
            .repo
            .modify(id, |record| record.comment_count = count);
        if let Some(content_type) = changed.as_deref() {
            router.object_changed(id, Some(content_type));
        }
        router.recount_end();
        changed.is_some()
    }

    /// A bulk write the host cannot attribute to any object or type.
    pub fn bulk_import(&self, content_type: &str, titles: &[&str]) -> Vec<ObjectId> {
        let ids = titles
            .iter()
            .map(|title| {
                let id = self.repo.allocate_id();
                self.repo.put(Record {
                    id,
                    content_type: content_type.to_string(),
                    title: title.to_string(),
                    origin: WriteOrigin::Authoritative,
                    parent: None,
                    terms: BTreeMap::new(),
                    meta: BTreeMap::new(),
                    comment_count: 0,
                });
                id
            })
            .collect();
        self.cache.router().unclassified("bulk import");
        ids
    }

    /// Make `tenant` the active one for both the repository and the cache.
    pub fn switch_tenant(&self, tenant: TenantId) {
        let previous = self.repo.set_tenant(tenant);
        self.cache.tenant_switched(tenant, Some(previous));
    }

    fn speculative_copy(&self, id: ObjectId, title: &str, origin: WriteOrigin) -> Option<ObjectId> {
        let original = self.repo.get(id)?;
        let copy_id = self.repo.allocate_id();
        let content_type = original.content_type.clone();
        self.repo.put(Record {
            id: copy_id,
            title: title.to_string(),
            origin,
            parent: Some(id),
            ..original
        });
        self.cache
            .router()
            .object_changed_from(id, Some(&content_type), origin);
        Some(copy_id)
    }
}

fn empty_rows(projection: Projection) -> ResultRows<Record> {
    match projection {
        Projection::Ids => ResultRows::Ids(Vec::new()),
        Projection::Records => ResultRows::Records(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::memory::MemoryStore;

    fn host() -> MemoryHost {
        let config = CacheConfig::default();
        MemoryHost::new(
            config.clone(),
            Arc::new(MemoryStore::new(&config)),
            Arc::new(Repository::with_defaults(TenantId(1))),
        )
    }

    #[test]
    fn query_text_is_deterministic() {
        let query = ListQuery::of_type("post").page_size(2).page(3).search("it's");
        let text = query.to_query_text("%");
        assert_eq!(
            text,
            "SELECT SQL_CALC_FOUND_ROWS objects.* FROM objects WHERE \
             objects.origin = 'authoritative' AND objects.type IN ('post') AND \
             objects.title LIKE '%it''s%' ORDER BY objects.id DESC LIMIT 4, 2"
        );
        assert_eq!(text, query.to_query_text("%"));
    }

    #[test]
    fn unlimited_query_has_no_limit_clause() {
        let text = ListQuery::default().page_size(-1).to_query_text("%");
        assert!(!text.contains("LIMIT"));
    }

    #[test]
    fn execute_pages_newest_first() {
        let host = host();
        let ids: Vec<_> = (0..5).map(|n| host.insert("post", &format!("p{n}"))).collect();
        host.insert("page", "about");

        let run = host.query(&ListQuery::of_type("post").page_size(2).page(2));
        assert_eq!(run.ids(), vec![ids[2], ids[1]]);
        assert_eq!(run.found(), Some(5));
        assert_eq!(run.max_pages(), Some(3));
    }

    #[test]
    fn term_and_search_filters_apply() {
        let host = host();
        let rust = host.insert("post", "Rust caching");
        let go = host.insert("post", "Go caching");
        host.assign_term(rust, "category", "lang");
        host.assign_term(go, "category", "lang");

        let run = host.query(
            &ListQuery::of_type("post")
                .with_term("category", "lang")
                .search("RUST"),
        );
        assert_eq!(run.ids(), vec![rust]);
    }

    #[test]
    fn speculative_copies_are_hidden_from_queries() {
        let host = host();
        let id = host.insert("post", "live");
        host.save_preview(id, "draft").expect("preview");
        host.autosave(id, "autosave").expect("autosave");
        host.save_revision(id).expect("revision");

        let run = host.query(&ListQuery::of_type("post"));
        assert_eq!(run.ids(), vec![id]);
        match run.result.rows {
            ResultRows::Records(records) => assert_eq!(records[0].title, "live"),
            ResultRows::Ids(_) => panic!("expected records"),
        }
    }

    #[test]
    fn writes_to_missing_objects_report_false() {
        let host = host();
        assert!(!host.update_title(99, "x"));
        assert!(!host.delete(99));
        assert!(!host.assign_term(99, "tag", "x"));
        assert!(!host.set_meta(99, "k", "v"));
        assert!(!host.recount_comments(99, 1));
        assert!(host.save_preview(99, "x").is_none());
    }

    #[test]
    fn tenants_have_separate_objects() {
        let host = host();
        host.insert("post", "one");
        host.switch_tenant(TenantId(2));

        assert!(host.query(&ListQuery::of_type("post")).ids().is_empty());
        assert_eq!(host.cache().tenant(), TenantId(2));
    }
}
