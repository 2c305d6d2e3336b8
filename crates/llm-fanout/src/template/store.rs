//! Loading and caching of template documents.

use super::{TemplateDocument, TemplateError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Where template documents come from.
#[async_trait]
pub trait TemplateSource: Send + Sync {
    /// Returns the raw YAML registered under `name`, or `None` if there is none.
    async fn read(&self, name: &str) -> Result<Option<String>, TemplateError>;
}

/// Reads `<root>/<name>.yaml` (falling back to `.yml`).
///
/// Names may contain `/` to address subdirectories, e.g. `recommend/property`.
/// Names that would escape `root` are treated as not found.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn candidate_paths(&self, name: &str) -> Option<[PathBuf; 2]> {
        let relative = Path::new(name);
        let is_plain = !name.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !is_plain {
            return None;
        }
        Some([
            self.root.join(format!("{name}.yaml")),
            self.root.join(format!("{name}.yml")),
        ])
    }
}

#[async_trait]
impl TemplateSource for DirectorySource {
    async fn read(&self, name: &str) -> Result<Option<String>, TemplateError> {
        let Some(candidates) = self.candidate_paths(name) else {
            debug!(template = %name, "Rejected template name outside of source root");
            return Ok(None);
        };

        for path in candidates {
            match tokio::fs::read_to_string(&path).await {
                Ok(text) => return Ok(Some(text)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => {
                    return Err(TemplateError::Io {
                        name: name.to_string(),
                        source,
                    });
                }
            }
        }
        Ok(None)
    }
}

/// Documents registered from strings, for tests and embedded defaults.
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    documents: HashMap<String, String>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(mut self, name: impl Into<String>, yaml: impl Into<String>) -> Self {
        self.documents.insert(name.into(), yaml.into());
        self
    }
}

#[async_trait]
impl TemplateSource for InMemorySource {
    async fn read(&self, name: &str) -> Result<Option<String>, TemplateError> {
        Ok(self.documents.get(name).cloned())
    }
}

type CacheSlot = Arc<OnceCell<Arc<TemplateDocument>>>;

/// Caches parsed template documents by name.
///
/// The first `load` of a name reads and parses it; later loads return the
/// cached document. Concurrent first loads of the same name share a single
/// parse. Failed loads are not cached.
///
/// # Examples
///
/// ```
/// use llm_fanout::template::{InMemorySource, TemplateStore};
///
/// # tokio_test_block(async {
/// let source = InMemorySource::new().with_document(
///     "greet",
///     "config: {model: m, temperature: 0, max_tokens: 10}\ntemplate: Hi {{name}}\nschema: {}\n",
/// );
/// let store = TemplateStore::new(source);
///
/// let doc = store.load("greet").await.unwrap();
/// assert_eq!(doc.body, "Hi {{name}}");
/// assert_eq!(store.cached_names(), vec!["greet".to_string()]);
/// # });
/// # fn tokio_test_block(f: impl std::future::Future<Output = ()>) {
/// #     tokio::runtime::Runtime::new().unwrap().block_on(f)
/// # }
/// ```
pub struct TemplateStore {
    source: Arc<dyn TemplateSource>,
    cache: Mutex<HashMap<String, CacheSlot>>,
    parse_count: AtomicUsize,
}

impl TemplateStore {
    pub fn new(source: impl TemplateSource + 'static) -> Self {
        Self::from_source(Arc::new(source))
    }

    pub fn from_source(source: Arc<dyn TemplateSource>) -> Self {
        Self {
            source,
            cache: Mutex::new(HashMap::new()),
            parse_count: AtomicUsize::new(0),
        }
    }

    /// Returns the document registered under `name`.
    ///
    /// # Errors
    ///
    /// - [`TemplateError::NotFound`] if the source has no such document.
    /// - [`TemplateError::Malformed`] if it lacks required fields.
    /// - [`TemplateError::Io`] if the source could not be read.
    pub async fn load(&self, name: &str) -> Result<Arc<TemplateDocument>, TemplateError> {
        let slot = {
            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(cache.entry(name.to_string()).or_default())
        };

        if let Some(document) = slot.get() {
            debug!(template = %name, "Template cache hit");
            return Ok(Arc::clone(document));
        }

        let loaded = slot
            .get_or_try_init(|| async {
                let text = self
                    .source
                    .read(name)
                    .await?
                    .ok_or_else(|| TemplateError::NotFound(name.to_string()))?;
                self.parse_count.fetch_add(1, Ordering::SeqCst);
                let document = TemplateDocument::from_yaml_str(name, &text)?;
                info!(
                    template = %name,
                    version = %document.version,
                    model = %document.model_parameters.model_id,
                    "Template document loaded"
                );
                Ok::<_, TemplateError>(Arc::new(document))
            })
            .await;

        match loaded {
            Ok(document) => Ok(Arc::clone(document)),
            Err(err) => {
                self.evict_empty(name, &slot);
                Err(err)
            }
        }
    }

    /// Removes the slot for `name` if it is still `slot` and never filled.
    ///
    /// A slot replaced by `clear_cache` and a fresh load is left alone.
    fn evict_empty(&self, name: &str, slot: &CacheSlot) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = cache.get(name)
            && Arc::ptr_eq(current, slot)
            && !current.initialized()
        {
            cache.remove(name);
        }
    }

    /// Drops every cached document.
    pub fn clear_cache(&self) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let dropped = cache.len();
        cache.clear();
        debug!(dropped, "Template cache cleared");
    }

    /// Names of the documents currently cached, sorted.
    pub fn cached_names(&self) -> Vec<String> {
        let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = cache
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Number of slots held in the cache, including loads still in flight.
    pub fn slot_count(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// How many documents have been parsed since construction.
    pub fn parse_count(&self) -> usize {
        self.parse_count.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for TemplateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateStore")
            .field("cached", &self.cached_names())
            .field("parse_count", &self.parse_count())
            .finish()
    }
}
