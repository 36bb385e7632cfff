//! Language catalog and per-scope instance cache
//!
//! The catalog maps language names and file extensions to factories. Scoped
//! acquisitions are memoized per language so that interpreter state (such as
//! the function side table) persists across calls within one durable workflow
//! but never leaks between scopes.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

use super::Lang;
use super::data::DataLang;
use super::error::{LangError, LangResult};
use super::sexpr::SexprLang;
use crate::config::CatalogConfig;

/// Factory producing a fresh language instance.
pub type LangFactory = Arc<dyn Fn() -> Arc<dyn Lang> + Send + Sync>;

/// Registration record for one language.
#[derive(Clone)]
pub struct CatalogEntry {
    /// Instance factory.
    pub factory: LangFactory,
    /// File extensions (without the dot) handled by the language.
    pub extensions: Vec<String>,
}

impl CatalogEntry {
    /// Build an entry from a factory closure.
    pub fn new<F>(extensions: &[&str], factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Lang> + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
            extensions: extensions.iter().map(|ext| ext.to_string()).collect(),
        }
    }
}

#[derive(Default)]
struct ScopeCache {
    instances: HashMap<String, Arc<dyn Lang>>,
    // least recently acquired first
    order: VecDeque<String>,
}

impl ScopeCache {
    fn touch(&mut self, scope: &str) {
        if let Some(pos) = self.order.iter().position(|s| s == scope) {
            self.order.remove(pos);
        }
        self.order.push_back(scope.to_string());
    }

    fn remove(&mut self, scope: &str) -> bool {
        self.order.retain(|s| s != scope);
        self.instances.remove(scope).is_some()
    }
}

struct Registered {
    entry: CatalogEntry,
    cache: Mutex<ScopeCache>,
}

/// Registry of language plugins.
pub struct Catalog {
    langs: RwLock<BTreeMap<String, Arc<Registered>>>,
    max_cached_scopes: usize,
}

impl Catalog {
    /// Create an empty catalog.
    pub fn new(config: &CatalogConfig) -> Self {
        Self {
            langs: RwLock::new(BTreeMap::new()),
            max_cached_scopes: config.max_cached_scopes.max(1),
        }
    }

    /// Create a catalog with the built-in `sexpr`, `text`, `json` and `binary` languages.
    pub fn with_builtin_langs(config: &CatalogConfig) -> Self {
        let catalog = Self::new(config);
        catalog.register(
            "sexpr",
            CatalogEntry::new(&["sx", "sexpr"], || Arc::new(SexprLang::new())),
        );
        catalog.register(
            "text",
            CatalogEntry::new(&["txt", "md"], || Arc::new(DataLang::text())),
        );
        catalog.register(
            "json",
            CatalogEntry::new(&["json"], || Arc::new(DataLang::json())),
        );
        catalog.register(
            "binary",
            CatalogEntry::new(&["bin"], || Arc::new(DataLang::binary())),
        );
        catalog
    }

    /// Register a language.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already registered.
    pub fn register(&self, name: &str, entry: CatalogEntry) {
        let mut langs = self.langs.write();
        if langs.contains_key(name) {
            panic!("language '{}' registered twice", name);
        }
        langs.insert(
            name.to_string(),
            Arc::new(Registered {
                entry,
                cache: Mutex::new(ScopeCache::default()),
            }),
        );
    }

    /// Registered languages and their extensions.
    pub fn list(&self) -> BTreeMap<String, Vec<String>> {
        self.langs
            .read()
            .iter()
            .map(|(name, reg)| (name.clone(), reg.entry.extensions.clone()))
            .collect()
    }

    /// Language registered for a path's extension.
    pub fn lang_for_path(&self, path: &str) -> Option<String> {
        let ext = std::path::Path::new(path).extension()?.to_str()?;
        self.langs
            .read()
            .iter()
            .find(|(_, reg)| reg.entry.extensions.iter().any(|e| e == ext))
            .map(|(name, _)| name.clone())
    }

    /// Acquire a language instance.
    ///
    /// An empty scope always yields a fresh, uncached instance. A non-empty
    /// scope yields the instance cached for that scope, creating it on first
    /// use.
    pub fn acquire(&self, name: &str, scope: &str) -> LangResult<Arc<dyn Lang>> {
        let registered = self
            .langs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| LangError::NotFound(format!("language '{}'", name)))?;

        if scope.is_empty() {
            return Ok((registered.entry.factory)());
        }

        let mut cache = registered.cache.lock();
        cache.touch(scope);
        if let Some(lang) = cache.instances.get(scope) {
            return Ok(lang.clone());
        }

        let lang = (registered.entry.factory)();
        cache.instances.insert(scope.to_string(), lang.clone());
        while cache.instances.len() > self.max_cached_scopes {
            let Some(evicted) = cache.order.pop_front() else {
                break;
            };
            cache.instances.remove(&evicted);
            debug!(lang = name, scope = %evicted, "evicted cached language instance");
        }
        Ok(lang)
    }

    /// Drop every cached instance belonging to `scope`.
    pub fn release(&self, scope: &str) {
        let langs: Vec<(String, Arc<Registered>)> = self
            .langs
            .read()
            .iter()
            .map(|(name, reg)| (name.clone(), reg.clone()))
            .collect();
        for (name, registered) in langs {
            if registered.cache.lock().remove(scope) {
                debug!(lang = %name, scope, "released cached language instance");
            }
        }
    }

    /// Number of cached scopes for a language.
    pub fn cached_scopes(&self, name: &str) -> usize {
        self.langs
            .read()
            .get(name)
            .map(|reg| reg.cache.lock().instances.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog(max: usize) -> Catalog {
        Catalog::with_builtin_langs(&CatalogConfig {
            max_cached_scopes: max,
        })
    }

    #[test]
    fn lists_languages_by_extension() {
        let catalog = catalog(4);
        assert_eq!(catalog.lang_for_path("lib/main.sx").as_deref(), Some("sexpr"));
        assert_eq!(catalog.lang_for_path("data.json").as_deref(), Some("json"));
        assert_eq!(catalog.lang_for_path("noext"), None);
        assert!(catalog.list().contains_key("binary"));
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_registration_panics() {
        let catalog = catalog(4);
        catalog.register("json", CatalogEntry::new(&["j"], || Arc::new(DataLang::json())));
    }

    #[test]
    fn scoped_instances_are_cached_and_isolated() {
        let catalog = catalog(4);
        let a1 = catalog.acquire("sexpr", "a").unwrap();
        let a2 = catalog.acquire("sexpr", "a").unwrap();
        let b = catalog.acquire("sexpr", "b").unwrap();
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));

        let fresh1 = catalog.acquire("sexpr", "").unwrap();
        let fresh2 = catalog.acquire("sexpr", "").unwrap();
        assert!(!Arc::ptr_eq(&fresh1, &fresh2));
        assert_eq!(catalog.cached_scopes("sexpr"), 2);
    }

    #[test]
    fn least_recently_acquired_scope_is_evicted() {
        let catalog = catalog(2);
        let a = catalog.acquire("sexpr", "a").unwrap();
        catalog.acquire("sexpr", "b").unwrap();
        catalog.acquire("sexpr", "a").unwrap();
        catalog.acquire("sexpr", "c").unwrap();

        assert_eq!(catalog.cached_scopes("sexpr"), 2);
        let a_again = catalog.acquire("sexpr", "a").unwrap();
        assert!(Arc::ptr_eq(&a, &a_again));
    }

    #[test]
    fn release_drops_scope_everywhere() {
        let catalog = catalog(4);
        catalog.acquire("sexpr", "s").unwrap();
        catalog.acquire("json", "s").unwrap();
        catalog.release("s");
        assert_eq!(catalog.cached_scopes("sexpr"), 0);
        assert_eq!(catalog.cached_scopes("json"), 0);
    }

    #[test]
    fn unknown_language_is_not_found() {
        assert!(matches!(
            catalog(1).acquire("cobol", "s"),
            Err(LangError::NotFound(_))
        ));
    }
}
