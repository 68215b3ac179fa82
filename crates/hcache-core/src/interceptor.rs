//! Declarative caching for async operations.
//!
//! A [`Cacheable`] is registered once per operation and wraps each call:
//!
//! ```ignore
//! let find_user = Cacheable::new(
//!     "UserService.find",
//!     CacheConfiguration::named("users").with_key("user:{id}").with_ttl_minutes(10),
//! )?;
//!
//! let user: User = find_user
//!     .invoke(&manager, &CallArgs::new().arg("id", 42), || repo.find(42))
//!     .await?;
//! ```
//!
//! The key comes from the configured expression, an explicit key function,
//! or `operation(arg0,arg1,...)` when neither is given. Configured
//! `parameters` are looked up among the call arguments and folded into the
//! key as search parameters.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::CacheConfiguration;
use crate::error::{CacheError, CacheResult};
use crate::key::{CacheKey, CallArgs, KeyTemplate, SearchParameter, default_logical_key};
use crate::manager::CacheManager;
use crate::service::HierarchicalCacheService;

/// Custom logical key derivation.
pub type KeyFn = Arc<dyn Fn(&CallArgs) -> CacheResult<String> + Send + Sync>;

#[derive(Clone)]
enum KeySource {
    Template(KeyTemplate),
    Function(KeyFn),
    Default,
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySource::Template(template) => write!(f, "Template({:?})", template.source()),
            KeySource::Function(_) => f.write_str("Function"),
            KeySource::Default => f.write_str("Default"),
        }
    }
}

/// Cache registration for one operation.
#[derive(Debug, Clone)]
pub struct Cacheable {
    operation: String,
    config: CacheConfiguration,
    key_source: KeySource,
}

impl Cacheable {
    /// Register `operation` against the cache described by `config`. Invalid
    /// settings or a malformed key expression fail here, before any call.
    pub fn new(operation: impl Into<String>, config: CacheConfiguration) -> CacheResult<Self> {
        config.validate()?;
        let key_source = match config.key_template()? {
            Some(template) => KeySource::Template(template),
            None => KeySource::Default,
        };
        Ok(Self {
            operation: operation.into(),
            config,
            key_source,
        })
    }

    /// Derive the logical key with `key_fn` instead of the key expression.
    pub fn with_key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&CallArgs) -> CacheResult<String> + Send + Sync + 'static,
    {
        self.key_source = KeySource::Function(Arc::new(key_fn));
        self
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn config(&self) -> &CacheConfiguration {
        &self.config
    }

    fn logical_key(&self, args: &CallArgs) -> CacheResult<String> {
        match &self.key_source {
            KeySource::Template(template) => template.render(args),
            KeySource::Function(key_fn) => key_fn(args),
            KeySource::Default => Ok(default_logical_key(&self.operation, args)),
        }
    }

    fn search_parameters(&self, args: &CallArgs) -> CacheResult<Vec<SearchParameter>> {
        self.config
            .parameter_levels()
            .map(|(name, level)| {
                let value = args.by_name(name).ok_or_else(|| {
                    CacheError::invalid_key(format!(
                        "operation '{}' has no argument '{name}' for search parameter",
                        self.operation
                    ))
                })?;
                Ok(SearchParameter::new(name, value, level))
            })
            .collect()
    }

    /// Physical key for a call against `cache`.
    pub fn derive_key(&self, cache: &HierarchicalCacheService, args: &CallArgs) -> CacheResult<CacheKey> {
        let logical = self.logical_key(args)?;
        let parameters = self.search_parameters(args)?;
        cache.key_with(&logical, &parameters)
    }

    /// Return the cached result for this call, or run `compute` and cache
    /// its result.
    ///
    /// Key derivation and configuration errors are returned before `compute`
    /// runs. Errors from `compute` propagate unchanged and are never cached.
    pub async fn invoke<T, E, F, Fut>(&self, manager: &CacheManager, args: &CallArgs, compute: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<CacheError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let cache = manager.get_or_register(&self.config)?;
        let key = self.derive_key(&cache, args)?;
        if let Some(hit) = cache.get_value::<T>(&key).await {
            return Ok(hit);
        }

        let value = compute().await?;
        self.store(&cache, &key, &value).await;
        Ok(value)
    }

    /// Like [`invoke`](Self::invoke) for operations that may find nothing.
    /// `None` results are returned but not cached.
    pub async fn invoke_optional<T, E, F, Fut>(
        &self,
        manager: &CacheManager,
        args: &CallArgs,
        compute: F,
    ) -> Result<Option<T>, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<CacheError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        let cache = manager.get_or_register(&self.config)?;
        let key = self.derive_key(&cache, args)?;
        if let Some(hit) = cache.get_value::<T>(&key).await {
            return Ok(Some(hit));
        }

        let value = compute().await?;
        if let Some(value) = &value {
            self.store(&cache, &key, value).await;
        }
        Ok(value)
    }

    async fn store<T: Serialize>(&self, cache: &HierarchicalCacheService, key: &CacheKey, value: &T) {
        if let Err(e) = cache.put_value(key, value).await {
            tracing::warn!(
                operation = %self.operation,
                key = %key,
                error = %e,
                "result not cached"
            );
        }
    }
}
