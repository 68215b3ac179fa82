//! Cache key derivation.
//!
//! A physical key has the shape
//!
//! ```text
//! {prefix}:{cache name}:{cache level}:{logical key}[#{parameter digest}]
//! ```
//!
//! The digest is present only when search parameters are supplied. It is the
//! first 16 hex characters of the SHA-256 of the canonical parameter string,
//! where parameters are sorted by level and rendered as `L{level}:{name}={value}`
//! joined with `>`. Derivation is a pure function of its inputs, so equal
//! inputs always give the same key in every process.
//!
//! Parameter index sets live next to the entries as
//! `{prefix}:{cache name}:#p:{pattern}`. Cache levels may not start with `#`,
//! so an index key never collides with an entry key.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CacheError, CacheResult};

/// Default namespace prefix for physical keys.
pub const DEFAULT_KEY_PREFIX: &str = "hcache";

const DIGEST_HEX_LEN: usize = 16;

/// A derived, immutable cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wrap a key read back from a parameter index.
    pub(crate) fn from_physical(key: &str) -> Self {
        Self(Arc::from(key))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A named value at a hierarchy level, used to scope cached results.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchParameter {
    pub name: String,
    pub value: String,
    pub level: i32,
}

impl SearchParameter {
    pub fn new(name: impl Into<String>, value: impl Into<String>, level: i32) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            level,
        }
    }

    /// Canonical rendering: `L{level}:{name}={value}`.
    pub fn to_key(&self) -> String {
        format!("L{}:{}={}", self.level, self.name, self.value)
    }
}

impl fmt::Display for SearchParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}:{}={}", self.level, self.name, self.value)
    }
}

impl PartialOrd for SearchParameter {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SearchParameter {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.level
            .cmp(&other.level)
            .then_with(|| self.name.cmp(&other.name))
            .then_with(|| self.value.cmp(&other.value))
    }
}

/// Canonical string for a parameter set, independent of input order.
pub fn canonical_parameters(parameters: &[SearchParameter]) -> String {
    let mut sorted: Vec<&SearchParameter> = parameters.iter().collect();
    sorted.sort();
    sorted
        .iter()
        .map(|p| p.to_key())
        .collect::<Vec<_>>()
        .join(">")
}

/// Every index pattern an entry tagged with `parameters` is reachable by.
///
/// Parameters are sorted by level, then each contiguous run is rendered like
/// [`canonical_parameters`]. For `[L1 a, L2 b, L3 c]` that gives `a`, `b`,
/// `c`, `a>b`, `b>c` and `a>b>c`.
pub fn hierarchical_patterns(parameters: &[SearchParameter]) -> Vec<String> {
    let mut sorted: Vec<&SearchParameter> = parameters.iter().collect();
    sorted.sort();
    let rendered: Vec<String> = sorted.iter().map(|p| p.to_key()).collect();

    let mut patterns = BTreeSet::new();
    for start in 0..rendered.len() {
        for end in start + 1..=rendered.len() {
            patterns.insert(rendered[start..end].join(">"));
        }
    }
    patterns.into_iter().collect()
}

/// Short SHA-256 digest of the canonical parameter string.
pub fn parameter_digest(parameters: &[SearchParameter]) -> String {
    let digest = Sha256::digest(canonical_parameters(parameters).as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(DIGEST_HEX_LEN);
    hex
}

/// Builds physical keys for one cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDeriver {
    prefix: String,
    cache_name: String,
    cache_level: String,
}

impl KeyDeriver {
    /// Segments must be non-empty and free of `:` and whitespace, otherwise
    /// prefix-scoped clears could reach into another cache.
    pub fn new(
        prefix: impl Into<String>,
        cache_name: impl Into<String>,
        cache_level: impl Into<String>,
    ) -> CacheResult<Self> {
        let deriver = Self {
            prefix: prefix.into(),
            cache_name: cache_name.into(),
            cache_level: cache_level.into(),
        };
        validate_segment("key prefix", &deriver.prefix)?;
        validate_segment("cache name", &deriver.cache_name)?;
        validate_segment("cache level", &deriver.cache_level)?;
        if deriver.cache_level.starts_with('#') {
            return Err(CacheError::configuration(format!(
                "cache level '{}' must not start with '#'",
                deriver.cache_level
            )));
        }
        Ok(deriver)
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    /// Prefix shared by every key of this cache, used for bulk clears.
    pub fn namespace_prefix(&self) -> String {
        format!("{}:{}:", self.prefix, self.cache_name)
    }

    /// L2 set holding the keys registered under `pattern`.
    pub fn parameter_index_key(&self, pattern: &str) -> String {
        format!("{}:{}:#p:{}", self.prefix, self.cache_name, pattern)
    }

    /// Derive a key without search parameters.
    pub fn derive(&self, logical: &str) -> CacheResult<CacheKey> {
        self.derive_with(logical, &[])
    }

    /// Derive a key scoped by search parameters.
    pub fn derive_with(
        &self,
        logical: &str,
        parameters: &[SearchParameter],
    ) -> CacheResult<CacheKey> {
        if logical.is_empty() {
            return Err(CacheError::invalid_key(format!(
                "empty logical key for cache '{}'",
                self.cache_name
            )));
        }
        if logical.chars().any(char::is_control) {
            return Err(CacheError::invalid_key(format!(
                "logical key for cache '{}' contains control characters",
                self.cache_name
            )));
        }

        let mut key = format!(
            "{}:{}:{}:{}",
            self.prefix, self.cache_name, self.cache_level, logical
        );
        if !parameters.is_empty() {
            key.push('#');
            key.push_str(&parameter_digest(parameters));
        }
        Ok(CacheKey(Arc::from(key)))
    }
}

pub(crate) fn validate_segment(what: &str, value: &str) -> CacheResult<()> {
    if value.is_empty() {
        return Err(CacheError::configuration(format!("{what} must not be empty")));
    }
    if value.contains(':') || value.chars().any(char::is_whitespace) {
        return Err(CacheError::configuration(format!(
            "{what} '{value}' must not contain ':' or whitespace"
        )));
    }
    Ok(())
}

/// Named, ordered arguments of a cached call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallArgs {
    args: Vec<(String, String)>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an argument rendered with `Display`.
    pub fn arg(mut self, name: impl Into<String>, value: impl fmt::Display) -> Self {
        self.args.push((name.into(), value.to_string()));
        self
    }

    /// Append an optional argument; `None` renders as `null`.
    pub fn opt_arg<T: fmt::Display>(self, name: impl Into<String>, value: Option<T>) -> Self {
        match value {
            Some(value) => self.arg(name, value),
            None => self.arg(name, "null"),
        }
    }

    pub fn by_name(&self, name: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn by_index(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(|(_, v)| v.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.args.iter().map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Named(String),
    Positional(usize),
}

/// Key expression with `{name}` and `{0}` placeholders.
///
/// `{{` and `}}` produce literal braces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl KeyTemplate {
    pub fn parse(source: &str) -> CacheResult<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        name.push(c);
                    }
                    if !closed {
                        return Err(CacheError::invalid_key(format!(
                            "unterminated placeholder in key expression '{source}'"
                        )));
                    }
                    let name = name.trim();
                    if name.is_empty() {
                        return Err(CacheError::invalid_key(format!(
                            "empty placeholder in key expression '{source}'"
                        )));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(match name.parse::<usize>() {
                        Ok(index) => Segment::Positional(index),
                        Err(_) => Segment::Named(name.trim_start_matches('#').to_string()),
                    });
                }
                '}' => {
                    return Err(CacheError::invalid_key(format!(
                        "unmatched '}}' in key expression '{source}'"
                    )));
                }
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Render against call arguments. A placeholder without a matching
    /// argument is a derivation error.
    pub fn render(&self, args: &CallArgs) -> CacheResult<String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Named(name) => out.push_str(args.by_name(name).ok_or_else(|| {
                    CacheError::invalid_key(format!(
                        "key expression '{}' references unknown argument '{name}'",
                        self.source
                    ))
                })?),
                Segment::Positional(index) => {
                    out.push_str(args.by_index(*index).ok_or_else(|| {
                        CacheError::invalid_key(format!(
                            "key expression '{}' references argument #{index}, call has {}",
                            self.source,
                            args.len()
                        ))
                    })?)
                }
            }
        }
        Ok(out)
    }
}

/// Key used when an operation has no expression: `operation(arg0,arg1,...)`.
pub fn default_logical_key(operation: &str, args: &CallArgs) -> String {
    let rendered = args.values().collect::<Vec<_>>().join(",");
    format!("{operation}({rendered})")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deriver() -> KeyDeriver {
        KeyDeriver::new(DEFAULT_KEY_PREFIX, "users", "default").unwrap()
    }

    #[test]
    fn test_derive_plain_key() {
        let key = deriver().derive("42").unwrap();
        assert_eq!(key.as_str(), "hcache:users:default:42");
        assert!(key.as_str().starts_with(&deriver().namespace_prefix()));
    }

    #[test]
    fn test_derivation_is_deterministic_and_order_independent() {
        let a = [
            SearchParameter::new("region", "eu", 2),
            SearchParameter::new("tenant", "acme", 1),
        ];
        let b = [
            SearchParameter::new("tenant", "acme", 1),
            SearchParameter::new("region", "eu", 2),
        ];
        let ka = deriver().derive_with("list", &a).unwrap();
        let kb = deriver().derive_with("list", &b).unwrap();
        assert_eq!(ka, kb);
        assert_eq!(canonical_parameters(&a), "L1:tenant=acme>L2:region=eu");

        let other = [SearchParameter::new("tenant", "other", 1)];
        assert_ne!(ka, deriver().derive_with("list", &other).unwrap());
    }

    #[test]
    fn test_hierarchical_patterns_cover_contiguous_runs() {
        let parameters = [
            SearchParameter::new("region", "eu", 2),
            SearchParameter::new("tenant", "acme", 1),
            SearchParameter::new("team", "core", 3),
        ];
        let patterns = hierarchical_patterns(&parameters);
        assert_eq!(patterns.len(), 6);
        assert!(patterns.contains(&"L1:tenant=acme".to_string()));
        assert!(patterns.contains(&"L2:region=eu>L3:team=core".to_string()));
        assert!(patterns.contains(&canonical_parameters(&parameters)));
        assert!(!patterns.contains(&"L1:tenant=acme>L3:team=core".to_string()));

        assert!(hierarchical_patterns(&[]).is_empty());
    }

    #[test]
    fn test_parameter_index_key_is_inside_namespace() {
        let deriver = deriver();
        let index = deriver.parameter_index_key("L1:tenant=acme");
        assert_eq!(index, "hcache:users:#p:L1:tenant=acme");
        assert!(index.starts_with(&deriver.namespace_prefix()));
    }

    #[test]
    fn test_cache_level_cannot_shadow_index_keys() {
        let err = KeyDeriver::new("hcache", "users", "#p").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_digest_is_short_hex() {
        let digest = parameter_digest(&[SearchParameter::new("a", "b", 0)]);
        assert_eq!(digest.len(), 16);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_empty_logical_key_rejected() {
        assert!(deriver().derive("").unwrap_err().is_invalid_key());
        assert!(deriver().derive("a\nb").unwrap_err().is_invalid_key());
    }

    #[test]
    fn test_cache_name_with_separator_rejected() {
        let err = KeyDeriver::new("hcache", "users:v2", "default").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_template_render() {
        let template = KeyTemplate::parse("user:{userId}:{1}:{{raw}}").unwrap();
        let args = CallArgs::new().arg("userId", 42).arg("lang", "en");
        assert_eq!(template.render(&args).unwrap(), "user:42:en:{raw}");
    }

    #[test]
    fn test_template_accepts_hash_prefixed_names() {
        let template = KeyTemplate::parse("{#department}").unwrap();
        let args = CallArgs::new().arg("department", "sales");
        assert_eq!(template.render(&args).unwrap(), "sales");
    }

    #[test]
    fn test_template_errors() {
        assert!(KeyTemplate::parse("user:{id").unwrap_err().is_invalid_key());
        assert!(KeyTemplate::parse("user:}").unwrap_err().is_invalid_key());
        assert!(KeyTemplate::parse("user:{}").unwrap_err().is_invalid_key());

        let template = KeyTemplate::parse("{missing}").unwrap();
        assert!(template.render(&CallArgs::new()).unwrap_err().is_invalid_key());
    }

    #[test]
    fn test_default_logical_key() {
        let args = CallArgs::new().arg("a", 1).opt_arg::<i32>("b", None);
        assert_eq!(default_logical_key("UserService.find", &args), "UserService.find(1,null)");
        assert_eq!(default_logical_key("all", &CallArgs::new()), "all()");
    }
}
