#![forbid(unsafe_code)]

//! File-format plugins: turn raw bytes into entity changes and back.

use crate::change::DetectedChange;
use crate::schema::SchemaDefinition;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileDescriptor {
    pub id: String,
    pub path: String,
    pub data: Vec<u8>,
    pub metadata: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PluginError {
    pub message: String,
}

impl PluginError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for PluginError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for PluginError {}

pub trait Plugin: Send + Sync {
    fn key(&self) -> &str;

    /// Path glob this plugin is responsible for, e.g. `**/*.json`.
    fn glob(&self) -> &str;

    /// Schemas of the entities this plugin emits. Registered with the store alongside the plugin.
    fn schemas(&self) -> Vec<SchemaDefinition> {
        Vec::new()
    }

    /// Entity-level differences between two revisions of a file. `before` is `None` for a new
    /// file.
    fn detect_changes(
        &self,
        before: Option<&[u8]>,
        after: &[u8],
    ) -> Result<Vec<DetectedChange>, PluginError>;

    /// Renders file bytes from the current entity values.
    fn apply_changes(
        &self,
        file: &FileDescriptor,
        changes: &[DetectedChange],
    ) -> Result<Vec<u8>, PluginError>;
}

#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.plugins.iter().map(|plugin| (plugin.key(), plugin.glob())))
            .finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), PluginError> {
        if self.by_key(plugin.key()).is_some() {
            return Err(PluginError::new(format!(
                "plugin {} is already registered",
                plugin.key()
            )));
        }
        self.plugins.push(plugin);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn by_key(&self, key: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins
            .iter()
            .find(|plugin| plugin.key() == key)
            .cloned()
    }

    /// First registered plugin whose glob matches `path`.
    pub fn resolve(&self, path: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins
            .iter()
            .find(|plugin| glob_match(plugin.glob(), path))
            .cloned()
    }
}

/// Matches `path` against a glob supporting `*` (within one segment), `**` (any number of
/// segments), `?` and `{a,b}` alternatives. Leading slashes are ignored on both sides.
pub fn glob_match(pattern: &str, path: &str) -> bool {
    let path = path.trim_start_matches('/').chars().collect::<Vec<_>>();
    expand_braces(pattern.trim_start_matches('/'))
        .iter()
        .any(|candidate| {
            let pattern = candidate.chars().collect::<Vec<_>>();
            match_from(&pattern, &path)
        })
}

fn expand_braces(pattern: &str) -> Vec<String> {
    let Some(open) = pattern.find('{') else {
        return vec![pattern.to_string()];
    };
    let Some(close) = pattern[open..].find('}').map(|offset| open + offset) else {
        return vec![pattern.to_string()];
    };
    let head = &pattern[..open];
    let tail = &pattern[close + 1..];
    pattern[open + 1..close]
        .split(',')
        .flat_map(|alternative| expand_braces(&format!("{head}{alternative}{tail}")))
        .collect()
}

fn match_from(pattern: &[char], path: &[char]) -> bool {
    match pattern {
        [] => path.is_empty(),
        ['*', '*', rest @ ..] => {
            if let ['/', after_slash @ ..] = rest {
                if match_from(after_slash, path) {
                    return true;
                }
            }
            (0..=path.len()).any(|skip| match_from(rest, &path[skip..]))
        }
        ['*', rest @ ..] => {
            for skip in 0..=path.len() {
                if skip > 0 && path[skip - 1] == '/' {
                    break;
                }
                if match_from(rest, &path[skip..]) {
                    return true;
                }
            }
            false
        }
        ['?', rest @ ..] => match path {
            [first, remaining @ ..] if *first != '/' => match_from(rest, remaining),
            _ => false,
        },
        [literal, rest @ ..] => match path {
            [first, remaining @ ..] if first == literal => match_from(rest, remaining),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, &'static str);

    impl Plugin for Named {
        fn key(&self) -> &str {
            self.0
        }

        fn glob(&self) -> &str {
            self.1
        }

        fn detect_changes(
            &self,
            _before: Option<&[u8]>,
            _after: &[u8],
        ) -> Result<Vec<DetectedChange>, PluginError> {
            Ok(Vec::new())
        }

        fn apply_changes(
            &self,
            _file: &FileDescriptor,
            _changes: &[DetectedChange],
        ) -> Result<Vec<u8>, PluginError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn glob_features() {
        assert!(glob_match("*.json", "/a.json"));
        assert!(!glob_match("*.json", "/dir/a.json"));
        assert!(glob_match("**/*.json", "/a.json"));
        assert!(glob_match("**/*.json", "/dir/sub/a.json"));
        assert!(glob_match("/docs/?.md", "/docs/a.md"));
        assert!(!glob_match("/docs/?.md", "/docs/ab.md"));
        assert!(glob_match("**/*.{csv,tsv}", "/data/x.tsv"));
        assert!(!glob_match("**/*.{csv,tsv}", "/data/x.json"));
    }

    #[test]
    fn registry_resolves_first_match_and_rejects_duplicates() {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(Named("json", "**/*.json"))).unwrap();
        registry.register(Arc::new(Named("any", "**"))).unwrap();
        assert!(registry.register(Arc::new(Named("json", "*.txt"))).is_err());

        assert_eq!(registry.resolve("/a/b.json").map(|p| p.key().to_string()).as_deref(), Some("json"));
        assert_eq!(registry.resolve("/a/b.md").map(|p| p.key().to_string()).as_deref(), Some("any"));
        assert_eq!(registry.len(), 2);
    }
}
