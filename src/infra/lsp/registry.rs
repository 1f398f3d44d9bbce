//! Backend Registry
//!
//! Data-driven extension → backend table. The built-in rows can be
//! extended or overridden from the config file without code changes.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::LspError;
use crate::models::config::BackendEntry;

/// Launch configuration for one backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Program followed by its arguments
    pub command: Vec<String>,
    /// Extensions served by this backend (lowercase, with leading dot)
    pub extensions: Vec<String>,
    /// LSP language identifier sent in didOpen
    pub language_id: String,
}

impl BackendConfig {
    pub fn new(command: &[&str], extensions: &[&str], language_id: &str) -> Self {
        Self {
            command: command.iter().map(|s| s.to_string()).collect(),
            extensions: extensions.iter().map(|e| normalize_extension(e)).collect(),
            language_id: language_id.to_string(),
        }
    }

    pub fn program(&self) -> Option<&str> {
        self.command.first().map(String::as_str)
    }

    pub fn args(&self) -> &[String] {
        self.command.get(1..).unwrap_or_default()
    }

    /// Key under which the running process is shared
    pub fn key(&self) -> BackendKey {
        BackendKey(self.command.clone())
    }

    pub fn display_command(&self) -> String {
        self.command.join(" ")
    }
}

/// Identity of a backend process: its full command line
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendKey(Vec<String>);

impl std::fmt::Display for BackendKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

#[derive(Debug, Clone)]
pub struct BackendRegistry {
    by_extension: HashMap<String, BackendConfig>,
}

impl BackendRegistry {
    pub fn empty() -> Self {
        Self {
            by_extension: HashMap::new(),
        }
    }

    /// Built-in table
    pub fn defaults() -> Self {
        let ts = ["typescript-language-server", "--stdio"];
        let mut registry = Self::empty();

        // TypeScript / JavaScript share one server, only the language id varies
        registry.insert(".ts", BackendConfig::new(&ts, &[".ts", ".tsx"], "typescript"));
        registry.insert(
            ".tsx",
            BackendConfig::new(&ts, &[".ts", ".tsx"], "typescriptreact"),
        );
        registry.insert(".js", BackendConfig::new(&ts, &[".js", ".jsx"], "javascript"));
        registry.insert(
            ".jsx",
            BackendConfig::new(&ts, &[".js", ".jsx"], "javascriptreact"),
        );

        registry.insert(".py", BackendConfig::new(&["pylsp"], &[".py"], "python"));
        registry.insert(".zig", BackendConfig::new(&["zls"], &[".zig"], "zig"));

        registry
    }

    /// Built-in table overlaid with config entries
    pub fn with_entries(entries: &[BackendEntry]) -> Result<Self, LspError> {
        let mut registry = Self::defaults();
        for entry in entries {
            registry.apply(entry)?;
        }
        Ok(registry)
    }

    pub fn apply(&mut self, entry: &BackendEntry) -> Result<(), LspError> {
        if entry.command.is_empty() {
            return Err(LspError::Protocol(format!(
                "Backend for '{}' has an empty command",
                entry.extension
            )));
        }

        let extensions = if entry.extensions.is_empty() {
            vec![normalize_extension(&entry.extension)]
        } else {
            entry.extensions.iter().map(|e| normalize_extension(e)).collect()
        };

        self.insert(
            &entry.extension,
            BackendConfig {
                command: entry.command.clone(),
                extensions,
                language_id: entry.language_id.clone(),
            },
        );
        Ok(())
    }

    pub fn insert(&mut self, extension: &str, config: BackendConfig) {
        self.by_extension
            .insert(normalize_extension(extension), config);
    }

    /// Look up by extension, case-insensitively, leading dot included
    pub fn lookup(&self, extension: &str) -> Result<&BackendConfig, LspError> {
        self.by_extension
            .get(&extension.to_lowercase())
            .ok_or_else(|| LspError::UnsupportedExtension(extension.to_string()))
    }

    pub fn lookup_path(&self, path: &Path) -> Result<&BackendConfig, LspError> {
        let extension = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        self.lookup(&extension)
    }

    /// Supported extensions, sorted
    pub fn extensions(&self) -> Vec<&str> {
        let mut exts: Vec<&str> = self.by_extension.keys().map(String::as_str).collect();
        exts.sort_unstable();
        exts
    }

    /// Distinct backend commands, sorted
    pub fn backends(&self) -> Vec<BackendKey> {
        let mut keys: Vec<BackendKey> = self.by_extension.values().map(|c| c.key()).collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::defaults()
    }
}

fn normalize_extension(ext: &str) -> String {
    let lower = ext.trim().to_lowercase();
    if lower.starts_with('.') {
        lower
    } else {
        format!(".{lower}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_lookup_is_case_insensitive() {
        let registry = BackendRegistry::defaults();
        let config = registry.lookup(".PY").unwrap();
        assert_eq!(config.command, vec!["pylsp"]);
        assert_eq!(config.language_id, "python");
    }

    #[test]
    fn test_lookup_requires_leading_dot() {
        let registry = BackendRegistry::defaults();
        assert!(matches!(
            registry.lookup("py"),
            Err(LspError::UnsupportedExtension(e)) if e == "py"
        ));
    }

    #[test]
    fn test_shared_command_different_language_ids() {
        let registry = BackendRegistry::defaults();
        let ts = registry.lookup(".ts").unwrap();
        let tsx = registry.lookup(".tsx").unwrap();
        let jsx = registry.lookup(".jsx").unwrap();
        assert_eq!(ts.key(), tsx.key());
        assert_eq!(ts.key(), jsx.key());
        assert_eq!(tsx.language_id, "typescriptreact");
        assert_eq!(jsx.language_id, "javascriptreact");
        assert_eq!(ts.args(), &["--stdio".to_string()]);
    }

    #[test]
    fn test_lookup_path() {
        let registry = BackendRegistry::defaults();
        let config = registry
            .lookup_path(&PathBuf::from("/repo/build.ZIG"))
            .unwrap();
        assert_eq!(config.language_id, "zig");

        assert!(matches!(
            registry.lookup_path(&PathBuf::from("/repo/Makefile")),
            Err(LspError::UnsupportedExtension(e)) if e.is_empty()
        ));
        assert!(registry.lookup_path(&PathBuf::from("/repo/a.rb")).is_err());
    }

    #[test]
    fn test_config_entries_extend_and_override() {
        let entries = vec![
            BackendEntry {
                extension: "RS".to_string(),
                command: vec!["rust-analyzer".to_string()],
                extensions: vec![],
                language_id: "rust".to_string(),
            },
            BackendEntry {
                extension: ".py".to_string(),
                command: vec!["pyright-langserver".to_string(), "--stdio".to_string()],
                extensions: vec![".py".to_string(), ".pyi".to_string()],
                language_id: "python".to_string(),
            },
        ];
        let registry = BackendRegistry::with_entries(&entries).unwrap();

        let rust = registry.lookup(".rs").unwrap();
        assert_eq!(rust.extensions, vec![".rs"]);
        assert_eq!(
            registry.lookup(".py").unwrap().program(),
            Some("pyright-langserver")
        );
        assert!(registry.extensions().contains(&".rs"));
    }

    #[test]
    fn test_empty_command_is_rejected() {
        let entry = BackendEntry {
            extension: ".rb".to_string(),
            command: vec![],
            extensions: vec![],
            language_id: "ruby".to_string(),
        };
        assert!(BackendRegistry::with_entries(&[entry]).is_err());
    }

    #[test]
    fn test_lookup_does_not_depend_on_installed_programs() {
        let entry = BackendEntry {
            extension: ".zz".to_string(),
            command: vec!["langcheck-absent-server-91c2".to_string()],
            extensions: vec![],
            language_id: "zz".to_string(),
        };
        let registry = BackendRegistry::with_entries(&[entry]).unwrap();
        let config = registry.lookup(".zz").unwrap();
        assert_eq!(config.program(), Some("langcheck-absent-server-91c2"));
    }

    #[test]
    fn test_distinct_backends() {
        let registry = BackendRegistry::defaults();
        assert_eq!(registry.backends().len(), 3);
        assert_eq!(registry.extensions().len(), 6);
    }
}
