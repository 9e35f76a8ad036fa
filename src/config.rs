//! Connection configuration.
//!
//! A [`SqliteConfig`] is validated once and consumed when a connection opens.
//! Nothing in it is re-read after open.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::global;

bitflags::bitflags! {
    /// Flags controlling how the database file is opened.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct OpenFlags: u32 {
        /// Open for reading and writing. Always implied.
        const OPEN_READWRITE = 0x0000_0000;
        /// Skip registration of the `LOCALIZED` collation.
        const NO_LOCALIZED_COLLATORS = 0x0000_0010;
        /// Create the file if it does not exist.
        const CREATE_IF_NECESSARY = 0x1000_0000;
        /// Required: connections only run in write-ahead-logging mode.
        const ENABLE_WRITE_AHEAD_LOGGING = 0x2000_0000;
    }
}

impl Default for OpenFlags {
    fn default() -> Self {
        OpenFlags::CREATE_IF_NECESSARY | OpenFlags::ENABLE_WRITE_AHEAD_LOGGING
    }
}

/// Value of the `synchronous` pragma.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SyncMode {
    Off,
    Normal,
    #[default]
    Full,
    Extra,
}

impl SyncMode {
    pub fn pragma_value(self) -> &'static str {
        match self {
            SyncMode::Off => "OFF",
            SyncMode::Normal => "NORMAL",
            SyncMode::Full => "FULL",
            SyncMode::Extra => "EXTRA",
        }
    }

    /// Maps the engine's numeric answer (`0`..`3`) onto the symbolic name.
    /// Anything else is upper-cased and returned as is.
    pub fn canonicalize(value: &str) -> String {
        match value.trim() {
            "0" => "OFF".to_string(),
            "1" => "NORMAL".to_string(),
            "2" => "FULL".to_string(),
            "3" => "EXTRA".to_string(),
            other => other.to_ascii_uppercase(),
        }
    }
}

fn default_open_flags() -> OpenFlags {
    OpenFlags::default()
}

fn default_max_sql_cache_size() -> usize {
    global::DEFAULT_MAX_SQL_CACHE_SIZE
}

fn default_locale() -> String {
    global::DEFAULT_LOCALE.to_string()
}

fn default_cursor_window_size() -> usize {
    global::CURSOR_WINDOW_SIZE
}

/// Configuration for one SQLite connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqliteConfig {
    /// Owning application; also names the shared operation log.
    pub app_name: String,
    /// Path of the database file.
    pub db_path: String,
    /// Label used in logs. Derived from `db_path` when absent.
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default = "default_open_flags")]
    pub open_flags: OpenFlags,
    /// Prepared statements kept per connection. `0` disables caching.
    #[serde(default = "default_max_sql_cache_size")]
    pub max_sql_cache_size: usize,
    #[serde(default = "default_locale")]
    pub locale: String,
    #[serde(default)]
    pub foreign_key_constraints_enabled: bool,
    #[serde(default)]
    pub sync_mode: SyncMode,
    /// Byte budget of cursor windows created by `Connection::query`.
    #[serde(default = "default_cursor_window_size")]
    pub cursor_window_size: usize,
}

impl SqliteConfig {
    pub fn new(app_name: impl Into<String>, db_path: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            db_path: db_path.into(),
            label: None,
            open_flags: default_open_flags(),
            max_sql_cache_size: default_max_sql_cache_size(),
            locale: default_locale(),
            foreign_key_constraints_enabled: false,
            sync_mode: global::DEFAULT_SYNC_MODE,
            cursor_window_size: default_cursor_window_size(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_open_flags(mut self, open_flags: OpenFlags) -> Self {
        self.open_flags = open_flags;
        self
    }

    pub fn with_max_sql_cache_size(mut self, size: usize) -> Self {
        self.max_sql_cache_size = size;
        self
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    pub fn with_foreign_key_constraints(mut self, enabled: bool) -> Self {
        self.foreign_key_constraints_enabled = enabled;
        self
    }

    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    pub fn with_cursor_window_size(mut self, bytes: usize) -> Self {
        self.cursor_window_size = bytes;
        self
    }

    /// Label for log lines, never exposing account names embedded in the path.
    pub fn label(&self) -> String {
        match &self.label {
            Some(label) => label.clone(),
            None => strip_path_for_logs(&self.db_path),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.app_name.trim().is_empty() {
            return Err(Error::InvalidConfig("app_name must not be empty".into()));
        }
        if self.db_path.trim().is_empty() {
            return Err(Error::InvalidConfig("db_path must not be empty".into()));
        }
        if self.max_sql_cache_size > global::MAX_SQL_CACHE_SIZE {
            return Err(Error::InvalidConfig(format!(
                "max_sql_cache_size is {}, it must be between 0 and {}",
                self.max_sql_cache_size,
                global::MAX_SQL_CACHE_SIZE
            )));
        }
        if self.cursor_window_size == 0 {
            return Err(Error::InvalidConfig(
                "cursor_window_size must be positive".into(),
            ));
        }
        if !self
            .open_flags
            .contains(OpenFlags::ENABLE_WRITE_AHEAD_LOGGING)
        {
            return Err(Error::misuse("Only WAL mode is allowed"));
        }
        Ok(())
    }
}

/// Masks e-mail-like fragments (`user@host`) of a path as `XX@YY`.
pub fn strip_path_for_logs(path: &str) -> String {
    static EMAIL_IN_PATH: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = EMAIL_IN_PATH.get_or_init(|| Regex::new(r"[\w.\-]+@[\w.\-]+").ok());
    match pattern {
        Some(re) if path.contains('@') => re.replace_all(path, "XX@YY").into_owned(),
        _ => path.to_string(),
    }
}
