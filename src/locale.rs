//! Language preference — the dashboard's `en`/`tr` switch.
//!
//! DESIGN
//! ======
//! The preference lives outside the session core in a small JSON file holding
//! a single fixed key, the same key the browser build kept in local storage.
//! Unknown or unreadable values fall back to English rather than failing, so a
//! corrupted preference never blocks startup.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Key under which the preference is stored.
pub const LOCALE_KEY: &str = "i18nextLng";

// =============================================================================
// LOCALE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    #[default]
    En,
    Tr,
}

impl Locale {
    pub const ALL: [Self; 2] = [Self::En, Self::Tr];

    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::En => "en",
            Self::Tr => "tr",
        }
    }

    /// Parse a stored code, falling back to the default for anything unknown.
    #[must_use]
    pub fn from_code_or_default(code: &str) -> Self {
        code.parse().unwrap_or_default()
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported language: {0}")]
pub struct UnknownLocale(pub String);

impl FromStr for Locale {
    type Err = UnknownLocale;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Region-qualified codes such as `en-US` select the base language.
        let base = s.trim().split(['-', '_']).next().unwrap_or_default().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|l| l.code() == base)
            .ok_or_else(|| UnknownLocale(s.to_owned()))
    }
}

// =============================================================================
// STORE
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum LocaleError {
    #[error("locale store io error at {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("locale store encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// File-backed holder of the persisted language preference.
#[derive(Debug, Clone)]
pub struct LocaleStore {
    path: PathBuf,
}

impl LocaleStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current preference. Missing, unreadable, or unknown values yield `en`.
    #[must_use]
    pub fn load(&self) -> Locale {
        let Ok(raw) = std::fs::read_to_string(&self.path) else {
            return Locale::default();
        };
        match serde_json::from_str::<BTreeMap<String, String>>(&raw) {
            Ok(entries) => entries
                .get(LOCALE_KEY)
                .map(|code| Locale::from_code_or_default(code))
                .unwrap_or_default(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "ignoring malformed locale store");
                Locale::default()
            }
        }
    }

    /// Persist `locale`, keeping any unrelated keys already in the file.
    ///
    /// # Errors
    ///
    /// Returns [`LocaleError::Io`] if the file cannot be written.
    pub fn save(&self, locale: Locale) -> Result<(), LocaleError> {
        let mut entries: BTreeMap<String, String> = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        entries.insert(LOCALE_KEY.to_owned(), locale.code().to_owned());

        let body = serde_json::to_string_pretty(&entries)?;
        std::fs::write(&self.path, body).map_err(|source| LocaleError::Io { path: self.path.clone(), source })?;
        tracing::debug!(locale = %locale, path = %self.path.display(), "saved language preference");
        Ok(())
    }
}

#[cfg(test)]
#[path = "locale_test.rs"]
mod tests;
