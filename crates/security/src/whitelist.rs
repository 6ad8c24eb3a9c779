//! Whitelist registry: the immutable set of permitted commands, path roots
//! and URL schemes.
//!
//! Built once at startup from [`WhitelistConfig`] and shared behind an `Arc`.
//! There are no mutating methods: a different ruleset means a new process.

use regex_lite::Regex;
use std::path::{Path, PathBuf};
use warden_config::{MAX_PATTERN_LEN, RiskLevel, WhitelistConfig, expand_path};

/// What a whitelist entry governs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Command,
    Path,
    UrlScheme,
}

/// How an entry's pattern is matched.
#[derive(Debug, Clone)]
pub enum Pattern {
    Exact(String),
    /// Anchored (`^(?:…)$`) regex.
    Regex(Regex),
}

impl Pattern {
    pub fn matches(&self, candidate: &str) -> bool {
        match self {
            Self::Exact(s) => s == candidate,
            Self::Regex(re) => re.is_match(candidate),
        }
    }
}

/// A single whitelist entry.
#[derive(Debug, Clone)]
pub struct WhitelistEntry {
    pattern: Pattern,
    kind: EntryKind,
    risk_level: RiskLevel,
    pipeline_safe: bool,
}

impl WhitelistEntry {
    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn risk_level(&self) -> RiskLevel {
        self.risk_level
    }

    pub fn pipeline_safe(&self) -> bool {
        self.pipeline_safe
    }

    pub fn matches(&self, candidate: &str) -> bool {
        self.pattern.matches(candidate)
    }
}

/// Error building the registry from configuration.
#[derive(Debug, thiserror::Error)]
pub enum WhitelistError {
    #[error("Whitelist command entry #{index} has an invalid pattern: {reason}")]
    InvalidPattern { index: usize, reason: String },
}

/// Immutable registry of whitelist entries.
#[derive(Debug, Clone)]
pub struct WhitelistRegistry {
    entries: Vec<WhitelistEntry>,
}

impl WhitelistRegistry {
    /// Build the registry from configuration. Regex patterns are anchored and
    /// compiled here so a bad pattern fails startup rather than a request.
    pub fn from_config(config: &WhitelistConfig) -> Result<Self, WhitelistError> {
        let mut entries = Vec::new();

        for (index, cmd) in config.commands.iter().enumerate() {
            if cmd.pattern.is_empty() || cmd.pattern.len() > MAX_PATTERN_LEN {
                return Err(WhitelistError::InvalidPattern {
                    index,
                    reason: format!("length must be 1..={MAX_PATTERN_LEN}"),
                });
            }
            let pattern = if cmd.regex {
                let anchored = format!("^(?:{})$", cmd.pattern);
                let re = Regex::new(&anchored).map_err(|e| WhitelistError::InvalidPattern {
                    index,
                    reason: e.to_string(),
                })?;
                Pattern::Regex(re)
            } else {
                Pattern::Exact(cmd.pattern.clone())
            };
            entries.push(WhitelistEntry {
                pattern,
                kind: EntryKind::Command,
                risk_level: cmd.risk_level,
                pipeline_safe: cmd.pipeline_safe,
            });
        }

        for root in &config.path_roots {
            entries.push(WhitelistEntry {
                pattern: Pattern::Exact(expand_path(root).to_string_lossy().into_owned()),
                kind: EntryKind::Path,
                risk_level: RiskLevel::Low,
                pipeline_safe: false,
            });
        }

        for scheme in &config.url_schemes {
            entries.push(WhitelistEntry {
                pattern: Pattern::Exact(scheme.to_ascii_lowercase()),
                kind: EntryKind::UrlScheme,
                risk_level: RiskLevel::Low,
                pipeline_safe: false,
            });
        }

        tracing::debug!(entries = entries.len(), "Whitelist registry built");
        Ok(Self { entries })
    }

    /// Find the command entry for an executable name. Exact entries win over
    /// regex entries.
    pub fn lookup_command(&self, name: &str) -> Option<&WhitelistEntry> {
        if name.is_empty() {
            return None;
        }
        let commands = || self.entries.iter().filter(|e| e.kind == EntryKind::Command);
        commands()
            .find(|e| matches!(e.pattern, Pattern::Exact(_)) && e.matches(name))
            .or_else(|| commands().find(|e| e.matches(name)))
    }

    /// Whether `base_dir` (already canonical) lies within a whitelisted root.
    ///
    /// Roots are canonicalized at check time; roots that do not exist never match.
    pub fn allows_base_dir(&self, base_dir: &Path) -> bool {
        self.path_roots().any(|root| {
            root.canonicalize()
                .map(|canonical| base_dir.starts_with(canonical))
                .unwrap_or(false)
        })
    }

    /// Configured path roots (tilde-expanded, not canonicalized).
    pub fn path_roots(&self) -> impl Iterator<Item = PathBuf> + '_ {
        self.entries.iter().filter_map(|e| match (&e.kind, &e.pattern) {
            (EntryKind::Path, Pattern::Exact(root)) => Some(PathBuf::from(root)),
            _ => None,
        })
    }

    /// Allowed URL schemes, lowercase.
    pub fn url_schemes(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter_map(|e| match (&e.kind, &e.pattern) {
                (EntryKind::UrlScheme, Pattern::Exact(s)) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of entries of a kind.
    pub fn count(&self, kind: EntryKind) -> usize {
        self.entries.iter().filter(|e| e.kind == kind).count()
    }
}
