//! Input validation for commands, paths, URLs and secret key names.
//!
//! Every check here is pure with respect to the inputs plus the filesystem
//! state it inspects. Nothing is executed and nothing is logged; the gateway
//! records each verdict in the audit log.

use percent_encoding::percent_decode_str;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use url::{Host, Url};
use warden_core::command::{contains_operator, contains_substitution, split_pipeline, split_words};
use warden_core::{
    CommandPlan, ErrorKind, GatewayError, OperationKind, SplitError, ValidationRequest,
    ValidationResult,
};

use crate::whitelist::WhitelistRegistry;

/// Rounds of percent-decoding applied when looking for encoded traversal.
const MAX_DECODE_ROUNDS: usize = 3;

/// Longest accepted secret key name.
pub const MAX_SECRET_KEY_LEN: usize = 128;

/// Validates raw caller input against the whitelist registry.
#[derive(Debug, Clone)]
pub struct Validator {
    registry: Arc<WhitelistRegistry>,
    block_private_hosts: bool,
}

impl Validator {
    pub fn new(registry: Arc<WhitelistRegistry>, block_private_hosts: bool) -> Self {
        Self {
            registry,
            block_private_hosts,
        }
    }

    pub fn registry(&self) -> &WhitelistRegistry {
        &self.registry
    }

    /// Dispatch on the request kind.
    pub fn validate(&self, request: &ValidationRequest) -> ValidationResult {
        match request.kind {
            OperationKind::Command => self.validate_command(&request.raw),
            OperationKind::Path => match &request.base_dir {
                Some(base_dir) => match self.validate_base_dir(base_dir).into_result() {
                    Ok(base) => validate_path(&request.raw, Path::new(&base)),
                    Err(e) => ValidationResult::rejected(e.kind, e.reason),
                },
                None => ValidationResult::rejected(
                    ErrorKind::MalformedInput,
                    "path request has no base directory",
                ),
            },
            OperationKind::Url => self.validate_url(&request.raw),
            OperationKind::Secret => validate_secret_key(&request.raw),
        }
    }

    /// Validate a command line.
    ///
    /// Substitution sequences and line breaks are always rejected. Other
    /// operator characters are rejected unless the leading command is
    /// pipeline-safe; even then only `|`, `||`, `&&` and `;` are tolerated and
    /// every segment must start with a whitelisted command.
    pub fn validate_command(&self, raw: &str) -> ValidationResult {
        let line = raw.trim();
        if line.is_empty() {
            return ValidationResult::rejected(ErrorKind::MalformedInput, "command is empty");
        }
        if line.contains('\0') {
            return ValidationResult::rejected(
                ErrorKind::MalformedInput,
                "command contains a NUL byte",
            );
        }
        if contains_substitution(raw) {
            return ValidationResult::rejected(
                ErrorKind::DangerousCharacter,
                "command substitution and line breaks are not permitted",
            );
        }

        if contains_operator(line) {
            let segments = match split_pipeline(line) {
                Ok(segments) => segments,
                Err(SplitError::UnsupportedOperator(_)) => {
                    return ValidationResult::rejected(
                        ErrorKind::DangerousCharacter,
                        "redirection, background jobs and subshells are not permitted",
                    );
                }
                Err(e) => {
                    return ValidationResult::rejected(
                        ErrorKind::MalformedInput,
                        format!("command has an {e}"),
                    );
                }
            };
            // Segments come back non-empty, so every one has a program word.
            let pipeline_safe = self
                .registry
                .lookup_command(&segments[0][0])
                .is_some_and(|entry| entry.pipeline_safe());
            if !pipeline_safe {
                return ValidationResult::rejected(
                    ErrorKind::DangerousCharacter,
                    "shell operators are not permitted for this command",
                );
            }
            for segment in &segments {
                if let Err(rejection) = self.check_program(&segment[0]) {
                    return rejection;
                }
            }
            return ValidationResult::allowed(line);
        }

        let words = match split_words(line) {
            Ok(words) => words,
            Err(e) => {
                return ValidationResult::rejected(
                    ErrorKind::MalformedInput,
                    format!("command has an {e}"),
                );
            }
        };
        let Some(program) = words.first() else {
            return ValidationResult::rejected(ErrorKind::MalformedInput, "command is empty");
        };
        match self.check_program(program) {
            Ok(()) => ValidationResult::allowed(line),
            Err(rejection) => rejection,
        }
    }

    /// The program word must be whitelisted. The reason never repeats it.
    fn check_program(&self, program: &str) -> Result<(), ValidationResult> {
        if self.registry.lookup_command(program).is_none() {
            return Err(ValidationResult::rejected(
                ErrorKind::DisallowedCommand,
                "command is not whitelisted",
            ));
        }
        Ok(())
    }

    /// Turn a sanitized command line into an execution plan. Lines carrying
    /// pipeline operators run under `sh -c`; everything else runs directly.
    pub fn command_plan(&self, sanitized: &str) -> Result<CommandPlan, GatewayError> {
        if contains_operator(sanitized) {
            return Ok(CommandPlan::Shell {
                line: sanitized.to_string(),
            });
        }
        let mut words = split_words(sanitized)
            .map_err(|e| GatewayError::new(ErrorKind::MalformedInput, e.to_string()))?
            .into_iter();
        let program = words
            .next()
            .ok_or_else(|| GatewayError::new(ErrorKind::MalformedInput, "command is empty"))?;
        Ok(CommandPlan::Direct {
            program,
            args: words.collect(),
        })
    }

    /// Resolve a caller-supplied base directory and require it to sit inside
    /// a whitelisted path root. The sanitized value is the canonical path.
    pub fn validate_base_dir(&self, base_dir: &Path) -> ValidationResult {
        let as_str = base_dir.to_string_lossy();
        if as_str.trim().is_empty() || as_str.contains('\0') {
            return ValidationResult::rejected(
                ErrorKind::MalformedInput,
                "base directory is empty or malformed",
            );
        }
        let Ok(canonical) = base_dir.canonicalize() else {
            return ValidationResult::rejected(
                ErrorKind::MalformedInput,
                "base directory cannot be resolved",
            );
        };
        if !canonical.is_dir() {
            return ValidationResult::rejected(
                ErrorKind::MalformedInput,
                "base directory is not a directory",
            );
        }
        if !self.registry.allows_base_dir(&canonical) {
            return ValidationResult::rejected(
                ErrorKind::PathTraversal,
                "base directory is outside the permitted roots",
            );
        }
        match canonical.to_str() {
            Some(s) => ValidationResult::allowed(s),
            None => ValidationResult::rejected(
                ErrorKind::MalformedInput,
                "base directory is not valid UTF-8",
            ),
        }
    }

    /// Validate a URL against the registry's schemes and, when enabled, the
    /// private-host block.
    pub fn validate_url(&self, raw: &str) -> ValidationResult {
        check_url(raw, &self.registry.url_schemes(), self.block_private_hosts)
    }
}

/// Validate `raw` as a path under `base_dir`.
///
/// The longest existing prefix is canonicalized (resolving symlinks) and the
/// remainder normalized lexically; the result must stay inside the canonical
/// base. Percent-encoded forms are decoded and must stay inside as well.
pub fn validate_path(raw: &str, base_dir: &Path) -> ValidationResult {
    if raw.trim().is_empty() {
        return ValidationResult::rejected(ErrorKind::MalformedInput, "path is empty");
    }
    if raw.contains('\0') {
        return ValidationResult::rejected(ErrorKind::MalformedInput, "path contains a NUL byte");
    }
    let Ok(base) = base_dir.canonicalize() else {
        return ValidationResult::rejected(
            ErrorKind::MalformedInput,
            "base directory cannot be resolved",
        );
    };

    let decoded = percent_decode_rounds(raw);
    if decoded.contains('\0') {
        return ValidationResult::rejected(ErrorKind::MalformedInput, "path contains a NUL byte");
    }
    if decoded != raw {
        match resolve_under(&base, &decoded) {
            Ok(p) if p.starts_with(&base) => {}
            Ok(_) => {
                return ValidationResult::rejected(
                    ErrorKind::PathTraversal,
                    "encoded path escapes the base directory",
                );
            }
            Err(ResolveError::DanglingLink) => {
                return ValidationResult::rejected(
                    ErrorKind::PathTraversal,
                    "encoded path passes through an unresolvable link",
                );
            }
            Err(ResolveError::Io) => {}
        }
    }

    match resolve_under(&base, raw) {
        Ok(resolved) if resolved.starts_with(&base) => match resolved.to_str() {
            Some(s) => ValidationResult::allowed(s),
            None => ValidationResult::rejected(ErrorKind::MalformedInput, "path is not valid UTF-8"),
        },
        Ok(_) => {
            ValidationResult::rejected(ErrorKind::PathTraversal, "path escapes the base directory")
        }
        Err(ResolveError::DanglingLink) => ValidationResult::rejected(
            ErrorKind::PathTraversal,
            "path passes through an unresolvable link",
        ),
        Err(ResolveError::Io) => {
            ValidationResult::rejected(ErrorKind::MalformedInput, "path cannot be resolved")
        }
    }
}

#[derive(Debug)]
enum ResolveError {
    /// An existing link whose target cannot be resolved.
    DanglingLink,
    Io,
}

/// Resolve `raw` joined onto `base` (an absolute `raw` replaces `base`).
fn resolve_under(base: &Path, raw: &str) -> Result<PathBuf, ResolveError> {
    resolve(&base.join(raw))
}

fn resolve(path: &Path) -> Result<PathBuf, ResolveError> {
    let components: Vec<Component<'_>> = path.components().collect();

    // Longest prefix that exists on disk (lstat, so links count as present).
    let mut split = components.len();
    while split > 0 {
        let prefix: PathBuf = components[..split].iter().collect();
        if std::fs::symlink_metadata(&prefix).is_ok() {
            break;
        }
        split -= 1;
    }

    let prefix: PathBuf = components[..split].iter().collect();
    let mut resolved = match prefix.canonicalize() {
        Ok(p) => p,
        Err(_) => {
            let is_link = std::fs::symlink_metadata(&prefix)
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false);
            return Err(if is_link {
                ResolveError::DanglingLink
            } else {
                ResolveError::Io
            });
        }
    };

    // The prefix is canonical, so popping it lexically is exact. Components
    // pushed after a `..` may name existing links, so a climb forces a second
    // pass over the normalized path (which has no `..` left).
    let mut climbed = false;
    for component in &components[split..] {
        match component {
            Component::Normal(name) => resolved.push(name),
            Component::ParentDir => {
                resolved.pop();
                climbed = true;
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    if climbed {
        return resolve(&resolved);
    }
    Ok(resolved)
}

fn percent_decode_rounds(raw: &str) -> String {
    let mut current = raw.to_string();
    for _ in 0..MAX_DECODE_ROUNDS {
        let next = percent_decode_str(&current).decode_utf8_lossy().into_owned();
        if next == current {
            break;
        }
        current = next;
    }
    current
}

/// Validate `raw` as a URL whose scheme is in `allowed_schemes`.
pub fn validate_url(raw: &str, allowed_schemes: &[String]) -> ValidationResult {
    check_url(raw, allowed_schemes, false)
}

fn check_url(raw: &str, allowed_schemes: &[String], block_private_hosts: bool) -> ValidationResult {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return ValidationResult::rejected(ErrorKind::MalformedInput, "URL is empty");
    }
    if raw.chars().any(char::is_control) {
        return ValidationResult::rejected(
            ErrorKind::MalformedInput,
            "URL contains control characters",
        );
    }
    let parsed = match Url::parse(trimmed) {
        Ok(u) => u,
        Err(e) => {
            return ValidationResult::rejected(
                ErrorKind::MalformedInput,
                format!("URL could not be parsed: {e}"),
            );
        }
    };

    let scheme = parsed.scheme();
    if !allowed_schemes.iter().any(|s| s == scheme) {
        return ValidationResult::rejected(
            ErrorKind::InvalidScheme,
            format!("scheme '{scheme}' is not permitted"),
        );
    }
    if trimmed.contains(['<', '>', '"', '\'']) {
        return ValidationResult::rejected(
            ErrorKind::DangerousCharacter,
            "URL contains markup or quote characters",
        );
    }
    if matches!(scheme, "http" | "https") && parsed.host_str().is_none_or(str::is_empty) {
        return ValidationResult::rejected(ErrorKind::MalformedInput, "URL has no host");
    }
    if block_private_hosts && is_forbidden_host(&parsed) {
        return ValidationResult::rejected(
            ErrorKind::ForbiddenHost,
            "URL targets a private, loopback or link-local address",
        );
    }

    ValidationResult::allowed(parsed.as_str())
}

/// Literal-host check only; names are not resolved.
fn is_forbidden_host(url: &Url) -> bool {
    match url.host() {
        Some(Host::Ipv4(ip)) => is_forbidden_ip(IpAddr::V4(ip)),
        Some(Host::Ipv6(ip)) => is_forbidden_ip(IpAddr::V6(ip)),
        Some(Host::Domain(domain)) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            domain == "localhost"
                || domain.ends_with(".localhost")
                || domain == "metadata.google.internal"
        }
        None => false,
    }
}

fn is_forbidden_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_forbidden_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_forbidden_v4(v4),
            None => is_forbidden_v6(v6),
        },
    }
}

fn is_forbidden_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || (a == 100 && (64..128).contains(&b))
}

fn is_forbidden_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || (first & 0xfe00) == 0xfc00
        || (first & 0xffc0) == 0xfe80
}

/// Secret key names: 1 to 128 characters of `[A-Za-z0-9_.-]`.
pub fn validate_secret_key(raw: &str) -> ValidationResult {
    let valid = !raw.is_empty()
        && raw.len() <= MAX_SECRET_KEY_LEN
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        ValidationResult::allowed(raw)
    } else {
        ValidationResult::rejected(
            ErrorKind::MalformedInput,
            format!("secret key must be 1-{MAX_SECRET_KEY_LEN} characters of [A-Za-z0-9_.-]"),
        )
    }
}
