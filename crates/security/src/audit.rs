//! Audit logging: an append-only, hash-chained JSONL trail of every gateway
//! decision and outcome.
//!
//! Each record is one JSON line whose `prev` field is the SHA-256 of the line
//! before it, so deleting or editing a line breaks the chain at that point.
//! A failed write never fails the caller: the loss is reported on stderr via
//! `tracing` and a `logging_degraded` record is written ahead of the next
//! record that does reach the sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use warden_config::AuditConfig;
use warden_core::CallerContext;

use crate::lock::FileLock;

/// `prev` value of the first record in a file.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Longest target kept in a record, in characters.
pub const MAX_TARGET_CHARS: usize = 200;

/// Longest detail kept in a record, in characters.
pub const MAX_DETAIL_CHARS: usize = 512;

/// What was attempted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditOp {
    RunCommand,
    ReadFile,
    WriteFile,
    HttpGet,
    HttpPost,
    SecretGet,
    SecretAdd,
    SecretRotate,
    SecretList,
    SecretDelete,
    SecretReload,
    /// A request was refused by bearer-token authentication.
    AuthFailure,
    /// Earlier records were lost; written before the next successful record.
    LoggingDegraded,
}

impl AuditOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunCommand => "run_command",
            Self::ReadFile => "read_file",
            Self::WriteFile => "write_file",
            Self::HttpGet => "http_get",
            Self::HttpPost => "http_post",
            Self::SecretGet => "secret_get",
            Self::SecretAdd => "secret_add",
            Self::SecretRotate => "secret_rotate",
            Self::SecretList => "secret_list",
            Self::SecretDelete => "secret_delete",
            Self::SecretReload => "secret_reload",
            Self::AuthFailure => "auth_failure",
            Self::LoggingDegraded => "logging_degraded",
        }
    }
}

impl std::fmt::Display for AuditOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an audited step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AuditOutcome {
    Allowed,
    Rejected,
    Executed,
    Failed,
}

/// A single audit log record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditRecord {
    pub ts: DateTime<Utc>,
    pub actor: String,
    pub op: AuditOp,
    pub target: String,
    pub outcome: AuditOutcome,
    pub detail: String,
    /// Request id shared by the intent and outcome records of one call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req: Option<String>,
    /// SHA-256 (hex) of the previous line. Filled in by [`AuditLogger`].
    #[serde(default)]
    pub prev: String,
}

impl AuditRecord {
    pub fn new(
        actor: &str,
        op: AuditOp,
        target: &str,
        outcome: AuditOutcome,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            ts: Utc::now(),
            actor: strip_controls(actor),
            op,
            target: sanitize_target(target),
            outcome,
            detail: truncate_chars(&strip_controls(&detail.into()), MAX_DETAIL_CHARS),
            req: None,
            prev: String::new(),
        }
    }

    pub fn with_request(mut self, request_id: impl Into<String>) -> Self {
        self.req = Some(request_id.into());
        self
    }
}

/// Actor plus a fresh request id, stamped on every record of one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTag {
    pub actor: String,
    pub request_id: String,
}

impl RequestTag {
    pub fn new(actor: impl Into<String>) -> Self {
        Self::for_caller(&CallerContext::new(actor))
    }

    pub fn for_caller(ctx: &CallerContext) -> Self {
        Self {
            actor: ctx.actor.clone(),
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Build a record carrying this tag's actor and request id.
    pub fn record(
        &self,
        op: AuditOp,
        target: &str,
        outcome: AuditOutcome,
        detail: impl Into<String>,
    ) -> AuditRecord {
        AuditRecord::new(&self.actor, op, target, outcome, detail).with_request(&self.request_id)
    }
}

/// Errors opening, reading or verifying an audit file.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Audit I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Audit log {} is in use by another process", .0.display())]
    Locked(PathBuf),

    #[error("Audit record on line {line} is not valid JSON: {source}")]
    Corrupt {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Why a sink did not take a record.
#[derive(Debug)]
pub enum SinkError {
    /// Nothing of the record remains in the sink.
    NotWritten(io::Error),
    /// The whole line reached the sink but could not be made durable.
    Unsynced(io::Error),
}

impl From<io::Error> for SinkError {
    fn from(e: io::Error) -> Self {
        Self::NotWritten(e)
    }
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotWritten(e) => write!(f, "not written: {e}"),
            Self::Unsynced(e) => write!(f, "written but not synced: {e}"),
        }
    }
}

/// Where serialized records go.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord, line: &str) -> Result<(), SinkError>;
}

/// What [`append_line`] needs from the file behind a [`JsonlFileSink`].
trait AppendTarget: Write {
    fn current_len(&self) -> io::Result<u64>;
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}

impl AppendTarget for File {
    fn current_len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

/// Write one newline-terminated line. A failed write is cut back to the
/// length the file had before, so no partial line survives to be merged
/// with the next record.
fn append_line(target: &mut impl AppendTarget, line: &[u8]) -> Result<(), SinkError> {
    let before = target.current_len()?;
    if let Err(e) = target.write_all(line) {
        if let Err(truncate) = target.truncate_to(before) {
            tracing::error!(error = %truncate, "Could not remove partial audit line");
        }
        return Err(SinkError::NotWritten(e));
    }
    target.sync().map_err(SinkError::Unsynced)
}

/// Appends one line per record to a JSONL file and syncs it to disk. Holds
/// the file's lock for as long as it lives.
pub struct JsonlFileSink {
    path: PathBuf,
    file: Mutex<File>,
    _lock: FileLock,
}

impl JsonlFileSink {
    /// Open (creating if needed) the log for appending. The parent directory
    /// is created when missing. Fails with [`AuditError::Locked`] when
    /// another handle already owns the log.
    pub fn open(path: &Path) -> Result<Self, AuditError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let lock = FileLock::try_acquire(path)?
            .ok_or_else(|| AuditError::Locked(path.to_path_buf()))?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            _lock: lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlFileSink {
    fn record(&self, _record: &AuditRecord, line: &str) -> Result<(), SinkError> {
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        append_line(&mut *file, buf.as_bytes())
    }
}

/// Keeps records in memory. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<AuditRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for MemorySink {
    fn record(&self, record: &AuditRecord, _line: &str) -> Result<(), SinkError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}

/// A tracing-based audit sink that logs records via `tracing::info!`.
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn record(&self, record: &AuditRecord, _line: &str) -> Result<(), SinkError> {
        tracing::info!(
            actor = %record.actor,
            op = %record.op,
            target = %record.target,
            outcome = ?record.outcome,
            detail = %record.detail,
            req = ?record.req,
            "AUDIT"
        );
        Ok(())
    }
}

struct ChainState {
    prev: String,
    lost: u64,
    /// Records that are in the chain but whose sync failed.
    unsynced: u64,
    last_error: Option<String>,
}

impl ChainState {
    fn degraded(&self) -> bool {
        self.lost > 0 || self.unsynced > 0
    }

    fn degraded_detail(&self) -> String {
        format!(
            "LoggingDegraded: {} record(s) lost, {} record(s) not synced: {}",
            self.lost,
            self.unsynced,
            self.last_error.as_deref().unwrap_or("unknown error")
        )
    }
}

/// Serializes records, links them into the hash chain and hands them to the
/// primary sink. Mirrors receive the same records on a best-effort basis.
pub struct AuditLogger {
    chain: Mutex<ChainState>,
    primary: Box<dyn AuditSink>,
    mirrors: Vec<Box<dyn AuditSink>>,
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let chain = self.chain.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("AuditLogger")
            .field("lost_records", &chain.lost)
            .field("unsynced_records", &chain.unsynced)
            .field("mirror_count", &self.mirrors.len())
            .finish()
    }
}

impl AuditLogger {
    /// Log to a JSONL file, resuming the chain from its last line.
    /// Fails with [`AuditError::Locked`] while another logger owns the file.
    pub fn open(path: &Path) -> Result<Self, AuditError> {
        let sink = JsonlFileSink::open(path)?;
        let prev = last_line_hash(path)?;
        tracing::debug!(path = %path.display(), "Audit log opened");
        Ok(Self::with_primary(Box::new(sink), prev))
    }

    /// Open the configured log, mirroring to `tracing` when enabled.
    pub fn from_config(config: &AuditConfig) -> Result<Self, AuditError> {
        let logger = Self::open(&config.resolved_path())?;
        Ok(if config.mirror_to_tracing {
            logger.with_mirror(Box::new(TracingSink))
        } else {
            logger
        })
    }

    /// Build a logger around any primary sink. `prev` is the hash the next
    /// record links to ([`GENESIS_HASH`] for a fresh chain).
    pub fn with_primary(primary: Box<dyn AuditSink>, prev: impl Into<String>) -> Self {
        Self {
            chain: Mutex::new(ChainState {
                prev: prev.into(),
                lost: 0,
                unsynced: 0,
                last_error: None,
            }),
            primary,
            mirrors: Vec::new(),
        }
    }

    /// In-memory logger for tests and dry runs.
    pub fn in_memory() -> (Self, MemorySink) {
        let sink = MemorySink::new();
        (Self::with_primary(Box::new(sink.clone()), GENESIS_HASH), sink)
    }

    pub fn with_mirror(mut self, sink: Box<dyn AuditSink>) -> Self {
        self.mirrors.push(sink);
        self
    }

    /// Append a record. Never fails the caller; see the module docs.
    pub fn record(&self, record: AuditRecord) {
        let mut chain = self.chain.lock().unwrap_or_else(PoisonError::into_inner);

        if chain.degraded() {
            let notice = AuditRecord::new(
                "warden",
                AuditOp::LoggingDegraded,
                "audit",
                AuditOutcome::Failed,
                chain.degraded_detail(),
            );
            let (lost, unsynced) = (chain.lost, chain.unsynced);
            chain.lost = 0;
            chain.unsynced = 0;
            if let Err(e) = self.append(&mut chain, notice) {
                chain.lost += lost;
                chain.unsynced += unsynced;
                self.note_loss(&mut chain, &record, e);
                return;
            }
            if !chain.degraded() {
                chain.last_error = None;
            }
        }

        if let Err(e) = self.append(&mut chain, record.clone()) {
            self.note_loss(&mut chain, &record, e);
        }
    }

    /// Records lost since the last successful write.
    pub fn lost_records(&self) -> u64 {
        self.chain.lock().unwrap_or_else(PoisonError::into_inner).lost
    }

    /// Records that reached the file but may not survive a crash.
    pub fn unsynced_records(&self) -> u64 {
        self.chain.lock().unwrap_or_else(PoisonError::into_inner).unsynced
    }

    pub fn is_degraded(&self) -> bool {
        self.chain.lock().unwrap_or_else(PoisonError::into_inner).degraded()
    }

    /// Link and write one record. `Err` means the record is not in the file
    /// and the chain did not move.
    fn append(&self, chain: &mut ChainState, mut record: AuditRecord) -> io::Result<()> {
        record.prev = chain.prev.clone();
        let line = serde_json::to_string(&record).map_err(io::Error::other)?;
        match self.primary.record(&record, &line) {
            Ok(()) => {}
            Err(SinkError::NotWritten(e)) => return Err(e),
            Err(SinkError::Unsynced(e)) => {
                chain.unsynced += 1;
                chain.last_error = Some(e.to_string());
                tracing::error!(error = %e, op = %record.op, "Audit record written but not synced");
            }
        }
        chain.prev = line_hash(&line);
        for mirror in &self.mirrors {
            if let Err(e) = mirror.record(&record, &line) {
                tracing::warn!(error = %e, "Audit mirror sink failed");
            }
        }
        Ok(())
    }

    fn note_loss(&self, chain: &mut ChainState, record: &AuditRecord, error: io::Error) {
        chain.lost += 1;
        chain.last_error = Some(error.to_string());
        tracing::error!(
            error = %error,
            op = %record.op,
            actor = %record.actor,
            outcome = ?record.outcome,
            lost = chain.lost,
            "Audit record could not be written"
        );
    }
}

/// SHA-256 (hex) of one serialized line, without its newline.
pub fn line_hash(line: &str) -> String {
    hex::encode(Sha256::digest(line.as_bytes()))
}

fn last_line_hash(path: &Path) -> Result<String, AuditError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(GENESIS_HASH.into()),
        Err(e) => return Err(e.into()),
    };
    let mut last = None;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if !line.trim().is_empty() {
            last = Some(line);
        }
    }
    Ok(last.map_or_else(|| GENESIS_HASH.to_string(), |l| line_hash(&l)))
}

/// First point where the chain does not hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBreak {
    /// 1-based line number.
    pub line: usize,
    pub reason: String,
}

/// Result of walking an audit file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReport {
    pub records: usize,
    pub first_break: Option<ChainBreak>,
}

impl ChainReport {
    pub fn is_intact(&self) -> bool {
        self.first_break.is_none()
    }
}

/// Walk the file and check every `prev` link.
pub fn verify_chain(path: &Path) -> Result<ChainReport, AuditError> {
    let reader = BufReader::new(File::open(path)?);
    let mut expected = GENESIS_HASH.to_string();
    let mut records = 0;

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let number = idx + 1;
        let record: AuditRecord = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                return Ok(ChainReport {
                    records,
                    first_break: Some(ChainBreak {
                        line: number,
                        reason: format!("unparseable record: {e}"),
                    }),
                });
            }
        };
        if record.prev != expected {
            return Ok(ChainReport {
                records,
                first_break: Some(ChainBreak {
                    line: number,
                    reason: "prev hash does not match the preceding line".into(),
                }),
            });
        }
        expected = line_hash(&line);
        records += 1;
    }

    Ok(ChainReport {
        records,
        first_break: None,
    })
}

/// Read every record in the file.
pub fn read_records(path: &Path) -> Result<Vec<AuditRecord>, AuditError> {
    let reader = BufReader::new(File::open(path)?);
    let mut out = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|source| AuditError::Corrupt {
            line: idx + 1,
            source,
        })?;
        out.push(record);
    }
    Ok(out)
}

/// Strip control characters, mask URL credentials and truncate.
pub fn sanitize_target(raw: &str) -> String {
    truncate_chars(&redact_userinfo(&strip_controls(raw)), MAX_TARGET_CHARS)
}

fn strip_controls(s: &str) -> String {
    s.chars().filter(|c| !c.is_control()).collect()
}

fn redact_userinfo(s: &str) -> String {
    let Some(scheme_end) = s.find("://") else {
        return s.to_string();
    };
    let authority_start = scheme_end + 3;
    let rest = &s[authority_start..];
    let authority_len = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    match rest[..authority_len].rfind('@') {
        Some(at) => format!("{}***{}", &s[..authority_start], &rest[at..]),
        None => s.to_string(),
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}
