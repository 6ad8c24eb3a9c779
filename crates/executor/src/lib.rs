//! Sandboxed execution for Warden.
//!
//! Everything here receives values the validator already accepted and
//! performs no validation of its own. What it does enforce are resource
//! limits: deadlines, output caps, and no-follow file opens.

pub mod command;
pub mod error;
pub mod file;
pub mod http;

pub use command::CommandOutput;
pub use error::ExecError;
pub use file::FileContent;
pub use http::{HttpClient, HttpResponse};

use std::path::Path;
use std::time::Duration;
use warden_config::ExecutorConfig;
use warden_core::CommandPlan;

/// Runs validated operations within the configured limits.
#[derive(Debug, Clone)]
pub struct Executor {
    config: ExecutorConfig,
    http: HttpClient,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Result<Self, ExecError> {
        let http = HttpClient::new(
            Duration::from_secs(config.http_timeout_secs),
            config.max_response_bytes,
        )?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Deadline for a command: `0` means the configured default, anything
    /// above the maximum is clamped to it.
    pub fn effective_timeout(&self, requested_secs: u64) -> Duration {
        let secs = match requested_secs {
            0 => self.config.default_timeout_secs,
            n => n.min(self.config.max_timeout_secs),
        };
        Duration::from_secs(secs)
    }

    pub async fn run(&self, plan: &CommandPlan, timeout: Duration) -> Result<CommandOutput, ExecError> {
        command::run_plan(plan, timeout, self.config.max_output_bytes).await
    }

    pub async fn read_file(&self, path: &Path) -> Result<FileContent, ExecError> {
        file::read_file(path, self.config.max_read_bytes).await
    }

    pub async fn write_file(&self, path: &Path, content: &[u8]) -> Result<usize, ExecError> {
        file::write_file(path, content).await
    }

    pub async fn http_get(&self, url: &str) -> Result<HttpResponse, ExecError> {
        self.http.get(url).await
    }

    pub async fn http_post(
        &self,
        url: &str,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<HttpResponse, ExecError> {
        self.http.post(url, body, content_type).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> Executor {
        Executor::new(ExecutorConfig {
            default_timeout_secs: 30,
            max_timeout_secs: 120,
            ..ExecutorConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn zero_timeout_means_default() {
        assert_eq!(executor().effective_timeout(0), Duration::from_secs(30));
    }

    #[test]
    fn large_timeout_is_clamped() {
        let exec = executor();
        assert_eq!(exec.effective_timeout(10), Duration::from_secs(10));
        assert_eq!(exec.effective_timeout(10_000), Duration::from_secs(120));
    }

    #[tokio::test]
    async fn run_applies_output_cap() {
        let exec = Executor::new(ExecutorConfig {
            max_output_bytes: 4,
            ..ExecutorConfig::default()
        })
        .unwrap();
        let plan = CommandPlan::Direct {
            program: "echo".into(),
            args: vec!["abcdefgh".into()],
        };
        let out = exec.run(&plan, Duration::from_secs(5)).await.unwrap();
        assert_eq!(out.stdout, "abcd");
        assert!(out.truncated);
    }
}
