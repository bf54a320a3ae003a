//! Invocation of the external analysis scanner.
//!
//! Runs the scanner CLI for a checked-out commit, tees its output to a
//! per-commit log file, and parses the submission identifier the analysis
//! server echoes in its completion webhook.
//!
//! ## Configuration resolution
//!
//! The caller resolves the effective analysis configuration (job override →
//! project override → system default) and passes the winning text; an
//! empty override is a permanent `config-malformed` failure before any
//! subprocess is spawned.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use scanforge_core::config::InstanceSettings;

use crate::job::ScanFailure;

/// File name the resolved configuration override is written to inside the
/// working copy.
const OVERRIDE_FILE_NAME: &str = ".scanforge-scan.properties";

/// The scanner prints the report-processing URL; the submission id is its
/// `id` query parameter.
fn submission_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"ce/task\?id=([A-Za-z0-9_\-]+)").expect("valid regex"))
}

/// A successful scanner run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    /// Identifier the analysis server will echo in its webhook.
    pub analysis_id: String,
    /// Per-commit log file the output was tee'd to.
    pub log_path: PathBuf,
}

/// Runs the external scanner CLI.
#[derive(Debug, Clone)]
pub struct Scanner {
    log_dir: PathBuf,
    scan_timeout: Duration,
}

impl Scanner {
    /// Creates a scanner writing logs under `log_dir` and bounding each
    /// subprocess by `scan_timeout`.
    #[must_use]
    pub fn new(log_dir: impl Into<PathBuf>, scan_timeout: Duration) -> Self {
        Self {
            log_dir: log_dir.into(),
            scan_timeout,
        }
    }

    /// Path of the log file for a component key.
    #[must_use]
    pub fn log_path(&self, component_key: &str) -> PathBuf {
        self.log_dir.join(format!("{component_key}.log"))
    }

    /// Invokes the scanner for a checked-out commit.
    ///
    /// Success is exit code 0 AND a submission-id line in the output; a
    /// clean exit without the line is permanent (`submission-id-missing`),
    /// a timeout is transient (`scan-timeout`).
    pub async fn run(
        &self,
        instance: &InstanceSettings,
        workdir: &Path,
        component_key: &str,
        config_override: Option<&str>,
    ) -> Result<Submission, ScanFailure> {
        let token = instance
            .resolved_token()
            .map_err(|e| ScanFailure::permanent("config-malformed").with_detail(e.to_string()))?;

        let mut args = vec![
            format!("-Dsonar.projectKey={component_key}"),
            format!("-Dsonar.projectName={component_key}"),
            "-Dsonar.sources=.".to_string(),
            format!("-Dsonar.host.url={}", instance.host.trim_end_matches('/')),
            "-Dsonar.sourceEncoding=UTF-8".to_string(),
            "-Dsonar.scm.exclusions.disabled=true".to_string(),
        ];

        if let Some(config) = config_override {
            if config.trim().is_empty() {
                return Err(ScanFailure::permanent("config-malformed")
                    .with_detail("configuration override is empty"));
            }
            let override_path = workdir.join(OVERRIDE_FILE_NAME);
            tokio::fs::write(&override_path, config).await.map_err(|e| {
                ScanFailure::transient("checkout-io").with_detail(e.to_string())
            })?;
            args.push(format!(
                "-Dproject.settings={}",
                override_path.to_string_lossy()
            ));
        }

        tokio::fs::create_dir_all(&self.log_dir)
            .await
            .map_err(|e| ScanFailure::transient("scanner-io").with_detail(e.to_string()))?;
        let log_path = self.log_path(component_key);

        let mut child = Command::new(&instance.scanner_path)
            .args(&args)
            .env("SONAR_TOKEN", token)
            .current_dir(workdir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ScanFailure::transient("scanner-io").with_detail(e.to_string()))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let drive = async {
            let mut log = tokio::fs::File::create(&log_path)
                .await
                .map_err(|e| ScanFailure::transient("scanner-io").with_detail(e.to_string()))?;
            let mut analysis_id = None;
            let mut tail: Vec<String> = Vec::new();

            let mut stdout_lines = stdout.map(|s| BufReader::new(s).lines());
            let mut stderr_lines = stderr.map(|s| BufReader::new(s).lines());
            loop {
                if stdout_lines.is_none() && stderr_lines.is_none() {
                    break;
                }
                let line = tokio::select! {
                    line = next_line(&mut stdout_lines), if stdout_lines.is_some() => line,
                    line = next_line(&mut stderr_lines), if stderr_lines.is_some() => line,
                };
                let Some(line) = line else { continue };
                if let Some(captures) = submission_regex().captures(&line) {
                    analysis_id = Some(captures[1].to_string());
                }
                if tail.len() >= 10 {
                    tail.remove(0);
                }
                tail.push(line.clone());
                log.write_all(line.as_bytes()).await.map_err(|e| {
                    ScanFailure::transient("scanner-io").with_detail(e.to_string())
                })?;
                log.write_all(b"\n").await.map_err(|e| {
                    ScanFailure::transient("scanner-io").with_detail(e.to_string())
                })?;
            }
            log.flush()
                .await
                .map_err(|e| ScanFailure::transient("scanner-io").with_detail(e.to_string()))?;

            let status = child
                .wait()
                .await
                .map_err(|e| ScanFailure::transient("scanner-io").with_detail(e.to_string()))?;
            Ok::<_, ScanFailure>((status, analysis_id, tail))
        };

        let (status, analysis_id, tail) =
            match tokio::time::timeout(self.scan_timeout, drive).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(ScanFailure::transient("scan-timeout").with_detail(format!(
                        "scanner exceeded {}s",
                        self.scan_timeout.as_secs()
                    )));
                }
            };

        if !status.success() {
            return Err(ScanFailure::transient("scanner-failed")
                .with_detail(format!("exit {status}: {}", tail.join(" | "))));
        }
        let Some(analysis_id) = analysis_id else {
            return Err(ScanFailure::permanent("submission-id-missing")
                .with_detail("scanner output carried no report-processing line"));
        };

        tracing::info!(component_key, analysis_id, "scanner submitted analysis");
        Ok(Submission {
            analysis_id,
            log_path,
        })
    }
}

/// Reads the next line from an optional line stream; a `None` stream or an
/// exhausted one pends forever so `select!` falls through to the other arm
/// until both are drained.
async fn next_line(
    lines: &mut Option<tokio::io::Lines<BufReader<impl tokio::io::AsyncRead + Unpin>>>,
) -> Option<String> {
    match lines {
        Some(stream) => match stream.next_line().await {
            Ok(Some(line)) => Some(line),
            Ok(None) | Err(_) => {
                *lines = None;
                None
            }
        },
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn instance(scanner_path: &Path) -> InstanceSettings {
        InstanceSettings {
            name: "primary".into(),
            host: "http://localhost:9000/".into(),
            token: Some("token".into()),
            concurrency_cap: 1,
            scanner_path: scanner_path.to_path_buf(),
        }
    }

    async fn fake_scanner(tmp: &TempDir, script: &str) -> PathBuf {
        let path = tmp.path().join("fake-scanner.sh");
        tokio::fs::write(&path, format!("#!/bin/sh\n{script}\n"))
            .await
            .unwrap();
        let mut perms = tokio::fs::metadata(&path).await.unwrap().permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(&path, perms).await.unwrap();
        path
    }

    fn scanner(tmp: &TempDir) -> Scanner {
        Scanner::new(tmp.path().join("logs"), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn parses_submission_id_and_tees_log() {
        let tmp = TempDir::new().unwrap();
        let script = fake_scanner(
            &tmp,
            "echo 'INFO: Analysis complete'\n\
             echo 'INFO: More about the report processing at http://localhost:9000/api/ce/task?id=AXabc-123'",
        )
        .await;
        let workdir = tmp.path().join("work");
        tokio::fs::create_dir_all(&workdir).await.unwrap();

        let submission = scanner(&tmp)
            .run(&instance(&script), &workdir, "acme_c1", None)
            .await
            .expect("scan succeeds");
        assert_eq!(submission.analysis_id, "AXabc-123");

        let log = tokio::fs::read_to_string(&submission.log_path).await.unwrap();
        assert!(log.contains("Analysis complete"));
        assert!(log.contains("ce/task?id=AXabc-123"));
    }

    #[tokio::test]
    async fn missing_submission_id_is_permanent() {
        let tmp = TempDir::new().unwrap();
        let script = fake_scanner(&tmp, "echo 'INFO: Analysis complete'").await;
        let workdir = tmp.path().join("work");
        tokio::fs::create_dir_all(&workdir).await.unwrap();

        let failure = scanner(&tmp)
            .run(&instance(&script), &workdir, "acme_c1", None)
            .await
            .expect_err("must fail");
        assert!(!failure.is_transient());
        assert_eq!(failure.reason, "submission-id-missing");
    }

    #[tokio::test]
    async fn nonzero_exit_is_transient() {
        let tmp = TempDir::new().unwrap();
        let script = fake_scanner(&tmp, "echo 'ERROR: out of heap' >&2\nexit 2").await;
        let workdir = tmp.path().join("work");
        tokio::fs::create_dir_all(&workdir).await.unwrap();

        let failure = scanner(&tmp)
            .run(&instance(&script), &workdir, "acme_c1", None)
            .await
            .expect_err("must fail");
        assert!(failure.is_transient());
        assert_eq!(failure.reason, "scanner-failed");
        assert!(failure.detail.unwrap().contains("out of heap"));
    }

    #[tokio::test]
    async fn timeout_kills_the_subprocess() {
        let tmp = TempDir::new().unwrap();
        let script = fake_scanner(&tmp, "sleep 30").await;
        let workdir = tmp.path().join("work");
        tokio::fs::create_dir_all(&workdir).await.unwrap();

        let scanner = Scanner::new(tmp.path().join("logs"), Duration::from_millis(200));
        let failure = scanner
            .run(&instance(&script), &workdir, "acme_c1", None)
            .await
            .expect_err("must time out");
        assert!(failure.is_transient());
        assert_eq!(failure.reason, "scan-timeout");
    }

    #[tokio::test]
    async fn empty_config_override_is_rejected_before_spawn() {
        let tmp = TempDir::new().unwrap();
        let script = fake_scanner(&tmp, "echo should-not-run").await;
        let workdir = tmp.path().join("work");
        tokio::fs::create_dir_all(&workdir).await.unwrap();

        let failure = scanner(&tmp)
            .run(&instance(&script), &workdir, "acme_c1", Some("   "))
            .await
            .expect_err("must reject");
        assert!(!failure.is_transient());
        assert_eq!(failure.reason, "config-malformed");
    }

    #[tokio::test]
    async fn config_override_is_materialized_in_workdir() {
        let tmp = TempDir::new().unwrap();
        let script = fake_scanner(
            &tmp,
            "echo 'INFO: More about the report processing at http://h/api/ce/task?id=AX1'",
        )
        .await;
        let workdir = tmp.path().join("work");
        tokio::fs::create_dir_all(&workdir).await.unwrap();

        scanner(&tmp)
            .run(
                &instance(&script),
                &workdir,
                "acme_c1",
                Some("sonar.exclusions=**/vendor/**"),
            )
            .await
            .expect("scan succeeds");
        let written = tokio::fs::read_to_string(workdir.join(OVERRIDE_FILE_NAME))
            .await
            .unwrap();
        assert!(written.contains("sonar.exclusions"));
    }
}
