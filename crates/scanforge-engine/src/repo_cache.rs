//! Content-addressed repository working copies shared across scans.
//!
//! The cache keeps one bare clone per repository slug under a local
//! workdir, plus ephemeral worktrees for the commits being scanned.
//!
//! ## Concurrency
//!
//! - A TTL'd lock file serializes clone/fetch writers per slug; a dead
//!   worker's lock is taken over once it expires
//! - Checkouts of different commits of the same repository proceed in
//!   parallel; each worktree is named by `(slug, commit, dispatcher_id)`
//!   so dispatchers never collide
//!
//! ## Failure classification
//!
//! Operations return [`ScanFailure`] directly: a commit that stays missing
//! after the origin refresh and the fork fallback is permanent
//! (`commit-missing`); everything else on this path is transient I/O.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::job::ScanFailure;

/// How long a repository lock lives before takeover.
const REPO_LOCK_TTL: Duration = Duration::from_secs(600);

/// Base backoff while waiting on a contended repository lock.
const LOCK_BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Maximum backoff while waiting on a contended repository lock.
const LOCK_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Attempts before giving up on a contended repository lock.
const LOCK_MAX_RETRIES: u32 = 50;

/// Derives the canonical clone URL for a repository slug.
///
/// An explicit URL wins; otherwise the slug maps to its GitHub remote.
#[must_use]
pub fn normalize_repo_url(repo_url: Option<&str>, repo_slug: &str) -> String {
    match repo_url {
        Some(url) if !url.is_empty() => {
            let cleaned = url.trim_end_matches('/');
            if cleaned.ends_with(".git") {
                cleaned.to_string()
            } else {
                format!("{cleaned}.git")
            }
        }
        _ => format!("https://github.com/{repo_slug}.git"),
    }
}

/// Contents of a repository lock file.
#[derive(Debug, Serialize, Deserialize)]
struct LockFile {
    holder: String,
    expires_at: DateTime<Utc>,
}

/// Guard for a held repository lock; removes the lock file on release.
struct RepoLockGuard {
    path: PathBuf,
}

impl RepoLockGuard {
    async fn release(self) {
        let _ = tokio::fs::remove_file(&self.path).await;
    }
}

/// An ephemeral working copy of one commit.
///
/// Hand it back to [`RepoCache::release`] when the scan is done.
#[derive(Debug, Clone)]
pub struct Checkout {
    /// Directory containing the checked-out sources.
    pub workdir: PathBuf,
    bare: PathBuf,
}

impl Checkout {
    /// Directory containing the checked-out sources.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.workdir
    }
}

/// Base used to derive fork remotes from repository slugs.
const DEFAULT_FORK_BASE: &str = "https://github.com";

/// Cache of bare clones and per-commit worktrees.
#[derive(Debug, Clone)]
pub struct RepoCache {
    root: PathBuf,
    dispatcher_id: String,
    fork_base: String,
}

impl RepoCache {
    /// Creates a cache rooted at `root`; `dispatcher_id` namespaces the
    /// worktrees of this worker process.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, dispatcher_id: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            dispatcher_id: dispatcher_id.into(),
            fork_base: DEFAULT_FORK_BASE.to_string(),
        }
    }

    /// Overrides the base the fork fallback derives remotes from.
    #[must_use]
    pub fn with_fork_remote_base(mut self, base: impl Into<String>) -> Self {
        self.fork_base = base.into();
        self
    }

    fn fork_url(&self, slug: &str) -> String {
        format!("{}/{slug}.git", self.fork_base.trim_end_matches('/'))
    }

    fn slug_dir_name(slug: &str) -> String {
        slug.replace('/', "__")
    }

    fn bare_path(&self, slug: &str) -> PathBuf {
        self.root
            .join("repos")
            .join(format!("{}.git", Self::slug_dir_name(slug)))
    }

    fn lock_path(&self, slug: &str) -> PathBuf {
        self.root
            .join("locks")
            .join(format!("{}.lock", Self::slug_dir_name(slug)))
    }

    fn worktree_path(&self, slug: &str, commit: &str) -> PathBuf {
        self.root
            .join("worktrees")
            .join(Self::slug_dir_name(slug))
            .join(format!("{commit}-{}", self.dispatcher_id))
    }

    /// Acquires the per-slug writer lock with TTL takeover.
    async fn lock_repo(&self, slug: &str) -> Result<RepoLockGuard, ScanFailure> {
        let path = self.lock_path(slug);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ScanFailure::transient("checkout-io").with_detail(e.to_string()))?;
        }

        let contents = serde_json::to_vec(&LockFile {
            holder: self.dispatcher_id.clone(),
            expires_at: Utc::now()
                + chrono::Duration::from_std(REPO_LOCK_TTL)
                    .unwrap_or_else(|_| chrono::Duration::seconds(600)),
        })
        .map_err(|e| ScanFailure::transient("checkout-io").with_detail(e.to_string()))?;

        let mut backoff = LOCK_BACKOFF_BASE;
        for _ in 0..LOCK_MAX_RETRIES {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => {
                    tokio::fs::write(&path, &contents).await.map_err(|e| {
                        ScanFailure::transient("checkout-io").with_detail(e.to_string())
                    })?;
                    return Ok(RepoLockGuard { path });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    // Take over an expired lock; otherwise wait and retry.
                    let expired = match tokio::fs::read(&path).await {
                        Ok(raw) => serde_json::from_slice::<LockFile>(&raw)
                            .map_or(true, |info| info.expires_at <= Utc::now()),
                        Err(_) => false,
                    };
                    if expired {
                        let _ = tokio::fs::remove_file(&path).await;
                        continue;
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(LOCK_BACKOFF_MAX);
                }
                Err(err) => {
                    return Err(
                        ScanFailure::transient("checkout-io").with_detail(err.to_string())
                    );
                }
            }
        }
        Err(ScanFailure::transient("repo-lock-contended")
            .with_detail(format!("could not lock repository '{slug}'")))
    }

    /// Ensures the bare clone exists and is fresh.
    ///
    /// Serialized per slug by the repository lock.
    pub async fn ensure(&self, repo_url: &str, slug: &str) -> Result<PathBuf, ScanFailure> {
        let guard = self.lock_repo(slug).await?;
        let result = self.ensure_locked(repo_url, slug).await;
        guard.release().await;
        result
    }

    async fn ensure_locked(&self, repo_url: &str, slug: &str) -> Result<PathBuf, ScanFailure> {
        let bare = self.bare_path(slug);
        if bare.join("HEAD").exists() {
            // Refresh; a failed fetch is tolerated, the commit check decides.
            let _ = run_git(
                &["fetch", "--all", "--tags", "--prune"],
                Some(&bare),
            )
            .await;
            return Ok(bare);
        }
        if let Some(parent) = bare.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ScanFailure::transient("checkout-io").with_detail(e.to_string()))?;
        }
        let output = run_git(
            &["clone", "--bare", repo_url, &bare.to_string_lossy()],
            None,
        )
        .await?;
        if !output.status.success() {
            return Err(ScanFailure::transient("repo-unreachable")
                .with_detail(stderr_tail(&output)));
        }
        Ok(bare)
    }

    /// Creates a working copy of `commit`, fetching from the origin and,
    /// when the slug derives a different remote, from that fork before
    /// declaring the commit missing.
    pub async fn checkout(
        &self,
        repo_url: &str,
        slug: &str,
        commit: &str,
    ) -> Result<Checkout, ScanFailure> {
        let guard = self.lock_repo(slug).await?;
        let result = self.checkout_locked(repo_url, slug, commit).await;
        guard.release().await;
        result
    }

    async fn checkout_locked(
        &self,
        repo_url: &str,
        slug: &str,
        commit: &str,
    ) -> Result<Checkout, ScanFailure> {
        let bare = self.ensure_locked(repo_url, slug).await?;

        if !commit_exists(&bare, commit).await {
            // A plain refresh may miss single commits; try them directly.
            let _ = run_git(&["fetch", "origin", commit], Some(&bare)).await;
        }
        if !commit_exists(&bare, commit).await {
            let fork_url = self.fork_url(slug);
            if fork_url != repo_url {
                self.fetch_commit_from_fork(&bare, commit, &fork_url).await;
            }
        }
        if !commit_exists(&bare, commit).await {
            return Err(ScanFailure::permanent("commit-missing").with_detail(format!(
                "commit {commit} not found in origin or fork of '{slug}'"
            )));
        }

        let workdir = self.worktree_path(slug, commit);
        if workdir.exists() {
            let _ = run_git(
                &["worktree", "remove", "--force", &workdir.to_string_lossy()],
                Some(&bare),
            )
            .await;
            let _ = tokio::fs::remove_dir_all(&workdir).await;
        }
        if let Some(parent) = workdir.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ScanFailure::transient("checkout-io").with_detail(e.to_string()))?;
        }
        let output = run_git(
            &[
                "worktree",
                "add",
                "--detach",
                &workdir.to_string_lossy(),
                commit,
            ],
            Some(&bare),
        )
        .await?;
        if !output.status.success() {
            return Err(
                ScanFailure::transient("checkout-io").with_detail(stderr_tail(&output))
            );
        }
        Ok(Checkout { workdir, bare })
    }

    /// Fetches a single commit from a fork remote, best effort.
    async fn fetch_commit_from_fork(&self, bare: &Path, commit: &str, fork_url: &str) {
        tracing::info!(commit, fork_url, "fetching missing commit from fork");
        let _ = run_git(&["remote", "remove", "fork"], Some(bare)).await;
        let Ok(output) = run_git(&["remote", "add", "fork", fork_url], Some(bare)).await else {
            return;
        };
        if !output.status.success() {
            return;
        }
        let _ = run_git(&["fetch", "fork", commit], Some(bare)).await;
    }

    /// Removes least-recently-touched bare clones until the cache fits
    /// the byte budget; returns how many clones were removed.
    ///
    /// Run from a maintenance task, not the scan path. Each removal holds
    /// the slug's writer lock so an in-progress fetch is never ripped out.
    pub async fn gc_bare_clones(&self, max_cache_bytes: u64) -> Result<usize, ScanFailure> {
        let repos_dir = self.root.join("repos");
        let scan_dir = repos_dir.clone();
        let mut clones = tokio::task::spawn_blocking(move || {
            let mut clones = Vec::new();
            let Ok(entries) = std::fs::read_dir(&scan_dir) else {
                return clones;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                let touched = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                clones.push((path.clone(), touched, dir_size(&path)));
            }
            clones
        })
        .await
        .map_err(|e| ScanFailure::transient("checkout-io").with_detail(e.to_string()))?;

        let mut total: u64 = clones.iter().map(|(_, _, size)| size).sum();
        if total <= max_cache_bytes {
            return Ok(0);
        }
        clones.sort_by_key(|(_, touched, _)| *touched);

        let mut removed = 0;
        for (path, _, size) in clones {
            if total <= max_cache_bytes {
                break;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let slug = name.trim_end_matches(".git").replace("__", "/");
            let guard = self.lock_repo(&slug).await?;
            let result = tokio::fs::remove_dir_all(&path).await;
            guard.release().await;
            if result.is_ok() {
                tracing::info!(slug, freed_bytes = size, "evicted bare clone");
                total = total.saturating_sub(size);
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Removes a working copy. Bare clones persist for the process
    /// lifetime.
    pub async fn release(&self, checkout: Checkout) -> Result<(), ScanFailure> {
        let output = run_git(
            &[
                "worktree",
                "remove",
                "--force",
                &checkout.workdir.to_string_lossy(),
            ],
            Some(&checkout.bare),
        )
        .await?;
        if !output.status.success() {
            // The directory may be gone already; clean up what remains.
            let _ = tokio::fs::remove_dir_all(&checkout.workdir).await;
        }
        Ok(())
    }
}

/// Recursive on-disk size of a directory, best effort.
fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                dir_size(&path)
            } else {
                entry.metadata().map(|m| m.len()).unwrap_or(0)
            }
        })
        .sum()
}

/// Returns true if the commit object exists in the repository.
async fn commit_exists(repo: &Path, commit: &str) -> bool {
    run_git(&["cat-file", "-e", &format!("{commit}^{{commit}}")], Some(repo))
        .await
        .map(|output| output.status.success())
        .unwrap_or(false)
}

async fn run_git(
    args: &[&str],
    cwd: Option<&Path>,
) -> Result<std::process::Output, ScanFailure> {
    let mut command = Command::new("git");
    command.args(args);
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }
    tracing::debug!(?args, "running git");
    command
        .output()
        .await
        .map_err(|e| ScanFailure::transient("checkout-io").with_detail(e.to_string()))
}

fn stderr_tail(output: &std::process::Output) -> String {
    let text = String::from_utf8_lossy(&output.stderr);
    let tail: Vec<&str> = text.lines().rev().take(5).collect();
    tail.into_iter().rev().collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn git_in(dir: &Path, args: &[&str]) {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .expect("git runs");
        assert!(
            output.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    /// Creates a source repository with one commit and returns its path
    /// and head sha.
    async fn fixture_repo(tmp: &TempDir, name: &str) -> (PathBuf, String) {
        let repo = tmp.path().join(name);
        tokio::fs::create_dir_all(&repo).await.unwrap();
        git_in(&repo, &["init", "--initial-branch", "main"]).await;
        git_in(&repo, &["config", "user.email", "test@example.com"]).await;
        git_in(&repo, &["config", "user.name", "Test"]).await;
        tokio::fs::write(repo.join("lib.rs"), "pub fn answer() -> u32 { 42 }\n")
            .await
            .unwrap();
        git_in(&repo, &["add", "."]).await;
        git_in(&repo, &["commit", "-m", "initial"]).await;
        let output = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(&repo)
            .output()
            .await
            .unwrap();
        let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (repo, sha)
    }

    #[test]
    fn repo_url_normalization() {
        assert_eq!(
            normalize_repo_url(None, "acme/lib"),
            "https://github.com/acme/lib.git"
        );
        assert_eq!(
            normalize_repo_url(Some("https://example.com/repo"), "acme/lib"),
            "https://example.com/repo.git"
        );
        assert_eq!(
            normalize_repo_url(Some("https://example.com/repo.git/"), "acme/lib"),
            "https://example.com/repo.git"
        );
    }

    #[tokio::test]
    async fn checkout_and_release_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let (repo, sha) = fixture_repo(&tmp, "source").await;
        let cache = RepoCache::new(tmp.path().join("cache"), "worker-1");

        let url = repo.to_string_lossy().to_string();
        let checkout = cache
            .checkout(&url, "acme/lib", &sha)
            .await
            .expect("checkout succeeds");
        assert!(checkout.path().join("lib.rs").exists());

        cache.release(checkout.clone()).await.expect("release");
        assert!(!checkout.path().exists());
    }

    #[tokio::test]
    async fn missing_commit_is_permanent() {
        let tmp = TempDir::new().unwrap();
        let (repo, _sha) = fixture_repo(&tmp, "source").await;
        let cache = RepoCache::new(tmp.path().join("cache"), "worker-1")
            .with_fork_remote_base(tmp.path().join("forks").to_string_lossy());

        let url = repo.to_string_lossy().to_string();
        let missing = "0123456789abcdef0123456789abcdef01234567";
        let failure = cache
            .checkout(&url, "acme/lib", missing)
            .await
            .expect_err("missing commit must fail");
        assert!(!failure.is_transient());
        assert_eq!(failure.reason, "commit-missing");
    }

    #[tokio::test]
    async fn fork_fallback_fetches_commit_missing_from_origin() {
        let tmp = TempDir::new().unwrap();
        let (origin, _base_sha) = fixture_repo(&tmp, "origin").await;

        // The fork carries one commit the origin lacks.
        let forks = tmp.path().join("forks").join("acme");
        tokio::fs::create_dir_all(&forks).await.unwrap();
        let fork = forks.join("lib.git");
        git_in(
            tmp.path(),
            &[
                "clone",
                &origin.to_string_lossy(),
                &fork.to_string_lossy(),
            ],
        )
        .await;
        git_in(&fork, &["config", "user.email", "test@example.com"]).await;
        git_in(&fork, &["config", "user.name", "Test"]).await;
        tokio::fs::write(fork.join("extra.rs"), "pub fn extra() {}\n")
            .await
            .unwrap();
        git_in(&fork, &["add", "."]).await;
        git_in(&fork, &["commit", "-m", "fork only"]).await;
        let output = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(&fork)
            .output()
            .await
            .unwrap();
        let fork_sha = String::from_utf8_lossy(&output.stdout).trim().to_string();

        let cache = RepoCache::new(tmp.path().join("cache"), "worker-1")
            .with_fork_remote_base(tmp.path().join("forks").to_string_lossy());
        let checkout = cache
            .checkout(&origin.to_string_lossy(), "acme/lib", &fork_sha)
            .await
            .expect("fork fallback finds the commit");
        assert!(checkout.path().join("extra.rs").exists());
        cache.release(checkout).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_checkouts_use_distinct_workdirs() {
        let tmp = TempDir::new().unwrap();
        let (repo, sha) = fixture_repo(&tmp, "source").await;
        let url = repo.to_string_lossy().to_string();

        let cache_a = RepoCache::new(tmp.path().join("cache"), "worker-a");
        let cache_b = RepoCache::new(tmp.path().join("cache"), "worker-b");

        let (first, second) = tokio::join!(
            cache_a.checkout(&url, "acme/lib", &sha),
            cache_b.checkout(&url, "acme/lib", &sha),
        );
        let first = first.expect("first checkout");
        let second = second.expect("second checkout");
        assert_ne!(first.path(), second.path());

        cache_a.release(first).await.unwrap();
        cache_b.release(second).await.unwrap();
    }

    #[tokio::test]
    async fn bare_clone_is_reused_across_checkouts() {
        let tmp = TempDir::new().unwrap();
        let (repo, sha) = fixture_repo(&tmp, "source").await;
        let url = repo.to_string_lossy().to_string();
        let cache = RepoCache::new(tmp.path().join("cache"), "worker-1");

        let bare = cache.ensure(&url, "acme/lib").await.expect("ensure");
        assert!(bare.join("HEAD").exists());

        let checkout = cache.checkout(&url, "acme/lib", &sha).await.unwrap();
        cache.release(checkout).await.unwrap();

        // A second ensure refreshes rather than recloning.
        let again = cache.ensure(&url, "acme/lib").await.expect("ensure again");
        assert_eq!(bare, again);
    }

    #[tokio::test]
    async fn gc_evicts_bare_clones_over_the_byte_budget() {
        let tmp = TempDir::new().unwrap();
        let (repo_a, _) = fixture_repo(&tmp, "source-a").await;
        let (repo_b, _) = fixture_repo(&tmp, "source-b").await;
        let cache = RepoCache::new(tmp.path().join("cache"), "worker-1");

        cache
            .ensure(&repo_a.to_string_lossy(), "acme/alpha")
            .await
            .unwrap();
        cache
            .ensure(&repo_b.to_string_lossy(), "acme/beta")
            .await
            .unwrap();

        // Everything fits: nothing is evicted.
        let removed = cache.gc_bare_clones(u64::MAX).await.unwrap();
        assert_eq!(removed, 0);

        // A zero budget evicts every clone.
        let removed = cache.gc_bare_clones(0).await.unwrap();
        assert_eq!(removed, 2);
        assert!(!cache.bare_path("acme/alpha").exists());
        assert!(!cache.bare_path("acme/beta").exists());

        // The next checkout reclones transparently.
        let bare = cache
            .ensure(&repo_a.to_string_lossy(), "acme/alpha")
            .await
            .unwrap();
        assert!(bare.join("HEAD").exists());
    }

    #[tokio::test]
    async fn expired_repo_lock_is_taken_over() {
        let tmp = TempDir::new().unwrap();
        let (repo, sha) = fixture_repo(&tmp, "source").await;
        let cache = RepoCache::new(tmp.path().join("cache"), "worker-1");

        // Plant an expired lock left behind by a dead worker.
        let lock_path = cache.lock_path("acme/lib");
        tokio::fs::create_dir_all(lock_path.parent().unwrap())
            .await
            .unwrap();
        let stale = serde_json::to_vec(&LockFile {
            holder: "dead-worker".into(),
            expires_at: Utc::now() - chrono::Duration::seconds(1),
        })
        .unwrap();
        tokio::fs::write(&lock_path, stale).await.unwrap();

        let url = repo.to_string_lossy().to_string();
        let checkout = cache
            .checkout(&url, "acme/lib", &sha)
            .await
            .expect("takes over the expired lock");
        cache.release(checkout).await.unwrap();
    }
}
