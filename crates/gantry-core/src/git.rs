//! Git CLI wrapper used by the sync coordinator's commit-back path.
//!
//! All calls shell out to `git` synchronously; async callers hop through
//! `tokio::task::spawn_blocking`.

use std::path::Path;
use std::process::Command;

use anyhow::{anyhow, Context, Result};

use crate::error::GantryError;

pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

pub struct Git {
    pub repo_path: String,
}

impl Git {
    pub fn new(repo_path: impl Into<String>) -> Self {
        Self { repo_path: repo_path.into() }
    }

    pub fn exec(&self, dir: &str, args: &[&str]) -> Result<ExecResult> {
        self.exec_env(dir, args, &[])
    }

    pub fn exec_env(&self, dir: &str, args: &[&str], env: &[(&str, &str)]) -> Result<ExecResult> {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(dir);
        cmd.args(args);
        for (k, v) in env {
            cmd.env(k, v);
        }

        let output = cmd
            .output()
            .with_context(|| format!("failed to spawn git -C {dir} {}", args.join(" ")))?;

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }

    /// Shallow-clone `url` at `branch` into `repo_path`. A no-op when the
    /// clone already exists; the working copy is then fetched and reset to
    /// the remote branch so syncs always start from the forge's tip.
    pub fn clone_or_update(&self, url: &str, branch: &str) -> Result<()> {
        if Path::new(&self.repo_path).join(".git").exists() {
            let fetch = self.exec(&self.repo_path, &["fetch", "--depth", "1", "origin", branch])?;
            if !fetch.success() {
                return Err(transient("git fetch", &fetch));
            }
            let reset =
                self.exec(&self.repo_path, &["reset", "--hard", &format!("origin/{branch}")])?;
            if !reset.success() {
                return Err(transient("git reset --hard", &reset));
            }
            return Ok(());
        }

        if let Some(parent) = Path::new(&self.repo_path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let out = Command::new("git")
            .args(["clone", "--depth", "1", "--branch", branch, url, &self.repo_path])
            .output()
            .context("failed to spawn git clone")?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(GantryError::Transient(format!("git clone failed: {stderr}")).into());
        }
        Ok(())
    }

    pub fn rev_parse(&self, refname: &str) -> Result<String> {
        let result = self.exec(&self.repo_path, &["rev-parse", refname])?;
        if !result.success() {
            return Err(anyhow!(
                "git rev-parse {refname} failed: {}",
                result.combined_output()
            ));
        }
        Ok(result.stdout.trim().to_string())
    }

    pub fn set_author_config(&self, name: &str, email: &str) -> Result<()> {
        for (key, value) in [("user.name", name), ("user.email", email)] {
            let result = self.exec(&self.repo_path, &["config", key, value])?;
            if !result.success() {
                return Err(anyhow!("git config {key} failed: {}", result.combined_output()));
            }
        }
        Ok(())
    }

    /// Register the line-wise JSONL merge driver for the beads file so
    /// human merges of the issue store go through it too.
    pub fn register_beads_merge_driver(&self, beads_dir: &str) -> Result<()> {
        let result = self.exec(
            &self.repo_path,
            &["config", "merge.beads.name", "line-wise beads issue merge"],
        )?;
        if !result.success() {
            return Err(anyhow!("git config merge.beads.name failed"));
        }
        let driver = self.exec(
            &self.repo_path,
            &["config", "merge.beads.driver", "gantry-merge %O %A %B"],
        )?;
        if !driver.success() {
            return Err(anyhow!("git config merge.beads.driver failed"));
        }

        let attributes = Path::new(&self.repo_path).join(".git").join("info").join("attributes");
        if let Some(dir) = attributes.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let line = format!("{beads_dir}/*.jsonl merge=beads\n");
        let existing = std::fs::read_to_string(&attributes).unwrap_or_default();
        if !existing.contains(line.trim_end()) {
            std::fs::write(&attributes, existing + &line)?;
        }
        Ok(())
    }

    /// Stage everything and commit. Returns false when the tree is clean.
    pub fn commit_all(&self, message: &str) -> Result<bool> {
        let add = self.exec(&self.repo_path, &["add", "-A"])?;
        if !add.success() {
            return Err(anyhow!("git add -A failed: {}", add.combined_output()));
        }

        let status = self.exec(&self.repo_path, &["status", "--porcelain"])?;
        if status.stdout.trim().is_empty() {
            return Ok(false);
        }

        let result = self.exec(&self.repo_path, &["commit", "-m", message])?;
        if !result.success() {
            return Err(anyhow!("git commit failed: {}", result.combined_output()));
        }
        Ok(true)
    }

    /// Push the branch; on rejection, pull with rebase and retry up to
    /// `retries` times. A rebase that conflicts on the beads JSONL file is
    /// resolved with the line-wise merge; any other conflict aborts the
    /// rebase and falls back to a merge pull.
    pub fn push_with_retry(&self, branch: &str, beads_file: &str, retries: u32) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            let push = self.exec(&self.repo_path, &["push", "origin", branch])?;
            if push.success() {
                return Ok(());
            }
            attempt += 1;
            if attempt > retries {
                return Err(GantryError::Transient(format!(
                    "git push rejected after {retries} retries: {}",
                    push.combined_output()
                ))
                .into());
            }

            let pull = self.exec(&self.repo_path, &["pull", "--rebase", "origin", branch])?;
            if pull.success() {
                continue;
            }

            if self.resolve_beads_conflict(beads_file)? {
                continue;
            }

            // Rebase unrecoverable: abort and fall back to a merge pull.
            let _ = self.exec(&self.repo_path, &["rebase", "--abort"]);
            let merge = self.exec(&self.repo_path, &["pull", "--no-rebase", "origin", branch])?;
            if !merge.success() {
                if self.resolve_beads_conflict(beads_file)? {
                    let commit =
                        self.exec(&self.repo_path, &["commit", "--no-edit"])?;
                    if commit.success() {
                        continue;
                    }
                }
                let _ = self.exec(&self.repo_path, &["merge", "--abort"]);
                return Err(GantryError::Transient(format!(
                    "git pull fallback failed: {}",
                    merge.combined_output()
                ))
                .into());
            }
        }
    }

    /// If the only conflicted path is the beads file, merge it line-wise
    /// from the three index stages and continue the rebase. Returns true
    /// when a conflict was resolved.
    fn resolve_beads_conflict(&self, beads_file: &str) -> Result<bool> {
        let conflicted = self.exec(
            &self.repo_path,
            &["diff", "--name-only", "--diff-filter=U"],
        )?;
        let paths: Vec<&str> = conflicted.stdout.lines().map(str::trim).collect();
        if paths.is_empty() || paths.iter().any(|p| *p != beads_file) {
            return Ok(false);
        }

        let base = self.show_stage(1, beads_file).unwrap_or_default();
        let ours = self.show_stage(2, beads_file).unwrap_or_default();
        let theirs = self.show_stage(3, beads_file).unwrap_or_default();
        let merged = crate::beads::merge_lines(&base, &ours, &theirs)?;

        let full = Path::new(&self.repo_path).join(beads_file);
        std::fs::write(&full, merged)
            .with_context(|| format!("write merged {}", full.display()))?;

        let add = self.exec(&self.repo_path, &["add", beads_file])?;
        if !add.success() {
            return Ok(false);
        }
        let cont = self.exec_env(
            &self.repo_path,
            &["rebase", "--continue"],
            &[("GIT_EDITOR", "true")],
        )?;
        // During a merge pull there is no rebase to continue; the caller
        // commits instead.
        Ok(cont.success() || !self.rebase_in_progress()?)
    }

    fn show_stage(&self, stage: u8, path: &str) -> Result<String> {
        let spec = format!(":{stage}:{path}");
        let result = self.exec(&self.repo_path, &["show", &spec])?;
        if !result.success() {
            return Err(anyhow!("git show {spec} failed"));
        }
        Ok(result.stdout)
    }

    pub fn rebase_in_progress(&self) -> Result<bool> {
        let merge = self.exec(&self.repo_path, &["rev-parse", "--git-path", "rebase-merge"])?;
        let apply = self.exec(&self.repo_path, &["rev-parse", "--git-path", "rebase-apply"])?;
        if !merge.success() || !apply.success() {
            return Ok(false);
        }
        let merge_path = Path::new(&self.repo_path).join(merge.stdout.trim());
        let apply_path = Path::new(&self.repo_path).join(apply.stdout.trim());
        Ok(merge_path.exists() || apply_path.exists())
    }
}

fn transient(what: &str, result: &ExecResult) -> anyhow::Error {
    GantryError::Transient(format!("{what} failed: {}", result.combined_output())).into()
}
