//! Loads the set of configuration files a `git_source` submission points
//! at.
//!
//! This crate is deliberately thin: it shells out to the system `git`
//! binary the same way the rest of this lineage does for repository
//! inspection, clones into a throwaway temp directory, and glob-matches
//! file names under `path`. It does not understand build systems, does
//! not execute anything inside the checkout, and is the only place that
//! materializes plain `git clone` into process invocation.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};

use foundry_types::GitSource;

/// Loads package config blobs referenced by a [`GitSource`].
pub trait SourceLoader: Send + Sync {
    /// Returns relative path -> file content for every file under
    /// `source.path` matching `source.pattern`.
    fn load(&self, source: &GitSource) -> Result<BTreeMap<String, String>>;
}

/// Default loader: a real `git clone` into a temp directory per call.
#[derive(Debug, Default)]
pub struct GitSourceLoader;

impl SourceLoader for GitSourceLoader {
    fn load(&self, source: &GitSource) -> Result<BTreeMap<String, String>> {
        let workdir = tempfile::tempdir().context("failed to create temp checkout directory")?;

        let clone_status = Command::new("git")
            .args(["clone", "--quiet", "--depth", "1", "--branch", &source.git_ref])
            .arg(&source.repository)
            .arg(workdir.path())
            .status()
            .context("failed to execute git clone; is git installed?")?;

        if !clone_status.success() {
            bail!(
                "git clone of {} at {} failed",
                source.repository,
                source.git_ref
            );
        }

        let search_root = if source.path.is_empty() {
            workdir.path().to_path_buf()
        } else {
            workdir.path().join(&source.path)
        };

        let mut matches = BTreeMap::new();
        collect_matches(&search_root, &search_root, &source.pattern, &mut matches)?;
        Ok(matches)
    }
}

fn collect_matches(
    root: &Path,
    dir: &Path,
    pattern: &str,
    out: &mut BTreeMap<String, String>,
) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }

    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory {}", dir.display()))?
    {
        let entry = entry.context("failed to read directory entry")?;
        let path = entry.path();
        if path.is_dir() {
            collect_matches(root, &path, pattern, out)?;
            continue;
        }

        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !glob_match(pattern, file_name) {
            continue;
        }

        let relative = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        out.insert(relative, content);
    }
    Ok(())
}

/// A small `*`/`?` glob matcher. No crate in this lineage pulls in a full
/// glob implementation for a job this narrow.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    matches_from(&pattern, 0, &text, 0)
}

fn matches_from(pattern: &[char], pi: usize, text: &[char], ti: usize) -> bool {
    if pi == pattern.len() {
        return ti == text.len();
    }
    match pattern[pi] {
        '*' => {
            for skip in 0..=(text.len() - ti) {
                if matches_from(pattern, pi + 1, text, ti + skip) {
                    return true;
                }
            }
            false
        }
        '?' => ti < text.len() && matches_from(pattern, pi + 1, text, ti + 1),
        c => ti < text.len() && text[ti] == c && matches_from(pattern, pi + 1, text, ti + 1),
    }
}
