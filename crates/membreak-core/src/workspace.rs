//! External collaborators consumed by the coordinator: change retrieval,
//! per-agent workspace isolation, and prompt generation.
//!
//! Local implementations cover the single-machine case: a directory is the
//! "change", each agent gets a private copy of it, and prompts are rendered
//! from the changed-file list.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::{DirEntry, WalkDir};

use membreak_state::{AgentKind, RunId};

use crate::session::PromptSet;

/// Prompt hash recorded when fallback prompts were used.
pub const FALLBACK_PROMPT_HASH: &str = "fallback";

/// Checked-out change ready for isolation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeContext {
    pub change_request: String,
    /// Master copy that per-agent workspaces are cloned from.
    pub workspace_path: PathBuf,
    pub changed_files: Vec<String>,
}

#[async_trait]
pub trait ChangeSource: Send + Sync {
    async fn clone_and_diff(&self, change_request: &str) -> Result<ChangeContext>;
}

#[async_trait]
pub trait WorkspaceIsolator: Send + Sync {
    /// Produce an exclusive copy of `master` for one agent.
    async fn isolate(
        &self,
        master: &Path,
        run_id: &RunId,
        agent_kind: &AgentKind,
    ) -> Result<PathBuf>;
}

#[async_trait]
pub trait PromptSource: Send + Sync {
    async fn generate_prompts(
        &self,
        change: &ChangeContext,
        file_budget: usize,
    ) -> Result<PromptSet>;
}

fn is_git_dir(entry: &DirEntry) -> bool {
    entry.file_type().is_dir() && entry.file_name() == ".git"
}

/// Relative paths of every file under `root`, skipping `.git`, sorted.
fn list_files(root: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).into_iter().filter_entry(|e| !is_git_dir(e)) {
        let entry = entry.with_context(|| format!("walking {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("{} escapes {}", entry.path().display(), root.display()))?;
        files.push(rel.to_string_lossy().replace('\\', "/"));
    }
    files.sort();
    Ok(files)
}

/// Treats the change request as a path to an already checked-out directory.
/// Every file in it is reported as changed.
#[derive(Debug, Clone, Default)]
pub struct LocalChangeSource;

#[async_trait]
impl ChangeSource for LocalChangeSource {
    async fn clone_and_diff(&self, change_request: &str) -> Result<ChangeContext> {
        let path = PathBuf::from(change_request);
        anyhow::ensure!(path.is_dir(), "change directory not found: {}", path.display());
        let root = path.clone();
        let changed_files = tokio::task::spawn_blocking(move || list_files(&root))
            .await
            .context("file listing task panicked")??;
        Ok(ChangeContext {
            change_request: change_request.to_string(),
            workspace_path: path,
            changed_files,
        })
    }
}

/// Copies the master workspace into `<root>/<run id>/<agent kind>`.
#[derive(Debug, Clone)]
pub struct DirectoryIsolator {
    root: PathBuf,
}

impl DirectoryIsolator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn copy_tree(master: &Path, dest: &Path) -> Result<()> {
        if dest.exists() {
            std::fs::remove_dir_all(dest)
                .with_context(|| format!("clearing stale workspace {}", dest.display()))?;
        }
        std::fs::create_dir_all(dest)
            .with_context(|| format!("creating workspace {}", dest.display()))?;
        let entries = WalkDir::new(master)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| !is_git_dir(e));
        for entry in entries {
            let entry = entry.with_context(|| format!("walking {}", master.display()))?;
            let rel = entry.path().strip_prefix(master)?;
            let target = dest.join(rel);
            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&target)
                    .with_context(|| format!("creating {}", target.display()))?;
            } else if entry.file_type().is_file() {
                std::fs::copy(entry.path(), &target)
                    .with_context(|| format!("copying {}", entry.path().display()))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl WorkspaceIsolator for DirectoryIsolator {
    async fn isolate(
        &self,
        master: &Path,
        run_id: &RunId,
        agent_kind: &AgentKind,
    ) -> Result<PathBuf> {
        anyhow::ensure!(master.is_dir(), "master workspace missing: {}", master.display());
        let dest = self.root.join(run_id.to_string()).join(agent_kind.as_str());
        let (src, dst) = (master.to_path_buf(), dest.clone());
        tokio::task::spawn_blocking(move || Self::copy_tree(&src, &dst))
            .await
            .context("workspace copy task panicked")??;
        Ok(dest)
    }
}

/// Always returns the same prompts.
#[derive(Debug, Clone)]
pub struct StaticPromptSource {
    prompts: PromptSet,
}

impl StaticPromptSource {
    pub fn new(prompts: PromptSet) -> Self {
        Self { prompts }
    }
}

#[async_trait]
impl PromptSource for StaticPromptSource {
    async fn generate_prompts(
        &self,
        _change: &ChangeContext,
        _file_budget: usize,
    ) -> Result<PromptSet> {
        Ok(self.prompts.clone())
    }
}

/// Renders prompts from the changed-file list, capped at the file budget.
#[derive(Debug, Clone, Default)]
pub struct TemplatePromptSource;

#[async_trait]
impl PromptSource for TemplatePromptSource {
    async fn generate_prompts(
        &self,
        change: &ChangeContext,
        file_budget: usize,
    ) -> Result<PromptSet> {
        anyhow::ensure!(!change.changed_files.is_empty(), "change has no files to review");
        let shown = &change.changed_files[..change.changed_files.len().min(file_budget)];
        let listing = shown
            .iter()
            .map(|f| format!("- {f}"))
            .collect::<Vec<_>>()
            .join("\n");
        let omitted = change.changed_files.len() - shown.len();
        let tail = if omitted > 0 {
            format!("\n({omitted} more files omitted)")
        } else {
            String::new()
        };

        Ok(PromptSet {
            context_load: format!(
                "You are reviewing the change {}. Read these files carefully:\n{listing}{tail}",
                change.change_request
            ),
            pre_compression: "Summarise what this change does, which components it touches and why."
                .to_string(),
            deep_dive: "Go deeper: walk through the changed code path by path, citing functions, types and edge cases."
                .to_string(),
            memory_only: "Without re-reading any files, describe the change from memory.".to_string(),
            recall_questions: shown
                .iter()
                .take(3)
                .map(|f| format!("What changed in {f}, and how does it interact with the rest of the system?"))
                .chain(std::iter::once(
                    "If the requirements changed to revert this behaviour, what would you modify and what would you keep?"
                        .to_string(),
                ))
                .collect(),
        })
    }
}

/// Minimal prompts used when generation fails.
pub fn fallback_prompts(change_request: &str) -> PromptSet {
    PromptSet {
        context_load: format!("Load the code change {change_request} into context."),
        pre_compression: format!("Analyze the change {change_request}."),
        deep_dive: "Provide technical analysis of the code changes".to_string(),
        memory_only: "Based on memory only, recall the change analysis".to_string(),
        recall_questions: vec!["Answer questions about the change from memory: what did it modify?".to_string()],
    }
}

/// SHA-256 hex of the canonical JSON encoding of `prompts`.
pub fn prompt_hash(prompts: &PromptSet) -> String {
    let canonical = serde_json::to_vec(prompts).unwrap_or_default();
    hex::encode(Sha256::digest(&canonical))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(dir: &Path) {
        std::fs::create_dir_all(dir.join("src")).unwrap();
        std::fs::create_dir_all(dir.join(".git/objects")).unwrap();
        std::fs::write(dir.join("src/lib.rs"), "pub fn f() {}").unwrap();
        std::fs::write(dir.join("README.md"), "# demo").unwrap();
        std::fs::write(dir.join(".git/HEAD"), "ref: refs/heads/main").unwrap();
    }

    #[tokio::test]
    async fn test_local_change_lists_files_without_git() {
        let tmp = tempfile::tempdir().unwrap();
        seed(tmp.path());
        let change = LocalChangeSource
            .clone_and_diff(tmp.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(change.changed_files, vec!["README.md", "src/lib.rs"]);
    }

    #[tokio::test]
    async fn test_missing_change_dir_fails() {
        assert!(LocalChangeSource.clone_and_diff("/definitely/not/here").await.is_err());
    }

    #[tokio::test]
    async fn test_isolated_copies_are_independent() {
        let master = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        seed(master.path());
        let iso = DirectoryIsolator::new(root.path());
        let run = RunId::new();

        let a = iso.isolate(master.path(), &run, &AgentKind::new("claude")).await.unwrap();
        let b = iso.isolate(master.path(), &run, &AgentKind::new("gemini")).await.unwrap();
        assert_eq!(a, root.path().join(run.to_string()).join("claude"));
        assert!(!a.join(".git").exists());

        std::fs::write(a.join("src/lib.rs"), "mutated").unwrap();
        assert_eq!(std::fs::read_to_string(b.join("src/lib.rs")).unwrap(), "pub fn f() {}");
    }

    #[tokio::test]
    async fn test_template_prompts_respect_budget() {
        let change = ChangeContext {
            change_request: "pr-7".into(),
            workspace_path: PathBuf::from("."),
            changed_files: vec!["a.rs".into(), "b.rs".into(), "c.rs".into()],
        };
        let prompts = TemplatePromptSource.generate_prompts(&change, 2).await.unwrap();
        assert!(prompts.context_load.contains("- b.rs"));
        assert!(!prompts.context_load.contains("- c.rs"));
        assert!(prompts.context_load.contains("1 more files omitted"));
        assert_eq!(prompts.recall_questions.len(), 3);
    }

    #[test]
    fn test_prompt_hash_is_stable_hex() {
        let p = fallback_prompts("pr-1");
        let h = prompt_hash(&p);
        assert_eq!(h.len(), 64);
        assert_eq!(h, prompt_hash(&p.clone()));
        assert_ne!(h, prompt_hash(&fallback_prompts("pr-2")));
    }
}
