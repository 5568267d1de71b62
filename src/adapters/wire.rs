//! Wire records shared by GitHub and Forgejo, whose REST APIs use the same
//! shapes for repositories, commits, trees and hooks.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::trait_::{BranchInfo, CommitInfo, RepositoryInfo, Signature, TreeEntry, Webhook};

#[derive(Debug, Deserialize)]
pub(crate) struct User {
    pub login: String,
    pub id: Option<u64>,
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Repository {
    pub name: String,
    pub full_name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub private: bool,
    pub default_branch: Option<String>,
    pub clone_url: String,
    pub ssh_url: Option<String>,
    pub html_url: Option<String>,
    pub size: Option<u64>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub topics: Vec<String>,
}

impl From<Repository> for RepositoryInfo {
    fn from(repo: Repository) -> Self {
        RepositoryInfo {
            name: repo.name,
            full_name: repo.full_name,
            description: repo.description.filter(|d| !d.is_empty()),
            private: repo.private,
            default_branch: repo
                .default_branch
                .filter(|b| !b.is_empty())
                .unwrap_or_else(|| "main".to_string()),
            clone_url: repo.clone_url,
            ssh_url: repo.ssh_url,
            web_url: repo.html_url,
            size_kb: repo.size,
            created_at: repo.created_at,
            updated_at: repo.updated_at,
            topics: repo.topics,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct Sha {
    #[serde(alias = "id")]
    pub sha: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Branch {
    pub name: String,
    pub commit: Sha,
    #[serde(default)]
    pub protected: bool,
}

impl From<Branch> for BranchInfo {
    fn from(branch: Branch) -> Self {
        BranchInfo {
            name: branch.name,
            commit_sha: branch.commit.sha,
            protected: branch.protected,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct WireSignature {
    pub name: Option<String>,
    pub email: Option<String>,
    pub date: Option<DateTime<Utc>>,
}

impl From<WireSignature> for Signature {
    fn from(sig: WireSignature) -> Self {
        Signature {
            name: sig.name.unwrap_or_default(),
            email: sig.email.unwrap_or_default(),
            date: sig.date,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct CommitDetail {
    #[serde(default)]
    pub message: String,
    pub author: Option<WireSignature>,
    pub committer: Option<WireSignature>,
    pub tree: Option<Sha>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Commit {
    pub sha: String,
    #[serde(default)]
    pub commit: CommitDetail,
    #[serde(default)]
    pub parents: Vec<Sha>,
    pub html_url: Option<String>,
}

impl Commit {
    pub fn tree_sha(&self) -> Option<&str> {
        self.commit.tree.as_ref().map(|tree| tree.sha.as_str())
    }
}

impl From<Commit> for CommitInfo {
    fn from(commit: Commit) -> Self {
        CommitInfo {
            sha: commit.sha,
            message: commit.commit.message,
            author: commit.commit.author.map(Signature::from),
            committer: commit.commit.committer.map(Signature::from),
            parents: commit.parents.into_iter().map(|p| p.sha).collect(),
            url: commit.html_url,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct Tree {
    pub sha: Option<String>,
    #[serde(default)]
    pub tree: Vec<WireTreeEntry>,
    #[serde(default)]
    pub truncated: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireTreeEntry {
    pub path: String,
    pub mode: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub sha: String,
    pub size: Option<u64>,
}

impl From<WireTreeEntry> for TreeEntry {
    fn from(entry: WireTreeEntry) -> Self {
        TreeEntry {
            path: entry.path,
            mode: entry.mode,
            kind: entry.kind,
            sha: entry.sha,
            size: entry.size,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct HookConfig {
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Hook {
    pub id: u64,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub config: HookConfig,
}

impl Hook {
    pub fn into_webhook(self, fallback_url: &str) -> Webhook {
        Webhook {
            id: self.id.to_string(),
            url: self.config.url.unwrap_or_else(|| fallback_url.to_string()),
            events: self.events,
            active: self.active,
        }
    }
}
