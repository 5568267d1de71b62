//! Owner/name extraction from the clone URLs stored on repository bindings.

use std::sync::LazyLock;

use regex::Regex;

use crate::adapters::RepoCoordinates;

static HTTPS_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://[^/]+/(.+)/([^/]+?)(?:\.git)?/?$").expect("https URL regex should compile")
});

static SCP_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\w.-]+@[^:/]+:/?(.+)/([^/]+?)(?:\.git)?/?$").expect("scp URL regex should compile")
});

static SSH_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^ssh://(?:[\w.-]+@)?[^/]+/(.+)/([^/]+?)(?:\.git)?/?$")
        .expect("ssh URL regex should compile")
});

static GIT_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^git://[^/]+/(.+)/([^/]+?)(?:\.git)?/?$").expect("git URL regex should compile")
});

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unable to parse repository URL: {url}")]
pub struct RemoteUrlError {
    pub url: String,
}

/// Parses `https://host/owner/repo.git`, `git@host:owner/repo.git`,
/// `ssh://git@host/owner/repo` and `git://host/owner/repo`. Owners keep
/// nested group paths (`group/sub`). Anything else falls back to the last
/// two path segments.
pub fn parse_remote_url(url: &str) -> Result<RepoCoordinates, RemoteUrlError> {
    let trimmed = url.trim();

    for pattern in [&*HTTPS_URL, &*SSH_URL, &*GIT_URL, &*SCP_URL] {
        if let Some(captures) = pattern.captures(trimmed)
            && let (Some(owner), Some(name)) = (captures.get(1), captures.get(2))
        {
            return Ok(RepoCoordinates::new(owner.as_str(), name.as_str()));
        }
    }

    let segments: Vec<&str> = trimmed
        .trim_end_matches('/')
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();

    match segments.as_slice() {
        [.., owner, name] => {
            let name = name.strip_suffix(".git").unwrap_or(name);
            if name.is_empty() {
                return Err(RemoteUrlError {
                    url: url.to_string(),
                });
            }
            Ok(RepoCoordinates::new(*owner, name))
        }
        _ => Err(RemoteUrlError {
            url: url.to_string(),
        }),
    }
}
