//! Repository push notifications.
//!
//! Hosting services describe a push in their own JSON dialect.  Each
//! dialect gets a [`RemoteHandler`]; the [`CodebaseManager`] asks its
//! handlers in registration order and the first one that recognises the
//! payload parses it.  Receiving the payload over HTTP is someone else's
//! job.

use std::collections::BTreeMap;

use log::{debug, info};
use serde_json::Value;

use crate::runtime::GitCodebase;

/// Branch tips announced by one push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUpdate {
    /// Fetchable repository URL.
    pub url: String,
    /// Branch name → commit id.
    pub branches: BTreeMap<String, String>,
}

impl RemoteUpdate {
    /// Last path segment of the URL without its extension.
    pub fn slug(&self) -> Option<String> {
        let last = self.url.trim_end_matches('/').rsplit('/').next()?;
        let slug = last.split('.').next()?;
        Some(slug.to_string()).filter(|s| !s.is_empty())
    }
}

pub trait RemoteHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn can_handle(&self, info: &Value) -> bool;

    fn parse(&self, info: &Value) -> Option<RemoteUpdate>;
}

/// `true` when `host` follows at least one non-whitespace character.
fn mentions_host(url: &str, host: &str) -> bool {
    url.find(host)
        .is_some_and(|pos| url[..pos].chars().last().is_some_and(|c| !c.is_whitespace()))
}

pub struct GithubHandler;

impl RemoteHandler for GithubHandler {
    fn name(&self) -> &'static str {
        "github"
    }

    fn can_handle(&self, info: &Value) -> bool {
        info["repository"]["url"]
            .as_str()
            .is_some_and(|url| mentions_host(url, "github.com"))
    }

    fn parse(&self, info: &Value) -> Option<RemoteUpdate> {
        let branch = info["ref"].as_str()?.strip_prefix("refs/heads/")?;
        let last_commit = info["commits"].as_array()?.last()?;
        let commit = last_commit["id"].as_str()?;
        let url = info["repository"]["url"].as_str()?;

        let mut branches = BTreeMap::new();
        branches.insert(branch.to_string(), commit.to_string());
        let url = match url.strip_prefix("https://") {
            Some(rest) => format!("git://{}.git", rest),
            None => format!("{}.git", url),
        };
        Some(RemoteUpdate { url, branches })
    }
}

pub struct BitbucketHandler;

impl RemoteHandler for BitbucketHandler {
    fn name(&self) -> &'static str {
        "bitbucket"
    }

    fn can_handle(&self, info: &Value) -> bool {
        info["canon_url"]
            .as_str()
            .is_some_and(|url| mentions_host(url, "bitbucket.org"))
    }

    fn parse(&self, info: &Value) -> Option<RemoteUpdate> {
        let absolute = info["repository"]["absolute_url"].as_str()?;
        let path = match absolute.strip_suffix('/') {
            Some(trimmed) => format!("{}.git", trimmed),
            None => absolute.to_string(),
        };

        let branches = info["commits"]
            .as_array()?
            .iter()
            .filter_map(|commit| {
                Some((
                    commit["branch"].as_str()?.to_string(),
                    commit["raw_node"].as_str()?.to_string(),
                ))
            })
            .collect();
        Some(RemoteUpdate {
            url: format!("git://bitbucket.org{}", path),
            branches,
        })
    }
}

/// Ordered registry of notification handlers.
#[derive(Default)]
pub struct CodebaseManager {
    handlers: Vec<Box<dyn RemoteHandler>>,
}

impl CodebaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in GitHub and Bitbucket handlers.
    pub fn with_default_handlers() -> Self {
        let mut manager = Self::new();
        manager.add_handler(Box::new(GithubHandler));
        manager.add_handler(Box::new(BitbucketHandler));
        manager
    }

    pub fn add_handler(&mut self, handler: Box<dyn RemoteHandler>) {
        self.handlers.push(handler);
    }

    /// Parse with the first handler that claims the payload.
    ///
    /// Later handlers are not consulted even if the first match fails to
    /// parse.
    pub fn parse_update(&self, info: &Value) -> Option<RemoteUpdate> {
        let handler = self.handlers.iter().find(|h| h.can_handle(info))?;
        debug!("Push notification claimed by the {} handler", handler.name());
        handler.parse(info)
    }

    /// Fetch whatever `info` announces. Returns `false` for payloads no
    /// handler understands.
    pub async fn apply(&self, info: &Value, codebase: &GitCodebase) -> anyhow::Result<bool> {
        let Some(update) = self.parse_update(info) else {
            debug!("Ignoring unrecognised push notification");
            return Ok(false);
        };
        info!("Fetching {:?} from {}", update.branches, update.url);
        codebase.apply_update(&update).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn github_push() -> Value {
        json!({
            "before": "aaa",
            "after": "ccc",
            "commits": [
                { "id": "bbb", "message": "fix a" },
                { "id": "ccc", "message": "fix b" }
            ],
            "ref": "refs/heads/master",
            "repository": { "url": "https://github.com/jankuca/reparto", "name": "reparto" }
        })
    }

    fn bitbucket_push() -> Value {
        json!({
            "canon_url": "https://bitbucket.org",
            "commits": [
                { "branch": "master", "node": "bbb", "raw_node": "bbb111" },
                { "branch": "hotfix", "node": "ccc", "raw_node": "ccc111" }
            ],
            "repository": { "absolute_url": "/jankuca/reparto/", "slug": "reparto" },
            "user": "jankuca"
        })
    }

    #[test]
    fn github_push_parses_last_commit_of_branch() {
        let handler = GithubHandler;
        assert!(handler.can_handle(&github_push()));
        assert!(!handler.can_handle(&bitbucket_push()));

        let update = handler.parse(&github_push()).unwrap();
        assert_eq!(update.url, "git://github.com/jankuca/reparto.git");
        assert_eq!(update.branches.get("master").map(String::as_str), Some("ccc"));
        assert_eq!(update.slug().as_deref(), Some("reparto"));
    }

    #[test]
    fn github_tag_push_is_not_an_update() {
        let mut info = github_push();
        info["ref"] = json!("refs/tags/v1");
        assert_eq!(GithubHandler.parse(&info), None);
    }

    #[test]
    fn bitbucket_push_maps_each_branch() {
        let handler = BitbucketHandler;
        assert!(handler.can_handle(&bitbucket_push()));

        let update = handler.parse(&bitbucket_push()).unwrap();
        assert_eq!(update.url, "git://bitbucket.org/jankuca/reparto.git");
        assert_eq!(update.branches.len(), 2);
        assert_eq!(update.branches["master"], "bbb111");
        assert_eq!(update.branches["hotfix"], "ccc111");
    }

    struct Greedy;

    impl RemoteHandler for Greedy {
        fn name(&self) -> &'static str {
            "greedy"
        }

        fn can_handle(&self, _info: &Value) -> bool {
            true
        }

        fn parse(&self, _info: &Value) -> Option<RemoteUpdate> {
            Some(RemoteUpdate {
                url: "git://example.com/greedy.git".into(),
                branches: BTreeMap::new(),
            })
        }
    }

    #[test]
    fn first_matching_handler_wins() {
        let mut manager = CodebaseManager::with_default_handlers();
        manager.add_handler(Box::new(Greedy));
        let update = manager.parse_update(&github_push()).unwrap();
        assert_eq!(update.url, "git://github.com/jankuca/reparto.git");

        let mut greedy_first = CodebaseManager::new();
        greedy_first.add_handler(Box::new(Greedy));
        greedy_first.add_handler(Box::new(GithubHandler));
        let update = greedy_first.parse_update(&github_push()).unwrap();
        assert_eq!(update.url, "git://example.com/greedy.git");
    }

    #[test]
    fn unknown_payload_yields_nothing() {
        let manager = CodebaseManager::with_default_handlers();
        assert_eq!(manager.parse_update(&json!({"hello": "world"})), None);
    }

    #[tokio::test]
    async fn unrecognised_notification_touches_nothing() {
        let root = std::env::temp_dir().join("reparto-remote-apply-test");
        let codebase = GitCodebase::new(root.clone(), "master");
        let manager = CodebaseManager::with_default_handlers();
        assert!(!manager.apply(&json!({"zen": "hi"}), &codebase).await.unwrap());
        assert!(!root.exists());
    }
}
