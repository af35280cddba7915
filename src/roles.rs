//! Role → app resolution.

use log::warn;
use serde_json::Value;

use crate::runtime::ConfigStore;

pub const ROLES_COLLECTION: &str = "roles";

fn apps_of(role: &Value) -> Vec<String> {
    role["apps"]
        .as_array()
        .map(|apps| {
            apps.iter()
                .filter_map(|app| app.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Concatenate the app lists of `roles`, in role order, without dedup.
///
/// A role that is unknown or whose lookup fails contributes nothing.
pub async fn resolve_roles(store: &dyn ConfigStore, roles: &[String]) -> Vec<String> {
    let mut apps = Vec::new();
    for role in roles {
        match store.get(ROLES_COLLECTION, role).await {
            Ok(Some(value)) => apps.extend(apps_of(&value)),
            Ok(None) => warn!("Unknown role {}", role),
            Err(e) => warn!("Failed to look up role {}: {}", role, e),
        }
    }
    apps
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;

    struct MockStore {
        roles: HashMap<String, Value>,
        failing: Vec<String>,
    }

    #[async_trait]
    impl ConfigStore for MockStore {
        async fn get(&self, collection: &str, key: &str) -> anyhow::Result<Option<Value>> {
            assert_eq!(collection, ROLES_COLLECTION);
            if self.failing.iter().any(|k| k == key) {
                anyhow::bail!("store unavailable");
            }
            Ok(self.roles.get(key).cloned())
        }
    }

    fn store() -> MockStore {
        let mut roles = HashMap::new();
        roles.insert("abc".to_string(), json!({"_id": "abc", "apps": ["api", "web"]}));
        roles.insert("efg".to_string(), json!({"_id": "efg", "apps": ["web", "worker"]}));
        roles.insert("bare".to_string(), json!({"_id": "bare"}));
        MockStore {
            roles,
            failing: vec!["broken".to_string()],
        }
    }

    #[tokio::test]
    async fn concatenates_in_role_order_without_dedup() {
        let apps = resolve_roles(&store(), &["abc".into(), "efg".into()]).await;
        assert_eq!(apps, vec!["api", "web", "web", "worker"]);
    }

    #[tokio::test]
    async fn failed_and_unknown_roles_contribute_nothing() {
        let apps = resolve_roles(
            &store(),
            &["broken".into(), "missing".into(), "bare".into(), "efg".into()],
        )
        .await;
        assert_eq!(apps, vec!["web", "worker"]);
    }

    #[tokio::test]
    async fn no_roles_means_no_apps() {
        assert!(resolve_roles(&store(), &[]).await.is_empty());
    }
}
