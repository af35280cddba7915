//! Desired versus reported app versions.
//!
//! The coordinator's version is authoritative: the agent's report only
//! tells us where it drifted.

use std::collections::{BTreeMap, BTreeSet};

use crate::types::{present, Message, VersionMap, VersionPair};

/// Instructions computed by one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstructionSet {
    pub remove: BTreeSet<String>,
    pub install: BTreeMap<String, String>,
    pub upgrade: BTreeMap<String, String>,
}

impl InstructionSet {
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.install.is_empty() && self.upgrade.is_empty()
    }

    /// One message per non-empty bucket: install, upgrade, remove.
    pub fn messages(&self) -> Vec<Message> {
        let mut messages = Vec::new();
        if !self.install.is_empty() {
            messages.push(Message::Install {
                apps: self.install.clone(),
            });
        }
        if !self.upgrade.is_empty() {
            messages.push(Message::Upgrade {
                apps: self.upgrade.clone(),
            });
        }
        if !self.remove.is_empty() {
            messages.push(Message::Remove {
                apps: self.remove.iter().cloned().collect(),
            });
        }
        messages
    }

    /// Bundles needed for every install and upgrade.
    pub fn transfers(&self, reported: &VersionMap) -> Vec<(String, VersionPair)> {
        let installs = self
            .install
            .iter()
            .map(|(app, to)| (app.clone(), VersionPair::full(to.clone())));
        let upgrades = self.upgrade.iter().map(|(app, to)| {
            let from = reported.get(app).and_then(|v| present(v)).map(str::to_string);
            (app.clone(), VersionPair(from, to.clone()))
        });
        installs.chain(upgrades).collect()
    }
}

/// Diff the coordinator's `local` versions against an agent's `reported` ones.
///
/// Only apps the agent reported are considered; an app missing from
/// `local` is treated as having no local version.
pub fn reconcile(local: &VersionMap, reported: &VersionMap) -> InstructionSet {
    let mut set = InstructionSet::default();
    for (app, remote) in reported {
        let local = local.get(app).and_then(|v| present(v));
        match (local, present(remote)) {
            (Some(local), None) => {
                set.install.insert(app.clone(), local.to_string());
            }
            (None, Some(_)) => {
                set.remove.insert(app.clone());
            }
            (Some(local), Some(remote)) if local != remote => {
                set.upgrade.insert(app.clone(), local.to_string());
            }
            _ => {}
        }
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;

    fn versions(pairs: &[(&str, Option<&str>)]) -> VersionMap {
        pairs
            .iter()
            .map(|(app, v)| (app.to_string(), v.map(str::to_string)))
            .collect()
    }

    #[test]
    fn table_of_cases() {
        struct Case {
            local: Option<&'static str>,
            remote: Option<&'static str>,
            expected: fn(&InstructionSet) -> bool,
        }
        let cases = [
            Case {
                local: Some("aaaa"),
                remote: None,
                expected: |s| s.install.get("app").map(String::as_str) == Some("aaaa"),
            },
            Case {
                local: None,
                remote: Some("aaaa"),
                expected: |s| s.remove.contains("app") && s.install.is_empty(),
            },
            Case {
                local: Some("bbbb"),
                remote: Some("aaaa"),
                expected: |s| s.upgrade.get("app").map(String::as_str) == Some("bbbb"),
            },
            Case {
                local: Some("aaaa"),
                remote: Some("aaaa"),
                expected: |s| s.is_empty() && s.messages().is_empty(),
            },
            Case {
                local: None,
                remote: None,
                expected: InstructionSet::is_empty,
            },
        ];

        for case in cases {
            let set = reconcile(
                &versions(&[("app", case.local)]),
                &versions(&[("app", case.remote)]),
            );
            assert!(
                (case.expected)(&set),
                "local {:?} remote {:?} gave {:?}",
                case.local,
                case.remote,
                set
            );
        }
    }

    #[test]
    fn empty_string_counts_as_absent() {
        let set = reconcile(
            &versions(&[("api", Some("aaaa"))]),
            &versions(&[("api", Some(""))]),
        );
        assert_eq!(set.install.get("api").map(String::as_str), Some("aaaa"));
    }

    #[test]
    fn only_non_empty_buckets_become_messages() {
        let set = reconcile(
            &versions(&[("api", Some("aaaa")), ("web", Some("cccc"))]),
            &versions(&[("api", None), ("web", Some("cccc")), ("old", Some("dddd"))]),
        );
        let messages = set.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].kind(), "install");
        assert_eq!(messages[1].kind(), "remove");
    }

    #[test]
    fn transfers_carry_the_reported_base_for_upgrades() {
        let reported = versions(&[("api", None), ("web", Some("aaaa"))]);
        let set = reconcile(
            &versions(&[("api", Some("1111")), ("web", Some("bbbb"))]),
            &reported,
        );
        let transfers = set.transfers(&reported);
        assert_eq!(
            transfers,
            vec![
                ("api".to_string(), VersionPair::full("1111")),
                ("web".to_string(), VersionPair::delta("aaaa", "bbbb")),
            ]
        );
    }
}
