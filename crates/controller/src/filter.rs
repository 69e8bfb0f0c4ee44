//! Which updates are worth a reconcile.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Event;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// `(old, new) -> enqueue?`
pub type UpdatePredicate<K> = Arc<dyn Fn(&K, &K) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum UpdatePolicy {
    /// Every update is enqueued, including resync no-ops.
    Always,
    /// Enqueue when any field the sync acts on differs.
    #[default]
    Changed,
    /// Enqueue only when both `source` and `reason` differ.
    SourceAndReason,
}

#[derive(Debug, Error)]
#[error("unknown update policy {0:?} (expect always, changed or source-and-reason)")]
pub struct UnknownPolicy(String);

impl FromStr for UpdatePolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "always" => Ok(Self::Always),
            "changed" => Ok(Self::Changed),
            "source-and-reason" => Ok(Self::SourceAndReason),
            _ => Err(UnknownPolicy(s.to_string())),
        }
    }
}

impl fmt::Display for UpdatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Always => "always",
            Self::Changed => "changed",
            Self::SourceAndReason => "source-and-reason",
        };
        f.write_str(s)
    }
}

impl UpdatePolicy {
    pub fn should_enqueue(self, old: &Event, new: &Event) -> bool {
        match self {
            Self::Always => true,
            Self::Changed => {
                old.reason != new.reason
                    || old.message != new.message
                    || old.type_ != new.type_
                    || old.source != new.source
                    || old.count != new.count
                    || old.involved_object != new.involved_object
                    || old.action != new.action
            }
            Self::SourceAndReason => old.source != new.source && old.reason != new.reason,
        }
    }

    pub fn predicate(self) -> UpdatePredicate<Event> {
        Arc::new(move |old, new| self.should_enqueue(old, new))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::EventSource;

    fn ev(reason: &str, component: &str, message: &str) -> Event {
        Event {
            reason: Some(reason.into()),
            message: Some(message.into()),
            source: Some(EventSource { component: Some(component.into()), host: None }),
            ..Default::default()
        }
    }

    #[test]
    fn changed_ignores_metadata_only_updates() {
        let old = ev("Pulled", "kubelet", "pulled image");
        let mut new = old.clone();
        new.metadata.resource_version = Some("42".into());
        assert!(!UpdatePolicy::Changed.should_enqueue(&old, &new));
        assert!(UpdatePolicy::Always.should_enqueue(&old, &new));

        new.message = Some("pulled image again".into());
        assert!(UpdatePolicy::Changed.should_enqueue(&old, &new));
    }

    #[test]
    fn source_and_reason_needs_both() {
        let old = ev("Pulled", "kubelet", "m");
        assert!(!UpdatePolicy::SourceAndReason.should_enqueue(&old, &ev("Started", "kubelet", "m")));
        assert!(!UpdatePolicy::SourceAndReason.should_enqueue(&old, &ev("Pulled", "scheduler", "m")));
        assert!(UpdatePolicy::SourceAndReason.should_enqueue(&old, &ev("Started", "scheduler", "m")));
    }

    #[test]
    fn parses_names() {
        assert_eq!("changed".parse::<UpdatePolicy>().unwrap(), UpdatePolicy::Changed);
        assert_eq!("Source-And-Reason".parse::<UpdatePolicy>().unwrap(), UpdatePolicy::SourceAndReason);
        assert!("sometimes".parse::<UpdatePolicy>().is_err());
        assert_eq!(UpdatePolicy::default().to_string(), "changed");
    }
}
