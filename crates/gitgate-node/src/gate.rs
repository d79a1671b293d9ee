//! Access decisions for pack service requests.
//!
//! A [`Gatekeeper`] sees what a session parsed from the request and answers
//! before any pack binary runs.

use crate::config::Config;
use gitgate_git::{Action, ServiceKind, ServiceSession};
use std::collections::HashSet;

/// What the gatekeeper knows about a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRequest<'a> {
    /// Repository identifier.
    pub repo: &'a str,
    /// Requested service.
    pub kind: ServiceKind,
    /// Action of the last parsed negotiation record.
    pub action: Option<Action>,
    /// Username from Basic credentials.
    pub username: Option<&'a str>,
    /// Last updated ref, for pushes.
    pub reference: Option<&'a str>,
}

impl<'a> AccessRequest<'a> {
    /// Collects the request view of a buffered session.
    pub fn from_session<W>(session: &'a ServiceSession<W>) -> Self
    where
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            repo: session.repo(),
            kind: session.kind(),
            action: session.action(),
            username: session.username(),
            reference: session.reference(),
        }
    }

    /// Returns true for receive-pack requests.
    pub fn is_push(&self) -> bool {
        self.kind == ServiceKind::ReceivePack
    }
}

/// Outcome of an access check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Run the pack binary.
    Accept,
    /// Answer with a report-status carrying this message.
    Reject(String),
}

/// Decides whether a request may proceed.
pub trait Gatekeeper: Send + Sync {
    /// Decides on `request`.
    fn decide(&self, request: &AccessRequest<'_>) -> Decision;
}

/// Gatekeeper driven by the node configuration.
///
/// Fetches are always accepted. Pushes are rejected when the node is
/// read-only or when an allowlist is set and the user is not on it.
#[derive(Debug, Clone, Default)]
pub struct PolicyGate {
    read_only: bool,
    push_allowlist: HashSet<String>,
}

impl PolicyGate {
    /// Creates the gate from configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            read_only: config.read_only,
            push_allowlist: config.push_allowlist.iter().cloned().collect(),
        }
    }
}

impl Gatekeeper for PolicyGate {
    fn decide(&self, request: &AccessRequest<'_>) -> Decision {
        if !request.is_push() {
            return Decision::Accept;
        }
        if self.read_only {
            return Decision::Reject("repository is read-only".to_string());
        }
        if !self.push_allowlist.is_empty() {
            let allowed = request
                .username
                .is_some_and(|user| self.push_allowlist.contains(user));
            if !allowed {
                return Decision::Reject(format!(
                    "user {} may not push",
                    request.username.unwrap_or("anonymous")
                ));
            }
        }
        Decision::Accept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(username: Option<&str>) -> AccessRequest<'_> {
        AccessRequest {
            repo: "project.git",
            kind: ServiceKind::ReceivePack,
            action: Some(Action::Push),
            username,
            reference: Some("refs/heads/main"),
        }
    }

    fn fetch() -> AccessRequest<'static> {
        AccessRequest {
            repo: "project.git",
            kind: ServiceKind::UploadPack,
            action: Some(Action::Fetch),
            username: None,
            reference: None,
        }
    }

    #[test]
    fn test_default_gate_accepts_everything() {
        let gate = PolicyGate::default();
        assert_eq!(gate.decide(&fetch()), Decision::Accept);
        assert_eq!(gate.decide(&push(None)), Decision::Accept);
    }

    #[test]
    fn test_read_only_rejects_pushes() {
        let gate = PolicyGate::from_config(&Config {
            read_only: true,
            ..Default::default()
        });
        assert_eq!(gate.decide(&fetch()), Decision::Accept);
        assert_eq!(
            gate.decide(&push(Some("alice"))),
            Decision::Reject("repository is read-only".to_string())
        );
    }

    #[test]
    fn test_allowlist() {
        let gate = PolicyGate::from_config(&Config {
            push_allowlist: vec!["alice".to_string()],
            ..Default::default()
        });
        assert_eq!(gate.decide(&push(Some("alice"))), Decision::Accept);
        assert_eq!(
            gate.decide(&push(Some("mallory"))),
            Decision::Reject("user mallory may not push".to_string())
        );
        assert_eq!(
            gate.decide(&push(None)),
            Decision::Reject("user anonymous may not push".to_string())
        );
        assert_eq!(gate.decide(&fetch()), Decision::Accept);
    }
}
