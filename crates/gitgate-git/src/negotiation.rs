//! Extraction of ref and commit metadata from negotiation lines.
//!
//! Only the leading negotiation of a request body is inspected. Pack data
//! that follows may contain arbitrary bytes, so matching runs over raw bytes.

use crate::service::ServiceKind;
use once_cell::sync::Lazy;
use regex::bytes::{Captures, Regex};

/// `<len><old-id> <new-id> refs/(heads|tags)/<name>` terminated by a space,
/// the next pkt-line length, or NUL.
static RECEIVE_PACK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i-u)([0-9a-f]{4})([0-9a-f]+) ([0-9a-f]+) (refs/(heads|tags)/(.*?))( |00|\x00)")
        .expect("receive-pack pattern is valid")
});

/// `<command> <object-id>` at the start of the body.
static UPLOAD_PACK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i-u)^\S+ ([0-9a-f]+)").expect("upload-pack pattern is valid")
});

/// Kind of ref a push updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    /// Under `refs/heads/`.
    Branch,
    /// Under `refs/tags/`.
    Tag,
}

/// What a request does to the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Branch update.
    Push,
    /// Tag update.
    Tag,
    /// Fetch or clone.
    Fetch,
}

impl Action {
    /// Lowercase name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Tag => "tag",
            Self::Fetch => "fetch",
        }
    }
}

/// A single ref update command of a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    /// Old object id.
    pub last: String,
    /// New object id.
    pub commit: String,
    /// Full ref name, e.g. `refs/heads/main`.
    pub reference: String,
    /// Branch or tag.
    pub kind: RefKind,
    /// Short name, e.g. `main`.
    pub name: String,
}

/// Metadata recovered from one negotiation line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Negotiation {
    /// A receive-pack ref update.
    Push(RefUpdate),
    /// An upload-pack request for one object.
    Fetch {
        /// Requested object id.
        commit: String,
    },
}

impl Negotiation {
    /// The action this record represents.
    pub fn action(&self) -> Action {
        match self {
            Self::Push(update) if update.kind == RefKind::Branch => Action::Push,
            Self::Push(_) => Action::Tag,
            Self::Fetch { .. } => Action::Fetch,
        }
    }

    /// The object id the client is pushing or fetching.
    pub fn commit(&self) -> &str {
        match self {
            Self::Push(update) => &update.commit,
            Self::Fetch { commit } => commit,
        }
    }
}

/// Parses negotiation records out of `buf` for the given service.
///
/// receive-pack bodies yield one record per matched ref update in body order.
/// upload-pack bodies yield at most one record. A body that matches nothing
/// yields an empty list.
pub fn parse_negotiation(kind: ServiceKind, buf: &[u8]) -> Vec<Negotiation> {
    match kind {
        ServiceKind::ReceivePack => RECEIVE_PACK
            .captures_iter(buf)
            .map(|caps| Negotiation::Push(ref_update(&caps)))
            .collect(),
        ServiceKind::UploadPack => UPLOAD_PACK
            .captures(buf)
            .map(|caps| Negotiation::Fetch {
                commit: text(&caps, 1),
            })
            .into_iter()
            .collect(),
    }
}

fn ref_update(caps: &Captures<'_>) -> RefUpdate {
    let kind = if caps[5].eq_ignore_ascii_case(b"heads") {
        RefKind::Branch
    } else {
        RefKind::Tag
    };

    RefUpdate {
        last: text(caps, 2),
        commit: text(caps, 3),
        reference: text(caps, 4),
        kind,
        name: text(caps, 6),
    }
}

fn text(caps: &Captures<'_>, group: usize) -> String {
    caps.get(group)
        .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
        .unwrap_or_default()
}
