//! Smart HTTP transport for git pack services.
//!
//! This crate sits between an HTTP server and the native `git-upload-pack`
//! and `git-receive-pack` binaries. It buffers and decodes the request body,
//! recovers ref and commit metadata from the negotiation lines, lets the
//! embedder accept or reject the request, and frames the response as
//! pkt-lines with a single terminating flush.
//!
//! ## Flow
//!
//! ```text
//! request body ─▶ decode ─▶ buffer to content-length ─┬─▶ negotiation parser ─▶ Header events
//!                                                     └─▶ held until accept ─▶ pack binary stdin
//!
//! accept():  pack binary stdout ─▶ ResponseStream ─▶ HTTP response
//! reject():  report-status on sideband 1 ─▶ ResponseStream ─▶ HTTP response
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use gitgate_git::{RequestHeaders, ServiceKind, ServiceRequest, ServiceSession, SessionConfig};
//!
//! # use futures::Stream;
//! # async fn serve(
//! #     body: impl Stream<Item = Result<bytes::Bytes, std::io::Error>> + Unpin,
//! # ) -> gitgate_git::Result<()> {
//! let (sink, _client) = tokio::io::duplex(64 * 1024);
//! let request = ServiceRequest {
//!     repo: "project.git".into(),
//!     kind: ServiceKind::ReceivePack,
//!     cwd: "/srv/git/project.git".into(),
//!     headers: RequestHeaders::from_pairs([("content-length", "178")]),
//! };
//! let (mut session, _events) = ServiceSession::new(request, sink, SessionConfig::default());
//!
//! if session.ingest(body).await? {
//!     if session.branch() == Some("main") {
//!         session.reject("main is protected").await?;
//!     } else {
//!         session.accept();
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod advertise;
mod error;
mod negotiation;
mod pktline;
mod request;
mod response;
mod service;
mod session;

pub use advertise::advertise_refs;
pub use error::GitError;
pub use negotiation::{parse_negotiation, Action, Negotiation, RefKind, RefUpdate};
pub use pktline::{
    is_flush_chunk, pkt_line, Band, PktLine, PktLineReader, PktLineWriter, FLUSH_PKT,
    MAX_DATA_LEN,
};
pub use request::{BodyBuffer, ContentEncoding, RequestHeaders};
pub use response::{rejection_report, ResponseStream};
pub use service::{GitCommand, ServiceKind};
pub use session::{
    LaunchHandle, ServiceRequest, ServiceSession, SessionConfig, SessionEvent, SessionEvents,
    SessionStatus,
};

/// Result type for git transport operations.
pub type Result<T> = std::result::Result<T, GitError>;
