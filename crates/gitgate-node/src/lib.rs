//! # Gitgate Node
//!
//! HTTP server that exposes repositories over the git smart HTTP protocol.
//!
//! Every pack request is buffered and parsed by a `gitgate-git` session, then
//! handed to a [`gate::Gatekeeper`] which decides whether the pack binary runs
//! or the client receives a rejection report.
//!
//! ```text
//! GET  /{repo}/info/refs?service=git-upload-pack   ref advertisement
//! POST /{repo}/git-upload-pack                     fetch / clone
//! POST /{repo}/git-receive-pack                    push
//! GET  /health                                     liveness
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! cargo run --bin gitgate-node -- --project-root /srv/git --listen-addr 127.0.0.1:8080
//! git clone http://127.0.0.1:8080/project.git
//! ```
//!
//! ## Modules
//!
//! - [`api`] - Router and git smart HTTP handlers
//! - [`config`] - Node configuration
//! - [`gate`] - Access decisions for pushes and fetches
//! - [`observability`] - Logging and request ids

pub mod api;
pub mod config;
pub mod gate;
pub mod observability;
