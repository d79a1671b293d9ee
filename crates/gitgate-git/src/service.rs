//! Pack services and the commands that run them.

use crate::GitError;
use std::ffi::OsString;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tokio::process::Command;

/// A smart HTTP pack service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    /// `git-upload-pack`: fetch and clone.
    UploadPack,
    /// `git-receive-pack`: push.
    ReceivePack,
}

impl ServiceKind {
    /// Service name without the `git-` prefix.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UploadPack => "upload-pack",
            Self::ReceivePack => "receive-pack",
        }
    }

    /// Service name as it appears in URLs and advertisements.
    pub fn git_name(&self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
        }
    }

    /// Content type of a service response.
    pub fn result_content_type(&self) -> String {
        format!("application/x-{}-result", self.git_name())
    }

    /// Content type of a ref advertisement.
    pub fn advertisement_content_type(&self) -> String {
        format!("application/x-{}-advertisement", self.git_name())
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = GitError;

    /// Accepts both `upload-pack` and `git-upload-pack` spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix("git-").unwrap_or(s) {
            "upload-pack" => Ok(Self::UploadPack),
            "receive-pack" => Ok(Self::ReceivePack),
            _ => Err(GitError::UnknownService(s.to_string())),
        }
    }
}

/// Builds pack binary invocations.
///
/// With an empty prefix the platform binary is used: `git-<service>` on
/// Unix-likes and `git <service>` on Windows. A non-empty prefix replaces the
/// program and is followed by the service name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitCommand {
    prefix: Vec<String>,
}

impl GitCommand {
    /// Creates a builder from an argv prefix.
    pub fn new(prefix: Vec<String>) -> Self {
        Self { prefix }
    }

    /// Full argv for `service` with `flags` followed by the repository path.
    pub fn argv(&self, service: ServiceKind, flags: &[&str], dir: &Path) -> Vec<OsString> {
        let mut argv: Vec<OsString> = if self.prefix.is_empty() {
            if cfg!(windows) {
                vec!["git".into(), service.as_str().into()]
            } else {
                vec![service.git_name().into()]
            }
        } else {
            self.prefix
                .iter()
                .map(OsString::from)
                .chain(std::iter::once(service.as_str().into()))
                .collect()
        };
        argv.extend(flags.iter().map(OsString::from));
        argv.push(dir.as_os_str().to_owned());
        argv
    }

    /// The `--stateless-rpc` command serving one request.
    pub fn stateless_rpc(&self, service: ServiceKind, dir: &Path) -> (Command, String) {
        self.build(self.argv(service, &["--stateless-rpc"], dir))
    }

    /// The command printing the ref advertisement.
    pub fn advertise_refs(&self, service: ServiceKind, dir: &Path) -> (Command, String) {
        self.build(self.argv(service, &["--stateless-rpc", "--advertise-refs"], dir))
    }

    fn build(&self, argv: Vec<OsString>) -> (Command, String) {
        let line = argv
            .iter()
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        (cmd, line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_kind_parse() {
        assert_eq!(
            "upload-pack".parse::<ServiceKind>().unwrap(),
            ServiceKind::UploadPack
        );
        assert_eq!(
            "git-receive-pack".parse::<ServiceKind>().unwrap(),
            ServiceKind::ReceivePack
        );
        assert!(matches!(
            "git-archive".parse::<ServiceKind>(),
            Err(GitError::UnknownService(_))
        ));
    }

    #[test]
    fn test_content_types() {
        assert_eq!(
            ServiceKind::UploadPack.result_content_type(),
            "application/x-git-upload-pack-result"
        );
        assert_eq!(
            ServiceKind::ReceivePack.advertisement_content_type(),
            "application/x-git-receive-pack-advertisement"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_platform_argv() {
        let argv = GitCommand::default().argv(
            ServiceKind::ReceivePack,
            &["--stateless-rpc"],
            Path::new("/srv/repo.git"),
        );
        assert_eq!(argv, ["git-receive-pack", "--stateless-rpc", "/srv/repo.git"]);
    }

    #[test]
    fn test_prefixed_argv() {
        let cmd = GitCommand::new(vec!["sh".into(), "fake-git.sh".into()]);
        let (_, line) = cmd.advertise_refs(ServiceKind::UploadPack, Path::new("repo"));
        assert_eq!(
            line,
            "sh fake-git.sh upload-pack --stateless-rpc --advertise-refs repo"
        );
    }
}
