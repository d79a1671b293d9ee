//! Ref advertisement for `GET info/refs`.

use crate::pktline::{PktLine, PktLineWriter};
use crate::service::{GitCommand, ServiceKind};
use crate::{GitError, Result};
use std::path::Path;
use std::process::Stdio;
use tracing::{debug, warn};

/// Produces the `info/refs` body for `service` in the repository at `dir`.
///
/// The body is the `# service=` announcement and a flush, followed by the
/// pack binary's own advertisement.
pub async fn advertise_refs(command: &GitCommand, service: ServiceKind, dir: &Path) -> Result<Vec<u8>> {
    let (mut cmd, line) = command.advertise_refs(service, dir);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = cmd.output().await.map_err(|source| GitError::Spawn {
        command: line.clone(),
        source,
    })?;

    if !output.status.success() {
        warn!(
            command = %line,
            status = ?output.status,
            stderr = %String::from_utf8_lossy(&output.stderr).trim_end(),
            "ref advertisement failed"
        );
    }
    debug!(command = %line, bytes = output.stdout.len(), "refs advertised");

    let mut writer = PktLineWriter::new(Vec::with_capacity(output.stdout.len() + 64));
    writer.write(&PktLine::from_string(&format!("# service={}\n", service.git_name())))?;
    writer.flush_pkt()?;

    let mut body = writer.into_inner();
    body.extend_from_slice(&output.stdout);
    Ok(body)
}
