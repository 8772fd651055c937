//! Hosts-file sink.
//!
//! Renders every A and AAAA record of the gossip DNS view into a guarded
//! region of a hosts file:
//!
//! ```text
//! # Begin host entries managed by <tag> - do not edit
//! 10.0.0.1	api.local etcd.local
//! # End host entries managed by <tag>
//! ```
//!
//! Everything outside the region is left byte-for-byte as it was.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::error::{DnsError, Result};
use crate::gossip_dns::{DnsView, DnsViewSnapshot};
use crate::metrics;
use crate::shutdown::Shutdown;

/// Default guard tag.
pub const DEFAULT_TAG: &str = "dnsmesh";

fn begin_marker(tag: &str) -> String {
    format!("# Begin host entries managed by {tag} - do not edit")
}

fn end_marker(tag: &str) -> String {
    format!("# End host entries managed by {tag}")
}

/// Byte offset of the line equal to `marker`, searching from `from`.
fn find_line(content: &str, marker: &str, from: usize) -> Option<(usize, usize)> {
    let mut offset = from;
    for line in content[from..].split_inclusive('\n') {
        let end = offset + line.len();
        if line.trim_end_matches(['\n', '\r']) == marker {
            return Some((offset, end));
        }
        offset = end;
    }
    None
}

/// Replace the guarded region of `existing` with entries for `addresses`.
///
/// Without a region the rendering is appended. A begin marker without an
/// end marker is refused rather than guessed at.
pub fn render(existing: &str, addresses: &BTreeMap<String, Vec<String>>, tag: &str) -> Result<String> {
    let begin = begin_marker(tag);
    let end = end_marker(tag);

    let mut region = String::new();
    region.push_str(&begin);
    region.push('\n');
    for (address, names) in addresses {
        if names.is_empty() {
            continue;
        }
        region.push_str(address);
        region.push('\t');
        region.push_str(&names.join(" "));
        region.push('\n');
    }
    region.push_str(&end);
    region.push('\n');

    let Some((begin_start, begin_end)) = find_line(existing, &begin, 0) else {
        if find_line(existing, &end, 0).is_some() {
            return Err(DnsError::HostsFile(format!(
                "found end marker without begin marker for tag {tag}"
            )));
        }
        let mut out = existing.to_string();
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&region);
        return Ok(out);
    };

    let Some((_, end_end)) = find_line(existing, &end, begin_end) else {
        return Err(DnsError::HostsFile(format!(
            "found begin marker without end marker for tag {tag}"
        )));
    };

    let mut out = String::with_capacity(existing.len() + region.len());
    out.push_str(&existing[..begin_start]);
    out.push_str(&region);
    out.push_str(&existing[end_end..]);
    Ok(out)
}

/// A hosts file with a guarded region.
#[derive(Debug, Clone)]
pub struct HostsFile {
    path: PathBuf,
    tag: String,
}

impl HostsFile {
    /// Hosts file at `path`, guarded by markers carrying `tag`.
    pub fn new(path: impl Into<PathBuf>, tag: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            tag: tag.into(),
        }
    }

    /// Path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the guarded region from a DNS snapshot.
    ///
    /// Returns whether the file was written; identical content is left alone.
    pub async fn update(&self, snapshot: &DnsViewSnapshot) -> Result<bool> {
        let existing = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        let addresses = snapshot.address_map();
        let rendered = render(&existing, &addresses, &self.tag)?;
        if rendered == existing {
            trace!(path = %self.path.display(), "hosts file unchanged");
            return Ok(false);
        }

        self.write_atomic(rendered.as_bytes()).await?;
        info!(
            path = %self.path.display(),
            addresses = addresses.len(),
            version = snapshot.version,
            "updated hosts file"
        );
        Ok(true)
    }

    /// Write to a sibling temp file, copy the original mode, then rename.
    async fn write_atomic(&self, content: &[u8]) -> Result<()> {
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| DnsError::HostsFile(format!("not a file: {}", self.path.display())))?;
        let tmp = self.path.with_file_name(format!(".{file_name}.{}.tmp", self.tag));

        tokio::fs::write(&tmp, content).await?;
        if let Ok(meta) = tokio::fs::metadata(&self.path).await {
            tokio::fs::set_permissions(&tmp, meta.permissions()).await?;
        }

        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            // Bind-mounted files (containers) cannot be replaced by rename.
            warn!(
                path = %self.path.display(),
                error = %e,
                "rename over hosts file failed, writing in place"
            );
            let _ = tokio::fs::remove_file(&tmp).await;
            tokio::fs::write(&self.path, content).await?;
        }
        Ok(())
    }
}

/// Keep the hosts file in sync with the DNS view until shutdown.
///
/// The file is only rendered when the gossip version moved; failed writes
/// are retried on the next interval.
pub async fn run_hosts_updates(
    hosts: HostsFile,
    view: Arc<DnsView>,
    interval: Duration,
    shutdown: Shutdown,
) {
    info!(
        path = %hosts.path().display(),
        interval_secs = interval.as_secs(),
        "starting hosts file updates"
    );
    let mut last_version = None;

    loop {
        if shutdown.is_shutting_down() {
            break;
        }

        let snapshot = view.snapshot();
        if last_version != Some(snapshot.version) {
            match hosts.update(&snapshot).await {
                Ok(written) => {
                    metrics::record_hosts_update(written, true);
                    last_version = Some(snapshot.version);
                }
                Err(e) => {
                    warn!(path = %hosts.path().display(), error = %e, "error updating hosts file");
                    metrics::record_hosts_update(false, false);
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.wait() => break,
        }
    }
    debug!("hosts file updates stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addresses(entries: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        entries
            .iter()
            .map(|(addr, names)| {
                (
                    addr.to_string(),
                    names.iter().map(|n| n.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_render_appends_region() {
        let out = render(
            "127.0.0.1\tlocalhost",
            &addresses(&[("10.0.0.1", &["api.local", "etcd.local"])]),
            "t",
        )
        .unwrap();
        assert_eq!(
            out,
            "127.0.0.1\tlocalhost\n\
             # Begin host entries managed by t - do not edit\n\
             10.0.0.1\tapi.local etcd.local\n\
             # End host entries managed by t\n"
        );
    }

    #[test]
    fn test_render_replaces_region_only() {
        let existing = "L1\nL2\n\
                        # Begin host entries managed by t - do not edit\n\
                        10.9.9.9\told.local\n\
                        # End host entries managed by t\n\
                        M1\n";
        let out = render(existing, &addresses(&[("10.0.0.1", &["api.local"])]), "t").unwrap();
        assert_eq!(
            out,
            "L1\nL2\n\
             # Begin host entries managed by t - do not edit\n\
             10.0.0.1\tapi.local\n\
             # End host entries managed by t\n\
             M1\n"
        );
    }

    #[test]
    fn test_render_is_stable() {
        let addrs = addresses(&[("10.0.0.1", &["api.local"])]);
        let once = render("x\n", &addrs, "t").unwrap();
        let twice = render(&once, &addrs, "t").unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_render_ignores_other_tags() {
        let existing = "# Begin host entries managed by other - do not edit\n\
                        # End host entries managed by other\n";
        let out = render(existing, &BTreeMap::new(), "t").unwrap();
        assert!(out.starts_with(existing));
    }

    #[test]
    fn test_render_refuses_unterminated_region() {
        let existing = "# Begin host entries managed by t - do not edit\n10.0.0.1\tx\n";
        assert!(matches!(
            render(existing, &BTreeMap::new(), "t"),
            Err(DnsError::HostsFile(_))
        ));
    }
}
