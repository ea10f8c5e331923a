//! scp transport bound to a network interface.
//!
//! The rig has both wired and wireless links to the storage server. The first
//! interface in the priority list whose link is up carries the transfer. When
//! none is up the transfer is skipped with a warning and verification reports
//! every file missing.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::Transport;

const SYS_CLASS_NET: &str = "/sys/class/net";

#[derive(Debug, Clone)]
pub struct ScpTransport {
    user: String,
    host: String,
    interfaces: Vec<String>,
    net_root: PathBuf,
}

impl ScpTransport {
    pub fn new(user: String, host: String, interfaces: Vec<String>) -> Self {
        Self {
            user,
            host,
            interfaces,
            net_root: PathBuf::from(SYS_CLASS_NET),
        }
    }

    /// Read link state from `root/<iface>/operstate` instead of sysfs.
    pub fn with_net_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.net_root = root.into();
        self
    }

    fn target(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// First interface, in priority order, whose operstate is `up`.
    pub async fn select_interface(&self) -> Option<String> {
        for interface in &self.interfaces {
            let path = self.net_root.join(interface).join("operstate");
            match tokio::fs::read_to_string(&path).await {
                Ok(state) if state.trim() == "up" => return Some(interface.clone()),
                Ok(state) => debug!(%interface, state = state.trim(), "interface link not up"),
                Err(e) => debug!(%interface, "interface not available: {e}"),
            }
        }
        None
    }

    async fn ssh(&self, interface: &str, remote_command: &str) -> Result<String> {
        let output = Command::new("ssh")
            .arg("-o")
            .arg(format!("BindInterface={interface}"))
            .arg(self.target())
            .arg(remote_command)
            .output()
            .await
            .context("spawning ssh")?;
        if !output.status.success() {
            bail!(
                "ssh '{remote_command}' failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Names from `expected` that do not appear in an `ls -1` listing.
fn missing_from_listing(listing: &str, expected: &[String]) -> Vec<String> {
    let present: HashSet<&str> = listing.lines().map(str::trim).collect();
    expected
        .iter()
        .filter(|name| !present.contains(name.as_str()))
        .cloned()
        .collect()
}

fn quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', r"'\''"))
}

#[async_trait]
impl Transport for ScpTransport {
    async fn ensure_remote_dir(&self, dest: &Path) -> Result<()> {
        let Some(interface) = self.select_interface().await else {
            warn!("no connection found on interfaces {:?}", self.interfaces);
            return Ok(());
        };
        self.ssh(&interface, &format!("mkdir -p {}", quote(dest)))
            .await
            .map(|_| ())
    }

    async fn send(&self, files: &[PathBuf], dest: &Path, remove_local: bool) -> Result<()> {
        let Some(interface) = self.select_interface().await else {
            warn!(
                files = files.len(),
                "no connection found on interfaces {:?}, nothing transferred", self.interfaces
            );
            return Ok(());
        };

        let remote = format!("{}:{}/", self.target(), dest.display());
        let mut sent = 0usize;
        for file in files {
            let status = Command::new("scp")
                .arg("-o")
                .arg(format!("BindInterface={interface}"))
                .arg(file)
                .arg(&remote)
                .stdout(Stdio::null())
                .status()
                .await
                .context("spawning scp")?;
            if !status.success() {
                warn!(file = %file.display(), %status, "scp failed");
                continue;
            }
            sent += 1;
            if remove_local {
                tokio::fs::remove_file(file)
                    .await
                    .with_context(|| format!("removing {}", file.display()))?;
            }
        }
        info!(sent, total = files.len(), %interface, "scp transfer finished");
        Ok(())
    }

    async fn verify(&self, dest: &Path, names: &[String]) -> Result<Vec<String>> {
        let Some(interface) = self.select_interface().await else {
            return Ok(names.to_vec());
        };
        let listing = self.ssh(&interface, &format!("ls -1 {}", quote(dest))).await?;
        Ok(missing_from_listing(&listing, names))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_from_listing() {
        let listing = "a.jpg\nb.jpg\n";
        let missing = missing_from_listing(listing, &["a.jpg".into(), "c.jpg".into()]);
        assert_eq!(missing, vec!["c.jpg".to_string()]);
    }

    #[test]
    fn test_quote_escapes_single_quotes() {
        assert_eq!(quote(Path::new("/srv/it's")), r"'/srv/it'\''s'");
    }

    #[tokio::test]
    async fn test_no_interface_skips_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.jpg");
        tokio::fs::write(&file, b"a").await.unwrap();

        let transport = ScpTransport::new(
            "lab".into(),
            "192.0.2.1".into(),
            vec!["rig-test-missing0".into()],
        );
        assert_eq!(transport.select_interface().await, None);
        transport
            .send(&[file.clone()], Path::new("/srv/trial"), true)
            .await
            .unwrap();
        assert!(file.exists());

        let missing = transport
            .verify(Path::new("/srv/trial"), &["a.jpg".into()])
            .await
            .unwrap();
        assert_eq!(missing, vec!["a.jpg".to_string()]);
    }

    async fn net_root(states: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (interface, state) in states {
            let iface_dir = dir.path().join(interface);
            tokio::fs::create_dir_all(&iface_dir).await.unwrap();
            tokio::fs::write(iface_dir.join("operstate"), format!("{state}\n"))
                .await
                .unwrap();
        }
        dir
    }

    #[tokio::test]
    async fn test_down_interface_is_skipped_for_later_up_one() {
        let root = net_root(&[("wlan0", "down"), ("eth0", "up")]).await;
        let transport = ScpTransport::new(
            "lab".into(),
            "192.0.2.1".into(),
            vec!["wlan0".into(), "eth0".into()],
        )
        .with_net_root(root.path());
        assert_eq!(transport.select_interface().await, Some("eth0".to_string()));
    }

    #[tokio::test]
    async fn test_priority_order_among_up_interfaces() {
        let root = net_root(&[("wlan0", "up"), ("eth0", "up")]).await;
        let transport = ScpTransport::new(
            "lab".into(),
            "192.0.2.1".into(),
            vec!["wlan0".into(), "eth0".into()],
        )
        .with_net_root(root.path());
        assert_eq!(transport.select_interface().await, Some("wlan0".to_string()));
    }

    #[tokio::test]
    async fn test_no_link_up_selects_nothing() {
        let root = net_root(&[("wlan0", "down"), ("eth0", "dormant")]).await;
        let transport = ScpTransport::new(
            "lab".into(),
            "192.0.2.1".into(),
            vec!["wlan0".into(), "eth0".into(), "usb0".into()],
        )
        .with_net_root(root.path());
        assert_eq!(transport.select_interface().await, None);
    }
}
