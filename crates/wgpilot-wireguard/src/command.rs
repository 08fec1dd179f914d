//! [`InterfaceController`] backed by the `wg` and `wg-quick` tools.
//!
//! Peer-set changes go through `wg syncconf` on a stripped config so the
//! interface is never taken down. Every process runs under a timeout, and
//! mutations hold a lock so only one privileged invocation is in flight.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::PeerConfig;
use crate::error::{Result, WireGuardError};
use crate::interface::{
    DEFAULT_HANDSHAKE_WINDOW, IdentityInfo, InterfaceController, is_online, unix_now,
};
use crate::keys::PublicKey;
use crate::types::{AllowedIp, LiveStat, LiveStats};

/// Settings for [`CommandInterface`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInterfaceConfig {
    /// WireGuard interface name, e.g. `wg0`.
    pub interface: String,
    /// Canonical server config path, e.g. `/etc/wireguard/wg0.conf`.
    pub config_path: PathBuf,
    /// Bound on every external process.
    pub command_timeout: Duration,
    /// A handshake younger than this counts as online.
    pub handshake_window: Duration,
    /// `wg` binary.
    pub wg_bin: PathBuf,
    /// `wg-quick` binary.
    pub wg_quick_bin: PathBuf,
    /// `ip` binary.
    pub ip_bin: PathBuf,
}

impl CommandInterfaceConfig {
    /// Creates settings for `interface` with its config at `config_path`.
    #[must_use]
    pub fn new(interface: impl Into<String>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            interface: interface.into(),
            config_path: config_path.into(),
            command_timeout: Duration::from_secs(10),
            handshake_window: DEFAULT_HANDSHAKE_WINDOW,
            wg_bin: PathBuf::from("wg"),
            wg_quick_bin: PathBuf::from("wg-quick"),
            ip_bin: PathBuf::from("ip"),
        }
    }

    /// Sets the per-process timeout.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Sets the handshake recency window.
    #[must_use]
    pub fn with_handshake_window(mut self, window: Duration) -> Self {
        self.handshake_window = window;
        self
    }
}

/// Drives the local interface through external commands.
#[derive(Debug)]
pub struct CommandInterface {
    config: CommandInterfaceConfig,
    mutation: Mutex<()>,
}

impl CommandInterface {
    /// Creates a controller.
    #[must_use]
    pub fn new(config: CommandInterfaceConfig) -> Self {
        Self {
            config,
            mutation: Mutex::new(()),
        }
    }

    /// Returns the settings.
    #[must_use]
    pub fn config(&self) -> &CommandInterfaceConfig {
        &self.config
    }

    /// Runs `program args`, optionally feeding `stdin`, and returns stdout.
    ///
    /// Failures are built with `fail` so callers pick the error kind.
    async fn run(
        &self,
        program: &Path,
        args: &[&str],
        stdin: Option<&[u8]>,
        fail: fn(String) -> WireGuardError,
    ) -> Result<String> {
        let label = format!("{} {}", program.display(), args.first().copied().unwrap_or_default());
        debug!(command = %label, "running");

        let invocation = async {
            let mut child = Command::new(program)
                .args(args)
                .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| fail(format!("failed to spawn {label}: {e}")))?;

            if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
                pipe.write_all(input)
                    .await
                    .map_err(|e| fail(format!("failed to write stdin of {label}: {e}")))?;
                // Dropping the pipe sends EOF.
                drop(pipe);
            }

            let output = child
                .wait_with_output()
                .await
                .map_err(|e| fail(format!("failed to wait for {label}: {e}")))?;

            if output.status.success() {
                Ok(String::from_utf8_lossy(&output.stdout).into_owned())
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(fail(format!(
                    "{label} exited with {}: {}",
                    output.status,
                    stderr.trim()
                )))
            }
        };

        tokio::time::timeout(self.config.command_timeout, invocation)
            .await
            .map_err(|_| WireGuardError::Timeout {
                operation: label.clone(),
                after: self.config.command_timeout,
            })?
    }

    async fn write_config_file(&self, text: &str) -> Result<()> {
        let path = &self.config.config_path;
        let persist = |e: std::io::Error| {
            WireGuardError::ConfigPersistence(format!("{}: {e}", path.display()))
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(persist)?;
        }

        let tmp = path.with_extension("conf.tmp");
        tokio::fs::write(&tmp, text).await.map_err(persist)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(persist)?;
        }
        tokio::fs::rename(&tmp, path).await.map_err(persist)?;
        debug!(path = %path.display(), "server config written");
        Ok(())
    }
}

impl InterfaceController for CommandInterface {
    async fn apply_server_config(&self, config: &str) -> Result<()> {
        let _guard = self.mutation.lock().await;
        self.write_config_file(config).await?;

        let path = self.config.config_path.to_string_lossy().into_owned();
        let stripped = self
            .run(
                &self.config.wg_quick_bin,
                &["strip", path.as_str()],
                None,
                WireGuardError::InterfaceApply,
            )
            .await?;
        self.run(
            &self.config.wg_bin,
            &["syncconf", self.config.interface.as_str(), "/dev/stdin"],
            Some(stripped.as_bytes()),
            WireGuardError::InterfaceApply,
        )
        .await?;

        info!(interface = %self.config.interface, "peer set synchronized");
        Ok(())
    }

    async fn write_server_config(&self, config: &str) -> Result<()> {
        let _guard = self.mutation.lock().await;
        self.write_config_file(config).await
    }

    async fn set_peer_enabled(&self, peer: &PeerConfig, enabled: bool) -> Result<()> {
        let _guard = self.mutation.lock().await;
        let key = peer.public_key.to_base64();
        let iface = self.config.interface.as_str();

        if enabled {
            let allowed_ips = allowed_ips_arg(&peer.allowed_ips);
            let mut args = vec![
                "set",
                iface,
                "peer",
                key.as_str(),
                "allowed-ips",
                allowed_ips.as_str(),
            ];
            // The preshared key travels over stdin so it never shows up in `ps`.
            let psk = peer.preshared_key.as_ref().map(|k| format!("{}\n", k.to_base64()));
            if psk.is_some() {
                args.extend(["preshared-key", "/dev/stdin"]);
            }
            self.run(
                &self.config.wg_bin,
                &args,
                psk.as_deref().map(str::as_bytes),
                WireGuardError::InterfaceApply,
            )
            .await?;
        } else {
            self.run(
                &self.config.wg_bin,
                &["set", iface, "peer", key.as_str(), "remove"],
                None,
                WireGuardError::InterfaceApply,
            )
            .await?;
        }

        info!(interface = %iface, public_key = %key, enabled, "peer updated on live interface");
        Ok(())
    }

    async fn query_live_stats(&self) -> Result<LiveStats> {
        let dump = self
            .run(
                &self.config.wg_bin,
                &["show", self.config.interface.as_str(), "dump"],
                None,
                WireGuardError::InterfaceQuery,
            )
            .await?;
        Ok(parse_dump(&dump, unix_now(), self.config.handshake_window))
    }

    async fn identity_info(&self) -> Result<IdentityInfo> {
        let key = self
            .run(
                &self.config.wg_bin,
                &["show", self.config.interface.as_str(), "public-key"],
                None,
                WireGuardError::InterfaceQuery,
            )
            .await?;
        let server_public_key = PublicKey::from_base64(key.trim())?;

        let routes = self
            .run(
                &self.config.ip_bin,
                &["route", "show", "default"],
                None,
                WireGuardError::InterfaceQuery,
            )
            .await?;
        let primary_interface = parse_default_route_device(&routes).ok_or_else(|| {
            WireGuardError::InterfaceQuery("no default route device found".to_string())
        })?;

        Ok(IdentityInfo {
            server_public_key,
            primary_interface,
        })
    }
}

/// Parses `wg show <iface> dump`.
///
/// The first line describes the interface itself and is skipped. Peer lines
/// carry eight tab separated fields: public key, preshared key, endpoint,
/// allowed ips, latest handshake, rx, tx, keepalive.
pub fn parse_dump(output: &str, now: u64, window: Duration) -> LiveStats {
    output
        .lines()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 7 {
                warn!(line, "skipping malformed dump line");
                return None;
            }
            let key = match PublicKey::from_base64(fields[0]) {
                Ok(key) => key,
                Err(e) => {
                    warn!(error = %e, "skipping dump line with bad public key");
                    return None;
                }
            };
            let latest_handshake = fields[4].parse().unwrap_or(0);
            let stat = LiveStat {
                online: is_online(latest_handshake, now, window),
                rx_bytes: fields[5].parse().unwrap_or(0),
                tx_bytes: fields[6].parse().unwrap_or(0),
                endpoint: (fields[2] != "(none)").then(|| fields[2].to_string()),
                latest_handshake,
            };
            Some((key, stat))
        })
        .collect()
}

/// Extracts the device from `ip route show default`, e.g. `eth0` from
/// `default via 192.0.2.1 dev eth0 proto dhcp metric 100`.
pub fn parse_default_route_device(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut words = line.split_whitespace();
        words.find(|w| *w == "dev")?;
        words.next().map(str::to_string)
    })
}

/// Joins allowed IPs the way `wg set` expects them.
#[must_use]
pub fn allowed_ips_arg(ips: &[AllowedIp]) -> String {
    ips.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
}
