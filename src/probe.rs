//! Network Probe Module
//!
//! Reads the name of the wireless network the device is attached to.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::debug;

use crate::error::ProbeError;

/// Source of the current wireless network identifier
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    /// Current network identifier, `None` when not attached to any
    async fn current_network_id(&self) -> Result<Option<String>, ProbeError>;
}

/// Probe backed by the platform's wireless tooling. One detection,
/// fallback tool included, finishes within `timeout`.
pub struct SystemProbe {
    timeout: Duration,
}

impl SystemProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn run(&self, program: &str, args: &[&str], deadline: Instant) -> Result<String, ProbeError> {
        let mut command = Command::new(program);
        command.args(args).kill_on_drop(true);

        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        let output = tokio::time::timeout_at(deadline, command.output())
            .await
            .map_err(|_| ProbeError::Timeout)?
            .map_err(|e| ProbeError::Io(format!("{program}: {e}")))?;

        if !output.status.success() {
            return Err(ProbeError::Io(format!("{program} exited with {}", output.status)));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    #[cfg(target_os = "windows")]
    async fn detect(&self) -> Result<Option<String>, ProbeError> {
        let deadline = Instant::now() + self.timeout;
        let output = self.run("netsh", &["wlan", "show", "interfaces"], deadline).await?;
        Ok(parse_netsh(&output))
    }

    #[cfg(target_os = "macos")]
    async fn detect(&self) -> Result<Option<String>, ProbeError> {
        const AIRPORT: &str = "/System/Library/PrivateFrameworks/Apple80211.framework/Versions/Current/Resources/airport";
        let deadline = Instant::now() + self.timeout;
        let output = self.run(AIRPORT, &["-I"], deadline).await?;
        Ok(parse_airport(&output))
    }

    #[cfg(target_os = "linux")]
    async fn detect(&self) -> Result<Option<String>, ProbeError> {
        let deadline = Instant::now() + self.timeout;
        with_fallback(
            self.timeout,
            async move {
                self.run("nmcli", &["-t", "-f", "active,ssid", "dev", "wifi"], deadline)
                    .await
                    .map(|output| parse_nmcli(&output))
            },
            move || async move {
                self.run("iwgetid", &["-r"], deadline)
                    .await
                    .map(|output| non_empty(&output))
            },
        )
        .await
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    async fn detect(&self) -> Result<Option<String>, ProbeError> {
        Err(ProbeError::Unsupported)
    }
}

#[async_trait]
impl NetworkProbe for SystemProbe {
    async fn current_network_id(&self) -> Result<Option<String>, ProbeError> {
        self.detect().await
    }
}

/// Try `primary` for half of `budget`, then `fallback` until the budget runs out
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
async fn with_fallback<P, F, Fut>(budget: Duration, primary: P, fallback: F) -> Result<Option<String>, ProbeError>
where
    P: Future<Output = Result<Option<String>, ProbeError>>,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Option<String>, ProbeError>>,
{
    let started = Instant::now();
    let deadline = started + budget;

    let first = tokio::time::timeout_at(started + budget / 2, primary)
        .await
        .unwrap_or(Err(ProbeError::Timeout));

    match first {
        Ok(found) => Ok(found),
        Err(e) => {
            debug!("Primary network tool failed, trying fallback: {}", e);
            tokio::time::timeout_at(deadline, fallback())
                .await
                .unwrap_or(Err(ProbeError::Timeout))
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
fn parse_netsh(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("SSID") && !line.starts_with("BSSID"))
        .find_map(|line| line.split_once(':').and_then(|(_, ssid)| non_empty(ssid)))
}

#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn parse_airport(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("SSID:"))
        .find_map(|line| line.split_once(':').and_then(|(_, ssid)| non_empty(ssid)))
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_nmcli(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.strip_prefix("yes:").and_then(non_empty))
}
