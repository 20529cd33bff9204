//! Device encryption status query.

use crate::config::ToolConfig;
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, warn};

/// Asks the info tool whether the device will encrypt its backups.
#[derive(Debug, Clone)]
pub struct EncryptionProbe {
    tool: ToolConfig,
    timeout: Duration,
}

impl EncryptionProbe {
    pub fn new(tool: ToolConfig, timeout: Duration) -> Self {
        Self { tool, timeout }
    }

    /// Arguments for the `WillEncrypt` query.
    pub fn query_args(device_id: &str) -> Vec<String> {
        vec![
            "-u".to_string(),
            device_id.to_string(),
            "-k".to_string(),
            "WillEncrypt".to_string(),
        ]
    }

    /// Returns `true` only if the device reports it will encrypt.
    ///
    /// Any failure to run the query resolves to `false`: not being able to
    /// ask must not block a backup attempt.
    pub async fn check(&self, device_id: &str) -> bool {
        let mut command = self.tool.command();
        command
            .args(Self::query_args(device_id))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!("Encryption status query failed to run {}: {}", self.tool.program, e);
                return false;
            }
            Err(_) => {
                warn!("Encryption status query timed out after {:?}", self.timeout);
                return false;
            }
        };

        if !output.status.success() {
            warn!("Encryption status query exited with {}", output.status);
            return false;
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let will_encrypt = parse_flag(&stdout);
        debug!("Device {} WillEncrypt={}", device_id, will_encrypt);
        will_encrypt
    }
}

/// Reads a boolean answer from the tool's output.
pub fn parse_flag(output: &str) -> bool {
    matches!(
        output.trim().to_ascii_lowercase().as_str(),
        "true" | "yes" | "1"
    )
}
