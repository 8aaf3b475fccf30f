//! The black-box wake capability
//!
//! Only the process with network access holds one. The shipped
//! implementation delegates the magic packet to an external program.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::devices::WakeAddress;
use crate::{Error, Result};

/// Sends the power-on signal to a device
#[async_trait]
pub trait WakeCapability: Send + Sync {
    /// Attempt to wake the device at `address`
    ///
    /// # Errors
    ///
    /// Returns `CapabilityFailed` (or an IO error) if the signal could not be sent
    async fn attempt_wake(&self, address: &WakeAddress) -> Result<()>;
}

/// Default argument template for the `wakeonlan` program
pub const DEFAULT_WAKE_ARGS: [&str; 5] = ["-i", "{host}", "-p", "{port}", "{mac}"];

/// Runs an external wake program per request
///
/// Arguments may contain `{mac}`, `{host}` and `{port}` placeholders.
#[derive(Debug, Clone)]
pub struct CommandWake {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandWake {
    /// Resolve `program` on `PATH`
    ///
    /// # Errors
    ///
    /// Returns `Config` if the program cannot be found
    pub fn new(program: &str, args: Vec<String>) -> Result<Self> {
        let program = which::which(program)
            .map_err(|e| Error::Config(format!("wake program '{program}' not found: {e}")))?;
        Ok(Self { program, args })
    }

    /// Arguments for one address
    #[must_use]
    pub fn render_args(&self, address: &WakeAddress) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{mac}", &address.mac)
                    .replace("{host}", &address.host)
                    .replace("{port}", &address.port.to_string())
            })
            .collect()
    }
}

#[async_trait]
impl WakeCapability for CommandWake {
    async fn attempt_wake(&self, address: &WakeAddress) -> Result<()> {
        let args = self.render_args(address);
        tracing::debug!(program = %self.program.display(), ?args, "running wake program");

        let output = tokio::process::Command::new(&self.program)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(Error::CapabilityFailed(format!(
            "{} exited with {}: {}",
            self.program.display(),
            output.status,
            stderr.trim()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_placeholders() {
        let wake = CommandWake {
            program: PathBuf::from("wakeonlan"),
            args: DEFAULT_WAKE_ARGS.iter().map(ToString::to_string).collect(),
        };
        let address = WakeAddress::new("AA:BB:CC:DD:EE:FF", "192.168.1.255", 7).unwrap();

        assert_eq!(
            wake.render_args(&address),
            vec!["-i", "192.168.1.255", "-p", "7", "aa:bb:cc:dd:ee:ff"]
        );
    }

    #[test]
    fn missing_program_is_config_error() {
        let err = CommandWake::new("definitely-not-a-wake-program-xyz", vec![]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_status_maps_to_result() {
        let address = WakeAddress::new("aa:bb:cc:dd:ee:ff", "10.0.0.255", 9).unwrap();

        let ok = CommandWake::new("true", vec![]).unwrap();
        assert!(ok.attempt_wake(&address).await.is_ok());

        let failing = CommandWake::new("false", vec![]).unwrap();
        let err = failing.attempt_wake(&address).await.unwrap_err();
        assert!(matches!(err, Error::CapabilityFailed(_)));
    }
}
