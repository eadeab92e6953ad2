//! Service Controller - stop/start/query the supervised DeviceBox service.
//!
//! The engine only relies on three calls. `stop` and `start` report
//! `ServiceControlFailed` when the supervisor rejects or times out the
//! command; whether the new build actually came up is a separate question
//! answered by polling `is_active`.

use async_trait::async_trait;
use devicebox_common::config::{ServiceConfig, SupervisorKind};
use devicebox_common::UpdateError;
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[async_trait]
pub trait ServiceController: Send + Sync {
    fn name(&self) -> &str;

    async fn stop(&self) -> Result<(), UpdateError>;

    async fn start(&self) -> Result<(), UpdateError>;

    /// Errors and timeouts count as not active.
    async fn is_active(&self) -> bool;
}

/// Build the controller selected by config.
pub fn for_config(config: &ServiceConfig) -> Arc<dyn ServiceController> {
    match config.supervisor {
        SupervisorKind::Systemd => Arc::new(SystemctlController::new(
            &config.name,
            config.use_sudo,
            config.timeout(),
        )),
        SupervisorKind::None => Arc::new(NoopController::new(&config.name)),
    }
}

/// systemd via `systemctl`
#[derive(Debug, Clone)]
pub struct SystemctlController {
    unit: String,
    sudo: bool,
    timeout: Duration,
}

impl SystemctlController {
    pub fn new(unit: &str, use_sudo: bool, timeout: Duration) -> Self {
        let sudo = use_sudo && !nix::unistd::geteuid().is_root();
        Self {
            unit: unit.to_string(),
            sudo,
            timeout,
        }
    }

    async fn systemctl(&self, args: &[&str]) -> Result<Output, String> {
        let mut cmd = if self.sudo {
            let mut c = Command::new("sudo");
            c.args(["-n", "systemctl"]);
            c
        } else {
            Command::new("systemctl")
        };
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("systemctl {}", args.join(" "));
        match timeout(self.timeout, cmd.output()).await {
            Err(_) => Err(format!(
                "systemctl {} timed out after {}s",
                args.join(" "),
                self.timeout.as_secs()
            )),
            Ok(Err(e)) => Err(format!("failed to run systemctl: {}", e)),
            Ok(Ok(output)) => Ok(output),
        }
    }

    async fn run_checked(&self, args: &[&str]) -> Result<(), UpdateError> {
        let output = self
            .systemctl(args)
            .await
            .map_err(UpdateError::ServiceControlFailed)?;

        if !output.status.success() {
            return Err(UpdateError::ServiceControlFailed(format!(
                "systemctl {} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceController for SystemctlController {
    fn name(&self) -> &str {
        &self.unit
    }

    async fn stop(&self) -> Result<(), UpdateError> {
        info!("Stopping service {}", self.unit);
        self.run_checked(&["stop", &self.unit]).await
    }

    async fn start(&self) -> Result<(), UpdateError> {
        // Unit files may have changed with the new tree
        self.run_checked(&["daemon-reload"]).await?;
        info!("Starting service {}", self.unit);
        self.run_checked(&["start", &self.unit]).await
    }

    async fn is_active(&self) -> bool {
        match self.systemctl(&["is-active", &self.unit]).await {
            Ok(output) => {
                let state = String::from_utf8_lossy(&output.stdout).trim().to_string();
                debug!("{} is-active: {}", self.unit, state);
                output.status.success() && state == "active"
            }
            Err(e) => {
                warn!("Could not query {}: {}", self.unit, e);
                false
            }
        }
    }
}

/// For hosts without a supervisor. Nothing to stop; always active.
#[derive(Debug, Clone)]
pub struct NoopController {
    name: String,
}

impl NoopController {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl ServiceController for NoopController {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stop(&self) -> Result<(), UpdateError> {
        debug!("No supervisor configured; not stopping {}", self.name);
        Ok(())
    }

    async fn start(&self) -> Result<(), UpdateError> {
        debug!("No supervisor configured; not starting {}", self.name);
        Ok(())
    }

    async fn is_active(&self) -> bool {
        true
    }
}
