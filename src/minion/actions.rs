//! Execution seam for node actions that touch the host system.
//!
//! Config changes and controller commands map to service restarts, config
//! reloads, and reboots. All of them funnel through [`ActionRunner`] so the
//! rest of the minion stays testable; the production implementation shells
//! out to the service supervisor.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

use crate::nodecfg::CfgAction;

/// Shell commands per action (production nodes run a `sv`-style
/// supervisor).
fn command_for(action: CfgAction) -> Option<&'static str> {
    match action {
        CfgAction::Reboot => Some("reboot"),
        CfgAction::RestartMinion => Some("sv restart e2e_minion"),
        CfgAction::RestartRouting => Some("sv restart openr"),
        CfgAction::RedoPopConfig => Some("sv restart pop_config"),
        CfgAction::RestartStatsAgent => Some("sv restart stats_agent"),
        CfgAction::RestartLogtail => Some("sv restart logtail"),
        CfgAction::RestartDhcp => Some("sv restart kea"),
        CfgAction::RestartWebui => Some("sv restart webui"),
        CfgAction::RestartUdpPingServer => Some("sv restart udp_ping_server"),
        CfgAction::RestartFluentdAgent => Some("/etc/init.d/fluent-bit restart"),
        CfgAction::RestartSnmp => Some("/etc/init.d/snmpd restart"),
        CfgAction::ReloadRsyslogConfig => Some("/etc/init.d/syslog.rsyslog restart"),
        CfgAction::ReloadDnsServers => Some("/etc/init.d/resolvconf reload"),
        CfgAction::ReloadNtpConfig => Some("/etc/init.d/chronyd restart"),
        CfgAction::ReloadSshdCaKeys | CfgAction::ReloadSshd => Some("/etc/init.d/sshd restart"),
        CfgAction::ReloadFirewall => Some("update_firewall"),
        CfgAction::SymlinkTimezone => Some("/etc/init.d/settz"),
        _ => None,
    }
}

/// Runs system-level actions. Implementations must not block the caller's
/// event loop for longer than a process spawn.
#[async_trait]
pub trait ActionRunner: Send + Sync {
    /// Execute the system side of one action. Actions with no system
    /// command (firmware patches, bus notifications) are no-ops here.
    async fn run(&self, action: CfgAction);
}

/// Production runner: shells out through the supervisor.
pub struct SystemActionRunner;

#[async_trait]
impl ActionRunner for SystemActionRunner {
    async fn run(&self, action: CfgAction) {
        let Some(cmd) = command_for(action) else {
            return;
        };
        info!(?action, cmd, "running node action");
        match tokio::process::Command::new("sh").arg("-c").arg(cmd).status().await {
            Ok(status) if status.success() => {}
            Ok(status) => error!(?action, ?status, "node action exited nonzero"),
            Err(e) => error!(?action, "node action failed to spawn: {}", e),
        }
    }
}

/// Shared runner handle.
pub type SharedActionRunner = Arc<dyn ActionRunner>;

/// Test doubles (also used by the integration harness).
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records actions instead of executing them.
    #[derive(Default)]
    pub struct RecordingRunner {
        pub actions: Mutex<Vec<CfgAction>>,
    }

    #[async_trait]
    impl ActionRunner for RecordingRunner {
        async fn run(&self, action: CfgAction) {
            if let Ok(mut actions) = self.actions.lock() {
                actions.push(action);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severe_actions_have_commands() {
        assert!(command_for(CfgAction::Reboot).is_some());
        assert!(command_for(CfgAction::RestartMinion).is_some());
        assert!(command_for(CfgAction::RestartRouting).is_some());
    }

    #[test]
    fn test_bus_only_actions_have_no_commands() {
        assert!(command_for(CfgAction::SetFwParams).is_none());
        assert!(command_for(CfgAction::UpdateLinkMetrics).is_none());
        assert!(command_for(CfgAction::SetFwStatsConfig).is_none());
        assert!(command_for(CfgAction::NoAction).is_none());
    }
}
