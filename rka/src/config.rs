//! Attacher configuration.
//!
//! Every reconciliation option also accepts an `--attacher-` prefixed alias
//! so several sidecars can share one command line.  Durations use humantime
//! syntax (`15s`, `10m`).

use std::time::Duration;

use clap::Args;
use libcsi::DEFAULT_CSI_ADDRESS;

use crate::error::{AttacherError, Result};

#[derive(Args, Debug, Clone, PartialEq)]
pub struct AttacherConfig {
    /// Address of the CSI driver socket
    #[arg(long, alias = "attacher-csi-address", value_name = "ADDRESS", default_value = DEFAULT_CSI_ADDRESS)]
    pub csi_address: String,

    /// Number of VolumeAttachment and of PersistentVolume workers
    #[arg(long, alias = "attacher-worker-threads", default_value_t = 10)]
    pub worker_threads: usize,

    /// Timeout of a single CSI call
    #[arg(long, alias = "attacher-timeout", default_value = "15s", value_parser = humantime::parse_duration)]
    pub timeout: Duration,

    /// Interval at which every known object is queued again
    #[arg(long, alias = "attacher-resync", default_value = "10m", value_parser = humantime::parse_duration)]
    pub resync: Duration,

    /// Interval between sweeps comparing attachments with the driver
    #[arg(long, alias = "attacher-reconcile-sync", default_value = "1m", value_parser = humantime::parse_duration)]
    pub reconcile_sync: Duration,

    /// Initial delay before retrying a failed object
    #[arg(long, alias = "attacher-retry-interval-start", default_value = "1s", value_parser = humantime::parse_duration)]
    pub retry_interval_start: Duration,

    /// Upper bound of the retry delay
    #[arg(long, alias = "attacher-retry-interval-max", default_value = "5m", value_parser = humantime::parse_duration)]
    pub retry_interval_max: Duration,

    /// Page size of ListVolumes calls; 0 lets the driver decide
    #[arg(long, alias = "attacher-max-entries", default_value_t = 0)]
    pub max_entries: i32,

    /// Maximum length of logged CSI payloads; -1 logs them whole
    #[arg(long, alias = "attacher-max-grpc-log-length", default_value_t = -1, allow_negative_numbers = true)]
    pub max_grpc_log_length: i64,

    /// Filesystem used when a PersistentVolume names none (default ext4)
    #[arg(long, alias = "attacher-default-fstype", value_name = "FSTYPE", default_value = "")]
    pub default_fstype: String,
}

impl Default for AttacherConfig {
    fn default() -> Self {
        Self {
            csi_address: DEFAULT_CSI_ADDRESS.to_owned(),
            worker_threads: 10,
            timeout: Duration::from_secs(15),
            resync: Duration::from_secs(600),
            reconcile_sync: Duration::from_secs(60),
            retry_interval_start: Duration::from_secs(1),
            retry_interval_max: Duration::from_secs(300),
            max_entries: 0,
            max_grpc_log_length: -1,
            default_fstype: String::new(),
        }
    }
}

impl AttacherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(AttacherError::Config(
                "worker-threads must be greater than zero".into(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(AttacherError::Config("timeout must be greater than zero".into()));
        }
        if self.retry_interval_start > self.retry_interval_max {
            return Err(AttacherError::Config(format!(
                "retry-interval-start ({:?}) exceeds retry-interval-max ({:?})",
                self.retry_interval_start, self.retry_interval_max
            )));
        }
        if self.max_entries < 0 {
            return Err(AttacherError::Config("max-entries must not be negative".into()));
        }
        if self.max_grpc_log_length < -1 {
            return Err(AttacherError::Config(
                "max-grpc-log-length must be -1 or greater".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct LeaderElectionConfig {
    /// Run only while holding the leader Lease
    #[arg(long = "leader-election")]
    pub enabled: bool,

    /// Namespace of the leader Lease (default: $POD_NAMESPACE or "default")
    #[arg(long = "leader-election-namespace", value_name = "NAMESPACE")]
    pub namespace: Option<String>,

    /// How long a Lease is valid without renewal
    #[arg(long = "leader-election-lease-duration", default_value = "15s", value_parser = humantime::parse_duration)]
    pub lease_duration: Duration,

    /// How long after each renewal the leader renews the Lease again
    #[arg(long = "leader-election-renew-deadline", default_value = "10s", value_parser = humantime::parse_duration)]
    pub renew_deadline: Duration,

    /// Interval between attempts to set up the Lease while the API is unreachable
    #[arg(long = "leader-election-retry-period", default_value = "5s", value_parser = humantime::parse_duration)]
    pub retry_period: Duration,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            namespace: None,
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(5),
        }
    }
}

impl LeaderElectionConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.retry_period.is_zero() {
            return Err(AttacherError::Config(
                "leader-election-retry-period must be greater than zero".into(),
            ));
        }
        if self.renew_deadline >= self.lease_duration {
            return Err(AttacherError::Config(
                "leader-election-renew-deadline must be shorter than the lease duration".into(),
            ));
        }
        if self.retry_period >= self.renew_deadline {
            return Err(AttacherError::Config(
                "leader-election-retry-period must be shorter than the renew deadline".into(),
            ));
        }
        Ok(())
    }

    /// Lease namespace: the flag, then `$POD_NAMESPACE`, then `default`.
    pub fn namespace(&self) -> String {
        self.namespace
            .clone()
            .or_else(|| std::env::var("POD_NAMESPACE").ok())
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| "default".to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(AttacherConfig::default().validate().is_ok());
        assert!(LeaderElectionConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_invalid_values() {
        let invalid = [
            AttacherConfig {
                worker_threads: 0,
                ..Default::default()
            },
            AttacherConfig {
                timeout: Duration::ZERO,
                ..Default::default()
            },
            AttacherConfig {
                retry_interval_start: Duration::from_secs(10),
                retry_interval_max: Duration::from_secs(1),
                ..Default::default()
            },
            AttacherConfig {
                max_grpc_log_length: -2,
                ..Default::default()
            },
            AttacherConfig {
                max_entries: -1,
                ..Default::default()
            },
        ];
        for config in invalid {
            assert!(
                matches!(config.validate(), Err(AttacherError::Config(_))),
                "{config:?} should be rejected"
            );
        }
    }

    #[test]
    fn leader_election_timings_are_ordered() {
        let config = LeaderElectionConfig {
            enabled: true,
            renew_deadline: Duration::from_secs(20),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let disabled = LeaderElectionConfig {
            enabled: false,
            ..config
        };
        assert!(disabled.validate().is_ok());
    }

    #[test]
    fn explicit_lease_namespace_wins() {
        let config = LeaderElectionConfig {
            namespace: Some("kube-system".into()),
            ..Default::default()
        };
        assert_eq!(config.namespace(), "kube-system");
    }
}
