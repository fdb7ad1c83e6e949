//! Command line of the `rka` binary.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::config::{AttacherConfig, LeaderElectionConfig};
use crate::error::{AttacherError, Result};

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "rka", version, about = "External attacher for CSI drivers")]
pub struct Cli {
    #[command(flatten)]
    pub attacher: AttacherConfig,

    #[command(flatten)]
    pub leader_election: LeaderElectionConfig,

    /// Kubeconfig file; in-cluster configuration is used when absent
    #[arg(long, value_name = "FILE")]
    pub kubeconfig: Option<PathBuf>,

    /// Address serving /healthz and metrics, e.g. 0.0.0.0:8080
    #[arg(long, value_name = "ADDR")]
    pub http_endpoint: Option<SocketAddr>,

    /// Path metrics are served on
    #[arg(long, default_value = "/metrics")]
    pub metrics_path: String,

    /// Kubernetes API queries per second
    #[arg(long, default_value_t = 5.0)]
    pub kube_api_qps: f32,

    /// Kubernetes API request burst
    #[arg(long, default_value_t = 10)]
    pub kube_api_burst: u32,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    pub log_format: LogFormat,
}

impl Cli {
    pub fn validate(&self) -> Result<()> {
        self.attacher.validate()?;
        self.leader_election.validate()?;
        if !(self.kube_api_qps.is_finite() && self.kube_api_qps > 0.0) {
            return Err(AttacherError::Config(format!(
                "kube-api-qps must be a positive number, got {}",
                self.kube_api_qps
            )));
        }
        if self.kube_api_burst == 0 {
            return Err(AttacherError::Config(
                "kube-api-burst must be greater than zero".into(),
            ));
        }
        if !self.metrics_path.starts_with('/') || self.metrics_path == "/healthz" {
            return Err(AttacherError::Config(format!(
                "invalid metrics-path {:?}",
                self.metrics_path
            )));
        }
        Ok(())
    }
}
