//! Establishing the gRPC channel to a CSI driver.
//!
//! Drivers normally listen on a unix domain socket next to the sidecar, so
//! the address is given as `unix:///path/to/socket`.  A `tcp://host:port` (or
//! bare `host:port`) address is accepted for drivers running elsewhere.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, info, warn};

use crate::error::CsiError;
use crate::retry::{BackoffError, retry_notify, retry_policy};

/// Default driver socket.
pub const DEFAULT_CSI_ADDRESS: &str = "unix:///run/csi/socket";

/// First and longest wait between connection attempts while the driver is absent.
const CONNECT_RETRY_START: Duration = Duration::from_secs(1);
const CONNECT_RETRY_MAX: Duration = Duration::from_secs(10);

/// Called when an established connection to the driver is lost.
pub type ConnectionLostFn = Arc<dyn Fn() + Send + Sync>;

/// A parsed driver address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CsiAddress {
    /// Unix domain socket path.
    Unix(PathBuf),
    /// `host:port` reachable over TCP.
    Tcp(String),
}

impl FromStr for CsiAddress {
    type Err = CsiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(CsiError::InvalidAddress(s.to_owned()));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if s.starts_with('/') {
            return Ok(Self::Unix(PathBuf::from(s)));
        }
        let host = s.strip_prefix("tcp://").unwrap_or(s);
        if host.is_empty() || host.contains("://") || !host.contains(':') {
            return Err(CsiError::InvalidAddress(s.to_owned()));
        }
        Ok(Self::Tcp(host.to_owned()))
    }
}

impl std::fmt::Display for CsiAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Tcp(host) => write!(f, "tcp://{host}"),
        }
    }
}

/// Connect to the driver at `address`, retrying until the socket appears.
///
/// Once connected, `on_lost` (if any) is invoked every time the channel has
/// to re-dial the driver, i.e. whenever the established connection broke.
pub async fn connect(
    address: &str,
    on_lost: Option<ConnectionLostFn>,
) -> Result<Channel, CsiError> {
    let address = CsiAddress::from_str(address)?;
    let channel = retry_notify(
        retry_policy(CONNECT_RETRY_START, CONNECT_RETRY_MAX),
        || {
            let address = &address;
            let on_lost = on_lost.clone();
            async move {
                try_connect(address, on_lost).await.map_err(|e| match e {
                    CsiError::InvalidAddress(_) => BackoffError::permanent(e),
                    e => BackoffError::transient(e),
                })
            }
        },
        |e: CsiError, wait: Duration| {
            warn!(%address, error = %e, ?wait, "still connecting to CSI driver");
        },
    )
    .await?;
    info!(%address, "connected to CSI driver");
    Ok(channel)
}

async fn try_connect(
    address: &CsiAddress,
    on_lost: Option<ConnectionLostFn>,
) -> Result<Channel, CsiError> {
    match address {
        CsiAddress::Unix(path) => {
            let path = path.clone();
            let connected = Arc::new(AtomicBool::new(false));
            // The URI is ignored by the connector; tonic only needs a valid one.
            Endpoint::try_from("http://[::]:50051")
                .map_err(CsiError::transport)?
                .connect_with_connector(service_fn(move |_: Uri| {
                    let path = path.clone();
                    let connected = Arc::clone(&connected);
                    let on_lost = on_lost.clone();
                    async move {
                        if connected.load(Ordering::SeqCst) {
                            warn!(path = %path.display(), "lost connection to CSI driver");
                            if let Some(on_lost) = &on_lost {
                                on_lost();
                            }
                        }
                        let stream = UnixStream::connect(&path).await?;
                        connected.store(true, Ordering::SeqCst);
                        debug!(path = %path.display(), "dialed CSI driver");
                        Ok::<_, std::io::Error>(TokioIo::new(stream))
                    }
                }))
                .await
                .map_err(CsiError::transport)
        }
        CsiAddress::Tcp(host) => Endpoint::from_shared(format!("http://{host}"))
            .map_err(|e| CsiError::InvalidAddress(format!("{host}: {e}")))?
            .connect()
            .await
            .map_err(CsiError::transport),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_unix_address() {
        assert_eq!(
            CsiAddress::from_str(DEFAULT_CSI_ADDRESS).unwrap(),
            CsiAddress::Unix(PathBuf::from("/run/csi/socket"))
        );
        assert_eq!(
            CsiAddress::from_str("/var/lib/csi/sockets/csi.sock").unwrap(),
            CsiAddress::Unix(PathBuf::from("/var/lib/csi/sockets/csi.sock"))
        );
    }

    #[test]
    fn parse_tcp_address() {
        assert_eq!(
            CsiAddress::from_str("tcp://10.0.0.1:10000").unwrap(),
            CsiAddress::Tcp("10.0.0.1:10000".into())
        );
        assert_eq!(
            CsiAddress::from_str("localhost:9000").unwrap(),
            CsiAddress::Tcp("localhost:9000".into())
        );
    }

    #[test]
    fn reject_bad_addresses() {
        for bad in ["", "unix://", "http://host:1", "no-port"] {
            assert!(
                matches!(CsiAddress::from_str(bad), Err(CsiError::InvalidAddress(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unusable_host_is_not_retried() {
        let result = connect("tcp://bad host:10000", None).await;
        assert!(matches!(result, Err(CsiError::InvalidAddress(_))));
    }

    #[test]
    fn display_round_trips_scheme() {
        let addr = CsiAddress::from_str("unix:///run/csi/socket").unwrap();
        assert_eq!(addr.to_string(), "unix:///run/csi/socket");
    }
}
