use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::Prober;
use crate::member::MemberAdvertisement;

/// Reachability probe that opens short-lived TCP connections.
///
/// Every advertised address is tried in parallel. The first successful
/// connection decides the member is up; the probe gives up when all attempts
/// failed or the timeout elapsed. Outstanding attempts are aborted either way.
#[derive(Debug, Default, Clone)]
pub struct TcpProber;

impl TcpProber {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn is_reachable(&self, member: &MemberAdvertisement, timeout: Duration) -> bool {
        if member.addresses.is_empty() {
            debug!(member = %member.id, "no addresses to probe");
            return false;
        }

        let mut attempts = FuturesUnordered::new();
        let mut abort_handles = Vec::with_capacity(member.addresses.len());
        for addr in member.addresses.iter().copied() {
            let attempt = tokio::spawn(async move {
                let connected = TcpStream::connect(addr).await.is_ok();
                trace!(%addr, connected, "probe attempt finished");
                connected
            });
            abort_handles.push(attempt.abort_handle());
            attempts.push(attempt);
        }

        let reachable = tokio::time::timeout(timeout, async {
            while let Some(outcome) = attempts.next().await {
                if let Ok(true) = outcome {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);

        for handle in abort_handles {
            handle.abort();
        }

        debug!(member = %member.id, reachable, "reachability probe finished");
        reachable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::MemberId;
    use tokio::net::TcpListener;

    fn member_at(addresses: Vec<std::net::SocketAddr>) -> MemberAdvertisement {
        MemberAdvertisement::with_start_time(MemberId::from("probe-target"), "target", 1).with_addresses(addresses)
    }

    #[tokio::test]
    async fn reachable_when_any_address_accepts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap();

        let closed = {
            let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
            unused.local_addr().unwrap()
        };

        let prober = TcpProber::new();
        let member = member_at(vec![closed, open]);
        assert!(prober.is_reachable(&member, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn unreachable_when_all_addresses_refuse() {
        let closed = {
            let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
            unused.local_addr().unwrap()
        };

        let prober = TcpProber::new();
        assert!(!prober.is_reachable(&member_at(vec![closed]), Duration::from_secs(2)).await);
        assert!(!prober.is_reachable(&member_at(Vec::new()), Duration::from_secs(2)).await);
    }
}
