//! Best-effort datagram transport between machines.
//!
//! Endpoints are addressed by their identity string, which is also the machine's holder
//! identity in the role leases. Delivery is unordered and may lose messages.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use roster_observe::metrics::Counter;
use roster_wire::message::MAX_DATAGRAM_BYTES;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

#[async_trait]
pub trait Datagram: Send + Sync {
    fn identity(&self) -> &str;

    async fn send_to(&self, peer: &str, payload: &[u8]) -> io::Result<()>;

    /// Returns a queued message if one is available right now.
    async fn try_recv(&self) -> io::Result<Option<Vec<u8>>>;

    /// Waits up to `timeout` for a message; `None` on timeout.
    async fn recv_timeout(&self, timeout: Duration) -> io::Result<Option<Vec<u8>>>;
}

/// Hands out channels that are already bound, one per machine.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn bind(&self) -> io::Result<Arc<dyn Datagram>>;
}

/// UDP socket on the loopback interface; identity is the bound port.
pub struct UdpChannel {
    identity: String,
    socket: UdpSocket,
}

impl UdpChannel {
    pub async fn bind_loopback() -> io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let identity = socket.local_addr()?.port().to_string();
        Ok(Self { identity, socket })
    }

    fn peer_addr(peer: &str) -> io::Result<SocketAddr> {
        let port: u16 = peer.trim().parse().map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("bad peer identity {peer:?}"))
        })?;
        Ok(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
    }
}

#[async_trait]
impl Datagram for UdpChannel {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn send_to(&self, peer: &str, payload: &[u8]) -> io::Result<()> {
        self.socket.send_to(payload, Self::peer_addr(peer)?).await?;
        Ok(())
    }

    async fn try_recv(&self) -> io::Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
        match self.socket.try_recv_from(&mut buf) {
            Ok((n, _)) => {
                buf.truncate(n);
                Ok(Some(buf))
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn recv_timeout(&self, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
        match tokio::time::timeout(timeout, self.socket.recv_from(&mut buf)).await {
            Ok(Ok((n, _))) => {
                buf.truncate(n);
                Ok(Some(buf))
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UdpFactory;

#[async_trait]
impl ChannelFactory for UdpFactory {
    async fn bind(&self) -> io::Result<Arc<dyn Datagram>> {
        Ok(Arc::new(UdpChannel::bind_loopback().await?))
    }
}

/// Decides whether a message `(from, to, payload)` is lost in transit.
pub type DropFilter = dyn Fn(&str, &str, &[u8]) -> bool + Send + Sync;

const FIRST_MEM_IDENTITY: u32 = 40_000;

#[derive(Default)]
struct Endpoints {
    next_identity: u32,
    senders: HashMap<String, mpsc::UnboundedSender<Vec<u8>>>,
}

#[derive(Default)]
struct NetInner {
    endpoints: Mutex<Endpoints>,
    drop_filter: RwLock<Option<Arc<DropFilter>>>,
    delivered: Counter,
    dropped: Counter,
}

impl NetInner {
    fn endpoints(&self) -> io::Result<std::sync::MutexGuard<'_, Endpoints>> {
        self.endpoints
            .lock()
            .map_err(|_| io::Error::other("network endpoints lock poisoned"))
    }

    fn should_drop(&self, from: &str, to: &str, payload: &[u8]) -> bool {
        match self.drop_filter.read() {
            Ok(filter) => filter.as_ref().is_some_and(|f| f(from, to, payload)),
            Err(_) => false,
        }
    }
}

/// In-process network of [`MemChannel`]s with optional loss injection.
///
/// Messages to unknown identities vanish, as they would on UDP.
#[derive(Clone, Default)]
pub struct MemNetwork {
    inner: Arc<NetInner>,
}

impl MemNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_drop_filter<F>(&self, filter: F)
    where
        F: Fn(&str, &str, &[u8]) -> bool + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.inner.drop_filter.write() {
            *slot = Some(Arc::new(filter));
        }
    }

    pub fn clear_drop_filter(&self) {
        if let Ok(mut slot) = self.inner.drop_filter.write() {
            *slot = None;
        }
    }

    pub fn delivered(&self) -> u64 {
        self.inner.delivered.get()
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped.get()
    }

    pub fn bind_channel(&self) -> io::Result<MemChannel> {
        let (tx, rx) = mpsc::unbounded_channel();
        let identity = {
            let mut endpoints = self.inner.endpoints()?;
            let identity = (FIRST_MEM_IDENTITY + endpoints.next_identity).to_string();
            endpoints.next_identity += 1;
            endpoints.senders.insert(identity.clone(), tx);
            identity
        };
        Ok(MemChannel {
            identity,
            network: Arc::clone(&self.inner),
            rx: tokio::sync::Mutex::new(rx),
        })
    }
}

#[async_trait]
impl ChannelFactory for MemNetwork {
    async fn bind(&self) -> io::Result<Arc<dyn Datagram>> {
        Ok(Arc::new(self.bind_channel()?))
    }
}

pub struct MemChannel {
    identity: String,
    network: Arc<NetInner>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

#[async_trait]
impl Datagram for MemChannel {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn send_to(&self, peer: &str, payload: &[u8]) -> io::Result<()> {
        if payload.len() > MAX_DATAGRAM_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} byte datagram exceeds {MAX_DATAGRAM_BYTES}", payload.len()),
            ));
        }
        if self.network.should_drop(&self.identity, peer, payload) {
            self.network.dropped.inc();
            return Ok(());
        }
        let sender = self.network.endpoints()?.senders.get(peer).cloned();
        match sender {
            Some(tx) if tx.send(payload.to_vec()).is_ok() => self.network.delivered.inc(),
            _ => self.network.dropped.inc(),
        }
        Ok(())
    }

    async fn try_recv(&self) -> io::Result<Option<Vec<u8>>> {
        let Ok(mut rx) = self.rx.try_lock() else {
            return Ok(None);
        };
        Ok(rx.try_recv().ok())
    }

    async fn recv_timeout(&self, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        let mut rx = self.rx.lock().await;
        Ok(tokio::time::timeout(timeout, rx.recv())
            .await
            .ok()
            .flatten())
    }
}

impl Drop for MemChannel {
    fn drop(&mut self) {
        if let Ok(mut endpoints) = self.network.endpoints() {
            endpoints.senders.remove(&self.identity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mem_channels_exchange_messages() -> anyhow::Result<()> {
        let net = MemNetwork::new();
        let a = net.bind_channel()?;
        let b = net.bind_channel()?;
        assert_eq!(a.identity(), "40000");
        assert_eq!(b.identity(), "40001");

        a.send_to(b.identity(), b"0,10").await?;
        assert_eq!(b.try_recv().await?, Some(b"0,10".to_vec()));
        assert_eq!(b.try_recv().await?, None);
        assert_eq!(
            b.recv_timeout(Duration::from_millis(20)).await?,
            None
        );
        Ok(())
    }

    #[tokio::test]
    async fn drop_filter_and_departed_peers_lose_messages() -> anyhow::Result<()> {
        let net = MemNetwork::new();
        let a = net.bind_channel()?;
        let b = net.bind_channel()?;
        let b_id = b.identity().to_string();

        net.set_drop_filter(|_, _, payload| payload.starts_with(b"0,"));
        a.send_to(&b_id, b"0,10").await?;
        a.send_to(&b_id, b"10,20").await?;
        assert_eq!(b.try_recv().await?, Some(b"10,20".to_vec()));
        assert_eq!(b.try_recv().await?, None);

        net.clear_drop_filter();
        drop(b);
        a.send_to(&b_id, b"20,30").await?;
        assert_eq!(net.delivered(), 1);
        assert_eq!(net.dropped(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn udp_loopback_roundtrip() -> anyhow::Result<()> {
        let a = UdpChannel::bind_loopback().await?;
        let b = UdpChannel::bind_loopback().await?;
        a.send_to(b.identity(), b"0,10,10,1").await?;
        let got = b.recv_timeout(Duration::from_secs(2)).await?;
        assert_eq!(got, Some(b"0,10,10,1".to_vec()));
        assert!(a.send_to("not-a-port", b"x").await.is_err());
        Ok(())
    }
}
