//! Network address service seam.
//!
//! On hardware this is the Wi-Fi/DHCP stack; on a host the address is
//! already there and [`StaticAddress`] reports it once.

use std::net::IpAddr;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::event::DeviceEvent;

/// An address change reported by the network stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressChange {
    Acquired(IpAddr),
    Lost,
}

impl From<AddressChange> for DeviceEvent {
    fn from(change: AddressChange) -> Self {
        match change {
            AddressChange::Acquired(ip) => DeviceEvent::AddressAcquired(ip),
            AddressChange::Lost => DeviceEvent::AddressLost,
        }
    }
}

/// Source of address acquisitions and losses.
#[async_trait]
pub trait AddressSource: Send {
    /// The next change, or `None` once the source will report no more.
    async fn next_change(&mut self) -> Option<AddressChange>;
}

/// Reports a single, permanent address.
#[derive(Debug)]
pub struct StaticAddress {
    ip: Option<IpAddr>,
}

impl StaticAddress {
    pub fn new(ip: IpAddr) -> Self {
        Self { ip: Some(ip) }
    }
}

#[async_trait]
impl AddressSource for StaticAddress {
    async fn next_change(&mut self) -> Option<AddressChange> {
        self.ip.take().map(AddressChange::Acquired)
    }
}

/// Replays changes pushed through a channel. Useful wherever something
/// other than the network stack decides when the address comes and goes.
#[derive(Debug)]
pub struct ChannelAddress {
    rx: mpsc::UnboundedReceiver<AddressChange>,
}

impl ChannelAddress {
    pub fn new() -> (mpsc::UnboundedSender<AddressChange>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }
}

#[async_trait]
impl AddressSource for ChannelAddress {
    async fn next_change(&mut self) -> Option<AddressChange> {
        self.rx.recv().await
    }
}

/// Forward every change from `source` into the controller's event queue.
pub fn forward(
    mut source: Box<dyn AddressSource>,
    events: mpsc::UnboundedSender<DeviceEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(change) = source.next_change().await {
            if events.send(change.into()).is_err() {
                break;
            }
        }
        debug!("address source finished");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn static_address_reports_once() {
        let ip = IpAddr::V4(Ipv4Addr::new(10, 10, 10, 2));
        let mut source = StaticAddress::new(ip);
        assert_eq!(source.next_change().await, Some(AddressChange::Acquired(ip)));
        assert_eq!(source.next_change().await, None);
    }

    #[tokio::test]
    async fn forwarder_translates_changes() {
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let (changes, source) = ChannelAddress::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = forward(Box::new(source), tx);

        changes.send(AddressChange::Acquired(ip)).unwrap();
        changes.send(AddressChange::Lost).unwrap();
        drop(changes);

        assert_eq!(rx.recv().await, Some(DeviceEvent::AddressAcquired(ip)));
        assert_eq!(rx.recv().await, Some(DeviceEvent::AddressLost));
        task.await.unwrap();
        assert_eq!(rx.recv().await, None);
    }
}
