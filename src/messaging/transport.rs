use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::trace;

use crate::{Error, NodeId};

/// Tag for active messages. Other tags are reserved for the transport.
pub const TAG_ACTIVE: u8 = 1;

/// One received buffer.
#[derive(Debug)]
pub struct Frame {
    /// The node that handed the buffer to its transport.
    pub src: NodeId,
    pub tag: u8,
    pub bytes: Vec<u8>,
}

/// Point-to-point byte delivery between the nodes of a run.
///
/// Implementations must deliver every buffer exactly once and keep buffers
/// from one sender to one receiver in order. A failed send is fatal for the
/// run.
pub trait Transport: Send {
    fn this_node(&self) -> NodeId;

    fn num_nodes(&self) -> NodeId;

    /// Hands `bytes` to the network. Completion means the buffer is owned by
    /// the transport.
    fn send_bytes(&self, dest: NodeId, tag: u8, bytes: Vec<u8>) -> Result<(), Error>;

    /// Returns an arrived buffer without blocking.
    fn try_recv(&mut self) -> Option<Frame>;

    /// Waits for the next buffer. `None` means every peer has gone away.
    fn recv(&mut self) -> BoxFuture<'_, Option<Frame>>;
}

/// An in-process world: one unbounded channel per node, shared by every
/// sender. A channel keeps each sender's buffers in order, which gives the
/// per-pair FIFO the runtime relies on.
pub struct LocalWorld;

impl LocalWorld {
    /// Creates the endpoints of an `n` node world, indexed by node.
    pub fn endpoints(n: NodeId) -> Vec<LocalTransport> {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..n).map(|_| mpsc::unbounded_channel()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(node, rx)| LocalTransport {
                node: node as NodeId,
                peers: senders.clone(),
                rx,
            })
            .collect()
    }
}

pub struct LocalTransport {
    node: NodeId,
    peers: Vec<mpsc::UnboundedSender<Frame>>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl Transport for LocalTransport {
    fn this_node(&self) -> NodeId {
        self.node
    }

    fn num_nodes(&self) -> NodeId {
        self.peers.len() as NodeId
    }

    fn send_bytes(&self, dest: NodeId, tag: u8, bytes: Vec<u8>) -> Result<(), Error> {
        let peer = self
            .peers
            .get(dest as usize)
            .ok_or(Error::UnknownNode(dest))?;
        trace!("{} -> {}: {} bytes", self.node, dest, bytes.len());
        peer.send(Frame {
            src: self.node,
            tag,
            bytes,
        })
        .map_err(|_| Error::TransportClosed(dest))
    }

    fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    fn recv(&mut self) -> BoxFuture<'_, Option<Frame>> {
        Box::pin(self.rx.recv())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pairs_keep_order() {
        let mut world = LocalWorld::endpoints(3);
        let mut two = world.pop().unwrap();
        let one = world.pop().unwrap();
        let zero = world.pop().unwrap();
        for n in 0..5u8 {
            zero.send_bytes(2, TAG_ACTIVE, vec![n]).unwrap();
            one.send_bytes(2, TAG_ACTIVE, vec![100 + n]).unwrap();
        }
        let mut from_zero = Vec::new();
        let mut from_one = Vec::new();
        for _ in 0..10 {
            let frame = two.recv().await.unwrap();
            match frame.src {
                0 => from_zero.push(frame.bytes[0]),
                _ => from_one.push(frame.bytes[0]),
            }
        }
        assert_eq!(from_zero, vec![0, 1, 2, 3, 4]);
        assert_eq!(from_one, vec![100, 101, 102, 103, 104]);
        assert!(two.try_recv().is_none());
    }

    #[test]
    fn unknown_and_closed_peers() {
        let mut world = LocalWorld::endpoints(2);
        let one = world.pop().unwrap();
        let zero = world.pop().unwrap();
        assert!(matches!(
            zero.send_bytes(5, TAG_ACTIVE, vec![]),
            Err(Error::UnknownNode(5))
        ));
        drop(one);
        assert!(matches!(
            zero.send_bytes(1, TAG_ACTIVE, vec![]),
            Err(Error::TransportClosed(1))
        ));
        assert_eq!(zero.num_nodes(), 2);
    }
}
