//! UDP socket: bind with port retry, encrypted send, resilient receive loop.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{NodeConfig, MAX_DATAGRAM_SIZE};
use crate::error::{OpError, OpResult};
use crate::logging::{log_packet, Direction, PacketLogEntry};
use crate::protocol::{Message, Outbound};
use crate::transport::cipher::PacketCodec;
use crate::types::NodeId;

/// A decoded datagram and where it came from
#[derive(Debug, Clone)]
pub struct Inbound {
    pub addr: SocketAddr,
    pub message: Message,
}

/// Encrypted datagram link over one UDP socket
#[derive(Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    codec: Arc<PacketCodec>,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind on `ip`, trying `config.port` and the following ports.
    ///
    /// Port 0 asks the OS for an ephemeral port and is tried once.
    pub async fn bind(ip: IpAddr, config: &NodeConfig, local_id: NodeId) -> OpResult<Self> {
        let network_key = config.network_key_bytes()?;
        let attempts = if config.port == 0 {
            1
        } else {
            config.bind_attempts
        };

        let mut last_err = None;
        for attempt in 0..attempts {
            let port = config.port.saturating_add(attempt);
            match UdpSocket::bind(SocketAddr::new(ip, port)).await {
                Ok(socket) => {
                    let local_addr = socket.local_addr()?;
                    info!(%local_addr, node = %local_id, "transport bound");
                    return Ok(Self {
                        socket: Arc::new(socket),
                        codec: Arc::new(PacketCodec::new(network_key, local_id)),
                        local_addr,
                    });
                }
                Err(err) => {
                    warn!(port, error = %err, "bind failed, trying next port");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err
            .map(OpError::Io)
            .unwrap_or_else(|| OpError::Config("no bind attempts configured".into())))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_id(&self) -> NodeId {
        self.codec.local_id()
    }

    /// Encrypt, frame and send one packet.
    pub async fn send(&self, outbound: &Outbound) -> OpResult<()> {
        let message = Message::new(self.codec.local_id(), outbound.packet.clone());
        let datagram = self.codec.encode(&message, outbound.dest)?;
        let sent = self.socket.send_to(&datagram, outbound.addr).await?;
        if sent != datagram.len() {
            warn!(addr = %outbound.addr, sent, len = datagram.len(), "short datagram write");
        }
        log_packet(&PacketLogEntry::new(
            Direction::Out,
            outbound.addr,
            outbound.packet.kind(),
            datagram.len(),
        ));
        Ok(())
    }

    /// Start the receive loop, forwarding decoded packets to `tx`.
    ///
    /// Undecodable datagrams are logged and dropped. Socket errors never stop
    /// the loop unless `max_retries` happen back to back. The loop also ends
    /// when `tx` is closed.
    pub fn spawn_receiver(&self, tx: mpsc::Sender<Inbound>, max_retries: u32) -> JoinHandle<()> {
        let socket = self.socket.clone();
        let codec = self.codec.clone();
        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE * 2];
            let mut consecutive_errors = 0u32;
            loop {
                tokio::select! {
                    biased;

                    _ = tx.closed() => {
                        debug!("receiver queue closed, stopping transport listener");
                        return;
                    }
                    res = socket.recv_from(&mut buffer) => {
                        match res {
                            Ok((n, addr)) => {
                                consecutive_errors = 0;
                                let datagram = &buffer[..n];
                                match codec.decode(datagram) {
                                    Ok(message) => {
                                        log_packet(&PacketLogEntry::new(
                                            Direction::In,
                                            addr,
                                            message.packet.kind(),
                                            n,
                                        ));
                                        if tx.send(Inbound { addr, message }).await.is_err() {
                                            return;
                                        }
                                    }
                                    Err(err) => {
                                        debug!(%addr, size = n, error = %err, "dropping undecodable datagram");
                                    }
                                }
                            }
                            Err(err) => {
                                consecutive_errors += 1;
                                if consecutive_errors > max_retries {
                                    error!(error = %err, consecutive_errors, "receive keeps failing, stopping listener");
                                    return;
                                }
                                warn!(error = %err, consecutive_errors, "receive failed, re-arming");
                            }
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Packet;
    use crate::types::ServiceTag;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn config(port: u16) -> NodeConfig {
        NodeConfig {
            port,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_send_and_receive_store() {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let a = UdpTransport::bind(localhost, &config(0), NodeId(1)).await.unwrap();
        let b = UdpTransport::bind(localhost, &config(0), NodeId(2)).await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let _listener = b.spawn_receiver(tx, 100);

        let packet = Packet::Store {
            service: ServiceTag::BOARD,
            data: vec![7; 32],
        };
        a.send(&Outbound {
            addr: b.local_addr(),
            dest: Some(NodeId(2)),
            packet: packet.clone(),
        })
        .await
        .unwrap();

        let inbound = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.message.sender, NodeId(1));
        assert_eq!(inbound.message.packet, packet);
        assert_eq!(inbound.addr, a.local_addr());
    }

    #[tokio::test]
    async fn test_misaddressed_datagram_dropped_listener_survives() {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let a = UdpTransport::bind(localhost, &config(0), NodeId(1)).await.unwrap();
        let b = UdpTransport::bind(localhost, &config(0), NodeId(2)).await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let _listener = b.spawn_receiver(tx, 100);

        // encrypted for node 3, B cannot read it
        a.send(&Outbound {
            addr: b.local_addr(),
            dest: Some(NodeId(3)),
            packet: Packet::Store {
                service: ServiceTag::BOARD,
                data: vec![],
            },
        })
        .await
        .unwrap();
        a.send(&Outbound {
            addr: b.local_addr(),
            dest: None,
            packet: Packet::Ping,
        })
        .await
        .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.message.packet, Packet::Ping);
    }

    #[tokio::test]
    async fn test_bind_retries_next_port() {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let first = UdpTransport::bind(localhost, &config(0), NodeId(1)).await.unwrap();
        let taken = first.local_addr().port();

        let second = UdpTransport::bind(localhost, &config(taken), NodeId(2)).await;
        if let Ok(second) = second {
            assert_ne!(second.local_addr().port(), taken);
            assert!(second.local_addr().port() > taken);
        }
    }

    #[tokio::test]
    async fn test_oversize_packet_not_sent() {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let a = UdpTransport::bind(localhost, &config(0), NodeId(1)).await.unwrap();
        let result = a
            .send(&Outbound {
                addr: a.local_addr(),
                dest: Some(NodeId(1)),
                packet: Packet::Store {
                    service: ServiceTag::BOARD,
                    data: vec![0; MAX_DATAGRAM_SIZE],
                },
            })
            .await;
        assert!(matches!(result, Err(OpError::PacketTooLarge { .. })));
    }
}
