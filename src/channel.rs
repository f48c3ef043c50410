use std::collections::HashMap;
use std::net::SocketAddr;

use anyhow::{Result, anyhow};
use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use crate::options::TransferOptions;
use crate::protocol::{BLOCK_SIZE, ErrorCode, Packet};

/// Which half of the transfer this endpoint is driving. Only affects the
/// receive buffer: a sender expects ACK/ERROR/OACK (small), a receiver must
/// hold a full DATA block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

/// One datagram (or deadline expiry) as seen by a session.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Data { block_num: u16, data: Vec<u8> },
    Ack { block_num: u16 },
    Error { code: u16, msg: String },
    Oack { options: HashMap<String, String> },
    /// The read deadline fired; the pending message should be retransmitted.
    /// Never appears on the wire.
    Retransmit,
}

/// A UDP socket tied to the peer's transport id for the lifetime of one
/// transfer. All typed sends go to the current peer; `read_next` latches the
/// peer's TID on the first reply and polices it afterwards.
pub struct RequestChannel {
    sock: UdpSocket,
    peer: SocketAddr,
    /// False until the peer's transfer TID is known. A client starts out
    /// unlatched: it sends to port 69 but the reply arrives from the
    /// server's ephemeral port.
    latched: bool,
}

impl RequestChannel {
    /// Channel whose first reply will fix the peer TID (client side).
    pub fn new(sock: UdpSocket, peer: SocketAddr) -> Self {
        Self {
            sock,
            peer,
            latched: false,
        }
    }

    /// Channel whose peer TID is already known (server side: the requester's
    /// source address is the TID).
    pub fn latched(sock: UdpSocket, peer: SocketAddr) -> Self {
        Self {
            sock,
            peer,
            latched: true,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.sock.local_addr()?)
    }

    pub async fn send_rrq(
        &self,
        filename: &str,
        mode: &str,
        options: &HashMap<String, String>,
    ) -> Result<()> {
        self.send_packet(&Packet::RRQ {
            filename: filename.to_string(),
            mode: mode.to_string(),
            options: options.clone(),
        })
        .await
    }

    pub async fn send_wrq(
        &self,
        filename: &str,
        mode: &str,
        options: &HashMap<String, String>,
    ) -> Result<()> {
        self.send_packet(&Packet::WRQ {
            filename: filename.to_string(),
            mode: mode.to_string(),
            options: options.clone(),
        })
        .await
    }

    pub async fn send_data(&self, block_num: u16, data: &[u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(4 + data.len());
        buf.extend_from_slice(&3u16.to_be_bytes());
        buf.extend_from_slice(&block_num.to_be_bytes());
        buf.extend_from_slice(data);
        self.sock.send_to(&buf, self.peer).await?;
        Ok(())
    }

    pub async fn send_ack(&self, block_num: u16) -> Result<()> {
        self.send_packet(&Packet::ACK { block_num }).await
    }

    pub async fn send_oack(&self, options: &HashMap<String, String>) -> Result<()> {
        self.send_packet(&Packet::OACK {
            options: options.clone(),
        })
        .await
    }

    pub async fn send_error(&self, code: ErrorCode, msg: &str) -> Result<()> {
        self.send_packet(&Packet::ERROR {
            code: code.code(),
            msg: msg.to_string(),
        })
        .await
    }

    async fn send_packet(&self, pkt: &Packet) -> Result<()> {
        self.sock.send_to(&pkt.to_bytes(), self.peer).await?;
        Ok(())
    }

    /// Wait up to `opts.timeout` for the peer's next message.
    ///
    /// Returns `Incoming::Retransmit` when the deadline fires. Datagrams from
    /// a third party are answered with ERROR(UnknownTid) at their source and
    /// do not consume the deadline. A datagram that cannot be decoded, or
    /// whose opcode has no business arriving mid-transfer, is answered with
    /// an ERROR and surfaces as `Err`: the session treats it as fatal.
    pub async fn read_next(&mut self, role: Role, opts: &TransferOptions) -> Result<Incoming> {
        let buf_size = match role {
            Role::Sender => BLOCK_SIZE,
            Role::Receiver => opts.block_size + 4,
        };
        let mut buf = vec![0u8; buf_size];
        let deadline = Instant::now() + opts.timeout;

        loop {
            let (n, from) = match timeout_at(deadline, self.sock.recv_from(&mut buf)).await {
                Ok(result) => result?,
                Err(_) => return Ok(Incoming::Retransmit),
            };

            if self.latched && from != self.peer {
                // Mid-transfer datagram from a different host; reject it on
                // the misrouted endpoint without disturbing the session.
                warn!("dropping datagram from unexpected source {from}");
                let err = Packet::ERROR {
                    code: ErrorCode::UnknownTid.code(),
                    msg: "Unknown transfer ID".to_string(),
                };
                let _ = self.sock.send_to(&err.to_bytes(), from).await;
                continue;
            }

            // RFC 1350: the first reply fixes the peer's TID for the rest of
            // the transfer.
            self.peer = from;
            self.latched = true;

            if n < 4 {
                self.send_error(ErrorCode::NotDefined, "Malformed message")
                    .await?;
                return Err(anyhow!("datagram shorter than minimum message"));
            }

            return match Packet::from_bytes(&buf[..n]) {
                Ok(Packet::DATA { block_num, data }) => Ok(Incoming::Data { block_num, data }),
                Ok(Packet::ACK { block_num }) => Ok(Incoming::Ack { block_num }),
                Ok(Packet::ERROR { code, msg }) => Ok(Incoming::Error { code, msg }),
                Ok(Packet::OACK { options }) => Ok(Incoming::Oack { options }),
                Ok(other) => {
                    debug!("unexpected {other:?} mid-transfer");
                    self.send_error(ErrorCode::IllegalOperation, "Illegal TFTP operation")
                        .await?;
                    Err(anyhow!("unexpected request opcode mid-transfer"))
                }
                Err(e) => {
                    self.send_error(ErrorCode::IllegalOperation, "Illegal TFTP operation")
                        .await?;
                    Err(anyhow!("undecodable datagram: {e}"))
                }
            };
        }
    }
}

/// Create an ephemeral UDP socket with send/receive buffers sized for the
/// negotiated block size. The OS default buffer is too small for blksize
/// values above ~8 KB and causes "No buffer space available" (ENOBUFS).
pub fn bind_transfer_socket(peer: SocketAddr, blksize: usize) -> Result<UdpSocket> {
    // Build the socket via socket2 so we can set buffer sizes before
    // handing it to tokio.
    let domain = if peer.is_ipv6() {
        socket2::Domain::IPV6
    } else {
        socket2::Domain::IPV4
    };
    let raw = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;

    // Need room for the 4-byte TFTP header plus the payload.
    let buf_size = (4 + blksize) * 2;
    let _ = raw.set_send_buffer_size(buf_size);
    let _ = raw.set_recv_buffer_size(buf_size);

    // Bind to an OS-assigned port: one fresh TID per transfer.
    let bind_addr: SocketAddr = if peer.is_ipv6() {
        "[::]:0".parse().unwrap()
    } else {
        "0.0.0.0:0".parse().unwrap()
    };
    raw.bind(&bind_addr.into())?;
    raw.set_nonblocking(true)?;

    // Convert: socket2 -> std -> tokio. The socket stays unconnected so the
    // channel can observe (and police) source addresses.
    let std_sock: std::net::UdpSocket = raw.into();
    Ok(UdpSocket::from_std(std_sock)?)
}
