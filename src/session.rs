use std::collections::HashMap;
use std::io;
use std::time::Instant;

use anyhow::{Result, anyhow};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::channel::{Incoming, RequestChannel, Role};
use crate::options::{TransferOptions, adopt_oack};
use crate::protocol::{ErrorCode, MAX_RETRANSMITS};

/// The original RRQ a client keeps around until the server answers. While it
/// is present, a receive timeout means the request itself (not an ACK) must
/// be re-sent.
pub struct PendingRequest {
    pub filename: String,
    pub mode: String,
    pub options: HashMap<String, String>,
}

/// Sends DATA blocks in lock step: one block in flight, retained until the
/// peer ACKs it. Used by the server for reads and by the client for puts.
///
/// The channel and the data source are owned for the session's lifetime and
/// dropped on every exit path.
pub struct Sender<R> {
    chan: RequestChannel,
    source: R,
    opts: TransferOptions,
    block_num: u16,
    block: Vec<u8>,
}

impl<R: AsyncRead + Unpin> Sender<R> {
    pub fn new(chan: RequestChannel, source: R, opts: TransferOptions) -> Self {
        let block = Vec::with_capacity(opts.block_size);
        Self {
            chan,
            source,
            opts,
            block_num: 0,
            block,
        }
    }

    /// Drive the transfer to completion or abort.
    pub async fn run(mut self) -> Result<()> {
        let started = Instant::now();
        let mut sent: u64 = 0;
        let mut prepare = true;
        let mut retransmits = 0u32;

        loop {
            if prepare {
                if let Err(e) = self.prepare_next_block().await {
                    self.chan
                        .send_error(ErrorCode::AccessViolation, "Failed to read block")
                        .await?;
                    return Err(anyhow!("read failed on block {}: {e}", self.block_num));
                }
            }

            self.chan.send_data(self.block_num, &self.block).await?;

            match self.chan.read_next(Role::Sender, &self.opts).await? {
                Incoming::Ack { block_num } if block_num == self.block_num => {
                    retransmits = 0;
                    sent += self.block.len() as u64;
                    // A block shorter than blksize signals end-of-transfer.
                    if self.block.len() < self.opts.block_size {
                        info!(
                            "sent {sent} bytes in {} blocks ({:?})",
                            self.block_num,
                            started.elapsed()
                        );
                        return Ok(());
                    }
                    prepare = true;
                }
                Incoming::Ack { block_num } => {
                    // Duplicate or stale ACK: resend the current block without
                    // touching the source.
                    debug!("stale ACK {block_num} while sending {}", self.block_num);
                    prepare = false;
                }
                Incoming::Error { code, msg } => {
                    warn!("peer aborted transfer with error {code}: {msg}");
                    return Err(anyhow!("peer error {code}: {msg}"));
                }
                Incoming::Retransmit => {
                    if retransmits >= MAX_RETRANSMITS {
                        return Err(anyhow!("no reply after {MAX_RETRANSMITS} retransmits"));
                    }
                    retransmits += 1;
                    debug!("timeout, retransmitting block {}", self.block_num);
                    prepare = false;
                }
                other => {
                    self.chan
                        .send_error(ErrorCode::IllegalOperation, "Invalid operation during read")
                        .await?;
                    return Err(anyhow!("unexpected {other:?} while awaiting ACK"));
                }
            }
        }
    }

    /// Advance the block counter (wrapping modulo 2^16) and fill the block
    /// buffer from the source. End-of-stream leaves a short (possibly empty)
    /// block, which terminates the transfer once acknowledged.
    async fn prepare_next_block(&mut self) -> io::Result<()> {
        self.block_num = self.block_num.wrapping_add(1);
        self.block.resize(self.opts.block_size, 0);
        let mut filled = 0;
        while filled < self.block.len() {
            let n = self.source.read(&mut self.block[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        self.block.truncate(filled);
        Ok(())
    }
}

/// Receives DATA blocks in lock step, ACKing each one. Used by the server
/// for writes and by the client for gets.
pub struct Receiver<W> {
    chan: RequestChannel,
    sink: W,
    opts: TransferOptions,
    block_num: u16,
    pending: Option<PendingRequest>,
}

impl<W: AsyncWrite + Unpin> Receiver<W> {
    /// Server-side receiver: the peer's DATA is expected directly.
    pub fn new(chan: RequestChannel, sink: W, opts: TransferOptions) -> Self {
        Self {
            chan,
            sink,
            opts,
            block_num: 0,
            pending: None,
        }
    }

    /// Client-side receiver: `request` is the RRQ already sent, kept for
    /// re-sending until the server answers with an OACK or DATA.
    pub fn with_pending_request(
        chan: RequestChannel,
        sink: W,
        opts: TransferOptions,
        request: PendingRequest,
    ) -> Self {
        Self {
            chan,
            sink,
            opts,
            block_num: 0,
            pending: Some(request),
        }
    }

    /// Drive the transfer to completion or abort.
    pub async fn run(mut self) -> Result<()> {
        let started = Instant::now();
        let mut received: u64 = 0;

        // A server that already answered with an OACK stays quiet: the
        // client's first DATA is the acknowledgement. A client leaves the
        // initial ACK to the loop because an OACK may arrive first.
        if !self.opts.oack_sent && self.pending.is_none() {
            self.chan.send_ack(0).await?;
        }

        let mut retransmits = 0u32;
        loop {
            match self.chan.read_next(Role::Receiver, &self.opts).await? {
                Incoming::Data { block_num, data }
                    if block_num == self.block_num.wrapping_add(1) =>
                {
                    // First DATA concludes any option negotiation.
                    self.pending = None;
                    if let Err(e) = self.sink.write_all(&data).await {
                        self.chan
                            .send_error(ErrorCode::AccessViolation, "Failed to write block")
                            .await?;
                        return Err(anyhow!("write failed on block {block_num}: {e}"));
                    }
                    self.block_num = block_num;
                    received += data.len() as u64;
                    self.chan.send_ack(self.block_num).await?;
                    retransmits = 0;
                    if data.len() < self.opts.block_size {
                        self.sink.flush().await?;
                        info!(
                            "received {received} bytes in {} blocks ({:?})",
                            self.block_num,
                            started.elapsed()
                        );
                        return Ok(());
                    }
                }
                Incoming::Data { block_num, .. } => {
                    // Duplicate or out-of-order block: re-ACK the last good
                    // one, without advancing.
                    debug!(
                        "ignoring DATA {block_num} while expecting {}",
                        self.block_num.wrapping_add(1)
                    );
                    self.chan.send_ack(self.block_num).await?;
                }
                Incoming::Oack { options } => {
                    if self.pending.is_none() {
                        // Only a client that requested options can be OACKed.
                        self.chan
                            .send_error(
                                ErrorCode::IllegalOperation,
                                "Invalid operation during write",
                            )
                            .await?;
                        return Err(anyhow!("unsolicited OACK"));
                    }
                    // Adopt before any DATA arrives so the end-of-transfer
                    // check runs against the negotiated block size.
                    debug!("server acknowledged options {options:?}");
                    adopt_oack(&mut self.opts, &options);
                    self.chan.send_ack(0).await?;
                    retransmits = 0;
                }
                Incoming::Error { code, msg } => {
                    warn!("peer aborted transfer with error {code}: {msg}");
                    return Err(anyhow!("peer error {code}: {msg}"));
                }
                Incoming::Retransmit => {
                    if retransmits >= MAX_RETRANSMITS {
                        return Err(anyhow!("no reply after {MAX_RETRANSMITS} retransmits"));
                    }
                    retransmits += 1;
                    if let Some(req) = &self.pending {
                        // The request itself is still unanswered.
                        debug!("timeout, re-sending read request for {}", req.filename);
                        self.chan
                            .send_rrq(&req.filename, &req.mode, &req.options)
                            .await?;
                    } else {
                        self.chan.send_ack(self.block_num).await?;
                    }
                }
                other => {
                    self.chan
                        .send_error(ErrorCode::IllegalOperation, "Invalid operation during write")
                        .await?;
                    return Err(anyhow!("unexpected {other:?} while awaiting DATA"));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Packet;
    use std::time::Duration;
    use tokio::net::UdpSocket;

    fn fast_opts() -> TransferOptions {
        TransferOptions {
            timeout: Duration::from_millis(100),
            ..TransferOptions::default()
        }
    }

    async fn sender_under_test(data: &'static [u8]) -> (tokio::task::JoinHandle<Result<()>>, UdpSocket) {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let near = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let chan = RequestChannel::latched(near, peer.local_addr().unwrap());
        let sender = Sender::new(chan, data, fast_opts());
        (tokio::spawn(sender.run()), peer)
    }

    async fn recv_data(sock: &UdpSocket) -> (u16, Vec<u8>, std::net::SocketAddr) {
        let mut buf = vec![0u8; 1024];
        let (n, from) = sock.recv_from(&mut buf).await.unwrap();
        match Packet::from_bytes(&buf[..n]).unwrap() {
            Packet::DATA { block_num, data } => (block_num, data, from),
            other => panic!("expected DATA, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sender_short_file_is_one_block() {
        let (task, peer) = sender_under_test(b"Hello, world!").await;

        let (block, data, from) = recv_data(&peer).await;
        assert_eq!(block, 1);
        assert_eq!(data, b"Hello, world!");
        peer.send_to(&Packet::ACK { block_num: 1 }.to_bytes(), from)
            .await
            .unwrap();

        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn sender_exact_multiple_ends_with_empty_block() {
        // 1024 bytes at blksize 512: DATA 1 and 2 carry 512 bytes, DATA 3 is
        // the empty terminator.
        static PAYLOAD: [u8; 1024] = [0xa5; 1024];
        let (task, peer) = sender_under_test(&PAYLOAD).await;

        for expect in 1u16..=3 {
            let (block, data, from) = recv_data(&peer).await;
            assert_eq!(block, expect);
            assert_eq!(data.len(), if expect == 3 { 0 } else { 512 });
            peer.send_to(&Packet::ACK { block_num: block }.to_bytes(), from)
                .await
                .unwrap();
        }

        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn sender_resends_on_stale_ack_without_advancing() {
        static PAYLOAD: [u8; 600] = [7; 600];
        let (task, peer) = sender_under_test(&PAYLOAD).await;

        let (block, data, from) = recv_data(&peer).await;
        assert_eq!((block, data.len()), (1, 512));

        // A stale ACK provokes a retransmit of the same block, nothing more.
        peer.send_to(&Packet::ACK { block_num: 0 }.to_bytes(), from)
            .await
            .unwrap();
        let (block, data, _) = recv_data(&peer).await;
        assert_eq!((block, data.len()), (1, 512));

        peer.send_to(&Packet::ACK { block_num: 1 }.to_bytes(), from)
            .await
            .unwrap();
        let (block, data, from) = recv_data(&peer).await;
        assert_eq!((block, data.len()), (2, 88));
        peer.send_to(&Packet::ACK { block_num: 2 }.to_bytes(), from)
            .await
            .unwrap();

        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn sender_gives_up_after_six_copies() {
        let (task, peer) = sender_under_test(b"abc").await;

        // The peer stays silent: the initial send plus five retransmits.
        let mut copies = 0;
        let mut buf = vec![0u8; 1024];
        while let Ok(recv) = tokio::time::timeout(
            Duration::from_millis(400),
            peer.recv_from(&mut buf),
        )
        .await
        {
            let (n, _) = recv.unwrap();
            match Packet::from_bytes(&buf[..n]).unwrap() {
                Packet::DATA { block_num: 1, .. } => copies += 1,
                other => panic!("expected DATA 1, got {other:?}"),
            }
        }
        assert_eq!(copies, 6);
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn sender_stops_on_peer_error() {
        static PAYLOAD: [u8; 2000] = [1; 2000];
        let (task, peer) = sender_under_test(&PAYLOAD).await;

        let (_, _, from) = recv_data(&peer).await;
        peer.send_to(
            &Packet::ERROR {
                code: ErrorCode::DiskFull.code(),
                msg: "Disk full".into(),
            }
            .to_bytes(),
            from,
        )
        .await
        .unwrap();

        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn receiver_acks_and_writes_until_short_block() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let near = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let near_addr = near.local_addr().unwrap();
        let chan = RequestChannel::latched(near, peer.local_addr().unwrap());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let sink = tokio::fs::File::create(&path).await.unwrap();
        let task = tokio::spawn(Receiver::new(chan, sink, fast_opts()).run());

        let mut buf = vec![0u8; 64];
        // Initial ACK 0 prompts the first DATA.
        let n = peer.recv(&mut buf).await.unwrap();
        assert_eq!(
            Packet::from_bytes(&buf[..n]).unwrap(),
            Packet::ACK { block_num: 0 }
        );

        let body = vec![0x42u8; 512];
        peer.send_to(
            &Packet::DATA {
                block_num: 1,
                data: body.clone(),
            }
            .to_bytes(),
            near_addr,
        )
        .await
        .unwrap();
        let n = peer.recv(&mut buf).await.unwrap();
        assert_eq!(
            Packet::from_bytes(&buf[..n]).unwrap(),
            Packet::ACK { block_num: 1 }
        );

        // A duplicate of block 1 is re-ACKed, not re-written.
        peer.send_to(
            &Packet::DATA {
                block_num: 1,
                data: body.clone(),
            }
            .to_bytes(),
            near_addr,
        )
        .await
        .unwrap();
        let n = peer.recv(&mut buf).await.unwrap();
        assert_eq!(
            Packet::from_bytes(&buf[..n]).unwrap(),
            Packet::ACK { block_num: 1 }
        );

        peer.send_to(
            &Packet::DATA {
                block_num: 2,
                data: b"tail".to_vec(),
            }
            .to_bytes(),
            near_addr,
        )
        .await
        .unwrap();
        let n = peer.recv(&mut buf).await.unwrap();
        assert_eq!(
            Packet::from_bytes(&buf[..n]).unwrap(),
            Packet::ACK { block_num: 2 }
        );

        task.await.unwrap().unwrap();
        let written = std::fs::read(&path).unwrap();
        assert_eq!(written.len(), 516);
        assert_eq!(&written[512..], b"tail");
    }
}
