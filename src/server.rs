use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use tokio::fs::File;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::channel::{Incoming, RequestChannel, Role, bind_transfer_socket};
use crate::options::{OPTION_TSIZE, TransferOptions, parse_options};
use crate::protocol::{ErrorCode, MAX_PACKET, MAX_RETRANSMITS, Packet, decode_u16};
use crate::session::{Receiver, Sender};

pub const MODE_OCTET: &str = "octet";

/// Server policy knobs, mirrored from the CLI flags.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Directory served to clients. Canonicalized at bind time.
    pub root: PathBuf,
    /// Refuse WRQs that would create a new file.
    pub disable_create: bool,
    /// Refuse all WRQs.
    pub disable_write: bool,
    /// Let WRQs replace existing files.
    pub allow_overwrite: bool,
    /// Reject non-octet transfer modes instead of serving them as octet.
    pub strict: bool,
    /// Plain RFC 1350: never acknowledge options.
    pub rfc1350: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Read,
    Write,
}

impl RequestKind {
    fn name(self) -> &'static str {
        match self {
            RequestKind::Read => "read",
            RequestKind::Write => "write",
        }
    }
}

/// The listener on the well-known port. Each accepted request gets its own
/// task, its own ephemeral socket, and its own file handle; the listener
/// socket itself carries only requests and pre-session errors.
pub struct TftpServer {
    sock: Arc<UdpSocket>,
    config: Arc<ServerConfig>,
}

impl TftpServer {
    /// Bind the well-known endpoint and validate the configuration. A root
    /// that is not a directory is a startup error.
    pub async fn bind(addr: SocketAddr, mut config: ServerConfig) -> Result<Self> {
        if config.disable_write && config.allow_overwrite {
            bail!("overwriting cannot be allowed while writes are disabled");
        }
        let meta = tokio::fs::metadata(&config.root)
            .await
            .with_context(|| format!("cannot stat server root {}", config.root.display()))?;
        if !meta.is_dir() {
            bail!("server root {} is not a directory", config.root.display());
        }
        config.root = tokio::fs::canonicalize(&config.root).await?;

        let sock = UdpSocket::bind(addr).await?;
        info!(
            "serving {} on {}",
            config.root.display(),
            sock.local_addr()?
        );
        Ok(Self {
            sock: Arc::new(sock),
            config: Arc::new(config),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.sock.local_addr()?)
    }

    /// Accept requests forever. Only decoding happens here; everything after
    /// that — policy, the OACK handshake, the transfer itself — runs on a
    /// spawned task so the listener never blocks on a handshake.
    pub async fn serve(self) -> Result<()> {
        let mut buf = vec![0u8; MAX_PACKET];
        loop {
            let (n, peer) = self.sock.recv_from(&mut buf).await?;
            let datagram = &buf[..n];

            let pkt = match Packet::from_bytes(datagram) {
                Ok(p) => p,
                Err(e) => {
                    let opcode = decode_u16(&datagram[..n.min(2)]);
                    if opcode == 1 || opcode == 2 {
                        debug!("{peer}: malformed request: {e}");
                        send_error_to(&self.sock, peer, ErrorCode::NotDefined, "Malformed message")
                            .await;
                    } else {
                        debug!("{peer}: ignoring undecodable datagram: {e}");
                    }
                    continue;
                }
            };

            let (kind, filename, mode, options) = match pkt {
                Packet::RRQ {
                    filename,
                    mode,
                    options,
                } => (RequestKind::Read, filename, mode, options),
                Packet::WRQ {
                    filename,
                    mode,
                    options,
                } => (RequestKind::Write, filename, mode, options),
                other => {
                    debug!("{peer}: ignoring {other:?} on the listener port");
                    continue;
                }
            };

            let listener = Arc::clone(&self.sock);
            let config = Arc::clone(&self.config);
            tokio::spawn(async move {
                if let Err(e) =
                    process_request(listener, config, peer, kind, &filename, &mode, options).await
                {
                    warn!("{peer}: {} request for {filename}: {e}", kind.name());
                }
            });
        }
    }
}

/// Policy checks, file open, option negotiation, and session handoff for one
/// accepted request. Pre-session errors go back from the listener socket;
/// once the ephemeral socket exists it carries the rest of the exchange.
async fn process_request(
    listener: Arc<UdpSocket>,
    config: Arc<ServerConfig>,
    peer: SocketAddr,
    kind: RequestKind,
    filename: &str,
    mode: &str,
    raw_options: HashMap<String, String>,
) -> Result<()> {
    info!(
        "{peer}: {} request for {filename} with mode {mode}",
        kind.name()
    );

    if kind == RequestKind::Write && config.disable_write {
        send_error_to(&listener, peer, ErrorCode::AccessViolation, "Writes disabled").await;
        bail!("writes disabled");
    }

    if mode != MODE_OCTET {
        if config.strict {
            send_error_to(&listener, peer, ErrorCode::AccessViolation, "Unsupported mode").await;
            bail!("unsupported mode {mode}");
        }
        warn!("{peer}: client asked for {mode} mode, transfer will be octet");
    }

    let path = match resolve_path(&config.root, filename) {
        Ok(p) => p,
        Err(e) => {
            send_error_to(
                &listener,
                peer,
                ErrorCode::AccessViolation,
                "Failed to open file",
            )
            .await;
            return Err(e);
        }
    };

    let exists = tokio::fs::metadata(&path).await.is_ok();
    match kind {
        RequestKind::Read if !exists => {
            send_error_to(&listener, peer, ErrorCode::FileNotFound, "File not found").await;
            bail!("{} not found", path.display());
        }
        RequestKind::Write if !exists && config.disable_create => {
            send_error_to(
                &listener,
                peer,
                ErrorCode::AccessViolation,
                "Cannot create new file",
            )
            .await;
            bail!("creation of new files is disabled");
        }
        RequestKind::Write if exists && !config.allow_overwrite => {
            send_error_to(
                &listener,
                peer,
                ErrorCode::FileExists,
                "Attempted overwrite of existing file",
            )
            .await;
            bail!("{} already exists", path.display());
        }
        _ => {}
    }

    let file = match open_file(kind, &path).await {
        Ok(f) => f,
        Err(e) => {
            send_error_to(
                &listener,
                peer,
                ErrorCode::AccessViolation,
                "Failed to open file",
            )
            .await;
            return Err(e);
        }
    };

    let (mut opts, mut acked) = parse_options(&raw_options);

    if config.rfc1350 {
        // Plain RFC 1350: requested options are ignored wholesale. Without
        // an OACK the client must assume the defaults, so the session has to
        // run on them too.
        opts = TransferOptions::default();
        acked.clear();
    }

    if let Some(requested) = opts.tsize {
        match kind {
            RequestKind::Read => {
                // The client asks for the size; answer with the real one.
                let size = file.metadata().await?.len();
                opts.tsize = Some(size);
                acked.insert(OPTION_TSIZE.to_string(), size.to_string());
            }
            RequestKind::Write => {
                acked.insert(OPTION_TSIZE.to_string(), requested.to_string());
            }
        }
    }

    let sock = bind_transfer_socket(peer, opts.block_size)?;
    let mut chan = RequestChannel::latched(sock, peer);

    if !config.rfc1350 && !acked.is_empty() {
        debug!("{peer}: acknowledging options {acked:?}");
        chan.send_oack(&acked).await?;
        opts.oack_sent = true;

        // Reads wait for the client's ACK before data flows; for writes the
        // client's first DATA is the implicit acknowledgement.
        if kind == RequestKind::Read {
            await_oack_ack(&mut chan, &acked).await?;
        }
    }

    match kind {
        RequestKind::Read => Sender::new(chan, file, opts).run().await,
        RequestKind::Write => Receiver::new(chan, file, opts).run().await,
    }
}

async fn open_file(kind: RequestKind, path: &Path) -> Result<File> {
    match kind {
        RequestKind::Read => Ok(File::open(path).await?),
        RequestKind::Write => {
            // Uploads may target nested paths under the root.
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            Ok(File::create(path).await?)
        }
    }
}

/// After OACKing a read request, wait for the client's ACK(0), re-sending
/// the OACK on timeout up to the usual retransmit limit.
async fn await_oack_ack(chan: &mut RequestChannel, acked: &HashMap<String, String>) -> Result<()> {
    let wait_opts = TransferOptions::default();
    let mut retransmits = 0u32;
    loop {
        match chan.read_next(Role::Sender, &wait_opts).await? {
            Incoming::Ack { .. } => return Ok(()),
            Incoming::Retransmit => {
                if retransmits >= MAX_RETRANSMITS {
                    bail!("no acknowledgement of OACK after {MAX_RETRANSMITS} retransmits");
                }
                retransmits += 1;
                debug!("re-sending OACK");
                chan.send_oack(acked).await?;
            }
            Incoming::Error { code, msg } => {
                bail!("peer rejected options: error {code}: {msg}");
            }
            other => {
                chan.send_error(ErrorCode::IllegalOperation, "Invalid operation during read")
                    .await?;
                bail!("unexpected {other:?} while awaiting OACK acknowledgement");
            }
        }
    }
}

async fn send_error_to(sock: &UdpSocket, peer: SocketAddr, code: ErrorCode, msg: &str) {
    let pkt = Packet::ERROR {
        code: code.code(),
        msg: msg.to_string(),
    };
    if let Err(e) = sock.send_to(&pkt.to_bytes(), peer).await {
        debug!("{peer}: failed to send error reply: {e}");
    }
}

/// Map a requested name to a path under the served root.
///
/// Every occurrence of the literal `..` is removed from the name before it
/// is joined beneath the root, and the deepest existing ancestor of the
/// result must canonicalize to a location under the (canonical) root, so
/// neither traversal sequences nor symlinks can escape it. Absolute names
/// are treated as root-relative.
pub(crate) fn resolve_path(root: &Path, filename: &str) -> Result<PathBuf> {
    let cleaned = filename.replace('\\', "/").replace("..", "");

    let relative: PathBuf = cleaned
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect();

    if relative.as_os_str().is_empty() {
        return Err(anyhow!("invalid filename"));
    }

    let candidate = root.join(&relative);

    let canonical_root = root
        .canonicalize()
        .map_err(|e| anyhow!("cannot canonicalize served directory: {e}"))?;

    if candidate.exists() {
        let canonical = candidate
            .canonicalize()
            .map_err(|e| anyhow!("cannot canonicalize path: {e}"))?;
        if !canonical.starts_with(&canonical_root) {
            return Err(anyhow!("path escapes served directory"));
        }
        Ok(canonical)
    } else {
        // Walk up until we find an existing ancestor.
        let mut ancestor = candidate.parent();
        while let Some(a) = ancestor {
            if a.exists() {
                let canonical_ancestor = a
                    .canonicalize()
                    .map_err(|e| anyhow!("cannot canonicalize ancestor: {e}"))?;
                if !canonical_ancestor.starts_with(&canonical_root) {
                    return Err(anyhow!("path escapes served directory"));
                }
                return Ok(candidate);
            }
            ancestor = a.parent();
        }
        Err(anyhow!("path escapes served directory"))
    }
}
