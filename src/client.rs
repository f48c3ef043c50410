use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Result, bail};
use tokio::fs::File;
use tracing::{debug, info, warn};

use crate::channel::{Incoming, RequestChannel, Role, bind_transfer_socket};
use crate::options::{
    OPTION_BLKSIZE, OPTION_TSIZE, TransferOptions, adopt_oack,
};
use crate::protocol::{ErrorCode, MAX_RETRANSMITS};
use crate::server::MODE_OCTET;
use crate::session::{PendingRequest, Receiver, Sender};

/// Block size the client asks a server for: a full payload inside a typical
/// 1500-byte Ethernet MTU after IP + UDP + TFTP headers.
pub const PREFERRED_BLKSIZE: usize = 1428;

/// Download `remote_path` from the server into `local_path` (truncating it).
///
/// The request carries the preferred block size and a zero `tsize` probe
/// unless `rfc1350` suppresses options entirely; the receive loop deals with
/// whichever the server answers with first (OACK or DATA).
pub async fn get(
    server: SocketAddr,
    remote_path: &str,
    local_path: &Path,
    rfc1350: bool,
) -> Result<()> {
    let file = File::create(local_path).await?;

    let options = if rfc1350 {
        HashMap::new()
    } else {
        let mut map = HashMap::new();
        map.insert(OPTION_BLKSIZE.to_string(), PREFERRED_BLKSIZE.to_string());
        map.insert(OPTION_TSIZE.to_string(), "0".to_string());
        map
    };

    let sock = bind_transfer_socket(server, PREFERRED_BLKSIZE)?;
    let chan = RequestChannel::new(sock, server);
    chan.send_rrq(remote_path, MODE_OCTET, &options).await?;
    info!("requesting {remote_path} from {server}");

    // Until the server answers, a timeout re-sends the request itself.
    let request = PendingRequest {
        filename: remote_path.to_string(),
        mode: MODE_OCTET.to_string(),
        options,
    };
    let opts = TransferOptions::default();
    Receiver::with_pending_request(chan, file, opts, request)
        .run()
        .await
}

/// Upload `local_path` to the server as `remote_path`.
///
/// Sends the WRQ with the preferred block size and the file's size as
/// `tsize`, then waits for the server to commit: an OACK (options adopted),
/// a plain ACK(0) from a legacy server, or an error.
pub async fn put(
    server: SocketAddr,
    local_path: &Path,
    remote_path: &str,
    rfc1350: bool,
) -> Result<()> {
    let file = File::open(local_path).await?;
    let size = file.metadata().await?.len();

    let options = if rfc1350 {
        HashMap::new()
    } else {
        let mut map = HashMap::new();
        map.insert(OPTION_BLKSIZE.to_string(), PREFERRED_BLKSIZE.to_string());
        map.insert(OPTION_TSIZE.to_string(), size.to_string());
        map
    };

    let sock = bind_transfer_socket(server, PREFERRED_BLKSIZE)?;
    let mut chan = RequestChannel::new(sock, server);
    chan.send_wrq(remote_path, MODE_OCTET, &options).await?;
    info!("sending {} ({size} bytes) to {server} as {remote_path}", local_path.display());

    let mut opts = TransferOptions::default();
    let mut retransmits = 0u32;
    loop {
        match chan.read_next(Role::Sender, &opts).await? {
            Incoming::Oack { options } => {
                debug!("server acknowledged options {options:?}");
                adopt_oack(&mut opts, &options);
                break;
            }
            Incoming::Ack { block_num: 0 } => {
                // Legacy server: no options in play.
                break;
            }
            Incoming::Ack { block_num } => {
                debug!("ignoring stray ACK {block_num} while awaiting the write handshake");
            }
            Incoming::Error { code, msg } => {
                warn!("server refused write: error {code}: {msg}");
                bail!("server error {code}: {msg}");
            }
            Incoming::Retransmit => {
                if retransmits >= MAX_RETRANSMITS {
                    bail!("no reply to write request after {MAX_RETRANSMITS} retransmits");
                }
                retransmits += 1;
                debug!("timeout, re-sending write request for {remote_path}");
                chan.send_wrq(remote_path, MODE_OCTET, &options).await?;
            }
            other => {
                chan.send_error(ErrorCode::IllegalOperation, "Invalid operation during write")
                    .await?;
                bail!("unexpected {other:?} while awaiting the write handshake");
            }
        }
    }

    Sender::new(chan, file, opts).run().await
}
