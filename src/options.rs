use std::collections::HashMap;
use std::time::Duration;

use crate::protocol::{BLOCK_SIZE, MAX_BLKSIZE, MIN_BLKSIZE};

pub const OPTION_BLKSIZE: &str = "blksize";
pub const OPTION_TIMEOUT: &str = "timeout";
pub const OPTION_TSIZE: &str = "tsize";

/// Retransmit/read timeout when the peer negotiated nothing else (RFC 1350).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const MIN_TIMEOUT_SECS: u64 = 1;
const MAX_TIMEOUT_SECS: u64 = 255;

/// The effective per-session settings. The defaults comply with RFC 1350 and
/// behave as if no options were given.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferOptions {
    /// Bytes per DATA payload (RFC 2348).
    pub block_size: usize,
    /// Read deadline for one expected reply (RFC 2349).
    pub timeout: Duration,
    /// Blocks in flight. Always 1; windowing is not supported.
    pub window_size: u16,
    /// Expected transfer size (RFC 2349). `None` when not requested.
    pub tsize: Option<u64>,
    /// Whether this side already emitted an OACK for the session. A server
    /// receiver with this set must not send the initial ACK(0).
    pub oack_sent: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            block_size: BLOCK_SIZE,
            timeout: DEFAULT_TIMEOUT,
            window_size: 1,
            tsize: None,
            oack_sent: false,
        }
    }
}

/// Interpret the option map of an RRQ/WRQ. Returns the effective options and
/// the map to echo back in an OACK.
///
/// Recognized values are adopted and echoed; out-of-range values fall back to
/// the default, which is echoed instead; unparseable and unrecognized options
/// are omitted. An empty acknowledged map means no OACK is owed. `tsize` is
/// recorded but never echoed here; the dispatcher substitutes the file size
/// on a read and the client's own value on a write.
pub fn parse_options(
    requested: &HashMap<String, String>,
) -> (TransferOptions, HashMap<String, String>) {
    let mut opts = TransferOptions::default();
    let mut acked = HashMap::new();

    for (name, value) in requested {
        match name.as_str() {
            OPTION_BLKSIZE => {
                let Ok(val) = value.parse::<usize>() else {
                    continue;
                };
                if !(MIN_BLKSIZE..=MAX_BLKSIZE).contains(&val) {
                    acked.insert(OPTION_BLKSIZE.to_string(), opts.block_size.to_string());
                    continue;
                }
                opts.block_size = val;
                acked.insert(OPTION_BLKSIZE.to_string(), value.clone());
            }
            OPTION_TIMEOUT => {
                let Ok(val) = value.parse::<u64>() else {
                    continue;
                };
                if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&val) {
                    acked.insert(
                        OPTION_TIMEOUT.to_string(),
                        opts.timeout.as_secs().to_string(),
                    );
                    continue;
                }
                opts.timeout = Duration::from_secs(val);
                acked.insert(OPTION_TIMEOUT.to_string(), value.clone());
            }
            OPTION_TSIZE => {
                let Ok(val) = value.parse::<u64>() else {
                    continue;
                };
                opts.tsize = Some(val);
            }
            _ => {} // Unrecognized options are silently omitted from the OACK.
        }
    }

    (opts, acked)
}

/// Adopt a server OACK verbatim (RFC 2347: the server's reply is final).
/// Used by the client once the OACK for its RRQ/WRQ arrives.
pub fn adopt_oack(opts: &mut TransferOptions, acked: &HashMap<String, String>) {
    if let Some(val) = acked.get(OPTION_BLKSIZE)
        && let Ok(size) = val.parse::<usize>()
    {
        opts.block_size = size;
    }
    if let Some(val) = acked.get(OPTION_TIMEOUT)
        && let Ok(secs) = val.parse::<u64>()
    {
        opts.timeout = Duration::from_secs(secs);
    }
    if let Some(val) = acked.get(OPTION_TSIZE)
        && let Ok(size) = val.parse::<u64>()
    {
        opts.tsize = Some(size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn no_options_means_no_oack() {
        let (opts, acked) = parse_options(&HashMap::new());
        assert_eq!(opts, TransferOptions::default());
        assert!(acked.is_empty());
    }

    #[test]
    fn blksize_in_range_is_adopted() {
        for val in ["8", "1428", "65464"] {
            let (opts, acked) = parse_options(&request(&[("blksize", val)]));
            assert_eq!(opts.block_size, val.parse::<usize>().unwrap());
            assert_eq!(acked.get("blksize").unwrap(), val);
        }
    }

    #[test]
    fn blksize_out_of_range_echoes_default() {
        for val in ["7", "65465", "0"] {
            let (opts, acked) = parse_options(&request(&[("blksize", val)]));
            assert_eq!(opts.block_size, BLOCK_SIZE);
            assert_eq!(acked.get("blksize").unwrap(), "512");
        }
    }

    #[test]
    fn blksize_unparseable_is_ignored() {
        let (opts, acked) = parse_options(&request(&[("blksize", "huge")]));
        assert_eq!(opts.block_size, BLOCK_SIZE);
        assert!(acked.is_empty());
    }

    #[test]
    fn timeout_in_range_is_adopted() {
        for val in ["1", "30", "255"] {
            let (opts, acked) = parse_options(&request(&[("timeout", val)]));
            assert_eq!(opts.timeout.as_secs(), val.parse::<u64>().unwrap());
            assert_eq!(acked.get("timeout").unwrap(), val);
        }
    }

    #[test]
    fn timeout_out_of_range_echoes_default() {
        for val in ["0", "256"] {
            let (opts, acked) = parse_options(&request(&[("timeout", val)]));
            assert_eq!(opts.timeout, DEFAULT_TIMEOUT);
            assert_eq!(acked.get("timeout").unwrap(), "5");
        }
    }

    #[test]
    fn tsize_is_recorded_but_not_echoed() {
        let (opts, acked) = parse_options(&request(&[("tsize", "1800")]));
        assert_eq!(opts.tsize, Some(1800));
        assert!(acked.get("tsize").is_none());
    }

    #[test]
    fn unknown_option_is_omitted() {
        let (opts, acked) = parse_options(&request(&[("windowsize", "16")]));
        assert_eq!(opts, TransferOptions::default());
        assert!(acked.is_empty());
    }

    #[test]
    fn oack_values_are_adopted_verbatim() {
        let mut opts = TransferOptions::default();
        adopt_oack(
            &mut opts,
            &request(&[("blksize", "1024"), ("timeout", "3"), ("tsize", "1800")]),
        );
        assert_eq!(opts.block_size, 1024);
        assert_eq!(opts.timeout, Duration::from_secs(3));
        assert_eq!(opts.tsize, Some(1800));
    }
}
