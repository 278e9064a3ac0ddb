//! Error type for malformed or truncated DNS messages.

/// Errors raised while reading or rewriting the fixed-size header fields
/// this crate cares about. Anything else — a malformed question section,
/// a truncated resource record — is the answer cache's problem, not this
/// crate's; forwarding only ever needs the 12-byte header and, optionally,
/// the OPT pseudo-RR.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// The message is shorter than the fixed 12-byte DNS header.
    #[error("message of {len} bytes is shorter than a DNS header")]
    ShortMessage {
        /// The length that was actually present.
        len: usize,
    },

    /// The OPT pseudo-RR's advertised UDP payload size field did not fit
    /// in the message the caller handed us.
    #[error("OPT record at offset {offset} is truncated")]
    TruncatedOpt {
        /// Offset at which the truncated field starts.
        offset: usize,
    },
}
