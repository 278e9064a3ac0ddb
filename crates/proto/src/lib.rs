//! Wire-format helpers for the DNS forwarding engine.
//!
//! This crate deliberately does not implement general-purpose DNS message
//! parsing or zone data structures — that is the job of the answer cache
//! this engine forwards around. It implements exactly the header-level
//! field access the forwarding engine needs: reading and rewriting the
//! transaction ID, inspecting the QR/RA/opcode/rcode bits, locating the
//! EDNS OPT pseudo-RR to clamp its advertised UDP size, and synthesizing
//! the handful of canned replies (SERVFAIL, NXDOMAIN, NOERROR-empty, a
//! literal address) the engine is allowed to answer with directly.

pub mod error;
pub mod header;
pub mod reply;

pub use error::ProtoError;
pub use header::{
    clamp_u16_field, find_opt_udp_size_offset, peek, question, Header, HeaderView, Opcode, Question, Rcode, TYPE_A,
    TYPE_AAAA,
};
pub use reply::{synthesize_reply, ReplyFlags};
