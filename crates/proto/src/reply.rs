//! Synthesis of the canned replies the forwarding engine is allowed to
//! answer with locally: an empty NOERROR, an NXDOMAIN, a literal address,
//! or (flags = 0) a SERVFAIL-like empty reply used when no upstream could
//! be reached.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::ProtoError;
use crate::header::{self, Header, Rcode, HEADER_LEN};

/// Mirrors the distilled spec's `flags` result from the server selector:
/// `F_NOERR`, `F_NXDOMAIN`, a literal `F_IPV4`/`F_IPV6` address, or `0`
/// (forward upstream failed, answer SERVFAIL).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyFlags {
    /// NOERROR with an empty answer section.
    NoError,
    /// NXDOMAIN.
    NxDomain,
    /// A literal IPv4 address configured for this upstream entry.
    Ipv4(Ipv4Addr),
    /// A literal IPv6 address configured for this upstream entry.
    Ipv6(Ipv6Addr),
    /// No upstream reachable: synthesize a SERVFAIL.
    ServFail,
}

const ANSWER_NAME_POINTER: [u8; 2] = [0xc0, 0x0c];
const TYPE_A: u16 = 1;
const TYPE_AAAA: u16 = 28;
const CLASS_IN: u16 = 1;

/// Rewrite `msg` in place as an authoritative-looking reply to the
/// question it already carries, truncating any answer/authority/
/// additional sections the original query had (a query never legitimately
/// carries any, but defensively drop them anyway) and appending at most
/// one answer record. Returns the new total length.
pub fn synthesize_reply(msg: &mut Vec<u8>, flags: ReplyFlags, ttl: u32) -> Result<usize, ProtoError> {
    let question_end = header::first_question_end(msg).ok_or(ProtoError::ShortMessage { len: msg.len() })?;
    msg.truncate(question_end);

    let mut header = Header::new(msg)?;
    header.set_qr(true);
    header.set_ra(true);
    header.set_nscount(0);
    header.set_arcount(0);

    match flags {
        ReplyFlags::NoError => {
            header.set_rcode(Rcode::NoError);
            header.set_ancount(0);
        }
        ReplyFlags::NxDomain => {
            header.set_rcode(Rcode::NxDomain);
            header.set_ancount(0);
        }
        ReplyFlags::ServFail => {
            header.set_rcode(Rcode::ServFail);
            header.set_ancount(0);
        }
        ReplyFlags::Ipv4(addr) => {
            header.set_rcode(Rcode::NoError);
            header.set_ancount(1);
            drop(header);
            append_answer(msg, TYPE_A, ttl, &addr.octets());
        }
        ReplyFlags::Ipv6(addr) => {
            header.set_rcode(Rcode::NoError);
            header.set_ancount(1);
            drop(header);
            append_answer(msg, TYPE_AAAA, ttl, &addr.octets());
        }
    }

    Ok(msg.len())
}

fn append_answer(msg: &mut Vec<u8>, rtype: u16, ttl: u32, rdata: &[u8]) {
    msg.extend_from_slice(&ANSWER_NAME_POINTER);
    msg.extend_from_slice(&rtype.to_be_bytes());
    msg.extend_from_slice(&CLASS_IN.to_be_bytes());
    msg.extend_from_slice(&ttl.to_be_bytes());
    msg.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
    msg.extend_from_slice(rdata);
}
