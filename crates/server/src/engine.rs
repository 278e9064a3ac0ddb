//! The forwarding engine: wires the selector, forwarding table, and
//! upstream set together into the decision the socket layers need —
//! answer now, forward (and to which upstreams), or drop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use dnsfwd_proto::{peek, question, Header, Opcode, Rcode, ReplyFlags, TYPE_AAAA};
use rand::rngs::ThreadRng;
use tokio::net::UdpSocket;

use crate::counters::Counters;
use crate::frec::{Frec, ForwardingTable, TableFullReason};
use crate::interface::PacketInfo;
use crate::observer::{LocalAnswer, ReplyObserver};
use crate::selector::{classify, QueryKind, SelectOutcome};
use crate::upstream::{UpstreamFlags, UpstreamSet};
use crate::Options;

/// The selector's verdict, shared between the UDP and TCP serving loops:
/// both need "answer now" vs. "forward to this restricted subset", only
/// the bookkeeping around forwarding differs (UDP needs a table slot and
/// a substitute transaction ID for fan-out correlation; TCP's one
/// request/response per connection needs neither).
enum Classified {
    Answer(Vec<u8>),
    Forward { kind: UpstreamFlags, domain: Option<String> },
    Drop,
}

/// What the UDP serving loop should do with one incoming query.
pub enum Decision {
    /// Send `message` straight back; nothing was forwarded.
    Answer(Vec<u8>),
    /// Forward `message` to the upstreams named by `targets`, tracking
    /// the attempt under forwarding-table slot `table_index`.
    Forward {
        table_index: usize,
        targets: Vec<usize>,
        message: Vec<u8>,
    },
    /// Malformed, non-query, or the table has no room — nothing to send.
    Drop,
}

/// What the TCP serving loop should do with one incoming query. No
/// transaction-ID substitution or table slot: a TCP connection handles
/// one query at a time, so there is nothing to correlate a reply against
/// beyond "the query I just sent on this stream".
pub enum TcpDecision {
    Answer(Vec<u8>),
    Forward { targets: Vec<SocketAddr>, message: Vec<u8> },
    Drop,
}

pub struct ForwardingEngine {
    pub options: Options,
    pub servers: UpstreamSet,
    pub counters: Counters,
    pub cache: Box<dyn LocalAnswer>,
    pub observer: Box<dyn ReplyObserver>,
    /// Index of the plain upstream that answered most recently. Queries
    /// with no kind/domain restriction start their ring walk here instead
    /// of always at index 0, so a consistently fast upstream keeps
    /// getting asked first (§4.F's "sticky server" promotion).
    sticky: AtomicUsize,
    /// Last time the table-overflow warning fired, so a sustained flood
    /// logs at most once per `log_rate` rather than once per query.
    last_table_full_warning: Mutex<Option<Instant>>,
}

/// Upper bound on a reply a [`LocalAnswer`] cache can hand back; larger
/// than any DNS-over-UDP message, so a real implementation never has to
/// truncate a legitimate answer to fit.
const MAX_CACHE_REPLY: usize = 65535;

impl ForwardingEngine {
    pub fn new(options: Options, servers: UpstreamSet, cache: Box<dyn LocalAnswer>, observer: Box<dyn ReplyObserver>) -> Self {
        Self {
            options,
            servers,
            counters: Counters::default(),
            cache,
            observer,
            sticky: AtomicUsize::new(0),
            last_table_full_warning: Mutex::new(None),
        }
    }

    /// Implements §4.A/B: parse just enough of the query to classify it,
    /// consulting the local-answer hook before the selector so a cache
    /// (if one is wired in) always gets first refusal.
    fn classify_message(&self, raw: &[u8]) -> Classified {
        Counters::inc(&self.counters.queries_received);

        let Some(parsed) = question(raw) else {
            return Classified::Drop;
        };
        match peek(raw) {
            Some(view) if view.is_query() => {}
            _ => return Classified::Drop,
        }

        let mut cache_buf = [0u8; MAX_CACHE_REPLY];
        let cache_len = self.cache.answer(raw, &mut cache_buf);
        if cache_len > 0 {
            Counters::inc(&self.counters.answered_locally);
            return Classified::Answer(cache_buf[..cache_len].to_vec());
        }

        let qtype = match parsed.qtype {
            dnsfwd_proto::TYPE_A => QueryKind::Ipv4,
            TYPE_AAAA => QueryKind::Ipv6,
            _ => QueryKind::Other,
        };

        match classify(&self.servers, qtype, &parsed.name, &self.options) {
            SelectOutcome::Answer(flags) => {
                Counters::inc(&self.counters.answered_locally);
                match self.answer_bytes(raw, flags) {
                    Some(message) => Classified::Answer(message),
                    None => Classified::Drop,
                }
            }
            SelectOutcome::Forward { kind, domain } => Classified::Forward { kind, domain },
        }
    }

    fn answer_bytes(&self, raw: &[u8], flags: ReplyFlags) -> Option<Vec<u8>> {
        let mut message = raw.to_vec();
        dnsfwd_proto::synthesize_reply(&mut message, flags, self.options.local_ttl).ok()?;
        Some(message)
    }

    /// §4.C/§6: logs the table-overflow warning at most once per
    /// `log_rate`, so a client flooding retransmits doesn't flood the log
    /// alongside it.
    fn warn_table_full(&self) {
        let mut last = self.last_table_full_warning.lock().unwrap();
        let now = Instant::now();
        let should_log = match *last {
            Some(prev) => now.saturating_duration_since(prev) >= self.options.log_rate,
            None => true,
        };
        if should_log {
            tracing::warn!("forwarding table overflow: check for server loops");
            *last = Some(now);
        }
    }

    /// Implements §4.D for the UDP path: classify the query and, if it
    /// must be forwarded, reserve a forwarding-table slot and substitute
    /// a fresh transaction ID before handing the message back to the
    /// caller to send.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_query(
        &self,
        table: &mut ForwardingTable,
        rng: &mut ThreadRng,
        raw: &[u8],
        client_addr: SocketAddr,
        listener: Arc<UdpSocket>,
        local_info: PacketInfo,
        now: Instant,
    ) -> Decision {
        match self.classify_message(raw) {
            Classified::Answer(message) => Decision::Answer(message),
            Classified::Drop => Decision::Drop,
            Classified::Forward { kind, domain } => {
                self.start_forward(table, rng, raw, client_addr, listener, local_info, kind, domain, now)
            }
        }
    }

    /// The TCP equivalent of [`ForwardingEngine::handle_query`]: no table
    /// slot, no ID substitution, just "who do I ask and what do I send".
    pub fn handle_query_tcp(&self, raw: &[u8]) -> TcpDecision {
        match self.classify_message(raw) {
            Classified::Answer(message) => TcpDecision::Answer(message),
            Classified::Drop => TcpDecision::Drop,
            Classified::Forward { kind, domain } => {
                let targets = self.eligible_targets(kind, domain.as_deref());
                if targets.is_empty() {
                    return TcpDecision::Drop;
                }
                Counters::inc(&self.counters.queries_forwarded);
                TcpDecision::Forward {
                    targets: targets.into_iter().map(|idx| self.servers.get(idx).addr).collect(),
                    message: raw.to_vec(),
                }
            }
        }
    }

    /// Implements §4.C's retransmission coalescing alongside §4.D's
    /// eligibility/fan-out: a client retransmit of `(client_addr,
    /// client_id)` that is still in flight reuses its existing slot and
    /// `forward_id` rather than burning a fresh one, picking up any
    /// targets eligibility has newly opened up; a first-seen query
    /// allocates a slot and an ID the usual way.
    #[allow(clippy::too_many_arguments)]
    fn start_forward(
        &self,
        table: &mut ForwardingTable,
        rng: &mut ThreadRng,
        raw: &[u8],
        client_addr: SocketAddr,
        listener: Arc<UdpSocket>,
        local_info: PacketInfo,
        kind: UpstreamFlags,
        domain: Option<String>,
        now: Instant,
    ) -> Decision {
        if self.servers.is_empty() {
            return Decision::Drop;
        }

        let targets = self.eligible_targets(kind, domain.as_deref());
        if targets.is_empty() {
            return Decision::Drop;
        }

        let client_id = peek(raw).map(|v| v.id).unwrap_or(0);

        let (table_index, forward_id) = if let Some(idx) = table.lookup_by_sender(client_addr, client_id) {
            let frec = table.get_mut(idx).expect("lookup_by_sender returned a live index");
            for &target in &targets {
                if !frec.sent_to.contains(&target) {
                    frec.sent_to.push(target);
                }
            }
            (idx, frec.forward_id)
        } else {
            let idx = match table.get_new(now) {
                Ok((idx, evicted)) => {
                    if evicted {
                        Counters::inc(&self.counters.table_abandoned);
                    }
                    idx
                }
                Err(TableFullReason::AllSlotsLive) => {
                    self.warn_table_full();
                    Counters::inc(&self.counters.table_full);
                    return Decision::Drop;
                }
            };

            let Some(forward_id) = table.allocate_id(rng) else {
                Counters::inc(&self.counters.id_collisions_exhausted);
                return Decision::Drop;
            };

            table.insert(
                idx,
                Frec {
                    client_addr,
                    client_id,
                    forward_id,
                    kind,
                    domain,
                    sent_to: vec![targets[0]],
                    created: now,
                    answered: false,
                    listener,
                    local_info,
                },
            );
            (idx, forward_id)
        };

        let mut message = raw.to_vec();
        if let Ok(mut header) = Header::new(&mut message) {
            header.set_id(forward_id);
        }

        Counters::inc(&self.counters.queries_forwarded);
        Decision::Forward {
            table_index,
            targets,
            message,
        }
    }

    /// §4.D's eligibility rule: an upstream is eligible if it is plain
    /// (no kind restriction) or its kind/domain exactly matches what the
    /// selector decided for this query. Plain queries walk the ring
    /// starting at the sticky index rather than always starting at 0,
    /// unless `ORDER` pins every plain query's walk to the head of the
    /// list.
    fn eligible_targets(&self, kind: UpstreamFlags, domain: Option<&str>) -> Vec<usize> {
        if self.servers.is_empty() {
            return Vec::new();
        }
        let start = if kind.is_empty() && !self.options.strict_order {
            self.sticky.load(Ordering::Relaxed) % self.servers.len()
        } else {
            0
        };
        self.servers
            .ring_from(start)
            .filter(|(_, server)| {
                if server.is_literal() || server.is_no_addr() {
                    return false;
                }
                if kind.is_empty() {
                    server.kind().is_empty()
                } else if kind == UpstreamFlags::HAS_DOMAIN {
                    server.kind() == kind && domain.is_some_and(|d| server.domain_matches(d))
                } else {
                    server.kind() == kind
                }
            })
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Implements §4.F/part of §4.E: validate an upstream reply against
    /// the forwarding-table entry it claims to answer, apply the
    /// EDNS-clamp/recursion/bogus-wildcard checks, feed a cache observer
    /// if one is wired in, and produce everything the UDP loop needs to
    /// relay it — destination, the socket/source address to relay it
    /// from, and the bytes with the original transaction ID restored.
    pub fn handle_reply(
        &self,
        table: &mut ForwardingTable,
        table_index: usize,
        from: SocketAddr,
        raw: &[u8],
    ) -> Option<RelayReply> {
        let frec = table.get_mut(table_index)?;
        if frec.answered {
            return None;
        }

        let Some(view) = peek(raw) else {
            Counters::inc(&self.counters.replies_bogus);
            return None;
        };

        // §4.F step 2: only a non-recursive upstream that also has
        // nothing to say (NOERROR, no answers) is dropped outright; an
        // authoritative answer or a real error still gets relayed even
        // with RA unset.
        if !view.ra && matches!(view.rcode, Rcode::NoError) && view.ancount == 0 {
            self.observer.on_rejected("", from, "non-recursive upstream");
            Counters::inc(&self.counters.replies_bogus);
            return None;
        }

        let client_addr = frec.client_addr;
        let client_id = frec.client_id;
        let listener = frec.listener.clone();
        let local_info = frec.local_info;
        let was_plain = frec.kind.is_empty();

        let mut message = raw.to_vec();

        // §4.F step 1: the clamp applies to what the client is about to
        // see, i.e. the reply, not the query we already sent upstream.
        if let Some(offset) = dnsfwd_proto::find_opt_udp_size_offset(&message) {
            dnsfwd_proto::clamp_u16_field(&mut message, offset, self.options.edns_packet_max);
        }

        // §4.F step 3 / bogus-wildcard check: only a plain query reply
        // carrying a cacheable result is eligible for either check.
        if matches!(view.opcode, Opcode::Query) && matches!(view.rcode, Rcode::NoError | Rcode::NxDomain) {
            if self.observer.is_bogus_wildcard(&message) {
                self.observer.on_rejected("", from, "bogus wildcard nxdomain");
                Counters::inc(&self.counters.replies_bogus);
                return None;
            }
            if matches!(view.rcode, Rcode::NoError) && view.ancount > 0 {
                self.observer.observe_positive(&message);
            } else {
                self.observer.observe_negative(&message);
            }
        }

        frec.answered = true;

        if was_plain {
            if let Some((idx, _)) = self.servers.iter().find(|(_, s)| s.addr == from) {
                self.sticky.store(idx, Ordering::Relaxed);
            }
        }

        if let Ok(mut header) = Header::new(&mut message) {
            header.set_id(client_id);
        }

        Counters::inc(&self.counters.replies_relayed);
        Some(RelayReply {
            client_addr,
            listener,
            local_info,
            message,
        })
    }
}

/// Everything the UDP loop needs to send a validated reply back to the
/// original client, pinned to the address it queried.
pub struct RelayReply {
    pub client_addr: SocketAddr,
    pub listener: Arc<UdpSocket>,
    pub local_info: PacketInfo,
    pub message: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::{NoCache, NoopObserver};
    use crate::upstream::UpstreamServer;
    use std::sync::Arc;
    use std::time::Duration;

    fn query_message(id: u16, name_labels: &[&str], qtype: u16) -> Vec<u8> {
        let mut msg = vec![0u8; 12];
        {
            let mut h = Header::new(&mut msg).unwrap();
            h.set_id(id);
            h.set_qdcount(1);
            h.set_ra(false);
        }
        for label in name_labels {
            msg.push(label.len() as u8);
            msg.extend_from_slice(label.as_bytes());
        }
        msg.push(0);
        msg.extend_from_slice(&qtype.to_be_bytes());
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg
    }

    async fn socket() -> Arc<tokio::net::UdpSocket> {
        Arc::new(tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap())
    }

    fn local_info() -> PacketInfo {
        PacketInfo {
            local_addr: "127.0.0.1".parse().unwrap(),
            if_index: 0,
        }
    }

    async fn engine_with_one_plain_upstream() -> ForwardingEngine {
        let sock = socket().await;
        let servers = UpstreamSet::new(vec![UpstreamServer {
            addr: "127.0.0.1:5300".parse().unwrap(),
            flags: UpstreamFlags::empty(),
            domain: None,
            literal: None,
            udp: sock,
        }]);
        ForwardingEngine::new(Options::default(), servers, Box::new(NoCache), Box::new(NoopObserver))
    }

    #[tokio::test]
    async fn forwards_plain_query_and_allocates_table_slot() {
        let engine = engine_with_one_plain_upstream().await;
        let mut table = ForwardingTable::new(engine.options.max_in_flight, engine.options.forward_timeout, engine.options.id_retries);
        let mut rng = rand::thread_rng();
        let msg = query_message(0xaaaa, &["example", "com"], dnsfwd_proto::TYPE_A);
        let listener = socket().await;

        let decision = engine.handle_query(
            &mut table,
            &mut rng,
            &msg,
            "127.0.0.1:9000".parse().unwrap(),
            listener,
            local_info(),
            Instant::now(),
        );
        match decision {
            Decision::Forward { table_index, targets, .. } => {
                assert_eq!(targets, vec![0]);
                assert!(table.get(table_index).is_some());
            }
            _ => panic!("expected Forward"),
        }
    }

    #[tokio::test]
    async fn nodots_local_answers_without_forwarding() {
        let mut engine = engine_with_one_plain_upstream().await;
        engine.options.nodots_local = true;
        let mut table = ForwardingTable::new(4, Duration::from_secs(1), 5);
        let mut rng = rand::thread_rng();
        let msg = query_message(1, &["nosuchlabel"], dnsfwd_proto::TYPE_A);
        let listener = socket().await;

        let decision = engine.handle_query(
            &mut table,
            &mut rng,
            &msg,
            "127.0.0.1:9000".parse().unwrap(),
            listener,
            local_info(),
            Instant::now(),
        );
        assert!(matches!(decision, Decision::Answer(_)));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn reply_round_trip_restores_client_id() {
        let engine = engine_with_one_plain_upstream().await;
        let mut table = ForwardingTable::new(4, Duration::from_secs(10), 5);
        let mut rng = rand::thread_rng();
        let msg = query_message(0x1234, &["example", "com"], dnsfwd_proto::TYPE_A);
        let client = "127.0.0.1:9000".parse().unwrap();
        let listener = socket().await;

        let (table_index, targets) = match engine.handle_query(&mut table, &mut rng, &msg, client, listener, local_info(), Instant::now()) {
            Decision::Forward { table_index, targets, .. } => (table_index, targets),
            _ => panic!("expected Forward"),
        };

        let forward_id = table.get(table_index).unwrap().forward_id;
        let mut reply = query_message(forward_id, &["example", "com"], dnsfwd_proto::TYPE_A);
        {
            let mut h = Header::new(&mut reply).unwrap();
            h.set_qr(true);
            h.set_ra(true);
        }

        let from = engine.servers.get(targets[0]).addr;
        let relay = engine.handle_reply(&mut table, table_index, from, &reply).unwrap();
        assert_eq!(relay.client_addr, client);
        let view = dnsfwd_proto::peek(&relay.message).unwrap();
        assert_eq!(view.id, 0x1234);
    }

    #[tokio::test]
    async fn table_full_drops_rather_than_panics() {
        let engine = engine_with_one_plain_upstream().await;
        let mut table = ForwardingTable::new(1, Duration::from_secs(60), 5);
        let mut rng = rand::thread_rng();
        let now = Instant::now();

        let msg1 = query_message(1, &["a", "com"], dnsfwd_proto::TYPE_A);
        let client1 = "127.0.0.1:9001".parse().unwrap();
        assert!(matches!(
            engine.handle_query(&mut table, &mut rng, &msg1, client1, socket().await, local_info(), now),
            Decision::Forward { .. }
        ));

        let msg2 = query_message(2, &["b", "com"], dnsfwd_proto::TYPE_A);
        let client2 = "127.0.0.1:9002".parse().unwrap();
        assert!(matches!(
            engine.handle_query(&mut table, &mut rng, &msg2, client2, socket().await, local_info(), now),
            Decision::Drop
        ));
        assert_eq!(engine.counters.snapshot().table_full, 1);
    }

    #[tokio::test]
    async fn successful_plain_reply_promotes_sticky_server() {
        let sock = socket().await;
        let servers = UpstreamSet::new(vec![
            UpstreamServer {
                addr: "127.0.0.1:5301".parse().unwrap(),
                flags: UpstreamFlags::empty(),
                domain: None,
                literal: None,
                udp: sock.clone(),
            },
            UpstreamServer {
                addr: "127.0.0.1:5302".parse().unwrap(),
                flags: UpstreamFlags::empty(),
                domain: None,
                literal: None,
                udp: sock,
            },
        ]);
        let engine = ForwardingEngine::new(Options::default(), servers, Box::new(NoCache), Box::new(NoopObserver));
        let mut table = ForwardingTable::new(4, Duration::from_secs(10), 5);
        let mut rng = rand::thread_rng();
        let msg = query_message(1, &["example", "com"], dnsfwd_proto::TYPE_A);

        let (table_index, targets) = match engine.handle_query(
            &mut table,
            &mut rng,
            &msg,
            "127.0.0.1:9000".parse().unwrap(),
            socket().await,
            local_info(),
            Instant::now(),
        ) {
            Decision::Forward { table_index, targets, .. } => (table_index, targets),
            _ => panic!("expected Forward"),
        };
        assert_eq!(targets, vec![0, 1]);

        let forward_id = table.get(table_index).unwrap().forward_id;
        let mut reply = query_message(forward_id, &["example", "com"], dnsfwd_proto::TYPE_A);
        {
            let mut h = Header::new(&mut reply).unwrap();
            h.set_qr(true);
            h.set_ra(true);
        }
        engine.handle_reply(&mut table, table_index, "127.0.0.1:5302".parse().unwrap(), &reply);

        let next_targets = engine.eligible_targets(UpstreamFlags::empty(), None);
        assert_eq!(next_targets[0], 1);
    }

    #[tokio::test]
    async fn tcp_path_forwards_without_touching_a_table() {
        let engine = engine_with_one_plain_upstream().await;
        let msg = query_message(0x55, &["example", "com"], dnsfwd_proto::TYPE_A);
        match engine.handle_query_tcp(&msg) {
            TcpDecision::Forward { targets, message } => {
                assert_eq!(targets, vec![engine.servers.get(0).addr]);
                assert_eq!(dnsfwd_proto::peek(&message).unwrap().id, 0x55);
            }
            _ => panic!("expected Forward"),
        }
    }

    #[tokio::test]
    async fn client_retransmission_reuses_table_slot_and_id() {
        let engine = engine_with_one_plain_upstream().await;
        let mut table = ForwardingTable::new(4, Duration::from_secs(10), 5);
        let mut rng = rand::thread_rng();
        let client = "127.0.0.1:9000".parse().unwrap();

        let msg = query_message(0xaaaa, &["example", "com"], dnsfwd_proto::TYPE_A);
        let (first_index, first_forward_id) = match engine.handle_query(
            &mut table,
            &mut rng,
            &msg,
            client,
            socket().await,
            local_info(),
            Instant::now(),
        ) {
            Decision::Forward { table_index, .. } => (table_index, table.get(table_index).unwrap().forward_id),
            _ => panic!("expected Forward"),
        };

        // Same client, same transaction ID: a retransmit before any
        // reply must reuse the existing slot, not burn a new one.
        let retransmit = match engine.handle_query(&mut table, &mut rng, &msg, client, socket().await, local_info(), Instant::now()) {
            Decision::Forward { table_index, .. } => table_index,
            _ => panic!("expected Forward"),
        };
        assert_eq!(retransmit, first_index);
        assert_eq!(table.get(first_index).unwrap().forward_id, first_forward_id);
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn non_recursive_authoritative_reply_is_still_relayed() {
        let engine = engine_with_one_plain_upstream().await;
        let mut table = ForwardingTable::new(4, Duration::from_secs(10), 5);
        let mut rng = rand::thread_rng();
        let msg = query_message(1, &["example", "com"], dnsfwd_proto::TYPE_A);

        let (table_index, targets) = match engine.handle_query(
            &mut table,
            &mut rng,
            &msg,
            "127.0.0.1:9000".parse().unwrap(),
            socket().await,
            local_info(),
            Instant::now(),
        ) {
            Decision::Forward { table_index, targets, .. } => (table_index, targets),
            _ => panic!("expected Forward"),
        };

        let forward_id = table.get(table_index).unwrap().forward_id;
        let mut reply = query_message(forward_id, &["example", "com"], dnsfwd_proto::TYPE_A);
        {
            let mut h = Header::new(&mut reply).unwrap();
            h.set_qr(true);
            h.set_ra(false);
            h.set_ancount(1);
        }

        let from = engine.servers.get(targets[0]).addr;
        let relay = engine.handle_reply(&mut table, table_index, from, &reply);
        assert!(relay.is_some(), "an RA=0 reply with real answers must still be relayed");
    }

    #[tokio::test]
    async fn non_recursive_empty_reply_is_dropped() {
        let engine = engine_with_one_plain_upstream().await;
        let mut table = ForwardingTable::new(4, Duration::from_secs(10), 5);
        let mut rng = rand::thread_rng();
        let msg = query_message(1, &["example", "com"], dnsfwd_proto::TYPE_A);

        let (table_index, targets) = match engine.handle_query(
            &mut table,
            &mut rng,
            &msg,
            "127.0.0.1:9000".parse().unwrap(),
            socket().await,
            local_info(),
            Instant::now(),
        ) {
            Decision::Forward { table_index, targets, .. } => (table_index, targets),
            _ => panic!("expected Forward"),
        };

        let forward_id = table.get(table_index).unwrap().forward_id;
        let mut reply = query_message(forward_id, &["example", "com"], dnsfwd_proto::TYPE_A);
        {
            let mut h = Header::new(&mut reply).unwrap();
            h.set_qr(true);
            h.set_ra(false);
        }

        let from = engine.servers.get(targets[0]).addr;
        assert!(engine.handle_reply(&mut table, table_index, from, &reply).is_none());
    }

    #[derive(Default)]
    struct AlwaysBogus;
    impl ReplyObserver for AlwaysBogus {
        fn is_bogus_wildcard(&self, _reply: &[u8]) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn bogus_wildcard_reply_is_dropped_before_relay() {
        let sock = socket().await;
        let servers = UpstreamSet::new(vec![UpstreamServer {
            addr: "127.0.0.1:5310".parse().unwrap(),
            flags: UpstreamFlags::empty(),
            domain: None,
            literal: None,
            udp: sock,
        }]);
        let engine = ForwardingEngine::new(Options::default(), servers, Box::new(NoCache), Box::new(AlwaysBogus));
        let mut table = ForwardingTable::new(4, Duration::from_secs(10), 5);
        let mut rng = rand::thread_rng();
        let msg = query_message(1, &["example", "com"], dnsfwd_proto::TYPE_A);

        let (table_index, targets) = match engine.handle_query(
            &mut table,
            &mut rng,
            &msg,
            "127.0.0.1:9000".parse().unwrap(),
            socket().await,
            local_info(),
            Instant::now(),
        ) {
            Decision::Forward { table_index, targets, .. } => (table_index, targets),
            _ => panic!("expected Forward"),
        };

        let forward_id = table.get(table_index).unwrap().forward_id;
        let mut reply = query_message(forward_id, &["example", "com"], dnsfwd_proto::TYPE_A);
        {
            let mut h = Header::new(&mut reply).unwrap();
            h.set_qr(true);
            h.set_ra(true);
            h.set_rcode(dnsfwd_proto::Rcode::NxDomain);
        }

        let from = engine.servers.get(targets[0]).addr;
        assert!(engine.handle_reply(&mut table, table_index, from, &reply).is_none());
    }

    #[tokio::test]
    async fn strict_order_starts_plain_ring_walk_at_head() {
        let sock = socket().await;
        let servers = UpstreamSet::new(vec![
            UpstreamServer {
                addr: "127.0.0.1:5320".parse().unwrap(),
                flags: UpstreamFlags::empty(),
                domain: None,
                literal: None,
                udp: sock.clone(),
            },
            UpstreamServer {
                addr: "127.0.0.1:5321".parse().unwrap(),
                flags: UpstreamFlags::empty(),
                domain: None,
                literal: None,
                udp: sock,
            },
        ]);
        let mut options = Options::default();
        options.strict_order = true;
        let engine = ForwardingEngine::new(options, servers, Box::new(NoCache), Box::new(NoopObserver));
        // Promote index 1 to sticky; with strict_order set this must be
        // ignored and the walk must still start at index 0.
        engine.sticky.store(1, Ordering::Relaxed);
        let targets = engine.eligible_targets(UpstreamFlags::empty(), None);
        assert_eq!(targets[0], 0);
    }

    #[tokio::test]
    async fn table_full_logs_warning_once_before_log_rate_elapses() {
        let engine = engine_with_one_plain_upstream().await;
        let mut table = ForwardingTable::new(1, Duration::from_secs(60), 5);
        let mut rng = rand::thread_rng();
        let now = Instant::now();

        let msg1 = query_message(1, &["a", "com"], dnsfwd_proto::TYPE_A);
        let client1 = "127.0.0.1:9001".parse().unwrap();
        engine.handle_query(&mut table, &mut rng, &msg1, client1, socket().await, local_info(), now);

        let msg2 = query_message(2, &["b", "com"], dnsfwd_proto::TYPE_A);
        let client2 = "127.0.0.1:9002".parse().unwrap();
        engine.handle_query(&mut table, &mut rng, &msg2, client2, socket().await, local_info(), now);
        let first_warning = engine.last_table_full_warning.lock().unwrap().is_some();
        assert!(first_warning);

        let msg3 = query_message(3, &["c", "com"], dnsfwd_proto::TYPE_A);
        let client3 = "127.0.0.1:9003".parse().unwrap();
        let before = *engine.last_table_full_warning.lock().unwrap();
        engine.handle_query(&mut table, &mut rng, &msg3, client3, socket().await, local_info(), now);
        let after = *engine.last_table_full_warning.lock().unwrap();
        assert_eq!(before, after, "second overflow within log_rate must not re-stamp the warning");
    }
}
