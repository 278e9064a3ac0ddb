//! Components C/D: the bounded forwarding table.
//!
//! Every query this engine forwards gets one [`Frec`] for as long as it is
//! outstanding. The table correlates an upstream reply back to the client
//! that asked for it, and exists to cap how much state one noisy client
//! can pin in memory — a fixed number of slots, reused oldest-first.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::RngCore;
use tokio::net::UdpSocket;

use crate::interface::PacketInfo;
use crate::upstream::UpstreamFlags;

/// One in-flight forwarded query.
#[derive(Debug, Clone)]
pub struct Frec {
    /// The address the original query arrived from (preserved verbatim so
    /// the eventual reply goes back to exactly this socket).
    pub client_addr: SocketAddr,
    /// The transaction ID the client used; substituted back into the
    /// reply before it is sent, undoing the substitution below.
    pub client_id: u16,
    /// The transaction ID this engine substituted when forwarding, chosen
    /// to avoid colliding with another query already in flight to the
    /// same upstream.
    pub forward_id: u16,
    /// The eligibility restriction the selector computed for this query,
    /// carried along so a retry after timeout fans out to the same
    /// restricted subset rather than everything.
    pub kind: UpstreamFlags,
    pub domain: Option<String>,
    /// Upstream indices this query has been sent to so far, most recent
    /// last. A reply's source address is checked against this list, not
    /// just the most recent send, because a late reply from an earlier
    /// attempt is still a valid answer.
    pub sent_to: Vec<usize>,
    pub created: Instant,
    /// True once a reply has been relayed for this entry, kept around
    /// only until `forward_timeout` so a duplicate reply from a second
    /// racing upstream can still be recognized and silently dropped.
    pub answered: bool,
    /// The listening socket the original query arrived on, so the
    /// eventual reply can be sent pinned to the same local address and
    /// interface rather than whatever the outbound route would pick.
    pub listener: Arc<UdpSocket>,
    pub local_info: PacketInfo,
}

impl Frec {
    fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.created) >= timeout
    }
}

/// A fixed-capacity slab of [`Frec`]s. Slot indices are stable for the
/// life of an entry and are what `Frec::sent_to` and reply correlation
/// refer to.
pub struct ForwardingTable {
    slots: Vec<Option<Frec>>,
    capacity: usize,
    timeout: Duration,
    id_retries: u16,
}

/// Why `get_new` could not hand back a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFullReason {
    /// Every slot holds an entry younger than the forwarding timeout.
    AllSlotsLive,
}

impl ForwardingTable {
    pub fn new(capacity: usize, timeout: Duration, id_retries: u16) -> Self {
        Self {
            slots: Vec::new(),
            capacity,
            timeout,
            id_retries,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Finds a free or reusable slot for a new forwarded query, evicting
    /// the oldest live entry if the table is full but that entry has
    /// aged past `timeout`. Returns the slot index and whether a live
    /// entry had to be evicted to produce it.
    pub fn get_new(&mut self, now: Instant) -> Result<(usize, bool), TableFullReason> {
        if let Some(idx) = self.slots.iter().position(|s| s.is_none()) {
            return Ok((idx, false));
        }
        if self.slots.len() < self.capacity {
            self.slots.push(None);
            return Ok((self.slots.len() - 1, false));
        }

        let oldest = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|f| (i, f.created)))
            .min_by_key(|&(_, created)| created);

        match oldest {
            Some((idx, _)) if self.slots[idx].as_ref().unwrap().is_stale(now, self.timeout) => {
                self.slots[idx] = None;
                Ok((idx, true))
            }
            _ => Err(TableFullReason::AllSlotsLive),
        }
    }

    pub fn insert(&mut self, idx: usize, frec: Frec) {
        self.slots[idx] = Some(frec);
    }

    pub fn get(&self, idx: usize) -> Option<&Frec> {
        self.slots.get(idx).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Frec> {
        self.slots.get_mut(idx).and_then(|s| s.as_mut())
    }

    pub fn remove(&mut self, idx: usize) {
        if let Some(slot) = self.slots.get_mut(idx) {
            *slot = None;
        }
    }

    /// Picks a forwarding ID that no other live entry is already using,
    /// full stop: `new_id` is the sole key a reply is correlated by, so
    /// it must be unique across every live record regardless of which
    /// upstream each was sent to.
    pub fn allocate_id(&self, rng: &mut impl RngCore) -> Option<u16> {
        for _ in 0..self.id_retries.max(1) {
            let candidate = rng.next_u32() as u16;
            if candidate == 0 {
                continue;
            }
            let collides = self.slots.iter().flatten().any(|f| f.forward_id == candidate);
            if !collides {
                return Some(candidate);
            }
        }
        None
    }

    /// Finds the live entry a reply correlates to, keyed on the
    /// forwarding ID alone.
    pub fn lookup_by_reply(&self, forward_id: u16) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|f| f.forward_id == forward_id))
    }

    /// Finds an existing, not-yet-answered entry for a retransmit from
    /// the same client with the same transaction ID, so a TCP/UDP retry
    /// reuses its slot and fans out on it instead of burning a second
    /// one.
    pub fn lookup_by_sender(&self, client_addr: SocketAddr, client_id: u16) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.as_ref().is_some_and(|f| {
                f.client_addr == client_addr && f.client_id == client_id && !f.answered
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn dummy_listener() -> Arc<UdpSocket> {
        // A socket that will never actually be driven in these tests;
        // constructing it synchronously from std avoids pulling a tokio
        // runtime into every frec test.
        let std_socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        std_socket.set_nonblocking(true).unwrap();
        Arc::new(UdpSocket::from_std(std_socket).unwrap())
    }

    fn sample_frec(now: Instant) -> Frec {
        Frec {
            client_addr: addr(9000),
            client_id: 42,
            forward_id: 7,
            kind: UpstreamFlags::empty(),
            domain: None,
            sent_to: vec![0],
            created: now,
            answered: false,
            listener: dummy_listener(),
            local_info: PacketInfo {
                local_addr: "127.0.0.1".parse().unwrap(),
                if_index: 0,
            },
        }
    }

    #[tokio::test]
    async fn reuses_free_slot_before_growing() {
        let mut table = ForwardingTable::new(4, Duration::from_secs(10), 5);
        let now = Instant::now();
        let (idx, evicted) = table.get_new(now).unwrap();
        assert!(!evicted);
        table.insert(idx, sample_frec(now));
        table.remove(idx);
        let (idx2, evicted2) = table.get_new(now).unwrap();
        assert!(!evicted2);
        assert_eq!(idx, idx2);
    }

    #[tokio::test]
    async fn evicts_oldest_when_full_and_stale() {
        let timeout = Duration::from_millis(10);
        let mut table = ForwardingTable::new(1, timeout, 5);
        let t0 = Instant::now();
        let (idx, evicted) = table.get_new(t0).unwrap();
        assert!(!evicted);
        table.insert(idx, sample_frec(t0));

        let t1 = t0 + Duration::from_millis(1);
        assert_eq!(table.get_new(t1), Err(TableFullReason::AllSlotsLive));

        let t2 = t0 + Duration::from_millis(50);
        let (evicted_idx, was_evicted) = table.get_new(t2).unwrap();
        assert_eq!(evicted_idx, idx);
        assert!(was_evicted);
    }

    #[tokio::test]
    async fn lookup_by_sender_finds_retransmit() {
        let mut table = ForwardingTable::new(4, Duration::from_secs(10), 5);
        let now = Instant::now();
        let (idx, _) = table.get_new(now).unwrap();
        table.insert(idx, sample_frec(now));
        assert_eq!(table.lookup_by_sender(addr(9000), 42), Some(idx));
        assert_eq!(table.lookup_by_sender(addr(9000), 43), None);
    }

    #[tokio::test]
    async fn allocate_id_avoids_collision_globally() {
        use rand::SeedableRng;
        let mut table = ForwardingTable::new(4, Duration::from_secs(10), 20);
        let now = Instant::now();
        let (idx, _) = table.get_new(now).unwrap();
        let mut frec = sample_frec(now);
        frec.forward_id = 1;
        frec.sent_to = vec![0];
        table.insert(idx, frec);

        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        // id 1 is live, regardless of which upstream it was sent to, and
        // must never be handed back.
        for _ in 0..50 {
            let id = table.allocate_id(&mut rng).unwrap();
            assert_ne!(id, 1);
            assert_ne!(id, 0);
        }
    }

    #[tokio::test]
    async fn lookup_by_reply_matches_on_forward_id_alone() {
        let mut table = ForwardingTable::new(4, Duration::from_secs(10), 5);
        let now = Instant::now();
        let (idx, _) = table.get_new(now).unwrap();
        table.insert(idx, sample_frec(now));
        assert_eq!(table.lookup_by_reply(7), Some(idx));
        assert_eq!(table.lookup_by_reply(8), None);
    }

    #[tokio::test]
    async fn lookup_by_sender_ignores_already_answered_entries() {
        let mut table = ForwardingTable::new(4, Duration::from_secs(10), 5);
        let now = Instant::now();
        let (idx, _) = table.get_new(now).unwrap();
        let mut frec = sample_frec(now);
        frec.answered = true;
        table.insert(idx, frec);
        assert_eq!(table.lookup_by_sender(addr(9000), 42), None);
    }
}
