//! The UDP serving loop: one task per listening socket receiving client
//! queries, one task per distinct upstream socket receiving replies, all
//! sharing one forwarding table behind a lock. This is the async
//! equivalent of the original's single-threaded `select()` loop — many
//! tasks instead of one `poll()` call, but still no per-query thread or
//! process the way the TCP path gets one per connection.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::engine::{Decision, ForwardingEngine};
use crate::frec::ForwardingTable;
use crate::interface::InterfacePolicy;
use crate::net;

const MAX_DATAGRAM: usize = 65535;

pub struct UdpServer {
    engine: Arc<ForwardingEngine>,
    table: Arc<Mutex<ForwardingTable>>,
    interfaces: Arc<InterfacePolicy>,
}

impl UdpServer {
    pub fn new(engine: Arc<ForwardingEngine>) -> Self {
        let table = ForwardingTable::new(engine.options.max_in_flight, engine.options.forward_timeout, engine.options.id_retries);
        let interfaces = InterfacePolicy::new(
            engine.options.interface_names.clone(),
            engine.options.interface_addrs.clone(),
            engine.options.interface_except.clone(),
        );
        Self {
            engine,
            table: Arc::new(Mutex::new(table)),
            interfaces: Arc::new(interfaces),
        }
    }

    /// Runs until one of the serving tasks returns an error (a socket
    /// going away out from under us); callers typically race this
    /// against a shutdown signal.
    pub async fn run(&self, listeners: Vec<UdpSocket>) -> std::io::Result<()> {
        let mut set = JoinSet::new();

        for listener in listeners {
            let engine = self.engine.clone();
            let table = self.table.clone();
            let interfaces = self.interfaces.clone();
            set.spawn(client_loop(engine, table, interfaces, Arc::new(listener)));
        }

        let mut seen = HashSet::new();
        for (_, server) in self.engine.servers.iter() {
            let key = Arc::as_ptr(&server.udp) as usize;
            if seen.insert(key) {
                let engine = self.engine.clone();
                let table = self.table.clone();
                set.spawn(reply_loop(engine, table, server.udp.clone()));
            }
        }

        match set.join_next().await {
            Some(Ok(result)) => result,
            Some(Err(join_err)) => Err(std::io::Error::other(join_err)),
            None => Ok(()),
        }
    }
}

async fn client_loop(
    engine: Arc<ForwardingEngine>,
    table: Arc<Mutex<ForwardingTable>>,
    interfaces: Arc<InterfacePolicy>,
    listener: Arc<UdpSocket>,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (len, from, info) = net::recv_with_pktinfo(&listener, &mut buf).await?;

        let name = if info.has_specific_interface() {
            net::interface_name(info.if_index)
        } else {
            None
        };
        if !interfaces.permits(name.as_deref(), info.local_addr) {
            continue;
        }

        let decision = {
            let mut table = table.lock().await;
            let mut rng = rand::thread_rng();
            engine.handle_query(&mut table, &mut rng, &buf[..len], from, listener.clone(), info, Instant::now())
        };

        match decision {
            Decision::Answer(message) => {
                if let Err(e) = net::send_from(&listener, &message, from, info).await {
                    warn!(error = %e, %from, "failed to send local answer");
                }
            }
            Decision::Forward { table_index, targets, message } => {
                let target = engine.servers.get(targets[0]);
                if let Err(e) = target.udp.send_to(&message, target.addr).await {
                    debug!(error = %e, upstream = %target.addr, "initial send failed");
                    let mut table = table.lock().await;
                    table.remove(table_index);
                    continue;
                }
                if targets.len() > 1 {
                    tokio::spawn(fan_out_retry(engine.clone(), table.clone(), table_index, targets, message));
                }
            }
            Decision::Drop => {}
        }
    }
}

/// Implements the ring-walk fallback half of §4.D: if nothing has
/// answered after `retry_interval`, try the next eligible upstream,
/// continuing around `targets` until one replies or the list is
/// exhausted.
async fn fan_out_retry(
    engine: Arc<ForwardingEngine>,
    table: Arc<Mutex<ForwardingTable>>,
    table_index: usize,
    targets: Vec<usize>,
    message: Vec<u8>,
) {
    for &idx in &targets[1..] {
        tokio::time::sleep(engine.options.retry_interval).await;

        let mut table_guard = table.lock().await;
        let Some(frec) = table_guard.get_mut(table_index) else { return };
        if frec.answered {
            return;
        }
        frec.sent_to.push(idx);
        drop(table_guard);

        let target = engine.servers.get(idx);
        if let Err(e) = target.udp.send_to(&message, target.addr).await {
            debug!(error = %e, upstream = %target.addr, "retry send failed");
        }
    }
}

async fn reply_loop(engine: Arc<ForwardingEngine>, table: Arc<Mutex<ForwardingTable>>, socket: Arc<UdpSocket>) -> std::io::Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (len, from) = socket.recv_from(&mut buf).await?;
        let raw = &buf[..len];

        let Some(view) = dnsfwd_proto::peek(raw) else {
            continue;
        };

        let table_index = {
            let table = table.lock().await;
            table.lookup_by_reply(view.id)
        };

        let Some(table_index) = table_index else {
            crate::counters::Counters::inc(&engine.counters.replies_unmatched);
            continue;
        };

        let relay = {
            let mut table = table.lock().await;
            engine.handle_reply(&mut table, table_index, from, raw)
        };

        if let Some(relay) = relay {
            if let Err(e) = net::send_from(&relay.listener, &relay.message, relay.client_addr, relay.local_info).await {
                warn!(error = %e, client = %relay.client_addr, "failed to relay reply");
            }
        }
    }
}
