//! The forwarding engine: upstream selection, the bounded forwarding
//! table, and the UDP/TCP serving loops that sit on top of them.

pub mod blockdata;
pub mod config;
pub mod counters;
pub mod engine;
pub mod frec;
pub mod interface;
pub mod net;
pub mod observer;
pub mod selector;
pub mod tcp;
pub mod udp;
pub mod upstream;

pub use config::Options;
pub use counters::Counters;
pub use engine::ForwardingEngine;
pub use frec::{Frec, ForwardingTable};
pub use observer::{LocalAnswer, NoCache, NoopObserver, ReplyObserver};
pub use upstream::{UpstreamFlags, UpstreamServer, UpstreamSet};
