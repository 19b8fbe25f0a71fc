//! Runtime defaults, environment overrides and process-wide tunables.

use std::sync::Mutex;
use std::time::Duration;

/// IANA-assigned port for ZRE discovery.
pub const BEACON_PORT: u16 = 5670;

/// Default beacon broadcast interval.
pub const BEACON_INTERVAL: Duration = Duration::from_secs(1);

/// Capacity of the beacon signal channel; overflow drops silently.
pub const SIGNAL_CAPACITY: usize = 50;

/// Capacity of the event channel towards the application.
pub const EVENT_CAPACITY: usize = 10_000;

/// Capacity of the router inbox feeding the engine.
pub const INBOX_CAPACITY: usize = 10_000;

/// Timeout on delivering a facade command, and again on its reply.
pub const CMD_TIMEOUT: Duration = Duration::from_secs(5);

/// IANA dynamic/private port range, probed when binding an ephemeral
/// inbound port.
pub const DYN_PORT_FROM: u16 = 0xC000;
pub const DYN_PORT_TO: u16 = 0xFFFF;
pub const DYN_PORT_ATTEMPTS: usize = 100;

const PEER_EVASIVE: Duration = Duration::from_secs(3);
const PEER_EXPIRED: Duration = Duration::from_secs(5);
const REAP_INTERVAL: Duration = Duration::from_secs(1);

struct Tunables {
    evasive: Duration,
    expired: Duration,
    reap: Duration,
}

// Mutated by setters from arbitrary threads, read by every node in the
// process.
static TUNABLES: Mutex<Tunables> = Mutex::new(Tunables {
    evasive: PEER_EVASIVE,
    expired: PEER_EXPIRED,
    reap: REAP_INTERVAL,
});

/// Silence after which a peer is probed with a PING. Default 3 s.
pub fn set_evasive(d: Duration) {
    TUNABLES.lock().unwrap().evasive = d;
}

/// Silence after which a peer is removed. Default 5 s.
pub fn set_expired(d: Duration) {
    TUNABLES.lock().unwrap().expired = d;
}

/// Reaper tick. Default 1 s.
pub fn set_reap_interval(d: Duration) {
    TUNABLES.lock().unwrap().reap = d;
}

pub(crate) fn evasive() -> Duration {
    TUNABLES.lock().unwrap().evasive
}

pub(crate) fn expired() -> Duration {
    TUNABLES.lock().unwrap().expired
}

pub(crate) fn reap_interval() -> Duration {
    TUNABLES.lock().unwrap().reap
}

/// Interface override: `BEACON_INTERFACE`, falling back to
/// `ZSYS_INTERFACE`. An explicit `set_interface` wins over both.
pub(crate) fn interface_override() -> Option<String> {
    std::env::var("BEACON_INTERFACE")
        .ok()
        .filter(|v| !v.is_empty())
        .or_else(|| std::env::var("ZSYS_INTERFACE").ok().filter(|v| !v.is_empty()))
}

/// Non-empty `BEACON_BROADCAST` prefers broadcast over multicast.
pub(crate) fn broadcast_enabled() -> bool {
    std::env::var("BEACON_BROADCAST").map(|v| !v.is_empty()).unwrap_or(false)
}
