/*!
 * Keep-alive waiter
 *
 * A single background thread holds idle HTTP keep-alive sockets between
 * requests. Each parked socket carries an absolute deadline; the thread
 * polls the whole set with the earliest deadline as its timeout. Sockets
 * that turn readable with bytes pending are re-queued to their originating
 * pool as fresh connections sharing the driver state; sockets that time out,
 * empty out, or fail to queue are closed. A waker provides the classic
 * trigger-pipe role: it fires exactly once per empty→non-empty transition of
 * the hand-off list, and once for shutdown.
 */

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use tracing::{debug, info, warn};

use crate::config::{KeepaliveSection, MAX_KEEP_CEILING};
use crate::conn::Conn;
use crate::driver::{pending_bytes, DriverRef, Sock};
use crate::pool::PoolSet;
use crate::sync::{Cond, NamedMutex};

const WAKER_TOKEN: Token = Token(usize::MAX);

/// One parked socket.
struct KeepSlot {
    sock: Box<dyn Sock>,
    driver: DriverRef,
    /// Pool the connection was served by; the next request goes back there.
    pool: String,
    deadline: Instant,
}

struct KeepState {
    /// Newly parked sockets, not yet watched by the poll loop
    waiting: Vec<KeepSlot>,
    /// Slots handed out: waiting plus active
    in_use: usize,
    running: bool,
    shutdown_pending: bool,
    waker: Option<Arc<Waker>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

/// Handle to the keep-alive subsystem.
pub struct Keepalive {
    state: NamedMutex<KeepState>,
    cond: Cond,
    capacity: usize,
    timeout: Duration,
    enabled: bool,
    pools: Weak<PoolSet>,
}

impl Keepalive {
    /// Size the slab from configuration, clamping maxkeep to the descriptor
    /// ceiling.
    pub fn new(cfg: &KeepaliveSection, pools: Weak<PoolSet>) -> Arc<Self> {
        let mut capacity = cfg.maxkeep;
        if capacity > MAX_KEEP_CEILING {
            warn!(
                "{} max keepalive adjusted to {}",
                capacity, MAX_KEEP_CEILING
            );
            capacity = MAX_KEEP_CEILING;
        }
        if !cfg.enabled {
            capacity = 0;
        }
        Arc::new(Keepalive {
            state: NamedMutex::new(
                "ns",
                "keepalive",
                KeepState {
                    waiting: Vec::new(),
                    in_use: 0,
                    running: false,
                    shutdown_pending: false,
                    waker: None,
                    thread: None,
                },
            ),
            cond: Cond::new(),
            capacity,
            timeout: Duration::from_secs(cfg.timeout),
            enabled: cfg.enabled,
            pools,
        })
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Slots in the slab after clamping; zero when disabled.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sockets currently parked or awaiting pickup.
    pub fn pending(&self) -> usize {
        self.state.lock().in_use
    }

    /// Park a finished connection's socket. Returns false, leaving the
    /// connection attached, when the transport cannot detach, the slab is
    /// full, or shutdown has begun.
    pub fn keepalive(self: &Arc<Self>, conn: &mut Conn) -> bool {
        self.keepalive_for_pool(conn, crate::pool::DEFAULT_POOL)
    }

    /// As [`keepalive`](Self::keepalive), remembering the originating pool
    /// for the requeue.
    pub fn keepalive_for_pool(self: &Arc<Self>, conn: &mut Conn, pool: &str) -> bool {
        if !self.enabled || self.capacity == 0 {
            return false;
        }
        if !conn.sock_parkable() {
            return false;
        }

        let mut state = self.state.lock();
        if state.shutdown_pending || state.in_use >= self.capacity {
            return false;
        }
        let Some(sock) = conn.detach_sock() else {
            return false;
        };
        let slot = KeepSlot {
            sock,
            driver: conn.driver.clone(),
            pool: pool.to_string(),
            deadline: Instant::now() + self.timeout,
        };
        let first = state.waiting.is_empty();
        state.waiting.push(slot);
        state.in_use += 1;

        if !state.running {
            let poll = Poll::new().expect("keep-alive poll creation failed");
            let waker = Arc::new(
                Waker::new(poll.registry(), WAKER_TOKEN).expect("waker creation failed"),
            );
            state.waker = Some(waker);
            state.running = true;
            let me = self.clone();
            state.thread = Some(
                std::thread::Builder::new()
                    .name("-keepalive-".to_string())
                    .spawn(move || me.run(poll))
                    .expect("failed to spawn keep-alive thread"),
            );
        } else if first {
            // wake exactly once per empty -> non-empty transition
            state
                .waker
                .as_ref()
                .expect("running waiter has a waker")
                .wake()
                .expect("keep-alive wake failed");
        }
        true
    }

    /// Waiter loop. Owns the poll set and the slot slab.
    fn run(self: Arc<Self>, mut poll: Poll) {
        info!("starting");
        let mut slab: Slab<KeepSlot> = Slab::with_capacity(self.capacity);
        let mut events = Events::with_capacity(256);

        loop {
            // move newly parked sockets into the watched set
            {
                let mut state = self.state.lock();
                if state.shutdown_pending {
                    break;
                }
                let parked: Vec<_> = state.waiting.drain(..).collect();
                for slot in parked {
                    let fd = slot.sock.raw_fd().expect("parked sock has a descriptor");
                    let entry = slab.vacant_entry();
                    let token = Token(entry.key());
                    if let Err(err) =
                        poll.registry()
                            .register(&mut SourceFd(&fd), token, Interest::READABLE)
                    {
                        warn!("keep-alive register failed: {}", err);
                        state.in_use -= 1;
                        continue;
                    }
                    entry.insert(slot);
                }
            }

            let timeout = slab
                .iter()
                .map(|(_, slot)| slot.deadline)
                .min()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()));
            match poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("keep-alive poll failed: {}", err);
                    break;
                }
            }

            let mut readable: Vec<usize> = Vec::new();
            for event in events.iter() {
                if event.token() != WAKER_TOKEN {
                    readable.push(event.token().0);
                }
            }

            let now = Instant::now();
            let mut remove: Vec<usize> = Vec::new();
            for (key, slot) in slab.iter() {
                if readable.contains(&key) || slot.deadline <= now {
                    remove.push(key);
                }
            }

            let mut freed = 0;
            for key in remove {
                let slot = slab.remove(key);
                let fd = slot.sock.raw_fd().expect("parked sock has a descriptor");
                let _ = poll.registry().deregister(&mut SourceFd(&fd));
                if readable.contains(&key) {
                    self.requeue_or_close(slot);
                } else {
                    debug!("keep-alive socket timed out");
                    drop(slot);
                }
                freed += 1;
            }
            if freed > 0 {
                let mut state = self.state.lock();
                state.in_use -= freed;
            }
        }

        // shutdown: close everything still parked
        let drained = {
            let mut state = self.state.lock();
            let drained: Vec<KeepSlot> = state.waiting.drain(..).collect();
            state.in_use -= drained.len() + slab.len();
            drained
        };
        drop(drained);
        for slot in slab.drain() {
            drop(slot);
        }
        info!("shutdown complete");
        let mut state = self.state.lock();
        state.running = false;
        self.cond.broadcast();
    }

    /// Requeue a readable socket to its pool; close when it has nothing to
    /// read or the pool refuses it.
    fn requeue_or_close(&self, slot: KeepSlot) {
        let fd = slot.sock.raw_fd().expect("parked sock has a descriptor");
        match pending_bytes(fd) {
            Ok(0) | Err(_) => {
                debug!("keep-alive socket closed by peer");
            }
            Ok(_) => {
                if let Some(pools) = self.pools.upgrade() {
                    match pools.queue_sock(slot.driver.clone(), slot.sock, &slot.pool) {
                        Ok(()) => {
                            debug!(pool = %slot.pool, "keep-alive socket requeued");
                            return;
                        }
                        Err(err) => debug!("keep-alive requeue refused: {}", err),
                    }
                }
            }
        }
        // fall-through closes: the slot's sock (if still owned) drops here
    }

    /// Flag shutdown and wake the waiter.
    pub fn begin_shutdown(&self) {
        let mut state = self.state.lock();
        if state.running {
            state.shutdown_pending = true;
            if let Some(waker) = state.waker.as_ref() {
                let _ = waker.wake();
            }
        }
    }

    /// Wait (bounded) for the waiter thread to exit, then join it.
    pub fn wait_shutdown(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.running {
            let (guard, outcome) = self.cond.timed_wait(state, Some(deadline));
            state = guard;
            if outcome.timed_out() && state.running {
                warn!("timeout waiting for keep-alive thread");
                return;
            }
        }
        if let Some(handle) = state.thread.take() {
            drop(state);
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for Keepalive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keepalive")
            .field("capacity", &self.capacity)
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(enabled: bool, maxkeep: usize) -> KeepaliveSection {
        KeepaliveSection {
            enabled,
            timeout: 5,
            maxkeep,
        }
    }

    #[test]
    fn test_maxkeep_clamped_to_ceiling() {
        let keepalive = Keepalive::new(&cfg(true, 1 << 20), Weak::new());
        assert_eq!(keepalive.capacity(), MAX_KEEP_CEILING);
    }

    #[test]
    fn test_configured_below_ceiling_kept() {
        let keepalive = Keepalive::new(&cfg(true, 32), Weak::new());
        assert_eq!(keepalive.capacity(), 32);
    }

    #[test]
    fn test_disabled_has_no_slots() {
        let keepalive = Keepalive::new(&cfg(false, 32), Weak::new());
        assert!(!keepalive.enabled());
        assert_eq!(keepalive.capacity(), 0);
        assert_eq!(keepalive.pending(), 0);
    }
}
