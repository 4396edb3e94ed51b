//! Per client site response routing.
//!
//! A client site may hold several sockets to one server. Responses are not
//! bound to the socket their request came in on: they are queued per site and
//! written to whichever socket of the site is alive when the queue is drained.
//!
//! Undelivered responses climb through [`GENERATIONS`] retry queues. A drain
//! pass walks them oldest first, so one pass moves a response up by at most
//! one generation, and a response that fails in the last generation is
//! dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, trace};

use super::socket::SiteSocket;
use crate::protocol::wire::{ClientSite, WireMsg};

pub const GENERATIONS: usize = 3;

/// A framed response waiting for a socket.
#[derive(Debug)]
pub struct PendingResponse {
    pub request_id: u64,
    pub msg: WireMsg,
}

/// Outcome of one drain pass.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub requeued: usize,
    pub dropped: usize,
}

pub struct ClientSiteState {
    site: ClientSite,
    sockets: RwLock<Vec<Arc<SiteSocket>>>,
    generations: Vec<(Sender<PendingResponse>, Receiver<PendingResponse>)>,
    draining: AtomicBool,
}

impl ClientSiteState {
    pub fn new(site: ClientSite) -> Self {
        Self {
            site,
            sockets: RwLock::new(Vec::new()),
            generations: (0..GENERATIONS).map(|_| unbounded()).collect(),
            draining: AtomicBool::new(false),
        }
    }

    pub fn site(&self) -> &ClientSite {
        &self.site
    }

    /// Queues a fresh response in generation 0.
    pub fn enqueue(&self, response: PendingResponse) {
        self.enqueue_at(0, response);
    }

    /// Queues a response that already failed once, e.g. one stranded in the
    /// channel of a socket that died before writing it.
    pub fn requeue(&self, response: PendingResponse) {
        self.enqueue_at(1.min(GENERATIONS - 1), response);
    }

    fn enqueue_at(&self, generation: usize, response: PendingResponse) {
        // Both ends live in self, so the channel cannot be disconnected.
        let _ = self.generations[generation].0.send(response);
    }

    /// Drains the queues if the drain token can be taken within `max_spins`
    /// attempts. Returns `None` when another drainer kept the token.
    ///
    /// Responses queued in generation 0 while the token was held are picked
    /// up before the token is given back for good.
    pub fn drain(&self, max_spins: usize) -> Option<DrainReport> {
        let mut spins = 0;
        while !self.try_take_token() {
            if spins >= max_spins {
                trace!("Drain of {} skipped, token busy", self.site);
                return None;
            }
            spins += 1;
            std::hint::spin_loop();
        }

        let mut report = DrainReport::default();
        loop {
            self.drain_pass(&mut report);
            self.draining.store(false, Ordering::Release);
            if self.generations[0].1.is_empty() || !self.try_take_token() {
                break;
            }
        }
        Some(report)
    }

    fn try_take_token(&self) -> bool {
        self.draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn drain_pass(&self, report: &mut DrainReport) {
        for generation in (0..GENERATIONS).rev() {
            let pending = self.generations[generation].1.len();
            for _ in 0..pending {
                let Ok(response) = self.generations[generation].1.try_recv() else {
                    break;
                };
                match self.deliver(response) {
                    Ok(()) => report.delivered += 1,
                    Err(response) if generation + 1 < GENERATIONS => {
                        trace!(
                            "Response {} to {} moves to generation {}",
                            response.request_id,
                            self.site,
                            generation + 1
                        );
                        self.enqueue_at(generation + 1, response);
                        report.requeued += 1;
                    }
                    Err(response) => {
                        error!(
                            "Dropping response {} to {} after {} delivery attempts",
                            response.request_id, self.site, GENERATIONS
                        );
                        report.dropped += 1;
                    }
                }
            }
        }
    }

    /// Hands the response to the first socket that accepts it. Sockets found
    /// closed are removed from the site; a full socket is skipped.
    fn deliver(&self, mut response: PendingResponse) -> Result<(), PendingResponse> {
        let request_id = response.request_id;
        let sockets = self.sockets.read().expect("unable to lock site sockets").clone();
        for socket in sockets {
            if !socket.is_open() {
                self.remove_socket(socket.id());
                continue;
            }
            match socket.try_send(response) {
                Ok(()) => {
                    trace!(
                        "Response {} queued on socket {} to {}",
                        request_id,
                        socket.id(),
                        socket.peer()
                    );
                    return Ok(());
                }
                Err(TrySendError::Closed(r)) => {
                    debug!("Socket {} to {} went away", socket.id(), socket.peer());
                    self.remove_socket(socket.id());
                    response = r;
                }
                Err(TrySendError::Full(r)) => response = r,
            }
        }
        Err(response)
    }

    pub fn register_socket(&self, socket: Arc<SiteSocket>) {
        debug!("Socket {} from {} joins {}", socket.id(), socket.peer(), self.site);
        self.sockets.write().expect("unable to lock site sockets").push(socket);
    }

    /// Returns true if the socket was registered.
    pub fn remove_socket(&self, id: u64) -> bool {
        let mut sockets = self.sockets.write().expect("unable to lock site sockets");
        let before = sockets.len();
        sockets.retain(|s| s.id() != id);
        before != sockets.len()
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.read().expect("unable to lock site sockets").len()
    }

    /// Responses waiting in any generation.
    pub fn pending_count(&self) -> usize {
        self.generations.iter().map(|(_, rx)| rx.len()).sum()
    }

    pub fn pending_in(&self, generation: usize) -> usize {
        self.generations.get(generation).map_or(0, |(_, rx)| rx.len())
    }

    /// A site with no socket and nothing to deliver can be forgotten.
    pub fn is_evictable(&self) -> bool {
        self.socket_count() == 0 && self.pending_count() == 0
    }

    /// Closes and removes sockets without traffic for `idle` or longer.
    pub fn close_idle_sockets(&self, now: Instant, idle: Duration) -> usize {
        let mut sockets = self.sockets.write().expect("unable to lock site sockets");
        let before = sockets.len();
        sockets.retain(|s| {
            if s.idle_for(now) < idle {
                return true;
            }
            info!("Closing idle socket {} from {}", s.id(), s.peer());
            s.close();
            false
        });
        before - sockets.len()
    }
}

/// Client sites currently known to one Mpx server.
#[derive(Default)]
pub struct SiteRegistry {
    sites: Mutex<HashMap<ClientSite, Arc<ClientSiteState>>>,
}

impl SiteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `socket` to the state of `site`, creating the state on the first
    /// socket of the site.
    pub fn register(&self, site: &ClientSite, socket: Arc<SiteSocket>) -> Arc<ClientSiteState> {
        let mut sites = self.sites.lock().expect("unable to lock site registry");
        let state = sites
            .entry(site.clone())
            .or_insert_with(|| Arc::new(ClientSiteState::new(site.clone())))
            .clone();
        state.register_socket(socket);
        state
    }

    /// Queues a fresh response for `site`. The state is looked up (and
    /// recreated if it was evicted) under the registry lock, so a response is
    /// never queued on a state that eviction already dropped.
    pub fn enqueue(&self, site: &ClientSite, response: PendingResponse) -> Arc<ClientSiteState> {
        self.with_state(site, |state| state.enqueue(response))
    }

    /// Like [`enqueue`](Self::enqueue) for a response that already failed once.
    pub fn requeue(&self, site: &ClientSite, response: PendingResponse) -> Arc<ClientSiteState> {
        self.with_state(site, |state| state.requeue(response))
    }

    fn with_state(
        &self,
        site: &ClientSite,
        f: impl FnOnce(&ClientSiteState),
    ) -> Arc<ClientSiteState> {
        let mut sites = self.sites.lock().expect("unable to lock site registry");
        let state = sites
            .entry(site.clone())
            .or_insert_with(|| {
                debug!("Recreating state of {} for a late response", site);
                Arc::new(ClientSiteState::new(site.clone()))
            })
            .clone();
        f(&state);
        state
    }

    pub fn get(&self, site: &ClientSite) -> Option<Arc<ClientSiteState>> {
        self.sites.lock().expect("unable to lock site registry").get(site).cloned()
    }

    pub fn all(&self) -> Vec<Arc<ClientSiteState>> {
        self.sites.lock().expect("unable to lock site registry").values().cloned().collect()
    }

    /// Forgets sites with no socket and no pending response.
    pub fn evict_idle(&self) -> usize {
        let mut sites = self.sites.lock().expect("unable to lock site registry");
        let before = sites.len();
        sites.retain(|_, state| !state.is_evictable());
        before - sites.len()
    }

    pub fn len(&self) -> usize {
        self.sites.lock().expect("unable to lock site registry").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
