/// Per-channel subscription bookkeeping.
///
/// One manager per channel tracks in-flight subscribe/unsubscribe requests
/// (grouped by request id, with the set of symbols still awaiting an ACK)
/// and the set of symbols the server has confirmed as subscribed.
///
/// The manager is a pure protocol state machine: no transport, timing or
/// parsing concerns. ACK processing is idempotent — duplicate
/// `(req_id, symbol)` acknowledgements and unknown request ids are safe
/// no-ops, and out-of-order ACKs across requests are permitted.
use std::collections::{BTreeSet, HashMap};

use crate::config::ReqId;
use crate::models::{Channel, Symbol};

pub struct ChannelManager {
    channel: Channel,
    pending_subscribes: HashMap<ReqId, BTreeSet<Symbol>>,
    pending_unsubscribes: HashMap<ReqId, BTreeSet<Symbol>>,
    active: BTreeSet<Symbol>,
}

impl ChannelManager {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            pending_subscribes: HashMap::new(),
            pending_unsubscribes: HashMap::new(),
            active: BTreeSet::new(),
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    /// Track a subscribe request awaiting acknowledgement. Assumes the
    /// request id is unique for the life of the request.
    pub fn register_subscription(&mut self, symbols: Vec<Symbol>, req_id: ReqId) {
        log::trace!(
            "{}: registering subscription req_id={req_id} ({} symbols)",
            self.channel,
            symbols.len()
        );
        self.pending_subscribes
            .insert(req_id, symbols.into_iter().collect());
    }

    /// Track an unsubscribe request awaiting acknowledgement.
    pub fn register_unsubscription(&mut self, symbols: Vec<Symbol>, req_id: ReqId) {
        log::trace!(
            "{}: registering unsubscription req_id={req_id} ({} symbols)",
            self.channel,
            symbols.len()
        );
        self.pending_unsubscribes
            .insert(req_id, symbols.into_iter().collect());
    }

    // -------------------------------------------------------------------------
    // ACK processing
    // -------------------------------------------------------------------------

    /// Apply one per-symbol subscribe acknowledgement. On success the
    /// symbol joins the active set; a completed request is dropped.
    pub fn process_subscribe_ack(&mut self, req_id: ReqId, symbol: &Symbol, success: bool) {
        let Some(remaining) = self.pending_subscribes.get_mut(&req_id) else {
            log::trace!("{}: subscribe ack for unknown req_id={req_id} - ignored", self.channel);
            return;
        };
        if remaining.remove(symbol) {
            if success {
                self.active.insert(symbol.clone());
            }
        } else {
            // Duplicate (req_id, symbol) ack.
            log::trace!(
                "{}: duplicate subscribe ack req_id={req_id} {{{symbol}}} - ignored",
                self.channel
            );
        }
        if remaining.is_empty() {
            self.pending_subscribes.remove(&req_id);
        }
    }

    /// Apply one per-symbol unsubscribe acknowledgement. On success the
    /// symbol leaves the active set; on failure the active set is
    /// untouched. Unsubscribing a non-active symbol is a safe no-op.
    pub fn process_unsubscribe_ack(&mut self, req_id: ReqId, symbol: &Symbol, success: bool) {
        let Some(remaining) = self.pending_unsubscribes.get_mut(&req_id) else {
            log::trace!("{}: unsubscribe ack for unknown req_id={req_id} - ignored", self.channel);
            return;
        };
        if remaining.remove(symbol) {
            if success {
                self.active.remove(symbol);
            }
        } else {
            log::trace!(
                "{}: duplicate unsubscribe ack req_id={req_id} {{{symbol}}} - ignored",
                self.channel
            );
        }
        if remaining.is_empty() {
            self.pending_unsubscribes.remove(&req_id);
        }
    }

    /// Apply a rejection to whichever pending request owns the id. Drops
    /// only the pending binding, never an active entry. Returns false with
    /// no state change when the id is unknown.
    pub fn try_process_rejection(&mut self, req_id: ReqId, symbol: &Symbol) -> bool {
        if let Some(remaining) = self.pending_subscribes.get_mut(&req_id) {
            remaining.remove(symbol);
            if remaining.is_empty() {
                self.pending_subscribes.remove(&req_id);
            }
            return true;
        }
        if let Some(remaining) = self.pending_unsubscribes.get_mut(&req_id) {
            remaining.remove(symbol);
            if remaining.is_empty() {
                self.pending_unsubscribes.remove(&req_id);
            }
            return true;
        }
        false
    }

    /// Empty both pending maps and the active set. Used at the epoch
    /// boundary before replay reconstructs the subscription set.
    pub fn clear_all(&mut self) {
        self.pending_subscribes.clear();
        self.pending_unsubscribes.clear();
        self.active.clear();
    }

    // -------------------------------------------------------------------------
    // Observation
    // -------------------------------------------------------------------------

    pub fn has_pending_requests(&self) -> bool {
        !self.pending_subscribes.is_empty() || !self.pending_unsubscribes.is_empty()
    }

    pub fn pending_requests(&self) -> usize {
        self.pending_subscribes.len() + self.pending_unsubscribes.len()
    }

    pub fn pending_subscription_requests(&self) -> usize {
        self.pending_subscribes.len()
    }

    pub fn pending_unsubscription_requests(&self) -> usize {
        self.pending_unsubscribes.len()
    }

    pub fn pending_symbols(&self) -> usize {
        self.pending_subscribe_symbols() + self.pending_unsubscribe_symbols()
    }

    pub fn pending_subscribe_symbols(&self) -> usize {
        self.pending_subscribes.values().map(BTreeSet::len).sum()
    }

    pub fn pending_unsubscribe_symbols(&self) -> usize {
        self.pending_unsubscribes.values().map(BTreeSet::len).sum()
    }

    pub fn active_symbols(&self) -> usize {
        self.active.len()
    }

    pub fn has_active_symbols(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn is_active(&self, symbol: &Symbol) -> bool {
        self.active.contains(symbol)
    }

    /// Distinct logical symbols this channel accounts for: active plus
    /// pending-subscribe, counted once each. This is the quantity the
    /// symbol-limit policy bounds.
    pub fn total_symbols(&self) -> usize {
        let mut symbols: BTreeSet<&Symbol> = self.active.iter().collect();
        for remaining in self.pending_subscribes.values() {
            symbols.extend(remaining.iter());
        }
        symbols.len()
    }
}
