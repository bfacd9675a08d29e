/// Replay database: the durable record of user *intent*.
///
/// One table per channel, keyed by symbol. An entry means "the user asked
/// for this stream"; it is independent of server acknowledgement and is
/// mutated only by confirmed server truth:
///
/// 1. Server **rejects** the subscribe → intent removed.
/// 2. Server **accepts** → intent persists.
/// 3. Server stays **silent** → intent persists.
///
/// On every reconnect the session drains the tables and resubmits one
/// request per stored group, so replay across epochs is deterministic and
/// never duplicates intent: at most one replay per (channel, symbol) per
/// epoch.
use std::collections::BTreeMap;

use crate::config::ReqId;
use crate::models::{BookSubscribe, Channel, Subscription, Symbol, TradeSubscribe};

/// Channel-specific options stored with an intent so replay can rebuild
/// the original request.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    /// Request id of the subscribe that stored this intent. Preserved so a
    /// replayed request answers to the same id the caller observed.
    req_id: ReqId,
    depth: Option<u32>,
    snapshot: Option<bool>,
}

/// Intent table for one channel.
#[derive(Default)]
pub struct ReplayTable {
    entries: BTreeMap<Symbol, Entry>,
}

impl ReplayTable {
    fn add(&mut self, symbol: Symbol, entry: Entry) {
        // Overwrite keeps at most one intent per symbol.
        self.entries.insert(symbol, entry);
    }

    fn remove(&mut self, symbol: &Symbol) -> bool {
        self.entries.remove(symbol).is_some()
    }

    fn try_process_rejection(&mut self, req_id: ReqId, symbol: &Symbol) -> bool {
        match self.entries.get(symbol) {
            Some(entry) if entry.req_id == req_id => {
                self.entries.remove(symbol);
                true
            }
            _ => false,
        }
    }

    /// Drain all entries, grouped back into (req_id, options) request
    /// groups in deterministic symbol order.
    fn take_groups(&mut self) -> Vec<(Entry, Vec<Symbol>)> {
        let entries = std::mem::take(&mut self.entries);
        let mut groups: Vec<(Entry, Vec<Symbol>)> = Vec::new();
        for (symbol, entry) in entries {
            match groups.iter_mut().find(|(e, _)| *e == entry) {
                Some((_, symbols)) => symbols.push(symbol),
                None => groups.push((entry, vec![symbol])),
            }
        }
        groups
    }

    /// Stored symbols.
    pub fn total_symbols(&self) -> usize {
        self.entries.len()
    }

    /// Distinct request groups the stored intents came from.
    pub fn total_requests(&self) -> usize {
        let mut ids: Vec<ReqId> = self.entries.values().map(|e| e.req_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }

    pub fn contains(&self, symbol: &Symbol) -> bool {
        self.entries.contains_key(symbol)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The per-session intent store, one table per channel.
#[derive(Default)]
pub struct ReplayDatabase {
    trade: ReplayTable,
    book: ReplayTable,
}

impl ReplayDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the intent carried by a trade subscribe request.
    pub fn add_trade(&mut self, req: &TradeSubscribe, req_id: ReqId) {
        for symbol in &req.symbols {
            self.trade.add(
                symbol.clone(),
                Entry {
                    req_id,
                    depth: None,
                    snapshot: req.snapshot,
                },
            );
        }
    }

    /// Store the intent carried by a book subscribe request.
    pub fn add_book(&mut self, req: &BookSubscribe, req_id: ReqId) {
        for symbol in &req.symbols {
            self.book.add(
                symbol.clone(),
                Entry {
                    req_id,
                    depth: req.depth,
                    snapshot: req.snapshot,
                },
            );
        }
    }

    /// Drop the intent for a symbol after a confirmed unsubscribe.
    pub fn remove_symbol(&mut self, channel: Channel, symbol: &Symbol) -> bool {
        match channel {
            Channel::Trade => self.trade.remove(symbol),
            Channel::Book => self.book.remove(symbol),
            _ => false,
        }
    }

    /// Server truth "rejected": drop the intent if the pair matches the
    /// stored origin. Returns false with no state change otherwise.
    pub fn try_process_rejection(&mut self, req_id: ReqId, symbol: &Symbol) -> bool {
        let done = self.trade.try_process_rejection(req_id, symbol);
        if done {
            return true;
        }
        self.book.try_process_rejection(req_id, symbol)
    }

    /// Snapshot-and-drain the trade intents as replayable requests. The
    /// session resubmits them through the normal subscribe path, which
    /// re-stores them.
    pub fn take_trade_subscriptions(&mut self) -> Vec<TradeSubscribe> {
        self.trade
            .take_groups()
            .into_iter()
            .map(|(entry, symbols)| TradeSubscribe {
                symbols,
                snapshot: entry.snapshot,
                req_id: Some(entry.req_id),
            })
            .collect()
    }

    /// Snapshot-and-drain the book intents as replayable requests.
    pub fn take_book_subscriptions(&mut self) -> Vec<BookSubscribe> {
        self.book
            .take_groups()
            .into_iter()
            .map(|(entry, symbols)| BookSubscribe {
                symbols,
                depth: entry.depth,
                snapshot: entry.snapshot,
                req_id: Some(entry.req_id),
            })
            .collect()
    }

    pub fn trade_table(&self) -> &ReplayTable {
        &self.trade
    }

    pub fn book_table(&self) -> &ReplayTable {
        &self.book
    }

    pub fn total_symbols(&self) -> usize {
        self.trade.total_symbols() + self.book.total_symbols()
    }

    pub fn total_requests(&self) -> usize {
        self.trade.total_requests() + self.book.total_requests()
    }
}

/// A subscription whose intent can be stored for replay. Implemented by
/// the channel subscribe requests; the session requires it so that
/// `subscribe()` persists intent before transmitting.
pub trait ReplayableSubscription: Subscription {
    fn persist(&self, db: &mut ReplayDatabase, req_id: ReqId);
}

impl ReplayableSubscription for TradeSubscribe {
    fn persist(&self, db: &mut ReplayDatabase, req_id: ReqId) {
        db.add_trade(self, req_id);
    }
}

impl ReplayableSubscription for BookSubscribe {
    fn persist(&self, db: &mut ReplayDatabase, req_id: ReqId) {
        db.add_book(self, req_id);
    }
}
