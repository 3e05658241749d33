//! Merge repeated matches into a single alert.
//!
//! Matches are grouped by `(rule_id, pid, path)`. The first match of a key
//! opens a window of fixed length; later matches of the same key inside the
//! window only bump the occurrence count. The alert is released when its
//! window closes, so a burst of identical reads produces one alert.

use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use probe_common::time::Timestamp;

use crate::event::{Alert, Match};

type Key = (String, u32, String);

#[derive(Debug)]
struct Window {
    alert: Alert,
    opened_at: Timestamp,
    /// position in the open order
    order: u64,
}

#[derive(Debug)]
pub struct AlertDeduplicator {
    window: Duration,
    max_open: usize,
    open: HashMap<Key, Window>,
    /// open windows, oldest first
    open_order: BTreeMap<u64, Key>,
    next_order: u64,
    /// opening times never go backwards, even if `now` does
    last_opened_at: Timestamp,
}

impl AlertDeduplicator {
    pub fn new(window: Duration, max_open: usize) -> Self {
        let max_open = if max_open == 0 {
            log::warn!("maximum number of open alert windows must be at least 1, using 1");
            1
        } else {
            max_open
        };
        Self {
            window,
            max_open,
            open: HashMap::new(),
            open_order: BTreeMap::new(),
            next_order: 0,
            last_opened_at: Timestamp::default(),
        }
    }

    /// Account for a match. Returns the alerts closed as a side effect: the
    /// expired window of the same key, or the oldest window when too many
    /// are open.
    pub fn on_match(&mut self, m: &Match, now: Timestamp) -> Vec<Alert> {
        let mut closed = Vec::new();
        let key = (m.rule_id.to_string(), m.event.pid, m.event.path.clone());

        let length = self.window;
        if let Some(window) = self.open.get_mut(&key) {
            if window.opened_at + length > now {
                window.alert.record(m.event.timestamp);
                return closed;
            }
        }
        // still open here means expired
        if let Some(alert) = self.close(&key) {
            closed.push(alert);
        }

        while self.open.len() >= self.max_open {
            let Some((_, oldest)) = self.open_order.pop_first() else {
                break;
            };
            if let Some(window) = self.open.remove(&oldest) {
                log::debug!("too many open alert windows, closing {:?} early", oldest);
                closed.push(window.alert);
            }
        }

        self.last_opened_at = self.last_opened_at.max(now);
        self.next_order += 1;
        self.open_order.insert(self.next_order, key.clone());
        self.open.insert(
            key,
            Window {
                alert: Alert::from_match(m),
                opened_at: self.last_opened_at,
                order: self.next_order,
            },
        );
        closed
    }

    /// Close every window whose length elapsed at `now`, oldest first.
    pub fn expire(&mut self, now: Timestamp) -> Vec<Alert> {
        let mut closed = Vec::new();
        while let Some((_, key)) = self.open_order.first_key_value() {
            let Some(window) = self.open.get(key) else {
                self.open_order.pop_first();
                continue;
            };
            if !self.is_expired(window.opened_at, now) {
                break;
            }
            let key = key.clone();
            if let Some(alert) = self.close(&key) {
                closed.push(alert);
            }
        }
        closed
    }

    /// Close every window, oldest first.
    pub fn flush(&mut self) -> Vec<Alert> {
        let order = std::mem::take(&mut self.open_order);
        let alerts = order
            .into_values()
            .filter_map(|key| self.open.remove(&key))
            .map(|window| window.alert)
            .collect();
        self.open.clear();
        alerts
    }

    /// Number of open windows.
    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    fn is_expired(&self, opened_at: Timestamp, now: Timestamp) -> bool {
        opened_at + self.window <= now
    }

    fn close(&mut self, key: &Key) -> Option<Alert> {
        let window = self.open.remove(key)?;
        self.open_order.remove(&window.order);
        Some(window.alert)
    }
}
