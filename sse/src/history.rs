//! Bounded, time-ordered message history.
//!
//! `HistoryStore` keeps the messages of the most recent retention window in a
//! growable circular buffer together with a `lower_bound`: the timestamp of the
//! newest message it has ever discarded. A reader that has seen everything up to
//! and including `lower_bound` can be served an exact incremental replay; any
//! reader behind it may have missed something and needs a full resync.

use events::clock::duration_ms;
use events::message::{ChatMessage, Envelope, TimeMs, MAX_TIME_VALUE};
use log::*;
use std::time::Duration;

/// Capacity grows in multiples of this many slots.
pub const BLOCK_SIZE: usize = 32;

pub struct HistoryStore {
    retention_ms: TimeMs,
    lower_bound: TimeMs,
    slots: Vec<Option<ChatMessage>>,
    // Physical index of the oldest retained message.
    tail: usize,
    len: usize,
}

impl HistoryStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention_ms: duration_ms(retention),
            lower_bound: MAX_TIME_VALUE,
            slots: vec![None; BLOCK_SIZE],
            tail: 0,
            len: 0,
        }
    }

    /// Timestamp of the newest discarded message. Before anything has been
    /// discarded this is the oldest message ever appended, and before the
    /// first append it is the maximum time value.
    pub fn lower_bound(&self) -> TimeMs {
        self.lower_bound
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms.max(0) as u64)
    }

    pub fn newest_timestamp(&self) -> Option<TimeMs> {
        self.iter_newest_first().next().map(|m| m.timestamp)
    }

    /// Appends one message after purging everything outside the retention window.
    pub fn append(&mut self, now: TimeMs, message: ChatMessage) {
        self.append_all(now, vec![message]);
    }

    /// Appends messages given oldest-first, after purging everything outside the
    /// retention window. Timestamps must not go backwards.
    pub fn append_all(&mut self, now: TimeMs, messages: Vec<ChatMessage>) {
        self.purge_expired(now);
        if messages.is_empty() {
            return;
        }

        let free = self.capacity() - self.len;
        if free < messages.len() {
            self.resize(messages.len());
        }

        if self.len == 0 {
            self.tail = 0;
            if self.lower_bound == MAX_TIME_VALUE {
                self.lower_bound = messages[0].timestamp;
            }
        }

        for message in messages {
            let target = self.physical(self.len);
            self.slots[target] = Some(message);
            self.len += 1;
        }
    }

    /// Drops everything that has fallen out of the retention window at `now`.
    pub fn purge_expired(&mut self, now: TimeMs) -> usize {
        self.purge_older_than(now - self.retention_ms)
    }

    /// Drops every message with a timestamp at or before `cutoff`, oldest first,
    /// moving `lower_bound` to each dropped timestamp. Returns how many were dropped.
    pub fn purge_older_than(&mut self, cutoff: TimeMs) -> usize {
        let mut dropped = 0;
        while self.len > 0 {
            let keep = self.slots[self.tail]
                .as_ref()
                .is_some_and(|message| message.timestamp > cutoff);
            if keep {
                break;
            }
            if let Some(message) = self.slots[self.tail].take() {
                self.lower_bound = message.timestamp;
            }
            self.tail = (self.tail + 1) % self.capacity();
            self.len -= 1;
            dropped += 1;
        }
        if self.len == 0 {
            self.tail = 0;
        }
        if dropped > 0 {
            trace!(
                "Purged {dropped} message(s), lower bound now {}",
                self.lower_bound
            );
        }
        dropped
    }

    /// Number of retained messages newer than `last_time`.
    ///
    /// `None` means the reader cannot be proven gap-free and must resync: either
    /// `last_time` is behind `lower_bound`, or one of the messages it needs would
    /// fall out of the retention window within `margin`.
    pub fn count_after(&self, now: TimeMs, last_time: TimeMs, margin: Duration) -> Option<usize> {
        if self.lower_bound > last_time {
            return None;
        }

        let retain_bound = now + duration_ms(margin) - self.retention_ms;
        let mut count = 0;
        for message in self.iter_newest_first() {
            if message.timestamp <= last_time {
                break;
            }
            if message.timestamp <= retain_bound {
                return None;
            }
            count += 1;
        }
        Some(count)
    }

    /// Retained messages newer than `last_time`, newest-first. All of them when
    /// `last_time` is `None`.
    pub fn slice_after(&self, last_time: Option<TimeMs>) -> Vec<ChatMessage> {
        self.iter_newest_first()
            .take_while(|message| last_time.map_or(true, |last| message.timestamp > last))
            .cloned()
            .collect()
    }

    /// A `chat` with every message newer than `last_time`, or a `keep-alive`
    /// stamped `now` when there is nothing newer.
    pub fn to_envelope(&self, now: TimeMs, client_id: Option<&str>, last_time: TimeMs) -> Envelope {
        let messages = self.slice_after(Some(last_time));
        match messages.first() {
            Some(newest) => {
                let timestamp = newest.timestamp;
                Envelope::chat(messages, timestamp, client_id.map(str::to_owned))
            }
            None => Envelope::keep_alive(now),
        }
    }

    fn physical(&self, logical: usize) -> usize {
        (self.tail + logical) % self.capacity()
    }

    fn iter_newest_first(&self) -> impl Iterator<Item = &ChatMessage> + '_ {
        (0..self.len)
            .rev()
            .filter_map(move |logical| self.slots[self.physical(logical)].as_ref())
    }

    // Grows to the next block multiple that covers the required free slots and
    // copies entries over oldest-first.
    fn resize(&mut self, free_needed: usize) {
        let free = self.capacity() - self.len;
        let new_capacity =
            ((self.capacity() + (free_needed - free)) / BLOCK_SIZE + 1) * BLOCK_SIZE;

        let mut slots: Vec<Option<ChatMessage>> = Vec::with_capacity(new_capacity);
        for logical in 0..self.len {
            let index = self.physical(logical);
            slots.push(self.slots[index].take());
        }
        slots.resize(new_capacity, None);

        debug!(
            "Resized history from {} to {new_capacity} slots",
            self.capacity()
        );
        self.slots = slots;
        self.tail = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE_TIME: TimeMs = 1_800_000_000_000;
    const MIN_WAIT: Duration = Duration::from_millis(2_000);
    const RETENTION: Duration = Duration::from_millis(30_000);
    const CLIENT_ID: &str = "thx1138";

    fn message(timestamp: TimeMs, body: usize) -> ChatMessage {
        ChatMessage::new(timestamp, "theSource", body.to_string())
    }

    /// `count` messages `step` ms apart starting at `oldest`, oldest-first.
    fn messages(count: usize, oldest: TimeMs, step: TimeMs) -> Vec<ChatMessage> {
        (0..count)
            .map(|i| message(oldest + i as TimeMs * step, i))
            .collect()
    }

    fn filled(source: &[ChatMessage]) -> HistoryStore {
        let mut store = HistoryStore::new(RETENTION);
        for message in source {
            store.append(message.timestamp, message.clone());
        }
        store
    }

    #[test]
    fn empty_store_recommends_resync_and_answers_keep_alive() {
        let store = HistoryStore::new(RETENTION);

        assert_eq!(store.count_after(BASE_TIME, BASE_TIME, MIN_WAIT), None);
        assert_eq!(
            store.to_envelope(BASE_TIME, Some(CLIENT_ID), BASE_TIME - 2_000),
            Envelope::keep_alive(BASE_TIME)
        );
        assert!(store.slice_after(None).is_empty());
    }

    #[test]
    fn full_block_within_retention_is_replayed_in_one_chat() {
        let source = messages(32, BASE_TIME, 468);
        let store = filled(&source);
        let newest = source[31].timestamp;
        let now = newest + 500;

        // The oldest message is the boundary until something has been discarded.
        assert_eq!(store.count_after(now, BASE_TIME - 1, Duration::ZERO), None);
        assert_eq!(store.count_after(now, BASE_TIME, Duration::ZERO), Some(31));
        assert_eq!(store.count_after(now, BASE_TIME, MIN_WAIT), Some(31));
        assert_eq!(store.capacity(), BLOCK_SIZE);

        let envelope = store.to_envelope(now, Some(CLIENT_ID), BASE_TIME - 1);
        assert_eq!(envelope.timestamp(), newest);
        assert_eq!(envelope.client_id(), Some(CLIENT_ID));
        assert_eq!(envelope.messages(), source.as_slice(), "wire order is oldest-first");
    }

    #[test]
    fn growing_past_a_block_keeps_every_message() {
        let source = messages(64, BASE_TIME, 234);
        let store = filled(&source);
        let now = source[63].timestamp + 500;

        assert_eq!(store.count_after(now, BASE_TIME - 1, Duration::ZERO), None);
        assert_eq!(store.count_after(now, BASE_TIME, Duration::ZERO), Some(63));
        assert_eq!(store.count_after(now, BASE_TIME, MIN_WAIT), Some(63));
        assert_eq!(store.capacity(), 2 * BLOCK_SIZE);

        let envelope = store.to_envelope(now, Some(CLIENT_ID), BASE_TIME - 1);
        assert_eq!(envelope.messages(), source.as_slice());
    }

    #[test]
    fn resize_preserves_order_after_wrapping() {
        let mut store = HistoryStore::new(Duration::from_millis(100));
        // 20 messages that age out one by one while the next 40 wrap around and
        // overflow the first block.
        for i in 0..20 {
            store.append(i, message(i, i as usize));
        }
        let later = messages(40, 110, 1);
        for m in &later {
            store.append(m.timestamp, m.clone());
        }

        assert_eq!(store.lower_bound(), 19);
        assert_eq!(store.len(), 40);
        let mut replay = store.slice_after(None);
        replay.reverse();
        assert_eq!(replay, later);
    }

    #[test]
    fn sparse_messages_move_the_lower_bound_as_they_are_purged() {
        let source = messages(3, BASE_TIME, 45_000);
        let mut store = HistoryStore::new(RETENTION);
        let mut now = BASE_TIME;

        // (A) a single message: the reader that has it is up to date,
        // anything earlier can't be proven gap-free.
        store.append(now, source[0].clone());
        let last_time_a = now;
        assert_eq!(store.count_after(now, last_time_a, Duration::ZERO), Some(0));
        assert_eq!(store.count_after(now, last_time_a - 1, Duration::ZERO), None);

        let envelope = store.to_envelope(now, Some(CLIENT_ID), last_time_a - 1);
        assert_eq!(envelope.messages(), &source[..1]);
        assert_eq!(envelope.timestamp(), source[0].timestamp);

        now += 500;
        assert_eq!(
            store.to_envelope(now, Some(CLIENT_ID), last_time_a),
            Envelope::keep_alive(now)
        );

        // (B) 45s later, a reader newer than the only message has nothing to fetch.
        now += 44_500;
        let last_time_b = now - 30_000;
        assert_eq!(store.count_after(now, last_time_b, Duration::ZERO), Some(0));
        assert_eq!(
            store.to_envelope(now, Some(CLIENT_ID), last_time_b),
            Envelope::keep_alive(now)
        );

        // (C) a fresh message purges the first but the bound stays at its timestamp.
        store.append(now, source[1].clone());
        assert_eq!(store.lower_bound(), BASE_TIME);
        assert_eq!(store.count_after(now, last_time_a - 1, Duration::ZERO), None);
        assert_eq!(store.count_after(now, last_time_a, Duration::ZERO), Some(1));
        assert_eq!(
            store.to_envelope(now, Some(CLIENT_ID), last_time_a).messages(),
            &source[1..2]
        );

        // (D) the third message purges the second, moving the bound forward.
        let last_time_d = now;
        now += 45_000;
        let last_time_dd = now;
        store.append(now, source[2].clone());
        assert_eq!(store.lower_bound(), source[1].timestamp);
        assert_eq!(store.count_after(now, last_time_d - 1, Duration::ZERO), None);
        assert_eq!(store.count_after(now, last_time_d, Duration::ZERO), Some(1));
        assert_eq!(store.count_after(now, last_time_dd, Duration::ZERO), Some(0));
        assert_eq!(
            store.to_envelope(now, Some(CLIENT_ID), last_time_d).messages(),
            &source[2..3]
        );

        // (E) near the edge of the window the message is only safe without a wait.
        now += 30_000 - 2_000;
        assert_eq!(store.count_after(now, last_time_d, Duration::ZERO), Some(1));
        assert_eq!(store.count_after(now, last_time_d, MIN_WAIT), None);
    }

    #[test]
    fn slice_after_matches_count_after() {
        let source = messages(10, BASE_TIME, 1_000);
        let store = filled(&source);
        let now = BASE_TIME + 10_000;

        for last in [BASE_TIME, BASE_TIME + 3_500, BASE_TIME + 9_000] {
            let slice = store.slice_after(Some(last));
            assert!(slice.iter().all(|m| m.timestamp > last));
            assert!(slice.windows(2).all(|w| w[0].timestamp > w[1].timestamp), "newest-first");
            assert_eq!(
                store.count_after(now, last, Duration::ZERO),
                Some(slice.len())
            );
        }
    }

    #[test]
    fn purging_everything_keeps_the_newest_discarded_timestamp() {
        let source = messages(3, BASE_TIME, 10);
        let mut store = filled(&source);

        assert_eq!(store.purge_older_than(BASE_TIME + 100), 3);

        assert!(store.is_empty());
        assert_eq!(store.lower_bound(), BASE_TIME + 20);
        assert_eq!(store.count_after(BASE_TIME + 100, BASE_TIME + 20, Duration::ZERO), Some(0));
        assert_eq!(store.count_after(BASE_TIME + 100, BASE_TIME + 19, Duration::ZERO), None);
    }
}
