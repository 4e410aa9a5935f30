use crate::delivery::{Delivery, Disposition};
use std::collections::VecDeque;
use std::sync::Arc;
use weft::logging::{self, Logger};

pub use crate::session::LinkId;

/// Depth of the per-link settlement window, in uptime ticks.
pub const SETTLE_RATE_DEPTH: usize = 10;

/// An undelivered delivery is "delayed" after this many ticks.
const DELAY_THRESHOLD_10SEC: u64 = 10;
const DELAY_THRESHOLD_1SEC: u64 = 1;

/// A link is marked stuck after sitting at zero credit this long.
const STUCK_ZERO_CREDIT_SECS: u64 = 600;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LinkDirection {
    Incoming,
    Outgoing,
}

/// Sliding per-second window of settlement counts. Advanced lazily: both
/// the settle path and the management read advance it to the current tick
/// before touching the slots.
#[derive(Debug)]
pub struct SettleRate {
    slots: [u32; SETTLE_RATE_DEPTH],
    head_tick: u64,
}

impl SettleRate {
    pub fn new(now_tick: u64) -> SettleRate {
        SettleRate {
            slots: [0; SETTLE_RATE_DEPTH],
            head_tick: now_tick,
        }
    }

    /// Rotate the window forward to `now_tick`, zeroing the ticks skipped.
    pub fn advance_to(&mut self, now_tick: u64) {
        let elapsed = now_tick.saturating_sub(self.head_tick);

        if elapsed as usize >= SETTLE_RATE_DEPTH {
            self.slots = [0; SETTLE_RATE_DEPTH];
        } else {
            for _ in 0..elapsed {
                self.slots.rotate_right(1);
                self.slots[0] = 0;
            }
        }

        self.head_tick = self.head_tick.max(now_tick);
    }

    /// Count one settlement at `now_tick`.
    pub fn increment(&mut self, now_tick: u64) {
        self.advance_to(now_tick);
        self.slots[0] += 1;
    }

    /// Average settlements per tick over the window.
    pub fn rate(&mut self, now_tick: u64) -> u32 {
        self.advance_to(now_tick);
        self.slots.iter().sum::<u32>() / SETTLE_RATE_DEPTH as u32
    }
}

/// A named unidirectional flow between the local adaptor and a peer: the
/// credit window, the undelivered and unsettled queues, the settlement-rate
/// window and the stuck-delivery clocks. Owned by its connection.
pub struct Link {
    name: String,
    direction: LinkDirection,
    credit: u32,

    undelivered: VecDeque<Arc<Delivery>>,
    unsettled: Vec<Arc<Delivery>>,

    settle_rate: SettleRate,

    zero_credit_since: Option<u64>,
    zero_credit_accum: u64,

    delayed_1sec: u64,
    delayed_10sec: u64,
    stuck: bool,

    delivered_count: u64,
    settled_count: u64,

    log: Logger,
}

impl Link {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        name: &str,
        direction: LinkDirection,
        now_tick: u64,
        log: L,
    ) -> Link {
        Link {
            name: name.to_string(),
            direction,
            credit: 0,
            undelivered: VecDeque::new(),
            unsettled: Vec::new(),
            settle_rate: SettleRate::new(now_tick),
            zero_credit_since: Some(now_tick),
            zero_credit_accum: 0,
            delayed_1sec: 0,
            delayed_10sec: 0,
            stuck: false,
            delivered_count: 0,
            settled_count: 0,
            log: logging::component(log.into(), "link"),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn direction(&self) -> LinkDirection {
        self.direction
    }

    #[inline]
    pub fn credit(&self) -> u32 {
        self.credit
    }

    #[inline]
    pub fn undelivered_count(&self) -> usize {
        self.undelivered.len()
    }

    #[inline]
    pub fn unsettled_count(&self) -> usize {
        self.unsettled.len()
    }

    #[inline]
    pub fn delivered_count(&self) -> u64 {
        self.delivered_count
    }

    #[inline]
    pub fn is_stuck(&self) -> bool {
        self.stuck
    }

    #[inline]
    pub fn delayed_counts(&self) -> (u64, u64) {
        (self.delayed_1sec, self.delayed_10sec)
    }

    /// Apply a credit update from the peer, maintaining the zero-credit
    /// clock.
    pub fn flow(&mut self, credit: u32, now_tick: u64) {
        logging::trace!(self.log, "credit update";
                        "context" => "flow",
                        "link" => self.name.as_str(),
                        "credit" => credit);

        match (self.credit, credit) {
            (0, new) if new > 0 => {
                if let Some(since) = self.zero_credit_since.take() {
                    self.zero_credit_accum += now_tick.saturating_sub(since);
                }
            }
            (old, 0) if old > 0 => {
                self.zero_credit_since = Some(now_tick);
            }
            _ => (),
        }

        self.credit = credit;
    }

    /// Seconds this link has spent at zero credit in total.
    pub fn zero_credit_seconds(&self, now_tick: u64) -> u64 {
        match self.zero_credit_since {
            Some(since) => self.zero_credit_accum + now_tick.saturating_sub(since),
            None => self.zero_credit_accum,
        }
    }

    /// Queue a delivery on the link, strictly FIFO.
    pub fn deliver(&mut self, delivery: Arc<Delivery>) {
        self.undelivered.push_back(delivery);
    }

    /// Take the next delivery to transmit, consuming one credit. `None`
    /// when the queue is empty or the credit window is closed.
    pub fn next_deliverable(&mut self) -> Option<Arc<Delivery>> {
        if self.credit == 0 {
            return None;
        }

        let delivery = self.undelivered.pop_front()?;

        self.credit -= 1;
        self.delivered_count += 1;

        if !delivery.is_settled() {
            self.unsettled.push(delivery.clone());
        }

        Some(delivery)
    }

    /// Settle a previously transmitted delivery, counting it into the
    /// settle-rate window.
    pub fn settle(&mut self, delivery: &Arc<Delivery>, now_tick: u64) {
        if !delivery.settle() {
            return;
        }

        self.unsettled.retain(|held| !Arc::ptr_eq(held, delivery));
        self.settled_count += 1;
        self.settle_rate.increment(now_tick);
    }

    /// Settlements per second averaged over the window. Advances the ring
    /// lazily to the current tick.
    pub fn settle_rate(&mut self, now_tick: u64) -> u32 {
        self.settle_rate.rate(now_tick)
    }

    /// Re-evaluate the stuck-delivery markers. Marks only; nothing is
    /// cancelled.
    pub fn check_stuck(&mut self, now_tick: u64) {
        let mut delayed_1sec = 0;
        let mut delayed_10sec = 0;

        for delivery in &self.undelivered {
            let age = now_tick.saturating_sub(delivery.created_tick());

            if age >= DELAY_THRESHOLD_10SEC {
                delayed_10sec += 1;
            } else if age >= DELAY_THRESHOLD_1SEC {
                delayed_1sec += 1;
            }
        }

        self.delayed_1sec = delayed_1sec;
        self.delayed_10sec = delayed_10sec;

        let starved = self.zero_credit_seconds(now_tick) >= STUCK_ZERO_CREDIT_SECS
            && !self.undelivered.is_empty();

        let stuck = starved || delayed_10sec > 0;

        if stuck && !self.stuck {
            logging::debug!(self.log, "link marked stuck";
                            "context" => "check_stuck",
                            "link" => self.name.as_str(),
                            "delayed_10sec" => delayed_10sec,
                            "zero_credit_seconds" => self.zero_credit_seconds(now_tick));
        }

        self.stuck = stuck;
    }

    /// Tear the link down: unsent deliveries are released, transmitted but
    /// unsettled ones settle with their best-effort final disposition.
    pub fn abandon(&mut self, now_tick: u64) -> Vec<Arc<Delivery>> {
        let mut affected = Vec::new();

        while let Some(delivery) = self.undelivered.pop_front() {
            delivery.set_local_disposition(Disposition::Released);
            delivery.settle();
            affected.push(delivery);
        }

        for delivery in std::mem::replace(&mut self.unsettled, Vec::new()) {
            if delivery.local_disposition() == Disposition::None {
                delivery.set_local_disposition(Disposition::Modified);
            }
            delivery.settle();
            self.settle_rate.increment(now_tick);
            affected.push(delivery);
        }

        affected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{sections, Composed};
    use crate::message::Message;

    fn delivery_at(tick: u64) -> Arc<Delivery> {
        let mut composed = Composed::new();
        composed.put_descriptor(sections::BODY_DATA);
        composed.put_binary(b"x");

        Delivery::new(Message::compose(vec![composed]), tick)
    }

    #[test]
    fn test_fifo_within_credit() {
        let mut link = Link::new("out.1", LinkDirection::Outgoing, 0, None);

        let first = delivery_at(0);
        let second = delivery_at(0);

        link.deliver(first.clone());
        link.deliver(second.clone());

        // No credit: nothing moves.
        assert!(link.next_deliverable().is_none());

        link.flow(1, 0);

        let sent = link.next_deliverable().unwrap();
        assert!(Arc::ptr_eq(&sent, &first));

        // Credit exhausted again.
        assert_eq!(link.credit(), 0);
        assert!(link.next_deliverable().is_none());

        link.flow(1, 0);
        let sent = link.next_deliverable().unwrap();
        assert!(Arc::ptr_eq(&sent, &second));
    }

    #[test]
    fn test_settlement_moves_out_of_unsettled() {
        let mut link = Link::new("out.1", LinkDirection::Outgoing, 0, None);
        let delivery = delivery_at(0);

        link.deliver(delivery.clone());
        link.flow(10, 0);
        link.next_deliverable().unwrap();

        assert_eq!(link.unsettled_count(), 1);

        link.settle(&delivery, 1);

        assert_eq!(link.unsettled_count(), 0);
        assert!(delivery.is_settled());

        // Settling twice neither double-counts nor panics.
        link.settle(&delivery, 1);
        assert_eq!(link.settled_count, 1);
    }

    #[test]
    fn test_settle_rate_window() {
        let mut rate = SettleRate::new(0);

        // Ten settles in one tick average out over the window depth.
        for _ in 0..10 {
            rate.increment(0);
        }

        assert_eq!(rate.rate(0), 1);

        // Once the window slides past them, the rate decays to zero.
        assert_eq!(rate.rate(20), 0);
    }

    #[test]
    fn test_settle_rate_lazy_advance_equivalence() {
        let mut stepped = SettleRate::new(0);
        let mut lazy = SettleRate::new(0);

        stepped.increment(0);
        lazy.increment(0);

        for tick in 1..=5 {
            stepped.advance_to(tick);
        }

        // One jump must be equivalent to single-tick advances.
        assert_eq!(stepped.rate(5), lazy.rate(5));
        assert_eq!(stepped.slots, lazy.slots);
    }

    #[test]
    fn test_zero_credit_clock() {
        let mut link = Link::new("out.1", LinkDirection::Outgoing, 0, None);

        // Born with zero credit at tick 0.
        assert_eq!(link.zero_credit_seconds(5), 5);

        link.flow(10, 5);
        assert_eq!(link.zero_credit_seconds(9), 5);

        link.flow(0, 9);
        assert_eq!(link.zero_credit_seconds(12), 8);
    }

    #[test]
    fn test_stuck_marking() {
        let mut link = Link::new("out.1", LinkDirection::Outgoing, 0, None);

        link.deliver(delivery_at(0));
        link.check_stuck(5);

        let (delayed_1, delayed_10) = link.delayed_counts();
        assert_eq!(delayed_1, 1);
        assert_eq!(delayed_10, 0);
        assert!(!link.is_stuck());

        link.check_stuck(15);

        let (_, delayed_10) = link.delayed_counts();
        assert_eq!(delayed_10, 1);
        assert!(link.is_stuck());

        // Marking never cancels: the delivery is still queued.
        assert_eq!(link.undelivered_count(), 1);
    }

    #[test]
    fn test_abandon_releases_unsent() {
        let mut link = Link::new("out.1", LinkDirection::Outgoing, 0, None);

        let unsent = delivery_at(0);
        let inflight = delivery_at(0);

        link.deliver(inflight.clone());
        link.deliver(unsent.clone());
        link.flow(1, 0);
        link.next_deliverable().unwrap();

        let affected = link.abandon(1);

        assert_eq!(affected.len(), 2);
        assert_eq!(unsent.local_disposition(), Disposition::Released);
        assert_eq!(inflight.local_disposition(), Disposition::Modified);
        assert!(unsent.is_settled());
        assert!(inflight.is_settled());
    }
}
