/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 18/10/26
******************************************************************************/

//! Sequence number validation.
//!
//! This module classifies incoming notification sequence numbers against a
//! per-subscription [`SequenceWindow`] and keeps track of which numbers still
//! need to be acknowledged to the server.
//!
//! Classification relative to the last acknowledged number `last`:
//! - `received == last + 1`: in order
//! - `received <= last` (or already seen): duplicate
//! - `0 < gap <= outdated`: out of order, the hole is tracked
//! - `gap > outdated`: the hole is declared lost and the window jumps ahead
//!
//! where `gap = received - last - 1`. Holes wider than the out-of-order
//! threshold are also scheduled for republish.

use ironua_core::error::ConfigError;
use ironua_core::notification::SubscriptionAcknowledgement;
use ironua_core::types::{SequenceNumber, SubscriptionId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Default hole width below which the pipeline waits for late arrivals.
pub const OUT_OF_ORDER_THRESHOLD: u32 = 10;

/// Default hole width beyond which missing notifications are declared lost.
pub const OUTDATED_THRESHOLD: u32 = 100;

/// Tuning constants for sequence validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceThresholds {
    /// Holes up to this width are expected to fill on their own.
    pub out_of_order: u32,
    /// Holes wider than this are declared lost.
    pub outdated: u32,
}

impl SequenceThresholds {
    /// Creates thresholds with the given values.
    #[must_use]
    pub const fn new(out_of_order: u32, outdated: u32) -> Self {
        Self {
            out_of_order,
            outdated,
        }
    }

    /// Checks that the thresholds are usable.
    ///
    /// # Errors
    /// Returns `ConfigError` if `out_of_order` exceeds `outdated`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.out_of_order > self.outdated {
            return Err(ConfigError::InvalidValue {
                field: "sequence_thresholds",
                reason: format!(
                    "out_of_order ({}) exceeds outdated ({})",
                    self.out_of_order, self.outdated
                ),
            });
        }
        Ok(())
    }
}

impl Default for SequenceThresholds {
    fn default() -> Self {
        Self::new(OUT_OF_ORDER_THRESHOLD, OUTDATED_THRESHOLD)
    }
}

/// Classification of an incoming sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceClass {
    /// The number directly follows the last acknowledged one.
    InOrder,
    /// The number was already received.
    Duplicate,
    /// Some numbers are missing but may still arrive.
    OutOfOrder {
        /// Width of the hole before the received number.
        missing: u32,
    },
    /// Too many numbers are missing; they are declared lost.
    Gap {
        /// Width of the hole before the received number.
        lost: u32,
    },
}

impl SequenceClass {
    /// Returns true if the notification should be dispatched.
    #[must_use]
    pub const fn is_deliverable(&self) -> bool {
        !matches!(self, Self::Duplicate)
    }
}

/// Classifies `received` against `last_acked`.
///
/// This is a total function of its inputs; it does not consult any window state.
#[must_use]
pub fn classify(
    last_acked: SequenceNumber,
    received: SequenceNumber,
    thresholds: &SequenceThresholds,
) -> SequenceClass {
    let last = last_acked.value();
    let received = received.value();

    if received <= last {
        return SequenceClass::Duplicate;
    }
    let gap = received - last - 1;
    if gap == 0 {
        SequenceClass::InOrder
    } else if gap > thresholds.outdated {
        SequenceClass::Gap { lost: gap }
    } else {
        SequenceClass::OutOfOrder { missing: gap }
    }
}

/// Inclusive range of sequence numbers declared lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LostRange {
    /// First lost number.
    pub first: SequenceNumber,
    /// Last lost number.
    pub last: SequenceNumber,
}

impl LostRange {
    /// Returns the number of lost notifications.
    #[must_use]
    pub const fn count(&self) -> u32 {
        self.last.value() - self.first.value() + 1
    }
}

/// Result of feeding one sequence number into a [`SequenceWindow`].
///
/// `class` is the plain classification against the last acknowledged number;
/// `lost` lists only the numbers that were neither received nor settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowUpdate {
    /// How the number was classified.
    pub class: SequenceClass,
    /// Ranges declared lost by this update.
    pub lost: Vec<LostRange>,
    /// Missing numbers that should be requested again.
    pub republish: Vec<SequenceNumber>,
}

impl WindowUpdate {
    fn new(class: SequenceClass) -> Self {
        Self {
            class,
            lost: Vec::new(),
            republish: Vec::new(),
        }
    }

    /// Returns the total number of notifications declared lost.
    #[must_use]
    pub fn lost_count(&self) -> u32 {
        self.lost.iter().map(LostRange::count).sum()
    }
}

/// Per-subscription sequence state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceWindow {
    /// Highest number up to which every notification is settled.
    last_acked: u32,
    /// Numbers above `last_acked` that are settled (received or given up).
    settled: BTreeSet<u32>,
    /// Numbers already asked for via republish.
    requested: BTreeSet<u32>,
    /// Received numbers not yet acknowledged to the server.
    pending_acks: BTreeSet<u32>,
}

impl SequenceWindow {
    /// Creates an empty window.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a window that has acknowledged everything up to `last_acked`.
    #[must_use]
    pub fn starting_at(last_acked: SequenceNumber) -> Self {
        Self {
            last_acked: last_acked.value(),
            ..Self::default()
        }
    }

    /// Returns the last acknowledged sequence number.
    #[inline]
    #[must_use]
    pub fn last_acked(&self) -> SequenceNumber {
        SequenceNumber::new(self.last_acked)
    }

    /// Returns the numbers currently missing between `last_acked` and the highest received.
    #[must_use]
    pub fn missing(&self) -> Vec<SequenceNumber> {
        let Some(&highest) = self.settled.last() else {
            return Vec::new();
        };
        (self.last_acked + 1..highest)
            .filter(|n| !self.settled.contains(n))
            .map(SequenceNumber::new)
            .collect()
    }

    /// Returns the number of acknowledgements waiting for the next request.
    #[must_use]
    pub fn pending_ack_count(&self) -> usize {
        self.pending_acks.len()
    }

    /// Classifies `received` and updates the window accordingly.
    pub fn accept(
        &mut self,
        received: SequenceNumber,
        thresholds: &SequenceThresholds,
    ) -> WindowUpdate {
        let value = received.value();
        if self.settled.contains(&value) {
            return WindowUpdate::new(SequenceClass::Duplicate);
        }

        let class = classify(self.last_acked(), received, thresholds);
        let mut update = WindowUpdate::new(class);

        match class {
            SequenceClass::Duplicate => return update,
            SequenceClass::InOrder => {
                self.last_acked = value;
            }
            SequenceClass::OutOfOrder { missing } => {
                self.settled.insert(value);
                if missing > thresholds.out_of_order {
                    for hole in self.last_acked + 1..value {
                        if !self.settled.contains(&hole) && self.requested.insert(hole) {
                            update.republish.push(SequenceNumber::new(hole));
                        }
                    }
                }
            }
            SequenceClass::Gap { .. } => {
                self.collect_holes(self.last_acked + 1, value - 1, &mut update.lost);
                self.last_acked = value;
            }
        }

        self.pending_acks.insert(value);
        self.advance();
        update
    }

    /// Gives up on a missing number, e.g. after a failed republish.
    ///
    /// Returns true if the number was actually missing.
    pub fn mark_lost(&mut self, sequence_number: SequenceNumber) -> bool {
        let value = sequence_number.value();
        if value <= self.last_acked || self.settled.contains(&value) {
            return false;
        }
        self.settled.insert(value);
        self.advance();
        true
    }

    /// Drains the pending acknowledgements for the next publish request.
    pub fn take_acks(
        &mut self,
        subscription_id: SubscriptionId,
    ) -> Vec<SubscriptionAcknowledgement> {
        std::mem::take(&mut self.pending_acks)
            .into_iter()
            .map(|n| SubscriptionAcknowledgement::new(subscription_id, SequenceNumber::new(n)))
            .collect()
    }

    /// Puts acknowledgements whose request failed back into the pending set.
    pub fn restore_acks(&mut self, acks: impl IntoIterator<Item = SequenceNumber>) {
        self.pending_acks
            .extend(acks.into_iter().map(SequenceNumber::value));
    }

    /// Resets the window to its initial state.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn advance(&mut self) {
        while let Some(next) = self.last_acked.checked_add(1) {
            if !self.settled.remove(&next) {
                break;
            }
            self.last_acked = next;
        }
        self.settled.retain(|n| *n > self.last_acked);
        let last = self.last_acked;
        self.requested.retain(|n| *n > last);
    }

    /// Appends the unsettled runs of `first..=last` to `lost`.
    ///
    /// Walks the settled numbers in the range, so the cost does not depend on
    /// the width of the hole.
    fn collect_holes(&self, first: u32, last: u32, lost: &mut Vec<LostRange>) {
        let mut next = first;
        for &settled in self.settled.range(first..=last) {
            if settled > next {
                lost.push(LostRange {
                    first: SequenceNumber::new(next),
                    last: SequenceNumber::new(settled - 1),
                });
            }
            let Some(after) = settled.checked_add(1) else {
                return;
            };
            next = after;
        }
        if next <= last {
            lost.push(LostRange {
                first: SequenceNumber::new(next),
                last: SequenceNumber::new(last),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(n: u32) -> SequenceNumber {
        SequenceNumber::new(n)
    }

    #[test]
    fn test_classify_in_order() {
        let t = SequenceThresholds::default();
        for last in [0, 1, 41, 9_999] {
            assert_eq!(classify(seq(last), seq(last + 1), &t), SequenceClass::InOrder);
        }
    }

    #[test]
    fn test_classify_duplicate() {
        let t = SequenceThresholds::default();
        assert_eq!(classify(seq(5), seq(5), &t), SequenceClass::Duplicate);
        assert_eq!(classify(seq(5), seq(1), &t), SequenceClass::Duplicate);
    }

    #[test]
    fn test_classify_out_of_order_and_gap() {
        let t = SequenceThresholds::default();
        assert_eq!(
            classify(seq(5), seq(7), &t),
            SequenceClass::OutOfOrder { missing: 1 }
        );
        assert_eq!(
            classify(seq(5), seq(16), &t),
            SequenceClass::OutOfOrder { missing: 10 }
        );
        assert_eq!(
            classify(seq(5), seq(106), &t),
            SequenceClass::OutOfOrder { missing: 100 }
        );
        assert_eq!(
            classify(seq(5), seq(107), &t),
            SequenceClass::Gap { lost: 101 }
        );
    }

    #[test]
    fn test_duplicate_leaves_window_unchanged() {
        let t = SequenceThresholds::default();
        let mut window = SequenceWindow::new();
        window.accept(seq(1), &t);
        window.accept(seq(2), &t);
        window.accept(seq(5), &t);
        let before = window.clone();

        assert_eq!(window.accept(seq(2), &t).class, SequenceClass::Duplicate);
        assert_eq!(window.accept(seq(5), &t).class, SequenceClass::Duplicate);
        assert_eq!(window, before);
    }

    #[test]
    fn test_out_of_order_fills_in() {
        let t = SequenceThresholds::default();
        let mut window = SequenceWindow::starting_at(seq(3));

        let update = window.accept(seq(6), &t);
        assert_eq!(update.class, SequenceClass::OutOfOrder { missing: 2 });
        assert!(update.republish.is_empty());
        assert_eq!(window.missing(), vec![seq(4), seq(5)]);
        assert_eq!(window.last_acked(), seq(3));

        assert_eq!(window.accept(seq(4), &t).class, SequenceClass::InOrder);
        assert_eq!(window.missing(), vec![seq(5)]);

        window.accept(seq(5), &t);
        assert_eq!(window.last_acked(), seq(6));
        assert!(window.missing().is_empty());
        assert_eq!(window.pending_ack_count(), 3);
    }

    #[test]
    fn test_wide_hole_requests_republish_once() {
        let t = SequenceThresholds::default();
        let mut window = SequenceWindow::new();

        let update = window.accept(seq(13), &t);
        assert_eq!(update.class, SequenceClass::OutOfOrder { missing: 12 });
        assert_eq!(update.republish.len(), 12);
        assert_eq!(update.republish[0], seq(1));

        let update = window.accept(seq(20), &t);
        let expected: Vec<_> = (14..20).map(seq).collect();
        assert_eq!(update.republish, expected);
    }

    #[test]
    fn test_gap_advances_and_reports_loss() {
        let t = SequenceThresholds::default();
        let mut window = SequenceWindow::starting_at(seq(10));

        let update = window.accept(seq(150), &t);
        assert_eq!(update.class, SequenceClass::Gap { lost: 139 });
        assert_eq!(update.lost.len(), 1);
        assert_eq!(update.lost_count(), 139);
        assert_eq!(update.lost[0].first, seq(11));
        assert_eq!(update.lost[0].last, seq(149));
        assert_eq!(window.last_acked(), seq(150));
    }

    #[test]
    fn test_stale_hole_is_declared_lost() {
        let t = SequenceThresholds::new(10, 20);
        let mut window = SequenceWindow::new();

        window.accept(seq(1), &t);
        for n in 3..=22 {
            let update = window.accept(seq(n), &t);
            assert!(update.lost.is_empty());
        }
        assert_eq!(window.missing(), vec![seq(2)]);

        let update = window.accept(seq(23), &t);
        assert_eq!(update.class, SequenceClass::Gap { lost: 21 });
        assert_eq!(update.lost_count(), 1);
        assert_eq!(update.lost[0].first, seq(2));
        assert_eq!(window.last_acked(), seq(23));
        assert!(window.missing().is_empty());
    }

    #[test]
    fn test_mark_lost_advances() {
        let t = SequenceThresholds::default();
        let mut window = SequenceWindow::new();
        window.accept(seq(1), &t);
        window.accept(seq(3), &t);

        assert!(window.mark_lost(seq(2)));
        assert_eq!(window.last_acked(), seq(3));
        assert!(!window.mark_lost(seq(2)));
    }

    #[test]
    fn test_take_and_restore_acks() {
        let t = SequenceThresholds::default();
        let sub = SubscriptionId::new(4);
        let mut window = SequenceWindow::new();
        window.accept(seq(1), &t);
        window.accept(seq(2), &t);

        let acks = window.take_acks(sub);
        assert_eq!(acks.len(), 2);
        assert_eq!(window.pending_ack_count(), 0);
        assert!(window.take_acks(sub).is_empty());

        window.restore_acks(acks.iter().map(|a| a.sequence_number));
        assert_eq!(window.pending_ack_count(), 2);
    }

    #[test]
    fn test_huge_gap_reports_runs_between_settled() {
        let t = SequenceThresholds::default();
        let mut window = SequenceWindow::new();
        window.accept(seq(1), &t);
        window.accept(seq(5), &t);
        window.accept(seq(50), &t);
        window.accept(seq(51), &t);

        let started = std::time::Instant::now();
        let update = window.accept(seq(200_000_000), &t);
        assert!(started.elapsed() < std::time::Duration::from_secs(1));

        assert_eq!(update.class, SequenceClass::Gap { lost: 199_999_998 });
        assert_eq!(
            update.lost,
            vec![
                LostRange {
                    first: seq(2),
                    last: seq(4)
                },
                LostRange {
                    first: seq(6),
                    last: seq(49)
                },
                LostRange {
                    first: seq(52),
                    last: seq(199_999_999)
                },
            ]
        );
        assert_eq!(update.lost_count(), 199_999_998 - 3);
        assert_eq!(window.last_acked(), seq(200_000_000));
        assert!(window.missing().is_empty());
    }

    #[test]
    fn test_gap_ending_next_to_settled_number() {
        let t = SequenceThresholds::new(10, 20);
        let mut window = SequenceWindow::new();
        window.accept(seq(20), &t);

        let update = window.accept(seq(42), &t);
        assert_eq!(
            update.lost,
            vec![
                LostRange {
                    first: seq(1),
                    last: seq(19)
                },
                LostRange {
                    first: seq(21),
                    last: seq(41)
                },
            ]
        );
    }

    #[test]
    fn test_window_at_maximum_sequence_number() {
        let t = SequenceThresholds::default();
        let mut window = SequenceWindow::starting_at(seq(u32::MAX - 1));

        assert_eq!(window.accept(seq(u32::MAX), &t).class, SequenceClass::InOrder);
        assert_eq!(window.last_acked(), seq(u32::MAX));
        assert!(window.missing().is_empty());
        assert_eq!(window.accept(seq(u32::MAX), &t).class, SequenceClass::Duplicate);
        assert!(!window.mark_lost(seq(u32::MAX)));

        let mut window = SequenceWindow::starting_at(seq(u32::MAX - 3));
        window.accept(seq(u32::MAX), &t);
        assert_eq!(window.missing(), vec![seq(u32::MAX - 2), seq(u32::MAX - 1)]);
        window.accept(seq(u32::MAX - 2), &t);
        assert!(window.mark_lost(seq(u32::MAX - 1)));
        assert_eq!(window.last_acked(), seq(u32::MAX));

        let mut window = SequenceWindow::new();
        let update = window.accept(seq(u32::MAX), &t);
        assert_eq!(update.lost_count(), u32::MAX - 1);
        assert_eq!(window.last_acked(), seq(u32::MAX));
    }

    #[test]
    fn test_thresholds_validate() {
        assert!(SequenceThresholds::default().validate().is_ok());
        assert!(SequenceThresholds::new(50, 10).validate().is_err());
    }
}
