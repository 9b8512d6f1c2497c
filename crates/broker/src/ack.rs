use std::collections::{BTreeMap, BTreeSet};

use sable_protocol::{MessageId, Position};

/// Reasons an acknowledgment could not be applied. All of them mean the ack
/// was stale or duplicated; none corrupt tracker state.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AckError {
    #[error("no tracked entry for {0}")]
    NotTracked(MessageId),

    #[error("batch index out of range for {0}")]
    IndexOutOfRange(MessageId),

    #[error("{0} already acknowledged")]
    AlreadyAcked(MessageId),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckOutcome {
    /// Sub-messages that went from unacked to acked.
    pub newly_acked: u64,
    /// Entries that became fully acknowledged.
    pub entries_completed: usize,
}

#[derive(Debug)]
struct AckState {
    batch_size: u32,
    acked: u32,
    bits: Vec<u64>,
}

impl AckState {
    fn new(batch_size: u32) -> Self {
        Self {
            batch_size,
            acked: 0,
            bits: vec![0; (batch_size as usize).div_ceil(64)],
        }
    }

    fn completed(batch_size: u32) -> Self {
        let mut state = Self::new(batch_size);
        for i in 0..batch_size {
            state.set(i);
        }
        state
    }

    #[inline]
    fn is_set(&self, i: u32) -> bool {
        self.bits[(i / 64) as usize] & (1u64 << (i % 64)) != 0
    }

    /// Returns false if the bit was already set.
    #[inline]
    fn set(&mut self, i: u32) -> bool {
        let word = &mut self.bits[(i / 64) as usize];
        let mask = 1u64 << (i % 64);
        if *word & mask != 0 {
            return false;
        }
        *word |= mask;
        self.acked += 1;
        true
    }

    #[inline]
    fn is_complete(&self) -> bool {
        self.acked == self.batch_size
    }

    #[inline]
    fn unacked(&self) -> u64 {
        (self.batch_size - self.acked) as u64
    }
}

/// Per-subscription acknowledgment state at sub-message granularity.
///
/// One bitset per delivered entry, keyed by position. Positions below
/// `acked_before` are fully consumed and never tracked again. Fully acked
/// entries stay tracked until every lower entry is acked too; they are
/// excluded from the backlog in the meantime, and reported by
/// [`take_individual_acks`](AckTracker::take_individual_acks) so they can be
/// persisted next to the mark-delete position.
#[derive(Debug)]
pub struct AckTracker {
    entries: BTreeMap<Position, AckState>,
    acked_before: Position,
    /// Fully acked before a restart and not read back yet.
    restored: BTreeSet<Position>,
    individual_acks_changed: bool,
    /// Highest position removed from tracking and not yet handed out by
    /// `advance_cursor`.
    pending_mark_delete: Option<Position>,
    last_mark_delete: Option<Position>,
    open_entries: usize,
    unacked: u64,
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AckTracker {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            acked_before: Position::EARLIEST,
            restored: BTreeSet::new(),
            individual_acks_changed: false,
            pending_mark_delete: None,
            last_mark_delete: None,
            open_entries: 0,
            unacked: 0,
        }
    }

    /// Tracker for a subscription whose durable cursor is at `mark_delete`.
    pub fn resume_after(mark_delete: Option<Position>) -> Self {
        let mut t = Self::new();
        if let Some(p) = mark_delete {
            t.acked_before = p.next();
            t.last_mark_delete = Some(p);
        }
        t
    }

    /// Entries above the mark-delete position that were fully acknowledged
    /// before a restart. They are neither counted nor dispatched again.
    pub fn with_individual_acks(mut self, positions: impl IntoIterator<Item = Position>) -> Self {
        let acked_before = self.acked_before;
        self.restored
            .extend(positions.into_iter().filter(|p| *p >= acked_before));
        self
    }

    /// Start tracking an entry. Returns false if it is already tracked,
    /// already consumed or was fully acked before a restart.
    pub fn record_delivered(&mut self, position: Position, batch_size: u32) -> bool {
        if position < self.acked_before || self.entries.contains_key(&position) {
            return false;
        }
        invariant!(batch_size > 0, "entry {position} recorded with batch size 0");
        let batch_size = batch_size.max(1);

        if self.restored.remove(&position) {
            self.entries.insert(position, AckState::completed(batch_size));
            return false;
        }

        self.entries.insert(position, AckState::new(batch_size));
        self.open_entries += 1;
        self.unacked += batch_size as u64;
        true
    }

    pub fn ack_individual(&mut self, id: MessageId) -> Result<AckOutcome, AckError> {
        let state = self
            .entries
            .get_mut(&id.position)
            .ok_or(AckError::NotTracked(id))?;
        if id.batch_index >= state.batch_size {
            return Err(AckError::IndexOutOfRange(id));
        }
        if !state.set(id.batch_index) {
            return Err(AckError::AlreadyAcked(id));
        }

        self.unacked -= 1;
        let completed = state.is_complete();
        if completed {
            self.open_entries -= 1;
            self.individual_acks_changed = true;
        }
        Ok(AckOutcome {
            newly_acked: 1,
            entries_completed: completed as usize,
        })
    }

    /// Acknowledge `id` and everything before it.
    ///
    /// Fails without touching any state when `id` is not tracked, or when
    /// nothing at or before it was left to acknowledge.
    pub fn ack_cumulative(&mut self, id: MessageId) -> Result<AckOutcome, AckError> {
        let Some(target) = self.entries.get(&id.position) else {
            return Err(AckError::NotTracked(id));
        };
        if id.batch_index >= target.batch_size {
            return Err(AckError::IndexOutOfRange(id));
        }
        let target_done = (0..=id.batch_index).all(|i| target.is_set(i));
        let nothing_below = self
            .entries
            .first_key_value()
            .is_some_and(|(first, _)| *first == id.position);
        if nothing_below && target_done {
            return Err(AckError::AlreadyAcked(id));
        }

        let mut outcome = AckOutcome::default();

        // Everything below the target is consumed.
        let at_and_above = self.entries.split_off(&id.position);
        let below = std::mem::replace(&mut self.entries, at_and_above);
        for (position, state) in below {
            if !state.is_complete() {
                self.open_entries -= 1;
                outcome.entries_completed += 1;
            }
            outcome.newly_acked += state.unacked();
            self.unacked -= state.unacked();
            self.pending_mark_delete = Some(position);
            self.individual_acks_changed = true;
        }
        if self.acked_before < id.position {
            self.acked_before = id.position;
        }

        if let Some(state) = self.entries.get_mut(&id.position) {
            let was_complete = state.is_complete();
            let mut newly = 0;
            for i in 0..=id.batch_index {
                if state.set(i) {
                    newly += 1;
                }
            }
            if !was_complete && state.is_complete() {
                self.open_entries -= 1;
                outcome.entries_completed += 1;
                self.individual_acks_changed = true;
            }
            outcome.newly_acked += newly;
            self.unacked -= newly;
        }

        Ok(outcome)
    }

    /// Entries with at least one unacked sub-message.
    pub fn backlog_size(&self) -> usize {
        self.open_entries
    }

    /// Sub-messages delivered from tracked entries and not yet acked.
    pub fn unacked_messages(&self) -> u64 {
        self.unacked
    }

    pub fn tracked_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn is_acked(&self, id: MessageId) -> bool {
        if id.position < self.acked_before || self.restored.contains(&id.position) {
            return true;
        }
        self.entries
            .get(&id.position)
            .is_some_and(|s| id.batch_index < s.batch_size && s.is_set(id.batch_index))
    }

    /// Drop the fully acked prefix and return the position the durable
    /// cursor may move to, if it moved.
    pub fn advance_cursor(&mut self) -> Option<Position> {
        while let Some(entry) = self.entries.first_entry() {
            if !entry.get().is_complete() {
                break;
            }
            let (position, _) = entry.remove_entry();
            self.pending_mark_delete = Some(position);
            self.acked_before = position.next();
            self.individual_acks_changed = true;
        }

        let next = self.pending_mark_delete.take()?;
        invariant!(
            self.last_mark_delete.is_none_or(|last| next > last),
            "mark-delete moving backwards: {next} after {:?}",
            self.last_mark_delete
        );
        self.last_mark_delete = Some(next);
        Some(next)
    }

    /// Last position handed out by [`advance_cursor`](Self::advance_cursor).
    pub fn mark_deleted(&self) -> Option<Position> {
        self.last_mark_delete
    }

    /// Fully acked entries above an unacked one, including those restored
    /// after a restart and not read back yet.
    pub fn individual_acks(&self) -> Vec<Position> {
        let mut out: Vec<Position> = self
            .entries
            .iter()
            .filter(|(_, s)| s.is_complete())
            .map(|(p, _)| *p)
            .chain(self.restored.range(self.acked_before..).copied())
            .collect();
        out.sort_unstable();
        out
    }

    /// [`individual_acks`](Self::individual_acks) if the set changed since
    /// the last call.
    pub fn take_individual_acks(&mut self) -> Option<Vec<Position>> {
        if !std::mem::take(&mut self.individual_acks_changed) {
            return None;
        }
        Some(self.individual_acks())
    }

    /// Restored entries at or after `from` that the log still counts as
    /// unread.
    pub fn restored_from(&self, from: Position) -> usize {
        self.restored.range(from..).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn pos(offset: u64) -> Position {
        Position::new(1, offset)
    }

    fn id(offset: u64, index: u32, size: u32) -> MessageId {
        MessageId::new(pos(offset), index, size)
    }

    #[test]
    fn record_is_idempotent() {
        let mut t = AckTracker::new();
        assert!(t.record_delivered(pos(0), 10));
        assert!(!t.record_delivered(pos(0), 10));
        assert_eq!(t.backlog_size(), 1);
        assert_eq!(t.unacked_messages(), 10);
    }

    #[test]
    fn cumulative_ack_at_index_8_of_10() {
        let mut t = AckTracker::new();
        for offset in 0..4 {
            t.record_delivered(pos(offset), 10);
        }
        assert_eq!(t.backlog_size(), 4);

        let out = t.ack_cumulative(id(2, 8, 10)).unwrap();
        assert_eq!(out.newly_acked, 29);
        assert_eq!(out.entries_completed, 2);
        // entry 2 keeps index 9 open, entry 3 untouched
        assert_eq!(t.backlog_size(), 2);
        assert_eq!(t.unacked_messages(), 11);
        assert!(t.is_acked(id(2, 8, 10)));
        assert!(!t.is_acked(id(2, 9, 10)));
        assert!(t.is_acked(id(0, 3, 10)));

        assert_eq!(t.advance_cursor(), Some(pos(1)));
        assert_eq!(t.advance_cursor(), None);
    }

    #[test]
    fn out_of_order_acks_backlog_sequence() {
        // 40 messages in batches of 10
        let mut t = AckTracker::new();
        for offset in 0..4 {
            t.record_delivered(pos(offset), 10);
        }
        assert_eq!(t.backlog_size(), 4);

        t.ack_cumulative(id(0, 8, 10)).unwrap();
        assert_eq!(t.backlog_size(), 4);

        t.ack_cumulative(id(1, 4, 10)).unwrap();
        assert_eq!(t.backlog_size(), 3);

        for i in 5..10 {
            t.ack_individual(id(1, i, 10)).unwrap();
        }
        assert_eq!(t.backlog_size(), 2);

        t.ack_cumulative(id(3, 9, 10)).unwrap();
        assert_eq!(t.backlog_size(), 0);
        assert_eq!(t.unacked_messages(), 0);
        assert_eq!(t.advance_cursor(), Some(pos(3)));
        assert_eq!(t.tracked_entries(), 0);
    }

    #[test]
    fn completed_entry_above_open_one_stays_tracked() {
        let mut t = AckTracker::new();
        t.record_delivered(pos(0), 2);
        t.record_delivered(pos(1), 1);

        t.ack_individual(id(1, 0, 1)).unwrap();
        assert_eq!(t.backlog_size(), 1);
        assert_eq!(t.advance_cursor(), None);
        assert_eq!(t.tracked_entries(), 2);

        t.ack_individual(id(0, 1, 2)).unwrap();
        t.ack_individual(id(0, 0, 2)).unwrap();
        assert_eq!(t.advance_cursor(), Some(pos(1)));
        assert_eq!(t.mark_deleted(), Some(pos(1)));
    }

    #[test]
    fn stale_acks_are_errors_without_side_effects() {
        let mut t = AckTracker::new();
        t.record_delivered(pos(0), 3);
        t.ack_individual(id(0, 1, 3)).unwrap();

        assert_eq!(
            t.ack_individual(id(0, 1, 3)),
            Err(AckError::AlreadyAcked(id(0, 1, 3)))
        );
        assert_eq!(
            t.ack_individual(id(0, 3, 3)),
            Err(AckError::IndexOutOfRange(id(0, 3, 3)))
        );
        assert_eq!(
            t.ack_individual(id(7, 0, 1)),
            Err(AckError::NotTracked(id(7, 0, 1)))
        );

        t.ack_cumulative(id(0, 2, 3)).unwrap();
        t.advance_cursor();
        assert_eq!(
            t.ack_individual(id(0, 0, 3)),
            Err(AckError::NotTracked(id(0, 0, 3)))
        );
        assert_eq!(
            t.ack_cumulative(id(0, 2, 3)),
            Err(AckError::NotTracked(id(0, 2, 3)))
        );
        assert_eq!(t.unacked_messages(), 0);
    }

    #[test]
    fn resumed_tracker_ignores_consumed_positions() {
        let mut t = AckTracker::resume_after(Some(pos(5)));
        assert!(!t.record_delivered(pos(5), 1));
        assert!(!t.record_delivered(pos(2), 1));
        assert!(t.record_delivered(Position::new(2, 0), 1));
        assert!(t.is_acked(id(4, 0, 1)));
        assert_eq!(t.mark_deleted(), Some(pos(5)));
    }

    #[test]
    fn cumulative_ack_over_completed_entries_is_ok() {
        let mut t = AckTracker::new();
        t.record_delivered(pos(0), 2);
        t.record_delivered(pos(1), 2);
        t.ack_individual(id(0, 0, 2)).unwrap();
        t.ack_individual(id(0, 1, 2)).unwrap();
        t.ack_individual(id(1, 0, 2)).unwrap();

        // nothing new is acked, but entry 0 leaves tracking
        assert_eq!(t.ack_cumulative(id(1, 0, 2)), Ok(AckOutcome::default()));
        assert_eq!(t.tracked_entries(), 1);
        assert_eq!(t.advance_cursor(), Some(pos(0)));

        // now it really is a duplicate
        assert_eq!(
            t.ack_cumulative(id(1, 0, 2)),
            Err(AckError::AlreadyAcked(id(1, 0, 2)))
        );
        assert_eq!(t.backlog_size(), 1);
    }

    #[test]
    fn individual_acks_reported_only_when_changed() {
        let mut t = AckTracker::new();
        for offset in 0..4 {
            t.record_delivered(pos(offset), 1);
        }
        assert_eq!(t.take_individual_acks(), None);

        t.ack_individual(id(2, 0, 1)).unwrap();
        t.ack_individual(id(1, 0, 1)).unwrap();
        assert_eq!(t.advance_cursor(), None);
        assert_eq!(t.take_individual_acks(), Some(vec![pos(1), pos(2)]));
        assert_eq!(t.take_individual_acks(), None);

        t.ack_individual(id(0, 0, 1)).unwrap();
        assert_eq!(t.advance_cursor(), Some(pos(2)));
        assert_eq!(t.take_individual_acks(), Some(vec![]));
    }

    #[test]
    fn restored_individual_acks_are_skipped_and_unblock_cursor() {
        let mut t = AckTracker::resume_after(Some(pos(0)))
            .with_individual_acks([pos(0), pos(2), pos(3)]);
        assert!(t.is_acked(id(2, 0, 1)));
        assert_eq!(t.restored_from(pos(1)), 2);
        assert_eq!(t.individual_acks(), vec![pos(2), pos(3)]);

        assert!(t.record_delivered(pos(1), 2));
        assert!(!t.record_delivered(pos(2), 3));
        assert!(!t.record_delivered(pos(3), 1));
        assert!(t.record_delivered(pos(4), 1));
        assert_eq!(t.restored_from(pos(1)), 0);
        assert_eq!(t.backlog_size(), 2);
        assert_eq!(t.unacked_messages(), 3);

        t.ack_individual(id(1, 0, 2)).unwrap();
        t.ack_individual(id(1, 1, 2)).unwrap();
        assert_eq!(t.advance_cursor(), Some(pos(3)));
        assert_eq!(t.backlog_size(), 1);
        assert!(t.individual_acks().is_empty());
    }

    #[test]
    fn large_batches_use_multiple_words() {
        let mut t = AckTracker::new();
        t.record_delivered(pos(0), 130);
        for i in (0..130).rev() {
            t.ack_individual(id(0, i, 130)).unwrap();
        }
        assert_eq!(t.backlog_size(), 0);
        assert_eq!(t.advance_cursor(), Some(pos(0)));
    }

    #[test]
    fn concurrent_acks_on_one_entry_lose_nothing() {
        let tracker = Arc::new(parking_lot::Mutex::new(AckTracker::new()));
        tracker.lock().record_delivered(pos(0), 200);

        let threads: Vec<_> = (0..8u32)
            .map(|t| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for i in (t..200).step_by(8) {
                        tracker.lock().ack_individual(id(0, i, 200)).unwrap();
                    }
                })
            })
            .collect();
        for th in threads {
            th.join().unwrap();
        }

        let mut t = tracker.lock();
        assert_eq!(t.unacked_messages(), 0);
        assert_eq!(t.backlog_size(), 0);
        assert!((0..200).all(|i| t.is_acked(id(0, i, 200))));
        assert_eq!(t.advance_cursor(), Some(pos(0)));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Individual(u64, u32),
        Cumulative(u64, u32),
        Advance,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            6 => (0..8u64, 0..6u32).prop_map(|(p, i)| Op::Individual(p, i)),
            1 => (0..8u64, 0..6u32).prop_map(|(p, i)| Op::Cumulative(p, i)),
            2 => Just(Op::Advance),
        ]
    }

    proptest! {
        #[test]
        fn backlog_matches_model(
            sizes in prop::collection::vec(1..6u32, 1..8),
            ops in prop::collection::vec(op(), 0..60),
        ) {
            let mut t = AckTracker::new();
            // model: per entry, set of acked indices
            let mut model: Vec<Vec<bool>> = sizes.iter().map(|&s| vec![false; s as usize]).collect();
            for (offset, &size) in sizes.iter().enumerate() {
                t.record_delivered(pos(offset as u64), size);
            }

            let mut last_backlog = t.backlog_size();
            let mut last_mark: Option<Position> = None;

            for op in ops {
                match op {
                    Op::Individual(p, i) => {
                        let Some(entry) = model.get_mut(p as usize) else { continue };
                        let size = entry.len() as u32;
                        let res = t.ack_individual(id(p, i, size));
                        if i < size && !entry[i as usize] && res.is_ok() {
                            entry[i as usize] = true;
                        }
                    }
                    Op::Cumulative(p, i) => {
                        let Some(size) = model.get(p as usize).map(|e| e.len() as u32) else { continue };
                        if t.ack_cumulative(id(p, i, size)).is_ok() {
                            for e in model.iter_mut().take(p as usize) {
                                e.iter_mut().for_each(|b| *b = true);
                            }
                            for b in model[p as usize].iter_mut().take(i as usize + 1) {
                                *b = true;
                            }
                            let expected = model
                                .iter()
                                .skip(p as usize)
                                .filter(|e| e.iter().any(|b| !b))
                                .count();
                            prop_assert_eq!(t.backlog_size(), expected);
                        }
                    }
                    Op::Advance => {
                        if let Some(m) = t.advance_cursor() {
                            prop_assert!(last_mark.is_none_or(|l| m > l));
                            last_mark = Some(m);
                        }
                    }
                }

                let expected = model.iter().filter(|e| e.iter().any(|b| !b)).count();
                prop_assert_eq!(t.backlog_size(), expected);
                prop_assert!(t.backlog_size() <= last_backlog);
                last_backlog = t.backlog_size();

                let unacked: usize = model.iter().map(|e| e.iter().filter(|b| !**b).count()).sum();
                prop_assert_eq!(t.unacked_messages(), unacked as u64);
            }
        }
    }
}
