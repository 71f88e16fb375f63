use crate::traits::error::{Result, RobustSocketError};
use std::collections::VecDeque;

/// Ordered log of outbound messages awaiting acknowledgement.
///
/// Every write is assigned the next id in a dense sequence and framed as
/// `"<HEX>|<payload>"` with the id in unpadded uppercase hexadecimal, which
/// is what a compatible server parses on the other side. Acknowledged
/// prefixes are dropped with [`discard`](MessageBuffer::discard); everything
/// still buffered from a boundary onwards can be enumerated for replay.
///
/// Boundaries are expressed as the *first id not yet seen* by the server
/// rather than the last id seen: "nothing seen" is then simply `0`, and the
/// discard/replay boundary is the same number on both calls.
///
/// Ids stay contiguous from the current floor to `next_id - 1`; both
/// boundary operations reject anything outside `[floor, next_id]`.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    floor: u64,
    next_id: u64,
    records: VecDeque<String>,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tag `payload` with the next id, record it, and return the wire form.
    pub fn write(&mut self, payload: &str) -> String {
        let wire = format!("{:X}|{}", self.next_id, payload);
        self.records.push_back(wire.clone());
        self.next_id += 1;
        wire
    }

    /// Drop every record with id below `first_unseen`; returns the count
    /// dropped. `discard(floor)` is an allowed no-op.
    pub fn discard(&mut self, first_unseen: u64) -> Result<usize> {
        self.check_bounds(first_unseen)?;
        let dropped = (first_unseen - self.floor) as usize;
        self.records.drain(..dropped);
        self.floor = first_unseen;
        Ok(dropped)
    }

    /// In-order wire messages with id at or above `first_unseen`.
    pub fn messages_from(&self, first_unseen: u64) -> Result<Vec<String>> {
        self.check_bounds(first_unseen)?;
        let skip = (first_unseen - self.floor) as usize;
        Ok(self.records.iter().skip(skip).cloned().collect())
    }

    /// Number of buffered (unacknowledged) records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The id the next write will be assigned
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// The lowest id still buffered (equal to `next_id` when empty)
    pub fn floor(&self) -> u64 {
        self.floor
    }

    fn check_bounds(&self, id: u64) -> Result<()> {
        if id < self.floor || id > self.next_id {
            return Err(RobustSocketError::IdOutOfRange {
                id,
                floor: self.floor,
                next: self.next_id,
            });
        }
        Ok(())
    }
}
