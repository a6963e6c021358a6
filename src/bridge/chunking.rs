//! Reassembly of chunked bridge requests
//!
//! Parts may arrive in any order and may be resent. A pending payload only
//! completes once every slot holds data, and any disagreement about its shape
//! or contents discards it outright.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::messages::ChunkedPayload;

/// Upper bound on parts in one logical request
pub const MAX_TOTAL_CHUNKS: u32 = 4096;

/// Payloads one reassembler buffers at once; opening another evicts the oldest
pub const MAX_PENDING_PAYLOADS: usize = 8;

/// Result of feeding one part to the reassembler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Still waiting; lists every empty sequence id in ascending order
    Incomplete(Vec<u32>),
    /// All parts present; the concatenated logical request
    Complete(String),
    /// The part was inconsistent; the pending payload (if any) was discarded
    Rejected(String),
}

struct PendingPayload {
    total_chunks: u32,
    opened: u64,
    slots: Vec<Option<String>>,
}

impl PendingPayload {
    fn new(total_chunks: u32, opened: u64) -> Self {
        Self {
            total_chunks,
            opened,
            slots: vec![None; total_chunks as usize],
        }
    }

    fn missing(&self) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(index, _)| index as u32)
            .collect()
    }
}

#[derive(Default)]
struct PendingTable {
    payloads: HashMap<u32, PendingPayload>,
    opened: u64,
}

impl PendingTable {
    fn remove(&mut self, id: &u32) -> Option<PendingPayload> {
        self.payloads.remove(id)
    }

    /// The entry for `id`, opening it (and evicting the oldest) if needed
    fn open(&mut self, id: u32, total_chunks: u32) -> &mut PendingPayload {
        if !self.payloads.contains_key(&id) && self.payloads.len() >= MAX_PENDING_PAYLOADS {
            let oldest = self
                .payloads
                .iter()
                .min_by_key(|(_, payload)| payload.opened)
                .map(|(oldest, _)| *oldest);
            if let Some(oldest) = oldest {
                log::warn!("Dropping unfinished chunked payload {} to open {}", oldest, id);
                self.payloads.remove(&oldest);
            }
        }
        self.opened += 1;
        let opened = self.opened;
        self.payloads
            .entry(id)
            .or_insert_with(|| PendingPayload::new(total_chunks, opened))
    }
}

/// Buffers parts of chunked requests keyed by payload id
#[derive(Default)]
pub struct ChunkReassembler {
    pending: Mutex<PendingTable>,
}

impl ChunkReassembler {
    /// Create an empty reassembler
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of payloads waiting for parts
    #[must_use]
    pub fn pending_payloads(&self) -> usize {
        self.pending.lock().payloads.len()
    }

    /// Feed one part. Never blocks beyond the table lock.
    pub fn process_chunk(&self, chunk: &ChunkedPayload) -> ChunkOutcome {
        let mut pending = self.pending.lock();
        let id = chunk.payload_id;

        if chunk.total_chunks == 0 {
            pending.remove(&id);
            return ChunkOutcome::Rejected(format!("payload {id} declares zero chunks"));
        }
        if chunk.total_chunks > MAX_TOTAL_CHUNKS {
            pending.remove(&id);
            return ChunkOutcome::Rejected(format!(
                "payload {id} declares {} chunks, limit is {MAX_TOTAL_CHUNKS}",
                chunk.total_chunks
            ));
        }
        if chunk.sequence_id >= chunk.total_chunks {
            pending.remove(&id);
            return ChunkOutcome::Rejected(format!(
                "payload {id}: sequence id {} out of range for {} chunks",
                chunk.sequence_id, chunk.total_chunks
            ));
        }

        let entry = pending.open(id, chunk.total_chunks);

        if entry.total_chunks != chunk.total_chunks {
            let remembered = entry.total_chunks;
            pending.remove(&id);
            return ChunkOutcome::Rejected(format!(
                "payload {id}: chunk count changed from {remembered} to {}",
                chunk.total_chunks
            ));
        }

        let slot = &mut entry.slots[chunk.sequence_id as usize];
        match slot {
            Some(existing) if *existing != chunk.payload => {
                pending.remove(&id);
                return ChunkOutcome::Rejected(format!(
                    "payload {id}: conflicting data for sequence id {}",
                    chunk.sequence_id
                ));
            }
            Some(_) => {}
            None => *slot = Some(chunk.payload.clone()),
        }

        let missing = entry.missing();
        if !missing.is_empty() {
            return ChunkOutcome::Incomplete(missing);
        }

        let Some(complete) = pending.remove(&id) else {
            return ChunkOutcome::Rejected(format!("payload {id} vanished during reassembly"));
        };
        ChunkOutcome::Complete(complete.slots.into_iter().flatten().collect())
    }
}
