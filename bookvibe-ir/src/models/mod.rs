//! Resolution batch state
//!
//! A `ResolutionBatch` is the authoritative, index-addressed state for one
//! `resolve_batch` call. Each record occupies one slot; a slot's status moves
//! monotonically `Pending → InProgress(stage) → Succeeded | Failed` and a
//! terminal slot is never mutated again. Every mutation is a single-slot
//! write under that slot's lock, so no cross-record critical sections exist.

use bookvibe_common::records::LocationRecord;
use serde::Serialize;
use std::sync::Mutex;
use uuid::Uuid;

/// Per-record resolution status
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ResolutionStatus {
    /// Created, no provider contacted yet
    Pending,
    /// A cascade tier is being attempted; `stage` is a human-readable label
    InProgress { stage: String },
    /// A provider produced a usable image
    Succeeded { image_url: String },
    /// Every tier failed; the URL is the deterministic fallback
    Failed { fallback_url: String },
}

impl ResolutionStatus {
    /// Terminal statuses admit no further transition
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResolutionStatus::Succeeded { .. } | ResolutionStatus::Failed { .. }
        )
    }
}

struct Slot {
    record: LocationRecord,
    status: ResolutionStatus,
}

/// Authoritative state for one resolution batch
pub struct ResolutionBatch {
    id: Uuid,
    slots: Vec<Mutex<Slot>>,
}

/// Serializable view of one slot
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotSnapshot {
    pub index: usize,
    #[serde(flatten)]
    pub record: LocationRecord,
    pub status: ResolutionStatus,
}

/// Serializable view of a whole batch
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSnapshot {
    pub batch_id: Uuid,
    pub total: usize,
    pub terminal: usize,
    pub records: Vec<SlotSnapshot>,
}

impl ResolutionBatch {
    pub fn new(records: Vec<LocationRecord>) -> Self {
        let slots = records
            .into_iter()
            .map(|record| {
                Mutex::new(Slot {
                    record,
                    status: ResolutionStatus::Pending,
                })
            })
            .collect();
        Self {
            id: Uuid::new_v4(),
            slots,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Clone of the record at `index`
    ///
    /// # Panics
    /// Panics when `index` is out of range; the orchestrator only uses
    /// indices it created the batch with.
    pub fn record(&self, index: usize) -> LocationRecord {
        self.slots[index].lock().unwrap().record.clone()
    }

    /// Move slot `index` into `InProgress(stage)`
    ///
    /// Returns false (and leaves the slot untouched) when the slot is already
    /// terminal, so a stray late stage update can never resurrect a record.
    pub fn set_stage(&self, index: usize, stage: &str) -> bool {
        let mut slot = self.slots[index].lock().unwrap();
        if slot.status.is_terminal() {
            return false;
        }
        slot.status = ResolutionStatus::InProgress {
            stage: stage.to_string(),
        };
        true
    }

    /// Commit a terminal result for slot `index`
    ///
    /// First writer wins: returns false and discards the update when the slot
    /// already holds a terminal status (a late completion from an abandoned
    /// earlier attempt). On success the record's `image_url` is set and the
    /// status becomes `Succeeded` (or `Failed` when `fallback` is true).
    pub fn commit(&self, index: usize, url: &str, fallback: bool) -> bool {
        let mut slot = self.slots[index].lock().unwrap();
        if slot.status.is_terminal() {
            return false;
        }
        slot.record.image_url = url.to_string();
        slot.status = if fallback {
            ResolutionStatus::Failed {
                fallback_url: url.to_string(),
            }
        } else {
            ResolutionStatus::Succeeded {
                image_url: url.to_string(),
            }
        };
        true
    }

    /// Number of slots holding a terminal status
    pub fn terminal_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.lock().unwrap().status.is_terminal())
            .count()
    }

    /// Number of slots that ended in the fallback (`Failed`) status
    pub fn fallback_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| {
                matches!(
                    s.lock().unwrap().status,
                    ResolutionStatus::Failed { .. }
                )
            })
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.terminal_count() == self.slots.len()
    }

    /// Point-in-time serializable view of the batch
    pub fn snapshot(&self) -> BatchSnapshot {
        let records: Vec<SlotSnapshot> = self
            .slots
            .iter()
            .enumerate()
            .map(|(index, s)| {
                let slot = s.lock().unwrap();
                SlotSnapshot {
                    index,
                    record: slot.record.clone(),
                    status: slot.status.clone(),
                }
            })
            .collect();
        BatchSnapshot {
            batch_id: self.id,
            total: records.len(),
            terminal: records.iter().filter(|r| r.status.is_terminal()).count(),
            records,
        }
    }
}
