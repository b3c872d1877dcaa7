//! Fixed buffer arena for the buffered relay.
//!
//! Every slot is `Free`, `Filled` (holds body bytes, not yet handed to the
//! client writer) or `InFlight` (handed out, waiting for the write to be
//! confirmed). A slot only returns to `Free` through `confirm`.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Filled,
    InFlight,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArenaError {
    #[error("unknown buffer {0:?}")]
    UnknownBuffer(BufferId),
    #[error("buffer {id:?} is {actual:?}, expected {expected:?}")]
    WrongState {
        id: BufferId,
        expected: SlotState,
        actual: SlotState,
    },
}

#[derive(Debug)]
struct Slot {
    state: SlotState,
    data: BytesMut,
}

#[derive(Debug)]
pub struct BufferArena {
    slots: Vec<Slot>,
    size: usize,
}

impl BufferArena {
    pub fn new(count: usize, size: usize) -> Self {
        let slots = (0..count.max(1))
            .map(|_| Slot {
                state: SlotState::Free,
                data: BytesMut::with_capacity(size),
            })
            .collect();
        Self {
            slots,
            size: size.max(1),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.size
    }

    /// Take a free slot for filling.
    pub fn acquire(&mut self) -> Option<BufferId> {
        let index = self
            .slots
            .iter()
            .position(|s| s.state == SlotState::Free)?;
        let slot = &mut self.slots[index];
        slot.state = SlotState::Filled;
        slot.data.clear();
        Some(BufferId(index))
    }

    /// Bytes of a slot being filled.
    pub fn get_mut(&mut self, id: BufferId) -> Result<&mut BytesMut, ArenaError> {
        let slot = self.slot_in(id, SlotState::Filled)?;
        Ok(&mut slot.data)
    }

    pub fn len_of(&self, id: BufferId) -> usize {
        self.slots.get(id.0).map_or(0, |s| s.data.len())
    }

    /// Hand a filled slot's bytes to the writer.
    pub fn dispatch(&mut self, id: BufferId) -> Result<Bytes, ArenaError> {
        let slot = self.slot_in(id, SlotState::Filled)?;
        slot.state = SlotState::InFlight;
        Ok(slot.data.split().freeze())
    }

    /// The writer consumed everything handed out for `id`.
    pub fn confirm(&mut self, id: BufferId) -> Result<(), ArenaError> {
        let slot = self.slot_in(id, SlotState::InFlight)?;
        slot.state = SlotState::Free;
        Ok(())
    }

    /// Give back a filled slot without writing it.
    pub fn release(&mut self, id: BufferId) -> Result<(), ArenaError> {
        let slot = self.slot_in(id, SlotState::Filled)?;
        slot.data.clear();
        slot.state = SlotState::Free;
        Ok(())
    }

    pub fn state(&self, id: BufferId) -> Option<SlotState> {
        self.slots.get(id.0).map(|s| s.state)
    }

    pub fn free_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::Free)
            .count()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot_in(&mut self, id: BufferId, expected: SlotState) -> Result<&mut Slot, ArenaError> {
        let slot = self
            .slots
            .get_mut(id.0)
            .ok_or(ArenaError::UnknownBuffer(id))?;
        if slot.state != expected {
            return Err(ArenaError::WrongState {
                id,
                expected,
                actual: slot.state,
            });
        }
        Ok(slot)
    }
}
