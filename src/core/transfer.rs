//! Ownership Transfer Directory: sandboxes parked under a token until another thread adopts them.
//!
//! `unbind` first reserves a token, detaches the sandbox, then publishes the slot.
//! A reserved slot is invisible to `take`, and a sandbox occupies at most one slot.

use crate::config::types::{PerfboxError, Result, SandboxId, TransferToken};
use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// `unbind` is detaching the sandbox from its thread
    Reserved(SandboxId),
    /// Ready for adoption
    Parked(SandboxId),
}

impl Slot {
    fn sandbox(self) -> SandboxId {
        match self {
            Slot::Reserved(id) | Slot::Parked(id) => id,
        }
    }
}

#[derive(Debug, Default)]
pub struct TransferDirectory {
    slots: Mutex<HashMap<TransferToken, Slot>>,
    parked: Condvar,
}

impl TransferDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<TransferToken, Slot>>> {
        self.slots
            .lock()
            .map_err(|_| PerfboxError::Fatal("transfer table lock poisoned".to_string()))
    }

    /// Claim `token` for `id`. Fails when the token is taken or `id` already sits in a slot.
    pub fn reserve(&self, token: TransferToken, id: SandboxId) -> Result<()> {
        let mut slots = self.lock()?;
        if let Some(slot) = slots.get(&token) {
            return Err(PerfboxError::ProtocolViolation(format!(
                "{} already holds {}",
                token,
                slot.sandbox()
            )));
        }
        if let Some((other, _)) = slots.iter().find(|(_, slot)| slot.sandbox() == id) {
            return Err(PerfboxError::ProtocolViolation(format!(
                "{} is already parked under {}",
                id, other
            )));
        }
        slots.insert(token, Slot::Reserved(id));
        Ok(())
    }

    /// Make a reserved slot adoptable
    pub fn publish(&self, token: TransferToken, id: SandboxId) -> Result<()> {
        let mut slots = self.lock()?;
        match slots.get_mut(&token) {
            Some(slot) if *slot == Slot::Reserved(id) => {
                *slot = Slot::Parked(id);
                self.parked.notify_all();
                Ok(())
            }
            _ => Err(PerfboxError::TransferSlotEmpty(token)),
        }
    }

    /// Drop a reservation of `id` under `token`
    pub fn cancel(&self, token: TransferToken, id: SandboxId) -> Result<()> {
        let mut slots = self.lock()?;
        if slots.get(&token) == Some(&Slot::Reserved(id)) {
            slots.remove(&token);
        }
        Ok(())
    }

    /// Reserve and publish in one step
    pub fn park(&self, token: TransferToken, id: SandboxId) -> Result<()> {
        self.reserve(token, id)?;
        self.publish(token, id)
    }

    /// Remove and return the sandbox parked under `token`
    pub fn take(&self, token: TransferToken) -> Result<SandboxId> {
        let mut slots = self.lock()?;
        match slots.get(&token) {
            Some(Slot::Parked(id)) => {
                let id = *id;
                slots.remove(&token);
                Ok(id)
            }
            _ => Err(PerfboxError::TransferSlotEmpty(token)),
        }
    }

    /// Like `take`, but waits up to `timeout` for the matching `park`
    pub fn take_wait(&self, token: TransferToken, timeout: Duration) -> Result<SandboxId> {
        let slots = self.lock()?;
        let (mut slots, _) = self
            .parked
            .wait_timeout_while(slots, timeout, |slots| {
                !matches!(slots.get(&token), Some(Slot::Parked(_)))
            })
            .map_err(|_| PerfboxError::Fatal("transfer table lock poisoned".to_string()))?;
        match slots.get(&token) {
            Some(Slot::Parked(id)) => {
                let id = *id;
                slots.remove(&token);
                Ok(id)
            }
            _ => Err(PerfboxError::TransferSlotEmpty(token)),
        }
    }

    /// Drop every slot holding `id`, reserved or parked
    pub fn purge(&self, id: SandboxId) -> Result<()> {
        self.lock()?.retain(|_, slot| slot.sandbox() != id);
        Ok(())
    }

    pub fn is_parked(&self, token: TransferToken) -> Result<bool> {
        Ok(matches!(self.lock()?.get(&token), Some(Slot::Parked(_))))
    }
}
