// Copyright 2025 Chris Custine
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Buddy coordination for device instances sharing one physical device.
//!
//! A multi-function device (for example a transceiver) appears as separate
//! acquisition and generation instances that must share one hardware handle.
//! [`BuddyRegistry`] is an arena of such instances: buddy groups form a full
//! mesh over a common serial, exactly one member per group is the leader, and
//! only the leader ever performs the hardware open. Handles are
//! generation-checked so a stale handle can never reach freed or reused
//! slots.

use std::sync::{Arc, PoisonError};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::device::SharedDriver;
use crate::engine::StreamEngine;
use crate::{Direction, EngineError};

/// What a device instance does with samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceKind {
    /// Receives samples from the device.
    Acquisition,
    /// Sends samples to the device.
    Generation,
}

impl InstanceKind {
    fn label(self) -> &'static str {
        match self {
            Self::Acquisition => "rx",
            Self::Generation => "tx",
        }
    }
}

/// Generation-checked index into the registry arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceHandle {
    index: usize,
    generation: u64,
}

struct Instance {
    kind: InstanceKind,
    serial: String,
    driver: SharedDriver,
    leader: bool,
    holds_device: bool,
    acquisition_buddies: Vec<InstanceHandle>,
    generation_buddies: Vec<InstanceHandle>,
    engine: Option<Arc<StreamEngine>>,
}

struct Slot {
    generation: u64,
    entry: Option<Instance>,
}

/// Arena of device instances and their buddy groups.
///
/// An explicit context object: callers own the registry, there is no global
/// state, and buddy links are plain handles, never `Arc` cycles.
#[derive(Default)]
pub struct BuddyRegistry {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl std::fmt::Debug for BuddyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuddyRegistry")
            .field("slots", &self.slots.len())
            .field("free", &self.free.len())
            .finish()
    }
}

impl BuddyRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device instance as a new singleton group; the instance is
    /// its own leader.
    pub fn register(
        &mut self,
        kind: InstanceKind,
        serial: impl Into<String>,
        driver: SharedDriver,
    ) -> InstanceHandle {
        let serial = serial.into();
        let instance = Instance {
            kind,
            serial: serial.clone(),
            driver,
            leader: true,
            holds_device: false,
            acquisition_buddies: Vec::new(),
            generation_buddies: Vec::new(),
            engine: None,
        };
        let handle = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.entry = Some(instance);
                InstanceHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(instance),
                });
                InstanceHandle {
                    index: self.slots.len() - 1,
                    generation: 0,
                }
            }
        };
        info!("registered {} instance '{serial}' as {handle:?}", kind.label());
        handle
    }

    fn get(&self, handle: InstanceHandle) -> Option<&Instance> {
        let slot = self.slots.get(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    fn get_mut(&mut self, handle: InstanceHandle) -> Option<&mut Instance> {
        let slot = self.slots.get_mut(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    /// Whether the handle still refers to a live instance.
    #[must_use]
    pub fn is_valid(&self, handle: InstanceHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Whether this instance is its group's leader.
    #[must_use]
    pub fn is_leader(&self, handle: InstanceHandle) -> bool {
        self.get(handle).is_some_and(|i| i.leader)
    }

    /// All members of the instance's group, this instance first.
    #[must_use]
    pub fn members(&self, handle: InstanceHandle) -> Vec<InstanceHandle> {
        let Some(instance) = self.get(handle) else {
            return Vec::new();
        };
        let mut members = vec![handle];
        members.extend(&instance.acquisition_buddies);
        members.extend(&instance.generation_buddies);
        members
    }

    /// The instance's device driver, shared after a non-leader open.
    #[must_use]
    pub fn driver(&self, handle: InstanceHandle) -> Option<SharedDriver> {
        self.get(handle).map(|i| Arc::clone(&i.driver))
    }

    /// Associate a built engine with the instance.
    pub fn attach_engine(&mut self, handle: InstanceHandle, engine: Arc<StreamEngine>) {
        if let Some(instance) = self.get_mut(handle) {
            instance.engine = Some(engine);
        } else {
            warn!("attach_engine on stale handle {handle:?}");
        }
    }

    /// The engine associated with the instance, if any.
    #[must_use]
    pub fn engine(&self, handle: InstanceHandle) -> Option<Arc<StreamEngine>> {
        self.get(handle).and_then(|i| i.engine.clone())
    }

    /// Coarse textual engine state of one direction, for status reporting.
    #[must_use]
    pub fn state_name(&self, handle: InstanceHandle, direction: Direction) -> &'static str {
        self.engine(handle)
            .map_or("detached", |engine| engine.state_name(direction))
    }

    /// Add an acquisition instance to a group.
    ///
    /// The candidate must be an acquisition instance on the same physical
    /// serial as `group_member` and not yet in any group, else the group is
    /// left unchanged.
    pub fn attach_acquisition_buddy(
        &mut self,
        group_member: InstanceHandle,
        candidate: InstanceHandle,
    ) -> Result<(), EngineError> {
        self.attach(group_member, candidate, InstanceKind::Acquisition)
    }

    /// Add a generation instance to a group; same contract as the
    /// acquisition variant.
    pub fn attach_generation_buddy(
        &mut self,
        group_member: InstanceHandle,
        candidate: InstanceHandle,
    ) -> Result<(), EngineError> {
        self.attach(group_member, candidate, InstanceKind::Generation)
    }

    fn attach(
        &mut self,
        group_member: InstanceHandle,
        candidate: InstanceHandle,
        kind: InstanceKind,
    ) -> Result<(), EngineError> {
        if group_member == candidate {
            return Err(EngineError::BuddyProtocol(
                "an instance cannot buddy itself".to_owned(),
            ));
        }
        let member = self
            .get(group_member)
            .ok_or_else(|| EngineError::BuddyProtocol("stale group member handle".to_owned()))?;
        let member_serial = member.serial.clone();
        let cand = self
            .get(candidate)
            .ok_or_else(|| EngineError::BuddyProtocol("stale candidate handle".to_owned()))?;
        if cand.kind != kind {
            return Err(EngineError::BuddyProtocol(format!(
                "candidate is a {} instance, expected {}",
                cand.kind.label(),
                kind.label()
            )));
        }
        if cand.serial != member_serial {
            return Err(EngineError::BuddyProtocol(format!(
                "serial mismatch: '{}' vs '{}'",
                cand.serial, member_serial
            )));
        }
        // the full-mesh update assumes a singleton candidate; a candidate
        // with buddies of its own (this group or another on the same serial)
        // would leave buddy lists stale
        if !cand.acquisition_buddies.is_empty() || !cand.generation_buddies.is_empty() {
            return Err(EngineError::BuddyProtocol(
                "candidate already belongs to a group".to_owned(),
            ));
        }
        let group = self.members(group_member);

        // full mesh: candidate learns every member, every member learns the
        // candidate
        for &other in &group {
            if let Some(other_instance) = self.get(other) {
                let (other_kind, other_handle) = (other_instance.kind, other);
                if let Some(cand_instance) = self.get_mut(candidate) {
                    match other_kind {
                        InstanceKind::Acquisition => {
                            cand_instance.acquisition_buddies.push(other_handle);
                        }
                        InstanceKind::Generation => {
                            cand_instance.generation_buddies.push(other_handle);
                        }
                    }
                }
            }
            if let Some(other_instance) = self.get_mut(other) {
                match kind {
                    InstanceKind::Acquisition => {
                        other_instance.acquisition_buddies.push(candidate);
                    }
                    InstanceKind::Generation => {
                        other_instance.generation_buddies.push(candidate);
                    }
                }
            }
        }
        // exactly one leader per group
        if let Some(cand_instance) = self.get_mut(candidate) {
            cand_instance.leader = false;
        }
        info!("attached {} buddy {candidate:?} to group of {group_member:?}", kind.label());
        Ok(())
    }

    /// Remove an instance from its group and free its slot.
    ///
    /// A departing leader first promotes the first remaining acquisition
    /// buddy, falling back to the first generation buddy. Detaching the last
    /// member closes the hardware if this instance still holds it open.
    pub fn detach(&mut self, handle: InstanceHandle) {
        let Some(instance) = self.get(handle) else {
            warn!("detach on stale handle {handle:?}");
            return;
        };
        let was_leader = instance.leader;
        let holds_device = instance.holds_device;
        let buddies: Vec<InstanceHandle> = instance
            .acquisition_buddies
            .iter()
            .chain(&instance.generation_buddies)
            .copied()
            .collect();
        let successor = instance
            .acquisition_buddies
            .first()
            .or_else(|| instance.generation_buddies.first())
            .copied();
        let driver = Arc::clone(&instance.driver);

        if was_leader {
            if let Some(next) = successor {
                if let Some(next_instance) = self.get_mut(next) {
                    next_instance.leader = true;
                    info!("promoted {next:?} to group leader");
                }
            }
        }
        for buddy in &buddies {
            if let Some(buddy_instance) = self.get_mut(*buddy) {
                buddy_instance.acquisition_buddies.retain(|h| *h != handle);
                buddy_instance.generation_buddies.retain(|h| *h != handle);
            }
        }
        if buddies.is_empty() && holds_device {
            // last member leaving the group releases the hardware
            driver
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .close();
        }

        let slot = &mut self.slots[handle.index];
        slot.entry = None;
        slot.generation += 1;
        self.free.push(handle.index);
        info!("detached {handle:?}");
    }

    /// Acquire the physical device for this instance.
    ///
    /// The leader opens through its own driver. A non-leader never touches
    /// the hardware: it adopts the already-open shared handle of a buddy.
    pub fn open_device(&mut self, handle: InstanceHandle) -> Result<(), EngineError> {
        let Some(instance) = self.get(handle) else {
            warn!("open_device on stale handle {handle:?}, hardware untouched");
            return Err(EngineError::BuddyProtocol("stale handle".to_owned()));
        };
        if instance.holds_device {
            return Ok(());
        }
        if instance.leader {
            let serial = instance.serial.clone();
            let driver = Arc::clone(&instance.driver);
            driver
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .open(&serial)?;
            if let Some(instance) = self.get_mut(handle) {
                instance.holds_device = true;
            }
            return Ok(());
        }

        let shared = self
            .members(handle)
            .into_iter()
            .skip(1)
            .find_map(|buddy| {
                let buddy_instance = self.get(buddy)?;
                if buddy_instance.holds_device {
                    Some(Arc::clone(&buddy_instance.driver))
                } else {
                    None
                }
            })
            .ok_or_else(|| {
                EngineError::BuddyProtocol("no buddy holds an open device handle".to_owned())
            })?;
        if let Some(instance) = self.get_mut(handle) {
            instance.driver = shared;
            instance.holds_device = true;
        }
        Ok(())
    }

    /// Release this instance's device handle.
    ///
    /// The hardware is closed only when no other group member still holds
    /// the shared handle.
    pub fn close_device(&mut self, handle: InstanceHandle) {
        let Some(instance) = self.get_mut(handle) else {
            warn!("close_device on stale handle {handle:?}");
            return;
        };
        if !instance.holds_device {
            return;
        }
        instance.holds_device = false;
        let driver = Arc::clone(&instance.driver);

        let held_elsewhere = self
            .members(handle)
            .into_iter()
            .skip(1)
            .any(|buddy| self.get(buddy).is_some_and(|i| i.holds_device));
        if !held_elsewhere {
            driver
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testsig::TestSignalDriver;
    use std::sync::Mutex;

    fn driver() -> (SharedDriver, Arc<crate::device::testsig::OpenCounters>) {
        let d = TestSignalDriver::default();
        let counters = d.counters();
        (Arc::new(Mutex::new(d)), counters)
    }

    #[test]
    fn test_register_is_own_leader() {
        let mut registry = BuddyRegistry::new();
        let (d, _) = driver();
        let handle = registry.register(InstanceKind::Acquisition, "serial-a", d);
        assert!(registry.is_leader(handle));
        assert_eq!(registry.members(handle), vec![handle]);
    }

    #[test]
    fn test_cross_serial_attach_rejected_group_unchanged() {
        let mut registry = BuddyRegistry::new();
        let (d1, _) = driver();
        let (d2, _) = driver();
        let a = registry.register(InstanceKind::Acquisition, "serial-a", d1);
        let b = registry.register(InstanceKind::Acquisition, "serial-b", d2);
        assert!(matches!(
            registry.attach_acquisition_buddy(a, b),
            Err(EngineError::BuddyProtocol(_))
        ));
        assert_eq!(registry.members(a), vec![a]);
        assert_eq!(registry.members(b), vec![b]);
        assert!(registry.is_leader(b));
    }

    #[test]
    fn test_cross_kind_attach_rejected() {
        let mut registry = BuddyRegistry::new();
        let (d1, _) = driver();
        let (d2, _) = driver();
        let rx = registry.register(InstanceKind::Acquisition, "serial-a", d1);
        let tx = registry.register(InstanceKind::Generation, "serial-a", d2);
        assert!(registry.attach_acquisition_buddy(rx, tx).is_err());
        // the right variant accepts the same pair
        registry.attach_generation_buddy(rx, tx).unwrap();
        assert_eq!(registry.members(rx), vec![rx, tx]);
    }

    #[test]
    fn test_attach_rejects_candidate_with_own_group() {
        let mut registry = BuddyRegistry::new();
        let (d1, _) = driver();
        let (d2, _) = driver();
        let (d3, _) = driver();
        let (d4, _) = driver();
        let a1 = registry.register(InstanceKind::Acquisition, "s", d1);
        let a2 = registry.register(InstanceKind::Acquisition, "s", d2);
        registry.attach_acquisition_buddy(a1, a2).unwrap();
        let b1 = registry.register(InstanceKind::Acquisition, "s", d3);
        let b2 = registry.register(InstanceKind::Acquisition, "s", d4);
        registry.attach_acquisition_buddy(b1, b2).unwrap();

        // merging two groups through one member would leave b2's buddy
        // list unaware of group A
        assert!(matches!(
            registry.attach_acquisition_buddy(a1, b1),
            Err(EngineError::BuddyProtocol(_))
        ));
        assert_eq!(registry.members(a1), vec![a1, a2]);
        assert_eq!(registry.members(b1), vec![b1, b2]);
        assert!(registry.is_leader(b1));

        // re-attaching an existing member is rejected for the same reason
        assert!(registry.attach_acquisition_buddy(a1, a2).is_err());
        assert_eq!(registry.members(a1), vec![a1, a2]);
    }

    #[test]
    fn test_leader_demotion_on_attach() {
        let mut registry = BuddyRegistry::new();
        let (d1, _) = driver();
        let (d2, _) = driver();
        let first = registry.register(InstanceKind::Acquisition, "serial-a", d1);
        let second = registry.register(InstanceKind::Acquisition, "serial-a", d2);
        assert!(registry.is_leader(second));
        registry.attach_acquisition_buddy(first, second).unwrap();
        assert!(registry.is_leader(first));
        assert!(!registry.is_leader(second));
    }

    #[test]
    fn test_detach_chain_promotes_in_order() {
        let mut registry = BuddyRegistry::new();
        let (d1, _) = driver();
        let (d2, _) = driver();
        let (d3, _) = driver();
        let leader = registry.register(InstanceKind::Acquisition, "s", d1);
        let rx2 = registry.register(InstanceKind::Acquisition, "s", d2);
        let tx = registry.register(InstanceKind::Generation, "s", d3);
        registry.attach_acquisition_buddy(leader, rx2).unwrap();
        registry.attach_generation_buddy(leader, tx).unwrap();
        assert_eq!(registry.members(leader).len(), 3);

        // acquisition buddy promoted ahead of the generation buddy
        registry.detach(leader);
        assert!(!registry.is_valid(leader));
        assert!(registry.is_leader(rx2));
        assert!(!registry.is_leader(tx));
        assert_eq!(registry.members(rx2), vec![rx2, tx]);

        // only a generation buddy left
        registry.detach(rx2);
        assert!(registry.is_leader(tx));
        assert_eq!(registry.members(tx), vec![tx]);
    }

    #[test]
    fn test_stale_handle_after_detach() {
        let mut registry = BuddyRegistry::new();
        let (d1, _) = driver();
        let old = registry.register(InstanceKind::Acquisition, "s", d1);
        registry.detach(old);

        // slot reuse must not resurrect the old handle
        let (d2, _) = driver();
        let new = registry.register(InstanceKind::Acquisition, "s", d2);
        assert_eq!(old.index, new.index);
        assert!(!registry.is_valid(old));
        assert!(registry.is_valid(new));
        assert!(registry.open_device(old).is_err());
    }

    #[test]
    fn test_non_leader_open_adopts_without_hardware_open() {
        let mut registry = BuddyRegistry::new();
        let (d1, leader_counters) = driver();
        let (d2, buddy_counters) = driver();
        let leader = registry.register(InstanceKind::Acquisition, "s", d1);
        let buddy = registry.register(InstanceKind::Generation, "s", d2);
        registry.attach_generation_buddy(leader, buddy).unwrap();

        registry.open_device(leader).unwrap();
        registry.open_device(buddy).unwrap();
        assert_eq!(leader_counters.opens(), 1);
        // the buddy's own driver was never opened: it adopted the leader's
        assert_eq!(buddy_counters.opens(), 0);
        let shared = registry.driver(buddy).unwrap();
        assert!(shared.lock().unwrap().is_open());
    }

    #[test]
    fn test_non_leader_open_without_open_buddy_fails() {
        let mut registry = BuddyRegistry::new();
        let (d1, _) = driver();
        let (d2, counters) = driver();
        let leader = registry.register(InstanceKind::Acquisition, "s", d1);
        let buddy = registry.register(InstanceKind::Generation, "s", d2);
        registry.attach_generation_buddy(leader, buddy).unwrap();

        assert!(matches!(
            registry.open_device(buddy),
            Err(EngineError::BuddyProtocol(_))
        ));
        assert_eq!(counters.opens(), 0);
    }

    #[test]
    fn test_close_device_waits_for_last_holder() {
        let mut registry = BuddyRegistry::new();
        let (d1, counters) = driver();
        let (d2, _) = driver();
        let leader = registry.register(InstanceKind::Acquisition, "s", d1);
        let buddy = registry.register(InstanceKind::Generation, "s", d2);
        registry.attach_generation_buddy(leader, buddy).unwrap();
        registry.open_device(leader).unwrap();
        registry.open_device(buddy).unwrap();

        registry.close_device(leader);
        // the buddy still holds the shared handle
        assert_eq!(counters.closes(), 0);
        registry.close_device(buddy);
        assert_eq!(counters.closes(), 1);
    }

    #[test]
    fn test_last_member_detach_closes_held_device() {
        let mut registry = BuddyRegistry::new();
        let (d, counters) = driver();
        let handle = registry.register(InstanceKind::Acquisition, "s", d);
        registry.open_device(handle).unwrap();
        registry.detach(handle);
        assert_eq!(counters.closes(), 1);
    }
}
