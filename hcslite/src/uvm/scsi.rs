//! SCSI slot matrix for a utility VM.
//!
//! 4 controllers × 64 LUNs. A slot is free iff its host path is empty. The
//! utility VM's own scratch disk, when it has one, is pinned at (0, 0) and
//! can never be released.

use hcslite_shared::{HcsliteError, HcsliteResult};

pub const CONTROLLER_COUNT: u8 = 4;
pub const LUNS_PER_CONTROLLER: u8 = 64;

/// One (controller, LUN) coordinate.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScsiSlot {
    pub host_path: String,
    pub guest_path: String,
}

impl ScsiSlot {
    fn is_free(&self) -> bool {
        self.host_path.is_empty()
    }
}

/// The attachment matrix.
#[derive(Debug)]
pub struct ScsiTable {
    slots: Vec<Vec<ScsiSlot>>,
    pinned: Option<(u8, u8)>,
}

impl ScsiTable {
    pub fn new() -> Self {
        Self {
            slots: (0..CONTROLLER_COUNT)
                .map(|_| vec![ScsiSlot::default(); LUNS_PER_CONTROLLER as usize])
                .collect(),
            pinned: None,
        }
    }

    /// Record the VM's own scratch at (0, 0) and pin the slot for the
    /// lifetime of the VM.
    pub fn reserve_scratch(&mut self, host_path: &str) {
        self.slots[0][0] = ScsiSlot {
            host_path: host_path.to_string(),
            guest_path: String::new(),
        };
        self.pinned = Some((0, 0));
    }

    /// Claim the first free slot, scanning in (controller, LUN) order.
    pub fn allocate(&mut self, host_path: &str, guest_path: &str) -> HcsliteResult<(u8, u8)> {
        for controller in 0..CONTROLLER_COUNT {
            for lun in 0..LUNS_PER_CONTROLLER {
                let slot = &mut self.slots[controller as usize][lun as usize];
                if slot.is_free() {
                    slot.host_path = host_path.to_string();
                    slot.guest_path = guest_path.to_string();
                    return Ok((controller, lun));
                }
            }
        }
        Err(HcsliteError::NoFreeSlots)
    }

    /// Release a slot back to the free pool.
    pub fn deallocate(&mut self, controller: u8, lun: u8) -> HcsliteResult<()> {
        if self.pinned == Some((controller, lun)) {
            return Err(HcsliteError::InvalidState(format!(
                "scsi slot ({}, {}) holds the utility VM scratch",
                controller, lun
            )));
        }
        self.slots[controller as usize][lun as usize] = ScsiSlot::default();
        Ok(())
    }

    /// The pinned scratch coordinate, if one was reserved.
    pub fn pinned(&self) -> Option<(u8, u8)> {
        self.pinned
    }

    /// Find the slot holding `host_path`.
    pub fn find(&self, host_path: &str) -> Option<(u8, u8, &ScsiSlot)> {
        for controller in 0..CONTROLLER_COUNT {
            for lun in 0..LUNS_PER_CONTROLLER {
                let slot = &self.slots[controller as usize][lun as usize];
                if !slot.is_free() && slot.host_path == host_path {
                    return Some((controller, lun, slot));
                }
            }
        }
        None
    }

    pub fn get(&self, controller: u8, lun: u8) -> &ScsiSlot {
        &self.slots[controller as usize][lun as usize]
    }
}

impl Default for ScsiTable {
    fn default() -> Self {
        Self::new()
    }
}
