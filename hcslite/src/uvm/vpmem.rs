//! Virtual persistent-memory device array for a Linux-guest utility VM.
//!
//! A fixed array of 128 devices; the index is the device number the guest
//! sees. Devices hold read-only VHDs and are ref-counted by host path.

use hcslite_shared::{HcsliteError, HcsliteResult};

pub const MAX_VPMEM_DEVICES: u32 = 128;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VpmemDevice {
    pub host_path: String,
    pub guest_path: String,
    pub ref_count: u32,
}

impl VpmemDevice {
    fn is_free(&self) -> bool {
        self.host_path.is_empty()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum VpmemAdd {
    First { device: u32 },
    Again { device: u32, ref_count: u32 },
}

#[derive(Debug, PartialEq, Eq)]
pub enum VpmemRemove {
    Decremented { device: u32, ref_count: u32 },
    Removed { device: u32 },
}

#[derive(Debug)]
pub struct VpmemTable {
    devices: Vec<VpmemDevice>,
}

impl VpmemTable {
    pub fn new() -> Self {
        Self {
            devices: vec![VpmemDevice::default(); MAX_VPMEM_DEVICES as usize],
        }
    }

    /// Add a reference to `host_path`, claiming the first free device for a
    /// new path.
    pub fn add(&mut self, host_path: &str, guest_path: &str) -> HcsliteResult<VpmemAdd> {
        if let Some(device) = self.find(host_path) {
            let entry = &mut self.devices[device as usize];
            entry.ref_count += 1;
            return Ok(VpmemAdd::Again {
                device,
                ref_count: entry.ref_count,
            });
        }

        for (index, entry) in self.devices.iter_mut().enumerate() {
            if entry.is_free() {
                *entry = VpmemDevice {
                    host_path: host_path.to_string(),
                    guest_path: guest_path.to_string(),
                    ref_count: 1,
                };
                return Ok(VpmemAdd::First {
                    device: index as u32,
                });
            }
        }
        Err(HcsliteError::NoFreeSlots)
    }

    pub fn remove(&mut self, host_path: &str) -> HcsliteResult<VpmemRemove> {
        let device = self
            .find(host_path)
            .ok_or_else(|| HcsliteError::NotAttached(host_path.to_string()))?;
        let entry = &mut self.devices[device as usize];
        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            return Ok(VpmemRemove::Decremented {
                device,
                ref_count: entry.ref_count,
            });
        }
        *entry = VpmemDevice::default();
        Ok(VpmemRemove::Removed { device })
    }

    /// Undo a [`VpmemAdd::First`] whose platform request failed.
    pub fn forget(&mut self, device: u32) {
        self.devices[device as usize] = VpmemDevice::default();
    }

    pub fn find(&self, host_path: &str) -> Option<u32> {
        self.devices
            .iter()
            .position(|d| !d.is_free() && d.host_path == host_path)
            .map(|i| i as u32)
    }

    pub fn get(&self, device: u32) -> &VpmemDevice {
        &self.devices[device as usize]
    }
}

impl Default for VpmemTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_free_device_is_claimed_in_order() {
        let mut table = VpmemTable::new();
        assert_eq!(
            table.add("a.vhd", "/layer/0").unwrap(),
            VpmemAdd::First { device: 0 }
        );
        assert_eq!(
            table.add("b.vhd", "/layer/1").unwrap(),
            VpmemAdd::First { device: 1 }
        );
    }

    #[test]
    fn repeat_adds_ref_count_the_same_device() {
        let mut table = VpmemTable::new();
        table.add("a.vhd", "/layer/0").unwrap();
        assert_eq!(
            table.add("a.vhd", "/layer/0").unwrap(),
            VpmemAdd::Again {
                device: 0,
                ref_count: 2
            }
        );
        assert_eq!(
            table.remove("a.vhd").unwrap(),
            VpmemRemove::Decremented {
                device: 0,
                ref_count: 1
            }
        );
        assert_eq!(
            table.remove("a.vhd").unwrap(),
            VpmemRemove::Removed { device: 0 }
        );
        assert!(table.find("a.vhd").is_none());
    }

    #[test]
    fn the_array_is_bounded() {
        let mut table = VpmemTable::new();
        for i in 0..MAX_VPMEM_DEVICES {
            table.add(&format!("layer-{}.vhd", i), "").unwrap();
        }
        assert_eq!(
            table.add("one-more.vhd", "").unwrap_err(),
            HcsliteError::NoFreeSlots
        );
    }

    #[test]
    fn removing_an_unknown_path_is_an_error() {
        let mut table = VpmemTable::new();
        assert!(matches!(
            table.remove("ghost.vhd"),
            Err(HcsliteError::NotAttached(_))
        ));
    }
}
