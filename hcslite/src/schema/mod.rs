//! Serde models for the platform's JSON documents.
//!
//! Only the fields the runtime reads or writes are modeled; open-ended
//! payloads (caller-supplied document fragments, hosted settings) travel as
//! `serde_json::Value` so callers can merge their own JSON over ours.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ----------------------------------------------------------------------------
// Modify requests
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestType {
    Add,
    Remove,
    Update,
}

/// A request to mutate a running compute system's configuration, optionally
/// carrying settings for the in-guest agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModifyRequest {
    pub resource_path: String,
    pub request_type: RequestType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hosted_settings: Option<Value>,
}

pub fn scsi_resource_path(controller: u8, lun: u8) -> String {
    format!("VirtualMachine/Devices/SCSI/{}/{}", controller, lun)
}

pub fn vpmem_resource_path(device: u32) -> String {
    format!("VirtualMachine/Devices/VirtualPMem/Devices/{}", device)
}

pub fn vsmb_resource_path(name: &str) -> String {
    format!("VirtualMachine/Devices/VirtualSmb/Shares/{}", name)
}

pub fn plan9_resource_path(guid: &str) -> String {
    format!("virtualmachine/devices/plan9shares/{}", guid)
}

// ----------------------------------------------------------------------------
// Device settings
// ----------------------------------------------------------------------------

/// A virtual disk attached to a SCSI slot.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Attachment {
    #[serde(rename = "Type")]
    pub type_: String,
    pub path: String,
}

impl Attachment {
    pub fn virtual_disk(path: impl Into<String>) -> Self {
        Self {
            type_: "VirtualDisk".into(),
            path: path.into(),
        }
    }
}

/// Guest-side settings for a mapped SCSI disk.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MappedVirtualDisk {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_path: Option<String>,
    pub lun: u8,
    pub attach_only: bool,
}

/// A read-only VHD exposed as a virtual persistent-memory device.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VirtualPMemDevice {
    pub host_path: String,
    pub read_only: bool,
    pub image_format: String,
}

impl VirtualPMemDevice {
    pub fn vhd1(host_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            read_only: true,
            image_format: "Vhd1".into(),
        }
    }
}

/// Guest-side mapping of VPMem device numbers to mount paths.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MappedVPMemController {
    pub mapped_devices: BTreeMap<u32, String>,
}

/// VSMB share flag bits.
pub mod vsmb_flag {
    /// Guest opens the share read-only.
    pub const READ_ONLY: u32 = 0x0000_0001;
    /// Allows concurrent reader sessions.
    pub const SHARE_READ: u32 = 0x0000_0002;
    /// Permits caching of file I/O.
    pub const CACHE_IO: u32 = 0x0000_0008;
    /// Enables synthetic opportunistic locks.
    pub const PSEUDO_OPLOCKS: u32 = 0x0000_0010;
    /// Opens files with SeBackupPrivilege.
    pub const TAKE_BACKUP_PRIVILEGE: u32 = 0x0000_0020;
}

/// A VSMB share exposed to a Windows guest.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VirtualSmbShare {
    pub name: String,
    pub path: String,
    pub flags: u32,
}

/// A Plan9 share exposed to a Linux guest.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Plan9Share {
    pub name: String,
    pub path: String,
    pub port: u32,
}

/// Guest-side settings for a Plan9 mount.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MappedPlan9Share {
    pub mount_path: String,
    pub port: u32,
    pub read_only: bool,
}

// ----------------------------------------------------------------------------
// Compute-system documents
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
}

impl SchemaVersion {
    pub fn v2() -> Self {
        Self { major: 2, minor: 0 }
    }
}

/// Top-level create document.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ComputeSystemDocument {
    pub owner: String,
    pub schema_version: SchemaVersion,
    pub should_terminate_on_last_handle_closed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub virtual_machine: Option<VirtualMachine>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerDocument>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VirtualMachine {
    pub chipset: Chipset,
    pub compute_topology: Topology,
    pub devices: Devices,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Chipset {
    pub uefi: Uefi,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Uefi {
    pub boot_this: UefiBootEntry,
}

/// UEFI boot entry; the device is always the VMB filesystem share.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UefiBootEntry {
    pub device_type: String,
    pub device_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optional_data: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Topology {
    pub memory: Memory,
    pub processor: Processor,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Memory {
    #[serde(rename = "SizeInMB")]
    pub size_in_mb: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Processor {
    pub count: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Devices {
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub scsi: BTreeMap<String, ScsiController>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub virtual_smb: Option<VirtualSmb>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub virtual_pmem: Option<VirtualPMemController>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan9: Option<Plan9>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_interface: Option<GuestInterface>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub com_ports: Option<BTreeMap<String, ComPort>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyboard: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mouse: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_monitor: Option<Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScsiController {
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub attachments: BTreeMap<String, Attachment>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VirtualSmb {
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub shares: Vec<VirtualSmbShare>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VirtualPMemController {
    pub maximum_count: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Plan9 {
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub shares: Vec<Plan9Share>,
}

/// The bridge between the host and the in-guest agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GuestInterface {
    pub connect_to_bridge: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ComPort {
    pub named_pipe: String,
}

/// Create document for a container (hosted directly or inside a VM).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerDocument {
    pub system_type: String,
    pub owner: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer_folder_path: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub layers: Vec<Layer>,
    pub hv_partition: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hosting_system_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Layer {
    #[serde(rename = "ID")]
    pub id: String,
    pub path: String,
}

// ----------------------------------------------------------------------------
// Properties
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyType {
    Statistics,
    Memory,
    Processor,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PropertyQuery {
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub property_types: Vec<PropertyType>,
}

/// Properties reported for a compute system.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SystemProperties {
    pub id: String,
    pub state: String,
    pub system_type: String,
    pub runtime_os_type: String,
    pub owner: String,
    pub stopped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statistics: Option<Value>,
}

/// Properties reported for a process.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ProcessProperties {
    pub process_id: u32,
    pub exited: bool,
    pub exit_code: i32,
    pub last_wait_result: i32,
}

// ----------------------------------------------------------------------------
// Process documents
// ----------------------------------------------------------------------------

/// Parameters for creating a process inside a compute system.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ProcessDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_name: Option<String>,
    pub command_line: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    pub emulate_console: bool,
    pub create_std_in_pipe: bool,
    pub create_std_out_pipe: bool,
    pub create_std_err_pipe: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub console_size: Option<[u16; 2]>,
}

/// Modify request targeted at a single process.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProcessModifyRequest {
    pub operation: ProcessModifyOperation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub console_size: Option<ConsoleSize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_handle: Option<CloseHandle>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessModifyOperation {
    ConsoleSize,
    CloseHandle,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConsoleSize {
    pub height: u16,
    pub width: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StdHandle {
    StdIn,
    StdOut,
    StdErr,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CloseHandle {
    pub handle: StdHandle,
}

/// Signal options passed to `signal_process`.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SignalOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
}
