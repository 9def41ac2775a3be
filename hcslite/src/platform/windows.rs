//! Thin bindings to vmcompute.dll, virtdisk.dll, and the layer utilities.
//!
//! Everything here is marshalling: wide strings in, result documents out,
//! HRESULTs classified through the shared decoder. Domain behavior lives
//! above the [`ComputeApi`] boundary, not here.

#![allow(non_snake_case, clippy::missing_safety_doc)]

use std::ffi::{OsStr, OsString, c_void};
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use hcslite_shared::{HcsliteError, HcsliteResult};
use parking_lot::Mutex;

use crate::hcs::api::{ComputeApi, DiskApi, ProcessCreated, ProcessStdio, RawHandle};
use crate::hcs::callback;
use crate::hcs::result;
use crate::layers::{LayerMounter, UnmountOp};

type Hresult = i32;
type Handle = *mut c_void;
type Pwstr = *mut u16;
type Pcwstr = *const u16;

#[repr(C)]
struct HcsProcessInformation {
    process_id: u32,
    reserved: u32,
    std_input: Handle,
    std_output: Handle,
    std_error: Handle,
}

type NotificationCallback =
    unsafe extern "system" fn(notification_type: u32, context: *mut c_void, status: Hresult, data: Pcwstr);

#[link(name = "vmcompute")]
unsafe extern "system" {
    fn HcsCreateComputeSystem(
        id: Pcwstr,
        configuration: Pcwstr,
        identity: Handle,
        compute_system: *mut Handle,
        result: *mut Pwstr,
    ) -> Hresult;
    fn HcsOpenComputeSystem(id: Pcwstr, compute_system: *mut Handle, result: *mut Pwstr) -> Hresult;
    fn HcsCloseComputeSystem(compute_system: Handle) -> Hresult;
    fn HcsStartComputeSystem(compute_system: Handle, options: Pcwstr, result: *mut Pwstr) -> Hresult;
    fn HcsShutdownComputeSystem(compute_system: Handle, options: Pcwstr, result: *mut Pwstr) -> Hresult;
    fn HcsTerminateComputeSystem(compute_system: Handle, options: Pcwstr, result: *mut Pwstr) -> Hresult;
    fn HcsPauseComputeSystem(compute_system: Handle, options: Pcwstr, result: *mut Pwstr) -> Hresult;
    fn HcsResumeComputeSystem(compute_system: Handle, options: Pcwstr, result: *mut Pwstr) -> Hresult;
    fn HcsModifyComputeSystem(compute_system: Handle, configuration: Pcwstr, result: *mut Pwstr) -> Hresult;
    fn HcsGetComputeSystemProperties(
        compute_system: Handle,
        property_query: Pcwstr,
        properties: *mut Pwstr,
        result: *mut Pwstr,
    ) -> Hresult;
    fn HcsRegisterComputeSystemCallback(
        compute_system: Handle,
        callback: NotificationCallback,
        context: *mut c_void,
        callback_handle: *mut Handle,
    ) -> Hresult;
    fn HcsUnregisterComputeSystemCallback(callback_handle: Handle) -> Hresult;
    fn HcsCreateProcess(
        compute_system: Handle,
        process_parameters: Pcwstr,
        process_information: *mut HcsProcessInformation,
        process: *mut Handle,
        result: *mut Pwstr,
    ) -> Hresult;
    fn HcsCloseProcess(process: Handle) -> Hresult;
    fn HcsTerminateProcess(process: Handle, result: *mut Pwstr) -> Hresult;
    fn HcsSignalProcess(process: Handle, options: Pcwstr, result: *mut Pwstr) -> Hresult;
    fn HcsModifyProcess(process: Handle, settings: Pcwstr, result: *mut Pwstr) -> Hresult;
    fn HcsGetProcessProperties(process: Handle, properties: *mut Pwstr, result: *mut Pwstr) -> Hresult;
    fn HcsRegisterProcessCallback(
        process: Handle,
        callback: NotificationCallback,
        context: *mut c_void,
        callback_handle: *mut Handle,
    ) -> Hresult;
    fn HcsUnregisterProcessCallback(callback_handle: Handle) -> Hresult;
    fn GrantVmAccess(vm_id: Pcwstr, file_path: Pcwstr) -> Hresult;
}

#[link(name = "kernel32")]
unsafe extern "system" {
    fn LocalFree(mem: *mut c_void) -> *mut c_void;
    fn OpenProcess(access: u32, inherit: i32, pid: u32) -> Handle;
    fn GetExitCodeProcess(process: Handle, exit_code: *mut u32) -> i32;
    fn CloseHandle(handle: Handle) -> i32;
    fn SetStdHandle(which: u32, handle: Handle) -> i32;
}

const PROCESS_QUERY_LIMITED_INFORMATION: u32 = 0x1000;
const STILL_ACTIVE: u32 = 259;
const STD_ERROR_HANDLE: u32 = -12i32 as u32;

fn wide(value: &str) -> Vec<u16> {
    OsStr::new(value).encode_wide().chain(Some(0)).collect()
}

fn opt_wide(value: Option<&str>) -> Vec<u16> {
    wide(value.unwrap_or(""))
}

/// Take ownership of a result string the service allocated.
unsafe fn take_result(result: Pwstr) -> Option<String> {
    if result.is_null() {
        return None;
    }
    let mut length = 0usize;
    while unsafe { *result.add(length) } != 0 {
        length += 1;
    }
    let text = OsString::from_wide(unsafe { std::slice::from_raw_parts(result, length) })
        .to_string_lossy()
        .into_owned();
    unsafe { LocalFree(result.cast()) };
    Some(text)
}

/// Convert an (HRESULT, result document) pair into the taxonomy.
fn check(hr: Hresult, result: Pwstr) -> HcsliteResult<()> {
    let document = unsafe { take_result(result) };
    match result::decode(hr, document.as_deref()) {
        None => Ok(()),
        Some(err) => Err(err),
    }
}

/// The single callback entry point handed to the service. `context` carries
/// the callback number, never a pointer.
unsafe extern "system" fn notification_trampoline(
    notification_type: u32,
    context: *mut c_void,
    status: Hresult,
    data: Pcwstr,
) {
    let payload = if data.is_null() {
        None
    } else {
        let mut length = 0usize;
        while unsafe { *data.add(length) } != 0 {
            length += 1;
        }
        Some(
            OsString::from_wide(unsafe { std::slice::from_raw_parts(data, length) })
                .to_string_lossy()
                .into_owned(),
        )
    };
    callback::deliver(context as u64, notification_type, status, payload.as_deref());
}

/// Handles are opaque `u64` tokens above this boundary; the table maps them
/// back to the raw pointers the service understands.
#[derive(Default)]
struct HandleTable {
    next: AtomicU64,
    live: Mutex<std::collections::HashMap<u64, usize>>,
}

impl HandleTable {
    fn insert(&self, raw: Handle) -> RawHandle {
        let token = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        self.live.lock().insert(token, raw as usize);
        token
    }

    fn get(&self, token: RawHandle) -> HcsliteResult<Handle> {
        self.live
            .lock()
            .get(&token)
            .map(|raw| *raw as Handle)
            .ok_or(HcsliteError::AlreadyClosed)
    }

    fn remove(&self, token: RawHandle) -> HcsliteResult<Handle> {
        self.live
            .lock()
            .remove(&token)
            .map(|raw| raw as Handle)
            .ok_or(HcsliteError::AlreadyClosed)
    }
}

/// vmcompute.dll-backed [`ComputeApi`].
pub struct VmCompute {
    handles: Arc<HandleTable>,
}

impl VmCompute {
    pub fn new() -> Self {
        Self {
            handles: Arc::new(HandleTable::default()),
        }
    }

    async fn blocking<T, F>(&self, f: F) -> HcsliteResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> HcsliteResult<T> + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| HcsliteError::Internal(format!("platform call task: {}", e)))?
    }
}

#[async_trait]
impl ComputeApi for VmCompute {
    async fn create_system(&self, id: &str, document: &str) -> HcsliteResult<RawHandle> {
        let handles = Arc::clone(&self.handles);
        let id = wide(id);
        let document = wide(document);
        self.blocking(move || {
            let mut raw: Handle = std::ptr::null_mut();
            let mut result: Pwstr = std::ptr::null_mut();
            let hr = unsafe {
                HcsCreateComputeSystem(
                    id.as_ptr(),
                    document.as_ptr(),
                    std::ptr::null_mut(),
                    &mut raw,
                    &mut result,
                )
            };
            // Pending is the expected answer; completion arrives by callback.
            match check(hr, result) {
                Ok(()) => Ok(handles.insert(raw)),
                Err(err) if err.is_pending() => Ok(handles.insert(raw)),
                Err(err) => Err(err),
            }
        })
        .await
    }

    async fn open_system(&self, id: &str) -> HcsliteResult<RawHandle> {
        let handles = Arc::clone(&self.handles);
        let id = wide(id);
        self.blocking(move || {
            let mut raw: Handle = std::ptr::null_mut();
            let mut result: Pwstr = std::ptr::null_mut();
            let hr = unsafe { HcsOpenComputeSystem(id.as_ptr(), &mut raw, &mut result) };
            check(hr, result)?;
            Ok(handles.insert(raw))
        })
        .await
    }

    async fn start_system(&self, handle: RawHandle, options: Option<&str>) -> HcsliteResult<()> {
        let raw = self.handles.get(handle)? as usize;
        let options = opt_wide(options);
        self.blocking(move || {
            let mut result: Pwstr = std::ptr::null_mut();
            let hr = unsafe { HcsStartComputeSystem(raw as Handle, options.as_ptr(), &mut result) };
            check(hr, result)
        })
        .await
    }

    async fn shutdown_system(&self, handle: RawHandle, options: Option<&str>) -> HcsliteResult<()> {
        let raw = self.handles.get(handle)? as usize;
        let options = opt_wide(options);
        self.blocking(move || {
            let mut result: Pwstr = std::ptr::null_mut();
            let hr =
                unsafe { HcsShutdownComputeSystem(raw as Handle, options.as_ptr(), &mut result) };
            check(hr, result)
        })
        .await
    }

    async fn terminate_system(
        &self,
        handle: RawHandle,
        options: Option<&str>,
    ) -> HcsliteResult<()> {
        let raw = self.handles.get(handle)? as usize;
        let options = opt_wide(options);
        self.blocking(move || {
            let mut result: Pwstr = std::ptr::null_mut();
            let hr =
                unsafe { HcsTerminateComputeSystem(raw as Handle, options.as_ptr(), &mut result) };
            check(hr, result)
        })
        .await
    }

    async fn pause_system(&self, handle: RawHandle, options: Option<&str>) -> HcsliteResult<()> {
        let raw = self.handles.get(handle)? as usize;
        let options = opt_wide(options);
        self.blocking(move || {
            let mut result: Pwstr = std::ptr::null_mut();
            let hr = unsafe { HcsPauseComputeSystem(raw as Handle, options.as_ptr(), &mut result) };
            check(hr, result)
        })
        .await
    }

    async fn resume_system(&self, handle: RawHandle, options: Option<&str>) -> HcsliteResult<()> {
        let raw = self.handles.get(handle)? as usize;
        let options = opt_wide(options);
        self.blocking(move || {
            let mut result: Pwstr = std::ptr::null_mut();
            let hr = unsafe { HcsResumeComputeSystem(raw as Handle, options.as_ptr(), &mut result) };
            check(hr, result)
        })
        .await
    }

    async fn modify_system(&self, handle: RawHandle, request: &str) -> HcsliteResult<()> {
        let raw = self.handles.get(handle)? as usize;
        let request = wide(request);
        self.blocking(move || {
            let mut result: Pwstr = std::ptr::null_mut();
            let hr = unsafe { HcsModifyComputeSystem(raw as Handle, request.as_ptr(), &mut result) };
            check(hr, result)
        })
        .await
    }

    async fn system_properties(&self, handle: RawHandle, query: &str) -> HcsliteResult<String> {
        let raw = self.handles.get(handle)? as usize;
        let query = wide(query);
        self.blocking(move || {
            let mut properties: Pwstr = std::ptr::null_mut();
            let mut result: Pwstr = std::ptr::null_mut();
            let hr = unsafe {
                HcsGetComputeSystemProperties(
                    raw as Handle,
                    query.as_ptr(),
                    &mut properties,
                    &mut result,
                )
            };
            check(hr, result)?;
            Ok(unsafe { take_result(properties) }.unwrap_or_default())
        })
        .await
    }

    fn close_system(&self, handle: RawHandle) -> HcsliteResult<()> {
        let raw = self.handles.remove(handle)?;
        let hr = unsafe { HcsCloseComputeSystem(raw) };
        match result::classify_hresult(hr) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    fn register_system_callback(
        &self,
        handle: RawHandle,
        callback_number: u64,
    ) -> HcsliteResult<RawHandle> {
        let raw = self.handles.get(handle)?;
        let mut callback_handle: Handle = std::ptr::null_mut();
        let hr = unsafe {
            HcsRegisterComputeSystemCallback(
                raw,
                notification_trampoline,
                callback_number as *mut c_void,
                &mut callback_handle,
            )
        };
        match result::classify_hresult(hr) {
            None => Ok(self.handles.insert(callback_handle)),
            Some(err) => Err(err),
        }
    }

    fn register_process_callback(
        &self,
        handle: RawHandle,
        callback_number: u64,
    ) -> HcsliteResult<RawHandle> {
        let raw = self.handles.get(handle)?;
        let mut callback_handle: Handle = std::ptr::null_mut();
        let hr = unsafe {
            HcsRegisterProcessCallback(
                raw,
                notification_trampoline,
                callback_number as *mut c_void,
                &mut callback_handle,
            )
        };
        match result::classify_hresult(hr) {
            None => Ok(self.handles.insert(callback_handle)),
            Some(err) => Err(err),
        }
    }

    fn unregister_callback(&self, callback_handle: RawHandle) -> HcsliteResult<()> {
        let raw = self.handles.remove(callback_handle)?;
        // Blocks until in-flight callbacks return. Try the system variant
        // first; process callback handles share the same table.
        let hr = unsafe { HcsUnregisterComputeSystemCallback(raw) };
        if hr < 0 {
            let hr = unsafe { HcsUnregisterProcessCallback(raw) };
            if let Some(err) = result::classify_hresult(hr) {
                return Err(err);
            }
        }
        Ok(())
    }

    async fn create_process(
        &self,
        system: RawHandle,
        document: &str,
    ) -> HcsliteResult<ProcessCreated> {
        use std::os::windows::io::FromRawHandle;

        let handles = Arc::clone(&self.handles);
        let raw = self.handles.get(system)? as usize;
        let document = wide(document);
        self.blocking(move || {
            let mut info = HcsProcessInformation {
                process_id: 0,
                reserved: 0,
                std_input: std::ptr::null_mut(),
                std_output: std::ptr::null_mut(),
                std_error: std::ptr::null_mut(),
            };
            let mut process: Handle = std::ptr::null_mut();
            let mut result: Pwstr = std::ptr::null_mut();
            let hr = unsafe {
                HcsCreateProcess(
                    raw as Handle,
                    document.as_ptr(),
                    &mut info,
                    &mut process,
                    &mut result,
                )
            };
            check(hr, result)?;

            let wrap = |handle: Handle| {
                if handle.is_null() {
                    None
                } else {
                    Some(unsafe { std::fs::File::from_raw_handle(handle.cast()) })
                }
            };
            Ok(ProcessCreated {
                process_id: info.process_id,
                handle: handles.insert(process),
                stdio: ProcessStdio {
                    stdin: wrap(info.std_input),
                    stdout: wrap(info.std_output),
                    stderr: wrap(info.std_error),
                },
            })
        })
        .await
    }

    async fn signal_process(&self, process: RawHandle, options: &str) -> HcsliteResult<()> {
        let raw = self.handles.get(process)? as usize;
        let options = wide(options);
        self.blocking(move || {
            let mut result: Pwstr = std::ptr::null_mut();
            let hr = unsafe { HcsSignalProcess(raw as Handle, options.as_ptr(), &mut result) };
            check(hr, result)
        })
        .await
    }

    async fn terminate_process(&self, process: RawHandle) -> HcsliteResult<()> {
        let raw = self.handles.get(process)? as usize;
        self.blocking(move || {
            let mut result: Pwstr = std::ptr::null_mut();
            let hr = unsafe { HcsTerminateProcess(raw as Handle, &mut result) };
            check(hr, result)
        })
        .await
    }

    async fn modify_process(&self, process: RawHandle, request: &str) -> HcsliteResult<()> {
        let raw = self.handles.get(process)? as usize;
        let request = wide(request);
        self.blocking(move || {
            let mut result: Pwstr = std::ptr::null_mut();
            let hr = unsafe { HcsModifyProcess(raw as Handle, request.as_ptr(), &mut result) };
            check(hr, result)
        })
        .await
    }

    async fn process_properties(&self, process: RawHandle) -> HcsliteResult<String> {
        let raw = self.handles.get(process)? as usize;
        self.blocking(move || {
            let mut properties: Pwstr = std::ptr::null_mut();
            let mut result: Pwstr = std::ptr::null_mut();
            let hr =
                unsafe { HcsGetProcessProperties(raw as Handle, &mut properties, &mut result) };
            check(hr, result)?;
            Ok(unsafe { take_result(properties) }.unwrap_or_default())
        })
        .await
    }

    fn close_process(&self, process: RawHandle) -> HcsliteResult<()> {
        let raw = self.handles.remove(process)?;
        let hr = unsafe { HcsCloseProcess(raw) };
        match result::classify_hresult(hr) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

// ----------------------------------------------------------------------------
// Virtual disks
// ----------------------------------------------------------------------------

#[link(name = "virtdisk")]
unsafe extern "system" {
    fn CreateVirtualDisk(
        storage_type: *const VirtualStorageType,
        path: Pcwstr,
        access_mask: u32,
        security_descriptor: *const c_void,
        flags: u32,
        provider_specific_flags: u32,
        parameters: *const CreateVirtualDiskParameters,
        overlapped: *const c_void,
        handle: *mut Handle,
    ) -> u32;
}

#[repr(C)]
struct VirtualStorageType {
    device_id: u32,
    vendor_id: [u8; 16],
}

#[repr(C)]
struct CreateVirtualDiskParameters {
    version: u32,
    unique_id: [u8; 16],
    maximum_size: u64,
    block_size_in_bytes: u32,
    sector_size_in_bytes: u32,
    parent_path: Pcwstr,
    source_path: Pcwstr,
}

const VIRTUAL_STORAGE_TYPE_DEVICE_VHDX: u32 = 3;
const VIRTUAL_STORAGE_TYPE_VENDOR_MICROSOFT: [u8; 16] = [
    0xb3, 0x71, 0x44, 0xec, 0xde, 0x97, 0xf4, 0x41, 0xb3, 0x0e, 0x91, 0x1a, 0x27, 0xa6, 0x2f,
    0x2b,
];
const VIRTUAL_DISK_ACCESS_ALL: u32 = 0x003f_0000;
const CREATE_VIRTUAL_DISK_VERSION_1: u32 = 1;

/// virtdisk.dll-backed [`DiskApi`].
pub struct VirtDisk;

#[async_trait]
impl DiskApi for VirtDisk {
    async fn create_vhd(&self, path: &Path, size_gb: u64) -> HcsliteResult<()> {
        let path = wide(&path.to_string_lossy());
        tokio::task::spawn_blocking(move || {
            let storage_type = VirtualStorageType {
                device_id: VIRTUAL_STORAGE_TYPE_DEVICE_VHDX,
                vendor_id: VIRTUAL_STORAGE_TYPE_VENDOR_MICROSOFT,
            };
            let parameters = CreateVirtualDiskParameters {
                version: CREATE_VIRTUAL_DISK_VERSION_1,
                unique_id: [0; 16],
                maximum_size: size_gb * 1024 * 1024 * 1024,
                block_size_in_bytes: 0,
                sector_size_in_bytes: 0,
                parent_path: std::ptr::null(),
                source_path: std::ptr::null(),
            };
            let mut handle: Handle = std::ptr::null_mut();
            let status = unsafe {
                CreateVirtualDisk(
                    &storage_type,
                    path.as_ptr(),
                    VIRTUAL_DISK_ACCESS_ALL,
                    std::ptr::null(),
                    0,
                    0,
                    &parameters,
                    std::ptr::null(),
                    &mut handle,
                )
            };
            if status != 0 {
                return Err(HcsliteError::Io(format!(
                    "CreateVirtualDisk failed with {}",
                    status
                )));
            }
            unsafe { CloseHandle(handle) };
            Ok(())
        })
        .await
        .map_err(|e| HcsliteError::Internal(format!("platform call task: {}", e)))?
    }

    async fn grant_vm_access(&self, vm_id: &str, path: &Path) -> HcsliteResult<()> {
        let vm_id = wide(vm_id);
        let path = wide(&path.to_string_lossy());
        tokio::task::spawn_blocking(move || {
            let hr = unsafe { GrantVmAccess(vm_id.as_ptr(), path.as_ptr()) };
            match result::classify_hresult(hr) {
                None => Ok(()),
                Some(err) => Err(err),
            }
        })
        .await
        .map_err(|e| HcsliteError::Internal(format!("platform call task: {}", e)))?
    }
}

// ----------------------------------------------------------------------------
// Layer mounting
// ----------------------------------------------------------------------------

#[repr(C)]
struct DriverInfo {
    flavour: u32,
    home_dir: Pcwstr,
}

#[repr(C)]
struct WcLayerDescriptor {
    layer_id: [u8; 16],
    flags: u32,
    path: Pcwstr,
}

#[link(name = "vmcompute")]
unsafe extern "system" {
    fn ActivateLayer(info: *const DriverInfo, id: Pcwstr) -> Hresult;
    fn PrepareLayer(
        info: *const DriverInfo,
        id: Pcwstr,
        descriptors: *const WcLayerDescriptor,
        count: u32,
    ) -> Hresult;
    fn UnprepareLayer(info: *const DriverInfo, id: Pcwstr) -> Hresult;
    fn DeactivateLayer(info: *const DriverInfo, id: Pcwstr) -> Hresult;
    fn GetLayerMountPath(
        info: *const DriverInfo,
        id: Pcwstr,
        length: *mut u64,
        path: Pwstr,
    ) -> Hresult;
}

const FILTER_DRIVER: u32 = 1;

fn hr_check(hr: Hresult) -> HcsliteResult<()> {
    match result::classify_hresult(hr) {
        None => Ok(()),
        Some(err) => Err(err),
    }
}

/// Layer mounting through the platform's filter driver.
#[derive(Default)]
pub struct WcLayers;

impl WcLayers {
    fn with_scratch<T>(
        scratch: &std::path::Path,
        container_id: &str,
        f: impl FnOnce(&DriverInfo, &[u16]) -> HcsliteResult<T>,
    ) -> HcsliteResult<T> {
        let home = wide(&scratch.parent().unwrap_or(scratch).to_string_lossy());
        let info = DriverInfo {
            flavour: FILTER_DRIVER,
            home_dir: home.as_ptr(),
        };
        let id = wide(container_id);
        f(&info, &id)
    }
}

#[async_trait]
impl LayerMounter for WcLayers {
    async fn mount(
        &self,
        container_id: &str,
        layer_folders: &[std::path::PathBuf],
    ) -> HcsliteResult<std::path::PathBuf> {
        let Some(scratch) = layer_folders.last() else {
            return Err(HcsliteError::InvalidState("no layer folders".into()));
        };
        let parents: Vec<Vec<u16>> = layer_folders[..layer_folders.len() - 1]
            .iter()
            .map(|folder| wide(&folder.to_string_lossy()))
            .collect();

        Self::with_scratch(scratch, container_id, |info, id| {
            let descriptors: Vec<WcLayerDescriptor> = parents
                .iter()
                .map(|path| WcLayerDescriptor {
                    layer_id: *uuid::Uuid::new_v5(
                        &uuid::Uuid::NAMESPACE_OID,
                        path.iter().flat_map(|u| u.to_le_bytes()).collect::<Vec<_>>().as_slice(),
                    )
                    .as_bytes(),
                    flags: 0,
                    path: path.as_ptr(),
                })
                .collect();

            hr_check(unsafe { ActivateLayer(info, id.as_ptr()) })?;
            if let Err(err) = hr_check(unsafe {
                PrepareLayer(info, id.as_ptr(), descriptors.as_ptr(), descriptors.len() as u32)
            }) {
                let _ = hr_check(unsafe { DeactivateLayer(info, id.as_ptr()) });
                return Err(err);
            }

            let mut length: u64 = 0;
            hr_check(unsafe {
                GetLayerMountPath(info, id.as_ptr(), &mut length, std::ptr::null_mut())
            })?;
            let mut buffer = vec![0u16; length as usize];
            hr_check(unsafe {
                GetLayerMountPath(info, id.as_ptr(), &mut length, buffer.as_mut_ptr())
            })?;
            let end = buffer.iter().position(|c| *c == 0).unwrap_or(buffer.len());
            Ok(std::path::PathBuf::from(OsString::from_wide(&buffer[..end])))
        })
    }

    async fn unmount(
        &self,
        container_id: &str,
        layer_folders: &[std::path::PathBuf],
        op: UnmountOp,
    ) -> HcsliteResult<()> {
        let Some(scratch) = layer_folders.last() else {
            return Ok(());
        };
        Self::with_scratch(scratch, container_id, |info, id| {
            hr_check(unsafe { UnprepareLayer(info, id.as_ptr()) })?;
            if op == UnmountOp::All {
                hr_check(unsafe { DeactivateLayer(info, id.as_ptr()) })?;
            }
            Ok(())
        })
    }
}

// ----------------------------------------------------------------------------
// Process helpers
// ----------------------------------------------------------------------------

/// Whether `pid` names a live process.
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle.is_null() {
            return false;
        }
        let mut code = 0u32;
        let alive = GetExitCodeProcess(handle, &mut code) != 0 && code == STILL_ACTIVE;
        CloseHandle(handle);
        alive
    }
}

/// Detach stderr so the parent's handshake read reaches end-of-file.
pub fn release_stderr() {
    unsafe {
        SetStdHandle(STD_ERROR_HANDLE, std::ptr::null_mut());
    }
}
