// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hypervisor.framework backend for aarch64.
//!
//! [`HardwareVcpu`] is the only way the execution core touches a hardware vCPU. On Apple silicon
//! it is implemented by [`HvfVcpu`]; elsewhere the core runs against [`crate::fake::FakeVcpu`].

mod hvf_sys;

use std::fmt;
use std::fmt::Display;
use std::sync::Arc;

pub use hvf_sys::*;

use crate::Error;
use crate::Result;

/// A decoded `hv_return_t` failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HvError {
    BadArgument,
    Busy,
    Denied,
    Error,
    NoDevice,
    NoResources,
    Unsupported,
    Unknown(hv_return_t),
}

impl HvError {
    pub fn from_raw(ret: hv_return_t) -> HvError {
        match ret {
            HV_ERROR => HvError::Error,
            HV_BUSY => HvError::Busy,
            HV_BAD_ARGUMENT => HvError::BadArgument,
            HV_NO_RESOURCES => HvError::NoResources,
            HV_NO_DEVICE => HvError::NoDevice,
            HV_DENIED => HvError::Denied,
            HV_UNSUPPORTED => HvError::Unsupported,
            other => HvError::Unknown(other),
        }
    }

    /// The errno used when this failure has to be reported through `io::Error`.
    pub fn errno(&self) -> i32 {
        match self {
            HvError::Error => libc::EIO,
            HvError::Busy => libc::EBUSY,
            HvError::BadArgument => libc::EINVAL,
            HvError::NoResources => libc::ENOMEM,
            HvError::NoDevice => libc::ENODEV,
            HvError::Denied => libc::EPERM,
            HvError::Unsupported => libc::ENOTSUP,
            HvError::Unknown(_) => libc::EIO,
        }
    }
}

impl Display for HvError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HvError::Error => write!(f, "HV_ERROR"),
            HvError::Busy => write!(f, "HV_BUSY"),
            HvError::BadArgument => write!(f, "HV_BAD_ARGUMENT"),
            HvError::NoResources => write!(f, "HV_NO_RESOURCES"),
            HvError::NoDevice => write!(f, "HV_NO_DEVICE"),
            HvError::Denied => write!(f, "HV_DENIED"),
            HvError::Unsupported => write!(f, "HV_UNSUPPORTED"),
            HvError::Unknown(ret) => write!(f, "unknown error {:#x}", *ret as u32),
        }
    }
}

/// Converts the return value of the framework entry point `call` into a `Result`.
pub fn hv_result(call: &'static str, ret: hv_return_t) -> Result<()> {
    if ret == HV_SUCCESS {
        Ok(())
    } else {
        Err(Error::Hypervisor {
            call,
            err: HvError::from_raw(ret),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Another thread requested an exit with `hv_vcpus_exit`.
    Canceled,
    Exception,
    /// The virtual timer fired. The framework masks the timer until told otherwise.
    VtimerActivated,
    Unknown(u32),
}

impl ExitReason {
    pub fn from_raw(raw: u32) -> ExitReason {
        match hv_exit_reason_t::n(raw) {
            Some(hv_exit_reason_t::HV_EXIT_REASON_CANCELED) => ExitReason::Canceled,
            Some(hv_exit_reason_t::HV_EXIT_REASON_EXCEPTION) => ExitReason::Exception,
            Some(hv_exit_reason_t::HV_EXIT_REASON_VTIMER_ACTIVATED) => ExitReason::VtimerActivated,
            Some(hv_exit_reason_t::HV_EXIT_REASON_UNKNOWN) | None => ExitReason::Unknown(raw),
        }
    }
}

/// Copy of the exit information from one `hv_vcpu_run` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitRecord {
    pub reason: ExitReason,
    pub syndrome: u64,
    pub virtual_address: u64,
    pub physical_address: u64,
}

impl ExitRecord {
    pub fn new(reason: ExitReason) -> ExitRecord {
        ExitRecord {
            reason,
            syndrome: 0,
            virtual_address: 0,
            physical_address: 0,
        }
    }

    pub fn exception(syndrome: u64, virtual_address: u64, physical_address: u64) -> ExitRecord {
        ExitRecord {
            reason: ExitReason::Exception,
            syndrome,
            virtual_address,
            physical_address,
        }
    }
}

impl From<&hv_vcpu_exit_t> for ExitRecord {
    fn from(exit: &hv_vcpu_exit_t) -> ExitRecord {
        ExitRecord {
            reason: ExitReason::from_raw(exit.reason),
            syndrome: exit.exception.syndrome,
            virtual_address: exit.exception.virtual_address,
            physical_address: exit.exception.physical_address,
        }
    }
}

/// Forces a running vCPU back to the host. Safe to call from any thread.
pub trait VcpuExitRequester: Send + Sync {
    fn request_exit(&self) -> Result<()>;
}

/// Operations the execution core needs from a hardware vCPU.
///
/// Implementations are owned by exactly one thread at a time; only the handle returned by
/// `exit_requester` may be shared.
pub trait HardwareVcpu: Send {
    fn get_reg(&self, reg: hv_reg_t) -> Result<u64>;
    fn set_reg(&mut self, reg: hv_reg_t, value: u64) -> Result<()>;
    fn get_sys_reg(&self, reg: hv_sys_reg_t) -> Result<u64>;
    fn set_sys_reg(&mut self, reg: hv_sys_reg_t, value: u64) -> Result<()>;
    fn get_simd_fp_reg(&self, reg: hv_simd_fp_reg_t) -> Result<u128>;
    fn set_simd_fp_reg(&mut self, reg: hv_simd_fp_reg_t, value: u128) -> Result<()>;
    fn set_pending_interrupt(&mut self, kind: hv_interrupt_type_t, pending: bool) -> Result<()>;
    fn set_vtimer_mask(&mut self, masked: bool) -> Result<()>;
    fn get_vtimer_offset(&self) -> Result<u64>;
    fn set_vtimer_offset(&mut self, offset: u64) -> Result<()>;
    fn set_trap_debug_exceptions(&mut self, enable: bool) -> Result<()>;
    /// Enters the guest and blocks until the next exit.
    fn run(&mut self) -> Result<ExitRecord>;
    fn exit_requester(&self) -> Arc<dyn VcpuExitRequester>;
}

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
pub use self::framework::*;

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
mod framework {
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use log::error;
    use log::info;

    use super::*;
    use crate::Error;
    use crate::Result;

    /// Set while a VM exists. The framework allows one VM per process.
    static VM_CREATED: AtomicBool = AtomicBool::new(false);

    /// Handle to the process-wide Hypervisor.framework.
    #[derive(Clone, Default)]
    pub struct Hvf {}

    impl Hvf {
        pub fn new() -> Hvf {
            Hvf::default()
        }
    }

    /// The process' single Hypervisor.framework VM.
    pub struct HvfVm {
        _hvf: Hvf,
    }

    impl HvfVm {
        pub fn new(hvf: &Hvf) -> Result<HvfVm> {
            if VM_CREATED
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return Err(Error::VmAlreadyExists);
            }

            // SAFETY: A null config requests the default VM configuration. The compare_exchange
            // above guarantees no other VM exists in this process.
            let ret = unsafe { hv_vm_create(std::ptr::null_mut()) };
            if let Err(e) = hv_result("hv_vm_create", ret) {
                VM_CREATED.store(false, Ordering::SeqCst);
                return Err(e);
            }
            info!("created Hypervisor.framework VM");

            Ok(HvfVm { _hvf: hvf.clone() })
        }

        /// Maps `size` bytes of host memory at `host_addr` into the guest at `guest_addr`.
        ///
        /// # Safety
        ///
        /// `host_addr` must point to `size` bytes of page-aligned memory that stays mapped until
        /// `unmap_memory` is called for the same range or the VM is dropped.
        pub unsafe fn map_memory(
            &self,
            host_addr: *mut u8,
            guest_addr: u64,
            size: usize,
            read_only: bool,
        ) -> Result<()> {
            let mut flags = HV_MEMORY_READ | HV_MEMORY_EXEC;
            if !read_only {
                flags |= HV_MEMORY_WRITE;
            }
            let ret = hv_vm_map(host_addr as *mut _, guest_addr, size, flags);
            hv_result("hv_vm_map", ret)
        }

        pub fn unmap_memory(&self, guest_addr: u64, size: usize) -> Result<()> {
            // SAFETY: Unmapping only changes the guest's view; host memory is left untouched.
            let ret = unsafe { hv_vm_unmap(guest_addr, size) };
            hv_result("hv_vm_unmap", ret)
        }

        /// Creates a vCPU bound to the calling thread. The framework requires every later
        /// operation on the vCPU, `hv_vcpu_run` included, to happen on that same thread, so the
        /// returned `HvfVcpu` (and any `VcpuCore` built from it) must not be moved to another
        /// thread once it is used. Only the exit requester may be used from other threads.
        pub fn create_vcpu(&self, id: usize) -> Result<HvfVcpu> {
            let mut vcpu: hv_vcpu_t = 0;
            let mut exit_info: *const hv_vcpu_exit_t = std::ptr::null();

            // SAFETY: vcpu and exit_info are valid out pointers on the stack. The null config
            // requests default vCPU settings.
            let ret = unsafe { hv_vcpu_create(&mut vcpu, &mut exit_info, std::ptr::null_mut()) };
            hv_result("hv_vcpu_create", ret)?;

            Ok(HvfVcpu {
                id,
                vcpu,
                exit_info,
                requester: Arc::new(HvfExitRequester { vcpu }),
            })
        }
    }

    impl Drop for HvfVm {
        fn drop(&mut self) {
            // SAFETY: The VM was created in new() and this is its only owner.
            let ret = unsafe { hv_vm_destroy() };
            if let Err(e) = hv_result("hv_vm_destroy", ret) {
                error!("{}", e);
            }
            VM_CREATED.store(false, Ordering::SeqCst);
        }
    }

    struct HvfExitRequester {
        vcpu: hv_vcpu_t,
    }

    impl VcpuExitRequester for HvfExitRequester {
        fn request_exit(&self) -> Result<()> {
            // SAFETY: hv_vcpus_exit may be called from any thread. We pass the address of a
            // single handle with count=1.
            let ret = unsafe { hv_vcpus_exit(&self.vcpu, 1) };
            hv_result("hv_vcpus_exit", ret)
        }
    }

    /// A Hypervisor.framework vCPU.
    pub struct HvfVcpu {
        id: usize,
        vcpu: hv_vcpu_t,
        exit_info: *const hv_vcpu_exit_t,
        requester: Arc<HvfExitRequester>,
    }

    // SAFETY: The raw exit_info pointer is only dereferenced by the owner inside run(). The
    // framework still binds the vCPU to its creating thread: after a move every call fails with
    // an error rather than touching freed state. See HvfVm::create_vcpu and VcpuCore::new.
    unsafe impl Send for HvfVcpu {}

    impl HvfVcpu {
        pub fn id(&self) -> usize {
            self.id
        }
    }

    impl Drop for HvfVcpu {
        fn drop(&mut self) {
            // SAFETY: self.vcpu was created by hv_vcpu_create and is destroyed exactly once.
            let ret = unsafe { hv_vcpu_destroy(self.vcpu) };
            if let Err(e) = hv_result("hv_vcpu_destroy", ret) {
                error!("vcpu {}: {}", self.id, e);
            }
        }
    }

    impl HardwareVcpu for HvfVcpu {
        fn get_reg(&self, reg: hv_reg_t) -> Result<u64> {
            let mut value = 0;
            // SAFETY: value is a valid out pointer and self.vcpu is a live handle.
            let ret = unsafe { hv_vcpu_get_reg(self.vcpu, reg, &mut value) };
            hv_result("hv_vcpu_get_reg", ret)?;
            Ok(value)
        }

        fn set_reg(&mut self, reg: hv_reg_t, value: u64) -> Result<()> {
            // SAFETY: self.vcpu is a live handle.
            let ret = unsafe { hv_vcpu_set_reg(self.vcpu, reg, value) };
            hv_result("hv_vcpu_set_reg", ret)
        }

        fn get_sys_reg(&self, reg: hv_sys_reg_t) -> Result<u64> {
            let mut value = 0;
            // SAFETY: value is a valid out pointer and self.vcpu is a live handle.
            let ret = unsafe { hv_vcpu_get_sys_reg(self.vcpu, reg, &mut value) };
            hv_result("hv_vcpu_get_sys_reg", ret)?;
            Ok(value)
        }

        fn set_sys_reg(&mut self, reg: hv_sys_reg_t, value: u64) -> Result<()> {
            // SAFETY: self.vcpu is a live handle.
            let ret = unsafe { hv_vcpu_set_sys_reg(self.vcpu, reg, value) };
            hv_result("hv_vcpu_set_sys_reg", ret)
        }

        fn get_simd_fp_reg(&self, reg: hv_simd_fp_reg_t) -> Result<u128> {
            let mut value: hv_simd_fp_uchar16_t = [0; 16];
            // SAFETY: value is a 16 byte out buffer and self.vcpu is a live handle.
            let ret = unsafe { hv_vcpu_get_simd_fp_reg(self.vcpu, reg, &mut value) };
            hv_result("hv_vcpu_get_simd_fp_reg", ret)?;
            Ok(u128::from_le_bytes(value))
        }

        fn set_simd_fp_reg(&mut self, reg: hv_simd_fp_reg_t, value: u128) -> Result<()> {
            // SAFETY: u128 and uint8x16_t are both 16 plain bytes, and self.vcpu is a live handle.
            let ret = unsafe {
                let value: std::arch::aarch64::uint8x16_t = std::mem::transmute(value);
                hv_vcpu_set_simd_fp_reg(self.vcpu, reg, value)
            };
            hv_result("hv_vcpu_set_simd_fp_reg", ret)
        }

        fn set_pending_interrupt(&mut self, kind: hv_interrupt_type_t, pending: bool) -> Result<()> {
            // SAFETY: self.vcpu is a live handle.
            let ret = unsafe { hv_vcpu_set_pending_interrupt(self.vcpu, kind, pending) };
            hv_result("hv_vcpu_set_pending_interrupt", ret)
        }

        fn set_vtimer_mask(&mut self, masked: bool) -> Result<()> {
            // SAFETY: self.vcpu is a live handle.
            let ret = unsafe { hv_vcpu_set_vtimer_mask(self.vcpu, masked) };
            hv_result("hv_vcpu_set_vtimer_mask", ret)
        }

        fn get_vtimer_offset(&self) -> Result<u64> {
            let mut offset = 0;
            // SAFETY: offset is a valid out pointer and self.vcpu is a live handle.
            let ret = unsafe { hv_vcpu_get_vtimer_offset(self.vcpu, &mut offset) };
            hv_result("hv_vcpu_get_vtimer_offset", ret)?;
            Ok(offset)
        }

        fn set_vtimer_offset(&mut self, offset: u64) -> Result<()> {
            // SAFETY: self.vcpu is a live handle.
            let ret = unsafe { hv_vcpu_set_vtimer_offset(self.vcpu, offset) };
            hv_result("hv_vcpu_set_vtimer_offset", ret)
        }

        fn set_trap_debug_exceptions(&mut self, enable: bool) -> Result<()> {
            // SAFETY: self.vcpu is a live handle.
            let ret = unsafe { hv_vcpu_set_trap_debug_exceptions(self.vcpu, enable) };
            hv_result("hv_vcpu_set_trap_debug_exceptions", ret)
        }

        fn run(&mut self) -> Result<ExitRecord> {
            // SAFETY: self.vcpu is a live handle owned by this thread, and &mut self guarantees
            // nothing else is using it.
            let ret = unsafe { hv_vcpu_run(self.vcpu) };
            hv_result("hv_vcpu_run", ret)?;

            // SAFETY: exit_info was filled in by hv_vcpu_create and stays valid until
            // hv_vcpu_destroy, which only runs in Drop.
            let exit_info = unsafe { &*self.exit_info };
            Ok(ExitRecord::from(exit_info))
        }

        fn exit_requester(&self) -> Arc<dyn VcpuExitRequester> {
            self.requester.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hv_result_names_the_call() {
        assert!(hv_result("hv_vcpu_run", HV_SUCCESS).is_ok());
        let err = hv_result("hv_vcpu_run", HV_BAD_ARGUMENT).expect_err("bad argument must fail");
        assert_eq!(err.to_string(), "hv_vcpu_run failed: HV_BAD_ARGUMENT");
        assert_eq!(err.errno(), libc::EINVAL);
    }

    #[test]
    fn unknown_return_codes_are_preserved() {
        let err = HvError::from_raw(0x1234);
        assert_eq!(err, HvError::Unknown(0x1234));
        assert_eq!(err.errno(), libc::EIO);
    }

    #[test]
    fn exit_reason_decoding() {
        assert_eq!(ExitReason::from_raw(0), ExitReason::Canceled);
        assert_eq!(ExitReason::from_raw(1), ExitReason::Exception);
        assert_eq!(ExitReason::from_raw(2), ExitReason::VtimerActivated);
        assert_eq!(ExitReason::from_raw(3), ExitReason::Unknown(3));
        assert_eq!(ExitReason::from_raw(42), ExitReason::Unknown(42));
    }
}
