// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Raw Hypervisor.framework types and entry points for aarch64.
//!
//! The types are plain data and compile on every host so the run loop can be exercised without
//! the framework. Only the `extern` block is restricted to Apple silicon.

#![allow(non_camel_case_types)]

use enumn::N;

pub type hv_return_t = i32;
pub type hv_vcpu_t = u64;
pub type hv_ipa_t = u64;
pub type hv_memory_flags_t = u64;

pub const HV_SUCCESS: hv_return_t = 0;
pub const HV_ERROR: hv_return_t = 0xfae94001_u32 as i32;
pub const HV_BUSY: hv_return_t = 0xfae94002_u32 as i32;
pub const HV_BAD_ARGUMENT: hv_return_t = 0xfae94003_u32 as i32;
pub const HV_NO_RESOURCES: hv_return_t = 0xfae94005_u32 as i32;
pub const HV_NO_DEVICE: hv_return_t = 0xfae94006_u32 as i32;
pub const HV_DENIED: hv_return_t = 0xfae94007_u32 as i32;
pub const HV_UNSUPPORTED: hv_return_t = 0xfae9400f_u32 as i32;

pub const HV_MEMORY_READ: hv_memory_flags_t = 1 << 0;
pub const HV_MEMORY_WRITE: hv_memory_flags_t = 1 << 1;
pub const HV_MEMORY_EXEC: hv_memory_flags_t = 1 << 2;

/// General purpose and special registers addressed by `hv_vcpu_{get,set}_reg`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, N)]
pub enum hv_reg_t {
    HV_REG_X0 = 0,
    HV_REG_X1 = 1,
    HV_REG_X2 = 2,
    HV_REG_X3 = 3,
    HV_REG_X4 = 4,
    HV_REG_X5 = 5,
    HV_REG_X6 = 6,
    HV_REG_X7 = 7,
    HV_REG_X8 = 8,
    HV_REG_X9 = 9,
    HV_REG_X10 = 10,
    HV_REG_X11 = 11,
    HV_REG_X12 = 12,
    HV_REG_X13 = 13,
    HV_REG_X14 = 14,
    HV_REG_X15 = 15,
    HV_REG_X16 = 16,
    HV_REG_X17 = 17,
    HV_REG_X18 = 18,
    HV_REG_X19 = 19,
    HV_REG_X20 = 20,
    HV_REG_X21 = 21,
    HV_REG_X22 = 22,
    HV_REG_X23 = 23,
    HV_REG_X24 = 24,
    HV_REG_X25 = 25,
    HV_REG_X26 = 26,
    HV_REG_X27 = 27,
    HV_REG_X28 = 28,
    HV_REG_X29 = 29,
    HV_REG_X30 = 30,
    HV_REG_PC = 31,
    HV_REG_FPCR = 32,
    HV_REG_FPSR = 33,
    HV_REG_CPSR = 34,
}

impl hv_reg_t {
    /// Returns the general purpose register `Xn`, or `None` for n > 30.
    pub fn x(n: u8) -> Option<hv_reg_t> {
        if n <= 30 {
            hv_reg_t::n(u32::from(n))
        } else {
            None
        }
    }
}

/// System register id as encoded by the framework headers.
pub type hv_sys_reg_t = u16;

pub const HV_SYS_REG_MDCCINT_EL1: hv_sys_reg_t = 0x8010;
pub const HV_SYS_REG_MDSCR_EL1: hv_sys_reg_t = 0x8012;
pub const HV_SYS_REG_MIDR_EL1: hv_sys_reg_t = 0xc000;
pub const HV_SYS_REG_MPIDR_EL1: hv_sys_reg_t = 0xc005;
pub const HV_SYS_REG_ID_AA64PFR0_EL1: hv_sys_reg_t = 0xc020;
pub const HV_SYS_REG_ID_AA64PFR1_EL1: hv_sys_reg_t = 0xc021;
pub const HV_SYS_REG_ID_AA64DFR0_EL1: hv_sys_reg_t = 0xc028;
pub const HV_SYS_REG_ID_AA64DFR1_EL1: hv_sys_reg_t = 0xc029;
pub const HV_SYS_REG_ID_AA64ISAR0_EL1: hv_sys_reg_t = 0xc030;
pub const HV_SYS_REG_ID_AA64ISAR1_EL1: hv_sys_reg_t = 0xc031;
pub const HV_SYS_REG_ID_AA64MMFR0_EL1: hv_sys_reg_t = 0xc038;
pub const HV_SYS_REG_ID_AA64MMFR1_EL1: hv_sys_reg_t = 0xc039;
pub const HV_SYS_REG_ID_AA64MMFR2_EL1: hv_sys_reg_t = 0xc03a;
pub const HV_SYS_REG_SCTLR_EL1: hv_sys_reg_t = 0xc080;
pub const HV_SYS_REG_CPACR_EL1: hv_sys_reg_t = 0xc082;
pub const HV_SYS_REG_TTBR0_EL1: hv_sys_reg_t = 0xc100;
pub const HV_SYS_REG_TTBR1_EL1: hv_sys_reg_t = 0xc101;
pub const HV_SYS_REG_TCR_EL1: hv_sys_reg_t = 0xc102;
pub const HV_SYS_REG_APIAKEYLO_EL1: hv_sys_reg_t = 0xc108;
pub const HV_SYS_REG_APIAKEYHI_EL1: hv_sys_reg_t = 0xc109;
pub const HV_SYS_REG_APIBKEYLO_EL1: hv_sys_reg_t = 0xc10a;
pub const HV_SYS_REG_APIBKEYHI_EL1: hv_sys_reg_t = 0xc10b;
pub const HV_SYS_REG_APDAKEYLO_EL1: hv_sys_reg_t = 0xc110;
pub const HV_SYS_REG_APDAKEYHI_EL1: hv_sys_reg_t = 0xc111;
pub const HV_SYS_REG_APDBKEYLO_EL1: hv_sys_reg_t = 0xc112;
pub const HV_SYS_REG_APDBKEYHI_EL1: hv_sys_reg_t = 0xc113;
pub const HV_SYS_REG_APGAKEYLO_EL1: hv_sys_reg_t = 0xc118;
pub const HV_SYS_REG_APGAKEYHI_EL1: hv_sys_reg_t = 0xc119;
pub const HV_SYS_REG_SPSR_EL1: hv_sys_reg_t = 0xc200;
pub const HV_SYS_REG_ELR_EL1: hv_sys_reg_t = 0xc201;
pub const HV_SYS_REG_SP_EL0: hv_sys_reg_t = 0xc208;
pub const HV_SYS_REG_AFSR0_EL1: hv_sys_reg_t = 0xc288;
pub const HV_SYS_REG_AFSR1_EL1: hv_sys_reg_t = 0xc289;
pub const HV_SYS_REG_ESR_EL1: hv_sys_reg_t = 0xc290;
pub const HV_SYS_REG_FAR_EL1: hv_sys_reg_t = 0xc300;
pub const HV_SYS_REG_PAR_EL1: hv_sys_reg_t = 0xc3a0;
pub const HV_SYS_REG_MAIR_EL1: hv_sys_reg_t = 0xc510;
pub const HV_SYS_REG_AMAIR_EL1: hv_sys_reg_t = 0xc518;
pub const HV_SYS_REG_VBAR_EL1: hv_sys_reg_t = 0xc600;
pub const HV_SYS_REG_CONTEXTIDR_EL1: hv_sys_reg_t = 0xc681;
pub const HV_SYS_REG_TPIDR_EL1: hv_sys_reg_t = 0xc684;
pub const HV_SYS_REG_CNTKCTL_EL1: hv_sys_reg_t = 0xc708;
pub const HV_SYS_REG_CSSELR_EL1: hv_sys_reg_t = 0xd000;
pub const HV_SYS_REG_TPIDR_EL0: hv_sys_reg_t = 0xde82;
pub const HV_SYS_REG_TPIDRRO_EL0: hv_sys_reg_t = 0xde83;
pub const HV_SYS_REG_CNTV_CTL_EL0: hv_sys_reg_t = 0xdf19;
pub const HV_SYS_REG_CNTV_CVAL_EL0: hv_sys_reg_t = 0xdf1a;
pub const HV_SYS_REG_SP_EL1: hv_sys_reg_t = 0xe208;

/// Number of breakpoint/watchpoint register pairs the framework exposes.
pub const HV_DEBUG_REG_PAIRS: u8 = 16;

/// DBGBVR<n>_EL1. The debug block is laid out with a stride of 8 per index.
pub const fn hv_sys_reg_dbgbvr(n: u8) -> hv_sys_reg_t {
    0x8004 + (n as hv_sys_reg_t) * 8
}

/// DBGBCR<n>_EL1.
pub const fn hv_sys_reg_dbgbcr(n: u8) -> hv_sys_reg_t {
    0x8005 + (n as hv_sys_reg_t) * 8
}

/// DBGWVR<n>_EL1.
pub const fn hv_sys_reg_dbgwvr(n: u8) -> hv_sys_reg_t {
    0x8006 + (n as hv_sys_reg_t) * 8
}

/// DBGWCR<n>_EL1.
pub const fn hv_sys_reg_dbgwcr(n: u8) -> hv_sys_reg_t {
    0x8007 + (n as hv_sys_reg_t) * 8
}

/// SIMD/FP registers Q0-Q31.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
pub enum hv_simd_fp_reg_t {
    HV_SIMD_FP_REG_Q0 = 0,
    HV_SIMD_FP_REG_Q1 = 1,
    HV_SIMD_FP_REG_Q2 = 2,
    HV_SIMD_FP_REG_Q3 = 3,
    HV_SIMD_FP_REG_Q4 = 4,
    HV_SIMD_FP_REG_Q5 = 5,
    HV_SIMD_FP_REG_Q6 = 6,
    HV_SIMD_FP_REG_Q7 = 7,
    HV_SIMD_FP_REG_Q8 = 8,
    HV_SIMD_FP_REG_Q9 = 9,
    HV_SIMD_FP_REG_Q10 = 10,
    HV_SIMD_FP_REG_Q11 = 11,
    HV_SIMD_FP_REG_Q12 = 12,
    HV_SIMD_FP_REG_Q13 = 13,
    HV_SIMD_FP_REG_Q14 = 14,
    HV_SIMD_FP_REG_Q15 = 15,
    HV_SIMD_FP_REG_Q16 = 16,
    HV_SIMD_FP_REG_Q17 = 17,
    HV_SIMD_FP_REG_Q18 = 18,
    HV_SIMD_FP_REG_Q19 = 19,
    HV_SIMD_FP_REG_Q20 = 20,
    HV_SIMD_FP_REG_Q21 = 21,
    HV_SIMD_FP_REG_Q22 = 22,
    HV_SIMD_FP_REG_Q23 = 23,
    HV_SIMD_FP_REG_Q24 = 24,
    HV_SIMD_FP_REG_Q25 = 25,
    HV_SIMD_FP_REG_Q26 = 26,
    HV_SIMD_FP_REG_Q27 = 27,
    HV_SIMD_FP_REG_Q28 = 28,
    HV_SIMD_FP_REG_Q29 = 29,
    HV_SIMD_FP_REG_Q30 = 30,
    HV_SIMD_FP_REG_Q31 = 31,
}

pub type hv_simd_fp_uchar16_t = [u8; 16];

/// Exit reasons reported in `hv_vcpu_exit_t::reason`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
pub enum hv_exit_reason_t {
    HV_EXIT_REASON_CANCELED = 0,
    HV_EXIT_REASON_EXCEPTION = 1,
    HV_EXIT_REASON_VTIMER_ACTIVATED = 2,
    HV_EXIT_REASON_UNKNOWN = 3,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct hv_vcpu_exit_exception_t {
    pub syndrome: u64,
    pub virtual_address: u64,
    pub physical_address: u64,
}

/// Exit information written by the framework. `reason` is kept raw so an out of range value
/// from a newer framework cannot produce an invalid enum.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct hv_vcpu_exit_t {
    pub reason: u32,
    pub exception: hv_vcpu_exit_exception_t,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum hv_interrupt_type_t {
    HV_INTERRUPT_TYPE_IRQ = 0,
    HV_INTERRUPT_TYPE_FIQ = 1,
}

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
pub use self::ffi::*;

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
mod ffi {
    use std::arch::aarch64::uint8x16_t;
    use std::ffi::c_void;

    use super::*;

    pub type hv_vm_config_t = *mut c_void;
    pub type hv_vcpu_config_t = *mut c_void;

    #[link(name = "Hypervisor", kind = "framework")]
    extern "C" {
        pub fn hv_vm_create(config: hv_vm_config_t) -> hv_return_t;
        pub fn hv_vm_destroy() -> hv_return_t;
        pub fn hv_vm_map(
            addr: *mut c_void,
            ipa: hv_ipa_t,
            size: usize,
            flags: hv_memory_flags_t,
        ) -> hv_return_t;
        pub fn hv_vm_unmap(ipa: hv_ipa_t, size: usize) -> hv_return_t;

        pub fn hv_vcpu_create(
            vcpu: *mut hv_vcpu_t,
            exit: *mut *const hv_vcpu_exit_t,
            config: hv_vcpu_config_t,
        ) -> hv_return_t;
        pub fn hv_vcpu_destroy(vcpu: hv_vcpu_t) -> hv_return_t;
        pub fn hv_vcpu_run(vcpu: hv_vcpu_t) -> hv_return_t;
        pub fn hv_vcpus_exit(vcpus: *const hv_vcpu_t, vcpu_count: u32) -> hv_return_t;

        pub fn hv_vcpu_get_reg(vcpu: hv_vcpu_t, reg: hv_reg_t, value: *mut u64) -> hv_return_t;
        pub fn hv_vcpu_set_reg(vcpu: hv_vcpu_t, reg: hv_reg_t, value: u64) -> hv_return_t;
        pub fn hv_vcpu_get_sys_reg(
            vcpu: hv_vcpu_t,
            reg: hv_sys_reg_t,
            value: *mut u64,
        ) -> hv_return_t;
        pub fn hv_vcpu_set_sys_reg(vcpu: hv_vcpu_t, reg: hv_sys_reg_t, value: u64) -> hv_return_t;
        pub fn hv_vcpu_get_simd_fp_reg(
            vcpu: hv_vcpu_t,
            reg: hv_simd_fp_reg_t,
            value: *mut hv_simd_fp_uchar16_t,
        ) -> hv_return_t;
        pub fn hv_vcpu_set_simd_fp_reg(
            vcpu: hv_vcpu_t,
            reg: hv_simd_fp_reg_t,
            value: uint8x16_t,
        ) -> hv_return_t;

        pub fn hv_vcpu_set_pending_interrupt(
            vcpu: hv_vcpu_t,
            int_type: hv_interrupt_type_t,
            pending: bool,
        ) -> hv_return_t;
        pub fn hv_vcpu_set_vtimer_mask(vcpu: hv_vcpu_t, vtimer_is_masked: bool) -> hv_return_t;
        pub fn hv_vcpu_get_vtimer_offset(vcpu: hv_vcpu_t, vtimer_offset: *mut u64) -> hv_return_t;
        pub fn hv_vcpu_set_vtimer_offset(vcpu: hv_vcpu_t, vtimer_offset: u64) -> hv_return_t;
        pub fn hv_vcpu_set_trap_debug_exceptions(vcpu: hv_vcpu_t, value: bool) -> hv_return_t;
    }
}
