// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host-side copy of the guest's architectural register file.

use std::collections::BTreeMap;

use crate::regs::SysRegId;

/// FPSR bits the guest can observe: cumulative exception flags, QC and NZCV.
pub const FPSR_MASK: u32 = 0xf800_009f;
/// FPCR bits the guest can observe: trap enables, length/stride, rounding and mode controls.
pub const FPCR_MASK: u32 = 0x07ff_9f00;

pub const PSTATE_SP: u64 = 1 << 0;
pub const PSTATE_EL_SHIFT: u32 = 2;
pub const PSTATE_EL_MASK: u64 = 0x3 << PSTATE_EL_SHIFT;
pub const PSTATE_DAIF_SHIFT: u32 = 6;
pub const PSTATE_DAIF_MASK: u64 = 0xf << PSTATE_DAIF_SHIFT;
pub const PSTATE_SS: u64 = 1 << 21;
pub const PSTATE_NZCV_SHIFT: u32 = 28;
pub const PSTATE_NZCV_MASK: u64 = 0xf << PSTATE_NZCV_SHIFT;

/// EL1h with D, A, I and F masked. The state a core starts in and the state exceptions are
/// taken in.
pub const PSTATE_EL1H_DAIF_MASKED: u64 = 0x3c5;

/// Decoded processor state. Bits without a dedicated field are kept in `rest` so that a
/// decode/encode round trip is exact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pstate {
    pub nzcv: u8,
    pub daif: u8,
    pub ss: bool,
    pub el: u8,
    /// SPSel: true when the current EL uses its own stack pointer.
    pub sp: bool,
    pub rest: u64,
}

impl Pstate {
    pub fn from_cpsr(cpsr: u64) -> Pstate {
        Pstate {
            nzcv: ((cpsr & PSTATE_NZCV_MASK) >> PSTATE_NZCV_SHIFT) as u8,
            daif: ((cpsr & PSTATE_DAIF_MASK) >> PSTATE_DAIF_SHIFT) as u8,
            ss: cpsr & PSTATE_SS != 0,
            el: ((cpsr & PSTATE_EL_MASK) >> PSTATE_EL_SHIFT) as u8,
            sp: cpsr & PSTATE_SP != 0,
            rest: cpsr
                & !(PSTATE_NZCV_MASK | PSTATE_DAIF_MASK | PSTATE_SS | PSTATE_EL_MASK | PSTATE_SP),
        }
    }

    pub fn to_cpsr(&self) -> u64 {
        let mut cpsr = self.rest;
        cpsr |= (u64::from(self.nzcv) << PSTATE_NZCV_SHIFT) & PSTATE_NZCV_MASK;
        cpsr |= (u64::from(self.daif) << PSTATE_DAIF_SHIFT) & PSTATE_DAIF_MASK;
        cpsr |= (u64::from(self.el) << PSTATE_EL_SHIFT) & PSTATE_EL_MASK;
        if self.ss {
            cpsr |= PSTATE_SS;
        }
        if self.sp {
            cpsr |= PSTATE_SP;
        }
        cpsr
    }
}

/// The guest's register file as seen by emulation code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuState {
    pub xregs: [u64; 31],
    pub pc: u64,
    pub pstate: Pstate,
    pub vregs: [u128; 32],
    fpcr: u32,
    fpsr: u32,
    sysregs: BTreeMap<SysRegId, u64>,
}

impl Default for CpuState {
    fn default() -> Self {
        CpuState {
            xregs: [0; 31],
            pc: 0,
            pstate: Pstate::default(),
            vregs: [0; 32],
            fpcr: 0,
            fpsr: 0,
            sysregs: BTreeMap::new(),
        }
    }
}

impl CpuState {
    pub fn fpcr(&self) -> u32 {
        self.fpcr
    }

    pub fn set_fpcr(&mut self, value: u64) {
        self.fpcr = value as u32 & FPCR_MASK;
    }

    pub fn fpsr(&self) -> u32 {
        self.fpsr
    }

    pub fn set_fpsr(&mut self, value: u64) {
        self.fpsr = value as u32 & FPSR_MASK;
    }

    /// Returns the value of a system register, or 0 if it has never been written.
    pub fn sysreg(&self, id: SysRegId) -> u64 {
        self.sysregs.get(&id).copied().unwrap_or(0)
    }

    pub fn set_sysreg(&mut self, id: SysRegId, value: u64) {
        self.sysregs.insert(id, value);
    }

    /// Stores `values[i]` as the value of `ids[i]`. Extra entries in either slice are ignored.
    pub fn apply_sysreg_list(&mut self, ids: &[SysRegId], values: &[u64]) {
        for (&id, &value) in ids.iter().zip(values) {
            self.sysregs.insert(id, value);
        }
    }

    /// Returns the values of `ids`, in order.
    pub fn extract_sysreg_list(&self, ids: &[SysRegId]) -> Vec<u64> {
        ids.iter().map(|&id| self.sysreg(id)).collect()
    }
}
