// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Single stepping and software breakpoints for a debugger attached to the guest.

use std::collections::BTreeMap;

use log::info;

use crate::cpu_state::PSTATE_SS;
use crate::hvf::*;
use crate::transfer::HwAccess;
use crate::vcpu::GuestPhysMemory;
use crate::Error;
use crate::Result;

/// `BRK #0`.
pub const BRK_INSN: u32 = 0xd420_0000;

const MDSCR_EL1_SS: u64 = 1 << 0;

#[derive(Debug, Default)]
pub struct DebugState {
    single_step: bool,
    /// Original instruction bytes keyed by guest physical address.
    breakpoints: BTreeMap<u64, [u8; 4]>,
}

impl DebugState {
    pub fn new() -> DebugState {
        DebugState::default()
    }

    pub fn single_step(&self) -> bool {
        self.single_step
    }

    pub fn set_single_step(&mut self, enabled: bool) {
        self.single_step = enabled;
    }

    pub fn has_breakpoint(&self, addr: u64) -> bool {
        self.breakpoints.contains_key(&addr)
    }

    /// Debug exceptions must reach the host while stepping or while any breakpoint is planted.
    pub fn trap_enabled(&self) -> bool {
        self.single_step || !self.breakpoints.is_empty()
    }

    /// Replaces the instruction at `addr` with `BRK #0`, remembering the original bytes.
    /// Inserting at an address that already has a breakpoint does nothing.
    pub fn insert_breakpoint(&mut self, addr: u64, mem: &dyn GuestPhysMemory) -> Result<()> {
        if self.breakpoints.contains_key(&addr) {
            return Ok(());
        }
        let mut orig = [0u8; 4];
        mem.read_physical(addr, &mut orig)?;
        mem.write_physical(addr, &BRK_INSN.to_le_bytes())?;
        self.breakpoints.insert(addr, orig);
        info!("inserted software breakpoint at {:#x}", addr);
        Ok(())
    }

    /// Restores the instruction bytes saved by `insert_breakpoint`.
    pub fn remove_breakpoint(&mut self, addr: u64, mem: &dyn GuestPhysMemory) -> Result<()> {
        let orig = *self
            .breakpoints
            .get(&addr)
            .ok_or(Error::BreakpointNotFound(addr))?;
        mem.write_physical(addr, &orig)?;
        self.breakpoints.remove(&addr);
        info!("removed software breakpoint at {:#x}", addr);
        Ok(())
    }

    /// Programs debug trapping and the step bits into the hardware. The hardware does not keep
    /// these across register flushes, so this runs before every entry.
    pub fn apply<V: HardwareVcpu>(&self, hw: &mut HwAccess<V>) -> Result<()> {
        hw.set_trap_debug_exceptions(self.trap_enabled())?;

        let mdscr = hw.get_sys_reg(HV_SYS_REG_MDSCR_EL1)?;
        let cpsr = hw.get_reg(hv_reg_t::HV_REG_CPSR)?;
        let (mdscr, cpsr) = if self.single_step {
            (mdscr | MDSCR_EL1_SS, cpsr | PSTATE_SS)
        } else {
            (mdscr & !MDSCR_EL1_SS, cpsr & !PSTATE_SS)
        };
        hw.set_sys_reg(HV_SYS_REG_MDSCR_EL1, mdscr)?;
        hw.set_reg(hv_reg_t::HV_REG_CPSR, cpsr)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeMemory;
    use crate::fake::FakeVcpu;
    use crate::transfer::RegisterFile;

    #[test]
    fn breakpoint_patches_and_restores() {
        let mem = FakeMemory::new();
        mem.set_bytes(0x1000, &[0x1f, 0x20, 0x03, 0xd5]);
        let mut debug = DebugState::new();

        debug.insert_breakpoint(0x1000, &mem).expect("insert failed");
        assert_eq!(mem.bytes(0x1000, 4), vec![0x00, 0x00, 0x20, 0xd4]);
        assert!(debug.trap_enabled());

        // A second insert succeeds without touching memory, so the BRK is never saved as the
        // original instruction.
        debug.insert_breakpoint(0x1000, &mem).expect("repeated insert failed");
        assert_eq!(mem.writes().len(), 1);
        debug.remove_breakpoint(0x1000, &mem).expect("remove failed");
        assert_eq!(mem.bytes(0x1000, 4), vec![0x1f, 0x20, 0x03, 0xd5]);
        assert!(!debug.trap_enabled());
    }

    #[test]
    fn removing_unknown_breakpoint_fails() {
        let mem = FakeMemory::new();
        let mut debug = DebugState::new();
        assert!(matches!(
            debug.remove_breakpoint(0x2000, &mem),
            Err(Error::BreakpointNotFound(0x2000))
        ));
    }

    #[test]
    fn apply_sets_and_clears_step_bits() {
        let fake = FakeVcpu::new();
        fake.set_reg_value(hv_reg_t::HV_REG_CPSR, 0x3c5);
        let mut regs = RegisterFile::new(fake.clone());
        let mut debug = DebugState::new();

        debug.set_single_step(true);
        debug.apply(&mut regs.flush().expect("flush")).expect("apply");
        assert!(fake.trap_debug_exceptions());
        assert_eq!(fake.sys_reg(HV_SYS_REG_MDSCR_EL1) & 1, 1);
        assert_eq!(fake.reg(hv_reg_t::HV_REG_CPSR), 0x3c5 | (1 << 21));

        debug.set_single_step(false);
        debug.apply(&mut regs.flush().expect("flush")).expect("apply");
        assert!(!fake.trap_debug_exceptions());
        assert_eq!(fake.sys_reg(HV_SYS_REG_MDSCR_EL1) & 1, 0);
        assert_eq!(fake.reg(hv_reg_t::HV_REG_CPSR), 0x3c5);
    }
}
