// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Register transfer between the hardware vCPU and [`CpuState`], with a lazy dirty flush.
//!
//! [`RegisterFile::synchronize`] hands out the host copy of the registers and marks it dirty.
//! [`RegisterFile::flush`] pushes a dirty copy back and returns an [`HwAccess`] token; the token
//! is the only way to touch individual hardware registers, so an individual access can never
//! observe or clobber state that is still waiting to be pushed.

use std::ops::Deref;
use std::ops::DerefMut;

use log::trace;

use crate::cpu_state::CpuState;
use crate::cpu_state::Pstate;
use crate::hvf::*;
use crate::regs::RegisterMap;
use crate::Error;
use crate::Result;

/// Fixed width of an A64 instruction.
pub const INSN_LEN: u64 = 4;

pub struct RegisterFile<V> {
    hw: V,
    state: CpuState,
    map: RegisterMap,
    dirty: bool,
}

impl<V: HardwareVcpu> RegisterFile<V> {
    /// Wraps `hw`. The hardware starts out as the authoritative copy.
    pub fn new(hw: V) -> RegisterFile<V> {
        RegisterFile {
            hw,
            state: CpuState::default(),
            map: RegisterMap::new(),
            dirty: false,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn map(&self) -> &RegisterMap {
        &self.map
    }

    /// Copies every mapped register from the hardware into the host state.
    pub fn pull_registers(&mut self) -> Result<()> {
        for n in 0..31u8 {
            let reg = hv_reg_t::x(n).ok_or(Error::InvalidRegister(n))?;
            self.state.xregs[usize::from(n)] = self.hw.get_reg(reg)?;
        }
        self.state.pc = self.hw.get_reg(hv_reg_t::HV_REG_PC)?;

        for (i, v) in self.state.vregs.iter_mut().enumerate() {
            *v = self.hw.get_simd_fp_reg(simd_reg(i)?)?;
        }

        let fpcr = self.hw.get_reg(hv_reg_t::HV_REG_FPCR)?;
        self.state.set_fpcr(fpcr);
        let fpsr = self.hw.get_reg(hv_reg_t::HV_REG_FPSR)?;
        self.state.set_fpsr(fpsr);
        self.state.pstate = Pstate::from_cpsr(self.hw.get_reg(hv_reg_t::HV_REG_CPSR)?);

        let mut values = Vec::with_capacity(self.map.sys_regs().len());
        for m in self.map.sys_regs() {
            values.push(self.hw.get_sys_reg(m.hv)?);
        }
        self.state.apply_sysreg_list(&self.map.sys_reg_ids(), &values);
        Ok(())
    }

    /// Copies every mapped register from the host state into the hardware.
    pub fn push_registers(&mut self) -> Result<()> {
        let values = self.state.extract_sysreg_list(&self.map.sys_reg_ids());

        for n in 0..31u8 {
            let reg = hv_reg_t::x(n).ok_or(Error::InvalidRegister(n))?;
            self.hw.set_reg(reg, self.state.xregs[usize::from(n)])?;
        }
        self.hw.set_reg(hv_reg_t::HV_REG_PC, self.state.pc)?;

        for (i, &v) in self.state.vregs.iter().enumerate() {
            self.hw.set_simd_fp_reg(simd_reg(i)?, v)?;
        }

        self.hw
            .set_reg(hv_reg_t::HV_REG_FPCR, u64::from(self.state.fpcr()))?;
        self.hw
            .set_reg(hv_reg_t::HV_REG_FPSR, u64::from(self.state.fpsr()))?;
        self.hw
            .set_reg(hv_reg_t::HV_REG_CPSR, self.state.pstate.to_cpsr())?;

        for (m, value) in self.map.sys_regs().iter().zip(values) {
            self.hw.set_sys_reg(m.hv, value)?;
        }
        Ok(())
    }

    /// Returns the host copy of the registers, pulling it from the hardware first if the hardware
    /// is authoritative. The copy is dirty afterwards and will be pushed by the next `flush`.
    pub fn synchronize(&mut self) -> Result<&mut CpuState> {
        if !self.dirty {
            self.pull_registers()?;
            self.dirty = true;
        }
        Ok(&mut self.state)
    }

    /// Pushes the host copy if it is dirty and grants access to individual hardware registers.
    pub fn flush(&mut self) -> Result<HwAccess<'_, V>> {
        if self.dirty {
            trace!("flushing dirty register state");
            self.push_registers()?;
            self.dirty = false;
        }
        Ok(HwAccess { hw: &mut self.hw })
    }
}

fn simd_reg(i: usize) -> Result<hv_simd_fp_reg_t> {
    hv_simd_fp_reg_t::n(i as u32).ok_or(Error::InvalidRegister(i as u8))
}

/// Individual access to a hardware vCPU whose registers are known to be up to date.
pub struct HwAccess<'a, V> {
    hw: &'a mut V,
}

impl<'a, V: HardwareVcpu> HwAccess<'a, V> {
    /// Reads `Xn`. Register 31 is the zero register here and always reads as 0.
    pub fn read_gpr(&self, n: u8) -> Result<u64> {
        match n {
            31 => Ok(0),
            _ => {
                let reg = hv_reg_t::x(n).ok_or(Error::InvalidRegister(n))?;
                self.hw.get_reg(reg)
            }
        }
    }

    /// Writes `Xn`. Writes to register 31 are discarded.
    pub fn write_gpr(&mut self, n: u8, value: u64) -> Result<()> {
        match n {
            31 => Ok(()),
            _ => {
                let reg = hv_reg_t::x(n).ok_or(Error::InvalidRegister(n))?;
                self.hw.set_reg(reg, value)
            }
        }
    }

    pub fn pc(&self) -> Result<u64> {
        self.hw.get_reg(hv_reg_t::HV_REG_PC)
    }

    pub fn set_pc(&mut self, pc: u64) -> Result<()> {
        self.hw.set_reg(hv_reg_t::HV_REG_PC, pc)
    }

    /// Steps over the instruction that trapped.
    pub fn advance_pc(&mut self) -> Result<()> {
        let pc = self.pc()?;
        self.set_pc(pc.wrapping_add(INSN_LEN))
    }
}

impl<'a, V> Deref for HwAccess<'a, V> {
    type Target = V;

    fn deref(&self) -> &V {
        self.hw
    }
}

impl<'a, V> DerefMut for HwAccess<'a, V> {
    fn deref_mut(&mut self) -> &mut V {
        self.hw
    }
}
