// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Syndrome decoding and exception injection.

use enumn::N;

use crate::cpu_state::CpuState;
use crate::cpu_state::Pstate;
use crate::cpu_state::PSTATE_EL1H_DAIF_MASKED;
use crate::regs::SysRegId;
use crate::regs::ELR_EL1;
use crate::regs::ESR_EL1;
use crate::regs::SPSR_EL1;
use crate::regs::VBAR_EL1;

pub const ESR_EC_SHIFT: u32 = 26;
pub const ESR_EC_MASK: u64 = 0x3f << ESR_EC_SHIFT;
/// Instruction length bit: set for a trapped 32-bit instruction.
pub const ESR_IL: u64 = 1 << 25;

const WFX_IS_WFE: u64 = 1 << 0;

const DABT_ISV: u64 = 1 << 24;
const DABT_SAS_SHIFT: u32 = 22;
const DABT_SSE: u64 = 1 << 21;
const DABT_SRT_SHIFT: u32 = 16;
const DABT_SF: u64 = 1 << 15;
const DABT_WNR: u64 = 1 << 6;

const SYSREG_IS_READ: u64 = 1 << 0;
const SYSREG_RT_SHIFT: u32 = 5;

/// Exception classes the run loop knows how to handle.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
pub enum ExceptionClass {
    Wfx = 0x01,
    Hvc64 = 0x16,
    Smc64 = 0x17,
    SysRegTrap = 0x18,
    DataAbortLower = 0x24,
    DataAbortSame = 0x25,
    SoftwareStepLower = 0x32,
    SoftwareStepSame = 0x33,
    Brk64 = 0x3c,
}

/// Returns the raw exception class of `syndrome`.
pub fn syndrome_class(syndrome: u64) -> u8 {
    ((syndrome & ESR_EC_MASK) >> ESR_EC_SHIFT) as u8
}

impl ExceptionClass {
    pub fn from_syndrome(syndrome: u64) -> Option<ExceptionClass> {
        ExceptionClass::n(syndrome_class(syndrome))
    }
}

/// True if a WFx syndrome describes WFE rather than WFI.
pub fn wfx_is_wfe(syndrome: u64) -> bool {
    syndrome & WFX_IS_WFE != 0
}

/// Decoded instruction syndrome of a data abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataAbort {
    /// Access size in bytes: 1, 2, 4 or 8.
    pub len: usize,
    pub write: bool,
    pub reg: u8,
    pub sign_extend: bool,
    /// The transfer register is 64 bits wide.
    pub sixty_four: bool,
}

impl DataAbort {
    /// Returns `None` if the syndrome carries no valid instruction syndrome.
    pub fn decode(syndrome: u64) -> Option<DataAbort> {
        if syndrome & DABT_ISV == 0 {
            return None;
        }
        Some(DataAbort {
            len: 1 << ((syndrome >> DABT_SAS_SHIFT) & 0x3),
            write: syndrome & DABT_WNR != 0,
            reg: ((syndrome >> DABT_SRT_SHIFT) & 0x1f) as u8,
            sign_extend: syndrome & DABT_SSE != 0,
            sixty_four: syndrome & DABT_SF != 0,
        })
    }

    /// Widens a loaded value to the destination register the way the load instruction would.
    pub fn extend_load(&self, raw: u64) -> u64 {
        let bits = self.len as u32 * 8;
        let mut value = raw;
        if bits < 64 {
            value &= (1u64 << bits) - 1;
            if self.sign_extend {
                let shift = 64 - bits;
                value = (((value << shift) as i64) >> shift) as u64;
            }
        }
        if !self.sixty_four {
            value &= u64::from(u32::MAX);
        }
        value
    }
}

/// A trapped MRS/MSR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SysRegAccess {
    pub id: SysRegId,
    pub reg: u8,
    pub read: bool,
}

impl SysRegAccess {
    pub fn decode(syndrome: u64) -> SysRegAccess {
        SysRegAccess {
            id: SysRegId::from_syndrome(syndrome),
            reg: ((syndrome >> SYSREG_RT_SHIFT) & 0x1f) as u8,
            read: syndrome & SYSREG_IS_READ != 0,
        }
    }
}

const VECTOR_CURRENT_EL_SP0: u64 = 0x000;
const VECTOR_CURRENT_EL_SPX: u64 = 0x200;
const VECTOR_LOWER_EL_A64: u64 = 0x400;

/// Takes an undefined instruction exception to EL1 in `state`.
///
/// The syndrome reports EC 0 (unknown reason) and the preferred return address is the faulting
/// instruction itself.
pub fn inject_undef(state: &mut CpuState) {
    let from = state.pstate;
    let vbar = state.sysreg(VBAR_EL1);
    let offset = match (from.el, from.sp) {
        (0, _) => VECTOR_LOWER_EL_A64,
        (_, false) => VECTOR_CURRENT_EL_SP0,
        (_, true) => VECTOR_CURRENT_EL_SPX,
    };

    state.set_sysreg(ESR_EL1, ESR_IL);
    state.set_sysreg(ELR_EL1, state.pc);
    state.set_sysreg(SPSR_EL1, from.to_cpsr());
    state.pstate = Pstate::from_cpsr(PSTATE_EL1H_DAIF_MASKED);
    state.pc = vbar.wrapping_add(offset);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_decoding() {
        assert_eq!(
            ExceptionClass::from_syndrome(0x5a00_0000),
            Some(ExceptionClass::Hvc64)
        );
        assert_eq!(
            ExceptionClass::from_syndrome(0xf200_0000),
            Some(ExceptionClass::Brk64)
        );
        // EC 0x07 (SIMD access) is not handled.
        assert_eq!(ExceptionClass::from_syndrome(0x1e00_0000), None);
        assert_eq!(syndrome_class(0x1e00_0000), 0x07);
        assert!(wfx_is_wfe(0x0600_0001));
        assert!(!wfx_is_wfe(0x0600_0000));
    }

    #[test]
    fn data_abort_fields() {
        // str w2, [x1]: ISV, SAS=2, SRT=2, WnR.
        let syndrome = 0x9380_0000 | (2 << 16) | (1 << 6);
        let da = DataAbort::decode(syndrome).expect("ISV set");
        assert_eq!(da.len, 4);
        assert!(da.write);
        assert_eq!(da.reg, 2);
        assert!(!da.sixty_four);

        assert_eq!(DataAbort::decode(0x9200_0046), None);
    }

    #[test]
    fn load_extension() {
        let byte_signed_64 = DataAbort {
            len: 1,
            write: false,
            reg: 0,
            sign_extend: true,
            sixty_four: true,
        };
        assert_eq!(byte_signed_64.extend_load(0x80), 0xffff_ffff_ffff_ff80);

        let half_signed_32 = DataAbort {
            len: 2,
            sixty_four: false,
            ..byte_signed_64
        };
        assert_eq!(half_signed_32.extend_load(0x8001), 0xffff_8001);

        let word_unsigned = DataAbort {
            len: 4,
            sign_extend: false,
            sixty_four: false,
            ..byte_signed_64
        };
        assert_eq!(word_unsigned.extend_load(0xdead_beef_8000_0000), 0x8000_0000);
    }

    #[test]
    fn sysreg_access_decoding() {
        // msr icc_eoir1_el1, x7
        let syndrome = 0x6200_0000u64 | (3 << 20) | (1 << 17) | (12 << 10) | (7 << 5) | (12 << 1);
        let access = SysRegAccess::decode(syndrome);
        assert_eq!(access.id, crate::regs::ICC_EOIR1_EL1);
        assert_eq!(access.reg, 7);
        assert!(!access.read);
    }

    #[test]
    fn undef_from_el1h() {
        let mut state = CpuState::default();
        state.pc = 0x4000_1000;
        state.pstate = Pstate::from_cpsr(0x2000_03c5);
        state.set_sysreg(VBAR_EL1, 0x8000_0000);

        inject_undef(&mut state);

        assert_eq!(state.pc, 0x8000_0200);
        assert_eq!(state.pstate.to_cpsr(), PSTATE_EL1H_DAIF_MASKED);
        assert_eq!(state.sysreg(ELR_EL1), 0x4000_1000);
        assert_eq!(state.sysreg(SPSR_EL1), 0x2000_03c5);
        assert_eq!(state.sysreg(ESR_EL1), ESR_IL);
    }

    #[test]
    fn undef_vector_offsets() {
        let mut el0 = CpuState::default();
        el0.pstate = Pstate::from_cpsr(0);
        inject_undef(&mut el0);
        assert_eq!(el0.pc, 0x400);

        let mut el1t = CpuState::default();
        el1t.pstate = Pstate::from_cpsr(0x3c4);
        inject_undef(&mut el1t);
        assert_eq!(el1t.pc, 0x000);
    }
}
