// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! System register selectors and the table of registers kept in sync with the hardware vCPU.

use std::fmt;
use std::fmt::Display;

use crate::hvf::*;

/// A system register selector packed the way the sysreg trap syndrome packs it:
/// `op0 << 20 | op2 << 17 | op1 << 14 | crn << 10 | crm << 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SysRegId(u32);

/// Bits of a sysreg trap syndrome that make up the selector.
pub const SYSREG_MASK: u32 = SysRegId::new(3, 7, 15, 15, 7).raw();

impl SysRegId {
    pub const fn new(op0: u8, op1: u8, crn: u8, crm: u8, op2: u8) -> SysRegId {
        SysRegId(
            ((op0 as u32 & 0x3) << 20)
                | ((op2 as u32 & 0x7) << 17)
                | ((op1 as u32 & 0x7) << 14)
                | ((crn as u32 & 0xf) << 10)
                | ((crm as u32 & 0xf) << 1),
        )
    }

    /// Extracts the selector from an EC 0x18 syndrome, dropping Rt and the direction bit.
    pub fn from_syndrome(syndrome: u64) -> SysRegId {
        SysRegId(syndrome as u32 & SYSREG_MASK)
    }

    /// Decodes the framework's `op0:op1:crn:crm:op2` register numbering.
    pub const fn from_hv(reg: hv_sys_reg_t) -> SysRegId {
        SysRegId::new(
            ((reg >> 14) & 0x3) as u8,
            ((reg >> 11) & 0x7) as u8,
            ((reg >> 7) & 0xf) as u8,
            ((reg >> 3) & 0xf) as u8,
            (reg & 0x7) as u8,
        )
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn op0(self) -> u8 {
        ((self.0 >> 20) & 0x3) as u8
    }

    pub fn op1(self) -> u8 {
        ((self.0 >> 14) & 0x7) as u8
    }

    pub fn crn(self) -> u8 {
        ((self.0 >> 10) & 0xf) as u8
    }

    pub fn crm(self) -> u8 {
        ((self.0 >> 1) & 0xf) as u8
    }

    pub fn op2(self) -> u8 {
        ((self.0 >> 17) & 0x7) as u8
    }
}

impl Display for SysRegId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "S{}_{}_C{}_C{}_{}",
            self.op0(),
            self.op1(),
            self.crn(),
            self.crm(),
            self.op2()
        )
    }
}

pub const CNTPCT_EL0: SysRegId = SysRegId::new(3, 3, 14, 0, 1);
pub const CNTP_CTL_EL0: SysRegId = SysRegId::new(3, 3, 14, 2, 1);
pub const PMCCNTR_EL0: SysRegId = SysRegId::new(3, 3, 9, 13, 0);
pub const OSLAR_EL1: SysRegId = SysRegId::new(2, 0, 1, 0, 4);
pub const OSDLR_EL1: SysRegId = SysRegId::new(2, 0, 1, 3, 4);
/// Implementation defined timer control register touched by Apple's guest kernels.
pub const VENDOR_TIMER_EL1: SysRegId = SysRegId::new(3, 4, 15, 10, 6);

pub const SPSR_EL1: SysRegId = SysRegId::from_hv(HV_SYS_REG_SPSR_EL1);
pub const ELR_EL1: SysRegId = SysRegId::from_hv(HV_SYS_REG_ELR_EL1);
pub const ESR_EL1: SysRegId = SysRegId::from_hv(HV_SYS_REG_ESR_EL1);
pub const VBAR_EL1: SysRegId = SysRegId::from_hv(HV_SYS_REG_VBAR_EL1);
pub const MDSCR_EL1: SysRegId = SysRegId::from_hv(HV_SYS_REG_MDSCR_EL1);

pub const ICC_PMR_EL1: SysRegId = SysRegId::new(3, 0, 4, 6, 0);
pub const ICC_IAR0_EL1: SysRegId = SysRegId::new(3, 0, 12, 8, 0);
pub const ICC_EOIR0_EL1: SysRegId = SysRegId::new(3, 0, 12, 8, 1);
pub const ICC_HPPIR0_EL1: SysRegId = SysRegId::new(3, 0, 12, 8, 2);
pub const ICC_BPR0_EL1: SysRegId = SysRegId::new(3, 0, 12, 8, 3);
pub const ICC_AP0R0_EL1: SysRegId = SysRegId::new(3, 0, 12, 8, 4);
pub const ICC_AP0R1_EL1: SysRegId = SysRegId::new(3, 0, 12, 8, 5);
pub const ICC_AP0R2_EL1: SysRegId = SysRegId::new(3, 0, 12, 8, 6);
pub const ICC_AP0R3_EL1: SysRegId = SysRegId::new(3, 0, 12, 8, 7);
pub const ICC_AP1R0_EL1: SysRegId = SysRegId::new(3, 0, 12, 9, 0);
pub const ICC_AP1R1_EL1: SysRegId = SysRegId::new(3, 0, 12, 9, 1);
pub const ICC_AP1R2_EL1: SysRegId = SysRegId::new(3, 0, 12, 9, 2);
pub const ICC_AP1R3_EL1: SysRegId = SysRegId::new(3, 0, 12, 9, 3);
pub const ICC_DIR_EL1: SysRegId = SysRegId::new(3, 0, 12, 11, 1);
pub const ICC_RPR_EL1: SysRegId = SysRegId::new(3, 0, 12, 11, 3);
pub const ICC_SGI1R_EL1: SysRegId = SysRegId::new(3, 0, 12, 11, 5);
pub const ICC_ASGI1R_EL1: SysRegId = SysRegId::new(3, 0, 12, 11, 6);
pub const ICC_SGI0R_EL1: SysRegId = SysRegId::new(3, 0, 12, 11, 7);
pub const ICC_IAR1_EL1: SysRegId = SysRegId::new(3, 0, 12, 12, 0);
pub const ICC_EOIR1_EL1: SysRegId = SysRegId::new(3, 0, 12, 12, 1);
pub const ICC_HPPIR1_EL1: SysRegId = SysRegId::new(3, 0, 12, 12, 2);
pub const ICC_BPR1_EL1: SysRegId = SysRegId::new(3, 0, 12, 12, 3);
pub const ICC_CTLR_EL1: SysRegId = SysRegId::new(3, 0, 12, 12, 4);
pub const ICC_SRE_EL1: SysRegId = SysRegId::new(3, 0, 12, 12, 5);
pub const ICC_IGRPEN0_EL1: SysRegId = SysRegId::new(3, 0, 12, 12, 6);
pub const ICC_IGRPEN1_EL1: SysRegId = SysRegId::new(3, 0, 12, 12, 7);

/// System registers copied between the hardware vCPU and `CpuState` on every bulk transfer.
///
/// MIDR, MPIDR, ID_AA64PFR0, ID_AA64MMFR0 and MDCCINT are left out: they are written once when
/// the vCPU is set up and the hardware values are kept afterwards.
const SYNCED_SYS_REGS: &[hv_sys_reg_t] = &[
    HV_SYS_REG_ID_AA64PFR1_EL1,
    HV_SYS_REG_ID_AA64DFR0_EL1,
    HV_SYS_REG_ID_AA64DFR1_EL1,
    HV_SYS_REG_ID_AA64ISAR0_EL1,
    HV_SYS_REG_ID_AA64ISAR1_EL1,
    HV_SYS_REG_ID_AA64MMFR1_EL1,
    HV_SYS_REG_ID_AA64MMFR2_EL1,
    HV_SYS_REG_MDSCR_EL1,
    HV_SYS_REG_SCTLR_EL1,
    HV_SYS_REG_CPACR_EL1,
    HV_SYS_REG_TTBR0_EL1,
    HV_SYS_REG_TTBR1_EL1,
    HV_SYS_REG_TCR_EL1,
    HV_SYS_REG_APIAKEYLO_EL1,
    HV_SYS_REG_APIAKEYHI_EL1,
    HV_SYS_REG_APIBKEYLO_EL1,
    HV_SYS_REG_APIBKEYHI_EL1,
    HV_SYS_REG_APDAKEYLO_EL1,
    HV_SYS_REG_APDAKEYHI_EL1,
    HV_SYS_REG_APDBKEYLO_EL1,
    HV_SYS_REG_APDBKEYHI_EL1,
    HV_SYS_REG_APGAKEYLO_EL1,
    HV_SYS_REG_APGAKEYHI_EL1,
    HV_SYS_REG_SPSR_EL1,
    HV_SYS_REG_ELR_EL1,
    HV_SYS_REG_SP_EL0,
    HV_SYS_REG_AFSR0_EL1,
    HV_SYS_REG_AFSR1_EL1,
    HV_SYS_REG_ESR_EL1,
    HV_SYS_REG_FAR_EL1,
    HV_SYS_REG_PAR_EL1,
    HV_SYS_REG_MAIR_EL1,
    HV_SYS_REG_AMAIR_EL1,
    HV_SYS_REG_VBAR_EL1,
    HV_SYS_REG_CONTEXTIDR_EL1,
    HV_SYS_REG_TPIDR_EL1,
    HV_SYS_REG_CNTKCTL_EL1,
    HV_SYS_REG_CSSELR_EL1,
    HV_SYS_REG_TPIDR_EL0,
    HV_SYS_REG_TPIDRRO_EL0,
    HV_SYS_REG_CNTV_CTL_EL0,
    HV_SYS_REG_CNTV_CVAL_EL0,
    HV_SYS_REG_SP_EL1,
];

/// One entry of the bulk system register table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SysRegMapping {
    pub hv: hv_sys_reg_t,
    pub id: SysRegId,
}

/// The ordered register mapping table. Built once per vCPU and read-only afterwards.
#[derive(Debug, Clone)]
pub struct RegisterMap {
    sys_regs: Vec<SysRegMapping>,
}

impl RegisterMap {
    pub fn new() -> RegisterMap {
        let mut sys_regs = Vec::with_capacity(
            usize::from(HV_DEBUG_REG_PAIRS) * 4 + SYNCED_SYS_REGS.len(),
        );
        for n in 0..HV_DEBUG_REG_PAIRS {
            for hv in [
                hv_sys_reg_dbgbvr(n),
                hv_sys_reg_dbgbcr(n),
                hv_sys_reg_dbgwvr(n),
                hv_sys_reg_dbgwcr(n),
            ] {
                sys_regs.push(SysRegMapping {
                    hv,
                    id: SysRegId::from_hv(hv),
                });
            }
        }
        sys_regs.extend(SYNCED_SYS_REGS.iter().map(|&hv| SysRegMapping {
            hv,
            id: SysRegId::from_hv(hv),
        }));
        RegisterMap { sys_regs }
    }

    pub fn sys_regs(&self) -> &[SysRegMapping] {
        &self.sys_regs
    }

    /// Selectors of every synced system register, in table order.
    pub fn sys_reg_ids(&self) -> Vec<SysRegId> {
        self.sys_regs.iter().map(|m| m.id).collect()
    }
}

impl Default for RegisterMap {
    fn default() -> Self {
        RegisterMap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_matches_trap_syndrome() {
        // mrs x3, icc_iar1_el1: EC 0x18, IL, Op0 3, Op2 0, Op1 0, CRn 12, Rt 3, CRm 12, read.
        let syndrome: u64 = (0x18 << 26) | (1 << 25) | (3 << 20) | (12 << 10) | (3 << 5) | (12 << 1) | 1;
        assert_eq!(SysRegId::from_syndrome(syndrome), ICC_IAR1_EL1);
        assert_eq!(ICC_IAR1_EL1.to_string(), "S3_0_C12_C12_0");
    }

    #[test]
    fn hv_numbering_decodes_to_architectural_selectors() {
        assert_eq!(SysRegId::from_hv(HV_SYS_REG_SP_EL1), SysRegId::new(3, 4, 4, 1, 0));
        assert_eq!(SysRegId::from_hv(HV_SYS_REG_CNTV_CTL_EL0), SysRegId::new(3, 3, 14, 3, 1));
        assert_eq!(SysRegId::from_hv(HV_SYS_REG_MDSCR_EL1), SysRegId::new(2, 0, 0, 2, 2));
        assert_eq!(SysRegId::from_hv(hv_sys_reg_dbgwcr(5)), SysRegId::new(2, 0, 0, 5, 7));
    }

    #[test]
    fn register_map_has_no_duplicates() {
        let map = RegisterMap::new();
        let mut ids = map.sys_reg_ids();
        let total = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), total);
        assert_eq!(total, 64 + SYNCED_SYS_REGS.len());
    }

    #[test]
    fn field_accessors() {
        let id = SysRegId::new(3, 4, 15, 10, 6);
        assert_eq!(
            (id.op0(), id.op1(), id.crn(), id.crm(), id.op2()),
            (3, 4, 15, 10, 6)
        );
        assert_eq!(SYSREG_MASK, 0x003f_fc1e);
    }
}
