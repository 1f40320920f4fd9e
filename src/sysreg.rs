// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Emulation of trapped system register accesses.
//!
//! A handful of selectors are handled here (counters, OS lock, the GIC CPU interface quirks);
//! everything else is looked up in a [`CpRegDirectory`] supplied by the interrupt controller
//! model.

use std::collections::BTreeMap;

use log::trace;
use log::warn;

use crate::regs::*;
use crate::vcpu::GuestClock;

const NANOS_PER_SEC: u128 = 1_000_000_000;

const ICC_CTLR_EL1_PRIBITS_SHIFT: u32 = 8;
const ICC_CTLR_EL1_PRIBITS_MASK: u64 = 7 << ICC_CTLR_EL1_PRIBITS_SHIFT;

pub type SysRegReadFn = Box<dyn FnMut() -> u64 + Send>;
pub type SysRegWriteFn = Box<dyn FnMut(u64) + Send>;

/// How a directory entry is accessed.
pub enum CpRegAccess {
    /// Reads return the value, writes are ignored.
    Const(u64),
    /// A plain storage slot.
    Storage(u64),
    /// Callbacks, each falling back to `storage` when absent.
    Callbacks {
        read: Option<SysRegReadFn>,
        write: Option<SysRegWriteFn>,
        storage: u64,
    },
}

pub struct CpRegEntry {
    pub name: String,
    pub access: CpRegAccess,
}

impl CpRegEntry {
    fn read(&mut self) -> u64 {
        match &mut self.access {
            CpRegAccess::Const(v) | CpRegAccess::Storage(v) => *v,
            CpRegAccess::Callbacks {
                read: Some(read), ..
            } => read(),
            CpRegAccess::Callbacks { storage, .. } => *storage,
        }
    }

    fn write(&mut self, value: u64) {
        match &mut self.access {
            CpRegAccess::Const(_) => {}
            CpRegAccess::Storage(v) => *v = value,
            CpRegAccess::Callbacks {
                write: Some(write), ..
            } => write(value),
            CpRegAccess::Callbacks { storage, .. } => *storage = value,
        }
    }
}

/// Per-vCPU table of emulated system registers, keyed by selector.
#[derive(Default)]
pub struct CpRegDirectory {
    entries: BTreeMap<SysRegId, CpRegEntry>,
}

impl CpRegDirectory {
    pub fn new() -> CpRegDirectory {
        CpRegDirectory::default()
    }

    pub fn insert(&mut self, id: SysRegId, name: &str, access: CpRegAccess) {
        self.entries.insert(
            id,
            CpRegEntry {
                name: name.to_owned(),
                access,
            },
        );
    }

    pub fn insert_const(&mut self, id: SysRegId, name: &str, value: u64) {
        self.insert(id, name, CpRegAccess::Const(value));
    }

    pub fn insert_storage(&mut self, id: SysRegId, name: &str, initial: u64) {
        self.insert(id, name, CpRegAccess::Storage(initial));
    }

    pub fn insert_callbacks(
        &mut self,
        id: SysRegId,
        name: &str,
        read: Option<SysRegReadFn>,
        write: Option<SysRegWriteFn>,
    ) {
        self.insert(
            id,
            name,
            CpRegAccess::Callbacks {
                read,
                write,
                storage: 0,
            },
        );
    }

    pub fn lookup(&self, id: SysRegId) -> Option<&CpRegEntry> {
        self.entries.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reads `id`, or returns `None` if the directory has no entry for it.
    pub fn read(&mut self, id: SysRegId) -> Option<u64> {
        self.entries.get_mut(&id).map(|e| {
            let value = e.read();
            trace!("sysreg read {} = {:#x}", e.name, value);
            value
        })
    }

    /// Writes `id`. Returns false if the directory has no entry for it.
    pub fn write(&mut self, id: SysRegId, value: u64) -> bool {
        match self.entries.get_mut(&id) {
            Some(e) => {
                trace!("sysreg write {} = {:#x}", e.name, value);
                e.write(value);
                true
            }
            None => false,
        }
    }
}

/// Emulation category of a trapped selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysRegClass {
    /// CNTPCT_EL0, derived from the guest clock.
    PhysicalCounter,
    /// PMCCNTR_EL0, the guest clock in nanoseconds.
    CycleCounter,
    /// CNTP_CTL_EL0 and the OS lock registers: writes are accepted and dropped.
    DiscardedWrite,
    /// ICC_CTLR_EL1: forwarded, with PRIbits rewritten on reads.
    GicControl,
    /// ICC_EOIR0_EL1/ICC_EOIR1_EL1.
    GicEndOfInterrupt,
    /// Any other GIC CPU interface register, or the vendor timer register.
    Gic,
    /// Not special-cased; forwarded to the directory.
    Other,
}

impl SysRegClass {
    pub fn classify(id: SysRegId) -> SysRegClass {
        match id {
            CNTPCT_EL0 => SysRegClass::PhysicalCounter,
            PMCCNTR_EL0 => SysRegClass::CycleCounter,
            CNTP_CTL_EL0 | OSLAR_EL1 | OSDLR_EL1 => SysRegClass::DiscardedWrite,
            ICC_CTLR_EL1 => SysRegClass::GicControl,
            ICC_EOIR0_EL1 | ICC_EOIR1_EL1 => SysRegClass::GicEndOfInterrupt,
            VENDOR_TIMER_EL1 | ICC_PMR_EL1 | ICC_IAR0_EL1 | ICC_HPPIR0_EL1 | ICC_BPR0_EL1
            | ICC_AP0R0_EL1 | ICC_AP0R1_EL1 | ICC_AP0R2_EL1 | ICC_AP0R3_EL1 | ICC_AP1R0_EL1
            | ICC_AP1R1_EL1 | ICC_AP1R2_EL1 | ICC_AP1R3_EL1 | ICC_DIR_EL1 | ICC_RPR_EL1
            | ICC_SGI1R_EL1 | ICC_ASGI1R_EL1 | ICC_SGI0R_EL1 | ICC_IAR1_EL1 | ICC_HPPIR1_EL1
            | ICC_BPR1_EL1 | ICC_SRE_EL1 | ICC_IGRPEN0_EL1 | ICC_IGRPEN1_EL1 => SysRegClass::Gic,
            _ => SysRegClass::Other,
        }
    }
}

/// Side effect the run loop has to apply after a system register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysRegWriteEffect {
    None,
    /// The guest may have acknowledged the virtual timer interrupt: lower the timer line and
    /// let the hardware report the timer again.
    TimerEoi,
}

pub struct SysRegRouter {
    directory: CpRegDirectory,
    counter_hz: u64,
    gic_priority_bits_field: u8,
}

impl SysRegRouter {
    pub fn new(directory: CpRegDirectory, counter_hz: u64, gic_priority_bits_field: u8) -> Self {
        SysRegRouter {
            directory,
            counter_hz,
            gic_priority_bits_field,
        }
    }

    pub fn directory(&mut self) -> &mut CpRegDirectory {
        &mut self.directory
    }

    pub fn read(&mut self, id: SysRegId, clock: &dyn GuestClock) -> u64 {
        let value = match SysRegClass::classify(id) {
            SysRegClass::PhysicalCounter => {
                (u128::from(clock.virtual_ns()) * u128::from(self.counter_hz) / NANOS_PER_SEC)
                    as u64
            }
            SysRegClass::CycleCounter => clock.virtual_ns(),
            SysRegClass::GicControl => {
                let ctlr = self.forward_read(id);
                (ctlr & !ICC_CTLR_EL1_PRIBITS_MASK)
                    | ((u64::from(self.gic_priority_bits_field) << ICC_CTLR_EL1_PRIBITS_SHIFT)
                        & ICC_CTLR_EL1_PRIBITS_MASK)
            }
            SysRegClass::DiscardedWrite
            | SysRegClass::GicEndOfInterrupt
            | SysRegClass::Gic
            | SysRegClass::Other => self.forward_read(id),
        };
        trace!("sysreg read {} -> {:#x}", id, value);
        value
    }

    pub fn write(&mut self, id: SysRegId, value: u64) -> SysRegWriteEffect {
        trace!("sysreg write {} <- {:#x}", id, value);
        match SysRegClass::classify(id) {
            SysRegClass::PhysicalCounter | SysRegClass::DiscardedWrite => SysRegWriteEffect::None,
            SysRegClass::GicEndOfInterrupt => {
                self.forward_write(id, value);
                SysRegWriteEffect::TimerEoi
            }
            SysRegClass::CycleCounter
            | SysRegClass::GicControl
            | SysRegClass::Gic
            | SysRegClass::Other => {
                self.forward_write(id, value);
                SysRegWriteEffect::None
            }
        }
    }

    fn forward_read(&mut self, id: SysRegId) -> u64 {
        match self.directory.read(id) {
            Some(v) => v,
            None => {
                warn!("unhandled sysreg read {} ({:#010x})", id, id.raw());
                0
            }
        }
    }

    fn forward_write(&mut self, id: SysRegId, value: u64) {
        if !self.directory.write(id, value) {
            warn!(
                "unhandled sysreg write {} ({:#010x}) = {:#x}",
                id,
                id.raw(),
                value
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use super::*;
    use crate::exception::SysRegAccess;
    use crate::fake::FakeClock;

    /// An EC 0x18 syndrome for `mrs`/`msr` of `id` through `rt`.
    fn trap_syndrome(id: SysRegId, rt: u64, read: bool) -> u64 {
        (0x18 << 26) | (1 << 25) | u64::from(id.raw()) | (rt << 5) | u64::from(read)
    }

    fn router(directory: CpRegDirectory) -> SysRegRouter {
        SysRegRouter::new(directory, 24_000_000, 4)
    }

    #[test]
    fn physical_counter_uses_guest_clock() {
        let clock = FakeClock::new();
        clock.set_virtual_ns(2_500_000_000);
        let mut r = router(CpRegDirectory::new());
        assert_eq!(r.read(CNTPCT_EL0, &clock), 60_000_000);
        assert_eq!(r.read(PMCCNTR_EL0, &clock), 2_500_000_000);
    }

    #[test]
    fn ctlr_reports_reduced_priority_bits() {
        let mut directory = CpRegDirectory::new();
        directory.insert_storage(ICC_CTLR_EL1, "ICC_CTLR_EL1", 0x0000_0700 | 0x2);
        let mut r = router(directory);
        assert_eq!(r.read(ICC_CTLR_EL1, &FakeClock::new()), 0x0000_0400 | 0x2);
    }

    #[test]
    fn eoi_always_reports_timer_effect() {
        let mut r = router(CpRegDirectory::new());
        assert_eq!(r.write(ICC_EOIR0_EL1, 27), SysRegWriteEffect::TimerEoi);
        assert_eq!(r.write(ICC_EOIR1_EL1, 27), SysRegWriteEffect::TimerEoi);

        let written = Arc::new(AtomicU64::new(0));
        let w = written.clone();
        let mut directory = CpRegDirectory::new();
        directory.insert_callbacks(
            ICC_EOIR1_EL1,
            "ICC_EOIR1_EL1",
            None,
            Some(Box::new(move |v| w.store(v, Ordering::SeqCst))),
        );
        let mut r = router(directory);
        assert_eq!(r.write(ICC_EOIR1_EL1, 30), SysRegWriteEffect::TimerEoi);
        assert_eq!(written.load(Ordering::SeqCst), 30);
    }

    #[test]
    fn discarded_writes_do_not_reach_directory() {
        let mut directory = CpRegDirectory::new();
        directory.insert_storage(OSLAR_EL1, "OSLAR_EL1", 0);
        directory.insert_storage(CNTP_CTL_EL0, "CNTP_CTL_EL0", 0);
        let mut r = router(directory);
        assert_eq!(r.write(OSLAR_EL1, 1), SysRegWriteEffect::None);
        assert_eq!(r.write(CNTP_CTL_EL0, 1), SysRegWriteEffect::None);
        assert_eq!(r.write(CNTPCT_EL0, 1), SysRegWriteEffect::None);
        assert_eq!(r.directory().read(OSLAR_EL1), Some(0));
        assert_eq!(r.directory().read(CNTP_CTL_EL0), Some(0));
    }

    #[test]
    fn directory_miss_reads_zero() {
        let mut r = router(CpRegDirectory::new());
        let unknown = SysRegId::new(3, 0, 15, 0, 0);
        assert_eq!(SysRegClass::classify(unknown), SysRegClass::Other);
        assert_eq!(r.read(unknown, &FakeClock::new()), 0);
        assert_eq!(r.write(unknown, 5), SysRegWriteEffect::None);
    }

    #[test]
    fn directory_entry_kinds() {
        let mut directory = CpRegDirectory::new();
        directory.insert_const(ICC_SRE_EL1, "ICC_SRE_EL1", 0x7);
        directory.insert_storage(ICC_PMR_EL1, "ICC_PMR_EL1", 0);
        directory.insert_callbacks(ICC_IAR1_EL1, "ICC_IAR1_EL1", Some(Box::new(|| 1023)), None);
        assert_eq!(directory.len(), 3);

        assert!(directory.write(ICC_SRE_EL1, 0));
        assert_eq!(directory.read(ICC_SRE_EL1), Some(0x7));
        assert!(directory.write(ICC_PMR_EL1, 0xf0));
        assert_eq!(directory.read(ICC_PMR_EL1), Some(0xf0));
        assert_eq!(directory.read(ICC_IAR1_EL1), Some(1023));
        assert!(directory.write(ICC_IAR1_EL1, 9));
        assert_eq!(directory.read(ICC_IAR1_EL1), Some(1023));
        assert_eq!(
            directory.lookup(ICC_PMR_EL1).map(|e| e.name.as_str()),
            Some("ICC_PMR_EL1")
        );
        assert_eq!(SysRegClass::classify(VENDOR_TIMER_EL1), SysRegClass::Gic);
    }

    #[test]
    fn trapped_accesses_route_by_decoded_selector() {
        let clock = FakeClock::new();
        clock.set_virtual_ns(1_000_000_000);
        let mut directory = CpRegDirectory::new();
        directory.insert_storage(ICC_CTLR_EL1, "ICC_CTLR_EL1", 0x0000_0702);
        let mut r = router(directory);

        let counter = SysRegAccess::decode(trap_syndrome(CNTPCT_EL0, 4, true));
        assert_eq!(counter.id, CNTPCT_EL0);
        assert_eq!(r.read(counter.id, &clock), 24_000_000);

        let ctlr = SysRegAccess::decode(trap_syndrome(ICC_CTLR_EL1, 9, true));
        assert_eq!(ctlr.id, ICC_CTLR_EL1);
        assert_eq!(r.read(ctlr.id, &clock), 0x0000_0402);

        let eoi = SysRegAccess::decode(trap_syndrome(ICC_EOIR1_EL1, 3, false));
        assert_eq!(eoi.id, ICC_EOIR1_EL1);
        assert_eq!(r.write(eoi.id, 27), SysRegWriteEffect::TimerEoi);

        let cycles = SysRegAccess::decode(trap_syndrome(PMCCNTR_EL0, 0, true));
        assert_eq!(r.read(cycles.id, &clock), 1_000_000_000);
    }

    #[test]
    fn high_crn_selectors_survive_decoding() {
        for id in [CNTP_CTL_EL0, ICC_IAR1_EL1, ICC_SGI1R_EL1, VENDOR_TIMER_EL1] {
            assert_eq!(SysRegAccess::decode(trap_syndrome(id, 31, true)).id, id);
        }
    }
}
