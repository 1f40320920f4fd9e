// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! PSCI 1.0 call dispatch.
//!
//! Only the call decoding and return values live here. Processor lifecycle is owned by the
//! scheduler and reached through [`PowerControl`].

use enumn::N;
use log::debug;
use log::info;
use serde::Deserialize;
use serde::Serialize;

pub const PSCI_VERSION_1_0: u64 = 0x0001_0000;
/// MIGRATE_INFO_TYPE: no trusted OS, migration not required.
pub const PSCI_TOS_MIGRATION_NOT_REQUIRED: u64 = 2;

const PSCI_FN_64BIT: u32 = 0x4000_0000;
const CPU_SUSPEND_POWER_STATE_RESERVED: u64 = 0xfffe_0000;

/// Instruction a guest uses to make PSCI calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PsciConduit {
    Hvc,
    Smc,
}

impl Default for PsciConduit {
    fn default() -> Self {
        PsciConduit::Hvc
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
pub enum PsciFunction {
    Version = 0x8400_0000,
    CpuSuspend32 = 0x8400_0001,
    CpuSuspend64 = 0xc400_0001,
    CpuOff = 0x8400_0002,
    CpuOn32 = 0x8400_0003,
    CpuOn64 = 0xc400_0003,
    AffinityInfo32 = 0x8400_0004,
    AffinityInfo64 = 0xc400_0004,
    Migrate32 = 0x8400_0005,
    Migrate64 = 0xc400_0005,
    MigrateInfoType = 0x8400_0006,
    MigrateInfoUpCpu32 = 0x8400_0007,
    MigrateInfoUpCpu64 = 0xc400_0007,
    SystemOff = 0x8400_0008,
    SystemReset = 0x8400_0009,
    Features = 0x8400_000a,
}

impl PsciFunction {
    /// Decodes the function id in x0. Ids with any of bits 63:32 set are not PSCI calls.
    pub fn from_x0(x0: u64) -> Option<PsciFunction> {
        u32::try_from(x0).ok().and_then(PsciFunction::n)
    }

    pub fn is_64bit(self) -> bool {
        self as u32 & PSCI_FN_64BIT != 0
    }

    /// Whether PSCI_FEATURES reports the function as implemented.
    pub fn is_supported(self) -> bool {
        !matches!(
            self,
            PsciFunction::Migrate32
                | PsciFunction::Migrate64
                | PsciFunction::MigrateInfoUpCpu32
                | PsciFunction::MigrateInfoUpCpu64
        )
    }
}

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsciReturn {
    Success = 0,
    NotSupported = -1,
    InvalidParams = -2,
    Denied = -3,
    AlreadyOn = -4,
    OnPending = -5,
    InternalFailure = -6,
    NotPresent = -7,
    Disabled = -8,
}

impl PsciReturn {
    /// The value placed in x0: the return code sign-extended to 64 bits.
    pub fn to_x0(self) -> u64 {
        self as i32 as i64 as u64
    }
}

/// Power state of a processor as reported by AFFINITY_INFO.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    On = 0,
    Off = 1,
    OnPending = 2,
}

/// Processor lifecycle services provided by the scheduler.
pub trait PowerControl: Send + Sync {
    /// Starts the processor with affinity `target` at `entry` with `context` in x0.
    fn cpu_on(&self, target: u64, entry: u64, context: u64) -> PsciReturn;
    /// Marks the processor with affinity `target` as off.
    fn cpu_off(&self, target: u64) -> PsciReturn;
    /// Returns `None` if no processor has affinity `target`.
    fn power_state(&self, target: u64) -> Option<PowerState>;
    fn request_system_reset(&self);
    fn request_system_shutdown(&self);
}

/// What the caller has to do after a PSCI call was dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsciOutcome {
    /// Write the value to x0 and resume the guest.
    Return(u64),
    /// Write 0 to x0 and idle as if the guest had executed WFI.
    Suspend,
    /// The calling processor is now off and must not run guest code again until restarted.
    PowerOff,
}

/// Dispatches the PSCI call described by `x0`-`x3` made by the processor with affinity `caller`.
///
/// Returns `None` if `x0` is not a PSCI function id.
pub fn dispatch(args: [u64; 4], caller: u64, power: &dyn PowerControl) -> Option<PsciOutcome> {
    let function = PsciFunction::from_x0(args[0])?;
    let [_, mut x1, mut x2, mut x3] = args;
    if !function.is_64bit() {
        x1 &= u64::from(u32::MAX);
        x2 &= u64::from(u32::MAX);
        x3 &= u64::from(u32::MAX);
    }
    debug!(
        "psci {:?} ({:#x}, {:#x}, {:#x}) from {:#x}",
        function, x1, x2, x3, caller
    );

    let outcome = match function {
        PsciFunction::Version => PsciOutcome::Return(PSCI_VERSION_1_0),
        PsciFunction::MigrateInfoType => PsciOutcome::Return(PSCI_TOS_MIGRATION_NOT_REQUIRED),
        PsciFunction::AffinityInfo32 | PsciFunction::AffinityInfo64 => {
            // Only affinity level 0 is tracked; every higher level is always on.
            if x2 == 0 {
                match power.power_state(x1) {
                    Some(state) => PsciOutcome::Return(state as u64),
                    None => PsciOutcome::Return(PsciReturn::InvalidParams.to_x0()),
                }
            } else {
                PsciOutcome::Return(PsciReturn::Success.to_x0())
            }
        }
        PsciFunction::SystemReset => {
            info!("vcpu {:#x} requested system reset", caller);
            power.request_system_reset();
            power.cpu_off(caller);
            PsciOutcome::PowerOff
        }
        PsciFunction::SystemOff => {
            info!("vcpu {:#x} requested system shutdown", caller);
            power.request_system_shutdown();
            power.cpu_off(caller);
            PsciOutcome::PowerOff
        }
        PsciFunction::CpuOn32 | PsciFunction::CpuOn64 => {
            info!("vcpu {:#x} powering on {:#x} at {:#x}", caller, x1, x2);
            PsciOutcome::Return(power.cpu_on(x1, x2, x3).to_x0())
        }
        PsciFunction::CpuOff => {
            info!("vcpu {:#x} powering off", caller);
            power.cpu_off(caller);
            PsciOutcome::PowerOff
        }
        PsciFunction::CpuSuspend32 | PsciFunction::CpuSuspend64 => {
            if x1 & CPU_SUSPEND_POWER_STATE_RESERVED != 0 {
                PsciOutcome::Return(PsciReturn::InvalidParams.to_x0())
            } else {
                PsciOutcome::Suspend
            }
        }
        PsciFunction::Features => {
            let supported = u32::try_from(x1)
                .ok()
                .and_then(PsciFunction::n)
                .map_or(false, PsciFunction::is_supported);
            if supported {
                PsciOutcome::Return(PsciReturn::Success.to_x0())
            } else {
                PsciOutcome::Return(PsciReturn::NotSupported.to_x0())
            }
        }
        PsciFunction::Migrate32
        | PsciFunction::Migrate64
        | PsciFunction::MigrateInfoUpCpu32
        | PsciFunction::MigrateInfoUpCpu64 => {
            PsciOutcome::Return(PsciReturn::NotSupported.to_x0())
        }
    };
    Some(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakePowerControl;

    fn call(args: [u64; 4], power: &FakePowerControl) -> Option<PsciOutcome> {
        dispatch(args, 0, power)
    }

    #[test]
    fn version_and_migrate_info() {
        let power = FakePowerControl::new(&[0]);
        assert_eq!(
            call([0x8400_0000, 0, 0, 0], &power),
            Some(PsciOutcome::Return(0x1_0000))
        );
        assert_eq!(
            call([0x8400_0006, 0, 0, 0], &power),
            Some(PsciOutcome::Return(2))
        );
        assert_eq!(
            call([0xc400_0005, 1, 0, 0], &power),
            Some(PsciOutcome::Return(u64::MAX))
        );
    }

    #[test]
    fn not_psci() {
        let power = FakePowerControl::new(&[0]);
        assert_eq!(call([0x8000_0000, 0, 0, 0], &power), None);
        assert_eq!(call([0x1_8400_0000, 0, 0, 0], &power), None);
    }

    #[test]
    fn affinity_info() {
        let power = FakePowerControl::new(&[0, 1]);
        power.set_state(1, PowerState::Off);
        assert_eq!(
            call([0xc400_0004, 1, 0, 0], &power),
            Some(PsciOutcome::Return(1))
        );
        assert_eq!(
            call([0xc400_0004, 0, 0, 0], &power),
            Some(PsciOutcome::Return(0))
        );
        // Unknown processor at level 0.
        assert_eq!(
            call([0xc400_0004, 0x100, 0, 0], &power),
            Some(PsciOutcome::Return(PsciReturn::InvalidParams.to_x0()))
        );
        // Any higher level is always on, even for unknown affinities.
        assert_eq!(
            call([0xc400_0004, 0x100, 1, 0], &power),
            Some(PsciOutcome::Return(0))
        );
    }

    #[test]
    fn cpu_on_truncates_32bit_arguments() {
        let power = FakePowerControl::new(&[0, 1]);
        power.set_state(1, PowerState::Off);
        assert_eq!(
            call([0x8400_0003, 0xffff_ffff_0000_0001, 0xdead_0000_8000_0000, 0x5], &power),
            Some(PsciOutcome::Return(0))
        );
        assert_eq!(power.cpu_on_calls(), vec![(1, 0x8000_0000, 5)]);
        assert_eq!(power.state(1), Some(PowerState::On));

        assert_eq!(
            call([0xc400_0003, 1, 0x8000_0000, 0], &power),
            Some(PsciOutcome::Return(PsciReturn::AlreadyOn.to_x0()))
        );
    }

    #[test]
    fn cpu_off_and_system_calls_power_off_caller() {
        let power = FakePowerControl::new(&[0]);
        assert_eq!(call([0x8400_0002, 0, 0, 0], &power), Some(PsciOutcome::PowerOff));
        assert_eq!(power.state(0), Some(PowerState::Off));

        let power = FakePowerControl::new(&[0]);
        assert_eq!(call([0x8400_0009, 0, 0, 0], &power), Some(PsciOutcome::PowerOff));
        assert!(power.reset_requested());
        assert_eq!(power.state(0), Some(PowerState::Off));

        let power = FakePowerControl::new(&[0]);
        assert_eq!(call([0x8400_0008, 0, 0, 0], &power), Some(PsciOutcome::PowerOff));
        assert!(power.shutdown_requested());
    }

    #[test]
    fn cpu_suspend() {
        let power = FakePowerControl::new(&[0]);
        assert_eq!(
            call([0xc400_0001, 0x0001_0000, 0, 0], &power),
            Some(PsciOutcome::Suspend)
        );
        assert_eq!(
            call([0xc400_0001, 0x0002_0000, 0, 0], &power),
            Some(PsciOutcome::Return(PsciReturn::InvalidParams.to_x0()))
        );
    }

    #[test]
    fn features() {
        let power = FakePowerControl::new(&[0]);
        assert_eq!(
            call([0x8400_000a, 0xc400_0003, 0, 0], &power),
            Some(PsciOutcome::Return(0))
        );
        assert_eq!(
            call([0x8400_000a, 0x8400_0005, 0, 0], &power),
            Some(PsciOutcome::Return(PsciReturn::NotSupported.to_x0()))
        );
        assert_eq!(
            call([0x8400_000a, 0x8400_00ff, 0, 0], &power),
            Some(PsciOutcome::Return(PsciReturn::NotSupported.to_x0()))
        );
    }

    #[test]
    fn return_codes_are_sign_extended() {
        assert_eq!(PsciReturn::InvalidParams.to_x0(), 0xffff_ffff_ffff_fffe);
        assert_eq!(PsciReturn::Disabled.to_x0(), (-8i64) as u64);
    }
}
