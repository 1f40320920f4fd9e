// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Execution core for AArch64 guests on Apple's Hypervisor.framework.
//!
//! A [`VcpuCore`] owns one hardware vCPU and drives it one scheduling quantum at a time: it
//! flushes dirty register state, injects pending interrupts, enters the guest, and then emulates
//! whatever trapped (MMIO, system registers, WFI/WFE, PSCI and other service calls) or reports a
//! debug stop back to the scheduler.
//!
//! The hardware is reached only through the [`hvf::HardwareVcpu`] trait, so everything except the
//! framework bindings themselves is portable and testable with the doubles in [`fake`].

pub mod config;
pub mod cpu_state;
pub mod debug;
pub mod exception;
pub mod fake;
pub mod hvf;
pub mod lock;
pub mod psci;
pub mod regs;
pub mod sysreg;
pub mod timer;
pub mod transfer;
pub mod vcpu;

use remain::sorted;
use thiserror::Error as ThisError;

pub use crate::config::HostCaps;
pub use crate::config::VcpuConfig;
pub use crate::cpu_state::CpuState;
pub use crate::exception::ExceptionClass;
pub use crate::hvf::HvError;
pub use crate::lock::HostLock;
pub use crate::lock::HostLockGuard;
pub use crate::psci::PowerControl;
pub use crate::psci::PowerState;
pub use crate::psci::PsciConduit;
pub use crate::psci::PsciReturn;
pub use crate::regs::SysRegId;
pub use crate::sysreg::CpRegDirectory;
pub use crate::timer::IrqLine;
pub use crate::vcpu::ExitStats;
pub use crate::vcpu::GuestClock;
pub use crate::vcpu::GuestPhysMemory;
pub use crate::vcpu::VcpuCore;
pub use crate::vcpu::VcpuHandle;
pub use crate::vcpu::VcpuRunStatus;

/// Guest conditions after which the emulated session cannot continue.
#[sorted]
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum FatalReason {
    /// A data abort without a valid instruction syndrome cannot be emulated.
    #[error("data abort without instruction syndrome (syndrome {syndrome:#x}, pc {pc:#x})")]
    InvalidDataAbortSyndrome { syndrome: u64, pc: u64 },
    /// The guest took an exception class this core does not handle.
    #[error("unhandled exception class {class:#x} (syndrome {syndrome:#x}, pc {pc:#x})")]
    UnhandledException { class: u8, syndrome: u64, pc: u64 },
    /// The hardware reported an exit reason outside the known set.
    #[error("unknown exit reason {0}")]
    UnknownExitReason(u32),
}

#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    /// No software breakpoint is installed at this address.
    #[error("no software breakpoint at {0:#x}")]
    BreakpointNotFound(u64),
    /// Guest execution hit a condition that cannot be emulated.
    #[error("guest execution cannot continue: {0}")]
    Fatal(FatalReason),
    /// Guest physical memory could not be accessed.
    #[error("failed to access {len} bytes of guest memory at {addr:#x}")]
    GuestMemory { addr: u64, len: usize },
    /// A Hypervisor.framework call failed.
    #[error("{call} failed: {err}")]
    Hypervisor { call: &'static str, err: HvError },
    /// A register index outside the architectural range was used.
    #[error("invalid register index {0}")]
    InvalidRegister(u8),
    /// Only one VM may exist per process.
    #[error("a Hypervisor.framework VM already exists in this process")]
    VmAlreadyExists,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the errno closest to this error, for callers that report failures as `io::Error`.
    pub fn errno(&self) -> i32 {
        match self {
            Error::BreakpointNotFound(_) => libc::ENOENT,
            Error::Fatal(_) => libc::EIO,
            Error::GuestMemory { .. } => libc::EFAULT,
            Error::Hypervisor { err, .. } => err.errno(),
            Error::InvalidRegister(_) => libc::EINVAL,
            Error::VmAlreadyExists => libc::EEXIST,
        }
    }
}

impl From<FatalReason> for Error {
    fn from(reason: FatalReason) -> Self {
        Error::Fatal(reason)
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        std::io::Error::from_raw_os_error(e.errno())
    }
}
