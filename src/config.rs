// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::psci::PsciConduit;

/// SMCCC_VERSION.
pub const SMCCC_VERSION: u32 = 0x8000_0000;
/// SMCCC_ARCH_FEATURES.
pub const SMCCC_ARCH_FEATURES: u32 = 0x8000_0001;

/// Counter frequency assumed when the host counter cannot be read.
pub const DEFAULT_COUNTER_FREQUENCY_HZ: u64 = 24_000_000;

fn default_platform_calls() -> BTreeMap<u32, u64> {
    let mut calls = BTreeMap::new();
    // SMCCC 1.0.
    calls.insert(SMCCC_VERSION, 0x1_0000);
    calls.insert(SMCCC_ARCH_FEATURES, u64::MAX);
    calls
}

/// Per-vCPU behaviour knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct VcpuConfig {
    /// Guest counter frequency. Defaults to the host's CNTFRQ_EL0.
    pub counter_frequency_hz: Option<u64>,
    /// WFI never sleeps for less than this many microseconds.
    pub idle_floor_us: u64,
    pub psci_conduit: PsciConduit,
    /// Non-PSCI service calls answered with a fixed x0 value instead of an undefined instruction
    /// exception.
    pub platform_calls: BTreeMap<u32, u64>,
    /// Value reported in ICC_CTLR_EL1.PRIbits.
    pub gic_priority_bits_field: u8,
    /// Hide time spent emulating exits from the guest's virtual counter.
    pub account_host_overhead: bool,
}

impl Default for VcpuConfig {
    fn default() -> Self {
        VcpuConfig {
            counter_frequency_hz: None,
            idle_floor_us: 2000,
            psci_conduit: PsciConduit::default(),
            platform_calls: default_platform_calls(),
            gic_priority_bits_field: 4,
            account_host_overhead: true,
        }
    }
}

impl VcpuConfig {
    pub fn idle_floor(&self) -> Duration {
        Duration::from_micros(self.idle_floor_us)
    }

    pub fn counter_frequency(&self, caps: &HostCaps) -> u64 {
        self.counter_frequency_hz
            .filter(|&hz| hz != 0)
            .unwrap_or(caps.counter_frequency_hz)
    }
}

/// Host properties probed once and shared by every vCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCaps {
    pub counter_frequency_hz: u64,
}

impl HostCaps {
    pub fn probe() -> HostCaps {
        HostCaps {
            counter_frequency_hz: host_counter_frequency(),
        }
    }

    pub fn with_counter_frequency(counter_frequency_hz: u64) -> HostCaps {
        HostCaps {
            counter_frequency_hz,
        }
    }
}

#[cfg(target_arch = "aarch64")]
fn host_counter_frequency() -> u64 {
    let freq: u64;
    // SAFETY: CNTFRQ_EL0 is readable at EL0 and reading it has no side effects.
    unsafe {
        std::arch::asm!("mrs {}, cntfrq_el0", out(reg) freq, options(nomem, nostack));
    }
    if freq == 0 {
        DEFAULT_COUNTER_FREQUENCY_HZ
    } else {
        freq
    }
}

#[cfg(not(target_arch = "aarch64"))]
fn host_counter_frequency() -> u64 {
    DEFAULT_COUNTER_FREQUENCY_HZ
}
