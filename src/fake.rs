// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! In-memory doubles for the hardware vCPU and the services around it.
//!
//! Every double is cheap to clone and shares its state between clones, so a test can keep a copy
//! for inspection after handing one to the code under test.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use crate::hvf::*;
use crate::psci::PowerControl;
use crate::psci::PowerState;
use crate::psci::PsciReturn;
use crate::timer::IrqLine;
use crate::vcpu::GuestClock;
use crate::vcpu::GuestPhysMemory;
use crate::Error;
use crate::Result;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct FakeVcpuState {
    regs: BTreeMap<u32, u64>,
    sys_regs: BTreeMap<hv_sys_reg_t, u64>,
    simd_fp_regs: BTreeMap<u32, u128>,
    reg_writes: usize,
    pending_irq: bool,
    pending_fiq: bool,
    /// (irq, fiq) pending at each call to run().
    pending_at_run: Vec<(bool, bool)>,
    vtimer_masked: bool,
    vtimer_offset: u64,
    trap_debug_exceptions: bool,
    exits: VecDeque<ExitRecord>,
    runs: usize,
}

#[derive(Default)]
struct FakeExitRequester {
    requested: Mutex<bool>,
}

impl VcpuExitRequester for FakeExitRequester {
    fn request_exit(&self) -> Result<()> {
        *lock(&self.requested) = true;
        Ok(())
    }
}

/// A scripted [`HardwareVcpu`].
///
/// `run` reports `Canceled` if an exit was requested since the previous run, and otherwise
/// returns the next exit queued with `push_exit` (`Canceled` once the queue is empty). Pending
/// interrupts are consumed by `run`, as the framework does.
#[derive(Clone, Default)]
pub struct FakeVcpu {
    state: Arc<Mutex<FakeVcpuState>>,
    requester: Arc<FakeExitRequester>,
    guest_code: Arc<Mutex<Option<Box<dyn FnMut() + Send>>>>,
}

impl FakeVcpu {
    pub fn new() -> FakeVcpu {
        FakeVcpu::default()
    }

    fn state(&self) -> MutexGuard<FakeVcpuState> {
        lock(&self.state)
    }

    pub fn push_exit(&self, exit: ExitRecord) {
        self.state().exits.push_back(exit);
    }

    /// Sets a register without counting it as a write by the code under test.
    pub fn set_reg_value(&self, reg: hv_reg_t, value: u64) {
        self.state().regs.insert(reg as u32, value);
    }

    pub fn reg(&self, reg: hv_reg_t) -> u64 {
        self.state().regs.get(&(reg as u32)).copied().unwrap_or(0)
    }

    pub fn set_sys_reg_value(&self, reg: hv_sys_reg_t, value: u64) {
        self.state().sys_regs.insert(reg, value);
    }

    pub fn sys_reg(&self, reg: hv_sys_reg_t) -> u64 {
        self.state().sys_regs.get(&reg).copied().unwrap_or(0)
    }

    /// Number of register, system register and SIMD register writes made through the trait.
    pub fn reg_writes(&self) -> usize {
        self.state().reg_writes
    }

    pub fn set_vtimer_masked(&self, masked: bool) {
        self.state().vtimer_masked = masked;
    }

    pub fn vtimer_masked(&self) -> bool {
        self.state().vtimer_masked
    }

    pub fn set_vtimer_offset_value(&self, offset: u64) {
        self.state().vtimer_offset = offset;
    }

    pub fn vtimer_offset(&self) -> u64 {
        self.state().vtimer_offset
    }

    pub fn trap_debug_exceptions(&self) -> bool {
        self.state().trap_debug_exceptions
    }

    pub fn pending_at_run(&self) -> Vec<(bool, bool)> {
        self.state().pending_at_run.clone()
    }

    /// Calls `f` on every `run`, in place of guest execution.
    pub fn set_guest_code<F: FnMut() + Send + 'static>(&self, f: F) {
        *lock(&self.guest_code) = Some(Box::new(f));
    }

    pub fn runs(&self) -> usize {
        self.state().runs
    }

    pub fn exit_requested(&self) -> bool {
        *lock(&self.requester.requested)
    }
}

impl HardwareVcpu for FakeVcpu {
    fn get_reg(&self, reg: hv_reg_t) -> Result<u64> {
        Ok(self.reg(reg))
    }

    fn set_reg(&mut self, reg: hv_reg_t, value: u64) -> Result<()> {
        let mut state = self.state();
        state.regs.insert(reg as u32, value);
        state.reg_writes += 1;
        Ok(())
    }

    fn get_sys_reg(&self, reg: hv_sys_reg_t) -> Result<u64> {
        Ok(self.sys_reg(reg))
    }

    fn set_sys_reg(&mut self, reg: hv_sys_reg_t, value: u64) -> Result<()> {
        let mut state = self.state();
        state.sys_regs.insert(reg, value);
        state.reg_writes += 1;
        Ok(())
    }

    fn get_simd_fp_reg(&self, reg: hv_simd_fp_reg_t) -> Result<u128> {
        Ok(self
            .state()
            .simd_fp_regs
            .get(&(reg as u32))
            .copied()
            .unwrap_or(0))
    }

    fn set_simd_fp_reg(&mut self, reg: hv_simd_fp_reg_t, value: u128) -> Result<()> {
        let mut state = self.state();
        state.simd_fp_regs.insert(reg as u32, value);
        state.reg_writes += 1;
        Ok(())
    }

    fn set_pending_interrupt(&mut self, kind: hv_interrupt_type_t, pending: bool) -> Result<()> {
        let mut state = self.state();
        match kind {
            hv_interrupt_type_t::HV_INTERRUPT_TYPE_IRQ => state.pending_irq = pending,
            hv_interrupt_type_t::HV_INTERRUPT_TYPE_FIQ => state.pending_fiq = pending,
        }
        Ok(())
    }

    fn set_vtimer_mask(&mut self, masked: bool) -> Result<()> {
        self.state().vtimer_masked = masked;
        Ok(())
    }

    fn get_vtimer_offset(&self) -> Result<u64> {
        Ok(self.state().vtimer_offset)
    }

    fn set_vtimer_offset(&mut self, offset: u64) -> Result<()> {
        self.state().vtimer_offset = offset;
        Ok(())
    }

    fn set_trap_debug_exceptions(&mut self, enable: bool) -> Result<()> {
        self.state().trap_debug_exceptions = enable;
        Ok(())
    }

    fn run(&mut self) -> Result<ExitRecord> {
        if let Some(guest_code) = lock(&self.guest_code).as_mut() {
            guest_code();
        }
        let mut state = self.state();
        state.runs += 1;
        let pending = (state.pending_irq, state.pending_fiq);
        state.pending_at_run.push(pending);
        state.pending_irq = false;
        state.pending_fiq = false;

        if std::mem::replace(&mut *lock(&self.requester.requested), false) {
            return Ok(ExitRecord::new(ExitReason::Canceled));
        }
        // The framework masks the timer when it reports it.
        if matches!(state.exits.front(), Some(e) if e.reason == ExitReason::VtimerActivated) {
            state.vtimer_masked = true;
        }
        Ok(state
            .exits
            .pop_front()
            .unwrap_or_else(|| ExitRecord::new(ExitReason::Canceled)))
    }

    fn exit_requester(&self) -> Arc<dyn VcpuExitRequester> {
        self.requester.clone()
    }
}

/// A [`GuestClock`] that only moves when told to.
#[derive(Clone, Default)]
pub struct FakeClock {
    virtual_ns: Arc<AtomicU64>,
    host_ticks: Arc<AtomicU64>,
}

impl FakeClock {
    pub fn new() -> FakeClock {
        FakeClock::default()
    }

    pub fn set_virtual_ns(&self, ns: u64) {
        self.virtual_ns.store(ns, Ordering::SeqCst);
    }

    pub fn set_host_ticks(&self, ticks: u64) {
        self.host_ticks.store(ticks, Ordering::SeqCst);
    }

    /// Moves the host counter forward by `ticks`.
    pub fn advance(&self, ticks: u64) {
        self.host_ticks.fetch_add(ticks, Ordering::SeqCst);
    }
}

impl GuestClock for FakeClock {
    fn virtual_ns(&self) -> u64 {
        self.virtual_ns.load(Ordering::SeqCst)
    }

    fn host_ticks(&self) -> u64 {
        self.host_ticks.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct FakeMemoryState {
    bytes: BTreeMap<u64, u8>,
    writes: Vec<(u64, Vec<u8>)>,
    fail_above: Option<u64>,
}

/// Sparse guest physical memory. Unwritten bytes read as zero.
#[derive(Clone, Default)]
pub struct FakeMemory {
    state: Arc<Mutex<FakeMemoryState>>,
}

impl FakeMemory {
    pub fn new() -> FakeMemory {
        FakeMemory::default()
    }

    /// Sets memory contents without logging a write.
    pub fn set_bytes(&self, addr: u64, data: &[u8]) {
        let mut state = lock(&self.state);
        for (i, b) in data.iter().enumerate() {
            state.bytes.insert(addr + i as u64, *b);
        }
    }

    pub fn bytes(&self, addr: u64, len: usize) -> Vec<u8> {
        let state = lock(&self.state);
        (0..len as u64)
            .map(|i| state.bytes.get(&(addr + i)).copied().unwrap_or(0))
            .collect()
    }

    /// Writes made through [`GuestPhysMemory`], in order.
    pub fn writes(&self) -> Vec<(u64, Vec<u8>)> {
        lock(&self.state).writes.clone()
    }

    /// Makes every access at or above `addr` fail.
    pub fn fail_above(&self, addr: u64) {
        lock(&self.state).fail_above = Some(addr);
    }

    fn check(state: &FakeMemoryState, addr: u64, len: usize) -> Result<()> {
        match state.fail_above {
            Some(limit) if addr + len as u64 > limit => Err(Error::GuestMemory { addr, len }),
            _ => Ok(()),
        }
    }
}

impl GuestPhysMemory for FakeMemory {
    fn read_physical(&self, addr: u64, data: &mut [u8]) -> Result<()> {
        let state = lock(&self.state);
        FakeMemory::check(&state, addr, data.len())?;
        for (i, b) in data.iter_mut().enumerate() {
            *b = state.bytes.get(&(addr + i as u64)).copied().unwrap_or(0);
        }
        Ok(())
    }

    fn write_physical(&self, addr: u64, data: &[u8]) -> Result<()> {
        let mut state = lock(&self.state);
        FakeMemory::check(&state, addr, data.len())?;
        for (i, b) in data.iter().enumerate() {
            state.bytes.insert(addr + i as u64, *b);
        }
        state.writes.push((addr, data.to_vec()));
        Ok(())
    }
}

#[derive(Default)]
struct FakePowerState {
    cpus: BTreeMap<u64, PowerState>,
    cpu_on_calls: Vec<(u64, u64, u64)>,
    reset_requested: bool,
    shutdown_requested: bool,
}

/// Tracks processor power states by affinity. Every processor starts on.
#[derive(Clone, Default)]
pub struct FakePowerControl {
    state: Arc<Mutex<FakePowerState>>,
}

impl FakePowerControl {
    pub fn new(mpidrs: &[u64]) -> FakePowerControl {
        let power = FakePowerControl::default();
        {
            let mut state = lock(&power.state);
            for &mpidr in mpidrs {
                state.cpus.insert(mpidr, PowerState::On);
            }
        }
        power
    }

    pub fn set_state(&self, mpidr: u64, power_state: PowerState) {
        lock(&self.state).cpus.insert(mpidr, power_state);
    }

    pub fn state(&self, mpidr: u64) -> Option<PowerState> {
        lock(&self.state).cpus.get(&mpidr).copied()
    }

    pub fn cpu_on_calls(&self) -> Vec<(u64, u64, u64)> {
        lock(&self.state).cpu_on_calls.clone()
    }

    pub fn reset_requested(&self) -> bool {
        lock(&self.state).reset_requested
    }

    pub fn shutdown_requested(&self) -> bool {
        lock(&self.state).shutdown_requested
    }
}

impl PowerControl for FakePowerControl {
    fn cpu_on(&self, target: u64, entry: u64, context: u64) -> PsciReturn {
        let mut state = lock(&self.state);
        state.cpu_on_calls.push((target, entry, context));
        match state.cpus.get(&target).copied() {
            None => PsciReturn::InvalidParams,
            Some(PowerState::On) => PsciReturn::AlreadyOn,
            Some(PowerState::OnPending) => PsciReturn::OnPending,
            Some(PowerState::Off) => {
                state.cpus.insert(target, PowerState::On);
                PsciReturn::Success
            }
        }
    }

    fn cpu_off(&self, target: u64) -> PsciReturn {
        let mut state = lock(&self.state);
        match state.cpus.get_mut(&target) {
            Some(s) => {
                *s = PowerState::Off;
                PsciReturn::Success
            }
            None => PsciReturn::InvalidParams,
        }
    }

    fn power_state(&self, target: u64) -> Option<PowerState> {
        self.state(target)
    }

    fn request_system_reset(&self) {
        lock(&self.state).reset_requested = true;
    }

    fn request_system_shutdown(&self) {
        lock(&self.state).shutdown_requested = true;
    }
}

/// Records every level driven onto the line.
#[derive(Clone, Default)]
pub struct FakeIrqLine {
    levels: Arc<Mutex<Vec<bool>>>,
}

impl FakeIrqLine {
    pub fn new() -> FakeIrqLine {
        FakeIrqLine::default()
    }

    pub fn levels(&self) -> Vec<bool> {
        lock(&self.levels).clone()
    }

    pub fn level(&self) -> bool {
        lock(&self.levels).last().copied().unwrap_or(false)
    }
}

impl IrqLine for FakeIrqLine {
    fn set_level(&self, level: bool) {
        lock(&self.levels).push(level);
    }
}
