// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The vCPU run loop and exit dispatcher.

use std::sync::Arc;

use log::debug;
use log::error;
use log::info;
use log::trace;
use log::warn;
use serde::Deserialize;
use serde::Serialize;

use crate::config::HostCaps;
use crate::config::VcpuConfig;
use crate::cpu_state::CpuState;
use crate::cpu_state::Pstate;
use crate::cpu_state::PSTATE_EL1H_DAIF_MASKED;
use crate::debug::DebugState;
use crate::exception::inject_undef;
use crate::exception::syndrome_class;
use crate::exception::wfx_is_wfe;
use crate::exception::DataAbort;
use crate::exception::ExceptionClass;
use crate::exception::SysRegAccess;
use crate::hvf::*;
use crate::lock::HostLockGuard;
use crate::psci;
use crate::psci::PowerControl;
use crate::psci::PsciConduit;
use crate::psci::PsciOutcome;
use crate::sysreg::CpRegDirectory;
use crate::sysreg::SysRegRouter;
use crate::sysreg::SysRegWriteEffect;
use crate::timer::idle_wait_for;
use crate::timer::sync_vtimer;
use crate::timer::IdleWait;
use crate::timer::IrqLine;
use crate::timer::VcpuSignals;
use crate::transfer::RegisterFile;
use crate::transfer::INSN_LEN;
use crate::FatalReason;
use crate::Result;

/// Guest physical memory as seen by MMIO emulation and the debugger.
pub trait GuestPhysMemory: Send + Sync {
    fn read_physical(&self, addr: u64, data: &mut [u8]) -> Result<()>;
    fn write_physical(&self, addr: u64, data: &[u8]) -> Result<()>;
}

/// Time sources used for counter emulation and exit accounting.
pub trait GuestClock: Send + Sync {
    /// Nanoseconds of guest-visible time.
    fn virtual_ns(&self) -> u64;
    /// The host's counter, in the same units as the hardware virtual timer.
    fn host_ticks(&self) -> u64;
}

/// Result of one pass through the run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuRunStatus {
    /// Call `run_one_iteration` again.
    Continue,
    /// The vCPU is powered off.
    Halted,
    /// A software step or breakpoint completed; the debugger decides what happens next.
    DebugStop,
}

/// Per-vCPU exit counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStats {
    pub canceled: u64,
    pub vtimer_activated: u64,
    pub data_abort: u64,
    pub sysreg: u64,
    pub wfi: u64,
    pub wfe: u64,
    pub hvc: u64,
    pub smc: u64,
    pub software_step: u64,
    pub breakpoint: u64,
    /// Idle waits that actually blocked.
    pub idle_sleeps: u64,
}

/// Services a vCPU needs from the rest of the VM.
pub struct VcpuEnv {
    pub memory: Arc<dyn GuestPhysMemory>,
    pub clock: Arc<dyn GuestClock>,
    pub power: Arc<dyn PowerControl>,
    /// Input of the interrupt controller wired to the virtual timer.
    pub vtimer_line: Arc<dyn IrqLine>,
    pub directory: CpRegDirectory,
}

/// Thread-safe handle used to poke a vCPU from other threads.
#[derive(Clone)]
pub struct VcpuHandle {
    signals: Arc<VcpuSignals>,
    exit: Arc<dyn VcpuExitRequester>,
}

impl VcpuHandle {
    /// Makes the vCPU return from guest execution or from an idle wait as soon as possible.
    pub fn kick(&self) -> Result<()> {
        self.signals.kick();
        self.exit.request_exit()
    }

    pub fn set_irq(&self, level: bool) -> Result<()> {
        if self.signals.set_irq(level) {
            self.kick()?;
        }
        Ok(())
    }

    pub fn set_fiq(&self, level: bool) -> Result<()> {
        if self.signals.set_fiq(level) {
            self.kick()?;
        }
        Ok(())
    }
}

/// Executes one guest processor.
pub struct VcpuCore<V: HardwareVcpu> {
    id: usize,
    mpidr: u64,
    regs: RegisterFile<V>,
    config: VcpuConfig,
    counter_hz: u64,
    sysregs: SysRegRouter,
    signals: Arc<VcpuSignals>,
    exit_requester: Arc<dyn VcpuExitRequester>,
    memory: Arc<dyn GuestPhysMemory>,
    clock: Arc<dyn GuestClock>,
    power: Arc<dyn PowerControl>,
    vtimer_line: Arc<dyn IrqLine>,
    vtimer_masked: bool,
    debug: DebugState,
    halted: bool,
    last_exit_ticks: Option<u64>,
    stats: ExitStats,
}

impl<V: HardwareVcpu> VcpuCore<V> {
    /// Builds the core around `hw`.
    ///
    /// Hypervisor.framework binds a vCPU to the thread that created it. A `VcpuCore<HvfVcpu>`
    /// must be built and driven on that thread; moving it elsewhere makes every framework call
    /// fail. Use [`VcpuCore::handle`] to reach the vCPU from other threads.
    pub fn new(
        id: usize,
        mpidr: u64,
        hw: V,
        env: VcpuEnv,
        config: &VcpuConfig,
        caps: &HostCaps,
    ) -> VcpuCore<V> {
        let counter_hz = config.counter_frequency(caps);
        let exit_requester = hw.exit_requester();
        VcpuCore {
            id,
            mpidr,
            regs: RegisterFile::new(hw),
            config: config.clone(),
            counter_hz,
            sysregs: SysRegRouter::new(env.directory, counter_hz, config.gic_priority_bits_field),
            signals: Arc::new(VcpuSignals::new()),
            exit_requester,
            memory: env.memory,
            clock: env.clock,
            power: env.power,
            vtimer_line: env.vtimer_line,
            vtimer_masked: false,
            debug: DebugState::new(),
            halted: false,
            last_exit_ticks: None,
            stats: ExitStats::default(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn mpidr(&self) -> u64 {
        self.mpidr
    }

    pub fn handle(&self) -> VcpuHandle {
        VcpuHandle {
            signals: self.signals.clone(),
            exit: self.exit_requester.clone(),
        }
    }

    pub fn exit_stats(&self) -> &ExitStats {
        &self.stats
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn set_halted(&mut self, halted: bool) {
        self.halted = halted;
    }

    /// Returns the up to date register file. Changes are pushed before the next guest entry.
    pub fn state(&mut self) -> Result<&mut CpuState> {
        self.regs.synchronize()
    }

    pub fn directory(&mut self) -> &mut CpRegDirectory {
        self.sysregs.directory()
    }

    /// Prepares the vCPU to start at `entry` in EL1h with `context` in x0, as CPU_ON requires.
    pub fn power_on_reset(&mut self, entry: u64, context: u64) -> Result<()> {
        let state = self.regs.synchronize()?;
        state.pc = entry;
        state.xregs[0] = context;
        state.pstate = Pstate::from_cpsr(PSTATE_EL1H_DAIF_MASKED);
        self.halted = false;
        self.last_exit_ticks = None;
        info!("vcpu {} powered on at {:#x}", self.id, entry);
        Ok(())
    }

    pub fn set_single_step(&mut self, enabled: bool) {
        debug!("vcpu {} single step {}", self.id, enabled);
        self.debug.set_single_step(enabled);
    }

    pub fn insert_software_breakpoint(&mut self, addr: u64) -> Result<()> {
        self.debug.insert_breakpoint(addr, &*self.memory)
    }

    pub fn remove_software_breakpoint(&mut self, addr: u64) -> Result<()> {
        self.debug.remove_breakpoint(addr, &*self.memory)
    }

    /// Runs the guest until the next exit that needs the scheduler's attention.
    ///
    /// `lock` is released only while the guest is executing or the vCPU is idle in WFI.
    pub fn run_one_iteration(&mut self, lock: &mut HostLockGuard) -> Result<VcpuRunStatus> {
        {
            let mut hw = self.regs.flush()?;
            sync_vtimer(&mut hw, &mut self.vtimer_masked, &*self.vtimer_line)?;
            let pending = self.signals.pending();
            if pending.irq {
                hw.set_pending_interrupt(hv_interrupt_type_t::HV_INTERRUPT_TYPE_IRQ, true)?;
            }
            if pending.fiq {
                hw.set_pending_interrupt(hv_interrupt_type_t::HV_INTERRUPT_TYPE_FIQ, true)?;
            }
        }

        if self.halted {
            self.regs.synchronize()?;
            return Ok(VcpuRunStatus::Halted);
        }

        // A kick that arrived since the last exit means the scheduler wants control back.
        if self.signals.take_kick() {
            trace!("vcpu {} kicked before entry", self.id);
            return Ok(VcpuRunStatus::Continue);
        }

        let (exit, exit_ticks) = {
            let mut hw = self.regs.flush()?;
            self.debug.apply(&mut hw)?;

            if self.config.account_host_overhead {
                if let Some(last) = self.last_exit_ticks {
                    let elapsed = self.clock.host_ticks().wrapping_sub(last);
                    if elapsed != 0 {
                        let offset = hw.get_vtimer_offset()?;
                        hw.set_vtimer_offset(offset.wrapping_add(elapsed))?;
                    }
                }
            }

            let clock = &*self.clock;
            lock.unlocked(|| {
                let exit = hw.run();
                // Sampled before the host lock is reacquired.
                (exit, clock.host_ticks())
            })
        };
        let exit = exit?;
        self.last_exit_ticks = Some(exit_ticks);

        match exit.reason {
            ExitReason::Exception => self.handle_exception(&exit, lock),
            ExitReason::VtimerActivated => {
                trace!("vcpu {} vtimer activated", self.id);
                self.stats.vtimer_activated += 1;
                self.vtimer_line.set_level(true);
                self.vtimer_masked = true;
                Ok(VcpuRunStatus::Continue)
            }
            ExitReason::Canceled => {
                trace!("vcpu {} canceled", self.id);
                self.stats.canceled += 1;
                self.signals.take_kick();
                Ok(VcpuRunStatus::Continue)
            }
            ExitReason::Unknown(raw) => {
                self.regs.synchronize()?;
                error!("vcpu {}: unknown exit reason {}", self.id, raw);
                Err(FatalReason::UnknownExitReason(raw).into())
            }
        }
    }

    fn handle_exception(
        &mut self,
        exit: &ExitRecord,
        lock: &mut HostLockGuard,
    ) -> Result<VcpuRunStatus> {
        let syndrome = exit.syndrome;
        let class = ExceptionClass::from_syndrome(syndrome);
        trace!(
            "vcpu {} exception {:?} syndrome {:#x} va {:#x} pa {:#x}",
            self.id,
            class,
            syndrome,
            exit.virtual_address,
            exit.physical_address
        );

        match class {
            Some(ExceptionClass::DataAbortLower) | Some(ExceptionClass::DataAbortSame) => {
                self.stats.data_abort += 1;
                self.handle_data_abort(syndrome, exit.physical_address)?;
                self.regs.flush()?.advance_pc()?;
                Ok(VcpuRunStatus::Continue)
            }
            Some(ExceptionClass::SysRegTrap) => {
                self.stats.sysreg += 1;
                self.handle_sysreg(syndrome)?;
                self.regs.flush()?.advance_pc()?;
                Ok(VcpuRunStatus::Continue)
            }
            Some(ExceptionClass::Wfx) => {
                if wfx_is_wfe(syndrome) {
                    self.stats.wfe += 1;
                } else {
                    self.stats.wfi += 1;
                    self.idle_wait(lock)?;
                }
                self.regs.flush()?.advance_pc()?;
                Ok(VcpuRunStatus::Continue)
            }
            Some(ExceptionClass::Hvc64) => {
                self.stats.hvc += 1;
                self.handle_service_call(PsciConduit::Hvc, lock)
            }
            Some(ExceptionClass::Smc64) => {
                self.stats.smc += 1;
                self.handle_service_call(PsciConduit::Smc, lock)
            }
            Some(ExceptionClass::SoftwareStepLower) | Some(ExceptionClass::SoftwareStepSame) => {
                self.stats.software_step += 1;
                let pc = self.regs.synchronize()?.pc;
                debug!("vcpu {} software step at {:#x}", self.id, pc);
                Ok(VcpuRunStatus::DebugStop)
            }
            Some(ExceptionClass::Brk64) => {
                self.stats.breakpoint += 1;
                let pc = self.regs.synchronize()?.pc;
                debug!("vcpu {} breakpoint at {:#x}", self.id, pc);
                Ok(VcpuRunStatus::DebugStop)
            }
            None => {
                let pc = self.regs.synchronize()?.pc;
                let class = syndrome_class(syndrome);
                error!(
                    "vcpu {}: unhandled exception class {:#x} syndrome {:#x} at pc {:#x}",
                    self.id, class, syndrome, pc
                );
                Err(FatalReason::UnhandledException {
                    class,
                    syndrome,
                    pc,
                }
                .into())
            }
        }
    }

    fn handle_data_abort(&mut self, syndrome: u64, addr: u64) -> Result<()> {
        let access = match DataAbort::decode(syndrome) {
            Some(access) => access,
            None => {
                let pc = self.regs.synchronize()?.pc;
                error!(
                    "vcpu {}: data abort at {:#x} without instruction syndrome, pc {:#x}",
                    self.id, addr, pc
                );
                return Err(FatalReason::InvalidDataAbortSyndrome { syndrome, pc }.into());
            }
        };

        let mut hw = self.regs.flush()?;
        if access.write {
            let value = hw.read_gpr(access.reg)?;
            trace!("mmio write {:#x} len {} = {:#x}", addr, access.len, value);
            if let Err(e) = self
                .memory
                .write_physical(addr, &value.to_le_bytes()[..access.len])
            {
                warn!("vcpu {}: mmio write to {:#x} failed: {}", self.id, addr, e);
            }

            // There is no notification when the guest ends the timer interrupt through a memory
            // mapped interrupt controller, so re-check the timer after every MMIO write.
            self.vtimer_line.set_level(false);
            hw.set_vtimer_mask(false)?;
        } else {
            let mut data = [0u8; 8];
            if let Err(e) = self.memory.read_physical(addr, &mut data[..access.len]) {
                warn!("vcpu {}: mmio read from {:#x} failed: {}", self.id, addr, e);
                data = [0u8; 8];
            }
            let value = access.extend_load(u64::from_le_bytes(data));
            trace!("mmio read {:#x} len {} = {:#x}", addr, access.len, value);
            hw.write_gpr(access.reg, value)?;
        }
        Ok(())
    }

    fn handle_sysreg(&mut self, syndrome: u64) -> Result<()> {
        let access = SysRegAccess::decode(syndrome);
        let mut hw = self.regs.flush()?;
        if access.read {
            let value = self.sysregs.read(access.id, &*self.clock);
            hw.write_gpr(access.reg, value)?;
        } else {
            let value = hw.read_gpr(access.reg)?;
            if self.sysregs.write(access.id, value) == SysRegWriteEffect::TimerEoi {
                self.vtimer_line.set_level(false);
                hw.set_vtimer_mask(false)?;
            }
        }
        Ok(())
    }

    /// Handles HVC and SMC: PSCI first, then the configured platform calls, and finally an
    /// undefined instruction exception for anything else.
    ///
    /// A handled SMC returns past the instruction; a handled HVC leaves the PC alone.
    fn handle_service_call(
        &mut self,
        conduit: PsciConduit,
        lock: &mut HostLockGuard,
    ) -> Result<VcpuRunStatus> {
        let return_past_call = conduit == PsciConduit::Smc;
        let state = self.regs.synchronize()?;
        let args = [state.xregs[0], state.xregs[1], state.xregs[2], state.xregs[3]];

        let outcome = if conduit == self.config.psci_conduit {
            psci::dispatch(args, self.mpidr, &*self.power)
        } else {
            None
        };

        let mut suspend = false;
        match outcome {
            Some(PsciOutcome::Return(x0)) => state.xregs[0] = x0,
            Some(PsciOutcome::Suspend) => {
                state.xregs[0] = 0;
                suspend = true;
            }
            Some(PsciOutcome::PowerOff) => {
                self.halted = true;
                return Ok(VcpuRunStatus::Halted);
            }
            None => {
                let platform = u32::try_from(args[0])
                    .ok()
                    .and_then(|fid| self.config.platform_calls.get(&fid));
                match platform {
                    Some(&x0) => {
                        debug!(
                            "vcpu {} platform call {:#x} -> {:#x}",
                            self.id, args[0], x0
                        );
                        state.xregs[0] = x0;
                    }
                    None => {
                        warn!(
                            "vcpu {}: unknown {:?} call {:#x} at pc {:#x}, injecting undef",
                            self.id, conduit, args[0], state.pc
                        );
                        inject_undef(state);
                        return Ok(VcpuRunStatus::Continue);
                    }
                }
            }
        }

        if return_past_call {
            state.pc = state.pc.wrapping_add(INSN_LEN);
        }
        if suspend {
            self.idle_wait(lock)?;
        }
        Ok(VcpuRunStatus::Continue)
    }

    /// Blocks the vCPU thread, with `lock` released, until the next virtual timer deadline or
    /// until it is kicked or interrupted.
    fn idle_wait(&mut self, lock: &mut HostLockGuard) -> Result<()> {
        if self.signals.pending().any() {
            debug!("vcpu {} idle: interrupt already pending", self.id);
            return Ok(());
        }

        let wait = {
            let hw = self.regs.flush()?;
            let ctl = hw.get_sys_reg(HV_SYS_REG_CNTV_CTL_EL0)?;
            let cval = hw.get_sys_reg(HV_SYS_REG_CNTV_CVAL_EL0)?;
            let now = self
                .clock
                .host_ticks()
                .wrapping_sub(hw.get_vtimer_offset()?);
            idle_wait_for(ctl, cval, now, self.counter_hz, self.config.idle_floor())
        };

        let timeout = match wait {
            IdleWait::None => {
                debug!("vcpu {} idle: deadline too close to sleep", self.id);
                return Ok(());
            }
            IdleWait::Indefinite => None,
            IdleWait::Timeout(timeout) => Some(timeout),
        };
        debug!("vcpu {} idle: waiting {:?}", self.id, timeout);

        self.stats.idle_sleeps += 1;
        let signals = &self.signals;
        lock.unlocked(|| signals.wait(timeout));

        // The slept interval stays guest-visible.
        self.last_exit_ticks = Some(self.clock.host_ticks());
        Ok(())
    }
}

impl<V: HardwareVcpu> Drop for VcpuCore<V> {
    fn drop(&mut self) {
        trace!("vcpu {} exit stats {:?}", self.id, self.stats);
    }
}

