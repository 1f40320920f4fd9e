// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Virtual timer and interrupt line synchronization, and the idle wait behind WFI.

use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::Instant;

use log::trace;

use crate::hvf::HardwareVcpu;
use crate::hvf::HV_SYS_REG_CNTV_CTL_EL0;
use crate::transfer::HwAccess;
use crate::vcpu::GuestClock;
use crate::Result;

pub const CNTV_CTL_ENABLE: u64 = 1 << 0;
pub const CNTV_CTL_IMASK: u64 = 1 << 1;
pub const CNTV_CTL_ISTATUS: u64 = 1 << 2;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// An interrupt controller input driven by this vCPU, e.g. the virtual timer PPI.
pub trait IrqLine: Send + Sync {
    fn set_level(&self, level: bool);
}

/// True when the timer described by `ctl` should be raising its interrupt.
pub fn vtimer_asserted(ctl: u64) -> bool {
    ctl & CNTV_CTL_ENABLE != 0 && ctl & CNTV_CTL_ISTATUS != 0 && ctl & CNTV_CTL_IMASK == 0
}

/// Re-evaluates the timer once the hardware has masked it after a VTIMER_ACTIVATED exit.
///
/// While `masked` is set the hardware will not report the timer again, so the line level has to
/// be recomputed from CNTV_CTL_EL0 on every entry. Once the interrupt is no longer asserted the
/// hardware mask is dropped and reporting is left to the hardware again.
pub fn sync_vtimer<V: HardwareVcpu>(
    hw: &mut HwAccess<V>,
    masked: &mut bool,
    line: &dyn IrqLine,
) -> Result<()> {
    if !*masked {
        return Ok(());
    }

    let ctl = hw.get_sys_reg(HV_SYS_REG_CNTV_CTL_EL0)?;
    let asserted = vtimer_asserted(ctl);
    line.set_level(asserted);
    if !asserted {
        trace!("vtimer deasserted, unmasking");
        hw.set_vtimer_mask(false)?;
        *masked = false;
    }
    Ok(())
}

/// How long a WFI should block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleWait {
    /// Resume the guest right away.
    None,
    /// Block until kicked or interrupted.
    Indefinite,
    /// Block until kicked, interrupted, or the timeout elapses.
    Timeout(Duration),
}

/// Computes the idle wait for a guest whose virtual counter reads `now`.
///
/// Sleeps shorter than `floor` are skipped: their scheduling cost exceeds what they save.
pub fn idle_wait_for(ctl: u64, cval: u64, now: u64, counter_hz: u64, floor: Duration) -> IdleWait {
    if ctl & CNTV_CTL_ENABLE == 0 || ctl & CNTV_CTL_IMASK != 0 {
        return IdleWait::Indefinite;
    }
    if cval <= now || counter_hz == 0 {
        return IdleWait::None;
    }

    let ticks = cval - now;
    let secs = ticks / counter_hz;
    let nanos = (u128::from(ticks - counter_hz * secs) * u128::from(NANOS_PER_SEC)
        / u128::from(counter_hz)) as u32;
    let timeout = Duration::new(secs, nanos);
    if timeout < floor {
        return IdleWait::None;
    }
    IdleWait::Timeout(timeout)
}

#[derive(Default)]
struct SignalState {
    kicked: bool,
    irq: bool,
    fiq: bool,
}

/// Interrupt lines and kick requests for one vCPU, shared with other threads.
///
/// Every change is made under the mutex and broadcast on the condvar, so a waiter that checked
/// the state before blocking cannot miss an update made after the check.
#[derive(Default)]
pub struct VcpuSignals {
    state: Mutex<SignalState>,
    cond: Condvar,
}

/// IRQ and FIQ line levels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingInterrupts {
    pub irq: bool,
    pub fiq: bool,
}

impl PendingInterrupts {
    pub fn any(&self) -> bool {
        self.irq || self.fiq
    }
}

impl VcpuSignals {
    pub fn new() -> VcpuSignals {
        VcpuSignals::default()
    }

    fn lock(&self) -> MutexGuard<SignalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn kick(&self) {
        self.lock().kicked = true;
        self.cond.notify_all();
    }

    /// Consumes a pending kick.
    pub fn take_kick(&self) -> bool {
        std::mem::replace(&mut self.lock().kicked, false)
    }

    /// Sets the IRQ line level. Returns true if the level changed.
    pub fn set_irq(&self, level: bool) -> bool {
        let changed = std::mem::replace(&mut self.lock().irq, level) != level;
        if changed {
            self.cond.notify_all();
        }
        changed
    }

    /// Sets the FIQ line level. Returns true if the level changed.
    pub fn set_fiq(&self, level: bool) -> bool {
        let changed = std::mem::replace(&mut self.lock().fiq, level) != level;
        if changed {
            self.cond.notify_all();
        }
        changed
    }

    pub fn pending(&self) -> PendingInterrupts {
        let state = self.lock();
        PendingInterrupts {
            irq: state.irq,
            fiq: state.fiq,
        }
    }

    /// Blocks until kicked, an interrupt line is raised, or `timeout` elapses. A kick that ends
    /// the wait is consumed.
    pub fn wait(&self, timeout: Option<Duration>) {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock();
        loop {
            if state.kicked || state.irq || state.fiq {
                state.kicked = false;
                return;
            }
            match deadline {
                None => {
                    state = self
                        .cond
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return;
                    }
                    state = self
                        .cond
                        .wait_timeout(state, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|e| e.into_inner().0);
                }
            }
        }
    }
}

/// [`GuestClock`] backed by the host's monotonic clock and counter.
pub struct HostClock {
    start: Instant,
    counter_hz: u64,
}

impl HostClock {
    pub fn new(counter_hz: u64) -> HostClock {
        HostClock {
            start: Instant::now(),
            counter_hz,
        }
    }

    pub fn counter_hz(&self) -> u64 {
        self.counter_hz
    }
}

impl GuestClock for HostClock {
    fn virtual_ns(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }

    #[cfg(target_arch = "aarch64")]
    fn host_ticks(&self) -> u64 {
        let ticks: u64;
        // SAFETY: Reading CNTVCT_EL0 has no side effects and is permitted at EL0.
        unsafe {
            std::arch::asm!("mrs {}, cntvct_el0", out(reg) ticks, options(nomem, nostack));
        }
        ticks
    }

    #[cfg(not(target_arch = "aarch64"))]
    fn host_ticks(&self) -> u64 {
        (self.start.elapsed().as_nanos() * u128::from(self.counter_hz)
            / u128::from(NANOS_PER_SEC)) as u64
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::fake::FakeIrqLine;
    use crate::fake::FakeVcpu;
    use crate::hvf::HV_SYS_REG_CNTV_CTL_EL0;
    use crate::transfer::RegisterFile;

    const HZ: u64 = 24_000_000;
    const FLOOR: Duration = Duration::from_millis(2);

    #[test]
    fn assertion_requires_enable_and_status_without_mask() {
        assert!(vtimer_asserted(CNTV_CTL_ENABLE | CNTV_CTL_ISTATUS));
        assert!(!vtimer_asserted(CNTV_CTL_ENABLE | CNTV_CTL_ISTATUS | CNTV_CTL_IMASK));
        assert!(!vtimer_asserted(CNTV_CTL_ISTATUS));
        assert!(!vtimer_asserted(CNTV_CTL_ENABLE));
    }

    #[test]
    fn idle_floor() {
        // 1.9ms and 2.1ms at 24MHz.
        let short = 45_600;
        let long = 50_400;
        assert_eq!(
            idle_wait_for(CNTV_CTL_ENABLE, 1000 + short, 1000, HZ, FLOOR),
            IdleWait::None
        );
        assert_eq!(
            idle_wait_for(CNTV_CTL_ENABLE, 1000 + long, 1000, HZ, FLOOR),
            IdleWait::Timeout(Duration::from_micros(2100))
        );
    }

    #[test]
    fn idle_disabled_or_masked_timer_waits_indefinitely() {
        assert_eq!(idle_wait_for(0, 0, 0, HZ, FLOOR), IdleWait::Indefinite);
        assert_eq!(
            idle_wait_for(CNTV_CTL_ENABLE | CNTV_CTL_IMASK, u64::MAX, 0, HZ, FLOOR),
            IdleWait::Indefinite
        );
    }

    #[test]
    fn idle_deadline_passed() {
        assert_eq!(idle_wait_for(CNTV_CTL_ENABLE, 10, 20, HZ, FLOOR), IdleWait::None);
        assert_eq!(
            idle_wait_for(CNTV_CTL_ENABLE, 3 * HZ + HZ / 2, 0, HZ, FLOOR),
            IdleWait::Timeout(Duration::from_millis(3500))
        );
    }

    #[test]
    fn sync_only_acts_while_masked() {
        let fake = FakeVcpu::new();
        fake.set_sys_reg_value(HV_SYS_REG_CNTV_CTL_EL0, CNTV_CTL_ENABLE | CNTV_CTL_ISTATUS);
        fake.set_vtimer_masked(true);
        let mut regs = RegisterFile::new(fake.clone());
        let line = FakeIrqLine::new();

        let mut masked = false;
        sync_vtimer(&mut regs.flush().expect("flush"), &mut masked, &line).expect("sync");
        assert_eq!(line.levels(), Vec::<bool>::new());

        masked = true;
        sync_vtimer(&mut regs.flush().expect("flush"), &mut masked, &line).expect("sync");
        assert_eq!(line.levels(), vec![true]);
        assert!(masked);
        assert!(fake.vtimer_masked());

        // The guest acknowledged the timer by masking it.
        fake.set_sys_reg_value(
            HV_SYS_REG_CNTV_CTL_EL0,
            CNTV_CTL_ENABLE | CNTV_CTL_ISTATUS | CNTV_CTL_IMASK,
        );
        sync_vtimer(&mut regs.flush().expect("flush"), &mut masked, &line).expect("sync");
        assert_eq!(line.levels(), vec![true, false]);
        assert!(!masked);
        assert!(!fake.vtimer_masked());
    }

    #[test]
    fn kick_before_wait_is_not_lost() {
        let signals = VcpuSignals::new();
        signals.kick();
        // Would block forever if the kick were lost.
        signals.wait(None);
        assert!(!signals.take_kick());
    }

    #[test]
    fn kick_wakes_waiter() {
        let signals = Arc::new(VcpuSignals::new());
        let s = signals.clone();
        let waiter = thread::spawn(move || s.wait(None));
        thread::sleep(Duration::from_millis(10));
        signals.kick();
        waiter.join().expect("waiter panicked");
    }

    #[test]
    fn interrupt_line_wakes_waiter() {
        let signals = Arc::new(VcpuSignals::new());
        let s = signals.clone();
        let waiter = thread::spawn(move || s.wait(Some(Duration::from_secs(30))));
        thread::sleep(Duration::from_millis(10));
        assert!(signals.set_fiq(true));
        assert!(!signals.set_fiq(true));
        waiter.join().expect("waiter panicked");
        assert_eq!(
            signals.pending(),
            PendingInterrupts {
                irq: false,
                fiq: true
            }
        );
    }

    #[test]
    fn wait_times_out() {
        let signals = VcpuSignals::new();
        let start = Instant::now();
        signals.wait(Some(Duration::from_millis(5)));
        assert!(start.elapsed() >= Duration::from_millis(5));
    }
}
