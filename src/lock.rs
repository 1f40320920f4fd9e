// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The coarse lock serializing device model and guest memory access between vCPU threads.

use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

/// Host-wide lock held by a vCPU thread whenever it is not running guest code.
#[derive(Default)]
pub struct HostLock {
    mutex: Mutex<()>,
}

impl HostLock {
    pub fn new() -> HostLock {
        HostLock::default()
    }

    pub fn lock(&self) -> HostLockGuard {
        HostLockGuard {
            lock: self,
            guard: Some(self.acquire()),
        }
    }

    fn acquire(&self) -> MutexGuard<()> {
        // The lock protects no data of its own, so a panic elsewhere cannot leave it inconsistent.
        self.mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Proof that the calling thread holds the [`HostLock`].
pub struct HostLockGuard<'a> {
    lock: &'a HostLock,
    guard: Option<MutexGuard<'a, ()>>,
}

impl<'a> HostLockGuard<'a> {
    /// Runs `f` with the lock released and reacquires it before returning.
    pub fn unlocked<T, F: FnOnce() -> T>(&mut self, f: F) -> T {
        self.guard = None;
        let result = f();
        self.guard = Some(self.lock.acquire());
        result
    }
}
