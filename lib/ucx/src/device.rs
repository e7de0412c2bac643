// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Accelerator device context tracking.
//!
//! An engine serves exactly one accelerator device. The first device address it
//! registers pins the device id and its native context; the caller must then
//! restart the progress thread so it runs with that context current.
//! [`PrimaryContextGuard`] covers the other case: touching remote device
//! memory from a thread with no context at all.

#[cfg(feature = "cuda")]
pub mod cuda;

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use thiserror::Error;

use crate::backend::MemType;

#[cfg(feature = "cuda")]
pub use cuda::CudaRuntime;

/// Raw driver context handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeContext(pub usize);

/// Where an address lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressClass {
    Host,
    Device { device: i32, context: NativeContext },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("engine is bound to device {committed}, got device {requested}")]
    DeviceMismatch { committed: u64, requested: u64 },

    #[error("address {addr:#x} is on device {actual}, caller claimed device {expected}")]
    AddressMismatch { addr: usize, expected: u64, actual: i32 },

    #[error("device {0} context differs from the one this engine captured")]
    ContextMismatch(u64),

    #[error("{call} failed: {reason}")]
    Driver { call: &'static str, reason: String },

    #[error("no accelerator runtime available")]
    Unavailable,
}

/// Accelerator driver capabilities used by the engine.
pub trait DeviceRuntime: Send + Sync + 'static {
    fn classify(&self, addr: usize) -> Result<AddressClass, DeviceError>;

    /// Make `ctx` the calling thread's current context.
    fn set_current(&self, ctx: NativeContext) -> Result<(), DeviceError>;

    /// The calling thread's current context, if any.
    fn current(&self) -> Result<Option<NativeContext>, DeviceError>;

    fn retain_primary(&self, device: i32) -> Result<NativeContext, DeviceError>;

    fn release_primary(&self, device: i32);

    fn push(&self, ctx: NativeContext) -> Result<(), DeviceError>;

    fn pop(&self) -> Result<(), DeviceError>;
}

/// Runtime for hosts without an accelerator: everything is host memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostOnly;

impl DeviceRuntime for HostOnly {
    fn classify(&self, _addr: usize) -> Result<AddressClass, DeviceError> {
        Ok(AddressClass::Host)
    }

    fn set_current(&self, _ctx: NativeContext) -> Result<(), DeviceError> {
        Ok(())
    }

    fn current(&self) -> Result<Option<NativeContext>, DeviceError> {
        Ok(None)
    }

    fn retain_primary(&self, _device: i32) -> Result<NativeContext, DeviceError> {
        Err(DeviceError::Unavailable)
    }

    fn release_primary(&self, _device: i32) {}

    fn push(&self, _ctx: NativeContext) -> Result<(), DeviceError> {
        Err(DeviceError::Unavailable)
    }

    fn pop(&self) -> Result<(), DeviceError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SimulatedState {
    devices: Vec<(i32, Range<usize>)>,
    contexts: HashMap<i32, NativeContext>,
    stacks: HashMap<ThreadId, Vec<NativeContext>>,
    retained: HashMap<i32, usize>,
    set_current_calls: usize,
    pushes: usize,
    pops: usize,
}

/// In-memory device runtime: address ranges are declared to belong to a device.
///
/// Context stacks are tracked per thread, like the real driver.
#[derive(Debug, Clone, Default)]
pub struct SimulatedDevices {
    state: Arc<Mutex<SimulatedState>>,
}

impl SimulatedDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `range` as memory of `device`. Returns the device's context.
    pub fn add_range(&self, device: i32, range: Range<usize>) -> NativeContext {
        let mut state = self.state.lock();
        state.devices.push((device, range));
        *state
            .contexts
            .entry(device)
            .or_insert(NativeContext(0x1000 + device as usize))
    }

    /// Swap the context reported for `device`'s memory.
    pub fn replace_context(&self, device: i32, ctx: NativeContext) {
        self.state.lock().contexts.insert(device, ctx);
    }

    pub fn current_on_this_thread(&self) -> Option<NativeContext> {
        let state = self.state.lock();
        state
            .stacks
            .get(&thread::current().id())
            .and_then(|s| s.last().copied())
    }

    pub fn set_current_calls(&self) -> usize {
        self.state.lock().set_current_calls
    }

    pub fn pushes(&self) -> usize {
        self.state.lock().pushes
    }

    pub fn pops(&self) -> usize {
        self.state.lock().pops
    }

    /// Devices whose primary context is currently retained.
    pub fn retained_primaries(&self) -> usize {
        self.state.lock().retained.values().filter(|n| **n > 0).count()
    }
}

impl DeviceRuntime for SimulatedDevices {
    fn classify(&self, addr: usize) -> Result<AddressClass, DeviceError> {
        let state = self.state.lock();
        let device = state
            .devices
            .iter()
            .find(|(_, range)| range.contains(&addr))
            .map(|(device, _)| *device);

        let Some(device) = device else {
            return Ok(AddressClass::Host);
        };
        let context = state
            .contexts
            .get(&device)
            .copied()
            .ok_or_else(|| DeviceError::Driver {
                call: "classify",
                reason: format!("device {device} has no context"),
            })?;
        Ok(AddressClass::Device { device, context })
    }

    fn set_current(&self, ctx: NativeContext) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.set_current_calls += 1;
        let stack = state.stacks.entry(thread::current().id()).or_default();
        match stack.last_mut() {
            Some(top) => *top = ctx,
            None => stack.push(ctx),
        }
        Ok(())
    }

    fn current(&self) -> Result<Option<NativeContext>, DeviceError> {
        Ok(self.current_on_this_thread())
    }

    fn retain_primary(&self, device: i32) -> Result<NativeContext, DeviceError> {
        let mut state = self.state.lock();
        let Some(ctx) = state.contexts.get(&device).copied() else {
            return Err(DeviceError::Driver {
                call: "retain_primary",
                reason: format!("no device {device}"),
            });
        };
        *state.retained.entry(device).or_default() += 1;
        Ok(ctx)
    }

    fn release_primary(&self, device: i32) {
        let mut state = self.state.lock();
        if let Some(n) = state.retained.get_mut(&device) {
            *n = n.saturating_sub(1);
        }
    }

    fn push(&self, ctx: NativeContext) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.pushes += 1;
        state
            .stacks
            .entry(thread::current().id())
            .or_default()
            .push(ctx);
        Ok(())
    }

    fn pop(&self) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.pops += 1;
        let popped = state
            .stacks
            .get_mut(&thread::current().id())
            .and_then(|s| s.pop());
        match popped {
            Some(_) => Ok(()),
            None => Err(DeviceError::Driver {
                call: "pop",
                reason: "context stack is empty".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Committed {
    device: u64,
    context: Option<NativeContext>,
}

/// The one device and context this engine operates on.
pub struct DeviceContext {
    runtime: Arc<dyn DeviceRuntime>,
    verify_addresses: bool,
    state: Mutex<Option<Committed>>,
}

impl DeviceContext {
    /// With `verify_addresses` off, caller supplied device ids are trusted and
    /// only checked for consistency; no context is captured.
    pub fn new(runtime: Arc<dyn DeviceRuntime>, verify_addresses: bool) -> Self {
        Self {
            runtime,
            verify_addresses,
            state: Mutex::new(None),
        }
    }

    /// Account for a device memory registration at `addr` claimed to be on
    /// `expected_device`.
    ///
    /// Returns `true` when this call captured the engine's context, in which
    /// case the progress thread has to be restarted.
    pub fn update(&self, addr: usize, expected_device: u64) -> Result<bool, DeviceError> {
        let mut state = self.state.lock();

        if let Some(committed) = *state
            && committed.device != expected_device
        {
            return Err(DeviceError::DeviceMismatch {
                committed: committed.device,
                requested: expected_device,
            });
        }

        if !self.verify_addresses {
            state.get_or_insert(Committed {
                device: expected_device,
                context: None,
            });
            return Ok(false);
        }

        let (device, context) = match self.runtime.classify(addr)? {
            AddressClass::Host => return Ok(false),
            AddressClass::Device { device, context } => (device, context),
        };

        if u64::try_from(device).ok() != Some(expected_device) {
            return Err(DeviceError::AddressMismatch {
                addr,
                expected: expected_device,
                actual: device,
            });
        }

        match *state {
            Some(Committed {
                context: Some(current),
                ..
            }) if current != context => Err(DeviceError::ContextMismatch(expected_device)),
            Some(Committed {
                context: Some(_), ..
            }) => Ok(false),
            _ => {
                tracing::debug!(device, ?context, "captured device context");
                *state = Some(Committed {
                    device: expected_device,
                    context: Some(context),
                });
                Ok(true)
            }
        }
    }

    /// Make the captured context current on the calling thread.
    pub fn apply(&self) -> Result<(), DeviceError> {
        let context = self.state.lock().and_then(|c| c.context);
        match context {
            Some(ctx) => self.runtime.set_current(ctx),
            None => Ok(()),
        }
    }

    pub fn device(&self) -> Option<u64> {
        self.state.lock().map(|c| c.device)
    }
}

/// Lazily retained primary context of the default device.
pub struct PrimaryContext {
    runtime: Arc<dyn DeviceRuntime>,
    device: i32,
    retained: Mutex<Option<NativeContext>>,
}

impl PrimaryContext {
    pub const DEFAULT_DEVICE: i32 = 0;

    pub fn new(runtime: Arc<dyn DeviceRuntime>) -> Self {
        Self {
            runtime,
            device: Self::DEFAULT_DEVICE,
            retained: Mutex::new(None),
        }
    }

    /// Push the primary context, but only if the thread has no current context.
    /// Returns whether a push happened.
    pub fn push(&self) -> bool {
        match self.runtime.current() {
            Ok(None) => {}
            Ok(Some(_)) => return false,
            Err(e) => {
                tracing::debug!("failed to query current context: {e}");
                return false;
            }
        }

        let ctx = {
            let mut retained = self.retained.lock();
            match *retained {
                Some(ctx) => ctx,
                None => match self.runtime.retain_primary(self.device) {
                    Ok(ctx) => *retained.insert(ctx),
                    Err(e) => {
                        tracing::debug!(device = self.device, "primary context unavailable: {e}");
                        return false;
                    }
                },
            }
        };

        self.runtime.push(ctx).is_ok()
    }

    pub fn pop(&self) {
        if let Err(e) = self.runtime.pop() {
            tracing::warn!(device = self.device, "failed to pop primary context: {e}");
        }
    }
}

impl Drop for PrimaryContext {
    fn drop(&mut self) {
        if self.retained.get_mut().is_some() {
            self.runtime.release_primary(self.device);
        }
    }
}

/// Keeps the primary context pushed for device memory until dropped.
#[must_use]
pub struct PrimaryContextGuard<'a> {
    pushed: Option<&'a PrimaryContext>,
}

impl<'a> PrimaryContextGuard<'a> {
    pub fn enter(mem_type: MemType, primary: &'a PrimaryContext) -> Self {
        let pushed = (mem_type == MemType::Vram && primary.push()).then_some(primary);
        Self { pushed }
    }

    pub fn is_pushed(&self) -> bool {
        self.pushed.is_some()
    }
}

impl Drop for PrimaryContextGuard<'_> {
    fn drop(&mut self) {
        if let Some(primary) = self.pushed {
            primary.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const GIB: usize = 1 << 30;

    fn simulated() -> (SimulatedDevices, NativeContext, NativeContext) {
        let sim = SimulatedDevices::new();
        let ctx0 = sim.add_range(0, GIB..2 * GIB);
        let ctx1 = sim.add_range(1, 2 * GIB..3 * GIB);
        (sim, ctx0, ctx1)
    }

    #[test]
    fn test_first_device_address_requires_restart() {
        let (sim, ctx0, _) = simulated();
        let device = DeviceContext::new(Arc::new(sim.clone()), true);

        assert!(device.update(GIB + 64, 0).unwrap());
        assert!(!device.update(GIB + 4096, 0).unwrap());
        assert_eq!(device.device(), Some(0));

        device.apply().unwrap();
        assert_eq!(sim.current_on_this_thread(), Some(ctx0));
    }

    #[test]
    fn test_host_address_is_ignored() {
        let (sim, _, _) = simulated();
        let device = DeviceContext::new(Arc::new(sim.clone()), true);
        assert!(!device.update(4096, 0).unwrap());
        assert_eq!(device.device(), None);

        device.apply().unwrap();
        assert_eq!(sim.set_current_calls(), 0);
    }

    #[test]
    fn test_second_device_is_rejected() {
        let (sim, _, _) = simulated();
        let device = DeviceContext::new(Arc::new(sim), true);
        device.update(GIB, 0).unwrap();
        assert_matches!(
            device.update(2 * GIB, 1),
            Err(DeviceError::DeviceMismatch {
                committed: 0,
                requested: 1
            })
        );
    }

    #[test]
    fn test_claimed_device_must_match_address() {
        let (sim, _, _) = simulated();
        let device = DeviceContext::new(Arc::new(sim), true);
        assert_matches!(
            device.update(2 * GIB, 0),
            Err(DeviceError::AddressMismatch { actual: 1, .. })
        );
    }

    #[test]
    fn test_context_change_is_rejected() {
        let (sim, _, _) = simulated();
        let device = DeviceContext::new(Arc::new(sim.clone()), true);
        device.update(GIB, 0).unwrap();

        sim.replace_context(0, NativeContext(0xdead));
        assert_matches!(device.update(GIB + 1, 0), Err(DeviceError::ContextMismatch(0)));
    }

    #[test]
    fn test_unverified_mode_trusts_caller_ids() {
        let (sim, _, _) = simulated();
        let device = DeviceContext::new(Arc::new(sim.clone()), false);

        // claimed device disagrees with the address, but is not checked
        assert!(!device.update(2 * GIB, 0).unwrap());
        assert_matches!(device.update(GIB, 1), Err(DeviceError::DeviceMismatch { .. }));

        device.apply().unwrap();
        assert_eq!(sim.set_current_calls(), 0);
    }

    #[test]
    fn test_guard_pushes_only_without_current_context() {
        let (sim, ctx0, _) = simulated();
        let runtime: Arc<dyn DeviceRuntime> = Arc::new(sim.clone());
        let primary = PrimaryContext::new(runtime.clone());

        {
            let guard = PrimaryContextGuard::enter(MemType::Vram, &primary);
            assert!(guard.is_pushed());
            assert_eq!(sim.current_on_this_thread(), Some(ctx0));
        }
        assert_eq!(sim.current_on_this_thread(), None);
        assert_eq!((sim.pushes(), sim.pops()), (1, 1));

        runtime.set_current(NativeContext(0x42)).unwrap();
        {
            let guard = PrimaryContextGuard::enter(MemType::Vram, &primary);
            assert!(!guard.is_pushed());
        }
        assert_eq!(sim.current_on_this_thread(), Some(NativeContext(0x42)));

        let guard = PrimaryContextGuard::enter(MemType::Dram, &primary);
        assert!(!guard.is_pushed());
        drop(guard);
        assert_eq!((sim.pushes(), sim.pops()), (1, 1));
    }

    #[test]
    fn test_primary_retained_once_and_released_on_drop() {
        let (sim, _, _) = simulated();
        let primary = PrimaryContext::new(Arc::new(sim.clone()));
        for _ in 0..3 {
            let _guard = PrimaryContextGuard::enter(MemType::Vram, &primary);
        }
        assert_eq!(sim.retained_primaries(), 1);
        drop(primary);
        assert_eq!(sim.retained_primaries(), 0);
    }

    #[test]
    fn test_host_only_never_pushes() {
        let primary = PrimaryContext::new(Arc::new(HostOnly));
        let guard = PrimaryContextGuard::enter(MemType::Vram, &primary);
        assert!(!guard.is_pushed());
    }
}
