// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! CUDA driver backed [`DeviceRuntime`].

use std::ffi::c_void;
use std::ptr;

use cudarc::driver::sys::{self, CUcontext, CUdevice, CUmemorytype, CUpointer_attribute, CUresult};

use super::{AddressClass, DeviceError, DeviceRuntime, NativeContext};

fn check(call: &'static str, result: CUresult) -> Result<(), DeviceError> {
    if result == CUresult::CUDA_SUCCESS {
        Ok(())
    } else {
        Err(DeviceError::Driver {
            call,
            reason: format!("{result:?}"),
        })
    }
}

/// Device runtime talking to the CUDA driver API.
#[derive(Debug)]
pub struct CudaRuntime {
    _priv: (),
}

impl CudaRuntime {
    pub fn new() -> Result<Self, DeviceError> {
        cudarc::driver::result::init().map_err(|e| DeviceError::Driver {
            call: "cuInit",
            reason: e.to_string(),
        })?;
        Ok(Self { _priv: () })
    }

    fn device(ordinal: i32) -> Result<CUdevice, DeviceError> {
        let mut device: CUdevice = 0;
        // SAFETY: `device` is a valid out pointer for the duration of the call.
        check("cuDeviceGet", unsafe { sys::cuDeviceGet(&mut device, ordinal) })?;
        Ok(device)
    }
}

impl DeviceRuntime for CudaRuntime {
    fn classify(&self, addr: usize) -> Result<AddressClass, DeviceError> {
        let mut mem_type: u32 = 0;
        let mut is_managed: u32 = 0;
        let mut device: i32 = 0;
        let mut context: CUcontext = ptr::null_mut();

        let mut attrs = [
            CUpointer_attribute::CU_POINTER_ATTRIBUTE_MEMORY_TYPE,
            CUpointer_attribute::CU_POINTER_ATTRIBUTE_IS_MANAGED,
            CUpointer_attribute::CU_POINTER_ATTRIBUTE_DEVICE_ORDINAL,
            CUpointer_attribute::CU_POINTER_ATTRIBUTE_CONTEXT,
        ];
        let mut data: [*mut c_void; 4] = [
            &mut mem_type as *mut u32 as *mut c_void,
            &mut is_managed as *mut u32 as *mut c_void,
            &mut device as *mut i32 as *mut c_void,
            &mut context as *mut CUcontext as *mut c_void,
        ];

        // SAFETY: every entry of `data` points at a live local of the size the
        // matching attribute writes.
        let result = unsafe {
            sys::cuPointerGetAttributes(
                attrs.len() as u32,
                attrs.as_mut_ptr(),
                data.as_mut_ptr(),
                addr as sys::CUdeviceptr,
            )
        };
        check("cuPointerGetAttributes", result)?;

        if mem_type != CUmemorytype::CU_MEMORYTYPE_DEVICE as u32 {
            return Ok(AddressClass::Host);
        }
        Ok(AddressClass::Device {
            device,
            context: NativeContext(context as usize),
        })
    }

    fn set_current(&self, ctx: NativeContext) -> Result<(), DeviceError> {
        // SAFETY: `ctx` was obtained from the driver and is kept alive by its owner.
        check("cuCtxSetCurrent", unsafe {
            sys::cuCtxSetCurrent(ctx.0 as CUcontext)
        })
    }

    fn current(&self) -> Result<Option<NativeContext>, DeviceError> {
        let mut ctx: CUcontext = ptr::null_mut();
        // SAFETY: `ctx` is a valid out pointer.
        check("cuCtxGetCurrent", unsafe { sys::cuCtxGetCurrent(&mut ctx) })?;
        Ok((!ctx.is_null()).then(|| NativeContext(ctx as usize)))
    }

    fn retain_primary(&self, device: i32) -> Result<NativeContext, DeviceError> {
        let dev = Self::device(device)?;
        let mut ctx: CUcontext = ptr::null_mut();
        // SAFETY: `ctx` is a valid out pointer and `dev` a valid device handle.
        check("cuDevicePrimaryCtxRetain", unsafe {
            sys::cuDevicePrimaryCtxRetain(&mut ctx, dev)
        })?;
        Ok(NativeContext(ctx as usize))
    }

    fn release_primary(&self, device: i32) {
        let result = Self::device(device).and_then(|dev| {
            // SAFETY: only called for a device whose primary context was retained.
            check("cuDevicePrimaryCtxRelease", unsafe {
                sys::cuDevicePrimaryCtxRelease_v2(dev)
            })
        });
        if let Err(e) = result {
            tracing::debug!(device, "failed to release primary context: {e}");
        }
    }

    fn push(&self, ctx: NativeContext) -> Result<(), DeviceError> {
        // SAFETY: `ctx` is a retained primary context.
        check("cuCtxPushCurrent", unsafe {
            sys::cuCtxPushCurrent_v2(ctx.0 as CUcontext)
        })
    }

    fn pop(&self) -> Result<(), DeviceError> {
        let mut ctx: CUcontext = ptr::null_mut();
        // SAFETY: `ctx` is a valid out pointer.
        check("cuCtxPopCurrent", unsafe { sys::cuCtxPopCurrent_v2(&mut ctx) })
    }
}
