//! Host data-target abstraction and its native callback-table adapter.
//!
//! The DAC reads the inspected process exclusively through a caller-provided
//! `ICLRDataTarget` callback table. [`DataTarget`] is the host-level abstraction this
//! crate consumes (memory and register reads, runtime detection, cache invalidation);
//! [`DacDataTarget`] adapts it into the fixed-shape table the native side expects and
//! owns the resulting object for its entire lifetime.
//!
//! # Boundary rules
//!
//! The adapter's raw object pointer is stable from construction to drop, so it can be
//! handed across the native boundary once and used for the whole session. The object
//! carries its own atomic reference count: the adapter holds one reference, and native
//! code may take further references that keep the object alive past the adapter.
//! Callbacks never unwind into native code; a panicking host turns into [`E_FAIL`].

use std::{
    ffi::c_void,
    panic::{self, AssertUnwindSafe},
    ptr::NonNull,
    slice,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use tracing::trace;
use uguid::Guid;
use widestring::U16CStr;

use crate::{
    ffi::{
        HResult, E_FAIL, E_NOINTERFACE, E_NOTIMPL, E_POINTER, IID_ICLR_DATA_TARGET, IID_IUNKNOWN,
        S_OK,
    },
    Result,
};

/// Host-level view of the inspected process.
///
/// Implemented by whatever supplies target state - a live-process reader, a dump
/// parser, a remote session. The adapter is the sole consumer; no other component
/// of this crate touches the host abstraction.
///
/// Write and register access default to unsupported so read-only dump hosts only
/// implement what they actually have.
pub trait DataTarget: Send + Sync {
    /// How many managed runtime versions were detected in the target process.
    ///
    /// A DAC is only loaded for targets reporting at least one.
    fn runtime_count(&self) -> usize;

    /// Machine type of the target, as an `IMAGE_FILE_MACHINE_*` value.
    fn machine_type(&self) -> u32;

    /// Pointer width of the target in bytes.
    fn pointer_size(&self) -> u32;

    /// Base address of a module image in the target, looked up by path or name.
    fn image_base(&self, image: &str) -> Option<u64>;

    /// Reads target memory at `address` into `buffer`.
    ///
    /// Returns the number of bytes read, which may be less than requested at a
    /// region boundary.
    ///
    /// # Errors
    /// Fails when the address range is not mapped in the target.
    fn read_virtual(&self, address: u64, buffer: &mut [u8]) -> Result<usize>;

    /// Writes `buffer` into target memory at `address`.
    ///
    /// # Errors
    /// Defaults to failing; read-only targets leave this unimplemented.
    fn write_virtual(&self, address: u64, buffer: &[u8]) -> Result<usize> {
        let _ = (address, buffer);
        Err(diagnostics_error!("target does not support memory writes"))
    }

    /// Fills `buffer` with the register context of the given thread.
    ///
    /// # Errors
    /// Defaults to failing; targets without thread state leave this unimplemented.
    fn thread_context(&self, thread_id: u32, context_flags: u32, buffer: &mut [u8]) -> Result<()> {
        let _ = (thread_id, context_flags, buffer);
        Err(diagnostics_error!("target does not support thread contexts"))
    }

    /// Invalidation hook: the target's view of process state may have changed.
    fn flush(&self);
}

/// Complete callback table of the data-target contract, in vtable order.
///
/// The shape is fixed by the runtime; every slot must be populated or the native
/// side would call through uninitialized memory.
#[repr(C)]
struct ClrDataTargetVtbl {
    query_interface:
        unsafe extern "system" fn(*mut ClrDataTarget, *const Guid, *mut *mut c_void) -> HResult,
    add_ref: unsafe extern "system" fn(*mut ClrDataTarget) -> u32,
    release: unsafe extern "system" fn(*mut ClrDataTarget) -> u32,
    get_machine_type: unsafe extern "system" fn(*mut ClrDataTarget, *mut u32) -> HResult,
    get_pointer_size: unsafe extern "system" fn(*mut ClrDataTarget, *mut u32) -> HResult,
    get_image_base: unsafe extern "system" fn(*mut ClrDataTarget, *const u16, *mut u64) -> HResult,
    read_virtual:
        unsafe extern "system" fn(*mut ClrDataTarget, u64, *mut u8, u32, *mut u32) -> HResult,
    write_virtual:
        unsafe extern "system" fn(*mut ClrDataTarget, u64, *const u8, u32, *mut u32) -> HResult,
    get_tls_value: unsafe extern "system" fn(*mut ClrDataTarget, u32, u32, *mut u64) -> HResult,
    set_tls_value: unsafe extern "system" fn(*mut ClrDataTarget, u32, u32, u64) -> HResult,
    get_current_thread_id: unsafe extern "system" fn(*mut ClrDataTarget, *mut u32) -> HResult,
    get_thread_context:
        unsafe extern "system" fn(*mut ClrDataTarget, u32, u32, u32, *mut u8) -> HResult,
    set_thread_context:
        unsafe extern "system" fn(*mut ClrDataTarget, u32, u32, *const u8) -> HResult,
    request:
        unsafe extern "system" fn(*mut ClrDataTarget, u32, u32, *const u8, u32, *mut u8) -> HResult,
}

static CLR_DATA_TARGET_VTBL: ClrDataTargetVtbl = ClrDataTargetVtbl {
    query_interface,
    add_ref,
    release,
    get_machine_type,
    get_pointer_size,
    get_image_base,
    read_virtual,
    write_virtual,
    get_tls_value,
    set_tls_value,
    get_current_thread_id,
    get_thread_context,
    set_thread_context,
    request,
};

/// The heap-allocated callback object whose address crosses the native boundary.
///
/// Layout invariant: the vtable pointer must be the first field.
#[repr(C)]
struct ClrDataTarget {
    vtable: *const ClrDataTargetVtbl,
    refs: AtomicU32,
    target: Arc<dyn DataTarget>,
}

/// Runs a callback body, converting a panic into [`E_FAIL`] instead of unwinding
/// across the ABI boundary.
fn guarded(body: impl FnOnce() -> HResult) -> HResult {
    panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or(E_FAIL)
}

unsafe extern "system" fn query_interface(
    this: *mut ClrDataTarget,
    riid: *const Guid,
    out: *mut *mut c_void,
) -> HResult {
    guarded(|| {
        if riid.is_null() || out.is_null() {
            return E_POINTER;
        }

        let iid = unsafe { *riid };
        if iid == IID_IUNKNOWN || iid == IID_ICLR_DATA_TARGET {
            unsafe {
                (*this).refs.fetch_add(1, Ordering::Relaxed);
                *out = this.cast();
            }
            S_OK
        } else {
            unsafe { *out = std::ptr::null_mut() };
            E_NOINTERFACE
        }
    })
}

unsafe extern "system" fn add_ref(this: *mut ClrDataTarget) -> u32 {
    unsafe { (*this).refs.fetch_add(1, Ordering::Relaxed) + 1 }
}

unsafe extern "system" fn release(this: *mut ClrDataTarget) -> u32 {
    let remaining = unsafe { (*this).refs.fetch_sub(1, Ordering::AcqRel) - 1 };
    if remaining == 0 {
        drop(unsafe { Box::from_raw(this) });
    }
    remaining
}

unsafe extern "system" fn get_machine_type(this: *mut ClrDataTarget, out: *mut u32) -> HResult {
    guarded(|| {
        if out.is_null() {
            return E_POINTER;
        }
        unsafe { *out = (*this).target.machine_type() };
        S_OK
    })
}

unsafe extern "system" fn get_pointer_size(this: *mut ClrDataTarget, out: *mut u32) -> HResult {
    guarded(|| {
        if out.is_null() {
            return E_POINTER;
        }
        unsafe { *out = (*this).target.pointer_size() };
        S_OK
    })
}

unsafe extern "system" fn get_image_base(
    this: *mut ClrDataTarget,
    image_path: *const u16,
    out: *mut u64,
) -> HResult {
    guarded(|| {
        if image_path.is_null() || out.is_null() {
            return E_POINTER;
        }

        let image = unsafe { U16CStr::from_ptr_str(image_path) }.to_string_lossy();
        trace!(image = %image, "image base requested");

        match unsafe { &(*this).target }.image_base(&image) {
            Some(base) => {
                unsafe { *out = base };
                S_OK
            }
            None => E_FAIL,
        }
    })
}

unsafe extern "system" fn read_virtual(
    this: *mut ClrDataTarget,
    address: u64,
    buffer: *mut u8,
    requested: u32,
    done: *mut u32,
) -> HResult {
    guarded(|| {
        if buffer.is_null() || done.is_null() {
            return E_POINTER;
        }
        if requested == 0 {
            unsafe { *done = 0 };
            return S_OK;
        }

        let buffer = unsafe { slice::from_raw_parts_mut(buffer, requested as usize) };
        match unsafe { &(*this).target }.read_virtual(address, buffer) {
            Ok(read) if read > 0 => {
                unsafe { *done = read as u32 };
                S_OK
            }
            _ => E_FAIL,
        }
    })
}

unsafe extern "system" fn write_virtual(
    this: *mut ClrDataTarget,
    address: u64,
    buffer: *const u8,
    requested: u32,
    done: *mut u32,
) -> HResult {
    guarded(|| {
        if buffer.is_null() || done.is_null() {
            return E_POINTER;
        }

        let buffer = unsafe { slice::from_raw_parts(buffer, requested as usize) };
        match unsafe { &(*this).target }.write_virtual(address, buffer) {
            Ok(written) => {
                unsafe { *done = written as u32 };
                S_OK
            }
            Err(_) => E_FAIL,
        }
    })
}

unsafe extern "system" fn get_tls_value(
    _this: *mut ClrDataTarget,
    _thread_id: u32,
    _index: u32,
    _out: *mut u64,
) -> HResult {
    E_NOTIMPL
}

unsafe extern "system" fn set_tls_value(
    _this: *mut ClrDataTarget,
    _thread_id: u32,
    _index: u32,
    _value: u64,
) -> HResult {
    E_NOTIMPL
}

unsafe extern "system" fn get_current_thread_id(
    _this: *mut ClrDataTarget,
    _out: *mut u32,
) -> HResult {
    E_NOTIMPL
}

unsafe extern "system" fn get_thread_context(
    this: *mut ClrDataTarget,
    thread_id: u32,
    context_flags: u32,
    context_size: u32,
    context: *mut u8,
) -> HResult {
    guarded(|| {
        if context.is_null() {
            return E_POINTER;
        }

        let buffer = unsafe { slice::from_raw_parts_mut(context, context_size as usize) };
        match unsafe { &(*this).target }.thread_context(thread_id, context_flags, buffer) {
            Ok(()) => S_OK,
            Err(_) => E_FAIL,
        }
    })
}

unsafe extern "system" fn set_thread_context(
    _this: *mut ClrDataTarget,
    _thread_id: u32,
    _context_size: u32,
    _context: *const u8,
) -> HResult {
    E_NOTIMPL
}

unsafe extern "system" fn request(
    _this: *mut ClrDataTarget,
    _request_code: u32,
    _in_size: u32,
    _in_buffer: *const u8,
    _out_size: u32,
    _out_buffer: *mut u8,
) -> HResult {
    E_NOTIMPL
}

/// Adapts a [`DataTarget`] into the callback table the DAC factory consumes.
///
/// The adapter constructs one callback object up front and keeps its address stable
/// for the adapter's entire lifetime; [`DacDataTarget::as_raw`] can therefore be
/// passed across the native boundary once and reused. Dropping the adapter releases
/// its reference; the object itself is freed when native code has released every
/// reference it took.
pub struct DacDataTarget {
    target: Arc<dyn DataTarget>,
    raw: NonNull<ClrDataTarget>,
}

impl DacDataTarget {
    /// Builds the callback table around `target`.
    pub fn new(target: Arc<dyn DataTarget>) -> DacDataTarget {
        let object = Box::new(ClrDataTarget {
            vtable: &CLR_DATA_TARGET_VTBL,
            refs: AtomicU32::new(1),
            target: Arc::clone(&target),
        });

        DacDataTarget {
            target,
            raw: NonNull::from(Box::leak(object)),
        }
    }

    /// The stable callback-table handle to pass across the native boundary.
    pub fn as_raw(&self) -> *mut c_void {
        self.raw.as_ptr().cast()
    }

    /// Forwards the invalidation signal to the host abstraction.
    ///
    /// Has no persisted state of its own; call it around checkpoints where the
    /// target process's memory may have changed.
    pub fn flush(&self) {
        self.target.flush();
    }
}

impl Drop for DacDataTarget {
    fn drop(&mut self) {
        unsafe { release(self.raw.as_ptr()) };
    }
}
