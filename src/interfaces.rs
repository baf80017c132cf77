//! Ownership and querying of native interface pointers.
//!
//! Every capability the DAC yields arrives as a raw interface pointer whose first three
//! vtable slots follow the `IUnknown` contract. [`InterfaceHandle`] owns exactly one
//! such pointer and releases it exactly once; [`DacCapability`] is the fixed
//! construction shape every capability wrapper implements so the orchestrator can
//! produce wrappers for a compile-time-known interface identifier; [`SosDac`] is the
//! secondary capability derived from the primary process interface.

use std::{ffi::c_void, fmt, ptr::NonNull};

use uguid::Guid;

use crate::{
    dac::DacLibrary,
    ffi::{IUnknownVtbl, IID_ISOS_DAC_INTERFACE, S_OK},
    Error, Result,
};

/// Owns one raw native interface pointer.
///
/// A handle is created by wrapping a pointer returned from a factory or query call and
/// takes over the reference that call produced. The pointer is non-null for the
/// handle's entire lifetime and is released exactly once, when the handle drops.
pub struct InterfaceHandle {
    ptr: NonNull<c_void>,
}

impl InterfaceHandle {
    /// Normalizes an opaque handle into an owned interface handle.
    ///
    /// Takes over one reference on `ptr`; the caller must not release it again.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] when `ptr` is null.
    ///
    /// # Safety
    /// A non-null `ptr` must point to a live object whose first field is an
    /// `IUnknown`-shaped vtable pointer, with one reference owned by the caller.
    pub unsafe fn from_raw(ptr: *mut c_void) -> Result<InterfaceHandle> {
        match NonNull::new(ptr) {
            Some(ptr) => Ok(InterfaceHandle { ptr }),
            None => Err(Error::InvalidArgument(
                "not an instance of the expected interface".to_string(),
            )),
        }
    }

    /// Wraps a pointer that is already known to be a valid owned reference.
    pub(crate) unsafe fn from_owned(ptr: NonNull<c_void>) -> InterfaceHandle {
        InterfaceHandle { ptr }
    }

    /// The raw interface pointer. The handle retains ownership.
    pub fn as_raw(&self) -> *mut c_void {
        self.ptr.as_ptr()
    }

    fn vtable(&self) -> &IUnknownVtbl {
        unsafe { &**self.ptr.as_ptr().cast::<*const IUnknownVtbl>() }
    }

    /// Queries the object for another capability by interface identifier.
    ///
    /// Returns the referenced pointer on success, `None` when the object does not
    /// support the identifier. The returned reference is owned by the caller.
    pub fn query(&self, iid: &Guid) -> Option<NonNull<c_void>> {
        let mut out = std::ptr::null_mut();
        let status = unsafe { (self.vtable().query_interface)(self.as_raw(), iid, &mut out) };

        if status == S_OK {
            NonNull::new(out)
        } else {
            None
        }
    }

    /// Takes an additional reference on the underlying object.
    ///
    /// Used when a second wrapper is handed out around the same resolved pointer.
    pub fn add_ref(&self) -> u32 {
        unsafe { (self.vtable().add_ref)(self.as_raw()) }
    }
}

impl Drop for InterfaceHandle {
    fn drop(&mut self) {
        unsafe { (self.vtable().release)(self.as_raw()) };
    }
}

impl fmt::Debug for InterfaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InterfaceHandle").field(&self.ptr).finish()
    }
}

/// A capability wrapper constructible by [`DacLibrary::acquire`].
///
/// Wrappers are built from exactly one shape: the owning library plus the interface
/// handle the query produced. The owning library keeps the DAC image mapped for as
/// long as the wrapper lives. The interface identifier is compile-time-known, so
/// requesting a type that cannot be built this way is a type error rather than a
/// runtime failure.
pub trait DacCapability: Sized {
    /// Interface identifier queried to produce this capability.
    const IID: Guid;

    /// Builds the wrapper around a freshly referenced interface pointer.
    fn from_handle(library: DacLibrary, handle: InterfaceHandle) -> Self;
}

/// The SOS DAC interface: the secondary capability derived from the primary process
/// interface.
///
/// Acquired through [`DacLibrary::sos`], which resolves the underlying pointer once
/// and hands out one wrapper per call around that shared pointer. Method bindings
/// live with the consumers of this crate; the wrapper's job is ownership.
pub struct SosDac {
    library: DacLibrary,
    handle: InterfaceHandle,
}

impl SosDac {
    /// The raw SOS interface pointer. The wrapper retains ownership.
    pub fn as_raw(&self) -> *mut c_void {
        self.handle.as_raw()
    }

    /// The library this capability was derived from.
    pub fn library(&self) -> &DacLibrary {
        &self.library
    }

    /// Queries the SOS object itself for a further capability.
    pub fn query(&self, iid: &Guid) -> Option<NonNull<c_void>> {
        self.handle.query(iid)
    }
}

impl DacCapability for SosDac {
    const IID: Guid = IID_ISOS_DAC_INTERFACE;

    fn from_handle(library: DacLibrary, handle: InterfaceHandle) -> SosDac {
        SosDac { library, handle }
    }
}
