//! Raw ABI surface of the data access component.
//!
//! Everything the DAC boundary is made of lives here: the `HRESULT` status type and the
//! handful of codes this crate interprets, the well-known interface identifiers, the
//! export names probed during loading, and the exact signatures of the entry points that
//! are invoked by raw address. Signatures are bound once at symbol-resolution time; there
//! is no dynamic invocation machinery.
//!
//! All entry points and interface methods use the platform standard calling convention
//! (`extern "system"`). Status `0` means success; any other value is an opaque platform
//! status code surfaced verbatim in error messages.

use std::ffi::c_void;

use uguid::{guid, Guid};

/// Numeric status code returned by every native DAC entry point.
pub type HResult = i32;

/// The call succeeded.
pub const S_OK: HResult = 0;
/// The requested functionality is not implemented.
pub const E_NOTIMPL: HResult = 0x8000_4001_u32 as i32;
/// The requested interface is not supported.
pub const E_NOINTERFACE: HResult = 0x8000_4002_u32 as i32;
/// A required pointer argument was null.
pub const E_POINTER: HResult = 0x8000_4003_u32 as i32;
/// Unspecified failure.
pub const E_FAIL: HResult = 0x8000_4005_u32 as i32;
/// An argument was invalid.
pub const E_INVALIDARG: HResult = 0x8007_0057_u32 as i32;

/// `DllMain` reason code signalling process attach.
pub const DLL_PROCESS_ATTACH: u32 = 1;

/// Machine type reported through the data-target callback table: x86.
pub const IMAGE_FILE_MACHINE_I386: u32 = 0x014c;
/// Machine type reported through the data-target callback table: ARM (Thumb-2).
pub const IMAGE_FILE_MACHINE_ARMNT: u32 = 0x01c4;
/// Machine type reported through the data-target callback table: x86-64.
pub const IMAGE_FILE_MACHINE_AMD64: u32 = 0x8664;
/// Machine type reported through the data-target callback table: ARM64.
pub const IMAGE_FILE_MACHINE_ARM64: u32 = 0xaa64;

/// Identifier of the `IUnknown` base contract every interface pointer implements.
pub const IID_IUNKNOWN: Guid = guid!("00000000-0000-0000-c000-000000000046");
/// Identifier of the private process-inspection interface produced by the factory.
pub const IID_IXCLR_DATA_PROCESS: Guid = guid!("5c552ab6-fc09-4cb3-8e36-22fa03c798b8");
/// Identifier of the SOS DAC interface derived from the primary capability.
pub const IID_ISOS_DAC_INTERFACE: Guid = guid!("436f00f2-b42a-4b9f-870c-e73db66ae930");
/// Identifier of the data-target callback contract the host hands to the factory.
pub const IID_ICLR_DATA_TARGET: Guid = guid!("3e11ccee-d08b-43e5-af01-32717a64da03");

/// Preferred name of the optional platform-abstraction initializer export.
pub const DAC_PAL_INITIALIZE: &str = "DAC_PAL_InitializeDLL";
/// Legacy name of the optional platform-abstraction initializer export.
pub const PAL_INITIALIZE: &str = "PAL_InitializeDLL";
/// Name of the initializer's main entry point, mandatory once an initializer is present.
pub const DLL_MAIN: &str = "DllMain";
/// Name of the mandatory factory export that produces the primary capability.
pub const CLR_DATA_CREATE_INSTANCE: &str = "CLRDataCreateInstance";

/// Address of a resolved export.
pub type RawSymbol = *const c_void;

/// `DllMain`-shaped entry point: `(imageHandle, reason, reserved) -> BOOL`.
///
/// Invoked exactly once per loaded image with [`DLL_PROCESS_ATTACH`] and a null
/// reserved argument. The return value is not consulted.
pub type DllMainFn = unsafe extern "system" fn(*mut c_void, u32, *mut c_void) -> i32;

/// `CLRDataCreateInstance`-shaped factory: `(riid, dataTarget, out) -> HRESULT`.
pub type CreateInstanceFn =
    unsafe extern "system" fn(*const Guid, *mut c_void, *mut *mut c_void) -> HResult;

/// The three leading vtable slots shared by every interface pointer.
///
/// Only these slots are ever called on an acquired capability pointer: capability
/// queries go through `query_interface`, shared ownership through `add_ref`, and
/// teardown through `release`.
#[repr(C)]
pub struct IUnknownVtbl {
    /// `(this, riid, out) -> HRESULT`; [`E_NOINTERFACE`] signals an unsupported identifier.
    pub query_interface:
        unsafe extern "system" fn(*mut c_void, *const Guid, *mut *mut c_void) -> HResult,
    /// `(this) -> new reference count`.
    pub add_ref: unsafe extern "system" fn(*mut c_void) -> u32,
    /// `(this) -> remaining reference count`; the object frees itself at zero.
    pub release: unsafe extern "system" fn(*mut c_void) -> u32,
}
