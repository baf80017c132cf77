//! Shared fixtures for unit tests.
//!
//! Real DAC images cannot be shipped with the crate, so the protocol is exercised
//! against scripted stand-ins: [`fake_image`] builds a [`crate::LoadedImage`] whose
//! exports are the `extern "system"` functions below, [`new_fake_unknown`] allocates
//! an observable `IUnknown`-shaped object like the ones the factory returns, and
//! [`FakeDataTarget`] plays the host side of the data-target contract.
//!
//! Scripting and observation go through thread locals; the whole construction
//! protocol is synchronous on the calling thread and every test runs on its own
//! thread, so tests never see each other's records.

use std::{
    cell::RefCell,
    collections::HashMap,
    ffi::c_void,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use uguid::{guid, Guid};

use crate::{
    dac::DacLibrary,
    ffi::{
        CreateInstanceFn, DllMainFn, HResult, IUnknownVtbl, RawSymbol, E_NOINTERFACE, E_POINTER,
        IID_ISOS_DAC_INTERFACE, IID_IUNKNOWN, IID_IXCLR_DATA_PROCESS, IMAGE_FILE_MACHINE_AMD64,
        S_OK,
    },
    image::{LoadedImage, SharedLibrary},
    interfaces::{DacCapability, InterfaceHandle},
    target::DataTarget,
    Result,
};

/// Identifier of the capability only [`ProbeCapability`] asks for.
pub(crate) const IID_FAKE_PROBE: Guid = guid!("8f2d3e91-6a4c-4d7b-9c1e-5b8a2f0d4e63");

thread_local! {
    static NEXT_CREATE: RefCell<Option<CreatePlan>> = const { RefCell::new(None) };
    static LAST_CREATE: RefCell<Option<CreateCall>> = const { RefCell::new(None) };
    static ATTACH_CALLS: RefCell<Vec<AttachCall>> = const { RefCell::new(Vec::new()) };
}

/// Scripts the next `CLRDataCreateInstance` invocation on this thread.
#[derive(Clone)]
pub(crate) struct CreatePlan {
    pub status: HResult,
    pub supports_sos: bool,
    pub supports_probe: bool,
}

impl Default for CreatePlan {
    fn default() -> CreatePlan {
        CreatePlan {
            status: S_OK,
            supports_sos: true,
            supports_probe: false,
        }
    }
}

impl CreatePlan {
    pub fn failing(status: HResult) -> CreatePlan {
        CreatePlan {
            status,
            ..CreatePlan::default()
        }
    }
}

/// Record of one `CLRDataCreateInstance` invocation.
#[derive(Clone)]
pub(crate) struct CreateCall {
    pub riid: Guid,
    pub data_target: *mut c_void,
    /// Observable state of the object handed out, when one was produced.
    pub object: Option<Arc<FakeObjectState>>,
}

/// Record of one `DllMain` invocation.
#[derive(Clone, Copy)]
pub(crate) struct AttachCall {
    pub base: usize,
    pub reason: u32,
    pub reserved_null: bool,
}

pub(crate) fn set_next_create(plan: CreatePlan) {
    NEXT_CREATE.with(|cell| *cell.borrow_mut() = Some(plan));
}

pub(crate) fn last_create() -> Option<CreateCall> {
    LAST_CREATE.with(|cell| cell.borrow().clone())
}

pub(crate) fn attach_calls() -> Vec<AttachCall> {
    ATTACH_CALLS.with(|cell| cell.borrow().clone())
}

unsafe extern "system" fn fake_pal_init() {}

unsafe extern "system" fn fake_dll_main(
    image: *mut c_void,
    reason: u32,
    reserved: *mut c_void,
) -> i32 {
    ATTACH_CALLS.with(|cell| {
        cell.borrow_mut().push(AttachCall {
            base: image as usize,
            reason,
            reserved_null: reserved.is_null(),
        });
    });
    1
}

unsafe extern "system" fn fake_create_instance(
    riid: *const Guid,
    data_target: *mut c_void,
    out: *mut *mut c_void,
) -> HResult {
    if riid.is_null() || data_target.is_null() || out.is_null() {
        return E_POINTER;
    }

    let plan = NEXT_CREATE
        .with(|cell| cell.borrow_mut().take())
        .unwrap_or_default();
    let mut call = CreateCall {
        riid: unsafe { *riid },
        data_target,
        object: None,
    };

    let status = if plan.status != S_OK {
        plan.status
    } else if call.riid != IID_IXCLR_DATA_PROCESS {
        E_NOINTERFACE
    } else {
        let (ptr, state) = new_fake_unknown(plan.supports_sos, plan.supports_probe);
        call.object = Some(state);
        unsafe { *out = ptr };
        S_OK
    };

    LAST_CREATE.with(|cell| *cell.borrow_mut() = Some(call));
    status
}

/// Observable side of a [`new_fake_unknown`] object. Stays readable after the
/// object frees itself.
pub(crate) struct FakeObjectState {
    sos_queries: AtomicUsize,
    add_refs: AtomicUsize,
    releases: AtomicUsize,
    freed: AtomicBool,
    supports_sos: bool,
    supports_probe: bool,
}

impl FakeObjectState {
    pub fn sos_queries(&self) -> usize {
        self.sos_queries.load(Ordering::SeqCst)
    }

    pub fn add_refs(&self) -> usize {
        self.add_refs.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn freed(&self) -> bool {
        self.freed.load(Ordering::SeqCst)
    }
}

#[repr(C)]
struct FakeUnknown {
    vtable: *const IUnknownVtbl,
    refs: AtomicU32,
    state: Arc<FakeObjectState>,
}

static FAKE_UNKNOWN_VTBL: IUnknownVtbl = IUnknownVtbl {
    query_interface: fake_query_interface,
    add_ref: fake_add_ref,
    release: fake_release,
};

unsafe extern "system" fn fake_query_interface(
    this: *mut c_void,
    riid: *const Guid,
    out: *mut *mut c_void,
) -> HResult {
    let object = unsafe { &*this.cast::<FakeUnknown>() };
    let iid = unsafe { *riid };

    if iid == IID_ISOS_DAC_INTERFACE {
        object.state.sos_queries.fetch_add(1, Ordering::SeqCst);
    }

    let supported = iid == IID_IUNKNOWN
        || iid == IID_IXCLR_DATA_PROCESS
        || (object.state.supports_sos && iid == IID_ISOS_DAC_INTERFACE)
        || (object.state.supports_probe && iid == IID_FAKE_PROBE);

    if supported {
        object.refs.fetch_add(1, Ordering::SeqCst);
        unsafe { *out = this };
        S_OK
    } else {
        unsafe { *out = std::ptr::null_mut() };
        E_NOINTERFACE
    }
}

unsafe extern "system" fn fake_add_ref(this: *mut c_void) -> u32 {
    let object = unsafe { &*this.cast::<FakeUnknown>() };
    object.state.add_refs.fetch_add(1, Ordering::SeqCst);
    object.refs.fetch_add(1, Ordering::SeqCst) + 1
}

unsafe extern "system" fn fake_release(this: *mut c_void) -> u32 {
    let object = unsafe { &*this.cast::<FakeUnknown>() };
    object.state.releases.fetch_add(1, Ordering::SeqCst);

    let remaining = object.refs.fetch_sub(1, Ordering::SeqCst) - 1;
    if remaining == 0 {
        object.state.freed.store(true, Ordering::SeqCst);
        drop(unsafe { Box::from_raw(this.cast::<FakeUnknown>()) });
    }
    remaining
}

/// Allocates an `IUnknown`-shaped object with one reference owned by the caller.
///
/// The returned state outlives the object and records every vtable interaction.
pub(crate) fn new_fake_unknown(
    supports_sos: bool,
    supports_probe: bool,
) -> (*mut c_void, Arc<FakeObjectState>) {
    let state = Arc::new(FakeObjectState {
        sos_queries: AtomicUsize::new(0),
        add_refs: AtomicUsize::new(0),
        releases: AtomicUsize::new(0),
        freed: AtomicBool::new(false),
        supports_sos,
        supports_probe,
    });

    let object = Box::new(FakeUnknown {
        vtable: &FAKE_UNKNOWN_VTBL,
        refs: AtomicU32::new(1),
        state: Arc::clone(&state),
    });

    (Box::into_raw(object).cast(), state)
}

/// Unload observations for one [`fake_image`].
#[derive(Default)]
pub(crate) struct ImageEvents {
    unloads: AtomicUsize,
}

impl ImageEvents {
    pub fn unloads(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }
}

static NEXT_BASE: AtomicUsize = AtomicUsize::new(0x7000_0000);

struct FakeImage {
    exports: Vec<&'static str>,
    base: usize,
    events: Arc<ImageEvents>,
}

impl LoadedImage for FakeImage {
    fn resolve(&self, symbol: &str) -> Option<RawSymbol> {
        if !self.exports.iter().any(|export| *export == symbol) {
            return None;
        }

        type InitStubFn = unsafe extern "system" fn();
        let address = match symbol {
            "DAC_PAL_InitializeDLL" | "PAL_InitializeDLL" => {
                fake_pal_init as InitStubFn as usize
            }
            "DllMain" => fake_dll_main as DllMainFn as usize,
            "CLRDataCreateInstance" => fake_create_instance as CreateInstanceFn as usize,
            _ => return None,
        };
        Some(address as RawSymbol)
    }

    fn base(&self) -> *mut c_void {
        self.base as *mut c_void
    }
}

impl Drop for FakeImage {
    fn drop(&mut self) {
        self.events.unloads.fetch_add(1, Ordering::SeqCst);
    }
}

/// Builds a shared claim on a scripted image carrying exactly `exports`.
pub(crate) fn fake_image(exports: &[&'static str]) -> (SharedLibrary, Arc<ImageEvents>) {
    let events = Arc::new(ImageEvents::default());
    let image = FakeImage {
        exports: exports.to_vec(),
        base: NEXT_BASE.fetch_add(0x1_0000, Ordering::SeqCst),
        events: Arc::clone(&events),
    };

    (SharedLibrary::from_image(Arc::new(image)), events)
}

/// Host side of the data-target contract with scriptable memory and images.
pub(crate) struct FakeDataTarget {
    runtimes: usize,
    memory: Mutex<Vec<(u64, Vec<u8>)>>,
    images: Mutex<HashMap<String, u64>>,
    flushes: AtomicUsize,
}

impl FakeDataTarget {
    pub fn new() -> FakeDataTarget {
        FakeDataTarget::with_runtimes(1)
    }

    pub fn with_runtimes(runtimes: usize) -> FakeDataTarget {
        FakeDataTarget {
            runtimes,
            memory: Mutex::new(Vec::new()),
            images: Mutex::new(HashMap::new()),
            flushes: AtomicUsize::new(0),
        }
    }

    pub fn insert_memory(&self, address: u64, bytes: Vec<u8>) {
        self.memory.lock().unwrap().push((address, bytes));
    }

    pub fn insert_image(&self, name: &str, base: u64) {
        self.images.lock().unwrap().insert(name.to_string(), base);
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

impl DataTarget for FakeDataTarget {
    fn runtime_count(&self) -> usize {
        self.runtimes
    }

    fn machine_type(&self) -> u32 {
        IMAGE_FILE_MACHINE_AMD64
    }

    fn pointer_size(&self) -> u32 {
        8
    }

    fn image_base(&self, image: &str) -> Option<u64> {
        self.images.lock().unwrap().get(image).copied()
    }

    fn read_virtual(&self, address: u64, buffer: &mut [u8]) -> Result<usize> {
        let memory = self.memory.lock().unwrap();
        for (start, bytes) in memory.iter() {
            let end = start + bytes.len() as u64;
            if address >= *start && address < end {
                let offset = (address - start) as usize;
                let available = bytes.len() - offset;
                let read = available.min(buffer.len());
                buffer[..read].copy_from_slice(&bytes[offset..offset + read]);
                return Ok(read);
            }
        }
        Err(diagnostics_error!("unmapped target address {address:#x}"))
    }

    fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Capability wrapper used to exercise generic acquisition.
pub(crate) struct ProbeCapability {
    library: DacLibrary,
    handle: InterfaceHandle,
}

impl ProbeCapability {
    pub fn as_raw(&self) -> *mut c_void {
        self.handle.as_raw()
    }

    pub fn library(&self) -> &DacLibrary {
        &self.library
    }
}

impl DacCapability for ProbeCapability {
    const IID: Guid = IID_FAKE_PROBE;

    fn from_handle(library: DacLibrary, handle: InterfaceHandle) -> ProbeCapability {
        ProbeCapability { library, handle }
    }
}
