//! Lifecycle of one loaded data access component.
//!
//! [`DacLibrary`] is the entry point of this crate. It owns everything a DAC session
//! needs: the shared claim on the loaded image (when the DAC was loaded from a path),
//! the data-target adapter, the primary process interface produced by the factory
//! entry point, and the lazily derived SOS interface. Teardown runs in a fixed order -
//! primary interface, cached SOS interface, adapter, image claim - whichever way the
//! instance was constructed, and happens exactly once, when the last clone and the
//! last capability wrapper derived from it are gone.
//!
//! # Load protocol
//!
//! Construction from a path performs, in order: the managed-process precondition,
//! the image load, the optional one-time platform-abstraction initializer (probed
//! under two export names; `DllMain` becomes mandatory once either is present), the
//! factory resolution, and the factory invocation with the private process-interface
//! identifier and the adapter's callback handle. The initializer runs before the
//! factory, which runs before any interface query; all three are blocking foreign
//! calls with no timeout or cancellation. A failure at any step releases everything
//! acquired up to that point before the error surfaces.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dacscope::{DacLibrary, DataTarget};
//!
//! fn inspect(target: Arc<dyn DataTarget>) -> dacscope::Result<()> {
//!     let dac = DacLibrary::load(target, "/usr/share/dotnet/libmscordaccore.so")?;
//!     let sos = dac.sos()?;
//!     println!("SOS interface at {:p}", sos.as_raw());
//!     Ok(())
//! }
//! ```

use std::{
    ffi::c_void,
    fmt, mem,
    path::Path,
    ptr::{self, NonNull},
    sync::{Arc, OnceLock},
};

use tracing::debug;

use crate::{
    ffi::{
        CreateInstanceFn, DllMainFn, CLR_DATA_CREATE_INSTANCE, DAC_PAL_INITIALIZE,
        DLL_MAIN, DLL_PROCESS_ATTACH, IID_IXCLR_DATA_PROCESS, PAL_INITIALIZE, S_OK,
    },
    image::SharedLibrary,
    interfaces::{DacCapability, InterfaceHandle, SosDac},
    target::{DacDataTarget, DataTarget},
    Error, Result,
};

/// One loaded data access component and the capability interfaces derived from it.
///
/// Cloning is cheap and shares the same underlying session; every capability wrapper
/// produced by [`DacLibrary::sos`] or [`DacLibrary::acquire`] holds such a clone, so
/// the image cannot be unloaded while any wrapper is reachable.
#[derive(Clone)]
pub struct DacLibrary {
    inner: Arc<DacLibraryInner>,
}

/// Field order is teardown order: primary interface, cached SOS interface,
/// data-target adapter, image claim.
struct DacLibraryInner {
    dac: InterfaceHandle,
    sos: OnceLock<InterfaceHandle>,
    data_target: DacDataTarget,
    image: Option<SharedLibrary>,
}

fn ensure_managed(target: &dyn DataTarget) -> Result<()> {
    if target.runtime_count() == 0 {
        return Err(diagnostics_error!(
            "process is not a recognized managed process"
        ));
    }
    Ok(())
}

impl DacLibrary {
    /// Attaches to an already-obtained primary interface pointer.
    ///
    /// No library load is performed and no image claim is owned; the pointer's
    /// reference is taken over by this instance. The data-target adapter is still
    /// constructed so [`DacLibrary::flush`] works on this path too.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] when `dac` is null.
    ///
    /// # Safety
    /// A non-null `dac` must be a live process-interface pointer with one reference
    /// owned by the caller.
    pub unsafe fn from_raw(target: Arc<dyn DataTarget>, dac: *mut c_void) -> Result<DacLibrary> {
        let dac = unsafe { InterfaceHandle::from_raw(dac) }?;

        Ok(DacLibrary {
            inner: Arc::new(DacLibraryInner {
                dac,
                sos: OnceLock::new(),
                data_target: DacDataTarget::new(target),
                image: None,
            }),
        })
    }

    /// Loads the DAC image at `path` and runs the full construction protocol.
    ///
    /// The managed-process precondition is checked before the filesystem is touched.
    ///
    /// # Errors
    /// Returns [`Error::Diagnostics`] when the target reports no managed runtime,
    /// the image cannot be loaded, a mandatory export is missing, or the factory
    /// reports a nonzero status (preserved in the error).
    pub fn load(target: Arc<dyn DataTarget>, path: impl AsRef<Path>) -> Result<DacLibrary> {
        let path = path.as_ref();
        ensure_managed(target.as_ref())?;

        debug!(path = %path.display(), "loading data access component");
        let image = SharedLibrary::load(path)?;
        DacLibrary::from_image(target, image)
    }

    /// Runs the construction protocol against an already-loaded image.
    ///
    /// This is [`DacLibrary::load`] minus the load itself: useful when the host
    /// shares one image claim across several sessions or loads through a custom
    /// [`crate::LoadedImage`].
    ///
    /// # Errors
    /// Same contract as [`DacLibrary::load`], minus the load failure.
    pub fn from_image(target: Arc<dyn DataTarget>, image: SharedLibrary) -> Result<DacLibrary> {
        ensure_managed(target.as_ref())?;

        let initializer = image
            .resolve(DAC_PAL_INITIALIZE)
            .or_else(|| image.resolve(PAL_INITIALIZE));
        if initializer.is_some() {
            let Some(main) = image.resolve(DLL_MAIN) else {
                return Err(diagnostics_error!("failed to obtain DllMain entry point"));
            };

            // One-time, irreversible side effect for this image instance; the
            // return value is not consulted.
            let main: DllMainFn = unsafe { mem::transmute(main) };
            debug!("running platform abstraction initializer");
            unsafe { main(image.base(), DLL_PROCESS_ATTACH, ptr::null_mut()) };
        }

        let Some(factory) = image.resolve(CLR_DATA_CREATE_INSTANCE) else {
            return Err(diagnostics_error!(
                "failed to obtain CLRDataCreateInstance entry point"
            ));
        };
        let factory: CreateInstanceFn = unsafe { mem::transmute(factory) };

        let data_target = DacDataTarget::new(Arc::clone(&target));
        let mut out = ptr::null_mut();
        let status = unsafe { factory(&IID_IXCLR_DATA_PROCESS, data_target.as_raw(), &mut out) };
        if status != S_OK {
            return Err(Error::dac_status("CLRDataCreateInstance", status));
        }

        let dac = match NonNull::new(out) {
            Some(ptr) => unsafe { InterfaceHandle::from_owned(ptr) },
            None => {
                return Err(diagnostics_error!(
                    "CLRDataCreateInstance produced no interface"
                ))
            }
        };

        debug!("acquired primary process interface");
        Ok(DacLibrary {
            inner: Arc::new(DacLibraryInner {
                dac,
                sos: OnceLock::new(),
                data_target,
                image: Some(image),
            }),
        })
    }

    /// Acquires the SOS DAC interface, resolving it on first use.
    ///
    /// The underlying pointer is queried once and cached for the library's remaining
    /// lifetime; every call takes an additional reference on it and returns a fresh
    /// wrapper, so wrappers can be dropped independently.
    ///
    /// # Errors
    /// Returns [`Error::UnsupportedInterface`] when this runtime's DAC does not
    /// implement the SOS interface. The outcome does not change on retry.
    pub fn sos(&self) -> Result<SosDac> {
        if self.inner.sos.get().is_none() {
            let ptr = self
                .inner
                .dac
                .query(&SosDac::IID)
                .ok_or(Error::UnsupportedInterface("the SOS DAC interface"))?;
            let _ = self.inner.sos.set(unsafe { InterfaceHandle::from_owned(ptr) });
        }

        let cached = self
            .inner
            .sos
            .get()
            .expect("secondary interface cached above");
        cached.add_ref();
        let handle =
            unsafe { InterfaceHandle::from_owned(NonNull::new_unchecked(cached.as_raw())) };
        Ok(SosDac::from_handle(self.clone(), handle))
    }

    /// Acquires an arbitrary capability by its compile-time interface identifier.
    ///
    /// Returns `None` when the runtime's DAC does not support the capability; this
    /// is the one query outcome that is not an error. Unlike [`DacLibrary::sos`],
    /// results are not cached - each call issues one query against the primary
    /// interface and each wrapper owns its own reference.
    pub fn acquire<T: DacCapability>(&self) -> Option<T> {
        let ptr = self.inner.dac.query(&T::IID)?;
        Some(T::from_handle(self.clone(), unsafe {
            InterfaceHandle::from_owned(ptr)
        }))
    }

    /// Signals that the target process's state may have changed.
    ///
    /// Forwards to the data-target adapter's invalidation hook; no other state
    /// participates. Call around checkpoints in a longer inspection session.
    pub fn flush(&self) {
        self.inner.data_target.flush();
    }

    /// The shared image claim, present only when this instance loaded the DAC
    /// from a path.
    pub fn image(&self) -> Option<&SharedLibrary> {
        self.inner.image.as_ref()
    }
}

impl fmt::Debug for DacLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DacLibrary")
            .field("primary", &self.inner.dac)
            .field("sos_cached", &self.inner.sos.get().is_some())
            .field("image", &self.inner.image)
            .finish()
    }
}
