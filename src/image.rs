//! Loading and shared ownership of the native DAC image.
//!
//! This module is the seam between the crate and the platform loader. [`LoadedImage`]
//! abstracts one loaded library image (symbol resolution plus the opaque handle its
//! entry points expect), [`NativeImage`] implements it over the operating system's
//! loader, and [`SharedLibrary`] layers reference-counted shared ownership on top so
//! several inspection sessions can keep one image mapped.
//!
//! The image handle is valid for exactly the interval between load and the release of
//! the last owner; no symbol resolved from it may be invoked outside that interval.
//! Capability wrappers uphold this by keeping their owning [`crate::DacLibrary`] -
//! and therefore its [`SharedLibrary`] claim - alive.

use std::{ffi::c_void, fmt, path::Path, sync::Arc};

use tracing::{debug, trace};

use crate::{ffi::RawSymbol, Result};

#[cfg(unix)]
use libloading::os::unix::Library as OsLibrary;
#[cfg(windows)]
use libloading::os::windows::Library as OsLibrary;

/// One loaded native library image.
///
/// Implementations resolve exports by name and expose the opaque handle that is passed
/// to `DllMain`-shaped entry points. Unloading is tied to `Drop`; the trait has no
/// explicit unload operation so an image can never be freed while a resolver still
/// holds it.
pub trait LoadedImage: Send + Sync {
    /// Resolves an export by name.
    ///
    /// Returns `None` when the image does not carry the export. Absence is an ordinary
    /// lookup miss, not an error; the caller decides whether a missing export is fatal.
    fn resolve(&self, symbol: &str) -> Option<RawSymbol>;

    /// The opaque image handle handed to the image's own entry points.
    fn base(&self) -> *mut c_void;
}

/// A [`LoadedImage`] backed by the operating system's library loader.
pub struct NativeImage {
    library: OsLibrary,
    handle: *mut c_void,
}

// The raw handle is a plain copy of the loader handle owned by `library`; all
// loader access goes through the owned library.
unsafe impl Send for NativeImage {}
unsafe impl Sync for NativeImage {}

impl NativeImage {
    /// Loads the library image at `path`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Diagnostics`] wrapping the loader's message when the
    /// file is missing or is not a loadable image for this platform.
    pub fn load(path: &Path) -> Result<NativeImage> {
        let library = match unsafe { OsLibrary::new(path) } {
            Ok(library) => library,
            Err(error) => {
                return Err(diagnostics_error!(
                    "failed to load {}: {error}",
                    path.display()
                ))
            }
        };

        // libloading only hands out the raw handle by consuming the library, so
        // round-trip it once and keep both.
        let handle = library.into_raw();
        let library = unsafe { OsLibrary::from_raw(handle) };

        debug!(path = %path.display(), "loaded DAC image");
        Ok(NativeImage {
            library,
            handle: handle as *mut c_void,
        })
    }
}

impl LoadedImage for NativeImage {
    fn resolve(&self, symbol: &str) -> Option<RawSymbol> {
        let address = unsafe { self.library.get::<*mut c_void>(symbol.as_bytes()) }
            .ok()
            .map(|export| *export as RawSymbol);

        trace!(symbol, resolved = address.is_some(), "export lookup");
        address
    }

    fn base(&self) -> *mut c_void {
        self.handle
    }
}

impl Drop for NativeImage {
    fn drop(&mut self) {
        debug!("unloading DAC image");
    }
}

/// Reference-counted shared ownership of one loaded image.
///
/// Cloning acquires a claim, dropping releases it, and the image is unloaded exactly
/// once, when the last claim is released. The count is atomic; independent sessions
/// may acquire and release claims concurrently.
#[derive(Clone)]
pub struct SharedLibrary {
    image: Arc<dyn LoadedImage>,
}

impl SharedLibrary {
    /// Loads the image at `path` and takes the first ownership claim on it.
    ///
    /// # Errors
    /// Returns [`crate::Error::Diagnostics`] when the platform loader rejects the path.
    pub fn load(path: &Path) -> Result<SharedLibrary> {
        Ok(SharedLibrary::from_image(Arc::new(NativeImage::load(
            path,
        )?)))
    }

    /// Wraps an already-loaded image, e.g. one produced by a custom loader.
    pub fn from_image(image: Arc<dyn LoadedImage>) -> SharedLibrary {
        SharedLibrary { image }
    }

    /// Resolves an export by name from the owned image.
    pub fn resolve(&self, symbol: &str) -> Option<RawSymbol> {
        self.image.resolve(symbol)
    }

    /// The opaque image handle of the owned image.
    pub fn base(&self) -> *mut c_void {
        self.image.base()
    }

    /// Number of live ownership claims on the image, including this one.
    pub fn owners(&self) -> usize {
        Arc::strong_count(&self.image)
    }
}

impl fmt::Debug for SharedLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedLibrary")
            .field("base", &self.image.base())
            .field("owners", &self.owners())
            .finish()
    }
}
