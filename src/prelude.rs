//! Convenient re-exports of the most commonly used types and traits.
//!
//! This module provides a curated selection of the most frequently used types
//! from across the dacscope library, allowing for convenient glob imports.
//!
//! # Example
//!
//! ```rust,no_run
//! use dacscope::prelude::*;
//! # use std::sync::Arc;
//! # fn open_target() -> Arc<dyn DataTarget> { unimplemented!() }
//!
//! let dac = DacLibrary::load(open_target(), "/path/to/libmscordaccore.so")?;
//! let sos = dac.sos()?;
//! # Ok::<(), Error>(())
//! ```

pub use crate::{
    dac::DacLibrary,
    error::Error,
    ffi::{HResult, IID_ISOS_DAC_INTERFACE, IID_IXCLR_DATA_PROCESS, S_OK},
    image::{LoadedImage, NativeImage, SharedLibrary},
    interfaces::{DacCapability, InterfaceHandle, SosDac},
    target::{DacDataTarget, DataTarget},
    Result,
};
