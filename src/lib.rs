// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(dead_code)]
//#![deny(unsafe_code)]
// - 'target.rs' builds a COM-style callback vtable by hand
// - 'image.rs' round-trips the raw loader handle out of libloading
// - 'dac.rs' invokes resolved entry points through transmuted fn pointers

//! # dacscope
//!
//! A cross-platform loader and lifecycle manager for the .NET data access component
//! (DAC): the native library (`mscordacwks` / `libmscordaccore`) through which a
//! debugger or triage tool inspects a managed process out-of-process. `dacscope`
//! locates the image, drives the runtime's fixed initialization protocol, hands the
//! DAC a caller-provided view of the target process, and manages the resulting
//! capability interfaces with deterministic, leak-free teardown.
//!
//! ## Features
//!
//! - **🔌 Full load protocol** - Platform-abstraction initializer probing, factory
//!   resolution, and primary-interface construction in the order the runtime requires
//! - **🧭 Capability queries** - Interface-identifier based acquisition of the SOS DAC
//!   interface and arbitrary caller-defined capability wrappers
//! - **🧵 Shared image ownership** - Reference-counted claims let independent sessions
//!   keep one loaded image mapped; it unloads exactly once
//! - **🛡️ Exception-safe boundary** - Callbacks never unwind into native code, failed
//!   construction never leaks an image or an interface pointer
//! - **🔧 Cross-platform** - One code path over the platform loader on Linux, macOS,
//!   and Windows
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dacscope::{DacLibrary, DataTarget};
//!
//! # fn open_target() -> Arc<dyn DataTarget> { unimplemented!() }
//! // A DataTarget supplies target-process memory, registers, and module bases.
//! let target: Arc<dyn DataTarget> = open_target();
//!
//! // Load the DAC that matches the target's runtime and acquire capabilities.
//! let dac = DacLibrary::load(target, "/usr/share/dotnet/shared/libmscordaccore.so")?;
//! let sos = dac.sos()?;
//! # Ok::<(), dacscope::Error>(())
//! ```
//!
//! ## Architecture
//!
//! `dacscope` is organized into four layers, leaves first:
//!
//! - [`image`] - the platform-loader seam: [`LoadedImage`], [`NativeImage`], and the
//!   reference-counted [`SharedLibrary`]
//! - [`target`] - the host-side [`DataTarget`] abstraction and [`DacDataTarget`], the
//!   adapter that turns it into the callback table the DAC consumes
//! - [`interfaces`] - ownership and querying of raw interface pointers:
//!   [`InterfaceHandle`], the [`DacCapability`] construction contract, [`SosDac`]
//! - [`dac`] - [`DacLibrary`], the orchestrator that ties the above together and
//!   fixes the teardown order
//!
//! The raw ABI itself - status codes, interface identifiers, export names, entry-point
//! signatures - lives in [`ffi`].
//!
//! ## Error Handling
//!
//! All operations return [`Result<T, Error>`](Result). Native-boundary failures are
//! detected synchronously and never retried; status codes returned by the DAC are
//! preserved verbatim:
//!
//! ```rust,no_run
//! use dacscope::{DacLibrary, Error};
//! # use std::sync::Arc;
//! # fn open_target() -> Arc<dyn dacscope::DataTarget> { unimplemented!() }
//!
//! match DacLibrary::load(open_target(), "/path/to/libmscordaccore.so") {
//!     Ok(dac) => println!("DAC loaded"),
//!     Err(Error::Diagnostics { message, status }) => {
//!         eprintln!("load failed: {message} (status {status:?})");
//!     }
//!     Err(e) => eprintln!("error: {e}"),
//! }
//! ```

#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit-tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust,no_run
/// use dacscope::prelude::*;
/// # use std::sync::Arc;
/// # fn open_target() -> Arc<dyn DataTarget> { unimplemented!() }
///
/// let dac = DacLibrary::load(open_target(), "/path/to/libmscordaccore.so")?;
/// # Ok::<(), dacscope::Error>(())
/// ```
pub mod prelude;

pub mod dac;
pub mod ffi;
pub mod image;
pub mod interfaces;
pub mod target;

/// `dacscope` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always
/// [`Error`]. This is used consistently throughout the crate for all fallible
/// operations.
pub type Result<T> = std::result::Result<T, Error>;

/// `dacscope` Error type
///
/// The main error type for all operations in this crate. The taxonomy covers
/// invalid caller input, native-boundary failures (with preserved status codes),
/// and unsupported optional interfaces.
pub use error::Error;

/// Main entry point for loading a DAC and deriving capability interfaces from it.
pub use dac::DacLibrary;

/// Shared ownership of a loaded DAC image, plus the loader seam it is built on.
pub use image::{LoadedImage, NativeImage, SharedLibrary};

/// Interface-pointer ownership and the capability construction contract.
pub use interfaces::{DacCapability, InterfaceHandle, SosDac};

/// The host data-target abstraction and its native callback-table adapter.
pub use target::{DacDataTarget, DataTarget};
