use thiserror::Error;

use crate::ffi::HResult;

macro_rules! diagnostics_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Diagnostics {
            message: $msg.to_string(),
            status: None,
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Diagnostics {
            message: format!($fmt, $($arg)*),
            status: None,
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// This enum covers all failure modes of loading a data access component and acquiring
/// its capability interfaces. Every native-boundary failure is detected synchronously at
/// the call site and converted into one of these variants; nothing is swallowed or retried,
/// since a partially initialized DAC image cannot be rolled back and re-attempted.
///
/// # Error Categories
///
/// - [`Error::InvalidArgument`] - Missing or malformed caller input
/// - [`Error::Diagnostics`] - Native-boundary failure (load, export resolution, factory status)
/// - [`Error::UnsupportedInterface`] - An optional capability is absent on this runtime
#[derive(Error, Debug)]
pub enum Error {
    /// A required input was missing or malformed.
    ///
    /// Raised when a caller hands this crate a null interface pointer or a handle
    /// that does not represent a native interface reference.
    #[error("{0}")]
    InvalidArgument(String),

    /// A failure at the native DAC boundary.
    ///
    /// Covers every way the load protocol can go wrong: the image cannot be loaded,
    /// a mandatory export is missing, the factory entry point reports a nonzero
    /// status, or the inspected process is not a recognized managed process.
    ///
    /// # Fields
    ///
    /// * `message` - Human-readable description; includes the formatted status code
    ///   when one was returned by native code
    /// * `status` - The raw `HRESULT` where the failure carried one, preserved
    ///   verbatim for diagnostics
    #[error("{message}")]
    Diagnostics {
        /// The message to be printed for the Diagnostics error
        message: String,
        /// The native status code that caused this error, if one was returned
        status: Option<HResult>,
    },

    /// The runtime's DAC does not implement the requested optional interface.
    ///
    /// Raised when an interface-identifier query against the primary capability
    /// yields no pointer. The query cannot be retried with a different identifier;
    /// the runtime simply does not support the capability.
    #[error("this runtime does not support {0}")]
    UnsupportedInterface(&'static str),
}

impl Error {
    /// Builds a [`Error::Diagnostics`] for a native call that returned a nonzero status.
    ///
    /// The status code is formatted into the message and preserved in the `status`
    /// field so callers can match on the exact `HRESULT`.
    pub(crate) fn dac_status(context: &str, status: HResult) -> Error {
        Error::Diagnostics {
            message: format!("{context} failed with status {:#010x}", status as u32),
            status: Some(status),
        }
    }
}
