// Copyright © 2026 The Guest Memory Plane Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use thiserror::Error;

/// Errors shared by every layer of the guest memory plane.
///
/// Hypervisor-native status codes are translated into this set at the shim
/// boundary; everything above deals only in these variants.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Argument validation failed
    #[error("invalid argument")]
    Invalid,
    /// A descriptor, host page or donated page could not be allocated
    #[error("out of memory")]
    NoMemory,
    /// The hypervisor reported a generic failure or guest memory is not
    /// representable
    #[error("fault")]
    Fault,
    /// Capability or feature not offered by this hypervisor
    #[error("not supported")]
    Unsupported,
    /// Stub path intentionally left un-done
    #[error("not implemented")]
    NotImplemented,
    /// Range misaligned to the relevant granule, or it wraps around
    #[error("bad range")]
    Range,
    /// Reserved for higher layers
    #[error("timed out")]
    Timeout,
    /// The host reported a pending signal while pinning
    #[error("interrupted")]
    Interrupted,
    /// The hypervisor has not been probed yet
    #[error("hypervisor unavailable")]
    Unavailable,
}

pub type Result<T> = std::result::Result<T, Error>;

// Status codes shared with the hypervisor. These values are part of the
// hypercall ABI and must not be renumbered.
pub(crate) const HYP_STATUS_OK: i64 = 0;
pub(crate) const HYP_STATUS_NO_MEMORY: i64 = -5;
pub(crate) const HYP_STATUS_INVALID_ARGS: i64 = -8;
pub(crate) const HYP_STATUS_NOT_SUPPORTED: i64 = -24;
pub(crate) const HYP_STATUS_NOT_IMPLEMENTED: i64 = -27;
pub(crate) const HYP_STATUS_FAULT: i64 = -40;

/// Translate a hypervisor-native status register into the crate error.
pub(crate) fn status_to_result(status: i64) -> Result<()> {
    match status {
        HYP_STATUS_OK => Ok(()),
        HYP_STATUS_NO_MEMORY => Err(Error::NoMemory),
        HYP_STATUS_INVALID_ARGS => Err(Error::Invalid),
        HYP_STATUS_NOT_SUPPORTED => Err(Error::Unsupported),
        HYP_STATUS_NOT_IMPLEMENTED => Err(Error::NotImplemented),
        HYP_STATUS_FAULT => Err(Error::Fault),
        _ => Err(Error::Fault),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(status_to_result(0), Ok(()));
        assert_eq!(status_to_result(-5), Err(Error::NoMemory));
        assert_eq!(status_to_result(-8), Err(Error::Invalid));
        assert_eq!(status_to_result(-24), Err(Error::Unsupported));
        assert_eq!(status_to_result(-27), Err(Error::NotImplemented));
        assert_eq!(status_to_result(-40), Err(Error::Fault));
        // Unknown codes collapse to a generic fault.
        assert_eq!(status_to_result(-999), Err(Error::Fault));
        assert_eq!(status_to_result(1), Err(Error::Fault));
    }
}
