//! Kernel error codes
//!
//! The error kinds surfaced at the core boundary. Syscall replies carry the
//! numeric code; kernel-internal callers match on the variant.

/// Errors reported by kernel operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum KernError {
    /// Malformed syscall or capability mismatch
    InvArgs = 1,
    /// Access without a valid memory capability
    NoPerm = 2,
    /// Placement could not find a PE
    NoFreePe = 3,
    /// Capability selector pool exhausted
    OutOfCaps = 4,
    /// VPE id pool exhausted
    OutOfVpes = 5,
    /// MemoryMap allocation failed
    OutOfSpace = 6,
    /// DTU command aborted
    Abort = 7,
    /// The addressed VPE no longer exists
    VpeGone = 8,
    /// No service registered under the given name
    NoSuchService = 9,
    /// Boot module or app image is not a loadable ELF
    InvElf = 10,
}

impl KernError {
    /// Numeric code for syscall replies
    pub fn code(self) -> u64 {
        self as u64
    }
}

/// Result type for kernel operations
pub type KernResult<T> = Result<T, KernError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(KernError::InvArgs.code(), 1);
        assert_eq!(KernError::OutOfSpace.code(), 6);
        let r: KernResult<()> = Err(KernError::NoFreePe);
        assert_eq!(r.unwrap_err(), KernError::NoFreePe);
    }
}
