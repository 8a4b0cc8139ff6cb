//! Kernel error codes.
//!
//! The reference source represents these as small negative integers
//! (`KERNEL_ERR_*`). We keep the exact numbering so that a caller bridging to
//! the supervisor-call ABI (where the return value is a plain `i32` written
//! back into a stacked register) can reuse it directly.

/// An operation outcome. Unlike the many per-operation sub-error enums in
/// `r3_kernel` (`LockMutexError`, `WaitEventGroupTimeoutError`, ...), this
/// core exposes one flat kind, matching the reference source's single
/// `kernel_err_t`: the surface here is small enough that splitting by call
/// site would add ceremony without adding safety.
#[repr(i8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A parameter was out of range or otherwise invalid.
    Param = -1,
    /// The static pool has no free slot.
    NoMem = -2,
    /// A blocking call's timeout elapsed before the condition was met.
    Timeout = -3,
    /// A blocking call was attempted from interrupt context.
    Isr = -4,
    /// The object is not in a state that permits the operation (e.g. it was
    /// reset while the caller was blocked on it).
    State = -5,
    /// The object the caller was waiting on was deleted.
    Deleted = -6,
    /// A bounded resource (queue, semaphore) would exceed its capacity.
    Overflow = -7,
}

impl Error {
    /// The raw numeric code, as returned across the supervisor-call ABI.
    pub const fn code(self) -> i32 {
        self as i8 as i32
    }
}

pub type Result<T> = core::result::Result<T, Error>;
