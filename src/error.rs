//! ABI-level error codes returned (negated) from hypercalls.

use int_enum::IntEnum;

/// Error codes a hypercall can return, negated into the raw ABI word by
/// [`crate::hypercall::hypercall`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntEnum)]
#[repr(i64)]
pub enum HvError {
    /// Non-root caller attempted a management operation, or a reconfiguration was
    /// blocked by a sibling cell in `RUNNING_LOCKED`, or a target cell refused a
    /// shutdown request.
    Perm = 1,
    /// Unknown cell id.
    NoEnt = 2,
    /// Root cell named as a target, a malformed memory region, an unknown info
    /// kind, or an out-of-range CPU id.
    Invalid = 3,
    /// Duplicate cell name.
    Exist = 4,
    /// Requested CPU-set overlaps the caller or escapes root's current CPU-set.
    Busy = 5,
    /// Allocation failure.
    Oom = 6,
    /// Configuration exceeds the temporary mapping window, or a CPU-set exceeds
    /// one page.
    TooBig = 7,
    /// Unknown hypercall code.
    NoSys = 8,
}

impl HvError {
    /// Human-readable description, for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            HvError::Perm => "permission denied",
            HvError::NoEnt => "no such cell",
            HvError::Invalid => "invalid argument",
            HvError::Exist => "cell already exists",
            HvError::Busy => "cpu-set busy",
            HvError::Oom => "out of memory",
            HvError::TooBig => "argument too large",
            HvError::NoSys => "no such hypercall",
        }
    }

    /// Negates the code into the raw signed-word ABI return value.
    pub fn to_raw(self) -> i64 {
        -(self as i64)
    }
}

impl core::fmt::Display for HvError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type HvResult<T = ()> = Result<T, HvError>;
