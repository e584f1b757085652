//! This crate implements the sandbox layer of the judge: a pool of disposable
//! execution identities (the "sandbox provisioner", `pool` + `sandboxing`),
//! and an async runner that executes one child process inside a sandbox under
//! a bounded set of resource limits (the "stage runner", `process` + `stage`).
//!
//! Every direct syscall made by the judge lives in this crate. Nothing above
//! it touches `nix` or `libc` directly.
//!

#[macro_use]
extern crate error_chain;
extern crate libc;
extern crate log;
extern crate nix;
extern crate procfs;
extern crate tokio;

mod misc;
mod pool;
mod process;
mod rlimits;
mod sandboxing;
mod stage;

use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub use pool::{IdentityPool, PoolGuard};
pub use process::{ProcessBuilder, ProcessRedirection};
pub use sandboxing::{SandboxHandle, SandboxProvisioner};
pub use stage::{run_stage, StageResult, StageStatus};

error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    foreign_links {
        Io(::std::io::Error);
        Nix(::nix::Error);
    }

    errors {
        PoolExhausted {
            description("sandbox identity pool is exhausted")
        }

        SandboxSetupFailed(reason: String) {
            description("failed to set up sandbox")
            display("failed to set up sandbox: {}", reason)
        }

        InvalidProcessArgument(arg: String) {
            description("invalid argv entry")
            display("invalid argv entry: {:?}", arg)
        }

        InvalidEnvironmentVariable(name: String) {
            description("invalid environment variable")
            display("invalid environment variable: {:?}", name)
        }

        ChildStartupFailed(reason: String) {
            description("failed to launch child process")
            display("failed to launch child process: {}", reason)
        }
    }
}

/// Type for user identities handed out by the [`IdentityPool`].
pub type UserId = u32;

/// Type for group identities handed out by the [`IdentityPool`].
pub type GroupId = u32;

/// Type for process identifiers.
pub type Pid = i32;

/// Measurement of the size of a block of memory.
///
/// Kept distinct from a bare `usize` so call sites read as `MemorySize::MegaBytes(256)`
/// rather than an unlabeled byte count.
#[derive(Clone, Copy, Debug, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MemorySize {
    Bytes(usize),
    KiloBytes(usize),
    MegaBytes(usize),
    GigaBytes(usize),
}

impl MemorySize {
    /// Convert the current measurement to memory size in bytes.
    pub fn bytes(&self) -> usize {
        match self {
            MemorySize::Bytes(s) => *s,
            MemorySize::KiloBytes(s) => s * 1024,
            MemorySize::MegaBytes(s) => s * 1024 * 1024,
            MemorySize::GigaBytes(s) => s * 1024 * 1024 * 1024,
        }
    }
}

impl PartialEq for MemorySize {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl PartialOrd for MemorySize {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemorySize {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bytes().cmp(&other.bytes())
    }
}

impl From<usize> for MemorySize {
    fn from(value: usize) -> MemorySize {
        MemorySize::Bytes(value)
    }
}

impl Display for MemorySize {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MemorySize::Bytes(s) => write!(f, "{} B", s),
            MemorySize::KiloBytes(s) => write!(f, "{} KB", s),
            MemorySize::MegaBytes(s) => write!(f, "{} MB", s),
            MemorySize::GigaBytes(s) => write!(f, "{} GB", s),
        }
    }
}

/// Resource limits applied to a single stage invocation (compile or run).
///
/// Every field is optional; `None` means "do not constrain at this layer",
/// which still leaves any caller-side clamping against configured maxima
/// (see `judge::job::LimitSet`) in effect.
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProcessResourceLimits {
    /// Wall-clock time budget for the child.
    pub wall_time_limit: Option<Duration>,

    /// CPU time budget for the child, enforced both by `RLIMIT_CPU` and by
    /// active monitoring (see `stage::run_stage`).
    pub cpu_time_limit: Option<Duration>,

    /// Address-space budget for the child, enforced by `RLIMIT_AS`.
    pub memory_limit: Option<MemorySize>,

    /// Maximum number of bytes a single output file may grow to, enforced by
    /// `RLIMIT_FSIZE`.
    pub file_size_limit: Option<MemorySize>,

    /// Maximum number of simultaneously open file descriptors.
    pub open_files_limit: Option<u64>,

    /// Maximum number of processes/threads the sandbox identity may own at
    /// once, enforced by `RLIMIT_NPROC`.
    pub process_count_limit: Option<u64>,
}

/// Resource usage statistics sampled for a sandboxed process.
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProcessResourceUsage {
    /// CPU time spent in user mode.
    pub user_cpu_time: Duration,

    /// CPU time spent in kernel mode.
    pub kernel_cpu_time: Duration,

    /// Peak resident set size observed during the run.
    pub peak_memory: MemorySize,
}

impl ProcessResourceUsage {
    pub fn empty() -> ProcessResourceUsage {
        ProcessResourceUsage {
            user_cpu_time: Duration::new(0, 0),
            kernel_cpu_time: Duration::new(0, 0),
            peak_memory: MemorySize::Bytes(0),
        }
    }

    /// Total CPU time consumed, the sum of user and kernel time.
    pub fn cpu_time(&self) -> Duration {
        self.user_cpu_time + self.kernel_cpu_time
    }

    /// Fold in a newer sample, keeping the maximum seen for every field.
    pub fn update(&mut self, other: &ProcessResourceUsage) {
        if other.user_cpu_time > self.user_cpu_time {
            self.user_cpu_time = other.user_cpu_time;
        }
        if other.kernel_cpu_time > self.kernel_cpu_time {
            self.kernel_cpu_time = other.kernel_cpu_time;
        }
        if other.peak_memory > self.peak_memory {
            self.peak_memory = other.peak_memory;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MemorySize;

    #[test]
    fn test_memory_size_to_bytes() {
        assert_eq!(2, MemorySize::Bytes(2).bytes());
        assert_eq!(2 * 1024, MemorySize::KiloBytes(2).bytes());
        assert_eq!(2 * 1024 * 1024, MemorySize::MegaBytes(2).bytes());
        assert_eq!(2 * 1024 * 1024 * 1024, MemorySize::GigaBytes(2).bytes());
    }

    #[test]
    fn test_memory_size_ordering() {
        assert!(MemorySize::MegaBytes(1) > MemorySize::KiloBytes(1));
        assert!(MemorySize::Bytes(2048) == MemorySize::KiloBytes(2));
    }
}
