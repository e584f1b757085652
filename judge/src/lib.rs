//! This crate owns the compile-once/run-many lifecycle of a judge session: a
//! runtime registry that resolves `(language, version)` requests to an
//! installed descriptor (`registry`), and a job that materializes source
//! files into a sandbox, compiles them once and executes the result against
//! any number of per-test inputs (`job`).

#[macro_use]
extern crate error_chain;
extern crate log;
extern crate sandbox;

pub mod job;
pub mod registry;

error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    links {
        Sandbox(sandbox::Error, sandbox::ErrorKind);
    }

    foreign_links {
        Io(::std::io::Error);
        Base64(::base64::DecodeError);
        Hex(::hex::FromHexError);
    }

    errors {
        RuntimeUnknown(language: String, version_spec: String) {
            description("no installed runtime matches the requested language/version")
            display("no installed runtime matches language {:?} version {:?}", language, version_spec)
        }

        ValidationError(reason: String) {
            description("invalid job input")
            display("invalid job input: {}", reason)
        }

        CompileFailed {
            description("compile stage failed")
        }

        // Reported inline on `StageResult.status` (`TimeLimit`/`MemoryLimit`/
        // `OutputLimit`), not by returning this as an `Err` — named here so
        // the error taxonomy is complete even though the hot path never
        // constructs it.
        LimitExceeded(kind: &'static str) {
            description("a resource limit was exceeded")
            display("{} limit exceeded", kind)
        }

        IllegalJobState(expected: &'static str, actual: &'static str) {
            description("job used from an illegal state")
            display("expected job in state {}, found {}", expected, actual)
        }
    }
}

pub use job::{HostLimits, Job, JobState, LimitSet, SourceEncoding, SourceFile};
pub use registry::{RuntimeDescriptor, RuntimeRegistry, StageLimits};
