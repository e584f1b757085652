//! The runtime registry adapter (C5): resolves `(language, version)` requests
//! against an installed set of runtimes.
//!
//! This crate does not own package install/uninstall — that catalog lives
//! outside the judge session engine. What lives here is the resolution
//! contract itself plus a small built-in table that
//! stands in for that external catalog so the rest of the crate has
//! something real to resolve against.

use crate::{ErrorKind, Result};

/// Per-stage default limits carried by a [`RuntimeDescriptor`].
///
/// A value of `0` means "unbounded at the configured layer"; the engine's
/// configured maxima are the only thing capping such a runtime.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StageLimits {
    pub timeout_ms: u64,
    pub cpu_time_ms: u64,
    pub memory_bytes: u64,
}

impl StageLimits {
    pub const UNBOUNDED: StageLimits = StageLimits {
        timeout_ms: 0,
        cpu_time_ms: 0,
        memory_bytes: 0,
    };
}

/// An immutable, installed runtime: a language/version pair together with
/// the commands and default limits a `Job` needs to compile and run it.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RuntimeDescriptor {
    pub language: String,
    pub version: String,
    pub aliases: Vec<String>,
    pub compiled: bool,

    /// Absent iff `compiled` is false.
    pub compile_cmd: Option<Vec<String>>,
    pub run_cmd: Vec<String>,

    /// Name a submitted file is materialized under when its own `name` is
    /// absent, following this runtime's own filename convention.
    pub default_source_name: String,

    pub compile_limits: StageLimits,
    pub run_limits: StageLimits,

    /// Monotonically increasing install order, used to break version ties
    /// in `resolve`.
    pub install_order: u64,
}

impl RuntimeDescriptor {
    fn matches_name(&self, language: &str) -> bool {
        self.language.eq_ignore_ascii_case(language)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(language))
    }
}

/// A holder of installed [`RuntimeDescriptor`]s, queried by `(language,
/// version_spec)`.
pub struct RuntimeRegistry {
    runtimes: Vec<RuntimeDescriptor>,
    next_install_order: u64,
}

impl RuntimeRegistry {
    pub fn new() -> RuntimeRegistry {
        RuntimeRegistry {
            runtimes: Vec::new(),
            next_install_order: 0,
        }
    }

    /// The in-memory stand-in for the external runtime catalog: a python
    /// interpreter, a gcc/g++ toolchain, a javac/java pair, and the `file`
    /// sentinel used for raw-fixture jobs that carry no source text.
    pub fn with_builtins() -> RuntimeRegistry {
        let mut registry = RuntimeRegistry::new();

        registry.install(RuntimeDescriptor {
            language: "python".to_owned(),
            version: "3".to_owned(),
            aliases: vec!["python3".to_owned(), "py".to_owned()],
            compiled: false,
            compile_cmd: None,
            run_cmd: vec!["python3".to_owned(), "main.py".to_owned()],
            default_source_name: "main.py".to_owned(),
            compile_limits: StageLimits::UNBOUNDED,
            run_limits: StageLimits {
                timeout_ms: 5_000,
                cpu_time_ms: 2_000,
                memory_bytes: 256 * 1024 * 1024,
            },
            install_order: 0,
        });

        registry.install(RuntimeDescriptor {
            language: "cpp".to_owned(),
            version: "17".to_owned(),
            aliases: vec!["c++".to_owned(), "gcc".to_owned(), "g++".to_owned()],
            compiled: true,
            compile_cmd: Some(vec![
                "g++".to_owned(),
                "-O2".to_owned(),
                "-std=c++17".to_owned(),
                "-o".to_owned(),
                "main".to_owned(),
                "main.cpp".to_owned(),
            ]),
            run_cmd: vec!["./main".to_owned()],
            default_source_name: "main.cpp".to_owned(),
            compile_limits: StageLimits {
                timeout_ms: 10_000,
                cpu_time_ms: 10_000,
                memory_bytes: 512 * 1024 * 1024,
            },
            run_limits: StageLimits {
                timeout_ms: 5_000,
                cpu_time_ms: 2_000,
                memory_bytes: 256 * 1024 * 1024,
            },
            install_order: 0,
        });

        registry.install(RuntimeDescriptor {
            language: "java".to_owned(),
            version: "17".to_owned(),
            aliases: vec!["javac".to_owned()],
            compiled: true,
            compile_cmd: Some(vec!["javac".to_owned(), "Main.java".to_owned()]),
            run_cmd: vec!["java".to_owned(), "Main".to_owned()],
            default_source_name: "Main.java".to_owned(),
            compile_limits: StageLimits {
                timeout_ms: 15_000,
                cpu_time_ms: 15_000,
                memory_bytes: 512 * 1024 * 1024,
            },
            run_limits: StageLimits {
                timeout_ms: 8_000,
                cpu_time_ms: 4_000,
                memory_bytes: 512 * 1024 * 1024,
            },
            install_order: 0,
        });

        // The `file` sentinel: an uncompiled pseudo-language for jobs that
        // submit a raw fixture rather than source text. Its run command is
        // filled in per-job by the caller since there is no fixed filename
        // to `cat`.
        registry.install(RuntimeDescriptor {
            language: "file".to_owned(),
            version: "*".to_owned(),
            aliases: Vec::new(),
            compiled: false,
            compile_cmd: None,
            run_cmd: vec!["cat".to_owned()],
            default_source_name: "data".to_owned(),
            compile_limits: StageLimits::UNBOUNDED,
            run_limits: StageLimits {
                timeout_ms: 5_000,
                cpu_time_ms: 2_000,
                memory_bytes: 128 * 1024 * 1024,
            },
            install_order: 0,
        });

        registry
    }

    /// Install a runtime, stamping it with the next install-order token.
    pub fn install(&mut self, mut descriptor: RuntimeDescriptor) {
        descriptor.install_order = self.next_install_order;
        self.next_install_order += 1;
        self.runtimes.push(descriptor);
    }

    /// Resolve `(language, version_spec)` to a runtime.
    ///
    /// `version_spec` of `"*"` or `""` means "latest compatible"; otherwise
    /// it must equal the descriptor's `version` exactly. Among matches, the
    /// highest version wins; ties are broken by later install order.
    pub fn resolve(&self, language: &str, version_spec: &str) -> Result<RuntimeDescriptor> {
        let mut candidates: Vec<&RuntimeDescriptor> = self
            .runtimes
            .iter()
            .filter(|r| r.matches_name(language))
            .filter(|r| version_matches(&r.version, version_spec))
            .collect();

        candidates.sort_by(|a, b| {
            compare_versions(&a.version, &b.version).then(a.install_order.cmp(&b.install_order))
        });

        candidates
            .pop()
            .cloned()
            .ok_or_else(|| ErrorKind::RuntimeUnknown(language.to_owned(), version_spec.to_owned()).into())
    }

    pub fn len(&self) -> usize {
        self.runtimes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runtimes.is_empty()
    }
}

impl Default for RuntimeRegistry {
    fn default() -> RuntimeRegistry {
        RuntimeRegistry::new()
    }
}

fn version_matches(version: &str, spec: &str) -> bool {
    spec.is_empty() || spec == "*" || spec == version
}

/// Compare two dotted numeric version strings component-wise
/// (`"3.10" > "3.9"`), falling back to a lexicographic comparison for any
/// non-numeric component so non-semver tags (`"17"`, `"latest"`) still order
/// deterministically rather than panicking.
fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let mut a_parts = a.split('.');
    let mut b_parts = b.split('.');

    loop {
        match (a_parts.next(), b_parts.next()) {
            (None, None) => return std::cmp::Ordering::Equal,
            (None, Some(_)) => return std::cmp::Ordering::Less,
            (Some(_), None) => return std::cmp::Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(x), Ok(y)) => x.cmp(&y),
                    _ => x.cmp(y),
                };
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_by_alias() {
        let registry = RuntimeRegistry::with_builtins();
        let descriptor = registry.resolve("python3", "*").expect("resolves");
        assert_eq!("python", descriptor.language);
    }

    #[test]
    fn test_resolve_unknown_language() {
        let registry = RuntimeRegistry::with_builtins();
        assert!(registry.resolve("brainfuck", "*").is_err());
    }

    #[test]
    fn test_resolve_picks_highest_version() {
        let mut registry = RuntimeRegistry::new();
        registry.install(RuntimeDescriptor {
            language: "cpp".to_owned(),
            version: "14".to_owned(),
            aliases: Vec::new(),
            compiled: true,
            compile_cmd: Some(vec!["g++".to_owned()]),
            run_cmd: vec!["./main".to_owned()],
            default_source_name: "main.cpp".to_owned(),
            compile_limits: StageLimits::UNBOUNDED,
            run_limits: StageLimits::UNBOUNDED,
            install_order: 0,
        });
        registry.install(RuntimeDescriptor {
            language: "cpp".to_owned(),
            version: "17".to_owned(),
            aliases: Vec::new(),
            compiled: true,
            compile_cmd: Some(vec!["g++".to_owned()]),
            run_cmd: vec!["./main".to_owned()],
            default_source_name: "main.cpp".to_owned(),
            compile_limits: StageLimits::UNBOUNDED,
            run_limits: StageLimits::UNBOUNDED,
            install_order: 0,
        });

        let resolved = registry.resolve("cpp", "*").expect("resolves");
        assert_eq!("17", resolved.version);
    }

    #[test]
    fn test_resolve_ties_break_by_later_install_order() {
        let mut registry = RuntimeRegistry::new();
        for _ in 0..2 {
            registry.install(RuntimeDescriptor {
                language: "cpp".to_owned(),
                version: "17".to_owned(),
                aliases: Vec::new(),
                compiled: true,
                compile_cmd: Some(vec!["g++".to_owned()]),
                run_cmd: vec!["./main".to_owned()],
                default_source_name: "main.cpp".to_owned(),
                compile_limits: StageLimits::UNBOUNDED,
                run_limits: StageLimits::UNBOUNDED,
                install_order: 0,
            });
        }

        let resolved = registry.resolve("cpp", "17").expect("resolves");
        assert_eq!(1, resolved.install_order);
    }

    #[test]
    fn test_file_sentinel_is_uncompiled() {
        let registry = RuntimeRegistry::with_builtins();
        let descriptor = registry.resolve("file", "*").expect("resolves");
        assert!(!descriptor.compiled);
        assert!(descriptor.compile_cmd.is_none());
    }
}
