//! The job (C3): owns one compile+run lifecycle on top of a sandbox.

use sandbox::{run_stage, ProcessResourceLimits, SandboxHandle, SandboxProvisioner};

use crate::registry::{RuntimeDescriptor, StageLimits};
use crate::{Error, ErrorKind, Result, ResultExt};

/// How a [`SourceFile`]'s `content` is encoded on the wire.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum SourceEncoding {
    Utf8,
    Base64,
    Hex,
}

impl Default for SourceEncoding {
    fn default() -> SourceEncoding {
        SourceEncoding::Utf8
    }
}

/// One file submitted as part of a job.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SourceFile {
    pub name: Option<String>,
    pub content: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub encoding: SourceEncoding,
}

impl SourceFile {
    /// Decode `content` per `encoding` into the bytes that should be written
    /// to disk.
    pub fn decode(&self) -> Result<Vec<u8>> {
        match self.encoding {
            SourceEncoding::Utf8 => Ok(self.content.clone().into_bytes()),
            SourceEncoding::Base64 => Ok(base64::decode(&self.content)?),
            SourceEncoding::Hex => Ok(hex::decode(&self.content)?),
        }
    }

    fn is_utf8(&self) -> bool {
        self.encoding == SourceEncoding::Utf8
    }
}

/// Per-stage resource overrides. Every field is either unset (inherit the
/// runtime's configured default) or a non-negative number that must not
/// exceed the runtime's configured maximum for that stage.
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LimitSet {
    pub timeout_ms: Option<u64>,
    pub cpu_time_ms: Option<u64>,
    pub memory_bytes: Option<u64>,
}

impl LimitSet {
    /// Resolve this override set against the runtime's configured stage
    /// limits, clamping any provided value to the configured maximum: the
    /// effective limit applied is `min(requested, configured)`.
    ///
    /// A configured maximum of `0` means unbounded, so an override is
    /// accepted verbatim in that case. Returns an error if an override
    /// exceeds a *nonzero* configured maximum — validation is expected to
    /// have already rejected that at `init` time, but `Job` re-checks here
    /// since it has no other opportunity to see per-test overrides before
    /// they reach the stage runner.
    pub fn resolve(&self, configured: &StageLimits) -> Result<ProcessResourceLimits> {
        let timeout_ms = clamp(self.timeout_ms, configured.timeout_ms)?;
        let cpu_time_ms = clamp(self.cpu_time_ms, configured.cpu_time_ms)?;
        let memory_bytes = clamp(self.memory_bytes, configured.memory_bytes)?;

        Ok(ProcessResourceLimits {
            wall_time_limit: timeout_ms.map(std::time::Duration::from_millis),
            cpu_time_limit: cpu_time_ms.map(std::time::Duration::from_millis),
            memory_limit: memory_bytes.map(|b| sandbox::MemorySize::Bytes(b as usize)),
            file_size_limit: None,
            open_files_limit: None,
            process_count_limit: None,
        })
    }
}

fn clamp(requested: Option<u64>, configured_max: u64) -> Result<Option<u64>> {
    match requested {
        None => Ok(if configured_max == 0 { None } else { Some(configured_max) }),
        Some(v) if configured_max == 0 || v <= configured_max => Ok(Some(v)),
        Some(v) => bail!(ErrorKind::ValidationError(format!(
            "requested limit {} exceeds configured maximum {}",
            v, configured_max
        ))),
    }
}

/// Host-wide process limits that apply to every stage invocation of a job
/// regardless of per-test overrides (`MAX_PROCESS_COUNT`, `MAX_OPEN_FILES`,
/// `MAX_FILE_SIZE`, `DISABLE_NETWORKING`). Unlike
/// [`LimitSet`]'s timeout/CPU-time/memory triple, the protocol grammar gives
/// clients no way to override these per-request, so they flow straight from
/// engine configuration into every `ProcessResourceLimits` this job builds.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostLimits {
    pub process_count_limit: Option<u64>,
    pub open_files_limit: Option<u64>,
    pub file_size_limit: Option<u64>,
    pub allow_networking: bool,
}

/// Lifecycle state of a [`Job`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobState {
    New,
    Primed,
    Compiled,
    Failed,
    Closed,
}

impl JobState {
    fn as_str(&self) -> &'static str {
        match self {
            JobState::New => "New",
            JobState::Primed => "Primed",
            JobState::Compiled => "Compiled",
            JobState::Failed => "Failed",
            JobState::Closed => "Closed",
        }
    }
}

/// Outcome of [`Job::compile_only`].
pub struct CompileResult {
    pub success: bool,
    pub wall_time_ms: u64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// The result of a single [`Job::run_test`] call. Field names mirror
/// `sandbox::StageResult`.
pub type TestResult = sandbox::StageResult;

/// Aggregated outcome of [`Job::run_batch`].
pub struct BatchResult {
    pub results: Vec<TestResult>,
    pub total_time_ms: u64,
    pub total_cpu_time_ms: u64,
    pub memory_bytes: u64,
    pub success: bool,
    pub stderr: Vec<u8>,
}

/// Exclusive owner of one [`SandboxHandle`] for its lifetime: materializes
/// source, compiles once, runs any number of tests against the post-compile
/// snapshot, and releases its sandbox exactly once on cleanup.
pub struct Job<'a> {
    pub uuid: uuid::Uuid,
    pub runtime: RuntimeDescriptor,
    pub files: Vec<SourceFile>,
    pub compile_limits: LimitSet,
    pub run_limits: LimitSet,
    pub host_limits: HostLimits,

    state: JobState,
    sandbox: Option<SandboxHandle<'a>>,
    provisioner: &'a SandboxProvisioner,
    output_cap: usize,
}

impl<'a> Job<'a> {
    pub fn new(
        runtime: RuntimeDescriptor,
        files: Vec<SourceFile>,
        compile_limits: LimitSet,
        run_limits: LimitSet,
        provisioner: &'a SandboxProvisioner,
        output_cap: usize,
    ) -> Job<'a> {
        Job::with_host_limits(
            runtime,
            files,
            compile_limits,
            run_limits,
            HostLimits::default(),
            provisioner,
            output_cap,
        )
    }

    pub fn with_host_limits(
        runtime: RuntimeDescriptor,
        files: Vec<SourceFile>,
        compile_limits: LimitSet,
        run_limits: LimitSet,
        host_limits: HostLimits,
        provisioner: &'a SandboxProvisioner,
        output_cap: usize,
    ) -> Job<'a> {
        Job {
            uuid: uuid::Uuid::new_v4(),
            runtime,
            files,
            compile_limits,
            run_limits,
            host_limits,
            state: JobState::New,
            sandbox: None,
            provisioner,
            output_cap,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    fn require_state(&self, expected: JobState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            bail!(ErrorKind::IllegalJobState(expected.as_str(), self.state.as_str()));
        }
    }

    /// `New -> Primed`: acquire a sandbox and materialize every source file
    /// into it, honoring each file's encoding and assigning the runtime's
    /// conventional name to any file that didn't bring its own.
    pub async fn prime(&mut self) -> Result<()> {
        self.require_state(JobState::New)?;

        if !self.has_utf8_file() && self.runtime.language != "file" {
            bail!(ErrorKind::ValidationError(
                "no utf8 file present for a non-`file` runtime".to_owned()
            ));
        }

        let sandbox = self.provisioner.acquire().await?;

        if let Err(e) = self.materialize(&sandbox).await {
            self.provisioner.release(sandbox).await;
            self.state = JobState::Failed;
            return Err(e);
        }

        self.sandbox = Some(sandbox);
        self.state = JobState::Primed;
        Ok(())
    }

    fn has_utf8_file(&self) -> bool {
        self.files.iter().any(SourceFile::is_utf8)
    }

    async fn materialize(&self, sandbox: &SandboxHandle<'_>) -> Result<()> {
        for (index, file) in self.files.iter().enumerate() {
            let name = file
                .name
                .clone()
                .unwrap_or_else(|| self.fallback_name(index));
            let bytes = file.decode()?;
            let path = sandbox.working_dir().join(&name);
            tokio::fs::write(&path, &bytes)
                .await
                .chain_err(|| format!("failed to write job file {:?}", name))?;

            // The file was written by this process's own identity; hand it
            // to the sandbox identity so the compiled/run stage (which drops
            // to that uid/gid before exec) can read and, for a compile
            // stage's sources, overwrite it.
            sandbox
                .chown_to_sandbox(&path)
                .chain_err(|| format!("failed to chown job file {:?} to sandbox identity", name))?;
        }
        Ok(())
    }

    /// Deterministic name for a file that didn't bring its own: the
    /// runtime's conventional source name for the first file, then an
    /// indexed fallback for any further nameless file.
    fn fallback_name(&self, index: usize) -> String {
        if index == 0 {
            self.runtime.default_source_name.clone()
        } else {
            format!("extra-{}", index)
        }
    }

    /// `Primed -> Compiled | Failed`.
    pub async fn compile_only(&mut self) -> Result<CompileResult> {
        self.require_state(JobState::Primed)?;

        if !self.runtime.compiled {
            self.state = JobState::Compiled;
            self.lock_sandbox_working_dir().await?;
            return Ok(CompileResult {
                success: true,
                wall_time_ms: 0,
                stdout: Vec::new(),
                stderr: Vec::new(),
            });
        }

        let compile_cmd = self
            .runtime
            .compile_cmd
            .clone()
            .expect("compiled runtime always carries a compile_cmd");
        let limits = self.compile_limits.resolve(&self.runtime.compile_limits)?;
        let sandbox = self.sandbox.as_ref().expect("primed job owns a sandbox");

        let result = self.run_stage_in_sandbox(sandbox, &compile_cmd, &[], limits).await?;

        let success = result.exit_code == Some(0) && result.signal.is_none();
        self.state = if success { JobState::Compiled } else { JobState::Failed };

        // From here on the working directory holds the compiled artifact
        // (or the already-materialized source for an interpreted runtime);
        // lock it down so no run stage can leave residue another test in
        // this job would see. Only `tmp_dir()` stays writable.
        if success {
            self.lock_sandbox_working_dir().await?;
        }

        Ok(CompileResult {
            success,
            wall_time_ms: result.wall_time_ms,
            stdout: result.stdout,
            stderr: result.stderr,
        })
    }

    /// Requires `state = Compiled`. Runs the run command against `stdin`
    /// with `overrides` applied atop the job's run `LimitSet`.
    pub async fn run_test(&mut self, stdin: &[u8], overrides: LimitSet) -> Result<TestResult> {
        self.require_state(JobState::Compiled)?;

        let effective = LimitSet {
            timeout_ms: overrides.timeout_ms.or(self.run_limits.timeout_ms),
            cpu_time_ms: overrides.cpu_time_ms.or(self.run_limits.cpu_time_ms),
            memory_bytes: overrides.memory_bytes.or(self.run_limits.memory_bytes),
        };
        let limits = effective.resolve(&self.runtime.run_limits)?;

        let run_cmd = self.run_command();
        let sandbox = self.sandbox.as_ref().expect("compiled job owns a sandbox");

        // The working directory was locked read-only after compiling;
        // `tmp_dir()` is the one place a test can still write, and it must
        // start empty for every case so one test can't see another's files.
        sandbox
            .reset_tmp_dir()
            .await
            .chain_err(|| "failed to reset sandbox tmp dir before running a test")?;

        self.run_stage_in_sandbox(sandbox, &run_cmd, stdin, limits).await
    }

    /// Equivalent to calling `run_test` once per case, reported as one
    /// aggregated message.
    pub async fn run_batch(&mut self, cases: &[Vec<u8>], overrides: LimitSet) -> Result<BatchResult> {
        if cases.is_empty() {
            bail!(ErrorKind::ValidationError("run_batch requires a non-empty case list".to_owned()));
        }

        let mut results = Vec::with_capacity(cases.len());
        let mut total_time_ms = 0u64;
        let mut total_cpu_time_ms = 0u64;
        let mut memory_bytes = 0u64;
        let mut success = true;
        let mut stderr = Vec::new();

        for stdin in cases {
            let result = self.run_test(stdin, overrides).await?;

            total_time_ms += result.wall_time_ms;
            total_cpu_time_ms += result.cpu_time_ms;
            memory_bytes = memory_bytes.max(result.memory_bytes);
            success &= result.exit_code == Some(0) && result.signal.is_none();
            if stderr.is_empty() && !result.stderr.is_empty() {
                stderr = result.stderr.clone();
            }

            results.push(result);
        }

        Ok(BatchResult {
            results,
            total_time_ms,
            total_cpu_time_ms,
            memory_bytes,
            success,
            stderr,
        })
    }

    async fn lock_sandbox_working_dir(&self) -> Result<()> {
        let sandbox = self.sandbox.as_ref().expect("compiled job owns a sandbox");
        sandbox
            .lock_working_dir()
            .await
            .chain_err(|| "failed to lock sandbox working dir after compiling")
    }

    fn run_command(&self) -> Vec<String> {
        if self.runtime.language == "file" {
            let name = self
                .files
                .first()
                .and_then(|f| f.name.clone())
                .unwrap_or_else(|| self.fallback_name(0));
            let mut cmd = self.runtime.run_cmd.clone();
            cmd.push(name);
            cmd
        } else {
            self.runtime.run_cmd.clone()
        }
    }

    async fn run_stage_in_sandbox(
        &self,
        sandbox: &SandboxHandle<'_>,
        argv: &[String],
        stdin: &[u8],
        mut limits: ProcessResourceLimits,
    ) -> Result<TestResult> {
        let (program, args) = argv.split_first().ok_or_else(|| {
            Error::from(ErrorKind::ValidationError("runtime command is empty".to_owned()))
        })?;

        // The host-wide caps are not part of `LimitSet` since the protocol
        // never lets a client override them per-request; fold them into
        // every stage invocation here instead.
        limits.process_count_limit = self.host_limits.process_count_limit;
        limits.open_files_limit = self.host_limits.open_files_limit;
        limits.file_size_limit = self
            .host_limits
            .file_size_limit
            .map(|b| sandbox::MemorySize::Bytes(b as usize));

        let allow_networking = self.host_limits.allow_networking;

        // Deliberately re-borrows `sandbox` inside the closure rather than
        // capturing `self`: `run_stage` only needs to know how to confine the
        // child, not anything else about this job.
        let result = run_stage(
            program,
            args,
            |builder| {
                builder.in_sandbox(sandbox);
                builder.allow_networking(allow_networking);
            },
            stdin,
            limits,
            self.output_cap,
        )
        .await?;

        Ok(result)
    }

    /// Idempotent: releases the sandbox (if any) and transitions to
    /// `Closed`. Safe to call from any state.
    pub async fn cleanup(&mut self) {
        if self.state == JobState::Closed {
            return;
        }

        if let Some(sandbox) = self.sandbox.take() {
            self.provisioner.release(sandbox).await;
        }

        self.state = JobState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RuntimeRegistry, StageLimits};

    fn provisioner(dir: &std::path::Path) -> SandboxProvisioner {
        let pool = sandbox::IdentityPool::new(vec![(unsafe { libc::getuid() }, unsafe { libc::getgid() })]);
        SandboxProvisioner::new(pool, dir)
    }

    fn doubler_runtime() -> RuntimeDescriptor {
        RuntimeRegistry::with_builtins()
            .resolve("python", "*")
            .expect("builtin python runtime resolves")
    }

    #[tokio::test]
    async fn test_job_lifecycle_uncompiled_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = provisioner(dir.path());

        let mut job = Job::new(
            doubler_runtime(),
            vec![SourceFile {
                name: None,
                content: "print(int(input())*2)".to_owned(),
                encoding: SourceEncoding::Utf8,
            }],
            LimitSet::default(),
            LimitSet::default(),
            &provisioner,
            65536,
        );

        job.prime().await.expect("prime succeeds");
        assert_eq!(JobState::Primed, job.state());

        let compiled = job.compile_only().await.expect("compile succeeds");
        assert!(compiled.success);
        assert_eq!(JobState::Compiled, job.state());

        let result = job.run_test(b"5\n", LimitSet::default()).await.expect("run succeeds");
        assert_eq!(b"10\n", result.stdout.as_slice());

        job.cleanup().await;
        assert_eq!(JobState::Closed, job.state());
    }

    #[tokio::test]
    async fn test_run_test_before_compiled_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = provisioner(dir.path());

        let mut job = Job::new(
            doubler_runtime(),
            vec![SourceFile {
                name: None,
                content: "print(int(input())*2)".to_owned(),
                encoding: SourceEncoding::Utf8,
            }],
            LimitSet::default(),
            LimitSet::default(),
            &provisioner,
            65536,
        );

        let err = job.run_test(b"1\n", LimitSet::default()).await.unwrap_err();
        assert!(matches!(err.0, ErrorKind::IllegalJobState(_, _)));
        job.cleanup().await;
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = provisioner(dir.path());

        let mut job = Job::new(
            doubler_runtime(),
            vec![SourceFile {
                name: None,
                content: "print(1)".to_owned(),
                encoding: SourceEncoding::Utf8,
            }],
            LimitSet::default(),
            LimitSet::default(),
            &provisioner,
            65536,
        );

        job.prime().await.expect("prime succeeds");
        job.cleanup().await;
        job.cleanup().await;
        assert_eq!(JobState::Closed, job.state());
    }

    #[tokio::test]
    async fn test_run_batch_requires_nonempty_cases() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = provisioner(dir.path());

        let mut job = Job::new(
            doubler_runtime(),
            vec![SourceFile {
                name: None,
                content: "print(int(input())*2)".to_owned(),
                encoding: SourceEncoding::Utf8,
            }],
            LimitSet::default(),
            LimitSet::default(),
            &provisioner,
            65536,
        );
        job.prime().await.expect("prime succeeds");
        job.compile_only().await.expect("compile succeeds");

        let err = job.run_batch(&[], LimitSet::default()).await.unwrap_err();
        assert!(matches!(err.0, ErrorKind::ValidationError(_)));

        job.cleanup().await;
    }

    #[tokio::test]
    async fn test_host_limits_are_applied_without_breaking_a_normal_run() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = provisioner(dir.path());

        let mut job = Job::with_host_limits(
            doubler_runtime(),
            vec![SourceFile {
                name: None,
                content: "print(int(input())*2)".to_owned(),
                encoding: SourceEncoding::Utf8,
            }],
            LimitSet::default(),
            LimitSet::default(),
            HostLimits {
                process_count_limit: Some(64),
                open_files_limit: Some(256),
                file_size_limit: Some(10 * 1024 * 1024),
                allow_networking: false,
            },
            &provisioner,
            65536,
        );

        job.prime().await.expect("prime succeeds");
        job.compile_only().await.expect("compile succeeds");
        let result = job.run_test(b"5\n", LimitSet::default()).await.expect("run succeeds");
        assert_eq!(b"10\n", result.stdout.as_slice());

        job.cleanup().await;
    }

    #[tokio::test]
    async fn test_run_batch_aggregates_results() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = provisioner(dir.path());

        let mut job = Job::new(
            doubler_runtime(),
            vec![SourceFile {
                name: None,
                content: "print(int(input())*2)".to_owned(),
                encoding: SourceEncoding::Utf8,
            }],
            LimitSet::default(),
            LimitSet::default(),
            &provisioner,
            65536,
        );
        job.prime().await.expect("prime succeeds");
        job.compile_only().await.expect("compile succeeds");

        let batch = job
            .run_batch(&[b"1\n".to_vec(), b"2\n".to_vec(), b"3\n".to_vec()], LimitSet::default())
            .await
            .expect("batch succeeds");

        assert_eq!(3, batch.results.len());
        assert!(batch.success);
        assert_eq!(b"2\n", batch.results[0].stdout.as_slice());
        assert_eq!(b"4\n", batch.results[1].stdout.as_slice());
        assert_eq!(b"6\n", batch.results[2].stdout.as_slice());

        job.cleanup().await;
    }
}
