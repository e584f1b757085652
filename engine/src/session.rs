//! The judge session protocol (C4): the per-connection state machine that
//! sequences `init` → `compiled` → N×(`run_test`|`run_batch`) → `close` →
//! `done` over the `/judge` transport.
//!
//! A session is driven strictly one message at a time by its transport loop
//! (`server.rs`); nothing in here ever races another call on the same
//! session, which is what lets every method take `&mut self` instead of
//! reaching for shared-mutable-state machinery. Re-entering `init`'s
//! sub-states (`Validating` → `Priming` → `Compiling`) happens inside one
//! `handle_init` call rather than across separate inbound messages — the
//! protocol table never expects another message to interleave with compile.

use judge::{HostLimits, Job, LimitSet, RuntimeRegistry, SourceEncoding, SourceFile};
use sandbox::SandboxProvisioner;

use crate::config::EngineConfig;
use crate::protocol::{
    InitMessage, Inbound, Outbound, ParseError, RunBatchMessage, RunTestMessage, WireStageResult,
};

/// What a session handler wants the transport loop to do after processing
/// one inbound message.
pub enum Outcome {
    /// Stay open; more messages are expected.
    Continue,
    /// Send a close frame with this code and stop reading further messages.
    Close(u16),
}

enum Phase {
    /// No `init` received yet.
    AwaitingInit,
    /// `init` succeeded; a `Job` is primed, compiled, and ready for tests.
    Ready,
    /// A close outcome has already been decided; further messages are inert.
    Done,
}

/// One `/judge` connection's protocol state.
pub struct Session<'a> {
    registry: &'a RuntimeRegistry,
    provisioner: &'a SandboxProvisioner,
    config: &'a EngineConfig,

    phase: Phase,
    job: Option<Job<'a>>,

    test_count: u64,
    total_wall_time_ms: u64,
    next_test_id: u64,
}

impl<'a> Session<'a> {
    pub fn new(
        registry: &'a RuntimeRegistry,
        provisioner: &'a SandboxProvisioner,
        config: &'a EngineConfig,
    ) -> Session<'a> {
        Session {
            registry,
            provisioner,
            config,
            phase: Phase::AwaitingInit,
            job: None,
            test_count: 0,
            total_wall_time_ms: 0,
            next_test_id: 1,
        }
    }

    /// Parse and dispatch one inbound text frame.
    pub async fn handle_frame(&mut self, raw: &str) -> (Vec<Outbound>, Outcome) {
        match crate::protocol::parse_inbound(raw) {
            Ok(Inbound::Init(msg)) => self.handle_init(msg).await,
            Ok(Inbound::RunTest(msg)) => self.handle_run_test(msg).await,
            Ok(Inbound::RunBatch(msg)) => self.handle_run_batch(msg).await,
            Ok(Inbound::Close) => self.handle_close().await,
            Err(ParseError::UnknownType(t)) => (
                vec![Outbound::Error {
                    message: format!("Unknown message type: {}", t),
                    test_id: None,
                }],
                Outcome::Continue,
            ),
            Err(ParseError::Malformed(reason)) => match self.phase {
                // A message that doesn't even parse, sent before `init`, is
                // still a protocol violation in the Opening state.
                Phase::AwaitingInit => (Vec::new(), Outcome::Close(4003)),
                _ => (
                    vec![Outbound::Error {
                        message: reason,
                        test_id: None,
                    }],
                    Outcome::Continue,
                ),
            },
        }
    }

    /// Called by the transport loop when the init grace period (recommended
    /// 5s) elapses with no `init` received.
    pub fn init_timed_out(&self) -> bool {
        matches!(self.phase, Phase::AwaitingInit)
    }

    async fn handle_init(&mut self, msg: InitMessage) -> (Vec<Outbound>, Outcome) {
        if !matches!(self.phase, Phase::AwaitingInit) {
            // Second `init`, in any state.
            return (Vec::new(), Outcome::Close(4000));
        }

        let validated = match self.validate_init(&msg) {
            Ok(v) => v,
            Err(reason) => {
                return (
                    vec![Outbound::Error {
                        message: reason,
                        test_id: None,
                    }],
                    Outcome::Close(4002),
                );
            }
        };

        let runtime = match self.registry.resolve(&validated.language, &validated.version) {
            Ok(r) => r,
            Err(e) => {
                return (
                    vec![Outbound::Error {
                        message: e.to_string(),
                        test_id: None,
                    }],
                    Outcome::Close(4002),
                );
            }
        };

        // `validate_init` has already rejected any negative value in `msg`,
        // so the `as u64` casts below are lossless.
        let compile_limits = LimitSet {
            timeout_ms: Some(msg.compile_timeout.map(|v| v as u64).unwrap_or(self.config.compile_timeout_ms)),
            cpu_time_ms: Some(
                msg.compile_cpu_time.map(|v| v as u64).unwrap_or(self.config.compile_cpu_time_ms),
            ),
            memory_bytes: Some(
                msg.compile_memory_limit.map(|v| v as u64).unwrap_or(self.config.compile_memory_bytes),
            ),
        };
        let run_limits = LimitSet {
            timeout_ms: Some(msg.run_timeout.map(|v| v as u64).unwrap_or(self.config.run_timeout_ms)),
            cpu_time_ms: Some(msg.run_cpu_time.map(|v| v as u64).unwrap_or(self.config.run_cpu_time_ms)),
            memory_bytes: Some(
                msg.run_memory_limit.map(|v| v as u64).unwrap_or(self.config.run_memory_bytes),
            ),
        };

        let language = runtime.language.clone();
        let version = runtime.version.clone();
        let compiled_runtime = runtime.compiled;

        let host_limits = HostLimits {
            process_count_limit: non_zero(self.config.max_process_count),
            open_files_limit: non_zero(self.config.max_open_files),
            file_size_limit: non_zero(self.config.max_file_size_bytes),
            allow_networking: !self.config.disable_networking,
        };

        let mut job = Job::with_host_limits(
            runtime,
            validated.files,
            compile_limits,
            run_limits,
            host_limits,
            self.provisioner,
            self.config.output_max_size,
        );

        let mut out = vec![Outbound::Ready {
            language,
            version,
            compiled: compiled_runtime,
        }];

        if let Err(e) = job.prime().await {
            out.push(Outbound::Error {
                message: e.to_string(),
                test_id: None,
            });
            return (out, Outcome::Close(4002));
        }

        match job.compile_only().await {
            Ok(result) => {
                out.push(Outbound::Compiled {
                    success: result.success,
                    time: result.wall_time_ms,
                    stdout: String::from_utf8_lossy(&result.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&result.stderr).into_owned(),
                    error: None,
                });

                if result.success {
                    self.job = Some(job);
                    self.phase = Phase::Ready;
                    (out, Outcome::Continue)
                } else {
                    job.cleanup().await;
                    self.phase = Phase::Done;
                    (out, Outcome::Close(4006))
                }
            }
            Err(e) => {
                out.push(Outbound::Error {
                    message: e.to_string(),
                    test_id: None,
                });
                job.cleanup().await;
                self.phase = Phase::Done;
                (out, Outcome::Close(4002))
            }
        }
    }

    /// Structural + limit validation performed at `init`.
    fn validate_init(&self, msg: &InitMessage) -> Result<ValidatedInit, String> {
        let language = match &msg.language {
            Some(l) if !l.is_empty() => l.clone(),
            _ => return Err("language must be a non-empty string".to_owned()),
        };
        let version = match &msg.version {
            Some(v) if !v.is_empty() => v.clone(),
            _ => return Err("version must be a non-empty string".to_owned()),
        };
        let wire_files = match &msg.files {
            Some(f) if !f.is_empty() => f,
            _ => return Err("files must be a non-empty list".to_owned()),
        };

        let mut files = Vec::with_capacity(wire_files.len());
        for (index, f) in wire_files.iter().enumerate() {
            let content = f
                .content
                .clone()
                .ok_or_else(|| format!("files[{}].content is missing", index))?;
            let encoding = match f.encoding.as_deref() {
                None | Some("utf8") => SourceEncoding::Utf8,
                Some("base64") => SourceEncoding::Base64,
                Some("hex") => SourceEncoding::Hex,
                Some(other) => return Err(format!("files[{}] has unknown encoding {:?}", index, other)),
            };
            files.push(SourceFile {
                name: f.name.clone(),
                content,
                encoding,
            });
        }

        let compile_timeout = non_negative("compile_timeout", msg.compile_timeout)?;
        let run_timeout = non_negative("run_timeout", msg.run_timeout)?;
        let compile_cpu_time = non_negative("compile_cpu_time", msg.compile_cpu_time)?;
        let run_cpu_time = non_negative("run_cpu_time", msg.run_cpu_time)?;
        let compile_memory_limit = non_negative("compile_memory_limit", msg.compile_memory_limit)?;
        let run_memory_limit = non_negative("run_memory_limit", msg.run_memory_limit)?;

        EngineConfig::check_override("compile_timeout", compile_timeout, self.config.compile_timeout_ms)?;
        EngineConfig::check_override("run_timeout", run_timeout, self.config.run_timeout_ms)?;
        EngineConfig::check_override("compile_cpu_time", compile_cpu_time, self.config.compile_cpu_time_ms)?;
        EngineConfig::check_override("run_cpu_time", run_cpu_time, self.config.run_cpu_time_ms)?;
        EngineConfig::check_override(
            "compile_memory_limit",
            compile_memory_limit,
            self.config.compile_memory_bytes,
        )?;
        EngineConfig::check_override("run_memory_limit", run_memory_limit, self.config.run_memory_bytes)?;

        Ok(ValidatedInit { language, version, files })
    }

    async fn handle_run_test(&mut self, msg: RunTestMessage) -> (Vec<Outbound>, Outcome) {
        if !matches!(self.phase, Phase::Ready) {
            return (Vec::new(), self.illegal_state_outcome());
        }

        let test_id = msg
            .test_id
            .clone()
            .unwrap_or_else(|| serde_json::Value::from(self.next_test_id));
        if msg.test_id.is_none() {
            self.next_test_id += 1;
        }

        let overrides = match run_overrides(msg.timeout, msg.cpu_time, msg.memory_limit) {
            Ok(overrides) => overrides,
            Err(reason) => {
                return (
                    vec![Outbound::Error { message: reason, test_id: Some(test_id) }],
                    Outcome::Continue,
                );
            }
        };
        let stdin = msg.stdin.clone().unwrap_or_default();

        let job = self.job.as_mut().expect("Ready phase always owns a job");
        match job.run_test(stdin.as_bytes(), overrides).await {
            Ok(result) => {
                self.test_count += 1;
                self.total_wall_time_ms += result.wall_time_ms;
                (
                    vec![Outbound::Result(to_wire_result(test_id, &result))],
                    Outcome::Continue,
                )
            }
            Err(e) => (
                vec![Outbound::Error {
                    message: e.to_string(),
                    test_id: Some(test_id),
                }],
                Outcome::Continue,
            ),
        }
    }

    async fn handle_run_batch(&mut self, msg: RunBatchMessage) -> (Vec<Outbound>, Outcome) {
        if !matches!(self.phase, Phase::Ready) {
            return (Vec::new(), self.illegal_state_outcome());
        }

        let cases = match &msg.test_cases {
            Some(c) if !c.is_empty() => c,
            _ => {
                return (
                    vec![Outbound::Error {
                        message: "run_batch requires a non-empty test_cases list".to_owned(),
                        test_id: None,
                    }],
                    Outcome::Continue,
                );
            }
        };

        let overrides = match run_overrides(msg.timeout, msg.cpu_time, msg.memory_limit) {
            Ok(overrides) => overrides,
            Err(reason) => {
                return (vec![Outbound::Error { message: reason, test_id: None }], Outcome::Continue);
            }
        };
        let stdins: Vec<Vec<u8>> = cases
            .iter()
            .map(|c| c.stdin.clone().unwrap_or_default().into_bytes())
            .collect();

        let job = self.job.as_mut().expect("Ready phase always owns a job");
        match job.run_batch(&stdins, overrides).await {
            Ok(batch) => {
                self.test_count += batch.results.len() as u64;
                self.total_wall_time_ms += batch.total_time_ms;

                let results = batch
                    .results
                    .iter()
                    .enumerate()
                    .map(|(i, r)| to_wire_result(serde_json::Value::from(i as u64 + 1), r))
                    .collect();

                (
                    vec![Outbound::BatchResult {
                        results,
                        total_tests: batch.results.len(),
                        total_time: batch.total_time_ms,
                        total_cpu_time: batch.total_cpu_time_ms,
                        memory: batch.memory_bytes,
                        success: batch.success,
                        stderr: String::from_utf8_lossy(&batch.stderr).into_owned(),
                    }],
                    Outcome::Continue,
                )
            }
            Err(e) => (
                vec![Outbound::Error {
                    message: e.to_string(),
                    test_id: None,
                }],
                Outcome::Continue,
            ),
        }
    }

    async fn handle_close(&mut self) -> (Vec<Outbound>, Outcome) {
        if matches!(self.phase, Phase::AwaitingInit) {
            return (Vec::new(), Outcome::Close(4003));
        }

        self.phase = Phase::Done;
        (
            vec![Outbound::Done {
                total_tests: self.test_count,
                total_time: self.total_wall_time_ms,
            }],
            Outcome::Close(4999),
        )
    }

    fn illegal_state_outcome(&self) -> Outcome {
        match self.phase {
            Phase::AwaitingInit => Outcome::Close(4003),
            _ => Outcome::Continue,
        }
    }

    /// Cleanup runs exactly once regardless of how the session ended
    /// (explicit `close`, compile failure, or transport loss). Safe to call
    /// more than once; only the first call with a live job does anything.
    pub async fn cleanup(&mut self) {
        if let Some(mut job) = self.job.take() {
            job.cleanup().await;
        }
        self.phase = Phase::Done;
    }
}

/// `0` means "unbounded" throughout the configured-maxima convention;
/// translate that into the `None` a `ProcessResourceLimits` field expects.
fn non_zero(value: u64) -> Option<u64> {
    if value == 0 {
        None
    } else {
        Some(value)
    }
}

/// Reject a negative wire-supplied limit: a negative limit is a validation
/// failure, reported as a single `error` then close 4002 — not a malformed
/// frame. Fields are deserialized as `i64` precisely so this can
/// run instead of serde rejecting the frame outright; this is where the
/// non-negative contract is actually enforced, on a value already known to
/// have parsed.
fn non_negative(field: &str, value: Option<i64>) -> Result<Option<u64>, String> {
    match value {
        Some(v) if v < 0 => Err(format!("{} must not be negative", field)),
        Some(v) => Ok(Some(v as u64)),
        None => Ok(None),
    }
}

/// Build a `run_test`/`run_batch` override `LimitSet`, rejecting any
/// negative `timeout`/`cpu_time`/`memory_limit` the same way `validate_init`
/// does for `init`'s limit fields.
fn run_overrides(timeout: Option<i64>, cpu_time: Option<i64>, memory_limit: Option<i64>) -> Result<LimitSet, String> {
    Ok(LimitSet {
        timeout_ms: non_negative("timeout", timeout)?,
        cpu_time_ms: non_negative("cpu_time", cpu_time)?,
        memory_bytes: non_negative("memory_limit", memory_limit)?,
    })
}

struct ValidatedInit {
    language: String,
    version: String,
    files: Vec<SourceFile>,
}

fn to_wire_result(test_id: serde_json::Value, result: &sandbox::StageResult) -> WireStageResult {
    WireStageResult {
        test_id,
        stdout: String::from_utf8_lossy(&result.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&result.stderr).into_owned(),
        code: result.exit_code,
        signal: result.signal.clone(),
        message: result.message.clone(),
        status: result.status.clone(),
        time: result.wall_time_ms,
        cpu_time: result.cpu_time_ms,
        memory: result.memory_bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_zero_maps_zero_to_unbounded() {
        assert_eq!(None, non_zero(0));
        assert_eq!(Some(64), non_zero(64));
    }

    fn harness() -> (RuntimeRegistry, SandboxProvisioner, EngineConfig, tempfile::TempDir) {
        let registry = RuntimeRegistry::with_builtins();
        let pool = sandbox::IdentityPool::new(vec![(unsafe { libc::getuid() }, unsafe { libc::getgid() })]);
        let dir = tempfile::tempdir().unwrap();
        let provisioner = SandboxProvisioner::new(pool, dir.path());
        let config = EngineConfig {
            max_concurrent_jobs: 1,
            ..EngineConfig::from_env()
        };
        (registry, provisioner, config, dir)
    }

    #[tokio::test]
    async fn test_run_test_before_init_closes_4003() {
        let (registry, provisioner, config, _dir) = harness();
        let mut session = Session::new(&registry, &provisioner, &config);

        let (out, outcome) = session
            .handle_frame(r#"{"type":"run_test","stdin":"1\n"}"#)
            .await;
        assert!(out.is_empty());
        assert!(matches!(outcome, Outcome::Close(4003)));
    }

    #[tokio::test]
    async fn test_unknown_message_type_is_non_fatal() {
        let (registry, provisioner, config, _dir) = harness();
        let mut session = Session::new(&registry, &provisioner, &config);

        let (out, outcome) = session.handle_frame(r#"{"type":"wat"}"#).await;
        assert_eq!(1, out.len());
        assert!(matches!(outcome, Outcome::Continue));
        match &out[0] {
            Outbound::Error { message, .. } => assert!(message.contains("wat")),
            _ => panic!("expected Error"),
        }
    }

    #[tokio::test]
    async fn test_full_doubler_session() {
        let (registry, provisioner, config, _dir) = harness();
        let mut session = Session::new(&registry, &provisioner, &config);

        let init = r#"{"type":"init","language":"python","version":"*","files":[{"content":"print(int(input())*2)"}]}"#;
        let (out, outcome) = session.handle_frame(init).await;
        assert!(matches!(outcome, Outcome::Continue));
        assert_eq!(2, out.len());
        match &out[1] {
            Outbound::Compiled { success, .. } => assert!(*success),
            _ => panic!("expected Compiled"),
        }

        let (out, outcome) = session
            .handle_frame(r#"{"type":"run_test","stdin":"5\n","test_id":1}"#)
            .await;
        assert!(matches!(outcome, Outcome::Continue));
        match &out[0] {
            Outbound::Result(r) => {
                assert_eq!("10\n", r.stdout);
                assert_eq!(Some(0), r.code);
            }
            _ => panic!("expected Result"),
        }

        let (out, outcome) = session.handle_frame(r#"{"type":"close"}"#).await;
        assert!(matches!(outcome, Outcome::Close(4999)));
        match &out[0] {
            Outbound::Done { total_tests, .. } => assert_eq!(1, *total_tests),
            _ => panic!("expected Done"),
        }

        session.cleanup().await;
    }

    #[tokio::test]
    async fn test_second_init_closes_4000() {
        let (registry, provisioner, config, _dir) = harness();
        let mut session = Session::new(&registry, &provisioner, &config);

        let init = r#"{"type":"init","language":"python","version":"*","files":[{"content":"print(1)"}]}"#;
        session.handle_frame(init).await;

        let (_out, outcome) = session.handle_frame(init).await;
        assert!(matches!(outcome, Outcome::Close(4000)));
        session.cleanup().await;
    }

    #[tokio::test]
    async fn test_init_with_unknown_language_closes_4002() {
        let (registry, provisioner, config, _dir) = harness();
        let mut session = Session::new(&registry, &provisioner, &config);

        let init = r#"{"type":"init","language":"brainfuck","version":"*","files":[{"content":"+"}]}"#;
        let (out, outcome) = session.handle_frame(init).await;
        assert!(matches!(outcome, Outcome::Close(4002)));
        assert!(matches!(out.last(), Some(Outbound::Error { .. })));
    }

    #[tokio::test]
    async fn test_init_limit_override_exceeding_max_closes_4002() {
        let (registry, provisioner, config, _dir) = harness();
        let mut session = Session::new(&registry, &provisioner, &config);

        let init = format!(
            r#"{{"type":"init","language":"python","version":"*","files":[{{"content":"print(1)"}}],"run_timeout":{}}}"#,
            config.run_timeout_ms + 1
        );
        let (_out, outcome) = session.handle_frame(&init).await;
        assert!(matches!(outcome, Outcome::Close(4002)));
    }

    #[tokio::test]
    async fn test_init_with_negative_limit_sends_error_and_closes_4002() {
        let (registry, provisioner, config, _dir) = harness();
        let mut session = Session::new(&registry, &provisioner, &config);

        let init = r#"{"type":"init","language":"python","version":"*","files":[{"content":"print(1)"}],"run_timeout":-1}"#;
        let (out, outcome) = session.handle_frame(init).await;
        assert!(matches!(outcome, Outcome::Close(4002)));
        assert!(matches!(out.last(), Some(Outbound::Error { .. })), "a negative limit must still produce an error frame, not a silent close");
    }

    #[tokio::test]
    async fn test_run_test_with_negative_override_reports_error_without_closing() {
        let (registry, provisioner, config, _dir) = harness();
        let mut session = Session::new(&registry, &provisioner, &config);

        let init = r#"{"type":"init","language":"python","version":"*","files":[{"content":"print(int(input())*2)"}]}"#;
        session.handle_frame(init).await;

        let (out, outcome) = session
            .handle_frame(r#"{"type":"run_test","stdin":"5\n","memory_limit":-1}"#)
            .await;
        assert!(matches!(outcome, Outcome::Continue));
        assert!(matches!(out.last(), Some(Outbound::Error { .. })));

        session.cleanup().await;
    }

    #[test]
    fn test_non_negative_rejects_negative_and_passes_through_otherwise() {
        assert_eq!(Ok(None), non_negative("x", None));
        assert_eq!(Ok(Some(5)), non_negative("x", Some(5)));
        assert!(non_negative("x", Some(-1)).is_err());
    }

    #[test]
    fn test_run_overrides_rejects_any_negative_field() {
        assert!(run_overrides(Some(-1), None, None).is_err());
        assert!(run_overrides(None, Some(-1), None).is_err());
        assert!(run_overrides(None, None, Some(-1)).is_err());
        assert!(run_overrides(Some(100), Some(50), Some(1024)).is_ok());
    }

    #[tokio::test]
    async fn test_compile_failure_closes_4006() {
        let (registry, provisioner, config, _dir) = harness();
        let mut session = Session::new(&registry, &provisioner, &config);

        let init = r#"{"type":"init","language":"cpp","version":"17","files":[{"content":"int main( { return 0 }"}]}"#;
        let (_out, outcome) = session.handle_frame(init).await;
        assert!(matches!(outcome, Outcome::Close(4006)));
    }

    #[tokio::test]
    async fn test_compile_engine_fault_closes_4002_not_4006() {
        let (mut registry, provisioner, config, _dir) = harness();
        registry.install(judge::RuntimeDescriptor {
            language: "broken".to_owned(),
            version: "1".to_owned(),
            aliases: Vec::new(),
            compiled: true,
            compile_cmd: Some(vec!["/no/such/compiler-binary".to_owned()]),
            run_cmd: vec!["./main".to_owned()],
            default_source_name: "main.src".to_owned(),
            compile_limits: judge::StageLimits::UNBOUNDED,
            run_limits: judge::StageLimits::UNBOUNDED,
            install_order: 0,
        });
        let mut session = Session::new(&registry, &provisioner, &config);

        let init = r#"{"type":"init","language":"broken","version":"1","files":[{"content":"anything"}]}"#;
        let (out, outcome) = session.handle_frame(init).await;
        assert!(matches!(outcome, Outcome::Close(4002)));
        assert!(matches!(out.last(), Some(Outbound::Error { .. })), "an engine-side compile fault must surface as error, not a synthetic compiled message");
    }
}
