//! Builds a [`tokio::process::Command`] that launches inside a sandbox:
//! dropped privileges, rlimits, a clean environment, a confined working
//! directory, and (optionally) a blocked network namespace.
//!
//! This is the part of C2 concerned with *starting* the child; `stage`
//! contains the part concerned with *watching* it.

use std::collections::HashMap;
use std::ffi::OsString;
use std::os::unix::process::CommandExt as _;
use std::path::Path;
use std::process::Stdio;

use nix::unistd::{setgid, setuid, Gid, Uid};
use tokio::process::{Child, Command};

use crate::rlimits::{setrlimit_hard, Resource};
use crate::sandboxing::SandboxHandle;
use crate::{ErrorKind, GroupId, ProcessResourceLimits, Result, ResultExt, UserId};

/// What to connect a child's standard streams to.
///
/// The stage runner always wants piped stdin/stdout/stderr so it can feed
/// per-test input and read output incrementally with a cap; this type exists
/// so tests can exercise `ProcessBuilder` without going through `stage`.
#[derive(Debug, Default)]
pub enum ProcessRedirection {
    /// Connect to `/dev/null`.
    #[default]
    Null,

    /// Connect to a pipe the caller reads/writes.
    Piped,

    /// Inherit the parent's stream. Never used for sandboxed children in
    /// production; exists for local debugging builds.
    Inherit,
}

impl ProcessRedirection {
    fn as_stdio(&self) -> Stdio {
        match self {
            ProcessRedirection::Null => Stdio::null(),
            ProcessRedirection::Piped => Stdio::piped(),
            ProcessRedirection::Inherit => Stdio::inherit(),
        }
    }
}

/// Builds a sandboxed child process.
///
/// Every field mirrors one piece of the isolation contract: the identity to
/// drop to, the confined working directory, the rlimits to install before
/// `exec`, and whether outbound networking is permitted.
pub struct ProcessBuilder {
    program: OsString,
    args: Vec<OsString>,
    envs: HashMap<OsString, OsString>,
    working_dir: Option<std::path::PathBuf>,
    uid: Option<UserId>,
    gid: Option<GroupId>,
    limits: ProcessResourceLimits,
    deny_networking: bool,
    stdin: ProcessRedirection,
    stdout: ProcessRedirection,
    stderr: ProcessRedirection,
}

/// `PATH` handed to every sandboxed child so that a bare command name in a
/// `run_cmd`/`compile_cmd` (`"python3"`, `"g++"`, ...) still resolves via
/// `execvp`-style lookup once the rest of the host environment is cleared.
/// Fixed and minimal rather than inherited from the host, so clearing the
/// rest of the environment to keep host state from leaking into the child
/// doesn't also strip the one variable the exec path itself depends on.
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

impl ProcessBuilder {
    /// Start building a child that execs `program`.
    pub fn new(program: impl Into<OsString>) -> ProcessBuilder {
        let mut envs = HashMap::new();
        envs.insert(OsString::from("PATH"), OsString::from(DEFAULT_PATH));

        ProcessBuilder {
            program: program.into(),
            args: Vec::new(),
            envs,
            working_dir: None,
            uid: None,
            gid: None,
            limits: ProcessResourceLimits::default(),
            deny_networking: true,
            stdin: ProcessRedirection::Null,
            stdout: ProcessRedirection::Piped,
            stderr: ProcessRedirection::Piped,
        }
    }

    pub fn add_arg(&mut self, arg: impl Into<OsString>) -> Result<&mut Self> {
        let arg = arg.into();
        if let Some(s) = arg.to_str() {
            if !crate::misc::is_valid_c_string(s) {
                bail!(ErrorKind::InvalidProcessArgument(s.to_owned()));
            }
        }
        self.args.push(arg);
        Ok(self)
    }

    pub fn add_args<I, S>(&mut self, args: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        for arg in args {
            self.add_arg(arg)?;
        }
        Ok(self)
    }

    pub fn add_env(&mut self, name: impl Into<OsString>, value: impl Into<OsString>) -> Result<&mut Self> {
        let name = name.into();
        let value = value.into();
        if let (Some(n), Some(v)) = (name.to_str(), value.to_str()) {
            if !crate::misc::is_valid_c_string(n) || !crate::misc::is_valid_c_string(v) {
                bail!(ErrorKind::InvalidEnvironmentVariable(n.to_owned()));
            }
        }
        self.envs.insert(name, value);
        Ok(self)
    }

    /// Confine the child to `sandbox`: run as its identity, in its working
    /// directory, writing to its `/tmp`.
    pub fn in_sandbox(&mut self, sandbox: &SandboxHandle<'_>) -> &mut Self {
        self.uid = Some(sandbox.uid);
        self.gid = Some(sandbox.gid);
        self.working_dir = Some(sandbox.working_dir().to_path_buf());
        self.add_env("TMPDIR", sandbox.tmp_dir().as_os_str())
            .expect("sandbox tmp path is always a valid C string");
        self
    }

    pub fn working_dir(&mut self, dir: impl AsRef<Path>) -> &mut Self {
        self.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn limits(&mut self, limits: ProcessResourceLimits) -> &mut Self {
        self.limits = limits;
        self
    }

    /// Allow outbound networking for this child. Off by default; network
    /// stays blocked unless explicitly enabled.
    pub fn allow_networking(&mut self, allow: bool) -> &mut Self {
        self.deny_networking = !allow;
        self
    }

    pub fn stdin(&mut self, redirection: ProcessRedirection) -> &mut Self {
        self.stdin = redirection;
        self
    }

    pub fn stdout(&mut self, redirection: ProcessRedirection) -> &mut Self {
        self.stdout = redirection;
        self
    }

    pub fn stderr(&mut self, redirection: ProcessRedirection) -> &mut Self {
        self.stderr = redirection;
        self
    }

    /// Spawn the child.
    ///
    /// The uid/gid drop, rlimit installation, and (optional) network
    /// namespace unshare all happen inside `pre_exec`, i.e. in the forked
    /// child before `execve`.
    pub fn start(&self) -> Result<Child> {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command.env_clear();
        command.envs(self.envs.iter());

        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        command.stdin(self.stdin.as_stdio());
        command.stdout(self.stdout.as_stdio());
        command.stderr(self.stderr.as_stdio());

        // tokio reaps the child via a background waitpid; leaving kill_on_drop
        // enabled means a dropped `Child` (e.g. a task cancelled mid-await)
        // doesn't leak the sandboxed process.
        command.kill_on_drop(true);

        let uid = self.uid;
        let gid = self.gid;
        let limits = self.limits;
        let deny_networking = self.deny_networking;

        unsafe {
            command.pre_exec(move || pre_exec(uid, gid, limits, deny_networking));
        }

        command
            .spawn()
            .chain_err(|| ErrorKind::ChildStartupFailed(format!("{:?}", self.program)))
    }
}

/// Runs in the forked child, before `execve`. Must only call async-signal-safe
/// operations.
fn pre_exec(
    uid: Option<UserId>,
    gid: Option<GroupId>,
    limits: ProcessResourceLimits,
    deny_networking: bool,
) -> std::io::Result<()> {
    if deny_networking {
        unshare_network()?;
    }

    install_limits(&limits)?;

    // Group must drop before user: once we're no longer root, `setgid` would
    // fail.
    if let Some(gid) = gid {
        setgid(Gid::from_raw(gid)).map_err(nix_to_io)?;
    }
    if let Some(uid) = uid {
        setuid(Uid::from_raw(uid)).map_err(nix_to_io)?;
    }

    Ok(())
}

fn unshare_network() -> std::io::Result<()> {
    let ret = unsafe { libc::unshare(libc::CLONE_NEWNET) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

fn install_limits(limits: &ProcessResourceLimits) -> std::io::Result<()> {
    if let Some(cpu) = limits.cpu_time_limit {
        // Round up: the kernel measures in whole seconds and kills on the
        // boundary, so rounding down would clip a test that is otherwise
        // within budget.
        let secs = cpu.as_secs() + u64::from(cpu.subsec_nanos() > 0);
        setrlimit_hard(Resource::CPUTime, secs).map_err(|_| std::io::Error::last_os_error())?;
    }
    if let Some(mem) = limits.memory_limit {
        setrlimit_hard(Resource::AddressSpace, mem.bytes() as u64)
            .map_err(|_| std::io::Error::last_os_error())?;
    }
    if let Some(size) = limits.file_size_limit {
        setrlimit_hard(Resource::FileSize, size.bytes() as u64)
            .map_err(|_| std::io::Error::last_os_error())?;
    }
    if let Some(n) = limits.open_files_limit {
        setrlimit_hard(Resource::OpenFiles, n).map_err(|_| std::io::Error::last_os_error())?;
    }
    if let Some(n) = limits.process_count_limit {
        setrlimit_hard(Resource::ProcessCount, n).map_err(|_| std::io::Error::last_os_error())?;
    }

    Ok(())
}

fn nix_to_io(e: nix::Error) -> std::io::Error {
    std::io::Error::from_raw_os_error(e as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_start_runs_program_and_captures_stdout() {
        let mut builder = ProcessBuilder::new("/bin/echo");
        builder.add_arg("hello").unwrap();

        let mut child = builder.start().expect("spawn succeeds");
        let output = child.wait_with_output().await.expect("child runs");
        assert!(output.status.success());
        assert_eq!(b"hello\n", output.stdout.as_slice());
    }

    #[tokio::test]
    async fn test_env_clear_removes_host_environment() {
        std::env::set_var("SANDBOX_TEST_LEAK_PROBE", "leaked");
        let mut builder = ProcessBuilder::new("/bin/sh");
        builder.add_arg("-c").unwrap();
        builder
            .add_arg("echo -n \"$SANDBOX_TEST_LEAK_PROBE\"")
            .unwrap();

        let child = builder.start().expect("spawn succeeds");
        let output = child.wait_with_output().await.expect("child runs");
        assert_eq!(b"", output.stdout.as_slice());
        std::env::remove_var("SANDBOX_TEST_LEAK_PROBE");
    }

    #[tokio::test]
    async fn test_bare_command_name_resolves_via_default_path() {
        // `run_cmd`/`compile_cmd` entries like "python3" or "g++" carry no
        // slash; with the host environment cleared they only spawn if the
        // child's own `PATH` still covers `/bin`, `/usr/bin`, etc.
        let mut builder = ProcessBuilder::new("true");
        let child = builder.start().expect("bare command name resolves via PATH");
        let output = child.wait_with_output().await.expect("child runs");
        assert!(output.status.success());
    }

    #[tokio::test]
    async fn test_rejects_null_byte_argument() {
        let mut builder = ProcessBuilder::new("/bin/echo");
        let err = builder.add_arg("bad\0arg").unwrap_err();
        assert!(matches!(err.0, ErrorKind::InvalidProcessArgument(_)));
    }

    #[tokio::test]
    async fn test_cpu_limit_installed_without_error() {
        let mut builder = ProcessBuilder::new("/bin/true");
        builder.limits(ProcessResourceLimits {
            cpu_time_limit: Some(Duration::from_secs(1)),
            ..Default::default()
        });
        let child = builder.start().expect("spawn succeeds");
        let output = child.wait_with_output().await.expect("child runs");
        assert!(output.status.success());
    }
}
