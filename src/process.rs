//! Centralized command execution with consistent error handling.
//!
//! Every external tool the pipeline sequences (sfdisk, losetup, cryptsetup,
//! mkfs.*, systemd-nspawn, ...) goes through [`Cmd`], so each invocation is
//! logged the same way and a non-zero exit always becomes
//! [`MkosiError::ToolFailed`].

use anyhow::{Context, Result};
use std::ffi::OsString;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use tracing::debug;

use crate::error::MkosiError;

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Exit status of the command.
    pub status: ExitStatus,
    /// Captured stdout as a string (empty when not captured).
    pub stdout: String,
    /// Captured stderr as a string (empty when not captured).
    pub stderr: String,
}

impl CommandResult {
    /// Returns true if the command exited successfully.
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Get the exit code, or -1 if terminated by signal.
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    /// Get stdout, trimmed of whitespace.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// Get stderr, trimmed of whitespace.
    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

/// Where the child's stdout goes.
enum Output {
    Capture,
    Inherit,
    File(File),
    Null,
}

/// Builder for configuring command execution.
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    current_dir: Option<PathBuf>,
    envs: Vec<(String, String)>,
    stdin: Option<Vec<u8>>,
    stdin_file: Option<File>,
    stdout: Output,
    quiet_stderr: bool,
    /// If true, don't fail on non-zero exit.
    allow_fail: bool,
    /// Custom error message prefix.
    error_prefix: Option<String>,
}

impl Cmd {
    /// Create a new command builder.
    pub fn new(program: impl AsRef<std::ffi::OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            current_dir: None,
            envs: Vec::new(),
            stdin: None,
            stdin_file: None,
            stdout: Output::Capture,
            quiet_stderr: false,
            allow_fail: false,
            error_prefix: None,
        }
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().into());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.args.push(arg.as_ref().into());
        }
        self
    }

    /// Add a path as an argument.
    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.as_os_str().to_os_string());
        self
    }

    /// Set the working directory.
    pub fn dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    /// Set an environment variable for the child.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Feed these bytes to the child's stdin.
    pub fn stdin_bytes(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Connect the child's stdin to an open file.
    pub fn stdin_file(mut self, file: File) -> Self {
        self.stdin_file = Some(file);
        self
    }

    /// Redirect the child's stdout into a file instead of capturing it.
    pub fn stdout_file(mut self, file: File) -> Self {
        self.stdout = Output::File(file);
        self
    }

    /// Let the child write to the terminal (long-running, user-visible tools).
    pub fn visible(mut self) -> Self {
        self.stdout = Output::Inherit;
        self
    }

    /// Discard stdout and stderr.
    pub fn quiet(mut self) -> Self {
        self.stdout = Output::Null;
        self.quiet_stderr = true;
        self
    }

    /// Allow non-zero exit codes without failing.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Set a custom error message prefix.
    pub fn error_msg(mut self, msg: impl AsRef<str>) -> Self {
        self.error_prefix = Some(msg.as_ref().to_string());
        self
    }

    /// The full command line, for logging and tests.
    pub fn command_line(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|s| s.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run the command. Stdout is captured unless redirected; stderr is
    /// captured for captured/null modes and inherited for visible mode.
    pub fn run(self) -> Result<CommandResult> {
        debug!("running: {}", self.command_line());

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        if let Some(ref dir) = self.current_dir {
            cmd.current_dir(dir);
        }

        let capture_stdout = matches!(self.stdout, Output::Capture);
        let inherit = matches!(self.stdout, Output::Inherit);

        match self.stdout {
            Output::Capture => cmd.stdout(Stdio::piped()),
            Output::Inherit => cmd.stdout(Stdio::inherit()),
            Output::File(f) => cmd.stdout(Stdio::from(f)),
            Output::Null => cmd.stdout(Stdio::null()),
        };

        if self.quiet_stderr {
            cmd.stderr(Stdio::null());
        } else if inherit {
            cmd.stderr(Stdio::inherit());
        } else {
            cmd.stderr(Stdio::piped());
        }

        if let Some(f) = self.stdin_file {
            cmd.stdin(Stdio::from(f));
        } else if self.stdin.is_some() {
            cmd.stdin(Stdio::piped());
        } else if inherit {
            cmd.stdin(Stdio::inherit());
        } else {
            cmd.stdin(Stdio::null());
        }

        let program = self.program.to_string_lossy().into_owned();
        let mut child = cmd.spawn().map_err(|e| spawn_error(&program, e))?;

        if let Some(input) = self.stdin {
            // Dropping the handle closes the pipe so the child sees EOF.
            let mut pipe = child.stdin.take().context("stdin pipe missing")?;
            pipe.write_all(&input)
                .with_context(|| format!("Failed to write stdin of '{}'", program))?;
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("Failed to wait for '{}'", program))?;

        let result = CommandResult {
            status: output.status,
            stdout: if capture_stdout {
                String::from_utf8_lossy(&output.stdout).into_owned()
            } else {
                String::new()
            },
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !self.allow_fail && !result.success() {
            let prefix = self
                .error_prefix
                .unwrap_or_else(|| format!("'{}' failed", program));

            return Err(MkosiError::ToolFailed {
                prefix,
                code: result.code(),
                stderr: result.stderr.clone(),
            }
            .into());
        }

        Ok(result)
    }

    /// Replace the current process with this command (shell/boot/qemu verbs).
    pub fn exec(self) -> Result<()> {
        use std::os::unix::process::CommandExt;

        debug!("exec: {}", self.command_line());
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        Err(spawn_error(&self.program.to_string_lossy(), cmd.exec()))
    }
}

/// A program missing from `PATH` is its own failure category.
fn spawn_error(program: &str, err: std::io::Error) -> anyhow::Error {
    if err.kind() == std::io::ErrorKind::NotFound {
        MkosiError::ToolNotFound {
            tool: program.to_string(),
            hint: "Is it installed?".to_string(),
        }
        .into()
    } else {
        anyhow::Error::new(err).context(format!("Failed to execute '{}'", program))
    }
}

// =============================================================================
// Convenience functions
// =============================================================================

/// Run a command with arguments. Fails with stderr on error.
///
/// # Example
/// ```ignore
/// let result = run("sfdisk", ["--dump", "/dev/loop0"])?;
/// println!("Table:\n{}", result.stdout);
/// ```
pub fn run<I, S>(program: &str, args: I) -> Result<CommandResult>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    Cmd::new(program).args(args).run()
}

/// Check if a program exists in PATH.
///
/// Returns the full path if found, None otherwise.
pub fn which(program: &str) -> Option<PathBuf> {
    which::which(program).ok()
}

/// Check if a program exists in PATH (bool version).
pub fn exists(program: &str) -> bool {
    which(program).is_some()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek};

    #[test]
    fn test_run_success() {
        let result = run("echo", ["hello"]).unwrap();
        assert!(result.success());
        assert_eq!(result.stdout_trimmed(), "hello");
    }

    #[test]
    fn test_run_captures_stderr() {
        // `ls` on a non-existent file writes to stderr
        let result = Cmd::new("ls")
            .arg("/nonexistent_path_12345")
            .allow_fail()
            .run()
            .unwrap();

        assert!(!result.success());
        assert!(!result.stderr.is_empty());
    }

    #[test]
    fn test_run_failure_includes_stderr() {
        let err = run("ls", ["/nonexistent_path_12345"]).unwrap_err();
        let msg = err.to_string();

        assert!(msg.contains("No such file") || msg.contains("cannot access"));
        assert!(err.downcast_ref::<MkosiError>().is_some());
    }

    #[test]
    fn test_stdin_is_piped() {
        let result = Cmd::new("cat").stdin_bytes("passphrase\n").run().unwrap();
        assert_eq!(result.stdout, "passphrase\n");
    }

    #[test]
    fn test_stdout_into_file() {
        let mut file = tempfile::tempfile().unwrap();
        Cmd::new("echo")
            .arg("root hash")
            .stdout_file(file.try_clone().unwrap())
            .run()
            .unwrap();

        let mut content = String::new();
        file.rewind().unwrap();
        file.read_to_string(&mut content).unwrap();
        assert_eq!(content, "root hash\n");
    }

    #[test]
    fn test_env_is_passed() {
        let result = Cmd::new("sh")
            .args(["-c", "echo $DESTDIR"])
            .env("DESTDIR", "/root/dest")
            .run()
            .unwrap();
        assert_eq!(result.stdout_trimmed(), "/root/dest");
    }

    #[test]
    fn test_which_exists() {
        assert!(which("sh").is_some());
        assert!(which("nonexistent_program_12345").is_none());
        assert!(exists("sh"));
    }

    #[test]
    fn test_cmd_args_iterator() {
        let args = vec!["one", "two", "three"];
        let result = Cmd::new("echo").args(args).run().unwrap();

        assert_eq!(result.stdout_trimmed(), "one two three");
    }

    #[test]
    fn test_custom_error_message() {
        let err = Cmd::new("false")
            .error_msg("Formatting swap partition failed")
            .run()
            .unwrap_err();

        assert!(err.to_string().contains("Formatting swap partition failed"));
    }

    #[test]
    fn test_allow_fail() {
        let result = Cmd::new("false").allow_fail().run().unwrap();

        assert!(!result.success());
        assert_eq!(result.code(), 1);
    }

    #[test]
    fn test_run_in_directory() {
        let result = Cmd::new("pwd").dir(Path::new("/tmp")).run().unwrap();
        assert!(result.stdout_trimmed().contains("tmp"));
    }

    #[test]
    fn test_missing_program_is_tool_not_found() {
        let err = Cmd::new("mkosi-no-such-tool-xyz").run().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MkosiError>(),
            Some(MkosiError::ToolNotFound { tool, .. }) if tool == "mkosi-no-such-tool-xyz"
        ));
        assert_eq!(crate::error::exit_code_for(&err), 5);
    }

    #[test]
    fn test_command_line() {
        let cmd = Cmd::new("losetup").args(["--find", "--show", "--partscan"]);
        assert_eq!(cmd.command_line(), "losetup --find --show --partscan");
    }
}
