use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tokio::process::Command as TokioCommand;

/// Specification for a command to execute.
///
/// All process execution goes through this type so arguments always cross
/// the process boundary as discrete argv elements, never as a shell string.
/// Project paths and chunk labels come from user-controlled folder names.
///
/// ```rust
/// use orthobatch_runner::CommandSpec;
/// use std::ffi::OsString;
///
/// let cmd = CommandSpec::new("orthobatch-engine")
///     .arg("align")
///     .args(["--project", "/tmp/siteA_unprocessed/project.psx"])
///     .env("ORTHOBATCH_GPU_MASK", "3");
///
/// assert_eq!(cmd.program, OsString::from("orthobatch-engine"));
/// assert_eq!(cmd.args.len(), 3);
/// ```
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: OsString,
    /// Arguments as discrete elements
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
    /// Environment overrides, applied on top of the inherited environment
    pub env: BTreeMap<OsString, OsString>,
    /// Bytes written to the child's stdin, which is closed afterwards.
    /// `None` connects stdin to null.
    pub stdin: Option<Vec<u8>>,
}

impl CommandSpec {
    #[must_use]
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn envs<I, K, V>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        for (key, value) in envs {
            self.env.insert(key.into(), value.into());
        }
        self
    }

    /// Payload for the child's stdin. Unlike argv it has no size limit.
    #[must_use]
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    fn stdin_mode(&self) -> Stdio {
        if self.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        }
    }

    /// Blocking `std::process::Command`. Stdin is piped when a payload is
    /// set and the caller is responsible for writing it.
    #[must_use]
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).envs(&self.env).stdin(self.stdin_mode());
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }

    /// Async command with piped output that is killed when dropped
    #[must_use]
    pub fn to_tokio_command(&self) -> TokioCommand {
        let mut cmd = TokioCommand::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(self.stdin_mode())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }
}

impl fmt::Display for CommandSpec {
    /// Human-readable rendering for logs. Not suitable for shell execution.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            let arg = arg.to_string_lossy();
            if arg.contains(char::is_whitespace) {
                write!(f, " {arg:?}")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_chain() {
        let cmd = CommandSpec::new("orthobatch-engine")
            .arg("build_depth_maps")
            .args(["--project", "/work/project.psx"])
            .cwd("/work")
            .env("ORTHOBATCH_GPU_MASK", "1")
            .envs([("ORTHOBATCH_CPU_ENABLED", "0")]);

        assert_eq!(cmd.program, OsString::from("orthobatch-engine"));
        assert_eq!(cmd.args.len(), 3);
        assert_eq!(cmd.cwd, Some(PathBuf::from("/work")));
        assert_eq!(cmd.env.len(), 2);
        assert_eq!(
            cmd.env.get(&OsString::from("ORTHOBATCH_GPU_MASK")),
            Some(&OsString::from("1"))
        );
    }

    #[test]
    fn test_folder_names_stay_single_arguments() {
        let cmd = CommandSpec::new("orthobatch-engine")
            .arg("--chunk")
            .arg("flight A; rm -rf $HOME")
            .arg("$(whoami)");

        assert_eq!(cmd.args.len(), 3);
        assert_eq!(cmd.args[1], OsString::from("flight A; rm -rf $HOME"));
        assert_eq!(cmd.args[2], OsString::from("$(whoami)"));
    }

    #[test]
    fn test_stdin_payload_is_not_an_argument() {
        let cmd = CommandSpec::new("bridge")
            .args(["add_chunk", "--params", "-"])
            .stdin(b"{\"images\":[]}".to_vec());

        assert_eq!(cmd.args.len(), 3);
        assert_eq!(cmd.stdin.as_deref(), Some(&b"{\"images\":[]}"[..]));
        assert!(CommandSpec::new("bridge").stdin.is_none());
    }

    #[test]
    fn test_display_quotes_whitespace() {
        let cmd = CommandSpec::new("bridge").args(["open", "--project", "/a b/project.psx"]);
        assert_eq!(
            cmd.to_string(),
            "bridge open --project \"/a b/project.psx\""
        );
    }

    #[test]
    fn test_conversions_do_not_panic() {
        let cmd = CommandSpec::new("echo").arg("hello");
        let _std = cmd.to_command();
        let _tokio = cmd.to_tokio_command();
    }
}
