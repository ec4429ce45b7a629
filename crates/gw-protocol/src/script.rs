//! Remote shell scripts
//!
//! Commands are not passed as the SSH `exec` request. The channel execs the
//! login shell (optionally wrapped in sudo) and the script below is written to
//! its stdin, followed by EOF.

use std::borrow::Cow;

use shell_escape::unix::escape;

/// Placeholder substituted with the shell in the sudo template
pub const SUDO_PLACEHOLDER: &str = "%c";

/// Placeholders substituted in the environment export template
pub const ENV_KEY_PLACEHOLDER: &str = "%ENV_KEY%";
pub const ENV_VALUE_PLACEHOLDER: &str = "%ENV_VALUE%";

/// Per-command sentinel strings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Markers {
    /// Separates login banner noise from output in raw mode
    pub banner: String,
    /// Precedes command output in pty mode
    pub pty_start: String,
    /// Follows command output in pty mode
    pub pty_end: String,
}

impl Markers {
    /// Generate a fresh set of markers
    pub fn generate() -> Self {
        let token: u128 = rand::random();
        Self::from_token(&format!("{:032x}", token))
    }

    /// Build markers around a fixed token
    pub fn from_token(token: &str) -> Self {
        Self {
            banner: format!("{}-gw-banner", token),
            pty_start: format!("{}-gw-pty-start", token),
            pty_end: format!("{}-gw-pty-end", token),
        }
    }
}

/// Builds the command line and stdin script for one command execution
#[derive(Debug, Clone)]
pub struct ScriptBuilder<'a> {
    export_template: &'a str,
    markers: &'a Markers,
    exports: Vec<(String, String)>,
}

impl<'a> ScriptBuilder<'a> {
    /// Create a builder using the given export template and markers
    pub fn new(export_template: &'a str, markers: &'a Markers) -> Self {
        Self {
            export_template,
            markers,
            exports: vec![("TERM".to_string(), "vt100".to_string())],
        }
    }

    /// Export an additional environment variable before the command runs
    pub fn export(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.exports.push((key.into(), value.into()));
        self
    }

    fn prelude(&self) -> String {
        self.exports
            .iter()
            .map(|(key, value)| env_export(self.export_template, key, value))
            .collect()
    }

    /// Script for raw mode: markers on both streams, then the command
    pub fn raw(&self, command: &str) -> String {
        let marker = &self.markers.banner;
        format!(
            "{}printf '{marker}'\n(>&2 printf '{marker}')\n{command}\nexit\n",
            self.prelude()
        )
    }

    /// Script for pty mode: silence the terminal and wrap output in delimiters
    pub fn pty(&self, command: &str) -> String {
        let mut script = self.prelude();
        script.push_str("stty raw -echo\n");
        for var in ["PS1", "PS2", "PROMPT_COMMAND"] {
            script.push_str(&env_export(self.export_template, var, ""));
        }
        script.push_str(&format!("printf {}\n", self.markers.pty_start));
        script.push_str(command);
        script.push('\n');
        script.push_str("exitcode=$?\n");
        script.push_str(&format!("printf {}\n", self.markers.pty_end));
        script.push_str("exit $exitcode\n");
        script
    }
}

/// Render an environment export line from the template
pub fn env_export(template: &str, key: &str, value: &str) -> String {
    let mut line = template
        .replace(ENV_KEY_PLACEHOLDER, key)
        .replace(ENV_VALUE_PLACEHOLDER, value);
    line.push('\n');
    line
}

/// The command line exec'd on the channel
///
/// An explicit `shell` overrides the configured one; with `sudo` the shell is
/// substituted into the sudo template.
pub fn shell_command(configured: &str, shell: Option<&str>, sudo_template: Option<&str>) -> String {
    let shell = shell.unwrap_or(configured);
    match sudo_template {
        Some(template) => template.replace(SUDO_PLACEHOLDER, shell),
        None => shell.to_string(),
    }
}

/// Quote a remote path for the shell
pub fn quote(path: &str) -> Cow<'_, str> {
    escape(Cow::Borrowed(path))
}

/// `mkdir -p` for a remote directory
pub fn mkdir_command(dir: &str) -> String {
    format!("mkdir -p {}", quote(dir))
}

/// Start the remote scp in sink mode (we send files)
pub fn scp_sink_command(destination: &str) -> String {
    format!("scp -t {}", quote(destination))
}

/// Start the remote scp in source mode (we receive files)
pub fn scp_source_command(source: &str, recursive: bool) -> String {
    if recursive {
        format!("scp -r -f {}", quote(source))
    } else {
        format!("scp -f {}", quote(source))
    }
}

/// Print the remote `$SSH_AUTH_SOCK` after a blank line
pub const AUTH_SOCK_QUERY: &str = "echo; printf $SSH_AUTH_SOCK";

/// Dump the effective sshd configuration lines mentioning keys
pub const SSHD_KEY_QUERY: &str = "sshd -T | grep key";
