use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::error::{PtyError, Result};

/// Hook run against a freshly created, still suspended child process.
///
/// Receives the native process id and runs before the child executes its
/// first instruction.
pub type SuspendedProcessCallback = Box<dyn FnOnce(u32) + Send>;

/// Terminal dimensions in character cells. Both dimensions are positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawWinSize", into = "RawWinSize")]
pub struct WinSize {
    cols: u16,
    rows: u16,
}

impl WinSize {
    pub const DEFAULT_COLS: u16 = 80;
    pub const DEFAULT_ROWS: u16 = 25;

    /// Fails with [`PtyError::InvalidSize`] if either dimension is zero.
    ///
    /// ```
    /// use ptyspawn::WinSize;
    ///
    /// assert_eq!(WinSize::new(120, 40).unwrap().cols(), 120);
    /// assert!(WinSize::new(0, 40).is_err());
    /// ```
    pub fn new(cols: u16, rows: u16) -> Result<Self> {
        if cols == 0 || rows == 0 {
            return Err(PtyError::InvalidSize { cols, rows });
        }
        Ok(Self { cols, rows })
    }

    pub fn cols(&self) -> u16 {
        self.cols
    }

    pub fn rows(&self) -> u16 {
        self.rows
    }
}

impl Default for WinSize {
    fn default() -> Self {
        Self {
            cols: Self::DEFAULT_COLS,
            rows: Self::DEFAULT_ROWS,
        }
    }
}

impl fmt::Display for WinSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

impl From<WinSize> for portable_pty::PtySize {
    fn from(size: WinSize) -> Self {
        portable_pty::PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RawWinSize {
    cols: u16,
    rows: u16,
}

impl TryFrom<RawWinSize> for WinSize {
    type Error = PtyError;

    fn try_from(raw: RawWinSize) -> Result<Self> {
        WinSize::new(raw.cols, raw.rows)
    }
}

impl From<WinSize> for RawWinSize {
    fn from(size: WinSize) -> Self {
        RawWinSize {
            cols: size.cols,
            rows: size.rows,
        }
    }
}

/// Full spawn configuration, consumed once by
/// [`PtySpawner::spawn`](crate::PtySpawner::spawn).
pub struct PtyOptions {
    command: Command,
    environment: Option<BTreeMap<String, String>>,
    directory: Option<PathBuf>,
    console: bool,
    use_compat_environment: bool,
    initial_size: WinSize,
    redirect_error_stream: bool,
    ansi_color_enabled: bool,
    keep_output_after_termination: bool,
    prefer_native_pseudo_console: bool,
    suspended_process_callback: Option<SuspendedProcessCallback>,
}

impl PtyOptions {
    /// Options for `command` with everything else at its default. The child
    /// inherits our environment and directory on an 80x25 pipe-only console.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            environment: None,
            directory: None,
            console: false,
            use_compat_environment: false,
            initial_size: WinSize::default(),
            redirect_error_stream: false,
            ansi_color_enabled: false,
            keep_output_after_termination: false,
            prefer_native_pseudo_console: false,
            suspended_process_callback: None,
        }
    }

    /// Builds options from deserialized settings.
    pub fn from_settings(settings: PtySettings) -> Result<Self> {
        let size = WinSize::new(
            settings.initial_columns.unwrap_or(WinSize::DEFAULT_COLS),
            settings.initial_rows.unwrap_or(WinSize::DEFAULT_ROWS),
        )?;
        let mut options = PtyOptions::new(Command::new(settings.command)?)
            .console(settings.console)
            .use_compat_environment(settings.use_compat_environment)
            .initial_size(size)
            .redirect_error_stream(settings.redirect_error_stream)
            .ansi_color_enabled(settings.ansi_color_enabled)
            .keep_output_after_termination(settings.keep_output_after_termination)
            .prefer_native_pseudo_console(settings.prefer_native_pseudo_console);
        options.environment = settings.environment;
        options.directory = settings.directory;
        Ok(options)
    }

    /// Replaces the inherited environment with exactly these variables.
    pub fn environment<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.environment = Some(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    /// Working directory of the child. Relative paths resolve against ours.
    pub fn directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.directory = Some(dir.into());
        self
    }

    /// Requests a full OS console window instead of a pipe-only console.
    pub fn console(mut self, console: bool) -> Self {
        self.console = console;
        self
    }

    /// Runs the child under the registered compatibility environment.
    pub fn use_compat_environment(mut self, enabled: bool) -> Self {
        self.use_compat_environment = enabled;
        self
    }

    pub fn initial_size(mut self, size: WinSize) -> Self {
        self.initial_size = size;
        self
    }

    /// Asks for the child's error output on its output stream. Pseudo
    /// terminals merge the two regardless.
    pub fn redirect_error_stream(mut self, enabled: bool) -> Self {
        self.redirect_error_stream = enabled;
        self
    }

    /// Rendering hint forwarded to backends that translate console output.
    pub fn ansi_color_enabled(mut self, enabled: bool) -> Self {
        self.ansi_color_enabled = enabled;
        self
    }

    /// Keeps the process resources alive after exit until its output has
    /// been read.
    pub fn keep_output_after_termination(mut self, enabled: bool) -> Self {
        self.keep_output_after_termination = enabled;
        self
    }

    /// Uses the system pseudo console when available, instead of the legacy
    /// helper.
    pub fn prefer_native_pseudo_console(mut self, enabled: bool) -> Self {
        self.prefer_native_pseudo_console = enabled;
        self
    }

    /// Runs `callback` with the child's pid after it is created and before
    /// its first instruction. Only the pseudo-console backend honors it.
    pub fn suspended_process_callback(mut self, callback: impl FnOnce(u32) + Send + 'static) -> Self {
        self.suspended_process_callback = Some(Box::new(callback));
        self
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    /// The explicit environment, or `None` when the child inherits ours.
    pub fn env(&self) -> Option<&BTreeMap<String, String>> {
        self.environment.as_ref()
    }

    /// The environment the child will see. Inherited variables keep their
    /// native encoding, even when it is not valid Unicode.
    pub fn resolved_env(&self) -> Vec<(OsString, OsString)> {
        match &self.environment {
            Some(env) => env
                .iter()
                .map(|(key, value)| (OsString::from(key), OsString::from(value)))
                .collect(),
            None => std::env::vars_os().collect(),
        }
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    pub fn is_console(&self) -> bool {
        self.console
    }

    pub fn is_compat_environment(&self) -> bool {
        self.use_compat_environment
    }

    pub fn size(&self) -> WinSize {
        self.initial_size
    }

    pub fn is_redirect_error_stream(&self) -> bool {
        self.redirect_error_stream
    }

    pub fn is_ansi_color_enabled(&self) -> bool {
        self.ansi_color_enabled
    }

    pub fn is_keep_output_after_termination(&self) -> bool {
        self.keep_output_after_termination
    }

    pub fn is_prefer_native_pseudo_console(&self) -> bool {
        self.prefer_native_pseudo_console
    }

    pub fn has_suspended_process_callback(&self) -> bool {
        self.suspended_process_callback.is_some()
    }

    /// Hands the suspended-process hook to the backend. Returns `None` on
    /// every call after the first.
    pub fn take_suspended_callback(&mut self) -> Option<SuspendedProcessCallback> {
        self.suspended_process_callback.take()
    }
}

impl fmt::Debug for PtyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtyOptions")
            .field("command", &self.command)
            .field("environment", &self.environment.as_ref().map(BTreeMap::len))
            .field("directory", &self.directory)
            .field("console", &self.console)
            .field("use_compat_environment", &self.use_compat_environment)
            .field("initial_size", &self.initial_size)
            .field("redirect_error_stream", &self.redirect_error_stream)
            .field("ansi_color_enabled", &self.ansi_color_enabled)
            .field("keep_output_after_termination", &self.keep_output_after_termination)
            .field("prefer_native_pseudo_console", &self.prefer_native_pseudo_console)
            .field("suspended_process_callback", &self.has_suspended_process_callback())
            .finish()
    }
}

/// Serializable subset of [`PtyOptions`], for hosts that keep spawn
/// configuration in a settings file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PtySettings {
    pub command: Vec<String>,
    pub environment: Option<BTreeMap<String, String>>,
    pub directory: Option<PathBuf>,
    pub console: bool,
    pub use_compat_environment: bool,
    pub initial_columns: Option<u16>,
    pub initial_rows: Option<u16>,
    pub redirect_error_stream: bool,
    pub ansi_color_enabled: bool,
    pub keep_output_after_termination: bool,
    pub prefer_native_pseudo_console: bool,
}

impl PtySettings {
    /// Parses settings from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sh() -> Command {
        Command::new(["/bin/sh"]).unwrap()
    }

    #[test]
    fn test_default_size() {
        let options = PtyOptions::new(sh());
        assert_eq!(options.size(), WinSize::new(80, 25).unwrap());
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(
            WinSize::new(0, 25),
            Err(PtyError::InvalidSize { cols: 0, rows: 25 })
        ));
        assert!(WinSize::new(80, 0).is_err());
    }

    #[test]
    fn test_builder_flags() {
        let options = PtyOptions::new(sh())
            .console(true)
            .use_compat_environment(true)
            .redirect_error_stream(true)
            .ansi_color_enabled(true)
            .keep_output_after_termination(true)
            .prefer_native_pseudo_console(true)
            .directory("/tmp")
            .environment([("TERM", "xterm-256color")]);

        assert!(options.is_console());
        assert!(options.is_compat_environment());
        assert!(options.is_redirect_error_stream());
        assert!(options.is_ansi_color_enabled());
        assert!(options.is_keep_output_after_termination());
        assert!(options.is_prefer_native_pseudo_console());
        assert_eq!(options.working_dir(), Some(Path::new("/tmp")));
        assert_eq!(
            options.resolved_env(),
            vec![(OsString::from("TERM"), OsString::from("xterm-256color"))]
        );
    }

    #[test]
    fn test_inherits_environment_by_default() {
        let options = PtyOptions::new(sh());
        assert!(options.env().is_none());
        let env = options.resolved_env();
        for var in std::env::vars_os().filter(|(key, _)| key != "PTYSPAWN_RAW_BYTES") {
            assert!(env.contains(&var), "missing {:?}", var.0);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_inherited_environment_keeps_non_unicode_values() {
        use std::os::unix::ffi::OsStringExt;

        let value = OsString::from_vec(vec![b'a', 0xff, b'b']);
        std::env::set_var("PTYSPAWN_RAW_BYTES", &value);
        let env = PtyOptions::new(sh()).resolved_env();
        std::env::remove_var("PTYSPAWN_RAW_BYTES");

        assert!(env.contains(&(OsString::from("PTYSPAWN_RAW_BYTES"), value)));
    }

    #[test]
    fn test_suspended_callback_taken_once() {
        let mut options = PtyOptions::new(sh()).suspended_process_callback(|_pid| {});
        assert!(options.has_suspended_process_callback());
        assert!(options.take_suspended_callback().is_some());
        assert!(options.take_suspended_callback().is_none());
    }

    #[test]
    fn test_settings_from_json() {
        let settings = PtySettings::from_json(
            r#"{
                "command": ["/bin/sh", "-l"],
                "environment": {"LANG": "C.UTF-8"},
                "initial_columns": 132,
                "keep_output_after_termination": true
            }"#,
        )
        .unwrap();
        let options = PtyOptions::from_settings(settings).unwrap();

        assert_eq!(options.command().argv(), &["/bin/sh".to_string(), "-l".to_string()]);
        assert_eq!(options.size(), WinSize::new(132, 25).unwrap());
        assert!(options.is_keep_output_after_termination());
        assert!(!options.is_console());
        assert_eq!(
            options.env().and_then(|env| env.get("LANG")).map(String::as_str),
            Some("C.UTF-8")
        );
    }

    #[test]
    fn test_settings_validation() {
        let missing_command = PtySettings::default();
        assert!(matches!(
            PtyOptions::from_settings(missing_command),
            Err(PtyError::EmptyCommand)
        ));

        let zero_rows = PtySettings {
            command: vec!["sh".into()],
            initial_rows: Some(0),
            ..PtySettings::default()
        };
        assert!(PtyOptions::from_settings(zero_rows).is_err());

        assert!(matches!(
            PtySettings::from_json("{not json"),
            Err(PtyError::Settings(_))
        ));
    }

    #[test]
    fn test_win_size_serde_validates() {
        let size: WinSize = serde_json::from_str(r#"{"cols": 100, "rows": 30}"#).unwrap();
        assert_eq!(size.to_string(), "100x30");
        assert!(serde_json::from_str::<WinSize>(r#"{"cols": 0, "rows": 30}"#).is_err());
    }
}
