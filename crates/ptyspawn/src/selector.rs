//! Picks exactly one backend per spawn.
//!
//! Selection only consults a [`CapabilityProbe`]; nothing is acquired for a
//! backend that is not chosen. A pseudo console that fails to load is logged
//! and the decision falls through to the legacy helper.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::error::{PtyError, Result};
use crate::native::NativePtyProcess;
use crate::options::PtyOptions;
use crate::process::{Process, PtyProcess};

/// The backends a process can be spawned with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// POSIX-emulation environment on a non-POSIX OS.
    CompatEnvironment,
    /// Windows pseudo console.
    ConPty,
    /// PTY semantics through a helper library, for Windows hosts where the
    /// pseudo console is unusable or a console window is wanted.
    LegacyHelper,
    /// The OS's own PTY syscalls.
    Native,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::CompatEnvironment => "compatibility-environment",
            BackendKind::ConPty => "pseudo-console",
            BackendKind::LegacyHelper => "legacy pty-helper",
            BackendKind::Native => "native pty",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformFamily {
    Windows,
    Unix,
}

/// Why the pseudo console could not be used.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("pseudo console is unavailable: {0}")]
    CapabilityUnavailable(String),
}

/// What the running platform can do.
pub trait CapabilityProbe: Send + Sync {
    fn family(&self) -> PlatformFamily;

    /// Whether the OS version ships a pseudo console at all.
    fn supports_pseudo_console(&self) -> bool;

    /// Loads the pseudo-console entry points. Called only when the pseudo
    /// console would otherwise be chosen.
    fn load_pseudo_console(&self) -> std::result::Result<(), CapabilityError>;
}

/// Probe for the platform this binary runs on.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostPlatform;

impl CapabilityProbe for HostPlatform {
    fn family(&self) -> PlatformFamily {
        if cfg!(windows) {
            PlatformFamily::Windows
        } else {
            PlatformFamily::Unix
        }
    }

    #[cfg(windows)]
    fn supports_pseudo_console(&self) -> bool {
        crate::win::conpty_supported()
    }

    #[cfg(not(windows))]
    fn supports_pseudo_console(&self) -> bool {
        false
    }

    #[cfg(windows)]
    fn load_pseudo_console(&self) -> std::result::Result<(), CapabilityError> {
        crate::win::load_conpty().map_err(CapabilityError::CapabilityUnavailable)
    }

    #[cfg(not(windows))]
    fn load_pseudo_console(&self) -> std::result::Result<(), CapabilityError> {
        Err(CapabilityError::CapabilityUnavailable(
            "not a Windows host".to_string(),
        ))
    }
}

/// Outcome of backend selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub kind: BackendKind,
    /// Set when the pseudo console was wanted but failed to load.
    pub fallback: Option<CapabilityError>,
}

impl Selection {
    fn chosen(kind: BackendKind) -> Self {
        Self {
            kind,
            fallback: None,
        }
    }
}

/// Chooses the backend for `options`. Never fails.
pub fn select(options: &PtyOptions, probe: &dyn CapabilityProbe) -> Selection {
    if options.is_compat_environment() {
        return Selection::chosen(BackendKind::CompatEnvironment);
    }
    match probe.family() {
        PlatformFamily::Windows => {
            let wants_pseudo_console = probe.supports_pseudo_console()
                && !options.is_console()
                && options.is_prefer_native_pseudo_console();
            if !wants_pseudo_console {
                return Selection::chosen(BackendKind::LegacyHelper);
            }
            match probe.load_pseudo_console() {
                Ok(()) => Selection::chosen(BackendKind::ConPty),
                Err(err) => {
                    log::info!("cannot use pseudo console, falling back to legacy helper: {err}");
                    Selection {
                        kind: BackendKind::LegacyHelper,
                        fallback: Some(err),
                    }
                }
            }
        }
        PlatformFamily::Unix => Selection::chosen(BackendKind::Native),
    }
}

/// A backend implemented outside this crate.
pub trait ExternalBackend: Send + Sync {
    fn spawn(&self, options: PtyOptions) -> Result<Box<dyn PtyProcess>>;
}

/// Spawns processes with the backend [`select`] picks.
///
/// The pseudo console and the native Unix PTY are built in. The legacy
/// helper and the compatibility environment live outside this crate and must
/// be registered; spawning one that is not fails with
/// [`PtyError::BackendUnavailable`].
pub struct PtySpawner {
    probe: Box<dyn CapabilityProbe>,
    compat_environment: Option<Arc<dyn ExternalBackend>>,
    legacy_helper: Option<Arc<dyn ExternalBackend>>,
}

impl PtySpawner {
    /// A spawner probing the host this binary runs on.
    pub fn new() -> Self {
        Self::with_probe(HostPlatform)
    }

    /// A spawner that asks `probe` instead of the host.
    pub fn with_probe(probe: impl CapabilityProbe + 'static) -> Self {
        Self {
            probe: Box::new(probe),
            compat_environment: None,
            legacy_helper: None,
        }
    }

    /// Registers the compatibility-environment backend.
    pub fn compat_environment(mut self, backend: Arc<dyn ExternalBackend>) -> Self {
        self.compat_environment = Some(backend);
        self
    }

    /// Registers the legacy pty-helper backend used on Windows when the
    /// pseudo console is unusable, unwanted, or a console window is requested.
    pub fn legacy_helper(mut self, backend: Arc<dyn ExternalBackend>) -> Self {
        self.legacy_helper = Some(backend);
        self
    }

    pub fn select(&self, options: &PtyOptions) -> Selection {
        select(options, self.probe.as_ref())
    }

    pub fn spawn(&self, options: PtyOptions) -> Result<Process> {
        let selection = self.select(&options);
        log::debug!("spawning `{}` with the {} backend", options.command(), selection.kind);
        match selection.kind {
            BackendKind::ConPty => spawn_conpty(options),
            BackendKind::Native => NativePtyProcess::spawn(options).map(Process::Native),
            BackendKind::LegacyHelper => match &self.legacy_helper {
                Some(backend) => external(BackendKind::LegacyHelper, backend.as_ref(), options),
                None => Err(PtyError::BackendUnavailable(BackendKind::LegacyHelper)),
            },
            BackendKind::CompatEnvironment => match &self.compat_environment {
                Some(backend) => {
                    external(BackendKind::CompatEnvironment, backend.as_ref(), options)
                }
                None => Err(PtyError::BackendUnavailable(BackendKind::CompatEnvironment)),
            },
        }
    }
}

impl Default for PtySpawner {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns with the host's capabilities and default backends.
pub fn spawn(options: PtyOptions) -> Result<Process> {
    PtySpawner::new().spawn(options)
}

fn external(kind: BackendKind, backend: &dyn ExternalBackend, options: PtyOptions) -> Result<Process> {
    backend
        .spawn(options)
        .map(|process| Process::External { kind, process })
}

#[cfg(windows)]
fn spawn_conpty(options: PtyOptions) -> Result<Process> {
    crate::win::ConPtyProcess::create(options).map(Process::ConPty)
}

#[cfg(not(windows))]
fn spawn_conpty(_options: PtyOptions) -> Result<Process> {
    Err(PtyError::BackendUnavailable(BackendKind::ConPty))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::exit::ExitStatus;
    use crate::options::WinSize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeProbe {
        family: PlatformFamily,
        supported: bool,
        loads: bool,
        load_calls: Arc<AtomicUsize>,
    }

    impl FakeProbe {
        fn windows(supported: bool, loads: bool) -> Self {
            Self {
                family: PlatformFamily::Windows,
                supported,
                loads,
                load_calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn unix() -> Self {
            Self {
                family: PlatformFamily::Unix,
                supported: false,
                loads: false,
                load_calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl CapabilityProbe for FakeProbe {
        fn family(&self) -> PlatformFamily {
            self.family
        }

        fn supports_pseudo_console(&self) -> bool {
            self.supported
        }

        fn load_pseudo_console(&self) -> std::result::Result<(), CapabilityError> {
            self.load_calls.fetch_add(1, Ordering::SeqCst);
            if self.loads {
                Ok(())
            } else {
                Err(CapabilityError::CapabilityUnavailable(
                    "entry point not found".to_string(),
                ))
            }
        }
    }

    fn options() -> PtyOptions {
        PtyOptions::new(Command::new(["/bin/sh", "-c", "exit 0"]).unwrap())
    }

    #[test]
    fn test_compat_environment_wins_over_everything() {
        let probe = FakeProbe::windows(true, true);
        let opts = options()
            .use_compat_environment(true)
            .prefer_native_pseudo_console(true);
        assert_eq!(select(&opts, &probe).kind, BackendKind::CompatEnvironment);
        assert_eq!(select(&opts, &FakeProbe::unix()).kind, BackendKind::CompatEnvironment);
        assert_eq!(probe.load_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_pseudo_console_chosen_when_usable() {
        let probe = FakeProbe::windows(true, true);
        let selection = select(&options().prefer_native_pseudo_console(true), &probe);
        assert_eq!(selection, Selection::chosen(BackendKind::ConPty));
    }

    #[test]
    fn test_console_mode_uses_legacy_helper() {
        let probe = FakeProbe::windows(true, true);
        let opts = options().prefer_native_pseudo_console(true).console(true);
        assert_eq!(select(&opts, &probe).kind, BackendKind::LegacyHelper);
        assert_eq!(probe.load_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_pseudo_console_not_requested() {
        let probe = FakeProbe::windows(true, true);
        assert_eq!(select(&options(), &probe).kind, BackendKind::LegacyHelper);
    }

    #[test]
    fn test_old_windows_uses_legacy_helper() {
        let probe = FakeProbe::windows(false, true);
        let opts = options().prefer_native_pseudo_console(true);
        assert_eq!(select(&opts, &probe).kind, BackendKind::LegacyHelper);
        assert_eq!(probe.load_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_load_failure_falls_back() {
        let probe = FakeProbe::windows(true, false);
        let selection = select(&options().prefer_native_pseudo_console(true), &probe);
        assert_eq!(selection.kind, BackendKind::LegacyHelper);
        assert!(matches!(
            selection.fallback,
            Some(CapabilityError::CapabilityUnavailable(_))
        ));
    }

    #[test]
    fn test_unix_uses_native() {
        let opts = options().prefer_native_pseudo_console(true).console(true);
        assert_eq!(select(&opts, &FakeProbe::unix()), Selection::chosen(BackendKind::Native));
    }

    #[test]
    fn test_selection_is_deterministic() {
        let probe = FakeProbe::windows(true, false);
        let opts = options().prefer_native_pseudo_console(true);
        let first = select(&opts, &probe);
        for _ in 0..10 {
            assert_eq!(select(&opts, &probe), first);
        }
    }

    #[test]
    fn test_host_probe() {
        let family = HostPlatform.family();
        if cfg!(windows) {
            assert_eq!(family, PlatformFamily::Windows);
        } else {
            assert_eq!(family, PlatformFamily::Unix);
            assert!(!HostPlatform.supports_pseudo_console());
        }
    }

    #[test]
    fn test_legacy_helper_needs_registration() {
        let spawner = PtySpawner::with_probe(FakeProbe::windows(true, false));
        let opts = options().prefer_native_pseudo_console(true);
        assert_eq!(spawner.select(&opts).kind, BackendKind::LegacyHelper);
        assert!(matches!(
            spawner.spawn(opts),
            Err(PtyError::BackendUnavailable(BackendKind::LegacyHelper))
        ));

        let console = options().console(true);
        assert!(matches!(
            spawner.spawn(console),
            Err(PtyError::BackendUnavailable(BackendKind::LegacyHelper))
        ));
    }

    #[test]
    fn test_compat_environment_needs_registration() {
        let spawner = PtySpawner::with_probe(FakeProbe::unix());
        let result = spawner.spawn(options().use_compat_environment(true));
        assert!(matches!(
            result,
            Err(PtyError::BackendUnavailable(BackendKind::CompatEnvironment))
        ));
    }

    #[cfg(unix)]
    mod spawning {
        use super::*;
        use std::io::Read;

        /// External backend that delegates to the native one and counts calls.
        struct CountingBackend {
            spawns: AtomicUsize,
        }

        impl ExternalBackend for CountingBackend {
            fn spawn(&self, options: PtyOptions) -> Result<Box<dyn PtyProcess>> {
                self.spawns.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(NativePtyProcess::spawn(options)?))
            }
        }

        fn sh(script: &str) -> PtyOptions {
            PtyOptions::new(Command::new(["/bin/sh", "-c", script]).unwrap())
        }

        #[test]
        fn test_default_spawn_on_unix() {
            let process = spawn(sh("exit 0")).unwrap();
            assert_eq!(process.kind(), BackendKind::Native);
            assert_eq!(process.wait_for(), ExitStatus::Code(0));
        }

        #[test]
        fn test_win_size_round_trip() {
            let process = spawn(PtyOptions::new(Command::new(["echo", "hello"]).unwrap())).unwrap();
            assert_eq!(process.win_size().unwrap(), WinSize::new(80, 25).unwrap());
            let size = WinSize::new(132, 43).unwrap();
            process.set_win_size(size).unwrap();
            assert_eq!(process.win_size().unwrap(), size);
            process.wait_for();
        }

        #[test]
        fn test_exit_code_42() {
            let process = spawn(sh("exit 42")).unwrap();
            assert_eq!(process.wait_for(), ExitStatus::Code(42));
            assert!(!process.is_alive());
            assert_eq!(process.exit_value().unwrap(), ExitStatus::Code(42));
        }

        #[test]
        fn test_fallback_spawn_satisfies_contract() {
            let backend = Arc::new(CountingBackend {
                spawns: AtomicUsize::new(0),
            });
            let spawner = PtySpawner::with_probe(FakeProbe::windows(true, false))
                .legacy_helper(backend.clone());
            let process = spawner
                .spawn(sh("printf ready; exit 3").prefer_native_pseudo_console(true))
                .unwrap();
            assert_eq!(process.kind(), BackendKind::LegacyHelper);
            assert_eq!(backend.spawns.load(Ordering::SeqCst), 1);
            assert_eq!(process.win_size().unwrap(), WinSize::default());
            assert_eq!(
                process.wait_for_timeout(Duration::from_secs(5)),
                Some(ExitStatus::Code(3))
            );
            assert_eq!(process.exit_value().unwrap(), ExitStatus::Code(3));
            process.destroy();
        }

        #[test]
        fn test_registered_legacy_helper_is_used() {
            let backend = Arc::new(CountingBackend {
                spawns: AtomicUsize::new(0),
            });
            let spawner = PtySpawner::with_probe(FakeProbe::windows(false, false))
                .legacy_helper(backend.clone());
            let process = spawner.spawn(sh("exit 0")).unwrap();
            assert_eq!(process.kind(), BackendKind::LegacyHelper);
            assert!(process.command().is_none());
            assert_eq!(process.wait_for(), ExitStatus::Code(0));
            assert_eq!(backend.spawns.load(Ordering::SeqCst), 1);
        }

        #[test]
        fn test_registered_compat_environment_is_used() {
            let backend = Arc::new(CountingBackend {
                spawns: AtomicUsize::new(0),
            });
            let spawner = PtySpawner::with_probe(FakeProbe::unix()).compat_environment(backend.clone());
            let process = spawner
                .spawn(sh("exit 0").use_compat_environment(true))
                .unwrap();
            assert_eq!(process.kind(), BackendKind::CompatEnvironment);
            process.wait_for();
            assert_eq!(backend.spawns.load(Ordering::SeqCst), 1);
        }

        #[test]
        fn test_conpty_unavailable_off_windows() {
            let spawner = PtySpawner::with_probe(FakeProbe::windows(true, true));
            let result = spawner.spawn(sh("exit 0").prefer_native_pseudo_console(true));
            assert!(matches!(
                result,
                Err(PtyError::BackendUnavailable(BackendKind::ConPty))
            ));
        }

        #[tokio::test]
        async fn test_exit_watcher() {
            let process = spawn(sh("exit 7")).unwrap();
            let mut watcher = process.exit_watcher();
            assert_eq!(watcher.wait().await, ExitStatus::Code(7));
        }

        #[test]
        fn test_keep_output_after_termination() {
            let process = spawn(sh("printf 0123456789").keep_output_after_termination(true)).unwrap();
            process.wait_for();
            assert!(!process.is_alive());

            let mut output = Vec::new();
            process.reader().read_to_end(&mut output).unwrap();
            assert_eq!(output, b"0123456789");

            let mut buf = [0u8; 8];
            assert_eq!(process.reader().read(&mut buf).unwrap(), 0);
        }

        #[test]
        fn test_error_stream_is_empty() {
            let process = spawn(sh("echo oops >&2; exit 1")).unwrap();
            let mut buf = [0u8; 8];
            assert_eq!(process.error_reader().read(&mut buf).unwrap(), 0);
            process.wait_for();
        }
    }
}
