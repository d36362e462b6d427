//! Core process supervision
//!
//! One [`Process`] per started core binary. A process is started from a
//! fully built config model, validated by the binary's own check command
//! first, and torn down with a graceful signal followed by a force kill.
//!
//! Crash detection is advisory: the supervisor only records the exit and the
//! last meaningful log line, the health job decides what to do about it.

mod config_file;
mod log_filter;
mod process;
mod version;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, error};

use crate::common::{Error, Result};
use crate::model::CoreType;

pub use config_file::{select_config_path, write_atomic, write_config};
pub use log_filter::{classify, LogFilter, LogLevel, LogLine};
pub use process::{Process, ProcessState};
pub use version::parse_version;

/// Upper bound for `check` and `version` invocations
const COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

/// How long a fresh process must stay alive to count as started
const STARTUP_GRACE: Duration = Duration::from_millis(500);

/// Everything needed to launch one core binary
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub core: CoreType,
    pub binary: PathBuf,
    /// Preferred config file location
    pub config_path: PathBuf,
    /// Used in order when `config_path` is occupied by a directory
    pub alternative_paths: Vec<PathBuf>,
    pub log_folder: Option<PathBuf>,
    pub startup_grace: Duration,
}

impl ProcessSpec {
    /// Standard layout under a binary folder.
    pub fn for_core(core: CoreType, bin_folder: &Path) -> Self {
        let (config_path, alternative_paths) = config_paths(core, bin_folder);
        ProcessSpec {
            core,
            binary: resolve_binary(core, bin_folder),
            config_path,
            alternative_paths,
            log_folder: None,
            startup_grace: STARTUP_GRACE,
        }
    }

    pub fn with_log_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.log_folder = Some(folder.into());
        self
    }

    /// Arguments validating a config file without running it
    pub fn check_args(&self, config: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = match self.core {
            CoreType::Xray => vec!["run".into(), "-test".into()],
            CoreType::SingBox => vec!["check".into()],
        };
        args.push("-c".into());
        args.push(config.as_os_str().to_owned());
        args
    }

    pub fn run_args(&self, config: &Path) -> Vec<OsString> {
        vec!["run".into(), "-c".into(), config.as_os_str().to_owned()]
    }

    /// Where a candidate config is written before it is checked
    pub fn staged_path(&self) -> PathBuf {
        let mut name = self
            .config_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| OsString::from("config.json"));
        name.push(".staged");
        self.config_path.with_file_name(name)
    }

    /// Ask the binary for its version. `"Unknown"` on any failure.
    pub async fn version(&self) -> String {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("version").kill_on_drop(true);
        match timeout(COMMAND_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) if output.status.success() => {
                parse_version(self.core, &String::from_utf8_lossy(&output.stdout))
            }
            Ok(Ok(_)) | Ok(Err(_)) | Err(_) => version::UNKNOWN.to_string(),
        }
    }

    /// Run the binary's config check against a file on disk.
    pub async fn check_file(&self, config: &Path) -> Result<()> {
        if !self.binary.exists() {
            return Err(Error::process(
                self.core.as_str(),
                format!("binary not found at {}", self.binary.display()),
            ));
        }

        let mut cmd = Command::new(&self.binary);
        cmd.args(self.check_args(config)).kill_on_drop(true);
        let output = timeout(COMMAND_TIMEOUT, cmd.output())
            .await
            .map_err(|_| Error::timeout(format!("{} config check", self.core)))?
            .map_err(|e| Error::process(self.core.as_str(), format!("check failed to run: {}", e)))?;

        if output.status.success() {
            debug!("{} config at {} passed check", self.core, config.display());
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let text = if stderr.is_empty() {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        } else {
            stderr
        };
        let text = if text.is_empty() {
            describe_exit(output.status)
        } else {
            text
        };
        error!(
            "{} config validation failed. Binary: {}, config: {}, error: {}",
            self.core,
            self.binary.display(),
            config.display(),
            text
        );
        Err(Error::validation(self.core.as_str(), text))
    }

    /// Write `data` to the staged path, check it and remove it again.
    pub async fn check_bytes(&self, data: &[u8]) -> Result<()> {
        let staged = self.staged_path();
        write_atomic(&staged, data).await?;
        let result = self.check_file(&staged).await;
        if let Err(e) = tokio::fs::remove_file(&staged).await {
            debug!("Could not remove staged config {}: {}", staged.display(), e);
        }
        result
    }
}

/// Go-style OS name, as used in release asset names
pub fn go_os() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}

/// Go-style architecture name
pub fn go_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64",
        other => other,
    }
}

/// `{core}-{os}-{arch}` with Go naming
pub fn binary_name(core: CoreType) -> String {
    format!("{}-{}-{}", core.as_str(), go_os(), go_arch())
}

/// First existing binary among the known names; the primary name otherwise.
pub fn resolve_binary(core: CoreType, bin_folder: &Path) -> PathBuf {
    let primary = bin_folder.join(binary_name(core));
    if primary.exists() {
        return primary;
    }

    let stem = core.as_str();
    let alternatives = [
        format!("{}-linux-{}", stem, go_arch()),
        format!("{}-linux-amd64", stem),
        format!("{}-linux-arm64", stem),
        format!("{}-linux-armv7", stem),
        stem.to_string(),
    ];
    alternatives
        .iter()
        .map(|name| bin_folder.join(name))
        .find(|path| path.exists())
        .unwrap_or(primary)
}

/// Primary config path and its ordered fallbacks
pub fn config_paths(core: CoreType, bin_folder: &Path) -> (PathBuf, Vec<PathBuf>) {
    let (file, alt, app, tmp) = match core {
        CoreType::Xray => (
            "config.json",
            "config-alt.json",
            "/app/config/config.json",
            "/tmp/xray-config.json",
        ),
        CoreType::SingBox => (
            "sing-box-config.json",
            "sing-box-config-alt.json",
            "/app/config/sing-box-config.json",
            "/tmp/sing-box-config.json",
        ),
    };
    (
        bin_folder.join(file),
        vec![bin_folder.join(alt), PathBuf::from(app), PathBuf::from(tmp)],
    )
}

/// Go-compatible description of an exit status
pub(crate) fn describe_exit(status: std::process::ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit status {}", code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("signal: {}", signal);
        }
    }
    "exit status unknown".to_string()
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::{Path, PathBuf};

    /// A core that validates everything and runs until signalled
    pub(crate) const FAKE_CORE: &str = r#"
case "$1" in
  version) echo "Xray 1.8.24 (Xray, Penetrates Everything.)" ;;
  check) exit 0 ;;
  run)
    if [ "$2" = "-test" ]; then exit 0; fi
    echo "2024/01/01 12:00:00 [Info] core: started"
    exec sleep 30 ;;
esac
"#;

    pub(crate) fn scratch_dir(name: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "corepanel-{}-{}-{}",
            name,
            std::process::id(),
            nanos
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Write an executable `/bin/sh` script into `dir`.
    #[cfg(unix)]
    pub(crate) fn fake_binary(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-core");
        std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }
}
