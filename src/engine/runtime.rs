//! Runtime Prerequisite & Dependency Installation
//!
//! Locates the language runtime the application needs and drives its
//! package installer. Both are external collaborators of the update pipeline.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("No runtime found on PATH (tried: {})", .candidates.join(", "))]
    NotFound { candidates: Vec<String> },
    #[error("Runtime at {path} is not usable: {reason}")]
    Unhealthy { path: PathBuf, reason: String },
    #[error("Requirements file not found: {0}")]
    MissingRequirements(PathBuf),
    #[error("Dependency installation failed ({status}): {output}")]
    InstallFailed { status: String, output: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeInfo {
    pub executable: PathBuf,
    pub version: String,
}

pub trait RuntimeProbe {
    fn locate(&self) -> Result<RuntimeInfo, RuntimeError>;
}

pub trait DependencyInstaller {
    fn install(&self, runtime: &RuntimeInfo, app_dir: &Path, requirements: &Path) -> Result<(), RuntimeError>;
}

/// Probe PATH for the first candidate that answers `--version`
pub struct PathProbe {
    candidates: Vec<String>,
    timeout: Duration,
}

impl PathProbe {
    pub fn new(candidates: &[String]) -> Self {
        Self {
            candidates: candidates.to_vec(),
            timeout: Duration::from_secs(15),
        }
    }

    fn check_version(&self, executable: &Path) -> Result<String, RuntimeError> {
        let mut child = Command::new(executable)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let start = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if start.elapsed() > self.timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(RuntimeError::Unhealthy {
                    path: executable.to_path_buf(),
                    reason: "timed out answering --version".to_string(),
                });
            }
            std::thread::sleep(Duration::from_millis(50));
        };

        let mut output = String::new();
        if let Some(mut stdout) = child.stdout.take() {
            stdout.read_to_string(&mut output)?;
        }
        // Older interpreters print the version on stderr
        if output.trim().is_empty() {
            if let Some(mut stderr) = child.stderr.take() {
                stderr.read_to_string(&mut output)?;
            }
        }

        if !status.success() {
            return Err(RuntimeError::Unhealthy {
                path: executable.to_path_buf(),
                reason: format!("exit code {:?}", status.code()),
            });
        }
        Ok(output.trim().to_string())
    }
}

impl RuntimeProbe for PathProbe {
    fn locate(&self) -> Result<RuntimeInfo, RuntimeError> {
        for candidate in &self.candidates {
            let Ok(executable) = which::which(candidate) else {
                debug!(candidate = %candidate, "Not on PATH");
                continue;
            };
            match self.check_version(&executable) {
                Ok(version) => {
                    info!(path = %executable.display(), version = %version, "Runtime found");
                    return Ok(RuntimeInfo { executable, version });
                }
                // e.g. the Windows Store alias that only opens the store
                Err(e) => debug!(candidate = %candidate, error = %e, "Runtime rejected"),
            }
        }
        Err(RuntimeError::NotFound {
            candidates: self.candidates.clone(),
        })
    }
}

/// `<runtime> -m pip install -r <requirements>`
pub struct PipInstaller;

impl DependencyInstaller for PipInstaller {
    fn install(&self, runtime: &RuntimeInfo, app_dir: &Path, requirements: &Path) -> Result<(), RuntimeError> {
        let requirements = app_dir.join(requirements);
        if !requirements.exists() {
            return Err(RuntimeError::MissingRequirements(requirements));
        }

        info!(requirements = %requirements.display(), "Installing dependencies");
        let output = Command::new(&runtime.executable)
            .args(["-m", "pip", "install", "--disable-pip-version-check", "-r"])
            .arg(&requirements)
            .current_dir(app_dir)
            .stdin(Stdio::null())
            .output()?;

        if output.status.success() {
            return Ok(());
        }
        Err(RuntimeError::InstallFailed {
            status: describe_status(&output.status),
            output: tail(&String::from_utf8_lossy(&output.stderr), 15),
        })
    }
}

/// Start the application in the foreground and wait for it to exit
pub fn launch(runtime: &RuntimeInfo, app_dir: &Path, args: &[String]) -> Result<ExitStatus, RuntimeError> {
    info!(runtime = %runtime.executable.display(), args = ?args, "Launching application");
    Ok(Command::new(&runtime.executable)
        .args(args)
        .current_dir(app_dir)
        .status()?)
}

fn describe_status(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}

/// Last `lines` lines of a process transcript
fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
