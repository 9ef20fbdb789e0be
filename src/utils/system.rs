use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    process::ExitStatus,
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{fs, process::Command, time::timeout};
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("The reload command is empty")]
    EmptyCommand,

    #[error("Failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("`{command}` did not finish within {timeout:?}")]
    TimedOut { command: String, timeout: Duration },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Asks the external web server to reload its configuration
#[async_trait]
pub trait ReloadSignal: Send + Sync {
    async fn reload(&self) -> Result<(), SystemError>;
}

/// Makes a virtual-host document visible to the web server
#[async_trait]
pub trait ActivationLinker: Send + Sync {
    /// Point `link` at `document`, replacing whatever `link` currently is
    async fn activate(&self, document: &Path, link: &Path) -> Result<(), SystemError>;

    /// Remove `link`. A missing link is not an error
    async fn deactivate(&self, link: &Path) -> Result<(), SystemError>;
}

/// Reloads the web server by running an external command,
/// `systemctl reload nginx` by default
#[derive(Debug, Clone)]
pub struct CommandReload {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandReload {
    pub fn new(command: &[String], timeout: Duration) -> Result<Self, SystemError> {
        let (program, args) = command.split_first().ok_or(SystemError::EmptyCommand)?;
        if program.trim().is_empty() {
            return Err(SystemError::EmptyCommand);
        }
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
        })
    }

    fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl ReloadSignal for CommandReload {
    async fn reload(&self) -> Result<(), SystemError> {
        let command = self.display();
        let output = Command::new(&self.program)
            .args(&self.args)
            .kill_on_drop(true)
            .output();

        let output = timeout(self.timeout, output)
            .await
            .map_err(|_| SystemError::TimedOut {
                command: command.clone(),
                timeout: self.timeout,
            })?
            .map_err(|source| SystemError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(SystemError::Failed {
                command,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        info!("Web server reloaded with `{command}`");
        Ok(())
    }
}

/// Activates documents through symbolic links, the `sites-enabled` model
#[derive(Debug, Clone, Copy, Default)]
pub struct SymlinkActivation;

#[async_trait]
impl ActivationLinker for SymlinkActivation {
    async fn activate(&self, document: &Path, link: &Path) -> Result<(), SystemError> {
        let io_err = |source| SystemError::Io {
            path: link.to_path_buf(),
            source,
        };

        match fs::symlink_metadata(link).await {
            Ok(_) => {
                debug!(link = %link.display(), "Replacing existing activation link");
                fs::remove_file(link).await.map_err(io_err)?;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => (),
            Err(e) => return Err(io_err(e)),
        }

        fs::symlink(document, link).await.map_err(io_err)
    }

    async fn deactivate(&self, link: &Path) -> Result<(), SystemError> {
        match fs::remove_file(link).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SystemError::Io {
                path: link.to_path_buf(),
                source,
            }),
        }
    }
}
