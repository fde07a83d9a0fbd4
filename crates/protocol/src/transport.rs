use std::path::Path;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ProtocolError;

/// Platform-specific control-channel listener. POSIX binds a Unix domain
/// socket; the Windows family binds a named pipe (spec.md §6: "Unix domain
/// socket ... on POSIX; named pipe ... on the Windows family").
#[cfg(unix)]
pub struct Listener(tokio::net::UnixListener);

#[cfg(unix)]
impl Listener {
    pub async fn bind(path: &Path) -> Result<Self, ProtocolError> {
        if path.exists() {
            tokio::fs::remove_file(path).await?;
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let listener = tokio::net::UnixListener::bind(path)?;

        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)?;

        Ok(Self(listener))
    }

    pub async fn accept(&self) -> Result<(impl AsyncRead + AsyncWrite + Unpin + Send, ()), ProtocolError> {
        let (stream, _addr) = self.0.accept().await?;
        Ok((stream, ()))
    }
}

#[cfg(windows)]
pub struct Listener {
    path: String,
}

#[cfg(windows)]
impl Listener {
    pub async fn bind(path: &Path) -> Result<Self, ProtocolError> {
        Ok(Self {
            path: path.to_string_lossy().into_owned(),
        })
    }

    pub async fn accept(&self) -> Result<(impl AsyncRead + AsyncWrite + Unpin + Send, ()), ProtocolError> {
        use tokio::net::windows::named_pipe::ServerOptions;

        let server = ServerOptions::new()
            .first_pipe_instance(false)
            .create(&self.path)?;
        server.connect().await?;
        Ok((server, ()))
    }
}

/// Default control-channel socket path: `<user-home>/.poppobuilder/daemon.sock`
/// on POSIX, `\\.\pipe\poppobuilder-daemon` on the Windows family.
pub fn default_socket_path() -> std::path::PathBuf {
    #[cfg(unix)]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        std::path::PathBuf::from(home).join(".poppobuilder").join("daemon.sock")
    }
    #[cfg(windows)]
    {
        std::path::PathBuf::from(r"\\.\pipe\poppobuilder-daemon")
    }
}
