use std::path::Path;
use std::sync::Arc;

use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::command::CommandName;
use crate::error::ProtocolError;
use crate::frame::{read_frame, write_frame};
use crate::message::Message;
use crate::registry::CommandRegistry;
use crate::transport::Listener;

/// Server-side configuration for the control channel (spec.md §4.5/§6).
#[derive(Clone)]
pub struct ServerConfig {
    pub auth_token: Option<String>,
}

/// Accept loop for the control channel. Spawns one task per connection and
/// never returns under normal operation; the caller races it against a
/// shutdown signal.
pub async fn serve(
    socket_path: &Path,
    registry: Arc<CommandRegistry>,
    config: ServerConfig,
    events: broadcast::Sender<Message>,
) -> Result<(), ProtocolError> {
    let listener = Listener::bind(socket_path).await?;
    tracing::info!(path = %socket_path.display(), "control channel listening");

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let registry = Arc::clone(&registry);
                let config = config.clone();
                let events = events.subscribe();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, registry, config, events).await {
                        tracing::debug!(error = %e, "control channel connection closed");
                    }
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to accept control channel connection");
            }
        }
    }
}

async fn handle_connection<S>(
    stream: S,
    registry: Arc<CommandRegistry>,
    config: ServerConfig,
    mut events: broadcast::Receiver<Message>,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, mut writer) = split(stream);

    let auth_required = config.auth_token.is_some();
    write_frame(&mut writer, &Message::welcome(auth_required).to_bytes()?).await?;

    let mut authenticated = !auth_required;

    if auth_required {
        let payload = read_frame(&mut reader).await?;
        match Message::from_bytes(&payload)? {
            Message::Auth { token, .. } => {
                if Some(&token) == config.auth_token.as_ref() {
                    write_frame(&mut writer, &Message::auth_success(Uuid::new_v4().to_string()).to_bytes()?).await?;
                    authenticated = true;
                } else {
                    write_frame(
                        &mut writer,
                        &Message::response_err("", "invalid auth token", "AuthRequired").to_bytes()?,
                    )
                    .await?;
                    writer.shutdown().await.ok();
                    return Err(ProtocolError::AuthRequired);
                }
            }
            _ => {
                write_frame(
                    &mut writer,
                    &Message::response_err("", "authentication required", "AuthRequired").to_bytes()?,
                )
                .await?;
                writer.shutdown().await.ok();
                return Err(ProtocolError::AuthRequired);
            }
        }
    }

    loop {
        tokio::select! {
            frame = read_frame(&mut reader) => {
                let payload = frame?;
                let message = Message::from_bytes(&payload)?;
                if let Message::Command { id, command, args, .. } = message {
                    let response = match CommandName::from_str(&command) {
                        Some(name) => match registry.dispatch(name, args).await {
                            Ok(result) => Message::response_ok(id, result),
                            Err(e) => Message::response_err(id, e.to_string(), e.code()),
                        },
                        None => Message::response_err(id, format!("unknown command: {command}"), "UnknownCommand"),
                    };
                    write_frame(&mut writer, &response.to_bytes()?).await?;
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) if authenticated => {
                        // Best-effort: a slow client must not block others, so a
                        // write failure here just ends this connection's task.
                        write_frame(&mut writer, &event.to_bytes()?).await?;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CommandHandler;
    use async_trait::async_trait;
    use serde_json::Value;
    use tokio::io::duplex;

    struct StatusHandler;

    #[async_trait]
    impl CommandHandler for StatusHandler {
        async fn handle(&self, _args: Value) -> Result<Value, ProtocolError> {
            Ok(serde_json::json!({"uptime": 0}))
        }
    }

    #[tokio::test]
    async fn unauthenticated_connection_receives_welcome_and_responds_to_commands() {
        let (client, server) = duplex(4096);
        let mut registry = CommandRegistry::new();
        registry.register(CommandName::DaemonStatus, Box::new(StatusHandler));
        let (tx, rx) = broadcast::channel(16);

        let server_task = tokio::spawn(handle_connection(
            server,
            Arc::new(registry),
            ServerConfig { auth_token: None },
            rx,
        ));

        let (mut read_half, mut write_half) = tokio::io::split(client);

        let welcome = read_frame(&mut read_half).await.unwrap();
        match Message::from_bytes(&welcome).unwrap() {
            Message::Welcome { auth_required, .. } => assert!(!auth_required),
            other => panic!("expected welcome, got {other:?}"),
        }

        let cmd = Message::command("req-1", "daemon.status", Value::Null);
        write_frame(&mut write_half, &cmd.to_bytes().unwrap()).await.unwrap();

        let response = read_frame(&mut read_half).await.unwrap();
        match Message::from_bytes(&response).unwrap() {
            Message::Response { id, success, .. } => {
                assert_eq!(id, "req-1");
                assert!(success);
            }
            other => panic!("expected response, got {other:?}"),
        }

        drop(write_half);
        drop(tx);
        let _ = server_task.await;
    }
}
