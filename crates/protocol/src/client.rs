use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::frame::{read_frame, write_frame};
use crate::message::Message;

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>;

/// Client for the control channel. One `ControlClient` owns one connection;
/// multiple `request()` calls may be in flight concurrently, disambiguated
/// by a freshly generated request id (spec.md §4.5).
pub struct ControlClient {
    pending: PendingMap,
    events: mpsc::UnboundedReceiver<Message>,
    writer: Mutex<Box<dyn AsyncWrite + Unpin + Send>>,
}

impl ControlClient {
    pub async fn connect(socket_path: &Path, auth_token: Option<&str>) -> Result<Self, ProtocolError> {
        #[cfg(unix)]
        let stream = tokio::net::UnixStream::connect(socket_path).await?;
        #[cfg(windows)]
        let stream = {
            use tokio::net::windows::named_pipe::ClientOptions;
            ClientOptions::new().open(socket_path)?
        };

        Self::from_stream(stream, auth_token).await
    }

    async fn from_stream<S>(stream: S, auth_token: Option<&str>) -> Result<Self, ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut reader, mut writer) = split(stream);

        let welcome = read_frame(&mut reader).await?;
        let auth_required = matches!(Message::from_bytes(&welcome)?, Message::Welcome { auth_required, .. } if auth_required);

        if auth_required {
            let token = auth_token.ok_or(ProtocolError::AuthRequired)?;
            write_frame(&mut writer, &Message::auth(token).to_bytes()?).await?;
            let reply = read_frame(&mut reader).await?;
            match Message::from_bytes(&reply)? {
                Message::AuthSuccess { .. } => {}
                _ => return Err(ProtocolError::AuthRequired),
            }
        }

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let reader_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            loop {
                let payload = match read_frame(&mut reader).await {
                    Ok(p) => p,
                    Err(_) => break,
                };
                let message = match Message::from_bytes(&payload) {
                    Ok(m) => m,
                    Err(_) => continue,
                };
                match &message {
                    Message::Response { id, .. } => {
                        if let Some(sender) = reader_pending.lock().await.remove(id) {
                            let _ = sender.send(message);
                        }
                    }
                    Message::Event { .. } => {
                        let _ = event_tx.send(message);
                    }
                    _ => {}
                }
            }
        });

        Ok(Self {
            pending,
            events: event_rx,
            writer: Mutex::new(Box::new(writer)),
        })
    }

    /// Send `command` with `args` and await its matched response, enforcing
    /// `timeout` (default 30s per spec.md §4.5). On expiry the pending slot
    /// is dropped so a late-arriving response is silently ignored.
    pub async fn request(&self, command: &str, args: Value, timeout: Duration) -> Result<Value, ProtocolError> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let message = Message::command(id.clone(), command, args);
        {
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, &message.to_bytes()?).await?;
        }

        let response = tokio::time::timeout(timeout, rx).await;
        match response {
            Ok(Ok(Message::Response { success, result, error, .. })) => {
                if success {
                    Ok(result.unwrap_or(Value::Null))
                } else {
                    let err = error.map(|e| e.message).unwrap_or_else(|| "unknown error".into());
                    Err(ProtocolError::Frame(err))
                }
            }
            Ok(Ok(_)) => Err(ProtocolError::Frame("unexpected message type for response".into())),
            Ok(Err(_)) => Err(ProtocolError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ProtocolError::Timeout)
            }
        }
    }

    pub async fn next_event(&mut self) -> Option<Message> {
        self.events.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn request_times_out_when_no_response_arrives() {
        // Simulate the server's handshake side manually by writing a welcome
        // frame onto the pair before handing the client half to the client.
        let (pair_a, pair_b) = duplex(4096);
        tokio::spawn(async move {
            let (_r, mut w) = tokio::io::split(pair_b);
            write_frame(&mut w, &Message::welcome(false).to_bytes().unwrap()).await.unwrap();
            // Never respond to any subsequent command.
            std::future::pending::<()>().await;
        });

        let client = ControlClient::from_stream(pair_a, None).await.unwrap();
        let result = client
            .request("daemon.status", Value::Null, Duration::from_millis(20))
            .await;

        assert!(matches!(result, Err(ProtocolError::Timeout)));
    }
}
