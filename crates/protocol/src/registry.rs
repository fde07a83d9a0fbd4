use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::command::CommandName;
use crate::error::ProtocolError;

/// Implemented by whatever owns the daemon's state (C6) for each command it
/// supports. Registered handlers are looked up by `CommandName` and invoked
/// with the request's raw `args` value (spec.md §4.5 "command dispatch").
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, args: Value) -> Result<Value, ProtocolError>;
}

/// Maps each `CommandName` to its handler. Built once at daemon startup and
/// shared (behind an `Arc`) across all connections.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: HashMap<CommandName, Box<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: CommandName, handler: Box<dyn CommandHandler>) {
        self.handlers.insert(name, handler);
    }

    pub async fn dispatch(&self, name: CommandName, args: Value) -> Result<Value, ProtocolError> {
        match self.handlers.get(&name) {
            Some(handler) => handler.handle(args).await,
            None => Err(ProtocolError::Frame(format!("no handler registered for {}", name.as_str()))),
        }
    }

    pub fn is_registered(&self, name: CommandName) -> bool {
        self.handlers.contains_key(&name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl CommandHandler for EchoHandler {
        async fn handle(&self, args: Value) -> Result<Value, ProtocolError> {
            Ok(args)
        }
    }

    #[tokio::test]
    async fn dispatch_routes_to_registered_handler() {
        let mut registry = CommandRegistry::new();
        registry.register(CommandName::DaemonStatus, Box::new(EchoHandler));

        let result = registry
            .dispatch(CommandName::DaemonStatus, serde_json::json!({"ping": true}))
            .await
            .unwrap();

        assert_eq!(result, serde_json::json!({"ping": true}));
    }

    #[tokio::test]
    async fn dispatch_errors_on_unregistered_command() {
        let registry = CommandRegistry::new();
        let result = registry.dispatch(CommandName::DaemonStop, Value::Null).await;
        assert!(result.is_err());
    }
}
