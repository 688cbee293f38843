//! Command dispatch.
//!
//! [`Dispatcher::dispatch`] routes a [`Command`] to the handler registered
//! for its tag and always returns exactly one [`Answer`]. Handler errors and
//! panics are caught here and turned into failed answers.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use hvagent_core::{Answer, Command};
use tokio::sync::Semaphore;

use crate::context::AgentContext;
use crate::error::AgentError;
use crate::handlers;

/// Executes one kind of command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Handle `command`, whose tag this handler was registered for.
    ///
    /// # Errors
    /// Any [`AgentError`]; the dispatcher converts it into a failed answer.
    async fn handle(&self, ctx: &AgentContext, command: Command) -> Result<Answer, AgentError>;
}

/// Routes commands to handlers with bounded concurrency.
pub struct Dispatcher {
    ctx: Arc<AgentContext>,
    handlers: HashMap<&'static str, Arc<dyn CommandHandler>>,
    slots: Arc<Semaphore>,
}

impl Dispatcher {
    /// A dispatcher with no handlers; every command is unsupported.
    #[must_use]
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        let slots = Arc::new(Semaphore::new(ctx.config.max_concurrent_commands.max(1)));
        Self { ctx, handlers: HashMap::new(), slots }
    }

    /// A dispatcher with a handler for every [`Command`] variant.
    #[must_use]
    pub fn with_default_handlers(ctx: Arc<AgentContext>) -> Self {
        let mut dispatcher = Self::new(ctx);
        for (tag, handler) in handlers::default_handlers() {
            dispatcher.register(tag, handler);
        }
        dispatcher
    }

    /// Register or replace the handler for `tag`.
    pub fn register(&mut self, tag: &'static str, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(tag, handler);
    }

    /// The shared context.
    #[must_use]
    pub fn context(&self) -> &Arc<AgentContext> {
        &self.ctx
    }

    /// Run `command` and return its answer.
    ///
    /// An unregistered tag yields [`Answer::unsupported`]. The handler runs on
    /// its own task once a concurrency slot is free.
    pub async fn dispatch(&self, command: Command) -> Answer {
        let tag = command.tag();
        let Some(handler) = self.handlers.get(tag).map(Arc::clone) else {
            tracing::warn!(command = tag, "no handler registered");
            return Answer::unsupported(tag);
        };

        let Ok(slot) = Arc::clone(&self.slots).acquire_owned().await else {
            return Answer::failure(tag, "dispatcher is shutting down");
        };

        let ctx = Arc::clone(&self.ctx);
        let started = Instant::now();
        let joined = tokio::spawn(async move {
            let _slot = slot;
            handler.handle(&ctx, command).await
        })
        .await;

        let answer = match joined {
            Ok(Ok(answer)) => answer,
            Ok(Err(e)) => {
                tracing::warn!(command = tag, error = %e, "command failed");
                Answer::failure(tag, e.to_string())
            }
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                tracing::error!(command = tag, panic = %message, "command handler panicked");
                Answer::failure(tag, format!("handler panicked: {message}"))
            }
            Err(e) => {
                tracing::error!(command = tag, error = %e, "command task aborted");
                Answer::failure(tag, format!("handler aborted: {e}"))
            }
        };

        tracing::info!(
            command = tag,
            success = answer.success,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "command dispatched"
        );
        answer
    }

    /// Decode and run a command given as JSON (`{"type": ..., "payload": ...}`).
    ///
    /// Unknown tags are answered as unsupported without attempting to decode
    /// the payload.
    pub async fn dispatch_value(&self, value: serde_json::Value) -> Answer {
        let Some(tag) = value.get("type").and_then(serde_json::Value::as_str).map(str::to_owned)
        else {
            let err = AgentError::InvalidCommand("missing 'type' tag".to_owned());
            return Answer::failure("unknown", err.to_string());
        };
        if !self.handlers.contains_key(tag.as_str()) {
            tracing::warn!(command = %tag, "no handler registered");
            return Answer::unsupported(tag);
        }
        match serde_json::from_value::<Command>(value) {
            Ok(command) => self.dispatch(command).await,
            Err(e) => Answer::failure(tag, AgentError::InvalidCommand(e.to_string()).to_string()),
        }
    }

    /// Dispatch every command concurrently; answers are returned in input order.
    pub async fn dispatch_all(&self, commands: Vec<serde_json::Value>) -> Vec<Answer> {
        let mut set = tokio::task::JoinSet::new();
        let this = Arc::new(self.clone_shallow());
        for (index, value) in commands.into_iter().enumerate() {
            let this = Arc::clone(&this);
            set.spawn(async move { (index, this.dispatch_value(value).await) });
        }

        let mut answers: Vec<Option<Answer>> = Vec::new();
        answers.resize_with(set.len(), || None);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, answer)) => answers[index] = Some(answer),
                Err(e) => tracing::error!(error = %e, "dispatch task failed"),
            }
        }
        answers
            .into_iter()
            .map(|a| a.unwrap_or_else(|| Answer::failure("unknown", "dispatch task failed")))
            .collect()
    }

    fn clone_shallow(&self) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
            handlers: self.handlers.clone(),
            slots: Arc::clone(&self.slots),
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<_> = self.handlers.keys().copied().collect();
        tags.sort_unstable();
        f.debug_struct("Dispatcher")
            .field("handlers", &tags)
            .field("available_slots", &self.slots.available_permits())
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
