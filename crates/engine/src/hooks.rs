//! Migration hooks
//!
//! A [`HookBus`] belongs to one engine. External code subscribes handlers to a
//! [`HookTrigger`] to run backups, notifications or checks around DDL without
//! the engine knowing about them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::HookError;
use crate::migrations::MigrationPlan;

/// Error type returned by hook handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookTrigger {
    /// Before the first DDL statement. A failing handler aborts the run.
    BeforeDdl,
    /// After the last unit committed. Failures are logged only.
    AfterDdl,
    /// After a failure inside the locked section
    OnError,
}

impl fmt::Display for HookTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookTrigger::BeforeDdl => write!(f, "before_ddl"),
            HookTrigger::AfterDdl => write!(f, "after_ddl"),
            HookTrigger::OnError => write!(f, "on_error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HookOperation {
    Migrate,
    Rollback,
}

/// What a handler gets to see
#[derive(Debug, Clone)]
pub struct HookContext {
    pub trigger: HookTrigger,
    pub operation: HookOperation,
    /// The plan about to run or that ran; empty for rollbacks
    pub plan: MigrationPlan,
    /// Versions applied (migrate) or reverted (rollback) so far
    pub versions: Vec<String>,
    pub error: Option<String>,
}

impl HookContext {
    pub fn new(trigger: HookTrigger, operation: HookOperation) -> Self {
        Self {
            trigger,
            operation,
            plan: MigrationPlan::default(),
            versions: Vec::new(),
            error: None,
        }
    }

    pub fn with_plan(mut self, plan: MigrationPlan) -> Self {
        self.plan = plan;
        self
    }

    pub fn with_versions(mut self, versions: Vec<String>) -> Self {
        self.versions = versions;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[async_trait]
pub trait MigrationHook: Send + Sync {
    /// Name used in failure reports
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn handle(&self, context: &HookContext) -> Result<(), HandlerError>;
}

/// Hook backed by a synchronous closure
pub struct FnHook<F> {
    name: String,
    handler: F,
}

impl<F> FnHook<F>
where
    F: Fn(&HookContext) -> Result<(), HandlerError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }
}

#[async_trait]
impl<F> MigrationHook for FnHook<F>
where
    F: Fn(&HookContext) -> Result<(), HandlerError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, context: &HookContext) -> Result<(), HandlerError> {
        (self.handler)(context)
    }
}

#[derive(Clone, Default)]
pub struct HookBus {
    handlers: HashMap<HookTrigger, Vec<Arc<dyn MigrationHook>>>,
}

impl HookBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<H>(&mut self, trigger: HookTrigger, handler: H)
    where
        H: MigrationHook + 'static,
    {
        self.handlers
            .entry(trigger)
            .or_default()
            .push(Arc::new(handler));
    }

    pub fn subscribe_fn<F>(&mut self, trigger: HookTrigger, name: impl Into<String>, handler: F)
    where
        F: Fn(&HookContext) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe(trigger, FnHook::new(name, handler));
    }

    pub fn handler_count(&self, trigger: HookTrigger) -> usize {
        self.handlers.get(&trigger).map_or(0, Vec::len)
    }

    /// Run every handler for the context's trigger, in subscription order.
    ///
    /// A failing handler does not stop the others; all failures come back
    /// together.
    pub async fn fire(&self, context: &HookContext) -> Result<(), HookError> {
        let Some(handlers) = self.handlers.get(&context.trigger) else {
            return Ok(());
        };

        let mut failures = Vec::new();
        for handler in handlers {
            if let Err(e) = handler.handle(context).await {
                tracing::warn!(
                    "Hook '{}' failed during {}: {}",
                    handler.name(),
                    context.trigger,
                    e
                );
                failures.push(format!("{}: {}", handler.name(), e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(HookError::Failed {
                trigger: context.trigger,
                failures,
            })
        }
    }
}

impl fmt::Debug for HookBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<HookTrigger, usize> = self
            .handlers
            .iter()
            .map(|(trigger, handlers)| (*trigger, handlers.len()))
            .collect();
        f.debug_struct("HookBus").field("handlers", &counts).finish()
    }
}
