use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use leasehold_core::{AppError, AppResult};
use leasehold_domain::{TaskFailure, WorkItem};

/// Executes claimed work items of one task type.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Runs the task for `item`.
    async fn handle(&self, item: &WorkItem) -> Result<(), TaskFailure>;
}

/// Task type to handler mapping, built once at startup.
#[derive(Clone, Default)]
pub struct TaskHandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskHandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `task_type`.
    pub fn register(
        &mut self,
        task_type: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> AppResult<()> {
        let task_type = task_type.into();
        if task_type.trim().is_empty() {
            return Err(AppError::Validation(
                "task type must not be empty".to_owned(),
            ));
        }

        if self.handlers.contains_key(&task_type) {
            return Err(AppError::Validation(format!(
                "task type '{task_type}' already has a handler"
            )));
        }

        self.handlers.insert(task_type, handler);
        Ok(())
    }

    /// Returns whether a handler exists for `task_type`.
    #[must_use]
    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Returns registered task types in sorted order.
    #[must_use]
    pub fn task_types(&self) -> Vec<&str> {
        let mut task_types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        task_types.sort_unstable();
        task_types
    }

    /// Runs the handler registered for the item's task type.
    ///
    /// Unknown task types fail permanently.
    pub async fn dispatch(&self, item: &WorkItem) -> Result<(), TaskFailure> {
        let Some(handler) = self.handlers.get(item.task_type().as_str()) else {
            return Err(TaskFailure::permanent(format!(
                "no handler registered for task type '{}'",
                item.task_type()
            )));
        };

        handler.handle(item).await
    }
}
