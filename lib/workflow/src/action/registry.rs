//! Action registry.
//!
//! Maps catalog action types to handlers. The registry is assembled once at
//! startup through [`ActionRegistryBuilder`], checked against the catalog,
//! and then shared read-only behind `Arc`.

use crate::action::builtin;
use crate::action::{ActionError, ActionHandler, AsyncActionHandler, SyncActionHandler};
use crate::catalog::{ActionTypeInfo, Catalog};
use crate::outbox::Outbox;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Errors from building or querying the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A handler serves an action type the catalog does not know.
    UnknownActionType { action_type: String },
    /// A handler's execution model disagrees with the catalog's `is_async`.
    ExecutionModelMismatch {
        action_type: String,
        catalog_is_async: bool,
    },
    /// Two handlers serve the same action type.
    DuplicateHandler { action_type: String },
    /// No handler is registered for an action type.
    HandlerNotFound { action_type: String },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownActionType { action_type } => {
                write!(f, "handler registered for unknown action type '{action_type}'")
            }
            Self::ExecutionModelMismatch {
                action_type,
                catalog_is_async,
            } => {
                let expected = if *catalog_is_async { "async" } else { "sync" };
                write!(
                    f,
                    "action type '{action_type}' is {expected} in the catalog but its handler is not"
                )
            }
            Self::DuplicateHandler { action_type } => {
                write!(f, "duplicate handler for action type '{action_type}'")
            }
            Self::HandlerNotFound { action_type } => {
                write!(f, "no handler registered for action type '{action_type}'")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// The handler an action type dispatches to.
#[derive(Clone)]
pub enum Dispatch<'a> {
    Sync(&'a Arc<dyn SyncActionHandler>),
    Async(&'a Arc<dyn AsyncActionHandler>),
}

impl Dispatch<'_> {
    /// Runs the handler's own config validation.
    ///
    /// # Errors
    ///
    /// Returns the handler's validation error.
    pub fn validate(&self, config: &JsonValue) -> Result<(), ActionError> {
        match self {
            Self::Sync(handler) => handler.validate(config),
            Self::Async(handler) => handler.validate(config),
        }
    }

    /// Returns true for asynchronous handlers.
    #[must_use]
    pub fn is_async(&self) -> bool {
        matches!(self, Self::Async(_))
    }
}

enum Registration {
    Sync(Arc<dyn SyncActionHandler>),
    Async(Arc<dyn AsyncActionHandler>),
}

impl Registration {
    fn action_type(&self) -> &str {
        match self {
            Self::Sync(h) => h.action_type(),
            Self::Async(h) => h.action_type(),
        }
    }
}

/// Collects handlers and checks them against the catalog.
#[derive(Default)]
pub struct ActionRegistryBuilder {
    registrations: Vec<Registration>,
}

impl ActionRegistryBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder with every built-in handler registered.
    ///
    /// Side-effecting handlers publish through `outbox`.
    #[must_use]
    pub fn with_builtins(outbox: Arc<dyn Outbox>) -> Self {
        Self::new()
            .register_sync(builtin::EvaluateCondition)
            .register_sync(builtin::LogEntry)
            .register_sync(builtin::CreateAlert::new(outbox.clone()))
            .register_sync(builtin::UpdateField::new(outbox.clone()))
            .register_sync(builtin::SendNotification::new(outbox.clone()))
            .register_async(builtin::ExternalRequest::seek_approval(outbox.clone()))
            .register_async(builtin::ExternalRequest::send_email(outbox.clone()))
            .register_async(builtin::ExternalRequest::allocate_inventory(outbox))
    }

    /// Registers a synchronous handler.
    #[must_use]
    pub fn register_sync(mut self, handler: impl SyncActionHandler + 'static) -> Self {
        self.registrations
            .push(Registration::Sync(Arc::new(handler)));
        self
    }

    /// Registers an asynchronous handler.
    #[must_use]
    pub fn register_async(mut self, handler: impl AsyncActionHandler + 'static) -> Self {
        self.registrations
            .push(Registration::Async(Arc::new(handler)));
        self
    }

    /// Checks every registration against the catalog and freezes the registry.
    ///
    /// Catalog action types without a handler are allowed; rules using them
    /// fail validation.
    ///
    /// # Errors
    ///
    /// Returns an error for handlers of unknown action types, handlers whose
    /// execution model disagrees with the catalog, and duplicates.
    pub fn build(self, catalog: &Catalog) -> Result<ActionRegistry, RegistryError> {
        let mut sync_handlers = HashMap::new();
        let mut async_handlers = HashMap::new();

        for registration in self.registrations {
            let action_type = registration.action_type().to_string();
            let info = catalog.action_type(&action_type).ok_or_else(|| {
                RegistryError::UnknownActionType {
                    action_type: action_type.clone(),
                }
            })?;

            if sync_handlers.contains_key(&action_type) || async_handlers.contains_key(&action_type)
            {
                return Err(RegistryError::DuplicateHandler { action_type });
            }

            match registration {
                Registration::Sync(handler) if !info.is_async => {
                    sync_handlers.insert(action_type, handler);
                }
                Registration::Async(handler) if info.is_async => {
                    async_handlers.insert(action_type, handler);
                }
                _ => {
                    return Err(RegistryError::ExecutionModelMismatch {
                        action_type,
                        catalog_is_async: info.is_async,
                    });
                }
            }
        }

        for info in catalog.list_action_types() {
            if !sync_handlers.contains_key(&info.action_type)
                && !async_handlers.contains_key(&info.action_type)
            {
                warn!(action_type = %info.action_type, "catalog action type has no handler");
            }
        }

        debug!(
            sync_handlers = sync_handlers.len(),
            async_handlers = async_handlers.len(),
            "action registry built"
        );

        Ok(ActionRegistry {
            sync_handlers,
            async_handlers,
        })
    }
}

/// Immutable map from action type to handler.
pub struct ActionRegistry {
    sync_handlers: HashMap<String, Arc<dyn SyncActionHandler>>,
    async_handlers: HashMap<String, Arc<dyn AsyncActionHandler>>,
}

impl ActionRegistry {
    /// Returns the handler for an action type key.
    #[must_use]
    pub fn lookup(&self, action_type: &str) -> Option<Dispatch<'_>> {
        if let Some(handler) = self.sync_handlers.get(action_type) {
            return Some(Dispatch::Sync(handler));
        }
        self.async_handlers.get(action_type).map(Dispatch::Async)
    }

    /// Picks the sync or async handler for an action type by its catalog
    /// execution model.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::HandlerNotFound` if the matching registry has
    /// no handler for the type.
    pub fn dispatch(&self, info: &ActionTypeInfo) -> Result<Dispatch<'_>, RegistryError> {
        let found = if info.is_async {
            self.async_handlers
                .get(&info.action_type)
                .map(Dispatch::Async)
        } else {
            self.sync_handlers
                .get(&info.action_type)
                .map(Dispatch::Sync)
        };
        found.ok_or_else(|| RegistryError::HandlerNotFound {
            action_type: info.action_type.clone(),
        })
    }

    /// Returns true if a handler is registered for the action type.
    #[must_use]
    pub fn contains(&self, action_type: &str) -> bool {
        self.lookup(action_type).is_some()
    }
}
