//! Event model.
//!
//! An [`EventDefinition`] is the static shape of an event type: its name
//! template, scope and routing-key template. [`EventDescriptor::builder`]
//! turns a definition plus content and scope fields into an immutable
//! descriptor with every template resolved. Unresolvable templates fail at
//! `build()`, never at publish time.

pub mod catalog;
pub mod descriptor;
pub mod template;

pub use descriptor::{EventBuilder, EventDescriptor};

/// Result type for event construction.
pub type Result<T> = std::result::Result<T, EventError>;

/// Errors raised while building an event.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// The definition references a field the caller did not supply.
    #[error("Event configuration error: {0}")]
    Configuration(String),
}

/// Audience of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// Platform-internal; no tenant or user context.
    Service,
    /// Every user of one tenant.
    Tenant,
    /// One user (or none) within a tenant.
    User,
    /// An explicit list of users within a tenant.
    MultiUser,
}

impl ScopeKind {
    pub fn requires_tenant(self) -> bool {
        !matches!(self, ScopeKind::Service)
    }
}

/// Static description of one event type.
#[derive(Debug, Clone, Copy)]
pub struct EventDefinition {
    /// Name template, e.g. `user_created` or `{Event}`.
    pub name: &'static str,
    pub scope: ScopeKind,
    /// Routing-key template; `{name}` refers to the resolved name.
    pub routing_key: &'static str,
    /// ACL template. Defaults to `events.{routing_key}` when absent.
    pub required_acl: Option<&'static str>,
}

impl EventDefinition {
    pub const fn new(name: &'static str, scope: ScopeKind, routing_key: &'static str) -> Self {
        Self {
            name,
            scope,
            routing_key,
            required_acl: None,
        }
    }

    pub const fn with_acl(mut self, required_acl: &'static str) -> Self {
        self.required_acl = Some(required_acl);
        self
    }
}
