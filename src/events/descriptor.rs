//! Resolved event instances.

use serde_json::{Map, Value};

use super::template::render;
use super::{EventDefinition, EventError, Result, ScopeKind};

/// Header set on tenant-wide events so every user of the tenant receives them.
pub const ALL_USERS_HEADER: &str = "user_uuid:*";

/// Header key addressing one user.
pub fn user_header(user_uuid: &str) -> String {
    format!("user_uuid:{}", user_uuid)
}

/// One fully resolved event.
///
/// Immutable: every field is computed once by [`EventBuilder::build`].
#[derive(Debug, Clone, PartialEq)]
pub struct EventDescriptor {
    name: String,
    scope: ScopeKind,
    routing_key: String,
    required_acl: String,
    required_access: String,
    headers: Map<String, Value>,
    content: Value,
    tenant_uuid: Option<String>,
    user_uuids: Vec<String>,
}

impl EventDescriptor {
    /// Start building an instance of `definition`.
    pub fn builder(definition: &EventDefinition) -> EventBuilder {
        EventBuilder {
            definition: *definition,
            content: Value::Object(Map::new()),
            tenant_uuid: None,
            user_uuid: None,
            user_uuids: None,
            routing_key: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> ScopeKind {
        self.scope
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn required_acl(&self) -> &str {
        &self.required_acl
    }

    pub fn required_access(&self) -> &str {
        &self.required_access
    }

    /// Scope headers: `tenant_uuid` plus the user addressing keys.
    pub fn headers(&self) -> &Map<String, Value> {
        &self.headers
    }

    pub fn tenant_uuid(&self) -> Option<&str> {
        self.tenant_uuid.as_deref()
    }

    pub fn user_uuids(&self) -> &[String] {
        &self.user_uuids
    }

    /// Payload body carried under `data` on the wire.
    pub fn marshal(&self) -> &Value {
        &self.content
    }
}

/// Builder for [`EventDescriptor`].
#[derive(Debug, Clone)]
pub struct EventBuilder {
    definition: EventDefinition,
    content: Value,
    tenant_uuid: Option<String>,
    user_uuid: Option<String>,
    user_uuids: Option<Vec<String>>,
    routing_key: Option<String>,
}

impl EventBuilder {
    pub fn content(mut self, content: Value) -> Self {
        self.content = content;
        self
    }

    pub fn tenant_uuid(mut self, tenant_uuid: impl Into<String>) -> Self {
        self.tenant_uuid = Some(tenant_uuid.into());
        self
    }

    pub fn user_uuid(mut self, user_uuid: impl Into<String>) -> Self {
        self.user_uuid = Some(user_uuid.into());
        self
    }

    pub fn user_uuids<I, S>(mut self, user_uuids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.user_uuids = Some(user_uuids.into_iter().map(Into::into).collect());
        self
    }

    /// Replace the definition's routing-key template for this instance.
    pub fn routing_key_override(mut self, template: impl Into<String>) -> Self {
        self.routing_key = Some(template.into());
        self
    }

    /// Resolve every template and produce the descriptor.
    pub fn build(self) -> Result<EventDescriptor> {
        let def = self.definition;

        if def.scope.requires_tenant() && self.tenant_uuid.is_none() {
            return Err(EventError::Configuration(format!(
                "event '{}' requires tenant_uuid",
                def.name
            )));
        }
        if def.scope == ScopeKind::MultiUser && self.user_uuids.is_none() {
            return Err(EventError::Configuration(format!(
                "event '{}' requires user_uuids",
                def.name
            )));
        }

        let name = render(def.name, |field| self.lookup(field), false)?;
        let lookup_with_name = |field: &str| {
            if field == "name" {
                Some(Value::String(name.clone()))
            } else {
                self.lookup(field)
            }
        };

        let routing_template = self.routing_key.as_deref().unwrap_or(def.routing_key);
        let routing_key = render(routing_template, lookup_with_name, true)?;
        let required_acl = match def.required_acl {
            Some(template) => render(template, lookup_with_name, true)?,
            None => format!("events.{}", routing_key),
        };
        let required_access = format!("event.{}", name);

        let mut headers = Map::new();
        if let Some(tenant_uuid) = &self.tenant_uuid {
            headers.insert("tenant_uuid".to_string(), Value::String(tenant_uuid.clone()));
        }
        let user_uuids = match def.scope {
            ScopeKind::Service => Vec::new(),
            ScopeKind::Tenant => {
                headers.insert(ALL_USERS_HEADER.to_string(), Value::Bool(true));
                Vec::new()
            }
            ScopeKind::User => self.user_uuid.iter().cloned().collect(),
            ScopeKind::MultiUser => self.user_uuids.clone().unwrap_or_default(),
        };
        for user_uuid in &user_uuids {
            headers.insert(user_header(user_uuid), Value::Bool(true));
        }

        Ok(EventDescriptor {
            name,
            scope: def.scope,
            routing_key,
            required_acl,
            required_access,
            headers,
            content: self.content,
            tenant_uuid: self.tenant_uuid,
            user_uuids,
        })
    }

    /// Scope fields shadow content fields of the same name.
    fn lookup(&self, field: &str) -> Option<Value> {
        match field {
            "tenant_uuid" if self.tenant_uuid.is_some() => {
                self.tenant_uuid.clone().map(Value::String)
            }
            "user_uuid" if self.user_uuid.is_some() => self.user_uuid.clone().map(Value::String),
            _ => self.content.get(field).cloned(),
        }
    }
}
