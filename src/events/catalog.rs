//! Event types published by the gateway and its sibling services.

use super::{EventDefinition, ScopeKind};

/// Raw AMI event relayed from Asterisk. The name is the AMI `Event` header.
pub const AMI_EVENT: EventDefinition =
    EventDefinition::new("{Event}", ScopeKind::Service, "ami.{name}");

/// A service announced itself.
pub const SERVICE_REGISTERED: EventDefinition = EventDefinition::new(
    "service_registered",
    ScopeKind::Service,
    "service.registered.{service_name}",
);

/// A service withdrew its announcement.
///
/// The routing key is the same one [`SERVICE_REGISTERED`] uses; consumers
/// tell the two apart by the `name` header. Pass a different template with
/// `routing_key_override` to publish elsewhere.
pub const SERVICE_DEREGISTERED: EventDefinition = EventDefinition::new(
    "service_deregistered",
    ScopeKind::Service,
    "service.registered.{service_name}",
);

pub const TENANT_CREATED: EventDefinition = EventDefinition::new(
    "auth_tenant_added",
    ScopeKind::Tenant,
    "auth.tenants.{tenant_uuid}.created",
);

pub const USER_CREATED: EventDefinition =
    EventDefinition::new("user_created", ScopeKind::Tenant, "config.user.created");

pub const USER_SERVICE_EDITED: EventDefinition = EventDefinition::new(
    "users_services_{service_name}_updated",
    ScopeKind::User,
    "config.users.{user_uuid}.services.{service_name}.updated",
);

pub const CONFERENCE_PARTICIPANT_JOINED: EventDefinition = EventDefinition::new(
    "conference_participant_joined",
    ScopeKind::MultiUser,
    "conferences.{conference_id}.participants.joined",
);
