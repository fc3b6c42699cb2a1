//! The validator seam.
//!
//! The router does not ship a schema language. Instead it consumes a
//! [`ValidatorAdapter`]: a trait implemented once per validator library,
//! resolving [`SchemaId`] handles to whatever representation that library
//! uses. The adapter is handed the **full normalized envelope** (reserved
//! meta keys already stripped), so schemas may constrain both `payload` and
//! `meta`.
//!
//! Validation never fails at the `Result` level: the outcome is a
//! [`Validated`] value, and adapters are expected not to panic.

use serde_json::Value;

use crate::error::Issue;

/// A copyable handle naming a schema to a [`ValidatorAdapter`].
///
/// By default this is the message's wire type string (see
/// [`EventMessage::SCHEMA`](crate::EventMessage::SCHEMA)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SchemaId(&'static str);

impl SchemaId {
    /// Create a schema handle from a static name.
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// The schema name.
    pub const fn as_str(&self) -> &'static str {
        self.0
    }
}

impl core::fmt::Display for SchemaId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.0)
    }
}

/// The outcome of a validation call.
#[derive(Debug, Clone, PartialEq)]
pub enum Validated {
    /// The value passed validation.
    ///
    /// A replacement envelope may be supplied when the validator applies
    /// defaults or coercions; `None` means the input is used as-is.
    Valid(Option<Value>),
    /// The value failed validation.
    Invalid(Vec<Issue>),
}

impl Validated {
    /// Whether this outcome is [`Validated::Valid`].
    pub fn is_valid(&self) -> bool {
        matches!(self, Validated::Valid(_))
    }
}

/// Per-message outgoing-validation override.
///
/// Outgoing validation of `send`/`reply`/`progress` payloads is off by
/// default and enabled router-wide with
/// [`RouterConfig::validate_outgoing`](crate::RouterConfig); individual
/// messages may force it on or off regardless of the router setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Outgoing {
    /// Follow the router-wide setting.
    #[default]
    Inherit,
    /// Always validate outbound frames of this message.
    Always,
    /// Never validate outbound frames of this message.
    Never,
}

impl Outgoing {
    pub(crate) fn resolve(self, router_default: bool) -> bool {
        match self {
            Outgoing::Inherit => router_default,
            Outgoing::Always => true,
            Outgoing::Never => false,
        }
    }
}

/// Adapter over an external schema/validation library.
///
/// Implementations must not panic; a schema id they do not recognize should
/// validate as [`Validated::Valid`] (the router registers every message it
/// routes, but adapters may be shared across routers).
pub trait ValidatorAdapter: Send + Sync + 'static {
    /// Validate an inbound normalized envelope.
    fn validate(&self, schema: SchemaId, envelope: &Value) -> Validated;

    /// Validate an outgoing envelope before it is written to the wire.
    ///
    /// Defaults to the inbound rules.
    fn validate_outgoing(&self, schema: SchemaId, envelope: &Value) -> Validated {
        self.validate(schema, envelope)
    }
}

/// The do-nothing adapter: every envelope is valid.
///
/// This is the router default, for catalogs whose only contract is the
/// typed payload deserialization performed at handler entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl ValidatorAdapter for AcceptAll {
    fn validate(&self, _schema: SchemaId, _envelope: &Value) -> Validated {
        Validated::Valid(None)
    }
}
