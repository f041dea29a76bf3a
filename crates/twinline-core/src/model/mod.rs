// ── Resource model ──
//
// Schema side of the twin: provider models made of services made of
// resources. Models only ever grow; every growth step produces a new
// `ProviderModel` version and the old one stays valid for whoever holds it.

mod descriptor;

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::value::ValueKind;

pub use descriptor::{ProviderModel, ResourceDescriptor, ServiceDescriptor};

/// Name of the service every provider carries when admin services are on.
pub const ADMIN_SERVICE: &str = "admin";
/// Admin resource holding the provider's display name.
pub const FRIENDLY_NAME: &str = "friendlyName";
/// Admin resource holding the provider's model URI.
pub const MODEL_URI: &str = "modelUri";

/// What a resource represents.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum ResourceType {
    Property,
    #[default]
    Sensor,
    Action,
    StateVariable,
}

/// How a resource's value may change.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum ValueType {
    Fixed,
    Observable,
    Modifiable,
    #[default]
    Updatable,
}

/// A named, typed action argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionParameter {
    pub name: String,
    pub kind: ValueKind,
}

// ── Resource path ────────────────────────────────────────────────────

/// Fully qualified address of a resource instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourcePath {
    pub model: String,
    pub provider: String,
    pub service: String,
    pub resource: String,
}

impl ResourcePath {
    pub fn new(
        model: impl Into<String>,
        provider: impl Into<String>,
        service: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            provider: provider.into(),
            service: service.into(),
            resource: resource.into(),
        }
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.model, self.provider, self.service, self.resource
        )
    }
}

// ── Resource spec ────────────────────────────────────────────────────

/// Declaration of a resource to add to a model.
///
/// Defaults describe what a data update creates on the fly: an
/// updatable sensor with a single value.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSpec {
    pub name: String,
    pub resource_type: ResourceType,
    pub value_type: ValueType,
    pub kind: ValueKind,
    pub lower_bound: u32,
    /// `None` means unbounded.
    pub upper_bound: Option<u32>,
    pub parameters: Vec<ActionParameter>,
}

impl ResourceSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource_type: ResourceType::Sensor,
            value_type: ValueType::Updatable,
            kind: ValueKind::Any,
            lower_bound: 0,
            upper_bound: Some(1),
            parameters: Vec::new(),
        }
    }

    /// An action resource returning `returns` and taking `parameters`.
    pub fn action(
        name: impl Into<String>,
        returns: ValueKind,
        parameters: Vec<ActionParameter>,
    ) -> Self {
        Self {
            resource_type: ResourceType::Action,
            value_type: ValueType::Fixed,
            kind: returns,
            parameters,
            ..Self::new(name)
        }
    }

    pub fn kind(mut self, kind: ValueKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn resource_type(mut self, resource_type: ResourceType) -> Self {
        self.resource_type = resource_type;
        self
    }

    pub fn value_type(mut self, value_type: ValueType) -> Self {
        self.value_type = value_type;
        self
    }

    pub fn bounds(mut self, lower: u32, upper: Option<u32>) -> Self {
        self.lower_bound = lower;
        self.upper_bound = upper;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_spec_is_fixed_and_typed() {
        let spec = ResourceSpec::action(
            "reboot",
            ValueKind::Boolean,
            vec![ActionParameter {
                name: "delay".into(),
                kind: ValueKind::Integer,
            }],
        );
        assert_eq!(spec.resource_type, ResourceType::Action);
        assert_eq!(spec.value_type, ValueType::Fixed);
        assert_eq!(spec.kind, ValueKind::Boolean);
        assert_eq!(spec.parameters.len(), 1);
    }

    #[test]
    fn resource_type_uses_upper_snake_names() {
        assert_eq!(ResourceType::StateVariable.to_string(), "STATE_VARIABLE");
        assert_eq!(
            "sensor".parse::<ResourceType>().ok(),
            Some(ResourceType::Sensor)
        );
    }

    #[test]
    fn path_display_joins_segments() {
        let path = ResourcePath::new("m", "p", "s", "r");
        assert_eq!(path.to_string(), "m/p/s/r");
    }
}
