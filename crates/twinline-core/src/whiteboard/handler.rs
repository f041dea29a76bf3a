// ── Whiteboard handlers ──
//
// An action handler declares its signature once; the registry turns it
// into a `ParameterBinding` at registration time so invocation is a
// table walk, not a lookup by name per call. Get and set handlers move
// a single timed value and need no binding.

use std::fmt;

use futures::future::BoxFuture;
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::model::{ActionParameter, ResourcePath};
use crate::value::{TimedValue, ValueKind};

/// Future produced by a handler that finishes asynchronously.
pub type ActionFuture = BoxFuture<'static, Result<Value, CoreError>>;

/// What a handler hands back.
pub enum ActionOutput {
    Ready(Value),
    Deferred(ActionFuture),
}

impl From<Value> for ActionOutput {
    fn from(value: Value) -> Self {
        Self::Ready(value)
    }
}

impl fmt::Debug for ActionOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// Where one positional handler argument comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterSource {
    /// A caller-supplied argument, coerced to its kind. Missing ones bind
    /// to `null`.
    Argument(ActionParameter),
    Model,
    Provider,
    Service,
    Resource,
}

/// Declared shape of an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionSignature {
    pub returns: ValueKind,
    pub parameters: Vec<ParameterSource>,
}

impl ActionSignature {
    pub fn returning(returns: ValueKind) -> Self {
        Self {
            returns,
            parameters: Vec::new(),
        }
    }

    pub fn argument(mut self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.parameters
            .push(ParameterSource::Argument(ActionParameter {
                name: name.into(),
                kind,
            }));
        self
    }

    /// Inject part of the invoked resource's path.
    pub fn context(mut self, source: ParameterSource) -> Self {
        self.parameters.push(source);
        self
    }

    /// The caller-facing parameters, as declared on the model.
    pub(crate) fn declared(&self) -> Vec<ActionParameter> {
        self.parameters
            .iter()
            .filter_map(|source| match source {
                ParameterSource::Argument(parameter) => Some(parameter.clone()),
                _ => None,
            })
            .collect()
    }
}

/// One invocation, arguments already bound in signature order.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionCall {
    pub path: ResourcePath,
    pub arguments: Vec<Value>,
}

impl ActionCall {
    pub fn argument(&self, index: usize) -> Option<&Value> {
        self.arguments.get(index)
    }
}

/// Implementation behind an action resource.
///
/// `act` runs on a blocking thread, never on the gateway's writer.
pub trait ActionHandler: Send + Sync {
    fn signature(&self) -> ActionSignature;

    fn act(&self, call: ActionCall) -> Result<ActionOutput, CoreError>;
}

/// Handler built from a closure.
pub struct FnAction<F> {
    signature: ActionSignature,
    f: F,
}

impl<F> FnAction<F>
where
    F: Fn(ActionCall) -> Result<ActionOutput, CoreError> + Send + Sync,
{
    pub fn new(signature: ActionSignature, f: F) -> Self {
        Self { signature, f }
    }
}

impl<F> ActionHandler for FnAction<F>
where
    F: Fn(ActionCall) -> Result<ActionOutput, CoreError> + Send + Sync,
{
    fn signature(&self) -> ActionSignature {
        self.signature.clone()
    }

    fn act(&self, call: ActionCall) -> Result<ActionOutput, CoreError> {
        (self.f)(call)
    }
}

// ── Value handlers ───────────────────────────────────────────────────

/// Future produced by a get or set handler. `None` leaves the twin as is.
pub type ValueFuture = BoxFuture<'static, Result<Option<TimedValue>, CoreError>>;

/// Fetches a resource value from the device on demand.
///
/// Like actions, `pull` runs on a blocking thread.
pub trait GetHandler: Send + Sync {
    fn pull(&self, path: &ResourcePath, cached: Option<TimedValue>) -> ValueFuture;
}

/// Writes a resource value through to the device.
pub trait SetHandler: Send + Sync {
    fn push(
        &self,
        path: &ResourcePath,
        cached: Option<TimedValue>,
        value: TimedValue,
    ) -> ValueFuture;
}

impl<F> GetHandler for F
where
    F: Fn(&ResourcePath, Option<TimedValue>) -> ValueFuture + Send + Sync,
{
    fn pull(&self, path: &ResourcePath, cached: Option<TimedValue>) -> ValueFuture {
        self(path, cached)
    }
}

impl<F> SetHandler for F
where
    F: Fn(&ResourcePath, Option<TimedValue>, TimedValue) -> ValueFuture + Send + Sync,
{
    fn push(
        &self,
        path: &ResourcePath,
        cached: Option<TimedValue>,
        value: TimedValue,
    ) -> ValueFuture {
        self(path, cached, value)
    }
}

// ── Parameter binding ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParameterBinding {
    sources: Vec<ParameterSource>,
}

impl ParameterBinding {
    pub(crate) fn new(signature: &ActionSignature) -> Self {
        Self {
            sources: signature.parameters.clone(),
        }
    }

    /// Positional arguments for `path`. Named arguments not in the
    /// signature are ignored.
    pub(crate) fn bind(
        &self,
        path: &ResourcePath,
        arguments: &Map<String, Value>,
    ) -> Result<Vec<Value>, CoreError> {
        self.sources
            .iter()
            .map(|source| match source {
                ParameterSource::Argument(parameter) => {
                    let raw = arguments.get(&parameter.name).cloned().unwrap_or_default();
                    parameter.kind.coerce(raw).map_err(|error| {
                        CoreError::invalid_input(format!("argument {}: {error}", parameter.name))
                    })
                }
                ParameterSource::Model => Ok(Value::from(path.model.as_str())),
                ParameterSource::Provider => Ok(Value::from(path.provider.as_str())),
                ParameterSource::Service => Ok(Value::from(path.service.as_str())),
                ParameterSource::Resource => Ok(Value::from(path.resource.as_str())),
            })
            .collect()
    }
}
