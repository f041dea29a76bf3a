//! Command-serialized digital twin engine for IoT gateways.
//!
//! The crate keeps a live model of the devices a gateway knows about,
//! organised as providers, services and resources, and funnels every
//! change through a single writer:
//!
//! - **[`Gateway`]**: Facade owning the writer task. Callers submit
//!   [`Command`]s from any thread and await a [`Pending`] result;
//!   [`Gateway::ingest()`] turns southbound [`DataUpdate`]s into commands.
//!
//! - **[`TwinStore`]**: Provider instances and their runtime-extensible
//!   [`ProviderModel`]s. Reads are lock-scoped snapshots; writes are only
//!   reachable through the command-scoped [`DigitalTwin`] and
//!   [`ModelManager`] handles.
//!
//! - **Notifications** ([`notification`]): Each command records its
//!   lifecycle, data, metadata and action events into one batch that is
//!   dispatched to listeners and a broadcast channel when it completes.
//!
//! - **[`Whiteboard`]**: Registry of action, get and set handlers keyed by
//!   resource, with provider-scoped and catch-all registrations.

pub mod command;
pub mod config;
mod engine;
pub mod error;
pub mod gateway;
pub mod model;
pub mod notification;
pub mod store;
pub mod twin;
pub mod update;
pub mod value;
pub mod whiteboard;

// ── Primary re-exports ──────────────────────────────────────────────
pub use command::{Command, CommandFuture, CommandSlot, Pending};
pub use config::GatewayConfig;
pub use error::CoreError;
pub use gateway::Gateway;
pub use model::{
    ActionParameter, ProviderModel, ResourceDescriptor, ResourcePath, ResourceSpec, ResourceType,
    ServiceDescriptor, ValueType,
};
pub use notification::{
    LifecycleStatus, ListenerId, Notification, NotificationBatch, NotificationDispatcher,
    NotificationListener,
};
pub use store::{
    EnsuredResource, MetadataEntry, ProviderFilter, ProviderSnapshot, ResourceSnapshot,
    ServiceSnapshot, TwinStore,
};
pub use twin::{DigitalTwin, ModelManager};
pub use update::DataUpdate;
pub use value::{TimedValue, ValueKind};
pub use whiteboard::{
    ActionCall, ActionHandler, ActionOutput, ActionSignature, FnAction, GetHandler, ParameterSource,
    Registration, RegistrationConflict, RegistryKey, ServiceId, SetHandler, ValueFuture,
    Whiteboard,
};
