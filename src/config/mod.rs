// =============================================================================
// Configuration service — versioned store, validation, update bus
// =============================================================================

pub mod bus;
pub mod model;
pub mod store;
pub mod validation;

pub use model::{
    ActorContext, AuditAction, AuditLogEntry, ConfigFormat, ConfigType, ConfigUpdateEvent,
    Configuration, ConfigurationVersion, ListFilter,
};
pub use store::ConfigStore;
pub use validation::ValidatorRegistry;
