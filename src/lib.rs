// Callsign Queue - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod api;
pub mod callsign;
pub mod config;
pub mod db;
pub mod gateway;
#[cfg(feature = "server")]
pub mod http;
pub mod logging;
pub mod notifier;
pub mod reconciler;
pub mod registry;
pub mod verifier;

// Re-export commonly used types
pub use api::{ErrorKind, StationConfig};
pub use callsign::{Callsign, ValidationError};
pub use config::AppConfig;
pub use gateway::{
    Actor, CallsignRemoval, DeleteOutcome, GatewayError, MutationGateway, SharedSecret,
};
pub use notifier::{ChangeEvent, ChangeKind, ChangeNotifier, RemovalCause, Subscription};
pub use reconciler::{
    ConfirmationWindow, CycleOutcome, CycleReport, Reconciler, ReconcilerConfig,
    ReconcilerControl, ReconcilerHandle, ReconcilerStatus, StatusHandle,
};
pub use registry::{Entry, RegistryError, RegistrySnapshot, SlotRegistry, DEFAULT_CAPACITY};
pub use verifier::{ConfirmedSet, QrzConfig, QrzLogbookClient, Verifier, VerifierError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
