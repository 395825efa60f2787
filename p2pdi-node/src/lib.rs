//! P2P-DI node: framed TCP transport, the shared server loop, the registration
//! service and the peer agent.

pub mod client;
pub mod config;
pub mod documents;
pub mod peer;
pub mod registry;
pub mod retry;
pub mod server;
pub mod transport;

pub use config::Config;
pub use documents::{DirectorySource, DocumentSource};
pub use peer::{PeerAgent, PeerError, PeerOptions, ReconcileReport};
pub use registry::{RegistrationService, RegistryOptions};
pub use server::{ServerError, ServerHandle, Service};
