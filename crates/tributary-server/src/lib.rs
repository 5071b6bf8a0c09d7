//! Tributary host services: pairing server, configuration and the local
//! network collaborators it relies on.

pub mod config;
pub mod error;
pub mod network;
pub mod pairing;

pub use config::{HostConfig, PairingConfig};
pub use error::PairingError;
pub use network::{FixedAddressProvider, LocalAddressProvider, QrRenderer, UdpProbeAddressProvider};
pub use pairing::{
    start_on_available_port, ChangeApplier, ChangeDiff, ChangeState, Logo, PairingHooks,
    PendingChange, RepositorySummary, ServerHandle,
};
