//! Local-network pairing: a second device proposes a repository list, the
//! local user confirms or rejects it.

mod routes;
pub mod server;
pub mod state;

pub use server::{
    start_on_available_port, ChangeApplier, ChangeCallback, Logo, LogoProvider, PairingHooks,
    RepositoriesProvider, RepositorySummary, ServerHandle,
};
pub use state::{ChangeDiff, ChangeState, PendingChange};
