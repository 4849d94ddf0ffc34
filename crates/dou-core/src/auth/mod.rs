mod credential_store;
mod error;
mod events;
mod refresh;
mod session;
mod tokens;

pub use credential_store::{
    CredentialKey, CredentialStore, FileCredentialStore, MemoryCredentialStore,
};
pub use error::AuthError;
pub use events::{AuthEvent, AuthEventBus};
pub use refresh::{
    RefreshClient, RefreshCoordinator, RefreshCycle, RefreshError, RefreshFailure,
    RefreshTicket, RefreshWaiter, RefreshedTokens,
};
pub use session::{LoginRequest, RegisterRequest, SessionService};
pub use tokens::{expires_within, jwt_expiry, CredentialPair};
