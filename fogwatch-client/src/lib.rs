pub mod auth;
pub mod backend;
pub mod dashboard;
pub mod sessions;
pub mod store;

pub use auth::{AuthSession, Authenticator, CredentialSource, Credentials, SessionTracker};
pub use backend::Backend;
pub use dashboard::{Dashboard, DashboardSnapshot};
pub use sessions::SessionStore;
pub use store::StoreError;
