//! Authentication: sessions, credential storage and token refresh.

pub mod refresh;
pub mod session;

pub use refresh::{OAuthRefresher, TokenRefresher, TokenSet};
pub use session::{CredentialStore, MemoryCredentialStore, Session, SocialIdentity};
