//! Settings and credential persistence behind narrow, injectable interfaces.
//!
//! The interactive surface hands these stores to whatever needs them instead
//! of reaching for ambient global state. Passwords belong to a platform
//! secret store; only the interface and an in-memory stand-in live here.

mod credentials;
mod servers;
mod settings;

pub use credentials::{credential_key, CredentialStore, MemoryCredentialStore};
pub use servers::{SavedServer, ServerListStore};
pub use settings::{JsonSettingsStore, SettingsStore};
