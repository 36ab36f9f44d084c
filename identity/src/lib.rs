//! # Identity
//!
//! Credentials and user namespaces.
//!
//! ## Philosophy
//!
//! - **Identity is explicit and contextual, not global**: Every task carries
//!   its own [`Credentials`], and every credential names the
//!   [`UserNamespace`] it is interpreted in.
//! - **Capabilities are scoped**: Holding a capability only means something
//!   relative to a user namespace.
//! - **Testability first; no hidden global state**
//!
//! ## Core Concepts
//!
//! - `UserNamespace`: Maps namespace-local IDs to kernel IDs
//! - `Credentials`: UIDs, GIDs and capability sets of a task
//! - `FileCapabilities`: Capabilities granted by an executable on exec
//!
//! ## Non-Goals
//!
//! This is NOT:
//! - Authentication or cryptography
//! - Filesystem permission checking

pub mod credentials;
pub mod user_namespace;

pub use credentials::{Credentials, CredentialsSnapshot, FileCapabilities};
pub use user_namespace::{IdMapEntry, UserNamespace, UserNamespaceSnapshot};
