//! Authentication
//!
//! Methods are registered as factories in an [`AuthenticationRegistry`] and
//! instantiated per connection. Every outgoing request passes through
//! [`AuthenticationMethod::authorize`] unless it skips authorization.

mod basic;
mod bearer;
mod registry;
mod secret;

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::network::{Connection, Request};
use crate::utils::Result;

pub use basic::BasicAuthentication;
pub use bearer::BearerAuthentication;
pub use registry::{AuthenticationMethodFactory, AuthenticationRegistry};
pub use secret::{Secret, SecretCache, SecretLoader, StaticSecretLoader};

/// Kind of credential a method works with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthenticationMethodType {
    /// User name plus passphrase
    Passphrase,
    /// Bearer-style token
    Token,
}

/// An authentication method bound to one connection
pub trait AuthenticationMethod: Send + Sync {
    /// Registry identifier
    fn identifier(&self) -> &str;

    fn method_type(&self) -> AuthenticationMethodType;

    fn uses_user_name(&self) -> bool {
        self.method_type() == AuthenticationMethodType::Passphrase
    }

    /// Apply credentials. Applying twice yields the same request.
    fn authorize(&self, request: Request, connection: &Connection) -> Result<Request>;

    /// Make sure credentials are available and usable for `connection`
    fn authenticate<'a>(&'a self, connection: &'a Connection) -> BoxFuture<'a, Result<()>>;

    /// Forget credentials for `connection`
    fn deauthenticate<'a>(&'a self, connection: &'a Connection) -> BoxFuture<'a, Result<()>>;

    /// In-memory secret, loaded on a miss
    fn cached_secret(&self, connection: &Connection) -> Option<Secret>;

    fn flush_cached_secret(&self);
}

/// Shared handle to a method instance
pub type SharedAuthenticationMethod = Arc<dyn AuthenticationMethod>;
