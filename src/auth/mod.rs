//! Authentication module
//!
//! OIDC authorization-code flow against a provider that sits behind two
//! addresses.
//!
//! ## Structure
//!
//! - `reconciler`: maps provider URLs between the internal and external address
//! - `provider`: discovery, authorization URL, code exchange and refresh
//! - `jwt`: RS256 validation against the provider's cached JWKS
//! - `session`: server-side session store
//! - `flow`: session state transitions for login, callback, refresh and logout
//! - `extractors`: Axum extractor for authenticated users
//! - `handlers`: HTTP handlers for login, callback and logout
//! - `helpers`: HTTP client, URL builders and cookies
//!
//! ## Authentication Flow
//!
//! 1. Anonymous user visits `/protected` or `/login` → redirect to the external authorization endpoint
//! 2. Provider authenticates → redirect to the callback path on the public URL
//! 3. Code is exchanged at the internal token endpoint → session rotated → redirect to the original path
//! 4. User visits `/logout` → session destroyed → redirect to the provider's end-session endpoint
//! 5. Provider posts a logout token to `/backchannel-logout` → matching sessions destroyed

pub mod error;
pub mod extractors;
pub mod flow;
pub mod handlers;
pub mod helpers;
pub mod jwt;
pub mod provider;
pub mod reconciler;
pub mod session;

// Re-export handlers for convenient routing
pub use handlers::{
    backchannel_logout_handler, callback_handler, login_handler, logout_handler, LoginQuery,
};

pub use error::AuthFlowError;
pub use extractors::AuthenticatedUser;
pub use flow::{Access, CallbackParams, Coordinator};
pub use reconciler::{AddressReconciler, ProviderEndpoint};
