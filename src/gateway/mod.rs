//! Gateway request admission and forwarding

pub mod auth;
pub mod proxy;
pub mod rate_limit;
pub mod router;
pub mod routes;
mod server;

pub use auth::{AuthError, CredentialValidator, IdentityClaims, auth_middleware};
pub use proxy::Forwarder;
pub use rate_limit::{Admission, AdmissionController, rate_limit_middleware};
pub use router::{AppState, create_router};
pub use routes::RouteTable;
pub use server::Gateway;
