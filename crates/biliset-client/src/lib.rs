//! Remote service access for the biliset crawler.
//!
//! Everything that talks to the network lives here:
//! - [`Transport`]: the single rate-limited chokepoint for outbound calls
//! - [`SessionManager`]: credential acquisition, verification, persistence
//! - [`Api`]: typed wrappers over the service endpoints

pub mod api;
pub mod error;
pub mod session;
pub mod transport;

pub use api::{Api, DashStream, NavIdentity, PlayInfo, SearchHit, SearchPage, ViewData};
pub use error::{ClientError, ClientResult};
pub use session::{Authenticator, Credential, SessionConfig, SessionManager};
pub use transport::{Transport, TransportConfig};
