//! Database entities

pub mod client;
pub mod client_auth;
pub mod job;

pub mod prelude {
    pub use super::client::Entity as Client;
    pub use super::client_auth::Entity as ClientAuth;
    pub use super::job::Entity as Job;
}
