pub mod config;
pub mod content;
pub mod error;
pub mod logging;
pub mod ssdp;
pub mod upnp;
pub mod web;

pub mod state {
    use crate::{
        config::Config,
        content::{tracks::Pictures, Content},
        upnp::StateVars,
    };
    use std::net::IpAddr;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    /// Shared application state. The content graph sits behind a
    /// read-write lock: browse handlers read, the update coordinator's
    /// apply phase holds the write guard for its entire duration.
    #[derive(Clone)]
    pub struct AppState {
        pub config: Arc<Config>,
        pub content: Arc<RwLock<Content>>,
        pub pictures: Arc<Pictures>,
        pub vars: Arc<StateVars>,
        pub host: IpAddr,
    }
}
