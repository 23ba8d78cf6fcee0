use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{PoisonError, RwLock};
use tracing::{trace, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::ssdp;
use crate::state::AppState;

pub const SERVICE_CONTENT_DIRECTORY: &str = "urn:schemas-upnp-org:service:ContentDirectory:1";
pub const SERVICE_CONNECTION_MANAGER: &str = "urn:schemas-upnp-org:service:ConnectionManager:1";
pub const DEVICE_MEDIA_SERVER: &str = "urn:schemas-upnp-org:device:MediaServer:1";

/// State values persisted across restarts in the status file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedStatus {
    system_update_id: u32,
}

/// The evented and queried state variables of the ContentDirectory and
/// ConnectionManager services.
pub struct StateVars {
    system_update_id: AtomicU32,
    container_update_ids: RwLock<String>,
    service_reset_token: RwLock<String>,
    source_protocol_info: String,
    status_file: PathBuf,
}

impl StateVars {
    /// Initializes the state variables: SystemUpdateID comes from the
    /// status file (0 when there is none), the ServiceResetToken gets a
    /// fresh value on every start so that clients reset their caches.
    pub fn load(cfg: &Config) -> StateVars {
        let persisted: PersistedStatus = std::fs::read_to_string(&cfg.upnp.status_file)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();

        StateVars {
            system_update_id: AtomicU32::new(persisted.system_update_id),
            container_update_ids: RwLock::new(String::new()),
            service_reset_token: RwLock::new(new_reset_token()),
            source_protocol_info: cfg.supported_protocol_info(),
            status_file: cfg.upnp.status_file.clone(),
        }
    }

    pub fn system_update_id(&self) -> u32 {
        self.system_update_id.load(Ordering::SeqCst)
    }

    /// Atomically adds `count` to SystemUpdateID. Returns true when the
    /// value range was exceeded (the new value wrapped below the old one);
    /// the caller must then run the service-reset procedure.
    pub fn add_system_update_id(&self, count: u32) -> bool {
        let old = self.system_update_id.fetch_add(count, Ordering::SeqCst);
        let new = old.wrapping_add(count);
        trace!("increased SystemUpdateID to {new}");
        new < old
    }

    pub fn container_update_ids(&self) -> String {
        self.container_update_ids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_container_update_ids(&self, updates: &str) {
        let mut value = self
            .container_update_ids
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *value = updates.to_string();
        trace!("set ContainerUpdateIDs to '{updates}'");
    }

    pub fn service_reset_token(&self) -> String {
        self.service_reset_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Assigns a new random value to the ServiceResetToken.
    pub fn renew_service_reset_token(&self) {
        let mut token = self
            .service_reset_token
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *token = new_reset_token();
        trace!("set ServiceResetToken to '{}'", token.as_str());
    }

    pub fn source_protocol_info(&self) -> &str {
        &self.source_protocol_info
    }

    /// Writes the persistent state values to the status file.
    pub fn save(&self) -> Result<()> {
        let status = PersistedStatus {
            system_update_id: self.system_update_id(),
        };
        let raw = serde_json::to_string_pretty(&status)?;
        std::fs::write(&self.status_file, raw).with_context(|| {
            format!(
                "cannot write status file '{}'",
                self.status_file.display()
            )
        })
    }
}

fn new_reset_token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// The service-reset procedure prescribed by the ContentDirectory
/// specification for a SystemUpdateID overflow: leave the network, renew
/// the reset token, clear the update counters, and reconnect.
pub async fn service_reset_procedure(state: &AppState) {
    trace!("executing service reset procedure");
    if let Err(e) = ssdp::send_byebye(&state.config).await {
        warn!("cannot send ssdp:byebye during service reset: {e}");
    }
    state.vars.renew_service_reset_token();
    state.vars.set_container_update_ids("");
    state.content.write().await.reset_ctr_upd_counts();
    if let Err(e) = ssdp::send_alive(&state.config, state.host).await {
        warn!("cannot send ssdp:alive during service reset: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> StateVars {
        StateVars {
            system_update_id: AtomicU32::new(0),
            container_update_ids: RwLock::new(String::new()),
            service_reset_token: RwLock::new(new_reset_token()),
            source_protocol_info: String::new(),
            status_file: PathBuf::from("/tmp/tonika-test-status.json"),
        }
    }

    #[test]
    fn system_update_id_accumulates() {
        let v = vars();
        assert!(!v.add_system_update_id(5));
        assert!(!v.add_system_update_id(7));
        assert_eq!(v.system_update_id(), 12);
    }

    #[test]
    fn system_update_id_overflow_is_detected() {
        let v = vars();
        v.system_update_id.store(u32::MAX - 2, Ordering::SeqCst);
        assert!(v.add_system_update_id(10));
        assert_eq!(v.system_update_id(), 7);
        // the next addition is ordinary again
        assert!(!v.add_system_update_id(1));
    }

    #[test]
    fn reset_token_changes() {
        let v = vars();
        let before = v.service_reset_token();
        v.renew_service_reset_token();
        assert_ne!(before, v.service_reset_token());
    }
}
