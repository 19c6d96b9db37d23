//! The application-facing GATT server.
//!
//! Owns the attribute database and the set of live ATT sessions, and fans
//! notifications and indications out to every connection whose CCCD
//! enables them.

use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::att::error::AttResult;
use crate::att::{AttChannel, AttError, Bearer};
use crate::gatt::db::{AttributeDb, LocalService, ServiceRange};

/// Notify and indicate bits of a CCCD value.
const CCCD_NOTIFY: u16 = 0x0001;
const CCCD_INDICATE: u16 = 0x0002;

struct Session {
    chan: Arc<dyn AttChannel>,
    bearer: Arc<Bearer>,
}

/// The GATT server.
pub struct GattServer {
    name: Mutex<String>,
    db: Arc<AttributeDb>,
    sessions: Mutex<Vec<Session>>,
}

impl GattServer {
    /// Creates a server whose database holds the mandatory GAP and GATT
    /// services for `name`.
    pub fn new(name: &str) -> Self {
        Self {
            name: Mutex::new(name.to_string()),
            db: Arc::new(AttributeDb::new(name)),
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// The shared attribute database.
    pub fn db(&self) -> Arc<AttributeDb> {
        Arc::clone(&self.db)
    }

    /// Registers a service, assigning its handle range.
    pub fn add_service(&self, svc: &LocalService) -> AttResult<ServiceRange> {
        self.db.add_service(svc)
    }

    /// Drops every registered service except the mandatory GAP and GATT
    /// entries.
    pub fn remove_all_services(&self) {
        let name = self.name.lock().unwrap().clone();
        self.db.remove_all_services(&name);
    }

    /// Replaces the registered services.
    pub fn set_services(&self, services: &[LocalService]) -> AttResult<()> {
        self.remove_all_services();
        for svc in services {
            self.add_service(svc)?;
        }
        Ok(())
    }

    /// Attaches a connection's bearer so it participates in notification
    /// fan-out.
    pub fn attach_session(&self, chan: Arc<dyn AttChannel>, bearer: Arc<Bearer>) {
        self.sessions.lock().unwrap().push(Session { chan, bearer });
    }

    /// Sends a notification for a characteristic value handle to every
    /// subscribed connection. Returns how many connections it reached.
    pub fn notify(&self, value_handle: u16, value: &[u8]) -> AttResult<usize> {
        self.fan_out(value_handle, value, false)
    }

    /// Sends an indication to every subscribed connection, blocking per
    /// connection for the confirmation.
    pub fn indicate(&self, value_handle: u16, value: &[u8]) -> AttResult<usize> {
        self.fan_out(value_handle, value, true)
    }

    fn fan_out(&self, value_handle: u16, value: &[u8], indication: bool) -> AttResult<usize> {
        let cccd_handle = self
            .db
            .cccd_for_value(value_handle)
            .ok_or(AttError::InvalidArgument)?;
        let required = if indication { CCCD_INDICATE } else { CCCD_NOTIFY };

        let mut sessions = self.sessions.lock().unwrap();
        let mut sent = 0;
        // Dead sessions are reaped as they surface.
        sessions.retain(|session| {
            if session.chan.cccd_value(cccd_handle) & required == 0 {
                return true;
            }
            let result = if indication {
                session.bearer.indicate(value_handle, value)
            } else {
                session.bearer.notify(value_handle, value)
            };
            match result {
                Ok(()) => {
                    sent += 1;
                    true
                }
                Err(AttError::Disconnected) => {
                    debug!("dropping dead session during fan-out");
                    false
                }
                Err(err) => {
                    warn!("fan-out to subscribed peer failed: {err}");
                    true
                }
            }
        });
        Ok(sent)
    }

    /// Number of live attached sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}
