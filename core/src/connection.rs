//! The placeholder transport connection shared by every synthetic request.
//!
//! Embedded servers expect each request to arrive on a live socket. No socket
//! exists here, so one placeholder is created at install time, referenced
//! read-only by every request, and closed by `InterceptorHandle::uninstall`.

use std::sync::atomic::{AtomicBool, Ordering};

use uuid::Uuid;

use crate::config::Origin;

#[derive(Debug)]
pub struct PlaceholderConnection {
    id: Uuid,
    local_addr: String,
    encrypted: bool,
    closed: AtomicBool,
}

impl PlaceholderConnection {
    pub fn new(origin: &Origin) -> Self {
        Self {
            id: Uuid::new_v4(),
            local_addr: format!("{}:{}", origin.host(), origin.port()),
            encrypted: origin.scheme() == "https",
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// `host:port` of the origin this connection pretends to be bound to.
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Whether requests on this connection count as TLS.
    pub fn encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns false if it was already closed.
    pub(crate) fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}
