//! Scheme registration on the desktop shell's networking layer.
//!
//! `SchemeRegistry` is the slice of the shell the bridge needs: declare a
//! scheme's privileges, attach one handler to it, and detach it again.
//! `MemoryRegistry` plays the shell's part in-process, routing each
//! `InterceptedRequest` to the handler registered for its URL scheme.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::RegistryError;
use crate::message::{BridgedResponse, InterceptedRequest};

/// Capabilities a scheme is registered with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchemePrivileges {
    pub standard: bool,
    pub secure: bool,
    pub support_fetch_api: bool,
    pub stream: bool,
}

impl SchemePrivileges {
    /// What the bridge needs for streamed bodies and `fetch` from pages.
    pub fn bridge() -> Self {
        Self {
            standard: true,
            secure: true,
            support_fetch_api: true,
            stream: true,
        }
    }
}

/// Receives every request the shell intercepts on a scheme.
///
/// Implementations must always produce a response; failures are expressed as
/// error responses, never as a missing one.
#[async_trait]
pub trait SchemeHandler: Send + Sync {
    async fn handle(&self, request: InterceptedRequest) -> BridgedResponse;
}

pub trait SchemeRegistry: Send + Sync {
    fn register_scheme(&self, scheme: &str, privileges: SchemePrivileges);

    fn is_handled(&self, scheme: &str) -> bool;

    /// Attach `handler`. Fails if the scheme already has one.
    fn handle(&self, scheme: &str, handler: Arc<dyn SchemeHandler>) -> Result<(), RegistryError>;

    fn unhandle(&self, scheme: &str) -> Result<(), RegistryError>;
}

#[derive(Default)]
pub struct MemoryRegistry {
    privileges: RwLock<HashMap<String, SchemePrivileges>>,
    handlers: RwLock<HashMap<String, Arc<dyn SchemeHandler>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn privileges(&self, scheme: &str) -> Option<SchemePrivileges> {
        self.privileges.read().get(scheme).copied()
    }

    /// Route `request` to the handler for its URL scheme, as the shell's
    /// network stack would.
    pub async fn dispatch(&self, request: InterceptedRequest) -> Result<BridgedResponse, RegistryError> {
        let scheme = request.url().scheme().to_string();
        // Clone out so the lock is not held across the handler's await.
        let handler = self
            .handlers
            .read()
            .get(&scheme)
            .cloned()
            .ok_or(RegistryError::NotHandled(scheme))?;
        Ok(handler.handle(request).await)
    }
}

impl SchemeRegistry for MemoryRegistry {
    fn register_scheme(&self, scheme: &str, privileges: SchemePrivileges) {
        self.privileges.write().insert(scheme.to_string(), privileges);
    }

    fn is_handled(&self, scheme: &str) -> bool {
        self.handlers.read().contains_key(scheme)
    }

    fn handle(&self, scheme: &str, handler: Arc<dyn SchemeHandler>) -> Result<(), RegistryError> {
        let mut handlers = self.handlers.write();
        if handlers.contains_key(scheme) {
            return Err(RegistryError::AlreadyHandled(scheme.to_string()));
        }
        handlers.insert(scheme.to_string(), handler);
        Ok(())
    }

    fn unhandle(&self, scheme: &str) -> Result<(), RegistryError> {
        self.handlers
            .write()
            .remove(scheme)
            .map(drop)
            .ok_or_else(|| RegistryError::NotHandled(scheme.to_string()))
    }
}

impl fmt::Debug for MemoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut schemes: Vec<String> = self.handlers.read().keys().cloned().collect();
        schemes.sort();
        f.debug_struct("MemoryRegistry")
            .field("privileges", &*self.privileges.read())
            .field("handled", &schemes)
            .finish()
    }
}
