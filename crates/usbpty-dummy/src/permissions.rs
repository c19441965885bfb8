//! Scripted permission authority

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

use usbpty_core::identity::DeviceIdentity;
use usbpty_core::platform::{PermissionAuthority, PermissionReply};

/// How [`DummyPermissions`] answers requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionMode {
    /// Every device is permitted up front
    GrantAll,
    /// Requests are granted as soon as they are made
    GrantOnRequest,
    /// Requests are denied as soon as they are made
    DenyOnRequest,
    /// Requests stay pending until [`DummyPermissions::resolve_pending`]
    Hold,
}

#[derive(Debug)]
struct State {
    mode: PermissionMode,
    granted: BTreeSet<u32>,
    pending: Vec<PermissionReply>,
    requests: usize,
}

/// In-memory [`PermissionAuthority`]
#[derive(Debug)]
pub struct DummyPermissions {
    state: Mutex<State>,
}

impl DummyPermissions {
    /// Create an authority answering in `mode`
    pub fn new(mode: PermissionMode) -> Self {
        Self {
            state: Mutex::new(State {
                mode,
                granted: BTreeSet::new(),
                pending: Vec::new(),
                requests: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Change how future requests are answered
    pub fn set_mode(&self, mode: PermissionMode) {
        self.lock().mode = mode;
    }

    /// Number of permission requests received
    pub fn request_count(&self) -> usize {
        self.lock().requests
    }

    /// Number of requests waiting for an answer
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Answer every held request
    ///
    /// Granted devices keep their permission. Returns the number of
    /// requests answered.
    pub fn resolve_pending(&self, granted: bool) -> usize {
        let pending = {
            let mut state = self.lock();
            let pending = std::mem::take(&mut state.pending);
            if granted {
                let tokens: Vec<u32> = pending.iter().map(PermissionReply::token).collect();
                state.granted.extend(tokens);
            }
            pending
        };
        let count = pending.len();
        for reply in pending {
            reply.resolve(granted);
        }
        count
    }
}

impl PermissionAuthority for DummyPermissions {
    fn has_permission(&self, identity: &DeviceIdentity) -> bool {
        let state = self.lock();
        state.mode == PermissionMode::GrantAll || state.granted.contains(&identity.numeric_id())
    }

    fn request_permission(&self, identity: &DeviceIdentity, reply: PermissionReply) {
        let mut state = self.lock();
        state.requests += 1;
        log::debug!("dummy: permission requested for {}", identity);
        match state.mode {
            PermissionMode::GrantAll | PermissionMode::GrantOnRequest => {
                state.granted.insert(identity.numeric_id());
                drop(state);
                reply.resolve(true);
            }
            PermissionMode::DenyOnRequest => {
                drop(state);
                reply.resolve(false);
            }
            PermissionMode::Hold => state.pending.push(reply),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_hold_then_grant() {
        let auth = DummyPermissions::new(PermissionMode::Hold);
        let ident = DeviceIdentity::new(0x1A86, 0x7523);
        let (tx, rx) = mpsc::channel();

        assert!(!auth.has_permission(&ident));
        auth.request_permission(
            &ident,
            PermissionReply::new(ident.numeric_id(), move |token, granted| {
                tx.send((token, granted)).unwrap();
            }),
        );
        assert_eq!(auth.pending_count(), 1);
        assert!(rx.try_recv().is_err());

        assert_eq!(auth.resolve_pending(true), 1);
        assert_eq!(rx.recv().unwrap(), (ident.numeric_id(), true));
        assert!(auth.has_permission(&ident));
    }

    #[test]
    fn test_deny_on_request() {
        let auth = DummyPermissions::new(PermissionMode::DenyOnRequest);
        let ident = DeviceIdentity::new(0x0403, 0x6001);
        let (tx, rx) = mpsc::channel();
        auth.request_permission(
            &ident,
            PermissionReply::new(ident.numeric_id(), move |_, granted| {
                tx.send(granted).unwrap();
            }),
        );
        assert!(!rx.recv().unwrap());
        assert!(!auth.has_permission(&ident));
        assert_eq!(auth.request_count(), 1);
    }
}
