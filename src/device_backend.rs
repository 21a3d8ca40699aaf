//! Hardware side of an authorized call.
//!
//! The gateway only decides whether a call may run; printers, serial ports,
//! USB/HID devices and the filesystem sit behind [`DeviceBackend`]. Backends
//! park whatever they open in the caller's [`ConnectionState`] so the
//! registry can close it on disconnect.

use anyhow::{bail, Result};
use serde_json::Value;

use crate::connection_registry::ConnectionState;

pub trait DeviceBackend: Send + Sync {
    /// Run an already authorized call; `Ok(None)` is a successful call with no result
    ///
    /// May block; the transport runs it off the async workers.
    fn call(&self, call: &str, params: &Value, connection: &mut ConnectionState) -> Result<Option<Value>>;
}

/// Backend for hosts without device support compiled in
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableBackend;

impl DeviceBackend for UnavailableBackend {
    fn call(&self, call: &str, _params: &Value, _connection: &mut ConnectionState) -> Result<Option<Value>> {
        bail!("{} is not available on this host", call)
    }
}
