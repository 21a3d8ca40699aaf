//! Protocol Module
//!
//! JSON text frames exchanged with web pages over the WebSocket.
//!
//! Inbound calls carry `uid`, `call`, `params`, `timestamp`, `signature` and
//! an optional `signAlgorithm`. A frame with a `certificate` field is the
//! per-connection setup call establishing the caller's identity. Replies echo
//! the `uid` with either a `result` or an `error`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::request_authorizer::{timestamp_millis, SignedRequest};

/// Display name answered to [`PROBE_REQUEST`]
pub const PROGRAM_NAME: &str = "Localgate";
pub const PROGRAM_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Sent by a second instance looking for a running one
pub const PROBE_REQUEST: &str = "getProgramName";
pub const KEEP_ALIVE: &str = "ping";

/// Close code for clients speaking an incompatible protocol
pub const CLOSE_INCOMPATIBLE: u16 = 4003;

/// Prompt shown for the setup call
pub const CONNECT_ACTION: &str = "connect to localgate";

const DEFAULT_PROMPT: &str = "access local resources";
const UNDEFINED_LOCATION: &str = "an undefined location";

/// One entry of the call table
#[derive(Debug, PartialEq, Eq)]
pub struct SocketMethod {
    pub call: &'static str,
    /// Whether the call needs consent
    pub dialog: bool,
    pub prompt: &'static str,
}

const fn method(call: &'static str, dialog: bool, prompt: &'static str) -> SocketMethod {
    SocketMethod { call, dialog, prompt }
}

pub const PRINT_CALL: &str = "print";
pub const GET_VERSION_CALL: &str = "getVersion";

pub static METHODS: &[SocketMethod] = &[
    method("printers.getDefault", true, "access connected printers"),
    method("printers.find", true, "access connected printers"),
    method("printers.detail", true, "access connected printers"),
    method("printers.startListening", true, "listen for printer status"),
    method("printers.getStatus", false, DEFAULT_PROMPT),
    method("printers.stopListening", false, DEFAULT_PROMPT),
    method(PRINT_CALL, true, "print to {}"),
    method("serial.findPorts", true, "access serial ports"),
    method("serial.openPort", true, "open a serial port"),
    method("serial.sendData", true, "send data over a serial port"),
    method("serial.closePort", true, "close a serial port"),
    method("socket.open", true, "open a socket"),
    method("socket.sendData", true, "send data over a socket"),
    method("socket.close", true, "close a socket"),
    method("usb.listDevices", true, "access USB devices"),
    method("usb.listInterfaces", true, "access USB devices"),
    method("usb.listEndpoints", true, "access USB devices"),
    method("usb.claimDevice", true, "claim a USB device"),
    method("usb.isClaimed", false, "check USB claim status"),
    method("usb.sendData", true, "use a USB device"),
    method("usb.readData", true, "use a USB device"),
    method("usb.openStream", true, "use a USB device"),
    method("usb.closeStream", false, "use a USB device"),
    method("usb.releaseDevice", false, "release a USB device"),
    method("hid.listDevices", true, "access USB devices"),
    method("hid.startListening", true, "listen for USB devices"),
    method("hid.stopListening", false, DEFAULT_PROMPT),
    method("hid.claimDevice", true, "claim a USB device"),
    method("hid.isClaimed", false, "check USB claim status"),
    method("hid.sendData", true, "use a USB device"),
    method("hid.readData", true, "use a USB device"),
    method("hid.sendFeatureReport", true, "use a USB device"),
    method("hid.getFeatureReport", true, "use a USB device"),
    method("hid.openStream", true, "use a USB device"),
    method("hid.closeStream", false, "use a USB device"),
    method("hid.releaseDevice", false, "release a USB device"),
    method("file.list", true, "view the filesystem"),
    method("file.startListening", true, "listen for filesystem events"),
    method("file.stopListening", false, DEFAULT_PROMPT),
    method("file.read", true, "read the content of a file"),
    method("file.write", true, "write to a file"),
    method("file.remove", true, "delete a file"),
    method("networking.device", true, DEFAULT_PROMPT),
    method("networking.devices", true, DEFAULT_PROMPT),
    method("networking.hostname", true, DEFAULT_PROMPT),
    method("websocket.getNetworkInfo", true, DEFAULT_PROMPT),
    method(GET_VERSION_CALL, false, DEFAULT_PROMPT),
    method("websocket.stop", false, DEFAULT_PROMPT),
];

impl SocketMethod {
    pub fn find(call: &str) -> Option<&'static SocketMethod> {
        METHODS.iter().find(|m| m.call == call)
    }
}

/// A decoded call frame
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub call: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default, rename = "signAlgorithm")]
    pub sign_algorithm: Option<String>,
    #[serde(default)]
    pub certificate: Option<String>,
}

impl InboundMessage {
    /// The `uid` when present and non-empty
    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref().filter(|u| !u.is_empty())
    }

    pub fn call_name(&self) -> &str {
        self.call.as_deref().unwrap_or("")
    }

    /// Epoch milliseconds; numbers and numeric strings are accepted, anything else is 0
    pub fn timestamp_ms(&self) -> i64 {
        timestamp_millis(self.timestamp.as_ref())
    }

    /// The signed fields exactly as received, for signature checks
    pub fn signed_request(&self) -> SignedRequest<'_> {
        SignedRequest {
            call: self.call.as_deref(),
            params: self.params.as_ref(),
            timestamp: self.timestamp.as_ref(),
            signature: self.signature.as_deref(),
            sign_algorithm: self.sign_algorithm.as_deref(),
        }
    }
}

/// Parameters for dispatch, `{}` when absent or not an object
pub fn params_or_empty(message: &InboundMessage) -> Value {
    match &message.params {
        Some(params @ Value::Object(_)) => params.clone(),
        _ => Value::Object(Default::default()),
    }
}

/// Classification of a text frame before any authorization
#[derive(Debug)]
pub enum Frame {
    Empty,
    Probe,
    KeepAlive,
    Setup(InboundMessage),
    Call(InboundMessage),
}

pub fn classify(text: &str) -> Result<Frame> {
    if text.is_empty() {
        return Ok(Frame::Empty);
    }
    if text == PROBE_REQUEST {
        return Ok(Frame::Probe);
    }
    if text == KEEP_ALIVE {
        return Ok(Frame::KeepAlive);
    }
    let message = deserialize_message(text)?;
    if message.certificate.is_some() {
        Ok(Frame::Setup(message))
    } else {
        Ok(Frame::Call(message))
    }
}

pub fn deserialize_message(text: &str) -> Result<InboundMessage> {
    serde_json::from_str(text).context("Failed to deserialize JSON message")
}

/// What to do with a call frame once parsed
#[derive(Debug, PartialEq, Eq)]
pub enum CallPlan {
    /// Unknown call and no uid: an incompatible client, close the socket
    Incompatible,
    /// Answer with an error without prompting
    Rejected(String),
    /// Run the call, asking for consent first when `action` is set
    Ready {
        method: &'static SocketMethod,
        action: Option<String>,
    },
}

pub fn plan_call(message: &InboundMessage, params: &Value) -> CallPlan {
    let Some(method) = SocketMethod::find(message.call_name()) else {
        if message.uid().is_none() {
            return CallPlan::Incompatible;
        }
        let call = message.call.as_deref().filter(|c| !c.is_empty()).unwrap_or("NONE");
        return CallPlan::Rejected(format!("Invalid function call: {}", call));
    };

    let mut prompt = method.prompt.to_string();
    if method.call == PRINT_CALL {
        match print_target(params) {
            Some(target) => prompt = prompt.replace("{}", &target),
            None => return CallPlan::Rejected("A printer must be specified before printing".to_string()),
        }
    }

    CallPlan::Ready {
        method,
        action: method.dialog.then_some(prompt),
    }
}

/// Printer name, file or host named by `params.printer`
fn print_target(params: &Value) -> Option<String> {
    let printer = params.get("printer")?.as_object()?;
    let target = ["name", "file", "host"]
        .iter()
        .find_map(|key| printer.get(*key).and_then(Value::as_str))
        .unwrap_or(UNDEFINED_LOCATION);
    Some(target.to_string())
}

/// Reply to a single call
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn result(uid: Option<&str>, result: Option<Value>) -> Self {
        Self {
            uid: uid.map(str::to_string),
            result,
            error: None,
        }
    }

    pub fn error(uid: Option<&str>, error: impl Into<String>) -> Self {
        Self {
            uid: uid.map(str::to_string),
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

pub fn serialize_response(response: &Response) -> Result<String> {
    serde_json::to_string(response).context("Failed to serialize response to JSON")
}
