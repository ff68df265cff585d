//! Method-call surface for hosts that speak JSON.
//!
//! A call names a method and carries an optional argument map; every call
//! gets exactly one [`MethodResponse`]. Over a byte stream the bridge reads
//! one call per line and writes one reply per line, answering calls
//! concurrently so a slow join never blocks `getSSID` or a duplicate check.

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::backend::WifiBackend;
use crate::error::{ConnectResult, ConnectionOutcome, ErrorKind, JoinError};
use crate::orchestrator::Orchestrator;
use crate::request::ConnectionRequest;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MethodCall {
    /// Echoed back on the reply so callers can match out-of-order answers
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub arguments: Option<Value>,
}

impl MethodCall {
    pub fn new(method: impl Into<String>, arguments: Option<Value>) -> Self {
        Self {
            id: None,
            method: method.into(),
            arguments,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum MethodResponse {
    Success { value: Value },
    Error { code: String, message: String },
    NotImplemented,
}

impl MethodResponse {
    pub fn success(value: impl Into<Value>) -> Self {
        Self::Success {
            value: value.into(),
        }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            code: kind.code().to_string(),
            message: message.into(),
        }
    }
}

impl From<JoinError> for MethodResponse {
    fn from(err: JoinError) -> Self {
        Self::error(err.kind, err.message)
    }
}

impl From<ConnectionOutcome> for MethodResponse {
    fn from(outcome: ConnectionOutcome) -> Self {
        match outcome {
            ConnectionOutcome::Joined => Self::success(true),
            ConnectionOutcome::Failed(err) => err.into(),
        }
    }
}

/// One line of bridge output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(flatten)]
    pub response: MethodResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinMethod {
    Connect,
    PrefixConnect,
    SecureConnect,
    SecurePrefixConnect,
}

impl JoinMethod {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "connect" => Some(Self::Connect),
            "prefixConnect" => Some(Self::PrefixConnect),
            "secureConnect" => Some(Self::SecureConnect),
            "securePrefixConnect" => Some(Self::SecurePrefixConnect),
            _ => None,
        }
    }

    fn is_secure(self) -> bool {
        matches!(self, Self::SecureConnect | Self::SecurePrefixConnect)
    }
}

/// Typed access to a call's argument map
struct Arguments<'a>(&'a Map<String, Value>);

impl<'a> Arguments<'a> {
    fn from_call(arguments: Option<&'a Value>) -> Result<Self, JoinError> {
        match arguments {
            Some(Value::Object(map)) => Ok(Self(map)),
            _ => Err(JoinError::invalid_arguments("missing argument map")),
        }
    }

    fn string(&self, key: &str) -> Result<&'a str, JoinError> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| JoinError::invalid_arguments(format!("missing or non-string `{key}`")))
    }

    fn flag(&self, key: &str) -> Result<bool, JoinError> {
        self.0
            .get(key)
            .and_then(Value::as_bool)
            .ok_or_else(|| JoinError::invalid_arguments(format!("missing or non-bool `{key}`")))
    }
}

fn join_request(method: JoinMethod, arguments: Option<&Value>) -> Result<ConnectionRequest, JoinError> {
    let args = Arguments::from_call(arguments)?;
    let ssid = args.string("ssid")?;
    let save_network = args.flag("saveNetwork")?;

    if !method.is_secure() {
        return Ok(match method {
            JoinMethod::PrefixConnect => ConnectionRequest::open_prefix(ssid, save_network),
            _ => ConnectionRequest::open(ssid, save_network),
        });
    }

    let password = args.string("password")?;
    let is_wep = args.flag("isWep")?;
    Ok(match method {
        JoinMethod::SecurePrefixConnect => {
            ConnectionRequest::secured_prefix(ssid, password, is_wep, save_network)
        }
        _ => ConnectionRequest::secured(ssid, password, is_wep, save_network),
    })
}

/// Dispatch one call to the orchestrator.
pub async fn handle<B: WifiBackend>(orchestrator: &Orchestrator<B>, call: &MethodCall) -> MethodResponse {
    debug!(method = %call.method, "method call");
    match call.method.as_str() {
        "disconnect" => MethodResponse::success(orchestrator.disconnect().await),
        "getSSID" => MethodResponse::success(orchestrator.current_network_name().await),
        name => match JoinMethod::from_name(name) {
            Some(method) => match join_request(method, call.arguments.as_ref()) {
                Ok(request) => orchestrator.connect(request).await.into(),
                Err(err) => {
                    warn!(method = %call.method, "rejected call: {}", err.message);
                    err.into()
                }
            },
            None => MethodResponse::NotImplemented,
        },
    }
}

async fn write_reply<W: AsyncWrite + Unpin>(writer: &mut W, reply: &Reply) -> ConnectResult<()> {
    let mut line = serde_json::to_vec(reply)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Decode one input line; `None` for a blank line.
fn decode_call(line: &[u8]) -> Option<Result<MethodCall, String>> {
    let text = match std::str::from_utf8(line) {
        Ok(text) => text.trim(),
        Err(e) => return Some(Err(format!("method call is not valid UTF-8: {e}"))),
    };
    if text.is_empty() {
        return None;
    }
    Some(serde_json::from_str(text).map_err(|e| format!("malformed method call: {e}")))
}

/// Serve newline-delimited JSON calls from `reader` until it reaches EOF,
/// then drain the calls still in flight.
pub async fn serve_json_lines<B, R, W>(
    orchestrator: &Orchestrator<B>,
    mut reader: R,
    mut writer: W,
) -> ConnectResult<()>
where
    B: WifiBackend,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // Kept across iterations: a cancelled read_until leaves partial input here.
    let mut line = Vec::new();
    let mut in_flight = FuturesUnordered::new();
    let mut reading = true;

    while reading || !in_flight.is_empty() {
        tokio::select! {
            read = reader.read_until(b'\n', &mut line), if reading => {
                if read? == 0 {
                    reading = false;
                    continue;
                }
                let decoded = decode_call(&line);
                line.clear();
                match decoded {
                    None => {}
                    Some(Ok(call)) => in_flight.push(async move {
                        let response = handle(orchestrator, &call).await;
                        Reply { id: call.id, response }
                    }),
                    Some(Err(message)) => {
                        warn!("{}", message);
                        let reply = Reply {
                            id: None,
                            response: MethodResponse::error(ErrorKind::InvalidArguments, message),
                        };
                        write_reply(&mut writer, &reply).await?;
                    }
                }
            }
            Some(reply) = in_flight.next(), if !in_flight.is_empty() => {
                write_reply(&mut writer, &reply).await?;
            }
        }
    }
    Ok(())
}
