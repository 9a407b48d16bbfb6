use crate::error::{ClearsyncError, Result};
use crate::rpc::{encode_request, Correlator, Inbound, RpcMethod};
use crate::signer::{SessionKey, Signature};
use crate::types::LedgerBalance;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Unsolicited coordinator pushes, fanned out to subscribers.
#[derive(Debug, Clone)]
pub enum Notification {
    BalanceUpdate(Vec<LedgerBalance>),
    AppSessionUpdate(Value),
    Disconnected(String),
}

struct Shared {
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    correlator: Correlator,
    notifications: broadcast::Sender<Notification>,
    balances: RwLock<Vec<LedgerBalance>>,
    closed: AtomicBool,
}

impl Shared {
    fn dispatch(&self, text: &str) {
        let inbound = match Inbound::parse(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::warn!("Dropping frame: {}", e);
                return;
            }
        };

        match inbound {
            Inbound::Response(frame) => {
                let method = frame.method.clone();
                if !self.correlator.complete(frame) {
                    tracing::warn!("Unsolicited {} response", method);
                }
            }
            Inbound::Error { id, message } => {
                let handled = id
                    .map(|id| {
                        self.correlator.fail(id, |method| {
                            ClearsyncError::protocol(method.as_str(), message.clone())
                        })
                    })
                    .unwrap_or(false);
                if !handled {
                    tracing::warn!("Coordinator error: {}", message);
                    self.correlator
                        .fail_all(|method| ClearsyncError::protocol(method.as_str(), message.clone()));
                }
            }
            Inbound::BalanceUpdate(balances) => {
                tracing::debug!("Balance update: {} asset(s)", balances.len());
                *self.balances.write() = balances.clone();
                let _ = self.notifications.send(Notification::BalanceUpdate(balances));
            }
            Inbound::AppSessionUpdate(params) => {
                let _ = self.notifications.send(Notification::AppSessionUpdate(params));
            }
        }
    }

    fn shutdown(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::warn!("Coordinator connection closed: {}", reason);
        self.outbound.lock().take();
        self.correlator
            .fail_all(|method| ClearsyncError::transport(format!("{} aborted: {}", method, reason)));
        let _ = self
            .notifications
            .send(Notification::Disconnected(reason.to_string()));
    }

    fn write(&self, text: String) -> Result<()> {
        let guard = self.outbound.lock();
        let sender = guard
            .as_ref()
            .ok_or_else(|| ClearsyncError::transport("Connection is closed"))?;
        sender
            .send(text)
            .map_err(|_| ClearsyncError::transport("Connection writer has stopped"))
    }
}

/// Single shared duplex connection to the coordinator.
///
/// The receive loop runs on its own task, so notifications keep flowing
/// while callers are suspended on chain confirmations.
pub struct Connection {
    shared: Arc<Shared>,
    request_timeout: Duration,
}

impl Connection {
    pub async fn connect(url: &str, request_timeout: Duration) -> Result<Self> {
        tracing::info!("Connecting to coordinator at {}", url);
        let (socket, _) = connect_async(url).await?;
        let (mut sink, mut stream) = socket.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let connection = Self::with_sender(out_tx, request_timeout);

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    tracing::warn!("Websocket send failed: {}", e);
                    break;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
        });

        let shared = connection.shared.clone();
        tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => shared.dispatch(text.as_str()),
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| format!("closed by peer: {}", f.reason))
                            .unwrap_or_else(|| "closed by peer".to_string())
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream ended".to_string(),
                }
            };
            shared.shutdown(&reason);
        });

        Ok(connection)
    }

    /// Connection over in-process channels; each `String` is one frame.
    pub fn from_channels(
        outbound: mpsc::UnboundedSender<String>,
        mut inbound: mpsc::UnboundedReceiver<String>,
        request_timeout: Duration,
    ) -> Self {
        let connection = Self::with_sender(outbound, request_timeout);
        let shared = connection.shared.clone();
        tokio::spawn(async move {
            while let Some(text) = inbound.recv().await {
                shared.dispatch(&text);
            }
            shared.shutdown("inbound channel closed");
        });
        connection
    }

    fn with_sender(outbound: mpsc::UnboundedSender<String>, request_timeout: Duration) -> Self {
        let (notifications, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                outbound: Mutex::new(Some(outbound)),
                correlator: Correlator::new(),
                notifications,
                balances: RwLock::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
            request_timeout,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Signed request/response round trip using the session key.
    pub async fn request(&self, method: RpcMethod, params: Value, signer: &SessionKey) -> Result<Value> {
        self.request_with(method, params, |payload| signer.sign_payload(payload), self.request_timeout)
            .await
    }

    /// Round trip carrying a signature produced elsewhere (`auth_verify`).
    pub async fn request_presigned(
        &self,
        method: RpcMethod,
        params: Value,
        signature: Signature,
    ) -> Result<Value> {
        self.request_with(method, params, |_| Ok(signature), self.request_timeout)
            .await
    }

    pub async fn request_with(
        &self,
        method: RpcMethod,
        params: Value,
        sign: impl FnOnce(&[u8]) -> Result<Signature>,
        timeout: Duration,
    ) -> Result<Value> {
        if self.is_closed() {
            return Err(ClearsyncError::transport("Connection is closed"));
        }

        let correlator = &self.shared.correlator;
        let id = correlator.next_id();
        let receiver = correlator.register(id, method.clone());

        let sent = encode_request(id, &method, &params, now_ms(), sign)
            .and_then(|text| self.shared.write(text));
        if let Err(e) = sent {
            correlator.cancel(id);
            return Err(e);
        }
        tracing::debug!("-> {} (id {})", method, id);

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClearsyncError::transport(format!(
                "Connection dropped while waiting for {}",
                method
            ))),
            Err(_) => {
                correlator.cancel(id);
                Err(ClearsyncError::Timeout {
                    method: method.to_string(),
                    after: timeout,
                })
            }
        }
    }

    /// Fire-and-forget signed message.
    pub fn send(&self, method: RpcMethod, params: Value, signer: &SessionKey) -> Result<()> {
        let id = self.shared.correlator.next_id();
        let text = encode_request(id, &method, &params, now_ms(), |payload| {
            signer.sign_payload(payload)
        })?;
        self.shared.write(text)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.shared.notifications.subscribe()
    }

    /// Latest ledger balances pushed by the coordinator.
    pub fn ledger_balances(&self) -> Vec<LedgerBalance> {
        self.shared.balances.read().clone()
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.correlator.pending_count()
    }

    pub fn close(&self) {
        self.shared.shutdown("closed locally");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

pub(crate) fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
