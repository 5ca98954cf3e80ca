//! Persistent event-socket client.
//!
//! One client per account: discovers the socket endpoint with the account's
//! app credentials, holds a single WebSocket connection, decodes pushed JSON
//! frames into event envelopes for the caller's callback, and reconnects on
//! drops with bounded exponential backoff. Exhausting the reconnect budget is
//! reported through the fatal hook, not retried forever.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    futures::{SinkExt, StreamExt},
    secrecy::{ExposeSecret, Secret},
    serde::Deserialize,
    serde_json::Value,
    tokio_tungstenite::{connect_async, tungstenite::Message},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::error::{Error, Result};

/// Async callback invoked with every decoded event envelope.
pub type EventCallback =
    Arc<dyn Fn(Value) -> futures::future::BoxFuture<'static, ()> + Send + Sync>;

/// Invoked once when the reconnect budget is exhausted.
pub type FatalHook = Box<dyn FnOnce(String) + Send>;

/// Interval between client heartbeat pings.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Backoff and retry budget for reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive failed connection attempts tolerated before giving up.
    pub max_failures: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_failures: 8,
        }
    }
}

enum Closed {
    Cancelled,
    Remote,
}

/// Handle to one account's event socket.
#[derive(Clone)]
pub struct FeishuWsClient {
    app_id: String,
    app_secret: Secret<String>,
    base_url: String,
    policy: ReconnectPolicy,
    cancel: CancellationToken,
    connected: Arc<AtomicBool>,
}

impl FeishuWsClient {
    pub fn new(app_id: String, app_secret: Secret<String>, base_url: String) -> Self {
        Self {
            app_id,
            app_secret,
            base_url,
            policy: ReconnectPolicy::default(),
            cancel: CancellationToken::new(),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Non-blocking connectivity flag for status reporting.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Whether two values are handles to the same underlying connection.
    /// Clones share identity; a freshly constructed client does not.
    pub fn same_handle(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.connected, &other.connected)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Tear the connection down. Safe to call more than once.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Discover the socket endpoint for this account's credentials. Doubles
    /// as the start handshake: a credential problem surfaces here, before
    /// the account is marked running.
    pub(crate) async fn fetch_endpoint(&self, http: &reqwest::Client) -> Result<String> {
        #[derive(Deserialize)]
        struct EndpointResponse {
            code: i64,
            #[serde(default)]
            msg: String,
            data: Option<EndpointData>,
        }
        #[derive(Deserialize)]
        struct EndpointData {
            url: String,
        }

        let url = format!("{}/callback/ws/endpoint", self.base_url);
        let resp = http
            .post(&url)
            .json(&serde_json::json!({
                "app_id": self.app_id,
                "app_secret": self.app_secret.expose_secret(),
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::transport(format!(
                "endpoint request failed ({})",
                resp.status()
            )));
        }
        let body: EndpointResponse = resp.json().await?;
        if body.code != 0 {
            return Err(Error::transport(format!(
                "endpoint request rejected (code {}): {}",
                body.code, body.msg
            )));
        }
        body.data
            .map(|data| data.url)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| Error::transport("endpoint response missing url"))
    }

    /// Spawn the connection loop. Returns immediately; the loop runs until
    /// cancelled or until the reconnect budget is exhausted.
    pub(crate) fn spawn(
        &self,
        http: reqwest::Client,
        endpoint: String,
        on_event: EventCallback,
        on_fatal: FatalHook,
    ) {
        let client = self.clone();
        tokio::spawn(async move {
            client
                .connection_loop(http, Some(endpoint), on_event, on_fatal)
                .await;
        });
    }

    /// Main loop: (re)connect, pump frames, back off on failure.
    pub(crate) async fn connection_loop(
        self,
        http: reqwest::Client,
        mut endpoint: Option<String>,
        on_event: EventCallback,
        on_fatal: FatalHook,
    ) {
        let mut backoff = self.policy.initial_backoff;
        let mut failures: u32 = 0;
        let mut last_error = String::new();

        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            // Endpoint URLs are single-use; re-discover on every reconnect.
            let url = match endpoint.take() {
                Some(url) => url,
                None => match self.fetch_endpoint(&http).await {
                    Ok(url) => url,
                    Err(err) => {
                        failures += 1;
                        last_error = err.to_string();
                        warn!(error = %err, failures, "endpoint discovery failed");
                        if failures >= self.policy.max_failures {
                            on_fatal(format!("reconnect budget exhausted: {last_error}"));
                            return;
                        }
                        if self.sleep_backoff(&mut backoff).await {
                            return;
                        }
                        continue;
                    },
                },
            };

            let attempt = self.connect_and_run(&url, &on_event).await;
            let was_connected = self.connected.swap(false, Ordering::SeqCst);
            match attempt {
                Ok(Closed::Cancelled) => return,
                Ok(Closed::Remote) => {
                    debug!("event socket closed by server");
                    failures = 0;
                    backoff = self.policy.initial_backoff;
                },
                Err(err) => {
                    last_error = err.to_string();
                    warn!(error = %err, failures, "event socket error");
                    if was_connected {
                        // The connection was established; start a fresh budget.
                        failures = 1;
                        backoff = self.policy.initial_backoff;
                    } else {
                        failures += 1;
                    }
                    if failures >= self.policy.max_failures {
                        on_fatal(format!("reconnect budget exhausted: {last_error}"));
                        return;
                    }
                },
            }

            if self.sleep_backoff(&mut backoff).await {
                return;
            }
        }
    }

    /// Back off before the next attempt. Returns true when cancelled.
    async fn sleep_backoff(&self, backoff: &mut Duration) -> bool {
        let delay = *backoff;
        *backoff = (*backoff * 2).min(self.policy.max_backoff);
        tokio::select! {
            () = tokio::time::sleep(delay) => false,
            () = self.cancel.cancelled() => true,
        }
    }

    /// Single connection attempt: connect, then pump frames until the
    /// connection drops or the client is cancelled.
    async fn connect_and_run(&self, url: &str, on_event: &EventCallback) -> Result<Closed> {
        let (ws_stream, _response) = tokio::select! {
            result = connect_async(url) => result?,
            () = self.cancel.cancelled() => return Ok(Closed::Cancelled),
        };
        info!("event socket connected");
        self.connected.store(true, Ordering::SeqCst);

        let (mut sink, mut reader) = ws_stream.split();
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.reset();

        loop {
            tokio::select! {
                message = reader.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        match decode_frame(&text) {
                            Some(envelope) => on_event(envelope).await,
                            None => debug!("ignoring unrecognized frame"),
                        }
                    },
                    Some(Ok(Message::Ping(data))) => {
                        sink.send(Message::Pong(data)).await?;
                    },
                    Some(Ok(Message::Close(_))) | None => return Ok(Closed::Remote),
                    Some(Ok(_)) => {},
                    Some(Err(err)) => return Err(err.into()),
                },
                _ = heartbeat.tick() => {
                    sink.send(Message::Ping(Vec::new().into())).await?;
                },
                () = self.cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(Closed::Cancelled);
                },
            }
        }
    }
}

/// Decode one pushed frame into an event envelope. Fails closed: anything
/// that is not an object envelope is dropped.
fn decode_frame(text: &str) -> Option<Value> {
    let value: Value = serde_json::from_str(text).ok()?;
    let object = value.as_object()?;
    if let Some(payload) = object.get("payload") {
        return payload.is_object().then(|| payload.clone());
    }
    if object.contains_key("event")
        || object.contains_key("header")
        || object.contains_key("challenge")
    {
        return Some(value);
    }
    None
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn decode_frame_unwraps_payload_wrapper() {
        let frame = r#"{"type":"event","payload":{"header":{"event_type":"t"},"event":{}}}"#;
        let envelope = decode_frame(frame).expect("payload frame");
        assert!(envelope.get("header").is_some());
    }

    #[test]
    fn decode_frame_accepts_bare_envelopes() {
        let frame = r#"{"header":{"event_type":"t"},"event":{}}"#;
        assert!(decode_frame(frame).is_some());
    }

    #[test]
    fn decode_frame_fails_closed() {
        assert!(decode_frame("not json").is_none());
        assert!(decode_frame("[1,2]").is_none());
        assert!(decode_frame(r#"{"unrelated":true}"#).is_none());
        // A payload wrapper that is not an object is dropped too.
        assert!(decode_frame(r#"{"payload":"str"}"#).is_none());
    }

    fn test_client() -> FeishuWsClient {
        FeishuWsClient::new(
            "cli_test".into(),
            Secret::new("secret".into()),
            "http://127.0.0.1:1".into(),
        )
    }

    #[tokio::test]
    async fn delivers_frames_and_stops_on_cancel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(stream).await.expect("ws");
            ws.send(Message::Text(
                r#"{"type":"event","payload":{"header":{"event_type":"t"},"event":{}}}"#.into(),
            ))
            .await
            .expect("send");
            while let Some(Ok(message)) = ws.next().await {
                if matches!(message, Message::Close(_)) {
                    break;
                }
            }
        });

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let client = test_client();
        let on_event: EventCallback = Arc::new(move |envelope| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(envelope);
            })
        });
        client.spawn(
            reqwest::Client::new(),
            format!("ws://{addr}"),
            on_event,
            Box::new(|_| {}),
        );

        let envelope = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("frame within timeout")
            .expect("frame");
        assert_eq!(
            envelope.pointer("/header/event_type").and_then(Value::as_str),
            Some("t")
        );
        assert!(client.is_connected());

        client.stop();
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn exhausted_reconnect_budget_reports_fatal() {
        let client = test_client().with_reconnect_policy(ReconnectPolicy {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            max_failures: 2,
        });
        let (tx, rx) = std::sync::mpsc::channel();
        let on_event: EventCallback = Arc::new(|_| Box::pin(async {}));

        // No endpoint preset and an unreachable base URL: every discovery
        // attempt fails until the budget runs out.
        client
            .clone()
            .connection_loop(
                reqwest::Client::new(),
                None,
                on_event,
                Box::new(move |message| {
                    let _ = tx.send(message);
                }),
            )
            .await;

        let message = rx.try_recv().expect("fatal hook fired");
        assert!(message.contains("reconnect budget exhausted"));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn stop_before_start_never_connects() {
        let client = test_client();
        client.stop();
        let on_event: EventCallback = Arc::new(|_| Box::pin(async {}));
        let (tx, rx) = std::sync::mpsc::channel();
        client
            .clone()
            .connection_loop(
                reqwest::Client::new(),
                Some("ws://127.0.0.1:1".into()),
                on_event,
                Box::new(move |message| {
                    let _ = tx.send(message);
                }),
            )
            .await;
        // Cancelled before the first attempt: no fatal report, no connection.
        assert!(rx.try_recv().is_err());
        assert!(!client.is_connected());
    }
}
