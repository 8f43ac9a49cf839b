//! Scripted in-memory connector for driving handshakes in tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, StreamExt};
use secrecy::SecretString;
use tokio::sync::mpsc;

use crate::error::ClientError;
use crate::transport::{Connector, FrameSink, FrameStream};
use crate::types::ClientFrame;

pub(crate) enum Plan {
    Accept,
    Refuse(ClientError),
    /// Never completes the open.
    Hang,
}

pub(crate) struct MockConnector {
    plans: Mutex<VecDeque<Plan>>,
    opens: AtomicUsize,
    servers: mpsc::UnboundedSender<MockServer>,
}

/// Connections are accepted unless a [`Plan`] says otherwise; each accepted one yields a [`MockServer`].
pub(crate) fn mock_connector() -> (Arc<MockConnector>, mpsc::UnboundedReceiver<MockServer>) {
    let (servers, rx) = mpsc::unbounded_channel();
    let connector = MockConnector {
        plans: Mutex::new(VecDeque::new()),
        opens: AtomicUsize::new(0),
        servers,
    };
    (Arc::new(connector), rx)
}

impl MockConnector {
    pub(crate) fn plan(&self, plan: Plan) {
        self.plans.lock().unwrap().push_back(plan);
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, _url: &str, _token: &SecretString) -> Result<(FrameSink, FrameStream), ClientError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let plan = self.plans.lock().unwrap().pop_front().unwrap_or(Plan::Accept);
        match plan {
            Plan::Refuse(e) => Err(e),
            Plan::Hang => futures::future::pending().await,
            Plan::Accept => {
                let (to_server, from_client) = fmpsc::unbounded::<String>();
                let (to_client, from_server) = fmpsc::unbounded::<Result<String, ClientError>>();
                let server = MockServer {
                    from_client,
                    to_client,
                };
                self.servers
                    .send(server)
                    .map_err(|_| ClientError::Network("mock server dropped".into()))?;
                let sink = to_server.sink_map_err(|e| ClientError::Network(e.to_string()));
                Ok((Box::pin(sink), Box::pin(from_server)))
            }
        }
    }
}

/// Server end of one accepted mock connection. Dropping it closes the connection.
pub(crate) struct MockServer {
    from_client: fmpsc::UnboundedReceiver<String>,
    to_client: fmpsc::UnboundedSender<Result<String, ClientError>>,
}

impl MockServer {
    pub(crate) async fn recv(&mut self) -> Option<ClientFrame> {
        let text = self.from_client.next().await?;
        Some(serde_json::from_str(&text).expect("client sent an unparsable frame"))
    }

    /// Next frame that is not an `audio_chunk`.
    pub(crate) async fn recv_control(&mut self) -> Option<ClientFrame> {
        loop {
            match self.recv().await? {
                ClientFrame::AudioChunk(_) => continue,
                frame => return Some(frame),
            }
        }
    }

    pub(crate) fn send(&self, frame: serde_json::Value) {
        let _ = self.to_client.unbounded_send(Ok(frame.to_string()));
    }

    pub(crate) fn send_raw(&self, text: &str) {
        let _ = self.to_client.unbounded_send(Ok(text.to_string()));
    }

    pub(crate) fn fail(&self, error: ClientError) {
        let _ = self.to_client.unbounded_send(Err(error));
    }

    /// Accepts the login and initializes with one session, `s-1`, as current.
    pub(crate) async fn handshake(&mut self) {
        match self.recv().await {
            Some(ClientFrame::Login(_)) => {}
            other => panic!("expected login, got {:?}", other),
        }
        self.send(serde_json::json!({"type": "authenticated", "user_id": "u-1"}));
        self.send(serde_json::json!({
            "type": "session_list",
            "sessions": [{"session_id": "s-1", "name": "First"}],
            "current_session_id": "s-1"
        }));
    }
}
