//! Message transport seam.
//!
//! The real transport (socket handling, framing on the wire) is an external
//! collaborator; the broker only needs to push serialized responses to a
//! client by its transport identity.

use std::collections::HashMap;
use std::sync::mpsc::Sender;
use std::sync::Mutex;

use emberfs_proto::{deserialize_message, Response};

/// Delivers serialized messages to clients.
pub trait ClientTransport: Send + Sync {
    /// Queue `data` for delivery to `client_id`. Delivery is best effort;
    /// a vanished client is not an error.
    fn reply(&self, client_id: &str, data: &[u8]);
}

/// Transport that records every message, used by the test-suite.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(String, Vec<u8>)>>,
}

impl RecordingTransport {
    /// An empty recording transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// All messages sent so far as `(client_id, decoded response)`.
    pub fn responses(&self) -> Vec<(String, Response)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(id, data)| {
                deserialize_message::<Response>(data)
                    .ok()
                    .map(|rsp| (id.clone(), rsp))
            })
            .collect()
    }

    /// Messages addressed to one client.
    pub fn responses_to(&self, client_id: &str) -> Vec<Response> {
        self.responses()
            .into_iter()
            .filter(|(id, _)| id == client_id)
            .map(|(_, rsp)| rsp)
            .collect()
    }

    /// Raw frames sent so far.
    pub fn raw(&self) -> Vec<(String, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    /// Drop everything recorded so far.
    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

impl ClientTransport for RecordingTransport {
    fn reply(&self, client_id: &str, data: &[u8]) {
        self.sent
            .lock()
            .unwrap()
            .push((client_id.to_string(), data.to_vec()));
    }
}

/// Transport backed by per-client channels, used by the service wiring.
#[derive(Default)]
pub struct ChannelTransport {
    clients: Mutex<HashMap<String, Sender<Vec<u8>>>>,
}

impl ChannelTransport {
    /// An empty channel transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an outbound channel for `client_id`, replacing any previous one.
    pub fn attach(&self, client_id: &str, tx: Sender<Vec<u8>>) {
        self.clients
            .lock()
            .unwrap()
            .insert(client_id.to_string(), tx);
    }

    /// Detach a client connection.
    pub fn detach(&self, client_id: &str) {
        self.clients.lock().unwrap().remove(client_id);
    }
}

impl ClientTransport for ChannelTransport {
    fn reply(&self, client_id: &str, data: &[u8]) {
        let clients = self.clients.lock().unwrap();
        if let Some(tx) = clients.get(client_id) {
            // a disconnected receiver is a vanished client
            let _ = tx.send(data.to_vec());
        }
    }
}
