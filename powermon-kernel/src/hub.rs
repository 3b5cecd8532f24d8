/*!
Hub de diffusion : pousse les états de zones aux observateurs WebSocket.

Livraison best-effort, at-most-once, sans backlog : un observateur qui se
reconnecte reçoit un snapshot complet (`init`) puis uniquement les deltas
(`state_update`). Un client dont le canal est fermé est retiré au prochain
envoi.
*/

use crate::state::{new_state, Shared};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Clone)]
pub struct Hub {
    clients: Shared<HashMap<u64, mpsc::UnboundedSender<Message>>>,
    counter: Arc<AtomicU64>,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            clients: new_state(HashMap::new()),
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    pub(crate) fn register(&self, sender: mpsc::UnboundedSender<Message>) -> u64 {
        let id = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.clients.lock().insert(id, sender);
        log::info!("[ws] client {id} connected ({} total)", self.client_count());
        id
    }

    fn remove(&self, id: u64) {
        self.clients.lock().remove(&id);
        log::info!("[ws] client {id} disconnected ({} total)", self.client_count());
    }

    /// Delta d'état d'une zone : `{type: "state_update", areaId, ...fields}`.
    pub fn broadcast_area(&self, area_id: &str, fields: serde_json::Value) {
        let mut message = serde_json::json!({
            "type": "state_update",
            "areaId": area_id,
        });
        if let (Some(target), Some(src)) = (message.as_object_mut(), fields.as_object()) {
            for (k, v) in src {
                target.insert(k.clone(), v.clone());
            }
        }
        self.send_to_all(&message);
    }

    fn send_to_all(&self, message: &serde_json::Value) {
        let text = message.to_string();
        let mut dead = Vec::new();
        {
            let clients = self.clients.lock();
            for (id, sender) in clients.iter() {
                if sender.send(Message::Text(text.clone().into())).is_err() {
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            self.remove(id);
        }
    }

    /// Boucle de vie d'un observateur : snapshot initial puis relai des
    /// deltas jusqu'à déconnexion.
    pub async fn handle_socket(self, socket: WebSocket, init_snapshot: serde_json::Value) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let id = self.register(tx);

        if ws_sender
            .send(Message::Text(init_snapshot.to_string().into()))
            .await
            .is_err()
        {
            self.remove(id);
            return;
        }

        let forward = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if ws_sender.send(msg).await.is_err() {
                    break;
                }
            }
        });

        // on ignore les messages entrants, le canal est unidirectionnel
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }

        self.remove(id);
        forward.abort();
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}
