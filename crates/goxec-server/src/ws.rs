//! WebSocket sessions and the job-to-session registry.
//!
//! A session is bound to a single `job_id`. The hub maps job ids to session
//! senders; the log-bus pump calls [`SessionHub::dispatch`] for every frame
//! it sees and the hub forwards the frame to the matching session, if any.
//! Delivery is best-effort: a slow or closed session drops frames rather
//! than stalling the pump. Sessions end on the terminal status frame or on
//! peer disconnect; there is no resume.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use goxec_core::Frame;
use tokio::sync::{mpsc, RwLock};

/// Frames buffered per session before the pump starts dropping.
const SESSION_BUFFER: usize = 64;

/// Process-local registry of live sessions, keyed by job id.
#[derive(Default)]
pub struct SessionHub {
    sessions: RwLock<HashMap<String, mpsc::Sender<Frame>>>,
}

impl SessionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session for `job_id`, returning its frame receiver.
    /// A newer session for the same job replaces the old registration.
    pub async fn register(&self, job_id: &str) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        self.sessions.write().await.insert(job_id.to_string(), tx);
        rx
    }

    pub async fn unregister(&self, job_id: &str) {
        self.sessions.write().await.remove(job_id);
    }

    /// Forward a frame to the session bound to its job, if one exists.
    /// Returns whether the frame was delivered.
    pub async fn dispatch(&self, frame: &Frame) -> bool {
        let sessions = self.sessions.read().await;
        let Some(tx) = sessions.get(frame.job_id()) else {
            return false;
        };
        match tx.try_send(frame.clone()) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Dropping frame for job {}: {}", frame.job_id(), e);
                false
            }
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Drive one upgraded WebSocket until its job terminates or the peer
/// disconnects.
pub async fn serve_session(socket: WebSocket, hub: Arc<SessionHub>, job_id: String) {
    log::info!("Client connected for job {}", job_id);
    let mut frames = hub.register(&job_id).await;
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        log::error!("Failed to encode frame for job {}: {}", job_id, e);
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
                if frame.is_terminal() {
                    let _ = sink.close().await;
                    break;
                }
            }
            incoming = stream.next() => {
                // Clients only listen; anything but a live frame means the
                // peer went away.
                match incoming {
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }
        }
    }

    hub.unregister(&job_id).await;
    log::info!("Client disconnected for job {}", job_id);
}
