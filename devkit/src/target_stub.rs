/*!
Cible HTTP simulée pour tester le relais sans serveur réel

Démarre un petit serveur axum sur un port éphémère. Chaque POST est
enregistré, puis reçoit le prochain statut du script (ou le statut par défaut).
*/

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use serde_json::Value;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// Requête reçue par une cible simulée
#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub body: Value,
    pub content_type: Option<String>,
}

/// Journal partagé entre plusieurs cibles : ordre global des appels
#[derive(Debug, Clone, Default)]
pub struct CallJournal {
    calls: Arc<Mutex<Vec<String>>>,
}

impl CallJournal {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, name: &str) {
        self.calls.lock().unwrap().push(name.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

struct StubState {
    name: String,
    script: Mutex<VecDeque<u16>>,
    fallback: u16,
    delay: Duration,
    received: Mutex<Vec<ReceivedRequest>>,
    journal: Option<CallJournal>,
}

/// Configuration d'une cible avant démarrage
pub struct MockTargetBuilder {
    name: String,
    script: VecDeque<u16>,
    fallback: u16,
    delay: Duration,
    journal: Option<CallJournal>,
}

impl MockTargetBuilder {
    /// Statut de la prochaine réponse (les appels successifs s'empilent)
    pub fn respond(mut self, status: u16) -> Self {
        self.script.push_back(status);
        self
    }

    /// Statut une fois le script épuisé
    pub fn fallback(mut self, status: u16) -> Self {
        self.fallback = status;
        self
    }

    /// Latence avant chaque réponse (pour tester les timeouts)
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    pub fn journal(mut self, journal: &CallJournal) -> Self {
        self.journal = Some(journal.clone());
        self
    }

    pub async fn start(self) -> Result<MockTarget> {
        let state = Arc::new(StubState {
            name: self.name,
            script: Mutex::new(self.script),
            fallback: self.fallback,
            delay: self.delay,
            received: Mutex::new(Vec::new()),
            journal: self.journal,
        });

        let app = Router::new()
            .route("/ingest", post(ingest))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown, stopped) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                stopped.await.ok();
            });
            if let Err(e) = server.await {
                log::warn!("[MOCK] target {} stopped with error: {}", addr, e);
            }
        });

        log::info!("🎯 [MOCK] target '{}' listening on {}", state.name, addr);
        Ok(MockTarget { addr, state, shutdown: Some(shutdown) })
    }
}

/// Cible HTTP simulée. Le serveur s'arrête quand la valeur est droppée.
pub struct MockTarget {
    addr: SocketAddr,
    state: Arc<StubState>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl MockTarget {
    pub fn builder() -> MockTargetBuilder {
        MockTargetBuilder {
            name: "target".to_string(),
            script: VecDeque::new(),
            fallback: 200,
            delay: Duration::ZERO,
            journal: None,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}/ingest", self.addr)
    }

    /// Nombre de requêtes reçues
    pub fn hits(&self) -> usize {
        self.state.received.lock().unwrap().len()
    }

    pub fn received(&self) -> Vec<ReceivedRequest> {
        self.state.received.lock().unwrap().clone()
    }

    /// Dernier corps JSON reçu
    pub fn last_json(&self) -> Option<Value> {
        self.state.received.lock().unwrap().last().map(|r| r.body.clone())
    }
}

impl Drop for MockTarget {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn ingest(State(state): State<Arc<StubState>>, headers: HeaderMap, body: Bytes) -> StatusCode {
    let request = ReceivedRequest {
        body: serde_json::from_slice(&body).unwrap_or(Value::Null),
        content_type: headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    };
    state.received.lock().unwrap().push(request);
    if let Some(journal) = &state.journal {
        journal.record(&state.name);
    }

    let status = state.script.lock().unwrap().pop_front().unwrap_or(state.fallback);
    if !state.delay.is_zero() {
        tokio::time::sleep(state.delay).await;
    }
    log::info!("📨 [MOCK] '{}' answered {}", state.name, status);
    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}
