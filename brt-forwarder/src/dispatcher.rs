/**
 * RELAIS SÉQUENTIEL - Envoi du payload résolu vers les cibles configurées
 *
 * FONCTIONNEMENT :
 * - Cibles traitées une par une, dans l'ordre de configuration, jamais en parallèle
 * - Par cible : jusqu'à 1 + retries tentatives (POST JSON, timeout propre à la cible)
 * - Une tentative réussit ssi le statut HTTP vaut exactement 200
 * - L'échec d'une cible n'interrompt jamais les suivantes
 * - Aucun verrou du cache n'est tenu ici : le payload est déjà résolu
 *
 * Cycle par cible : PENDING -> SENDING -> SUCCESS | FAILED_ATTEMPT,
 * FAILED_ATTEMPT -> SENDING tant qu'il reste des tentatives, sinon FAILED.
 */

use crate::config::ForwardTarget;
use crate::error::ForwardError;
use crate::models::{ForwardResult, GatewayPayload};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Clone, Default)]
pub struct ForwardDispatcher {
    client: reqwest::Client,
}

impl ForwardDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Relaie `payload` vers chaque cible et retourne un résultat par cible, dans l'ordre
    pub async fn dispatch(&self, payload: &GatewayPayload, targets: &[ForwardTarget]) -> Vec<ForwardResult> {
        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => {
                error!("cannot serialize payload for forwarding: {}", e);
                return targets
                    .iter()
                    .map(|t| ForwardResult { url: t.url.clone(), success: false, attempts: 0 })
                    .collect();
            }
        };
        debug!("forwarding {} bytes to {} targets", body.len(), targets.len());

        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            results.push(self.forward_to(target, &body).await);
        }

        let ok = results.iter().filter(|r| r.success).count();
        info!("forwarding done: {}/{} targets succeeded", ok, results.len());
        results
    }

    async fn forward_to(&self, target: &ForwardTarget, body: &[u8]) -> ForwardResult {
        let max_attempts = target.max_attempts();
        let mut attempts = 0;
        let mut success = false;

        while attempts < max_attempts && !success {
            attempts += 1;
            match self.attempt(target, body).await {
                Ok(elapsed) => {
                    success = true;
                    info!(
                        "forward success: {}, status=200, time={}ms",
                        target.url,
                        elapsed.as_millis()
                    );
                }
                Err(ForwardError::Status(code)) => {
                    warn!(
                        "forward failed: {}, status={}, attempt={}/{}",
                        target.url, code, attempts, max_attempts
                    );
                }
                Err(ForwardError::Timeout(after)) => {
                    warn!(
                        "forward timeout: {} after {:?}, attempt={}/{}",
                        target.url, after, attempts, max_attempts
                    );
                }
                Err(e) => {
                    error!(
                        "forward exception: {}, error={}, attempt={}/{}",
                        target.url, e, attempts, max_attempts
                    );
                }
            }

            if !success && attempts < max_attempts {
                tokio::time::sleep(target.retry_delay).await;
            }
        }

        ForwardResult { url: target.url.clone(), success, attempts }
    }

    async fn attempt(&self, target: &ForwardTarget, body: &[u8]) -> Result<Duration, ForwardError> {
        let started = Instant::now();
        let response = self
            .client
            .post(&target.url)
            .timeout(target.timeout)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ForwardError::Timeout(target.timeout)
                } else {
                    ForwardError::Transport(e)
                }
            })?;

        if response.status() == StatusCode::OK {
            Ok(started.elapsed())
        } else {
            Err(ForwardError::Status(response.status().as_u16()))
        }
    }
}
