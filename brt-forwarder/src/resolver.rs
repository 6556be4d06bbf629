/**
 * RÉSOLUTION DES MÉTRIQUES - Réparation des valeurs sentinelles
 *
 * RÔLE :
 * Pour chaque capteur du payload et chaque métrique spéciale présente :
 * - valeur sentinelle (FFFF, FFFE... insensible à la casse) : remplacée par la
 *   dernière valeur valide du cache si le traitement est actif et si le cache
 *   en connaît une ; sinon laissée telle quelle
 * - valeur valide : toujours écrite dans le cache, traitement actif ou non
 *
 * Les métriques hors liste ne sont ni vérifiées ni mises en cache.
 * Seule la valeur est substituée : le scan_time du capteur reste celui reçu.
 */

use crate::cache::{CacheStore, WritePolicy};
use crate::config::ForwarderConfig;
use crate::models::GatewayPayload;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Paramètres immuables de la résolution
#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub special_metrics: Vec<String>,
    invalid_patterns: HashSet<String>,
    pub processing_enabled: bool,
    pub write_policy: WritePolicy,
}

impl ResolverSettings {
    pub fn new<S, P>(special_metrics: S, invalid_patterns: P, processing_enabled: bool) -> Self
    where
        S: IntoIterator,
        S::Item: Into<String>,
        P: IntoIterator,
        P::Item: AsRef<str>,
    {
        Self {
            special_metrics: special_metrics.into_iter().map(Into::into).collect(),
            invalid_patterns: invalid_patterns
                .into_iter()
                .map(|p| p.as_ref().to_uppercase())
                .collect(),
            processing_enabled,
            write_policy: WritePolicy::Overwrite,
        }
    }

    pub fn from_config(cfg: &ForwarderConfig) -> Self {
        let policy = if cfg.cache.reject_out_of_order {
            WritePolicy::RejectOutOfOrder
        } else {
            WritePolicy::Overwrite
        };
        Self::new(
            cfg.cache.special_metrics.iter().cloned(),
            cfg.cache.invalid_patterns.iter(),
            cfg.processing.enabled,
        )
        .with_write_policy(policy)
    }

    pub fn with_write_policy(mut self, policy: WritePolicy) -> Self {
        self.write_policy = policy;
        self
    }

    pub fn is_invalid(&self, value: &str) -> bool {
        self.invalid_patterns.contains(&value.to_uppercase())
    }
}

/// Compteurs d'une passe de résolution (journalisation / tests)
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResolveSummary {
    pub substituted: usize,
    pub kept_invalid: usize,
    pub cached: usize,
    pub skipped_devices: usize,
}

pub struct MetricResolver {
    cache: Arc<CacheStore>,
    settings: ResolverSettings,
}

impl MetricResolver {
    pub fn new(cache: Arc<CacheStore>, settings: ResolverSettings) -> Self {
        Self { cache, settings }
    }

    pub fn settings(&self) -> &ResolverSettings {
        &self.settings
    }

    /// Répare `payload` en place et alimente le cache avec les valeurs valides
    pub fn resolve(&self, payload: &mut GatewayPayload, now: i64) -> ResolveSummary {
        let mut summary = ResolveSummary::default();

        for device in payload.devices_mut() {
            let Some(ble_addr) = device.ble_addr().map(str::to_owned) else {
                summary.skipped_devices += 1;
                continue;
            };
            let scan_time = device.scan_time();

            for metric in &self.settings.special_metrics {
                let Some(value) = device.fields.get(metric) else { continue };
                let Some(value) = value.as_str().map(str::to_owned) else {
                    debug!("{}.{} is not a string token, left untouched", ble_addr, metric);
                    continue;
                };

                if self.settings.is_invalid(&value) {
                    if !self.settings.processing_enabled {
                        info!(
                            "data processing disabled, keeping invalid value for {}.{}: {}",
                            ble_addr, metric, value
                        );
                        summary.kept_invalid += 1;
                        continue;
                    }
                    match self.cache.get(&ble_addr, metric) {
                        Some(cached) => {
                            info!("used cached value for {}.{}: {}", ble_addr, metric, cached.value);
                            device.set_metric(metric, cached.value);
                            summary.substituted += 1;
                        }
                        None => {
                            info!(
                                "no cache available for {}.{}, keeping invalid value: {}",
                                ble_addr, metric, value
                            );
                            summary.kept_invalid += 1;
                        }
                    }
                } else if self.cache.put_with_policy(
                    &ble_addr,
                    metric,
                    &value,
                    scan_time,
                    now,
                    self.settings.write_policy,
                ) {
                    info!("updated cache for {}.{}: {}", ble_addr, metric, value);
                    summary.cached += 1;
                }
            }
        }

        summary
    }
}
