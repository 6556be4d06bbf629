/**
 * SERVICE FORWARDER - Valeur unique construite au démarrage
 *
 * RÔLE : Possède les dépendances du cœur (cache, résolution, cibles, horloge,
 * client HTTP) et expose les deux opérations consommées par la couche HTTP :
 * process_and_forward et query_device. Partagé par Arc entre les handlers.
 */

use crate::cache::CacheStore;
use crate::clock::{Clock, SystemClock};
use crate::config::{ForwardTarget, ForwarderConfig};
use crate::dispatcher::ForwardDispatcher;
use crate::models::{CacheStats, DeviceView, ForwardResult, GatewayPayload};
use crate::resolver::{MetricResolver, ResolveSummary, ResolverSettings};
use std::sync::Arc;
use tracing::info;

pub struct ForwarderService {
    cache: Arc<CacheStore>,
    resolver: MetricResolver,
    dispatcher: ForwardDispatcher,
    targets: Vec<ForwardTarget>,
    clock: Arc<dyn Clock>,
}

impl ForwarderService {
    pub fn new(
        cache: Arc<CacheStore>,
        settings: ResolverSettings,
        targets: Vec<ForwardTarget>,
        clock: Arc<dyn Clock>,
        dispatcher: ForwardDispatcher,
    ) -> Self {
        Self {
            resolver: MetricResolver::new(cache.clone(), settings),
            cache,
            dispatcher,
            targets,
            clock,
        }
    }

    pub fn from_config(cfg: &ForwarderConfig, cache: Arc<CacheStore>) -> Self {
        Self::new(
            cache,
            ResolverSettings::from_config(cfg),
            cfg.resolved_targets(),
            Arc::new(SystemClock),
            ForwardDispatcher::new(),
        )
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn targets(&self) -> &[ForwardTarget] {
        &self.targets
    }

    pub fn processing_enabled(&self) -> bool {
        self.resolver.settings().processing_enabled
    }

    /// Résolution seule (sans relais), horodatée par l'horloge du service
    pub fn resolve(&self, payload: &mut GatewayPayload) -> ResolveSummary {
        self.resolver.resolve(payload, self.clock.now_unix())
    }

    /// Répare le payload puis le relaie vers toutes les cibles.
    /// Les échecs de relais ne remontent que dans les résultats par cible.
    pub async fn process_and_forward(&self, mut payload: GatewayPayload) -> Vec<ForwardResult> {
        let summary = self.resolve(&mut payload);
        info!(
            "seq_no={} resolved: substituted={}, kept_invalid={}, cached={}",
            payload.seq_label(),
            summary.substituted,
            summary.kept_invalid,
            summary.cached
        );
        self.dispatcher.dispatch(&payload, &self.targets).await
    }

    pub fn query_device(&self, ble_addr: &str) -> Option<DeviceView> {
        let found = self.cache.device(ble_addr);
        info!("device query: {}, found={}", ble_addr, found.is_some());
        found.map(|cached_metrics| DeviceView {
            ble_addr: ble_addr.to_string(),
            cached_metrics,
        })
    }

    pub fn expire_older_than(&self, max_age_days: u32) -> usize {
        self.cache.expire_older_than(max_age_days, self.clock.now_unix())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
