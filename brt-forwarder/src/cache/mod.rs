/**
 * CACHE MÉTRIQUES - Dernières valeurs valides par capteur et par métrique
 *
 * RÔLE :
 * Mémoire du relais : pour chaque ble_addr, la dernière valeur valide connue
 * de chaque métrique spéciale. Sert à réparer les relevés sentinelles (FFFF...).
 *
 * FONCTIONNEMENT :
 * - Map ble_addr -> metric -> MetricEntry sous un unique RwLock parking_lot
 * - get/put ne tiennent le verrou que le temps d'une opération sur la map
 * - Compteur de version : chaque mutation l'incrémente, la persistance retient
 *   la dernière version écrite sur disque. dirty = version != persisted
 * - Persistance (module persist) : snapshot sous verrou, écriture hors verrou
 *
 * ACCÈS :
 * Un seul schéma d'accès (capteur, métrique). Pas de requêtes par plage,
 * pas de transaction multi-clés.
 */

mod persist;

pub use persist::{load_cache_file, spawn_persistence_loop, write_atomic, PersistenceHandle};

use crate::error::CacheError;
use crate::models::{CacheMap, CacheStats, DeviceMetrics, MetricEntry};
use parking_lot::RwLock;
use std::path::Path;
use tracing::{debug, info};

const SECS_PER_DAY: i64 = 24 * 60 * 60;

/// Politique d'écriture face aux relevés arrivant dans le désordre
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WritePolicy {
    /// Toute écriture écrase l'entrée existante
    #[default]
    Overwrite,
    /// Ignore une écriture dont le scan_time est antérieur à celui stocké
    RejectOutOfOrder,
}

/// Copie immuable du cache prise pour la persistance
#[derive(Debug, Clone)]
pub struct CacheSnapshot {
    pub data: CacheMap,
    pub version: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    devices: CacheMap,
    version: u64,
    persisted: u64,
}

impl CacheInner {
    fn touch(&mut self) {
        self.version += 1;
    }

    fn is_dirty(&self) -> bool {
        self.version != self.persisted
    }
}

#[derive(Debug, Default)]
pub struct CacheStore {
    inner: RwLock<CacheInner>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construit un store propre (non dirty) à partir de données déjà persistées
    pub fn from_map(devices: CacheMap) -> Self {
        Self {
            inner: RwLock::new(CacheInner {
                devices,
                version: 0,
                persisted: 0,
            }),
        }
    }

    /// Charge le fichier de cache. Absent ou corrompu : store vide, jamais d'erreur.
    pub fn load_from_disk<P: AsRef<Path>>(path: P) -> Self {
        Self::from_map(load_cache_file(path.as_ref()))
    }

    pub fn get(&self, device: &str, metric: &str) -> Option<MetricEntry> {
        self.inner.read().devices.get(device)?.get(metric).cloned()
    }

    /// Écrase l'entrée (device, metric) sans condition et marque le store dirty
    pub fn put(&self, device: &str, metric: &str, value: &str, scan_time: i64, now: i64) {
        self.put_with_policy(device, metric, value, scan_time, now, WritePolicy::Overwrite);
    }

    /// Variante de `put` soumise à une politique. Retourne false si l'écriture est ignorée.
    pub fn put_with_policy(
        &self,
        device: &str,
        metric: &str,
        value: &str,
        scan_time: i64,
        now: i64,
        policy: WritePolicy,
    ) -> bool {
        let mut inner = self.inner.write();
        let metrics = inner.devices.entry(device.to_string()).or_default();

        if policy == WritePolicy::RejectOutOfOrder {
            if let Some(existing) = metrics.get(metric) {
                if scan_time < existing.scan_time {
                    debug!(
                        "skip out-of-order write for {}.{} (scan_time {} < {})",
                        device, metric, scan_time, existing.scan_time
                    );
                    return false;
                }
            }
        }

        metrics.insert(
            metric.to_string(),
            MetricEntry {
                value: value.to_string(),
                scan_time,
                updated_at: now,
            },
        );
        inner.touch();
        true
    }

    /// Toutes les métriques connues d'un capteur
    pub fn device(&self, device: &str) -> Option<DeviceMetrics> {
        self.inner
            .read()
            .devices
            .get(device)
            .filter(|metrics| !metrics.is_empty())
            .cloned()
    }

    /// Copie complète, quel que soit l'état dirty
    pub fn snapshot(&self) -> CacheSnapshot {
        let inner = self.inner.read();
        CacheSnapshot {
            data: inner.devices.clone(),
            version: inner.version,
        }
    }

    /// Copie à persister, seulement si des mutations ne sont pas encore sur disque
    pub fn snapshot_if_dirty(&self) -> Option<CacheSnapshot> {
        let inner = self.inner.read();
        inner.is_dirty().then(|| CacheSnapshot {
            data: inner.devices.clone(),
            version: inner.version,
        })
    }

    /// Enregistre qu'un snapshot a été écrit. Les mutations postérieures au
    /// snapshot laissent le store dirty.
    pub fn mark_persisted(&self, version: u64) {
        let mut inner = self.inner.write();
        if version > inner.persisted {
            inner.persisted = version;
        }
    }

    /// Écrit le cache sur disque s'il est dirty. Retourne true si un fichier a été écrit.
    pub fn flush<P: AsRef<Path>>(&self, path: P) -> Result<bool, CacheError> {
        let Some(snapshot) = self.snapshot_if_dirty() else {
            return Ok(false);
        };
        let json = serde_json::to_vec_pretty(&snapshot.data)?;
        write_atomic(path.as_ref(), &json)?;
        self.mark_persisted(snapshot.version);
        debug!(
            "cache persisted to {} (version {}, {} devices)",
            path.as_ref().display(),
            snapshot.version,
            snapshot.data.len()
        );
        Ok(true)
    }

    /// Balayage de maintenance : supprime les entrées dont updated_at précède
    /// `now - max_age_days`, puis les capteurs devenus vides.
    pub fn expire_older_than(&self, max_age_days: u32, now: i64) -> usize {
        let cutoff = now - i64::from(max_age_days) * SECS_PER_DAY;
        let mut removed = 0;

        let mut inner = self.inner.write();
        inner.devices.retain(|device, metrics| {
            metrics.retain(|metric, entry| {
                if entry.updated_at < cutoff {
                    debug!("expiring {}.{} (updated_at {})", device, metric, entry.updated_at);
                    removed += 1;
                    false
                } else {
                    true
                }
            });
            !metrics.is_empty()
        });

        if removed > 0 {
            inner.touch();
            info!("expired {} cache entries older than {} days", removed, max_age_days);
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.read();
        CacheStats {
            device_count: inner.devices.len(),
            metric_count: inner.devices.values().map(|m| m.len()).sum(),
            dirty: inner.is_dirty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_put_then_get_is_visible() {
        let store = CacheStore::new();
        assert!(store.get("E7E8F5F8C9A4", "co2").is_none());

        store.put("E7E8F5F8C9A4", "co2", "0234", 100, 1_000);
        let entry = store.get("E7E8F5F8C9A4", "co2").unwrap();
        assert_eq!(entry.value, "0234");
        assert_eq!(entry.scan_time, 100);
        assert_eq!(entry.updated_at, 1_000);
        assert!(store.stats().dirty);
    }

    #[test]
    fn test_device_key_is_case_sensitive() {
        let store = CacheStore::new();
        store.put("e7e8f5f8c9a4", "co2", "0234", 1, 1);
        assert!(store.get("E7E8F5F8C9A4", "co2").is_none());
    }

    #[test]
    fn test_put_overwrites_even_with_older_scan_time() {
        let store = CacheStore::new();
        store.put("dev", "co2", "0234", 200, 1_000);
        store.put("dev", "co2", "0111", 150, 1_010);

        let entry = store.get("dev", "co2").unwrap();
        assert_eq!(entry.value, "0111");
        assert_eq!(entry.scan_time, 150);
        assert_eq!(entry.updated_at, 1_010);
    }

    #[test]
    fn test_reject_out_of_order_policy() {
        let store = CacheStore::new();
        assert!(store.put_with_policy("dev", "co2", "0234", 200, 1_000, WritePolicy::RejectOutOfOrder));
        assert!(!store.put_with_policy("dev", "co2", "0111", 150, 1_010, WritePolicy::RejectOutOfOrder));
        assert_eq!(store.get("dev", "co2").unwrap().value, "0234");

        // même scan_time : accepté
        assert!(store.put_with_policy("dev", "co2", "0300", 200, 1_020, WritePolicy::RejectOutOfOrder));
        assert_eq!(store.get("dev", "co2").unwrap().value, "0300");
    }

    #[test]
    fn test_stats_and_device_lookup() {
        let store = CacheStore::new();
        store.put("a", "co2", "0001", 1, 1);
        store.put("a", "voc", "0002", 1, 1);
        store.put("b", "co2", "0003", 1, 1);

        let stats = store.stats();
        assert_eq!(stats.device_count, 2);
        assert_eq!(stats.metric_count, 3);

        let a = store.device("a").unwrap();
        assert_eq!(a.len(), 2);
        assert!(store.device("zz").is_none());
    }

    #[test]
    fn test_mutation_after_snapshot_keeps_store_dirty() {
        let store = CacheStore::new();
        store.put("dev", "co2", "0234", 1, 1);

        let snap = store.snapshot_if_dirty().unwrap();
        store.put("dev", "voc", "0010", 1, 2);
        store.mark_persisted(snap.version);
        assert!(store.stats().dirty);

        let snap = store.snapshot_if_dirty().unwrap();
        store.mark_persisted(snap.version);
        assert!(!store.stats().dirty);
        assert!(store.snapshot_if_dirty().is_none());
    }

    #[test]
    fn test_loaded_store_starts_clean() {
        let mut map = CacheMap::new();
        map.entry("dev".into()).or_default().insert(
            "co2".into(),
            MetricEntry { value: "0234".into(), scan_time: 1, updated_at: 2 },
        );
        let store = CacheStore::from_map(map);
        assert!(!store.stats().dirty);
        assert_eq!(store.get("dev", "co2").unwrap().value, "0234");
    }

    #[test]
    fn test_expire_removes_old_entries_and_empty_devices() {
        let now = 100 * SECS_PER_DAY;
        let store = CacheStore::new();
        store.put("old-dev", "co2", "0001", 1, now - 10 * SECS_PER_DAY);
        store.put("mixed", "co2", "0002", 1, now - 8 * SECS_PER_DAY);
        store.put("mixed", "voc", "0003", 1, now - SECS_PER_DAY);
        store.put("fresh", "co2", "0004", 1, now);
        let snap = store.snapshot();
        store.mark_persisted(snap.version);

        let removed = store.expire_older_than(7, now);
        assert_eq!(removed, 2);
        assert!(store.device("old-dev").is_none());
        assert!(store.get("mixed", "co2").is_none());
        assert_eq!(store.get("mixed", "voc").unwrap().value, "0003");
        assert_eq!(store.get("fresh", "co2").unwrap().updated_at, now);
        assert_eq!(store.stats().device_count, 2);
        assert!(store.stats().dirty);
    }

    #[test]
    fn test_expire_boundary_is_retained() {
        let now = 30 * SECS_PER_DAY;
        let store = CacheStore::new();
        store.put("dev", "co2", "0001", 1, now - 7 * SECS_PER_DAY);
        let snap = store.snapshot();
        store.mark_persisted(snap.version);

        assert_eq!(store.expire_older_than(7, now), 0);
        assert!(store.get("dev", "co2").is_some());
        assert!(!store.stats().dirty);
    }

    #[test]
    fn test_concurrent_puts_from_threads() {
        let store = Arc::new(CacheStore::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        store.put(&format!("dev{t}"), &format!("m{i}"), "0001", i, i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let stats = store.stats();
        assert_eq!(stats.device_count, 8);
        assert_eq!(stats.metric_count, 800);
    }
}
