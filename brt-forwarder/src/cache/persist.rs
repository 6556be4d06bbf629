/**
 * PERSISTANCE DU CACHE - Fichier JSON + boucle de synchronisation
 *
 * FONCTIONNEMENT :
 * - Chargement : fichier absent ou corrompu => cache vide + warning, jamais fatal
 * - Écriture atomique : fichier temporaire voisin, fsync, rename sur la cible.
 *   Le rename est le seul point de mutation du vrai chemin.
 * - Boucle périodique indépendante du trafic : snapshot bref sous verrou,
 *   écriture disque hors verrou (spawn_blocking)
 * - Arrêt : signal de fin puis flush synchrone forcé
 */

use super::CacheStore;
use crate::error::CacheError;
use crate::models::CacheMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lit le fichier de cache. Toute erreur dégrade en cache vide.
pub fn load_cache_file(path: &Path) -> CacheMap {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!("no cache file at {}, starting with an empty cache", path.display());
            return CacheMap::new();
        }
        Err(e) => {
            warn!("cache file {} unreadable, starting with an empty cache: {}", path.display(), e);
            return CacheMap::new();
        }
    };

    match serde_json::from_str::<CacheMap>(&content) {
        Ok(map) => {
            info!("loaded cache for {} devices from {}", map.len(), path.display());
            map
        }
        Err(e) => {
            warn!("cache file corrupted, creating new cache: {}", e);
            CacheMap::new()
        }
    }
}

/// Écrit `bytes` sur `path` de façon atomique (tmp voisin + rename).
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    write_atomic_with(path, |file| file.write_all(bytes))
}

// `fill` remplit le fichier temporaire ; en cas d'erreur le tmp est supprimé
// et `path` n'est jamais touché
fn write_atomic_with<F>(path: &Path, fill: F) -> io::Result<()>
where
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let tmp = tmp_path(path);

    let written = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&tmp)
        .and_then(|mut file| {
            fill(&mut file)?;
            file.sync_all()
        });
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    fsync_parent(path)
}

// Nom unique : un flush d'arrêt peut croiser un tick de la boucle
fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(format!(".{}.tmp", Uuid::new_v4().simple()));
    PathBuf::from(os)
}

#[cfg(target_family = "unix")]
fn fsync_parent(path: &Path) -> io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    File::open(parent)?.sync_all()
}

#[cfg(not(target_family = "unix"))]
fn fsync_parent(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Poignée sur la boucle de persistance en arrière-plan
pub struct PersistenceHandle {
    store: Arc<CacheStore>,
    path: PathBuf,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PersistenceHandle {
    /// Arrête la boucle puis force un flush synchrone jusqu'au bout.
    /// Retourne true si un fichier a été écrit par ce flush final.
    pub async fn shutdown(self) -> Result<bool, CacheError> {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            error!("persistence loop ended abnormally: {}", e);
        }

        let store = self.store;
        let path = self.path;
        let flushed = tokio::task::spawn_blocking(move || store.flush(&path))
            .await
            .map_err(|e| CacheError::Task(e.to_string()))??;
        info!("final cache flush done (written: {})", flushed);
        Ok(flushed)
    }
}

/// Démarre la synchronisation périodique du cache vers `path`
pub fn spawn_persistence_loop(
    store: Arc<CacheStore>,
    path: PathBuf,
    every: Duration,
) -> PersistenceHandle {
    info!("starting cache persistence loop (every {:?}) -> {}", every, path.display());
    let (stop, mut stopped) = watch::channel(false);

    let task = {
        let store = store.clone();
        let path = path.clone();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => sync_once(&store, &path).await,
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            debug!("persistence loop stopping");
                            break;
                        }
                    }
                }
            }
        })
    };

    PersistenceHandle { store, path, stop, task }
}

// Un tick : les erreurs et les panics de l'écriture sont journalisés, la boucle continue
async fn sync_once(store: &Arc<CacheStore>, path: &Path) {
    let store = store.clone();
    let path_buf = path.to_path_buf();
    match tokio::task::spawn_blocking(move || store.flush(&path_buf)).await {
        Ok(Ok(true)) => debug!("cache synced to {}", path.display()),
        Ok(Ok(false)) => {}
        Ok(Err(e)) => error!("failed to save cache to {}: {}", path.display(), e),
        Err(e) => error!("cache sync task panicked: {}", e),
    }
}
