/**
 * ERREURS BRT FORWARDER - Taxonomie des erreurs du relais
 *
 * RÔLE :
 * Un enum par préoccupation : cache persistant, configuration, relais HTTP.
 * Aucune de ces erreurs ne doit terminer le processus : le cache retombe sur
 * un état vide, le relais les convertit en résultat d'échec par cible.
 */

/// Erreurs de chargement/sauvegarde du fichier de cache
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Persistence task failed: {0}")]
    Task(String),
}

/// Erreurs de construction de la configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Échec d'une tentative de relais vers une cible
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(u16),
}
