/*!
Test Harness pour le relais BRT

Facilite l'écriture de tests avec:
- Répertoire temporaire et fichier de cache isolés
- Cibles HTTP simulées gérées par le harness
- Assertions sur les payloads relayés
*/

use crate::target_stub::{MockTarget, MockTargetBuilder};
use anyhow::Result;
use serde_json::Value;
use std::path::PathBuf;
use tempfile::TempDir;

/// Harness de test complet pour le relais
pub struct TestHarness {
    dir: TempDir,
    targets: Vec<MockTarget>,
}

impl TestHarness {
    pub fn new() -> Result<Self> {
        env_logger::try_init().ok(); // Init logging pour tests

        Ok(Self {
            dir: TempDir::new()?,
            targets: Vec::new(),
        })
    }

    /// Chemin du fichier de cache (dans un sous-répertoire pas encore créé)
    pub fn cache_path(&self) -> PathBuf {
        self.dir.path().join("data").join("metrics_cache.json")
    }

    /// Pré-remplit le fichier de cache
    pub fn write_cache_file(&self, content: &Value) -> Result<PathBuf> {
        let path = self.cache_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_vec_pretty(content)?)?;
        Ok(path)
    }

    pub fn read_cache_file(&self) -> Result<Value> {
        let raw = std::fs::read(self.cache_path())?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Démarre une cible et la garde en vie avec le harness
    pub async fn add_target(&mut self, builder: MockTargetBuilder) -> Result<&MockTarget> {
        let target = builder.start().await?;
        self.targets.push(target);
        let idx = self.targets.len() - 1;
        Ok(&self.targets[idx])
    }

    pub fn target(&self, idx: usize) -> &MockTarget {
        &self.targets[idx]
    }

    pub fn target_urls(&self) -> Vec<String> {
        self.targets.iter().map(MockTarget::url).collect()
    }

    /// Vérifie un champ du dernier payload reçu par une cible.
    /// Le chemin accepte les index de tableau : `devices.0.co2`.
    pub fn assert_field_equals(&self, idx: usize, field_path: &str, expected: &Value) -> Result<()> {
        let Some(body) = self.target(idx).last_json() else {
            anyhow::bail!("Target {} received nothing", idx);
        };
        match get_nested_field(&body, field_path) {
            Some(actual) if actual == expected => {
                log::info!("✅ Field '{}' matches: {:?}", field_path, expected);
                Ok(())
            }
            Some(actual) => anyhow::bail!(
                "Field '{}' mismatch: expected {:?}, got {:?}",
                field_path,
                expected,
                actual
            ),
            None => anyhow::bail!("Field '{}' not found in payload of target {}", field_path, idx),
        }
    }

    /// YAML minimal pointant vers les cibles du harness
    pub fn config_yaml(&self, special_metrics: &[&str]) -> String {
        let mut out = String::new();
        out.push_str("cache:\n");
        out.push_str(&format!("  file_path: \"{}\"\n", self.cache_path().display()));
        out.push_str(&format!("  special_metrics: [{}]\n", special_metrics.join(", ")));
        out.push_str("forwarder:\n  targets:\n");
        for url in self.target_urls() {
            out.push_str(&format!("    - url: \"{}\"\n      timeout_secs: 2\n", url));
        }
        out
    }

    pub fn get_stats(&self) -> TestStats {
        TestStats {
            total_requests: self.targets.iter().map(MockTarget::hits).sum(),
            per_target: self.targets.iter().map(MockTarget::hits).collect(),
        }
    }
}

fn get_nested_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.') {
        current = match current {
            Value::Object(obj) => obj.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

#[derive(Debug)]
pub struct TestStats {
    pub total_requests: usize,
    pub per_target: Vec<usize>,
}
