/**
 * SURCHARGE PAR ENVIRONNEMENT - Variables BRT_* appliquées sur l'arbre YAML
 *
 * Convention : préfixe BRT_ + double underscore par niveau, clé en minuscules.
 *   BRT_SERVER__PORT=8080        -> server.port = 8080
 *   BRT_PROCESSING__ENABLED=off  -> processing.enabled = false
 *
 * La coercition suit le type de la valeur déjà présente dans le YAML ; sans
 * valeur de référence, la chaîne est interprétée comme un scalaire YAML.
 * Le résultat est ensuite désérialisé dans le schéma typé (config.rs).
 */

use serde_yaml::{Mapping, Value};

pub const ENV_PREFIX: &str = "BRT_";
/// Variable désignant le fichier de config, ignorée par la surcharge
pub const CONFIG_PATH_VAR: &str = "BRT_CONFIG";

/// Une surcharge effectivement appliquée (pour journalisation après init des logs)
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedOverride {
    pub key_path: String,
    pub old_value: Option<Value>,
    pub new_value: Value,
}

/// Résultat de la passe de surcharge
#[derive(Debug, Default)]
pub struct OverlayReport {
    pub applied: Vec<AppliedOverride>,
    pub warnings: Vec<String>,
}

/// Applique toutes les variables BRT_* de `vars` sur `root`
pub fn apply_env_overrides<I>(root: &mut Value, vars: I) -> OverlayReport
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut report = OverlayReport::default();
    if !root.is_mapping() {
        *root = Value::Mapping(Mapping::new());
    }

    let mut vars: Vec<(String, String)> = vars
        .into_iter()
        .filter(|(k, _)| k.starts_with(ENV_PREFIX) && k != CONFIG_PATH_VAR)
        .collect();
    // ordre déterministe
    vars.sort();

    for (key, raw) in vars {
        let key_path = key[ENV_PREFIX.len()..].to_lowercase();
        if key_path.is_empty() {
            continue;
        }
        match set_nested_value(root, &key_path, &raw, &mut report.warnings) {
            Some(applied) => report.applied.push(applied),
            None => report
                .warnings
                .push(format!("cannot apply {key}: intermediate node is not a mapping")),
        }
    }
    report
}

fn set_nested_value(
    root: &mut Value,
    key_path: &str,
    raw: &str,
    warnings: &mut Vec<String>,
) -> Option<AppliedOverride> {
    let keys: Vec<&str> = key_path.split("__").collect();
    let (last, parents) = keys.split_last()?;

    let mut current = root;
    for key in parents {
        let map = current.as_mapping_mut()?;
        let k = Value::String((*key).to_string());
        if !map.contains_key(&k) {
            map.insert(k.clone(), Value::Mapping(Mapping::new()));
        }
        current = map.get_mut(&k)?;
        if !current.is_mapping() {
            return None;
        }
    }

    let map = current.as_mapping_mut()?;
    let k = Value::String((*last).to_string());
    let old_value = map.get(&k).cloned();
    let new_value = convert_value(raw, old_value.as_ref(), key_path, warnings);
    map.insert(k, new_value.clone());

    Some(AppliedOverride {
        key_path: key_path.replace("__", "."),
        old_value,
        new_value,
    })
}

fn convert_value(raw: &str, reference: Option<&Value>, key_path: &str, warnings: &mut Vec<String>) -> Value {
    match reference {
        Some(Value::Bool(_)) => Value::Bool(is_truthy(raw)),
        Some(Value::Number(n)) if n.is_f64() => match raw.trim().parse::<f64>() {
            Ok(f) => Value::from(f),
            Err(_) => {
                warnings.push(format!("cannot convert '{raw}' to float for {key_path}, keeping string"));
                Value::String(raw.to_string())
            }
        },
        Some(Value::Number(_)) => match raw.trim().parse::<i64>() {
            Ok(i) => Value::from(i),
            Err(_) => {
                warnings.push(format!("cannot convert '{raw}' to int for {key_path}, keeping string"));
                Value::String(raw.to_string())
            }
        },
        Some(Value::String(_)) => Value::String(raw.to_string()),
        Some(Value::Sequence(_)) => match infer_scalar(raw) {
            seq @ Value::Sequence(_) => seq,
            _ => Value::Sequence(
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| Value::String(s.to_string()))
                    .collect(),
            ),
        },
        _ => infer_scalar(raw),
    }
}

fn is_truthy(raw: &str) -> bool {
    matches!(raw.trim().to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

fn infer_scalar(raw: &str) -> Value {
    let lowered = raw.trim().to_lowercase();
    match lowered.as_str() {
        "true" | "yes" | "on" => return Value::Bool(true),
        "false" | "no" | "off" => return Value::Bool(false),
        "" | "null" | "none" => return Value::Null,
        _ => {}
    }
    serde_yaml::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
