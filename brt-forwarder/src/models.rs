use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Dernière valeur valide connue d'une métrique
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricEntry {
    pub value: String,
    pub scan_time: i64,
    pub updated_at: i64,
}

/// metric -> entrée
pub type DeviceMetrics = HashMap<String, MetricEntry>;
/// ble_addr -> métriques (format exact du fichier de cache)
pub type CacheMap = HashMap<String, DeviceMetrics>;

/// Payload reçu d'une passerelle BRT.
/// Seul `devices` est typé. Tout le reste (seq_no, time, cmd, cbid, champs
/// inconnus) est gardé tel quel dans `extra`, y compris les `null`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayPayload {
    // déclaré en premier : les champs d'en-tête ressortent avant `devices`
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    #[serde(default, skip_serializing_if = "DeviceList::is_absent")]
    pub devices: DeviceList,
}

impl GatewayPayload {
    /// Vrai pour un objet JSON `{}` (rien à traiter ni à relayer)
    pub fn is_empty(&self) -> bool {
        self.devices.is_absent() && self.extra.is_empty()
    }

    pub fn devices(&self) -> &[DeviceRecord] {
        match &self.devices {
            DeviceList::Items(items) => items,
            _ => &[],
        }
    }

    pub fn devices_mut(&mut self) -> &mut [DeviceRecord] {
        match &mut self.devices {
            DeviceList::Items(items) => items,
            _ => &mut [],
        }
    }

    /// `seq_no` pour les logs, quel que soit son type JSON
    pub fn seq_label(&self) -> String {
        match self.extra.get("seq_no") {
            None | Some(Value::Null) => "N/A".into(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }
}

/// Champ `devices` tel que reçu : absent, `null`, ou liste
#[derive(Debug, Clone, Default, PartialEq)]
pub enum DeviceList {
    #[default]
    Absent,
    Null,
    Items(Vec<DeviceRecord>),
}

impl DeviceList {
    pub fn is_absent(&self) -> bool {
        matches!(self, DeviceList::Absent)
    }
}

impl Serialize for DeviceList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DeviceList::Items(items) => items.serialize(serializer),
            DeviceList::Absent | DeviceList::Null => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for DeviceList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Option::<Vec<DeviceRecord>>::deserialize(deserializer)? {
            Some(items) => DeviceList::Items(items),
            None => DeviceList::Null,
        })
    }
}

/// Un capteur dans le payload. Tous les champs restent bruts ;
/// `ble_addr` et `scan_time` ne sont interprétés qu'à la lecture.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceRecord {
    pub fields: Map<String, Value>,
}

impl DeviceRecord {
    /// Adresse BLE si présente, textuelle et non vide
    pub fn ble_addr(&self) -> Option<&str> {
        self.fields
            .get("ble_addr")
            .and_then(Value::as_str)
            .filter(|a| !a.is_empty())
    }

    /// `scan_time` ramené à un entier pour le cache (0 si absent ou illisible)
    pub fn scan_time(&self) -> i64 {
        match self.fields.get("scan_time") {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .unwrap_or(0),
            Some(Value::String(s)) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f as i64))
                    .unwrap_or(0)
            }
            _ => 0,
        }
    }

    /// Valeur brute d'une métrique si elle est présente ET textuelle
    pub fn metric_str(&self, metric: &str) -> Option<&str> {
        self.fields.get(metric).and_then(Value::as_str)
    }

    pub fn set_metric(&mut self, metric: &str, value: String) {
        self.fields.insert(metric.to_string(), Value::String(value));
    }
}

/// Résultat de relais pour une cible (jamais persisté)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardResult {
    pub url: String,
    pub success: bool,
    pub attempts: u32,
}

/// Vue d'un capteur pour l'API de consultation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceView {
    pub ble_addr: String,
    pub cached_metrics: DeviceMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub device_count: usize,
    pub metric_count: usize,
    pub dirty: bool,
}
