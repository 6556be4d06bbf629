/*!
Builders de payloads passerelle pour les tests

Produisent le JSON tel qu'une passerelle BLE l'envoie :
`{"seq_no", "time", "cmd", "cbid", "devices": [...]}`.
*/

use chrono::Utc;
use serde_json::{json, Map, Value};

/// Builder de payload passerelle
#[derive(Debug, Clone)]
pub struct GatewayPayloadBuilder {
    seq_no: i64,
    time: i64,
    cmd: Option<i64>,
    cbid: Option<String>,
    devices: Vec<Value>,
}

impl GatewayPayloadBuilder {
    pub fn new(seq_no: i64) -> Self {
        Self {
            seq_no,
            time: Utc::now().timestamp(),
            cmd: Some(0),
            cbid: Some("cbid-test".to_string()),
            devices: Vec::new(),
        }
    }

    pub fn time(mut self, time: i64) -> Self {
        self.time = time;
        self
    }

    pub fn cbid(mut self, cbid: &str) -> Self {
        self.cbid = Some(cbid.to_string());
        self
    }

    /// Ouvre un device avec adresse BLE et heure de scan
    pub fn device(self, ble_addr: &str, scan_time: i64) -> DeviceBuilder {
        let mut fields = Map::new();
        fields.insert("ble_addr".into(), json!(ble_addr));
        fields.insert("scan_time".into(), json!(scan_time));
        fields.insert("addr_type".into(), json!(0));
        fields.insert("scan_rssi".into(), json!(-90));
        DeviceBuilder { parent: self, fields }
    }

    /// Device sans `ble_addr` (ignoré par la résolution)
    pub fn anonymous_device(self, scan_time: i64) -> DeviceBuilder {
        let mut fields = Map::new();
        fields.insert("scan_time".into(), json!(scan_time));
        DeviceBuilder { parent: self, fields }
    }

    pub fn build(self) -> Value {
        let mut root = Map::new();
        root.insert("seq_no".into(), json!(self.seq_no));
        root.insert("time".into(), json!(self.time));
        if let Some(cmd) = self.cmd {
            root.insert("cmd".into(), json!(cmd));
        }
        if let Some(cbid) = self.cbid {
            root.insert("cbid".into(), json!(cbid));
        }
        root.insert("devices".into(), Value::Array(self.devices));
        Value::Object(root)
    }
}

/// Builder d'un device, rendu au payload parent par `done()`
#[derive(Debug, Clone)]
pub struct DeviceBuilder {
    parent: GatewayPayloadBuilder,
    fields: Map<String, Value>,
}

impl DeviceBuilder {
    /// Métrique textuelle (ex: `co2` = `"0x1A2B"`)
    pub fn metric(mut self, name: &str, value: &str) -> Self {
        self.fields.insert(name.to_string(), json!(value));
        self
    }

    /// Champ arbitraire (nombre, null, objet...)
    pub fn field(mut self, name: &str, value: Value) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn rssi(self, rssi: i64) -> Self {
        self.field("scan_rssi", json!(rssi))
    }

    pub fn done(mut self) -> GatewayPayloadBuilder {
        self.parent.devices.push(Value::Object(self.fields));
        self.parent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_shape() {
        let payload = GatewayPayloadBuilder::new(42)
            .time(1_700_000_000)
            .cbid("GW-01")
            .device("AA:BB:CC:DD:EE:01", 1_700_000_000)
            .metric("co2", "0x0400")
            .rssi(-71)
            .done()
            .anonymous_device(1_700_000_001)
            .field("temp", json!(21.5))
            .done()
            .build();

        assert_eq!(payload["seq_no"], 42);
        assert_eq!(payload["time"], 1_700_000_000);
        assert_eq!(payload["cbid"], "GW-01");
        assert_eq!(payload["devices"].as_array().unwrap().len(), 2);
        assert_eq!(payload["devices"][0]["co2"], "0x0400");
        assert_eq!(payload["devices"][0]["scan_rssi"], -71);
        assert!(payload["devices"][1].get("ble_addr").is_none());
    }

    #[test]
    fn test_empty_devices_list() {
        let payload = GatewayPayloadBuilder::new(1).build();
        assert_eq!(payload["devices"], json!([]));
    }
}
