/*!
# BRT DevKit - Stubs et utilitaires pour tester le relais

Bibliothèque facilitant les tests du forwarder avec:
- Cibles HTTP simulées (statuts scriptés, latence, journal des appels)
- Builders de payloads passerelle réalistes
- Harness de test (répertoire temporaire, fichier de cache, cibles)
*/

pub mod target_stub;
pub mod payload_builders;
pub mod test_utils;

pub use target_stub::{CallJournal, MockTarget, MockTargetBuilder, ReceivedRequest};
pub use payload_builders::{DeviceBuilder, GatewayPayloadBuilder};
pub use test_utils::TestHarness;
