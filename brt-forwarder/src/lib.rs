//! BRT Forwarder - relais de payloads capteurs avec réparation des valeurs invalides
//!
//! - `cache` : dernières valeurs valides par (ble_addr, métrique), persistées en JSON
//! - `resolver` : remplace les jetons sentinelles par les valeurs du cache
//! - `dispatcher` : relais séquentiel vers les cibles HTTP avec timeout et retry
//! - `service` : assemble le tout pour la couche HTTP (`http`)

pub mod cache;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod env_overlay;
pub mod error;
pub mod health;
pub mod http;
pub mod models;
pub mod resolver;
pub mod service;

pub use cache::{CacheStore, WritePolicy};
pub use config::{ForwardTarget, ForwarderConfig};
pub use dispatcher::ForwardDispatcher;
pub use models::{DeviceRecord, ForwardResult, GatewayPayload, MetricEntry};
pub use resolver::{MetricResolver, ResolverSettings};
pub use service::ForwarderService;
