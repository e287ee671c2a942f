//! Application configuration.
//!
//! Everything is environment-driven with safe defaults (`AppConfig::from_env`).
//! The regional capacity table starts from the seed constants and may be
//! replaced wholesale by a TOML file.

pub mod defaults;

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::{info, warn};

use defaults::{DEFAULT_REGION_CAPACITY_KW, SEED_REGION_CAPACITY_KW};

/// Application configuration shared by all components.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// HTTP server bind address (gateway, operator API, WebSocket hub).
    pub server_addr: String,
    /// Data directory for the sled store.
    pub data_dir: String,
    /// Partitions per bus topic.
    pub partitions: usize,
    /// Per-partition record cap before publishes see backpressure.
    pub partition_high_water: usize,
    /// 1-minute flush interval (seconds).
    pub flush_interval_1m_secs: u64,
    /// 15-minute flush interval (seconds).
    pub flush_interval_15m_secs: u64,
    /// Tariff base price (₹/kWh).
    pub base_price: f64,
    /// Hysteresis threshold (₹) below which tariff updates are suppressed.
    pub min_change_threshold: f64,
    /// HMAC signing key for WebSocket bearer tokens.
    pub signing_key: String,
    /// Bearer key guarding mutating operator endpoints. `None` leaves them open.
    pub operator_key: Option<String>,
    /// Maximum concurrent WebSocket connections.
    pub max_ws_connections: usize,
    /// Regional capacity table (kW).
    pub capacity: CapacityTable,
}

impl AppConfig {
    /// Build configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let capacity_path = std::env::var("GRIDPULSE_CAPACITY_TABLE").ok();
        Self {
            server_addr: std::env::var("GRIDPULSE_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            data_dir: std::env::var("GRIDPULSE_DATA_DIR")
                .unwrap_or_else(|_| "./data".to_string()),
            partitions: env_parse("GRIDPULSE_PARTITIONS", defaults::BUS_PARTITIONS),
            partition_high_water: env_parse(
                "GRIDPULSE_PARTITION_HIGH_WATER",
                defaults::BUS_PARTITION_HIGH_WATER,
            ),
            flush_interval_1m_secs: env_parse(
                "GRIDPULSE_FLUSH_INTERVAL_1M_SECS",
                defaults::WINDOW_1M_SECS as u64,
            ),
            flush_interval_15m_secs: env_parse(
                "GRIDPULSE_FLUSH_INTERVAL_15M_SECS",
                defaults::WINDOW_15M_SECS as u64,
            ),
            base_price: env_parse("GRIDPULSE_BASE_PRICE", defaults::BASE_PRICE_PER_KWH),
            min_change_threshold: env_parse(
                "GRIDPULSE_MIN_CHANGE_THRESHOLD",
                defaults::TARIFF_MIN_CHANGE,
            ),
            signing_key: std::env::var("GRIDPULSE_SIGNING_KEY")
                .unwrap_or_else(|_| "gridpulse-dev-signing-key".to_string()),
            operator_key: std::env::var("GRIDPULSE_OPERATOR_KEY").ok(),
            max_ws_connections: env_parse(
                "GRIDPULSE_MAX_WS_CONNECTIONS",
                defaults::WS_MAX_CONNECTIONS,
            ),
            capacity: CapacityTable::load(capacity_path.as_deref()),
        }
    }
}

/// Parse an environment variable, falling back to `default` when unset or
/// malformed. Malformed values are logged, not fatal.
fn env_parse<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                warn!("Ignoring malformed {}={:?}, using default", name, raw);
                default
            }
        },
        Err(_) => default,
    }
}

// ============================================================================
// Regional Capacity Table
// ============================================================================

/// TOML shape: `[regions]` table of region name → capacity in kW.
#[derive(Debug, Deserialize)]
struct CapacityFile {
    regions: HashMap<String, f64>,
}

/// Region → grid capacity (kW) used for load-percentage computation.
#[derive(Debug, Clone)]
pub struct CapacityTable {
    regions: HashMap<String, f64>,
}

impl Default for CapacityTable {
    fn default() -> Self {
        Self {
            regions: SEED_REGION_CAPACITY_KW
                .iter()
                .map(|(r, kw)| ((*r).to_string(), *kw))
                .collect(),
        }
    }
}

impl CapacityTable {
    /// Load the capacity table, preferring the TOML file when given and
    /// readable. A missing or malformed file falls back to the seed table.
    pub fn load(path: Option<&str>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        match Self::from_file(Path::new(path)) {
            Ok(table) => {
                info!(
                    "✓ Loaded capacity table from {} ({} regions)",
                    path,
                    table.regions.len()
                );
                table
            }
            Err(e) => {
                warn!("Failed to load capacity table from {}: {e}. Using seed table.", path);
                Self::default()
            }
        }
    }

    fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let file: CapacityFile = toml::from_str(&raw)?;
        Ok(Self { regions: file.regions })
    }

    /// Capacity for a region in kW. Unknown regions get the 1 GW default so
    /// their load percentage stays near zero rather than spiking.
    pub fn capacity_kw(&self, region: &str) -> f64 {
        self.regions
            .get(region)
            .copied()
            .unwrap_or(DEFAULT_REGION_CAPACITY_KW)
    }

    /// Known region names (used by tests and the simulator).
    pub fn regions(&self) -> impl Iterator<Item = &str> {
        self.regions.keys().map(String::as_str)
    }
}
