//! GeoIP admission filter
//!
//! Looks up the source country and continent in a MaxMind GeoLite2-Country
//! database and blocks members of the configured region list. Region codes
//! are ISO-3166-1 alpha-2 country codes, continent codes, or the pseudo-code
//! "EU" which expands to the European country set below.
//!
//! Lookup failures fail open: an address the database does not know is
//! treated as not blocked.

use std::collections::HashSet;
use std::net::IpAddr;

use anyhow::Context;
use maxminddb::Reader;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::GeoIpConfig;

/// GeoIP lookup result for one address
#[derive(Debug, Clone, Default)]
struct GeoRecord {
    country_code: Option<String>,
    continent_code: Option<String>,
}

/// GeoIP admission filter. The database handle is read-only after startup.
pub struct GeoIpFilter {
    enabled: bool,
    db: RwLock<Option<Reader<Vec<u8>>>>,
    block_regions: HashSet<String>,
}

impl GeoIpFilter {
    pub fn new(config: &GeoIpConfig) -> anyhow::Result<Self> {
        if !config.enabled {
            info!("[geoip] GeoIP checking is disabled");
            return Ok(Self {
                enabled: false,
                db: RwLock::new(None),
                block_regions: HashSet::new(),
            });
        }

        let db_path = config
            .db_path
            .as_ref()
            .context("geoip enabled without db_path")?;
        let reader = Reader::open_readfile(db_path)
            .with_context(|| format!("failed to open GeoIP database {:?}", db_path))?;

        let block_regions: HashSet<String> = config
            .block_regions
            .iter()
            .map(|r| r.trim().to_uppercase())
            .collect();

        info!("[geoip] initialized with database: {:?}", db_path);
        info!("[geoip] blocking regions: {:?}", config.block_regions);

        Ok(Self {
            enabled: true,
            db: RwLock::new(Some(reader)),
            block_regions,
        })
    }

    /// Check whether a source address is region-blocked. Returns the country
    /// ISO code responsible for the block, or `None` to admit.
    pub fn is_blocked(&self, ip: IpAddr) -> Option<String> {
        if !self.enabled {
            return None;
        }

        let guard = self.db.read();
        let reader = guard.as_ref()?;

        let record: GeoRecord = match self.lookup(reader, ip) {
            Some(r) => r,
            None => {
                // Unknown or private address: fail open
                debug!("[geoip] no record for {}, admitting", ip);
                return None;
            }
        };

        let country = record.country_code.unwrap_or_default();
        let continent = record.continent_code.unwrap_or_default();

        if self.block_regions.contains(&country) || self.block_regions.contains(&continent) {
            return Some(country);
        }

        if self.block_regions.contains("EU") && is_european_country(&country) {
            return Some(country);
        }

        None
    }

    fn lookup(&self, reader: &Reader<Vec<u8>>, ip: IpAddr) -> Option<GeoRecord> {
        #[derive(serde::Deserialize)]
        struct Country {
            country: Option<CountryNode>,
            continent: Option<ContinentNode>,
        }

        #[derive(serde::Deserialize)]
        struct CountryNode {
            iso_code: Option<String>,
        }

        #[derive(serde::Deserialize)]
        struct ContinentNode {
            code: Option<String>,
        }

        let country: Country = reader.lookup(ip).ok()?;

        Some(GeoRecord {
            country_code: country.country.and_then(|c| c.iso_code),
            continent_code: country.continent.and_then(|c| c.code),
        })
    }
}

/// EU-27 plus GB, NO, CH, IS, LI
fn is_european_country(code: &str) -> bool {
    const EUROPEAN_COUNTRIES: &[&str] = &[
        "AT", "BE", "BG", "HR", "CY", "CZ", "DK", "EE", "FI", "FR", "DE", "GR", "HU", "IE", "IT",
        "LV", "LT", "LU", "MT", "NL", "PL", "PT", "RO", "SK", "SI", "ES", "SE", "GB", "NO", "CH",
        "IS", "LI",
    ];
    EUROPEAN_COUNTRIES.contains(&code)
}
