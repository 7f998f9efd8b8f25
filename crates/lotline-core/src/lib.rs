//! Core domain model and identifier normalization for Lotline.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "lotline-core";

/// Tax lots with a lot number at or above this value are per-unit condo
/// sub-lots, not whole buildings.
pub const CONDO_LOT_FLOOR: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Borough {
    Manhattan,
    Bronx,
    Brooklyn,
    Queens,
    StatenIsland,
}

impl Borough {
    pub fn code(self) -> u8 {
        match self {
            Borough::Manhattan => 1,
            Borough::Bronx => 2,
            Borough::Brooklyn => 3,
            Borough::Queens => 4,
            Borough::StatenIsland => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Borough::Manhattan),
            2 => Some(Borough::Bronx),
            3 => Some(Borough::Brooklyn),
            4 => Some(Borough::Queens),
            5 => Some(Borough::StatenIsland),
            _ => None,
        }
    }

    pub fn short(self) -> &'static str {
        match self {
            Borough::Manhattan => "MN",
            Borough::Bronx => "BX",
            Borough::Brooklyn => "BK",
            Borough::Queens => "QN",
            Borough::StatenIsland => "SI",
        }
    }

    /// Parse the spellings the source feeds actually use: full names,
    /// county names, two-letter codes, and bare digit codes.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.len() == 1 {
            if let Ok(digit) = trimmed.parse::<u8>() {
                return Self::from_code(digit);
            }
        }
        match trimmed.to_ascii_uppercase().as_str() {
            "MANHATTAN" | "NEW YORK" | "NEW YORK CITY" | "MN" => Some(Borough::Manhattan),
            "BRONX" | "THE BRONX" | "BX" => Some(Borough::Bronx),
            "BROOKLYN" | "KINGS" | "BK" => Some(Borough::Brooklyn),
            "QUEENS" | "QN" => Some(Borough::Queens),
            "STATEN ISLAND" | "RICHMOND" | "SI" => Some(Borough::StatenIsland),
            _ => None,
        }
    }
}

impl std::fmt::Display for Borough {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.short())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("block {0} outside 1..=99999")]
    BlockOutOfRange(u32),
    #[error("lot {0} outside 0..=9999")]
    LotOutOfRange(u32),
    #[error("malformed building key component: {0}")]
    Malformed(String),
}

/// Canonical building identity: a fixed-width borough+block+lot key.
///
/// One digit of borough code, five of block, four of lot, so equivalent
/// zero-padding variants of the same lot always collapse to one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildingKey(u64);

impl BuildingKey {
    pub fn from_bbl(borough: Borough, block: u32, lot: u32) -> Result<Self, KeyError> {
        if block == 0 || block > 99_999 {
            return Err(KeyError::BlockOutOfRange(block));
        }
        if lot > 9_999 {
            return Err(KeyError::LotOutOfRange(lot));
        }
        Ok(Self(
            u64::from(borough.code()) * 1_000_000_000 + u64::from(block) * 10_000 + u64::from(lot),
        ))
    }

    /// Parse string components as the feeds carry them ("1", "00231", "0001").
    pub fn from_bbl_parts(borough: &str, block: &str, lot: &str) -> Result<Self, KeyError> {
        let (borough, block, lot) = parse_bbl_parts(borough, block, lot)?;
        Self::from_bbl(borough, block, lot)
    }

    /// Parse the ten-digit rendered form.
    pub fn parse(raw: &str) -> Result<Self, KeyError> {
        let trimmed = raw.trim();
        if trimmed.len() != 10 || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(KeyError::Malformed(trimmed.to_string()));
        }
        let borough = Borough::parse(&trimmed[..1])
            .ok_or_else(|| KeyError::Malformed(trimmed.to_string()))?;
        let block: u32 = trimmed[1..6]
            .parse()
            .map_err(|_| KeyError::Malformed(trimmed.to_string()))?;
        let lot: u32 = trimmed[6..]
            .parse()
            .map_err(|_| KeyError::Malformed(trimmed.to_string()))?;
        Self::from_bbl(borough, block, lot)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn borough(self) -> Borough {
        Borough::from_code((self.0 / 1_000_000_000) as u8).expect("key stores a valid borough")
    }

    pub fn block(self) -> u32 {
        ((self.0 / 10_000) % 100_000) as u32
    }

    pub fn lot(self) -> u32 {
        (self.0 % 10_000) as u32
    }
}

impl std::fmt::Display for BuildingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:010}", self.0)
    }
}

fn parse_bbl_parts(borough: &str, block: &str, lot: &str) -> Result<(Borough, u32, u32), KeyError> {
    let borough =
        Borough::parse(borough).ok_or_else(|| KeyError::Malformed(borough.to_string()))?;
    let block: u32 = block
        .trim()
        .parse()
        .map_err(|_| KeyError::Malformed(block.to_string()))?;
    let lot: u32 = lot
        .trim()
        .parse()
        .map_err(|_| KeyError::Malformed(lot.to_string()))?;
    Ok((borough, block, lot))
}

/// Classification of a borough+block+lot triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BblClass {
    /// A whole-building lot; resolves directly.
    Building(BuildingKey),
    /// A per-unit condo sub-lot; must be collapsed onto the block's base
    /// building lot via the reference index.
    CondoUnit {
        borough: Borough,
        block: u32,
        lot: u32,
    },
}

pub fn classify_bbl(borough: Borough, block: u32, lot: u32) -> Result<BblClass, KeyError> {
    if lot >= CONDO_LOT_FLOOR {
        if block == 0 || block > 99_999 {
            return Err(KeyError::BlockOutOfRange(block));
        }
        if lot > 9_999 {
            return Err(KeyError::LotOutOfRange(lot));
        }
        return Ok(BblClass::CondoUnit { borough, block, lot });
    }
    Ok(BblClass::Building(BuildingKey::from_bbl(borough, block, lot)?))
}

pub fn classify_bbl_parts(borough: &str, block: &str, lot: &str) -> Result<BblClass, KeyError> {
    let (borough, block, lot) = parse_bbl_parts(borough, block, lot)?;
    classify_bbl(borough, block, lot)
}

/// A source record's native location representation, before resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawLocation {
    Bbl {
        borough: Borough,
        block: u32,
        lot: u32,
    },
    Bin(String),
    Address {
        text: String,
        borough: Option<Borough>,
        zip: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    Bbl,
    BinBridge,
    CondoBlockLookup,
    Exact,
    Loose,
    Fuzzy,
    /// Fuzzy tie inside the ambiguity margin: unresolved, never guessed.
    Ambiguous,
    None,
}

impl MatchMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchMethod::Bbl => "bbl",
            MatchMethod::BinBridge => "bin_bridge",
            MatchMethod::CondoBlockLookup => "condo_block_lookup",
            MatchMethod::Exact => "exact",
            MatchMethod::Loose => "loose",
            MatchMethod::Fuzzy => "fuzzy",
            MatchMethod::Ambiguous => "ambiguous",
            MatchMethod::None => "none",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingType {
    Sale,
    Rental,
}

impl std::fmt::Display for ListingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ListingType::Sale => "sale",
            ListingType::Rental => "rental",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Active,
    Pending,
    Closed,
    Expired,
    Withdrawn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Listed,
    PriceChanged,
    Closed,
    Delisted,
    Relisted,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Listed => "listed",
            EventType::PriceChanged => "price_changed",
            EventType::Closed => "closed",
            EventType::Delisted => "delisted",
            EventType::Relisted => "relisted",
        }
    }
}

/// Buyer/seller (or landlord/tenant) names on a transaction record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counterparties {
    pub sellers: Vec<String>,
    pub buyers: Vec<String>,
}

/// One observed listing/transaction occurrence in the common shape all
/// extractors emit. Consumed by the unifier, never persisted standalone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntermediateRecord {
    pub source: String,
    pub source_record_id: String,
    pub resolved_key: Option<BuildingKey>,
    pub match_confidence: f64,
    pub match_method: MatchMethod,
    pub raw_address: Option<String>,
    pub unit_label: Option<String>,
    pub listing_type: ListingType,
    pub status: ListingStatus,
    pub event_type: EventType,
    pub event_date: NaiveDate,
    pub price: Option<i64>,
    pub counterparties: Option<Counterparties>,
}

/// A row rejected at extraction, kept for the per-source audit report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub source: String,
    pub source_record_id: String,
    pub reason: String,
}

/// One physical tax lot from the authoritative registry snapshot.
/// Read-only after index build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalBuilding {
    pub key: BuildingKey,
    pub address: String,
    pub borough: Borough,
    pub zip: Option<String>,
    pub residential_units: u32,
    pub year_built: Option<u16>,
    pub building_class: Option<String>,
}

/// Normalize a unit label so unit matching is consistent across sources:
/// uppercase, no separators, no `APT`/`UNIT` prefix, no leading zeros.
///
/// "Apt 03-A" and "#3A" both come out as "3A".
pub fn normalize_unit(raw: &str) -> Option<String> {
    let mut upper = raw.trim().to_ascii_uppercase();
    for prefix in ["APARTMENT", "APT", "UNIT", "STE", "#"] {
        if let Some(rest) = upper.strip_prefix(prefix) {
            upper = rest.to_string();
            break;
        }
    }
    let compact: String = upper.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    let stripped = compact.trim_start_matches('0');
    if stripped.is_empty() {
        // "0" and "00" are real labels in some feeds; empty input is not.
        return (!compact.is_empty()).then(|| "0".to_string());
    }
    Some(stripped.to_string())
}

/// Parse the date formats the feeds emit: ISO, `YYYYMMDD`, `MM/DD/YYYY`.
pub fn parse_event_date(raw: &str) -> Option<NaiveDate> {
    let val = raw.trim();
    if val.len() >= 10 && val.as_bytes().get(4) == Some(&b'-') {
        return NaiveDate::parse_from_str(&val[..10], "%Y-%m-%d").ok();
    }
    if val.len() == 8 && val.bytes().all(|b| b.is_ascii_digit()) {
        return NaiveDate::parse_from_str(val, "%Y%m%d").ok();
    }
    if val.contains('/') {
        return NaiveDate::parse_from_str(val, "%m/%d/%Y").ok();
    }
    None
}

/// Parse a price into whole currency units. Accepts "$3,200", "3200.00",
/// plain integers. Sentinels and garbage come back as `None`.
pub fn parse_price_text(raw: &str) -> Option<i64> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| *c != '$' && *c != ',' && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    if let Ok(value) = cleaned.parse::<i64>() {
        return (value >= 0).then_some(value);
    }
    let value = cleaned.parse::<f64>().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some(value.round() as i64)
}
