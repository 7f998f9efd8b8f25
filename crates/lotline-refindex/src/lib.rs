//! Read-only reference index over the authoritative registry snapshot,
//! plus the tiered address matcher that resolves free-text addresses to
//! canonical building keys.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{bail, Context, Result};
use lotline_core::{
    classify_bbl, BblClass, Borough, BuildingKey, CanonicalBuilding, MatchMethod, RawLocation,
};
use serde::Deserialize;
use strsim::normalized_levenshtein;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "lotline-refindex";

const EXACT_CONFIDENCE: f64 = 1.0;
const LOOSE_CONFIDENCE: f64 = 0.85;
const CONDO_LOOKUP_CONFIDENCE: f64 = 0.9;
const FUZZY_CONFIDENCE_FLOOR: f64 = 0.5;
const FUZZY_CONFIDENCE_CEIL: f64 = 0.8;

/// Tunables for the fuzzy tier. Defaults match the values validated
/// against the source feeds; `sources.yaml` can override both.
#[derive(Debug, Clone, Copy)]
pub struct MatcherConfig {
    pub fuzzy_threshold: f64,
    pub ambiguity_margin: f64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 0.82,
            ambiguity_margin: 0.04,
        }
    }
}

/// Outcome of any location resolution: a key (or not), how it was found,
/// and how much to trust it. Never an error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchOutcome {
    pub key: Option<BuildingKey>,
    pub confidence: f64,
    pub method: MatchMethod,
}

impl MatchOutcome {
    pub fn unresolved() -> Self {
        Self {
            key: None,
            confidence: 0.0,
            method: MatchMethod::None,
        }
    }

    fn hit(key: BuildingKey, confidence: f64, method: MatchMethod) -> Self {
        Self {
            key: Some(key),
            confidence,
            method,
        }
    }
}

/// One row of the registry snapshot file (JSONL).
#[derive(Debug, Clone, Deserialize)]
struct SnapshotRow {
    borough: String,
    block: String,
    lot: String,
    address: String,
    #[serde(default)]
    zip: Option<String>,
    #[serde(default)]
    residential_units: Option<u32>,
    #[serde(default)]
    year_built: Option<u16>,
    #[serde(default)]
    building_class: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct BridgeRow {
    bin: String,
    bbl: String,
}

/// Canonical buildings and the lookup structures the matcher needs.
/// Built once per run, read-shared afterwards.
#[derive(Debug, Default)]
pub struct ReferenceIndex {
    buildings: BTreeMap<BuildingKey, CanonicalBuilding>,
    exact: HashMap<(String, Borough), BuildingKey>,
    loose: HashMap<(String, String, Borough), Vec<BuildingKey>>,
    by_zip: HashMap<String, Vec<(String, BuildingKey)>>,
    by_borough: HashMap<Borough, Vec<(String, BuildingKey)>>,
    base_lot_by_block: HashMap<(Borough, u32), BuildingKey>,
    bin_bridge: HashMap<String, BuildingKey>,
}

impl ReferenceIndex {
    /// Load the registry snapshot. An unreadable or empty snapshot is fatal
    /// for the whole run; the matcher cannot function without it.
    pub fn from_snapshot_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("opening registry snapshot {}", path.display()))?;
        let mut buildings = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("reading {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let row: SnapshotRow = serde_json::from_str(&line)
                .with_context(|| format!("parsing {} line {}", path.display(), line_no + 1))?;
            let key = match BuildingKey::from_bbl_parts(&row.borough, &row.block, &row.lot) {
                Ok(key) => key,
                Err(err) => {
                    warn!(line = line_no + 1, %err, "skipping snapshot row with bad key");
                    continue;
                }
            };
            buildings.push(CanonicalBuilding {
                key,
                borough: key.borough(),
                address: row.address,
                zip: row.zip,
                residential_units: row.residential_units.unwrap_or(0),
                year_built: row.year_built,
                building_class: row.building_class,
            });
        }
        let index = Self::from_buildings(buildings)?;
        info!(buildings = index.len(), "reference index built");
        Ok(index)
    }

    pub fn from_buildings(buildings: Vec<CanonicalBuilding>) -> Result<Self> {
        if buildings.is_empty() {
            bail!("reference snapshot contains no buildings; cannot match anything");
        }
        let mut index = Self::default();
        for building in buildings {
            index.insert(building);
        }
        Ok(index)
    }

    fn insert(&mut self, building: CanonicalBuilding) {
        let key = building.key;
        let borough = building.borough;
        let norm = normalize_street_address(&building.address);

        self.exact.insert((norm.canonical.clone(), borough), key);
        if let Some(house) = &norm.house_number {
            self.loose
                .entry((house.clone(), norm.stem.clone(), borough))
                .or_default()
                .push(key);
        }
        if let Some(zip) = &building.zip {
            self.by_zip
                .entry(zip.clone())
                .or_default()
                .push((norm.canonical.clone(), key));
        }
        self.by_borough
            .entry(borough)
            .or_default()
            .push((norm.canonical, key));

        // Condo sub-lots collapse onto the block's residential container:
        // the lot the registry credits with the most residential units.
        let block_slot = self.base_lot_by_block.entry((borough, key.block()));
        match block_slot {
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(key);
            }
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                let current = self.buildings[slot.get()].residential_units;
                let candidate = building.residential_units;
                if candidate > current || (candidate == current && key < *slot.get()) {
                    slot.insert(key);
                }
            }
        }

        self.buildings.insert(key, building);
    }

    /// Load the BIN cross-reference table. A missing file leaves the bridge
    /// empty; identifiers without an entry fall through to address matching.
    pub fn load_bin_bridge(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "no bin bridge table; building ids will fall back to addresses");
            return Ok(0);
        }
        let file = File::open(path).with_context(|| format!("opening bin bridge {}", path.display()))?;
        let mut loaded = 0usize;
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("reading {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let row: BridgeRow = serde_json::from_str(&line)
                .with_context(|| format!("parsing {} line {}", path.display(), line_no + 1))?;
            match BuildingKey::parse(&row.bbl) {
                Ok(key) => {
                    self.bin_bridge.insert(row.bin, key);
                    loaded += 1;
                }
                Err(err) => warn!(line = line_no + 1, %err, "skipping bridge row with bad key"),
            }
        }
        info!(entries = loaded, "bin bridge loaded");
        Ok(loaded)
    }

    pub fn len(&self) -> usize {
        self.buildings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buildings.is_empty()
    }

    pub fn get(&self, key: BuildingKey) -> Option<&CanonicalBuilding> {
        self.buildings.get(&key)
    }

    pub fn buildings(&self) -> impl Iterator<Item = &CanonicalBuilding> {
        self.buildings.values()
    }

    pub fn base_lot_for_block(&self, borough: Borough, block: u32) -> Option<BuildingKey> {
        self.base_lot_by_block.get(&(borough, block)).copied()
    }

    pub fn bridge_lookup(&self, bin: &str) -> Option<BuildingKey> {
        self.bin_bridge.get(bin.trim()).copied()
    }

    /// Resolve any raw location shape to a building key.
    pub fn resolve_location(&self, config: &MatcherConfig, location: &RawLocation) -> MatchOutcome {
        match location {
            RawLocation::Bbl { borough, block, lot } => {
                match classify_bbl(*borough, *block, *lot) {
                    Ok(BblClass::Building(key)) => {
                        MatchOutcome::hit(key, EXACT_CONFIDENCE, MatchMethod::Bbl)
                    }
                    Ok(BblClass::CondoUnit { borough, block, .. }) => {
                        match self.base_lot_for_block(borough, block) {
                            Some(key) => MatchOutcome::hit(
                                key,
                                CONDO_LOOKUP_CONFIDENCE,
                                MatchMethod::CondoBlockLookup,
                            ),
                            None => MatchOutcome::unresolved(),
                        }
                    }
                    Err(_) => MatchOutcome::unresolved(),
                }
            }
            RawLocation::Bin(bin) => match self.bridge_lookup(bin) {
                Some(key) => MatchOutcome::hit(key, EXACT_CONFIDENCE, MatchMethod::BinBridge),
                None => MatchOutcome::unresolved(),
            },
            RawLocation::Address { text, borough, zip } => {
                self.match_address(config, text, *borough, zip.as_deref())
            }
        }
    }

    /// Tiered free-text matching: exact, then loose, then fuzzy, then give
    /// up. Pure over the index snapshot; never errors.
    pub fn match_address(
        &self,
        config: &MatcherConfig,
        text: &str,
        borough_hint: Option<Borough>,
        zip_hint: Option<&str>,
    ) -> MatchOutcome {
        let norm = normalize_street_address(text);
        if norm.canonical.is_empty() {
            return MatchOutcome::unresolved();
        }

        if let Some(key) = self.exact_lookup(&norm.canonical, borough_hint) {
            return MatchOutcome::hit(key, EXACT_CONFIDENCE, MatchMethod::Exact);
        }

        if let Some(house) = &norm.house_number {
            if let Some(key) = self.loose_lookup(house, &norm.stem, borough_hint) {
                return MatchOutcome::hit(key, LOOSE_CONFIDENCE, MatchMethod::Loose);
            }
        }

        self.fuzzy_lookup(config, &norm.canonical, borough_hint, zip_hint)
    }

    fn exact_lookup(&self, canonical: &str, borough_hint: Option<Borough>) -> Option<BuildingKey> {
        if let Some(borough) = borough_hint {
            return self.exact.get(&(canonical.to_string(), borough)).copied();
        }
        // No hint: the address must be unambiguous across all boroughs.
        let mut found = None;
        for borough in ALL_BOROUGHS {
            if let Some(key) = self.exact.get(&(canonical.to_string(), borough)) {
                if found.is_some_and(|existing| existing != *key) {
                    return None;
                }
                found = Some(*key);
            }
        }
        found
    }

    fn loose_lookup(
        &self,
        house: &str,
        stem: &str,
        borough_hint: Option<Borough>,
    ) -> Option<BuildingKey> {
        let mut found: Option<BuildingKey> = None;
        let boroughs: Vec<Borough> = match borough_hint {
            Some(borough) => vec![borough],
            None => ALL_BOROUGHS.to_vec(),
        };
        for borough in boroughs {
            if let Some(keys) = self
                .loose
                .get(&(house.to_string(), stem.to_string(), borough))
            {
                for key in keys {
                    // Distinct buildings answering to one number+stem: miss.
                    if found.is_some_and(|existing| existing != *key) {
                        return None;
                    }
                    found = Some(*key);
                }
            }
        }
        found
    }

    fn fuzzy_lookup(
        &self,
        config: &MatcherConfig,
        canonical: &str,
        borough_hint: Option<Borough>,
        zip_hint: Option<&str>,
    ) -> MatchOutcome {
        let pool: &[(String, BuildingKey)] = match zip_hint.and_then(|z| self.by_zip.get(z)) {
            Some(pool) => pool,
            None => match borough_hint.and_then(|b| self.by_borough.get(&b)) {
                Some(pool) => pool,
                None => return MatchOutcome::unresolved(),
            },
        };

        let mut best: Option<(f64, BuildingKey)> = None;
        let mut runner_up: Option<(f64, BuildingKey)> = None;
        for (candidate, key) in pool {
            let score = normalized_levenshtein(canonical, candidate);
            match best {
                Some((best_score, best_key)) if *key != best_key => {
                    if score > best_score {
                        runner_up = best;
                        best = Some((score, *key));
                    } else if runner_up.map_or(true, |(r, _)| score > r) {
                        runner_up = Some((score, *key));
                    }
                }
                Some((best_score, _)) => {
                    if score > best_score {
                        best = Some((score, *key));
                    }
                }
                None => best = Some((score, *key)),
            }
        }

        let Some((score, key)) = best else {
            return MatchOutcome::unresolved();
        };
        if score < config.fuzzy_threshold {
            return MatchOutcome::unresolved();
        }
        if let Some((runner_score, _)) = runner_up {
            // Ambiguous ties are unresolved, never an arbitrary pick.
            if score - runner_score < config.ambiguity_margin {
                return MatchOutcome {
                    key: None,
                    confidence: 0.0,
                    method: MatchMethod::Ambiguous,
                };
            }
        }
        let span = (1.0 - config.fuzzy_threshold).max(f64::EPSILON);
        let scaled = FUZZY_CONFIDENCE_FLOOR
            + (FUZZY_CONFIDENCE_CEIL - FUZZY_CONFIDENCE_FLOOR) * (score - config.fuzzy_threshold)
                / span;
        MatchOutcome::hit(
            key,
            scaled.clamp(FUZZY_CONFIDENCE_FLOOR, FUZZY_CONFIDENCE_CEIL),
            MatchMethod::Fuzzy,
        )
    }
}

const ALL_BOROUGHS: [Borough; 5] = [
    Borough::Manhattan,
    Borough::Bronx,
    Borough::Brooklyn,
    Borough::Queens,
    Borough::StatenIsland,
];

/// A street address normalized for index lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedAddress {
    /// Full normalized street line, unit stripped ("200 E 23RD ST").
    pub canonical: String,
    /// Leading house number token, hyphenated Queens numbers kept intact.
    pub house_number: Option<String>,
    /// Street name with directionals and street type dropped and ordinals
    /// folded to digits ("FIFTH" and "5TH" both become "5").
    pub stem: String,
    /// Trailing unit tokens split off the street line, if any.
    pub unit: Option<String>,
}

const STREET_TYPES: &[(&str, &str)] = &[
    ("AVENUE", "AVE"),
    ("AVE", "AVE"),
    ("STREET", "ST"),
    ("ST", "ST"),
    ("BOULEVARD", "BLVD"),
    ("BLVD", "BLVD"),
    ("DRIVE", "DR"),
    ("DR", "DR"),
    ("PLACE", "PL"),
    ("PL", "PL"),
    ("ROAD", "RD"),
    ("RD", "RD"),
    ("COURT", "CT"),
    ("CT", "CT"),
    ("LANE", "LN"),
    ("LN", "LN"),
    ("TERRACE", "TERR"),
    ("TERR", "TERR"),
    ("PARKWAY", "PKWY"),
    ("PKWY", "PKWY"),
    ("SQUARE", "SQ"),
    ("SQ", "SQ"),
    ("CRESCENT", "CRES"),
    ("CRES", "CRES"),
    ("WAY", "WAY"),
    ("CIRCLE", "CIR"),
    ("CIR", "CIR"),
    ("HIGHWAY", "HWY"),
    ("HWY", "HWY"),
    ("ROW", "ROW"),
    ("WALK", "WALK"),
    ("BROADWAY", "BROADWAY"),
    ("BOWERY", "BOWERY"),
];

const DIRECTIONALS: &[(&str, &str)] = &[
    ("EAST", "E"),
    ("E", "E"),
    ("WEST", "W"),
    ("W", "W"),
    ("NORTH", "N"),
    ("N", "N"),
    ("SOUTH", "S"),
    ("S", "S"),
];

const SPELLED_ORDINALS: &[(&str, &str)] = &[
    ("FIRST", "1"),
    ("SECOND", "2"),
    ("THIRD", "3"),
    ("FOURTH", "4"),
    ("FIFTH", "5"),
    ("SIXTH", "6"),
    ("SEVENTH", "7"),
    ("EIGHTH", "8"),
    ("NINTH", "9"),
    ("TENTH", "10"),
    ("ELEVENTH", "11"),
    ("TWELFTH", "12"),
];

fn canonical_street_type(token: &str) -> Option<&'static str> {
    STREET_TYPES
        .iter()
        .find(|(from, _)| *from == token)
        .map(|(_, to)| *to)
}

fn canonical_directional(token: &str) -> Option<&'static str> {
    DIRECTIONALS
        .iter()
        .find(|(from, _)| *from == token)
        .map(|(_, to)| *to)
}

fn is_numeric_ordinal(token: &str) -> bool {
    let digits: usize = token.bytes().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 || digits + 2 != token.len() {
        return false;
    }
    matches!(&token[digits..], "ST" | "ND" | "RD" | "TH")
}

/// Fold "23RD", "1ST", and spelled forms like "FIFTH" down to bare digits.
fn fold_ordinal(token: &str) -> Option<String> {
    if is_numeric_ordinal(token) {
        let digits: String = token.chars().take_while(|c| c.is_ascii_digit()).collect();
        return Some(digits);
    }
    SPELLED_ORDINALS
        .iter()
        .find(|(from, _)| *from == token)
        .map(|(_, to)| to.to_string())
}

/// Normalize one street line. Uppercases, standardizes directionals and
/// street types to the registry's abbreviations, and splits trailing unit
/// tokens off after the last street-type/ordinal token. Ordinal folding is
/// deliberately left to the loose stem so "5TH AVE" and "FIFTH AVENUE"
/// stay distinct in the exact tier.
pub fn normalize_street_address(raw: &str) -> NormalizedAddress {
    let street_line = raw.split(',').next().unwrap_or("");
    let cleaned: String = street_line
        .to_ascii_uppercase()
        .chars()
        .map(|c| match c {
            '_' => ' ',
            '.' => ' ',
            '#' => ' ',
            c => c,
        })
        .collect();
    let tokens: Vec<&str> = cleaned.split_whitespace().collect();

    let mut last_suffix_idx = None;
    for (i, token) in tokens.iter().enumerate() {
        if canonical_street_type(token).is_some() || is_numeric_ordinal(token) {
            last_suffix_idx = Some(i);
        }
    }

    let (street_tokens, unit_tokens) = match last_suffix_idx {
        Some(idx) if idx + 1 < tokens.len() => tokens.split_at(idx + 1),
        _ => (tokens.as_slice(), &[] as &[&str]),
    };

    let mut canonical_tokens = Vec::with_capacity(street_tokens.len());
    for (i, token) in street_tokens.iter().enumerate() {
        if i > 0 {
            if let Some(dir) = canonical_directional(token) {
                canonical_tokens.push(dir.to_string());
                continue;
            }
        }
        if let Some(kind) = canonical_street_type(token) {
            canonical_tokens.push(kind.to_string());
            continue;
        }
        canonical_tokens.push((*token).to_string());
    }

    let house_number = street_tokens
        .first()
        .filter(|t| t.starts_with(|c: char| c.is_ascii_digit()))
        .map(|t| t.to_string());

    let mut stem_tokens = Vec::new();
    let skip_house = house_number.is_some() as usize;
    for token in &canonical_tokens[skip_house.min(canonical_tokens.len())..] {
        if canonical_directional(token).is_some() || canonical_street_type(token).is_some() {
            continue;
        }
        stem_tokens.push(fold_ordinal(token).unwrap_or_else(|| token.clone()));
    }

    let unit = if unit_tokens.is_empty() {
        None
    } else {
        Some(unit_tokens.join(" "))
    };

    NormalizedAddress {
        canonical: canonical_tokens.join(" "),
        house_number,
        stem: stem_tokens.join(" "),
        unit,
    }
}
