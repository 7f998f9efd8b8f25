//! Per-source record extractors. Each extractor maps one feed's native row
//! shape onto the common intermediate record, routing location info through
//! the reference index and folding the source's status/type vocabulary onto
//! the shared enumerations.

use lotline_core::{
    normalize_unit, parse_event_date, parse_price_text, Borough, Counterparties, EventType,
    IntermediateRecord, ListingStatus, ListingType, RawLocation,
};
use lotline_refindex::{normalize_street_address, MatcherConfig, ReferenceIndex};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "lotline-extract";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("unparseable {field}: {value}")]
    BadValue { field: &'static str, value: String },
    #[error("{0}")]
    Message(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Government recording system: structured tax-lot keys, transaction facts.
    Registry,
    /// Brokerage MLS feed: free-text addresses, listing facts.
    Mls,
    /// Web-archive listing snapshots: building-slug URLs, event labels.
    Archive,
}

/// A thing that can turn one native row into intermediate records.
///
/// A row may legitimately produce no records (filtered document types,
/// noise events) or several (a listing row carrying both a list and a
/// close observation). Errors mean the row is malformed and must be
/// counted as a rejection, never that the batch should stop.
pub trait RecordExtractor: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn kind(&self) -> SourceKind;
    fn extract(
        &self,
        row: &JsonValue,
        index: &ReferenceIndex,
        config: &MatcherConfig,
    ) -> Result<Vec<IntermediateRecord>, ExtractError>;
}

pub fn extractor_for_source(source_id: &str) -> Option<Box<dyn RecordExtractor>> {
    match source_id {
        "registry" => Some(Box::new(RegistryExtractor)),
        "mls" => Some(Box::new(MlsExtractor)),
        "archive" => Some(Box::new(ArchiveExtractor)),
        _ => None,
    }
}

fn decode_row<'de, T: Deserialize<'de>>(row: &'de JsonValue) -> Result<T, ExtractError> {
    T::deserialize(row).map_err(|e| ExtractError::Message(e.to_string()))
}

/// Price fields arrive as JSON numbers or formatted strings depending on
/// the feed; a present-but-garbage value is a malformed row.
fn decode_price(
    value: Option<&JsonValue>,
    field: &'static str,
) -> Result<Option<i64>, ExtractError> {
    match value {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::Number(n)) => {
            let parsed = n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f.round() as i64))
                .filter(|v| *v >= 0);
            parsed.ok_or_else(|| ExtractError::BadValue {
                field,
                value: n.to_string(),
            })
            .map(Some)
        }
        Some(JsonValue::String(s)) => match parse_price_text(s) {
            Some(v) => Ok(Some(v)),
            None => Err(ExtractError::BadValue {
                field,
                value: s.clone(),
            }),
        },
        Some(other) => Err(ExtractError::BadValue {
            field,
            value: other.to_string(),
        }),
    }
}

fn decode_date(raw: &str, field: &'static str) -> Result<chrono::NaiveDate, ExtractError> {
    parse_event_date(raw).ok_or_else(|| ExtractError::BadValue {
        field,
        value: raw.to_string(),
    })
}

// ── Registry (government recording) source ──────────────────────────────

/// Document types that represent a completed transaction. Mortgage and
/// lien paperwork references the same lots but is not a listing event.
const REGISTRY_SALE_DOCS: &[&str] = &["DEED", "DEEDO", "RPTT"];
const REGISTRY_RENTAL_DOCS: &[&str] = &["LEASE", "LEAS", "MLEASE"];
const REGISTRY_SKIP_DOCS: &[&str] = &["MTGE", "SAT", "AGMT", "LPNS", "ASST", "UCC1"];

#[derive(Debug, Clone, Deserialize)]
struct RegistryRow {
    document_id: String,
    borough: String,
    block: String,
    lot: String,
    #[serde(default)]
    unit: Option<String>,
    doc_type: String,
    #[serde(default)]
    document_amount: Option<JsonValue>,
    #[serde(default)]
    document_date: Option<String>,
    #[serde(default)]
    recorded_date: Option<String>,
    #[serde(default)]
    sellers: Vec<String>,
    #[serde(default)]
    buyers: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct RegistryExtractor;

impl RecordExtractor for RegistryExtractor {
    fn source_id(&self) -> &'static str {
        "registry"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Registry
    }

    fn extract(
        &self,
        row: &JsonValue,
        index: &ReferenceIndex,
        config: &MatcherConfig,
    ) -> Result<Vec<IntermediateRecord>, ExtractError> {
        let row: RegistryRow = decode_row(row)?;
        let doc_type = row.doc_type.trim().to_ascii_uppercase();
        let listing_type = if REGISTRY_SALE_DOCS.contains(&doc_type.as_str()) {
            ListingType::Sale
        } else if REGISTRY_RENTAL_DOCS.contains(&doc_type.as_str()) {
            ListingType::Rental
        } else if REGISTRY_SKIP_DOCS.contains(&doc_type.as_str()) {
            return Ok(Vec::new());
        } else {
            return Err(ExtractError::BadValue {
                field: "doc_type",
                value: row.doc_type,
            });
        };

        // Recording lag: the document date is the transaction fact, the
        // recorded date only a fallback.
        let date_raw = row
            .document_date
            .as_deref()
            .or(row.recorded_date.as_deref())
            .ok_or(ExtractError::MissingField("document_date"))?;
        let event_date = decode_date(date_raw, "document_date")?;
        let price = decode_price(row.document_amount.as_ref(), "document_amount")?;

        let borough = Borough::parse(&row.borough).ok_or_else(|| ExtractError::BadValue {
            field: "borough",
            value: row.borough.clone(),
        })?;
        let block: u32 = row.block.trim().parse().map_err(|_| ExtractError::BadValue {
            field: "block",
            value: row.block.clone(),
        })?;
        let lot: u32 = row.lot.trim().parse().map_err(|_| ExtractError::BadValue {
            field: "lot",
            value: row.lot.clone(),
        })?;
        let outcome = index.resolve_location(config, &RawLocation::Bbl { borough, block, lot });

        let counterparties = (!row.sellers.is_empty() || !row.buyers.is_empty()).then(|| {
            Counterparties {
                sellers: row.sellers.clone(),
                buyers: row.buyers.clone(),
            }
        });

        Ok(vec![IntermediateRecord {
            source: self.source_id().to_string(),
            source_record_id: row.document_id,
            resolved_key: outcome.key,
            match_confidence: outcome.confidence,
            match_method: outcome.method,
            raw_address: None,
            unit_label: row.unit.as_deref().and_then(normalize_unit),
            listing_type,
            status: ListingStatus::Closed,
            event_type: EventType::Closed,
            event_date,
            price,
            counterparties,
        }])
    }
}

// ── Brokerage MLS source ────────────────────────────────────────────────

/// Native status vocabulary → common enum. `TemporaryOffMarket` folds to
/// Withdrawn and `Back on Market` to Active; the off-market nuance is lost
/// (documented in DESIGN.md).
const MLS_STATUS: &[(&str, ListingStatus)] = &[
    ("Active", ListingStatus::Active),
    ("Back on Market", ListingStatus::Active),
    ("PreListing", ListingStatus::Active),
    ("ActiveUnderContract", ListingStatus::Pending),
    ("Pending", ListingStatus::Pending),
    ("Contract Signed", ListingStatus::Pending),
    ("Closed", ListingStatus::Closed),
    ("Sold", ListingStatus::Closed),
    ("Rented", ListingStatus::Closed),
    ("Expired", ListingStatus::Expired),
    ("TemporaryOffMarket", ListingStatus::Withdrawn),
    ("Withdrawn", ListingStatus::Withdrawn),
];

const MLS_LISTING_TYPES: &[(&str, ListingType)] = &[
    ("Residential", ListingType::Sale),
    ("For Sale", ListingType::Sale),
    ("Sale", ListingType::Sale),
    ("Rental", ListingType::Rental),
    ("For Rent", ListingType::Rental),
    ("Rent", ListingType::Rental),
];

#[derive(Debug, Clone, Deserialize)]
struct MlsRow {
    listing_id: String,
    address: String,
    /// Building-ID-style identifier some feed exports carry; resolved via
    /// the cross-reference bridge when present.
    #[serde(default)]
    bin: Option<String>,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    borough: Option<String>,
    #[serde(default)]
    zip: Option<String>,
    listing_status: String,
    listing_type: String,
    #[serde(default)]
    list_price: Option<JsonValue>,
    #[serde(default)]
    close_price: Option<JsonValue>,
    #[serde(default)]
    list_date: Option<String>,
    #[serde(default)]
    close_date: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct MlsExtractor;

/// Split an MLS address line: "200 E 23RD ST 7C, New York, NY 10010" →
/// street text, unit capture, borough, zip.
fn parse_mls_address(raw: &str) -> (String, Option<String>, Option<Borough>, Option<String>) {
    let mut parts = raw.split(',').map(str::trim);
    let street_unit = parts.next().unwrap_or("").to_string();
    let city = parts.next().unwrap_or("");
    let state_zip = parts.next().unwrap_or("");

    let borough = Borough::parse(city);
    let zip = state_zip
        .split_whitespace()
        .nth(1)
        .filter(|z| z.len() == 5 && z.bytes().all(|b| b.is_ascii_digit()))
        .map(str::to_string);

    let norm = normalize_street_address(&street_unit);
    let street = if norm.unit.is_some() {
        // Re-trim the unit tokens off the raw street line so the matcher
        // sees only the street.
        let keep = street_unit
            .split_whitespace()
            .count()
            .saturating_sub(norm.unit.as_deref().unwrap_or("").split_whitespace().count());
        street_unit
            .split_whitespace()
            .take(keep)
            .collect::<Vec<_>>()
            .join(" ")
    } else {
        street_unit
    };
    (street, norm.unit, borough, zip)
}

impl RecordExtractor for MlsExtractor {
    fn source_id(&self) -> &'static str {
        "mls"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Mls
    }

    fn extract(
        &self,
        row: &JsonValue,
        index: &ReferenceIndex,
        config: &MatcherConfig,
    ) -> Result<Vec<IntermediateRecord>, ExtractError> {
        let row: MlsRow = decode_row(row)?;

        let status = MLS_STATUS
            .iter()
            .find(|(raw, _)| raw.eq_ignore_ascii_case(row.listing_status.trim()))
            .map(|(_, mapped)| *mapped)
            .ok_or_else(|| ExtractError::BadValue {
                field: "listing_status",
                value: row.listing_status.clone(),
            })?;
        let listing_type = MLS_LISTING_TYPES
            .iter()
            .find(|(raw, _)| raw.eq_ignore_ascii_case(row.listing_type.trim()))
            .map(|(_, mapped)| *mapped)
            .ok_or_else(|| ExtractError::BadValue {
                field: "listing_type",
                value: row.listing_type.clone(),
            })?;

        let (street, parsed_unit, parsed_borough, parsed_zip) = parse_mls_address(&row.address);
        if street.is_empty() {
            return Err(ExtractError::MissingField("address"));
        }
        let borough = parsed_borough.or_else(|| row.borough.as_deref().and_then(Borough::parse));
        let zip = parsed_zip.or(row.zip.clone());
        let unit_label = parsed_unit
            .as_deref()
            .or(row.unit.as_deref())
            .and_then(normalize_unit);

        // A bridged building id is deterministic; an id with no bridge
        // entry falls through to address matching.
        let outcome = row
            .bin
            .as_deref()
            .map(|bin| index.resolve_location(config, &RawLocation::Bin(bin.to_string())))
            .filter(|outcome| outcome.key.is_some())
            .unwrap_or_else(|| {
                index.resolve_location(
                    config,
                    &RawLocation::Address {
                        text: street.clone(),
                        borough,
                        zip: zip.clone(),
                    },
                )
            });

        let list_price = decode_price(row.list_price.as_ref(), "list_price")?;
        let close_price = decode_price(row.close_price.as_ref(), "close_price")?;

        let base = IntermediateRecord {
            source: self.source_id().to_string(),
            source_record_id: row.listing_id.clone(),
            resolved_key: outcome.key,
            match_confidence: outcome.confidence,
            match_method: outcome.method,
            raw_address: Some(street),
            unit_label,
            listing_type,
            status,
            event_type: EventType::Listed,
            event_date: chrono::NaiveDate::MIN,
            price: None,
            counterparties: None,
        };

        let mut records = Vec::new();
        if let Some(date_raw) = row.list_date.as_deref() {
            if list_price.is_some() {
                let mut record = base.clone();
                record.event_date = decode_date(date_raw, "list_date")?;
                record.event_type = EventType::Listed;
                record.price = list_price;
                records.push(record);
            }
        }
        if let Some(date_raw) = row.close_date.as_deref() {
            if close_price.or(list_price).is_some() {
                let mut record = base.clone();
                record.event_date = decode_date(date_raw, "close_date")?;
                record.event_type = EventType::Closed;
                record.price = close_price.or(list_price);
                records.push(record);
            }
        }
        if records.is_empty() {
            return Err(ExtractError::MissingField("list_date/close_date"));
        }
        Ok(records)
    }
}

// ── Web-archive source ──────────────────────────────────────────────────

/// Page fragments the archive scraper captures that are not listing events.
const ARCHIVE_NOISE: &[&str] = &[
    "Browse Buildings",
    "Market Data",
    "Facts",
    "Building Class",
    "District",
    "Owned by",
    "Documents and Permits",
    "Previously Listed",
    "Amenities",
    "Floor Plans",
    "Schools",
    "Transportation",
    "Nearby Buildings",
    "Similar",
    "Landmark",
    "Historical",
];

#[derive(Debug, Clone, Deserialize)]
struct ArchiveRow {
    snapshot_id: String,
    url: String,
    #[serde(default)]
    address: Option<String>,
    event_label: String,
    event_date: String,
    #[serde(default)]
    price: Option<JsonValue>,
    #[serde(default)]
    listing_type: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct ArchiveExtractor;

/// Pull the building slug and unit path segment out of an archived
/// listing URL: ".../building/9115-colonial-road-brooklyn/5g" →
/// ("9115-colonial-road-brooklyn", Some("5g")).
fn parse_building_url(url: &str) -> Option<(&str, Option<&str>)> {
    let rest = url.split("/building/").nth(1)?;
    let rest = rest.split(['?', '#']).next().unwrap_or(rest);
    let mut segments = rest.split('/').filter(|s| !s.is_empty());
    let slug = segments.next()?;
    Some((slug, segments.next()))
}

const SLUG_BOROUGH_TAGS: &[(&str, Borough)] = &[
    ("-new_york", Borough::Manhattan),
    ("-manhattan", Borough::Manhattan),
    ("-brooklyn", Borough::Brooklyn),
    ("-queens", Borough::Queens),
    ("-the_bronx", Borough::Bronx),
    ("-bronx", Borough::Bronx),
    ("-staten_island", Borough::StatenIsland),
];

fn slug_borough(slug: &str) -> Option<(Borough, &str)> {
    let lower_len = slug.len();
    for (tag, borough) in SLUG_BOROUGH_TAGS {
        if slug.to_ascii_lowercase().ends_with(tag) {
            return Some((*borough, &slug[..lower_len - tag.len()]));
        }
    }
    None
}

fn slug_to_address(stem: &str) -> String {
    stem.split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_uppercase()
}

/// Normalized meaning of one archive event label.
enum ArchiveEvent {
    Noise,
    Event(EventType),
}

fn normalize_archive_event(label: &str) -> ArchiveEvent {
    let label = label.trim();
    if label.is_empty() || label == "-" {
        return ArchiveEvent::Noise;
    }
    for noise in ARCHIVE_NOISE {
        if label.contains(noise) {
            return ArchiveEvent::Noise;
        }
    }
    if label.starts_with("Listed by") || label == "LISTED" {
        return ArchiveEvent::Event(EventType::Listed);
    }
    if label == "Listing sold"
        || label == "SOLD"
        || label == "RECORDED_SALE"
        || label.contains("Previous Sale recorded")
        || label == "RENTED"
    {
        return ArchiveEvent::Event(EventType::Closed);
    }
    if label.contains("Price decreased")
        || label.contains("Price increased")
        || label == "PRICE_DECREASE"
        || label == "PRICE_INCREASE"
    {
        return ArchiveEvent::Event(EventType::PriceChanged);
    }
    if label.contains("Relisted") || label == "RELISTED" {
        return ArchiveEvent::Event(EventType::Relisted);
    }
    if label.contains("no longer available") || label == "NO_LONGER_AVAILABLE" {
        return ArchiveEvent::Event(EventType::Delisted);
    }
    // Contract-entered and other intermediate states have no counterpart
    // in the common event set; skipped, not guessed.
    ArchiveEvent::Noise
}

fn archive_listing_type(
    declared: Option<&str>,
    label: &str,
    event: EventType,
) -> Result<ListingType, ExtractError> {
    if let Some(declared) = declared {
        return match declared.trim().to_ascii_lowercase().as_str() {
            "sale" | "sales" => Ok(ListingType::Sale),
            "rental" | "rentals" => Ok(ListingType::Rental),
            other => Err(ExtractError::BadValue {
                field: "listing_type",
                value: other.to_string(),
            }),
        };
    }
    if event == EventType::Closed {
        if label == "RENTED" {
            return Ok(ListingType::Rental);
        }
        return Ok(ListingType::Sale);
    }
    Err(ExtractError::MissingField("listing_type"))
}

fn archive_status(event: EventType) -> ListingStatus {
    match event {
        EventType::Listed | EventType::PriceChanged | EventType::Relisted => ListingStatus::Active,
        EventType::Closed => ListingStatus::Closed,
        EventType::Delisted => ListingStatus::Withdrawn,
    }
}

impl RecordExtractor for ArchiveExtractor {
    fn source_id(&self) -> &'static str {
        "archive"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Archive
    }

    fn extract(
        &self,
        row: &JsonValue,
        index: &ReferenceIndex,
        config: &MatcherConfig,
    ) -> Result<Vec<IntermediateRecord>, ExtractError> {
        let row: ArchiveRow = decode_row(row)?;

        let event = match normalize_archive_event(&row.event_label) {
            ArchiveEvent::Noise => return Ok(Vec::new()),
            ArchiveEvent::Event(event) => event,
        };
        let price = decode_price(row.price.as_ref(), "price")?;
        if price.is_none() && event == EventType::PriceChanged {
            // A price observation without a price carries nothing.
            return Ok(Vec::new());
        }

        let (slug, unit) = parse_building_url(&row.url).ok_or(ExtractError::BadValue {
            field: "url",
            value: row.url.clone(),
        })?;
        let (borough, stem) = match slug_borough(slug) {
            Some((borough, stem)) => (Some(borough), stem),
            None => (None, slug),
        };
        let address = row
            .address
            .clone()
            .unwrap_or_else(|| slug_to_address(stem));
        let listing_type = archive_listing_type(row.listing_type.as_deref(), row.event_label.trim(), event)?;
        let event_date = decode_date(&row.event_date, "event_date")?;

        let outcome = index.resolve_location(
            config,
            &RawLocation::Address {
                text: address.clone(),
                borough,
                zip: None,
            },
        );

        Ok(vec![IntermediateRecord {
            source: self.source_id().to_string(),
            source_record_id: row.snapshot_id,
            resolved_key: outcome.key,
            match_confidence: outcome.confidence,
            match_method: outcome.method,
            raw_address: Some(address),
            unit_label: unit.and_then(normalize_unit),
            listing_type,
            status: archive_status(event),
            event_type: event,
            event_date,
            price,
            counterparties: None,
        }])
    }
}
