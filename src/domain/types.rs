//! Shared types for the scan pipeline

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Barcode symbologies the optical capability can be asked to decode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Symbology {
    /// 2D matrix code
    QrCode,
    /// 1D linear, full ASCII
    Code128,
    /// 1D linear, retail EAN-13
    Ean13,
}

impl Symbology {
    /// Formats requested when nothing else is configured
    pub const DEFAULT_SET: [Symbology; 3] = [Symbology::QrCode, Symbology::Code128, Symbology::Ean13];

    pub fn as_str(&self) -> &'static str {
        match self {
            Symbology::QrCode => "qr_code",
            Symbology::Code128 => "code128",
            Symbology::Ean13 => "ean13",
        }
    }

    /// Map a decoder label such as `QR-Code`, `CODE-128` or `EAN-13`
    pub fn from_label(label: &str) -> Option<Self> {
        let normalized: String = label
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "qrcode" | "qr" => Some(Symbology::QrCode),
            "code128" => Some(Symbology::Code128),
            "ean13" => Some(Symbology::Ean13),
            _ => None,
        }
    }
}

impl fmt::Display for Symbology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a captured code came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOrigin {
    /// Camera scan, with the symbology when the decoder reported one
    Optical(Option<Symbology>),
    /// Typed by the operator
    Manual,
}

impl CaptureOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureOrigin::Optical(_) => "optical",
            CaptureOrigin::Manual => "manual",
        }
    }
}

/// A successfully captured identifier. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanEvent {
    value: String,
    captured_at: OffsetDateTime,
    origin: CaptureOrigin,
}

impl ScanEvent {
    /// Stamp a capture with the current UTC time
    pub fn new(value: impl Into<String>, origin: CaptureOrigin) -> Self {
        Self { value: value.into(), captured_at: OffsetDateTime::now_utc(), origin }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn captured_at(&self) -> OffsetDateTime {
        self.captured_at
    }

    pub fn origin(&self) -> CaptureOrigin {
        self.origin
    }

    /// Capture time as RFC 3339 (ISO 8601) text
    pub fn timestamp(&self) -> String {
        self.captured_at.format(&Rfc3339).unwrap_or_default()
    }
}

/// Content of the shared live-session slot, as seen by the secondary display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSlot {
    pub value: String,
    pub timestamp: String,
}

impl From<&ScanEvent> for SessionSlot {
    fn from(event: &ScanEvent) -> Self {
        Self { value: event.value().to_string(), timestamp: event.timestamp() }
    }
}

/// Product record as stored in the catalog.
///
/// The catalog keeps Spanish display-facing field names; they are mapped here
/// so nothing past the boundary sees the external shape. Price and quantity
/// accept numeric strings and reject anything else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRecord {
    #[serde(rename = "codigo")]
    pub code: String,
    #[serde(rename = "nombre")]
    pub name: String,
    #[serde(rename = "categoria")]
    pub category: String,
    #[serde(rename = "precio", deserialize_with = "deserialize_price")]
    pub price: f64,
    #[serde(rename = "cantidad", deserialize_with = "deserialize_quantity")]
    pub quantity: i64,
}

fn deserialize_price<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct PriceVisitor;

    impl<'de> Visitor<'de> for PriceVisitor {
        type Value = f64;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a finite number or numeric string")
        }

        fn visit_f64<E>(self, value: f64) -> Result<f64, E>
        where
            E: de::Error,
        {
            if value.is_finite() {
                Ok(value)
            } else {
                Err(E::custom("price must be finite"))
            }
        }

        fn visit_i64<E>(self, value: i64) -> Result<f64, E>
        where
            E: de::Error,
        {
            Ok(value as f64)
        }

        fn visit_u64<E>(self, value: u64) -> Result<f64, E>
        where
            E: de::Error,
        {
            Ok(value as f64)
        }

        fn visit_str<E>(self, value: &str) -> Result<f64, E>
        where
            E: de::Error,
        {
            let parsed: f64 = value
                .trim()
                .parse()
                .map_err(|_| E::invalid_value(de::Unexpected::Str(value), &self))?;
            self.visit_f64(parsed)
        }
    }

    deserializer.deserialize_any(PriceVisitor)
}

fn deserialize_quantity<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct QuantityVisitor;

    impl<'de> Visitor<'de> for QuantityVisitor {
        type Value = i64;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a whole number or numeric string")
        }

        fn visit_i64<E>(self, value: i64) -> Result<i64, E>
        where
            E: de::Error,
        {
            Ok(value)
        }

        fn visit_u64<E>(self, value: u64) -> Result<i64, E>
        where
            E: de::Error,
        {
            i64::try_from(value).map_err(|_| E::invalid_value(de::Unexpected::Unsigned(value), &self))
        }

        fn visit_f64<E>(self, value: f64) -> Result<i64, E>
        where
            E: de::Error,
        {
            // Firestore-style stores often hand back 5.0 for 5
            if value.is_finite() && value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
                Ok(value as i64)
            } else {
                Err(E::invalid_value(de::Unexpected::Float(value), &self))
            }
        }

        fn visit_str<E>(self, value: &str) -> Result<i64, E>
        where
            E: de::Error,
        {
            let trimmed = value.trim();
            if let Ok(n) = trimmed.parse::<i64>() {
                return Ok(n);
            }
            match trimmed.parse::<f64>() {
                Ok(f) => self.visit_f64(f),
                Err(_) => Err(E::invalid_value(de::Unexpected::Str(value), &self)),
            }
        }
    }

    deserializer.deserialize_any(QuantityVisitor)
}

/// Result of a successful catalog query
#[derive(Debug, Clone, PartialEq)]
pub enum LookupOutcome {
    Found(CatalogRecord),
    /// Valid query, zero matches. Not an error.
    NotFound,
}

/// Everything the presentation shell may read about the pipeline.
///
/// `publish_error` is written only by the publish path; every other field is
/// written by capture and lookup. The two slices never overlap.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineState {
    pub scanned: Option<String>,
    pub product: Option<CatalogRecord>,
    pub loading: bool,
    pub error: Option<String>,
    pub not_found: bool,
    pub publish_error: Option<String>,
}

impl PipelineState {
    /// True when nothing has been captured since the last reset
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Terminal outcome of one pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Success,
    NotFound,
    Error,
}

impl Settlement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Settlement::Success => "success",
            Settlement::NotFound => "not_found",
            Settlement::Error => "error",
        }
    }
}

/// Orchestrator state machine position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelinePhase {
    #[default]
    Idle,
    Capturing,
    /// Publish and lookup in flight
    Resolving,
    Settled(Settlement),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn widget_json() -> &'static str {
        r#"{"codigo":"123","nombre":"Widget","categoria":"Tools","precio":9.99,"cantidad":5}"#
    }

    #[test]
    fn test_catalog_record_field_mapping() {
        let record: CatalogRecord = serde_json::from_str(widget_json()).unwrap();
        assert_eq!(record.code, "123");
        assert_eq!(record.name, "Widget");
        assert_eq!(record.category, "Tools");
        assert_eq!(record.price, 9.99);
        assert_eq!(record.quantity, 5);
    }

    #[test]
    fn test_catalog_record_coerces_numeric_strings() {
        let json = r#"{"codigo":"7","nombre":"Nut","categoria":"Parts","precio":" 0.25 ","cantidad":"40"}"#;
        let record: CatalogRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.price, 0.25);
        assert_eq!(record.quantity, 40);

        let json = r#"{"codigo":"7","nombre":"Nut","categoria":"Parts","precio":3,"cantidad":12.0}"#;
        let record: CatalogRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.price, 3.0);
        assert_eq!(record.quantity, 12);
    }

    #[test]
    fn test_catalog_record_rejects_malformed_numbers() {
        let bad_price = r#"{"codigo":"7","nombre":"Nut","categoria":"Parts","precio":"cheap","cantidad":1}"#;
        assert!(serde_json::from_str::<CatalogRecord>(bad_price).is_err());

        let fractional = r#"{"codigo":"7","nombre":"Nut","categoria":"Parts","precio":1,"cantidad":1.5}"#;
        assert!(serde_json::from_str::<CatalogRecord>(fractional).is_err());

        let missing = r#"{"codigo":"7","nombre":"Nut","precio":1,"cantidad":1}"#;
        assert!(serde_json::from_str::<CatalogRecord>(missing).is_err());
    }

    #[test]
    fn test_catalog_record_ignores_extra_fields() {
        let json = r#"{"id":"abc","codigo":"1","nombre":"A","categoria":"B","precio":1,"cantidad":1,"proveedor":"X"}"#;
        assert!(serde_json::from_str::<CatalogRecord>(json).is_ok());
    }

    #[test]
    fn test_session_slot_from_event() {
        let event = ScanEvent::new("123", CaptureOrigin::Manual);
        let slot = SessionSlot::from(&event);
        assert_eq!(slot.value, "123");
        // RFC 3339 round-trips through the time crate
        assert!(OffsetDateTime::parse(&slot.timestamp, &Rfc3339).is_ok());

        let json = serde_json::to_value(&slot).unwrap();
        assert_eq!(json["value"], "123");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_symbology_labels() {
        assert_eq!(Symbology::from_label("QR-Code"), Some(Symbology::QrCode));
        assert_eq!(Symbology::from_label("CODE-128"), Some(Symbology::Code128));
        assert_eq!(Symbology::from_label("EAN-13"), Some(Symbology::Ean13));
        assert_eq!(Symbology::from_label("ean13"), Some(Symbology::Ean13));
        assert_eq!(Symbology::from_label("I2/5"), None);
        assert_eq!(Symbology::from_label("http"), None);
    }

    #[test]
    fn test_default_state_is_empty() {
        let mut state = PipelineState::default();
        assert!(state.is_empty());
        assert!(!state.loading);

        state.not_found = true;
        assert!(!state.is_empty());
    }
}
