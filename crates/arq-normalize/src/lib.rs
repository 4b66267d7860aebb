//! Schema normalization and line-item validation for raw arqueo payloads.
//!
//! This crate converts a decoded JSON message body into a canonical
//! [`OperationRequest`] or a [`ValidationError`] naming the offending field.
//!
//! It does **not**:
//! - consume from the broker (that is `arq-broker`)
//! - touch the external ledger
//! - persist anything
//!
//! Normalization is a pure function: same input, same output, no side
//! effects. The legacy message shape (a `final` array with `partida` /
//! `IMPORTE_PARTIDA` keys and a trailing Total row) is detected and rejected
//! outright — there is no migration path.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use arq_schemas::{
    cents::CentsParseError, Cents, Committed, LineItem, Naturaleza, OperationDetail,
    OperationRequest,
};

mod accounts;

pub use accounts::AccountMap;

// ---------------------------------------------------------------------------
// Wire keys
// ---------------------------------------------------------------------------

/// Canonical line-item array key. Its presence selects the current schema.
const KEY_LINE_ITEMS: &str = "aplicaciones";

/// Legacy array key. Its presence anywhere is a hard rejection.
const KEY_LEGACY_ARRAY: &str = "final";
const KEY_LEGACY_CODE: &str = "partida";
const KEY_LEGACY_AMOUNT: &str = "IMPORTE_PARTIDA";

/// Expediente used when the caller supplies none.
pub const DEFAULT_EXPEDIENTE: &str = "rbt-apunte-arqueo";

// ---------------------------------------------------------------------------
// ValidationError
// ---------------------------------------------------------------------------

/// Errors produced while normalizing a raw payload.
///
/// Every variant names the field (and, for line items, the index) that caused
/// the rejection, so the published result and the audit row carry an
/// actionable message.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// The payload is not a JSON object.
    NotAnObject,
    /// A required top-level or detail field is absent.
    MissingField { field: &'static str },
    /// A field is present but malformed.
    InvalidField { field: &'static str, reason: String },
    /// The deprecated message schema was detected. Never migrated.
    LegacySchema { key: String },
    /// A line item failed validation. Fails the whole request.
    InvalidItem {
        index: usize,
        field: &'static str,
        reason: String,
    },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::NotAnObject => write!(f, "payload is not a JSON object"),
            ValidationError::MissingField { field } => {
                write!(f, "missing required field '{field}'")
            }
            ValidationError::InvalidField { field, reason } => {
                write!(f, "invalid field '{field}': {reason}")
            }
            ValidationError::LegacySchema { key } => {
                write!(
                    f,
                    "deprecated message schema detected (key '{key}'): legacy envelopes \
                     are unsupported and are never migrated"
                )
            }
            ValidationError::InvalidItem {
                index,
                field,
                reason,
            } => {
                write!(f, "line item {index}: invalid field '{field}': {reason}")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Normalize a decoded message body into a canonical [`OperationRequest`].
///
/// Schema discrimination happens first: the canonical shape carries its line
/// items under `aplicaciones`; any trace of the legacy shape (`final`,
/// `partida`, `IMPORTE_PARTIDA`) rejects the whole message before any field
/// is interpreted.
pub fn normalize(raw: &Value, accounts: &AccountMap) -> Result<OperationRequest, ValidationError> {
    let obj = raw.as_object().ok_or(ValidationError::NotAnObject)?;

    let task_id = required_str(obj, "task_id")?;

    let detail_val = obj
        .get("detail")
        .ok_or(ValidationError::MissingField { field: "detail" })?;
    let detail_obj = detail_val
        .as_object()
        .ok_or(ValidationError::InvalidField {
            field: "detail",
            reason: "expected an object".to_string(),
        })?;

    reject_legacy_shape(detail_obj)?;

    let detail = normalize_detail(detail_obj, accounts)?;

    // Declared total is caller-supplied and optional. The original envelope
    // named it `liquido_operaciones`; the canonical name is `declared_total`.
    let declared_total = match obj.get("declared_total").or_else(|| obj.get("liquido_operaciones")) {
        None | Some(Value::Null) => None,
        Some(v) => Some(amount_from_value(v).map_err(|reason| ValidationError::InvalidField {
            field: "declared_total",
            reason,
        })?),
    };

    Ok(OperationRequest {
        task_id,
        detail,
        declared_total,
    })
}

/// Reject any trace of the deprecated schema.
fn reject_legacy_shape(detail: &Map<String, Value>) -> Result<(), ValidationError> {
    if detail.contains_key(KEY_LEGACY_ARRAY) {
        return Err(ValidationError::LegacySchema {
            key: KEY_LEGACY_ARRAY.to_string(),
        });
    }
    if let Some(Value::Array(items)) = detail.get(KEY_LINE_ITEMS) {
        for item in items {
            if let Some(o) = item.as_object() {
                for key in [KEY_LEGACY_CODE, KEY_LEGACY_AMOUNT] {
                    if o.contains_key(key) {
                        return Err(ValidationError::LegacySchema {
                            key: key.to_string(),
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Detail normalization
// ---------------------------------------------------------------------------

fn normalize_detail(
    detail: &Map<String, Value>,
    accounts: &AccountMap,
) -> Result<OperationDetail, ValidationError> {
    let fecha = required_str(detail, "fecha")?;
    if fecha.len() != 8 || !fecha.chars().all(|c| c.is_ascii_digit()) {
        return Err(ValidationError::InvalidField {
            field: "fecha",
            reason: format!("expected ddmmyyyy, got '{fecha}'"),
        });
    }

    let caja = required_str(detail, "caja")?;
    let tercero = required_str(detail, "tercero")?;

    let expediente = match detail.get("expediente").and_then(Value::as_str) {
        Some(e) if !e.trim().is_empty() => e.to_string(),
        _ => DEFAULT_EXPEDIENTE.to_string(),
    };

    let naturaleza_raw = required_str(detail, "naturaleza")?;
    let naturaleza =
        Naturaleza::parse(&naturaleza_raw).ok_or_else(|| ValidationError::InvalidField {
            field: "naturaleza",
            reason: format!("expected INCOME|EXPENSE (or SICAL codes 5|4), got '{naturaleza_raw}'"),
        })?;

    let description = extract_description(detail);

    let items_val = detail
        .get(KEY_LINE_ITEMS)
        .ok_or(ValidationError::MissingField {
            field: "aplicaciones",
        })?;
    let items_arr = items_val.as_array().ok_or(ValidationError::InvalidField {
        field: "aplicaciones",
        reason: "expected an array".to_string(),
    })?;

    let mut line_items = Vec::with_capacity(items_arr.len());
    for (index, item) in items_arr.iter().enumerate() {
        line_items.push(validate_line_item(index, item, accounts)?);
    }

    let discounts = match detail.get("descuentos") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(a)) => a.clone(),
        Some(_) => {
            return Err(ValidationError::InvalidField {
                field: "descuentos",
                reason: "expected an array".to_string(),
            })
        }
    };

    let aux_data: BTreeMap<String, Value> = match detail.get("aux_data") {
        None | Some(Value::Null) => BTreeMap::new(),
        Some(Value::Object(m)) => m.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        Some(_) => {
            return Err(ValidationError::InvalidField {
                field: "aux_data",
                reason: "expected an object".to_string(),
            })
        }
    };

    let generated_at = detail
        .get("metadata")
        .and_then(|m| m.get("generation_datetime").or_else(|| m.get("generated_at")))
        .and_then(Value::as_str)
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&chrono::Utc));

    Ok(OperationDetail {
        fecha,
        caja,
        expediente,
        tercero,
        naturaleza,
        description,
        line_items,
        discounts,
        aux_data,
        generated_at,
    })
}

/// Extract the free-text description from the `texto_sical` descriptive
/// block: the `tcargo` entry of its first element. Absent block → empty.
fn extract_description(detail: &Map<String, Value>) -> String {
    detail
        .get("texto_sical")
        .and_then(Value::as_array)
        .and_then(|a| a.first())
        .and_then(|e| e.get("tcargo"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

// ---------------------------------------------------------------------------
// Line-item validation
// ---------------------------------------------------------------------------

/// Validate and canonicalize one line item.
///
/// The whole request fails on the first invalid item — there is no partial
/// acceptance, because a partially valid arqueo keyed into the ledger cannot
/// be rolled back.
fn validate_line_item(
    index: usize,
    item: &Value,
    accounts: &AccountMap,
) -> Result<LineItem, ValidationError> {
    let obj = item.as_object().ok_or(ValidationError::InvalidItem {
        index,
        field: "(item)",
        reason: "expected an object".to_string(),
    })?;

    let year = item_str(obj, index, "year")?;
    if year.len() != 4 || !year.chars().all(|c| c.is_ascii_digit()) {
        return Err(ValidationError::InvalidItem {
            index,
            field: "year",
            reason: format!("expected a 4-digit year, got '{year}'"),
        });
    }

    let budget_code = item_str(obj, index, "economica")?;

    let amount_val = match obj.get("importe") {
        None | Some(Value::Null) => {
            return Err(ValidationError::InvalidItem {
                index,
                field: "importe",
                reason: "amount is required and must be numeric".to_string(),
            })
        }
        Some(v) => v,
    };
    let amount = amount_from_value(amount_val).map_err(|reason| ValidationError::InvalidItem {
        index,
        field: "importe",
        reason,
    })?;

    let committed = match obj.get("contraido") {
        None | Some(Value::Null) => Committed::Flag(false),
        Some(v) => coerce_committed(v).map_err(|reason| ValidationError::InvalidItem {
            index,
            field: "contraido",
            reason,
        })?,
    };

    let taxable_base = optional_amount(obj, "base_imponible").map_err(|reason| {
        ValidationError::InvalidItem {
            index,
            field: "base_imponible",
            reason,
        }
    })?;
    let rate =
        optional_amount(obj, "tipo").map_err(|reason| ValidationError::InvalidItem {
            index,
            field: "tipo",
            reason,
        })?;

    let project_code = obj
        .get("proyecto")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string);

    let pgp_account = obj
        .get("cuenta_pgp")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string);

    let account = accounts.lookup(&budget_code).to_string();

    Ok(LineItem {
        year,
        budget_code,
        project_code,
        committed,
        taxable_base,
        rate,
        amount,
        pgp_account,
        account,
    })
}

/// Coerce a raw `contraido` value into its canonical tagged form.
///
/// Closed set: boolean → flag; integer → reference kept verbatim; float whose
/// value is exactly 0.0 or 1.0 → truncated to an integer reference. Anything
/// else — strings in particular — is a validation failure, not a best-effort
/// cast.
pub fn coerce_committed(v: &Value) -> Result<Committed, String> {
    match v {
        Value::Bool(b) => Ok(Committed::Flag(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Ok(Committed::Reference(i));
            }
            match n.as_f64() {
                Some(f) if f == 0.0 => Ok(Committed::Reference(0)),
                Some(f) if f == 1.0 => Ok(Committed::Reference(1)),
                _ => Err(format!(
                    "float contraido must be exactly 0.0 or 1.0, got {n}"
                )),
            }
        }
        other => Err(format!(
            "contraido accepts a boolean, an integer, or a 0.0/1.0 float; got {other}"
        )),
    }
}

/// Exact cent conversion from a JSON number or decimal string.
///
/// JSON numbers go through their literal decimal rendering, never through
/// `f64` arithmetic, so `5000.0` and `"5000,0"` both land on the same cents.
fn amount_from_value(v: &Value) -> Result<Cents, String> {
    let text = match v {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => return Err(format!("expected a decimal number, got {other}")),
    };
    Cents::parse(&text).map_err(|e: CentsParseError| e.to_string())
}

fn optional_amount(obj: &Map<String, Value>, key: &'static str) -> Result<Cents, String> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(Cents::ZERO),
        Some(v) => amount_from_value(v),
    }
}

// ---------------------------------------------------------------------------
// Small helpers
// ---------------------------------------------------------------------------

fn required_str(obj: &Map<String, Value>, field: &'static str) -> Result<String, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Err(ValidationError::MissingField { field }),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(ValidationError::InvalidField {
            field,
            reason: format!("expected a string, got {other}"),
        }),
    }
}

fn item_str(
    obj: &Map<String, Value>,
    index: usize,
    field: &'static str,
) -> Result<String, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Err(ValidationError::InvalidItem {
            index,
            field,
            reason: "required".to_string(),
        }),
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(Value::String(_)) => Err(ValidationError::InvalidItem {
            index,
            field,
            reason: "must not be empty".to_string(),
        }),
        Some(other) => Err(ValidationError::InvalidItem {
            index,
            field,
            reason: format!("expected a string, got {other}"),
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
