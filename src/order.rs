// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Order data structures.
//!
//! Two shapes flow through the engine:
//! - [`UpstreamOrder`]: the record as the upstream API sends it. Every field
//!   except the identifier is optional and decoding is lenient (money as
//!   string or number, several timestamp formats).
//! - [`OrderRow`]: the complete local row. [`transform`] fills every missing
//!   upstream field with a neutral value so an upsert always writes a full row.
//!
//! # Example
//!
//! ```
//! use order_sync::order::{transform, UpstreamOrder};
//! use serde_json::json;
//!
//! let raw = json!({"id": 1001, "total": 49.9, "updated_at": "2026-01-02T03:04:05Z"});
//! let order = UpstreamOrder::from_value(raw).unwrap();
//! let row = transform(&order, chrono::Utc::now());
//!
//! assert_eq!(row.id, 1001);
//! assert_eq!(row.total_price, "49.9");
//! assert_eq!(row.currency, "");
//! assert!(row.refunds.is_empty());
//! ```

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Neutral value for monetary fields the upstream omitted.
pub const ZERO_AMOUNT: &str = "0.00";

/// A refund applied to an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refund {
    /// Decimal-safe amount
    #[serde(default, deserialize_with = "money")]
    pub amount: Option<String>,
    #[serde(default, deserialize_with = "timestamp")]
    pub processed_at: Option<DateTime<Utc>>,
}

/// An order as returned by the upstream API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamOrder {
    /// Upstream-assigned identifier; the upsert conflict key
    #[serde(deserialize_with = "identifier")]
    pub id: i64,
    #[serde(default, deserialize_with = "text", alias = "number")]
    pub order_number: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "text", alias = "financial_status")]
    pub payment_status: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub fulfillment_status: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub currency: Option<String>,
    #[serde(default, deserialize_with = "money", alias = "total_price")]
    pub total: Option<String>,
    #[serde(default, deserialize_with = "money", alias = "subtotal_price")]
    pub subtotal: Option<String>,
    #[serde(default, deserialize_with = "money", alias = "total_tax")]
    pub tax: Option<String>,
    #[serde(default, deserialize_with = "money", alias = "total_discounts")]
    pub discount: Option<String>,
    #[serde(default)]
    pub customer: Option<Value>,
    #[serde(default, alias = "items")]
    pub line_items: Option<Value>,
    #[serde(default, alias = "payment_details")]
    pub payment: Option<Value>,
    #[serde(default, deserialize_with = "text")]
    pub affiliate_id: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub affiliate_name: Option<String>,
    #[serde(default, deserialize_with = "money")]
    pub affiliate_commission: Option<String>,
    #[serde(default)]
    pub refunds: Option<Vec<Refund>>,
    #[serde(default, alias = "has_chargeback")]
    pub chargeback: Option<bool>,
    #[serde(default, deserialize_with = "timestamp")]
    pub chargeback_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl UpstreamOrder {
    /// Minimal order with only an identifier and `updated_at`.
    pub fn new(id: i64, updated_at: Option<DateTime<Utc>>) -> Self {
        Self {
            id,
            order_number: None,
            status: None,
            payment_status: None,
            fulfillment_status: None,
            currency: None,
            total: None,
            subtotal: None,
            tax: None,
            discount: None,
            customer: None,
            line_items: None,
            payment: None,
            affiliate_id: None,
            affiliate_name: None,
            affiliate_commission: None,
            refunds: None,
            chargeback: None,
            chargeback_at: None,
            created_at: None,
            updated_at,
        }
    }

    /// Decode one record from a JSON value.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Decode every record of a page, keeping the ones that parse.
    ///
    /// Returns the decoded orders and the number of malformed records skipped.
    pub fn decode_all(values: Vec<Value>) -> (Vec<Self>, usize) {
        let mut orders = Vec::with_capacity(values.len());
        let mut malformed = 0;
        for value in values {
            let id_hint = value.get("id").cloned();
            match Self::from_value(value) {
                Ok(order) => orders.push(order),
                Err(e) => {
                    malformed += 1;
                    tracing::warn!(id = ?id_hint, error = %e, "Skipping malformed upstream order");
                }
            }
        }
        (orders, malformed)
    }
}

/// An order as persisted locally. Every column is always populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRow {
    pub id: i64,
    pub order_number: String,
    pub status: String,
    pub payment_status: String,
    pub fulfillment_status: String,
    pub currency: String,
    pub total_price: String,
    pub subtotal_price: String,
    pub total_tax: String,
    pub total_discounts: String,
    /// Opaque JSON blob (`null` when absent)
    pub customer: Value,
    /// Opaque JSON blob (`[]` when absent)
    pub line_items: Value,
    /// Opaque JSON blob (`null` when absent)
    pub payment_details: Value,
    pub affiliate_id: Option<String>,
    pub affiliate_name: Option<String>,
    pub affiliate_commission: Option<String>,
    pub refunds: Vec<Refund>,
    /// Sum of refund amounts, decimal-safe
    pub refunded_amount: String,
    pub chargeback: bool,
    pub chargeback_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Set locally on every persist
    pub synced_at: DateTime<Utc>,
}

/// Map an upstream record to the complete local row shape.
pub fn transform(order: &UpstreamOrder, synced_at: DateTime<Utc>) -> OrderRow {
    let refunds = order.refunds.clone().unwrap_or_default();
    let refunded_amount = sum_amounts(refunds.iter().filter_map(|r| r.amount.as_deref()));

    OrderRow {
        id: order.id,
        order_number: order.order_number.clone().unwrap_or_else(|| order.id.to_string()),
        status: order.status.clone().unwrap_or_default(),
        payment_status: order.payment_status.clone().unwrap_or_default(),
        fulfillment_status: order.fulfillment_status.clone().unwrap_or_default(),
        currency: order.currency.clone().unwrap_or_default(),
        total_price: amount_or_zero(&order.total),
        subtotal_price: amount_or_zero(&order.subtotal),
        total_tax: amount_or_zero(&order.tax),
        total_discounts: amount_or_zero(&order.discount),
        customer: order.customer.clone().unwrap_or(Value::Null),
        line_items: order.line_items.clone().unwrap_or_else(|| Value::Array(Vec::new())),
        payment_details: order.payment.clone().unwrap_or(Value::Null),
        affiliate_id: order.affiliate_id.clone().filter(|s| !s.is_empty()),
        affiliate_name: order.affiliate_name.clone().filter(|s| !s.is_empty()),
        affiliate_commission: order.affiliate_commission.clone(),
        refunds,
        refunded_amount,
        chargeback: order.chargeback.unwrap_or(false) || order.chargeback_at.is_some(),
        chargeback_at: order.chargeback_at,
        created_at: order.created_at,
        updated_at: order.updated_at,
        synced_at,
    }
}

/// True when `upstream` is strictly newer than `local`, compared at millisecond
/// precision (the store's resolution). A missing upstream timestamp is never newer.
#[must_use]
pub fn is_newer(upstream: Option<DateTime<Utc>>, local: Option<DateTime<Utc>>) -> bool {
    match (upstream, local) {
        (Some(u), Some(l)) => u.timestamp_millis() > l.timestamp_millis(),
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// Epoch millis to UTC timestamp.
#[must_use]
pub fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

fn amount_or_zero(amount: &Option<String>) -> String {
    match amount {
        Some(a) if !a.trim().is_empty() => a.clone(),
        _ => ZERO_AMOUNT.to_string(),
    }
}

/// Sums decimal strings in integer cents-of-cents to avoid float drift.
/// Falls back to the neutral amount if nothing parses.
fn sum_amounts<'a>(amounts: impl Iterator<Item = &'a str>) -> String {
    const SCALE: i128 = 10_000;
    let mut total: i128 = 0;
    for amount in amounts {
        match parse_scaled(amount, SCALE).and_then(|units| total.checked_add(units)) {
            Some(sum) => total = sum,
            None => tracing::warn!(amount, "Skipping unparseable or out-of-range amount"),
        }
    }
    let sign = if total < 0 { "-" } else { "" };
    let abs = total.unsigned_abs();
    let whole = abs / SCALE.unsigned_abs();
    let frac = (abs % SCALE.unsigned_abs()) / 100;
    format!("{sign}{whole}.{frac:02}")
}

fn parse_scaled(amount: &str, scale: i128) -> Option<i128> {
    let amount = amount.trim();
    let (negative, digits) = match amount.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, amount),
    };
    let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
    if whole.is_empty() && frac.is_empty() {
        return None;
    }
    let whole: i128 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut frac_digits: String = frac.chars().take(4).collect();
    if !frac_digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    while frac_digits.len() < 4 {
        frac_digits.push('0');
    }
    let frac: i128 = frac_digits.parse().ok()?;
    let value = whole.checked_mul(scale)?.checked_add(frac)?;
    Some(if negative { -value } else { value })
}

// ═══════════════════════════════════════════════════════════════════════════
// Lenient field decoders
// ═══════════════════════════════════════════════════════════════════════════

fn identifier<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    use serde::de::Error;
    match Value::deserialize(d)? {
        Value::Number(n) => n.as_i64().ok_or_else(|| D::Error::custom("order id is not an integer")),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| D::Error::custom(format!("order id '{s}' is not numeric"))),
        other => Err(D::Error::custom(format!("invalid order id: {other}"))),
    }
}

fn text<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        Some(other) => Some(other.to_string()),
    })
}

fn money<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    use serde::de::Error;
    match Option::<Value>::deserialize(d)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        // serde_json keeps the literal digits for finite numbers
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(D::Error::custom(format!("invalid amount: {other}"))),
    }
}

fn timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
    use serde::de::Error;
    match Option::<Value>::deserialize(d)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => parse_timestamp(&s)
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("unrecognised timestamp '{s}'"))),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(from_epoch)
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("invalid epoch timestamp {n}"))),
        Some(other) => Err(D::Error::custom(format!("invalid timestamp: {other}"))),
    }
}

/// Epoch values at or above this are read as milliseconds (as seconds they
/// would land past the year 5000).
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Numeric epoch timestamp, in seconds or (13-digit) milliseconds.
fn from_epoch(value: i64) -> Option<DateTime<Utc>> {
    if value.unsigned_abs() >= EPOCH_MILLIS_THRESHOLD.unsigned_abs() {
        from_millis(value)
    } else {
        Utc.timestamp_opt(value, 0).single()
    }
}

/// Parse RFC 3339 or `YYYY-MM-DD HH:MM:SS` (assumed UTC).
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}
