//! Recap record model
//!
//! A recap is the precomputed yearly summary shown to one user. The record is
//! immutable once built and is the unit stored in both tiers: as a row in the
//! primary store and as a JSON document in the cache.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use validator::Validate;

/// Maximum length of the raw-value preview attached to corruption reports
const PREVIEW_LEN: usize = 64;

/// Identifier of a recap (the owning user's numeric id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecapKey(pub i64);

impl RecapKey {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for RecapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecapKey {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(RecapKey)
    }
}

impl From<i64> for RecapKey {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// A product the user ordered most often
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductFavorite {
    pub product_name: String,
    pub count_cups: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_image: Option<String>,
}

/// A store the user visited most often
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FavoriteStore {
    pub store_name: String,
    pub transaction_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_image: Option<String>,
}

/// Recap record as served to callers and stored in the cache
///
/// Optional attributes are omitted from the JSON document when absent.
/// Each list is either fully present or absent; a list that fails to decode
/// is never kept in part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecapRecord {
    pub user_id: RecapKey,

    pub user_name: String,

    pub trx_count: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_count: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_point: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_point_description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_point_possible_redeem: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_point_image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_count: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pickup_count: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cheaper_subs_desc: Option<String>,

    /// Amount saved through subscriptions, emitted as a JSON number
    #[serde(
        default,
        with = "rust_decimal::serde::float_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub cheaper_subs_amount: Option<Decimal>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_ranking: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_product_favorite: Option<Vec<ProductFavorite>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_favorite_store: Option<Vec<FavoriteStore>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_circular_images: Option<Vec<String>>,
}

/// Reasons a cached payload is rejected as corrupt
#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    NotJson(String),

    #[error("top-level JSON value is {0}, expected an object")]
    NotObject(&'static str),

    #[error("payload does not match the recap schema: {0}")]
    Schema(String),

    #[error("payload belongs to key {found}, expected {expected}")]
    KeyMismatch { expected: RecapKey, found: RecapKey },
}

impl RecapRecord {
    /// Minimal record with only the required attributes set
    pub fn new(user_id: RecapKey, user_name: impl Into<String>, trx_count: i64) -> Self {
        Self {
            user_id,
            user_name: user_name.into(),
            trx_count,
            variant_count: None,
            total_point: None,
            total_point_description: None,
            total_point_possible_redeem: None,
            total_point_image: None,
            delivery_count: None,
            pickup_count: None,
            cheaper_subs_desc: None,
            cheaper_subs_amount: None,
            top_ranking: None,
            list_product_favorite: None,
            list_favorite_store: None,
            list_circular_images: None,
        }
    }

    /// Serialize for storage in the cache tier
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode and validate a payload read from the cache
    ///
    /// The payload must be a JSON object matching the schema and must belong
    /// to `expected`. Any failure rejects the whole payload.
    pub fn decode_cached(raw: &str, expected: RecapKey) -> Result<Self, DecodeError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| DecodeError::NotJson(e.to_string()))?;

        if !value.is_object() {
            return Err(DecodeError::NotObject(json_kind(&value)));
        }

        let record: RecapRecord =
            serde_json::from_value(value).map_err(|e| DecodeError::Schema(e.to_string()))?;

        if record.user_id != expected {
            return Err(DecodeError::KeyMismatch {
                expected,
                found: record.user_id,
            });
        }

        Ok(record)
    }
}

/// Bounded, char-safe preview of a raw payload for diagnostics
pub fn payload_preview(raw: &str) -> String {
    if raw.chars().count() <= PREVIEW_LEN {
        return raw.to_string();
    }
    let mut preview: String = raw.chars().take(PREVIEW_LEN).collect();
    preview.push('…');
    preview
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// One row submitted for bulk upsert into the primary store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct RecapInput {
    pub user_id: i64,

    #[validate(length(min = 1, max = 255))]
    pub user_name: String,

    #[validate(range(min = 0))]
    pub trx_count: i64,

    #[serde(default)]
    #[validate(range(min = 0))]
    pub variant_count: Option<i32>,

    #[serde(default)]
    #[validate(range(min = 0))]
    pub total_point: Option<i64>,

    #[serde(default)]
    pub total_point_description: Option<String>,

    #[serde(default)]
    #[validate(range(min = 0))]
    pub total_point_possible_redeem: Option<i32>,

    #[serde(default)]
    pub total_point_image: Option<String>,

    #[serde(default)]
    #[validate(range(min = 0))]
    pub delivery_count: Option<i32>,

    #[serde(default)]
    #[validate(range(min = 0))]
    pub pickup_count: Option<i32>,

    #[serde(default)]
    pub cheaper_subs_desc: Option<String>,

    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub cheaper_subs_amount: Option<Decimal>,

    #[serde(default)]
    #[validate(range(min = 0))]
    pub top_ranking: Option<i32>,

    #[serde(default)]
    pub list_product_favorite: Option<Vec<ProductFavorite>>,

    #[serde(default)]
    #[validate(length(max = 3))]
    pub list_favorite_store: Option<Vec<FavoriteStore>>,

    #[serde(default)]
    pub list_circular_images: Option<Vec<String>>,
}

impl RecapInput {
    pub fn key(&self) -> RecapKey {
        RecapKey(self.user_id)
    }

    /// The record this input produces once stored
    pub fn to_record(&self) -> RecapRecord {
        RecapRecord {
            user_id: self.key(),
            user_name: self.user_name.clone(),
            trx_count: self.trx_count,
            variant_count: self.variant_count,
            total_point: self.total_point,
            total_point_description: self.total_point_description.clone(),
            total_point_possible_redeem: self.total_point_possible_redeem,
            total_point_image: self.total_point_image.clone(),
            delivery_count: self.delivery_count,
            pickup_count: self.pickup_count,
            cheaper_subs_desc: self.cheaper_subs_desc.clone(),
            cheaper_subs_amount: self.cheaper_subs_amount,
            top_ranking: self.top_ranking,
            list_product_favorite: self.list_product_favorite.clone(),
            list_favorite_store: self.list_favorite_store.clone(),
            list_circular_images: self.list_circular_images.clone(),
        }
    }
}

/// Bulk upsert mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertMode {
    /// The whole batch commits or none of it does
    #[default]
    Transactional,
    /// Each row is written on its own; failures are counted
    PerRow,
}

/// Outcome of a bulk upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UpsertReport {
    pub inserted: usize,
    pub failed: usize,
}
