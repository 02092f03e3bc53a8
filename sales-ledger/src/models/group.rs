//! Equipment groups and their cached balances.

use std::collections::HashSet;

use bson::Document;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ledger_core::error::StoreError;

use crate::models::account::normalize_member_id;
use crate::store::collections;

/// A named set of equipment whose receivables are tracked together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub name: String,
    /// Equipment ids with set semantics; normalized to bare ids on decode.
    pub equipment_ids: Vec<String>,
    /// Last reconciled sum of member balances; kept current by the
    /// aggregator, persisted only when it changes.
    #[serde(default)]
    pub cached_total: Decimal,
    #[serde(default = "active_default")]
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn active_default() -> bool {
    true
}

impl Group {
    pub fn from_document(doc: Document) -> Result<Self, StoreError> {
        let mut group: Group = bson::from_document(doc).map_err(|e| StoreError::Corrupt {
            collection: collections::GROUPS.to_string(),
            reason: e.to_string(),
        })?;
        group.equipment_ids = dedup_members(group.equipment_ids);
        Ok(group)
    }

    pub fn to_document(&self) -> Result<Document, StoreError> {
        bson::to_document(self)
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("encode group: {e}")))
    }

    /// Full-document patch: everything but the immutable `_id`.
    pub fn to_patch(&self) -> Result<Document, StoreError> {
        let mut doc = self.to_document()?;
        doc.remove("_id");
        Ok(doc)
    }

    pub fn contains_equipment(&self, equipment_id: &str) -> bool {
        self.equipment_ids.iter().any(|m| m == equipment_id)
    }
}

/// Normalize a member list to bare equipment ids, dropping blanks and
/// duplicates while preserving order.
pub fn dedup_members(raw: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.into_iter()
        .map(|m| normalize_member_id(&m))
        .filter(|m| !m.is_empty() && seen.insert(m.clone()))
        .collect()
}

/// Input for creating a group.
#[derive(Debug, Clone)]
pub struct CreateGroup {
    pub name: String,
    pub equipment_ids: Vec<String>,
}

/// Input for replacing a group's name and membership.
#[derive(Debug, Clone)]
pub struct UpdateGroup {
    pub name: String,
    pub equipment_ids: Vec<String>,
}
