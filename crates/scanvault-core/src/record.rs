use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    error::{VaultError, VaultResult},
    package::SealedRecord,
    tenant::{Feature, TenantId},
};

/// Structured record contents keyed by field name.
pub type FieldMap = BTreeMap<String, Value>;

/// Identifier assigned to a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> VaultResult<Self> {
        Uuid::parse_str(raw)
            .map(Self)
            .map_err(|e| VaultError::invalid(format!("record id: {e}")))
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Kinds of scan output the store accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    WebsiteScan,
    AiModelScan,
    Soc2Assessment,
    PiiScan,
}

impl RecordKind {
    pub const ALL: [RecordKind; 4] = [
        RecordKind::WebsiteScan,
        RecordKind::AiModelScan,
        RecordKind::Soc2Assessment,
        RecordKind::PiiScan,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::WebsiteScan => "website_scan",
            RecordKind::AiModelScan => "ai_model_scan",
            RecordKind::Soc2Assessment => "soc2_assessment",
            RecordKind::PiiScan => "pii_scan",
        }
    }

    /// Entitlement needed to store this kind.
    pub fn required_feature(&self) -> Feature {
        match self {
            RecordKind::WebsiteScan => Feature::WebsiteScan,
            RecordKind::AiModelScan => Feature::AiModelScan,
            RecordKind::Soc2Assessment => Feature::Soc2Assessment,
            RecordKind::PiiScan => Feature::PiiScan,
        }
    }
}

impl FromStr for RecordKind {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecordKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| VaultError::invalid(format!("unknown record kind {s:?}")))
    }
}

/// Plaintext logical record. Sensitive fields only live in this form in memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub kind: RecordKind,
    pub fields: FieldMap,
}

impl ScanRecord {
    pub fn new(kind: RecordKind) -> Self {
        Self {
            kind,
            fields: FieldMap::new(),
        }
    }

    /// Build from a JSON object; anything else is rejected.
    pub fn from_json(kind: RecordKind, value: Value) -> VaultResult<Self> {
        match value {
            Value::Object(map) => Ok(Self {
                kind,
                fields: map.into_iter().collect(),
            }),
            other => Err(VaultError::invalid(format!(
                "record must be a JSON object, got {}",
                json_type(&other)
            ))),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Numeric `compliance_score` field clamped to 0-100, if present.
    pub fn compliance_score(&self) -> Option<u8> {
        self.fields
            .get("compliance_score")
            .and_then(Value::as_f64)
            .map(|score| score.clamp(0.0, 100.0).round() as u8)
    }
}

/// True for values not worth encrypting: null, "", [] and {}.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Sensitive field names for one version of a record kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaEntry {
    pub kind: RecordKind,
    pub version: u32,
    pub sensitive_fields: BTreeSet<String>,
}

impl SchemaEntry {
    pub fn new(kind: RecordKind, version: u32, fields: &[&str]) -> Self {
        Self {
            kind,
            version,
            sensitive_fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }

    pub fn is_sensitive(&self, field: &str) -> bool {
        self.sensitive_fields.contains(field)
    }
}

/// Versioned table of sensitive fields per record kind.
#[derive(Debug, Clone)]
pub struct SchemaTable {
    entries: BTreeMap<(RecordKind, u32), SchemaEntry>,
}

impl Default for SchemaTable {
    fn default() -> Self {
        let mut entries = BTreeMap::new();
        for entry in [
            SchemaEntry::new(
                RecordKind::WebsiteScan,
                1,
                &["findings", "raw_text", "detection_detail", "cookies"],
            ),
            SchemaEntry::new(
                RecordKind::AiModelScan,
                1,
                &["findings", "raw_text", "detection_detail", "prompts"],
            ),
            SchemaEntry::new(
                RecordKind::Soc2Assessment,
                1,
                &["findings", "detection_detail", "evidence"],
            ),
            SchemaEntry::new(
                RecordKind::PiiScan,
                1,
                &["findings", "raw_text", "detection_detail", "matches"],
            ),
        ] {
            entries.insert((entry.kind, entry.version), entry);
        }
        Self { entries }
    }
}

impl SchemaTable {
    /// Add a newer schema version for a kind.
    pub fn register(&mut self, entry: SchemaEntry) -> VaultResult<()> {
        if let Some(latest) = self.latest(entry.kind) {
            if entry.version <= latest.version {
                return Err(VaultError::invalid(format!(
                    "schema version {} for {} must be greater than {}",
                    entry.version,
                    entry.kind.as_str(),
                    latest.version
                )));
            }
        }
        self.entries.insert((entry.kind, entry.version), entry);
        Ok(())
    }

    pub fn latest(&self, kind: RecordKind) -> Option<&SchemaEntry> {
        self.entries
            .range((kind, 0)..=(kind, u32::MAX))
            .next_back()
            .map(|(_, entry)| entry)
    }

    pub fn version(&self, kind: RecordKind, version: u32) -> Option<&SchemaEntry> {
        self.entries.get(&(kind, version))
    }
}

/// A persisted record row. `tenant_id` is fixed at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    pub tenant_id: TenantId,
    pub record_id: RecordId,
    pub kind: RecordKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub body: SealedRecord,
}

impl StoredRow {
    /// Serialized size, used for storage accounting.
    pub fn stored_size(&self) -> u64 {
        serde_json::to_vec(self)
            .map(|bytes| bytes.len() as u64)
            .unwrap_or(0)
    }

    pub fn summary(&self) -> RecordSummary {
        RecordSummary {
            record_id: self.record_id,
            kind: self.kind,
            created_at: self.created_at,
            fields: self.body.fields.clone(),
            encrypted_fields: self.body.encrypted.keys().cloned().collect(),
        }
    }
}

/// Listing view of a record: clear fields only, nothing decrypted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSummary {
    pub record_id: RecordId,
    pub kind: RecordKind,
    pub created_at: DateTime<Utc>,
    pub fields: FieldMap,
    pub encrypted_fields: Vec<String>,
}

/// Which rows a data-access handle may touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowScope {
    Tenant(TenantId),
    AllTenants,
}

impl RowScope {
    pub fn admits(&self, tenant_id: &TenantId) -> bool {
        match self {
            RowScope::Tenant(scoped) => scoped == tenant_id,
            RowScope::AllTenants => true,
        }
    }
}
