//! Correlation-key normalization for legacy payloads.
//!
//! Some legacy producers stuff whole form blobs or e-mail-ish strings into
//! the partner id field. The rules here recover a usable key: prefer an
//! embedded UUID, otherwise truncate. This module exists to be deleted once
//! those producers are retired.

use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;
use uuid::Uuid;

/// Characters that mark a raw value as a legacy blob rather than an id.
const SUSPECT_CHARS: [char; 4] = [' ', '@', '+', ','];

/// Raw values longer than this are always treated as blobs.
const MAX_RAW_LEN: usize = 200;

/// Fallback truncation width when no UUID can be extracted.
const TRUNCATED_LEN: usize = 50;

static UUID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new("[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}")
        .expect("uuid pattern is valid")
});

/// Normalize a raw correlation key extracted from a payload.
pub fn normalize_partner_id(raw: &str) -> String {
    let suspicious = raw.chars().any(|c| SUSPECT_CHARS.contains(&c)) || raw.len() > MAX_RAW_LEN;
    if !suspicious {
        return raw.to_string();
    }

    if let Some(found) = UUID_PATTERN.find(&raw.to_lowercase()) {
        let id = found.as_str().to_string();
        warn!(partner_id = %id, "extracted embedded uuid from legacy partner id");
        return id;
    }

    let truncated: String = raw.chars().take(TRUNCATED_LEN).collect();
    warn!(partner_id = %truncated, raw_len = raw.len(), "truncated legacy partner id");
    truncated
}

/// Temporary correlation key for a `CreatePartnerCommand`, whose form payload
/// has no id yet; the real key arrives with `PartnerCreated`.
pub fn temp_partner_id() -> String {
    let uuid = Uuid::now_v7().simple().to_string();
    // The tail of a v7 uuid is its random segment.
    format!("temp-{}", &uuid[uuid.len() - 8..])
}
