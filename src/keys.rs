// 🔑 Key Resolution - Which columns join Base A to Base B
//
// Keys come from one of two places:
//   1. Legacy inline JSON maps on the reconciliation config,
//      `{"CHAVE_1": ["nf", "serie"], ...}` per side
//   2. Linking records (`reconciliation_keys`) pointing at reusable key
//      definitions or key pairs, checked against the bases' side and subtype
//
// Identifier order is processing order, so everything stays in Vecs.
// Any failure here aborts the run: matching on the wrong columns would
// silently produce wrong financial results.

use crate::config::{load_reconciliation_config, ReconciliationConfig};
use crate::db::{get_base, Base, BaseSide};
use crate::error::{ReconcileError, Result};
use crate::results::RESERVED_COLUMNS;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

// ============================================================================
// KEY DEFINITION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyDefinition {
    pub identifier: String,
    pub columns_a: Vec<String>,
    pub columns_b: Vec<String>,
}

impl KeyDefinition {
    pub fn new(identifier: &str, columns_a: &[&str], columns_b: &[&str]) -> Self {
        KeyDefinition {
            identifier: identifier.to_string(),
            columns_a: columns_a.iter().map(|c| c.to_string()).collect(),
            columns_b: columns_b.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// Column lists paired by position
    ///
    /// When the lists differ in length the shorter one is padded by
    /// repeating its own first column.
    pub fn padded_columns(&self) -> (Vec<String>, Vec<String>) {
        let len = self.columns_a.len().max(self.columns_b.len());
        (pad(&self.columns_a, len), pad(&self.columns_b, len))
    }
}

fn pad(columns: &[String], len: usize) -> Vec<String> {
    let mut padded = columns.to_vec();
    if let Some(first) = columns.first() {
        while padded.len() < len {
            padded.push(first.clone());
        }
    }
    padded
}

/// Resolver output: keys in processing order plus every column they touch
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResolvedKeys {
    pub keys: Vec<KeyDefinition>,
    pub columns_a: Vec<String>,
    pub columns_b: Vec<String>,
}

impl ResolvedKeys {
    fn from_keys(keys: Vec<KeyDefinition>) -> Self {
        let mut columns_a: Vec<String> = Vec::new();
        let mut columns_b: Vec<String> = Vec::new();

        for key in &keys {
            for column in &key.columns_a {
                if !columns_a.contains(column) {
                    columns_a.push(column.clone());
                }
            }
            for column in &key.columns_b {
                if !columns_b.contains(column) {
                    columns_b.push(column.clone());
                }
            }
        }

        ResolvedKeys {
            keys,
            columns_a,
            columns_b,
        }
    }

    pub fn identifiers(&self) -> Vec<String> {
        self.keys.iter().map(|k| k.identifier.clone()).collect()
    }

    /// Key reported for rows no key matched
    pub fn default_identifier(&self) -> Option<&str> {
        self.keys.first().map(|k| k.identifier.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

// ============================================================================
// STORED DEFINITIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
struct StoredKey {
    id: i64,
    name: String,
    side: BaseSide,
    subtype: Option<String>,
    columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
struct StoredPair {
    name: String,
    key_a_id: i64,
    key_b_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
struct KeyLinkRow {
    id: i64,
    identifier: Option<String>,
    pair_id: Option<i64>,
    key_a_id: Option<i64>,
    key_b_id: Option<i64>,
}

/// What a linking record points at
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KeyLink {
    Pair(i64),
    Keys { key_a_id: i64, key_b_id: i64 },
}

pub fn insert_key_definition(
    conn: &Connection,
    name: &str,
    side: BaseSide,
    subtype: Option<&str>,
    columns: &[&str],
) -> Result<i64> {
    conn.execute(
        "INSERT INTO key_definitions (name, side, subtype, columns) VALUES (?1, ?2, ?3, ?4)",
        params![name, side.as_str(), subtype, serde_json::to_string(columns)?],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn insert_key_pair(conn: &Connection, name: &str, key_a_id: i64, key_b_id: i64) -> Result<i64> {
    conn.execute(
        "INSERT INTO key_pairs (name, key_a_id, key_b_id) VALUES (?1, ?2, ?3)",
        params![name, key_a_id, key_b_id],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn link_key(
    conn: &Connection,
    config_id: i64,
    position: i64,
    identifier: Option<&str>,
    link: KeyLink,
) -> Result<i64> {
    let (pair_id, key_a_id, key_b_id) = match link {
        KeyLink::Pair(id) => (Some(id), None, None),
        KeyLink::Keys { key_a_id, key_b_id } => (None, Some(key_a_id), Some(key_b_id)),
    };

    conn.execute(
        "INSERT INTO reconciliation_keys (config_id, position, identifier, pair_id, key_a_id, key_b_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![config_id, position, identifier, pair_id, key_a_id, key_b_id],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Parse an inline `{identifier: [columns]}` map, keeping document order
pub fn parse_inline_keys(raw: &str) -> Result<Vec<(String, Vec<String>)>> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| ReconcileError::KeyResolution(format!("invalid inline key map: {}", e)))?;

    let object = value.as_object().ok_or_else(|| {
        ReconcileError::KeyResolution("inline key map must be a JSON object".to_string())
    })?;

    let mut keys = Vec::with_capacity(object.len());
    for (identifier, columns) in object {
        let columns = match columns {
            serde_json::Value::String(single) => vec![single.clone()],
            serde_json::Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_str().map(|s| s.to_string()).ok_or_else(|| {
                        ReconcileError::KeyResolution(format!(
                            "key '{}' lists a non-text column",
                            identifier
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            _ => {
                return Err(ReconcileError::KeyResolution(format!(
                    "key '{}' must map to a list of columns",
                    identifier
                )))
            }
        };

        let columns: Vec<String> = columns
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        keys.push((identifier.clone(), columns));
    }

    Ok(keys)
}

// ============================================================================
// RESOLVER
// ============================================================================

pub struct KeyConfigResolver<'a> {
    conn: &'a Connection,
}

impl<'a> KeyConfigResolver<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        KeyConfigResolver { conn }
    }

    /// Resolve keys for a reconciliation config id
    pub fn resolve(&self, config_id: i64) -> Result<ResolvedKeys> {
        let config = load_reconciliation_config(self.conn, config_id)?;
        let base_a = get_base(self.conn, config.base_a_id)?;
        let base_b = get_base(self.conn, config.base_b_id)?;
        self.resolve_for(&config, &base_a, &base_b)
    }

    /// Resolve keys for an already loaded config and its two bases
    ///
    /// Linking records win over the inline maps when both exist.
    pub fn resolve_for(
        &self,
        config: &ReconciliationConfig,
        base_a: &Base,
        base_b: &Base,
    ) -> Result<ResolvedKeys> {
        let links = self.load_links(config.id)?;

        let keys = if links.is_empty() {
            resolve_inline(config)?
        } else {
            self.resolve_links(&links, base_a, base_b)?
        };

        validate_identifiers(&keys)?;
        Ok(ResolvedKeys::from_keys(keys))
    }

    fn load_links(&self, config_id: i64) -> Result<Vec<KeyLinkRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, identifier, pair_id, key_a_id, key_b_id
             FROM reconciliation_keys
             WHERE config_id = ?1
             ORDER BY position, id",
        )?;

        let links = stmt
            .query_map(params![config_id], |row| {
                Ok(KeyLinkRow {
                    id: row.get(0)?,
                    identifier: row.get(1)?,
                    pair_id: row.get(2)?,
                    key_a_id: row.get(3)?,
                    key_b_id: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(links)
    }

    fn resolve_links(
        &self,
        links: &[KeyLinkRow],
        base_a: &Base,
        base_b: &Base,
    ) -> Result<Vec<KeyDefinition>> {
        let mut keys = Vec::with_capacity(links.len());

        for (index, link) in links.iter().enumerate() {
            let (key_a_id, key_b_id, pair_name) = match (link.pair_id, link.key_a_id, link.key_b_id) {
                (Some(pair_id), _, _) => {
                    let pair = self.load_pair(pair_id)?;
                    (pair.key_a_id, pair.key_b_id, Some(pair.name))
                }
                (None, Some(a), Some(b)) => (a, b, None),
                _ => {
                    return Err(ReconcileError::KeyResolution(format!(
                        "key link {} references neither a pair nor both keys",
                        link.id
                    )))
                }
            };

            let key_a = self.load_key(key_a_id)?;
            let key_b = self.load_key(key_b_id)?;
            check_compatible(&key_a, base_a)?;
            check_compatible(&key_b, base_b)?;

            let identifier = link
                .identifier
                .clone()
                .filter(|s| !s.trim().is_empty())
                .or(pair_name)
                .unwrap_or_else(|| format!("CHAVE_{}", index + 1));

            keys.push(KeyDefinition {
                identifier: identifier.trim().to_string(),
                columns_a: key_a.columns,
                columns_b: key_b.columns,
            });
        }

        Ok(keys)
    }

    fn load_pair(&self, pair_id: i64) -> Result<StoredPair> {
        self.conn
            .query_row(
                "SELECT name, key_a_id, key_b_id FROM key_pairs WHERE id = ?1",
                params![pair_id],
                |row| {
                    Ok(StoredPair {
                        name: row.get(0)?,
                        key_a_id: row.get(1)?,
                        key_b_id: row.get(2)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| ReconcileError::KeyResolution(format!("key pair {} not found", pair_id)))
    }

    fn load_key(&self, key_id: i64) -> Result<StoredKey> {
        let raw = self
            .conn
            .query_row(
                "SELECT id, name, side, subtype, columns FROM key_definitions WHERE id = ?1",
                params![key_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| ReconcileError::KeyResolution(format!("key {} not found", key_id)))?;

        let (id, name, side, subtype, columns) = raw;

        let side = BaseSide::parse(&side).ok_or_else(|| {
            ReconcileError::KeyResolution(format!("key {} has unknown side '{}'", id, side))
        })?;

        let columns: Vec<String> = serde_json::from_str(&columns).map_err(|e| {
            ReconcileError::KeyResolution(format!("key {} has invalid column list: {}", id, e))
        })?;

        Ok(StoredKey {
            id,
            name,
            side,
            subtype: subtype.filter(|s| !s.trim().is_empty()),
            columns,
        })
    }
}

fn check_compatible(key: &StoredKey, base: &Base) -> Result<()> {
    if key.side != base.side {
        return Err(ReconcileError::KeyResolution(format!(
            "key {} ('{}') is {} but base {} is {}",
            key.id, key.name, key.side, base.id, base.side
        )));
    }

    if let (Some(key_subtype), Some(base_subtype)) = (&key.subtype, &base.subtype) {
        if !key_subtype.eq_ignore_ascii_case(base_subtype) {
            return Err(ReconcileError::KeyResolution(format!(
                "key {} ('{}') has subtype {} but base {} has subtype {}",
                key.id, key.name, key_subtype, base.id, base_subtype
            )));
        }
    }

    Ok(())
}

/// Identifiers from the Base A map first, then any only the Base B map has
fn resolve_inline(config: &ReconciliationConfig) -> Result<Vec<KeyDefinition>> {
    let map_a = match &config.keys_a {
        Some(raw) if !raw.trim().is_empty() => parse_inline_keys(raw)?,
        _ => Vec::new(),
    };
    let map_b = match &config.keys_b {
        Some(raw) if !raw.trim().is_empty() => parse_inline_keys(raw)?,
        _ => Vec::new(),
    };

    let mut identifiers: Vec<&String> = map_a.iter().map(|(id, _)| id).collect();
    for (id, _) in &map_b {
        if !identifiers.contains(&id) {
            identifiers.push(id);
        }
    }

    let lookup = |map: &[(String, Vec<String>)], id: &str| -> Vec<String> {
        map.iter()
            .find(|(key, _)| key == id)
            .map(|(_, cols)| cols.clone())
            .unwrap_or_default()
    };

    Ok(identifiers
        .into_iter()
        .map(|id| KeyDefinition {
            identifier: id.trim().to_string(),
            columns_a: lookup(&map_a, id),
            columns_b: lookup(&map_b, id),
        })
        .collect())
}

fn validate_identifiers(keys: &[KeyDefinition]) -> Result<()> {
    let mut seen: Vec<String> = Vec::with_capacity(keys.len());

    for key in keys {
        let lowered = key.identifier.to_lowercase();

        if key.identifier.is_empty() {
            return Err(ReconcileError::KeyResolution("empty key identifier".to_string()));
        }
        if RESERVED_COLUMNS.contains(&lowered.as_str()) {
            return Err(ReconcileError::KeyResolution(format!(
                "key identifier '{}' clashes with a result column",
                key.identifier
            )));
        }
        if seen.contains(&lowered) {
            return Err(ReconcileError::KeyResolution(format!(
                "key identifier '{}' is used twice",
                key.identifier
            )));
        }
        if key.columns_a.is_empty() || key.columns_b.is_empty() {
            let side = if key.columns_a.is_empty() { "A" } else { "B" };
            return Err(ReconcileError::KeyResolution(format!(
                "key '{}' has no columns for base {}",
                key.identifier, side
            )));
        }

        seen.push(lowered);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::insert_reconciliation_config;
    use crate::db::{register_base, setup_database};

    struct Fixture {
        conn: Connection,
        config_id: i64,
    }

    fn fixture(keys_a: Option<&str>, keys_b: Option<&str>) -> Fixture {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let base_a = register_base(&conn, "Contabil", BaseSide::Contabil, Some("ICMS"), "base_a").unwrap();
        let base_b = register_base(&conn, "Fiscal", BaseSide::Fiscal, Some("ICMS"), "base_b").unwrap();

        let config_id = insert_reconciliation_config(
            &conn,
            &ReconciliationConfig {
                id: 0,
                name: "test".to_string(),
                base_a_id: base_a,
                base_b_id: base_b,
                value_column_a: "valor".to_string(),
                value_column_b: "valor_nf".to_string(),
                invert_sign_b: false,
                materiality_tolerance: 0.0,
                keys_a: keys_a.map(|s| s.to_string()),
                keys_b: keys_b.map(|s| s.to_string()),
            },
        )
        .unwrap();

        Fixture { conn, config_id }
    }

    #[test]
    fn test_inline_keys_keep_document_order() {
        let f = fixture(
            Some(r#"{"CHAVE_2": ["nf", "serie"], "CHAVE_1": ["nf"]}"#),
            Some(r#"{"CHAVE_1": ["numero"], "CHAVE_2": ["numero", "serie_nf"]}"#),
        );

        let resolved = KeyConfigResolver::new(&f.conn).resolve(f.config_id).unwrap();

        assert_eq!(resolved.identifiers(), vec!["CHAVE_2", "CHAVE_1"]);
        assert_eq!(resolved.keys[0].columns_b, vec!["numero", "serie_nf"]);
        assert_eq!(resolved.columns_a, vec!["nf", "serie"]);
        assert_eq!(resolved.columns_b, vec!["numero", "serie_nf"]);
        assert_eq!(resolved.default_identifier(), Some("CHAVE_2"));
    }

    #[test]
    fn test_inline_key_missing_side_fails() {
        let f = fixture(Some(r#"{"CHAVE_1": ["nf"]}"#), Some(r#"{}"#));

        let err = KeyConfigResolver::new(&f.conn).resolve(f.config_id).unwrap_err();
        assert!(matches!(err, ReconcileError::KeyResolution(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_no_keys_resolves_empty() {
        let f = fixture(None, None);
        let resolved = KeyConfigResolver::new(&f.conn).resolve(f.config_id).unwrap();
        assert!(resolved.is_empty());
        assert_eq!(resolved.default_identifier(), None);
    }

    #[test]
    fn test_reserved_identifier_rejected() {
        let f = fixture(Some(r#"{"status": ["nf"]}"#), Some(r#"{"status": ["numero"]}"#));
        let err = KeyConfigResolver::new(&f.conn).resolve(f.config_id).unwrap_err();
        assert!(matches!(err, ReconcileError::KeyResolution(_)));
    }

    #[test]
    fn test_linked_pair_and_keys() {
        let f = fixture(Some(r#"{"IGNORED": ["x"]}"#), Some(r#"{"IGNORED": ["y"]}"#));
        let conn = &f.conn;

        let ka = insert_key_definition(conn, "NF contabil", BaseSide::Contabil, Some("ICMS"), &["nf"]).unwrap();
        let kb = insert_key_definition(conn, "NF fiscal", BaseSide::Fiscal, None, &["numero"]).unwrap();
        let ka2 = insert_key_definition(conn, "Doc", BaseSide::Contabil, None, &["doc", "data"]).unwrap();
        let kb2 = insert_key_definition(conn, "Doc", BaseSide::Fiscal, None, &["chave"]).unwrap();
        let pair = insert_key_pair(conn, "NF", ka, kb).unwrap();

        link_key(conn, f.config_id, 2, Some("DOC"), KeyLink::Keys { key_a_id: ka2, key_b_id: kb2 }).unwrap();
        link_key(conn, f.config_id, 1, None, KeyLink::Pair(pair)).unwrap();

        let resolved = KeyConfigResolver::new(conn).resolve(f.config_id).unwrap();

        assert_eq!(resolved.identifiers(), vec!["NF", "DOC"]);
        assert_eq!(resolved.keys[1].columns_a, vec!["doc", "data"]);
        assert_eq!(resolved.columns_a, vec!["nf", "doc", "data"]);
        assert_eq!(resolved.columns_b, vec!["numero", "chave"]);
    }

    #[test]
    fn test_missing_pair_fails() {
        let f = fixture(None, None);
        link_key(&f.conn, f.config_id, 1, None, KeyLink::Pair(77)).unwrap();

        let err = KeyConfigResolver::new(&f.conn).resolve(f.config_id).unwrap_err();
        assert!(err.to_string().contains("key pair 77 not found"));
    }

    #[test]
    fn test_wrong_side_fails() {
        let f = fixture(None, None);
        let ka = insert_key_definition(&f.conn, "A", BaseSide::Fiscal, None, &["nf"]).unwrap();
        let kb = insert_key_definition(&f.conn, "B", BaseSide::Fiscal, None, &["numero"]).unwrap();
        link_key(&f.conn, f.config_id, 1, Some("K"), KeyLink::Keys { key_a_id: ka, key_b_id: kb }).unwrap();

        let err = KeyConfigResolver::new(&f.conn).resolve(f.config_id).unwrap_err();
        assert!(matches!(err, ReconcileError::KeyResolution(_)));
    }

    #[test]
    fn test_wrong_subtype_fails() {
        let f = fixture(None, None);
        let ka = insert_key_definition(&f.conn, "A", BaseSide::Contabil, Some("PIS"), &["nf"]).unwrap();
        let kb = insert_key_definition(&f.conn, "B", BaseSide::Fiscal, None, &["numero"]).unwrap();
        link_key(&f.conn, f.config_id, 1, Some("K"), KeyLink::Keys { key_a_id: ka, key_b_id: kb }).unwrap();

        let err = KeyConfigResolver::new(&f.conn).resolve(f.config_id).unwrap_err();
        assert!(err.to_string().contains("subtype"));
    }

    #[test]
    fn test_padding_repeats_first_column_of_shorter_list() {
        let key = KeyDefinition::new("CHAVE_1", &["nf", "serie", "cnpj"], &["numero"]);
        let (a, b) = key.padded_columns();

        assert_eq!(a, vec!["nf", "serie", "cnpj"]);
        assert_eq!(b, vec!["numero", "numero", "numero"]);

        let key = KeyDefinition::new("CHAVE_2", &["doc"], &["numero", "serie"]);
        let (a, b) = key.padded_columns();
        assert_eq!(a, vec!["doc", "doc"]);
        assert_eq!(b, vec!["numero", "serie"]);
    }

    #[test]
    fn test_parse_inline_rejects_non_object() {
        assert!(parse_inline_keys("[1, 2]").is_err());
        assert!(parse_inline_keys("not json").is_err());
        assert!(parse_inline_keys(r#"{"K": 5}"#).is_err());

        let single = parse_inline_keys(r#"{"K": "nf"}"#).unwrap();
        assert_eq!(single, vec![("K".to_string(), vec!["nf".to_string()])]);
    }
}
