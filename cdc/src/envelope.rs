//! Decoding of wal2json change envelopes.
//!
//! The output plugin emits one JSON object per transaction:
//!
//! ```json
//! {"xid": 1, "change": [{"kind": "insert", "schema": "public", "table": "orders",
//!   "columnnames": ["id"], "columntypes": ["integer"], "columnvalues": [7]}]}
//! ```
//!
//! Only inserts are surfaced. Every other record kind, including kinds this consumer has never
//! seen, decodes into [`ChangeRecord::Ignored`] so that new upstream kinds never fail an
//! envelope.

use serde::Deserialize;
use serde_json::Value;

use crate::bail;
use crate::error::{CdcResult, ErrorKind};
use crate::types::Row;

/// Discriminator value of insert records, compared case-insensitively.
const INSERT_KIND: &str = "insert";

/// Compares two identifiers ignoring case, with Unicode case folding.
fn eq_ignore_case(left: &str, right: &str) -> bool {
    left == right || left.to_lowercase() == right.to_lowercase()
}

/// One transaction worth of change records.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Envelope {
    /// Id of the transaction that produced the changes.
    pub xid: u64,
    /// Change records in the order the source emitted them.
    #[serde(rename = "change")]
    pub changes: Vec<ChangeRecord>,
}

/// A row-level change decoded from an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawChangeRecord")]
pub enum ChangeRecord {
    /// A newly inserted row, with column names and values in matching positions.
    Insert {
        schema: String,
        table: String,
        column_names: Vec<String>,
        column_values: Vec<Value>,
    },
    /// Any other kind of record. Kept only so that it can be dropped during filtering.
    Ignored {
        kind: String,
        schema: String,
        table: String,
    },
}

impl ChangeRecord {
    /// Returns `true` if this is an insert on `schema`.`table`, compared case-insensitively.
    pub fn is_insert_into(&self, schema: &str, table: &str) -> bool {
        match self {
            ChangeRecord::Insert {
                schema: record_schema,
                table: record_table,
                ..
            } => eq_ignore_case(record_schema, schema) && eq_ignore_case(record_table, table),
            ChangeRecord::Ignored { .. } => false,
        }
    }
}

/// Wire shape of a change record before it is classified.
#[derive(Debug, Deserialize)]
struct RawChangeRecord {
    kind: String,
    #[serde(default)]
    schema: Option<String>,
    #[serde(default)]
    table: Option<String>,
    #[serde(default, rename = "columnnames")]
    column_names: Option<Vec<String>>,
    #[serde(default, rename = "columnvalues")]
    column_values: Option<Vec<Value>>,
}

impl TryFrom<RawChangeRecord> for ChangeRecord {
    type Error = String;

    fn try_from(raw: RawChangeRecord) -> Result<Self, Self::Error> {
        if !eq_ignore_case(&raw.kind, INSERT_KIND) {
            // Records such as `message` carry neither schema nor table.
            return Ok(ChangeRecord::Ignored {
                kind: raw.kind,
                schema: raw.schema.unwrap_or_default(),
                table: raw.table.unwrap_or_default(),
            });
        }

        Ok(ChangeRecord::Insert {
            schema: raw.schema.ok_or("insert record is missing field `schema`")?,
            table: raw.table.ok_or("insert record is missing field `table`")?,
            column_names: raw
                .column_names
                .ok_or("insert record is missing field `columnnames`")?,
            column_values: raw
                .column_values
                .ok_or("insert record is missing field `columnvalues`")?,
        })
    }
}

impl Envelope {
    /// Decodes an envelope from the raw payload of a replication message.
    ///
    /// Fails with [`ErrorKind::MalformedEnvelope`] if the payload is not valid JSON, misses
    /// `xid` or `change`, has fields of the wrong type or contains an incomplete insert record.
    pub fn decode(bytes: &[u8]) -> CdcResult<Envelope> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Returns the rows inserted into `schema`.`table` by this envelope.
    ///
    /// Rows are returned in the order their records appear in the envelope. Names and values
    /// are paired positionally; a length mismatch fails with [`ErrorKind::MalformedEnvelope`].
    pub fn extract_rows(&self, schema: &str, table: &str) -> CdcResult<Vec<Row>> {
        let mut rows = Vec::new();

        for change in &self.changes {
            if !change.is_insert_into(schema, table) {
                continue;
            }

            let ChangeRecord::Insert {
                column_names,
                column_values,
                ..
            } = change
            else {
                continue;
            };

            if column_names.len() != column_values.len() {
                bail!(
                    ErrorKind::MalformedEnvelope,
                    "Insert record has mismatched column names and values",
                    format!(
                        "transaction {} inserted into {schema}.{table} with {} column names and {} column values",
                        self.xid,
                        column_names.len(),
                        column_values.len()
                    )
                );
            }

            let row = column_names
                .iter()
                .cloned()
                .zip(column_values.iter().cloned())
                .collect();
            rows.push(row);
        }

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn orders_envelope() -> Vec<u8> {
        br#"{"xid":1,"change":[{"kind":"insert","schema":"public","table":"orders","columnnames":["id"],"columntypes":["integer"],"columnvalues":[7]}]}"#.to_vec()
    }

    #[test]
    fn test_insert_matching_filter_yields_row() {
        let envelope = Envelope::decode(&orders_envelope()).unwrap();
        let rows = envelope.extract_rows("public", "orders").unwrap();

        assert_eq!(envelope.xid, 1);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0], [("id", json!(7))].into_iter().collect());
    }

    #[test]
    fn test_insert_not_matching_filter_yields_nothing() {
        let envelope = Envelope::decode(&orders_envelope()).unwrap();

        assert!(envelope.extract_rows("public", "customers").unwrap().is_empty());
        assert!(envelope.extract_rows("audit", "orders").unwrap().is_empty());
    }

    #[test]
    fn test_filter_is_case_insensitive() {
        let payload = br#"{"xid":2,"change":[{"kind":"INSERT","schema":"Public","table":"ORDERS","columnnames":["id"],"columnvalues":[1]}]}"#;
        let envelope = Envelope::decode(payload).unwrap();

        assert_eq!(envelope.extract_rows("public", "orders").unwrap().len(), 1);

        // Byte string literals are ASCII only.
        let payload = r#"{"xid":2,"change":[{"kind":"insert","schema":"public","table":"événements","columnnames":["id"],"columnvalues":[1]}]}"#;
        let envelope = Envelope::decode(payload.as_bytes()).unwrap();

        assert_eq!(envelope.extract_rows("PUBLIC", "ÉVÉNEMENTS").unwrap().len(), 1);
        assert!(envelope.extract_rows("public", "evenements").unwrap().is_empty());
    }

    #[test]
    fn test_large_numeric_values_keep_full_precision() {
        let payload = br#"{"xid":9,"change":[{"kind":"insert","schema":"public","table":"ledger","columnnames":["amount","rate"],"columntypes":["numeric","numeric"],"columnvalues":[123456789012345678901234567890,0.100000000000000000000000000001]}]}"#;
        let envelope = Envelope::decode(payload).unwrap();
        let rows = envelope.extract_rows("public", "ledger").unwrap();

        assert_eq!(
            serde_json::to_string(&rows[0]).unwrap(),
            r#"{"amount":123456789012345678901234567890,"rate":0.100000000000000000000000000001}"#
        );
    }

    #[test]
    fn test_projection_pairs_names_and_values() {
        let payload = br#"{"xid":3,"change":[{"kind":"insert","schema":"public","table":"orders","columnnames":["id","name"],"columnvalues":[1,"a"]}]}"#;
        let envelope = Envelope::decode(payload).unwrap();
        let rows = envelope.extract_rows("public", "orders").unwrap();

        let expected: Row = [("id", json!(1)), ("name", json!("a"))].into_iter().collect();
        assert_eq!(rows, vec![expected]);
    }

    #[test]
    fn test_update_and_delete_are_ignored() {
        let payload = br#"{"xid":4,"change":[
            {"kind":"update","schema":"public","table":"orders","columnnames":["id"],"columnvalues":[1],"oldkeys":{"keynames":["id"],"keytypes":["integer"],"keyvalues":[1]}},
            {"kind":"delete","schema":"public","table":"orders","oldkeys":{"keynames":["id"],"keytypes":["integer"],"keyvalues":[1]}}
        ]}"#;
        let envelope = Envelope::decode(payload).unwrap();

        assert!(matches!(
            &envelope.changes[0],
            ChangeRecord::Ignored { kind, .. } if kind == "update"
        ));
        assert!(matches!(
            &envelope.changes[1],
            ChangeRecord::Ignored { kind, .. } if kind == "delete"
        ));
        assert!(envelope.extract_rows("public", "orders").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_kind_without_schema_decodes_as_ignored() {
        let payload = br#"{"xid":5,"change":[{"kind":"message","transactional":true,"prefix":"p","content":"c"}]}"#;
        let envelope = Envelope::decode(payload).unwrap();

        assert_eq!(
            envelope.changes,
            vec![ChangeRecord::Ignored {
                kind: "message".to_string(),
                schema: String::new(),
                table: String::new(),
            }]
        );
    }

    #[test]
    fn test_rows_keep_envelope_order_and_skip_other_tables() {
        let payload = br#"{"xid":6,"change":[
            {"kind":"insert","schema":"public","table":"orders","columnnames":["id"],"columnvalues":[1]},
            {"kind":"insert","schema":"public","table":"customers","columnnames":["id"],"columnvalues":[100]},
            {"kind":"delete","schema":"public","table":"orders"},
            {"kind":"insert","schema":"public","table":"orders","columnnames":["id"],"columnvalues":[2]}
        ]}"#;
        let envelope = Envelope::decode(payload).unwrap();
        let rows = envelope.extract_rows("public", "orders").unwrap();

        let ids: Vec<_> = rows.iter().map(|row| row.get("id").cloned()).collect();
        assert_eq!(ids, vec![Some(json!(1)), Some(json!(2))]);
    }

    #[test]
    fn test_empty_change_list_is_valid() {
        let envelope = Envelope::decode(br#"{"xid":7,"change":[]}"#).unwrap();

        assert!(envelope.changes.is_empty());
        assert!(envelope.extract_rows("public", "orders").unwrap().is_empty());
    }

    #[test]
    fn test_missing_required_fields_are_malformed() {
        let payloads: [&[u8]; 5] = [
            br#"{"change":[]}"#,
            br#"{"xid":1}"#,
            br#"{"xid":"one","change":[]}"#,
            br#"{"xid":1,"change":[{"schema":"public","table":"orders"}]}"#,
            br#"{"xid":1,"change":[{"kind":"insert","schema":"public","table":"orders","columnnames":["id"]}]}"#,
        ];

        for payload in payloads {
            let err = Envelope::decode(payload).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::MalformedEnvelope);
        }
    }

    #[test]
    fn test_invalid_json_is_malformed() {
        let err = Envelope::decode(b"not json").unwrap_err();

        assert_eq!(err.kind(), ErrorKind::MalformedEnvelope);
    }

    #[test]
    fn test_column_length_mismatch_is_malformed() {
        let payload = br#"{"xid":8,"change":[{"kind":"insert","schema":"public","table":"orders","columnnames":["id","name"],"columnvalues":[1]}]}"#;
        let envelope = Envelope::decode(payload).unwrap();

        let err = envelope.extract_rows("public", "orders").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedEnvelope);

        // A mismatch on a table that is filtered out does not matter.
        assert!(envelope.extract_rows("public", "customers").unwrap().is_empty());
    }
}
