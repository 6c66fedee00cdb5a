use serde_json::json;

use crate::types::Row;

/// Builds a wal2json insert record into `public`.`table` with `id` and `name` columns.
pub fn insert_record(table: &str, id: i64, name: &str) -> String {
    json!({
        "kind": "insert",
        "schema": "public",
        "table": table,
        "columnnames": ["id", "name"],
        "columntypes": ["integer", "text"],
        "columnvalues": [id, name],
    })
    .to_string()
}

/// Builds a wal2json update record on `public`.`table`.
pub fn update_record(table: &str, id: i64, name: &str) -> String {
    json!({
        "kind": "update",
        "schema": "public",
        "table": table,
        "columnnames": ["id", "name"],
        "columntypes": ["integer", "text"],
        "columnvalues": [id, name],
        "oldkeys": {"keynames": ["id"], "keytypes": ["integer"], "keyvalues": [id]},
    })
    .to_string()
}

/// Builds an envelope of transaction `xid` containing `records`.
pub fn envelope(xid: u64, records: &[String]) -> String {
    format!(r#"{{"xid":{xid},"change":[{}]}}"#, records.join(","))
}

/// The row extracted from `insert_record(_, id, name)`.
pub fn row(id: i64, name: &str) -> Row {
    [("id", json!(id)), ("name", json!(name))].into_iter().collect()
}
