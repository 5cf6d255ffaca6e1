//! Typed decoding of JSON backend payloads.
//!
//! Backends that speak JSON (an IPC bridge, a remote agent) decode their
//! replies here. Shapes are checked strictly: unknown fields, missing fields
//! and rows that do not line up with their columns are all rejected.

use serde::de::DeserializeOwned;

use crate::error::{DbmxError, DbmxResult};
use crate::models::{QueryResult, SchemaPayload, TableInfo};

fn decode<T: DeserializeOwned>(kind: &str, payload: &str) -> DbmxResult<T> {
    serde_json::from_str(payload).map_err(|e| {
        tracing::warn!(kind, error = %e, "Rejected malformed payload");
        DbmxError::internal(format!("Malformed {kind} payload: {e}"))
    })
}

fn check(kind: &str, result: Result<(), String>) -> DbmxResult<()> {
    result.map_err(|message| DbmxError::internal(format!("Malformed {kind} payload: {message}")))
}

/// Decode a database list.
pub fn decode_database_list(payload: &str) -> DbmxResult<Vec<String>> {
    decode("database list", payload)
}

/// Decode a schema load reply.
pub fn decode_schema(payload: &str) -> DbmxResult<SchemaPayload> {
    let schema: SchemaPayload = decode("schema", payload)?;
    check("schema", schema.validate())?;
    Ok(schema)
}

/// Decode a table details reply.
pub fn decode_table_info(payload: &str) -> DbmxResult<TableInfo> {
    let info: TableInfo = decode("table info", payload)?;
    check("table info", info.validate())?;
    Ok(info)
}

/// Decode a query reply.
pub fn decode_query_result(payload: &str) -> DbmxResult<QueryResult> {
    let result: QueryResult = decode("query result", payload)?;
    check("query result", result.validate())?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Cell;

    #[test]
    fn test_decode_query_result() {
        let payload = r#"{
            "ok": true,
            "columns": ["?column?"],
            "rows": [[{"column": "?column?", "value": "1"}]],
            "rowsAffected": 0,
            "message": ""
        }"#;
        let result = decode_query_result(payload).unwrap();
        assert_eq!(result.rows, vec![vec![Cell::new("?column?", "1")]]);
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let payload = r#"{"ok": true, "columns": [], "rows": [], "rowsAffected": 0, "message": "", "extra": 1}"#;
        let err = decode_query_result(payload).unwrap_err();
        assert!(err.to_string().contains("Malformed query result payload"));
    }

    #[test]
    fn test_missing_field_is_rejected() {
        assert!(decode_query_result(r#"{"ok": true, "columns": []}"#).is_err());
    }

    #[test]
    fn test_misaligned_rows_are_rejected() {
        let payload = r#"{
            "ok": true,
            "columns": ["a"],
            "rows": [[{"column": "b", "value": "1"}]],
            "rowsAffected": 0,
            "message": ""
        }"#;
        assert!(decode_query_result(payload).is_err());
    }

    #[test]
    fn test_decode_schema_requires_pool_id() {
        let empty = r#"{"columns": [], "rows": []}"#;
        let payload = format!(
            r#"{{"poolId": "", "structure": {empty}, "indexes": {empty}, "rules": {empty}}}"#
        );
        assert!(decode_schema(&payload).is_err());

        let payload = payload.replace(r#""poolId": """#, r#""poolId": "p1""#);
        assert_eq!(decode_schema(&payload).unwrap().pool_id, "p1");
    }

    #[test]
    fn test_decode_database_list() {
        assert_eq!(decode_database_list(r#"["postgres", "template1"]"#).unwrap(), vec!["postgres", "template1"]);
        assert!(decode_database_list(r#"[1, 2]"#).is_err());
    }

    #[test]
    fn test_decode_table_info() {
        let payload = r#"{
            "structure": {"columns": ["column_name"], "rows": [[{"column": "column_name", "value": "id"}]]},
            "indexes": {"columns": [], "rows": []},
            "rules": {"columns": [], "rows": []}
        }"#;
        let info = decode_table_info(payload).unwrap();
        assert_eq!(info.structure.distinct_values("column_name"), vec!["id"]);
    }
}
