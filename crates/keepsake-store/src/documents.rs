//! Document CRUD, batches and range queries against the SQL schema.
//!
//! All mutations go through [`Database::apply_batch`], which wraps the whole
//! batch in one transaction: every precondition (`Create` conflict checks,
//! `must_exist` deletes, field transitions) either holds or the batch rolls
//! back untouched. The return value counts rows actually changed so the
//! store task can skip subscription fan-out for no-op batches.

use chrono::{DateTime, Utc};
use keepsake_shared::timestamps;
use rusqlite::{params, params_from_iter, OptionalExtension, Transaction};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::ops::{DocPath, Filter, OrderBy, Query, WriteOp};

/// A stored document: path, JSON payload, store-assigned creation time.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub path: DocPath,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

impl Document {
    /// Deserialize the payload into a typed record.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// The final path segment.
    pub fn id(&self) -> &str {
        self.path.id()
    }
}

impl Database {
    /// Point read. Absence is `Ok(None)`, not an error.
    pub fn get_document(&self, path: &DocPath) -> Result<Option<Document>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT path, data, created_at FROM documents WHERE path = ?1")?;

        let mut rows = stmt.query_map(params![path.as_str()], row_to_raw)?;
        match rows.next() {
            Some(row) => Ok(Some(raw_to_document(row?)?)),
            None => Ok(None),
        }
    }

    /// Apply a batch of writes atomically. Returns the number of rows that
    /// actually changed (idempotent re-applications count zero).
    pub fn apply_batch(&mut self, ops: &[WriteOp], now: DateTime<Utc>) -> Result<usize> {
        let tx = self.conn_mut().transaction()?;
        let mut changed = 0usize;

        for op in ops {
            changed += apply_op(&tx, op, now)?;
        }

        tx.commit()?;
        Ok(changed)
    }

    /// Run an ordered range query over one collection.
    pub fn run_query(&self, query: &Query) -> Result<Vec<Document>> {
        query.validate()?;

        let mut sql = String::from(
            "SELECT path, data, created_at FROM documents WHERE collection = ?1",
        );
        let mut sql_params: Vec<rusqlite::types::Value> =
            vec![query.collection_path().to_string().into()];

        for filter in &query.filters {
            match filter {
                Filter::Eq(field, value) => {
                    sql.push_str(&format!(" AND json_extract(data, '$.{field}') = ?"));
                    sql_params.push(json_to_sql(value));
                }
                Filter::In(field, values) => {
                    if values.is_empty() {
                        // Nothing can match an empty membership set.
                        return Ok(Vec::new());
                    }
                    let placeholders = vec!["?"; values.len()].join(", ");
                    sql.push_str(&format!(
                        " AND json_extract(data, '$.{field}') IN ({placeholders})"
                    ));
                    sql_params.extend(values.iter().map(json_to_sql));
                }
                Filter::Le(field, value) => {
                    sql.push_str(&format!(" AND json_extract(data, '$.{field}') <= ?"));
                    sql_params.push(json_to_sql(value));
                }
                Filter::Ge(field, value) => {
                    sql.push_str(&format!(" AND json_extract(data, '$.{field}') >= ?"));
                    sql_params.push(json_to_sql(value));
                }
            }
        }

        match &query.order {
            OrderBy::CreatedAtDesc => sql.push_str(" ORDER BY created_at DESC, path ASC"),
            OrderBy::CreatedAtAsc => sql.push_str(" ORDER BY created_at ASC, path ASC"),
            OrderBy::FieldDesc(field) => sql.push_str(&format!(
                " ORDER BY json_extract(data, '$.{field}') DESC, path ASC"
            )),
            OrderBy::FieldAsc(field) => sql.push_str(&format!(
                " ORDER BY json_extract(data, '$.{field}') ASC, path ASC"
            )),
        }

        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(sql_params), row_to_raw)?;

        let mut documents = Vec::new();
        for row in rows {
            documents.push(raw_to_document(row?)?);
        }
        Ok(documents)
    }
}

fn apply_op(tx: &Transaction<'_>, op: &WriteOp, now: DateTime<Utc>) -> Result<usize> {
    match op {
        WriteOp::Create { path, data } => {
            let exists = tx
                .query_row(
                    "SELECT 1 FROM documents WHERE path = ?1",
                    params![path.as_str()],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if exists {
                return Err(StoreError::Conflict(format!(
                    "document already exists: {path}"
                )));
            }

            let ts = timestamp_value(now);
            let data = with_created_at(data, &ts)?;
            tx.execute(
                "INSERT INTO documents (path, collection, data, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![path.as_str(), path.collection(), data.to_string(), ts],
            )?;
            Ok(1)
        }

        WriteOp::Set { path, data } => {
            let existing_ts: Option<String> = tx
                .query_row(
                    "SELECT created_at FROM documents WHERE path = ?1",
                    params![path.as_str()],
                    |row| row.get(0),
                )
                .optional()?;

            let ts = existing_ts.unwrap_or_else(|| timestamp_value(now));
            let data = with_created_at(data, &ts)?;
            tx.execute(
                "INSERT INTO documents (path, collection, data, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(path) DO UPDATE SET data = excluded.data",
                params![path.as_str(), path.collection(), data.to_string(), ts],
            )?;
            Ok(1)
        }

        WriteOp::Update { path, fields } => {
            let current = fetch_data(tx, path)?.ok_or_else(|| {
                StoreError::NotFound(path.as_str().to_string())
            })?;
            let mut merged = match current {
                Value::Object(map) => map,
                _ => {
                    return Err(StoreError::InvalidDocument(format!(
                        "stored payload at {path} is not an object"
                    )))
                }
            };
            for (k, v) in fields {
                merged.insert(k.clone(), v.clone());
            }
            tx.execute(
                "UPDATE documents SET data = ?1 WHERE path = ?2",
                params![Value::Object(merged).to_string(), path.as_str()],
            )?;
            Ok(1)
        }

        WriteOp::Delete { path, must_exist } => {
            let affected = tx.execute(
                "DELETE FROM documents WHERE path = ?1",
                params![path.as_str()],
            )?;
            if affected == 0 && *must_exist {
                return Err(StoreError::NotFound(path.as_str().to_string()));
            }
            Ok(affected)
        }

        WriteOp::FieldTransition {
            path,
            field,
            from,
            to,
        } => {
            crate::ops::validate_field_name(field)?;
            let current = fetch_data(tx, path)?.ok_or_else(|| {
                StoreError::NotFound(path.as_str().to_string())
            })?;
            let current_value = current.get(field).cloned().unwrap_or(Value::Null);

            if current_value == *to {
                // Already applied; idempotent no-op.
                return Ok(0);
            }
            if current_value != *from {
                return Err(StoreError::Conflict(format!(
                    "field '{field}' at {path} is neither the expected source nor target value"
                )));
            }

            let mut map = match current {
                Value::Object(map) => map,
                _ => {
                    return Err(StoreError::InvalidDocument(format!(
                        "stored payload at {path} is not an object"
                    )))
                }
            };
            map.insert(field.clone(), to.clone());
            tx.execute(
                "UPDATE documents SET data = ?1 WHERE path = ?2",
                params![Value::Object(map).to_string(), path.as_str()],
            )?;
            Ok(1)
        }
    }
}

fn fetch_data(tx: &Transaction<'_>, path: &DocPath) -> Result<Option<Value>> {
    let raw: Option<String> = tx
        .query_row(
            "SELECT data FROM documents WHERE path = ?1",
            params![path.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

/// Store-assigned timestamps use the same fixed-precision RFC-3339
/// rendering as serde'd model fields so string comparisons stay
/// chronological across instants in the same second.
fn timestamp_value(now: DateTime<Utc>) -> String {
    timestamps::canonical(&now)
}

fn with_created_at(data: &Value, ts: &str) -> Result<Value> {
    let mut map = match data {
        Value::Object(map) => map.clone(),
        _ => {
            return Err(StoreError::InvalidDocument(
                "payload must be a JSON object".to_string(),
            ))
        }
    };
    map.insert("createdAt".to_string(), Value::String(ts.to_string()));
    Ok(Value::Object(map))
}

fn json_to_sql(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Sql::Integer(i),
            None => Sql::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => Sql::Text(s.clone()),
        other => Sql::Text(other.to_string()),
    }
}

type RawRow = (String, String, String);

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

fn raw_to_document((path, data, created_at): RawRow) -> Result<Document> {
    let path = DocPath::new(path)?;
    let data: Value = serde_json::from_str(&data)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map(|dt| dt.with_timezone(&Utc))?;
    Ok(Document {
        path,
        data,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{Filter, OrderBy, Query};
    use serde_json::json;

    fn db() -> Database {
        Database::in_memory().unwrap()
    }

    fn create(path: &str, data: Value) -> WriteOp {
        WriteOp::Create {
            path: DocPath::new(path).unwrap(),
            data,
        }
    }

    #[test]
    fn create_then_get_round_trip() {
        let mut db = db();
        let now = Utc::now();
        db.apply_batch(&[create("users/alice", json!({"email": "a@x.com"}))], now)
            .unwrap();

        let doc = db
            .get_document(&DocPath::new("users/alice").unwrap())
            .unwrap()
            .expect("present");
        assert_eq!(doc.data["email"], "a@x.com");
        // The store assigned creation metadata in both column and payload.
        assert!(doc.data.get("createdAt").is_some());
    }

    #[test]
    fn create_conflicts_on_existing_path() {
        let mut db = db();
        let now = Utc::now();
        db.apply_batch(&[create("users/alice", json!({}))], now)
            .unwrap();
        let err = db
            .apply_batch(&[create("users/alice", json!({}))], now)
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn failed_precondition_rolls_back_whole_batch() {
        let mut db = db();
        let now = Utc::now();
        let ops = [
            create("users/a/connections/b", json!({})),
            WriteOp::Delete {
                path: DocPath::new("users/a/incomingFriendRequests/b").unwrap(),
                must_exist: true,
            },
        ];
        let err = db.apply_batch(&ops, now).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        // The create in the same batch must not have survived.
        assert!(db
            .get_document(&DocPath::new("users/a/connections/b").unwrap())
            .unwrap()
            .is_none());
    }

    #[test]
    fn field_transition_is_idempotent() {
        let mut db = db();
        let now = Utc::now();
        db.apply_batch(&[create("timeCapsules/c1", json!({"isDelivered": false}))], now)
            .unwrap();

        let transition = WriteOp::FieldTransition {
            path: DocPath::new("timeCapsules/c1").unwrap(),
            field: "isDelivered".into(),
            from: json!(false),
            to: json!(true),
        };

        let changed = db.apply_batch(&[transition.clone()], now).unwrap();
        assert_eq!(changed, 1);

        // Re-applying observes the target value and writes nothing.
        let changed = db.apply_batch(&[transition], now).unwrap();
        assert_eq!(changed, 0);
    }

    #[test]
    fn field_transition_rejects_unexpected_value() {
        let mut db = db();
        let now = Utc::now();
        db.apply_batch(&[create("timeCapsules/c1", json!({"isDelivered": "odd"}))], now)
            .unwrap();

        let err = db
            .apply_batch(
                &[WriteOp::FieldTransition {
                    path: DocPath::new("timeCapsules/c1").unwrap(),
                    field: "isDelivered".into(),
                    from: json!(false),
                    to: json!(true),
                }],
                now,
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn update_merges_fields() {
        let mut db = db();
        let now = Utc::now();
        db.apply_batch(
            &[create("journalEntries/e1", json!({"content": "old", "mood": 3}))],
            now,
        )
        .unwrap();

        let mut fields = serde_json::Map::new();
        fields.insert("content".into(), json!("new"));
        db.apply_batch(
            &[WriteOp::Update {
                path: DocPath::new("journalEntries/e1").unwrap(),
                fields,
            }],
            now,
        )
        .unwrap();

        let doc = db
            .get_document(&DocPath::new("journalEntries/e1").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(doc.data["content"], "new");
        assert_eq!(doc.data["mood"], 3);
    }

    #[test]
    fn query_filters_and_orders() {
        let mut db = db();
        let base = Utc::now();
        for (i, vis) in ["public", "private", "public"].iter().enumerate() {
            db.apply_batch(
                &[create(
                    &format!("journalEntries/e{i}"),
                    json!({"visibility": vis, "userId": "u1"}),
                )],
                base + chrono::Duration::seconds(i as i64),
            )
            .unwrap();
        }

        let q = Query::collection("journalEntries")
            .filter(Filter::Eq("visibility".into(), json!("public")))
            .order(OrderBy::CreatedAtDesc);
        let docs = db.run_query(&q).unwrap();
        assert_eq!(docs.len(), 2);
        // Newest first.
        assert_eq!(docs[0].id(), "e2");
        assert_eq!(docs[1].id(), "e0");
    }

    #[test]
    fn query_in_filter_and_limit() {
        let mut db = db();
        let base = Utc::now();
        for i in 0..5 {
            db.apply_batch(
                &[create(
                    &format!("journalEntries/e{i}"),
                    json!({"userId": format!("u{i}")}),
                )],
                base + chrono::Duration::seconds(i),
            )
            .unwrap();
        }

        let q = Query::collection("journalEntries")
            .filter(Filter::In(
                "userId".into(),
                vec![json!("u1"), json!("u3"), json!("u4")],
            ))
            .limit(2);
        let docs = db.run_query(&q).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].id(), "e4");
        assert_eq!(docs[1].id(), "e3");
    }

    #[test]
    fn query_range_on_json_field() {
        let mut db = db();
        let now = Utc::now();
        let past = now - chrono::Duration::hours(2);
        let future = now + chrono::Duration::hours(2);

        db.apply_batch(
            &[
                create(
                    "timeCapsules/past",
                    json!({"deliveryDate": timestamps::canonical(&past)}),
                ),
                create(
                    "timeCapsules/future",
                    json!({"deliveryDate": timestamps::canonical(&future)}),
                ),
            ],
            now,
        )
        .unwrap();

        let q = Query::collection("timeCapsules")
            .filter(Filter::Le(
                "deliveryDate".into(),
                json!(timestamps::canonical(&now)),
            ))
            .order(OrderBy::FieldDesc("deliveryDate".into()));
        let docs = db.run_query(&q).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id(), "past");
    }

    #[test]
    fn range_filter_is_stable_across_subsecond_precision() {
        use chrono::TimeZone;

        let mut db = db();
        let second = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        db.apply_batch(
            &[create(
                "timeCapsules/c1",
                json!({"deliveryDate": timestamps::canonical(&second)}),
            )],
            second,
        )
        .unwrap();

        // A whole-second deadline must already satisfy `<=` at any
        // fractional instant inside that second.
        let cutoff = second + chrono::Duration::milliseconds(250);
        let q = Query::collection("timeCapsules").filter(Filter::Le(
            "deliveryDate".into(),
            json!(timestamps::canonical(&cutoff)),
        ));
        assert_eq!(db.run_query(&q).unwrap().len(), 1);
    }

    #[test]
    fn set_upserts_and_keeps_original_creation_time() {
        let mut db = db();
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::hours(1);

        let path = DocPath::new("users/alice").unwrap();
        db.apply_batch(&[create("users/alice", json!({"email": "old@x.com"}))], t1)
            .unwrap();
        let before = db.get_document(&path).unwrap().unwrap();

        db.apply_batch(
            &[WriteOp::Set {
                path: path.clone(),
                data: json!({"email": "new@x.com"}),
            }],
            t2,
        )
        .unwrap();

        let doc = db.get_document(&path).unwrap().unwrap();
        assert_eq!(doc.data["email"], "new@x.com");
        assert_eq!(doc.created_at, before.created_at);

        // On a fresh path, Set behaves like a plain insert.
        db.apply_batch(
            &[WriteOp::Set {
                path: DocPath::new("users/bob").unwrap(),
                data: json!({"email": "b@x.com"}),
            }],
            t2,
        )
        .unwrap();
        let doc = db
            .get_document(&DocPath::new("users/bob").unwrap())
            .unwrap()
            .unwrap();
        assert!(doc.data.get("createdAt").is_some());
    }

    #[test]
    fn ge_filter_and_ascending_orders() {
        let mut db = db();
        let base = Utc::now();
        for i in 0..4 {
            db.apply_batch(
                &[create(&format!("journalEntries/e{i}"), json!({"mood": i}))],
                base + chrono::Duration::seconds(i),
            )
            .unwrap();
        }

        let q = Query::collection("journalEntries")
            .filter(Filter::Ge("mood".into(), json!(2)));
        let docs = db.run_query(&q).unwrap();
        assert_eq!(docs.len(), 2);

        let q = Query::collection("journalEntries").order(OrderBy::CreatedAtAsc);
        let docs = db.run_query(&q).unwrap();
        assert_eq!(docs[0].id(), "e0");
        assert_eq!(docs[3].id(), "e3");

        let q = Query::collection("journalEntries").order(OrderBy::FieldAsc("mood".into()));
        let docs = db.run_query(&q).unwrap();
        assert_eq!(docs[0].data["mood"], 0);
        assert_eq!(docs[3].data["mood"], 3);
    }
}
