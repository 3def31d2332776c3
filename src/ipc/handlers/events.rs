use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::reconcile;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::BTreeSet;
use uuid::Uuid;

pub const EVENT_TYPES: [&str; 4] = ["MIDWEEK", "SUNDAY", "PRAYER", "SPECIAL"];

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn db_err(e: rusqlite::Error) -> HandlerErr {
    HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

fn parse_event_type(raw: &str) -> Result<String, HandlerErr> {
    let upper = raw.trim().to_ascii_uppercase();
    if EVENT_TYPES.contains(&upper.as_str()) {
        Ok(upper)
    } else {
        Err(HandlerErr {
            code: "bad_params",
            message: "eventType must be one of: MIDWEEK, SUNDAY, PRAYER, SPECIAL".to_string(),
            details: Some(json!({ "eventType": raw })),
        })
    }
}

fn parse_event_date(raw: &str) -> Result<String, HandlerErr> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map(|d| d.format("%Y-%m-%d").to_string())
        .map_err(|_| HandlerErr {
            code: "bad_params",
            message: "eventDate must be YYYY-MM-DD".to_string(),
            details: Some(json!({ "eventDate": raw })),
        })
}

fn optional_text(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn events_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let type_filter = match params.get("eventType").and_then(|v| v.as_str()) {
        Some(raw) => Some(parse_event_type(raw)?),
        None => None,
    };

    let mut sql = String::from(
        "SELECT
           e.id, e.name, e.event_type, e.event_date,
           e.description, e.preparations, e.feedback,
           (SELECT COUNT(*) FROM attendance a
             WHERE a.event_id = e.id AND a.status = 'PRESENT') AS present_count
         FROM events e",
    );
    if type_filter.is_some() {
        sql.push_str(" WHERE e.event_type = ?");
    }
    sql.push_str(" ORDER BY e.event_date DESC, e.name");

    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<serde_json::Value> {
        Ok(json!({
            "id": row.get::<_, String>(0)?,
            "name": row.get::<_, String>(1)?,
            "eventType": row.get::<_, String>(2)?,
            "eventDate": row.get::<_, String>(3)?,
            "description": row.get::<_, Option<String>>(4)?,
            "preparations": row.get::<_, Option<String>>(5)?,
            "feedback": row.get::<_, Option<String>>(6)?,
            "presentCount": row.get::<_, i64>(7)?,
        }))
    };
    let rows = match type_filter.as_deref() {
        Some(t) => stmt
            .query_map([t], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
        None => stmt
            .query_map([], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
    }
    .map_err(db_err)?;

    Ok(json!({ "events": rows }))
}

fn events_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let name = name.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "name must not be empty".to_string(),
            details: None,
        });
    }
    let event_type = parse_event_type(&get_required_str(params, "eventType")?)?;
    let event_date = parse_event_date(&get_required_str(params, "eventDate")?)?;
    let description = optional_text(params, "description");
    let preparations = optional_text(params, "preparations");
    let feedback = optional_text(params, "feedback");

    let event_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO events(id, name, event_type, event_date, description, preparations, feedback)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &event_id,
            &name,
            &event_type,
            &event_date,
            &description,
            &preparations,
            &feedback,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "events" })),
    })?;

    Ok(json!({ "eventId": event_id }))
}

fn events_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let event_id = get_required_str(params, "eventId")?;

    let existing = conn
        .query_row(
            "SELECT name, event_type, event_date, description, preparations, feedback
             FROM events WHERE id = ?",
            [&event_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    r.get::<_, Option<String>>(4)?,
                    r.get::<_, Option<String>>(5)?,
                ))
            },
        )
        .optional()
        .map_err(db_err)?;
    let Some((name, event_type, event_date, description, preparations, feedback)) = existing
    else {
        return Err(HandlerErr {
            code: "not_found",
            message: "event not found".to_string(),
            details: Some(json!({ "eventId": event_id })),
        });
    };

    let name = match params.get("name").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        Some(_) => {
            return Err(HandlerErr {
                code: "bad_params",
                message: "name must not be empty".to_string(),
                details: None,
            })
        }
        None => name,
    };
    let event_type = match params.get("eventType").and_then(|v| v.as_str()) {
        Some(raw) => parse_event_type(raw)?,
        None => event_type,
    };
    let date_changed = params.get("eventDate").is_some();
    let event_date = match params.get("eventDate").and_then(|v| v.as_str()) {
        Some(raw) => parse_event_date(raw)?,
        None => event_date,
    };
    let patch_text = |key: &str, current: Option<String>| -> Option<String> {
        match params.get(key) {
            None => current,
            Some(v) if v.is_null() => None,
            Some(v) => v.as_str().map(|s| s.to_string()).or(current),
        }
    };
    let description = patch_text("description", description);
    let preparations = patch_text("preparations", preparations);
    let feedback = patch_text("feedback", feedback);

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;

    tx.execute(
        "UPDATE events
         SET name = ?, event_type = ?, event_date = ?,
             description = ?, preparations = ?, feedback = ?
         WHERE id = ?",
        (
            &name,
            &event_type,
            &event_date,
            &description,
            &preparations,
            &feedback,
            &event_id,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "events" })),
    })?;

    // Attendance rows carry the event's date; keep them in step.
    if date_changed {
        tx.execute(
            "UPDATE attendance SET created_at = ? WHERE event_id = ?",
            (&event_date, &event_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "attendance" })),
        })?;
    }

    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "eventId": event_id }))
}

fn events_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let event_id = get_required_str(params, "eventId")?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM events WHERE id = ?", [&event_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(db_err)?;
    if exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "event not found".to_string(),
            details: Some(json!({ "eventId": event_id })),
        });
    }

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;

    // Attendance rows go first (no ON DELETE CASCADE), and the members who
    // lose PRESENT rows here must be recounted.
    let mut stmt = tx
        .prepare("SELECT member_id FROM attendance WHERE event_id = ?")
        .map_err(db_err)?;
    let affected: BTreeSet<String> = stmt
        .query_map([&event_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<BTreeSet<_>, _>>())
        .map_err(db_err)?;
    drop(stmt);

    tx.execute("DELETE FROM attendance WHERE event_id = ?", [&event_id])
        .map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "attendance" })),
        })?;

    tx.execute("DELETE FROM events WHERE id = ?", [&event_id])
        .map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "events" })),
        })?;

    reconcile::reconcile_members(&tx, affected.iter().map(|s| s.as_str())).map_err(|e| {
        HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "members" })),
        }
    })?;

    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "ok": true, "reconciledMembers": affected.len() }))
}

fn with_conn(
    state: &AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "events.list" => Some(with_conn(state, req, events_list)),
        "events.create" => Some(with_conn(state, req, events_create)),
        "events.update" => Some(with_conn(state, req, events_update)),
        "events.delete" => Some(with_conn(state, req, events_delete)),
        _ => None,
    }
}
