use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::reconcile::{self, STATUS_ABSENT, STATUS_PRESENT};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

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

fn parse_status(v: Option<&serde_json::Value>) -> Result<&'static str, HandlerErr> {
    match v.and_then(|v| v.as_str()) {
        None => Ok(STATUS_PRESENT),
        Some(s) if s.eq_ignore_ascii_case(STATUS_PRESENT) => Ok(STATUS_PRESENT),
        Some(s) if s.eq_ignore_ascii_case(STATUS_ABSENT) => Ok(STATUS_ABSENT),
        Some(other) => Err(HandlerErr {
            code: "bad_params",
            message: "status must be PRESENT or ABSENT".to_string(),
            details: Some(json!({ "status": other })),
        }),
    }
}

/// Event date doubles as the stamp on attendance rows: records are dated to
/// the event, not to when the roster was marked.
fn event_date(conn: &Connection, event_id: &str) -> Result<String, HandlerErr> {
    conn.query_row(
        "SELECT event_date FROM events WHERE id = ?",
        [event_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(db_err)?
    .ok_or_else(|| HandlerErr {
        code: "not_found",
        message: "event not found".to_string(),
        details: Some(json!({ "eventId": event_id })),
    })
}

fn member_exists(conn: &Connection, member_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM members WHERE id = ?", [member_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(db_err)
}

fn event_member_ids(conn: &Connection, event_id: &str) -> Result<Vec<String>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT member_id FROM attendance WHERE event_id = ?")
        .map_err(db_err)?;
    stmt.query_map([event_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)
}

fn attendance_event_open(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let event_id = get_required_str(params, "eventId")?;

    let event = conn
        .query_row(
            "SELECT id, name, event_type, event_date, description, preparations, feedback
             FROM events WHERE id = ?",
            [&event_id],
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "name": r.get::<_, String>(1)?,
                    "eventType": r.get::<_, String>(2)?,
                    "eventDate": r.get::<_, String>(3)?,
                    "description": r.get::<_, Option<String>>(4)?,
                    "preparations": r.get::<_, Option<String>>(5)?,
                    "feedback": r.get::<_, Option<String>>(6)?,
                }))
            },
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| HandlerErr {
            code: "not_found",
            message: "event not found".to_string(),
            details: Some(json!({ "eventId": event_id })),
        })?;

    let mut by_member: HashMap<String, (String, String)> = HashMap::new();
    let mut stmt = conn
        .prepare("SELECT id, member_id, status FROM attendance WHERE event_id = ?")
        .map_err(db_err)?;
    let rows = stmt
        .query_map([&event_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    for (id, member_id, status) in rows {
        by_member.insert(member_id, (id, status));
    }

    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name, is_active
             FROM members
             ORDER BY last_name, first_name",
        )
        .map_err(db_err)?;
    let members = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            let active: i64 = r.get(3)?;
            Ok((id, format!("{}, {}", last, first), active != 0))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let rows_json: Vec<serde_json::Value> = members
        .iter()
        .map(|(id, display_name, active)| {
            let (attendance_id, status) = match by_member.get(id) {
                Some((aid, st)) => (json!(aid), json!(st)),
                None => (serde_json::Value::Null, serde_json::Value::Null),
            };
            json!({
                "memberId": id,
                "displayName": display_name,
                "isActive": active,
                "attendanceId": attendance_id,
                "status": status,
            })
        })
        .collect();

    Ok(json!({ "event": event, "rows": rows_json }))
}

fn attendance_bulk_mark(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let event_id = get_required_str(params, "eventId")?;
    let date = event_date(conn, &event_id)?;

    let Some(entries) = params.get("attendances").and_then(|v| v.as_array()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing attendances".to_string(),
            details: None,
        });
    };

    // Last entry wins when a member id repeats in one payload.
    let mut roster: HashMap<String, &'static str> = HashMap::new();
    for entry in entries {
        let member_id = get_required_str(entry, "memberId")?;
        let status = parse_status(entry.get("status"))?;
        roster.insert(member_id, status);
    }

    for member_id in roster.keys() {
        if !member_exists(conn, member_id)? {
            return Err(HandlerErr {
                code: "not_found",
                message: "member not found".to_string(),
                details: Some(json!({ "memberId": member_id })),
            });
        }
    }

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;

    // Members dropped from the roster lose PRESENT rows and must be
    // recounted too, so reconcile the union of old and new.
    let mut affected: BTreeSet<String> = event_member_ids(&tx, &event_id)?.into_iter().collect();
    affected.extend(roster.keys().cloned());

    tx.execute("DELETE FROM attendance WHERE event_id = ?", [&event_id])
        .map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "attendance" })),
        })?;

    for (member_id, status) in &roster {
        tx.execute(
            "INSERT INTO attendance(id, event_id, member_id, status, created_at)
             VALUES(?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &event_id,
                member_id,
                status,
                &date,
            ),
        )
        .map_err(|e| HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "attendance" })),
        })?;
    }

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

    Ok(json!({
        "eventId": event_id,
        "marked": roster.len(),
        "reconciledMembers": affected.len(),
    }))
}

fn attendance_mark(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let event_id = get_required_str(params, "eventId")?;
    let member_id = get_required_str(params, "memberId")?;
    let status = parse_status(params.get("status"))?;
    let date = event_date(conn, &event_id)?;

    if !member_exists(conn, &member_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "member not found".to_string(),
            details: Some(json!({ "memberId": member_id })),
        });
    }

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;

    let attendance_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO attendance(id, event_id, member_id, status, created_at)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(event_id, member_id) DO UPDATE SET
           status = excluded.status,
           created_at = excluded.created_at",
        (&attendance_id, &event_id, &member_id, status, &date),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "attendance" })),
    })?;

    let active = reconcile::reconcile_member(&tx, &member_id).map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "members" })),
    })?;

    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    // The upsert may have kept the pre-existing row id; report the stored one.
    let stored_id: String = conn
        .query_row(
            "SELECT id FROM attendance WHERE event_id = ? AND member_id = ?",
            (&event_id, &member_id),
            |r| r.get(0),
        )
        .map_err(db_err)?;

    Ok(json!({
        "attendanceId": stored_id,
        "eventId": event_id,
        "memberId": member_id,
        "status": status,
        "memberIsActive": active,
    }))
}

fn attendance_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let attendance_id = get_required_str(params, "attendanceId")?;

    let existing = conn
        .query_row(
            "SELECT event_id, member_id, status FROM attendance WHERE id = ?",
            [&attendance_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                ))
            },
        )
        .optional()
        .map_err(db_err)?;
    let Some((old_event_id, old_member_id, old_status)) = existing else {
        return Err(HandlerErr {
            code: "not_found",
            message: "attendance record not found".to_string(),
            details: Some(json!({ "attendanceId": attendance_id })),
        });
    };

    let event_id = match params.get("eventId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => old_event_id.clone(),
    };
    let member_id = match params.get("memberId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => old_member_id.clone(),
    };
    let status = match params.get("status") {
        Some(_) => parse_status(params.get("status"))?.to_string(),
        None => old_status,
    };

    let date = event_date(conn, &event_id)?;
    if !member_exists(conn, &member_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "member not found".to_string(),
            details: Some(json!({ "memberId": member_id })),
        });
    }

    // Moving onto a (event, member) pair that already has its own record
    // would break the one-record-per-pair rule.
    let collision: Option<String> = conn
        .query_row(
            "SELECT id FROM attendance WHERE event_id = ? AND member_id = ? AND id <> ?",
            (&event_id, &member_id, &attendance_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    if collision.is_some() {
        return Err(HandlerErr {
            code: "conflict",
            message: "attendance already recorded for this member at this event".to_string(),
            details: Some(json!({ "eventId": event_id, "memberId": member_id })),
        });
    }

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;

    tx.execute(
        "UPDATE attendance SET event_id = ?, member_id = ?, status = ?, created_at = ?
         WHERE id = ?",
        (&event_id, &member_id, &status, &date, &attendance_id),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "attendance" })),
    })?;

    let mut affected: BTreeSet<&str> = BTreeSet::new();
    affected.insert(old_member_id.as_str());
    affected.insert(member_id.as_str());
    reconcile::reconcile_members(&tx, affected).map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "members" })),
    })?;

    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({
        "attendanceId": attendance_id,
        "eventId": event_id,
        "memberId": member_id,
        "status": status,
    }))
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
        "attendance.eventOpen" => Some(with_conn(state, req, attendance_event_open)),
        "attendance.bulkMark" => Some(with_conn(state, req, attendance_bulk_mark)),
        "attendance.mark" => Some(with_conn(state, req, attendance_mark)),
        "attendance.update" => Some(with_conn(state, req, attendance_update)),
        _ => None,
    }
}
