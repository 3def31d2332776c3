use super::events::EVENT_TYPES;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::reconcile::{STATUS_ABSENT, STATUS_PRESENT};
use rusqlite::Connection;
use serde_json::json;
use std::collections::HashMap;

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

/// Per-event present/absent counts plus totals per event type, the model
/// behind the attendance charts.
fn attendance_summary(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let type_filter = match params.get("eventType").and_then(|v| v.as_str()) {
        Some(raw) => {
            let upper = raw.trim().to_ascii_uppercase();
            if !EVENT_TYPES.contains(&upper.as_str()) {
                return Err(HandlerErr {
                    code: "bad_params",
                    message: "eventType must be one of: MIDWEEK, SUNDAY, PRAYER, SPECIAL"
                        .to_string(),
                    details: Some(json!({ "eventType": raw })),
                });
            }
            Some(upper)
        }
        None => None,
    };
    let from = params.get("from").and_then(|v| v.as_str());
    let to = params.get("to").and_then(|v| v.as_str());

    let mut sql = String::from(
        "SELECT
           e.id, e.name, e.event_type, e.event_date,
           SUM(CASE WHEN a.status = ? THEN 1 ELSE 0 END) AS present,
           SUM(CASE WHEN a.status = ? THEN 1 ELSE 0 END) AS absent
         FROM events e
         LEFT JOIN attendance a ON a.event_id = e.id
         WHERE 1=1",
    );
    let mut args: Vec<String> = vec![STATUS_PRESENT.to_string(), STATUS_ABSENT.to_string()];
    if let Some(t) = type_filter.as_deref() {
        sql.push_str(" AND e.event_type = ?");
        args.push(t.to_string());
    }
    if let Some(f) = from {
        sql.push_str(" AND e.event_date >= ?");
        args.push(f.to_string());
    }
    if let Some(t) = to {
        sql.push_str(" AND e.event_date <= ?");
        args.push(t.to_string());
    }
    sql.push_str(" GROUP BY e.id ORDER BY e.event_date, e.name");

    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, i64>(4)?,
                r.get::<_, i64>(5)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut by_type: HashMap<String, (i64, i64, i64)> = HashMap::new();
    let events_json: Vec<serde_json::Value> = rows
        .iter()
        .map(|(id, name, event_type, event_date, present, absent)| {
            let slot = by_type.entry(event_type.clone()).or_insert((0, 0, 0));
            slot.0 += 1;
            slot.1 += present;
            slot.2 += absent;
            json!({
                "eventId": id,
                "name": name,
                "eventType": event_type,
                "eventDate": event_date,
                "present": present,
                "absent": absent,
            })
        })
        .collect();

    let mut totals: Vec<serde_json::Value> = by_type
        .into_iter()
        .map(|(event_type, (events, present, absent))| {
            json!({
                "eventType": event_type,
                "eventCount": events,
                "present": present,
                "absent": absent,
            })
        })
        .collect();
    totals.sort_by(|a, b| {
        a["eventType"]
            .as_str()
            .unwrap_or("")
            .cmp(b["eventType"].as_str().unwrap_or(""))
    });

    Ok(json!({ "events": events_json, "byEventType": totals }))
}

/// Congregation totals: overall, active, and per cell group.
fn membership_report(
    conn: &Connection,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let (total, active): (i64, i64) = conn
        .query_row(
            "SELECT COUNT(*), SUM(CASE WHEN is_active = 1 THEN 1 ELSE 0 END) FROM members",
            [],
            |r| Ok((r.get(0)?, r.get::<_, Option<i64>>(1)?.unwrap_or(0))),
        )
        .map_err(db_err)?;

    let mut stmt = conn
        .prepare(
            "SELECT
               g.id, g.name,
               (SELECT COUNT(*) FROM members m WHERE m.cell_group_id = g.id),
               (SELECT COUNT(*) FROM members m
                 WHERE m.cell_group_id = g.id AND m.is_active = 1)
             FROM cell_groups g
             ORDER BY g.name",
        )
        .map_err(db_err)?;
    let groups = stmt
        .query_map([], |r| {
            Ok(json!({
                "cellGroupId": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "memberCount": r.get::<_, i64>(2)?,
                "activeMemberCount": r.get::<_, i64>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let unassigned: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM members WHERE cell_group_id IS NULL",
            [],
            |r| r.get(0),
        )
        .map_err(db_err)?;

    Ok(json!({
        "totalMembers": total,
        "activeMembers": active,
        "byCellGroup": groups,
        "unassignedMembers": unassigned,
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
        "reports.attendanceSummary" => Some(with_conn(state, req, attendance_summary)),
        "reports.membership" => Some(with_conn(state, req, membership_report)),
        _ => None,
    }
}
