use crate::export::{self, AttendanceCsvRow, MemberCsvRow};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::path::PathBuf;

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

fn write_csv(out_path: &str, csv: &str) -> Result<(), HandlerErr> {
    let path = PathBuf::from(out_path);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| HandlerErr {
                code: "io_failed",
                message: e.to_string(),
                details: Some(json!({ "outPath": out_path })),
            })?;
        }
    }
    std::fs::write(&path, csv).map_err(|e| HandlerErr {
        code: "io_failed",
        message: e.to_string(),
        details: Some(json!({ "outPath": out_path })),
    })
}

fn export_members_csv(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let out_path = get_required_str(params, "outPath")?;

    let mut stmt = conn
        .prepare(
            "SELECT
               m.id, m.last_name, m.first_name, m.email, m.phone,
               (SELECT g.name FROM cell_groups g WHERE g.id = m.cell_group_id),
               m.is_active
             FROM members m
             ORDER BY m.last_name, m.first_name",
        )
        .map_err(db_err)?;
    let rows: Vec<MemberCsvRow> = stmt
        .query_map([], |r| {
            Ok(MemberCsvRow {
                id: r.get(0)?,
                last_name: r.get(1)?,
                first_name: r.get(2)?,
                email: r.get(3)?,
                phone: r.get(4)?,
                cell_group: r.get(5)?,
                is_active: r.get::<_, i64>(6)? != 0,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let csv = export::members_csv(&rows);
    write_csv(&out_path, &csv)?;

    Ok(json!({ "outPath": out_path, "rows": rows.len() }))
}

fn export_attendance_csv(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let event_id = get_required_str(params, "eventId")?;
    let out_path = get_required_str(params, "outPath")?;

    let event = conn
        .query_row(
            "SELECT name, event_date FROM events WHERE id = ?",
            [&event_id],
            |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
        )
        .optional()
        .map_err(db_err)?;
    let Some((event_name, event_date)) = event else {
        return Err(HandlerErr {
            code: "not_found",
            message: "event not found".to_string(),
            details: Some(json!({ "eventId": event_id })),
        });
    };

    let mut stmt = conn
        .prepare(
            "SELECT a.member_id, m.last_name, m.first_name, a.status, a.created_at
             FROM attendance a
             JOIN members m ON m.id = a.member_id
             WHERE a.event_id = ?
             ORDER BY m.last_name, m.first_name",
        )
        .map_err(db_err)?;
    let rows: Vec<AttendanceCsvRow> = stmt
        .query_map([&event_id], |r| {
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            Ok(AttendanceCsvRow {
                member_id: r.get(0)?,
                member_name: format!("{}, {}", last, first),
                status: r.get(3)?,
                recorded_at: r.get(4)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let csv = export::attendance_csv(&event_name, &event_date, &rows);
    write_csv(&out_path, &csv)?;

    Ok(json!({ "outPath": out_path, "rows": rows.len() }))
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
        "exchange.exportMembersCsv" => Some(with_conn(state, req, export_members_csv)),
        "exchange.exportAttendanceCsv" => Some(with_conn(state, req, export_attendance_csv)),
        _ => None,
    }
}
