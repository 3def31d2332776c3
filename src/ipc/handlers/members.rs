use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_members_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "members": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT
           m.id,
           m.first_name,
           m.last_name,
           m.email,
           m.phone,
           m.cell_group_id,
           (SELECT g.name FROM cell_groups g WHERE g.id = m.cell_group_id) AS cell_group_name,
           m.invited_by_id,
           m.is_active,
           m.created_at
         FROM members m
         ORDER BY m.last_name, m.first_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "firstName": row.get::<_, String>(1)?,
                "lastName": row.get::<_, String>(2)?,
                "email": row.get::<_, Option<String>>(3)?,
                "phone": row.get::<_, Option<String>>(4)?,
                "cellGroupId": row.get::<_, Option<String>>(5)?,
                "cellGroupName": row.get::<_, Option<String>>(6)?,
                "invitedById": row.get::<_, Option<String>>(7)?,
                "isActive": row.get::<_, i64>(8)? != 0,
                "createdAt": row.get::<_, String>(9)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(members) => ok(&req.id, json!({ "members": members })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn reference_exists(
    conn: &rusqlite::Connection,
    table: &str,
    id: &str,
) -> Result<bool, rusqlite::Error> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    conn.query_row(&sql, [id], |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
}

fn handle_members_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let first_name = match req.params.get("firstName").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing firstName", None),
    };
    let last_name = match req.params.get("lastName").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing lastName", None),
    };
    let email = req
        .params
        .get("email")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let phone = req
        .params
        .get("phone")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let cell_group_id = req
        .params
        .get("cellGroupId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let invited_by_id = req
        .params
        .get("invitedById")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    if let Some(gid) = cell_group_id.as_deref() {
        match reference_exists(conn, "cell_groups", gid) {
            Ok(true) => {}
            Ok(false) => {
                return err(
                    &req.id,
                    "not_found",
                    "cell group not found",
                    Some(json!({ "cellGroupId": gid })),
                )
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }
    if let Some(iid) = invited_by_id.as_deref() {
        match reference_exists(conn, "members", iid) {
            Ok(true) => {}
            Ok(false) => {
                return err(
                    &req.id,
                    "not_found",
                    "inviter not found",
                    Some(json!({ "invitedById": iid })),
                )
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    let member_id = Uuid::new_v4().to_string();
    let created_at = chrono::Utc::now().to_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO members(id, first_name, last_name, email, phone, cell_group_id,
                             invited_by_id, is_active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, 0, ?)",
        (
            &member_id,
            &first_name,
            &last_name,
            &email,
            &phone,
            &cell_group_id,
            &invited_by_id,
            &created_at,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "members" })),
        );
    }

    ok(&req.id, json!({ "memberId": member_id }))
}

fn handle_members_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let member_id = match req.params.get("memberId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing memberId", None),
    };
    let patch = req.params.get("patch").cloned().unwrap_or(json!({}));

    let existing = conn
        .query_row(
            "SELECT first_name, last_name, email, phone, cell_group_id, invited_by_id
             FROM members WHERE id = ?",
            [&member_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Option<String>>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    r.get::<_, Option<String>>(4)?,
                    r.get::<_, Option<String>>(5)?,
                ))
            },
        )
        .optional();
    let (first_name, last_name, email, phone, cell_group_id, invited_by_id) = match existing {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "member not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let patched_str = |key: &str, current: String| -> String {
        patch
            .get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .unwrap_or(current)
    };
    // Nullable fields: an explicit null clears, absence keeps.
    let patched_opt = |key: &str, current: Option<String>| -> Option<String> {
        match patch.get(key) {
            None => current,
            Some(v) if v.is_null() => None,
            Some(v) => v.as_str().map(|s| s.to_string()).or(current),
        }
    };

    let first_name = patched_str("firstName", first_name);
    let last_name = patched_str("lastName", last_name);
    let email = patched_opt("email", email);
    let phone = patched_opt("phone", phone);
    let cell_group_id = patched_opt("cellGroupId", cell_group_id);
    let invited_by_id = patched_opt("invitedById", invited_by_id);

    if first_name.is_empty() || last_name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    if let Some(gid) = cell_group_id.as_deref() {
        match reference_exists(conn, "cell_groups", gid) {
            Ok(true) => {}
            Ok(false) => {
                return err(
                    &req.id,
                    "not_found",
                    "cell group not found",
                    Some(json!({ "cellGroupId": gid })),
                )
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }
    if let Some(iid) = invited_by_id.as_deref() {
        match reference_exists(conn, "members", iid) {
            Ok(true) => {}
            Ok(false) => {
                return err(
                    &req.id,
                    "not_found",
                    "inviter not found",
                    Some(json!({ "invitedById": iid })),
                )
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    if let Err(e) = conn.execute(
        "UPDATE members
         SET first_name = ?, last_name = ?, email = ?, phone = ?,
             cell_group_id = ?, invited_by_id = ?
         WHERE id = ?",
        (
            &first_name,
            &last_name,
            &email,
            &phone,
            &cell_group_id,
            &invited_by_id,
            &member_id,
        ),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "members" })),
        );
    }

    ok(&req.id, json!({ "memberId": member_id }))
}

fn handle_members_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let member_id = match req.params.get("memberId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing memberId", None),
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM members WHERE id = ?", [&member_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "member not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    // Attendance rows go with the member; leaving them behind orphans the
    // member reference.
    if let Err(e) = tx.execute("DELETE FROM attendance WHERE member_id = ?", [&member_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "attendance" })),
        );
    }

    if let Err(e) = tx.execute(
        "UPDATE members SET invited_by_id = NULL WHERE invited_by_id = ?",
        [&member_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "members" })),
        );
    }

    if let Err(e) = tx.execute(
        "UPDATE invites SET member_id = NULL WHERE member_id = ?",
        [&member_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "invites" })),
        );
    }

    if let Err(e) = tx.execute("DELETE FROM members WHERE id = ?", [&member_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "members" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "members.list" => Some(handle_members_list(state, req)),
        "members.create" => Some(handle_members_create(state, req)),
        "members.update" => Some(handle_members_update(state, req)),
        "members.delete" => Some(handle_members_delete(state, req)),
        _ => None,
    }
}
