use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_cell_groups_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "cellGroups": [] }));
    };

    // Member counts ride along so the dashboard needs no second call.
    let mut stmt = match conn.prepare(
        "SELECT
           g.id,
           g.name,
           g.description,
           (SELECT COUNT(*) FROM members m WHERE m.cell_group_id = g.id) AS member_count,
           (SELECT COUNT(*) FROM members m
             WHERE m.cell_group_id = g.id AND m.is_active = 1) AS active_count
         FROM cell_groups g
         ORDER BY g.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "description": row.get::<_, Option<String>>(2)?,
                "memberCount": row.get::<_, i64>(3)?,
                "activeMemberCount": row.get::<_, i64>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(groups) => ok(&req.id, json!({ "cellGroups": groups })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_cell_groups_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let description = req
        .params
        .get("description")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let taken: Option<i64> = match conn
        .query_row("SELECT 1 FROM cell_groups WHERE name = ?", [&name], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if taken.is_some() {
        return err(
            &req.id,
            "conflict",
            "a cell group with this name already exists",
            Some(json!({ "name": name })),
        );
    }

    let group_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO cell_groups(id, name, description) VALUES(?, ?, ?)",
        (&group_id, &name, &description),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "cell_groups" })),
        );
    }

    ok(&req.id, json!({ "cellGroupId": group_id, "name": name }))
}

fn handle_cell_groups_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let group_id = match req.params.get("cellGroupId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing cellGroupId", None),
    };

    let existing = conn
        .query_row(
            "SELECT name, description FROM cell_groups WHERE id = ?",
            [&group_id],
            |r| Ok((r.get::<_, String>(0)?, r.get::<_, Option<String>>(1)?)),
        )
        .optional();
    let (name, description) = match existing {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "cell group not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let name = req
        .params
        .get("name")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .unwrap_or(name);
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let description = match req.params.get("description") {
        None => description,
        Some(v) if v.is_null() => None,
        Some(v) => v.as_str().map(|s| s.to_string()).or(description),
    };

    let collision: Option<String> = match conn
        .query_row(
            "SELECT id FROM cell_groups WHERE name = ? AND id <> ?",
            (&name, &group_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if collision.is_some() {
        return err(
            &req.id,
            "conflict",
            "a cell group with this name already exists",
            Some(json!({ "name": name })),
        );
    }

    if let Err(e) = conn.execute(
        "UPDATE cell_groups SET name = ?, description = ? WHERE id = ?",
        (&name, &description, &group_id),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "cell_groups" })),
        );
    }

    ok(&req.id, json!({ "cellGroupId": group_id }))
}

fn handle_cell_groups_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let group_id = match req.params.get("cellGroupId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing cellGroupId", None),
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM cell_groups WHERE id = ?", [&group_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "cell group not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Members outlive their group; detach rather than delete.
    if let Err(e) = tx.execute(
        "UPDATE members SET cell_group_id = NULL WHERE cell_group_id = ?",
        [&group_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "members" })),
        );
    }

    if let Err(e) = tx.execute("DELETE FROM cell_groups WHERE id = ?", [&group_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "cell_groups" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "cellGroups.list" => Some(handle_cell_groups_list(state, req)),
        "cellGroups.create" => Some(handle_cell_groups_create(state, req)),
        "cellGroups.update" => Some(handle_cell_groups_update(state, req)),
        "cellGroups.delete" => Some(handle_cell_groups_delete(state, req)),
        _ => None,
    }
}
