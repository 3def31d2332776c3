use crate::backup;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn resolve_workspace(state: &AppState, req: &Request) -> Result<PathBuf, serde_json::Value> {
    if let Some(p) = req.params.get("workspacePath").and_then(|v| v.as_str()) {
        return Ok(PathBuf::from(p));
    }
    state
        .workspace
        .clone()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn handle_export_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let workspace = match resolve_workspace(state, req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let out_path = match req.params.get("outPath").and_then(|v| v.as_str()) {
        Some(v) => PathBuf::from(v),
        None => return err(&req.id, "bad_params", "missing outPath", None),
    };

    match backup::export_workspace_bundle(&workspace, &out_path) {
        Ok(summary) => ok(
            &req.id,
            json!({
                "outPath": out_path.to_string_lossy(),
                "bundleFormat": summary.bundle_format,
                "entryCount": summary.entry_count,
            }),
        ),
        Err(e) => err(&req.id, "backup_export_failed", format!("{e:?}"), None),
    }
}

fn handle_import_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let workspace = match resolve_workspace(state, req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let in_path = match req.params.get("inPath").and_then(|v| v.as_str()) {
        Some(v) => PathBuf::from(v),
        None => return err(&req.id, "bad_params", "missing inPath", None),
    };

    // Drop the open handle before replacing the database file underneath it.
    let replacing_selected = state.workspace.as_deref() == Some(workspace.as_path());
    if replacing_selected {
        state.db = None;
    }

    let summary = match backup::import_workspace_bundle(&in_path, &workspace) {
        Ok(s) => s,
        Err(e) => {
            if replacing_selected {
                state.db = db::open_db(&workspace).ok();
            }
            return err(&req.id, "backup_import_failed", format!("{e:?}"), None);
        }
    };

    if replacing_selected {
        match db::open_db(&workspace) {
            Ok(conn) => state.db = Some(conn),
            Err(e) => return err(&req.id, "db_open_failed", format!("{e:?}"), None),
        }
    }

    ok(
        &req.id,
        json!({
            "workspacePath": workspace.to_string_lossy(),
            "bundleFormatDetected": summary.bundle_format_detected,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(handle_export_bundle(state, req)),
        "backup.importWorkspaceBundle" => Some(handle_import_bundle(state, req)),
        _ => None,
    }
}
