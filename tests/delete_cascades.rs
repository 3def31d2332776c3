use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_flockd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn flockd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn create_member(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    last_name: &str,
) -> String {
    let res = request_ok(
        stdin,
        reader,
        id,
        "members.create",
        json!({ "firstName": "Test", "lastName": last_name }),
    );
    res.get("memberId")
        .and_then(|v| v.as_str())
        .expect("memberId")
        .to_string()
}

fn create_event(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    name: &str,
    date: &str,
) -> String {
    let res = request_ok(
        stdin,
        reader,
        id,
        "events.create",
        json!({ "name": name, "eventType": "SUNDAY", "eventDate": date }),
    );
    res.get("eventId")
        .and_then(|v| v.as_str())
        .expect("eventId")
        .to_string()
}

fn is_active(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    member_id: &str,
) -> bool {
    let res = request_ok(stdin, reader, id, "members.list", json!({}));
    res.get("members")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .find(|m| m.get("id").and_then(|v| v.as_str()) == Some(member_id))
        .and_then(|m| m.get("isActive").and_then(|v| v.as_bool()))
        .expect("member in list")
}

#[test]
fn event_delete_removes_rows_and_recomputes_flags() {
    let workspace = temp_dir("flock-event-cascade");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let m1 = create_member(&mut stdin, &mut reader, "m1", "Cascade");
    let mut events = Vec::new();
    for i in 0..5 {
        let event = create_event(
            &mut stdin,
            &mut reader,
            &format!("e{}", i),
            &format!("Service {}", i),
            &format!("2026-07-{:02}", i + 1),
        );
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("mark{}", i),
            "attendance.mark",
            json!({ "eventId": event, "memberId": m1 }),
        );
        events.push(event);
    }
    assert!(is_active(&mut stdin, &mut reader, "a1", &m1));

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "del",
        "events.delete",
        json!({ "eventId": events[0] }),
    );
    assert_eq!(res.get("reconciledMembers").and_then(|v| v.as_i64()), Some(1));
    assert!(!is_active(&mut stdin, &mut reader, "a2", &m1));

    let listed = request_ok(&mut stdin, &mut reader, "list", "events.list", json!({}));
    let remaining = listed
        .get("events")
        .and_then(|v| v.as_array())
        .map(|a| a.len())
        .unwrap_or(0);
    assert_eq!(remaining, 4);
}

#[test]
fn member_delete_takes_attendance_rows_along() {
    let workspace = temp_dir("flock-member-cascade");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let m1 = create_member(&mut stdin, &mut reader, "m1", "Leaver");
    let m2 = create_member(&mut stdin, &mut reader, "m2", "Stayer");
    let event = create_event(&mut stdin, &mut reader, "e1", "Service", "2026-07-12");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "b1",
        "attendance.bulkMark",
        json!({
            "eventId": event,
            "attendances": [{ "memberId": m1 }, { "memberId": m2 }]
        }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "del",
        "members.delete",
        json!({ "memberId": m1 }),
    );

    // No orphaned attendance rows for the deleted member.
    let open = request_ok(
        &mut stdin,
        &mut reader,
        "open",
        "attendance.eventOpen",
        json!({ "eventId": event }),
    );
    let rows = open
        .get("rows")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert!(rows
        .iter()
        .all(|r| r.get("memberId").and_then(|v| v.as_str()) != Some(m1.as_str())));
    let marked = rows
        .iter()
        .filter(|r| !r.get("status").map(|s| s.is_null()).unwrap_or(true))
        .count();
    assert_eq!(marked, 1);

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "sum",
        "reports.attendanceSummary",
        json!({}),
    );
    let present = summary
        .get("events")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first().cloned())
        .and_then(|e| e.get("present").and_then(|v| v.as_i64()))
        .unwrap_or(-1);
    assert_eq!(present, 1);
}

#[test]
fn member_delete_clears_inviter_references() {
    let workspace = temp_dir("flock-inviter-clear");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let inviter = create_member(&mut stdin, &mut reader, "m1", "Inviter");
    let invited = request_ok(
        &mut stdin,
        &mut reader,
        "m2",
        "members.create",
        json!({
            "firstName": "Test",
            "lastName": "Invited",
            "invitedById": inviter
        }),
    );
    let invited_id = invited
        .get("memberId")
        .and_then(|v| v.as_str())
        .expect("memberId")
        .to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "del",
        "members.delete",
        json!({ "memberId": inviter }),
    );

    let listed = request_ok(&mut stdin, &mut reader, "list", "members.list", json!({}));
    let invited_row = listed
        .get("members")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .find(|m| m.get("id").and_then(|v| v.as_str()) == Some(invited_id.as_str()))
        .expect("invited member still listed");
    assert!(invited_row
        .get("invitedById")
        .map(|v| v.is_null())
        .unwrap_or(false));
}
