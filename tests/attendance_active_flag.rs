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
        json!({ "name": name, "eventType": "MIDWEEK", "eventDate": date }),
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
fn fifth_present_record_flips_flag_and_fourth_flips_it_back() {
    let workspace = temp_dir("flock-active-boundary");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let m1 = create_member(&mut stdin, &mut reader, "m1", "Boundary");
    let mut events = Vec::new();
    for i in 0..5 {
        events.push(create_event(
            &mut stdin,
            &mut reader,
            &format!("e{}", i),
            &format!("Meeting {}", i),
            &format!("2026-03-{:02}", i + 1),
        ));
    }

    // Four PRESENT records: still inactive.
    for (i, event) in events.iter().take(4).enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("mark{}", i),
            "attendance.mark",
            json!({ "eventId": event, "memberId": m1 }),
        );
    }
    assert!(!is_active(&mut stdin, &mut reader, "a1", &m1));

    // The fifth flips it.
    let res = request_ok(
        &mut stdin,
        &mut reader,
        "mark5",
        "attendance.mark",
        json!({ "eventId": events[4], "memberId": m1 }),
    );
    assert_eq!(res.get("memberIsActive").and_then(|v| v.as_bool()), Some(true));
    assert!(is_active(&mut stdin, &mut reader, "a2", &m1));

    // Dropping back to four (bulk replace with an empty roster) flips it off.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "b1",
        "attendance.bulkMark",
        json!({ "eventId": events[4], "attendances": [] }),
    );
    assert!(!is_active(&mut stdin, &mut reader, "a3", &m1));
}

#[test]
fn absent_records_never_activate_a_member() {
    let workspace = temp_dir("flock-active-absent");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let m1 = create_member(&mut stdin, &mut reader, "m1", "Absent");
    for i in 0..6 {
        let event = create_event(
            &mut stdin,
            &mut reader,
            &format!("e{}", i),
            &format!("Meeting {}", i),
            &format!("2026-04-{:02}", i + 1),
        );
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("mark{}", i),
            "attendance.mark",
            json!({ "eventId": event, "memberId": m1, "status": "ABSENT" }),
        );
    }
    assert!(!is_active(&mut stdin, &mut reader, "a1", &m1));
}

#[test]
fn emptying_bulk_call_recomputes_previously_present_members() {
    let workspace = temp_dir("flock-active-empty-bulk");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let members: Vec<String> = (0..3)
        .map(|i| {
            create_member(
                &mut stdin,
                &mut reader,
                &format!("m{}", i),
                &format!("Member{}", i),
            )
        })
        .collect();

    // Four shared events plus the one under test: everyone lands on exactly
    // five PRESENT records.
    for i in 0..4 {
        let event = create_event(
            &mut stdin,
            &mut reader,
            &format!("e{}", i),
            &format!("Warmup {}", i),
            &format!("2026-05-{:02}", i + 1),
        );
        let roster: Vec<serde_json::Value> = members
            .iter()
            .map(|m| json!({ "memberId": m }))
            .collect();
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("b{}", i),
            "attendance.bulkMark",
            json!({ "eventId": event, "attendances": roster }),
        );
    }
    let fifth = create_event(&mut stdin, &mut reader, "e5", "Fifth", "2026-05-10");
    let roster: Vec<serde_json::Value> = members
        .iter()
        .map(|m| json!({ "memberId": m }))
        .collect();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "b5",
        "attendance.bulkMark",
        json!({ "eventId": fifth, "attendances": roster }),
    );
    for (i, m) in members.iter().enumerate() {
        assert!(
            is_active(&mut stdin, &mut reader, &format!("chk{}", i), m),
            "member {} should be active after fifth present",
            i
        );
    }

    // Emptying the fifth event's roster drops everyone back below threshold.
    let res = request_ok(
        &mut stdin,
        &mut reader,
        "empty",
        "attendance.bulkMark",
        json!({ "eventId": fifth, "attendances": [] }),
    );
    assert_eq!(res.get("reconciledMembers").and_then(|v| v.as_i64()), Some(3));
    for (i, m) in members.iter().enumerate() {
        assert!(
            !is_active(&mut stdin, &mut reader, &format!("chk2-{}", i), m),
            "member {} should be inactive after roster emptied",
            i
        );
    }
}
