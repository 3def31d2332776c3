use rusqlite::Connection;
use std::collections::BTreeSet;

/// A member counts as active once this many PRESENT records exist for them.
pub const ACTIVE_PRESENT_THRESHOLD: i64 = 5;

pub const STATUS_PRESENT: &str = "PRESENT";
pub const STATUS_ABSENT: &str = "ABSENT";

/// Recompute one member's derived activity flag from their attendance
/// history. Writes only when the stored value differs; returns the flag.
///
/// Call sites run this inside the same transaction as the attendance
/// mutation, so a committed attendance state always carries a matching flag.
pub fn reconcile_member(conn: &Connection, member_id: &str) -> rusqlite::Result<bool> {
    let present: i64 = conn.query_row(
        "SELECT COUNT(*) FROM attendance WHERE member_id = ? AND status = ?",
        (member_id, STATUS_PRESENT),
        |r| r.get(0),
    )?;
    let active = present >= ACTIVE_PRESENT_THRESHOLD;

    let stored: i64 = conn.query_row(
        "SELECT is_active FROM members WHERE id = ?",
        [member_id],
        |r| r.get(0),
    )?;
    if (stored != 0) != active {
        conn.execute(
            "UPDATE members SET is_active = ? WHERE id = ?",
            (active as i64, member_id),
        )?;
    }
    Ok(active)
}

/// Batch form: one recount per distinct member id, order-independent.
pub fn reconcile_members<'a, I>(conn: &Connection, member_ids: I) -> rusqlite::Result<()>
where
    I: IntoIterator<Item = &'a str>,
{
    let distinct: BTreeSet<&str> = member_ids.into_iter().collect();
    for member_id in distinct {
        reconcile_member(conn, member_id)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "CREATE TABLE members(
                id TEXT PRIMARY KEY,
                is_active INTEGER NOT NULL DEFAULT 0
             );
             CREATE TABLE attendance(
                id TEXT PRIMARY KEY,
                event_id TEXT NOT NULL,
                member_id TEXT NOT NULL,
                status TEXT NOT NULL,
                UNIQUE(event_id, member_id)
             );",
        )
        .expect("create schema");
        conn
    }

    // `start` keeps event ids distinct across consecutive calls for the
    // same member; the schema is unique on (event_id, member_id).
    fn add_present(conn: &Connection, member_id: &str, start: usize, n: usize) {
        for i in start..start + n {
            conn.execute(
                "INSERT INTO attendance(id, event_id, member_id, status) VALUES(?, ?, ?, ?)",
                (
                    format!("{}-{}", member_id, i),
                    format!("ev-{}", i),
                    member_id,
                    STATUS_PRESENT,
                ),
            )
            .expect("insert attendance");
        }
    }

    #[test]
    fn flag_flips_at_threshold_boundary() {
        let conn = test_conn();
        conn.execute("INSERT INTO members(id) VALUES('m1')", [])
            .unwrap();

        add_present(&conn, "m1", 0, 4);
        assert!(!reconcile_member(&conn, "m1").unwrap());

        add_present(&conn, "m1", 4, 1);
        assert!(reconcile_member(&conn, "m1").unwrap());

        conn.execute("DELETE FROM attendance WHERE id = 'm1-0'", [])
            .unwrap();
        assert!(!reconcile_member(&conn, "m1").unwrap());
    }

    #[test]
    fn absences_do_not_count_toward_activity() {
        let conn = test_conn();
        conn.execute("INSERT INTO members(id) VALUES('m1')", [])
            .unwrap();
        for i in 0..6 {
            conn.execute(
                "INSERT INTO attendance(id, event_id, member_id, status) VALUES(?, ?, 'm1', ?)",
                (format!("a-{}", i), format!("ev-{}", i), STATUS_ABSENT),
            )
            .unwrap();
        }
        assert!(!reconcile_member(&conn, "m1").unwrap());
    }

    #[test]
    fn reconcile_is_idempotent() {
        let conn = test_conn();
        conn.execute("INSERT INTO members(id) VALUES('m1')", [])
            .unwrap();
        add_present(&conn, "m1", 0, 5);

        assert!(reconcile_member(&conn, "m1").unwrap());
        assert!(reconcile_member(&conn, "m1").unwrap());
        let stored: i64 = conn
            .query_row("SELECT is_active FROM members WHERE id = 'm1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(stored, 1);
    }

    #[test]
    fn batch_reconciles_each_distinct_member_once() {
        let conn = test_conn();
        conn.execute("INSERT INTO members(id) VALUES('m1')", [])
            .unwrap();
        conn.execute("INSERT INTO members(id) VALUES('m2')", [])
            .unwrap();
        add_present(&conn, "m1", 0, 5);
        add_present(&conn, "m2", 0, 2);

        reconcile_members(&conn, ["m1", "m2", "m1"]).unwrap();

        let m1: i64 = conn
            .query_row("SELECT is_active FROM members WHERE id = 'm1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        let m2: i64 = conn
            .query_row("SELECT is_active FROM members WHERE id = 'm2'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!((m1, m2), (1, 0));
    }

    #[test]
    fn missing_member_is_an_error() {
        let conn = test_conn();
        assert!(reconcile_member(&conn, "nope").is_err());
    }
}
