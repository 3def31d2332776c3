use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE_NAME: &str = "flock.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS cell_groups(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            description TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS members(
            id TEXT PRIMARY KEY,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            email TEXT,
            phone TEXT,
            cell_group_id TEXT,
            invited_by_id TEXT,
            is_active INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            FOREIGN KEY(cell_group_id) REFERENCES cell_groups(id),
            FOREIGN KEY(invited_by_id) REFERENCES members(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_members_cell_group ON members(cell_group_id)",
        [],
    )?;

    // Older workspaces predate the inviter link. Add the column if missing.
    ensure_members_invited_by(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS events(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            event_type TEXT NOT NULL,
            event_date TEXT NOT NULL,
            description TEXT,
            preparations TEXT,
            feedback TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_date ON events(event_date)",
        [],
    )?;
    ensure_events_feedback(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            id TEXT PRIMARY KEY,
            event_id TEXT NOT NULL,
            member_id TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(event_id) REFERENCES events(id),
            FOREIGN KEY(member_id) REFERENCES members(id),
            UNIQUE(event_id, member_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_event ON attendance(event_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_member ON attendance(member_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_member_status ON attendance(member_id, status)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            name TEXT,
            password_hash TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS invites(
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL,
            member_id TEXT,
            token_digest TEXT NOT NULL UNIQUE,
            expires_at TEXT NOT NULL,
            accepted_at TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(member_id) REFERENCES members(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_invites_email ON invites(email)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS password_resets(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            token_digest TEXT NOT NULL UNIQUE,
            expires_at TEXT NOT NULL,
            used_at TEXT,
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_password_resets_user ON password_resets(user_id)",
        [],
    )?;

    Ok(conn)
}

fn ensure_members_invited_by(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "members", "invited_by_id")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE members ADD COLUMN invited_by_id TEXT", [])?;
    Ok(())
}

fn ensure_events_feedback(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "events", "feedback")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE events ADD COLUMN feedback TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
