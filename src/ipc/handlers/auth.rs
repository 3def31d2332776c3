use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use sha2::{Digest, Sha256};
use uuid::Uuid;

const INVITE_TTL_DAYS: i64 = 7;
const RESET_TTL_HOURS: i64 = 2;
const MIN_PASSWORD_LEN: usize = 8;

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

/// The raw token goes out to the caller once; only its digest is stored.
fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn token_digest(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hash_password(password: &str) -> Result<String, HandlerErr> {
    if password.len() < MIN_PASSWORD_LEN {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("password must be at least {} characters", MIN_PASSWORD_LEN),
            details: None,
        });
    }
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| HandlerErr {
            code: "hash_failed",
            message: e.to_string(),
            details: None,
        })
}

fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

fn is_expired(expires_at: &str) -> bool {
    match DateTime::parse_from_rfc3339(expires_at) {
        Ok(t) => t.with_timezone(&Utc) < Utc::now(),
        Err(_) => true,
    }
}

fn invites_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let email = get_required_str(params, "email")?.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(HandlerErr {
            code: "bad_params",
            message: "email is not valid".to_string(),
            details: None,
        });
    }
    let member_id = params
        .get("memberId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    if let Some(mid) = member_id.as_deref() {
        let exists: Option<i64> = conn
            .query_row("SELECT 1 FROM members WHERE id = ?", [mid], |r| r.get(0))
            .optional()
            .map_err(db_err)?;
        if exists.is_none() {
            return Err(HandlerErr {
                code: "not_found",
                message: "member not found".to_string(),
                details: Some(json!({ "memberId": mid })),
            });
        }
    }

    let token = generate_token();
    let invite_id = Uuid::new_v4().to_string();
    let now = Utc::now();
    let expires_at = (now + Duration::days(INVITE_TTL_DAYS)).to_rfc3339();

    conn.execute(
        "INSERT INTO invites(id, email, member_id, token_digest, expires_at, accepted_at, created_at)
         VALUES(?, ?, ?, ?, ?, NULL, ?)",
        (
            &invite_id,
            &email,
            &member_id,
            token_digest(&token),
            &expires_at,
            now.to_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "invites" })),
    })?;

    // Mail delivery is the caller's concern; the token is returned here once.
    Ok(json!({
        "inviteId": invite_id,
        "email": email,
        "token": token,
        "expiresAt": expires_at,
    }))
}

fn invites_accept(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let token = get_required_str(params, "token")?;
    let password = get_required_str(params, "password")?;
    let name = params
        .get("name")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string());

    let invite = conn
        .query_row(
            "SELECT id, email, expires_at, accepted_at FROM invites WHERE token_digest = ?",
            [token_digest(&token)],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<String>>(3)?,
                ))
            },
        )
        .optional()
        .map_err(db_err)?;
    let Some((invite_id, email, expires_at, accepted_at)) = invite else {
        return Err(HandlerErr {
            code: "not_found",
            message: "invite not found".to_string(),
            details: None,
        });
    };
    if accepted_at.is_some() {
        return Err(HandlerErr {
            code: "conflict",
            message: "invite already accepted".to_string(),
            details: None,
        });
    }
    if is_expired(&expires_at) {
        return Err(HandlerErr {
            code: "invite_expired",
            message: "invite has expired".to_string(),
            details: Some(json!({ "expiresAt": expires_at })),
        });
    }

    let taken: Option<i64> = conn
        .query_row("SELECT 1 FROM users WHERE email = ?", [&email], |r| {
            r.get(0)
        })
        .optional()
        .map_err(db_err)?;
    if taken.is_some() {
        return Err(HandlerErr {
            code: "conflict",
            message: "a user with this email already exists".to_string(),
            details: Some(json!({ "email": email })),
        });
    }

    let password_hash = hash_password(&password)?;
    let user_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    tx.execute(
        "INSERT INTO users(id, email, name, password_hash, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (&user_id, &email, &name, &password_hash, &now),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "users" })),
    })?;
    tx.execute(
        "UPDATE invites SET accepted_at = ? WHERE id = ?",
        (&now, &invite_id),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "invites" })),
    })?;
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "userId": user_id, "email": email }))
}

fn auth_login(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let email = get_required_str(params, "email")?.trim().to_lowercase();
    let password = get_required_str(params, "password")?;

    let user = conn
        .query_row(
            "SELECT id, name, password_hash FROM users WHERE email = ?",
            [&email],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, Option<String>>(1)?,
                    r.get::<_, String>(2)?,
                ))
            },
        )
        .optional()
        .map_err(db_err)?;
    // Same error for unknown email and wrong password.
    let Some((user_id, name, stored_hash)) = user else {
        return Err(HandlerErr {
            code: "auth_failed",
            message: "invalid email or password".to_string(),
            details: None,
        });
    };
    if !verify_password(&password, &stored_hash) {
        return Err(HandlerErr {
            code: "auth_failed",
            message: "invalid email or password".to_string(),
            details: None,
        });
    }

    Ok(json!({ "userId": user_id, "email": email, "name": name }))
}

fn auth_request_password_reset(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let email = get_required_str(params, "email")?.trim().to_lowercase();

    let user_id: Option<String> = conn
        .query_row("SELECT id FROM users WHERE email = ?", [&email], |r| {
            r.get(0)
        })
        .optional()
        .map_err(db_err)?;
    let Some(user_id) = user_id else {
        return Err(HandlerErr {
            code: "not_found",
            message: "no user with this email".to_string(),
            details: None,
        });
    };

    let token = generate_token();
    let reset_id = Uuid::new_v4().to_string();
    let expires_at = (Utc::now() + Duration::hours(RESET_TTL_HOURS)).to_rfc3339();

    conn.execute(
        "INSERT INTO password_resets(id, user_id, token_digest, expires_at, used_at)
         VALUES(?, ?, ?, ?, NULL)",
        (&reset_id, &user_id, token_digest(&token), &expires_at),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "password_resets" })),
    })?;

    Ok(json!({
        "resetId": reset_id,
        "token": token,
        "expiresAt": expires_at,
    }))
}

fn auth_reset_password(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let token = get_required_str(params, "token")?;
    let password = get_required_str(params, "password")?;

    let reset = conn
        .query_row(
            "SELECT id, user_id, expires_at, used_at FROM password_resets WHERE token_digest = ?",
            [token_digest(&token)],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<String>>(3)?,
                ))
            },
        )
        .optional()
        .map_err(db_err)?;
    let Some((reset_id, user_id, expires_at, used_at)) = reset else {
        return Err(HandlerErr {
            code: "not_found",
            message: "reset token not found".to_string(),
            details: None,
        });
    };
    if used_at.is_some() {
        return Err(HandlerErr {
            code: "conflict",
            message: "reset token already used".to_string(),
            details: None,
        });
    }
    if is_expired(&expires_at) {
        return Err(HandlerErr {
            code: "invite_expired",
            message: "reset token has expired".to_string(),
            details: Some(json!({ "expiresAt": expires_at })),
        });
    }

    let password_hash = hash_password(&password)?;
    let now = Utc::now().to_rfc3339();

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    tx.execute(
        "UPDATE users SET password_hash = ? WHERE id = ?",
        (&password_hash, &user_id),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "users" })),
    })?;
    tx.execute(
        "UPDATE password_resets SET used_at = ? WHERE id = ?",
        (&now, &reset_id),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "password_resets" })),
    })?;
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "userId": user_id }))
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
        "invites.create" => Some(with_conn(state, req, invites_create)),
        "invites.accept" => Some(with_conn(state, req, invites_accept)),
        "auth.login" => Some(with_conn(state, req, auth_login)),
        "auth.requestPasswordReset" => Some(with_conn(state, req, auth_request_password_reset)),
        "auth.resetPassword" => Some(with_conn(state, req, auth_reset_password)),
        _ => None,
    }
}
