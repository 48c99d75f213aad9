use crate::models::{AuthUserRow, BlogRow, MessageRow, ProfileRow};
use crate::Database;
use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;

/// Fixed-width UTC timestamp, so text ordering matches time ordering.
fn now_stamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl Database {
    // -- Auth users --

    pub fn create_auth_user(&self, id: &str, email: &str, password_hash: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO auth_users (id, email, password) VALUES (?1, ?2, ?3)",
                (id, email, password_hash),
            )?;
            Ok(())
        })
    }

    pub fn get_auth_user_by_email(&self, email: &str) -> Result<Option<AuthUserRow>> {
        self.with_conn(|conn| query_auth_user(conn, "email", email))
    }

    pub fn get_auth_user_by_id(&self, id: &str) -> Result<Option<AuthUserRow>> {
        self.with_conn(|conn| query_auth_user(conn, "id", id))
    }

    // -- Refresh tokens --

    pub fn store_refresh_token(&self, token: &str, user_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO refresh_tokens (token, user_id) VALUES (?1, ?2)",
                (token, user_id),
            )?;
            Ok(())
        })
    }

    /// Consume a refresh token. Returns the owning user id if it was valid.
    pub fn take_refresh_token(&self, token: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let user_id: Option<String> = conn
                .query_row(
                    "SELECT user_id FROM refresh_tokens WHERE token = ?1",
                    [token],
                    |row| row.get(0),
                )
                .optional()?;
            if user_id.is_some() {
                conn.execute("DELETE FROM refresh_tokens WHERE token = ?1", [token])?;
            }
            Ok(user_id)
        })
    }

    pub fn revoke_refresh_tokens(&self, user_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM refresh_tokens WHERE user_id = ?1", [user_id])?)
        })
    }

    // -- Profiles --

    pub fn upsert_profile(&self, profile: &ProfileRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO profiles (id, username, full_name, avatar_url) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    username = excluded.username,
                    full_name = excluded.full_name,
                    avatar_url = excluded.avatar_url",
                rusqlite::params![
                    profile.id,
                    profile.username,
                    profile.full_name,
                    profile.avatar_url
                ],
            )?;
            Ok(())
        })
    }

    pub fn list_profiles_except(&self, user_id: &str) -> Result<Vec<ProfileRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, username, full_name, avatar_url FROM profiles
                 WHERE id != ?1
                 ORDER BY rowid",
            )?;
            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(ProfileRow {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        full_name: row.get(2)?,
                        avatar_url: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Users --

    pub fn upsert_user(&self, id: &str, name: &str, email: &str, role: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, name, email, role) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    email = excluded.email,
                    role = excluded.role",
                (id, name, email, role),
            )?;
            Ok(())
        })
    }

    pub fn get_user_role(&self, id: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT role FROM users WHERE id = ?1", [id], |row| row.get(0))
                .optional()
        })
    }

    // -- Messages --

    pub fn insert_message(
        &self,
        sender_id: &str,
        receiver_id: &str,
        content: &str,
    ) -> Result<MessageRow> {
        self.with_conn(|conn| {
            let created_at = now_stamp();
            conn.execute(
                "INSERT INTO messages (sender_id, receiver_id, content, created_at) VALUES (?1, ?2, ?3, ?4)",
                (sender_id, receiver_id, content, &created_at),
            )?;
            Ok(MessageRow {
                id: conn.last_insert_rowid(),
                sender_id: sender_id.to_string(),
                receiver_id: receiver_id.to_string(),
                content: Some(content.to_string()),
                created_at,
            })
        })
    }

    /// Both directions between `a` and `b`, oldest first.
    pub fn list_conversation(&self, a: &str, b: &str) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| query_conversation(conn, a, b))
    }

    // -- Blogs --

    pub fn insert_blog(
        &self,
        title: &str,
        summary: Option<&str>,
        content: &str,
        image_url: Option<&str>,
        author_id: &str,
    ) -> Result<BlogRow> {
        self.with_conn(|conn| {
            let created_at = now_stamp();
            conn.execute(
                "INSERT INTO blogs (title, summary, content, image_url, author_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![title, summary, content, image_url, author_id, created_at],
            )?;
            Ok(BlogRow {
                id: conn.last_insert_rowid(),
                title: title.to_string(),
                summary: summary.map(str::to_string),
                content: content.to_string(),
                image_url: image_url.map(str::to_string),
                author_id: author_id.to_string(),
                created_at,
            })
        })
    }
}

fn query_auth_user(conn: &Connection, column: &str, value: &str) -> Result<Option<AuthUserRow>> {
    let sql = format!("SELECT id, email, password FROM auth_users WHERE {} = ?1", column);
    let mut stmt = conn.prepare(&sql)?;

    let row = stmt
        .query_row([value], |row| {
            Ok(AuthUserRow {
                id: row.get(0)?,
                email: row.get(1)?,
                password: row.get(2)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_conversation(conn: &Connection, a: &str, b: &str) -> Result<Vec<MessageRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, sender_id, receiver_id, content, created_at
         FROM messages
         WHERE (sender_id = ?1 AND receiver_id = ?2)
            OR (sender_id = ?2 AND receiver_id = ?1)
         ORDER BY created_at ASC, id ASC",
    )?;

    let rows = stmt
        .query_map([a, b], |row| {
            Ok(MessageRow {
                id: row.get(0)?,
                sender_id: row.get(1)?,
                receiver_id: row.get(2)?,
                content: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
