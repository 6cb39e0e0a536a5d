//! Queries for the user_trust table
//!
//! Trust scores are mutated only by the detection engine (penalties)
//! and the recovery scheduler. All writes clamp to [0, 100].

use chrono::Utc;
use playguard_common::types::UserTrust;
use playguard_common::Result;
use sqlx::{Row, SqlitePool};

/// Fetch a user's trust entry, if one exists.
pub async fn get_trust(pool: &SqlitePool, user: &str) -> Result<Option<UserTrust>> {
    let row = sqlx::query("SELECT * FROM user_trust WHERE user = ?")
        .bind(user)
        .fetch_optional(pool)
        .await?;

    row.map(|r| row_to_trust(&r)).transpose()
}

/// Fetch a user's trust entry, creating the initial ledger row lazily
/// on first evaluation.
pub async fn get_or_create_trust(pool: &SqlitePool, user: &str) -> Result<UserTrust> {
    if let Some(trust) = get_trust(pool, user).await? {
        return Ok(trust);
    }

    let fresh = UserTrust::new(user);
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO user_trust (user, score, violation_count, restricted, updated_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&fresh.user)
    .bind(fresh.score)
    .bind(fresh.violation_count)
    .bind(fresh.restricted as i64)
    .bind(fresh.updated_at)
    .execute(pool)
    .await?;

    // Re-read in case a concurrent caller won the insert race
    Ok(get_trust(pool, user).await?.unwrap_or(fresh))
}

/// Apply a violation penalty, floored at 0. Sets the restricted flag
/// when the score drops below the threshold. Returns the updated entry.
pub async fn apply_penalty(
    pool: &SqlitePool,
    user: &str,
    penalty: i64,
    restricted_threshold: i64,
) -> Result<UserTrust> {
    let current = get_or_create_trust(pool, user).await?;
    let score = (current.score - penalty).max(0);
    let restricted = score < restricted_threshold;
    let now = Utc::now();

    sqlx::query(
        r#"
        UPDATE user_trust SET
            score = ?,
            violation_count = violation_count + 1,
            restricted = ?,
            last_violation_at = ?,
            updated_at = ?
        WHERE user = ?
        "#,
    )
    .bind(score)
    .bind(restricted as i64)
    .bind(now)
    .bind(now)
    .bind(user)
    .execute(pool)
    .await?;

    Ok(UserTrust {
        score,
        violation_count: current.violation_count + 1,
        restricted,
        last_violation_at: Some(now),
        updated_at: now,
        ..current
    })
}

/// Recovery pass: raise every score below 100 by the given amount,
/// capped at 100, and clear the restricted flag for users whose score
/// climbs back to the threshold. Returns the number of users touched.
pub async fn recover_scores(
    pool: &SqlitePool,
    amount: i64,
    restricted_threshold: i64,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE user_trust SET
            score = MIN(100, score + ?),
            restricted = CASE WHEN MIN(100, score + ?) >= ? THEN 0 ELSE restricted END,
            updated_at = ?
        WHERE score < 100
        "#,
    )
    .bind(amount)
    .bind(amount)
    .bind(restricted_threshold)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// All trust entries, lowest score first.
pub async fn list_trust(pool: &SqlitePool, limit: i64, offset: i64) -> Result<Vec<UserTrust>> {
    let limit = if limit <= 0 || limit > 1000 { 100 } else { limit };
    let rows = sqlx::query(
        "SELECT * FROM user_trust ORDER BY score ASC, user ASC LIMIT ? OFFSET ?",
    )
    .bind(limit)
    .bind(offset.max(0))
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_trust).collect()
}

fn row_to_trust(row: &sqlx::sqlite::SqliteRow) -> Result<UserTrust> {
    let restricted: i64 = row.try_get("restricted")?;
    Ok(UserTrust {
        user: row.try_get("user")?,
        score: row.try_get("score")?,
        violation_count: row.try_get("violation_count")?,
        restricted: restricted != 0,
        last_violation_at: row.try_get("last_violation_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
