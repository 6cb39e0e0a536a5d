//! Queries for the alerts table

use playguard_common::types::{Alert, RuleType, Severity};
use playguard_common::{Error, Result};
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Persist a new alert.
pub async fn insert_alert(pool: &SqlitePool, alert: &Alert) -> Result<()> {
    let event_ids = serde_json::to_string(
        &alert.event_ids.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
    )
    .map_err(|e| Error::Internal(format!("serialize event ids: {}", e)))?;

    sqlx::query(
        r#"
        INSERT INTO alerts (
            id, rule_type, severity, user, server_id, event_ids, message, metadata,
            acknowledged, acknowledged_by, acknowledged_at, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(alert.id.to_string())
    .bind(alert.rule_type.as_str())
    .bind(alert.severity.as_str())
    .bind(&alert.user)
    .bind(alert.server_id.map(|id| id.to_string()))
    .bind(event_ids)
    .bind(&alert.message)
    .bind(alert.metadata.to_string())
    .bind(alert.acknowledged as i64)
    .bind(&alert.acknowledged_by)
    .bind(alert.acknowledged_at)
    .bind(alert.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Fetch one alert by id.
pub async fn get_alert(pool: &SqlitePool, id: Uuid) -> Result<Option<Alert>> {
    let row = sqlx::query("SELECT * FROM alerts WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;

    row.map(|r| row_to_alert(&r)).transpose()
}

/// Filter options for alert listing
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub user: Option<String>,
    pub severity: Option<Severity>,
    pub acknowledged: Option<bool>,
    pub limit: i64,
    pub offset: i64,
}

/// List alerts newest first with optional filtering. Returns the page
/// and the total matching count.
pub async fn list_alerts(pool: &SqlitePool, filter: &AlertFilter) -> Result<(Vec<Alert>, i64)> {
    let mut conditions = Vec::new();
    if filter.user.is_some() {
        conditions.push("user = ?");
    }
    if filter.severity.is_some() {
        conditions.push("severity = ?");
    }
    if filter.acknowledged.is_some() {
        conditions.push("acknowledged = ?");
    }
    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };

    let count_sql = format!("SELECT COUNT(*) FROM alerts{}", where_clause);
    let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
    if let Some(user) = &filter.user {
        count_query = count_query.bind(user.clone());
    }
    if let Some(severity) = filter.severity {
        count_query = count_query.bind(severity.as_str());
    }
    if let Some(ack) = filter.acknowledged {
        count_query = count_query.bind(ack as i64);
    }
    let total = count_query.fetch_one(pool).await?;

    let limit = if filter.limit <= 0 || filter.limit > 1000 { 100 } else { filter.limit };
    let offset = filter.offset.max(0);

    let list_sql = format!(
        "SELECT * FROM alerts{} ORDER BY created_at DESC LIMIT ? OFFSET ?",
        where_clause
    );
    let mut list_query = sqlx::query(&list_sql);
    if let Some(user) = &filter.user {
        list_query = list_query.bind(user.clone());
    }
    if let Some(severity) = filter.severity {
        list_query = list_query.bind(severity.as_str());
    }
    if let Some(ack) = filter.acknowledged {
        list_query = list_query.bind(ack as i64);
    }
    let rows = list_query.bind(limit).bind(offset).fetch_all(pool).await?;

    let alerts = rows.iter().map(row_to_alert).collect::<Result<Vec<_>>>()?;
    Ok((alerts, total))
}

/// Mark an alert acknowledged. The only mutation alerts ever receive.
pub async fn acknowledge_alert(pool: &SqlitePool, id: Uuid, acknowledged_by: &str) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE alerts SET acknowledged = 1, acknowledged_by = ?, acknowledged_at = ?
        WHERE id = ? AND acknowledged = 0
        "#,
    )
    .bind(acknowledged_by)
    .bind(Utc::now())
    .bind(id.to_string())
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!(
            "alert {} not found or already acknowledged",
            id
        )));
    }

    Ok(())
}

fn row_to_alert(row: &sqlx::sqlite::SqliteRow) -> Result<Alert> {
    let id: String = row.try_get("id")?;
    let rule_type: String = row.try_get("rule_type")?;
    let severity: String = row.try_get("severity")?;
    let server_id: Option<String> = row.try_get("server_id")?;
    let event_ids: String = row.try_get("event_ids")?;
    let metadata: String = row.try_get("metadata")?;
    let acknowledged: i64 = row.try_get("acknowledged")?;

    let event_id_strings: Vec<String> = serde_json::from_str(&event_ids)
        .map_err(|e| Error::Internal(format!("bad event id list: {}", e)))?;
    let event_ids = event_id_strings
        .iter()
        .map(|s| Uuid::parse_str(s))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Internal(format!("bad event id: {}", e)))?;

    Ok(Alert {
        id: Uuid::parse_str(&id).map_err(|e| Error::Internal(format!("bad alert id: {}", e)))?,
        rule_type: RuleType::parse(&rule_type)?,
        severity: Severity::parse(&severity)?,
        user: row.try_get("user")?,
        server_id: server_id
            .map(|s| Uuid::parse_str(&s))
            .transpose()
            .map_err(|e| Error::Internal(format!("bad server id: {}", e)))?,
        event_ids,
        message: row.try_get("message")?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        acknowledged: acknowledged != 0,
        acknowledged_by: row.try_get("acknowledged_by")?,
        acknowledged_at: row.try_get("acknowledged_at")?,
        created_at: row.try_get("created_at")?,
    })
}
