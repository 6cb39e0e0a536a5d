//! Queries for the detection_rules table

use chrono::Utc;
use playguard_common::types::{DetectionRule, RuleType, Severity};
use playguard_common::{Error, Result};
use sqlx::{Row, SqlitePool};

use crate::detect::rules::default_rules;

/// Install the default rule set on first run. Existing rows are left
/// untouched.
pub async fn ensure_default_rules(pool: &SqlitePool) -> Result<()> {
    for rule in default_rules() {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO detection_rules (rule_type, enabled, config, severity, updated_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(rule.rule_type.as_str())
        .bind(rule.enabled as i64)
        .bind(rule.config.to_string())
        .bind(rule.severity.as_str())
        .bind(rule.updated_at)
        .execute(pool)
        .await?;
    }

    Ok(())
}

/// All rules.
pub async fn list_rules(pool: &SqlitePool) -> Result<Vec<DetectionRule>> {
    let rows = sqlx::query("SELECT * FROM detection_rules ORDER BY rule_type ASC")
        .fetch_all(pool)
        .await?;

    rows.iter().map(row_to_rule).collect()
}

/// One rule by type.
pub async fn get_rule(pool: &SqlitePool, rule_type: RuleType) -> Result<Option<DetectionRule>> {
    let row = sqlx::query("SELECT * FROM detection_rules WHERE rule_type = ?")
        .bind(rule_type.as_str())
        .fetch_optional(pool)
        .await?;

    row.map(|r| row_to_rule(&r)).transpose()
}

/// Replace a rule's configuration. Takes effect for the next evaluated
/// event; in-flight evaluations keep the snapshot they loaded.
pub async fn update_rule(pool: &SqlitePool, rule: &DetectionRule) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE detection_rules SET enabled = ?, config = ?, severity = ?, updated_at = ?
        WHERE rule_type = ?
        "#,
    )
    .bind(rule.enabled as i64)
    .bind(rule.config.to_string())
    .bind(rule.severity.as_str())
    .bind(Utc::now())
    .bind(rule.rule_type.as_str())
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!(
            "rule {} not found",
            rule.rule_type.as_str()
        )));
    }

    Ok(())
}

fn row_to_rule(row: &sqlx::sqlite::SqliteRow) -> Result<DetectionRule> {
    let rule_type: String = row.try_get("rule_type")?;
    let enabled: i64 = row.try_get("enabled")?;
    let config: String = row.try_get("config")?;
    let severity: String = row.try_get("severity")?;

    Ok(DetectionRule {
        rule_type: RuleType::parse(&rule_type)?,
        enabled: enabled != 0,
        config: serde_json::from_str(&config)
            .map_err(|e| Error::Internal(format!("bad rule config: {}", e)))?,
        severity: Severity::parse(&severity)?,
        updated_at: row.try_get("updated_at")?,
    })
}
