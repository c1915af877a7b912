//! Alert rule and alert persistence
//!
//! Sibling tables of the event log. Operator transitions are validated and
//! applied inside the store's write lock, which linearises them per alert.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::alerts::{Alert, AlertRule, AlertRuleSpec, AlertStatus, Notifications, Severity};
use crate::topic::TopicPattern;

use super::{Store, StoreError};

fn millis_ts(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}

fn severity_from_str(s: &str) -> Severity {
    match s {
        "info" => Severity::Info,
        "critical" => Severity::Critical,
        _ => Severity::Warning,
    }
}

fn severity_str(s: Severity) -> &'static str {
    match s {
        Severity::Info => "info",
        Severity::Warning => "warning",
        Severity::Critical => "critical",
    }
}

fn status_from_str(s: &str) -> AlertStatus {
    match s {
        "analyzing" => AlertStatus::Analyzing,
        "acknowledged" => AlertStatus::Acknowledged,
        "resolved" => AlertStatus::Resolved,
        _ => AlertStatus::New,
    }
}

fn row_rule(row: &Row<'_>) -> rusqlite::Result<AlertRule> {
    let pattern: String = row.get(2)?;
    let topic_pattern = TopicPattern::compile(&pattern).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let severity: String = row.get(3)?;
    Ok(AlertRule {
        id: row.get(0)?,
        name: row.get(1)?,
        topic_pattern,
        severity: severity_from_str(&severity),
        condition_code: row.get(4)?,
        workflow_prompt: row.get(5)?,
        notifications: Notifications {
            webhook: row.get(6)?,
        },
        created_at: millis_ts(row.get(7)?),
        updated_at: millis_ts(row.get(8)?),
    })
}

fn row_alert(row: &Row<'_>) -> rusqlite::Result<Alert> {
    let trigger: Vec<u8> = row.get(4)?;
    let severity: String = row.get(5)?;
    let status: String = row.get(6)?;
    Ok(Alert {
        id: row.get(0)?,
        rule_id: row.get(1)?,
        rule_name: row.get(2)?,
        topic: row.get(3)?,
        trigger_value: serde_json::from_slice(&trigger)
            .unwrap_or_else(|_| serde_json::Value::from(String::from_utf8_lossy(&trigger).into_owned())),
        severity: severity_from_str(&severity),
        status: status_from_str(&status),
        created_at: millis_ts(row.get(7)?),
        updated_at: millis_ts(row.get(8)?),
        handled_by: row.get(9)?,
        analysis_result: row.get(10)?,
    })
}

const ALERT_COLUMNS: &str = "id, rule_id, rule_name, topic, trigger_value, severity, status, \
                             created_at, updated_at, handled_by, analysis_result";

impl Store {
    // ------------------------------------------------------------------
    // Alert rules
    // ------------------------------------------------------------------

    pub fn list_alert_rules(&self) -> Result<Vec<AlertRule>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, topic_pattern, severity, condition_code, workflow_prompt, \
             webhook, created_at, updated_at FROM alert_rules ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_rule)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn insert_alert_rule(&self, spec: &AlertRuleSpec) -> Result<AlertRule, StoreError> {
        let now = Utc::now();
        let rule = AlertRule {
            id: format!("rule_{}", uuid::Uuid::new_v4().simple()),
            name: spec.name.clone(),
            topic_pattern: spec.topic_pattern.clone(),
            severity: spec.severity,
            condition_code: spec.condition_code.clone(),
            workflow_prompt: spec.workflow_prompt.clone(),
            notifications: spec.notifications.clone(),
            created_at: now,
            updated_at: now,
        };

        self.lock().execute(
            "INSERT INTO alert_rules \
             (id, name, topic_pattern, severity, condition_code, workflow_prompt, webhook, \
              created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                rule.id,
                rule.name,
                rule.topic_pattern.as_str(),
                severity_str(rule.severity),
                rule.condition_code,
                rule.workflow_prompt,
                rule.notifications.webhook,
                now.timestamp_millis(),
                now.timestamp_millis(),
            ],
        )?;

        Ok(rule)
    }

    pub fn update_alert_rule(
        &self,
        id: &str,
        spec: &AlertRuleSpec,
    ) -> Result<AlertRule, StoreError> {
        let now = Utc::now();
        let changed = self.lock().execute(
            "UPDATE alert_rules SET name = ?2, topic_pattern = ?3, severity = ?4, \
             condition_code = ?5, workflow_prompt = ?6, webhook = ?7, updated_at = ?8 \
             WHERE id = ?1",
            params![
                id,
                spec.name,
                spec.topic_pattern.as_str(),
                severity_str(spec.severity),
                spec.condition_code,
                spec.workflow_prompt,
                spec.notifications.webhook,
                now.timestamp_millis(),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }

        self.get_alert_rule(id)?.ok_or(StoreError::NotFound)
    }

    pub fn get_alert_rule(&self, id: &str) -> Result<Option<AlertRule>, StoreError> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                "SELECT id, name, topic_pattern, severity, condition_code, workflow_prompt, \
                 webhook, created_at, updated_at FROM alert_rules WHERE id = ?1",
                [id],
                row_rule,
            )
            .optional()?)
    }

    pub fn delete_alert_rule(&self, id: &str) -> Result<(), StoreError> {
        let changed = self
            .lock()
            .execute("DELETE FROM alert_rules WHERE id = ?1", [id])?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Alerts
    // ------------------------------------------------------------------

    pub fn insert_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        self.lock().execute(
            &format!("INSERT INTO alerts ({ALERT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
            params![
                alert.id,
                alert.rule_id,
                alert.rule_name,
                alert.topic,
                serde_json::to_vec(&alert.trigger_value)?,
                severity_str(alert.severity),
                alert.status.as_str(),
                alert.created_at.timestamp_millis(),
                alert.updated_at.timestamp_millis(),
                alert.handled_by,
                alert.analysis_result,
            ],
        )?;
        Ok(())
    }

    pub fn get_alert(&self, id: &str) -> Result<Option<Alert>, StoreError> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                &format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE id = ?1"),
                [id],
                row_alert,
            )
            .optional()?)
    }

    /// Newest alerts, most recent first.
    pub fn list_alerts(&self, limit: usize) -> Result<Vec<Alert>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ALERT_COLUMNS} FROM alerts ORDER BY created_at DESC, id DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map([limit as i64], row_alert)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Latest alert for `(rule_id, topic)`, used by debounce.
    pub fn latest_alert_for(
        &self,
        rule_id: &str,
        topic: &str,
    ) -> Result<Option<Alert>, StoreError> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {ALERT_COLUMNS} FROM alerts \
                     WHERE rule_id = ?1 AND topic = ?2 \
                     ORDER BY created_at DESC, id DESC LIMIT 1"
                ),
                params![rule_id, topic],
                row_alert,
            )
            .optional()?)
    }

    /// Refresh `trigger_value` and `updated_at` on a debounced alert.
    pub fn touch_alert(
        &self,
        id: &str,
        trigger_value: &serde_json::Value,
    ) -> Result<(), StoreError> {
        self.lock().execute(
            "UPDATE alerts SET trigger_value = ?2, updated_at = ?3 WHERE id = ?1",
            params![
                id,
                serde_json::to_vec(trigger_value)?,
                Utc::now().timestamp_millis()
            ],
        )?;
        Ok(())
    }

    /// Operator transition, validated and linearised under the write lock.
    pub fn transition_alert(
        &self,
        id: &str,
        next: AlertStatus,
        handled_by: &str,
    ) -> Result<Alert, StoreError> {
        let conn = self.lock();

        let current: Option<String> = conn
            .query_row("SELECT status FROM alerts WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?;
        let current = status_from_str(&current.ok_or(StoreError::NotFound)?);

        if !current.can_transition_to(next) {
            return Err(StoreError::IllegalTransition {
                from: current.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }

        conn.execute(
            "UPDATE alerts SET status = ?2, updated_at = ?3, handled_by = ?4 WHERE id = ?1",
            params![
                id,
                next.as_str(),
                Utc::now().timestamp_millis(),
                handled_by
            ],
        )?;
        drop(conn);

        self.get_alert(id)?.ok_or(StoreError::NotFound)
    }

    /// Enrichment-side status update. Unlike operator transitions this may
    /// move `new → analyzing` and back, but never leaves `resolved`.
    pub fn set_alert_analysis(
        &self,
        id: &str,
        status: AlertStatus,
        analysis_result: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.lock();

        let current: Option<String> = conn
            .query_row("SELECT status FROM alerts WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?;
        let current = status_from_str(&current.ok_or(StoreError::NotFound)?);
        if current == AlertStatus::Resolved {
            return Ok(());
        }

        match analysis_result {
            Some(result) => conn.execute(
                "UPDATE alerts SET status = ?2, analysis_result = ?3, updated_at = ?4 \
                 WHERE id = ?1",
                params![id, status.as_str(), result, Utc::now().timestamp_millis()],
            )?,
            None => conn.execute(
                "UPDATE alerts SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, status.as_str(), Utc::now().timestamp_millis()],
            )?,
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(pattern: &str) -> AlertRuleSpec {
        AlertRuleSpec {
            name: "high temp".to_string(),
            topic_pattern: TopicPattern::compile(pattern).unwrap(),
            severity: Severity::Warning,
            condition_code: "return msg.payload.v > 70".to_string(),
            workflow_prompt: None,
            notifications: Notifications::default(),
        }
    }

    fn alert(id: &str, rule: &AlertRule, topic: &str) -> Alert {
        let now = Utc::now();
        Alert {
            id: id.to_string(),
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            topic: topic.to_string(),
            trigger_value: serde_json::json!({"v": 80}),
            severity: rule.severity,
            status: AlertStatus::New,
            created_at: now,
            updated_at: now,
            handled_by: None,
            analysis_result: None,
        }
    }

    #[test]
    fn rule_crud_round_trip() {
        let store = Store::open_in_memory().unwrap();

        let rule = store.insert_alert_rule(&spec("f/+/temp")).unwrap();
        assert_eq!(store.list_alert_rules().unwrap().len(), 1);

        let mut updated = spec("f/#");
        updated.severity = Severity::Critical;
        let rule2 = store.update_alert_rule(&rule.id, &updated).unwrap();
        assert_eq!(rule2.topic_pattern.as_str(), "f/#");
        assert_eq!(rule2.severity, Severity::Critical);

        store.delete_alert_rule(&rule.id).unwrap();
        assert!(store.list_alert_rules().unwrap().is_empty());
        assert!(matches!(
            store.delete_alert_rule(&rule.id),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn transition_rules_enforced() {
        let store = Store::open_in_memory().unwrap();
        let rule = store.insert_alert_rule(&spec("f/+/temp")).unwrap();
        store.insert_alert(&alert("a1", &rule, "f/1/temp")).unwrap();

        let a = store
            .transition_alert("a1", AlertStatus::Acknowledged, "op1")
            .unwrap();
        assert_eq!(a.status, AlertStatus::Acknowledged);
        assert_eq!(a.handled_by.as_deref(), Some("op1"));

        let a = store
            .transition_alert("a1", AlertStatus::Resolved, "op1")
            .unwrap();
        assert_eq!(a.status, AlertStatus::Resolved);

        // Resolved is absorbing
        assert!(matches!(
            store.transition_alert("a1", AlertStatus::Acknowledged, "op2"),
            Err(StoreError::IllegalTransition { .. })
        ));
    }

    #[test]
    fn analysis_update_skips_resolved() {
        let store = Store::open_in_memory().unwrap();
        let rule = store.insert_alert_rule(&spec("f/+/temp")).unwrap();
        store.insert_alert(&alert("a1", &rule, "f/1/temp")).unwrap();

        store
            .transition_alert("a1", AlertStatus::Resolved, "op")
            .unwrap();
        store
            .set_alert_analysis("a1", AlertStatus::New, Some("late analysis"))
            .unwrap();

        let a = store.get_alert("a1").unwrap().unwrap();
        assert_eq!(a.status, AlertStatus::Resolved);
        assert_eq!(a.analysis_result, None);
    }

    #[test]
    fn latest_alert_for_debounce_lookup() {
        let store = Store::open_in_memory().unwrap();
        let rule = store.insert_alert_rule(&spec("f/+/temp")).unwrap();
        store.insert_alert(&alert("a1", &rule, "f/1/temp")).unwrap();

        let found = store.latest_alert_for(&rule.id, "f/1/temp").unwrap();
        assert_eq!(found.map(|a| a.id), Some("a1".to_string()));
        assert!(store.latest_alert_for(&rule.id, "f/2/temp").unwrap().is_none());

        store
            .touch_alert("a1", &serde_json::json!({"v": 95}))
            .unwrap();
        let touched = store.get_alert("a1").unwrap().unwrap();
        assert_eq!(touched.trigger_value["v"], 95);
    }
}
