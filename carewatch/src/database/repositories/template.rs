//! Notification template repository.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use sqlx::SqlitePool;
use tracing::debug;

use crate::database::models::NotificationTemplateDbModel;
use crate::database::time::datetime_to_ms;
use crate::domain::template::DEFAULT_LANGUAGE;
use crate::domain::{NotificationTemplate, RiskKind, Severity};
use crate::{Error, Result};

/// Template repository trait.
#[async_trait]
pub trait TemplateRepository: Send + Sync {
    async fn upsert(&self, template: &NotificationTemplate) -> Result<()>;
    async fn get(&self, code: &str) -> Result<NotificationTemplate>;
    async fn list_active(&self) -> Result<Vec<NotificationTemplate>>;
    /// Active template for exactly this kind, severity (`None` = severity-agnostic)
    /// and language.
    async fn find(
        &self,
        kind: RiskKind,
        severity: Option<Severity>,
        language: &str,
    ) -> Result<Option<NotificationTemplate>>;
    async fn increment_usage(&self, code: &str) -> Result<()>;

    /// Resolve the template for an event.
    ///
    /// Tries the exact severity, then the severity-agnostic template, first in
    /// the requested language and then in the default language. Falls back to
    /// the built-in generic template.
    async fn resolve(
        &self,
        kind: RiskKind,
        severity: Severity,
        language: &str,
    ) -> Result<NotificationTemplate> {
        let mut languages = vec![language.to_ascii_lowercase()];
        if !language.eq_ignore_ascii_case(DEFAULT_LANGUAGE) {
            languages.push(DEFAULT_LANGUAGE.to_string());
        }
        for lang in &languages {
            for candidate in [Some(severity), None] {
                if let Some(template) = self.find(kind, candidate, lang).await? {
                    return Ok(template);
                }
            }
        }
        debug!(kind = %kind, severity = %severity, language, "No template configured, using generic");
        Ok(NotificationTemplate::generic(kind))
    }
}

/// SQLx implementation of TemplateRepository.
pub struct SqlxTemplateRepository {
    pool: SqlitePool,
}

impl SqlxTemplateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TemplateRepository for SqlxTemplateRepository {
    async fn upsert(&self, template: &NotificationTemplate) -> Result<()> {
        template.validate()?;
        let row = NotificationTemplateDbModel::from_domain(template)?;
        let now = datetime_to_ms(chrono::Utc::now());
        sqlx::query(
            r#"
            INSERT INTO notification_templates (
                code, event_kind, severity, language_code, title_template, body_template,
                channel_templates, priority, requires_immediate_action, escalation_minutes,
                max_retries, retry_interval_seconds, active, usage_count, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
            ON CONFLICT(code) DO UPDATE SET
                event_kind = excluded.event_kind,
                severity = excluded.severity,
                language_code = excluded.language_code,
                title_template = excluded.title_template,
                body_template = excluded.body_template,
                channel_templates = excluded.channel_templates,
                priority = excluded.priority,
                requires_immediate_action = excluded.requires_immediate_action,
                escalation_minutes = excluded.escalation_minutes,
                max_retries = excluded.max_retries,
                retry_interval_seconds = excluded.retry_interval_seconds,
                active = excluded.active,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&row.code)
        .bind(&row.event_kind)
        .bind(&row.severity)
        .bind(&row.language_code)
        .bind(&row.title_template)
        .bind(&row.body_template)
        .bind(&row.channel_templates)
        .bind(&row.priority)
        .bind(row.requires_immediate_action)
        .bind(row.escalation_minutes)
        .bind(row.max_retries)
        .bind(row.retry_interval_seconds)
        .bind(row.active)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, code: &str) -> Result<NotificationTemplate> {
        sqlx::query_as::<_, NotificationTemplateDbModel>(
            "SELECT * FROM notification_templates WHERE code = ?",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::not_found("NotificationTemplate", code))?
        .into_domain()
    }

    async fn list_active(&self) -> Result<Vec<NotificationTemplate>> {
        let rows = sqlx::query_as::<_, NotificationTemplateDbModel>(
            "SELECT * FROM notification_templates WHERE active = 1 ORDER BY code",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(NotificationTemplateDbModel::into_domain)
            .collect()
    }

    async fn find(
        &self,
        kind: RiskKind,
        severity: Option<Severity>,
        language: &str,
    ) -> Result<Option<NotificationTemplate>> {
        // `IS` compares NULL-safely, so a NULL binding selects severity-agnostic rows.
        sqlx::query_as::<_, NotificationTemplateDbModel>(
            r#"
            SELECT * FROM notification_templates
            WHERE event_kind = ? AND severity IS ? AND language_code = ? AND active = 1
            ORDER BY code
            LIMIT 1
            "#,
        )
        .bind(kind.as_str())
        .bind(severity.map(|s| s.as_str()))
        .bind(language.to_ascii_lowercase())
        .fetch_optional(&self.pool)
        .await?
        .map(NotificationTemplateDbModel::into_domain)
        .transpose()
    }

    async fn increment_usage(&self, code: &str) -> Result<()> {
        sqlx::query(
            "UPDATE notification_templates SET usage_count = usage_count + 1 WHERE code = ?",
        )
        .bind(code)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-memory template catalog.
#[derive(Default)]
pub struct MemoryTemplateRepository {
    templates: RwLock<HashMap<String, NotificationTemplate>>,
}

impl MemoryTemplateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_templates(templates: impl IntoIterator<Item = NotificationTemplate>) -> Result<Self> {
        let repo = Self::new();
        {
            let mut map = repo.templates.write();
            for template in templates {
                template.validate()?;
                map.insert(template.code.clone(), template);
            }
        }
        Ok(repo)
    }
}

#[async_trait]
impl TemplateRepository for MemoryTemplateRepository {
    async fn upsert(&self, template: &NotificationTemplate) -> Result<()> {
        template.validate()?;
        let mut map = self.templates.write();
        let usage_count = map.get(&template.code).map_or(0, |t| t.usage_count);
        let mut stored = template.clone();
        stored.usage_count = usage_count;
        map.insert(stored.code.clone(), stored);
        Ok(())
    }

    async fn get(&self, code: &str) -> Result<NotificationTemplate> {
        self.templates
            .read()
            .get(code)
            .cloned()
            .ok_or_else(|| Error::not_found("NotificationTemplate", code))
    }

    async fn list_active(&self) -> Result<Vec<NotificationTemplate>> {
        let mut list: Vec<NotificationTemplate> = self
            .templates
            .read()
            .values()
            .filter(|t| t.active)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(list)
    }

    async fn find(
        &self,
        kind: RiskKind,
        severity: Option<Severity>,
        language: &str,
    ) -> Result<Option<NotificationTemplate>> {
        let map = self.templates.read();
        let mut matches: Vec<&NotificationTemplate> = map
            .values()
            .filter(|t| t.matches(kind, severity, language))
            .collect();
        matches.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(matches.first().map(|t| (*t).clone()))
    }

    async fn increment_usage(&self, code: &str) -> Result<()> {
        if let Some(template) = self.templates.write().get_mut(code) {
            template.usage_count += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::init_memory_pool;

    fn template(code: &str, severity: Option<Severity>, language: &str) -> NotificationTemplate {
        let mut t = NotificationTemplate::generic(RiskKind::Fall);
        t.code = code.to_string();
        t.severity = severity;
        t.language_code = language.to_string();
        t
    }

    async fn check_resolution(repo: &dyn TemplateRepository) {
        repo.upsert(&template("fall_any_en", None, "en")).await.unwrap();
        repo.upsert(&template("fall_high_es", Some(Severity::High), "es"))
            .await
            .unwrap();

        let exact = repo.resolve(RiskKind::Fall, Severity::High, "es").await.unwrap();
        assert_eq!(exact.code, "fall_high_es");

        // No Spanish LOW template, no severity-agnostic Spanish one: default language.
        let fallback = repo.resolve(RiskKind::Fall, Severity::Low, "es").await.unwrap();
        assert_eq!(fallback.code, "fall_any_en");

        let generic = repo
            .resolve(RiskKind::Wandering, Severity::High, "en")
            .await
            .unwrap();
        assert_eq!(generic.code, crate::domain::template::GENERIC_TEMPLATE_CODE);

        repo.increment_usage("fall_any_en").await.unwrap();
        repo.increment_usage("fall_any_en").await.unwrap();
        assert_eq!(repo.get("fall_any_en").await.unwrap().usage_count, 2);
    }

    #[tokio::test]
    async fn test_memory_resolution() {
        let repo = MemoryTemplateRepository::new();
        check_resolution(&repo).await;
    }

    #[tokio::test]
    async fn test_sqlite_resolution() {
        let pool = init_memory_pool().await.unwrap();
        let repo = SqlxTemplateRepository::new(pool);
        check_resolution(&repo).await;
    }

    #[tokio::test]
    async fn test_inactive_templates_are_skipped() {
        let pool = init_memory_pool().await.unwrap();
        let repo = SqlxTemplateRepository::new(pool);
        let mut t = template("fall_high_en", Some(Severity::High), "en");
        t.active = false;
        repo.upsert(&t).await.unwrap();

        let resolved = repo.resolve(RiskKind::Fall, Severity::High, "en").await.unwrap();
        assert_eq!(resolved.code, crate::domain::template::GENERIC_TEMPLATE_CODE);
        assert!(repo.list_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_rejects_invalid_template() {
        let repo = MemoryTemplateRepository::new();
        let mut t = template("broken", None, "en");
        t.escalation_minutes = 0;
        assert!(matches!(repo.upsert(&t).await, Err(Error::Validation(_))));
    }
}
