//! File-backed TTL caches over workspace data.
//!
//! Three caches: schema (24 h), companies (6 h), users (24 h). Each is a
//! JSON file with `cached_at` and `ttl_seconds` alongside the data;
//! invalidation is lazy on read, and a stale or unreadable file simply
//! triggers a refetch. Fetches go through the retry policy so one blip
//! doesn't invalidate a whole cycle.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use super::client::{plain_text, select_name, SchemaTree, WorkspaceClient};
use crate::config::WorkspaceSettings;
use crate::error::{service, PipelineResult};
use crate::internals::fs::{atomic_write_json, read_json};
use crate::logging::{log_debug, log_info, log_warn};
use crate::retry::{retry, RetryPolicy};

const SCHEMA_TTL_SECONDS: u64 = 24 * 60 * 60;
const COMPANIES_TTL_SECONDS: u64 = 6 * 60 * 60;
const USERS_TTL_SECONDS: u64 = 24 * 60 * 60;

/// Select property on Companies marking portfolio/affiliate membership.
const COMPANY_GROUP_PROPERTY: &str = "Category";

/// Portfolio/affiliate membership of a company.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompanyGroup {
    Portfolio,
    Affiliate,
}

/// One Companies row as the matchers see it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyRow {
    pub id: String,
    pub name: String,
    pub group: Option<CompanyGroup>,
}

/// Person or bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceUserType {
    Person,
    Bot,
}

/// One workspace user as the matchers see it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceUser {
    pub id: String,
    pub name: String,
    pub user_type: WorkspaceUserType,
    pub email: Option<String>,
}

/// On-disk envelope for a cached payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedFile<T> {
    cached_at: DateTime<Utc>,
    ttl_seconds: u64,
    data: T,
}

impl<T> CachedFile<T> {
    fn is_fresh(&self) -> bool {
        let age = Utc::now().signed_duration_since(self.cached_at);
        age.num_seconds() >= 0 && (age.num_seconds() as u64) < self.ttl_seconds
    }
}

/// Lazy TTL caches in front of the workspace reader.
#[derive(Debug)]
pub struct WorkspaceCaches {
    dir: PathBuf,
    client: Arc<WorkspaceClient>,
    settings: WorkspaceSettings,
}

impl WorkspaceCaches {
    pub fn new(dir: PathBuf, client: Arc<WorkspaceClient>, settings: WorkspaceSettings) -> Self {
        Self {
            dir,
            client,
            settings,
        }
    }

    async fn load_fresh<T: DeserializeOwned>(&self, file: &str) -> Option<T> {
        let path = self.dir.join(file);
        match read_json::<CachedFile<T>>(&path).await {
            Ok(Some(cached)) if cached.is_fresh() => Some(cached.data),
            Ok(Some(_)) => {
                log_debug!(file = %file, "Cache expired, refetching");
                None
            }
            Ok(None) => None,
            Err(e) => {
                log_warn!(file = %file, error = %e, "Cache unreadable, refetching");
                None
            }
        }
    }

    async fn store<T: Serialize>(&self, file: &str, data: &T, ttl_seconds: u64) {
        let path = self.dir.join(file);
        let envelope = CachedFile {
            cached_at: Utc::now(),
            ttl_seconds,
            data,
        };
        if let Err(e) = atomic_write_json(&path, &envelope).await {
            log_warn!(file = %file, error = %e, "Cache persistence failed");
        }
    }

    /// Schema tree of the Collaborations database, cached 24 h per session.
    pub async fn schema(&self) -> PipelineResult<SchemaTree> {
        if let Some(tree) = self.load_fresh::<SchemaTree>("schema.json").await {
            return Ok(tree);
        }
        let client = Arc::clone(&self.client);
        let db_id = self.settings.collaborations_db_id.clone();
        let tree = retry(service::WORKSPACE, &RetryPolicy::workspace(), || {
            let client = Arc::clone(&client);
            let db_id = db_id.clone();
            async move { client.discover_schema_tree(&db_id).await }
        })
        .await?
        .value;
        self.store("schema.json", &tree, SCHEMA_TTL_SECONDS).await;
        Ok(tree)
    }

    /// All Companies rows, cached 6 h.
    pub async fn companies(&self) -> PipelineResult<Vec<CompanyRow>> {
        if let Some(rows) = self.load_fresh::<Vec<CompanyRow>>("companies.json").await {
            return Ok(rows);
        }
        let client = Arc::clone(&self.client);
        let db_id = self.settings.companies_db_id.clone();
        let pages = retry(service::WORKSPACE, &RetryPolicy::workspace(), || {
            let client = Arc::clone(&client);
            let db_id = db_id.clone();
            async move { client.query_all(&db_id).await }
        })
        .await?
        .value;

        let rows: Vec<CompanyRow> = pages
            .iter()
            .filter_map(|page| {
                let name = page
                    .properties
                    .values()
                    .find_map(|prop| prop.get("title").map(|_| plain_text(prop)))
                    .flatten()?;
                let group = page
                    .properties
                    .get(COMPANY_GROUP_PROPERTY)
                    .and_then(select_name)
                    .and_then(|label| match label.as_str() {
                        "Portfolio" => Some(CompanyGroup::Portfolio),
                        "Affiliate" => Some(CompanyGroup::Affiliate),
                        _ => None,
                    });
                Some(CompanyRow {
                    id: page.id.clone(),
                    name,
                    group,
                })
            })
            .collect();
        log_info!(count = rows.len(), "Companies cache refreshed");
        self.store("companies.json", &rows, COMPANIES_TTL_SECONDS).await;
        Ok(rows)
    }

    /// All workspace users, cached 24 h. Bots are kept (with their type) so
    /// the matcher can filter them without refetching.
    pub async fn users(&self) -> PipelineResult<Vec<WorkspaceUser>> {
        if let Some(users) = self.load_fresh::<Vec<WorkspaceUser>>("users.json").await {
            return Ok(users);
        }
        let client = Arc::clone(&self.client);
        let raw = retry(service::WORKSPACE, &RetryPolicy::workspace(), || {
            let client = Arc::clone(&client);
            async move { client.list_users().await }
        })
        .await?
        .value;

        let users: Vec<WorkspaceUser> = raw
            .iter()
            .filter_map(|value| {
                let id = value.get("id")?.as_str()?.to_string();
                let name = value.get("name")?.as_str()?.to_string();
                let user_type = match value.get("type").and_then(|t| t.as_str()) {
                    Some("bot") => WorkspaceUserType::Bot,
                    _ => WorkspaceUserType::Person,
                };
                let email = value
                    .get("person")
                    .and_then(|p| p.get("email"))
                    .and_then(|e| e.as_str())
                    .map(str::to_string);
                Some(WorkspaceUser {
                    id,
                    name,
                    user_type,
                    email,
                })
            })
            .collect();
        log_info!(count = users.len(), "Users cache refreshed");
        self.store("users.json", &users, USERS_TTL_SECONDS).await;
        Ok(users)
    }

    /// Record a company created mid-cycle so match legality holds without a
    /// refetch before the next TTL expiry.
    ///
    /// Only a fresh cache is appended to; a stale or missing one is left to
    /// the next full refetch, which will include the new row anyway.
    pub async fn note_created_company(&self, row: CompanyRow) {
        match self.load_fresh::<Vec<CompanyRow>>("companies.json").await {
            Some(mut rows) => {
                rows.push(row);
                self.store("companies.json", &rows, COMPANIES_TTL_SECONDS).await;
            }
            None => self.invalidate_companies().await,
        }
    }

    /// Drop the companies cache, forcing a refetch on next read.
    pub async fn invalidate_companies(&self) {
        let path = self.dir.join("companies.json");
        let _ = tokio::fs::remove_file(&path).await;
    }

    pub fn settings(&self) -> &WorkspaceSettings {
        &self.settings
    }
}
