//! HTTP client for the workspace REST API.
//!
//! All requests flow through one token bucket (3 req/s by default) shared by
//! every consumer in the process, so the reader, the matchers, and the
//! writer cannot jointly exceed the vendor's rate limit. Methods here are
//! single-attempt; callers wrap them in the retry policy and breaker
//! appropriate to their pipeline step.

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::num::NonZeroU32;

use crate::config::WorkspaceSettings;
use crate::error::{service, PipelineError, PipelineResult};
use crate::logging::{log_debug, log_warn};
use crate::secrets::SecretStore;

const API_VERSION: &str = "2022-06-28";
const PAGE_SIZE: u32 = 100;

/// Secret key holding the workspace integration token.
pub const TOKEN_KEY: &str = "WORKSPACE_API_TOKEN";

/// One page (row) as returned by the query endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Page {
    pub id: String,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct PageList {
    #[serde(default)]
    results: Vec<Page>,
    #[serde(default)]
    has_more: bool,
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserList {
    #[serde(default)]
    results: Vec<serde_json::Value>,
    #[serde(default)]
    has_more: bool,
    next_cursor: Option<String>,
}

/// One property in a database schema.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PropertySchema {
    pub prop_type: String,
    /// Target database for relation properties.
    pub relation_target: Option<String>,
    /// Option names for select properties.
    pub options: Vec<String>,
}

/// Discovered schema of one database.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DatabaseSchema {
    pub database_id: String,
    pub properties: BTreeMap<String, PropertySchema>,
}

/// Schemas for the root database plus its directly related databases.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SchemaTree {
    pub root: DatabaseSchema,
    pub related: BTreeMap<String, DatabaseSchema>,
}

/// Rate-limited workspace API client.
pub struct WorkspaceClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    limiter: DefaultDirectRateLimiter,
}

impl std::fmt::Debug for WorkspaceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl WorkspaceClient {
    /// Create the client, pulling the integration token from the secret
    /// store.
    pub fn new(settings: &WorkspaceSettings, secrets: &SecretStore) -> PipelineResult<Self> {
        let token = secrets.get(TOKEN_KEY)?;
        let rps = NonZeroU32::new(settings.requests_per_second.max(1))
            .expect("max(1) guarantees non-zero");
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| PipelineError::configuration(format!("workspace http client: {e}")))?;

        Ok(Self {
            http,
            base_url: settings.base_url.clone(),
            token,
            limiter: RateLimiter::direct(Quota::per_second(rps)),
        })
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> PipelineResult<serde_json::Value> {
        self.limiter.until_ready().await;
        let response = request
            .bearer_auth(&self.token)
            .header("Notion-Version", API_VERSION)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PipelineError::timeout(service::WORKSPACE, 30_000)
                } else {
                    PipelineError::network(service::WORKSPACE, e.to_string(), Some(Box::new(e)))
                }
            })?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        let body = response.text().await.map_err(|e| {
            PipelineError::network(service::WORKSPACE, e.to_string(), Some(Box::new(e)))
        })?;

        if !status.is_success() {
            return Err(PipelineError::from_status(
                service::WORKSPACE,
                status.as_u16(),
                body.chars().take(500).collect::<String>(),
                retry_after,
            ));
        }
        serde_json::from_str(&body).map_err(|e| {
            PipelineError::network(service::WORKSPACE, format!("invalid response JSON: {e}"), None)
        })
    }

    /// Retrieve one database's schema.
    pub async fn retrieve_schema(&self, database_id: &str) -> PipelineResult<DatabaseSchema> {
        let url = format!("{}/v1/databases/{}", self.base_url, database_id);
        let value = self.send(self.http.get(&url)).await?;

        let mut properties = BTreeMap::new();
        if let Some(props) = value.get("properties").and_then(|p| p.as_object()) {
            for (name, prop) in props {
                let prop_type = prop
                    .get("type")
                    .and_then(|t| t.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                let relation_target = prop
                    .get("relation")
                    .and_then(|r| r.get("database_id"))
                    .and_then(|d| d.as_str())
                    .map(str::to_string);
                let options = prop
                    .get("select")
                    .and_then(|s| s.get("options"))
                    .and_then(|o| o.as_array())
                    .map(|opts| {
                        opts.iter()
                            .filter_map(|o| o.get("name").and_then(|n| n.as_str()))
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                properties.insert(
                    name.clone(),
                    PropertySchema {
                        prop_type,
                        relation_target,
                        options,
                    },
                );
            }
        }
        Ok(DatabaseSchema {
            database_id: database_id.to_string(),
            properties,
        })
    }

    /// Discover the root schema plus one level of related databases.
    ///
    /// Relation resolution is depth-limited to a single hop with a visited
    /// set, so cyclic relation graphs terminate.
    pub async fn discover_schema_tree(&self, root_id: &str) -> PipelineResult<SchemaTree> {
        let root = self.retrieve_schema(root_id).await?;
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(root_id.to_string());

        let mut related = BTreeMap::new();
        for prop in root.properties.values() {
            let Some(target) = prop.relation_target.as_deref() else {
                continue;
            };
            if !visited.insert(target.to_string()) {
                log_debug!(database_id = %target, "Relation cycle broken during schema discovery");
                continue;
            }
            match self.retrieve_schema(target).await {
                Ok(schema) => {
                    related.insert(target.to_string(), schema);
                }
                Err(e) => {
                    log_warn!(database_id = %target, error = %e, "Related schema fetch failed");
                }
            }
        }
        Ok(SchemaTree { root, related })
    }

    /// Fetch every row of a database, following pagination.
    pub async fn query_all(&self, database_id: &str) -> PipelineResult<Vec<Page>> {
        let url = format!("{}/v1/databases/{}/query", self.base_url, database_id);
        let mut pages = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut body = json!({ "page_size": PAGE_SIZE });
            if let Some(ref c) = cursor {
                body["start_cursor"] = json!(c);
            }
            let value = self.send(self.http.post(&url).json(&body)).await?;
            let list: PageList = serde_json::from_value(value).map_err(|e| {
                PipelineError::network(service::WORKSPACE, format!("query page parse: {e}"), None)
            })?;
            pages.extend(list.results);
            if !list.has_more {
                break;
            }
            cursor = list.next_cursor;
            if cursor.is_none() {
                break;
            }
        }
        Ok(pages)
    }

    /// Find the page carrying `message_id`, if any (`page_size = 1`).
    pub async fn find_by_message_id(
        &self,
        database_id: &str,
        property: &str,
        message_id: &str,
    ) -> PipelineResult<Option<Page>> {
        let url = format!("{}/v1/databases/{}/query", self.base_url, database_id);
        let body = json!({
            "page_size": 1,
            "filter": {
                "property": property,
                "rich_text": { "equals": message_id }
            }
        });
        let value = self.send(self.http.post(&url).json(&body)).await?;
        let list: PageList = serde_json::from_value(value).map_err(|e| {
            PipelineError::network(service::WORKSPACE, format!("query page parse: {e}"), None)
        })?;
        Ok(list.results.into_iter().next())
    }

    /// Create a page in a database.
    pub async fn create_page(
        &self,
        database_id: &str,
        properties: serde_json::Value,
    ) -> PipelineResult<Page> {
        let url = format!("{}/v1/pages", self.base_url);
        let body = json!({
            "parent": { "database_id": database_id },
            "properties": properties,
        });
        let value = self.send(self.http.post(&url).json(&body)).await?;
        serde_json::from_value(value).map_err(|e| {
            PipelineError::network(service::WORKSPACE, format!("create page parse: {e}"), None)
        })
    }

    /// Update an existing page's properties.
    pub async fn update_page(
        &self,
        page_id: &str,
        properties: serde_json::Value,
    ) -> PipelineResult<Page> {
        let url = format!("{}/v1/pages/{}", self.base_url, page_id);
        let body = json!({ "properties": properties });
        let value = self.send(self.http.patch(&url).json(&body)).await?;
        serde_json::from_value(value).map_err(|e| {
            PipelineError::network(service::WORKSPACE, format!("update page parse: {e}"), None)
        })
    }

    /// List workspace users, following pagination.
    pub async fn list_users(&self) -> PipelineResult<Vec<serde_json::Value>> {
        let mut users = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut url = format!("{}/v1/users?page_size={}", self.base_url, PAGE_SIZE);
            if let Some(ref c) = cursor {
                url.push_str(&format!("&start_cursor={c}"));
            }
            let value = self.send(self.http.get(&url)).await?;
            let list: UserList = serde_json::from_value(value).map_err(|e| {
                PipelineError::network(service::WORKSPACE, format!("user list parse: {e}"), None)
            })?;
            users.extend(list.results);
            if !list.has_more {
                break;
            }
            cursor = list.next_cursor;
            if cursor.is_none() {
                break;
            }
        }
        Ok(users)
    }
}

/// Pull plain text out of a title or rich_text property value.
pub fn plain_text(property: &serde_json::Value) -> Option<String> {
    let fragments = property
        .get("title")
        .or_else(|| property.get("rich_text"))?
        .as_array()?;
    let text: String = fragments
        .iter()
        .filter_map(|f| f.get("plain_text").and_then(|t| t.as_str()))
        .collect();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Pull the option name out of a select property value.
pub fn select_name(property: &serde_json::Value) -> Option<String> {
    property
        .get("select")?
        .get("name")?
        .as_str()
        .map(str::to_string)
}
