use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::config::DestinationSeed;
use crate::error::GraphError;
use crate::graph::GraphClient;
use crate::models::DestinationKind;
use crate::{metrics, store};

/// How a Graph listing call went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Success,
    NoPermission,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceReport {
    pub status: SyncStatus,
    pub found: usize,
    pub created: usize,
    pub error: Option<String>,
}

impl SourceReport {
    fn failed(source: &str, error: &GraphError) -> Self {
        let status = match error {
            GraphError::NoPermission(_) => SyncStatus::NoPermission,
            _ => SyncStatus::Error,
        };
        warn!(source, error = %error, "could not list destinations");
        Self {
            status,
            found: 0,
            created: 0,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    pub pages: SourceReport,
    pub groups: SourceReport,
    /// Destinations whose capability check could not run.
    pub unchecked: usize,
}

/// Register every page and group a user token can reach.
///
/// Pages are stored with their own page token, groups with the user token.
/// A listing the token is not allowed to read is reported, not fatal. With
/// `check_capabilities`, each synced destination then gets its publish and
/// metrics permissions checked and stored.
pub async fn sync_destinations(
    pool: &SqlitePool,
    graph: &GraphClient,
    user_token: &str,
    check_capabilities: bool,
) -> Result<DiscoveryReport> {
    let mut synced = Vec::new();

    let pages = match graph.list_pages(user_token).await {
        Ok(pages) => {
            let seeds: Vec<_> = pages
                .into_iter()
                .filter_map(|page| match page.access_token {
                    Some(access_token) => Some(DestinationSeed {
                        name: page.name,
                        kind: DestinationKind::Page,
                        external_id: page.id,
                        category: page.category,
                        access_token,
                        is_active: true,
                    }),
                    None => {
                        warn!(page_id = %page.id, "page listed without a page token, skipping");
                        None
                    }
                })
                .collect();
            record(pool, &seeds, &mut synced).await?
        }
        Err(e) => SourceReport::failed("pages", &e),
    };

    let groups = match graph.list_groups(user_token).await {
        Ok(groups) => {
            let seeds: Vec<_> = groups
                .into_iter()
                .map(|group| DestinationSeed {
                    name: group.name,
                    kind: DestinationKind::Group,
                    external_id: group.id,
                    category: None,
                    access_token: user_token.to_string(),
                    is_active: true,
                })
                .collect();
            record(pool, &seeds, &mut synced).await?
        }
        Err(e) => SourceReport::failed("groups", &e),
    };

    let mut unchecked = 0;
    if check_capabilities {
        for id in &synced {
            let Some(destination) = store::find_destination(pool, id).await? else {
                continue;
            };
            if let Err(e) = metrics::sync_destination(pool, graph, &destination).await {
                warn!(destination = %destination.name, error = %e, "capability check failed");
                unchecked += 1;
            }
        }
    }

    info!(
        pages = pages.found,
        groups = groups.found,
        created = pages.created + groups.created,
        unchecked,
        "destination discovery finished"
    );
    Ok(DiscoveryReport {
        pages,
        groups,
        unchecked,
    })
}

async fn record(pool: &SqlitePool, seeds: &[DestinationSeed], synced: &mut Vec<String>) -> Result<SourceReport> {
    let mut created = 0;
    for seed in seeds {
        let (id, is_new) = store::record_discovered_destination(pool, seed).await?;
        if is_new {
            created += 1;
        }
        synced.push(id);
    }
    Ok(SourceReport {
        status: SyncStatus::Success,
        found: seeds.len(),
        created,
        error: None,
    })
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::config::GraphConfig;
    use crate::db::memory_pool;
    use crate::testutil::seed_destination;

    fn graph(server: &MockServer) -> GraphClient {
        GraphClient::new(&GraphConfig {
            base_url: server.uri(),
            timeout: "5s".into(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn pages_sync_even_without_group_access() {
        let pool = memory_pool().await;
        let known = seed_destination(&pool, "Old Name", "101").await;
        sqlx::query("UPDATE destinations SET is_active = 0 WHERE id = ?")
            .bind(&known.id)
            .execute(&pool)
            .await
            .unwrap();

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/me/accounts"))
            .and(query_param("access_token", "user-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"id": "101", "name": "TechCo", "category": "Software", "access_token": "fresh-101"},
                    {"id": "102", "name": "Bakery", "access_token": "t102"},
                    {"id": "103", "name": "No Token"}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/me/groups"))
            .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
                "error": {"message": "Requires groups_access_member_info", "code": 10}
            })))
            .mount(&server)
            .await;

        let report = sync_destinations(&pool, &graph(&server), "user-token", false).await.unwrap();
        assert_eq!(report.pages.status, SyncStatus::Success);
        assert_eq!((report.pages.found, report.pages.created), (2, 1));
        assert_eq!(report.groups.status, SyncStatus::NoPermission);
        assert_eq!(report.groups.found, 0);

        let refreshed = store::find_destination(&pool, "101").await.unwrap().unwrap();
        assert_eq!(refreshed.id, known.id);
        assert_eq!(refreshed.name, "TechCo");
        assert_eq!(refreshed.category.as_deref(), Some("Software"));
        assert_eq!(refreshed.access_token, "fresh-101");
        // Deactivated by hand, stays that way
        assert!(!refreshed.is_active);

        let bakery = store::find_destination(&pool, "102").await.unwrap().unwrap();
        assert_eq!(bakery.kind, DestinationKind::Page);
        assert!(bakery.is_active);
        assert!(store::find_destination(&pool, "103").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn groups_use_the_user_token_and_get_checked() {
        let pool = memory_pool().await;
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/me/accounts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/me/groups"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"id": "g1", "name": "Makers", "privacy": "CLOSED", "administrator": true}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/g1/feed"))
            .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
                "error": {"message": "Requires publish_to_groups", "code": 200}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/g1"))
            .and(query_param("access_token", "user-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "g1", "name": "Makers"})))
            .mount(&server)
            .await;

        let report = sync_destinations(&pool, &graph(&server), "user-token", true).await.unwrap();
        assert_eq!((report.groups.found, report.groups.created), (1, 1));
        assert_eq!(report.unchecked, 0);

        let group = store::find_destination(&pool, "g1").await.unwrap().unwrap();
        assert_eq!(group.kind, DestinationKind::Group);
        assert_eq!(group.access_token, "user-token");
        assert!(!group.can_publish);
        assert!(group.can_read_metrics);
        assert!(group.last_sync.is_some());
    }
}
