//! 目录只读工具：按字段搜索团队、并发列出多个团队的频道

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::registry::{Tool, ToolError};
use super::schema::{parameters_schema, parse_args};
use crate::graph::{collect_pages, FetchOrchestrator, GraphTransport};

fn default_filter_field() -> String {
    "displayName".to_string()
}

/// 字段值（字符串）包含搜索串，不区分大小写；未给搜索串时全部保留
fn matches_field(item: &Value, field: &str, needle: Option<&str>) -> bool {
    let Some(needle) = needle.filter(|n| !n.is_empty()) else {
        return true;
    };
    item.get(field)
        .and_then(Value::as_str)
        .map(|v| v.to_lowercase().contains(&needle.to_lowercase()))
        .unwrap_or(false)
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SearchTeamsArgs {
    /// 在团队属性中查找的字符串
    search_string: String,
    /// 查找的字段，默认 displayName
    #[serde(default = "default_filter_field")]
    filter_field: String,
}

/// search_teams：列出租户内的团队并按字段过滤
pub struct SearchTeamsTool {
    transport: GraphTransport,
}

impl SearchTeamsTool {
    pub fn new(transport: GraphTransport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Tool for SearchTeamsTool {
    fn name(&self) -> &str {
        "search_teams"
    }

    fn description(&self) -> &str {
        "Search Microsoft Teams teams whose field (default displayName) contains the search string. Returns the matching teams with their ids."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema::<SearchTeamsArgs>()
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let args: SearchTeamsArgs = parse_args(args)?;
        let teams = collect_pages(&self.transport, "teams").await?;
        let matched: Vec<Value> = teams
            .into_iter()
            .filter(|t| matches_field(t, &args.filter_field, Some(&args.search_string)))
            .collect();
        tracing::info!(
            search = %args.search_string,
            field = %args.filter_field,
            matched = matched.len(),
            "Team search completed"
        );
        Ok(Value::Array(matched))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ListChannelsArgs {
    /// 要列出频道的团队 id
    team_ids: Vec<String>,
    /// 可选：只保留字段包含该字符串的频道
    #[serde(default)]
    search_string: Option<String>,
    #[serde(default = "default_filter_field")]
    filter_field: String,
}

/// list_channels_for_teams：并发拉取多个团队的频道，返回 team_id -> channels
pub struct ListChannelsTool {
    orchestrator: Arc<FetchOrchestrator>,
}

impl ListChannelsTool {
    pub fn new(orchestrator: Arc<FetchOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl Tool for ListChannelsTool {
    fn name(&self) -> &str {
        "list_channels_for_teams"
    }

    fn description(&self) -> &str {
        "List the channels of several teams at once. Optionally keep only channels whose field (default displayName) contains the search string."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema::<ListChannelsArgs>()
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let args: ListChannelsArgs = parse_args(args)?;
        let ids: HashSet<String> = args.team_ids.into_iter().collect();
        let fetched = self.orchestrator.fetch_many(&ids).await?;

        let needle = args.search_string.as_deref();
        let out: Map<String, Value> = fetched
            .into_iter()
            .map(|(team, channels)| {
                let kept = channels
                    .into_iter()
                    .filter(|c| matches_field(c, &args.filter_field, needle))
                    .collect();
                (team, Value::Array(kept))
            })
            .collect();
        Ok(Value::Object(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::transport::test_support::transport;
    use crate::graph::PagedCollectionFetcher;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_matches_field_is_case_insensitive() {
        let team = json!({"displayName": "NCA SF Deals"});
        assert!(matches_field(&team, "displayName", Some("nca sf")));
        assert!(!matches_field(&team, "displayName", Some("LA")));
        assert!(!matches_field(&team, "description", Some("nca")));
        assert!(matches_field(&team, "description", None));
    }

    #[tokio::test]
    async fn test_search_teams_filters_all_pages() {
        let server = MockServer::start().await;
        let next = format!("{}/teams2", server.uri());
        Mock::given(method("GET"))
            .and(path("/teams"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{"id": "t1", "displayName": "Project X"}, {"id": "t2", "displayName": "Other"}],
                "@odata.nextLink": next
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/teams2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{"id": "t3", "displayName": "x-ray"}]
            })))
            .mount(&server)
            .await;

        let t = transport(&server.uri());
        let tool = SearchTeamsTool::new(t.clone());
        let found = tool.execute(json!({"search_string": "X"})).await.unwrap();
        let ids: Vec<_> = found.as_array().unwrap().iter().map(|v| v["id"].clone()).collect();
        assert_eq!(ids, vec![json!("t1"), json!("t3")]);
        assert_eq!(tool.parameters_schema()["required"], json!(["search_string"]));
        t.tokens().shutdown();
    }

    #[tokio::test]
    async fn test_search_teams_bad_args_is_invalid() {
        let t = transport("http://127.0.0.1:1");
        let tool = SearchTeamsTool::new(t);
        assert!(matches!(
            tool.execute(json!({"filter_field": "x"})).await,
            Err(ToolError::InvalidArgs(_))
        ));
    }

    #[tokio::test]
    async fn test_list_channels_for_teams() {
        let server = MockServer::start().await;
        for (team, names) in [("a", vec!["General", "Deals"]), ("b", vec!["General"])] {
            let channels: Vec<_> = names
                .iter()
                .map(|n| json!({"id": format!("{team}-{n}"), "displayName": n}))
                .collect();
            Mock::given(method("GET"))
                .and(path(format!("/teams/{team}/channels")))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": channels})))
                .mount(&server)
                .await;
        }

        let t = transport(&server.uri());
        let fetcher = Arc::new(PagedCollectionFetcher::new(t.clone(), "teams/{id}/channels"));
        let orchestrator =
            FetchOrchestrator::new(fetcher, 5).with_pacing(Duration::ZERO, Duration::ZERO);
        let tool = ListChannelsTool::new(Arc::new(orchestrator));

        let all = tool
            .execute(json!({"team_ids": ["a", "b", "a"]}))
            .await
            .unwrap();
        assert_eq!(all.as_object().unwrap().len(), 2);
        assert_eq!(all["a"].as_array().unwrap().len(), 2);

        let deals = tool
            .execute(json!({"team_ids": ["a", "b"], "search_string": "deal"}))
            .await
            .unwrap();
        assert_eq!(deals["a"], json!([{"id": "a-Deals", "displayName": "Deals"}]));
        assert_eq!(deals["b"], json!([]));
        t.tokens().shutdown();
    }

    #[tokio::test]
    async fn test_list_channels_remote_failure_propagates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;

        let t = transport(&server.uri());
        let fetcher = Arc::new(PagedCollectionFetcher::new(t.clone(), "teams/{id}/channels"));
        let orchestrator =
            FetchOrchestrator::new(fetcher, 2).with_pacing(Duration::ZERO, Duration::ZERO);
        let tool = ListChannelsTool::new(Arc::new(orchestrator));

        match tool.execute(json!({"team_ids": ["a"]})).await {
            Err(ToolError::Remote(e)) => assert_eq!(e.status_code, Some(403)),
            other => panic!("unexpected {other:?}"),
        }
        t.tokens().shutdown();
    }
}
