use crate::client::JiraClient;
use crate::models::{ChangelogEntry, ChangelogPage};
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

pub const CHANGELOG_PAGE_SIZE: u32 = 100;
pub const DEFAULT_MAX_IN_FLIGHT: usize = 16;

/// 課題1件分の変更履歴取得結果
#[derive(Debug, Clone, PartialEq)]
pub struct IssueChangelog {
    pub issue_key: String,
    pub entries: Vec<ChangelogEntry>,
    /// 取得に失敗し、空の結果に縮退したかどうか
    pub degraded: bool,
}

impl IssueChangelog {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn changelog_endpoint(issue_key: &str) -> String {
    format!(
        "/rest/api/3/issue/{}/changelog",
        urlencoding::encode(issue_key)
    )
}

impl JiraClient {
    /// 課題1件の変更履歴を全ページ取得する
    pub async fn fetch_issue_changelog(&self, issue_key: &str) -> IssueChangelog {
        let endpoint = changelog_endpoint(issue_key);
        let mut start_at: u64 = 0;
        let mut entries = Vec::new();

        loop {
            let query = [
                ("startAt", start_at.to_string()),
                ("maxResults", CHANGELOG_PAGE_SIZE.to_string()),
            ];

            let Some(body) = self.request(&endpoint, &query).await.into_json() else {
                // 縮退時は途中までの履歴も返さない
                warn!(
                    issue_key,
                    start_at,
                    discarded = entries.len(),
                    "changelog fetch failed"
                );
                return IssueChangelog {
                    issue_key: issue_key.to_string(),
                    entries: Vec::new(),
                    degraded: true,
                };
            };

            let page = ChangelogPage::from_value(&body);
            start_at += page.returned as u64;
            let has_more = page.has_more(start_at);
            entries.extend(page.entries);

            if !has_more {
                break;
            }
        }

        debug!(issue_key, entries = entries.len(), "fetched changelog");

        IssueChangelog {
            issue_key: issue_key.to_string(),
            entries,
            degraded: false,
        }
    }

    /// 全課題の変更履歴を並行取得する。
    ///
    /// 同一タスク上で最大 `max_in_flight` 件のリクエストを同時に待ち、
    /// 全件が（成功または縮退で）完了してから返す。1件の失敗は他に影響しない。
    /// 結果の順序は完了順で、入力順とは一致しない。
    pub async fn fetch_changelogs(
        &self,
        issue_keys: &[String],
        max_in_flight: usize,
    ) -> Vec<IssueChangelog> {
        info!(
            issues = issue_keys.len(),
            max_in_flight, "fetching changelogs"
        );

        let changelogs: Vec<IssueChangelog> = stream::iter(issue_keys.iter())
            .map(|key| self.fetch_issue_changelog(key))
            .buffer_unordered(max_in_flight.max(1))
            .collect()
            .await;

        let degraded = changelogs.iter().filter(|c| c.degraded).count();
        if degraded > 0 {
            warn!(degraded, "some changelogs could not be fetched");
        }

        changelogs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Credentials, JiraConfig, RequestPolicy};
    use serde_json::json;
    use std::collections::HashMap;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn mock_client(server: &MockServer) -> JiraClient {
        let config = JiraConfig::new(
            server.uri(),
            Credentials::new("test@example.com", "test_token"),
        )
        .unwrap()
        .with_policy(RequestPolicy::immediate());
        JiraClient::new(config).unwrap()
    }

    fn status_entry(id: &str, created: &str, from: &str, to: &str) -> serde_json::Value {
        json!({
            "id": id,
            "author": { "accountId": "u1", "displayName": "Test User" },
            "created": created,
            "items": [{ "field": "status", "fromString": from, "toString": to }]
        })
    }

    #[test]
    fn test_changelog_endpoint_encodes_key() {
        assert_eq!(changelog_endpoint("TEST-1"), "/rest/api/3/issue/TEST-1/changelog");
        assert_eq!(
            changelog_endpoint("A B"),
            "/rest/api/3/issue/A%20B/changelog"
        );
    }

    #[tokio::test]
    async fn test_fetch_single_page_changelog() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rest/api/3/issue/TEST-1/changelog"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "values": [status_entry("1", "2024-01-15T10:30:00.000+0000", "Open", "Done")]
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = mock_client(&mock_server);

        let changelog = client.fetch_issue_changelog("TEST-1").await;

        assert_eq!(changelog.issue_key, "TEST-1");
        assert_eq!(changelog.entries.len(), 1);
        assert!(!changelog.degraded);
    }

    #[tokio::test]
    async fn test_follows_changelog_pages() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rest/api/3/issue/TEST-1/changelog"))
            .and(query_param("startAt", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "startAt": 0, "total": 2, "isLast": false,
                "values": [status_entry("1", "2024-01-15T10:30:00.000+0000", "Open", "In Progress")]
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/rest/api/3/issue/TEST-1/changelog"))
            .and(query_param("startAt", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "startAt": 1, "total": 2, "isLast": true,
                "values": [status_entry("2", "2024-01-16T10:30:00.000+0000", "In Progress", "Done")]
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = mock_client(&mock_server);

        let changelog = client.fetch_issue_changelog("TEST-1").await;

        let ids: Vec<_> = changelog
            .entries
            .iter()
            .map(|e| e.id.as_deref().unwrap_or_default())
            .collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert!(!changelog.degraded);
    }

    #[tokio::test]
    async fn test_failed_later_page_discards_earlier_pages() {
        // Given: 1ページ目は成功、2ページ目がサーバーエラー
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rest/api/3/issue/TEST-1/changelog"))
            .and(query_param("startAt", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "startAt": 0, "total": 2, "isLast": false,
                "values": [status_entry("1", "2024-01-15T10:30:00.000+0000", "Open", "In Progress")]
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/rest/api/3/issue/TEST-1/changelog"))
            .and(query_param("startAt", "1"))
            .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = mock_client(&mock_server);

        // When
        let changelog = client.fetch_issue_changelog("TEST-1").await;

        // Then: 途中までの履歴は残さない
        assert!(changelog.degraded);
        assert!(changelog.is_empty());
    }

    #[tokio::test]
    async fn test_mixed_batch_never_fails_as_a_whole() {
        // Given: 成功・404・500・429連続が混在
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rest/api/3/issue/OK-1/changelog"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "values": [status_entry("1", "2024-01-15T10:30:00.000+0000", "Open", "Done")]
            })))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/api/3/issue/MISSING-1/changelog"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/api/3/issue/BROKEN-1/changelog"))
            .respond_with(ResponseTemplate::new(500).set_body_string("oops"))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/api/3/issue/LIMITED-1/changelog"))
            .respond_with(ResponseTemplate::new(429))
            .expect(2)
            .mount(&mock_server)
            .await;

        let client = mock_client(&mock_server);
        let keys: Vec<String> = ["OK-1", "MISSING-1", "BROKEN-1", "LIMITED-1"]
            .iter()
            .map(|k| k.to_string())
            .collect();

        // When
        let changelogs = client.fetch_changelogs(&keys, 2).await;

        // Then: 全キー分の結果があり、失敗分は空
        let by_key: HashMap<_, _> = changelogs
            .iter()
            .map(|c| (c.issue_key.as_str(), c))
            .collect();
        assert_eq!(by_key.len(), 4);
        assert_eq!(by_key["OK-1"].entries.len(), 1);
        assert!(!by_key["OK-1"].degraded);
        for key in ["MISSING-1", "BROKEN-1", "LIMITED-1"] {
            assert!(by_key[key].is_empty(), "{} should be empty", key);
            assert!(by_key[key].degraded, "{} should be degraded", key);
        }
    }

    #[tokio::test]
    async fn test_requests_overlap_up_to_max_in_flight() {
        // Given: 各リクエストが300ms遅延する
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "values": [] }))
                    .set_delay(std::time::Duration::from_millis(300)),
            )
            .expect(6)
            .mount(&mock_server)
            .await;

        let client = mock_client(&mock_server);
        let keys: Vec<String> = (0..6).map(|i| format!("TEST-{}", i)).collect();

        // When
        let started = std::time::Instant::now();
        let changelogs = client.fetch_changelogs(&keys, 6).await;

        // Then: 直列なら1.8秒かかる
        assert_eq!(changelogs.len(), 6);
        assert!(started.elapsed() < std::time::Duration::from_millis(1200));
    }

    #[tokio::test]
    async fn test_empty_key_list() {
        let mock_server = MockServer::start().await;
        let client = mock_client(&mock_server);

        assert!(client.fetch_changelogs(&[], 4).await.is_empty());
    }
}
