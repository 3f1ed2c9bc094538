use crate::client::JiraClient;
use crate::models::{Issue, SearchPage, SearchParams};
use tracing::{debug, info, warn};

pub const SEARCH_ENDPOINT: &str = "/rest/api/3/search/jql";
pub const DEFAULT_PAGE_SIZE: u32 = 5000;

impl JiraClient {
    /// JQLに一致する課題をオフセット方式で全件取得する。
    ///
    /// オフセットは要求したページサイズではなく実際に返ってきた件数だけ進める。
    /// 報告された総数に達するか、0件のページが返るか、取得に失敗した時点で終了し、
    /// それまでに集めた課題はそのまま返す。
    pub async fn search_issues(&self, jql: &str, page_size: u32) -> Vec<Issue> {
        let page_size = page_size.max(1);
        let mut start_at: u64 = 0;
        let mut total: Option<u64> = None;
        let mut issues = Vec::new();

        info!(jql, "fetching issues");

        loop {
            let params = SearchParams::new(jql)
                .start_at(start_at)
                .max_results(page_size);

            let Some(body) = self
                .request(SEARCH_ENDPOINT, &params.to_query())
                .await
                .into_json()
            else {
                warn!(
                    start_at,
                    fetched = issues.len(),
                    "search page failed, keeping partial results"
                );
                break;
            };

            let page = SearchPage::from_value(&body);
            if page.returned == 0 {
                debug!(start_at, "empty search page, stopping");
                break;
            }

            start_at += page.returned as u64;
            total = page.total.or(total);
            issues.extend(page.issues);

            debug!(
                page_len = page.returned,
                fetched = issues.len(),
                total = ?total,
                "fetched search page"
            );

            if matches!(total, Some(total) if start_at >= total) {
                break;
            }

            self.policy().page_jitter.wait().await;
        }

        info!(count = issues.len(), "retrieved issues");
        issues
    }
}
