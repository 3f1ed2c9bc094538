use crate::changelog_fetcher::DEFAULT_MAX_IN_FLIGHT;
use crate::client::JiraClient;
use crate::duckdb_store::{DuckDBStore, WriteMode};
use crate::error::Result;
use crate::normalizer::{IssueRow, RowNormalizer};
use crate::paginator::DEFAULT_PAGE_SIZE;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{info, warn};

/// インポート1回分の設定
#[derive(Debug, Clone, PartialEq)]
pub struct ImportOptions {
    /// 対象課題を絞り込むJQL（そのまま送信する）
    pub jql: String,
    /// 検索1ページあたりの件数
    pub page_size: u32,
    pub mode: WriteMode,
    /// 同時に発行する変更履歴リクエストの上限
    pub max_in_flight: usize,
}

impl ImportOptions {
    pub fn new(jql: impl Into<String>) -> Self {
        Self {
            jql: jql.into(),
            page_size: DEFAULT_PAGE_SIZE,
            mode: WriteMode::Append,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn mode(mut self, mode: WriteMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }
}

/// インポート結果の集計
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportSummary {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// 検索で見つかった課題数
    pub issues_found: usize,
    /// 変更履歴が1件以上あった課題数
    pub issues_with_changelog: usize,
    /// 変更履歴の取得に失敗した課題数
    pub degraded_issues: usize,
    pub issue_rows: usize,
    pub changelog_rows: usize,
}

impl ImportSummary {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            start_time: now,
            end_time: now,
            issues_found: 0,
            issues_with_changelog: 0,
            degraded_issues: 0,
            issue_rows: 0,
            changelog_rows: 0,
        }
    }

    /// 正常に取得できた課題数
    pub fn processed_issues(&self) -> usize {
        self.issues_found - self.degraded_issues
    }

    pub fn duration_seconds(&self) -> f64 {
        (self.end_time - self.start_time).num_milliseconds() as f64 / 1000.0
    }
}

/// 検索 → 変更履歴取得 → 行変換 → 保存 を順に行うバッチ処理
pub struct ImportService<'a> {
    client: &'a JiraClient,
    options: ImportOptions,
}

impl<'a> ImportService<'a> {
    pub fn new(client: &'a JiraClient, options: ImportOptions) -> Self {
        Self { client, options }
    }

    pub fn options(&self) -> &ImportOptions {
        &self.options
    }

    /// インポートを実行する。
    ///
    /// 取得系の失敗は課題単位で縮退して処理を続ける。保存の失敗だけがエラーになる。
    pub async fn run(&self, store: &mut DuckDBStore) -> Result<ImportSummary> {
        let mut summary = ImportSummary::new();

        let issues = self
            .client
            .search_issues(&self.options.jql, self.options.page_size)
            .await;
        summary.issues_found = issues.len();

        if issues.is_empty() {
            warn!(jql = %self.options.jql, "no issues matched, nothing to import");
            summary.end_time = Utc::now();
            return Ok(summary);
        }

        let mut seen = HashSet::new();
        let keys: Vec<String> = issues
            .iter()
            .filter(|issue| seen.insert(issue.key.as_str()))
            .map(|issue| issue.key.clone())
            .collect();
        let changelogs = self
            .client
            .fetch_changelogs(&keys, self.options.max_in_flight)
            .await;

        summary.degraded_issues = changelogs.iter().filter(|c| c.degraded).count();
        summary.issues_with_changelog = changelogs.iter().filter(|c| !c.is_empty()).count();

        // Replace では取得に失敗した課題の既存行を残す
        let (changelogs, replace_keys): (Vec<_>, Vec<String>) = match self.options.mode {
            WriteMode::Append => (changelogs, Vec::new()),
            WriteMode::Replace => {
                let complete: Vec<_> = changelogs.into_iter().filter(|c| !c.degraded).collect();
                let keys = complete.iter().map(|c| c.issue_key.clone()).collect();
                (complete, keys)
            }
        };

        let change_rows = RowNormalizer::normalize_all(&changelogs);
        let issue_rows = dedup_issue_rows(RowNormalizer::issue_rows(&issues));

        summary.issue_rows = store.insert_issues(&issue_rows, self.options.mode)?;
        summary.changelog_rows =
            store.insert_changelog(&change_rows, self.options.mode, &replace_keys)?;
        summary.end_time = Utc::now();

        info!(
            issues_found = summary.issues_found,
            processed = summary.processed_issues(),
            with_changelog = summary.issues_with_changelog,
            degraded = summary.degraded_issues,
            changelog_rows = summary.changelog_rows,
            seconds = summary.duration_seconds(),
            "import finished"
        );

        Ok(summary)
    }
}

/// 検索結果に同じ課題が重複して現れた場合は最初の1件だけ残す
fn dedup_issue_rows(rows: Vec<IssueRow>) -> Vec<IssueRow> {
    let mut seen = HashSet::new();
    rows.into_iter()
        .filter(|row| seen.insert(row.issue_key.clone()))
        .collect()
}
