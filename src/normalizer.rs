use crate::changelog_fetcher::IssueChangelog;
use crate::models::{ChangelogEntry, Issue};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// 保存時の日時フォーマット（UTC）
pub const CHANGE_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// `changelog` テーブルの1行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRow {
    pub issue_key: String,
    pub field: String,
    pub from_value: Option<String>,
    pub to_value: Option<String>,
    /// UTCに正規化した日時。解釈できない場合は元の文字列のまま
    pub change_date: Option<String>,
    /// 変更者の表示名。不明なら空文字
    pub author: String,
}

/// `issues` テーブルの1行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueRow {
    pub issue_key: String,
    pub summary: Option<String>,
    pub created: Option<String>,
    pub issue_type: Option<String>,
    pub status: Option<String>,
    pub status_category: Option<String>,
    /// ラベルのJSON配列（ラベルがなければNone）
    pub labels: Option<String>,
}

/// Jiraの日時文字列をUTCとして解釈する。
///
/// `2024-01-15T10:30:00.000+0000` 形式、RFC3339、オフセットなしの
/// `2024-01-15T10:30:00` / `2024-01-15 10:30:00`（UTC扱い）を受け付ける。
pub fn parse_jira_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.with_timezone(&Utc));
    }

    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// 日時を保存用の文字列に正規化する。解釈できなければ入力をそのまま返す。
/// 空文字や空白だけの値は日時なしとして扱う
pub fn normalize_timestamp(raw: Option<&str>) -> Option<String> {
    let raw = raw.filter(|r| !r.trim().is_empty())?;
    Some(match parse_jira_timestamp(raw) {
        Some(dt) => dt.format(CHANGE_DATE_FORMAT).to_string(),
        None => raw.to_string(),
    })
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_deref().filter(|v| !v.is_empty()).map(str::to_string)
}

/// 変更履歴と課題を行データへ変換する
pub struct RowNormalizer;

impl RowNormalizer {
    /// エントリ内の変更項目1つにつき1行を生成する。日時と変更者はエントリで共有
    pub fn normalize(issue_key: &str, entries: &[ChangelogEntry]) -> Vec<ChangeRow> {
        entries
            .iter()
            .flat_map(|entry| {
                let change_date = normalize_timestamp(entry.created.as_deref());
                let author = entry
                    .author
                    .as_ref()
                    .and_then(|a| a.display_name.clone())
                    .unwrap_or_default();

                entry.items.iter().map(move |item| ChangeRow {
                    issue_key: issue_key.to_string(),
                    field: item.field.clone(),
                    from_value: non_empty(&item.from_string),
                    to_value: non_empty(&item.to_string),
                    change_date: change_date.clone(),
                    author: author.clone(),
                })
            })
            .collect()
    }

    pub fn normalize_all(changelogs: &[IssueChangelog]) -> Vec<ChangeRow> {
        changelogs
            .iter()
            .flat_map(|c| Self::normalize(&c.issue_key, &c.entries))
            .collect()
    }

    pub fn issue_row(issue: &Issue) -> IssueRow {
        let labels = issue
            .fields
            .labels
            .as_ref()
            .filter(|labels| !labels.is_empty())
            .and_then(|labels| serde_json::to_string(labels).ok());

        IssueRow {
            issue_key: issue.key.clone(),
            summary: issue.fields.summary.clone(),
            created: normalize_timestamp(issue.fields.created.as_deref()),
            issue_type: issue.issue_type_name().map(str::to_string),
            status: issue.status_name().map(str::to_string),
            status_category: issue.status_category_name().map(str::to_string),
            labels,
        }
    }

    pub fn issue_rows(issues: &[Issue]) -> Vec<IssueRow> {
        issues.iter().map(Self::issue_row).collect()
    }
}
