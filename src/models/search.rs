use super::Issue;
use serde_json::Value;
use tracing::warn;

/// 検索時に射影するフィールド
pub const ISSUE_FIELDS: &[&str] = &["summary", "created", "issuetype", "status", "labels"];

/// `GET /rest/api/3/search/jql` のクエリパラメータ
#[derive(Debug, Clone, PartialEq)]
pub struct SearchParams {
    pub jql: String,
    pub start_at: u64,
    pub max_results: u32,
    pub fields: Vec<String>,
}

impl SearchParams {
    pub fn new(jql: impl Into<String>) -> Self {
        Self {
            jql: jql.into(),
            start_at: 0,
            max_results: 50,
            fields: ISSUE_FIELDS.iter().map(|f| f.to_string()).collect(),
        }
    }

    pub fn start_at(mut self, start_at: u64) -> Self {
        self.start_at = start_at;
        self
    }

    pub fn max_results(mut self, max_results: u32) -> Self {
        self.max_results = max_results;
        self
    }

    pub fn fields(mut self, fields: Vec<String>) -> Self {
        self.fields = fields;
        self
    }

    pub fn to_query(&self) -> Vec<(&'static str, String)> {
        vec![
            ("jql", self.jql.clone()),
            ("startAt", self.start_at.to_string()),
            ("maxResults", self.max_results.to_string()),
            ("fields", self.fields.join(",")),
        ]
    }
}

/// 検索結果1ページ分
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchPage {
    pub issues: Vec<Issue>,
    /// サーバーが返した件数（解釈できなかった課題も含む）
    pub returned: usize,
    pub total: Option<u64>,
}

impl SearchPage {
    /// `issues` 配列がなければ0件として扱う
    pub fn from_value(body: &Value) -> Self {
        let raw_issues = body
            .get("issues")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let issues = raw_issues
            .iter()
            .filter_map(|raw| match serde_json::from_value::<Issue>(raw.clone()) {
                Ok(issue) => Some(issue),
                Err(e) => {
                    warn!(error = %e, "skipping malformed issue in search page");
                    None
                }
            })
            .collect();

        Self {
            issues,
            returned: raw_issues.len(),
            total: body.get("total").and_then(Value::as_u64),
        }
    }
}
