use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// 変更履歴の1エントリ（1回の操作で変わったフィールドの集合）
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChangelogEntry {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub author: Option<ChangeAuthor>,
    /// 変更日時（APIの生文字列のまま）
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub items: Vec<ChangeItem>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChangeAuthor {
    #[serde(rename = "accountId")]
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(rename = "displayName")]
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChangeItem {
    #[serde(default)]
    pub field: String,
    #[serde(rename = "fieldtype")]
    #[serde(default)]
    pub field_type: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(rename = "fromString")]
    #[serde(default)]
    pub from_string: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(rename = "toString")]
    #[serde(default)]
    pub to_string: Option<String>,
}

/// `GET /rest/api/3/issue/{key}/changelog` の1ページ分
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangelogPage {
    pub entries: Vec<ChangelogEntry>,
    pub returned: usize,
    pub total: Option<u64>,
    pub is_last: Option<bool>,
}

impl ChangelogPage {
    pub fn from_value(body: &Value) -> Self {
        let raw_values = body
            .get("values")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let entries = raw_values
            .iter()
            .filter_map(
                |raw| match serde_json::from_value::<ChangelogEntry>(raw.clone()) {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        warn!(error = %e, "skipping malformed changelog entry");
                        None
                    }
                },
            )
            .collect();

        Self {
            entries,
            returned: raw_values.len(),
            total: body.get("total").and_then(Value::as_u64),
            is_last: body.get("isLast").and_then(Value::as_bool),
        }
    }

    /// `next_start_at` 以降にまだページがあるか。
    /// 総数に達していれば `isLast` に関係なく終了する。
    /// `isLast` も `total` もない応答は単一ページとみなす
    pub fn has_more(&self, next_start_at: u64) -> bool {
        if self.returned == 0 {
            return false;
        }
        if matches!(self.total, Some(total) if next_start_at >= total) {
            return false;
        }
        match (self.is_last, self.total) {
            (Some(is_last), _) => !is_last,
            (None, Some(_)) => true,
            (None, None) => false,
        }
    }
}
