use serde::{Deserialize, Serialize};

/// 検索結果の課題。`fields` は検索時に射影したフィールドだけを持つ
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Issue {
    pub key: String,
    #[serde(default)]
    pub fields: IssueFields,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IssueFields {
    #[serde(default)]
    pub summary: Option<String>,
    /// 作成日時（APIの生文字列のまま）
    #[serde(default)]
    pub created: Option<String>,
    #[serde(rename = "issuetype")]
    #[serde(default)]
    pub issue_type: Option<NamedRef>,
    #[serde(default)]
    pub status: Option<Status>,
    #[serde(default)]
    pub labels: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NamedRef {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Status {
    pub name: String,
    #[serde(rename = "statusCategory")]
    #[serde(default)]
    pub status_category: Option<NamedRef>,
}

impl Issue {
    pub fn issue_type_name(&self) -> Option<&str> {
        self.fields.issue_type.as_ref().map(|t| t.name.as_str())
    }

    pub fn status_name(&self) -> Option<&str> {
        self.fields.status.as_ref().map(|s| s.name.as_str())
    }

    pub fn status_category_name(&self) -> Option<&str> {
        self.fields
            .status
            .as_ref()
            .and_then(|s| s.status_category.as_ref())
            .map(|c| c.name.as_str())
    }
}
