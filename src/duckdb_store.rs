use base64::Engine;
use chrono::{DateTime, NaiveDate};
use duckdb::types::{TimeUnit, Value as DbValue};
use duckdb::{Connection, params};
use serde::Serialize;
use serde_json::{Map, Number, Value as Json};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::normalizer::{CHANGE_DATE_FORMAT, ChangeRow, IssueRow};

const SCHEMA: &str = r#"
CREATE SEQUENCE IF NOT EXISTS changelog_id_seq START 1;

CREATE TABLE IF NOT EXISTS issues (
    issue_key VARCHAR NOT NULL,
    summary VARCHAR,
    created VARCHAR,
    issue_type VARCHAR,
    status VARCHAR,
    status_category VARCHAR,
    labels VARCHAR
);

CREATE TABLE IF NOT EXISTS changelog (
    id BIGINT PRIMARY KEY DEFAULT nextval('changelog_id_seq'),
    issue_key VARCHAR NOT NULL,
    field VARCHAR,
    from_value VARCHAR,
    to_value VARCHAR,
    change_date VARCHAR,
    author VARCHAR
);

CREATE INDEX IF NOT EXISTS idx_issues_issue_key ON issues(issue_key);
CREATE INDEX IF NOT EXISTS idx_issues_issue_type ON issues(issue_type);
CREATE INDEX IF NOT EXISTS idx_changelog_issue_key ON changelog(issue_key);
CREATE INDEX IF NOT EXISTS idx_changelog_change_date ON changelog(change_date);
CREATE INDEX IF NOT EXISTS idx_changelog_field ON changelog(field);
"#;

/// ステータス滞在時間ビュー。
///
/// 課題ごとにステータス変更行を日時順に並べ、次の変更行の日時を退出時刻とする。
/// 次の行がない（現在のステータス）場合だけ現在時刻を使う。
/// 入った日時か出た日時が解釈できないウィンドウの滞在日数は NULL。
/// マテリアライズせず読み出しのたびに計算する。
const STATUS_DURATIONS_VIEW: &str = r#"
CREATE OR REPLACE VIEW status_durations AS
WITH status_changes AS (
    SELECT
        id,
        issue_key,
        to_value AS status,
        change_date,
        TRY_CAST(change_date AS TIMESTAMP) AS changed_at
    FROM changelog
    WHERE field = 'status'
),
windows AS (
    SELECT
        issue_key,
        status,
        change_date AS entered_at,
        changed_at,
        LEAD(id) OVER w AS next_id,
        LEAD(change_date) OVER w AS next_change_date,
        LEAD(changed_at) OVER w AS next_changed_at
    FROM status_changes
    WINDOW w AS (PARTITION BY issue_key ORDER BY changed_at ASC NULLS LAST, change_date, id)
)
SELECT
    issue_key,
    status,
    entered_at,
    CASE
        WHEN next_id IS NULL
            THEN strftime(make_timestamp(epoch_us(now())), '%Y-%m-%d %H:%M:%S')
        ELSE next_change_date
    END AS left_at,
    CAST(
        CASE
            WHEN next_id IS NULL THEN epoch_ms(now())
            ELSE epoch_ms(next_changed_at)
        END - epoch_ms(changed_at) AS DOUBLE
    ) / 86400000.0::DOUBLE AS days_in_state
FROM windows
"#;

/// 書き込みモード
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// 既存行を残したまま追記する（再実行で行が重複する）
    #[default]
    Append,
    /// 同じトランザクション内で対象課題の既存行を削除してから挿入する
    Replace,
}

/// `status_durations` ビューの1行
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusDuration {
    pub issue_key: String,
    pub status: Option<String>,
    pub entered_at: Option<String>,
    pub left_at: Option<String>,
    pub days_in_state: Option<f64>,
}

/// 任意クエリの結果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Json>>,
}

impl QueryResult {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// 列名をキーにした行オブジェクトの列（列順を保持）
    pub fn to_records(&self) -> Vec<Map<String, Json>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect()
            })
            .collect()
    }
}

/// DuckDB形式のデータストア
pub struct DuckDBStore {
    /// データベースファイルのパス
    db_path: PathBuf,
    connection: Connection,
}

impl DuckDBStore {
    /// データベースファイルを開く（なければ作成される）
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        let connection = Connection::open(&db_path)
            .map_err(|e| Error::DatabaseError(format!("Failed to open DuckDB: {}", e)))?;

        debug!(path = %db_path.display(), "opened database");

        Ok(Self {
            db_path,
            connection,
        })
    }

    /// インメモリデータベースを作成
    pub fn new_in_memory() -> Result<Self> {
        let connection = Connection::open_in_memory().map_err(|e| {
            Error::DatabaseError(format!("Failed to create in-memory DuckDB: {}", e))
        })?;

        Ok(Self {
            db_path: PathBuf::from(":memory:"),
            connection,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// スキーマとビューを作成する。既存のデータベースに対して何度実行してもよい
    pub fn initialize(&self) -> Result<()> {
        self.connection
            .execute_batch(SCHEMA)
            .map_err(|e| Error::DatabaseError(format!("Schema creation failed: {}", e)))?;
        self.connection
            .execute_batch(STATUS_DURATIONS_VIEW)
            .map_err(|e| Error::DatabaseError(format!("View creation failed: {}", e)))?;
        Ok(())
    }

    /// 課題行を1トランザクションで挿入する。途中で失敗した場合は全体をロールバックする
    pub fn insert_issues(&mut self, rows: &[IssueRow], mode: WriteMode) -> Result<usize> {
        let tx = self.connection.transaction()?;

        {
            if mode == WriteMode::Replace {
                let mut delete = tx.prepare("DELETE FROM issues WHERE issue_key = ?")?;
                for row in rows {
                    delete.execute(params![row.issue_key])?;
                }
            }

            let mut insert = tx.prepare(
                r#"
                INSERT INTO issues
                (issue_key, summary, created, issue_type, status, status_category, labels)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )?;

            for row in rows {
                insert
                    .execute(params![
                        row.issue_key,
                        row.summary,
                        row.created,
                        row.issue_type,
                        row.status,
                        row.status_category,
                        row.labels,
                    ])
                    .map_err(|e| {
                        Error::DatabaseError(format!(
                            "Failed to insert issue {}: {}",
                            row.issue_key, e
                        ))
                    })?;
            }
        }

        tx.commit()
            .map_err(|e| Error::DatabaseError(format!("Commit of issues failed: {}", e)))?;

        info!(rows = rows.len(), ?mode, "wrote issues");
        Ok(rows.len())
    }

    /// 変更履歴行を1トランザクションで挿入する。
    ///
    /// `Replace` のときは `replace_keys` に含まれる課題の既存行を先に削除する。
    pub fn insert_changelog(
        &mut self,
        rows: &[ChangeRow],
        mode: WriteMode,
        replace_keys: &[String],
    ) -> Result<usize> {
        let tx = self.connection.transaction()?;

        {
            if mode == WriteMode::Replace {
                let mut delete = tx.prepare("DELETE FROM changelog WHERE issue_key = ?")?;
                for key in replace_keys {
                    delete.execute(params![key])?;
                }
            }

            let mut insert = tx.prepare(
                r#"
                INSERT INTO changelog
                (issue_key, field, from_value, to_value, change_date, author)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )?;

            for row in rows {
                insert
                    .execute(params![
                        row.issue_key,
                        row.field,
                        row.from_value,
                        row.to_value,
                        row.change_date,
                        row.author,
                    ])
                    .map_err(|e| {
                        Error::DatabaseError(format!(
                            "Failed to insert changelog row for {}: {}",
                            row.issue_key, e
                        ))
                    })?;
            }
        }

        tx.commit()
            .map_err(|e| Error::DatabaseError(format!("Commit of changelog failed: {}", e)))?;

        info!(rows = rows.len(), ?mode, "wrote changelog rows");
        Ok(rows.len())
    }

    /// テーブル（またはビュー）の行数
    pub fn count_rows(&self, table: &str) -> Result<usize> {
        if !matches!(table, "issues" | "changelog" | "status_durations") {
            return Err(Error::DatabaseError(format!("Unknown table: {}", table)));
        }

        let count: i64 = self.connection.query_row(
            &format!("SELECT COUNT(*) FROM {}", table),
            params![],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// ステータス滞在時間を課題キー・入った日時の順で取得する
    pub fn status_durations(&self, issue_key: Option<&str>) -> Result<Vec<StatusDuration>> {
        let base = "SELECT issue_key, status, entered_at, left_at, days_in_state FROM status_durations";
        let order = "ORDER BY issue_key, TRY_CAST(entered_at AS TIMESTAMP) NULLS LAST, entered_at";

        let durations = match issue_key {
            Some(key) => {
                let mut stmt = self
                    .connection
                    .prepare(&format!("{} WHERE issue_key = ? {}", base, order))?;
                let rows = stmt.query_map(params![key], status_duration_from_row)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = self.connection.prepare(&format!("{} {}", base, order))?;
                let rows = stmt.query_map(params![], status_duration_from_row)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            }
        };

        Ok(durations)
    }

    /// 任意のSQLを実行し、列名と値を返す
    pub fn query(&self, sql: &str) -> Result<QueryResult> {
        let mut stmt = self
            .connection
            .prepare(sql)
            .map_err(|e| Error::DatabaseError(format!("Invalid query: {}", e)))?;
        let mut rows = stmt
            .query(params![])
            .map_err(|e| Error::DatabaseError(format!("Query failed: {}", e)))?;

        let columns: Vec<String> = rows
            .as_ref()
            .map(|stmt| {
                stmt.column_names()
                    .into_iter()
                    .map(|name| name.to_string())
                    .collect()
            })
            .unwrap_or_default();

        let mut result_rows = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                let value: DbValue = row.get(i)?;
                values.push(to_json(value));
            }
            result_rows.push(values);
        }

        debug!(rows = result_rows.len(), "query finished");

        Ok(QueryResult {
            columns,
            rows: result_rows,
        })
    }

    /// 接続を明示的に閉じる
    pub fn close(self) -> Result<()> {
        self.connection
            .close()
            .map_err(|(_, e)| Error::DatabaseError(format!("Failed to close DuckDB: {}", e)))
    }
}

fn status_duration_from_row(row: &duckdb::Row<'_>) -> duckdb::Result<StatusDuration> {
    Ok(StatusDuration {
        issue_key: row.get(0)?,
        status: row.get(1)?,
        entered_at: row.get(2)?,
        left_at: row.get(3)?,
        days_in_state: row.get(4)?,
    })
}

fn to_micros(unit: TimeUnit, value: i64) -> i64 {
    match unit {
        TimeUnit::Second => value.saturating_mul(1_000_000),
        TimeUnit::Millisecond => value.saturating_mul(1_000),
        TimeUnit::Microsecond => value,
        TimeUnit::Nanosecond => value / 1_000,
    }
}

fn float_json(value: f64) -> Json {
    Number::from_f64(value).map(Json::Number).unwrap_or(Json::Null)
}

/// DuckDBの値をJSON値へ変換する
fn to_json(value: DbValue) -> Json {
    match value {
        DbValue::Null => Json::Null,
        DbValue::Boolean(b) => Json::Bool(b),
        DbValue::TinyInt(i) => Json::from(i),
        DbValue::SmallInt(i) => Json::from(i),
        DbValue::Int(i) => Json::from(i),
        DbValue::BigInt(i) => Json::from(i),
        DbValue::HugeInt(i) => i64::try_from(i)
            .map(Json::from)
            .unwrap_or_else(|_| Json::String(i.to_string())),
        DbValue::UTinyInt(i) => Json::from(i),
        DbValue::USmallInt(i) => Json::from(i),
        DbValue::UInt(i) => Json::from(i),
        DbValue::UBigInt(i) => Json::from(i),
        DbValue::Float(f) => float_json(f64::from(f)),
        DbValue::Double(f) => float_json(f),
        DbValue::Decimal(d) => Json::String(d.to_string()),
        DbValue::Text(s) => Json::String(s),
        DbValue::Enum(s) => Json::String(s),
        DbValue::Blob(bytes) => {
            Json::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
        DbValue::Timestamp(unit, v) => DateTime::from_timestamp_micros(to_micros(unit, v))
            .map(|dt| Json::String(dt.format(CHANGE_DATE_FORMAT).to_string()))
            .unwrap_or(Json::Null),
        DbValue::Date32(days) => NaiveDate::from_num_days_from_ce_opt(days + 719_163)
            .map(|d| Json::String(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(Json::Null),
        DbValue::List(values) => Json::Array(values.into_iter().map(to_json).collect()),
        other => Json::String(format!("{:?}", other)),
    }
}
