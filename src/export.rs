use crate::duckdb_store::{DuckDBStore, QueryResult};
use crate::error::{Error, Result};
use csv::Writer;
use serde_json::Value;
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// 出力形式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    #[default]
    Csv,
    Json,
}

impl FromStr for ExportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            _ => Err(Error::UnsupportedFormat(s.to_string())),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Csv => write!(f, "csv"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// クエリ結果を指定形式の文字列にする
pub fn render(result: &QueryResult, format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Csv => render_csv(result),
        ExportFormat::Json => render_json(result),
    }
}

/// 列順を保ったオブジェクトの配列として整形する。0件なら `[]`
pub fn render_json(result: &QueryResult) -> Result<String> {
    let records: Vec<Value> = result
        .to_records()
        .into_iter()
        .map(Value::Object)
        .collect();
    let mut out = serde_json::to_string_pretty(&records)?;
    out.push('\n');
    Ok(out)
}

/// 列名をヘッダー行にしたCSV。0件ならヘッダー行のみ
pub fn render_csv(result: &QueryResult) -> Result<String> {
    let mut output = Vec::new();
    {
        let mut writer = Writer::from_writer(&mut output);
        writer.write_record(&result.columns)?;
        for row in &result.rows {
            writer.write_record(row.iter().map(csv_field))?;
        }
        writer.flush()?;
    }

    String::from_utf8(output).map_err(|e| Error::SerializationError(e.to_string()))
}

fn csv_field(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // 配列やオブジェクトはJSON文字列のまま
        other => other.to_string(),
    }
}

/// ファイル（指定時）または標準出力へ書き出す
pub fn write_output(content: &str, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => std::fs::write(path, content)?,
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(content.as_bytes())?;
            stdout.flush()?;
        }
    }
    Ok(())
}

/// クエリを実行して結果を書き出し、出力行数を返す
pub fn export_query(
    store: &DuckDBStore,
    sql: &str,
    format: ExportFormat,
    output: Option<&Path>,
) -> Result<usize> {
    let result = store.query(sql)?;
    let rendered = render(&result, format)?;
    write_output(&rendered, output)?;

    info!(
        rows = result.rows.len(),
        %format,
        output = %output.map(|p| p.display().to_string()).unwrap_or_else(|| "stdout".to_string()),
        "export finished"
    );
    Ok(result.rows.len())
}
