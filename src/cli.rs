use clap::{Parser, Subcommand};
use jira_changelog::client::{ENV_API_TOKEN, ENV_API_URL, ENV_API_USER};
use jira_changelog::{
    DuckDBStore, Error, ExportFormat, ImportOptions, ImportService, JiraClient, JiraConfig,
    Result, WriteMode, export_query,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const DEFAULT_DB_PATH: &str = "./output/jira_data.db";

#[derive(Parser, Debug)]
#[command(name = "jtm")]
#[command(author, version, about = "Jira changelog importer and exporter", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Show debug logs
    #[arg(short, long, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Only show warnings and errors
    #[arg(short, long, global = true, default_value_t = false, conflicts_with = "verbose")]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch issues matching a JQL query and store their changelogs
    Import {
        #[arg(short, long)]
        jql: String,

        #[arg(short, long, env = ENV_API_USER)]
        username: Option<String>,

        #[arg(short, long, env = ENV_API_TOKEN, hide_env_values = true)]
        token: Option<String>,

        #[arg(long, env = ENV_API_URL)]
        url: Option<String>,

        #[arg(long, default_value = DEFAULT_DB_PATH)]
        db: PathBuf,

        #[arg(long, default_value_t = jira_changelog::paginator::DEFAULT_PAGE_SIZE)]
        page_size: u32,

        /// Maximum number of changelog requests in flight
        #[arg(long, default_value_t = jira_changelog::changelog_fetcher::DEFAULT_MAX_IN_FLIGHT)]
        max_in_flight: usize,

        /// Replace stored rows of the fetched issues instead of appending
        #[arg(long, default_value_t = false)]
        replace: bool,
    },
    /// Run a SQL query against the database and export the result
    Export {
        #[arg(short = 'Q', long)]
        query: String,

        /// csv or json
        #[arg(short, long, default_value = "csv")]
        format: String,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(long, default_value = DEFAULT_DB_PATH)]
        db: PathBuf,
    },
}

impl Cli {
    /// ログレベル（RUST_LOG が優先）
    pub fn log_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        }
    }

    pub async fn execute(&self) -> Result<()> {
        match &self.command {
            Commands::Import {
                jql,
                username,
                token,
                url,
                db,
                page_size,
                max_in_flight,
                replace,
            } => {
                let mode = if *replace {
                    WriteMode::Replace
                } else {
                    WriteMode::Append
                };
                let options = ImportOptions::new(jql.as_str())
                    .page_size(*page_size)
                    .max_in_flight(*max_in_flight)
                    .mode(mode);

                execute_import(url.clone(), username.clone(), token.clone(), db, options).await
            }
            Commands::Export {
                query,
                format,
                output,
                db,
            } => execute_export(query, format, output.as_deref(), db),
        }
    }
}

async fn execute_import(
    url: Option<String>,
    username: Option<String>,
    token: Option<String>,
    db: &Path,
    options: ImportOptions,
) -> Result<()> {
    // 資格情報の不足はネットワーク・DBに触れる前に検出する
    let config = JiraConfig::from_env_with_overrides(url, username, token)?;
    let client = JiraClient::new(config)?;

    ensure_parent_dir(db)?;
    let mut store = DuckDBStore::open(db)?;
    store.initialize()?;

    let summary = ImportService::new(&client, options).run(&mut store).await?;
    store.close()?;

    info!(
        "Imported {} of {} issues ({} changelog rows) into {}",
        summary.processed_issues(),
        summary.issues_found,
        summary.changelog_rows,
        db.display()
    );
    Ok(())
}

fn execute_export(query: &str, format: &str, output: Option<&Path>, db: &Path) -> Result<()> {
    let format: ExportFormat = format.parse()?;

    // 存在しないDBは作成しない
    if !db.is_file() {
        return Err(Error::ConfigurationMissing(format!(
            "database not found: {} (run `jtm import` first)",
            db.display()
        )));
    }

    let store = DuckDBStore::open(db)?;
    if let Some(path) = output {
        ensure_parent_dir(path)?;
    }
    let rows = export_query(&store, query, format, output)?;
    store.close()?;

    if let Some(path) = output {
        info!("Exported {} rows to {}", rows, path.display());
    }
    Ok(())
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !parent.exists() {
            debug!(dir = %parent.display(), "creating directory");
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::TempDir;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_import() {
        let cli = Cli::try_parse_from([
            "jtm", "import", "--jql", "project = TEST", "--username", "u", "--token", "t",
            "--url", "https://example.atlassian.net", "--replace", "-v",
        ])
        .unwrap();

        assert!(cli.verbose);
        assert_eq!(cli.log_level(), "debug");
        match cli.command {
            Commands::Import {
                jql,
                db,
                page_size,
                replace,
                ..
            } => {
                assert_eq!(jql, "project = TEST");
                assert_eq!(db, PathBuf::from(DEFAULT_DB_PATH));
                assert_eq!(page_size, 5000);
                assert!(replace);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_export_defaults() {
        let cli = Cli::try_parse_from(["jtm", "export", "--query", "SELECT 1"]).unwrap();

        match cli.command {
            Commands::Export {
                format, output, ..
            } => {
                assert_eq!(format, "csv");
                assert!(output.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_export_rejects_unknown_format_before_touching_database() {
        let temp_dir = TempDir::new().unwrap();
        let db = temp_dir.path().join("never_created.db");

        let result = execute_export("SELECT 1", "xml", None, &db);

        assert!(matches!(result, Err(Error::UnsupportedFormat(_))));
        assert!(!db.exists());
    }

    #[test]
    fn test_export_to_file_creates_parent_directory() {
        let temp_dir = TempDir::new().unwrap();
        let db = temp_dir.path().join("data.db");
        DuckDBStore::open(&db).unwrap().close().unwrap();
        let output = temp_dir.path().join("out").join("result.json");

        execute_export("SELECT 42 AS answer", "json", Some(&output), &db).unwrap();

        let written = std::fs::read_to_string(&output).unwrap();
        assert_eq!(written, "[\n  {\n    \"answer\": 42\n  }\n]\n");
    }

    #[test]
    fn test_export_missing_database_is_not_created() {
        // Given: 存在しないDBファイル
        let temp_dir = TempDir::new().unwrap();
        let db = temp_dir.path().join("missing.db");

        // When
        let result = execute_export("SELECT * FROM changelog", "csv", None, &db);

        // Then: 分かりやすいエラーで終了し、ファイルは作られない
        match result {
            Err(Error::ConfigurationMissing(msg)) => assert!(msg.contains("missing.db")),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(!db.exists());
    }

    #[test]
    fn test_ensure_parent_dir() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("a").join("b").join("jira_data.db");

        ensure_parent_dir(&nested).unwrap();
        assert!(nested.parent().unwrap().is_dir());

        ensure_parent_dir(Path::new("jira_data.db")).unwrap();
    }
}
