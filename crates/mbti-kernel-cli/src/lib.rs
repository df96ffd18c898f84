//! Stable embedded command surface for host runtimes.
//!
//! Hosts should embed the kernel through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_session_with_db`] for direct [`Command`] execution against a DB path.
//! - [`run_session`] for execution against an existing [`SessionStore`].

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use mbti_kernel_core::{
    compute_full_result, upsert_answer, Answer, AssessmentResult, ContentCache, MapContentSource,
    QuestionCatalog, SessionConfig, TypeCode, TypeContent,
};
use mbti_kernel_store_sqlite::{
    Clock, HistoryRecord, KeyValueStore, SessionStore, SqliteKeyValueStore, SystemClock,
};
use serde_json::Value;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const SCORE_CONTRACT_VERSION: &str = "score.v1";

#[derive(Debug, Parser)]
#[command(name = "mbti")]
#[command(about = "MBTI Kernel CLI")]
pub struct Cli {
    #[arg(long, default_value = "./mbti_kernel.sqlite3")]
    db: PathBuf,

    #[arg(long, default_value_t = 7)]
    progress_ttl_days: u32,

    #[arg(long, default_value_t = 50)]
    history_limit: usize,

    #[arg(long, value_enum, default_value_t = LogFormatArg::Pretty)]
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn log_format(&self) -> LogFormatArg {
        self.log_format
    }

    /// # Errors
    /// Returns an error when the retention flags are out of range.
    pub fn session_config(&self) -> Result<SessionConfig> {
        let config = SessionConfig {
            progress_ttl_days: self.progress_ttl_days,
            history_limit: self.history_limit,
            ..SessionConfig::v1()
        };
        config
            .validate()
            .map_err(|err| anyhow!("invalid session flags: {err}"))?;
        Ok(config)
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Score(ScoreArgs),
    Progress {
        #[command(subcommand)]
        command: Box<ProgressCommand>,
    },
    History {
        #[command(subcommand)]
        command: Box<HistoryCommand>,
    },
    Types {
        #[command(subcommand)]
        command: Box<TypesCommand>,
    },
}

#[derive(Debug, Args)]
pub struct ScoreArgs {
    #[arg(long)]
    catalog: PathBuf,
    #[arg(long)]
    answers: PathBuf,
    #[arg(long)]
    content: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum ProgressCommand {
    Save(ProgressSaveArgs),
    Show,
    Clear,
}

#[derive(Debug, Args)]
pub struct ProgressSaveArgs {
    #[arg(long)]
    answers: PathBuf,
    #[arg(long)]
    current_question: usize,
}

#[derive(Debug, Subcommand)]
pub enum HistoryCommand {
    Save(HistorySaveArgs),
    List(HistoryListArgs),
    Show(HistoryIdArgs),
    Delete(HistoryIdArgs),
    Clear,
}

#[derive(Debug, Args)]
pub struct HistorySaveArgs {
    #[arg(long)]
    catalog: PathBuf,
    #[arg(long)]
    answers: PathBuf,
}

#[derive(Debug, Args)]
pub struct HistoryListArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct HistoryIdArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Subcommand)]
pub enum TypesCommand {
    List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Pretty,
    Json,
}

/// Installs a stderr `tracing` subscriber filtered by `RUST_LOG`
/// (default `warn`). Later calls are no-ops.
pub fn init_logging(format: LogFormatArg) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = match format {
        LogFormatArg::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        LogFormatArg::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    };
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when flags are invalid, store open/migration fails, or
/// command execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = cli.session_config()?;
    run_session_with_db(&cli.db, config, cli.command)
}

/// Executes a parsed command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_session_with_db(db_path: &Path, config: SessionConfig, command: Command) -> Result<()> {
    match command {
        Command::Score(args) => run_score(&args),
        Command::Types { command } => run_types(&command),
        session_command => {
            let kv = SqliteKeyValueStore::open(db_path)?;
            kv.migrate()?;
            let mut store = SessionStore::with_config(kv, config, SystemClock)?;
            run_session(session_command, &mut store)
        }
    }
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when input files are invalid or a session write reports
/// failure.
pub fn run_session<S: KeyValueStore, C: Clock>(
    command: Command,
    store: &mut SessionStore<S, C>,
) -> Result<()> {
    match command {
        Command::Score(args) => run_score(&args),
        Command::Progress { command } => run_progress(*command, store),
        Command::History { command } => run_history(*command, store),
        Command::Types { command } => run_types(&command),
    }
}

fn run_score(args: &ScoreArgs) -> Result<()> {
    let payload = score_payload(args)?;
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn score_payload(args: &ScoreArgs) -> Result<ScorePayload> {
    let catalog = load_catalog(&args.catalog)?;
    let answers = load_answers(&args.answers)?;
    let result = compute_full_result(&answers, &catalog);

    let content = match &args.content {
        Some(path) => {
            let source = MapContentSource::from_json(&read_json_file(path)?)
                .map_err(|err| anyhow!("invalid content file {}: {err}", path.display()))?;
            let mut cache = ContentCache::new(source);
            match cache.get(result.type_code) {
                Ok(content) => Some(content.clone()),
                Err(err) => {
                    tracing::warn!(type_code = %result.type_code, "no content attached: {err}");
                    None
                }
            }
        }
        None => None,
    };

    Ok(build_score_payload(result, content))
}

fn run_progress<S: KeyValueStore, C: Clock>(
    command: ProgressCommand,
    store: &mut SessionStore<S, C>,
) -> Result<()> {
    match command {
        ProgressCommand::Save(args) => {
            let answers = load_answers(&args.answers)?;
            if !store.save_progress(&answers, args.current_question) {
                return Err(anyhow!("failed to save progress"));
            }
            let saved = store.load_progress();
            println!("{}", serde_json::to_string_pretty(&saved)?);
            Ok(())
        }
        ProgressCommand::Show => {
            let progress = store.load_progress();
            println!("{}", serde_json::to_string_pretty(&progress)?);
            Ok(())
        }
        ProgressCommand::Clear => {
            if !store.clear_progress() {
                return Err(anyhow!("failed to clear progress"));
            }
            println!("{}", serde_json::json!({ "cleared": "progress" }));
            Ok(())
        }
    }
}

fn run_history<S: KeyValueStore, C: Clock>(
    command: HistoryCommand,
    store: &mut SessionStore<S, C>,
) -> Result<()> {
    match command {
        HistoryCommand::Save(args) => {
            let catalog = load_catalog(&args.catalog)?;
            let answers = load_answers(&args.answers)?;
            let result = compute_full_result(&answers, &catalog);

            let Some(record) = store.save_test_result(result.type_code, &answers, &result.scores)
            else {
                return Err(anyhow!("failed to save test result"));
            };
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        HistoryCommand::List(args) => {
            let history = store.get_test_history();
            if args.json {
                println!("{}", serde_json::to_string_pretty(&history)?);
            } else {
                print_history_table(&history);
            }
            Ok(())
        }
        HistoryCommand::Show(args) => {
            let Some(record) = store.get_test_history_by_id(&args.id) else {
                return Err(anyhow!("history record not found: {}", args.id));
            };
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        HistoryCommand::Delete(args) => {
            if !store.delete_test_history(&args.id) {
                return Err(anyhow!("failed to delete history record {}", args.id));
            }
            println!("{}", serde_json::json!({ "deleted": args.id }));
            Ok(())
        }
        HistoryCommand::Clear => {
            if !store.clear_all_history() {
                return Err(anyhow!("failed to clear history"));
            }
            println!("{}", serde_json::json!({ "cleared": "history" }));
            Ok(())
        }
    }
}

fn run_types(command: &TypesCommand) -> Result<()> {
    match command {
        TypesCommand::List => {
            println!("{}", serde_json::to_string_pretty(&TypeCode::all())?);
            Ok(())
        }
    }
}

fn read_json_file(path: &Path) -> Result<Value> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&body).with_context(|| format!("{} must be valid JSON", path.display()))
}

fn load_catalog(path: &Path) -> Result<QuestionCatalog> {
    QuestionCatalog::from_json(&read_json_file(path)?)
        .map_err(|err| anyhow!("invalid catalog {}: {err}", path.display()))
}

fn load_answers(path: &Path) -> Result<Vec<Answer>> {
    parse_answers(read_json_file(path)?)
        .with_context(|| format!("invalid answers file {}", path.display()))
}

/// Decodes an answer sheet. A repeated `questionId` replaces the earlier
/// answer in place.
fn parse_answers(value: Value) -> Result<Vec<Answer>> {
    let decoded: Vec<Answer> = serde_json::from_value(value)
        .context("answers must be an array of {questionId, value, weight} with weight in [0, 1]")?;

    let mut answers = Vec::with_capacity(decoded.len());
    for answer in decoded {
        upsert_answer(&mut answers, answer);
    }
    Ok(answers)
}

fn print_history_table(history: &[HistoryRecord]) {
    println!("{:<28} {:<18} {:<6} answers", "id", "date", "type");
    println!("{}", "-".repeat(64));
    for record in history {
        println!(
            "{:<28} {:<18} {:<6} {}",
            record.id,
            record.date,
            record.type_code,
            record.answers.len()
        );
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct ScorePayload {
    contract_version: String,
    #[serde(flatten)]
    result: AssessmentResult,
    content: Option<TypeContent>,
}

fn build_score_payload(result: AssessmentResult, content: Option<TypeContent>) -> ScorePayload {
    ScorePayload {
        contract_version: SCORE_CONTRACT_VERSION.to_string(),
        result,
        content,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mbti_kernel_core::{Choice, Preference, Question, TraitPair};
    use mbti_kernel_store_sqlite::{FixedClock, MemoryKeyValueStore};
    use serde_json::json;
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_catalog_json() -> Value {
        Value::Array(
            TraitPair::ALL
                .into_iter()
                .map(|pair| {
                    json!({
                        "question": pair.as_str(),
                        "choice_a": { "value": pair.left(), "text": "A" },
                        "choice_b": { "value": pair.right(), "text": "B" }
                    })
                })
                .collect(),
        )
    }

    fn write_temp_json(label: &str, value: &Value) -> PathBuf {
        let path = std::env::temp_dir().join(format!("mbti-cli-{label}-{}.json", Ulid::new()));
        must(std::fs::write(&path, value.to_string()).map_err(Into::into));
        path
    }

    fn execute_cli(args: Vec<String>) -> Result<()> {
        let cli = Cli::try_parse_from(args)?;
        run_cli(cli)
    }

    #[test]
    fn parse_answers_accepts_legacy_and_weighted_shapes() {
        let answers = must(parse_answers(json!([
            { "questionId": 0, "value": "E" },
            { "questionId": 1, "value": "N", "weight": 0.25 }
        ])));
        assert_eq!(answers.len(), 2);
        assert!((answers[0].weight - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn parse_answers_rejects_unknown_letters() {
        assert!(parse_answers(json!([{ "questionId": 0, "value": "X", "weight": 1.0 }])).is_err());
    }

    #[test]
    fn session_flags_are_validated() {
        let cli = must(
            Cli::try_parse_from(["mbti", "--history-limit", "0", "types", "list"])
                .map_err(Into::into),
        );
        assert!(cli.session_config().is_err());
    }

    #[test]
    fn score_json_contract_is_stable_v1() {
        let catalog = must(QuestionCatalog::from_json(&fixture_catalog_json()).map_err(Into::into));
        let answers = must(parse_answers(json!([
            { "questionId": 0, "value": "I", "weight": 0.25 },
            { "questionId": 1, "value": "N", "weight": 0.0 },
            { "questionId": 2, "value": "T", "weight": 0.75 },
            { "questionId": 3, "value": "J", "weight": 0.5 }
        ])));
        let result = compute_full_result(&answers, &catalog);
        let content = TypeContent {
            name: "Architect".to_string(),
            ..TypeContent::default()
        };

        let value = must(
            serde_json::to_value(build_score_payload(result, Some(content))).map_err(Into::into),
        );
        assert_eq!(value["contract_version"], json!("score.v1"));
        assert_eq!(value["type_code"], json!("INTJ"));
        assert_eq!(
            value["scores"],
            json!({ "E": 0.25, "I": 0.75, "S": 0.0, "N": 1.0, "T": 0.75, "F": 0.25, "J": 0.5, "P": 0.5 })
        );
        assert_eq!(
            value["dimensions"][0],
            json!({
                "pair": "E/I",
                "left": { "preference": "E", "score": 0.25, "percent": 25 },
                "right": { "preference": "I", "score": 0.75, "percent": 75 },
                "dominant": { "preference": "I", "score": 0.75, "percent": 75 },
                "total_questions": 1
            })
        );
        assert_eq!(value["content"]["name"], json!("Architect"));
    }

    #[test]
    fn run_session_drives_history_against_memory_store() {
        let catalog_path = write_temp_json("catalog", &fixture_catalog_json());
        let answers_path = write_temp_json(
            "answers",
            &json!([
                { "questionId": 0, "value": "E", "weight": 1.0 },
                { "questionId": 1, "value": "S", "weight": 1.0 },
                { "questionId": 2, "value": "T", "weight": 1.0 },
                { "questionId": 3, "value": "J", "weight": 1.0 }
            ]),
        );
        let mut store = must(SessionStore::with_config(
            MemoryKeyValueStore::new(),
            SessionConfig::v1(),
            FixedClock(mbti_kernel_core::now_utc()),
        ));

        must(run_session(
            Command::Progress {
                command: Box::new(ProgressCommand::Save(ProgressSaveArgs {
                    answers: answers_path.clone(),
                    current_question: 3,
                })),
            },
            &mut store,
        ));
        assert!(store.load_progress().is_some());

        must(run_session(
            Command::History {
                command: Box::new(HistoryCommand::Save(HistorySaveArgs {
                    catalog: catalog_path,
                    answers: answers_path,
                })),
            },
            &mut store,
        ));

        let history = store.get_test_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].type_code.to_string(), "ESTJ");
        assert!(store.load_progress().is_none());

        let missing = run_session(
            Command::History {
                command: Box::new(HistoryCommand::Show(HistoryIdArgs {
                    id: "missing".to_string(),
                })),
            },
            &mut store,
        );
        assert!(missing.is_err());
    }

    #[test]
    fn stable_embed_api_host_path_stays_operational() {
        let db_path = std::env::temp_dir().join(format!("mbti-embed-host-{}.sqlite3", Ulid::new()));
        let answers_path = write_temp_json(
            "embed-answers",
            &json!([{ "questionId": 0, "value": "I", "weight": 0.0 }]),
        );

        must(run_session_with_db(
            &db_path,
            SessionConfig::v1(),
            Command::Progress {
                command: Box::new(ProgressCommand::Save(ProgressSaveArgs {
                    answers: answers_path,
                    current_question: 1,
                })),
            },
        ));

        let kv = must(SqliteKeyValueStore::open(&db_path));
        let raw = must(kv.get("mbti_progress"));
        let stored: Value = match raw {
            Some(body) => must(serde_json::from_str(&body).map_err(Into::into)),
            None => panic!("progress was not persisted"),
        };
        assert_eq!(stored["currentQuestion"], json!(1));
        assert_eq!(stored["answers"][0]["value"], json!("I"));

        let db_path_str = match db_path.to_str() {
            Some(value) => value.to_string(),
            None => panic!("temp db path must be valid UTF-8"),
        };
        must(execute_cli(vec![
            "mbti".to_string(),
            "--db".to_string(),
            db_path_str,
            "progress".to_string(),
            "clear".to_string(),
        ]));
        assert_eq!(must(kv.get("mbti_progress")), None);
    }

    #[test]
    fn score_attaches_content_only_when_available() {
        let catalog_path = write_temp_json("score-catalog", &fixture_catalog_json());
        let content_path = write_temp_json(
            "score-content",
            &json!({ "INTJ": { "name": "Architect" } }),
        );
        let intj_answers = write_temp_json(
            "score-intj",
            &json!([
                { "questionId": 0, "value": "I", "weight": 0.0 },
                { "questionId": 1, "value": "N", "weight": 0.0 },
                { "questionId": 2, "value": "T", "weight": 1.0 },
                { "questionId": 3, "value": "J", "weight": 1.0 }
            ]),
        );
        let estj_answers = write_temp_json(
            "score-estj",
            &json!([{ "questionId": 0, "value": "E", "weight": 1.0 }]),
        );

        let attached = must(score_payload(&ScoreArgs {
            catalog: catalog_path.clone(),
            answers: intj_answers,
            content: Some(content_path.clone()),
        }));
        assert_eq!(attached.result.type_code.to_string(), "INTJ");
        assert_eq!(
            attached.content.map(|content| content.name),
            Some("Architect".to_string())
        );

        let missing = must(score_payload(&ScoreArgs {
            catalog: catalog_path,
            answers: estj_answers,
            content: Some(content_path),
        }));
        assert_eq!(missing.result.type_code.to_string(), "ESTJ");
        assert!(missing.content.is_none());
    }

    #[test]
    fn parse_answers_rejects_out_of_range_weights() {
        assert!(parse_answers(json!([{ "questionId": 0, "value": "E", "weight": 1.5 }])).is_err());
        assert!(parse_answers(json!([{ "questionId": 1, "value": "S", "weight": -2.0 }])).is_err());
    }

    #[test]
    fn repeated_question_ids_keep_the_later_answer() {
        let answers = must(parse_answers(json!([
            { "questionId": 0, "value": "E", "weight": 1.0 },
            { "questionId": 1, "value": "N", "weight": 0.0 },
            { "questionId": 0, "value": "I", "weight": 0.0 }
        ])));
        assert_eq!(answers.len(), 2);
        assert_eq!(answers[0].value, Preference::I);
        assert!(answers[0].weight.abs() < f64::EPSILON);

        let catalog = must(QuestionCatalog::from_json(&fixture_catalog_json()).map_err(Into::into));
        let result = compute_full_result(&answers, &catalog);
        assert!(result.scores.get(Preference::E).abs() < f64::EPSILON);
        assert!((result.scores.get(Preference::I) - 1.0).abs() < f64::EPSILON);
        assert_eq!(result.dimensions[0].total_questions, 1);
    }

    #[test]
    fn question_fixture_matches_core_shape() {
        let catalog = must(QuestionCatalog::from_json(&fixture_catalog_json()).map_err(Into::into));
        assert_eq!(
            catalog.get(0),
            Some(&Question {
                question: "E/I".to_string(),
                choice_a: Choice {
                    value: Preference::E,
                    text: "A".to_string(),
                },
                choice_b: Choice {
                    value: Preference::I,
                    text: "B".to_string(),
                },
            })
        );
    }
}
