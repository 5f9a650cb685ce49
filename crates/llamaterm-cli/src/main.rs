mod attach;
mod config;
mod export;
mod logging;
mod session;

use anyhow::{bail, Context as _, Result};
use clap::{Args, Parser, Subcommand};
use llamaterm_core::{Chat, ChatBackend, LlmModel, DEFAULT_TOPIC_ID};
use llamaterm_ollama::{normalize_base_url, sync_registry, OllamaClient};
use llamaterm_storage::ChatStore;
use llamaterm_topics::{ClassificationReport, TopicResolver};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::future::Future;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tracing::{debug, info, warn};

use crate::attach::attach_to_question;
use crate::config::{config_path, load_config, save_config, LlamatermConfig};
use crate::export::{expand_home, export_code, export_text};
use crate::session::{lock, parse_input, plan_classification, ChatSession, SessionInput};

#[derive(Parser)]
#[command(name = "llamaterm")]
#[command(about = "Terminal chat client for a local Ollama server", long_about = None)]
struct Cli {
    /// Log at debug level.
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    /// Server url for this invocation.
    #[arg(long, global = true)]
    url: Option<String>,
    /// Database file for this invocation.
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive conversation, or resume a topic's chats
    Chat {
        #[arg(long)]
        topic: Option<i64>,
        #[arg(long)]
        context: Option<i64>,
    },
    /// Ask a single question
    Ask {
        question: String,
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        no_classify: bool,
    },
    /// Classify unclassified chats
    Classify {
        /// Chats forming one conversation; without it each unclassified chat
        /// is classified on its own
        #[arg(long = "chat")]
        chats: Vec<i64>,
    },
    Topics {
        #[command(subcommand)]
        action: TopicCommands,
    },
    Categories {
        #[command(subcommand)]
        action: CategoryCommands,
    },
    Contexts {
        #[command(subcommand)]
        action: ContextCommands,
    },
    Models {
        #[command(subcommand)]
        action: ModelCommands,
    },
    /// Show stored chats for a topic or context
    History(HistoryArgs),
    /// Export a topic's chats as text, or its code blocks as files
    Export {
        #[arg(long)]
        topic: i64,
        path: String,
        #[arg(long, default_value_t = false)]
        code: bool,
    },
    Settings {
        #[command(subcommand)]
        action: SettingsCommands,
    },
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum TopicCommands {
    List {
        #[arg(long)]
        category: Option<i64>,
    },
    Add {
        text: String,
        #[arg(long)]
        category: i64,
    },
    Rename {
        id: i64,
        text: String,
    },
    Move {
        id: i64,
        #[arg(long)]
        category: i64,
    },
}

#[derive(Subcommand)]
enum CategoryCommands {
    List,
    Add { text: String },
    Rename { id: i64, text: String },
}

#[derive(Subcommand)]
enum ContextCommands {
    List,
    Add { text: String },
    Edit { id: i64, text: String },
    Use { id: i64 },
}

#[derive(Subcommand)]
enum ModelCommands {
    List {
        #[arg(long, default_value_t = false)]
        all: bool,
    },
    Sync,
    Pull { name: String },
    Delete { name: String },
    Use { id: i64 },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct HistoryArgs {
    #[arg(long)]
    topic: Option<i64>,
    #[arg(long)]
    context: Option<i64>,
}

#[derive(Subcommand)]
enum SettingsCommands {
    Show,
    Url { url: String },
}

#[derive(Subcommand)]
enum ConfigCommands {
    Init {
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    Show,
}

struct App {
    config: LlamatermConfig,
    store: Mutex<ChatStore>,
    url_override: Option<String>,
}

impl App {
    fn open(cli: &Cli, mut config: LlamatermConfig) -> Result<Self> {
        if let Some(db) = &cli.db {
            config.database_path = Some(db.clone());
        }
        let path = config.database_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let store = ChatStore::open(&path)
            .with_context(|| format!("failed to open database {}", path.display()))?;
        info!(path = %path.display(), "database opened");

        let url_override = cli.url.clone().or_else(|| config.url.clone());
        Ok(Self {
            config,
            store: Mutex::new(store),
            url_override,
        })
    }

    fn server_url(&self) -> Result<String> {
        match &self.url_override {
            Some(url) => Ok(url.clone()),
            None => Ok(lock(&self.store)?.settings()?.url),
        }
    }

    fn client(&self) -> Result<OllamaClient> {
        let url = self.server_url()?;
        OllamaClient::new(&url, self.config.request_timeout())
            .with_context(|| format!("cannot use server url {url}"))
    }

    async fn current_model(&self, client: &OllamaClient) -> Result<LlmModel> {
        {
            let db = lock(&self.store)?;
            if let Some(model) = db
                .settings()?
                .llm_model_id
                .map(|id| db.model(id))
                .transpose()?
                .flatten()
                .filter(|model| model.currently_available)
            {
                return Ok(model);
            }
        }

        if let Err(err) = sync_registry(client, &self.store).await {
            warn!(error = %err, "model sync failed");
            eprintln!("warning: could not reach {}: {err}", client.base_url());
        }

        let db = lock(&self.store)?;
        let model = match db.available_models()?.into_iter().next() {
            Some(model) => model,
            None => db.ensure_placeholder_model()?,
        };
        db.set_current_model(model.id)?;
        Ok(model)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_file = config_path();
    let config = load_config(&config_file)?;
    let log_guard = logging::init_logging(cli.debug, &config.log_path());
    if let Some(guard) = &log_guard {
        debug!(file_backed = guard.is_file_backed(), "logging initialized");
    }

    if let Commands::Config { action } = &cli.command {
        return run_config(action, &config_file, &config);
    }

    let app = App::open(&cli, config)?;
    match cli.command {
        Commands::Chat { topic, context } => run_chat(&app, topic, context).await,
        Commands::Ask {
            question,
            file,
            no_classify,
        } => run_ask(&app, question, file, no_classify).await,
        Commands::Classify { chats } => run_classify(&app, chats).await,
        Commands::Topics { action } => run_topics(&app, action),
        Commands::Categories { action } => run_categories(&app, action),
        Commands::Contexts { action } => run_contexts(&app, action),
        Commands::Models { action } => run_models(&app, action).await,
        Commands::History(args) => run_history(&app, args),
        Commands::Export { topic, path, code } => run_export(&app, topic, &path, code),
        Commands::Settings { action } => run_settings(&app, action),
        Commands::Config { .. } => Ok(()),
    }
}

fn run_config(
    action: &ConfigCommands,
    path: &std::path::Path,
    config: &LlamatermConfig,
) -> Result<()> {
    match action {
        ConfigCommands::Init { force } => {
            if path.exists() && !force {
                bail!("{} already exists; use --force to overwrite", path.display());
            }
            save_config(path, &LlamatermConfig::default())?;
            println!("Wrote {}", path.display());
        }
        ConfigCommands::Show => {
            println!("# {}", path.display());
            print!(
                "{}",
                toml::to_string_pretty(config).context("failed to render config")?
            );
        }
    }
    Ok(())
}

async fn run_chat(app: &App, topic: Option<i64>, context: Option<i64>) -> Result<()> {
    let client = app.client()?;
    let resolver = TopicResolver::new(&client, app.config.resolver_config());
    let model = app.current_model(&client).await?;

    let mut session = {
        let db = lock(&app.store)?;
        let resumable = match topic {
            Some(topic_id) if topic_id != DEFAULT_TOPIC_ID => {
                !db.chats_for_topic(topic_id)?.is_empty()
            }
            Some(_) => false,
            None => false,
        };
        let mut session = match topic {
            Some(topic_id) if resumable => {
                db.set_current_topic(topic_id)?;
                ChatSession::resume(&db, topic_id, model)?
            }
            Some(topic_id) => {
                let topic = db
                    .topic(topic_id)?
                    .with_context(|| format!("topic {topic_id} not found"))?;
                let context_id = db.settings()?.context_id;
                let context = db
                    .context(context_id)?
                    .with_context(|| format!("context {context_id} not found"))?;
                ChatSession::new(context, model, topic.id)
            }
            None => {
                let context_id = db.settings()?.context_id;
                let context = db
                    .context(context_id)?
                    .with_context(|| format!("context {context_id} not found"))?;
                ChatSession::new(context, model, DEFAULT_TOPIC_ID)
            }
        };
        if let Some(context_id) = context {
            let context = db
                .context(context_id)?
                .with_context(|| format!("context {context_id} not found"))?;
            session.set_context(context);
        }
        session
    };

    println!(
        "Chatting with {} (context {}, topic {}). /help for commands, /quit or Ctrl-C to end.",
        session.model().name,
        session.context().id,
        session.topic_id()
    );
    if session.transcript().len() > 1 {
        println!("Resumed {} earlier chats.", session.chat_ids().len());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pending_file: Option<PathBuf> = None;
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let line = next_line_or_interrupt(&mut lines, tokio::signal::ctrl_c()).await?;
        let Some(line) = line else {
            println!();
            break;
        };
        let Some(input) = parse_input(&line) else {
            continue;
        };

        match input {
            SessionInput::Quit => break,
            SessionInput::Help => {
                println!("/file PATH  attach a file or directory to the next question");
                println!("/save PATH  export this conversation as text");
                println!("/context ID switch system context");
                println!("/model ID   switch model");
                println!("/quit       end the conversation");
            }
            SessionInput::AttachFile(path) => {
                let path = expand_home(&path.to_string_lossy());
                if !path.exists() {
                    eprintln!("no such file: {}", path.display());
                    continue;
                }
                println!("Attached {} to the next question.", path.display());
                pending_file = Some(path);
            }
            SessionInput::Save(path) => {
                let path = expand_home(&path.to_string_lossy());
                let chats = session_chats(app, session.chat_ids())?;
                match export_text(&path, &chats) {
                    Ok(()) => println!("Saved {} chats to {}", chats.len(), path.display()),
                    Err(err) => eprintln!("export failed: {err:#}"),
                }
            }
            SessionInput::UseContext(id) => match lock(&app.store)?.context(id)? {
                Some(context) => {
                    session.set_context(context);
                    println!("Using context {id}.");
                }
                None => eprintln!("context {id} not found"),
            },
            SessionInput::UseModel(id) => match lock(&app.store)?.model(id)? {
                Some(model) if model.currently_available => {
                    println!("Using model {}.", model.name);
                    session.set_model(model);
                }
                Some(model) => eprintln!("model {} is not available", model.name),
                None => eprintln!("model {id} not found"),
            },
            SessionInput::Unknown(command) => eprintln!("unknown command: {command}"),
            SessionInput::Question(question) => {
                let question = match pending_file.take() {
                    Some(path) => attach_to_question(&question, &path),
                    None => question,
                };
                tokio::select! {
                    result = session.ask(&app.store, &client, question) => match result {
                        Ok(chat) => println!("\n{}\n", chat.answer),
                        Err(err) => eprintln!("error: {err:#}"),
                    },
                    _ = tokio::signal::ctrl_c() => println!("\nRequest cancelled."),
                }
            }
        }
    }

    finish_session(app, &resolver, &mut session).await;
    Ok(())
}

/// `None` on end of input or when `interrupt` fires first.
async fn next_line_or_interrupt<R, F>(
    lines: &mut Lines<R>,
    interrupt: F,
) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
    F: Future,
{
    tokio::select! {
        line = lines.next_line() => Ok(line?),
        _ = interrupt => Ok(None),
    }
}

async fn run_ask(
    app: &App,
    question: String,
    file: Option<PathBuf>,
    no_classify: bool,
) -> Result<()> {
    let client = app.client()?;
    let resolver = TopicResolver::new(&client, app.config.resolver_config());
    let model = app.current_model(&client).await?;
    let mut session = {
        let db = lock(&app.store)?;
        let context_id = db.settings()?.context_id;
        let context = db
            .context(context_id)?
            .with_context(|| format!("context {context_id} not found"))?;
        ChatSession::new(context, model, DEFAULT_TOPIC_ID)
    };

    let question = match file {
        Some(path) => attach_to_question(&question, &path),
        None => question,
    };
    let chat = session.ask(&app.store, &client, question).await?;
    println!("{}", chat.answer);

    if !no_classify {
        finish_session(app, &resolver, &mut session).await;
    }
    Ok(())
}

/// Classification failure is not fatal: the chats stay on the default topic
/// and `classify` can be run later.
async fn finish_session<B: ChatBackend>(
    app: &App,
    resolver: &TopicResolver<B>,
    session: &mut ChatSession,
) {
    if !session.needs_classification() {
        return;
    }
    println!("Classifying conversation (Ctrl-C to skip)...");
    tokio::select! {
        result = session.classify(&app.store, resolver) => match result {
            Ok(Some(report)) => print_classification(&report),
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "classification failed");
                eprintln!("Classification failed, chats stay unclassified: {err:#}");
            }
        },
        _ = tokio::signal::ctrl_c() => {
            println!("Classification skipped, chats stay unclassified.");
        }
    }
}

fn print_classification(report: &ClassificationReport) {
    let resolution = &report.resolution;
    println!(
        "Saved {} chats under topic '{}' ({:?}) in category '{}' ({:?}).",
        report.chats_repointed,
        resolution.topic.text,
        resolution.topic_outcome,
        resolution.category.text,
        resolution.category_outcome
    );
}

async fn run_classify(app: &App, chat_ids: Vec<i64>) -> Result<()> {
    let client = app.client()?;
    let resolver = TopicResolver::new(&client, app.config.resolver_config());
    let model = app.current_model(&client).await?;

    let batches = plan_classification(&*lock(&app.store)?, &chat_ids)?;
    if batches.is_empty() {
        println!("No unclassified chats.");
        return Ok(());
    }

    let mut failures = 0;
    for batch in batches {
        match resolver
            .classify_conversation(&app.store, &batch.transcript, &model.name, &batch.chat_ids)
            .await
        {
            Ok(report) => print_classification(&report),
            Err(err) => {
                failures += 1;
                warn!(error = %err, chats = ?batch.chat_ids, "classification failed");
                eprintln!("Chats {:?} stay unclassified: {err}", batch.chat_ids);
            }
        }
    }
    if failures > 0 {
        bail!("{failures} conversations could not be classified");
    }
    Ok(())
}

fn run_topics(app: &App, action: TopicCommands) -> Result<()> {
    let db = lock(&app.store)?;
    match action {
        TopicCommands::List { category } => {
            let topics = match category {
                Some(category_id) => db.topics_for_category(category_id)?,
                None => db.topics()?,
            };
            for topic in topics {
                let category = db
                    .category(topic.category_id)?
                    .map(|category| category.text)
                    .unwrap_or_default();
                println!("{:>4}  {}  [{}]", topic.id, topic.text, category);
            }
        }
        TopicCommands::Add { text, category } => {
            let result = db.get_or_create_topic(&text, category)?;
            let verb = if result.created { "Created" } else { "Exists" };
            println!("{verb}: {} {}", result.record.id, result.record.text);
        }
        TopicCommands::Rename { id, text } => {
            let topic = db.rename_topic(id, &text)?;
            println!("Renamed topic {} to {}", topic.id, topic.text);
        }
        TopicCommands::Move { id, category } => {
            let topic = db.move_topic(id, category)?;
            println!("Moved topic {} to category {}", topic.id, topic.category_id);
        }
    }
    Ok(())
}

fn run_categories(app: &App, action: CategoryCommands) -> Result<()> {
    let db = lock(&app.store)?;
    match action {
        CategoryCommands::List => {
            for category in db.categories()? {
                let topics = db.topics_for_category(category.id)?.len();
                println!("{:>4}  {}  ({topics} topics)", category.id, category.text);
            }
        }
        CategoryCommands::Add { text } => {
            let result = db.get_or_create_category(&text)?;
            let verb = if result.created { "Created" } else { "Exists" };
            println!("{verb}: {} {}", result.record.id, result.record.text);
        }
        CategoryCommands::Rename { id, text } => {
            let category = db.rename_category(id, &text)?;
            println!("Renamed category {} to {}", category.id, category.text);
        }
    }
    Ok(())
}

fn run_contexts(app: &App, action: ContextCommands) -> Result<()> {
    let db = lock(&app.store)?;
    match action {
        ContextCommands::List => {
            let current = db.settings()?.context_id;
            for context in db.contexts()? {
                let marker = if context.id == current { "*" } else { " " };
                println!("{marker}{:>4}  {}", context.id, context.text);
            }
        }
        ContextCommands::Add { text } => {
            let context = db.create_context(&text)?;
            println!("Created context {}", context.id);
        }
        ContextCommands::Edit { id, text } => {
            let context = db.update_context(id, &text)?;
            println!("Updated context {}", context.id);
        }
        ContextCommands::Use { id } => {
            db.set_current_context(id)?;
            println!("Using context {id}");
        }
    }
    Ok(())
}

async fn run_models(app: &App, action: ModelCommands) -> Result<()> {
    match action {
        ModelCommands::List { all } => {
            let db = lock(&app.store)?;
            let current = db.settings()?.llm_model_id;
            let models = if all {
                db.models()?
            } else {
                db.available_models()?
            };
            for model in models {
                let marker = if Some(model.id) == current { "*" } else { " " };
                let availability = if model.currently_available {
                    ""
                } else {
                    " (unavailable)"
                };
                println!(
                    "{marker}{:>4}  {}  {}  {} bytes{availability}",
                    model.id, model.name, model.specialization, model.size
                );
            }
        }
        ModelCommands::Sync => {
            let client = app.client()?;
            let report = sync_registry(&client, &app.store).await?;
            println!(
                "Server lists {} models: {} added, {} back, {} gone.",
                report.models_seen,
                report.models_added,
                report.marked_available,
                report.marked_unavailable
            );
        }
        ModelCommands::Pull { name } => {
            let client = app.client()?;
            println!("Pulling {name}, this can take a while...");
            let status = client.pull_model(&name).await?;
            println!("Pull finished: {status}");
            sync_registry(&client, &app.store).await?;
        }
        ModelCommands::Delete { name } => {
            let client = app.client()?;
            client.delete_model(&name).await?;
            let db = lock(&app.store)?;
            if let Some(model) = db.model_by_name(&name)? {
                db.set_model_availability(model.id, false)?;
            }
            println!("Deleted {name}");
        }
        ModelCommands::Use { id } => {
            let db = lock(&app.store)?;
            let settings = db.set_current_model(id)?;
            println!("Using model {}", settings.llm_model_id.unwrap_or(id));
        }
    }
    Ok(())
}

fn run_history(app: &App, args: HistoryArgs) -> Result<()> {
    let db = lock(&app.store)?;
    let chats = match (args.topic, args.context) {
        (Some(topic_id), _) => db.chats_for_topic(topic_id)?,
        (None, Some(context_id)) => db.chats_for_context(context_id)?,
        (None, None) => Vec::new(),
    };
    if chats.is_empty() {
        println!("No chats.");
    }
    for chat in chats {
        println!("#{} {}", chat.id, chat.created_at.format("%Y-%m-%d %H:%M"));
        println!("Q: {}", chat.question);
        println!("A: {}\n", chat.answer);
    }
    Ok(())
}

fn run_export(app: &App, topic_id: i64, path: &str, code: bool) -> Result<()> {
    let chats = lock(&app.store)?.chats_for_topic(topic_id)?;
    if chats.is_empty() {
        bail!("topic {topic_id} has no chats");
    }
    let path = expand_home(path);
    if code {
        let written = export_code(&path, &chats)?;
        println!("Wrote {} code files to {}", written.len(), path.display());
    } else {
        export_text(&path, &chats)?;
        println!("Wrote {} chats to {}", chats.len(), path.display());
    }
    Ok(())
}

fn run_settings(app: &App, action: SettingsCommands) -> Result<()> {
    let db = lock(&app.store)?;
    match action {
        SettingsCommands::Show => {
            let settings = db.settings()?;
            println!("url      {}", settings.url);
            if let Some(url) = &app.url_override {
                println!("         (overridden by {url})");
            }
            let model = settings
                .llm_model_id
                .map(|id| db.model(id))
                .transpose()?
                .flatten()
                .map(|model| model.name)
                .unwrap_or_else(|| "none".to_string());
            println!("model    {model}");
            println!("context  {}", settings.context_id);
            println!("topic    {}", settings.topic_id);
            println!("updated  {}", settings.updated_at.to_rfc3339());
        }
        SettingsCommands::Url { url } => {
            let url = normalize_base_url(&url)?;
            db.set_url(&url)?;
            println!("Server url set to {url}");
        }
    }
    Ok(())
}

fn session_chats(app: &App, chat_ids: &[i64]) -> Result<Vec<Chat>> {
    let db = lock(&app.store)?;
    let mut chats = Vec::with_capacity(chat_ids.len());
    for id in chat_ids {
        if let Some(chat) = db.chat(*id)? {
            chats.push(chat);
        }
    }
    Ok(chats)
}
