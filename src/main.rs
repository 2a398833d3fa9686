use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use quarry_core::config::{Config, ProviderKind};
use quarry_core::{Coordinator, IngestReport, JobStatus, StatusReport, SynthesisJob};
use quarry_llm::any::AnyProvider;
use quarry_llm::ollama::OllamaProvider;
use quarry_llm::openai::OpenAiProvider;
use quarry_memory::document::load_path;
use quarry_memory::{Document, DocumentId, VectorFilter};
use tokio_util::sync::CancellationToken;

/// Retrieval-augmented answers over transcripts, web pages and documents.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to $QUARRY_CONFIG, then config/default.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Chunk, embed and index files or directories
    Ingest {
        /// Text, markdown or JSON files, or directories containing them
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Answer a question from the indexed content
    Query {
        question: String,
        /// Number of context chunks to retrieve
        #[arg(short)]
        k: Option<usize>,
        /// Only use chunks of this granularity (segment, topic, full)
        #[arg(long)]
        granularity: Option<String>,
        /// Only use chunks from this document id
        #[arg(long)]
        document: Option<String>,
        /// Mix transcript segments and topic groupings instead of a plain top-k
        #[arg(long, conflicts_with_all = ["k", "granularity"])]
        contextual: bool,
        /// With --contextual, also include the full transcript
        #[arg(long, requires = "contextual")]
        full: bool,
    },
    /// Re-embed every stored document with the configured embedding model
    Rebuild,
    /// Show index and document statistics
    Status,
    /// Remove a document from the index and the text store
    Delete { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let config_path = Config::resolve_path(cli.config.as_deref());
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    init_subscriber(&config.observability.log_filter);
    tracing::debug!(path = %config_path.display(), "configuration loaded");

    let provider = Arc::new(create_provider(&config)?);
    prepare_storage(&config).await?;
    let coordinator = Coordinator::open(Arc::clone(&provider), &config)
        .await
        .context("failed to open the knowledge base")?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e:#}");
            return;
        }
        tracing::info!("received interrupt, finishing in-flight calls");
        on_signal.cancel();
    });

    match cli.command {
        Commands::Ingest { paths } => {
            let (documents, load_failures) = load_documents(&paths).await?;
            if documents.is_empty() {
                bail!("no loadable documents found");
            }
            let report = coordinator.ingest(documents, &cancel).await?;
            print_ingest(&report, load_failures, cli.json)?;
            Ok(exit_code(report.failed + load_failures == 0))
        }
        Commands::Query {
            question,
            k,
            granularity,
            document,
            contextual,
            full,
        } => {
            let filter = build_filter(granularity, document);
            let job = if contextual {
                coordinator
                    .query_contextual(&question, full, filter, &cancel)
                    .await
            } else {
                coordinator.query(&question, k, filter, &cancel).await
            };
            print_job(&job, cli.json)?;
            Ok(exit_code(job.status() == JobStatus::Succeeded))
        }
        Commands::Rebuild => {
            let report = coordinator.rebuild(&cancel).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "model {}: invalidated {} index entries and {} cached embeddings",
                    report.model_id, report.invalidated_entries, report.invalidated_cache_entries
                );
                print_ingest(&report.ingest, 0, false)?;
            }
            Ok(exit_code(report.ingest.failed == 0))
        }
        Commands::Status => {
            let status = coordinator.status().await?;
            let reachable = if let AnyProvider::Ollama(p) = provider.as_ref() {
                Some(p.health_check().await.is_ok())
            } else {
                None
            };
            print_status(&status, &config, reachable, cli.json)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Delete { id } => {
            let removed = coordinator.delete_document(&DocumentId::new(id.clone())).await?;
            if cli.json {
                println!("{}", serde_json::json!({ "id": id, "removed": removed }));
            } else if removed {
                println!("deleted {id}");
            } else {
                println!("no document with id {id}");
            }
            Ok(exit_code(removed))
        }
    }
}

fn init_subscriber(config_filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(config_filter))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn create_provider(config: &Config) -> anyhow::Result<AnyProvider> {
    match config.llm.provider {
        ProviderKind::Ollama => Ok(AnyProvider::Ollama(OllamaProvider::new(
            &config.llm.base_url,
            config.llm.model.clone(),
            config.llm.embedding_model.clone(),
        ))),
        ProviderKind::OpenAi => {
            let api_key = config
                .secrets
                .openai_api_key
                .as_ref()
                .context("QUARRY_OPENAI_API_KEY must be set for the openai provider")?;
            let client = quarry_llm::http::default_client()?;
            Ok(AnyProvider::OpenAi(OpenAiProvider::new(
                client,
                api_key.expose().to_owned(),
                config.llm.base_url.clone(),
                config.llm.model.clone(),
                config.llm.embedding_model.clone(),
            )))
        }
    }
}

async fn prepare_storage(config: &Config) -> anyhow::Result<()> {
    let mut files = vec![config.store.sqlite_path.as_str()];
    if let Some(index) = &config.store.index_path {
        files.push(index.as_str());
    }
    for file in files {
        if file == ":memory:" {
            continue;
        }
        if let Some(parent) = Path::new(file).parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    Ok(())
}

/// Expand directories and load every supported file. Files that fail to load are
/// logged and counted, never fatal.
async fn load_documents(paths: &[PathBuf]) -> anyhow::Result<(Vec<Document>, usize)> {
    let mut files = Vec::new();
    for path in paths {
        collect_files(path, &mut files).await?;
    }

    let mut documents = Vec::new();
    let mut failures = 0;
    for file in files {
        match load_path(&file).await {
            Ok(mut docs) => {
                tracing::debug!(path = %file.display(), documents = docs.len(), "loaded");
                documents.append(&mut docs);
            }
            Err(e) => {
                tracing::warn!(path = %file.display(), error = %e, "skipping file");
                failures += 1;
            }
        }
    }
    Ok((documents, failures))
}

async fn collect_files(path: &Path, out: &mut Vec<PathBuf>) -> anyhow::Result<()> {
    let meta = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))?;
    if meta.is_file() {
        out.push(path.to_path_buf());
        return Ok(());
    }

    let mut pending = vec![path.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("cannot list {}", dir.display()))?;
        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let p = entry.path();
            if entry.file_type().await?.is_dir() {
                pending.push(p);
            } else if is_supported(&p) {
                found.push(p);
            }
        }
        found.sort();
        out.extend(found);
    }
    Ok(())
}

fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| {
            matches!(
                e.to_ascii_lowercase().as_str(),
                "txt" | "md" | "markdown" | "json"
            )
        })
}

fn build_filter(granularity: Option<String>, document: Option<String>) -> Option<VectorFilter> {
    if granularity.is_none() && document.is_none() {
        return None;
    }
    let mut filter = VectorFilter::default();
    if let Some(g) = granularity {
        filter = filter.must("granularity", g);
    }
    if let Some(d) = document {
        filter = filter.must("document_id", d);
    }
    Some(filter)
}

fn exit_code(ok: bool) -> ExitCode {
    if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}

fn print_ingest(report: &IngestReport, load_failures: usize, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    for o in &report.outcomes {
        match &o.failure {
            Some(reason) => println!("  failed   {}: {reason}", o.document_id),
            None if o.unchanged => println!("  same     {} (v{})", o.document_id, o.version),
            None => println!(
                "  indexed  {} (v{}, {} chunks, {} removed)",
                o.document_id, o.version, o.chunks, o.removed
            ),
        }
    }
    println!(
        "{} indexed, {} failed, {} unreadable in {:.1}s",
        report.indexed,
        report.failed,
        load_failures,
        report.duration.as_secs_f64()
    );
    Ok(())
}

fn print_job(job: &SynthesisJob, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(job)?);
        return Ok(());
    }
    match job.answer() {
        Some(answer) => {
            println!("{answer}\n");
            for item in job.retrieved_context() {
                if !job.citations().contains_key(&item.marker) {
                    continue;
                }
                let label = item.title.as_deref().unwrap_or(&item.source_uri);
                println!("[{}] {label} ({})", item.marker, item.source_uri);
            }
            if let Some(warning) = job.citation_warning() {
                println!("\nwarning: {warning}");
            }
        }
        None => {
            let reason = job
                .failure()
                .map_or_else(|| job.status().to_string(), ToString::to_string);
            println!("no answer: {reason}");
        }
    }
    Ok(())
}

fn print_status(
    status: &StatusReport,
    config: &Config,
    reachable: Option<bool>,
    json: bool,
) -> anyhow::Result<()> {
    if json {
        let mut value = serde_json::to_value(status)?;
        value["provider"] = serde_json::json!({
            "kind": config.llm.provider.as_str(),
            "model": config.llm.model,
            "embedding_model": config.llm.embedding_model,
            "reachable": reachable,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }
    println!(
        "provider:  {} ({}, embeddings {}){}",
        config.llm.provider,
        config.llm.model,
        config.llm.embedding_model,
        match reachable {
            Some(true) => " reachable",
            Some(false) => " unreachable",
            None => "",
        }
    );
    println!(
        "index:     {} entries, model {}, dimension {}",
        status.index_entries,
        status.model_id.as_deref().unwrap_or("-"),
        status.dimension.map_or_else(|| "-".to_owned(), |d| d.to_string())
    );
    println!("chunks:    {}", status.chunks);
    for (state, count) in &status.documents {
        println!("documents: {count} {state}");
    }
    if let Some(model) = &status.model_id
        && model != &config.llm.embedding_model
    {
        println!("note: index model differs from configured embedding model, run `quarry rebuild`");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_query_with_filters() {
        let cli = Cli::try_parse_from([
            "quarry",
            "--json",
            "query",
            "what is rust?",
            "-k",
            "3",
            "--granularity",
            "segment",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Query {
                question,
                k,
                granularity,
                document,
                contextual,
                ..
            } => {
                assert_eq!(question, "what is rust?");
                assert_eq!(k, Some(3));
                assert_eq!(granularity.as_deref(), Some("segment"));
                assert!(document.is_none());
                assert!(!contextual);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn contextual_query_flags() {
        let cli =
            Cli::try_parse_from(["quarry", "query", "billing?", "--contextual", "--full"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Query {
                contextual: true,
                full: true,
                ..
            }
        ));
        assert!(Cli::try_parse_from(["quarry", "query", "billing?", "--full"]).is_err());
        assert!(
            Cli::try_parse_from(["quarry", "query", "billing?", "--contextual", "-k", "2"]).is_err()
        );
    }

    #[test]
    fn ingest_requires_paths() {
        assert!(Cli::try_parse_from(["quarry", "ingest"]).is_err());
    }

    #[test]
    fn filter_only_when_requested() {
        assert!(build_filter(None, None).is_none());
        let f = build_filter(Some("topic".into()), Some("doc".into())).unwrap();
        assert_eq!(f.must.len(), 2);
    }

    #[test]
    fn supported_extensions() {
        assert!(is_supported(Path::new("a/b.MD")));
        assert!(is_supported(Path::new("t.json")));
        assert!(!is_supported(Path::new("x.pdf")));
        assert!(!is_supported(Path::new("noext")));
    }

    #[test]
    fn config_loading_from_default_toml() {
        let config = Config::load(Path::new("config/default.toml")).unwrap();
        assert_eq!(config.llm.provider, ProviderKind::Ollama);
    }

    #[test]
    fn create_provider_ollama() {
        let config = Config::default();
        let provider = create_provider(&config).unwrap();
        assert!(matches!(provider, AnyProvider::Ollama(_)));
    }

    #[test]
    fn create_provider_openai_requires_key() {
        let mut config = Config::default();
        config.llm.provider = ProviderKind::OpenAi;
        let err = create_provider(&config).unwrap_err();
        assert!(err.to_string().contains("QUARRY_OPENAI_API_KEY"));
    }

    #[tokio::test]
    async fn directory_walk_finds_supported_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        std::fs::write(dir.path().join("nested").join("b.md"), "beta").unwrap();
        std::fs::write(dir.path().join("c.pdf"), "gamma").unwrap();

        let (docs, failures) = load_documents(&[dir.path().to_path_buf()]).await.unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(failures, 0);
    }
}
