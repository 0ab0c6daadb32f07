//! `svn2git`: converts an SVN dump stream into a Git object graph in a
//! target repository, applying path/branch mapping and merge reconstruction
//! from an XML rule file.
//!
//! One conversion run per invocation: decode every revision, hand each to
//! the history builder, execute the resulting commit plans against the
//! object pipeline, and finally write every branch-termination ref.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use svn2git_core::authors::AuthorsMap;
use svn2git_core::config::ConvertConfig;
use svn2git_core::dump::DumpDecoder;
use svn2git_core::history::HistoryBuilder;
use svn2git_core::pipeline::git_sink::Git2Sink;
use svn2git_core::pipeline::{ObjectPipeline, DEFAULT_BLOB_WORKERS};
use svn2git_core::sha1cache::Sha1Cache;
use svn2git_core::transform::{ContentTransformer, Passthrough};

/// Which tagline a synthesized commit message is decorated with.
#[derive(Clone, Copy, Debug, clap::ValueEnum, PartialEq, Eq)]
enum DecorateMode {
    RevisionId,
    ChangeId,
}

#[derive(Parser, Debug)]
#[command(name = "svn2git", version, about = "Convert an SVN dump stream into Git history")]
struct Cli {
    /// SVN dump file(s) to convert, concatenated logically in the given
    /// order. Reads stdin if omitted.
    #[arg(long = "dump-file")]
    dump_files: Vec<PathBuf>,

    /// Path to the XML rule file (`<Config>` document).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Target Git repository. Created as a fresh bare repository if it
    /// does not already exist.
    #[arg(long)]
    target_repository: PathBuf,

    /// Active `<Project>` name(s); repeatable.
    #[arg(long = "project")]
    projects: Vec<String>,

    /// Stop after this SVN revision, inclusive.
    #[arg(long)]
    end_revision: Option<u64>,

    /// JSON authors map (`{username: {Name, Email}}`).
    #[arg(long)]
    authors_map: Option<PathBuf>,

    /// Line-oriented persistent blob SHA1 cache file.
    #[arg(long)]
    sha1_map: Option<PathBuf>,

    /// Verify Text-content-md5/sha1 headers against decoded content.
    #[arg(long)]
    verify_data_hash: bool,

    /// Also write `refs/revisions/<branch>/r<N>` for every emitted commit.
    #[arg(long)]
    create_revision_refs: bool,

    /// Decorate commit messages with a revision-id or Gerrit Change-Id
    /// tagline.
    #[arg(long, value_enum)]
    decorate_commit_message: Option<DecorateMode>,

    /// Link a branch root with no copyfrom parent to an earlier orphan root
    /// when their initial content overlaps by more than half.
    #[arg(long)]
    link_orphan_revs: bool,

    /// Number of concurrent blob-hashing workers.
    #[arg(long, default_value_t = DEFAULT_BLOB_WORKERS)]
    blob_workers: usize,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("svn2git: fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_xml = match &cli.config {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?,
        None => "<Config><Default/></Config>".to_string(),
    };
    let config = ConvertConfig::load(&config_xml, &cli.projects).context("failed to load config")?;
    config.validate().context("config validation failed")?;

    let authors = match &cli.authors_map {
        Some(path) => AuthorsMap::load(path)
            .with_context(|| format!("failed to load authors map {}", path.display()))?,
        None => AuthorsMap::empty(),
    };

    let sha1_cache = match &cli.sha1_map {
        Some(path) => Some(Arc::new(
            Sha1Cache::open(path).with_context(|| format!("failed to open sha1-map {}", path.display()))?,
        )),
        None => None,
    };

    let readers = open_dump_readers(&cli.dump_files)?;
    let mut decoder = DumpDecoder::new(readers, cli.verify_data_hash).context("failed to open dump stream")?;

    if !cli.target_repository.exists() {
        std::fs::create_dir_all(&cli.target_repository)?;
    }
    let sink = match Git2Sink::open(&cli.target_repository) {
        Ok(s) => s,
        Err(_) => Git2Sink::init_bare(&cli.target_repository).context("failed to initialize target repository")?,
    };

    let transformer: Arc<dyn ContentTransformer> = Arc::new(Passthrough);
    let mut pipeline = ObjectPipeline::with_workers(sink, transformer, cli.blob_workers);
    if let Some(cache) = sha1_cache.clone() {
        pipeline = pipeline.with_sha1_cache(cache);
    }

    let mut builder = HistoryBuilder::new(&config.rules)
        .context("failed to initialize history builder")?
        .with_orphan_linking(cli.link_orphan_revs);

    let compute_change_id = cli.decorate_commit_message == Some(DecorateMode::ChangeId);

    // Per-branch file set currently staged in the sink, so each revision's
    // overlay can be diffed down to additions/removals instead of restaging
    // everything from scratch on every commit.
    let mut staged_paths: BTreeMap<String, HashSet<String>> = BTreeMap::new();
    let mut revisions_converted = 0u64;
    let mut commits_written = 0u64;

    while let Some(revision) = decoder.next_revision().context("failed to decode next revision")? {
        if let Some(end) = cli.end_revision {
            if revision.rev > end {
                break;
            }
        }

        builder.begin_revision(revision.rev);
        for node in &revision.nodes {
            builder
                .apply_node(node)
                .with_context(|| format!("r{}: failed to apply node {:?}", revision.rev, node.path))?;
        }

        let outcome = builder
            .close_revision(&revision, &authors, compute_change_id)
            .with_context(|| format!("failed to close revision {}", revision.rev))?;

        for commit in outcome.commits {
            let previous = staged_paths.entry(commit.refname.clone()).or_default().clone();
            let mut current = HashSet::with_capacity(commit.files.len());

            for file in &commit.files {
                current.insert(file.path.clone());
                pipeline
                    .stage_blob(
                        &commit.refname,
                        &file.path,
                        &BTreeMap::new(),
                        &file.content,
                        file.mode,
                        "default",
                    )
                    .await
                    .with_context(|| format!("failed to stage {}", file.path))?;
            }
            for removed in previous.difference(&current) {
                pipeline.remove_path(&commit.refname, removed).await?;
            }
            staged_paths.insert(commit.refname.clone(), current);

            if commit.is_fast_forward {
                let ff_target = commit.parents.last().cloned().unwrap_or_default();
                pipeline.update_ref(&commit.refname, &ff_target, None).await?;
                builder.record_commit(&commit.refname, commit.svn_rev, ff_target, commit.parents);
                continue;
            }

            let tree = pipeline.write_tree(&commit.refname).await?;
            let mut message = commit.message.clone();
            if let Some(DecorateMode::RevisionId) = cli.decorate_commit_message {
                message.push_str(&format!("\n\nsvn-revision: {}", commit.svn_rev));
            }
            if let Some(change_id) = &commit.change_id {
                message.push_str(&format!("\n\nChange-Id: {change_id}"));
            }
            for (source, rev) in &commit.cherry_picked_from {
                message.push_str(&format!("\n\nCherry-picked-from: {source}@{rev}"));
            }

            let sha = pipeline
                .commit(
                    &commit.refname,
                    &tree,
                    &commit.parents,
                    &commit.author,
                    &commit.committer,
                    commit.timestamp,
                    &message,
                )
                .await
                .context("failed to write commit object")?;

            pipeline.update_ref(&commit.refname, &sha, None).await?;
            if cli.create_revision_refs {
                let branch_label = commit
                    .refname
                    .trim_start_matches("refs/heads/")
                    .trim_start_matches("refs/tags/");
                let rev_ref = format!("refs/revisions/{branch_label}/r{}", commit.svn_rev);
                pipeline.update_ref(&rev_ref, &sha, None).await?;
            }

            builder.record_commit(&commit.refname, commit.svn_rev, sha, commit.parents);
            commits_written += 1;
        }

        revisions_converted += 1;
    }

    for (deleted_ref, tip) in builder.finalize_deleted_refs() {
        pipeline
            .update_ref(&deleted_ref, &tip, None)
            .await
            .with_context(|| format!("failed to write deleted-branch ref {deleted_ref}"))?;
    }

    if let Some(cache) = &sha1_cache {
        cache.flush().context("failed to flush sha1-map")?;
    }

    info!(
        revisions = revisions_converted,
        commits = commits_written,
        blobs_memoized = pipeline.blob_memo_len(),
        "conversion complete"
    );

    Ok(())
}

/// Opens every dump file in order, or stdin when none were given.
fn open_dump_readers(paths: &[PathBuf]) -> Result<Vec<Box<dyn std::io::Read>>> {
    if paths.is_empty() {
        warn!("no --dump-file given, reading from stdin");
        return Ok(vec![Box::new(std::io::stdin())]);
    }
    let mut readers: Vec<Box<dyn std::io::Read>> = Vec::with_capacity(paths.len());
    for path in paths {
        let file = File::open(path).with_context(|| format!("failed to open dump file {}", path.display()))?;
        readers.push(Box::new(file));
    }
    Ok(readers)
}
