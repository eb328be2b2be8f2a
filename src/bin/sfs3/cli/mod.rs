use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use sfs3::Config;
use sfs3::config::args::Command;
use sfs3::crypto::agent_proxy::AgentProxy;
use sfs3::pipeline::downloader::{DownloadSink, ObjectDownloader};
use sfs3::pipeline::filter::PathFilter;
use sfs3::pipeline::uploader::ObjectUploader;
use sfs3::pipeline::{BulkOrchestrator, BulkSummary};
use sfs3::storage::client_builder::create_client;
use sfs3::storage::layout::{KeyLayout, normalize_path};
use sfs3::storage::meta::MetaLayer;
use sfs3::storage::ObjectStore;
use sfs3::types::error::is_not_found_error;
use sfs3::types::token::{TransferCancellationToken, create_transfer_cancellation_token};
use tracing::trace;

mod ctrl_c_handler;
mod indicator;

pub const EXIT_CODE_SUCCESS: i32 = 0;
pub const EXIT_CODE_ERROR: i32 = 1;

const GPG_PASSPHRASE_ENV: &str = "SFS3_GPG_PASSPHRASE";

pub async fn run(config: Config, command: Command) -> i32 {
    match execute(config, command).await {
        Ok(exit_code) => exit_code,
        Err(e) => {
            eprintln!("sfs3: {e:#}");
            EXIT_CODE_ERROR
        }
    }
}

async fn execute(config: Config, command: Command) -> Result<i32> {
    let client = Arc::new(create_client(&config).await);
    let store = ObjectStore::new(client, &config.bucket);
    let layout = KeyLayout::new(&config.prefix);
    let cancellation_token = create_transfer_cancellation_token();
    ctrl_c_handler::spawn_ctrl_c_handler(cancellation_token.clone());

    // gpg passphrase prompts are proxied over a transient socket when a
    // passphrase is provided; the socket disappears when the proxy drops.
    let agent_proxy = match std::env::var(GPG_PASSPHRASE_ENV) {
        Ok(passphrase) => Some(AgentProxy::spawn(passphrase)?),
        Err(_) => None,
    };
    let agent_info = agent_proxy.as_ref().map(|proxy| proxy.agent_info());

    match command {
        Command::Version => {
            println!("sfs3 {}", env!("CARGO_PKG_VERSION"));
            Ok(EXIT_CODE_SUCCESS)
        }
        Command::Ls {
            long_format,
            recursive,
            path,
        } => ls(&store, &layout, long_format, recursive, path.as_deref().unwrap_or("")).await,
        Command::Get {
            force,
            s3_path,
            local_path,
        } => {
            get(
                &config,
                &store,
                &layout,
                cancellation_token,
                agent_info,
                force,
                &s3_path,
                local_path.as_deref(),
            )
            .await
        }
        Command::Put {
            force,
            concurrency: _,
            local_path,
            s3_path,
        } => {
            put(
                &config,
                &store,
                &layout,
                cancellation_token,
                force,
                &local_path,
                s3_path.as_deref(),
            )
            .await
        }
        Command::Rm { recursive, pattern } => {
            rm(&store, &layout, recursive, &pattern).await
        }
        Command::Push {
            local_root,
            s3_root,
            ..
        } => {
            let (orchestrator, stats_receiver) =
                make_orchestrator(&config, &store, cancellation_token, agent_info);
            let indicator =
                indicator::show_indicator(stats_receiver, config.show_progress, config.quiet);

            let result = orchestrator.push(Path::new(&local_root), &s3_root).await;
            drop(orchestrator);
            indicator.await.context("indicator task panicked.")?;

            let summary = result?;
            print_bulk_summary(&config, &summary);
            Ok(if summary.is_success() {
                EXIT_CODE_SUCCESS
            } else {
                EXIT_CODE_ERROR
            })
        }
        Command::Pull {
            s3_root,
            local_root,
            ..
        } => {
            let (orchestrator, stats_receiver) =
                make_orchestrator(&config, &store, cancellation_token, agent_info);
            let indicator =
                indicator::show_indicator(stats_receiver, config.show_progress, config.quiet);

            let result = orchestrator.pull(&s3_root, Path::new(&local_root)).await;
            drop(orchestrator);
            indicator.await.context("indicator task panicked.")?;

            let summary = result?;
            print_bulk_summary(&config, &summary);
            Ok(if summary.is_success() {
                EXIT_CODE_SUCCESS
            } else {
                EXIT_CODE_ERROR
            })
        }
        Command::Cmp {
            s3_root,
            local_root,
            ..
        } => {
            let (orchestrator, _stats_receiver) =
                make_orchestrator(&config, &store, cancellation_token, agent_info);
            let summary = orchestrator
                .compare(&s3_root, Path::new(&local_root))
                .await?;

            for path in &summary.local_only {
                println!("only local: {path}");
            }
            for path in &summary.remote_only {
                println!("only remote: {path}");
            }
            for (path, kind) in &summary.differing {
                println!("differs ({kind:?}): {path}");
            }

            Ok(summary.exit_code())
        }
        Command::Md5check { s3_root, .. } => {
            let (orchestrator, _stats_receiver) =
                make_orchestrator(&config, &store, cancellation_token, agent_info);
            let summary = orchestrator.md5check(&s3_root).await?;

            for path in &summary.failed {
                eprintln!("ABORT {path}");
            }
            if !config.quiet {
                eprintln!(
                    "{} verified, {} failed",
                    summary.verified_files,
                    summary.failed.len()
                );
            }

            Ok(summary.exit_code())
        }
    }
}

fn make_orchestrator(
    config: &Config,
    store: &ObjectStore,
    cancellation_token: TransferCancellationToken,
    agent_info: Option<String>,
) -> (BulkOrchestrator, async_channel::Receiver<sfs3::types::TransferStatistics>) {
    let (stats_sender, stats_receiver) = async_channel::unbounded();
    let orchestrator = BulkOrchestrator::new(
        config.clone(),
        store.clone(),
        cancellation_token,
        stats_sender,
    )
    .with_agent_info(agent_info);

    (orchestrator, stats_receiver)
}

async fn ls(
    store: &ObjectStore,
    layout: &KeyLayout,
    long_format: bool,
    recursive: bool,
    path: &str,
) -> Result<i32> {
    let root = normalize_path(path);

    // An exact file match lists as itself.
    if !root.is_empty() {
        match store.head(&layout.data_key(&root)).await {
            Ok(stat) => {
                if long_format {
                    println!("{:>12} {}", stat.content_length, root);
                } else {
                    println!("{root}");
                }
                return Ok(EXIT_CODE_SUCCESS);
            }
            Err(e) if is_not_found_error(&e) => {}
            Err(e) => return Err(e),
        }
    }

    let prefix = layout.data_prefix(&root);
    let delimiter = if recursive { None } else { Some("/") };
    let listing = store.list(&prefix, delimiter).await?;

    for common_prefix in &listing.common_prefixes {
        let name = common_prefix
            .strip_prefix(&prefix)
            .unwrap_or(common_prefix)
            .trim_end_matches('/');
        if long_format {
            println!("{:>12} {name}/", "-");
        } else {
            println!("{name}/");
        }
    }

    for object in &listing.objects {
        let Some(logical_path) = layout.logical_path_from_data_key(&object.key) else {
            continue;
        };
        let name = if root.is_empty() {
            logical_path.as_str()
        } else {
            logical_path
                .strip_prefix(&format!("{root}/"))
                .unwrap_or(&logical_path)
        };

        if long_format {
            let date = object
                .last_modified
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());
            println!("{:>12} {date} {name}", object.size);
        } else {
            println!("{name}");
        }
    }

    Ok(EXIT_CODE_SUCCESS)
}

#[allow(clippy::too_many_arguments)]
async fn get(
    config: &Config,
    store: &ObjectStore,
    layout: &KeyLayout,
    cancellation_token: TransferCancellationToken,
    agent_info: Option<String>,
    force: bool,
    s3_path: &str,
    local_path: Option<&str>,
) -> Result<i32> {
    let logical_path = normalize_path(s3_path);
    if logical_path.is_empty() {
        bail!("empty remote path");
    }

    let local = local_path.map(str::to_string).unwrap_or_else(|| {
        logical_path
            .rsplit('/')
            .next()
            .unwrap_or(&logical_path)
            .to_string()
    });

    let sink = if local == "-" {
        DownloadSink::Stdout
    } else {
        let local = PathBuf::from(local);
        if local.exists() && !force {
            bail!("{} exists. use --force to overwrite.", local.display());
        }
        DownloadSink::File(local)
    };

    let downloader = ObjectDownloader::new(
        store.clone(),
        layout.clone(),
        config.clone(),
        cancellation_token,
    )
    .with_agent_info(agent_info);

    let outcome = downloader.download(&logical_path, &sink, None).await?;
    trace!(path = logical_path, bytes = outcome.bytes, "get completed.");
    if !config.quiet {
        eprintln!("DONE {logical_path}");
    }

    Ok(EXIT_CODE_SUCCESS)
}

async fn put(
    config: &Config,
    store: &ObjectStore,
    layout: &KeyLayout,
    cancellation_token: TransferCancellationToken,
    force: bool,
    local_path: &str,
    s3_path: Option<&str>,
) -> Result<i32> {
    let logical_path = match s3_path {
        Some(s3_path) => normalize_path(s3_path),
        None => {
            if local_path == "-" {
                bail!("a remote path is required when reading from stdin");
            }
            Path::new(local_path)
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default()
        }
    };
    if logical_path.is_empty() {
        bail!("empty remote path");
    }

    if !force {
        match store.head(&layout.data_key(&logical_path)).await {
            Ok(_) => bail!("{logical_path} exists. use --force to overwrite."),
            Err(e) if is_not_found_error(&e) => {}
            Err(e) => return Err(e),
        }
    }

    let uploader = ObjectUploader::new(
        store.clone(),
        layout.clone(),
        config.clone(),
        cancellation_token,
    );

    let outcome = if local_path == "-" {
        uploader
            .upload_reader(tokio::io::stdin(), &logical_path, None, None)
            .await?
    } else {
        uploader
            .upload_file(Path::new(local_path), &logical_path, None)
            .await?
    };

    trace!(
        path = logical_path,
        md5 = outcome.md5_hex,
        bytes = outcome.bytes,
        "put completed."
    );
    if !config.quiet {
        eprintln!("DONE {logical_path}");
    }

    Ok(EXIT_CODE_SUCCESS)
}

async fn rm(
    store: &ObjectStore,
    layout: &KeyLayout,
    recursive: bool,
    pattern: &str,
) -> Result<i32> {
    let meta = MetaLayer::new(store.clone(), layout.clone());

    let listing = store.list(&layout.data_prefix(""), None).await?;
    let all_paths: Vec<String> = listing
        .objects
        .iter()
        .filter_map(|object| layout.logical_path_from_data_key(&object.key))
        .collect();

    let normalized = normalize_path(pattern);
    let selected: Vec<String> = if recursive {
        let tree_prefix = format!("{normalized}/");
        all_paths
            .into_iter()
            .filter(|path| *path == normalized || path.starts_with(&tree_prefix))
            .collect()
    } else {
        let filter = PathFilter::new(&[pattern.to_string()], &[])?;
        all_paths
            .into_iter()
            .filter(|path| filter.matches(path))
            .collect()
    };

    if selected.is_empty() {
        bail!("no remote files match {pattern}");
    }

    // Content first, then every sidecar; no orphans either way.
    for logical_path in &selected {
        store.delete(&layout.data_key(logical_path)).await?;
        meta.delete_all_meta(logical_path).await?;
        trace!(path = logical_path, "removed.");
    }

    Ok(EXIT_CODE_SUCCESS)
}

fn print_bulk_summary(config: &Config, summary: &BulkSummary) {
    if config.quiet {
        return;
    }

    eprintln!(
        "{} files completed ({} bytes), {} skipped ({} bytes), {} aborted ({} bytes)",
        summary.completed_files,
        summary.completed_bytes,
        summary.skipped_files,
        summary.skipped_bytes,
        summary.aborted_files,
        summary.aborted_bytes,
    );
}
