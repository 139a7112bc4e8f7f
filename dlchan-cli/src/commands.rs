//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use crate::QueueAction;
use crate::TableAction;
use dlchan_core::config::workspace_config_path;
use dlchan_core::gateway::{self, GatewayState};
use dlchan_core::{DlchanConfig, HistoryRecord, ProgressChannel, QueueEntry, ScoreEntry, Stores};
use dlchan_ml::{Evaluator, ModelSelector, submit_artifact};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    config: DlchanConfig,
) -> anyhow::Result<()> {
    match command {
        Commands::Serve { port, keep_queue } => {
            handle_serve(config, workspace, port, keep_queue).await
        }
        Commands::Submit { file } => handle_submit(&config, workspace, &file),
        Commands::Queue { action } => handle_queue(action, &open_stores(&config, workspace)),
        Commands::Table { action } => handle_table(action, &open_stores(&config, workspace)),
        Commands::History { limit } => handle_history(&open_stores(&config, workspace), limit),
        Commands::Inspect { model } => handle_inspect(&model),
        Commands::Config { action } => handle_config(action, workspace, None),
    }
}

fn open_stores(config: &DlchanConfig, workspace: &Path) -> Stores {
    Stores::open(&config.paths(workspace))
}

async fn handle_serve(
    mut config: DlchanConfig,
    workspace: &Path,
    port: Option<u16>,
    keep_queue: bool,
) -> anyhow::Result<()> {
    if let Some(port) = port {
        config.gateway.port = port;
    }
    let paths = config.paths(workspace);
    let stores = Stores::open(&paths);

    if config.evaluation.clear_queue_on_start && !keep_queue {
        stores.queue.clear()?;
        tracing::info!("Run queue cleared");
    }

    let progress = Arc::new(ProgressChannel::new());
    let evaluator = Arc::new(
        Evaluator::from_config(
            &config,
            &paths,
            ModelSelector::default(),
            stores.clone(),
            Arc::clone(&progress),
        )
        .map_err(|e| anyhow::anyhow!("Cannot start the evaluator: {}", e))?,
    );
    tracing::info!(evaluator = ?evaluator, "Evaluator ready");

    let shutdown = CancellationToken::new();
    let evaluator_task = tokio::spawn(Arc::clone(&evaluator).run(shutdown.clone()));

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
        }
        signal.cancel();
    });

    let state = Arc::new(GatewayState::new(
        stores,
        progress,
        config,
        paths.train_dataset.clone(),
    ));
    let served = gateway::run(state, shutdown.clone().cancelled_owned()).await;

    // Stop the evaluator too if the gateway ended on its own.
    shutdown.cancel();
    evaluator_task.await?;
    served?;
    Ok(())
}

fn handle_submit(config: &DlchanConfig, workspace: &Path, file: &Path) -> anyhow::Result<()> {
    let bytes = std::fs::read(file)
        .map_err(|e| anyhow::anyhow!("Cannot read {}: {}", file.display(), e))?;
    let file_name = file
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow::anyhow!("{} has no usable file name", file.display()))?;

    let paths = config.paths(workspace);
    let stores = Stores::open(&paths);
    let receipt = submit_artifact(
        file_name,
        &bytes,
        &paths.upload_dir,
        &ModelSelector::default(),
        &stores.queue,
        &config.challenge,
        chrono::Local::now().naive_local(),
    )?;
    println!(
        "Queued {} ({} model), {} waiting",
        receipt.reference, receipt.backend, receipt.waiting
    );
    Ok(())
}

fn handle_queue(action: QueueAction, stores: &Stores) -> anyhow::Result<()> {
    match action {
        QueueAction::List => {
            let entries = stores.queue.waiting_entries()?;
            if entries.is_empty() {
                println!("No submissions waiting.");
            } else {
                print!("{}", format_queue(&entries));
            }
            Ok(())
        }
        QueueAction::Clear => {
            let dropped = stores.queue.waiting()?.len();
            stores.queue.clear()?;
            println!("Dropped {} waiting submission(s).", dropped);
            Ok(())
        }
    }
}

fn handle_table(action: TableAction, stores: &Stores) -> anyhow::Result<()> {
    match action {
        TableAction::Show => {
            let entries = stores.table.get()?;
            if entries.is_empty() {
                println!("No model was evaluated yet.");
            } else {
                print!("{}", format_ranking(&entries));
            }
            Ok(())
        }
        TableAction::Top => {
            let top = stores.table.top_summary()?;
            println!("{}", serde_json::to_string_pretty(&top)?);
            Ok(())
        }
        TableAction::Prune { keep } => {
            let removed = stores.table.retain_top(keep)?;
            println!("Removed {} entr{}.", removed, if removed == 1 { "y" } else { "ies" });
            Ok(())
        }
    }
}

fn handle_history(stores: &Stores, limit: Option<usize>) -> anyhow::Result<()> {
    let records = stores.history.records()?;
    if records.is_empty() {
        println!("No model was evaluated yet.");
        return Ok(());
    }
    let skip = limit.map_or(0, |n| records.len().saturating_sub(n));
    print!("{}", format_history(&records[skip..]));
    Ok(())
}

fn handle_inspect(model: &Path) -> anyhow::Result<()> {
    let selector = ModelSelector::default();
    let Some(loaded) = selector.from_file(model) else {
        anyhow::bail!("{}", selector.invalid_message());
    };
    println!("Backend:        {}", loaded.backend());
    println!("Model:          {}", loaded.describe());
    println!("Input geometry: {:?}", loaded.input_geometry());
    println!("Input kind:     {}-D", loaded.dimensionality());
    match loaded.param_count() {
        Some(params) => println!("Parameters:     {}", params),
        None => println!("Parameters:     unknown"),
    }
    Ok(())
}

pub(crate) fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = workspace_config_path(workspace);
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }
            if let Some(dir) = config_path.parent() {
                std::fs::create_dir_all(dir)?;
            }

            let toml_str = toml::to_string_pretty(&DlchanConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = dlchan_core::load_config(Some(workspace), config_file)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

fn format_params(params: Option<u64>) -> String {
    params.map_or_else(|| "unknown".to_string(), |p| p.to_string())
}

/// One line per entry: rank, tag, accuracy, loss and parameter count.
fn format_ranking(entries: &[ScoreEntry]) -> String {
    let width = entries.iter().map(|e| e.tag.len()).max().unwrap_or(0);
    let mut out = String::new();
    for (i, entry) in entries.iter().enumerate() {
        let _ = writeln!(
            out,
            "{:>3}. {:<width$}  {:>9.5}%  loss {:>8.4}  params {}",
            i + 1,
            entry.tag,
            entry.accuracy,
            entry.loss,
            format_params(entry.param_count),
        );
    }
    out
}

fn format_queue(entries: &[QueueEntry]) -> String {
    let mut out = String::new();
    for (i, entry) in entries.iter().enumerate() {
        let _ = writeln!(
            out,
            "{:>3}. {}  (submitted {})",
            i + 1,
            entry.reference,
            entry.submitted_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    out
}

fn format_history(records: &[HistoryRecord]) -> String {
    let mut out = String::new();
    for record in records {
        let _ = writeln!(
            out,
            "{}  {}  {:<8}  {:.5}%  params {}",
            record.recorded_at.format("%Y-%m-%d %H:%M:%S"),
            if record.promoted { "promoted " } else { "discarded" },
            record.tag,
            record.accuracy,
            format_params(record.param_count),
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn entry(tag: &str, accuracy: f64, params: Option<u64>) -> ScoreEntry {
        ScoreEntry {
            tag: tag.into(),
            accuracy,
            loss: 0.25,
            param_count: params,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_format_ranking() {
        let text = format_ranking(&[entry("cnn", 91.5, Some(1200)), entry("tree", 80.0, None)]);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "  1. cnn    91.50000%  loss   0.2500  params 1200");
        assert_eq!(lines[1], "  2. tree   80.00000%  loss   0.2500  params unknown");
    }

    #[test]
    fn test_format_history_marks_outcome() {
        let records = vec![
            HistoryRecord::new(true, "a", 50.0, 0.5, Some(3)),
            HistoryRecord::new(false, "a", 40.0, 0.6, Some(3)),
        ];
        let text = format_history(&records);
        assert!(text.lines().next().unwrap().contains("promoted"));
        assert!(text.lines().nth(1).unwrap().contains("discarded"));
    }

    #[test]
    fn test_config_init_writes_loadable_defaults() {
        let dir = tempfile::tempdir().unwrap();
        handle_config(ConfigAction::Init, dir.path(), None).unwrap();

        let path = workspace_config_path(dir.path());
        assert!(path.exists());
        let written: DlchanConfig = toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written, DlchanConfig::default());

        // A second init leaves the existing file alone.
        std::fs::write(&path, "[gateway]\nport = 6000\n").unwrap();
        handle_config(ConfigAction::Init, dir.path(), None).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "[gateway]\nport = 6000\n"
        );
    }

    #[test]
    fn test_queue_clear_and_table_prune() {
        let dir = tempfile::tempdir().unwrap();
        let stores = open_stores(&DlchanConfig::default(), dir.path());
        stores.queue.enqueue("a.nn").unwrap();
        stores.queue.enqueue("b.nn").unwrap();
        for (tag, acc) in [("x", 90.0), ("y", 80.0), ("z", 70.0)] {
            stores.table.update(tag, acc, 0.1, Some(5), &[acc]).unwrap();
        }

        handle_queue(QueueAction::Clear, &stores).unwrap();
        assert!(stores.queue.waiting().unwrap().is_empty());

        handle_table(TableAction::Prune { keep: 1 }, &stores).unwrap();
        let tags: Vec<_> = stores.table.get().unwrap().into_iter().map(|e| e.tag).collect();
        assert_eq!(tags, vec!["x".to_string()]);
    }

    #[test]
    fn test_submit_queues_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("linear.clf");
        std::fs::write(
            &source,
            r#"{"format": "classical", "n_features_in": 2,
                "estimator": {"kind": "linear", "coef": [[1.0, -1.0]], "intercept": [0.0]}}"#,
        )
        .unwrap();
        let config = DlchanConfig::default();

        handle_submit(&config, dir.path(), &source).unwrap();
        let stores = open_stores(&config, dir.path());
        assert_eq!(stores.queue.waiting().unwrap(), vec!["linear.clf".to_string()]);
        assert!(config.paths(dir.path()).upload_dir.join("linear.clf").exists());
    }

    #[test]
    fn test_inspect_rejects_unknown_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("readme.md");
        std::fs::write(&path, "# hi").unwrap();
        let err = handle_inspect(&path).unwrap_err();
        assert!(err.to_string().ends_with('!'));
    }
}
