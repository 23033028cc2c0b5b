use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "mailarc", version, about = "Mail archive sync and search")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output structured JSON
    #[arg(long, global = true)]
    json: bool,

    /// User whose accounts and archive are used
    #[arg(long, global = true, env = "MAILARC_USER", default_value = "default")]
    user: String,

    /// Archive root holding one directory per user
    #[arg(long, global = true, env = "MAILARC_ROOT")]
    root: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download new mail for one or all enabled accounts
    Sync(SyncArgs),
    /// Show per-account sync state
    Status,
    /// Import a PST/OST archive as a new account
    Import(ImportArgs),
    /// Search the archive
    Search(SearchArgs),
    /// Rebuild one account's search index from its archive
    Reindex(AccountArg),
    /// Show one account's index stats
    Stats(AccountArg),
    /// Mark syncs left unfinished by a crashed process as failed
    Recover,
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[arg(long)]
    account: Option<String>,
}

#[derive(Debug, Args)]
struct ImportArgs {
    file: PathBuf,
}

#[derive(Debug, Args)]
struct SearchArgs {
    query: String,
    #[arg(long)]
    account: Option<String>,
    #[arg(long, default_value_t = 0)]
    offset: usize,
    /// 0 returns every match
    #[arg(long, default_value_t = 25)]
    limit: usize,
}

#[derive(Debug, Args)]
struct AccountArg {
    #[arg(long)]
    account: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::dispatch(cli).await
}

mod commands {
    use std::path::Path;

    use anyhow::{anyhow, Context, Result};
    use tracing::warn;

    use mailarc::config;
    use mailarc::output::{self, OutputFormat};
    use mailarc::sync::{SyncHandle, SyncService};

    use super::{AccountArg, Cli, Commands, ImportArgs, SearchArgs, SyncArgs};

    pub async fn dispatch(cli: Cli) -> Result<()> {
        let root = match cli.root {
            Some(root) => root,
            None => config::default_root().context("resolve default archive root")?,
        };
        let service = SyncService::open(root);
        let format = OutputFormat::from_json_flag(cli.json);
        let user = cli.user.as_str();

        match cli.command {
            Commands::Sync(args) => handle_sync(&service, user, args, format).await,
            Commands::Status => handle_status(&service, user, format),
            Commands::Import(args) => handle_import(&service, user, args, format).await,
            Commands::Search(args) => handle_search(&service, user, args, format).await,
            Commands::Reindex(args) => handle_reindex(&service, user, args, format).await,
            Commands::Stats(args) => handle_stats(&service, user, args, format).await,
            Commands::Recover => handle_recover(&service, user),
        }
    }

    async fn handle_sync(
        service: &SyncService,
        user: &str,
        args: SyncArgs,
        format: OutputFormat,
    ) -> Result<()> {
        let handles: Vec<SyncHandle> = match &args.account {
            Some(account) => vec![service
                .sync_account(user, account)
                .with_context(|| format!("start sync for account {account}"))?],
            None => service.sync_all(user).context("start syncs")?,
        };

        let waiting = async {
            let mut outcomes = Vec::with_capacity(handles.len());
            for handle in handles {
                outcomes.push(handle.wait().await?);
            }
            Ok::<_, anyhow::Error>(outcomes)
        };
        tokio::pin!(waiting);

        let outcomes = tokio::select! {
            outcomes = &mut waiting => outcomes?,
            _ = tokio::signal::ctrl_c() => {
                let running = service.running().snapshot();
                eprintln!("Stopping {} sync(s)...", running.len());
                for sync in &running {
                    if let Err(err) = service.stop_sync(&sync.account_id) {
                        warn!(account = %sync.account_id, error = %err, "stop request not delivered");
                    }
                }
                waiting.await?
            }
        };

        println!("{}", output::format_sync_outcomes(format, &outcomes)?);
        Ok(())
    }

    fn handle_status(service: &SyncService, user: &str, format: OutputFormat) -> Result<()> {
        let statuses = service.status_all(user).context("load account status")?;
        println!("{}", output::format_status(format, &statuses)?);
        Ok(())
    }

    async fn handle_import(
        service: &SyncService,
        user: &str,
        args: ImportArgs,
        format: OutputFormat,
    ) -> Result<()> {
        let file = tokio::fs::File::open(&args.file)
            .await
            .with_context(|| format!("open archive {}", args.file.display()))?;
        let size = file
            .metadata()
            .await
            .with_context(|| format!("stat archive {}", args.file.display()))?
            .len();
        let filename = file_name(&args.file);

        let handle = service
            .import_pst(user, file, size, &filename)
            .await
            .with_context(|| format!("upload archive {}", args.file.display()))?;
        let job_id = handle.job_id.clone();
        handle.wait().await.context("import task")?;

        let job = service
            .import_status(user, &job_id)
            .ok_or_else(|| anyhow!("import job {job_id} disappeared"))?;
        println!("{}", output::format_import(format, &job)?);
        match job.error {
            Some(error) => Err(anyhow!("import failed: {error}")),
            None => Ok(()),
        }
    }

    async fn handle_search(
        service: &SyncService,
        user: &str,
        args: SearchArgs,
        format: OutputFormat,
    ) -> Result<()> {
        let results = service
            .search(user, args.account.as_deref(), &args.query, args.offset, args.limit)
            .await
            .context("search archive")?;
        println!("{}", output::format_search_results(format, &results)?);
        Ok(())
    }

    async fn handle_reindex(
        service: &SyncService,
        user: &str,
        args: AccountArg,
        format: OutputFormat,
    ) -> Result<()> {
        let report = service
            .reindex(user, &args.account)
            .await
            .with_context(|| format!("reindex account {}", args.account))?;
        println!("{}", output::format_build_report(format, &report)?);
        Ok(())
    }

    async fn handle_stats(
        service: &SyncService,
        user: &str,
        args: AccountArg,
        format: OutputFormat,
    ) -> Result<()> {
        let stats = service
            .stats(user, &args.account)
            .await
            .with_context(|| format!("load index stats for {}", args.account))?;
        println!("{}", output::format_stats(format, &stats)?);
        Ok(())
    }

    fn handle_recover(service: &SyncService, user: &str) -> Result<()> {
        let recovered = service
            .recover_interrupted(user)
            .context("recover interrupted jobs")?;
        println!("Marked {recovered} interrupted job(s) as failed.");
        Ok(())
    }

    fn file_name(path: &Path) -> String {
        path.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}
