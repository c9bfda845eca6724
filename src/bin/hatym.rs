//! hatym CLI: kiosk, participant, and operator interface.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use hatym_rs::asset::PageAsset;
use hatym_rs::config::{Config, ProtocolSettings};
use hatym_rs::coordinator::{Assignment, ClaimMode, Coordinator, DeviceStore, claim_path};
use hatym_rs::dashboard::{Dashboard, Projection, Snapshot};
use hatym_rs::db::PgStore;
use hatym_rs::model::{PageNumber, PageStatus, SessionId, TOTAL_PAGES};
use hatym_rs::store::{AssignmentStore, MemoryStore};
use hatym_rs::sweeper::{SweepTarget, Sweeper};
use hatym_rs::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use secrecy::ExposeSecret;

#[derive(Parser)]
#[command(name = "hatym", about = "Shared hatym page distribution")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply database migrations
    Migrate,
    /// Session operations
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Claim (or resume) pages as this device's participant
    Claim {
        /// Session ID (defaults to the active session)
        #[arg(long)]
        session: Option<String>,
        /// Claim up to the per-participant cap instead of one page
        #[arg(long)]
        multi: bool,
    },
    /// Mark a claimed page as completed
    Complete {
        /// Page number
        page: String,
        /// Session ID (defaults to the active session)
        #[arg(long)]
        session: Option<String>,
    },
    /// Release expired leases once
    Sweep {
        /// Session ID (defaults to the active session)
        #[arg(long)]
        session: Option<String>,
    },
    /// Show session progress
    Dashboard {
        /// Session ID (defaults to the active session)
        #[arg(long)]
        session: Option<String>,
        /// Keep running and print every change
        #[arg(long)]
        follow: bool,
    },
    /// Run the background expiry sweeper
    Serve,
    /// Page content catalog
    Catalog {
        #[command(subcommand)]
        action: CatalogAction,
    },
    /// Run many participants against an in-memory store
    Simulate {
        /// Number of concurrent participants
        #[arg(long, default_value_t = 250)]
        participants: usize,
        /// Per-participant page cap
        #[arg(long, default_value_t = 3)]
        max_per_user: u32,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Start a new session (the current one is kept as history)
    New,
    /// Show a session
    Show {
        /// Session ID
        id: String,
    },
    /// Show the active session
    Latest,
}

#[derive(Subcommand)]
enum CatalogAction {
    /// Set where a page's content lives
    Set {
        /// Page number
        page: String,
        /// Content URL; `{page}` is replaced by the page number
        url: String,
        /// Render type
        #[arg(long, default_value = "json")]
        render_type: String,
    },
    /// Show a page's catalog entry
    Show {
        /// Page number
        page: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Migrate => {
            connect().await?;
            println!("Migrations applied.");
            Ok(())
        }
        Command::Session { action } => {
            let (_, store) = connect().await?;
            cmd_session(&*store, action).await
        }
        Command::Claim { session, multi } => {
            let (config, store) = connect().await?;
            let session_id = resolve_session(&*store, session).await?;
            let mode = if multi {
                ClaimMode::Multi
            } else {
                ClaimMode::Single
            };
            cmd_claim(store, &config, session_id, mode).await
        }
        Command::Complete { page, session } => {
            let (config, store) = connect().await?;
            let session_id = resolve_session(&*store, session).await?;
            cmd_complete(store, &config, session_id, page.parse()?).await
        }
        Command::Sweep { session } => {
            let (config, store) = connect().await?;
            let session_id = resolve_session(&*store, session).await?;
            let sweeper = Sweeper::new(store, &config.protocol);
            let released = sweeper.sweep_once(session_id).await?;
            println!("Released {released} expired lease(s).");
            Ok(())
        }
        Command::Dashboard { session, follow } => {
            let (config, store) = connect().await?;
            let session_id = resolve_session(&*store, session).await?;
            cmd_dashboard(store, &config, session_id, follow).await
        }
        Command::Serve => {
            let (config, store) = connect().await?;
            cmd_serve(store, &config).await
        }
        Command::Catalog { action } => {
            let (_, store) = connect().await?;
            cmd_catalog(&*store, action).await
        }
        Command::Simulate {
            participants,
            max_per_user,
        } => cmd_simulate(participants, max_per_user).await,
    }
}

/// Load config, open the pool, and bring the schema up to date.
async fn connect() -> anyhow::Result<(Config, Arc<PgStore>)> {
    let config = Config::from_env()?;
    let store = PgStore::connect(config.database_url.expose_secret()).await?;
    store.migrate().await?;
    Ok((config, Arc::new(store)))
}

fn telemetry(config: &Config, service_name: &str) -> anyhow::Result<TelemetryGuard> {
    Ok(init_telemetry(TelemetryConfig::from_config(config, service_name))?)
}

/// Explicit session ID, or whatever session is active right now.
async fn resolve_session(
    store: &dyn AssignmentStore,
    session: Option<String>,
) -> anyhow::Result<SessionId> {
    match session {
        Some(id) => Ok(id.parse()?),
        None => match store.latest_active_session().await? {
            Some(session) => Ok(session.id),
            None => anyhow::bail!("no active session; start one with `hatym session new`"),
        },
    }
}

async fn cmd_session(store: &PgStore, action: SessionAction) -> anyhow::Result<()> {
    let session = match action {
        SessionAction::New => {
            let id = store.create_session().await?;
            println!("Created: {id}");
            println!("Claim:   {}", claim_path(id));
            return Ok(());
        }
        SessionAction::Show { id } => store.get_session(id.parse()?).await?,
        SessionAction::Latest => match store.latest_active_session().await? {
            Some(session) => session,
            None => {
                println!("No active session.");
                return Ok(());
            }
        },
    };

    println!("ID:         {}", session.id);
    println!("Created:    {}", session.created_at.format("%Y-%m-%d %H:%M"));
    println!("Active:     {}", session.active);
    println!(
        "Completed:  {}/{}",
        session.completed_count, session.total_pages
    );
    println!("Finished:   {}", session.is_finished());
    Ok(())
}

fn coordinator(store: Arc<PgStore>, config: &Config) -> anyhow::Result<Coordinator> {
    let device = Arc::new(DeviceStore::open(&config.state_dir)?);
    Ok(Coordinator::new(store, device, config.protocol.clone())?)
}

async fn cmd_claim(
    store: Arc<PgStore>,
    config: &Config,
    session_id: SessionId,
    mode: ClaimMode,
) -> anyhow::Result<()> {
    let coordinator = coordinator(store, config)?;

    match coordinator.enter(session_id, mode).await? {
        Assignment::LimitReached => {
            println!("You have read all the pages you can take in this hatym. Thank you.");
        }
        Assignment::Finished => {
            println!("Hatym already completed. Please scan the kiosk for a new session.");
        }
        Assignment::Assigned(pages) => {
            println!("{:<6}  {:<10}  READER", "PAGE", "STATUS");
            println!("{}", "-".repeat(60));
            for page in &pages {
                println!(
                    "{:<6}  {:<10}  {}",
                    page.page_number, page.status, page.reader_path
                );
                if let Some(url) = page.asset_candidates.first() {
                    println!("        content: {url}");
                }
            }
            if pages.iter().any(|p| p.status == PageStatus::Assigned) {
                println!(
                    "\nFinish within {} minutes, then run `hatym complete <page>`.",
                    config.protocol.assignment_ttl_minutes
                );
            }
        }
    }
    Ok(())
}

async fn cmd_complete(
    store: Arc<PgStore>,
    config: &Config,
    session_id: SessionId,
    page: PageNumber,
) -> anyhow::Result<()> {
    let coordinator = coordinator(store, config)?;

    match coordinator.complete(session_id, page).await {
        Ok(result) => {
            println!(
                "Done. {}/{} pages completed.",
                result.completed_count, TOTAL_PAGES
            );
            if result.finished {
                println!("That was the last page. The hatym is complete.");
            }
            Ok(())
        }
        Err(e) if e.is_capability_rejected() => {
            println!("Page {page} is no longer assigned to you. Run `hatym claim` again.");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn print_snapshot(snapshot: &Snapshot) {
    let c = snapshot.counts;
    println!(
        "[{}] available {:>3}  assigned {:>3}  completed {:>3}  ({:.1}%){}",
        snapshot.session_id.short(),
        c.available,
        c.assigned,
        c.completed,
        snapshot.completion_ratio * 100.0,
        if snapshot.complete { "  COMPLETE" } else { "" }
    );
}

async fn cmd_dashboard(
    store: Arc<PgStore>,
    config: &Config,
    session_id: SessionId,
    follow: bool,
) -> anyhow::Result<()> {
    let dashboard = Dashboard::new(store, &config.protocol, session_id);

    if !follow {
        let mut projection = Projection::new(session_id);
        dashboard.resync(&mut projection).await?;
        print_snapshot(&projection.snapshot());
        return Ok(());
    }

    let _guard = telemetry(config, "hatym-dashboard")?;
    let dashboard = Arc::new(dashboard);
    let mut snapshots = dashboard.snapshots();

    let runner = Arc::clone(&dashboard);
    let handle = tokio::spawn(async move { runner.run().await });

    let stopper = Arc::clone(&dashboard);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        stopper.shutdown();
    });

    while snapshots.changed().await.is_ok() {
        let snapshot = snapshots.borrow_and_update().clone();
        print_snapshot(&snapshot);
        if snapshot.complete {
            println!("Hatym complete. Start the next one with `hatym session new`.");
        }
    }

    handle.await??;
    Ok(())
}

async fn cmd_serve(store: Arc<PgStore>, config: &Config) -> anyhow::Result<()> {
    let _guard = telemetry(config, "hatym")?;

    let sweeper = Sweeper::new(store, &config.protocol);
    let stopper = sweeper.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        stopper.shutdown();
    });

    sweeper.run(SweepTarget::LatestActive).await?;
    Ok(())
}

async fn cmd_catalog(store: &PgStore, action: CatalogAction) -> anyhow::Result<()> {
    match action {
        CatalogAction::Set {
            page,
            url,
            render_type,
        } => {
            let mut asset = PageAsset::new(page.parse()?, url);
            asset.render_type = render_type;
            store.upsert_page_asset(&asset).await?;
            println!("Page {} -> {}", asset.page_number, asset.asset_url);
        }
        CatalogAction::Show { page } => match store.page_asset(page.parse()?).await? {
            Some(asset) => println!(
                "Page {}: {} ({})",
                asset.page_number, asset.asset_url, asset.render_type
            ),
            None => println!("Page {page} has no catalog entry."),
        },
    }
    Ok(())
}

async fn cmd_simulate(participants: usize, max_per_user: u32) -> anyhow::Result<()> {
    let settings = ProtocolSettings {
        max_pages_per_user: max_per_user,
        ..ProtocolSettings::default()
    };
    settings.validate()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: None,
        service_name: "hatym-simulate".to_string(),
        log_level: "warn".to_string(),
    })?;

    let store: Arc<dyn AssignmentStore> = Arc::new(MemoryStore::new());
    let session_id = store.create_session().await?;

    let mut handles = Vec::with_capacity(participants);
    for _ in 0..participants {
        let store = Arc::clone(&store);
        let settings = settings.clone();
        handles.push(tokio::spawn(async move {
            let device = Arc::new(DeviceStore::in_memory());
            let coordinator = Coordinator::new(store, device, settings)?;
            let mut completed = 0u32;
            loop {
                match coordinator.enter(session_id, ClaimMode::Multi).await? {
                    Assignment::Assigned(pages) => {
                        let open: Vec<_> = pages
                            .iter()
                            .filter(|p| p.status == PageStatus::Assigned)
                            .map(|p| p.page_number)
                            .collect();
                        for page in open {
                            coordinator.complete(session_id, page).await?;
                            completed += 1;
                        }
                    }
                    Assignment::LimitReached | Assignment::Finished => break,
                }
            }
            Ok::<u32, hatym_rs::error::Error>(completed)
        }));
    }

    let mut total = 0u32;
    for handle in handles {
        total += handle.await??;
    }

    let mut projection = Projection::new(session_id);
    projection.load(store.list_pages(session_id).await?);
    let session = store.get_session(session_id).await?;

    println!("Participants:      {participants}");
    println!("Cap per user:      {max_per_user}");
    println!("Pages completed:   {total}");
    print_snapshot(&projection.snapshot());
    println!("Session finished:  {}", session.is_finished());
    Ok(())
}
