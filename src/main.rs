mod cli;

use chrono::Utc;
use clap::Parser;
use cli::{Cli, Commands};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use point_renewal_bot::{
    api::{self, AppState},
    audit::{AuditSink, DatabaseAuditSink, TracingAuditSink},
    config::AuditTarget,
    error::{self, RenewalError},
    extraction::{self, RawCapture},
    panel::PanelRenewer,
    partner::{PartnerApi, PartnerClient},
    reconcile::{Classification, ReconciliationService},
    renewal::{CancelOutcome, ForceOutcome, RenewalController, SystemLocks},
    storage::{
        models::{NewPoint, PointSource, QueueStatus, System},
        Database,
    },
    utils, Config,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("point_renewal_bot=debug,info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Init { output, force } => {
            info!("Initializing...");
            initialize(&config, &output, force).await
        }

        Commands::AddSystem {
            id,
            external_id,
            panel_user,
            panel_password,
            max_points,
        } => add_system(&config, id, external_id, panel_user, panel_password, max_points),

        Commands::AddPoint {
            system,
            username,
            password,
            expires,
        } => add_point(&config, system, username, password, &expires),

        Commands::Scan { run } => {
            info!("Scanning for systems nearing expiry...");
            scan(&config, run).await
        }

        Commands::Renew { system, yes } => {
            info!("Forcing renewal for system {}", system);
            renew(&config, &system, yes).await
        }

        Commands::Queue { format } => show_queue(&config, &format),

        Commands::Cancel { system } => cancel(&config, &system).await,

        Commands::Reconcile { divergent, format } => {
            info!("Reconciling local store against the partner API...");
            reconcile(&config, divergent, &format).await
        }

        Commands::Push { username, yes } => push(&config, &username, yes).await,

        Commands::Pull { target, counts, yes } => pull(&config, &target, counts, yes).await,

        Commands::Extract { file, show_secret } => extract_file(&file, show_secret),

        Commands::Auto => {
            info!("Starting automated renewal service");
            run_service(&config, None).await
        }

        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.server.bind.clone());
            info!("Starting operator API on {}", bind);
            run_service(&config, Some(bind)).await
        }

        Commands::Stats { format } => show_stats(&config, &format),
    };

    if let Err(e) = result {
        error!("{}", format!("Error: {}", e).red());
        std::process::exit(1);
    }
}

/// Everything the long-running and one-shot commands share.
struct Services {
    db: Arc<Mutex<Database>>,
    audit: Arc<dyn AuditSink>,
    controller: Arc<RenewalController>,
    reconciliation: Option<Arc<ReconciliationService>>,
    shutdown: CancellationToken,
}

fn open_db(config: &Config) -> error::Result<Database> {
    Database::new(&config.database.path)
}

async fn build_services(config: &Config) -> error::Result<Services> {
    let db = Arc::new(Mutex::new(open_db(config)?));
    let locks = SystemLocks::new();
    let shutdown = CancellationToken::new();

    let audit: Arc<dyn AuditSink> = match config.audit.sink {
        AuditTarget::Database => Arc::new(DatabaseAuditSink::new(db.clone())),
        AuditTarget::Log => Arc::new(TracingAuditSink),
    };

    let partner: Option<Arc<dyn PartnerApi>> = if config.partner.enabled {
        Some(Arc::new(PartnerClient::new(&config.partner)?))
    } else {
        None
    };

    let mut controller = RenewalController::new(
        config.renewal.clone(),
        db.clone(),
        locks.clone(),
        Arc::new(PanelRenewer::new(config.panel.clone())),
        audit.clone(),
    )
    .with_shutdown(shutdown.clone());
    if let Some(partner) = &partner {
        controller = controller.with_partner(partner.clone(), config.partner.notify_on_renewal);
    }
    let controller = Arc::new(controller);
    controller.restore_from_db().await?;

    let reconciliation = partner.map(|partner| {
        Arc::new(ReconciliationService::new(
            config.reconciliation.clone(),
            db.clone(),
            partner,
            locks,
        ))
    });

    Ok(Services {
        db,
        audit,
        controller,
        reconciliation,
        shutdown,
    })
}

/// Reconciliation on its own, without restoring the renewal queue.
fn reconciliation_service(config: &Config) -> error::Result<ReconciliationService> {
    if !config.partner.enabled {
        return Err(RenewalError::Config("partner API is disabled (set partner.enabled)".to_string()));
    }
    Ok(ReconciliationService::new(
        config.reconciliation.clone(),
        Arc::new(Mutex::new(open_db(config)?)),
        Arc::new(PartnerClient::new(&config.partner)?),
        SystemLocks::new(),
    ))
}

async fn initialize(config: &Config, output: &str, force: bool) -> error::Result<()> {
    println!("{}", "Initializing Point Renewal Bot...".green());
    let _db = open_db(config)?;
    println!("{}", "✓ Database initialized".green());

    let path = std::path::Path::new(output);
    if path.exists() && !force {
        println!("{}", format!("Configuration template {} already exists (use --force)", output).yellow());
    } else {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(anyhow::Error::from)?;
        }
        std::fs::write(path, config.to_toml()?).map_err(anyhow::Error::from)?;
        println!("{}", format!("✓ Configuration template written to {}", output).green());
    }

    println!("\n{}", "Configuration:".cyan());
    println!("  Database:       {}", config.database.path);
    println!("  Panel:          {}", config.panel.login_url);
    println!("  WebDriver:      {}", config.panel.webdriver_url);
    println!("  Partner API:    {}", if config.partner.enabled { config.partner.base_url.as_str() } else { "disabled" });
    println!("  Lead Time:      {} days", config.renewal.lead_time_days);
    println!("  Workers:        {}", config.renewal.max_workers);
    println!("  Max Attempts:   {}", config.renewal.max_attempts);

    println!("\n{}", "Ready to use! Try running:".cyan());
    println!("  {} to register a system", "point-renew add-system <id> <external-id>".yellow());
    println!("  {} to queue systems nearing expiry", "point-renew scan".yellow());
    println!("  {} to run the background service", "point-renew auto".yellow());
    Ok(())
}

fn add_system(
    config: &Config,
    id: String,
    external_id: String,
    panel_user: String,
    panel_password: String,
    max_points: u32,
) -> error::Result<()> {
    let db = open_db(config)?;
    let mut system = db
        .get_system(&id)?
        .unwrap_or_else(|| System::new(id.clone(), external_id.clone()));
    system.external_id = external_id;
    if !panel_user.is_empty() {
        system = system.with_panel_credentials(panel_user, panel_password);
    }
    if max_points > 0 {
        system = system.with_capacity(max_points);
    }

    db.save_system(&system)?;
    println!("{}", format!("✓ System {} saved", system.id).green());
    Ok(())
}

fn add_point(config: &Config, system: String, username: String, password: String, expires: &str) -> error::Result<()> {
    let expires_at = extraction::parse_expiry(expires)
        .ok_or_else(|| RenewalError::Config(format!("unrecognised expiry '{}'", expires)))?
        .and_utc();

    let db = open_db(config)?;
    if db.get_system(&system)?.is_none() {
        return Err(RenewalError::SystemNotFound(system));
    }

    let point = db.insert_point(&NewPoint {
        system_id: system,
        username,
        password,
        expires_at,
        source: PointSource::Local,
    })?;
    println!(
        "{}",
        format!(
            "✓ Point {} added to {} (expires {})",
            point.username,
            point.system_id,
            utils::format_timestamp(&point.expires_at)
        )
        .green()
    );
    Ok(())
}

async fn scan(config: &Config, run: bool) -> error::Result<()> {
    println!("{}", "Scanning for systems nearing expiry...".cyan());
    let services = build_services(config).await?;
    let summary = services.controller.scan(Utc::now()).await?;

    println!("\n{}", "=== Scan Results ===".cyan().bold());
    println!("Systems Examined:   {}", summary.systems_examined);
    println!("Due for Renewal:    {}", summary.due);
    println!("Enqueued:           {} ✓", summary.enqueued.len().to_string().green());
    println!("Already In Flight:  {}", summary.skipped_in_flight);
    println!("Suppressed:         {}", summary.skipped_suppressed.to_string().yellow());

    if run && !summary.enqueued.is_empty() {
        println!("\n{}", "Running queued renewals...".cyan());
        let dispatched = services.controller.run_once(Utc::now()).await;
        println!("Dispatched {} renewal(s)", dispatched);
        print_queue(&services.controller.queue_status().await);
    }

    Ok(())
}

async fn renew(config: &Config, system_id: &str, yes: bool) -> error::Result<()> {
    if !yes && !utils::confirm_action(&format!("Generate a new point for system {}?", system_id)) {
        println!("Cancelled");
        return Ok(());
    }

    let services = build_services(config).await?;
    let item_id = match services.controller.force_renew(system_id).await? {
        ForceOutcome::Enqueued { item_id } => item_id,
        ForceOutcome::AlreadyInFlight { item_id } => {
            println!("{}", format!("System {} already has item {} queued, running it now", system_id, item_id).yellow());
            item_id
        }
    };

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed}]").unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(format!("Renewing {} through the panel...", system_id));
    spinner.enable_steady_tick(Duration::from_millis(120));

    services.controller.run_once(Utc::now()).await;
    spinner.finish_and_clear();

    let item = services
        .controller
        .queue_status()
        .await
        .into_iter()
        .find(|item| item.id == item_id);

    match item {
        Some(item) if item.status == QueueStatus::Completed => {
            println!("✓ Renewal successful!");
            let points = services.db.lock().await.get_active_points(system_id)?;
            if let Some(point) = points.iter().max_by_key(|p| p.id) {
                println!("Username: {}", point.username);
                println!("Password: {}", utils::mask_secret(&point.password));
                println!("Expires:  {}", utils::format_timestamp(&point.expires_at));
            }
        }
        Some(item) => {
            println!("Status:   {}", utils::colored_status(item.status));
            println!("Attempts: {}", item.attempts);
            if let Some(reason) = &item.last_error {
                println!("Reason:   {}", reason.red());
            }
            if item.status == QueueStatus::Waiting {
                println!("Next try: {}", utils::format_timestamp(&item.not_before));
            }
        }
        None => println!("{}", "Item was retired before it could be reported".yellow()),
    }

    Ok(())
}

fn show_queue(config: &Config, format: &str) -> error::Result<()> {
    let items = open_db(config)?.load_queue_items()?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if items.is_empty() {
        println!("{}", "Renewal queue is empty".green());
        return Ok(());
    }
    print_queue(&items);
    Ok(())
}

fn print_queue(items: &[point_renewal_bot::storage::models::RenewalQueueItem]) {
    println!("\n{}", "Renewal Queue:".yellow());
    utils::print_table_border(134);
    utils::print_table_row(
        &["Item", "System", "Status", "Trigger", "Tries", "Enqueued", "Finished", "Reason"],
        &[6, 16, 10, 7, 5, 23, 23, 30],
    );
    utils::print_table_border(134);

    for item in items {
        utils::print_table_row(
            &[
                &item.id.to_string(),
                &utils::format_id(&item.system_id),
                &utils::colored_status(item.status),
                &format!("{:?}", item.trigger).to_lowercase(),
                &item.attempts.to_string(),
                &utils::format_timestamp(&item.enqueued_at),
                &utils::format_opt_timestamp(item.completed_at.as_ref()),
                item.last_error.as_deref().unwrap_or("-"),
            ],
            &[6, 16, 10, 7, 5, 23, 23, 30],
        );
    }
    utils::print_table_border(134);
}

async fn cancel(config: &Config, system_id: &str) -> error::Result<()> {
    let services = build_services(config).await?;
    match services.controller.cancel(system_id).await? {
        CancelOutcome::Cancelled { item_id } => {
            println!("{}", format!("✓ Item {} cancelled", item_id).green());
        }
        CancelOutcome::Deferred { item_id } => {
            println!("{}", format!("Item {} is running; it will not be retried", item_id).yellow());
        }
        CancelOutcome::NothingQueued => println!("Nothing queued for system {}", system_id),
    }
    Ok(())
}

async fn reconcile(config: &Config, divergent_only: bool, format: &str) -> error::Result<()> {
    let service = reconciliation_service(config)?;
    let report = service.refresh().await?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}", "=== Reconciliation ===".cyan().bold());
    println!("Generated:       {}", utils::format_timestamp(&report.generated_at));
    println!("In Sync:         {}", report.count(Classification::BothInSync).to_string().green());
    println!("Divergent:       {}", report.count(Classification::BothDivergent).to_string().red());
    println!("Local Only:      {}", report.count(Classification::LocalOnly).to_string().yellow());
    println!("API Only:        {}", report.count(Classification::ApiOnly).to_string().yellow());

    let entries: Vec<_> = report
        .entries
        .iter()
        .filter(|e| !divergent_only || e.classification != Classification::BothInSync)
        .collect();
    if entries.is_empty() {
        return Ok(());
    }

    println!();
    utils::print_table_border(100);
    utils::print_table_row(&["Entity", "Classification", "Differences"], &[32, 16, 48]);
    utils::print_table_border(100);
    for entry in entries {
        let fields = entry
            .fields
            .iter()
            .map(|f| format!("{}: {} vs {}", f.field, f.local, f.api))
            .collect::<Vec<_>>()
            .join("; ");
        utils::print_table_row(
            &[
                &entry.key.to_string(),
                &utils::colored_classification(entry.classification),
                if fields.is_empty() { "-" } else { fields.as_str() },
            ],
            &[32, 16, 48],
        );
    }
    utils::print_table_border(100);
    Ok(())
}

async fn push(config: &Config, username: &str, yes: bool) -> error::Result<()> {
    if !yes && !utils::confirm_action(&format!("Overwrite point {} on the partner API?", username)) {
        println!("Cancelled");
        return Ok(());
    }

    let service = reconciliation_service(config)?;
    let pushed = service.push_point(username).await?;
    println!(
        "{}",
        format!("✓ Point {} pushed (expires {})", pushed.username, utils::format_timestamp(&pushed.expires_at)).green()
    );
    Ok(())
}

async fn pull(config: &Config, target: &str, counts: bool, yes: bool) -> error::Result<()> {
    let prompt = if counts {
        format!("Overwrite local counts of system {} with the partner API's?", target)
    } else {
        format!("Overwrite local point {} with the partner API's?", target)
    };
    if !yes && !utils::confirm_action(&prompt) {
        println!("Cancelled");
        return Ok(());
    }

    let service = reconciliation_service(config)?;
    if counts {
        let system = service.pull_system_counts(target).await?;
        println!(
            "{}",
            format!("✓ System {} now {}/{} points", system.external_id, system.active_points, system.max_points).green()
        );
    } else {
        let point = service.pull_point(target).await?;
        println!(
            "{}",
            format!("✓ Point {} pulled into system {}", point.username, point.system_id).green()
        );
    }
    Ok(())
}

fn extract_file(file: &str, show_secret: bool) -> error::Result<()> {
    let text = std::fs::read_to_string(file).map_err(anyhow::Error::from)?;
    let capture = RawCapture::new(text);
    let result = extraction::extract(&capture)?;

    println!("{}", "=== Extraction ===".cyan().bold());
    println!("Method:    {}", result.method.to_string().green());
    println!("Username:  {}", result.username);
    println!(
        "Password:  {}",
        if show_secret { result.password.clone() } else { utils::mask_secret(&result.password) }
    );
    println!("Expires:   {}", result.expires_at.as_deref().unwrap_or("-"));
    println!("Digest:    {}", result.raw_digest);
    Ok(())
}

async fn run_service(config: &Config, bind: Option<String>) -> error::Result<()> {
    println!("{}", "Starting automated renewal service...".green());
    println!("Lead time:     {} days", config.renewal.lead_time_days);
    println!("Scan interval: {} seconds", config.renewal.scan_interval_secs);

    let services = build_services(config).await?;
    let shutdown = services.shutdown.clone();

    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
        }
        ctrl_c.cancel();
    });

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn({
        let controller = services.controller.clone();
        async move {
            if let Err(e) = controller.run().await {
                error!("Renewal loop failed: {}", e);
            }
        }
    }));

    match &services.reconciliation {
        Some(reconciliation) => {
            println!("{}", "✓ Partner reconciliation enabled".green());
            tasks.push(tokio::spawn(reconciliation.clone().run(shutdown.clone())));
        }
        None => warn!("Partner API disabled, reconciliation will not run"),
    }

    if let Some(bind) = bind {
        let state = AppState {
            controller: services.controller.clone(),
            reconciliation: services.reconciliation.clone(),
            audit: services.audit.clone(),
        };
        if let Err(e) = api::serve(&bind, state, shutdown.clone()).await {
            error!("Operator API stopped: {}", e);
            shutdown.cancel();
        }
    }

    for result in futures::future::join_all(tasks).await {
        if let Err(e) = result {
            error!("Background task panicked: {}", e);
        }
    }

    println!("{}", "Service stopped".yellow());
    Ok(())
}

fn show_stats(config: &Config, format: &str) -> error::Result<()> {
    let db = open_db(config)?;
    let stats = db.get_stats()?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("{}", "=== Point Renewal Statistics ===".cyan().bold());
    println!("\nSystems:            {}", stats.total_systems);
    println!("\nPoints:");
    println!("  Total:            {}", stats.total_points);
    println!("  Active:           {}", stats.active_points.to_string().green());
    println!("\nRenewal Queue:");
    println!("  Queued:           {}", stats.queued_items.to_string().yellow());
    println!("  Failed:           {}", stats.failed_items.to_string().red());
    println!("  Renewals Audited: {}", stats.renewals_recorded.to_string().cyan());

    let history = db.get_audit_history(10)?;
    if !history.is_empty() {
        println!("\n{}", "Recent Extractions:".yellow());
        utils::print_table_border(100);
        utils::print_table_row(&["Recorded", "System", "Username", "Method", "Expires"], &[23, 16, 16, 14, 22]);
        utils::print_table_border(100);

        for record in history {
            utils::print_table_row(
                &[
                    &utils::format_timestamp(&record.recorded_at),
                    &utils::format_id(&record.system_id),
                    &record.username,
                    &record.method.to_string(),
                    record.expires_at.as_deref().unwrap_or("-"),
                ],
                &[23, 16, 16, 14, 22],
            );
        }
        utils::print_table_border(100);
    }

    Ok(())
}
