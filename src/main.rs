use anyhow::Context;
use chrono::{Local, NaiveDate, Utc};
use clap::Parser;
use stallbook::app::{demand, ordering};
use stallbook::config::bootstrap_plan::BootstrapPlan;
use stallbook::core::process::{AutoConfirm, StdinPrompt, SystemRunner};
use stallbook::domain::model::Category;
use stallbook::domain::ports::OperatorPrompt;
use stallbook::store::queries::MenuFilter;
use stallbook::utils::error::StallbookError;
use stallbook::utils::{logger, validation::Validate};
use stallbook::{sequence_from_plan, AppConfig, BootstrapSequence, Cli, Commands, StepContext, Store};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match AppConfig::load_or_default(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Failed to load config file '{}': {}", cli.config.display(), e);
            eprintln!("💡 Make sure the file exists and is valid TOML format");
            std::process::exit(e.exit_code());
        }
    };

    // 初始化日誌
    logger::init_cli_logger(&config.logging.level, cli.verbose, config.logging.json);
    tracing::debug!("Config: {:?}", config);

    // 驗證配置
    if let Err(e) = config.validate() {
        tracing::error!("❌ Configuration validation failed: {}", e);
        tracing::error!("💡 Suggestion: {}", e.recovery_suggestion());
        eprintln!("❌ {}", e.user_friendly_message());
        std::process::exit(e.exit_code());
    }

    if let Err(err) = run(cli.command, config).await {
        match err.downcast_ref::<StallbookError>() {
            Some(e) => {
                tracing::error!(
                    "❌ {:#} (Category: {:?}, Severity: {:?})",
                    err,
                    e.category(),
                    e.severity()
                );
                eprintln!("❌ {}", e.user_friendly_message());
                eprintln!("💡 建議: {}", e.recovery_suggestion());

                let exit_code = e.exit_code();
                if exit_code > 0 {
                    std::process::exit(exit_code);
                }
            }
            None => {
                tracing::error!("❌ {:#}", err);
                eprintln!("❌ {:#}", err);
                std::process::exit(1);
            }
        }
    }
}

async fn run(command: Commands, config: AppConfig) -> anyhow::Result<()> {
    let working_dir = std::env::current_dir().context("reading the working directory")?;
    let today = Local::now().date_naive();
    let on = |date: Option<NaiveDate>| date.unwrap_or(today);

    match command {
        Commands::Bootstrap {
            plan,
            dry_run,
            yes,
            execution_id,
        } => {
            let plan = BootstrapPlan::resolve(plan.as_deref(), &working_dir)?;
            let mut sequence = sequence_from_plan(&plan)?;
            let execution_id = execution_id.unwrap_or_else(|| {
                format!("bootstrap_{}", Utc::now().format("%Y%m%d_%H%M%S"))
            });

            display_plan_summary(&plan, &execution_id);
            if dry_run {
                tracing::info!("🔍 DRY RUN MODE - No steps will be executed");
                return Ok(());
            }

            let prompt: Arc<dyn OperatorPrompt> = if yes {
                Arc::new(AutoConfirm)
            } else {
                Arc::new(StdinPrompt)
            };
            let mut context = StepContext::new(
                execution_id.clone(),
                working_dir,
                config.database,
                Arc::new(SystemRunner),
                prompt,
            );

            let results = sequence.execute_all(&mut context).await?;
            let summary = BootstrapSequence::get_execution_summary(&results);
            println!("✅ Bootstrap completed successfully!");
            println!("🆔 Execution ID: {}", execution_id);
            for result in &results {
                println!(
                    "  • {} - {} ({:?})",
                    result.step_name, result.summary, result.duration
                );
            }
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }

        Commands::Migrate { plan } => {
            let path = store_path(&working_dir, &config);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            let mut store = Store::open(&path)?;
            if plan {
                let pending = store.pending_migrations()?;
                println!("📋 {} pending migration(s)", pending.len());
                for m in pending {
                    println!("  {:04}_{}", m.version, m.name);
                }
            } else {
                let applied = store.migrate()?;
                println!("✅ Applied {} migration(s) to {}", applied.len(), path.display());
            }
        }

        Commands::LoadFixture { path } => {
            let mut store = open_store(&working_dir, &config)?;
            let report = store.load_fixture(working_dir.join(&path))?;
            println!("🌱 Loaded {} records from {}", report.total, path.display());
            for (model, count) in &report.per_model {
                println!("  {}: {}", model, count);
            }
        }

        Commands::Register {
            username,
            first_name,
            last_name,
            email,
            registration_number,
            phone,
            department,
            semester,
        } => {
            let mut store = open_store(&working_dir, &config)?;
            let account = ordering::register_student(
                &mut store,
                &ordering::Registration {
                    username,
                    first_name,
                    last_name,
                    email,
                    registration_number,
                    phone,
                    department,
                    semester,
                },
            )?;
            println!("✅ Registered {} (account #{})", account, account.id);
        }

        Commands::Menu { category, stall } => {
            let store = open_store(&working_dir, &config)?;
            let category = category.map(|c| c.parse::<Category>()).transpose()?;
            let menu = ordering::menu(
                &store,
                &MenuFilter {
                    category,
                    stall_id: stall,
                },
            )?;

            for stall in &menu.stalls {
                println!("🏪 #{} {} ({})", stall.id, stall.name, stall.location);
                for item in menu.items.iter().filter(|i| i.stall_id == stall.id) {
                    println!(
                        "  #{:<4} {:<28} {:>10}  [{}]",
                        item.id,
                        item.name,
                        item.price.to_string(),
                        item.category.as_str()
                    );
                }
            }
        }

        Commands::PlaceOrder {
            account,
            slot,
            items,
            instructions,
        } => {
            let mut store = open_store(&working_dir, &config)?;
            let mut cart = ordering::Cart::new();
            for (item_id, quantity) in items {
                let item = store.get_food_item(item_id)?;
                cart.add(&item, quantity)?;
            }

            let order = ordering::place_order(&mut store, account, &mut cart, slot, &instructions, today)?;
            let slot = store.get_time_slot(order.time_slot_id)?;
            println!("✅ Order #{} placed for {}", order.id, slot);
            println!("💰 Total: {}", order.total_amount);
        }

        Commands::CancelOrder { account, order } => {
            let store = open_store(&working_dir, &config)?;
            let order = ordering::cancel_order(&store, account, order)?;
            println!("🚫 Order #{} is now {}", order.id, order.status.label());
        }

        Commands::SetStatus {
            staff,
            order,
            status,
        } => {
            let store = open_store(&working_dir, &config)?;
            let order = ordering::update_status(&store, staff, order, &status)?;
            println!("🔄 Order #{} is now {}", order.id, order.status.label());
        }

        Commands::Orders { account } => {
            let store = open_store(&working_dir, &config)?;
            for order in ordering::orders_for(&store, account)? {
                println!(
                    "#{:<5} {}  {:<10} {:>10}  slot {}",
                    order.id,
                    order.order_date,
                    order.status.label(),
                    order.total_amount.to_string(),
                    order.time_slot_id
                );
            }
        }

        Commands::Dashboard { staff, date } => {
            let store = open_store(&working_dir, &config)?;
            let dashboard = ordering::dashboard(&store, staff, on(date))?;
            println!("📊 Dashboard for {}", dashboard.date);
            println!("  Orders: {}", dashboard.total_orders);
            println!("  Revenue: {}", dashboard.revenue);
            println!("🕐 Orders per slot:");
            for (slot, count) in &dashboard.slot_demand {
                println!("  {:<22} {}", slot.to_string(), count);
            }
            println!("🔮 Lunch-slot predictions:");
            for prediction in &dashboard.predictions {
                println!("  {:<28} {}", prediction.item.name, prediction.predicted_demand);
            }
        }

        Commands::PeakTimes { date } => {
            let store = open_store(&working_dir, &config)?;
            for load in ordering::peak_times(&store, on(date))? {
                println!(
                    "{} {:<22} {:>3}/{:<3} ({:>3}%) predicted {}",
                    if load.is_peak { "🔥" } else { "  " },
                    load.slot.to_string(),
                    load.current_orders,
                    load.slot.max_capacity,
                    load.percentage,
                    load.predicted
                );
            }
        }

        Commands::Predict { item, date, slot } => {
            let store = open_store(&working_dir, &config)?;
            let predictor = demand::predictor_for_item(&store, item)?;
            let date = on(date);
            if !predictor.is_trained() {
                tracing::info!("📐 Not enough history for item {}, using fallback rule", item);
            }
            match slot {
                Some(slot) => println!("{}", predictor.predict_on(date, slot)),
                None => {
                    let slots = store.time_slots()?;
                    for prediction in predictor.peak_slots(&slots, date) {
                        println!(
                            "{} {:<22} {}",
                            if prediction.is_peak { "🔥" } else { "  " },
                            prediction.slot.to_string(),
                            prediction.predicted_demand
                        );
                    }
                }
            }
        }

        Commands::DemandChart { item, date } => {
            let store = open_store(&working_dir, &config)?;
            let chart = demand::weekly_demand_chart(&store, item, on(date))?;
            println!("{}", serde_json::to_string_pretty(&chart)?);
        }

        Commands::RecordDemand { date } => {
            let store = open_store(&working_dir, &config)?;
            let date = on(date);
            let written = demand::refresh_demand_records(&store, date)?;
            println!("📈 Recorded {} demand row(s) for {}", written, date);
        }
    }

    Ok(())
}

fn store_path(working_dir: &Path, config: &AppConfig) -> PathBuf {
    working_dir.join(&config.database.path)
}

/// Opens an existing, fully migrated store.
fn open_store(working_dir: &Path, config: &AppConfig) -> stallbook::Result<Store> {
    let path = store_path(working_dir, config);
    if !path.is_file() {
        return Err(StallbookError::not_found("Store", path.display()));
    }
    let store = Store::open(&path)?;
    let pending = store.pending_migrations()?;
    if !pending.is_empty() {
        return Err(StallbookError::PreconditionFailed {
            check: "schema".to_string(),
            reason: format!("{} migration(s) pending; run `stallbook migrate`", pending.len()),
        });
    }
    Ok(store)
}

fn display_plan_summary(plan: &BootstrapPlan, execution_id: &str) {
    println!("📋 Bootstrap Summary:");
    println!("  Name: {}", plan.sequence.name);
    if let Some(description) = &plan.sequence.description {
        println!("  Description: {}", description);
    }
    println!("  Execution ID: {}", execution_id);
    println!("  Total Steps: {}", plan.steps.len());
    println!();
    println!("📝 Execution Order:");
    for (index, step) in plan.steps.iter().enumerate() {
        println!("  {}. {} ({})", index + 1, step.label(), step.kind());
    }
    println!();
}
