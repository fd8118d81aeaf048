use crate::config::bootstrap_plan::DEFAULT_FIXTURE;
use crate::config::DEFAULT_CONFIG_FILE;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "stallbook")]
#[command(about = "Campus food stall pre-ordering: bootstrap, ordering and demand estimates")]
pub struct Cli {
    /// Path to the application configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Prepare a runnable instance on this machine
    ///
    /// Without a plan file the built-in sequence runs: create-env, activate,
    /// checkpoint, migrate and load-fixture. It installs nothing; add an
    /// `install` step to bootstrap.toml when dependencies must be fetched.
    Bootstrap {
        /// Bootstrap plan file (defaults to ./bootstrap.toml, then the built-in plan, which has no install step)
        #[arg(long)]
        plan: Option<PathBuf>,

        /// Dry run - show the step list without executing
        #[arg(long)]
        dry_run: bool,

        /// Do not wait for operator confirmation at checkpoints
        #[arg(short, long)]
        yes: bool,

        /// Execution ID for this run
        #[arg(long)]
        execution_id: Option<String>,
    },

    /// Synchronize the store schema
    Migrate {
        /// Only list pending migrations
        #[arg(long)]
        plan: bool,
    },

    /// Load a JSON fixture into the store
    LoadFixture {
        #[arg(default_value = DEFAULT_FIXTURE)]
        path: PathBuf,
    },

    /// Register a student account
    Register {
        #[arg(long)]
        username: String,
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        registration_number: String,
        #[arg(long)]
        phone: String,
        #[arg(long)]
        department: String,
        #[arg(long, default_value = "1")]
        semester: i64,
    },

    /// List open stalls and available items
    Menu {
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        stall: Option<i64>,
    },

    /// Place an order from a single stall
    PlaceOrder {
        #[arg(long)]
        account: i64,
        #[arg(long)]
        slot: i64,
        /// Repeatable ITEM_ID:QUANTITY
        #[arg(long = "item", required = true, value_parser = parse_cart_line)]
        items: Vec<(i64, i64)>,
        #[arg(long, default_value = "")]
        instructions: String,
    },

    /// Cancel one of your pending orders
    CancelOrder {
        #[arg(long)]
        account: i64,
        order: i64,
    },

    /// Change an order's status (staff only)
    SetStatus {
        #[arg(long)]
        staff: i64,
        order: i64,
        status: String,
    },

    /// Show an account's orders, newest first
    Orders {
        #[arg(long)]
        account: i64,
    },

    /// Today's orders, revenue and predictions (staff only)
    Dashboard {
        #[arg(long)]
        staff: i64,
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Slot load and peak indicators
    PeakTimes {
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Predicted demand for one item
    Predict {
        #[arg(long)]
        item: i64,
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Single slot; all slots ranked by demand when omitted
        #[arg(long)]
        slot: Option<i64>,
    },

    /// Weekly demand chart data as JSON
    DemandChart {
        #[arg(long)]
        item: i64,
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Record the day's ordered quantities as demand history
    RecordDemand {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

/// Parses `ITEM_ID:QUANTITY`.
fn parse_cart_line(raw: &str) -> Result<(i64, i64), String> {
    let (item, quantity) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected ITEM_ID:QUANTITY, got '{}'", raw))?;
    let item = item
        .trim()
        .parse::<i64>()
        .map_err(|e| format!("invalid item id '{}': {}", item, e))?;
    let quantity = quantity
        .trim()
        .parse::<i64>()
        .map_err(|e| format!("invalid quantity '{}': {}", quantity, e))?;
    Ok((item, quantity))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_needs_no_flags() {
        let cli = Cli::try_parse_from(["stallbook", "bootstrap"]).unwrap();
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));
        match cli.command {
            Commands::Bootstrap { plan, dry_run, yes, .. } => {
                assert!(plan.is_none());
                assert!(!dry_run);
                assert!(!yes);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_place_order_items() {
        let cli = Cli::try_parse_from([
            "stallbook", "place-order", "--account", "3", "--slot", "2", "--item", "1:2", "--item", "4:1",
        ])
        .unwrap();
        match cli.command {
            Commands::PlaceOrder { items, .. } => assert_eq!(items, vec![(1, 2), (4, 1)]),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_cart_line_rejects_garbage() {
        assert!(parse_cart_line("12").is_err());
        assert!(parse_cart_line("a:1").is_err());
        assert_eq!(parse_cart_line(" 7 : 3 ").unwrap(), (7, 3));
    }
}
