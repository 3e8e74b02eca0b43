//! Command front-end: each subcommand mounts one view, performs one action
//! and prints the result as JSON.
//!
//! ```bash
//! lead-desk signin -e ada@example.com
//! lead-desk leads list --status new --status contacted --search acme
//! lead-desk leads import contacts.csv --map "Full Name=name" --map "Email=email"
//! lead-desk companies list --page 2 --page-size 50
//! lead-desk recent --follow
//! ```

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use secrecy::SecretString;
use serde::Serialize;

use crate::commands::{self, HealthReport};
use crate::config::AppConfig;
use crate::errors::AppError;
use crate::import::ImportTarget;
use crate::models::LeadStatus;
use crate::views::LeadFilters;
use crate::{init_tracing, AppState};

#[derive(Parser)]
#[command(name = "lead-desk")]
#[command(author, version, about = "Lead and company desk over a hosted backend")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show configuration and session status
    Health,
    /// Create an account
    Signup(Credentials),
    /// Sign in and remember the session
    Signin(Credentials),
    /// Sign out and forget the session
    Signout,
    /// Print the signed-in user
    Whoami,
    /// Work with leads
    Leads {
        #[command(subcommand)]
        action: LeadAction,
    },
    /// Work with companies
    Companies {
        #[command(subcommand)]
        action: CompanyAction,
    },
    /// New leads from the recent window
    Recent {
        /// Keep printing arriving leads until interrupted
        #[arg(long)]
        follow: bool,
    },
}

#[derive(Args)]
struct Credentials {
    /// Account email address
    #[arg(short, long)]
    email: String,

    /// Account password
    #[arg(short, long, env = "LEAD_DESK_PASSWORD", hide_env_values = true)]
    password: String,
}

#[derive(Args, Default)]
struct FilterArgs {
    /// Case-insensitive match on name, email or company
    #[arg(long, default_value = "")]
    search: String,

    /// Keep leads in any of these statuses
    #[arg(long = "status", value_parser = parse_status)]
    statuses: Vec<LeadStatus>,

    /// Keep leads from any of these sources
    #[arg(long = "source")]
    sources: Vec<String>,

    /// Created on or after this day (YYYY-MM-DD)
    #[arg(long)]
    from: Option<NaiveDate>,

    /// Created on or before this day (YYYY-MM-DD)
    #[arg(long)]
    to: Option<NaiveDate>,
}

impl From<FilterArgs> for LeadFilters {
    fn from(args: FilterArgs) -> Self {
        LeadFilters {
            search: args.search.trim().to_string(),
            statuses: args.statuses,
            sources: args.sources,
            created_from: args.from,
            created_to: args.to,
        }
    }
}

#[derive(Args)]
struct ImportArgs {
    /// CSV file whose first line holds the column names
    file: PathBuf,

    /// Column mapping as "<csv column>=<field>"; later pairs win
    #[arg(long = "map", value_parser = parse_mapping)]
    mappings: Vec<(String, String)>,
}

#[derive(Subcommand)]
enum LeadAction {
    /// List leads, newest first
    List(FilterArgs),
    /// Move a lead to its next status
    Advance {
        /// Lead id
        id: String,
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// Write the filtered leads to leads-<date>.csv
    Export {
        #[command(flatten)]
        filters: FilterArgs,
        /// Output directory (defaults to EXPORT_DIR)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Import leads from a CSV file
    Import(ImportArgs),
}

#[derive(Subcommand)]
enum CompanyAction {
    /// List one page of companies
    List {
        #[arg(long, default_value_t = 1)]
        page: usize,
        /// One of 10, 50 or 100
        #[arg(long)]
        page_size: Option<usize>,
    },
    /// Import companies from a CSV file
    Import(ImportArgs),
}

fn parse_status(value: &str) -> Result<LeadStatus, String> {
    LeadStatus::parse(value).map_err(|err| err.to_string())
}

fn parse_mapping(value: &str) -> Result<(String, String), String> {
    let (source, field) = value
        .rsplit_once('=')
        .ok_or_else(|| format!("expected \"<csv column>=<field>\", got `{value}`"))?;
    let source = source.trim();
    let field = field.trim();
    if source.is_empty() || field.is_empty() {
        return Err(format!("expected \"<csv column>=<field>\", got `{value}`"));
    }
    Ok((source.to_string(), field.to_string()))
}

pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(dispatch(cli))
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let state = match AppState::initialize().await {
        Ok(state) => state,
        Err(AppError::Config(message)) if matches!(cli.command, Commands::Health) => {
            tracing::warn!(%message, "backend not configured");
            return print_json(&HealthReport::unconfigured(&AppConfig::from_env()));
        }
        Err(err) => return Err(err).context("failed to initialise"),
    };

    match cli.command {
        Commands::Health => print_json(&commands::health(&state)),
        Commands::Signup(credentials) => {
            let outcome =
                commands::sign_up(&state, &credentials.email, &secret(credentials.password))
                    .await?;
            if outcome.confirmation_required {
                eprintln!("Check your email to confirm your account.");
            }
            print_json(&outcome)
        }
        Commands::Signin(credentials) => {
            let user =
                commands::sign_in(&state, &credentials.email, &secret(credentials.password))
                    .await?;
            print_json(&user)
        }
        Commands::Signout => {
            commands::sign_out(&state).await?;
            eprintln!("Signed out.");
            Ok(())
        }
        Commands::Whoami => print_json(&commands::whoami(&state)?),
        Commands::Leads { action } => run_lead_action(&state, action).await,
        Commands::Companies { action } => match action {
            CompanyAction::List { page, page_size } => {
                print_json(&commands::list_companies(&state, page, page_size).await?)
            }
            CompanyAction::Import(args) => {
                let report = commands::import_csv(
                    &state,
                    ImportTarget::Companies,
                    &args.file,
                    &args.mappings,
                )
                .await?;
                print_json(&report)
            }
        },
        Commands::Recent { follow } => run_recent(&state, follow).await,
    }
}

async fn run_lead_action(state: &AppState, action: LeadAction) -> anyhow::Result<()> {
    match action {
        LeadAction::List(filters) => {
            print_json(&commands::list_leads(state, &filters.into()).await?)
        }
        LeadAction::Advance { id, filters } => {
            print_json(&commands::advance_lead_status(state, &filters.into(), &id).await?)
        }
        LeadAction::Export { filters, dir } => {
            let report = commands::export_leads(state, &filters.into(), dir.as_deref()).await?;
            print_json(&report)
        }
        LeadAction::Import(args) => {
            let report =
                commands::import_csv(state, ImportTarget::Leads, &args.file, &args.mappings)
                    .await?;
            print_json(&report)
        }
    }
}

async fn run_recent(state: &AppState, follow: bool) -> anyhow::Result<()> {
    let feed = commands::open_recent_feed(state).await?;
    if let Some(error) = feed.error() {
        eprintln!("{error}");
    }
    let leads = feed.leads();
    if leads.is_empty() {
        eprintln!("{}", feed.empty_message());
    }
    print_json(&leads)?;
    if !follow {
        feed.close().await;
        return Ok(());
    }

    let mut seen: HashSet<_> = leads.into_iter().map(|lead| lead.id).collect();
    let mut arrivals = feed.arrivals();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = arrivals.changed() => {
                if changed.is_err() {
                    break;
                }
                for lead in feed.leads().into_iter().rev() {
                    if seen.insert(lead.id.clone()) {
                        println!("{}", serde_json::to_string(&lead)?);
                    }
                }
            }
        }
    }
    feed.close().await;
    Ok(())
}

fn secret(value: String) -> SecretString {
    SecretString::from(value)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
