// sigmux-cli: operator tool over persisted sigmux accounts
//
// Inspects and repairs the per-account stores the daemon writes: the
// envelope retry queue, identity trust, contacts and groups.

mod accounts;
mod config;

use accounts::{parse_address, AccountDir, OpenAccount};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use sigmux_core::TrustLevel;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "sigmux")]
#[command(about = "sigmux: multi-account Signal daemon tooling", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Manage account directories
    Accounts {
        #[command(subcommand)]
        action: Option<AccountsAction>,
    },
    /// Summarize every account
    Status,
    /// Inspect the envelope retry queue
    Queue {
        account: String,
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Inspect and change identity trust
    Trust {
        account: String,
        #[command(subcommand)]
        action: TrustAction,
    },
    /// List contacts
    Contacts { account: String },
    /// Inspect groups
    Groups {
        account: String,
        #[command(subcommand)]
        action: Option<GroupsAction>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[derive(Subcommand)]
enum AccountsAction {
    List,
    Add {
        uuid: String,
        #[arg(short, long)]
        number: Option<String>,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    List,
    /// Delete one queued envelope by id
    Drop { id: u64 },
}

#[derive(Subcommand)]
enum TrustAction {
    List { peer: Option<String> },
    Set {
        peer: String,
        fingerprint: String,
        /// trusted_verified, trusted_unverified or untrusted
        level: String,
    },
}

#[derive(Subcommand)]
enum GroupsAction {
    List,
    Show { id: String },
}

fn init_logging(config: &config::Config) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let console = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let (file, guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).context("Failed to create log directory")?;
            let appender = tracing_appender::rolling::daily(dir, "sigmux.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .context("Failed to install logger")?;
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = config::Config::load()?;
    let _guard = init_logging(&config)?;
    tracing::debug!(data_dir = ?config.data_dir, "loaded config");

    match cli.command {
        Commands::Config { action } => cmd_config(&mut config, action),
        Commands::Accounts { action } => cmd_accounts(&config, action),
        Commands::Status => cmd_status(&config),
        Commands::Queue { account, action } => cmd_queue(&config, &account, action),
        Commands::Trust { account, action } => cmd_trust(&config, &account, action),
        Commands::Contacts { account } => cmd_contacts(&config, &account),
        Commands::Groups { account, action } => cmd_groups(&config, &account, action),
    }
}

fn open_account(config: &config::Config, account: &str) -> Result<OpenAccount> {
    AccountDir::locate(&config.data_dir()?, account)?.open()
}

fn cmd_config(config: &mut config::Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            println!("{} {} = {}", "✓".green(), key.bright_cyan(), value);
        }
        ConfigAction::Get { key } => match config.get(&key) {
            Some(value) => println!("{}", value),
            None => anyhow::bail!("Unknown or unset config key: {}", key),
        },
        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            for (key, value) in config.list() {
                println!("  {:28} {}", key.bright_cyan(), value);
            }
            println!();
            println!("  {:28} {}", "file".dimmed(), config::Config::config_file()?.display());
        }
    }
    Ok(())
}

fn cmd_accounts(config: &config::Config, action: Option<AccountsAction>) -> Result<()> {
    let data_dir = config.data_dir()?;
    match action {
        None | Some(AccountsAction::List) => {
            let accounts = AccountDir::list(&data_dir)?;
            if accounts.is_empty() {
                println!("{}", "No accounts.".dimmed());
                println!("  Add one: {}", "sigmux accounts add <uuid> --number <+E164>".bright_green());
                return Ok(());
            }
            println!("{}", format!("Accounts ({})", accounts.len()).bold());
            for account in accounts {
                println!("  {}  {}", account.uuid.to_string().bright_cyan(), account.root.display());
            }
        }
        Some(AccountsAction::Add { uuid, number }) => {
            let uuid = Uuid::parse_str(&uuid).context("Account must be a uuid")?;
            if let Some(number) = &number {
                parse_address(number)?;
            }
            let account = AccountDir::create(&data_dir, uuid, number)?;
            println!("{} Account {}", "✓".green(), uuid.to_string().bright_cyan());
            println!("  Store: {}", account.store_path().display());
            println!("  Files: {}", account.paths().root().display());
        }
    }
    Ok(())
}

fn cmd_status(config: &config::Config) -> Result<()> {
    let data_dir = config.data_dir()?;
    println!("{}", "sigmux status".bold());
    println!("  Data dir:       {}", data_dir.display());
    println!("  Receive:        {:?}", config.receive.to_options());
    println!();

    for dir in AccountDir::list(&data_dir)? {
        let account = match dir.open() {
            Ok(account) => account,
            Err(e) => {
                println!("  {} {}  {}", "✗".red(), dir.uuid, format!("{:#}", e).dimmed());
                continue;
            }
        };
        let state = &account.state;
        let queued = state.queue().len()?;
        let untrusted = state
            .all_identities()?
            .iter()
            .filter(|r| !r.trust_level.is_trusted())
            .count();
        let queue_label = if queued > 0 {
            queued.to_string().bright_yellow()
        } else {
            queued.to_string().normal()
        };
        println!("  {}", dir.uuid.to_string().bright_cyan());
        println!("    Queued envelopes:   {}", queue_label);
        println!("    Contacts:           {}", state.contacts()?.len());
        println!(
            "    Groups:             {} legacy, {} versioned",
            state.groups_v1()?.len(),
            state.groups_v2()?.len()
        );
        println!("    Untrusted keys:     {}", untrusted);
    }
    Ok(())
}

fn cmd_queue(config: &config::Config, account: &str, action: QueueAction) -> Result<()> {
    let account = open_account(config, account)?;
    let queue = account.state.queue();
    match action {
        QueueAction::List => {
            println!("{}", format!("Queued envelopes ({})", queue.len()?).bold());
            let mut cursor = None;
            while let Some((id, envelope)) = queue.next_after(cursor)? {
                cursor = Some(id);
                let source = envelope
                    .source
                    .as_ref()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "(sealed)".to_string());
                println!(
                    "  {:>6}  {:?}  from {}  ts {}  {} bytes",
                    id.to_string().bright_cyan(),
                    envelope.kind,
                    source,
                    envelope.timestamp,
                    envelope.content.len()
                );
            }
        }
        QueueAction::Drop { id } => {
            if !queue.pending()?.contains(&id) {
                anyhow::bail!("No queued envelope with id {}", id);
            }
            queue.delete(id)?;
            println!("{} Dropped envelope {}", "✓".green(), id);
        }
    }
    Ok(())
}

fn cmd_trust(config: &config::Config, account: &str, action: TrustAction) -> Result<()> {
    let account = open_account(config, account)?;
    match action {
        TrustAction::List { peer } => {
            let records = match peer {
                Some(peer) => {
                    let peer = account.recipients.resolve(&parse_address(&peer)?)?;
                    account.state.identities(&peer)?
                }
                None => account.state.all_identities()?,
            };
            println!("{}", format!("Identities ({})", records.len()).bold());
            for record in records {
                let level = match record.trust_level {
                    TrustLevel::TrustedVerified => "verified".green(),
                    TrustLevel::TrustedUnverified => "unverified".yellow(),
                    TrustLevel::Untrusted => "untrusted".red(),
                };
                println!(
                    "  {}  {}  {}  added {}",
                    record.address.identifier().bright_cyan(),
                    record.key.fingerprint(),
                    level,
                    record.added
                );
            }
        }
        TrustAction::Set { peer, fingerprint, level } => {
            let level: TrustLevel = level.parse().map_err(anyhow::Error::msg)?;
            let peer = account.recipients.resolve(&parse_address(&peer)?)?;
            let record = account
                .trust
                .identities(&peer)?
                .into_iter()
                .find(|r| r.key.fingerprint().eq_ignore_ascii_case(&fingerprint))
                .with_context(|| format!("No key {} recorded for {}", fingerprint, peer))?;
            account.trust.save(&peer, &record.key, level)?;
            println!("{} {} is now {:?}", "✓".green(), fingerprint.bright_cyan(), level);
        }
    }
    Ok(())
}

fn cmd_contacts(config: &config::Config, account: &str) -> Result<()> {
    let account = open_account(config, account)?;
    let contacts = account.state.contacts()?;
    if contacts.is_empty() {
        println!("{}", "No contacts.".dimmed());
        return Ok(());
    }

    println!("{}", format!("Contacts ({})", contacts.len()).bold());
    for contact in contacts {
        let timer = match contact.message_expiration_time {
            0 => String::new(),
            secs => format!("  expires {}s", secs),
        };
        let flags = if contact.blocked { "  blocked".red().to_string() } else { String::new() };
        println!(
            "  {}  {}{}{}",
            contact.display_name().bright_cyan(),
            contact.address.identifier().dimmed(),
            timer,
            flags
        );
    }
    Ok(())
}

fn cmd_groups(config: &config::Config, account: &str, action: Option<GroupsAction>) -> Result<()> {
    let account = open_account(config, account)?;
    let state = &account.state;
    match action {
        None | Some(GroupsAction::List) => {
            let legacy = state.groups_v1()?;
            let versioned = state.groups_v2()?;
            println!("{}", format!("Groups ({})", legacy.len() + versioned.len()).bold());
            for group in legacy {
                let status = if group.active { "".normal() } else { " (left)".dimmed() };
                println!(
                    "  v1 {}  {}  {} members{}",
                    group.hex_id().bright_cyan(),
                    group.name.as_deref().unwrap_or("(unnamed)"),
                    group.members.len(),
                    status
                );
            }
            for group in versioned {
                println!(
                    "  v2 {}  {}  rev {}  {} members",
                    group.hex_id().bright_cyan(),
                    group.title.as_deref().unwrap_or("(untitled)"),
                    group.revision,
                    group.members.len()
                );
            }
        }
        Some(GroupsAction::Show { id }) => {
            let raw = hex::decode(&id).context("Group id must be hex")?;
            if let Ok(v2_id) = <[u8; 32]>::try_from(raw.as_slice()) {
                let group = state.group_v2(&v2_id)?.context("No such group")?;
                println!("{}", group.title.as_deref().unwrap_or("(untitled)").bold());
                println!("  Revision: {}", group.revision);
                println!("  Timer:    {}s", group.message_expiration_time);
                for member in &group.members {
                    println!("  • {}", member.identifier());
                }
            } else {
                let group = state.group_v1(&raw)?.context("No such group")?;
                println!("{}", group.name.as_deref().unwrap_or("(unnamed)").bold());
                println!("  Active:   {}", group.active);
                println!("  Timer:    {}s", group.message_expiration_time);
                println!("  Avatar:   {}", group.has_avatar);
                for member in &group.members {
                    println!("  • {}", member.identifier());
                }
            }
        }
    }
    Ok(())
}
