use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use scanvault_core::{
    record::RecordKind,
    tenant::{TenantStatus, Tier},
};

/// Operator CLI for the ScanVault store.
#[derive(Parser, Debug)]
#[command(
    name = "scanvault",
    about = "Tenant-isolated, encrypted storage for compliance scan results",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Config file to use instead of the platform default.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print version and exit.
    Version,
    /// Check the storage backend and every configured key provider.
    Health,
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Manage the local master secret.
    #[command(subcommand)]
    Keys(KeysCommand),
    /// Onboard and administer tenants.
    #[command(subcommand)]
    Tenant(TenantCommand),
    /// Store a scan result read from a JSON file (`-` for stdin).
    Store {
        #[arg(long)]
        tenant: String,
        #[arg(long, value_enum)]
        kind: KindArg,
        #[arg(long, default_value = "cli")]
        principal: String,
        file: PathBuf,
    },
    /// Fetch and decrypt one record.
    Get {
        #[arg(long)]
        tenant: String,
        record_id: String,
    },
    /// Fetch a record from any tenant. Requires an operator and is audited.
    AdminGet {
        #[arg(long)]
        operator: String,
        #[arg(long)]
        reason: String,
        record_id: String,
    },
    /// List recent record summaries for a tenant.
    List {
        #[arg(long)]
        tenant: String,
        #[arg(long, default_value_t = 30)]
        days: u32,
    },
    /// Show audit entries.
    Audit {
        #[arg(long)]
        tenant: Option<String>,
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
    /// Re-encrypt records with fresh data keys.
    Rotate {
        #[arg(long)]
        tenant: String,
        #[arg(long, default_value = "cli")]
        principal: String,
        #[arg(required = true)]
        record_ids: Vec<String>,
    },
    /// Delete audit entries older than the configured retention.
    Prune,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum KeysCommand {
    /// Create a random master secret in the OS keyring if none exists.
    Init {
        #[arg(long, default_value = "scanvault")]
        service: String,
        #[arg(long, default_value = "master-secret")]
        account: String,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum TenantCommand {
    Create {
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long, value_enum, default_value_t = TierArg::Free)]
        tier: TierArg,
        #[arg(long)]
        residency: Option<String>,
    },
    Show {
        id: String,
    },
    List,
    Usage {
        id: String,
    },
    Update(TenantUpdateArgs),
    /// Reset the scan counter and start a new usage period now.
    NewPeriod {
        id: String,
    },
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct TenantUpdateArgs {
    pub id: String,
    #[arg(long)]
    pub name: Option<String>,
    #[arg(long, value_enum)]
    pub tier: Option<TierArg>,
    #[arg(long, value_enum)]
    pub status: Option<StatusArg>,
    #[arg(long)]
    pub max_users: Option<u64>,
    #[arg(long)]
    pub max_scans: Option<u64>,
    #[arg(long)]
    pub max_storage_bytes: Option<u64>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierArg {
    Free,
    Starter,
    Professional,
    Enterprise,
}

impl From<TierArg> for Tier {
    fn from(arg: TierArg) -> Self {
        match arg {
            TierArg::Free => Tier::Free,
            TierArg::Starter => Tier::Starter,
            TierArg::Professional => Tier::Professional,
            TierArg::Enterprise => Tier::Enterprise,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusArg {
    Active,
    Suspended,
    Deactivated,
}

impl From<StatusArg> for TenantStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Active => TenantStatus::Active,
            StatusArg::Suspended => TenantStatus::Suspended,
            StatusArg::Deactivated => TenantStatus::Deactivated,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindArg {
    WebsiteScan,
    AiModelScan,
    Soc2Assessment,
    PiiScan,
}

impl From<KindArg> for RecordKind {
    fn from(arg: KindArg) -> Self {
        match arg {
            KindArg::WebsiteScan => RecordKind::WebsiteScan,
            KindArg::AiModelScan => RecordKind::AiModelScan,
            KindArg::Soc2Assessment => RecordKind::Soc2Assessment,
            KindArg::PiiScan => RecordKind::PiiScan,
        }
    }
}
