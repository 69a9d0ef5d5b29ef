use std::{fs, io::Read, path::Path};

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use scanvault_core::{
    audit::TimeWindow,
    record::{RecordId, ScanRecord},
    tenant::{Principal, TenantConfig, TenantId, TenantLimits, TenantUpdate, Tier},
    VaultError,
};
use scanvault_engine::{RetentionPolicy, ScanResultStore};
use serde::Serialize;
use serde_json::Value;

use crate::{
    cli::{Command, TenantCommand, TenantUpdateArgs},
    config::Config,
};

fn vault(err: VaultError) -> color_eyre::Report {
    eyre!(err.to_string())
}

fn tenant_id(raw: &str) -> Result<TenantId> {
    TenantId::parse(raw).map_err(vault)
}

fn record_id(raw: &str) -> Result<RecordId> {
    RecordId::parse(raw).map_err(vault)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Execute a data or tenant subcommand against an opened store.
pub async fn handle(command: Command, store: &ScanResultStore, config: &Config) -> Result<()> {
    match command {
        Command::Tenant(cmd) => handle_tenant(cmd, store).await?,
        Command::Store {
            tenant,
            kind,
            principal,
            file,
        } => {
            let record = ScanRecord::from_json(kind.into(), read_json(&file)?).map_err(vault)?;
            let id = store
                .store(&tenant_id(&tenant)?, &Principal::user(principal), record)
                .await
                .map_err(vault)?;
            println!("Stored record {id}");
        }
        Command::Get { tenant, record_id: id } => {
            let record = store
                .get(&tenant_id(&tenant)?, &record_id(&id)?)
                .await
                .map_err(vault)?;
            print_json(&record)?;
        }
        Command::AdminGet {
            operator,
            reason,
            record_id: id,
        } => {
            let (owner, record) = store
                .admin_get(&Principal::operator(operator), &reason, &record_id(&id)?)
                .await
                .map_err(vault)?;
            println!("tenant: {owner}");
            print_json(&record)?;
        }
        Command::List { tenant, days } => {
            let summaries = store
                .list_recent(&tenant_id(&tenant)?, days, None)
                .await
                .map_err(vault)?;
            if summaries.is_empty() {
                println!("No records in the last {days} days.");
                return Ok(());
            }
            for summary in summaries {
                println!(
                    "{} [{}] {}",
                    summary.record_id,
                    summary.kind.as_str(),
                    summary.created_at.to_rfc3339()
                );
                if !summary.encrypted_fields.is_empty() {
                    println!("    encrypted: {}", summary.encrypted_fields.join(", "));
                }
            }
        }
        Command::Audit { tenant, days } => {
            let tenant = tenant.as_deref().map(tenant_id).transpose()?;
            let entries = store
                .audit(tenant.as_ref(), TimeWindow::last_days(Utc::now(), days))
                .await
                .map_err(vault)?;
            for entry in entries {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
        Command::Rotate {
            tenant,
            principal,
            record_ids,
        } => {
            let ids = record_ids
                .iter()
                .map(|raw| record_id(raw))
                .collect::<Result<Vec<_>>>()?;
            let report = store
                .rotate_records(&tenant_id(&tenant)?, &Principal::operator(principal), &ids)
                .await
                .map_err(vault)?;
            for (id, keys) in &report.rotated {
                println!("rotated {id} ({} keys)", keys.len());
            }
            for id in &report.skipped_legacy {
                println!("skipped {id} (legacy plaintext)");
            }
            for id in &report.missing {
                println!("missing {id}");
            }
        }
        Command::Prune => {
            let policy = RetentionPolicy::from_days(config.audit.retention_days);
            let removed = store.prune_audit(&policy).await.map_err(vault)?;
            println!(
                "Pruned {removed} audit entries older than {} days",
                config.audit.retention_days
            );
        }
        Command::Health => {
            let report = store.health().await;
            match &report.storage_error {
                None => println!("Storage ({}): ok", report.storage_backend),
                Some(err) => println!("Storage ({}): {err}", report.storage_backend),
            }
            for provider in &report.providers {
                println!(
                    "Key provider {}{}: {}",
                    provider.name,
                    if provider.active { " (active)" } else { "" },
                    if provider.available { "ok" } else { "unavailable" }
                );
            }
            if !report.is_healthy() {
                color_eyre::eyre::bail!("health check failed");
            }
        }
        Command::Version | Command::Config(_) | Command::Keys(_) => {
            return Err(eyre!("command does not use the store"));
        }
    }
    Ok(())
}

async fn handle_tenant(cmd: TenantCommand, store: &ScanResultStore) -> Result<()> {
    match cmd {
        TenantCommand::Create {
            id,
            name,
            tier,
            residency,
        } => {
            let mut config = TenantConfig::new(tenant_id(&id)?, name, tier.into(), Utc::now());
            if let Some(residency) = residency {
                config = config.with_residency(residency);
            }
            let created = store.create_tenant(config).await.map_err(vault)?;
            println!("Created tenant {} ({:?})", created.tenant_id, created.tier);
        }
        TenantCommand::Show { id } => {
            let config = store
                .registry()
                .require_tenant(&tenant_id(&id)?)
                .await
                .map_err(vault)?;
            print_json(&config)?;
        }
        TenantCommand::List => {
            let tenants = store.registry().list_tenants().await.map_err(vault)?;
            if tenants.is_empty() {
                println!("No tenants yet. Add one with `scanvault tenant create <id> --name <name>`.");
                return Ok(());
            }
            for tenant in tenants {
                println!(
                    "{} [{:?}/{:?}] {}",
                    tenant.tenant_id, tenant.tier, tenant.status, tenant.display_name
                );
            }
        }
        TenantCommand::Usage { id } => {
            let usage = store.get_usage(&tenant_id(&id)?).await.map_err(vault)?;
            print_json(&usage)?;
        }
        TenantCommand::Update(args) => {
            let id = tenant_id(&args.id)?;
            let current = store.registry().require_tenant(&id).await.map_err(vault)?;
            let updated = store
                .update_tenant(&id, tenant_update(args, current.limits))
                .await
                .map_err(vault)?;
            print_json(&updated)?;
        }
        TenantCommand::NewPeriod { id } => {
            let usage = store
                .registry()
                .start_new_period(&tenant_id(&id)?)
                .await
                .map_err(vault)?;
            println!("New period started at {}", usage.period_start.to_rfc3339());
        }
    }
    Ok(())
}

/// Build an update from CLI flags. Individual limit flags override the
/// current limits (or the new tier's defaults when `--tier` is given).
fn tenant_update(args: TenantUpdateArgs, current: TenantLimits) -> TenantUpdate {
    let tier: Option<Tier> = args.tier.map(Into::into);
    let limits = if args.max_users.is_some()
        || args.max_scans.is_some()
        || args.max_storage_bytes.is_some()
    {
        let base = tier.map(|t| t.default_limits()).unwrap_or(current);
        Some(TenantLimits::new(
            args.max_users.or(base.max_users),
            args.max_scans.or(base.max_scans_per_period),
            args.max_storage_bytes.or(base.max_storage_bytes),
        ))
    } else {
        None
    };
    TenantUpdate {
        display_name: args.name,
        tier,
        limits,
        status: args.status.map(Into::into),
        ..TenantUpdate::default()
    }
}

fn read_json(path: &Path) -> Result<Value> {
    let raw = if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        fs::read_to_string(path)?
    };
    Ok(serde_json::from_str(&raw)?)
}
