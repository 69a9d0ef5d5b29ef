use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{Duration, TimeZone, Utc};
use scanvault_core::{
    audit::{AuditEventKind, TimeWindow},
    clock::{Clock, ManualClock},
    error::DenyReason,
    package::SealedRecord,
    record::{RecordId, RecordKind, ScanRecord, StoredRow},
    storage::{InMemoryBackend, StorageBackend},
    tenant::{LimitKind, Principal, TenantConfig, TenantId, TenantLimits, TenantUpdate, Tier},
    VaultError,
};
use scanvault_engine::{RetentionPolicy, ScanResultStore};
use scanvault_kms::{
    cloud::{CloudKeyProvider, InMemoryKeyService},
    local::LocalKeyProvider,
    ProviderRegistry,
};
use scanvault_storage::RedbBackend;
use serde_json::json;

fn tenant(id: &str) -> TenantId {
    TenantId::parse(id).expect("tenant id")
}

fn clock() -> ManualClock {
    ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 10, 9, 30, 0).unwrap())
}

fn local_registry() -> ProviderRegistry {
    ProviderRegistry::single(Arc::new(LocalKeyProvider::ephemeral()))
}

fn website_scan() -> ScanRecord {
    ScanRecord::new(RecordKind::WebsiteScan)
        .with_field("scan_id", "S1")
        .with_field("url", "https://acme.test")
        .with_field("findings", json!([{"rule": "missing-consent", "severity": "high"}]))
        .with_field("cookies", json!(["_ga=GA1.2.3", "session=secret-token"]))
        .with_field("compliance_score", 72)
}

async fn onboard(store: &ScanResultStore, id: &str, tier: Tier, now: chrono::DateTime<Utc>) {
    store
        .create_tenant(TenantConfig::new(tenant(id), id, tier, now))
        .await
        .expect("create tenant");
}

#[tokio::test]
async fn stored_record_reads_back_only_for_its_tenant() {
    let clock = clock();
    let backend = Arc::new(InMemoryBackend::new());
    let store = ScanResultStore::new(backend.clone(), local_registry(), Arc::new(clock.clone()));
    onboard(&store, "acme", Tier::Starter, clock.now()).await;
    onboard(&store, "globex", Tier::Starter, clock.now()).await;

    let user = Principal::user("alice@acme.test");
    let id = store
        .store(&tenant("acme"), &user, website_scan())
        .await
        .expect("store");

    let record = store.get(&tenant("acme"), &id).await.expect("get");
    assert_eq!(record, website_scan());

    let err = store
        .get(&tenant("globex"), &id)
        .await
        .expect_err("other tenant must not see the row");
    assert!(matches!(err, VaultError::NotFound { .. }));

    let err = store
        .get(&tenant("other_tenant"), &id)
        .await
        .expect_err("unknown tenant");
    assert!(matches!(
        err,
        VaultError::AccessDenied {
            reason: DenyReason::UnknownTenant,
            ..
        }
    ));

    let raw = serde_json::to_string(&backend.raw_row(&tenant("acme"), &id).expect("row"))
        .expect("serialize");
    assert!(!raw.contains("missing-consent"));
    assert!(!raw.contains("secret-token"));
    assert!(raw.contains("https://acme.test"));
}

#[tokio::test]
async fn list_recent_returns_summaries_without_decrypting() {
    let clock = clock();
    let store = ScanResultStore::new(
        Arc::new(InMemoryBackend::new()),
        local_registry(),
        Arc::new(clock.clone()),
    );
    onboard(&store, "acme", Tier::Starter, clock.now()).await;
    let user = Principal::user("alice");

    let old = store
        .store(&tenant("acme"), &user, website_scan())
        .await
        .expect("store");
    clock.advance(Duration::days(10));
    let new = store
        .store(&tenant("acme"), &user, website_scan())
        .await
        .expect("store");

    let recent = store
        .list_recent(&tenant("acme"), 7, Some(&user))
        .await
        .expect("list");
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].record_id, new);
    assert_eq!(recent[0].encrypted_fields, vec!["cookies", "findings"]);
    assert!(!recent[0].fields.contains_key("cookies"));

    let all = store
        .list_recent(&tenant("acme"), 30, None)
        .await
        .expect("list");
    let ids: Vec<RecordId> = all.iter().map(|s| s.record_id).collect();
    assert_eq!(ids, vec![new, old]);
}

#[tokio::test]
async fn scan_quota_blocks_writes_until_raised_or_rolled_over() {
    let clock = clock();
    let store = ScanResultStore::new(
        Arc::new(InMemoryBackend::new()),
        local_registry(),
        Arc::new(clock.clone()),
    );
    store
        .create_tenant(
            TenantConfig::new(tenant("acme"), "Acme", Tier::Free, clock.now())
                .with_limits(TenantLimits::new(None, Some(2), None)),
        )
        .await
        .expect("create");
    let user = Principal::user("alice");

    for _ in 0..2 {
        store
            .store(&tenant("acme"), &user, website_scan())
            .await
            .expect("within quota");
    }
    let err = store
        .store(&tenant("acme"), &user, website_scan())
        .await
        .expect_err("quota reached");
    assert!(matches!(
        err,
        VaultError::AccessDenied {
            reason: DenyReason::OverLimit(LimitKind::Scans),
            ..
        }
    ));
    assert_eq!(
        store.get_usage(&tenant("acme")).await.expect("usage").scans_this_period,
        2
    );

    store
        .update_tenant(
            &tenant("acme"),
            TenantUpdate {
                limits: Some(TenantLimits::new(None, Some(3), None)),
                ..TenantUpdate::default()
            },
        )
        .await
        .expect("raise limit");
    store
        .store(&tenant("acme"), &user, website_scan())
        .await
        .expect("raised quota");
    assert!(store
        .store(&tenant("acme"), &user, website_scan())
        .await
        .is_err());

    clock.set(Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 1).unwrap());
    let usage = store.get_usage(&tenant("acme")).await.expect("usage");
    assert_eq!(usage.scans_this_period, 0);
    assert!(usage.storage_used_bytes > 0);
    store
        .store(&tenant("acme"), &user, website_scan())
        .await
        .expect("new period");
}

#[tokio::test]
async fn suspended_tenant_cannot_read_or_write() {
    let clock = clock();
    let store = ScanResultStore::new(
        Arc::new(InMemoryBackend::new()),
        local_registry(),
        Arc::new(clock.clone()),
    );
    onboard(&store, "acme", Tier::Starter, clock.now()).await;
    let user = Principal::user("alice");
    let id = store
        .store(&tenant("acme"), &user, website_scan())
        .await
        .expect("store");

    store
        .update_tenant(
            &tenant("acme"),
            TenantUpdate {
                status: Some(scanvault_core::tenant::TenantStatus::Suspended),
                ..TenantUpdate::default()
            },
        )
        .await
        .expect("suspend");

    for err in [
        store.get(&tenant("acme"), &id).await.expect_err("read"),
        store
            .store(&tenant("acme"), &user, website_scan())
            .await
            .expect_err("write"),
    ] {
        assert!(matches!(
            err,
            VaultError::AccessDenied {
                reason: DenyReason::TenantInactive,
                ..
            }
        ));
    }

    let denials = store
        .audit(Some(&tenant("acme")), TimeWindow::last_days(clock.now(), 1))
        .await
        .expect("audit")
        .into_iter()
        .filter(|e| e.kind == AuditEventKind::AccessDenied)
        .count();
    assert_eq!(denials, 2);
}

#[tokio::test]
async fn tampered_ciphertext_is_an_integrity_failure() {
    let clock = clock();
    let backend = Arc::new(InMemoryBackend::new());
    let store = ScanResultStore::new(backend.clone(), local_registry(), Arc::new(clock.clone()));
    onboard(&store, "acme", Tier::Starter, clock.now()).await;
    let id = store
        .store(&tenant("acme"), &Principal::user("alice"), website_scan())
        .await
        .expect("store");

    let mut row = backend.raw_row(&tenant("acme"), &id).expect("row");
    let package = row.body.encrypted.get_mut("findings").expect("findings sealed");
    let mut bytes = BASE64
        .decode(&package.data_package.ciphertext)
        .expect("base64");
    bytes[0] ^= 0x01;
    package.data_package.ciphertext = BASE64.encode(bytes);
    backend.import_row(row).expect("import");

    let err = store.get(&tenant("acme"), &id).await.expect_err("tampered");
    match err {
        VaultError::Integrity { record_id, .. } => assert_eq!(record_id, Some(id.to_string())),
        other => panic!("unexpected error: {other:?}"),
    }

    let failures = store
        .audit(Some(&tenant("acme")), TimeWindow::last_days(clock.now(), 1))
        .await
        .expect("audit")
        .into_iter()
        .filter(|e| e.kind == AuditEventKind::IntegrityFailure)
        .count();
    assert_eq!(failures, 1);
}

#[tokio::test]
async fn legacy_rows_read_back_and_are_skipped_by_rotation() {
    let clock = clock();
    let backend = Arc::new(InMemoryBackend::new());
    let store = ScanResultStore::new(backend.clone(), local_registry(), Arc::new(clock.clone()));
    onboard(&store, "acme", Tier::Starter, clock.now()).await;

    let legacy = website_scan();
    let legacy_id = RecordId::new();
    backend
        .import_row(StoredRow {
            tenant_id: tenant("acme"),
            record_id: legacy_id,
            kind: RecordKind::WebsiteScan,
            created_at: clock.now(),
            updated_at: clock.now(),
            body: SealedRecord::legacy(legacy.fields.clone()),
        })
        .expect("import");
    let sealed_id = store
        .store(&tenant("acme"), &Principal::user("alice"), website_scan())
        .await
        .expect("store");

    assert_eq!(
        store.get(&tenant("acme"), &legacy_id).await.expect("legacy"),
        legacy
    );

    let missing = RecordId::new();
    let report = store
        .rotate_records(
            &tenant("acme"),
            &Principal::operator("ops"),
            &[legacy_id, sealed_id, missing],
        )
        .await
        .expect("rotate");
    assert_eq!(report.skipped_legacy, vec![legacy_id]);
    assert_eq!(report.missing, vec![missing]);
    assert_eq!(report.rotated.len(), 1);
    assert!(backend
        .raw_row(&tenant("acme"), &legacy_id)
        .expect("row")
        .body
        .is_legacy());
}

#[tokio::test]
async fn rotation_replaces_every_key_and_keeps_contents() {
    let clock = clock();
    let backend = Arc::new(InMemoryBackend::new());
    let store = ScanResultStore::new(backend.clone(), local_registry(), Arc::new(clock.clone()));
    onboard(&store, "acme", Tier::Starter, clock.now()).await;
    let id = store
        .store(&tenant("acme"), &Principal::user("alice"), website_scan())
        .await
        .expect("store");
    let before = backend.raw_row(&tenant("acme"), &id).expect("row");

    clock.advance(Duration::minutes(5));
    let report = store
        .rotate_records(&tenant("acme"), &Principal::operator("ops"), &[id])
        .await
        .expect("rotate");
    let (rotated_id, keys) = &report.rotated[0];
    assert_eq!(*rotated_id, id);
    assert_eq!(keys.len(), 2);

    let after = backend.raw_row(&tenant("acme"), &id).expect("row");
    assert_eq!(after.created_at, before.created_at);
    assert!(after.updated_at > before.updated_at);
    for key in keys {
        assert_ne!(key.old_key_id, key.new_key_id);
        assert_eq!(
            before.body.encrypted[&key.field].key_id(),
            key.old_key_id.as_str()
        );
        assert_eq!(
            after.body.encrypted[&key.field].key_id(),
            key.new_key_id.as_str()
        );
    }
    assert_eq!(
        store.get(&tenant("acme"), &id).await.expect("get"),
        website_scan()
    );

    let rotations = store
        .audit(Some(&tenant("acme")), TimeWindow::last_days(clock.now(), 1))
        .await
        .expect("audit")
        .into_iter()
        .filter(|e| e.kind == AuditEventKind::KeyRotated)
        .count();
    assert_eq!(rotations, 2);
}

#[tokio::test]
async fn admin_reads_are_elevated_and_audited() {
    let clock = clock();
    let store = ScanResultStore::new(
        Arc::new(InMemoryBackend::new()),
        local_registry(),
        Arc::new(clock.clone()),
    );
    onboard(&store, "acme", Tier::Starter, clock.now()).await;
    let id = store
        .store(&tenant("acme"), &Principal::user("alice"), website_scan())
        .await
        .expect("store");

    let err = store
        .admin_get(&Principal::user("mallory"), "curious", &id)
        .await
        .expect_err("not elevated");
    assert!(matches!(
        err,
        VaultError::AccessDenied {
            reason: DenyReason::ElevationRequired,
            ..
        }
    ));

    let (owner, record) = store
        .admin_get(&Principal::operator("ops"), "support ticket 4411", &id)
        .await
        .expect("admin read");
    assert_eq!(owner, tenant("acme"));
    assert_eq!(record, website_scan());

    let bypasses: Vec<_> = store
        .audit(None, TimeWindow::last_days(clock.now(), 1))
        .await
        .expect("audit")
        .into_iter()
        .filter(|e| e.kind == AuditEventKind::AdminBypass)
        .collect();
    assert_eq!(bypasses.len(), 2);
}

#[tokio::test]
async fn key_service_outage_rejects_the_write() {
    let clock = clock();
    let service = Arc::new(InMemoryKeyService::new("projects/scanvault/keys/records"));
    let cloud = CloudKeyProvider::connect(
        Box::new(service.clone()),
        "projects/scanvault/keys/records",
    )
    .await
    .expect("connect");
    let registry = ProviderRegistry::new(None, Some(Arc::new(cloud))).expect("registry");
    let backend = Arc::new(InMemoryBackend::new());
    let store = ScanResultStore::new(backend, registry, Arc::new(clock.clone()));
    onboard(&store, "acme", Tier::Starter, clock.now()).await;
    let user = Principal::user("alice");

    let id = store
        .store(&tenant("acme"), &user, website_scan())
        .await
        .expect("store while healthy");

    service.set_available(false);
    let err = store
        .store(&tenant("acme"), &user, website_scan())
        .await
        .expect_err("outage");
    assert!(err.is_retryable());
    assert!(!store.health().await.is_healthy());
    assert_eq!(
        store
            .list_recent(&tenant("acme"), 1, None)
            .await
            .expect("list")
            .len(),
        1
    );

    service.set_available(true);
    assert_eq!(
        store.get(&tenant("acme"), &id).await.expect("get"),
        website_scan()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_stores_on_durable_backend_keep_usage_consistent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend: Arc<dyn StorageBackend> =
        Arc::new(RedbBackend::open(&dir.path().join("vault.redb")).expect("open redb"));
    let clock = clock();
    let store = Arc::new(ScanResultStore::new(
        backend,
        local_registry(),
        Arc::new(clock.clone()),
    ));
    onboard(&store, "acme", Tier::Professional, clock.now()).await;
    onboard(&store, "globex", Tier::Professional, clock.now()).await;

    let mut handles = Vec::new();
    for i in 0..24 {
        let store = store.clone();
        let owner = if i % 2 == 0 { "acme" } else { "globex" };
        handles.push(tokio::spawn(async move {
            let id = store
                .store(&tenant(owner), &Principal::user("worker"), website_scan())
                .await
                .expect("store");
            (owner, id)
        }));
    }
    let mut written = Vec::new();
    for handle in handles {
        written.push(handle.await.expect("join"));
    }

    for owner in ["acme", "globex"] {
        let usage = store.get_usage(&tenant(owner)).await.expect("usage");
        assert_eq!(usage.scans_this_period, 12);
        let listed = store
            .list_recent(&tenant(owner), 1, None)
            .await
            .expect("list");
        assert_eq!(listed.len(), 12);
    }
    for (owner, id) in written {
        assert_eq!(
            store.get(&tenant(owner), &id).await.expect("get"),
            website_scan()
        );
    }
}

#[tokio::test]
async fn audit_retention_prunes_old_entries_only() {
    let clock = clock();
    let store = ScanResultStore::new(
        Arc::new(InMemoryBackend::new()),
        local_registry(),
        Arc::new(clock.clone()),
    );
    onboard(&store, "acme", Tier::Starter, clock.now()).await;
    clock.advance(Duration::days(100));
    store
        .store(&tenant("acme"), &Principal::user("alice"), website_scan())
        .await
        .expect("store");

    let removed = store
        .prune_audit(&RetentionPolicy::from_days(90))
        .await
        .expect("prune");
    assert_eq!(removed, 1);
    let left = store
        .audit(Some(&tenant("acme")), TimeWindow::last_days(clock.now(), 365))
        .await
        .expect("audit");
    assert!(left.iter().all(|e| e.kind != AuditEventKind::TenantCreated));
    assert!(left.iter().any(|e| e.kind == AuditEventKind::RecordStored));
}
