use super::*;
use crate::sync::conflict::Resolution;
use crate::sync::planner::{Presence, SyncDirection};
use crate::sync::test_support::MemoryRemote;
use tempfile::{TempDir, tempdir};
use tokio_util::sync::CancellationToken;

fn types() -> Vec<String> {
    vec!["api".into(), "function".into(), "task".into()]
}

struct Fixture {
    dir: TempDir,
    remote: Arc<MemoryRemote>,
    ctx: SyncContext<MemoryRemote>,
}

fn fixture() -> Fixture {
    let dir = tempdir().unwrap();
    let remote = Arc::new(MemoryRemote::new(&types()));
    let store = Arc::new(MirrorStore::new(dir.path()));
    let ctx = SyncContext::new(Arc::clone(&remote), store, types());
    Fixture { dir, remote, ctx }
}

fn login() -> ResourceKey {
    ResourceKey::new("api", "user", "login")
}

/// Local and remote copies of `api/user/login` with the given clocks and scripts.
async fn diverged(fx: &Fixture, local_time: i64, remote_time: i64) -> String {
    let user = fx.remote.add_group("api", "", "user");
    let id = fx
        .remote
        .add_file("api", &user, "login", "return 'remote'", remote_time);
    let mut meta = MirrorFileMeta::from_remote(&login(), &fx.remote.file(&id).unwrap());
    meta.local_update_time = Some(local_time);
    fx.ctx
        .store
        .write_meta(&login(), &meta, WriteOrigin::Remote)
        .await
        .unwrap();
    fx.ctx
        .store
        .write_script(&login(), "return 'local'")
        .await
        .unwrap();
    id
}

#[tokio::test]
async fn newer_local_copy_is_pushed_and_sidecar_takes_server_time() {
    let fx = fixture();
    let id = diverged(&fx, 200, 100).await;
    let cancel = CancellationToken::new();

    let plan = fx.ctx.plan(&cancel).await.unwrap();
    assert_eq!(plan.summary().changed, 1);
    let report = fx.ctx.apply(plan, SyncDirection::Both, &cancel).await;

    assert_eq!(report.pushed, vec![login()]);
    let remote = fx.remote.file(&id).unwrap();
    assert_eq!(remote.script.as_deref(), Some("return 'local'"));
    let meta = fx.ctx.store.read_meta(&login()).await.unwrap().unwrap();
    assert_eq!(meta.update_time, remote.update_time);
    assert!(meta.update_time.unwrap() > 100);
}

#[tokio::test]
async fn equal_clocks_with_different_content_wait_for_a_merge() {
    let fx = fixture();
    let id = diverged(&fx, 150, 150).await;
    let cancel = CancellationToken::new();

    let plan = fx.ctx.plan(&cancel).await.unwrap();
    let report = fx.ctx.apply(plan, SyncDirection::Both, &cancel).await;

    assert_eq!(report.merges, vec![login()]);
    assert!(report.pushed.is_empty() && report.pulled.is_empty());
    assert_eq!(
        fx.remote.file(&id).unwrap().script.as_deref(),
        Some("return 'remote'")
    );
    assert_eq!(
        fx.ctx.store.read_script(&login()).await.unwrap().as_deref(),
        Some("return 'local'")
    );
    let scratch = fx.dir.path().join(".merge/api/user/login.ms");
    assert_eq!(std::fs::read_to_string(&scratch).unwrap(), "return 'remote'");
    assert!(
        fx.dir
            .path()
            .join(".merge-meta/api/user/.login.meta.json")
            .is_file()
    );
}

#[tokio::test]
async fn merged_resolution_updates_both_sides_and_clears_scratch() {
    let fx = fixture();
    let id = diverged(&fx, 150, 150).await;
    let cancel = CancellationToken::new();
    let plan = fx.ctx.plan(&cancel).await.unwrap();
    fx.ctx.apply(plan, SyncDirection::Both, &cancel).await;

    fx.ctx
        .resolve_merge(&login(), Resolution::Merged("return 'merged'".into()))
        .await
        .unwrap();

    assert_eq!(
        fx.remote.file(&id).unwrap().script.as_deref(),
        Some("return 'merged'")
    );
    assert_eq!(
        fx.ctx.store.read_script(&login()).await.unwrap().as_deref(),
        Some("return 'merged'")
    );
    assert!(!fx.dir.path().join(".merge/api/user/login.ms").exists());
    let summary = fx.ctx.plan(&cancel).await.unwrap().summary();
    assert!(summary.is_empty(), "unexpected {summary}");
}

#[tokio::test]
async fn taking_remote_overwrites_the_mirror_copy() {
    let fx = fixture();
    diverged(&fx, 150, 150).await;
    let cancel = CancellationToken::new();
    let plan = fx.ctx.plan(&cancel).await.unwrap();
    fx.ctx.apply(plan, SyncDirection::Both, &cancel).await;

    fx.ctx
        .resolve_merge(&login(), Resolution::TakeRemote)
        .await
        .unwrap();

    assert_eq!(
        fx.ctx.store.read_script(&login()).await.unwrap().as_deref(),
        Some("return 'remote'")
    );
    assert!(!fx.dir.path().join(".merge-meta/api/user/.login.meta.json").exists());
}

#[tokio::test]
async fn missing_groups_are_created_top_down_before_the_file() {
    let fx = fixture();
    let key = ResourceKey::new("api", "billing/invoice", "create");
    fx.ctx
        .store
        .write_script(&key, "return 'ok'")
        .await
        .unwrap();

    let meta = fx.ctx.push(&key).await.unwrap();

    assert_eq!(
        fx.remote.created_groups(),
        vec!["api/billing".to_string(), "api/billing/invoice".to_string()]
    );
    let group = fx.ctx.cache.resolve_id("api/billing/invoice").await.unwrap();
    assert!(group.is_some_and(|id| !id.is_empty()));
    let created = fx.remote.file_at("api", "billing/invoice", "create").unwrap();
    assert_eq!(meta.id, created.id);
    assert!(meta.local_update_time.is_some());
}

#[tokio::test]
async fn pull_only_leaves_local_only_scripts_alone() {
    let fx = fixture();
    let key = ResourceKey::new("api", "user", "draft");
    fx.ctx.store.write_script(&key, "return 0").await.unwrap();
    let cancel = CancellationToken::new();

    let plan = fx.ctx.plan(&cancel).await.unwrap();
    assert_eq!(plan.summary().local_only, 1);
    let report = fx.ctx.apply(plan, SyncDirection::Pull, &cancel).await;

    assert_eq!(report.skipped, 1);
    assert_eq!(fx.remote.file_count(), 0);
    assert!(fx.ctx.store.read_meta(&key).await.unwrap().is_none());
    assert_eq!(fx.ctx.plan(&cancel).await.unwrap().summary().local_only, 1);
}

#[tokio::test]
async fn second_reconciliation_is_a_no_op() {
    let fx = fixture();
    let user = fx.remote.add_group("api", "", "user");
    fx.remote.add_file("api", &user, "login", "return 1", 100);
    fx.remote.add_file("function", "0", "now", "return now()", 100);
    fx.ctx
        .store
        .write_script(&ResourceKey::new("api", "orders", "list"), "return []")
        .await
        .unwrap();
    let cancel = CancellationToken::new();

    let plan = fx.ctx.plan(&cancel).await.unwrap();
    assert_eq!(plan.summary().local_only, 1);
    assert_eq!(plan.summary().remote_only, 2);
    let report = fx.ctx.apply(plan, SyncDirection::Both, &cancel).await;
    assert!(report.is_clean(), "{report:?}");

    let again = fx.ctx.plan(&cancel).await.unwrap();
    assert!(again.summary().is_empty(), "unexpected {}", again.summary());
    assert!(again.entries.is_empty());
}

#[tokio::test]
async fn line_ending_changes_do_not_count_as_changes() {
    let fx = fixture();
    let user = fx.remote.add_group("api", "", "user");
    let id = fx
        .remote
        .add_file("api", &user, "login", "var a = 1\nreturn a\n", 100);
    fx.ctx.cache.refresh().await.unwrap();
    fx.ctx.pull(&login(), &id).await.unwrap();
    fx.ctx
        .store
        .write_script(&login(), "var a = 1\r\nreturn a\r\n")
        .await
        .unwrap();

    let plan = fx.ctx.plan(&CancellationToken::new()).await.unwrap();

    assert!(plan.summary().is_empty());
    assert_eq!(plan.unchanged, 1);
}

#[tokio::test]
async fn pull_materializes_group_sidecars() {
    let fx = fixture();
    let user = fx.remote.add_group("api", "", "user");
    let admin = fx.remote.add_group("api", &user, "admin");
    let id = fx.remote.add_file("api", &admin, "ban", "return 2", 100);
    fx.ctx.cache.refresh().await.unwrap();
    let key = ResourceKey::new("api", "user/admin", "ban");

    let meta = fx.ctx.pull(&key, &id).await.unwrap();

    assert_eq!(meta.local_update_time, None);
    assert_eq!(meta.update_time, Some(100));
    assert_eq!(meta.group_path, "api/user/admin");
    let group = fx
        .ctx
        .store
        .read_group_meta("api", "user/admin")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(group["name"], "admin");
    assert!(fx.ctx.store.read_group_meta("api", "user").await.unwrap().is_some());
}

#[tokio::test]
async fn cancelled_dry_run_has_no_side_effects() {
    let fx = fixture();
    diverged(&fx, 200, 100).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    assert!(matches!(
        fx.ctx.plan(&cancel).await,
        Err(EngineError::Cancelled)
    ));

    let plan = fx.ctx.plan(&CancellationToken::new()).await.unwrap();
    let report = fx.ctx.apply(plan, SyncDirection::Both, &cancel).await;
    assert!(report.cancelled);
    assert!(report.pushed.is_empty());
    assert!(fx.remote.saved_files().is_empty());
}

#[tokio::test]
async fn one_broken_sidecar_does_not_stop_the_batch() {
    let fx = fixture();
    let user = fx.remote.add_group("api", "", "user");
    fx.remote.add_file("api", &user, "login", "return 1", 100);
    fx.ctx.store.write_script(&login(), "return 1").await.unwrap();
    let sidecar = fx.dir.path().join("api/user/.login.meta.json");
    std::fs::write(&sidecar, b"{ broken").unwrap();
    let other = ResourceKey::new("function", "", "helper");
    fx.ctx.store.write_script(&other, "return 3").await.unwrap();
    let cancel = CancellationToken::new();

    let plan = fx.ctx.plan(&cancel).await.unwrap();
    assert_eq!(plan.failures.len(), 1);
    assert_eq!(plan.failures[0].0, login());
    assert!(matches!(plan.entries[0].presence, Presence::LocalOnly));

    let report = fx.ctx.apply(plan, SyncDirection::Both, &cancel).await;
    assert_eq!(report.pushed, vec![other]);
    assert_eq!(report.failures.len(), 1);
}

#[tokio::test]
async fn unreachable_remote_is_reported_not_treated_as_empty() {
    let fx = fixture();
    fx.ctx.store.write_script(&login(), "return 1").await.unwrap();
    fx.remote.set_offline(true);

    let err = fx.ctx.plan(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, EngineError::Cache(CacheError::Remote(_))));
}

#[tokio::test]
async fn invalid_sidecar_blocks_the_push() {
    let fx = fixture();
    let key = ResourceKey::new("task", "", "cleanup");
    fx.ctx.store.write_script(&key, "return 1").await.unwrap();

    let err = fx.ctx.push(&key).await.unwrap_err();

    assert!(matches!(err, EngineError::Invalid(MetaError::MissingField { field: "cron", .. })));
    assert_eq!(fx.remote.file_count(), 0);
}

#[tokio::test]
async fn completion_cache_lands_in_root_meta() {
    let fx = fixture();
    fx.ctx
        .store
        .write_root_meta(&MirrorRootMeta {
            url: "http://localhost:9999/magic/web".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    fx.ctx.refresh_completion_cache().await.unwrap();

    let root = fx.ctx.store.read_root_meta().await.unwrap().unwrap();
    assert_eq!(root.url, "http://localhost:9999/magic/web");
    assert_eq!(root.completion.unwrap().functions, vec!["now".to_string()]);
}

#[tokio::test]
async fn remotely_deleted_resource_is_recreated_on_push() {
    let fx = fixture();
    let user = fx.remote.add_group("api", "", "user");
    let old_id = fx.remote.add_file("api", &user, "login", "return 1", 100);
    fx.ctx.cache.refresh().await.unwrap();
    fx.ctx.pull(&login(), &old_id).await.unwrap();
    fx.remote.delete_file(&old_id).await.unwrap();
    let cancel = CancellationToken::new();

    let plan = fx.ctx.plan(&cancel).await.unwrap();
    assert_eq!(plan.summary().local_only, 1);
    let report = fx.ctx.apply(plan, SyncDirection::Push, &cancel).await;

    assert_eq!(report.pushed, vec![login()]);
    assert!(report.failures.is_empty(), "{report:?}");
    let created = fx.remote.file_at("api", "user", "login").unwrap();
    assert_ne!(created.id.as_deref(), Some(old_id.as_str()));
    let meta = fx.ctx.store.read_meta(&login()).await.unwrap().unwrap();
    assert_eq!(meta.id, created.id);
    let again = fx.ctx.plan(&cancel).await.unwrap();
    assert!(again.summary().is_empty(), "unexpected {}", again.summary());
}

#[tokio::test]
async fn pull_replaces_an_unreadable_sidecar() {
    let fx = fixture();
    let user = fx.remote.add_group("api", "", "user");
    let id = fx.remote.add_file("api", &user, "login", "return 1", 100);
    fx.ctx.cache.refresh().await.unwrap();
    let sidecar = fx.dir.path().join("api/user/.login.meta.json");
    std::fs::create_dir_all(sidecar.parent().unwrap()).unwrap();
    std::fs::write(&sidecar, b"{ broken").unwrap();

    let meta = fx.ctx.pull(&login(), &id).await.unwrap();

    assert_eq!(meta.id.as_deref(), Some(id.as_str()));
    assert_eq!(meta.local_update_time, None);
    let stored = fx.ctx.store.read_meta(&login()).await.unwrap().unwrap();
    assert_eq!(stored.id.as_deref(), Some(id.as_str()));
}

#[tokio::test]
async fn delete_with_an_unreadable_sidecar_resolves_by_path() {
    let fx = fixture();
    let user = fx.remote.add_group("api", "", "user");
    let id = fx.remote.add_file("api", &user, "login", "return 1", 100);
    fx.ctx.cache.refresh().await.unwrap();
    fx.ctx.pull(&login(), &id).await.unwrap();
    std::fs::write(fx.dir.path().join("api/user/.login.meta.json"), b"{ broken").unwrap();

    assert!(fx.ctx.delete_remote(&login()).await.unwrap());

    assert!(fx.remote.file(&id).is_none());
    assert!(!fx.dir.path().join("api/user/.login.meta.json").exists());
}
