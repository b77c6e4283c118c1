//! Two devices of one user syncing through an in-process server.

use chrono::{Duration, NaiveDate};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

use super::{run_cycle, CollectionRegistry, CycleReport, LocalTransport, MergeKind, SyncContext, SyncOptions};
use crate::clock::{Clock, ManualClock};
use crate::db::LocalStore;
use crate::models::{FoodItem, MealLog, MealType, WeightEntry, MEAL_LOGS};
use crate::server::{ReconciliationService, ServerStorage};
use crate::SyncError;

struct Device {
    ctx: SyncContext,
    transport: LocalTransport,
    path: PathBuf,
}

impl Device {
    async fn sync(&self) -> Result<CycleReport, SyncError> {
        run_cycle(&self.ctx, &self.transport, &SyncOptions::default()).await
    }

    async fn item_calories(&self, log_id: &str) -> Vec<(String, f64)> {
        let entry = self.ctx.meal_logs().get(log_id).await.unwrap().unwrap();
        entry
            .log
            .live_items()
            .map(|i| (i.id.clone(), i.calories))
            .collect()
    }
}

struct World {
    service: Arc<ReconciliationService>,
    clock: Arc<ManualClock>,
    registry: CollectionRegistry,
    temp: TempDir,
}

impl World {
    fn new(registry: CollectionRegistry) -> Self {
        let temp = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::at_secs(0));
        let service = Arc::new(ReconciliationService::new(
            ServerStorage::new(temp.path().join("server")),
            registry.clone(),
            clock.clone(),
        ));
        Self {
            service,
            clock,
            registry,
            temp,
        }
    }

    async fn device(&self, name: &str) -> Device {
        let path = self.temp.path().join(format!("{}.db", name));
        self.open(path).await
    }

    async fn open(&self, path: PathBuf) -> Device {
        let store = LocalStore::open(&path).await.unwrap();
        let ctx = SyncContext::open(store, self.clock.clone(), self.registry.clone())
            .await
            .unwrap();
        Device {
            ctx,
            transport: LocalTransport::new(self.service.clone(), "alice"),
            path,
        }
    }

    fn at(&self, secs: i64) {
        self.clock.set_secs(secs);
    }
}

fn breakfast(item: FoodItem) -> MealLog {
    MealLog::new(NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(), MealType::Breakfast)
        .with_items(vec![item])
}

/// X creates a log with one item; Y picks it up, adds a second item and
/// syncs; X, still on the first version, edits the first item and syncs.
async fn diverge(world: &World) -> (Device, Device, String) {
    let x = world.device("x").await;
    let y = world.device("y").await;

    world.at(10);
    let created = x
        .ctx
        .meal_logs()
        .create(breakfast(
            FoodItem::new("oats", 100.0, world.clock.now()).with_id("i1"),
        ))
        .await
        .unwrap();
    x.sync().await.unwrap();

    world.at(12);
    y.sync().await.unwrap();
    assert_eq!(y.ctx.meal_logs().get(&created.id).await.unwrap().unwrap().version, 1);

    world.at(18);
    y.ctx
        .meal_logs()
        .add_item(
            &created.id,
            FoodItem::new("toast", 50.0, world.clock.now()).with_id("i2"),
        )
        .await
        .unwrap();
    y.sync().await.unwrap();

    world.at(20);
    x.ctx
        .meal_logs()
        .edit_item(&created.id, "i1", |item| item.calories = 150.0)
        .await
        .unwrap();
    (x, y, created.id)
}

#[tokio::test]
async fn test_created_log_reaches_other_device() {
    let world = World::new(CollectionRegistry::default());
    let x = world.device("x").await;
    let y = world.device("y").await;

    world.at(10);
    let created = x
        .ctx
        .meal_logs()
        .create(breakfast(FoodItem::new("oats", 100.0, world.clock.now())))
        .await
        .unwrap();
    let report = x.sync().await.unwrap();
    assert_eq!(report.push.applied, 1);

    world.at(12);
    y.sync().await.unwrap();

    let seen = y.ctx.meal_logs().get(&created.id).await.unwrap().unwrap();
    assert_eq!(seen.version, 1);
    assert!(!seen.pending_sync);
    assert_eq!(seen.log.totals.calories, 100.0);
}

#[tokio::test]
async fn test_concurrent_item_edits_are_merged() {
    let world = World::new(CollectionRegistry::default());
    let (x, y, log_id) = diverge(&world).await;

    let report = x.sync().await.unwrap();
    assert_eq!(report.push.conflicts, 1);
    assert_eq!(report.push.merged, 1);
    assert!(x.ctx.store().queue().is_empty().await.unwrap());

    world.at(22);
    y.sync().await.unwrap();

    let expected = vec![("i1".to_string(), 150.0), ("i2".to_string(), 50.0)];
    assert_eq!(x.item_calories(&log_id).await, expected);
    assert_eq!(y.item_calories(&log_id).await, expected);

    let on_x = x.ctx.store().get(MEAL_LOGS, &log_id).await.unwrap().unwrap();
    let on_y = y.ctx.store().get(MEAL_LOGS, &log_id).await.unwrap().unwrap();
    assert_eq!(on_x.document.version, 3);
    assert_eq!(on_x.document, on_y.document);
    assert_eq!(
        y.ctx.meal_logs().get(&log_id).await.unwrap().unwrap().log.totals.calories,
        200.0
    );
}

#[tokio::test]
async fn test_whole_document_lww_drops_concurrent_item() {
    let registry = CollectionRegistry::default().register(MEAL_LOGS, MergeKind::Lww);
    let world = World::new(registry);
    let (x, y, log_id) = diverge(&world).await;

    let report = x.sync().await.unwrap();
    assert_eq!(report.push.merged, 0);

    world.at(22);
    y.sync().await.unwrap();

    let expected = vec![("i1".to_string(), 150.0)];
    assert_eq!(x.item_calories(&log_id).await, expected);
    assert_eq!(y.item_calories(&log_id).await, expected);
}

#[tokio::test]
async fn test_converged_devices_stay_quiet() {
    let world = World::new(CollectionRegistry::default());
    let (x, y, log_id) = diverge(&world).await;
    x.sync().await.unwrap();
    world.at(22);
    y.sync().await.unwrap();
    let before = y.ctx.store().get(MEAL_LOGS, &log_id).await.unwrap();

    world.at(30);
    for device in [&x, &y] {
        let report = device.sync().await.unwrap();
        assert_eq!(report.push.pushed, 0);
        assert_eq!(report.pull.applied, 0);
    }
    assert_eq!(y.ctx.store().get(MEAL_LOGS, &log_id).await.unwrap(), before);
}

#[tokio::test]
async fn test_versions_only_move_forward() {
    let world = World::new(CollectionRegistry::default());
    let x = world.device("x").await;
    let y = world.device("y").await;

    world.at(10);
    let id = x
        .ctx
        .meal_logs()
        .create(breakfast(FoodItem::new("oats", 100.0, world.clock.now())))
        .await
        .unwrap()
        .id;
    x.sync().await.unwrap();

    let mut seen = Vec::new();
    for (step, writer) in [&x, &y, &x, &y].into_iter().enumerate() {
        let secs = 20 + step as i64 * 10;
        world.at(secs);
        writer.sync().await.unwrap();
        writer
            .ctx
            .meal_logs()
            .add_item(&id, FoodItem::new(format!("snack {}", step), 10.0, world.clock.now()))
            .await
            .unwrap();
        writer.sync().await.unwrap();

        world.clock.advance(Duration::seconds(1));
        y.sync().await.unwrap();
        seen.push(y.ctx.store().get(MEAL_LOGS, &id).await.unwrap().unwrap().document.version);
    }

    assert!(seen.windows(2).all(|w| w[0] < w[1]), "versions went back: {:?}", seen);
    assert_eq!(y.item_calories(&id).await.len(), 5);
}

#[tokio::test]
async fn test_deletion_propagates_as_tombstone() {
    let world = World::new(CollectionRegistry::default());
    let x = world.device("x").await;
    let y = world.device("y").await;

    world.at(10);
    let id = x
        .ctx
        .meal_logs()
        .create(breakfast(FoodItem::new("oats", 100.0, world.clock.now())))
        .await
        .unwrap()
        .id;
    x.sync().await.unwrap();
    world.at(11);
    y.sync().await.unwrap();

    world.at(15);
    x.ctx.meal_logs().delete(&id).await.unwrap();
    x.sync().await.unwrap();

    world.at(16);
    let report = y.sync().await.unwrap();
    assert_eq!(report.pull.applied, 1);

    assert!(y.ctx.meal_logs().get(&id).await.unwrap().is_none());
    let tombstone = y.ctx.store().get(MEAL_LOGS, &id).await.unwrap().unwrap();
    assert!(tombstone.is_deleted());
    assert_eq!(tombstone.document.version, 2);

    // Editing a deleted log is refused locally.
    let err = y
        .ctx
        .meal_logs()
        .add_item(&id, FoodItem::new("late", 1.0, world.clock.now()))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::UnknownDocument { .. }));
}

#[tokio::test]
async fn test_stale_weight_edit_loses_to_server() {
    let world = World::new(CollectionRegistry::default());
    let x = world.device("x").await;
    let y = world.device("y").await;
    let date = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();

    world.at(30);
    let id = x.ctx.weights().record(&WeightEntry::new(date, 70.0)).await.unwrap();
    x.sync().await.unwrap();
    world.at(31);
    y.sync().await.unwrap();

    world.at(32);
    y.ctx.weights().update(&id, &WeightEntry::new(date, 71.0)).await.unwrap();
    world.at(34);
    x.ctx.weights().update(&id, &WeightEntry::new(date, 72.0)).await.unwrap();

    // The server stamps Y's write at 36, after X's offline edit.
    world.at(36);
    y.sync().await.unwrap();
    world.at(38);
    let report = x.sync().await.unwrap();

    assert_eq!(report.push.conflicts, 1);
    assert!(x.ctx.store().queue().is_empty().await.unwrap());
    assert_eq!(x.ctx.weights().get(&id).await.unwrap().unwrap().kilograms, 71.0);

    // A fresh edit made after the server's copy wins.
    world.at(40);
    x.ctx.weights().update(&id, &WeightEntry::new(date, 72.5)).await.unwrap();
    x.sync().await.unwrap();
    world.at(41);
    y.sync().await.unwrap();
    assert_eq!(y.ctx.weights().get(&id).await.unwrap().unwrap().kilograms, 72.5);
}

#[tokio::test]
async fn test_offline_edits_survive_restart() {
    let world = World::new(CollectionRegistry::default());
    let x = world.device("x").await;
    let date = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();

    world.at(10);
    x.transport.set_reachable(false);
    let id = x.ctx.weights().record(&WeightEntry::new(date, 70.0)).await.unwrap();
    let err = x.sync().await.unwrap_err();
    assert!(matches!(err, SyncError::NetworkUnavailable(_)));

    let device_id = x.ctx.device_id().to_string();
    x.ctx.store().pool().close().await;
    let reopened = world.open(x.path.clone()).await;

    assert_eq!(reopened.ctx.device_id(), device_id);
    assert_eq!(reopened.ctx.store().queue().len().await.unwrap(), 1);
    assert!(reopened.ctx.weights().get(&id).await.unwrap().is_some());

    world.at(20);
    let report = reopened.sync().await.unwrap();
    assert_eq!(report.push.applied, 1);

    let y = world.device("y").await;
    y.sync().await.unwrap();
    assert_eq!(y.ctx.weights().get(&id).await.unwrap().unwrap().kilograms, 70.0);
}

#[tokio::test]
async fn test_merge_preserves_item_removed_on_other_device() {
    let world = World::new(CollectionRegistry::default());
    let (x, y, log_id) = diverge(&world).await;
    x.sync().await.unwrap();
    world.at(22);
    y.sync().await.unwrap();

    // Y removes the toast while X, not yet synced, adds coffee.
    world.at(24);
    y.ctx.meal_logs().remove_item(&log_id, "i2").await.unwrap();
    world.at(25);
    x.ctx
        .meal_logs()
        .add_item(
            &log_id,
            FoodItem::new("coffee", 5.0, world.clock.now()).with_id("i3"),
        )
        .await
        .unwrap();

    world.at(26);
    y.sync().await.unwrap();
    world.at(27);
    x.sync().await.unwrap();
    world.at(28);
    y.sync().await.unwrap();

    let expected = vec![("i1".to_string(), 150.0), ("i3".to_string(), 5.0)];
    assert_eq!(x.item_calories(&log_id).await, expected);
    assert_eq!(y.item_calories(&log_id).await, expected);
}
