//! End-to-end pipeline tests over the in-memory adapters.
//!
//! Commands append to the event log, a background consumer applies the
//! events to the projection, and queries observe the projection catch
//! up. Consistency is eventual, so assertions poll with a deadline
//! instead of reading immediately after a write.

use modsub::command::SubscriptionCommands;
use modsub::consumer::{ConsumerExit, SubscriptionConsumer};
use modsub::dispatch::EventDispatcher;
use modsub::log::EventLog;
use modsub::store::{ProjectionStore, SubscriptionRow};
use modsub::types::{CursorName, ModId, StreamId, UserId};
use modsub_memory::{InMemoryEventLog, InMemoryProjectionStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct Pipeline {
    log: Arc<InMemoryEventLog>,
    store: Arc<InMemoryProjectionStore>,
    commands: SubscriptionCommands,
    shutdown: watch::Sender<()>,
    consumer: JoinHandle<Result<ConsumerExit, modsub::consumer::ConsumerError>>,
}

impl Pipeline {
    fn start() -> Self {
        let log = Arc::new(InMemoryEventLog::new());
        let store = Arc::new(InMemoryProjectionStore::new());

        let commands = SubscriptionCommands::new(
            Arc::clone(&log) as Arc<dyn EventLog>,
            Arc::clone(&store) as Arc<dyn ProjectionStore>,
        );

        let consumer = SubscriptionConsumer::new(
            Arc::clone(&log) as Arc<dyn EventLog>,
            EventDispatcher::new(Arc::clone(&store) as Arc<dyn ProjectionStore>),
            CursorName::try_new("subscription-projection").unwrap(),
        );

        let (shutdown, rx) = watch::channel(());
        let consumer = tokio::spawn(async move { consumer.run(rx).await });

        Self {
            log,
            store,
            commands,
            shutdown,
            consumer,
        }
    }

    async fn stop(self) -> ConsumerExit {
        self.shutdown.send(()).unwrap();
        self.consumer.await.unwrap().unwrap()
    }

    /// Polls the projection until `predicate` holds or a deadline passes.
    async fn wait_for_rows<F>(&self, user: &UserId, predicate: F) -> Vec<SubscriptionRow>
    where
        F: Fn(&[SubscriptionRow]) -> bool,
    {
        let deadline = Duration::from_secs(5);
        let poll = Duration::from_millis(10);
        let result = tokio::time::timeout(deadline, async {
            loop {
                let rows = self.store.query_by_user(user).await.unwrap();
                if predicate(&rows) {
                    return rows;
                }
                tokio::time::sleep(poll).await;
            }
        })
        .await;
        result.expect("projection did not reach the expected state in time")
    }
}

fn user(raw: &str) -> UserId {
    UserId::try_new(raw).unwrap()
}

fn module(raw: &str) -> ModId {
    ModId::try_new(raw).unwrap()
}

#[tokio::test]
async fn added_subscription_becomes_visible_to_queries() {
    let pipeline = Pipeline::start();
    let u = user("alice");

    pipeline
        .commands
        .add_subscription(u.clone(), module("terrain-pack"))
        .await
        .unwrap();

    let rows = pipeline.wait_for_rows(&u, |rows| rows.len() == 1).await;
    assert_eq!(rows[0].user_id, u);
    assert_eq!(rows[0].mod_id.as_ref(), "terrain-pack");

    assert_eq!(pipeline.stop().await, ConsumerExit::Cancelled);
}

#[tokio::test]
async fn removed_subscription_disappears_from_queries() {
    let pipeline = Pipeline::start();
    let u = user("alice");
    let m = module("terrain-pack");

    pipeline
        .commands
        .add_subscription(u.clone(), m.clone())
        .await
        .unwrap();
    pipeline.wait_for_rows(&u, |rows| rows.len() == 1).await;

    pipeline
        .commands
        .remove_subscription(u.clone(), m.clone())
        .await
        .unwrap();
    pipeline.wait_for_rows(&u, <[SubscriptionRow]>::is_empty).await;

    // Removal is a soft delete: the row is retained but invisible.
    assert!(pipeline.store.is_soft_deleted(&u, &m));
    pipeline.stop().await;
}

#[tokio::test]
async fn duplicate_adds_collapse_to_one_row() {
    let pipeline = Pipeline::start();
    let u = user("alice");
    let m = module("terrain-pack");

    for _ in 0..3 {
        pipeline
            .commands
            .add_subscription(u.clone(), m.clone())
            .await
            .unwrap();
    }

    // Three events on the stream, one row in the projection, and the
    // audit marker points at the newest applied event.
    let rows = pipeline
        .wait_for_rows(&u, |rows| {
            rows.len() == 1 && u64::from(rows[0].last_event_id) == 3
        })
        .await;
    assert_eq!(rows[0].mod_id, m);
    assert_eq!(pipeline.log.len(), 3);

    pipeline.stop().await;
}

#[tokio::test]
async fn subscriptions_are_isolated_per_user() {
    let pipeline = Pipeline::start();
    let alice = user("alice");
    let bob = user("bob");

    pipeline
        .commands
        .add_subscription(alice.clone(), module("terrain-pack"))
        .await
        .unwrap();
    pipeline
        .commands
        .add_subscription(bob.clone(), module("shader-kit"))
        .await
        .unwrap();
    pipeline
        .commands
        .remove_subscription(bob.clone(), module("shader-kit"))
        .await
        .unwrap();

    pipeline.wait_for_rows(&alice, |rows| rows.len() == 1).await;
    pipeline.wait_for_rows(&bob, <[SubscriptionRow]>::is_empty).await;

    let alice_rows = pipeline.commands.subscriptions_by_user(&alice).await.unwrap();
    assert_eq!(alice_rows.len(), 1);
    assert_eq!(alice_rows[0].mod_id.as_ref(), "terrain-pack");

    pipeline.stop().await;
}

#[tokio::test]
async fn unrecognized_event_type_does_not_stall_the_pipeline() {
    let pipeline = Pipeline::start();
    let u = user("alice");

    // An event type the dispatcher does not understand, appended
    // directly to the user's stream.
    pipeline
        .log
        .append(
            &StreamId::try_new("subscription-alice").unwrap(),
            "SUBSCRIPTION_PAUSED",
            serde_json::to_vec(&serde_json::json!({ "ModID": "m1" })).unwrap(),
        )
        .await
        .unwrap();

    pipeline
        .commands
        .add_subscription(u.clone(), module("terrain-pack"))
        .await
        .unwrap();

    // The unknown event is skipped and the later event still applies.
    let rows = pipeline.wait_for_rows(&u, |rows| rows.len() == 1).await;
    assert_eq!(rows[0].mod_id.as_ref(), "terrain-pack");

    pipeline.stop().await;
}

#[tokio::test]
async fn consumer_resumes_from_the_durable_cursor_after_a_drop() {
    let mut pipeline = Pipeline::start();
    let u = user("alice");

    pipeline
        .commands
        .add_subscription(u.clone(), module("terrain-pack"))
        .await
        .unwrap();
    pipeline.wait_for_rows(&u, |rows| rows.len() == 1).await;

    // The log drops the subscription; the consumer reports it rather
    // than erroring, so a supervisor can reconnect.
    pipeline.log.drop_subscriptions("server going away");
    let exit = (&mut pipeline.consumer).await.unwrap().unwrap();
    assert_eq!(
        exit,
        ConsumerExit::Dropped {
            reason: "server going away".to_string()
        }
    );

    // A fresh consumer over the same cursor picks up only new events.
    pipeline.log.restore_subscriptions();
    let consumer = SubscriptionConsumer::new(
        Arc::clone(&pipeline.log) as Arc<dyn EventLog>,
        EventDispatcher::new(Arc::clone(&pipeline.store) as Arc<dyn ProjectionStore>),
        CursorName::try_new("subscription-projection").unwrap(),
    );
    let (shutdown, rx) = watch::channel(());
    let handle = tokio::spawn(async move { consumer.run(rx).await });

    pipeline
        .commands
        .add_subscription(u.clone(), module("shader-kit"))
        .await
        .unwrap();
    pipeline.wait_for_rows(&u, |rows| rows.len() == 2).await;

    shutdown.send(()).unwrap();
    assert_eq!(handle.await.unwrap().unwrap(), ConsumerExit::Cancelled);
}
