//! Concurrency contract: at most one task ever becomes active, no matter
//! how start calls race.

use std::sync::Arc;

use tempo_core::store::Store;
use tempo_core::time::FallbackWindow;
use tempo_engine::{CreateTaskRequest, EngineError, TaskEngine};

fn request(title: &str) -> CreateTaskRequest {
    CreateTaskRequest {
        title: title.into(),
        ..CreateTaskRequest::default()
    }
}

async fn fresh_engine() -> Arc<TaskEngine> {
    let store = Arc::new(Store::open_in_memory().await.unwrap());
    Arc::new(TaskEngine::new(
        store,
        FallbackWindow {
            start_hour: 9,
            duration_hours: 1,
        },
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_starts_admit_exactly_one_winner() {
    for _ in 0..100 {
        let engine = fresh_engine().await;
        let a = engine.create_task(request("task a")).await.unwrap();
        let b = engine.create_task(request("task b")).await.unwrap();

        let ea = engine.clone();
        let eb = engine.clone();
        let ha = tokio::spawn(async move { ea.start_task(a.id).await });
        let hb = tokio::spawn(async move { eb.start_task(b.id).await });
        let ra = ha.await.unwrap();
        let rb = hb.await.unwrap();

        let winners = usize::from(ra.is_ok()) + usize::from(rb.is_ok());
        assert_eq!(winners, 1, "exactly one of two racing starts may win");

        let active = engine.get_active_task().await.unwrap();
        let active = active.expect("one task must be active after the race");

        let loser = if ra.is_ok() { rb } else { ra };
        match loser.unwrap_err() {
            EngineError::IllegalTransition(msg) => {
                assert!(
                    msg.contains(&active.title),
                    "conflict message '{msg}' must name the active task '{}'",
                    active.title
                );
            }
            other => panic!("loser must fail with IllegalTransition, got {other:?}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn storm_of_starts_on_many_tasks_keeps_one_active() {
    let engine = fresh_engine().await;
    let mut ids = Vec::new();
    for i in 0..8 {
        ids.push(
            engine
                .create_task(request(&format!("task {i}")))
                .await
                .unwrap()
                .id,
        );
    }

    let mut handles = Vec::new();
    for id in ids {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move { engine.start_task(id).await }));
    }
    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let all = engine.get_all_tasks().await.unwrap();
    let active_count = all.iter().filter(|t| t.is_active()).count();
    assert_eq!(active_count, 1);
}

#[tokio::test]
async fn start_after_delete_reports_gone() {
    let engine = fresh_engine().await;
    let task = engine.create_task(request("ephemeral")).await.unwrap();
    engine.delete_task(task.id).await.unwrap();
    assert!(matches!(
        engine.start_task(task.id).await,
        Err(EngineError::Gone)
    ));
}
