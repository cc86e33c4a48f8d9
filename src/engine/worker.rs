//! Worker pool loop.
//!
//! Each worker repeatedly takes the pool-wide turn lock, pulls one
//! descriptor, waits for the rate tracker, then hands the descriptor to a
//! detached dispatcher task. The network call never runs under the lock.

use std::sync::Arc;

use crate::engine::context::Shared;
use crate::engine::dispatcher;
use crate::engine::rate::POLL_INTERVAL;

/// What a worker does after one turn.
enum Turn {
    Dispatched,
    Idle,
    Exit,
}

pub(crate) async fn run_worker(shared: Arc<Shared>, id: usize) {
    tracing::debug!(worker = id, "Worker started");
    loop {
        match take_turn(&shared, id).await {
            Turn::Dispatched => {}
            Turn::Idle => tokio::time::sleep(POLL_INTERVAL).await,
            Turn::Exit => break,
        }
    }
    tracing::debug!(worker = id, "Worker finished");
}

async fn take_turn(shared: &Arc<Shared>, id: usize) -> Turn {
    let _turn = shared.turn.lock().await;
    if shared.stop.is_set() {
        return Turn::Exit;
    }

    shared.log.worker(id, format!("REQUESTS: {}", shared.queue.len()));
    let descriptor = match shared.queue.dequeue_nowait() {
        Ok(descriptor) => descriptor,
        Err(_) => {
            shared.log.worker(id, "EMPTY QUEUE");
            if !shared.queue.is_listening() {
                return Turn::Exit;
            }
            shared.log.worker(id, "LISTENING");
            return Turn::Idle;
        }
    };

    shared.rate.authorize(&shared.stop).await;
    if shared.stop.is_set() {
        return Turn::Exit;
    }

    let task_shared = shared.clone();
    shared.processing.spawn(async move {
        dispatcher::process(task_shared, descriptor, id).await;
    });
    Turn::Dispatched
}
