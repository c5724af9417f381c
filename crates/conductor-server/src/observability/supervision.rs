//! Supervised Task Spawning
//!
//! Background loops (control loop, lease keepalive, watch pumps) run under
//! [`spawn_supervised`]: a panic inside the task is caught, logged as a
//! `task_panicked` event and counted, and never reaches the host process.

use super::{events, metrics};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::task::JoinHandle;
use tracing::trace;

/// Spawn `future` on the tokio runtime behind a panic boundary.
///
/// The returned handle completes normally even when the task panicked.
pub fn spawn_supervised<F>(task: &'static str, future: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(()) => trace!(task = task, "Supervised task finished"),
            Err(payload) => {
                events::task_panicked(task, &panic_message(payload.as_ref()));
                metrics::record_task_panic(task);
            }
        }
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_panic_is_contained() {
        let handle = spawn_supervised("test-panic", async {
            panic!("boom");
        });

        assert!(handle.await.is_ok());
    }

    #[tokio::test]
    async fn test_task_runs_to_completion() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();

        spawn_supervised("test-complete", async move {
            flag.store(true, Ordering::SeqCst);
        })
        .await
        .unwrap();

        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_panic_message_extraction() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let borrowed: Box<dyn Any + Send> = Box::new("borrowed");
        let other: Box<dyn Any + Send> = Box::new(42u32);

        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(borrowed.as_ref()), "borrowed");
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }
}
