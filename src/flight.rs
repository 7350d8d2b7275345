//! Request coalescing
//!
//! At most one upstream query runs per question key; callers that arrive
//! while one is in flight subscribe to its result instead of issuing their
//! own. Shared results are deep copies so no caller mutates another's
//! message.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use hickory_proto::op::Message;
use tokio::sync::broadcast;

use crate::error::{Error, Result};

type Shared = std::result::Result<Message, String>;

/// Coalesces concurrent identical questions into one upstream query.
#[derive(Default)]
pub struct FlightGroup {
    inflight: Arc<Mutex<HashMap<String, broadcast::Sender<Shared>>>>,
}

impl FlightGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fut` under `key`, or wait for the flight already running there.
    ///
    /// Returns the result and whether it was shared (i.e. this caller did
    /// not run `fut` itself). The primary's error reaches every waiter;
    /// successful messages are cloned per waiter.
    pub async fn run<F>(&self, key: &str, fut: F) -> (Result<Message>, bool)
    where
        F: Future<Output = Result<Message>>,
    {
        let mut rx = {
            let mut inflight = self.inflight.lock().expect("flight lock poisoned");
            match inflight.get(key) {
                Some(tx) => Some(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    inflight.insert(key.to_string(), tx);
                    None
                }
            }
        };

        if let Some(rx) = rx.as_mut() {
            let result = match rx.recv().await {
                Ok(Ok(msg)) => Ok(msg),
                Ok(Err(e)) => Err(Error::Dns(e)),
                // The primary was cancelled before broadcasting.
                Err(_) => Err(Error::Dns("shared dns query was abandoned".into())),
            };
            return (result, true);
        }

        // Guard so a cancelled primary still clears the key and wakes
        // waiters (the dropped sender closes their channel).
        let guard = FlightGuard {
            inflight: self.inflight.clone(),
            key: key.to_string(),
        };

        let result = fut.await;

        if let Some(tx) = guard.remove() {
            let shared = match &result {
                Ok(msg) => Ok(msg.clone()),
                Err(e) => Err(e.to_string()),
            };
            let _ = tx.send(shared);
        }

        (result, false)
    }
}

struct FlightGuard {
    inflight: Arc<Mutex<HashMap<String, broadcast::Sender<Shared>>>>,
    key: String,
}

impl FlightGuard {
    fn remove(&self) -> Option<broadcast::Sender<Shared>> {
        self.inflight
            .lock()
            .expect("flight lock poisoned")
            .remove(&self.key)
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let _ = self.remove();
    }
}
