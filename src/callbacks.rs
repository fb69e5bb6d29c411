//! Post-commit callback notifications.
//!
//! Status transitions enqueue `(application_id, activation_id)` events on a
//! bounded queue drained by a background worker that POSTs JSON to every
//! callback URL registered for the application. Enqueueing never blocks a
//! request worker: on overflow the oldest pending event is dropped and
//! counted. Delivery failures are logged and counted, never retried into
//! the request path.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sea_orm::DatabaseConnection;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::settings::Callbacks;
use crate::storage;

#[derive(Clone, Debug)]
pub struct CallbackEvent {
    pub application_id: i64,
    pub activation_id: String,
}

#[derive(Clone)]
pub struct CallbackDispatcher {
    queue: Arc<Mutex<VecDeque<CallbackEvent>>>,
    notify: Arc<Notify>,
    capacity: usize,
    dropped: Arc<AtomicU64>,
    delivery_failures: Arc<AtomicU64>,
}

impl CallbackDispatcher {
    /// Start the dispatcher and its delivery worker.
    pub fn start(db: DatabaseConnection, config: &Callbacks) -> Self {
        let dispatcher = Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            notify: Arc::new(Notify::new()),
            capacity: config.queue_capacity.max(1),
            dropped: Arc::new(AtomicU64::new(0)),
            delivery_failures: Arc::new(AtomicU64::new(0)),
        };

        let connect_timeout_ms = config.connect_timeout_ms;
        let proxy_url = config.proxy_url.clone();
        let worker = dispatcher.clone();
        tokio::spawn(async move {
            let mut builder = reqwest::Client::builder()
                .connect_timeout(Duration::from_millis(connect_timeout_ms))
                .timeout(Duration::from_millis(connect_timeout_ms * 2));
            if let Some(proxy_url) = &proxy_url {
                match reqwest::Proxy::all(proxy_url) {
                    Ok(proxy) => builder = builder.proxy(proxy),
                    Err(err) => warn!("invalid callback proxy URL, delivering directly: {err}"),
                }
            }
            let client = builder
                .build()
                .expect("reqwest client construction cannot fail with static config");
            loop {
                let event = {
                    let mut queue = worker.queue.lock().expect("callback queue poisoned");
                    queue.pop_front()
                };
                match event {
                    Some(event) => worker.deliver(&client, &db, event).await,
                    None => worker.notify.notified().await,
                }
            }
        });

        dispatcher
    }

    /// Enqueue a notification; drops the oldest pending event when full.
    pub fn notify(&self, application_id: i64, activation_id: &str) {
        let mut queue = self.queue.lock().expect("callback queue poisoned");
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(CallbackEvent {
            application_id,
            activation_id: activation_id.to_string(),
        });
        drop(queue);
        self.notify.notify_one();
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn delivery_failures(&self) -> u64 {
        self.delivery_failures.load(Ordering::Relaxed)
    }

    async fn deliver(&self, client: &reqwest::Client, db: &DatabaseConnection, event: CallbackEvent) {
        let callbacks = match storage::list_callbacks_for_application(db, event.application_id).await
        {
            Ok(callbacks) => callbacks,
            Err(err) => {
                self.delivery_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    application_id = event.application_id,
                    "failed to load callback URLs: {err}"
                );
                return;
            }
        };
        for callback in callbacks {
            let body = serde_json::json!({
                "applicationId": event.application_id,
                "activationId": event.activation_id,
            });
            match client.post(&callback.callback_url).json(&body).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(
                        activation_id = %event.activation_id,
                        url = %callback.callback_url,
                        "callback delivered"
                    );
                }
                Ok(response) => {
                    self.delivery_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        activation_id = %event.activation_id,
                        url = %callback.callback_url,
                        status = %response.status(),
                        "callback rejected"
                    );
                }
                Err(err) => {
                    self.delivery_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        activation_id = %event.activation_id,
                        url = %callback.callback_url,
                        "callback delivery failed: {err}"
                    );
                }
            }
        }
    }
}
