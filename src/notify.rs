//! Routes raw hardware notifications to the channel that owns the point.

use crate::channel::{lock_channel, Channel, SharedChannel};
use crate::devices::{Notification, Stage};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, trace};

#[derive(Debug, Clone)]
struct Route {
    channel: Weak<Mutex<Channel>>,
    stage: Stage,
}

/// Maps device point prefixes (`cleanroom:00:003:`) to channels.
///
/// Only weak handles are held, so dropping the fleet's channels makes them unreachable
/// even while notifications for their points are still in flight.
#[derive(Debug, Clone, Default)]
pub struct NotificationRouter {
    routes: Arc<RwLock<HashMap<String, Route>>>,
}

impl NotificationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, channel: &SharedChannel) {
        let prefixes: Vec<(String, Stage)> = {
            let guard = lock_channel(channel);
            [Stage::Lv, Stage::Hv]
                .into_iter()
                .map(|stage| (guard.device(stage).prefix().to_string(), stage))
                .collect()
        };

        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        for (prefix, stage) in prefixes {
            routes.insert(
                prefix,
                Route {
                    channel: Arc::downgrade(channel),
                    stage,
                },
            );
        }
    }

    pub fn clear(&self) {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        info!(routes = routes.len(), "clearing notification routes");
        routes.clear();
    }

    pub fn len(&self) -> usize {
        self.routes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn resolve(&self, point: &str) -> Option<(SharedChannel, Stage, String)> {
        let split = point.rfind(':')?;
        let (prefix, name) = (&point[..=split], &point[split + 1..]);
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        let route = routes.get(prefix)?;
        Some((route.channel.upgrade()?, route.stage, name.to_string()))
    }

    /// Apply one notification under the owning channel's lock only.
    /// Returns `false` when no live channel owns the point.
    pub fn dispatch(&self, notification: Notification) -> bool {
        let Some((channel, stage, name)) = self.resolve(notification.point()) else {
            trace!(point = notification.point(), "unrouted notification");
            return false;
        };

        let mut guard = lock_channel(&channel);
        match notification {
            Notification::Update { value, .. } => {
                guard.on_point_update(stage, &name, value);
            }
            Notification::Connection { connected, .. } => {
                guard.on_connection_change(stage, &name, connected);
            }
        }
        true
    }

    /// Dispatch everything already queued without waiting. Returns the number routed.
    pub fn drain(&self, rx: &mut UnboundedReceiver<Notification>) -> usize {
        let mut routed = 0;
        while let Ok(notification) = rx.try_recv() {
            if self.dispatch(notification) {
                routed += 1;
            }
        }
        routed
    }

    /// Dispatch until the sending side is dropped.
    pub async fn run(self, mut rx: UnboundedReceiver<Notification>) {
        while let Some(notification) = rx.recv().await {
            self.dispatch(notification);
        }
        debug!("notification stream closed");
    }
}
