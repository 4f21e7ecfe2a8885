use crate::topic_matching;
use crate::types::Message;
use crate::QoS;
use std::sync::Arc;

/// Callback invoked for every message delivered on a matching subscription
pub type PublishCallback = Arc<dyn Fn(Message) + Send + Sync>;

#[derive(Clone)]
struct Route {
    filter: String,
    qos: QoS,
    callback: PublishCallback,
}

/// Confirmed subscriptions and the callbacks they route to
///
/// Routes are kept in subscription order, which is also the order callbacks
/// run in when several filters match the same topic.
#[derive(Default, Clone)]
pub struct SubscriptionRouter {
    routes: Vec<Route>,
}

impl SubscriptionRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a route, replacing any existing route for the same filter
    pub fn insert(&mut self, filter: impl Into<String>, qos: QoS, callback: PublishCallback) {
        let filter = filter.into();
        if let Some(route) = self.routes.iter_mut().find(|r| r.filter == filter) {
            route.qos = qos;
            route.callback = callback;
        } else {
            self.routes.push(Route {
                filter,
                qos,
                callback,
            });
        }
    }

    /// Removes the route for `filter`; returns whether one existed
    pub fn remove(&mut self, filter: &str) -> bool {
        let before = self.routes.len();
        self.routes.retain(|r| r.filter != filter);
        self.routes.len() < before
    }

    /// Callbacks of every route whose filter matches `topic`
    #[must_use]
    pub fn matching(&self, topic: &str) -> Vec<PublishCallback> {
        self.routes
            .iter()
            .filter(|r| topic_matching::matches(topic, &r.filter))
            .map(|r| Arc::clone(&r.callback))
            .collect()
    }

    /// Granted QoS of the subscription for `filter`
    #[must_use]
    pub fn granted_qos(&self, filter: &str) -> Option<QoS> {
        self.routes.iter().find(|r| r.filter == filter).map(|r| r.qos)
    }

    /// All subscribed filters with their granted QoS
    #[must_use]
    pub fn filters(&self) -> Vec<(String, QoS)> {
        self.routes
            .iter()
            .map(|r| (r.filter.clone(), r.qos))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
