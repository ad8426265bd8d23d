//! Session-scoped context
//!
//! Built once per connection and handed to every component at construction,
//! instead of reaching for process-wide singletons.

use std::sync::Arc;

use crate::config::SessionConfig;
use crate::framework::EventBroadcaster;

/// Settings and the event sink shared by one session's components
#[derive(Clone)]
pub struct SessionContext {
    pub settings: SessionConfig,
    pub events: EventBroadcaster,
}

impl SessionContext {
    pub fn new(settings: SessionConfig) -> Arc<Self> {
        let events = EventBroadcaster::new(settings.queue_capacity);
        Arc::new(Self { settings, events })
    }
}
