//! Pure message-type to path mapping
//!
//! The router is a total function with no locks and no I/O. The same type
//! name maps to the same path in every process, which is what lets
//! independent bus instances meet on shared queues and topics.

use super::domain_types::{
    ApplicationName, InstanceName, MessageTypeName, QueuePath, SubscriptionName, TopicPath,
};
use crate::bus::config::GlobalPrefix;

/// Well-known path of the dead letter office queue
pub const DEAD_LETTER_OFFICE: &str = "deadletteroffice";

/// Maps message types to transport paths
#[derive(Debug, Clone)]
pub struct PathRouter {
    prefix: GlobalPrefix,
}

impl PathRouter {
    /// Creates a router for the given namespace prefix
    #[must_use]
    pub fn new(prefix: GlobalPrefix) -> Self {
        Self { prefix }
    }

    fn prefixed(&self, type_name: &MessageTypeName) -> String {
        format!("{}.{}", self.prefix, type_name.as_ref().to_lowercase())
    }

    /// Queue path for a command or request type
    #[must_use]
    pub fn queue_path(&self, type_name: &MessageTypeName) -> QueuePath {
        QueuePath::try_new(self.prefixed(type_name)).expect("prefixed paths are non-empty")
    }

    /// Topic path for an event or multicast request type
    #[must_use]
    pub fn topic_path(&self, type_name: &MessageTypeName) -> TopicPath {
        TopicPath::try_new(self.prefixed(type_name)).expect("prefixed paths are non-empty")
    }

    /// The dead letter office queue path
    #[must_use]
    pub fn dead_letter_path(&self) -> QueuePath {
        QueuePath::try_new(DEAD_LETTER_OFFICE.to_string()).expect("dead letter path is non-empty")
    }

    /// This instance's reply queue path
    #[must_use]
    pub fn reply_queue_path(
        &self,
        application: &ApplicationName,
        instance: &InstanceName,
    ) -> QueuePath {
        let path = format!(
            "{}.replies.{}.{}",
            self.prefix,
            application.as_ref().to_lowercase(),
            instance.as_ref().to_lowercase()
        );
        QueuePath::try_new(path).expect("reply paths are non-empty")
    }

    /// Subscription name shared by all instances of an application.
    ///
    /// Instances competing on this subscription receive each event exactly
    /// once per application.
    #[must_use]
    pub fn competing_subscription(&self, application: &ApplicationName) -> SubscriptionName {
        SubscriptionName::try_new(application.as_ref().to_lowercase())
            .expect("application names are non-empty")
    }

    /// Subscription name owned by one instance.
    ///
    /// Every instance gets its own subscription, so each one receives every
    /// message published to the topic.
    #[must_use]
    pub fn instance_subscription(
        &self,
        application: &ApplicationName,
        instance: &InstanceName,
    ) -> SubscriptionName {
        let name = format!(
            "{}.{}",
            application.as_ref().to_lowercase(),
            instance.as_ref().to_lowercase()
        );
        SubscriptionName::try_new(name).expect("instance subscription names are non-empty")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn router() -> PathRouter {
        PathRouter::new(GlobalPrefix::try_new("nimbus".to_string()).unwrap())
    }

    #[test]
    fn queue_path_is_prefixed_and_lowercased() {
        let path = router().queue_path(&MessageTypeName::of("Orders.PlaceOrder"));
        assert_eq!(path.as_ref(), "nimbus.orders.placeorder");
    }

    #[test]
    fn same_type_always_maps_to_same_path() {
        let r = router();
        let name = MessageTypeName::of("orders.orderplaced");
        assert_eq!(r.topic_path(&name), r.topic_path(&name));
    }

    #[test]
    fn reply_path_includes_application_and_instance() {
        let path = router().reply_queue_path(
            &ApplicationName::try_new("Orders".to_string()).unwrap(),
            &InstanceName::try_new("Orders-1".to_string()).unwrap(),
        );
        assert_eq!(path.as_ref(), "nimbus.replies.orders.orders-1");
    }

    #[test]
    fn dead_letter_path_is_well_known() {
        assert_eq!(router().dead_letter_path().as_ref(), DEAD_LETTER_OFFICE);
    }

    proptest! {
        #[test]
        fn routing_is_deterministic_and_total(name in "[A-Za-z][A-Za-z0-9_.]{0,80}") {
            let r = router();
            let type_name = MessageTypeName::of(&name);
            let first = r.queue_path(&type_name);
            let second = r.queue_path(&type_name);
            prop_assert_eq!(&first, &second);
            prop_assert!(first.as_ref().starts_with("nimbus."));
        }
    }
}
