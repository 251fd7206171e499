//! Key and channel names in the shared store.
//!
//! Every instance of the fleet must agree on these byte-for-byte, so they
//! are plain functions over fixed prefixes with no configuration.

use crate::SocketId;

const SOCKET_HASH_PREFIX: &str = "socket:";
const SOCKET_TO_CLIENT_PREFIX: &str = "socket_to_client:";
const CLIENT_PREFIX: &str = "client:";
const CLIENT_SOCKETS_SUFFIX: &str = ":sockets";
const CLIENT_TOPICS_SUFFIX: &str = ":topics";
const TOPIC_PREFIX: &str = "topic:";
const TOPIC_SUBSCRIBERS_SUFFIX: &str = ":subscribers";
const PUBSUB_CHANNEL_PREFIX: &str = "pubsub:topic:";

/// Global set of every socket id currently open anywhere in the fleet.
pub const ACTIVE_SOCKETS: &str = "active_sockets";

/// Global set of every topic that has ever been subscribed to.
pub const ALL_TOPICS: &str = "topics";

/// Hash field holding the owning client id.
pub const CLIENT_ID_FIELD: &str = "clientId";

/// Hash field holding the connect time (unix seconds).
pub const CONNECTED_AT_FIELD: &str = "connectedAt";

/// Pattern matching every topic broadcast channel.
pub const ALL_TOPIC_CHANNELS_PATTERN: &str = "pubsub:topic:*";

/// `socket:<socketId>`
pub fn socket_hash(socket_id: SocketId) -> String {
    format!("{SOCKET_HASH_PREFIX}{socket_id}")
}

/// `socket_to_client:<socketId>`
pub fn socket_to_client(socket_id: SocketId) -> String {
    format!("{SOCKET_TO_CLIENT_PREFIX}{socket_id}")
}

/// `client:<clientId>:sockets`
pub fn client_sockets(client_id: &str) -> String {
    format!("{CLIENT_PREFIX}{client_id}{CLIENT_SOCKETS_SUFFIX}")
}

/// `client:<clientId>:topics`
pub fn client_topics(client_id: &str) -> String {
    format!("{CLIENT_PREFIX}{client_id}{CLIENT_TOPICS_SUFFIX}")
}

/// `topic:<topic>:subscribers`
pub fn topic_subscribers(topic: &str) -> String {
    format!("{TOPIC_PREFIX}{topic}{TOPIC_SUBSCRIBERS_SUFFIX}")
}

/// `pubsub:topic:<topic>`
pub fn topic_channel(topic: &str) -> String {
    format!("{PUBSUB_CHANNEL_PREFIX}{topic}")
}

/// Inverse of [`topic_channel`]. Returns `None` for channels outside the
/// topic namespace or with an empty topic.
pub fn topic_from_channel(channel: &str) -> Option<&str> {
    channel
        .strip_prefix(PUBSUB_CHANNEL_PREFIX)
        .filter(|topic| !topic.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_socket_keys_embed_hyphenated_uuid() {
        let id = SocketId::from(Uuid::parse_str("6f1c1a52-4c1e-4b7a-9a55-0e5bd2f5b6f1").unwrap());
        assert_eq!(
            socket_hash(id),
            "socket:6f1c1a52-4c1e-4b7a-9a55-0e5bd2f5b6f1"
        );
        assert_eq!(
            socket_to_client(id),
            "socket_to_client:6f1c1a52-4c1e-4b7a-9a55-0e5bd2f5b6f1"
        );
    }

    #[test]
    fn test_client_and_topic_keys() {
        assert_eq!(client_sockets("c1"), "client:c1:sockets");
        assert_eq!(client_topics("c1"), "client:c1:topics");
        assert_eq!(topic_subscribers("room:42"), "topic:room:42:subscribers");
    }

    #[test]
    fn test_topic_channel_round_trips_through_pattern_namespace() {
        let channel = topic_channel("ota-progress:abc");
        assert_eq!(channel, "pubsub:topic:ota-progress:abc");
        assert!(channel.starts_with(ALL_TOPIC_CHANNELS_PATTERN.trim_end_matches('*')));
        assert_eq!(topic_from_channel(&channel), Some("ota-progress:abc"));
    }

    #[test]
    fn test_topic_from_channel_rejects_malformed_names() {
        assert_eq!(topic_from_channel("pubsub:topic:"), None);
        assert_eq!(topic_from_channel("pubsub:client:c1"), None);
        assert_eq!(topic_from_channel("topic:foo"), None);
        assert_eq!(topic_from_channel(""), None);
    }
}
