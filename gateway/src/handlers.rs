//! Built-in message handlers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::dispatch::{Dispatcher, HandlerContext, HandlerError, MessageHandler};

/// Longest topic name a client may subscribe to.
const MAX_TOPIC_LEN: usize = 256;

/// Dispatcher with every built-in handler registered.
pub fn dispatcher() -> Dispatcher {
    Dispatcher::new()
        .register(PingHandler)
        .register(SubscribeHandler)
        .register(UnsubscribeHandler)
        .register(TopicsHandler)
}

#[derive(Debug, Deserialize)]
pub struct Ping {
    pub timestamp: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pong {
    pub timestamp: i64,
    pub server_timestamp: i64,
}

/// Echoes the client's timestamp alongside the server's, in unix millis.
pub struct PingHandler;

#[async_trait]
impl MessageHandler for PingHandler {
    type Request = Ping;
    type Response = Pong;
    const MESSAGE_TYPE: &'static str = "ping";

    async fn handle(&self, _ctx: &HandlerContext<'_>, request: Ping) -> Result<Pong, HandlerError> {
        Ok(Pong {
            timestamp: request.timestamp,
            server_timestamp: chrono::Utc::now().timestamp_millis(),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct TopicRequest {
    pub topic: String,
}

fn validate_topic(request: &TopicRequest) -> Vec<String> {
    let mut errors = Vec::new();
    if request.topic.trim().is_empty() {
        errors.push("topic is required".to_string());
    }
    if request.topic.len() > MAX_TOPIC_LEN {
        errors.push(format!("topic must be at most {} characters", MAX_TOPIC_LEN));
    }
    errors
}

#[derive(Debug, Serialize)]
pub struct Subscribed {
    pub topic: String,
    pub topics: Vec<String>,
}

pub struct SubscribeHandler;

#[async_trait]
impl MessageHandler for SubscribeHandler {
    type Request = TopicRequest;
    type Response = Subscribed;
    const MESSAGE_TYPE: &'static str = "subscribe";

    fn validate(&self, request: &TopicRequest) -> Vec<String> {
        validate_topic(request)
    }

    fn topic_key(&self, request: &TopicRequest, _client_id: &str) -> Option<String> {
        Some(request.topic.clone())
    }

    async fn handle(
        &self,
        ctx: &HandlerContext<'_>,
        request: TopicRequest,
    ) -> Result<Subscribed, HandlerError> {
        ctx.manager.subscribe(ctx.client_id, &request.topic).await?;
        let mut topics = ctx.manager.get_topics(ctx.client_id).await?;
        topics.sort_unstable();
        Ok(Subscribed {
            topic: request.topic,
            topics,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct Unsubscribed {
    pub topic: String,
    pub topics: Vec<String>,
}

pub struct UnsubscribeHandler;

#[async_trait]
impl MessageHandler for UnsubscribeHandler {
    type Request = TopicRequest;
    type Response = Unsubscribed;
    const MESSAGE_TYPE: &'static str = "unsubscribe";

    fn validate(&self, request: &TopicRequest) -> Vec<String> {
        validate_topic(request)
    }

    fn topic_key(&self, request: &TopicRequest, _client_id: &str) -> Option<String> {
        Some(request.topic.clone())
    }

    async fn handle(
        &self,
        ctx: &HandlerContext<'_>,
        request: TopicRequest,
    ) -> Result<Unsubscribed, HandlerError> {
        ctx.manager.unsubscribe(ctx.client_id, &request.topic).await?;
        let mut topics = ctx.manager.get_topics(ctx.client_id).await?;
        topics.sort_unstable();
        Ok(Unsubscribed {
            topic: request.topic,
            topics,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListTopics {}

#[derive(Debug, Serialize)]
pub struct Topics {
    pub topics: Vec<String>,
}

pub struct TopicsHandler;

#[async_trait]
impl MessageHandler for TopicsHandler {
    type Request = ListTopics;
    type Response = Topics;
    const MESSAGE_TYPE: &'static str = "topics";

    async fn handle(
        &self,
        ctx: &HandlerContext<'_>,
        _request: ListTopics,
    ) -> Result<Topics, HandlerError> {
        let mut topics = ctx.manager.get_topics(ctx.client_id).await?;
        topics.sort_unstable();
        Ok(Topics { topics })
    }
}
