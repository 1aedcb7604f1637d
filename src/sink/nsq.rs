use super::{Result, Sink, SinkError};
use crate::config::types::SinkConfig;
use async_trait::async_trait;
use serde::Deserialize;

/// Client for an nsqd HTTP endpoint
#[derive(Debug, Clone)]
pub struct NsqSink {
    base_url: String,
    client: reqwest::Client,
    max_depth: u64,
}

#[derive(Debug, Deserialize)]
struct StatsResponse {
    #[serde(default)]
    topics: Option<Vec<TopicStats>>,
    #[serde(default)]
    data: Option<StatsData>,
}

#[derive(Debug, Deserialize)]
struct StatsData {
    #[serde(default)]
    topics: Vec<TopicStats>,
}

#[derive(Debug, Deserialize)]
struct TopicStats {
    topic_name: String,
    #[serde(default)]
    depth: u64,
    #[serde(default)]
    channels: Vec<ChannelStats>,
}

#[derive(Debug, Deserialize)]
struct ChannelStats {
    #[serde(default)]
    depth: u64,
}

impl StatsResponse {
    fn into_topics(self) -> Vec<TopicStats> {
        match (self.topics, self.data) {
            (Some(topics), _) => topics,
            (None, Some(data)) => data.topics,
            (None, None) => Vec::new(),
        }
    }
}

/// Ephemeral topics (`name#ephemeral`) are reported under their bare name
fn stats_name(topic: &str) -> &str {
    topic.split_once('#').map_or(topic, |(name, _)| name)
}

impl NsqSink {
    pub fn new(config: &SinkConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;

        let address = config.address.trim_end_matches('/');
        let base_url = if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        };

        Ok(Self {
            base_url,
            client,
            max_depth: config.max_depth,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Messages waiting in `topic`, counting every channel's backlog
    pub async fn depth(&self, topic: &str) -> Result<u64> {
        let url = format!("{}/stats", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("format", "json"), ("topic", topic)])
            .send()
            .await?;
        let response = check_status(response).await?;
        let stats: StatsResponse = response.json().await?;

        let name = stats_name(topic);
        let topic_stats = stats
            .into_topics()
            .into_iter()
            .find(|t| t.topic_name == name)
            .ok_or_else(|| SinkError::TopicMissing(topic.to_string()))?;

        Ok(topic_stats.depth + topic_stats.channels.iter().map(|c| c.depth).sum::<u64>())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    if !response.status().is_success() {
        return Err(SinkError::Status {
            status: response.status().as_u16(),
            message: response.text().await.unwrap_or_default(),
        });
    }
    Ok(response)
}

#[async_trait]
impl Sink for NsqSink {
    async fn ensure_topic(&self, topic: &str) -> Result<()> {
        let url = format!("{}/topic/create", self.base_url);
        let response = self
            .client
            .post(&url)
            .query(&[("topic", topic)])
            .send()
            .await?;
        check_status(response).await?;
        tracing::info!(topic, "Topic ready at nsq");
        Ok(())
    }

    async fn is_ready(&self, topic: &str) -> Result<bool> {
        let depth = self.depth(topic).await?;
        tracing::debug!(topic, depth, max_depth = self.max_depth, "nsq depth check");
        Ok(depth < self.max_depth)
    }

    async fn publish(&self, topic: &str, messages: &[String]) -> Result<()> {
        let body = messages.join("\n");
        let nbytes = body.len();
        let url = format!("{}/mpub", self.base_url);
        let response = self
            .client
            .post(&url)
            .query(&[("topic", topic)])
            .body(body)
            .send()
            .await?;
        check_status(response).await?;
        tracing::debug!(topic, nmsgs = messages.len(), nbytes, "nsq push done");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Vec<TopicStats> {
        serde_json::from_str::<StatsResponse>(json).unwrap().into_topics()
    }

    #[test]
    fn test_stats_name_strips_tag() {
        assert_eq!(stats_name("Heartbeat#ephemeral"), "Heartbeat");
        assert_eq!(stats_name("logs"), "logs");
    }

    #[test]
    fn test_parse_flat_stats() {
        let topics = parse(
            r#"{"version":"1.0.0-compat","health":"OK","topics":[
                {"topic_name":"logs","depth":19019,"backend_depth":9019,
                 "channels":[{"channel_name":"c","depth":5}]}]}"#,
        );
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].topic_name, "logs");
        assert_eq!(topics[0].depth, 19019);
        assert_eq!(topics[0].channels[0].depth, 5);
    }

    #[test]
    fn test_parse_wrapped_stats() {
        let topics = parse(
            r#"{"status_code":200,"data":{"topics":[{"topic_name":"logs","depth":3,"channels":[]}]}}"#,
        );
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].depth, 3);
    }

    #[test]
    fn test_address_gets_scheme() {
        let config = SinkConfig::new("127.0.0.1:4151", "logs");
        assert_eq!(NsqSink::new(&config).unwrap().base_url(), "http://127.0.0.1:4151");

        let config = SinkConfig::new("https://nsq.internal/", "logs");
        assert_eq!(NsqSink::new(&config).unwrap().base_url(), "https://nsq.internal");
    }
}
