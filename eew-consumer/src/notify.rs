use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sns::error::DisplayErrorContext;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::error::DispatchError;
use crate::metrics_consts::{NOTIFICATION_ERRORS, NOTIFICATIONS_SENT, SUBSCRIBERS_REGISTERED};
use crate::variant::WarningEvent;

/// SNS rejects subjects longer than this.
const MAX_SUBJECT_LEN: usize = 100;

const PROTOCOLS: &[&str] = &[
    "http",
    "https",
    "email",
    "email-json",
    "sms",
    "sqs",
    "application",
    "lambda",
    "firehose",
];

/// A topic subscription target, written `protocol:endpoint`
/// (`email:ops@example.com`, `sms:+15555550100`). HTTP(S) endpoints are
/// written as the plain URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub protocol: String,
    pub endpoint: String,
}

impl FromStr for Subscriber {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || DispatchError::InvalidSubscriber(s.to_owned());

        let (protocol, endpoint) = if s.starts_with("http://") || s.starts_with("https://") {
            let (scheme, _) = s.split_once(':').ok_or_else(invalid)?;
            (scheme, s)
        } else {
            s.split_once(':').ok_or_else(invalid)?
        };

        let protocol = protocol.trim().to_lowercase();
        let endpoint = endpoint.trim();
        if endpoint.is_empty() || !PROTOCOLS.contains(&protocol.as_str()) {
            return Err(invalid());
        }

        Ok(Subscriber {
            protocol,
            endpoint: endpoint.to_owned(),
        })
    }
}

impl fmt::Display for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.protocol, self.endpoint)
    }
}

/// Comma separated subscribers; empty means none.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubscriberList(pub Vec<Subscriber>);

impl FromStr for SubscriberList {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .filter(|entry| !entry.trim().is_empty())
            .map(Subscriber::from_str)
            .collect::<Result<Vec<_>, _>>()
            .map(SubscriberList)
    }
}

/// What subscribers are told about a warning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertMessage {
    pub device_id: String,
    pub acceleration: Decimal,
    pub warning_time: NaiveDateTime,
}

impl From<&WarningEvent> for AlertMessage {
    fn from(warning: &WarningEvent) -> Self {
        Self {
            device_id: warning.device_id.clone(),
            acceleration: warning.warning_acceleration,
            warning_time: warning.warning_time,
        }
    }
}

impl AlertMessage {
    pub fn subject(&self) -> String {
        let mut subject = format!("Earthquake warning from sensor {}", self.device_id);
        subject.truncate(MAX_SUBJECT_LEN);
        subject
    }

    pub fn body(&self) -> String {
        format!(
            "Sensor {} measured a sustained acceleration of {} at {} UTC. \
             Strong shaking may follow, take cover.",
            self.device_id,
            self.acceleration.normalize(),
            self.warning_time.format("%Y-%m-%d %H:%M:%S%.3f"),
        )
    }
}

#[async_trait]
pub trait NotificationTransport: Send + Sync {
    /// Returns the message id assigned by the service, if any.
    async fn publish(
        &self,
        topic: &str,
        subject: &str,
        message: &str,
    ) -> Result<Option<String>, DispatchError>;

    /// Returns the subscription id; pending confirmations have none.
    async fn subscribe(
        &self,
        topic: &str,
        subscriber: &Subscriber,
    ) -> Result<Option<String>, DispatchError>;
}

pub struct SnsTransport {
    client: aws_sdk_sns::Client,
}

impl SnsTransport {
    pub fn new(client: aws_sdk_sns::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NotificationTransport for SnsTransport {
    async fn publish(
        &self,
        topic: &str,
        subject: &str,
        message: &str,
    ) -> Result<Option<String>, DispatchError> {
        let output = self
            .client
            .publish()
            .topic_arn(topic)
            .subject(subject)
            .message(message)
            .send()
            .await
            .map_err(|e| DispatchError::Service(DisplayErrorContext(&e).to_string()))?;

        Ok(output.message_id().map(str::to_owned))
    }

    async fn subscribe(
        &self,
        topic: &str,
        subscriber: &Subscriber,
    ) -> Result<Option<String>, DispatchError> {
        let output = self
            .client
            .subscribe()
            .topic_arn(topic)
            .protocol(&subscriber.protocol)
            .endpoint(&subscriber.endpoint)
            .return_subscription_arn(true)
            .send()
            .await
            .map_err(|e| DispatchError::Service(DisplayErrorContext(&e).to_string()))?;

        Ok(output.subscription_arn().map(str::to_owned))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub subject: String,
    pub message: String,
}

/// Transport that records what would have been sent. Clones share state.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    inner: Arc<Mutex<RecordingInner>>,
}

#[derive(Default)]
struct RecordingInner {
    published: Vec<PublishedMessage>,
    subscriptions: Vec<(String, Subscriber)>,
    failures: usize,
    delay: Option<Duration>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every publish waits this long before completing.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.lock().delay = Some(delay);
        self
    }

    /// The next `count` calls fail.
    pub fn fail_next(&self, count: usize) {
        self.lock().failures += count;
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn subscriptions(&self) -> Vec<(String, Subscriber)> {
        self.lock().subscriptions.clone()
    }

    fn lock(&self) -> MutexGuard<'_, RecordingInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_failure(&self) -> Result<(), DispatchError> {
        let mut inner = self.lock();
        if inner.failures > 0 {
            inner.failures -= 1;
            return Err(DispatchError::Service("injected failure".to_owned()));
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationTransport for RecordingTransport {
    async fn publish(
        &self,
        topic: &str,
        subject: &str,
        message: &str,
    ) -> Result<Option<String>, DispatchError> {
        let delay = self.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.take_failure()?;

        let mut inner = self.lock();
        inner.published.push(PublishedMessage {
            topic: topic.to_owned(),
            subject: subject.to_owned(),
            message: message.to_owned(),
        });
        Ok(Some(format!("message-{}", inner.published.len())))
    }

    async fn subscribe(
        &self,
        topic: &str,
        subscriber: &Subscriber,
    ) -> Result<Option<String>, DispatchError> {
        self.take_failure()?;

        let mut inner = self.lock();
        inner
            .subscriptions
            .push((topic.to_owned(), subscriber.clone()));
        Ok(None)
    }
}

/// Publishes alerts to one topic. Delivery is best effort: a failed or slow
/// publish is logged and dropped, the caller never sees an error.
pub struct NotificationDispatcher<T> {
    transport: T,
    topic: String,
    timeout: Duration,
}

impl<T: NotificationTransport> NotificationDispatcher<T> {
    pub fn new(transport: T, topic: impl Into<String>, timeout: Duration) -> Self {
        Self {
            transport,
            topic: topic.into(),
            timeout,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns whether the message was accepted by the notification service.
    pub async fn publish(&self, alert: &AlertMessage) -> bool {
        match self.try_publish(alert).await {
            Ok(message_id) => {
                metrics::counter!(NOTIFICATIONS_SENT).increment(1);
                info!(
                    device_id = %alert.device_id,
                    topic = %self.topic,
                    message_id = message_id.as_deref().unwrap_or("-"),
                    "alert published"
                );
                true
            }
            Err(e) => {
                metrics::counter!(NOTIFICATION_ERRORS).increment(1);
                error!(device_id = %alert.device_id, topic = %self.topic, "failed to publish alert: {e}");
                false
            }
        }
    }

    async fn try_publish(&self, alert: &AlertMessage) -> Result<Option<String>, DispatchError> {
        let subject = alert.subject();
        let body = alert.body();

        tokio::time::timeout(
            self.timeout,
            self.transport.publish(&self.topic, &subject, &body),
        )
        .await
        .map_err(|_| DispatchError::Timeout(self.timeout))?
    }

    /// Subscribes each configured endpoint to the topic. Failures are logged,
    /// the rest are still registered. Returns how many succeeded.
    pub async fn register_subscribers(&self, subscribers: &[Subscriber]) -> usize {
        let mut registered = 0;

        for subscriber in subscribers {
            let result = tokio::time::timeout(
                self.timeout,
                self.transport.subscribe(&self.topic, subscriber),
            )
            .await
            .map_err(|_| DispatchError::Timeout(self.timeout))
            .and_then(|result| result);

            match result {
                Ok(subscription) => {
                    registered += 1;
                    metrics::counter!(SUBSCRIBERS_REGISTERED).increment(1);
                    info!(
                        %subscriber,
                        topic = %self.topic,
                        subscription = subscription.as_deref().unwrap_or("pending confirmation"),
                        "subscriber registered"
                    );
                }
                Err(e) => {
                    warn!(%subscriber, topic = %self.topic, "failed to register subscriber: {e}");
                }
            }
        }

        registered
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    const TOPIC: &str = "arn:aws:sns:us-west-2:123456789012:earthquake-alerts";

    fn alert() -> AlertMessage {
        AlertMessage {
            device_id: "005".to_owned(),
            acceleration: Decimal::new(12500, 3),
            warning_time: NaiveDate::from_ymd_opt(2021, 3, 24)
                .unwrap()
                .and_hms_milli_opt(10, 15, 2, 250)
                .unwrap(),
        }
    }

    #[test]
    fn test_parse_subscribers() {
        let list: SubscriberList = "email:ops@example.com, https://hooks.example.com/eew,sms:+15555550100"
            .parse()
            .unwrap();

        assert_eq!(
            list.0,
            vec![
                Subscriber {
                    protocol: "email".to_owned(),
                    endpoint: "ops@example.com".to_owned(),
                },
                Subscriber {
                    protocol: "https".to_owned(),
                    endpoint: "https://hooks.example.com/eew".to_owned(),
                },
                Subscriber {
                    protocol: "sms".to_owned(),
                    endpoint: "+15555550100".to_owned(),
                },
            ]
        );

        assert_eq!("".parse::<SubscriberList>().unwrap(), SubscriberList::default());
        assert!("ops@example.com".parse::<Subscriber>().is_err());
        assert!("pager:ops".parse::<Subscriber>().is_err());
        assert!("email:".parse::<Subscriber>().is_err());
    }

    #[test]
    fn test_message_text() {
        let alert = alert();
        assert_eq!(alert.subject(), "Earthquake warning from sensor 005");
        assert_eq!(
            alert.body(),
            "Sensor 005 measured a sustained acceleration of 12.5 at 2021-03-24 10:15:02.250 UTC. \
             Strong shaking may follow, take cover."
        );
    }

    #[tokio::test]
    async fn test_publish_reaches_topic() {
        let dispatcher =
            NotificationDispatcher::new(RecordingTransport::new(), TOPIC, Duration::from_secs(5));

        assert!(dispatcher.publish(&alert()).await);

        let published = dispatcher.transport().published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, TOPIC);
        assert!(published[0].message.contains("Sensor 005"));
    }

    #[tokio::test]
    async fn test_failed_publish_is_swallowed() {
        let transport = RecordingTransport::new();
        transport.fail_next(1);
        let dispatcher = NotificationDispatcher::new(transport, TOPIC, Duration::from_secs(5));

        assert!(!dispatcher.publish(&alert()).await);
        assert!(dispatcher.transport().published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_publish_times_out() {
        let transport = RecordingTransport::new().with_delay(Duration::from_secs(30));
        let dispatcher = NotificationDispatcher::new(transport, TOPIC, Duration::from_secs(2));

        let started = tokio::time::Instant::now();
        assert!(!dispatcher.publish(&alert()).await);
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_register_subscribers_continues_past_failures() {
        let transport = RecordingTransport::new();
        transport.fail_next(1);
        let dispatcher = NotificationDispatcher::new(transport, TOPIC, Duration::from_secs(5));

        let list: SubscriberList = "email:a@example.com,email:b@example.com".parse().unwrap();
        assert_eq!(dispatcher.register_subscribers(&list.0).await, 1);

        let subscriptions = dispatcher.transport().subscriptions();
        assert_eq!(subscriptions.len(), 1);
        assert_eq!(subscriptions[0].1.endpoint, "b@example.com");
    }
}
