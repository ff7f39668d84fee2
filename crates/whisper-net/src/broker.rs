//! Topic publish/subscribe and request/response on top of [`Gossip`].
//!
//! Inbound messages from [`Gossip::recv`] are dispatched by topic to every
//! [`Handler`] whose glob pattern matches. Replies to a published message are
//! routed to the publisher's [`Replies`] stream through a private
//! `recv:<message-id>` subscription.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::channel::Channel;
use crate::error::WhisperError;
use crate::gossip::Gossip;
use crate::message::{Kind, Message, MessageId, Routing};
use crate::node::NodeId;
use crate::task::TaskManager;
use crate::transport::BoxFuture;

/// Handler callback. A `Some` result is passed to the handler's hooks.
pub type Callback =
    Arc<dyn Fn(Message) -> BoxFuture<'static, Result<Option<Message>, WhisperError>> + Send + Sync>;

/// Hook invoked with `(original, result)` after a callback returns a result.
pub type Hook = Arc<dyn Fn(Message, Message) -> BoxFuture<'static, Result<(), WhisperError>> + Send + Sync>;

/// Topic of the private subscription that collects replies to `id`.
#[must_use]
pub fn correlation_topic(id: MessageId) -> String {
    format!("recv:{id}")
}

/// Configuration for the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// How long a publish collects replies.
    pub reply_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(3),
        }
    }
}

impl BrokerConfig {
    /// Sets the reply timeout.
    #[must_use]
    pub const fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }
}

/// A topic subscription.
///
/// Owns a private channel, the task pumping it into the callback, and the
/// hooks run on each callback result.
pub struct Handler {
    id: u64,
    topic: String,
    pattern: glob::Pattern,
    channel: Channel<Message>,
    tasks: TaskManager,
    hooks: Arc<Mutex<Vec<Hook>>>,
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("queued", &self.channel.len())
            .field("hooks", &self.hooks.lock().len())
            .finish_non_exhaustive()
    }
}

impl Handler {
    fn new(id: u64, topic: &str, hooks: Vec<Hook>) -> Result<Self, WhisperError> {
        let pattern = glob::Pattern::new(topic)
            .map_err(|e| WhisperError::Validation(format!("invalid topic pattern '{topic}': {e}")))?;
        Ok(Self {
            id,
            topic: topic.to_string(),
            pattern,
            channel: Channel::new(),
            tasks: TaskManager::new(),
            hooks: Arc::new(Mutex::new(hooks)),
        })
    }

    fn start(&self, callback: Callback) {
        let channel = self.channel.clone();
        let hooks = Arc::clone(&self.hooks);
        let topic = self.topic.clone();

        self.tasks.spawn(format!("handler:{topic}"), async move {
            while let Ok(message) = channel.recv().await {
                let result = match callback(message.clone()).await {
                    Ok(Some(result)) => result,
                    Ok(None) => continue,
                    Err(e) => {
                        error!(%topic, id = %message.id, error = %e, "handler callback failed");
                        continue;
                    }
                };
                let hooks: Vec<Hook> = hooks.lock().clone();
                for hook in hooks {
                    if let Err(e) = hook(message.clone(), result.clone()).await {
                        error!(%topic, id = %message.id, error = %e, "handler hook failed");
                    }
                }
            }
            Ok::<_, WhisperError>(())
        });
    }

    /// The pattern this handler was registered with.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns true if `topic` matches the handler's pattern.
    #[must_use]
    pub fn matches(&self, topic: &str) -> bool {
        self.pattern.matches(topic)
    }

    /// Appends a hook.
    pub fn add_hook(&self, hook: Hook) {
        self.hooks.lock().push(hook);
    }

    /// Number of messages waiting for the callback.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.channel.len()
    }

    /// Returns true once the handler has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }

    fn deliver(&self, message: Message) {
        if self.channel.send(message).is_err() {
            trace!(topic = %self.topic, "dropping message for closed handler");
        }
    }

    /// Cancels the pump and closes the channel without waiting.
    fn close_now(&self) {
        self.tasks.abort_all();
        self.hooks.lock().clear();
        self.channel.close();
    }

    /// Cancels the pump, waits for it to stop and closes the channel.
    async fn close(&self) {
        self.tasks.close().await;
        self.hooks.lock().clear();
        self.channel.close();
    }
}

/// Handlers keyed by the pattern they registered with.
#[derive(Debug, Default)]
struct Registry {
    topics: Mutex<HashMap<String, Vec<Arc<Handler>>>>,
    next_id: AtomicU64,
}

impl Registry {
    fn register(&self, topic: &str, callback: Option<Callback>, hooks: Vec<Hook>) -> Result<Arc<Handler>, WhisperError> {
        let handler = Arc::new(Handler::new(
            self.next_id.fetch_add(1, Ordering::Relaxed),
            topic,
            hooks,
        )?);
        if let Some(callback) = callback {
            handler.start(callback);
        }
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(Arc::clone(&handler));
        debug!(%topic, handler = handler.id, "subscribed");
        Ok(handler)
    }

    fn remove(&self, handler: &Handler) -> bool {
        let mut topics = self.topics.lock();
        let Some(handlers) = topics.get_mut(&handler.topic) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|h| h.id != handler.id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            topics.remove(&handler.topic);
        }
        removed
    }

    fn drain(&self) -> Vec<Arc<Handler>> {
        self.topics.lock().drain().flat_map(|(_, handlers)| handlers).collect()
    }

    fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.lock().keys().cloned().collect();
        topics.sort();
        topics
    }

    fn dispatch(&self, message: &Message) {
        let mut topics = self.topics.lock();

        if let Some(handlers) = topics.get(&correlation_topic(message.id)) {
            for handler in handlers {
                handler.deliver(message.clone());
            }
            return;
        }

        if message.has(Kind::Handshake) {
            return;
        }
        if message.has(Kind::Ack) || message.has(Kind::Response) {
            debug!(id = %message.id, topic = %message.topic, "dropping reply with no open correlation");
            return;
        }

        let mut delivered = 0usize;
        for handlers in topics.values() {
            if handlers.first().is_some_and(|h| h.matches(&message.topic)) {
                for handler in handlers {
                    handler.deliver(message.clone());
                    delivered += 1;
                }
            }
        }
        trace!(id = %message.id, topic = %message.topic, delivered, "dispatched");

        topics.retain(|_, handlers| !handlers.is_empty());
    }
}

/// Replies to a published message.
///
/// Yields acknowledgements from new senders and replies from expected peers
/// until the deadline passes or every addressed peer has replied. Dropping
/// it unsubscribes the correlation handler.
pub struct Replies {
    message_id: MessageId,
    registry: Arc<Registry>,
    handler: Arc<Handler>,
    pending: BTreeSet<NodeId>,
    acked: BTreeSet<NodeId>,
    directed: bool,
    deadline: Instant,
    done: bool,
}

impl fmt::Debug for Replies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replies")
            .field("message_id", &self.message_id)
            .field("pending", &self.pending)
            .field("acked", &self.acked)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl Replies {
    fn open(
        registry: &Arc<Registry>,
        message_id: MessageId,
        peers: &[NodeId],
        timeout: Duration,
        directed: bool,
    ) -> Result<Self, WhisperError> {
        let handler = registry.register(&correlation_topic(message_id), None, Vec::new())?;
        Ok(Self {
            message_id,
            registry: Arc::clone(registry),
            handler,
            pending: peers.iter().copied().collect(),
            acked: BTreeSet::new(),
            directed,
            deadline: Instant::now() + timeout,
            done: false,
        })
    }

    /// Id of the published message.
    #[must_use]
    pub const fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// Peers that have not replied yet.
    #[must_use]
    pub const fn pending(&self) -> &BTreeSet<NodeId> {
        &self.pending
    }

    /// Peers that acknowledged.
    #[must_use]
    pub const fn acked(&self) -> &BTreeSet<NodeId> {
        &self.acked
    }

    /// Waits for the next reply. `Ok(None)` means the stream is over.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for a correlated message that is neither an
    /// acknowledgement nor a reply from a pending peer; the stream ends too.
    pub async fn next(&mut self) -> Result<Option<Message>, WhisperError> {
        loop {
            if self.done {
                return Ok(None);
            }
            let message = match tokio::time::timeout_at(self.deadline, self.handler.channel.recv()).await {
                Ok(Ok(message)) => message,
                Ok(Err(_)) | Err(_) => {
                    self.finish();
                    return Ok(None);
                }
            };
            let src = message.routing.src;

            if message.has(Kind::Ack) {
                if let Some(src) = src {
                    if !self.acked.insert(src) {
                        trace!(id = %self.message_id, %src, "duplicate ack");
                        continue;
                    }
                    self.pending.insert(src);
                    return Ok(Some(message));
                }
            } else if let Some(src) = src.filter(|src| self.pending.remove(src)) {
                trace!(id = %self.message_id, %src, "reply received");
                if self.directed && self.pending.is_empty() {
                    self.finish();
                }
                return Ok(Some(message));
            }

            self.finish();
            return Err(WhisperError::Protocol(format!(
                "unexpected reply to {} from {}",
                self.message_id,
                src.map_or_else(|| "unknown source".to_string(), |s| s.to_string())
            )));
        }
    }

    /// Waits for every reply.
    ///
    /// # Errors
    ///
    /// Returns the first protocol error.
    pub async fn collect(mut self) -> Result<Vec<Message>, WhisperError> {
        let mut replies = Vec::new();
        while let Some(reply) = self.next().await? {
            replies.push(reply);
        }
        Ok(replies)
    }

    /// Converts into a stream that ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Message, WhisperError>> + Send {
        futures::stream::unfold(Some(self), |state| async move {
            let mut replies = state?;
            match replies.next().await {
                Ok(Some(message)) => Some((Ok(message), Some(replies))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    fn finish(&mut self) {
        if !self.done {
            self.done = true;
            self.registry.remove(&self.handler);
            self.handler.close_now();
        }
    }
}

impl Drop for Replies {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Topic broker for one peer.
pub struct Broker {
    gossip: Arc<Gossip>,
    registry: Arc<Registry>,
    tasks: TaskManager,
    config: BrokerConfig,
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("node", &self.gossip.id())
            .field("topics", &self.registry.topics())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Broker {
    /// Creates a broker and starts its listen loop.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn new(gossip: Arc<Gossip>, config: BrokerConfig) -> Self {
        let registry = Arc::new(Registry::default());
        let tasks = TaskManager::new();
        tasks.spawn("broker:listen", listen(Arc::clone(&gossip), Arc::clone(&registry)));
        Self {
            gossip,
            registry,
            tasks,
            config,
        }
    }

    /// The underlying gossip engine.
    #[must_use]
    pub const fn gossip(&self) -> &Arc<Gossip> {
        &self.gossip
    }

    /// Broker configuration.
    #[must_use]
    pub const fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Registered topic patterns, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.registry.topics()
    }

    /// Subscribes `callback` to every topic matching the glob `pattern`.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the pattern is not a valid glob.
    pub fn subscribe<F, Fut>(&self, pattern: &str, callback: F) -> Result<Arc<Handler>, WhisperError>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Message>, WhisperError>> + Send + 'static,
    {
        self.registry
            .register(pattern, Some(boxed_callback(callback)), Vec::new())
    }

    /// Subscribes `callback` and sends each result back to the message's
    /// source as a response.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the pattern is not a valid glob.
    pub fn respond<F, Fut>(&self, pattern: &str, callback: F) -> Result<Arc<Handler>, WhisperError>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Message>, WhisperError>> + Send + 'static,
    {
        let hook = reply_hook(Arc::clone(&self.gossip));
        self.registry
            .register(pattern, Some(boxed_callback(callback)), vec![hook])
    }

    /// Removes a handler and waits for its pump to stop.
    pub async fn unsubscribe(&self, handler: &Handler) {
        if self.registry.remove(handler) {
            debug!(topic = %handler.topic, handler = handler.id, "unsubscribed");
        }
        handler.close().await;
    }

    /// Publishes `message` on `topic`, directly to `peers` or by gossip.
    ///
    /// Replies are collected for the configured reply timeout.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the message has no id,
    /// [`WhisperError::NodeNotFound`] if a peer is unknown, or the send error.
    pub async fn publish(
        &self,
        topic: &str,
        message: Message,
        peers: Option<&[NodeId]>,
    ) -> Result<Replies, WhisperError> {
        self.publish_with_timeout(topic, message, peers, self.config.reply_timeout)
            .await
    }

    /// Publishes `message` as a request and collects replies for `timeout`.
    ///
    /// A gossiped request also carries `Syn`: responders are unknown up
    /// front, so each one acknowledges before its response is accepted.
    ///
    /// # Errors
    ///
    /// Same as [`Broker::publish`].
    pub async fn request(
        &self,
        topic: &str,
        message: Message,
        peers: Option<&[NodeId]>,
        timeout: Duration,
    ) -> Result<Replies, WhisperError> {
        let mut message = message.with_kind(Kind::Request);
        if peers.is_none() {
            message = message.with_kind(Kind::Syn);
        }
        self.publish_with_timeout(topic, message, peers, timeout).await
    }

    async fn publish_with_timeout(
        &self,
        topic: &str,
        mut message: Message,
        peers: Option<&[NodeId]>,
        timeout: Duration,
    ) -> Result<Replies, WhisperError> {
        if message.id.is_nil() {
            return Err(WhisperError::Validation("message id is required".into()));
        }
        message.topic = topic.to_string();
        message.routing = Routing::default();

        let replies = Replies::open(
            &self.registry,
            message.id,
            peers.unwrap_or_default(),
            timeout,
            peers.is_some(),
        )?;

        match peers {
            Some(peers) => {
                {
                    let topology = self.gossip.topology();
                    if let Some(unknown) = peers.iter().find(|peer| !topology.contains(**peer)) {
                        return Err(WhisperError::NodeNotFound(*unknown));
                    }
                }
                for peer in peers {
                    self.gossip.send(message.clone(), *peer).await?;
                }
            }
            None => {
                self.gossip.send_gossip(message).await?;
            }
        }
        Ok(replies)
    }

    /// Stops the listen loop, closes every handler and the gossip engine.
    pub async fn close(&self) {
        self.gossip.close();
        self.tasks.close().await;
        for handler in self.registry.drain() {
            handler.close().await;
        }
    }
}

fn boxed_callback<F, Fut>(callback: F) -> Callback
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Message>, WhisperError>> + Send + 'static,
{
    Arc::new(
        move |message| -> BoxFuture<'static, Result<Option<Message>, WhisperError>> {
            Box::pin(callback(message))
        },
    )
}

fn reply_hook(gossip: Arc<Gossip>) -> Hook {
    Arc::new(
        move |request: Message, result: Message| -> BoxFuture<'static, Result<(), WhisperError>> {
            let gossip = Arc::clone(&gossip);
            Box::pin(async move {
                let src = request.routing.src.ok_or_else(|| {
                    WhisperError::Validation(format!("request {} has no source to reply to", request.id))
                })?;
                let mut response = result;
                response.id = request.id;
                response.topic = request.topic;
                response.kinds = BTreeSet::from([Kind::Response]);
                response.routing = Routing::default();
                gossip.send(response, src).await.map(|_| ())
            })
        },
    )
}

async fn listen(gossip: Arc<Gossip>, registry: Arc<Registry>) -> Result<(), WhisperError> {
    let stream = gossip.recv();
    tokio::pin!(stream);
    while let Some(item) = stream.next().await {
        match item {
            Ok(message) => registry.dispatch(&message),
            Err(WhisperError::TransportClosed) => break,
            Err(e) => {
                warn!(error = %e, "listen loop stopped");
                return Err(e);
            }
        }
    }
    debug!(node = %gossip.id(), "listen loop finished");
    Ok(())
}
