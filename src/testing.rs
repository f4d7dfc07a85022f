// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker and recording handler used by the unit tests.
//!
//! The fake mirrors the broker behavior the watcher depends on: unacked
//! messages go back to the head of their queue, flagged as redelivered, when
//! their connection dies; a dead connection refuses every operation.

use crate::{
    broker::{Broker, DeliveryAcker, DeliveryStream, Session},
    errors::{AmqpError, HandlerError},
    handler::MessageHandler,
    message::{Message, MessageBody},
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use opentelemetry::Context;
use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Polls `cond` every millisecond of (usually paused) tokio time.
pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..1_000_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

#[derive(Default)]
struct State {
    down: bool,
    queues: HashMap<String, VecDeque<Message>>,
    unacked: HashMap<u64, (String, Message, u64)>,
    declared: Vec<(String, bool)>,
    sessions: Vec<(u64, CancellationToken)>,
    next_session: u64,
    next_tag: u64,
    connects: usize,
    refused: usize,
    acked: Vec<Vec<u8>>,
    nacked: Vec<(Vec<u8>, bool)>,
    last_prefetch: Option<u16>,
}

impl State {
    fn requeue_session(&mut self, session: u64) {
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, (_, _, owner))| *owner == session)
            .map(|(tag, _)| *tag)
            .collect();

        let mut tags = tags;
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some((queue, msg, _)) = self.unacked.remove(&tag) {
                self.queues
                    .entry(queue)
                    .or_default()
                    .push_front(msg.redelivered(true));
            }
        }
    }
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Clone, Default)]
pub(crate) struct FakeBroker {
    inner: Arc<Inner>,
}

impl FakeBroker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap()
    }

    pub(crate) fn publish(&self, queue: &str, body: &str) {
        self.state()
            .queues
            .entry(queue.to_owned())
            .or_default()
            .push_back(Message::new(0, body));
        self.inner.notify.notify_one();
    }

    /// Refuses (`true`) or accepts (`false`) new connections.
    pub(crate) fn set_down(&self, down: bool) {
        self.state().down = down;
    }

    /// Kills every open connection, as a broker restart would.
    pub(crate) fn drop_connections(&self) {
        let mut state = self.state();
        let sessions = std::mem::take(&mut state.sessions);
        for (id, lost) in sessions {
            state.requeue_session(id);
            lost.cancel();
        }
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Ready plus unacked messages of a queue.
    pub(crate) fn depth(&self, queue: &str) -> usize {
        let state = self.state();
        let ready = state.queues.get(queue).map_or(0, VecDeque::len);
        let unacked = state.unacked.values().filter(|(q, _, _)| q == queue).count();
        ready + unacked
    }

    pub(crate) fn bodies(&self, queue: &str) -> Vec<String> {
        self.state()
            .queues
            .get(queue)
            .map(|q| {
                q.iter()
                    .map(|m| String::from_utf8_lossy(&m.payload).into_owned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn declared(&self) -> Vec<(String, bool)> {
        self.state().declared.clone()
    }

    pub(crate) fn connects(&self) -> usize {
        self.state().connects
    }

    pub(crate) fn refused(&self) -> usize {
        self.state().refused
    }

    pub(crate) fn acked(&self) -> usize {
        self.state().acked.len()
    }

    pub(crate) fn nacked(&self) -> Vec<(Vec<u8>, bool)> {
        self.state().nacked.clone()
    }

    pub(crate) fn last_prefetch(&self) -> Option<u16> {
        self.state().last_prefetch
    }

    pub(crate) fn open_sessions(&self) -> usize {
        self.state().sessions.len()
    }
}

#[async_trait]
impl Broker for FakeBroker {
    async fn connect(&self) -> Result<Box<dyn Session>, AmqpError> {
        let mut state = self.state();
        if state.down {
            state.refused += 1;
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        state.connects += 1;
        state.next_session += 1;
        let id = state.next_session;
        let lost = CancellationToken::new();
        state.sessions.push((id, lost.clone()));

        Ok(Box::new(FakeSession {
            id,
            inner: self.inner.clone(),
            lost,
        }))
    }
}

struct FakeSession {
    id: u64,
    inner: Arc<Inner>,
    lost: CancellationToken,
}

impl FakeSession {
    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap()
    }

    fn settle(&self, tag: u64) -> Option<(String, Message)> {
        self.state()
            .unacked
            .remove(&tag)
            .map(|(queue, msg, _)| (queue, msg))
    }
}

#[async_trait]
impl DeliveryAcker for FakeSession {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        if self.lost.is_cancelled() {
            return Err(AmqpError::AckMessageError(delivery_tag));
        }

        let (_, msg) = self
            .settle(delivery_tag)
            .ok_or(AmqpError::AckMessageError(delivery_tag))?;
        self.state().acked.push(msg.payload);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        if self.lost.is_cancelled() {
            return Err(AmqpError::NackMessageError(delivery_tag));
        }

        let (queue, msg) = self
            .settle(delivery_tag)
            .ok_or(AmqpError::NackMessageError(delivery_tag))?;

        let mut state = self.state();
        state.nacked.push((msg.payload.clone(), requeue));
        if requeue {
            state
                .queues
                .entry(queue)
                .or_default()
                .push_front(msg.redelivered(true));
        }
        drop(state);

        self.inner.notify.notify_one();
        Ok(())
    }

    async fn dead_letter(
        &self,
        dlq_name: &str,
        msg: &Message,
        _cx: &Context,
    ) -> Result<(), AmqpError> {
        if self.lost.is_cancelled() {
            return Err(AmqpError::PublishingToDQLError(dlq_name.to_owned()));
        }

        self.state()
            .queues
            .entry(dlq_name.to_owned())
            .or_default()
            .push_back(Message::new(0, msg.payload.clone()));
        Ok(())
    }
}

#[async_trait]
impl Session for FakeSession {
    async fn declare(&self, queue: &QueueDefinition) -> Result<(), AmqpError> {
        if self.lost.is_cancelled() {
            return Err(AmqpError::DeclareQueueError(queue.name().to_owned()));
        }

        let mut state = self.state();
        let mut names = vec![queue.name()];
        names.extend(queue.dlq_name());
        for name in names {
            state.queues.entry(name.to_owned()).or_default();
            let entry = (name.to_owned(), queue.is_durable());
            if !state.declared.contains(&entry) {
                state.declared.push(entry);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream, AmqpError> {
        if self.lost.is_cancelled() {
            return Err(AmqpError::BindingConsumerError(queue.to_owned()));
        }
        self.state().last_prefetch = Some(prefetch);

        let seed = (self.inner.clone(), queue.to_owned(), self.id, self.lost.clone());
        Ok(stream::unfold(seed, |(inner, queue, id, lost)| async move {
            loop {
                if lost.is_cancelled() {
                    return None;
                }

                let next = {
                    let mut state = inner.state.lock().unwrap();
                    let popped = state.queues.get_mut(&queue).and_then(VecDeque::pop_front);
                    popped.map(|msg| {
                        state.next_tag += 1;
                        let msg = Message {
                            delivery_tag: state.next_tag,
                            ..msg
                        };
                        state
                            .unacked
                            .insert(msg.delivery_tag, (queue.clone(), msg.clone(), id));
                        msg
                    })
                };

                if let Some(msg) = next {
                    return Some((Ok(msg), (inner, queue, id, lost)));
                }

                tokio::select! {
                    _ = inner.notify.notified() => {},
                    _ = lost.cancelled() => {},
                }
            }
        })
        .boxed())
    }

    fn lost(&self) -> CancellationToken {
        self.lost.clone()
    }

    async fn close(&self) {
        let mut state = self.state();
        state.requeue_session(self.id);
        state.sessions.retain(|(id, _)| *id != self.id);
        drop(state);
        self.lost.cancel();
        self.inner.notify.notify_one();
    }
}

struct RecorderInner {
    bodies: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Handler double recording every body it sees.
#[derive(Clone)]
pub(crate) struct Recorder {
    inner: Arc<RecorderInner>,
    delay: Duration,
    fail_on: Option<String>,
}

impl Recorder {
    pub(crate) fn new() -> Self {
        Recorder {
            inner: Arc::new(RecorderInner {
                bodies: Mutex::new(vec![]),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }),
            delay: Duration::ZERO,
            fail_on: None,
        }
    }

    /// Time each invocation takes.
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fails every invocation whose body equals `body`.
    pub(crate) fn failing_on(mut self, body: &str) -> Self {
        self.fail_on = Some(body.to_owned());
        self
    }

    pub(crate) fn handler(&self) -> Arc<dyn MessageHandler> {
        Arc::new(self.clone())
    }

    pub(crate) fn bodies(&self) -> Vec<String> {
        self.inner.bodies.lock().unwrap().clone()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn wait_for(&self, calls: usize) -> impl Future<Output = ()> + '_ {
        wait_until(move || self.bodies().len() >= calls)
    }
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn handle(&self, body: MessageBody<'_>) -> Result<(), HandlerError> {
        let text = body.as_text().unwrap_or_default().to_owned();
        self.inner.bodies.lock().unwrap().push(text.clone());

        let now = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);

        match &self.fail_on {
            Some(bad) if *bad == text => Err(HandlerError::failed(format!("cannot process `{text}`"))),
            _ => Ok(()),
        }
    }
}
