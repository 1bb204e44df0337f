//! The daemon's event loop.
//!
//! All routing state (clients, stacks, recipient tables) is owned by a
//! single context value and only ever mutated from this loop. Transport
//! tasks (socket readers, USB pumps, SPI threads) park their payloads in
//! per-source queues and signal readiness by sending one wake token per
//! queued item, so a token works like a semaphore: every dequeue consumes
//! exactly one.
//!
//! Dispatch discipline:
//! - tokens drained in one batch are dispatched in source-insertion order,
//! - removing a source during dispatch only marks a tombstone; a tombstoned
//!   source is never dispatched again,
//! - after each batch the caller-supplied cleanup hook runs, then tombstoned
//!   sources are dropped and sources added during dispatch are appended.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error, warn};
use tokio::sync::mpsc;

pub type SourceId = u64;

/// Token that only wakes the loop, e.g. to observe the stop flag.
const WAKE_TOKEN: SourceId = u64::MAX;

/// What kind of event a source delivers. USB hotplug gets its own kinds so
/// the add/remove paths are distinguishable in logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Generic,
    UsbAdded,
    UsbRemoved,
}

pub type Callback<C> = Box<dyn FnMut(&mut C, &mut Ops<C>) -> anyhow::Result<()> + Send>;

struct Source<C> {
    id: SourceId,
    name: String,
    kind: SourceKind,
    callback: Callback<C>,
    removed: bool,
}

/// Source table mutations requested from inside callbacks. Adds are applied
/// after the current batch, removes tombstone immediately after the
/// requesting callback returns.
pub struct Ops<C> {
    next_id: Arc<AtomicU64>,
    adds: Vec<Source<C>>,
    removes: Vec<SourceId>,
}

impl<C> Ops<C> {
    fn new(next_id: Arc<AtomicU64>) -> Self {
        Self {
            next_id,
            adds: Vec::new(),
            removes: Vec::new(),
        }
    }

    pub fn add_source(
        &mut self,
        name: impl Into<String>,
        kind: SourceKind,
        callback: Callback<C>,
    ) -> SourceId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.adds.push(Source {
            id,
            name: name.into(),
            kind,
            callback,
            removed: false,
        });

        id
    }

    pub fn remove_source(&mut self, id: SourceId) {
        self.removes.push(id);
    }
}

/// Cloneable handle used to signal and stop the reactor.
pub struct ReactorHandle {
    tx: mpsc::UnboundedSender<SourceId>,
    running: Arc<AtomicBool>,
    next_id: Arc<AtomicU64>,
}

impl Clone for ReactorHandle {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            running: Arc::clone(&self.running),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl ReactorHandle {
    pub fn notifier(&self, id: SourceId) -> Notifier {
        Notifier {
            id,
            tx: self.tx.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.tx.send(WAKE_TOKEN);
    }
}

/// Wake channel for one source. Send exactly one token per queued item.
#[derive(Clone)]
pub struct Notifier {
    id: SourceId,
    tx: mpsc::UnboundedSender<SourceId>,
}

impl Notifier {
    /// Returns false once the reactor is gone.
    pub fn notify(&self) -> bool {
        self.tx.send(self.id).is_ok()
    }

    pub fn id(&self) -> SourceId {
        self.id
    }
}

/// Payload queue paired with a source. Producers push an item and send one
/// token through the source's `Notifier`; the source callback pops exactly
/// one item per token. A pop on an empty queue therefore means the pair got
/// out of sync.
pub struct SourceQueue<T> {
    inner: Arc<std::sync::Mutex<std::collections::VecDeque<T>>>,
}

impl<T> Clone for SourceQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for SourceQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SourceQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(std::collections::VecDeque::new())),
        }
    }

    pub fn push(&self, item: T) {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(item);
    }

    pub fn pop(&self) -> Option<T> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct Reactor<C> {
    sources: Vec<Source<C>>,
    rx: mpsc::UnboundedReceiver<SourceId>,
    handle: ReactorHandle,
}

impl<C> Reactor<C> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        Self {
            sources: Vec::new(),
            rx,
            handle: ReactorHandle {
                tx,
                running: Arc::new(AtomicBool::new(true)),
                next_id: Arc::new(AtomicU64::new(0)),
            },
        }
    }

    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    /// Fresh mutation buffer, for registering sources outside of `run`.
    pub fn ops(&self) -> Ops<C> {
        Ops::new(Arc::clone(&self.handle.next_id))
    }

    /// Apply a mutation buffer outside of `run`.
    pub fn apply(&mut self, mut ops: Ops<C>) {
        self.apply_removes(&mut ops);
        self.sources.retain(|source| !source.removed);
        self.append_sources(&mut ops);
    }

    fn append_sources(&mut self, ops: &mut Ops<C>) {
        for source in ops.adds.drain(..) {
            debug!(
                "Added event source {} ({:?}/{})",
                source.name, source.kind, source.id
            );
            self.sources.push(source);
        }
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    fn apply_removes(&mut self, ops: &mut Ops<C>) {
        for id in std::mem::take(&mut ops.removes) {
            if let Some(source) = self.sources.iter_mut().find(|source| source.id == id) {
                debug!("Marking event source {} ({}) for removal", source.name, id);
                source.removed = true;
            } else if let Some(index) = ops.adds.iter().position(|source| source.id == id) {
                ops.adds.remove(index);
            } else {
                warn!("Attempt to remove unknown event source {}", id);
            }
        }
    }

    /// Run the loop until `stop` is called on a handle. The stop flag is
    /// checked before each batch and after each callback. A callback error
    /// is logged and does not abort the loop; a dead wake channel does.
    pub async fn run<F>(&mut self, ctx: &mut C, mut cleanup: F) -> anyhow::Result<()>
    where
        F: FnMut(&mut C, &mut Ops<C>),
    {
        while self.handle.is_running() {
            let first = match self.rx.recv().await {
                Some(token) => token,
                None => anyhow::bail!("reactor wake channel closed"),
            };

            let mut tokens: HashMap<SourceId, u32> = HashMap::new();

            if first != WAKE_TOKEN {
                *tokens.entry(first).or_default() += 1;
            }

            while let Ok(token) = self.rx.try_recv() {
                if token != WAKE_TOKEN {
                    *tokens.entry(token).or_default() += 1;
                }
            }

            if !self.handle.is_running() {
                break;
            }

            let mut ops = Ops::new(Arc::clone(&self.handle.next_id));

            for index in 0..self.sources.len() {
                let count = match tokens.get(&self.sources[index].id) {
                    Some(&count) => count,
                    None => continue,
                };

                for _ in 0..count {
                    if !self.handle.is_running() {
                        break;
                    }

                    if self.sources[index].removed {
                        debug!(
                            "Skipping token(s) for tombstoned event source {}",
                            self.sources[index].name
                        );
                        break;
                    }

                    // Take the callback out of the table so it can borrow
                    // the context while the table stays reachable for
                    // tombstone marks.
                    let mut callback = std::mem::replace(
                        &mut self.sources[index].callback,
                        Box::new(|_, _| Ok(())),
                    );
                    let result = callback(ctx, &mut ops);
                    self.sources[index].callback = callback;

                    if let Err(error) = result {
                        error!(
                            "Event source {} failed: {:#}",
                            self.sources[index].name, error
                        );
                    }

                    self.apply_removes(&mut ops);
                }
            }

            cleanup(ctx, &mut ops);

            self.apply_removes(&mut ops);
            self.sources.retain(|source| !source.removed);
            self.append_sources(&mut ops);
        }

        debug!("Event loop stopped");

        Ok(())
    }
}

impl<C> Default for Reactor<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct TestCtx {
        log: Vec<String>,
    }

    fn recorder(tag: &'static str) -> Callback<TestCtx> {
        Box::new(move |ctx, _| {
            ctx.log.push(tag.to_string());
            Ok(())
        })
    }

    #[tokio::test]
    async fn dispatches_in_insertion_order() {
        let mut reactor: Reactor<TestCtx> = Reactor::new();
        let handle = reactor.handle();

        let mut ops = reactor.ops();
        let a = ops.add_source("a", SourceKind::Generic, recorder("a"));
        let b = ops.add_source("b", SourceKind::Generic, recorder("b"));
        let stopper = {
            let handle = handle.clone();
            ops.add_source(
                "stop",
                SourceKind::Generic,
                Box::new(move |_, _| {
                    handle.stop();
                    Ok(())
                }),
            )
        };
        reactor.apply(ops);

        // signal b before a; dispatch must still be a then b
        handle.notifier(b).notify();
        handle.notifier(a).notify();
        handle.notifier(stopper).notify();

        let mut ctx = TestCtx::default();
        reactor.run(&mut ctx, |_, _| {}).await.unwrap();

        assert_eq!(ctx.log, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn one_token_per_queued_item() {
        let mut reactor: Reactor<TestCtx> = Reactor::new();
        let handle = reactor.handle();

        let mut ops = reactor.ops();
        let a = ops.add_source("a", SourceKind::Generic, recorder("a"));
        let stopper = {
            let handle = handle.clone();
            ops.add_source(
                "stop",
                SourceKind::Generic,
                Box::new(move |_, _| {
                    handle.stop();
                    Ok(())
                }),
            )
        };
        reactor.apply(ops);

        handle.notifier(a).notify();
        handle.notifier(a).notify();
        handle.notifier(a).notify();
        handle.notifier(stopper).notify();

        let mut ctx = TestCtx::default();
        reactor.run(&mut ctx, |_, _| {}).await.unwrap();

        assert_eq!(ctx.log, vec!["a", "a", "a"]);
    }

    #[tokio::test]
    async fn tombstoned_source_is_never_dispatched() {
        let mut reactor: Reactor<TestCtx> = Reactor::new();
        let handle = reactor.handle();

        let mut ops = reactor.ops();
        // reserve the id of the victim up front so the remover can name it
        let victim_id = Arc::new(AtomicU64::new(0));

        let remover = {
            let victim_id = Arc::clone(&victim_id);
            ops.add_source(
                "remover",
                SourceKind::Generic,
                Box::new(move |ctx: &mut TestCtx, ops: &mut Ops<TestCtx>| {
                    ctx.log.push("remover".to_string());
                    ops.remove_source(victim_id.load(Ordering::SeqCst));
                    Ok(())
                }),
            )
        };
        let victim = ops.add_source("victim", SourceKind::Generic, recorder("victim"));
        victim_id.store(victim, Ordering::SeqCst);

        let stopper = {
            let handle = handle.clone();
            ops.add_source(
                "stop",
                SourceKind::Generic,
                Box::new(move |_, _| {
                    handle.stop();
                    Ok(())
                }),
            )
        };
        reactor.apply(ops);

        // both ready in the same batch; the remover runs first and
        // tombstones the victim, so the victim's token is discarded
        handle.notifier(remover).notify();
        handle.notifier(victim).notify();
        handle.notifier(stopper).notify();

        let mut ctx = TestCtx::default();
        reactor.run(&mut ctx, |_, _| {}).await.unwrap();

        assert_eq!(ctx.log, vec!["remover"]);
        assert_eq!(reactor.source_count(), 2);
    }

    #[tokio::test]
    async fn sources_added_during_dispatch_run_in_later_batches() {
        let mut reactor: Reactor<TestCtx> = Reactor::new();
        let handle = reactor.handle();

        let mut ops = reactor.ops();
        let adder = {
            let handle = handle.clone();
            ops.add_source(
                "adder",
                SourceKind::Generic,
                Box::new(move |ctx: &mut TestCtx, ops: &mut Ops<TestCtx>| {
                    ctx.log.push("adder".to_string());
                    let late = {
                        let handle = handle.clone();
                        ops.add_source(
                            "late",
                            SourceKind::Generic,
                            Box::new(move |ctx: &mut TestCtx, _: &mut Ops<TestCtx>| {
                                ctx.log.push("late".to_string());
                                handle.stop();
                                Ok(())
                            }),
                        )
                    };
                    handle.notifier(late).notify();
                    Ok(())
                }),
            )
        };
        reactor.apply(ops);

        handle.notifier(adder).notify();

        let mut ctx = TestCtx::default();
        reactor.run(&mut ctx, |_, _| {}).await.unwrap();

        assert_eq!(ctx.log, vec!["adder", "late"]);
    }

    #[tokio::test]
    async fn callback_error_does_not_abort_the_loop() {
        let mut reactor: Reactor<TestCtx> = Reactor::new();
        let handle = reactor.handle();

        let mut ops = reactor.ops();
        let failing = ops.add_source(
            "failing",
            SourceKind::Generic,
            Box::new(|_, _| anyhow::bail!("boom")),
        );
        let after = ops.add_source("after", SourceKind::Generic, recorder("after"));
        let stopper = {
            let handle = handle.clone();
            ops.add_source(
                "stop",
                SourceKind::Generic,
                Box::new(move |_, _| {
                    handle.stop();
                    Ok(())
                }),
            )
        };
        reactor.apply(ops);

        handle.notifier(failing).notify();
        handle.notifier(after).notify();
        handle.notifier(stopper).notify();

        let mut ctx = TestCtx::default();
        reactor.run(&mut ctx, |_, _| {}).await.unwrap();

        assert_eq!(ctx.log, vec!["after"]);
    }

    #[tokio::test]
    async fn cleanup_runs_after_each_batch() {
        let mut reactor: Reactor<TestCtx> = Reactor::new();
        let handle = reactor.handle();

        let mut ops = reactor.ops();
        let a = ops.add_source("a", SourceKind::Generic, recorder("a"));
        let stopper = {
            let handle = handle.clone();
            ops.add_source(
                "stop",
                SourceKind::Generic,
                Box::new(move |_, _| {
                    handle.stop();
                    Ok(())
                }),
            )
        };
        reactor.apply(ops);

        handle.notifier(a).notify();
        handle.notifier(stopper).notify();

        let mut ctx = TestCtx::default();
        reactor
            .run(&mut ctx, |ctx, _| ctx.log.push("cleanup".to_string()))
            .await
            .unwrap();

        assert_eq!(ctx.log, vec!["a", "cleanup"]);
    }
}
