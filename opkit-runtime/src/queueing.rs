//! Watch-event queueing: the demultiplexer and the per-object workers.
//!
//! A single watch stream fans out into one bounded queue per object uid.
//! Each queue is owned by one worker task, which batches rapid updates,
//! collapses them to the latest state, serializes the handling calls for
//! its object, and garbage-collects itself after an idle timeout. Objects
//! therefore progress in parallel, while each single object is handled
//! strictly sequentially.

use crate::client::{ClientError, RawEvent, WatchItem};
use crate::config::Settings;
use futures::future::BoxFuture;
use futures::{pin_mut, Stream, StreamExt};
use opkit_core::Resource;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, warn};

/// The per-object handling callback: called with the resource, the latest
/// event, the initial-listing flag, and the replenishment signal that
/// interrupts post-cycle sleeps when newer events arrive.
pub type WatchEventHandler =
    Arc<dyn Fn(Resource, RawEvent, bool, Arc<Notify>) -> BoxFuture<'static, ()> + Send + Sync>;

/// What travels through a per-object queue.
enum WorkerItem {
    Event { event: RawEvent, initial: bool },
    /// End-of-stream sentinel, broadcast when the watch source ends.
    Eos,
}

/// The producer side of one object's queue, owned by the demultiplexer.
struct ObjectStream {
    tx: mpsc::Sender<WorkerItem>,
    replenished: Arc<Notify>,
}

type StreamKey = (Resource, String);
pub(crate) type Streams = Arc<Mutex<HashMap<StreamKey, ObjectStream>>>;

pub(crate) fn new_streams() -> Streams {
    Arc::new(Mutex::new(HashMap::new()))
}

/// Demultiplex one watch stream into per-object workers, and run them to
/// completion. Returns when the stream ends or fails; the caller decides
/// whether to reconnect.
pub async fn watcher<S>(
    resource: Resource,
    events: S,
    handler: WatchEventHandler,
    settings: Settings,
) where
    S: Stream<Item = Result<WatchItem, ClientError>> + Send,
{
    watcher_with_streams(resource, events, handler, settings, new_streams()).await;
}

pub(crate) async fn watcher_with_streams<S>(
    resource: Resource,
    events: S,
    handler: WatchEventHandler,
    settings: Settings,
    streams: Streams,
) where
    S: Stream<Item = Result<WatchItem, ClientError>> + Send,
{
    let mut workers: JoinSet<()> = JoinSet::new();
    let mut initial = true;
    pin_mut!(events);

    while let Some(item) = events.next().await {
        match item {
            Err(err) => {
                warn!(error = %err, "Watch stream failed; stopping the demultiplexing.");
                break;
            }
            Ok(WatchItem::Bookmark) => {
                // The initial listing is over; objects seen from now on are
                // genuinely new or changed, not pre-existing.
                initial = false;
            }
            Ok(WatchItem::Event(event)) => {
                let Some(uid) = event.object.uid().map(String::from) else {
                    warn!("Ignoring an event without metadata.uid.");
                    continue;
                };
                let key = (resource.clone(), uid);
                let mut item = WorkerItem::Event { event, initial };
                loop {
                    let tx = {
                        let mut map = streams.lock();
                        if let Some(stream) = map.get(&key) {
                            stream.replenished.notify_one();
                            stream.tx.clone()
                        } else {
                            let (tx, rx) =
                                mpsc::channel(settings.queue_capacity.max(1));
                            let replenished = Arc::new(Notify::new());
                            map.insert(key.clone(), ObjectStream {
                                tx: tx.clone(),
                                replenished: replenished.clone(),
                            });
                            workers.spawn(worker(
                                key.clone(),
                                rx,
                                replenished,
                                streams.clone(),
                                handler.clone(),
                                settings.clone(),
                            ));
                            tx
                        }
                    };
                    // A full queue blocks here, backpressuring the source.
                    match tx.send(item).await {
                        Ok(()) => break,
                        Err(failed) => {
                            // The worker exited between lookup and send;
                            // recreate the stream and retry.
                            item = failed.0;
                            streams.lock().remove(&key);
                        }
                    }
                }
            }
        }
    }

    // Notify the workers to finish the currently batched events and exit.
    let txs: Vec<_> = streams.lock().values().map(|s| s.tx.clone()).collect();
    for tx in txs {
        let _ = tx.send(WorkerItem::Eos).await;
    }

    let depletion = async {
        while workers.join_next().await.is_some() {}
    };
    if timeout(settings.worker_exit_timeout, depletion).await.is_err() {
        warn!("Workers did not exit in time; abandoning them.");
        workers.shutdown().await;
    }
}

/// The per-object worker: pulls events, collapses bursts to the latest one,
/// and calls the handler strictly sequentially for its object.
async fn worker(
    key: StreamKey,
    mut rx: mpsc::Receiver<WorkerItem>,
    replenished: Arc<Notify>,
    streams: Streams,
    handler: WatchEventHandler,
    settings: Settings,
) {
    loop {
        let first = match timeout(settings.worker_idle_timeout, rx.recv()).await {
            Err(_idle) => break,
            Ok(None) | Ok(Some(WorkerItem::Eos)) => break,
            Ok(Some(WorkerItem::Event { event, initial })) => (event, initial),
        };

        // Keep draining for a short while, keeping only the latest event:
        // rapid successions of updates collapse into one handling cycle.
        let (mut event, mut initial) = first;
        let mut depleted = false;
        loop {
            match timeout(settings.worker_batch_window, rx.recv()).await {
                Err(_window_closed) => break,
                Ok(None) | Ok(Some(WorkerItem::Eos)) => {
                    depleted = true;
                    break;
                }
                Ok(Some(WorkerItem::Event { event: next, initial: next_initial })) => {
                    event = next;
                    initial = next_initial;
                }
            }
        }

        // Strictly sequential per object: the next event is not even pulled
        // until this handling call fully completes.
        handler(key.0.clone(), event, initial, replenished.clone()).await;

        if depleted {
            break;
        }
    }

    // Garbage-collect the own stream, unless it was already replaced by a
    // fresh one after a racy exit.
    let mut map = streams.lock();
    if map
        .get(&key)
        .is_some_and(|s| Arc::ptr_eq(&s.replenished, &replenished))
    {
        map.remove(&key);
        debug!(uid = %key.1, "Garbage-collected the idle stream.");
    }
}
