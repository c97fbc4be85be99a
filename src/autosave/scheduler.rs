//! Debounced autosave.
//!
//! Change notifications are coalesced per document: each one re-arms the
//! document's deadline, and only the latest content is saved once the
//! document has been quiet for the debounce period. A single worker thread
//! performs every save, so at most one save per document is in flight.

use crate::codec::ContentCodec;
use crate::error::{Result, StoreError};
use crate::store::VersionStore;
use crate::types::{DocumentId, SaveReceipt};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Capacity of the event channel. Events beyond this are dropped.
const EVENT_BUFFER: usize = 256;

/// Outcome of a scheduled save.
#[derive(Clone, Debug)]
pub enum AutosaveEvent {
    Saved {
        document: DocumentId,
        receipt: SaveReceipt,
    },
    /// The current branch changed after the edit was captured; the content
    /// was not saved.
    Dropped {
        document: DocumentId,
        branch: String,
        current: String,
    },
    Failed {
        document: DocumentId,
        error: String,
    },
}

enum Command<D> {
    Changed {
        document: DocumentId,
        branch: String,
        content: D,
    },
    Flush {
        document: DocumentId,
        reply: Sender<Result<Option<SaveReceipt>>>,
    },
    Cancel {
        document: DocumentId,
    },
    Shutdown,
}

struct Pending<D> {
    branch: String,
    content: D,
    deadline: Instant,
}

/// Coalesces editor changes into saves on a [`VersionStore`].
pub struct AutosaveScheduler<C: ContentCodec> {
    store: Arc<VersionStore<C>>,
    enabled: bool,
    debounce: Duration,
    commands: Sender<Command<C::Document>>,
    events: Receiver<AutosaveEvent>,
    worker: Option<JoinHandle<()>>,
}

impl<C: ContentCodec> AutosaveScheduler<C> {
    /// Start a scheduler using the store's autosave settings.
    pub fn new(store: Arc<VersionStore<C>>) -> Result<Self> {
        let autosave = store.config().autosave.clone();
        Self::start(store, autosave.enabled, autosave.debounce())
    }

    /// Start a scheduler with an explicit quiet period.
    pub fn with_debounce(store: Arc<VersionStore<C>>, debounce: Duration) -> Result<Self> {
        Self::start(store, true, debounce)
    }

    fn start(store: Arc<VersionStore<C>>, enabled: bool, debounce: Duration) -> Result<Self> {
        let (commands, command_rx) = unbounded();
        let (event_tx, events) = bounded(EVENT_BUFFER);

        let worker = Worker {
            store: Arc::clone(&store),
            debounce,
            commands: command_rx,
            events: event_tx,
            pending: HashMap::new(),
        };
        let handle = thread::Builder::new()
            .name("folio-autosave".into())
            .spawn(move || worker.run())?;

        debug!(?debounce, enabled, "autosave scheduler started");

        Ok(Self {
            store,
            enabled,
            debounce,
            commands,
            events,
            worker: Some(handle),
        })
    }

    /// Quiet period before a pending change is saved.
    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// Receiver for save outcomes.
    pub fn events(&self) -> Receiver<AutosaveEvent> {
        self.events.clone()
    }

    /// Record new content for a document and restart its timer.
    ///
    /// The save targets the branch that is current now; if the branch has
    /// changed by the time the timer fires, the content is dropped.
    pub fn note_change(&self, document: &DocumentId, content: C::Document) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let branch = self.store.get_current_branch(document)?;
        self.send(Command::Changed {
            document: *document,
            branch,
            content,
        })
    }

    /// Save the document's pending content now.
    ///
    /// Returns `None` if nothing was pending or the pending content was
    /// dropped as stale.
    pub fn flush(&self, document: &DocumentId) -> Result<Option<SaveReceipt>> {
        let (reply, response) = bounded(1);
        self.send(Command::Flush {
            document: *document,
            reply,
        })?;
        response.recv().map_err(|_| StoreError::SchedulerStopped)?
    }

    /// Discard the document's pending content, if any.
    pub fn cancel(&self, document: &DocumentId) -> Result<()> {
        self.send(Command::Cancel {
            document: *document,
        })
    }

    /// Save everything pending and stop the worker.
    pub fn shutdown(&mut self) -> Result<()> {
        let handle = match self.worker.take() {
            Some(handle) => handle,
            None => return Ok(()),
        };
        let _ = self.commands.send(Command::Shutdown);
        handle.join().map_err(|_| StoreError::SchedulerStopped)
    }

    fn send(&self, command: Command<C::Document>) -> Result<()> {
        if self.worker.is_none() {
            return Err(StoreError::SchedulerStopped);
        }
        self.commands
            .send(command)
            .map_err(|_| StoreError::SchedulerStopped)
    }
}

impl<C: ContentCodec> Drop for AutosaveScheduler<C> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "autosave worker did not shut down cleanly");
        }
    }
}

struct Worker<C: ContentCodec> {
    store: Arc<VersionStore<C>>,
    debounce: Duration,
    commands: Receiver<Command<C::Document>>,
    events: Sender<AutosaveEvent>,
    pending: HashMap<DocumentId, Pending<C::Document>>,
}

impl<C: ContentCodec> Worker<C> {
    fn run(mut self) {
        loop {
            let next_deadline = self.pending.values().map(|p| p.deadline).min();
            let command = match next_deadline {
                Some(deadline) => self
                    .commands
                    .recv_timeout(deadline.saturating_duration_since(Instant::now())),
                None => self
                    .commands
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
            };

            match command {
                Ok(Command::Changed {
                    document,
                    branch,
                    content,
                }) => {
                    self.pending.insert(
                        document,
                        Pending {
                            branch,
                            content,
                            deadline: Instant::now() + self.debounce,
                        },
                    );
                }
                Ok(Command::Flush { document, reply }) => {
                    let result = match self.pending.remove(&document) {
                        Some(pending) => self.save(document, pending),
                        None => Ok(None),
                    };
                    let _ = reply.send(result);
                }
                Ok(Command::Cancel { document }) => {
                    if self.pending.remove(&document).is_some() {
                        debug!(document = %document, "pending autosave cancelled");
                    }
                }
                Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    self.flush_all();
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {}
            }

            self.fire_due();
        }

        debug!("autosave scheduler stopped");
    }

    fn fire_due(&mut self) {
        let now = Instant::now();
        let due: Vec<DocumentId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for document in due {
            if let Some(pending) = self.pending.remove(&document) {
                let _ = self.save(document, pending);
            }
        }
    }

    fn flush_all(&mut self) {
        let pending: Vec<_> = self.pending.drain().collect();
        for (document, pending) in pending {
            let _ = self.save(document, pending);
        }
    }

    fn save(
        &self,
        document: DocumentId,
        pending: Pending<C::Document>,
    ) -> Result<Option<SaveReceipt>> {
        match self
            .store
            .save_version_on(&document, &pending.branch, &pending.content)
        {
            Ok(receipt) => {
                debug!(document = %document, version = %receipt.version, "autosaved");
                self.publish(AutosaveEvent::Saved {
                    document,
                    receipt: receipt.clone(),
                });
                Ok(Some(receipt))
            }
            Err(StoreError::StaleBranch { expected, actual }) => {
                warn!(
                    document = %document,
                    branch = %expected,
                    current = %actual,
                    "dropping autosave captured on a branch that is no longer current"
                );
                self.publish(AutosaveEvent::Dropped {
                    document,
                    branch: expected,
                    current: actual,
                });
                Ok(None)
            }
            Err(e) => {
                warn!(document = %document, error = %e, "autosave failed");
                self.publish(AutosaveEvent::Failed {
                    document,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn publish(&self, event: AutosaveEvent) {
        // Nobody listening, or listener too slow: drop.
        let _ = self.events.try_send(event);
    }
}
