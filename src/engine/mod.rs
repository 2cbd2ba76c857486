mod availability;
mod conflict;
mod error;
mod mutations;
pub mod policy;
mod queries;

pub use availability::{availability, window_days, window_range};
pub use error::{EngineError, ErrorClass};
pub use mutations::{NewField, NewMessage, NewReservation, NewUser};
pub use queries::DELETED_FIELD_NAME;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::dispatch::{ConfirmationDispatcher, LogDispatcher};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedFieldState = Arc<RwLock<FieldState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(error = %e, batch = batch.len(), "WAL flush failed");
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so buffered bytes never leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub(super) fields: DashMap<Ulid, SharedFieldState>,
    /// Every reservation ever made, including those of deleted fields.
    pub(super) reservations: DashMap<Ulid, Reservation>,
    pub(super) users: DashMap<Ulid, User>,
    /// Normalized email → user id.
    pub(super) emails: DashMap<String, Ulid>,
    pub(super) messages: DashMap<Ulid, Message>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) dispatcher: Arc<dyn ConfirmationDispatcher>,
    /// Held shared by every WAL-append-then-apply, exclusively by compaction,
    /// so a compaction snapshot never misses an appended event.
    pub(super) commit_gate: RwLock<()>,
    /// Serializes field creation and deletion.
    pub(super) catalog_lock: Mutex<()>,
    /// Serializes cancellation of reservations whose field is gone.
    pub(super) orphan_lock: Mutex<()>,
    /// Serializes the email uniqueness check with the insert.
    pub(super) registration_lock: Mutex<()>,
}

/// Apply an event to a field's state. Caller holds the lock.
fn apply_to_field(fs: &mut FieldState, event: &Event) {
    match event {
        Event::FieldUpdated { field } => fs.field = field.clone(),
        Event::ReservationCreated { reservation } if reservation.is_confirmed() => {
            fs.claim(reservation.slot(), reservation.id);
        }
        _ => {}
    }
}

/// Field id an event belongs to, for events that touch a field's slot index.
fn event_field_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::FieldUpdated { field } => Some(field.id),
        Event::ReservationCreated { reservation } => Some(reservation.field_id),
        Event::ReservationCancelled { field_id, .. } => Some(*field_id),
        _ => None,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        Self::with_dispatcher(wal_path, notify, Arc::new(LogDispatcher))
    }

    pub fn with_dispatcher(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        dispatcher: Arc<dyn ConfirmationDispatcher>,
    ) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            fields: DashMap::new(),
            reservations: DashMap::new(),
            users: DashMap::new(),
            emails: DashMap::new(),
            messages: DashMap::new(),
            wal_tx,
            notify,
            dispatcher,
            commit_gate: RwLock::new(()),
            catalog_lock: Mutex::new(()),
            orphan_lock: Mutex::new(()),
            registration_lock: Mutex::new(()),
        };

        // We are the sole owner of every Arc here, so try_write never contends.
        // Never block_on/blocking_write: this may run inside an async context.
        let replayed = events.len();
        for event in &events {
            match event {
                Event::FieldCreated { field } => {
                    engine
                        .fields
                        .insert(field.id, Arc::new(RwLock::new(FieldState::new(field.clone()))));
                }
                Event::FieldDeleted { id } => {
                    engine.fields.remove(id);
                }
                other => {
                    if let Some(field_id) = event_field_id(other)
                        && let Some(entry) = engine.fields.get(&field_id)
                    {
                        let fs = entry.value().clone();
                        drop(entry);
                        match fs.try_write() {
                            Ok(mut guard) => engine.apply(Some(&mut *guard), other),
                            Err(_) => {
                                return Err(io::Error::other("replay: field state unexpectedly locked"));
                            }
                        }
                    } else {
                        engine.apply(None, other);
                    }
                }
            }
        }
        if replayed > 0 {
            tracing::info!(
                events = replayed,
                fields = engine.fields.len(),
                reservations = engine.reservations.len(),
                users = engine.users.len(),
                "WAL replayed"
            );
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Apply an event to the in-memory collections. `fs` is the locked state of
    /// the event's field, when that field still exists.
    pub(super) fn apply(&self, fs: Option<&mut FieldState>, event: &Event) {
        match event {
            Event::UserRegistered { user } => {
                self.emails.insert(user.email.clone(), user.id);
                self.users.insert(user.id, user.clone());
            }
            Event::ReservationCreated { reservation } => {
                self.reservations.insert(reservation.id, reservation.clone());
            }
            Event::ReservationCancelled { id, .. } => {
                if let Some(mut r) = self.reservations.get_mut(id) {
                    if let Some(fs) = fs {
                        fs.release(&r.slot(), r.id);
                    }
                    r.status = ReservationStatus::Cancelled;
                    r.qr_code = None;
                }
                return;
            }
            Event::MessagePosted { message } => {
                self.messages.insert(message.id, message.clone());
            }
            Event::MessageDeleted { id } => {
                self.messages.remove(id);
            }
            Event::FieldCreated { .. } | Event::FieldUpdated { .. } | Event::FieldDeleted { .. } => {}
        }
        if let Some(fs) = fs {
            apply_to_field(fs, event);
        }
    }

    /// WAL-append then apply, under the commit gate held by the caller.
    pub(super) async fn persist_and_apply(
        &self,
        fs: Option<&mut FieldState>,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply(fs, event);
        Ok(())
    }

    pub fn get_field_state(&self, id: &Ulid) -> Option<SharedFieldState> {
        self.fields.get(id).map(|e| e.value().clone())
    }

    /// Write-lock a field, re-checking it was not deleted while we waited.
    pub(super) async fn lock_field(
        &self,
        id: Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<FieldState>, EngineError> {
        let fs = self
            .get_field_state(&id)
            .ok_or(EngineError::NotFound("field", id))?;
        let guard = fs.write_owned().await;
        if !self.fields.contains_key(&id) {
            return Err(EngineError::NotFound("field", id));
        }
        Ok(guard)
    }
}
