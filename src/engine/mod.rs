mod admission;
mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedSpotState = Arc<RwLock<SpotState>>;

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
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                                .record(batch.len() as f64);
                            let flush_start = std::time::Instant::now();
                            let result = flush_batch(&mut wal, &mut batch);
                            metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                                .record(flush_start.elapsed().as_secs_f64());
                            respond_batch(&mut batch, &result);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                        .record(batch.len() as f64);
                    let flush_start = std::time::Instant::now();
                    let result = flush_batch(&mut wal, &mut batch);
                    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                        .record(flush_start.elapsed().as_secs_f64());
                    respond_batch(&mut batch, &result);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
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
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// One tenant's reservation state. Spots carry their reservations behind a
/// per-spot RwLock; the write guard is the admission critical section.
pub struct Engine {
    pub spots: DashMap<Ulid, SharedSpotState>,
    pub lots: DashMap<Ulid, Lot>,
    pub users: DashMap<Ulid, User>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: reservation id → spot id
    pub(super) reservation_spot: DashMap<Ulid, Ulid>,
    /// Lot → spot ids index for O(1) member lookups.
    pub(super) lot_spots: DashMap<Ulid, Vec<Ulid>>,
    /// User → reservation ids, every status.
    pub(super) user_reservations: DashMap<Ulid, Vec<Ulid>>,
    /// Email → user id, enforcing global uniqueness.
    pub(super) email_index: DashMap<String, Ulid>,
}

/// Apply a spot-scoped event directly to a SpotState (no locking — caller holds the lock).
fn apply_to_spot(
    rs: &mut SpotState,
    event: &Event,
    reservation_spot: &DashMap<Ulid, Ulid>,
    user_reservations: &DashMap<Ulid, Vec<Ulid>>,
) {
    match event {
        Event::ReservationCreated {
            id,
            spot_id,
            user_id,
            window,
        } => {
            rs.insert_reservation(Reservation {
                id: *id,
                user_id: *user_id,
                window: *window,
                status: ReservationStatus::Active,
            });
            reservation_spot.insert(*id, *spot_id);
            user_reservations.entry(*user_id).or_default().push(*id);
        }
        Event::ReservationStatusChanged { id, status, .. } => {
            if let Some(r) = rs.reservation_mut(*id) {
                r.status = *status;
            }
        }
        // Registry events are handled at the map level, not here
        _ => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            spots: DashMap::new(),
            lots: DashMap::new(),
            users: DashMap::new(),
            wal_tx,
            notify,
            reservation_spot: DashMap::new(),
            lot_spots: DashMap::new(),
            user_reservations: DashMap::new(),
            email_index: DashMap::new(),
        };

        // Replay events — we're the sole owner of these Arcs, so try_read/try_write
        // always succeed instantly (no contention). Never use blocking_read/blocking_write
        // here because this may run inside an async context (e.g. lazy tenant creation).
        for event in &events {
            match event {
                Event::LotCreated {
                    id,
                    name,
                    address,
                    open_minute,
                    close_minute,
                } => {
                    engine.lots.insert(
                        *id,
                        Lot {
                            id: *id,
                            name: name.clone(),
                            address: address.clone(),
                            open_minute: *open_minute,
                            close_minute: *close_minute,
                        },
                    );
                }
                Event::LotDeleted { id } => {
                    // Cascaded SpotDeleted events precede this in the log
                    engine.lots.remove(id);
                    engine.lot_spots.remove(id);
                }
                Event::SpotCreated {
                    id,
                    lot_id,
                    spot_number,
                    kind,
                    is_active,
                } => {
                    let rs =
                        SpotState::new(*id, *lot_id, spot_number.clone(), *kind, *is_active);
                    engine.spots.insert(*id, Arc::new(RwLock::new(rs)));
                    engine.lot_spots.entry(*lot_id).or_default().push(*id);
                }
                Event::SpotDeleted { id, lot_id } => {
                    if let Some(entry) = engine.spots.get(id) {
                        let rs = entry.try_read().expect("replay: uncontended read");
                        engine.unindex_reservations(&rs);
                    }
                    engine.spots.remove(id);
                    if let Some(mut members) = engine.lot_spots.get_mut(lot_id) {
                        members.retain(|s| s != id);
                    }
                }
                Event::UserCreated {
                    id,
                    email,
                    first_name,
                    last_name,
                    phone,
                } => {
                    engine.users.insert(
                        *id,
                        User {
                            id: *id,
                            email: email.clone(),
                            first_name: first_name.clone(),
                            last_name: last_name.clone(),
                            phone: phone.clone(),
                        },
                    );
                    engine.email_index.insert(email.clone(), *id);
                }
                other => {
                    if let Some(spot_id) = other.spot_id()
                        && let Some(entry) = engine.spots.get(&spot_id)
                    {
                        let rs_arc = entry.clone();
                        let mut guard = rs_arc.try_write().expect("replay: uncontended write");
                        apply_to_spot(
                            &mut guard,
                            other,
                            &engine.reservation_spot,
                            &engine.user_reservations,
                        );
                    }
                }
            }
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

    pub fn get_spot(&self, id: &Ulid) -> Option<SharedSpotState> {
        self.spots.get(id).map(|e| e.value().clone())
    }

    pub fn spot_of_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_spot.get(reservation_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify in one call, while the caller holds the
    /// spot's write lock. Eliminates the repeated 3-line pattern.
    pub(super) async fn persist_and_apply(
        &self,
        spot_id: Ulid,
        rs: &mut SpotState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_spot(rs, event, &self.reservation_spot, &self.user_reservations);
        self.notify.send(spot_id, event);
        Ok(())
    }

    /// Lookup reservation → spot, get spot, acquire write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<SpotState>), EngineError> {
        let spot_id = self
            .spot_of_reservation(reservation_id)
            .ok_or(EngineError::NotFound(*reservation_id))?;
        let rs = self
            .get_spot(&spot_id)
            .ok_or(EngineError::NotFound(spot_id))?;
        let guard = rs.write_owned().await;
        Ok((spot_id, guard))
    }

    /// Drop a deleted spot's reservations from the reverse indexes.
    pub(super) fn unindex_reservations(&self, rs: &SpotState) {
        for r in &rs.reservations {
            self.reservation_spot.remove(&r.id);
            if let Some(mut owned) = self.user_reservations.get_mut(&r.user_id) {
                owned.retain(|id| id != &r.id);
            }
        }
    }
}
