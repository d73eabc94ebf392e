use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, now_ms, validate_window};
use super::{Engine, EngineError};

impl Engine {
    /// Admit a reservation for `[start, end)` on a spot.
    ///
    /// Precondition order (first failure wins): interval validity, start in
    /// the future, user exists, spot exists, spot active, no overlapping
    /// active reservation. The overlap check through the WAL commit runs
    /// under the spot's write lock, so two concurrent requests for the same
    /// spot cannot both observe "no conflict"; requests for different spots
    /// never contend.
    pub async fn create_reservation(
        &self,
        id: Ulid,
        user_id: Ulid,
        spot_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<ReservationDetail, EngineError> {
        let window = validate_window(start, end)?;
        let now = now_ms();
        if window.start <= now {
            return Err(EngineError::PastStartTime {
                start: window.start,
                now,
            });
        }
        let user = self
            .users
            .get(&user_id)
            .map(|u| u.value().clone())
            .ok_or(EngineError::UserNotFound(user_id))?;
        let rs = self
            .get_spot(&spot_id)
            .ok_or(EngineError::SpotNotFound(spot_id))?;

        let mut guard = rs.write().await;
        if !guard.is_active {
            return Err(EngineError::SpotInactive(spot_id));
        }
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_SPOT {
            return Err(EngineError::LimitExceeded("too many reservations on spot"));
        }
        if self.reservation_spot.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        check_no_conflict(&guard, &window)?;

        let event = Event::ReservationCreated {
            id,
            spot_id,
            user_id,
            window,
        };
        self.persist_and_apply(spot_id, &mut guard, &event).await?;

        let reservation = guard
            .reservation(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        self.build_detail(&guard, &reservation, &user)
    }

    /// Cancel an active reservation. Cancellation never conflicts, so no
    /// interval re-check is needed; the transition table guards the rest.
    pub async fn cancel_reservation(&self, id: Ulid) -> Result<Ulid, EngineError> {
        self.transition_reservation(id, ReservationStatus::Cancelled)
            .await
    }

    /// Mark an elapsed active reservation completed. Driven by the completer
    /// task; shares the cancel path's transition rules.
    pub async fn complete_reservation(&self, id: Ulid) -> Result<Ulid, EngineError> {
        self.transition_reservation(id, ReservationStatus::Completed)
            .await
    }

    async fn transition_reservation(
        &self,
        id: Ulid,
        next: ReservationStatus,
    ) -> Result<Ulid, EngineError> {
        let (spot_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let current = guard
            .reservation(id)
            .map(|r| r.status)
            .ok_or(EngineError::NotFound(id))?;
        if !current.can_become(next) {
            return Err(EngineError::AlreadyFinalized { id, status: current });
        }

        let event = Event::ReservationStatusChanged {
            id,
            spot_id,
            status: next,
        };
        self.persist_and_apply(spot_id, &mut guard, &event).await?;
        Ok(spot_id)
    }

    /// Collect active reservations whose window has fully elapsed.
    /// Spots busy with a writer are skipped and picked up next sweep.
    pub fn collect_elapsed_active(&self, now: Ms) -> Vec<Ulid> {
        let mut elapsed = Vec::new();
        for entry in self.spots.iter() {
            let rs = entry.value().clone();
            if let Ok(guard) = rs.try_read() {
                for reservation in &guard.reservations {
                    if reservation.is_active() && reservation.window.end <= now {
                        elapsed.push(reservation.id);
                    }
                }
            }
        }
        elapsed
    }
}
