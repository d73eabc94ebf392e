use ulid::Ulid;

use crate::model::*;

use super::conflict::now_ms;
use super::{Engine, EngineError};

impl Engine {
    /// Assemble the enriched projection for a reservation. Always a
    /// query-time join — summaries are never stored on the reservation.
    pub(super) fn build_detail(
        &self,
        rs: &SpotState,
        reservation: &Reservation,
        user: &User,
    ) -> Result<ReservationDetail, EngineError> {
        let lot = self
            .lots
            .get(&rs.lot_id)
            .ok_or(EngineError::NotFound(rs.lot_id))?;
        Ok(ReservationDetail {
            id: reservation.id,
            start: reservation.window.start,
            end: reservation.window.end,
            status: reservation.status,
            user: UserSummary::from(user),
            spot: SpotSummary {
                id: rs.id,
                spot_number: rs.spot_number.clone(),
                kind: rs.kind,
                lot: LotSummary::from(lot.value()),
            },
        })
    }

    /// A user's active reservations that start in the future, ascending by
    /// start time. Pure read; takes spot read locks only.
    pub async fn upcoming_reservations(
        &self,
        user_id: Ulid,
    ) -> Result<Vec<ReservationDetail>, EngineError> {
        let user = self
            .users
            .get(&user_id)
            .map(|u| u.value().clone())
            .ok_or(EngineError::UserNotFound(user_id))?;

        let owned: Vec<Ulid> = self
            .user_reservations
            .get(&user_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        let now = now_ms();
        let mut upcoming = Vec::new();
        for reservation_id in owned {
            let Some(spot_id) = self.spot_of_reservation(&reservation_id) else {
                continue;
            };
            let Some(rs) = self.get_spot(&spot_id) else {
                continue;
            };
            let guard = rs.read().await;
            if let Some(reservation) = guard.reservation(reservation_id)
                && reservation.is_active()
                && reservation.window.start > now
            {
                upcoming.push(self.build_detail(&guard, reservation, &user)?);
            }
        }

        upcoming.sort_by_key(|d| d.start);
        Ok(upcoming)
    }

    /// Point lookup with enrichment. Unknown ids are None, not an error.
    pub async fn get_reservation(
        &self,
        id: Ulid,
    ) -> Result<Option<ReservationDetail>, EngineError> {
        let Some(spot_id) = self.spot_of_reservation(&id) else {
            return Ok(None);
        };
        let Some(rs) = self.get_spot(&spot_id) else {
            return Ok(None);
        };
        let guard = rs.read().await;
        let Some(reservation) = guard.reservation(id) else {
            return Ok(None);
        };
        let user = self
            .users
            .get(&reservation.user_id)
            .map(|u| u.value().clone())
            .ok_or(EngineError::UserNotFound(reservation.user_id))?;
        Ok(Some(self.build_detail(&guard, reservation, &user)?))
    }

    pub fn list_lots(&self) -> Vec<Lot> {
        let mut lots: Vec<Lot> = self.lots.iter().map(|e| e.value().clone()).collect();
        lots.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        lots
    }

    /// Spots of one lot with their lot summary, ordered by spot number.
    /// An unknown lot yields an empty list.
    pub async fn lot_spot_infos(&self, lot_id: Ulid) -> Vec<SpotInfo> {
        let members: Vec<Ulid> = self
            .lot_spots
            .get(&lot_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        let mut infos = Vec::with_capacity(members.len());
        for spot_id in members {
            if let Some(info) = self.get_spot_info(spot_id).await {
                infos.push(info);
            }
        }
        infos.sort_by(|a, b| {
            a.spot_number
                .cmp(&b.spot_number)
                .then_with(|| a.id.cmp(&b.id))
        });
        infos
    }

    pub async fn get_spot_info(&self, id: Ulid) -> Option<SpotInfo> {
        let rs = self.get_spot(&id)?;
        let guard = rs.read().await;
        let lot = self.lots.get(&guard.lot_id)?;
        Some(SpotInfo {
            id: guard.id,
            lot_id: guard.lot_id,
            spot_number: guard.spot_number.clone(),
            kind: guard.kind,
            is_active: guard.is_active,
            lot: LotSummary::from(lot.value()),
        })
    }
}
