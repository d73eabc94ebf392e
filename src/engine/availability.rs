use ulid::Ulid;

use crate::limits::MAX_PAGE_LIMIT;
use crate::model::*;

use super::conflict::validate_query_window;
use super::{Engine, EngineError};

/// True when the spot can take a new reservation for the window: it is
/// active and no active reservation overlaps. The same predicate admission
/// uses, phrased as a filter.
pub(crate) fn free_for_window(rs: &SpotState, window: &Span) -> bool {
    rs.is_active && !rs.overlapping(window).any(|r| r.is_active())
}

/// Clamp pagination inputs and return the index range for the page.
/// Pages are 1-based; a zero limit falls back to the default.
pub(crate) fn page_bounds(page: usize, limit: usize, total: usize) -> (usize, usize) {
    let limit = if limit == 0 { DEFAULT_PAGE_LIMIT } else { limit.min(MAX_PAGE_LIMIT) };
    let page = page.max(1);
    let offset = (page - 1).saturating_mul(limit).min(total);
    let end = offset.saturating_add(limit).min(total);
    (offset, end)
}

pub(crate) const DEFAULT_PAGE_LIMIT: usize = 10;

impl Engine {
    /// Free spots for a window: active spots with no overlapping active
    /// reservation, optionally restricted to one lot. One pass over the
    /// candidates — the set-exclusion shape — with each spot checked under
    /// its read lock so a half-applied admission is never observed.
    /// Ordered by spot number ascending, then paginated.
    pub async fn availability(
        &self,
        start: Ms,
        end: Ms,
        lot_id: Option<Ulid>,
        page: usize,
        limit: usize,
    ) -> Result<Vec<SpotInfo>, EngineError> {
        let window = validate_query_window(start, end)?;

        let candidates: Vec<Ulid> = match lot_id {
            // Unknown lot filter → empty page, not an error
            Some(lot) => self
                .lot_spots
                .get(&lot)
                .map(|e| e.value().clone())
                .unwrap_or_default(),
            None => self.spots.iter().map(|e| *e.key()).collect(),
        };

        let mut free: Vec<SpotInfo> = Vec::new();
        for spot_id in candidates {
            let Some(rs) = self.get_spot(&spot_id) else {
                continue;
            };
            let guard = rs.read().await;
            if !free_for_window(&guard, &window) {
                continue;
            }
            let Some(lot) = self.lots.get(&guard.lot_id) else {
                continue;
            };
            free.push(SpotInfo {
                id: guard.id,
                lot_id: guard.lot_id,
                spot_number: guard.spot_number.clone(),
                kind: guard.kind,
                is_active: guard.is_active,
                lot: LotSummary::from(lot.value()),
            });
        }

        free.sort_by(|a, b| {
            a.spot_number
                .cmp(&b.spot_number)
                .then_with(|| a.id.cmp(&b.id))
        });

        let (offset, end) = page_bounds(page, limit, free.len());
        Ok(free[offset..end].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn spot(is_active: bool, windows: &[(Ms, Ms, ReservationStatus)]) -> SpotState {
        let mut rs = SpotState::new(Ulid::new(), Ulid::new(), "A01".into(), SpotKind::Regular, is_active);
        for &(start, end, status) in windows {
            rs.insert_reservation(Reservation {
                id: Ulid::new(),
                user_id: Ulid::new(),
                window: Span::new(start, end),
                status,
            });
        }
        rs
    }

    #[test]
    fn free_when_no_reservations() {
        let rs = spot(true, &[]);
        assert!(free_for_window(&rs, &Span::new(0, 1000)));
    }

    #[test]
    fn not_free_when_active_overlaps() {
        let rs = spot(true, &[(500, 1500, ReservationStatus::Active)]);
        assert!(!free_for_window(&rs, &Span::new(0, 1000)));
    }

    #[test]
    fn free_when_only_terminal_overlaps() {
        let rs = spot(
            true,
            &[
                (500, 1500, ReservationStatus::Cancelled),
                (200, 800, ReservationStatus::Completed),
            ],
        );
        assert!(free_for_window(&rs, &Span::new(0, 1000)));
    }

    #[test]
    fn free_when_windows_touch() {
        let rs = spot(true, &[(1000, 2000, ReservationStatus::Active)]);
        assert!(free_for_window(&rs, &Span::new(2000, 3000)));
        assert!(free_for_window(&rs, &Span::new(0, 1000)));
    }

    #[test]
    fn inactive_spot_never_free() {
        let rs = spot(false, &[]);
        assert!(!free_for_window(&rs, &Span::new(0, 1000)));
    }

    #[test]
    fn page_bounds_basics() {
        assert_eq!(page_bounds(1, 10, 25), (0, 10));
        assert_eq!(page_bounds(2, 10, 25), (10, 20));
        assert_eq!(page_bounds(3, 10, 25), (20, 25));
        assert_eq!(page_bounds(4, 10, 25), (25, 25));
    }

    #[test]
    fn page_bounds_clamps_inputs() {
        // page 0 behaves like page 1, limit 0 falls back to the default
        assert_eq!(page_bounds(0, 10, 25), (0, 10));
        assert_eq!(page_bounds(1, 0, 25), (0, DEFAULT_PAGE_LIMIT));
        // oversized limit is capped
        let (offset, end) = page_bounds(1, MAX_PAGE_LIMIT * 10, 100);
        assert_eq!((offset, end), (0, 100));
    }
}
