use std::sync::Arc;

use tokio::sync::{RwLock, oneshot};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, WalCommand};

impl Engine {
    pub async fn create_lot(
        &self,
        id: Ulid,
        name: String,
        address: String,
        open_minute: u16,
        close_minute: u16,
    ) -> Result<(), EngineError> {
        if self.lots.len() >= MAX_LOTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many lots"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("lot name too long"));
        }
        if address.len() > MAX_ADDRESS_LEN {
            return Err(EngineError::LimitExceeded("lot address too long"));
        }
        if self.lots.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::LotCreated {
            id,
            name: name.clone(),
            address: address.clone(),
            open_minute,
            close_minute,
        };
        self.wal_append(&event).await?;
        self.lots.insert(
            id,
            Lot {
                id,
                name,
                address,
                open_minute,
                close_minute,
            },
        );
        Ok(())
    }

    /// Delete a lot and cascade to its spots (and their reservations).
    /// Each removed spot gets its own WAL event so replay stays a plain fold.
    pub async fn delete_lot(&self, id: Ulid) -> Result<(), EngineError> {
        if !self.lots.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }

        let members: Vec<Ulid> = self
            .lot_spots
            .get(&id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        for spot_id in members {
            self.remove_spot(spot_id).await?;
        }

        let event = Event::LotDeleted { id };
        self.wal_append(&event).await?;
        self.lots.remove(&id);
        self.lot_spots.remove(&id);
        Ok(())
    }

    pub async fn create_spot(
        &self,
        id: Ulid,
        lot_id: Ulid,
        spot_number: String,
        kind: SpotKind,
        is_active: bool,
    ) -> Result<(), EngineError> {
        if self.spots.len() >= MAX_SPOTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many spots"));
        }
        if spot_number.len() > MAX_SPOT_NUMBER_LEN {
            return Err(EngineError::LimitExceeded("spot number too long"));
        }
        if self.spots.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if !self.lots.contains_key(&lot_id) {
            return Err(EngineError::NotFound(lot_id));
        }

        // spot_number is unique within its lot
        let siblings: Vec<Ulid> = self
            .lot_spots
            .get(&lot_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        for sibling_id in siblings {
            if let Some(sibling) = self.get_spot(&sibling_id) {
                let guard = sibling.read().await;
                if guard.spot_number == spot_number {
                    return Err(EngineError::DuplicateSpotNumber {
                        lot_id,
                        spot_number,
                    });
                }
            }
        }

        let event = Event::SpotCreated {
            id,
            lot_id,
            spot_number: spot_number.clone(),
            kind,
            is_active,
        };
        self.wal_append(&event).await?;
        let rs = SpotState::new(id, lot_id, spot_number, kind, is_active);
        self.spots.insert(id, Arc::new(RwLock::new(rs)));
        self.lot_spots.entry(lot_id).or_default().push(id);
        self.notify.send(id, &event);
        Ok(())
    }

    pub async fn delete_spot(&self, id: Ulid) -> Result<(), EngineError> {
        if !self.spots.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.remove_spot(id).await
    }

    async fn remove_spot(&self, id: Ulid) -> Result<(), EngineError> {
        let Some(rs) = self.get_spot(&id) else {
            return Ok(());
        };
        let guard = rs.read().await;
        let lot_id = guard.lot_id;
        self.unindex_reservations(&guard);
        drop(guard);

        let event = Event::SpotDeleted { id, lot_id };
        self.wal_append(&event).await?;
        self.spots.remove(&id);
        if let Some(mut members) = self.lot_spots.get_mut(&lot_id) {
            members.retain(|s| s != &id);
        }
        self.notify.send(id, &event);
        self.notify.remove(&id);
        Ok(())
    }

    pub async fn create_user(
        &self,
        id: Ulid,
        email: String,
        first_name: String,
        last_name: String,
        phone: Option<String>,
    ) -> Result<(), EngineError> {
        if self.users.len() >= MAX_USERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if email.len() > MAX_EMAIL_LEN {
            return Err(EngineError::LimitExceeded("email too long"));
        }
        if first_name.len() > MAX_NAME_LEN || last_name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("name too long"));
        }
        if let Some(ref p) = phone
            && p.len() > MAX_PHONE_LEN
        {
            return Err(EngineError::LimitExceeded("phone too long"));
        }
        if self.users.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.email_index.contains_key(&email) {
            return Err(EngineError::DuplicateEmail(email));
        }

        let event = Event::UserCreated {
            id,
            email: email.clone(),
            first_name: first_name.clone(),
            last_name: last_name.clone(),
            phone: phone.clone(),
        };
        self.wal_append(&event).await?;
        self.users.insert(
            id,
            User {
                id,
                email: email.clone(),
                first_name,
                last_name,
                phone,
            },
        );
        self.email_index.insert(email, id);
        Ok(())
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate
    /// the current state. Terminal-status reservations are kept — they are
    /// state, not churn.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        for entry in self.users.iter() {
            let u = entry.value();
            events.push(Event::UserCreated {
                id: u.id,
                email: u.email.clone(),
                first_name: u.first_name.clone(),
                last_name: u.last_name.clone(),
                phone: u.phone.clone(),
            });
        }

        for entry in self.lots.iter() {
            let lot = entry.value();
            events.push(Event::LotCreated {
                id: lot.id,
                name: lot.name.clone(),
                address: lot.address.clone(),
                open_minute: lot.open_minute,
                close_minute: lot.close_minute,
            });
        }

        let spot_ids: Vec<Ulid> = self.spots.iter().map(|e| *e.key()).collect();
        for id in spot_ids {
            let Some(rs) = self.get_spot(&id) else { continue };
            let guard = rs.read().await;
            events.push(Event::SpotCreated {
                id: guard.id,
                lot_id: guard.lot_id,
                spot_number: guard.spot_number.clone(),
                kind: guard.kind,
                is_active: guard.is_active,
            });
            for r in &guard.reservations {
                events.push(Event::ReservationCreated {
                    id: r.id,
                    spot_id: guard.id,
                    user_id: r.user_id,
                    window: r.window,
                });
                if r.status != ReservationStatus::Active {
                    events.push(Event::ReservationStatusChanged {
                        id: r.id,
                        spot_id: guard.id,
                        status: r.status,
                    });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
