use ulid::Ulid;

use crate::model::*;

use super::reconcile::free_windows;
use super::{Engine, EngineError};

fn property_info(ps: &PropertyState) -> PropertyInfo {
    PropertyInfo {
        id: ps.id,
        owner_id: ps.owner_id,
        details: ps.details.clone(),
    }
}

fn listing_info(property_id: Ulid, l: &Listing) -> ListingInfo {
    ListingInfo {
        id: l.id,
        property_id,
        start: l.span.start,
        end: l.span.end,
    }
}

fn rental_info(property_id: Ulid, r: &Rental) -> RentalInfo {
    RentalInfo {
        id: r.id,
        property_id,
        renter_id: r.renter_id,
        start: r.span.start,
        end: r.span.end,
    }
}

fn connection_info(user_id: Ulid, c: &Connection) -> ConnectionInfo {
    ConnectionInfo {
        user_id,
        provider: c.provider,
        uid: c.uid.clone(),
        name: c.name.clone(),
        expires_at: c.expires_at,
        linked_at: c.linked_at,
    }
}

impl Engine {
    pub async fn property_info(&self, id: &Ulid) -> Option<PropertyInfo> {
        let ps = self.get_property(id)?;
        let guard = ps.read().await;
        Some(property_info(&guard))
    }

    /// Wigwams in creation order.
    pub async fn list_properties(&self, limit: usize) -> Vec<PropertyInfo> {
        let mut out = Vec::new();
        for ps in self.property_handles() {
            out.push(property_info(&*ps.read().await));
        }
        out.sort_by_key(|p| p.id);
        out.truncate(limit);
        out
    }

    pub async fn properties_of_owner(&self, owner_id: Ulid) -> Vec<PropertyInfo> {
        let mut out = Vec::new();
        for ps in self.property_handles() {
            let guard = ps.read().await;
            if guard.owner_id == owner_id {
                out.push(property_info(&guard));
            }
        }
        out.sort_by_key(|p| p.id);
        out
    }

    /// Wigwams with a single listing that covers all of `[start, end]`.
    pub async fn properties_in_range(&self, start: Ms, end: Ms) -> Vec<PropertyInfo> {
        let window = Span { start, end };
        let mut out = Vec::new();
        for ps in self.property_handles() {
            let guard = ps.read().await;
            if guard.listings.iter().any(|l| l.span.covers(&window)) {
                out.push(property_info(&guard));
            }
        }
        out.sort_by_key(|p| p.id);
        out
    }

    pub async fn get_listings(&self, property_id: Ulid) -> Result<Vec<ListingInfo>, EngineError> {
        let ps = match self.get_property(&property_id) {
            Some(ps) => ps,
            None => return Ok(vec![]),
        };
        let guard = ps.read().await;
        Ok(guard
            .listings
            .iter()
            .map(|l| listing_info(property_id, l))
            .collect())
    }

    pub async fn get_rentals(&self, property_id: Ulid) -> Result<Vec<RentalInfo>, EngineError> {
        let ps = match self.get_property(&property_id) {
            Some(ps) => ps,
            None => return Ok(vec![]),
        };
        let guard = ps.read().await;
        Ok(guard
            .rentals
            .iter()
            .map(|r| rental_info(property_id, r))
            .collect())
    }

    /// Windows in which a rental could still be booked.
    pub async fn get_availability(&self, property_id: Ulid) -> Result<Vec<Span>, EngineError> {
        let ps = self
            .get_property(&property_id)
            .ok_or(EngineError::NotFound(property_id))?;
        let guard = ps.read().await;
        Ok(free_windows(&guard.listings, &guard.rentals))
    }

    /// Newest listings across all wigwams, newest first.
    pub async fn recent_listings(&self, n: usize) -> Vec<ListingInfo> {
        let mut out = Vec::new();
        for ps in self.property_handles() {
            let guard = ps.read().await;
            out.extend(guard.listings.iter().map(|l| listing_info(guard.id, l)));
        }
        out.sort_by(|a, b| b.id.cmp(&a.id));
        out.truncate(n);
        out
    }

    /// Newest rentals across all wigwams, newest first.
    pub async fn recent_rentals(&self, n: usize) -> Vec<RentalInfo> {
        let mut out = Vec::new();
        for ps in self.property_handles() {
            let guard = ps.read().await;
            out.extend(guard.rentals.iter().map(|r| rental_info(guard.id, r)));
        }
        out.sort_by(|a, b| b.id.cmp(&a.id));
        out.truncate(n);
        out
    }

    /// All rentals booked by a user, ordered by start.
    pub async fn rentals_for_user(&self, user_id: Ulid) -> Vec<RentalInfo> {
        let mut out = Vec::new();
        for ps in self.property_handles() {
            let guard = ps.read().await;
            out.extend(
                guard
                    .rentals
                    .iter()
                    .filter(|r| r.renter_id == user_id)
                    .map(|r| rental_info(guard.id, r)),
            );
        }
        out.sort_by_key(|r| (r.start, r.id));
        out
    }

    /// The user's earliest rental at the property that has not ended by `now`.
    pub async fn rental_for(&self, user_id: Ulid, property_id: Ulid, now: Ms) -> Option<RentalInfo> {
        let ps = self.get_property(&property_id)?;
        let guard = ps.read().await;
        guard
            .rentals
            .iter()
            .find(|r| r.renter_id == user_id && r.span.end > now)
            .map(|r| rental_info(property_id, r))
    }

    pub async fn owns(&self, user_id: Ulid, property_id: Ulid) -> bool {
        match self.get_property(&property_id) {
            Some(ps) => ps.read().await.owner_id == user_id,
            None => false,
        }
    }

    /// A user with the name and provider of their active connection.
    pub fn get_user(&self, id: &Ulid) -> Option<UserInfo> {
        let user = self.users.get(id)?;
        let active = user.active_connection();
        Some(UserInfo {
            id: user.id,
            email: user.email.clone(),
            name: active.and_then(|c| c.name.clone()),
            provider: active.map(|c| c.provider),
        })
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// A user's connections, most recently linked first.
    pub fn get_connections(&self, user_id: &Ulid) -> Vec<ConnectionInfo> {
        let Some(user) = self.users.get(user_id) else {
            return Vec::new();
        };
        let mut out: Vec<ConnectionInfo> = user
            .connections
            .iter()
            .map(|c| connection_info(*user_id, c))
            .collect();
        out.sort_by(|a, b| b.linked_at.cmp(&a.linked_at));
        out
    }

    pub fn active_connection(&self, user_id: &Ulid) -> Option<ConnectionInfo> {
        let user = self.users.get(user_id)?;
        user.active_connection().map(|c| connection_info(*user_id, c))
    }

    pub fn connection_for(&self, user_id: &Ulid, provider: Provider) -> Option<ConnectionInfo> {
        let user = self.users.get(user_id)?;
        user.connection_for(provider).map(|c| connection_info(*user_id, c))
    }
}
