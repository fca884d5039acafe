use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::ADMISSIONS_TOTAL;
use crate::social::{social_provider, EventKind, SharedEvent, SocialCall, SocialError};

use super::reconcile::{is_viable, make_viable, ListingPlan};
use super::{email_key, Engine, EngineError, WalCommand};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    Span::new(span.start, span.end)?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

fn check_len(value: Option<&str>, max: usize, what: &'static str) -> Result<(), EngineError> {
    match value {
        Some(v) if v.len() > max => Err(EngineError::LimitExceeded(what)),
        _ => Ok(()),
    }
}

fn validate_details(details: &PropertyDetails) -> Result<(), EngineError> {
    check_len(Some(&details.name), MAX_NAME_LEN, "wigwam name too long")?;
    check_len(details.description.as_deref(), MAX_TEXT_LEN, "description too long")?;
    check_len(details.location.as_deref(), MAX_TEXT_LEN, "location too long")?;
    check_len(details.picture_url.as_deref(), MAX_TEXT_LEN, "picture url too long")
}

fn admission(kind: &'static str, outcome: &'static str) {
    metrics::counter!(ADMISSIONS_TOTAL, "kind" => kind, "outcome" => outcome).increment(1);
}

impl Engine {
    pub async fn create_user(&self, id: Ulid, email: Option<String>) -> Result<(), EngineError> {
        check_len(email.as_deref(), MAX_NAME_LEN, "email too long")?;
        let _commit = self.commit_gate.read().await;
        let _users = self.user_writes.lock().await;
        if self.users.len() >= MAX_USERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if self.users.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let event = Event::UserCreated { id, email };
        self.wal_append(&event).await?;
        self.apply_user_event(&event);
        Ok(())
    }

    /// Sign-in callback. Resolves the user for a provider identity, creating
    /// one if needed, and refreshes the connection. Returns the user id.
    pub async fn connect(&self, new_user_id: Ulid, link: NewConnection) -> Result<Ulid, EngineError> {
        if link.uid.is_empty() || link.uid.len() > MAX_UID_LEN {
            return Err(EngineError::LimitExceeded("provider uid length"));
        }
        check_len(link.name.as_deref(), MAX_NAME_LEN, "name too long")?;
        check_len(link.email.as_deref(), MAX_NAME_LEN, "email too long")?;
        check_len(link.access_token.as_deref(), MAX_TOKEN_LEN, "token too long")?;

        let _commit = self.commit_gate.read().await;
        let _users = self.user_writes.lock().await;

        let by_uid = self
            .connection_index
            .get(&(link.provider, link.uid.clone()))
            .map(|e| *e.value());
        let by_email = || {
            link.email
                .as_deref()
                .and_then(|e| self.email_index.get(&email_key(e)).map(|v| *v.value()))
        };
        let existing = by_uid
            .or_else(by_email)
            .or_else(|| self.users.contains_key(&new_user_id).then_some(new_user_id));

        let user_id = match existing {
            Some(id) => id,
            None => {
                if self.users.len() >= MAX_USERS_PER_TENANT {
                    return Err(EngineError::LimitExceeded("too many users"));
                }
                let event = Event::UserCreated {
                    id: new_user_id,
                    email: link.email.clone(),
                };
                self.wal_append(&event).await?;
                self.apply_user_event(&event);
                info!("created user {new_user_id} from {} sign-in", link.provider);
                new_user_id
            }
        };

        let event = Event::ConnectionLinked {
            user_id,
            connection: Connection {
                provider: link.provider,
                uid: link.uid,
                name: link.name,
                access_token: link.access_token,
                expires_at: link.expires_at,
                linked_at: now_ms(),
            },
        };
        self.wal_append(&event).await?;
        self.apply_user_event(&event);
        Ok(user_id)
    }

    /// Sign-out. Drops the connection for `provider`, or the active one, and
    /// queues the provider's revoke call.
    pub async fn disconnect(&self, user_id: Ulid, provider: Option<Provider>) -> Result<Provider, EngineError> {
        let _commit = self.commit_gate.read().await;
        let _users = self.user_writes.lock().await;

        let conn = {
            let user = self.users.get(&user_id).ok_or(EngineError::NotFound(user_id))?;
            match provider {
                Some(p) => user.connection_for(p).cloned(),
                None => user.active_connection().cloned(),
            }
        }
        .ok_or(SocialError::NotConnected(user_id))?;

        let event = Event::ConnectionRemoved {
            user_id,
            provider: conn.provider,
        };
        self.wal_append(&event).await?;
        self.apply_user_event(&event);

        if let Some(request) = social_provider(conn.provider).disconnect() {
            self.social.dispatch(SocialCall {
                provider: conn.provider,
                user_id,
                access_token: conn.access_token,
                request,
            });
        }
        Ok(conn.provider)
    }

    /// Create a wigwam, optionally listed for `initial_listing`. The wigwam
    /// becomes visible only once its first listing is committed. If that
    /// listing fails, a `PropertyDeleted` record undoes the creation.
    pub async fn create_property(
        &self,
        id: Ulid,
        owner_id: Ulid,
        details: PropertyDetails,
        initial_listing: Option<(Ulid, Span)>,
    ) -> Result<(), EngineError> {
        validate_details(&details)?;
        if let Some((_, span)) = &initial_listing {
            validate_span(span)?;
        }
        let _commit = self.commit_gate.read().await;
        if self.properties.len() >= MAX_PROPERTIES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many wigwams"));
        }
        if !self.users.contains_key(&owner_id) {
            return Err(EngineError::NotFound(owner_id));
        }
        if self.properties.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if let Some((listing_id, _)) = &initial_listing
            && self.entity_to_property.contains_key(listing_id)
        {
            return Err(EngineError::AlreadyExists(*listing_id));
        }

        let event = Event::PropertyCreated {
            id,
            owner_id,
            details: details.clone(),
        };
        self.wal_append(&event).await?;
        let ps = Arc::new(RwLock::new(PropertyState::new(id, owner_id, details)));
        let mut guard = ps.clone().write_owned().await;
        self.properties.insert(id, ps);

        let Some((listing_id, span)) = initial_listing else {
            return Ok(());
        };
        match self.admit_listing(&mut guard, listing_id, span).await {
            Ok(plan) => {
                drop(guard);
                self.share_listing(owner_id, id, plan.span);
                Ok(())
            }
            Err(e) => {
                warn!("initial listing for wigwam {id} failed, rolling back: {e}");
                if let Err(undo) = self.wal_append(&Event::PropertyDeleted { id }).await {
                    warn!("could not log deletion of wigwam {id}: {undo}");
                }
                self.properties.remove(&id);
                Err(e)
            }
        }
    }

    /// Delete a wigwam with all of its listings and rentals.
    pub async fn delete_property(&self, id: Ulid) -> Result<(), EngineError> {
        let _commit = self.commit_gate.read().await;
        let guard = self.lock_property(&id).await?;

        let event = Event::PropertyDeleted { id };
        self.wal_append(&event).await?;
        self.unmap_property_entities(&guard);
        // Unmapped before the lock is released, so waiters see it gone.
        self.properties.remove(&id);
        Ok(())
    }

    /// Listing admission. Returns the span actually stored after trimming.
    pub async fn add_listing(&self, id: Ulid, property_id: Ulid, span: Span) -> Result<Span, EngineError> {
        validate_span(&span)?;
        let _commit = self.commit_gate.read().await;
        if self.entity_to_property.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let mut guard = self.lock_property(&property_id).await?;
        let plan = self.admit_listing(&mut guard, id, span).await?;
        let owner_id = guard.owner_id;
        drop(guard);

        if !plan.superseded.is_empty() {
            info!(
                "listing {id} on {property_id} superseded {} sibling(s)",
                plan.superseded.len()
            );
        }
        self.share_listing(owner_id, property_id, plan.span);
        Ok(plan.span)
    }

    /// Reconcile and commit a listing. The caller holds `commit_gate` and the
    /// property lock.
    async fn admit_listing(
        &self,
        ps: &mut PropertyState,
        id: Ulid,
        span: Span,
    ) -> Result<ListingPlan, EngineError> {
        if ps.listings.len() >= MAX_LISTINGS_PER_PROPERTY {
            return Err(EngineError::LimitExceeded("too many listings on wigwam"));
        }
        let plan = make_viable(span, &ps.listings).map_err(|rejection| {
            admission("listing", "rejected");
            EngineError::rejected(span, rejection)
        })?;

        self.reserve_entity(id, ps.id)?;
        let event = Event::ListingAdmitted {
            id,
            property_id: ps.id,
            span: plan.span,
            superseded: plan.superseded.clone(),
        };
        if let Err(e) = self.persist_and_apply(ps, &event).await {
            self.release_entity(&id);
            return Err(e);
        }
        admission("listing", "admitted");
        Ok(plan)
    }

    fn share_listing(&self, owner_id: Ulid, property_id: Ulid, span: Span) {
        self.share_event(
            owner_id,
            SharedEvent {
                kind: EventKind::Listing,
                property_id,
                span,
            },
        );
    }

    pub async fn remove_listing(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _commit = self.commit_gate.read().await;
        let (property_id, mut guard) = self.resolve_entity_write(&id).await?;
        if !guard.listings.iter().any(|l| l.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::ListingRemoved { id, property_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(property_id)
    }

    /// Rental admission. The window must lie inside one listing and be free
    /// of other rentals.
    pub async fn book_rental(
        &self,
        id: Ulid,
        property_id: Ulid,
        renter_id: Ulid,
        span: Span,
    ) -> Result<(), EngineError> {
        validate_span(&span)?;
        let _commit = self.commit_gate.read().await;
        if !self.users.contains_key(&renter_id) {
            return Err(EngineError::NotFound(renter_id));
        }
        if self.entity_to_property.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let mut guard = self.lock_property(&property_id).await?;
        if guard.rentals.len() >= MAX_RENTALS_PER_PROPERTY {
            return Err(EngineError::LimitExceeded("too many rentals on wigwam"));
        }

        if !is_viable(&span, &guard.listings, &guard.rentals) {
            admission("rental", "rejected");
            return Err(EngineError::Unavailable {
                requested: span,
                reason: "not listed or already rented",
            });
        }

        self.reserve_entity(id, property_id)?;
        let event = Event::RentalBooked {
            id,
            property_id,
            renter_id,
            span,
        };
        if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
            self.release_entity(&id);
            return Err(e);
        }
        drop(guard);

        admission("rental", "admitted");
        self.share_event(
            renter_id,
            SharedEvent {
                kind: EventKind::Rental,
                property_id,
                span,
            },
        );
        Ok(())
    }

    pub async fn cancel_rental(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _commit = self.commit_gate.read().await;
        let (property_id, mut guard) = self.resolve_entity_write(&id).await?;
        if !guard.rentals.iter().any(|r| r.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::RentalCancelled { id, property_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(property_id)
    }

    /// Put a party for the user's current or upcoming stay on their calendar.
    /// Returns the event link when the provider hands one back.
    pub async fn throw_party(&self, property_id: Ulid, user_id: Ulid) -> Result<Option<String>, EngineError> {
        let property = self
            .property_info(&property_id)
            .await
            .ok_or(EngineError::NotFound(property_id))?;
        let rental = self
            .rental_for(user_id, property_id, now_ms())
            .await
            .ok_or(EngineError::NoActiveRental {
                user_id,
                property_id,
            })?;
        let span = Span {
            start: rental.start,
            end: rental.end,
        };
        let call = self
            .social_call_for(user_id, |p| p.create_calendar_event(&property, &span))
            .ok_or(SocialError::NotConnected(user_id))?;
        Ok(self.social.call(call).await?)
    }

    /// Share a wigwam with friends on Facebook. Returns the number of calls made.
    pub async fn share_property(
        &self,
        property_id: Ulid,
        user_id: Ulid,
        friends: Vec<String>,
    ) -> Result<usize, EngineError> {
        if friends.len() > MAX_FRIENDS {
            return Err(EngineError::LimitExceeded("too many friends tagged"));
        }
        let property = self
            .property_info(&property_id)
            .await
            .ok_or(EngineError::NotFound(property_id))?;
        let conn = {
            let user = self.users.get(&user_id).ok_or(EngineError::NotFound(user_id))?;
            user.connection_for(Provider::Facebook)
                .or_else(|| user.active_connection())
                .cloned()
        }
        .ok_or(SocialError::NotConnected(user_id))?;

        let requests =
            social_provider(conn.provider).share_wigwam(self.social.config(), &property, &friends)?;
        let count = requests.len();
        for request in requests {
            self.social
                .call(SocialCall {
                    provider: conn.provider,
                    user_id,
                    access_token: conn.access_token.clone(),
                    request,
                })
                .await?;
        }
        Ok(count)
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.commit_gate.write().await;
        let mut events = Vec::new();

        let mut users: Vec<UserState> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        for user in users {
            events.push(Event::UserCreated {
                id: user.id,
                email: user.email,
            });
            let mut connections = user.connections;
            connections.sort_by_key(|c| c.linked_at);
            for connection in connections {
                events.push(Event::ConnectionLinked {
                    user_id: user.id,
                    connection,
                });
            }
        }

        for ps in self.property_handles() {
            let guard = ps.read().await;
            events.push(Event::PropertyCreated {
                id: guard.id,
                owner_id: guard.owner_id,
                details: guard.details.clone(),
            });
            for l in &guard.listings {
                events.push(Event::ListingAdmitted {
                    id: l.id,
                    property_id: guard.id,
                    span: l.span,
                    superseded: Vec::new(),
                });
            }
            for r in &guard.rentals {
                events.push(Event::RentalBooked {
                    id: r.id,
                    property_id: guard.id,
                    renter_id: r.renter_id,
                    span: r.span,
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
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
