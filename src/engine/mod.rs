mod error;
mod mutations;
mod queries;
mod reconcile;

pub use error::EngineError;
pub(crate) use mutations::now_ms;
pub use reconcile::{
    classify, free_windows, is_viable, make_viable, overlaps, ListingPlan, OverlapResult, Rejection,
};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use tracing::debug;
use ulid::Ulid;

use crate::model::*;
use crate::social::{social_provider, SharedEvent, SocialCall, SocialDispatcher, SocialProvider};
use crate::wal::Wal;

pub type SharedPropertyState = Arc<RwLock<PropertyState>>;

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
/// Blocks for the first append, drains whatever else is already queued,
/// fsyncs once, then answers every sender in the batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            commit_batch(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                if !batch.is_empty() {
                    commit_batch(&mut wal, &mut batch);
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
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
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

pub struct Engine {
    pub(super) properties: DashMap<Ulid, SharedPropertyState>,
    pub(super) users: DashMap<Ulid, UserState>,
    /// Lowercased email → user id.
    pub(super) email_index: DashMap<String, Ulid>,
    /// (provider, provider uid) → user id.
    pub(super) connection_index: DashMap<(Provider, String), Ulid>,
    /// Reverse lookup: listing/rental id → property id.
    pub(super) entity_to_property: DashMap<Ulid, Ulid>,
    /// Serializes find-or-create of users and connections.
    pub(super) user_writes: tokio::sync::Mutex<()>,
    /// Read-held by every mutation, write-held by compaction, so a compaction
    /// snapshot never races an in-flight commit.
    pub(super) commit_gate: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub social: Arc<SocialDispatcher>,
}

/// Apply a property-scoped event. The caller holds the lock.
fn apply_to_property(ps: &mut PropertyState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ListingAdmitted {
            id,
            property_id,
            span,
            superseded,
        } => {
            for old in superseded {
                ps.remove_listing(*old);
                entity_map.remove(old);
            }
            ps.insert_listing(Listing { id: *id, span: *span });
            entity_map.insert(*id, *property_id);
        }
        Event::ListingRemoved { id, .. } => {
            ps.remove_listing(*id);
            entity_map.remove(id);
        }
        Event::RentalBooked {
            id,
            property_id,
            renter_id,
            span,
        } => {
            ps.insert_rental(Rental {
                id: *id,
                renter_id: *renter_id,
                span: *span,
            });
            entity_map.insert(*id, *property_id);
        }
        Event::RentalCancelled { id, .. } => {
            ps.remove_rental(*id);
            entity_map.remove(id);
        }
        // Property lifecycle and user events are handled at the map level
        Event::PropertyCreated { .. }
        | Event::PropertyDeleted { .. }
        | Event::UserCreated { .. }
        | Event::ConnectionLinked { .. }
        | Event::ConnectionRemoved { .. } => {}
    }
}

fn email_key(email: &str) -> String {
    email.trim().to_lowercase()
}

impl Engine {
    pub fn new(wal_path: PathBuf, social: Arc<SocialDispatcher>) -> io::Result<Self> {
        let (wal, events) = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            properties: DashMap::new(),
            users: DashMap::new(),
            email_index: DashMap::new(),
            connection_index: DashMap::new(),
            entity_to_property: DashMap::new(),
            user_writes: tokio::sync::Mutex::new(()),
            commit_gate: RwLock::new(()),
            wal_tx,
            social,
        };

        // We're the sole owner of these Arcs during replay, so try_write always
        // succeeds. Never use blocking_write here: this may run inside an async
        // context (lazy tenant creation).
        for event in &events {
            match event {
                Event::UserCreated { .. }
                | Event::ConnectionLinked { .. }
                | Event::ConnectionRemoved { .. } => engine.apply_user_event(event),
                Event::PropertyCreated { id, owner_id, details } => {
                    let ps = PropertyState::new(*id, *owner_id, details.clone());
                    engine.properties.insert(*id, Arc::new(RwLock::new(ps)));
                }
                Event::PropertyDeleted { id } => {
                    if let Some((_, ps)) = engine.properties.remove(id)
                        && let Ok(guard) = ps.try_read()
                    {
                        engine.unmap_property_entities(&guard);
                    }
                }
                other => {
                    if let Some(property_id) = event_property_id(other)
                        && let Some(ps) = engine.get_property(&property_id)
                        && let Ok(mut guard) = ps.try_write()
                    {
                        apply_to_property(&mut guard, other, &engine.entity_to_property);
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

    pub fn get_property(&self, id: &Ulid) -> Option<SharedPropertyState> {
        self.properties.get(id).map(|e| e.value().clone())
    }

    pub fn get_property_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_property.get(entity_id).map(|e| *e.value())
    }

    /// Snapshot of all property handles, so no map guard is held across an await.
    pub(super) fn property_handles(&self) -> Vec<SharedPropertyState> {
        self.properties.iter().map(|e| e.value().clone()).collect()
    }

    /// WAL-append + apply in one call.
    pub(super) async fn persist_and_apply(
        &self,
        ps: &mut PropertyState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_property(ps, event, &self.entity_to_property);
        Ok(())
    }

    /// Acquire the property's write lock. Fails with `NotFound` if the
    /// property was deleted while we waited for the lock.
    pub(super) async fn lock_property(
        &self,
        property_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<PropertyState>, EngineError> {
        let ps = self
            .get_property(property_id)
            .ok_or(EngineError::NotFound(*property_id))?;
        let guard = ps.clone().write_owned().await;
        match self.get_property(property_id) {
            Some(current) if Arc::ptr_eq(&current, &ps) => Ok(guard),
            _ => Err(EngineError::NotFound(*property_id)),
        }
    }

    /// Lookup entity → property, then lock the property.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<PropertyState>), EngineError> {
        let property_id = self
            .get_property_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let guard = self.lock_property(&property_id).await?;
        Ok((property_id, guard))
    }

    /// Claim a listing or rental id for `property_id` ahead of its WAL append.
    /// The caller releases it with `release_entity` if the commit fails.
    pub(super) fn reserve_entity(&self, id: Ulid, property_id: Ulid) -> Result<(), EngineError> {
        match self.entity_to_property.entry(id) {
            Entry::Occupied(_) => Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(property_id);
                Ok(())
            }
        }
    }

    pub(super) fn release_entity(&self, id: &Ulid) {
        self.entity_to_property.remove(id);
    }

    pub(super) fn unmap_property_entities(&self, ps: &PropertyState) {
        for l in &ps.listings {
            self.entity_to_property.remove(&l.id);
        }
        for r in &ps.rentals {
            self.entity_to_property.remove(&r.id);
        }
    }

    /// Apply a user or connection event to the user maps.
    pub(super) fn apply_user_event(&self, event: &Event) {
        match event {
            Event::UserCreated { id, email } => {
                if let Some(e) = email {
                    self.email_index.insert(email_key(e), *id);
                }
                self.users.insert(*id, UserState::new(*id, email.clone()));
            }
            Event::ConnectionLinked { user_id, connection } => {
                if let Some(mut user) = self.users.get_mut(user_id) {
                    if let Some(prev) = user.connection_for(connection.provider)
                        && prev.uid != connection.uid
                    {
                        self.connection_index
                            .remove(&(connection.provider, prev.uid.clone()));
                    }
                    self.connection_index
                        .insert((connection.provider, connection.uid.clone()), *user_id);
                    user.upsert_connection(connection.clone());
                }
            }
            Event::ConnectionRemoved { user_id, provider } => {
                if let Some(mut user) = self.users.get_mut(user_id)
                    && let Some(pos) = user.connections.iter().position(|c| c.provider == *provider)
                {
                    let conn = user.connections.remove(pos);
                    self.connection_index.remove(&(conn.provider, conn.uid));
                }
            }
            _ => {}
        }
    }

    /// Build a call for the user's active connection. `None` if the user has none.
    pub(super) fn social_call_for(
        &self,
        user_id: Ulid,
        build: impl FnOnce(&dyn SocialProvider) -> crate::social::SocialRequest,
    ) -> Option<SocialCall> {
        let user = self.users.get(&user_id)?;
        let conn = user.active_connection()?;
        Some(SocialCall {
            provider: conn.provider,
            user_id,
            access_token: conn.access_token.clone(),
            request: build(social_provider(conn.provider)),
        })
    }

    /// Queue a best-effort share of a new listing or rental.
    pub(super) fn share_event(&self, user_id: Ulid, event: SharedEvent) {
        let config = self.social.config();
        match self.social_call_for(user_id, |p| p.share_event(config, &event)) {
            Some(call) => self.social.dispatch(call),
            None => debug!("user {user_id} has no social connection, not sharing"),
        }
    }
}

/// Extract the property id from a property-scoped event.
fn event_property_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ListingAdmitted { property_id, .. }
        | Event::ListingRemoved { property_id, .. }
        | Event::RentalBooked { property_id, .. }
        | Event::RentalCancelled { property_id, .. } => Some(*property_id),
        Event::PropertyCreated { .. }
        | Event::PropertyDeleted { .. }
        | Event::UserCreated { .. }
        | Event::ConnectionLinked { .. }
        | Event::ConnectionRemoved { .. } => None,
    }
}
