use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// One calendar day in ms.
pub const DAY: Ms = 86_400_000;

/// Closed interval `[start, end]`. Both endpoints belong to the span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

/// Returned by [`Span::new`] when `start > end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidSpan {
    pub start: Ms,
    pub end: Ms,
}

impl std::fmt::Display for InvalidSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "span start {} is after end {}", self.start, self.end)
    }
}

impl std::error::Error for InvalidSpan {}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Result<Self, InvalidSpan> {
        if start > end {
            return Err(InvalidSpan { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// True if `self` covers the whole of `other`.
    pub fn covers(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Social network a user signed in with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provider {
    Google,
    Facebook,
}

impl Provider {
    /// Accepts the tags used by the sign-in callbacks.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "google" | "gplus" | "google_oauth2" => Some(Provider::Google),
            "facebook" => Some(Provider::Facebook),
            _ => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Provider::Google => "google",
            Provider::Facebook => "facebook",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// A window during which a property is offered for rent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub id: Ulid,
    pub span: Span,
}

/// A booking of a property by a renter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rental {
    pub id: Ulid,
    pub renter_id: Ulid,
    pub span: Span,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDetails {
    pub name: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub price: Option<i64>,
    pub picture_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PropertyState {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub details: PropertyDetails,
    /// Sorted by `span.start`.
    pub listings: Vec<Listing>,
    /// Sorted by `span.start`.
    pub rentals: Vec<Rental>,
}

impl PropertyState {
    pub fn new(id: Ulid, owner_id: Ulid, details: PropertyDetails) -> Self {
        Self {
            id,
            owner_id,
            details,
            listings: Vec::new(),
            rentals: Vec::new(),
        }
    }

    /// Insert listing maintaining sort order by span.start.
    pub fn insert_listing(&mut self, listing: Listing) {
        let pos = self
            .listings
            .partition_point(|l| l.span.start <= listing.span.start);
        self.listings.insert(pos, listing);
    }

    pub fn remove_listing(&mut self, id: Ulid) -> Option<Listing> {
        let pos = self.listings.iter().position(|l| l.id == id)?;
        Some(self.listings.remove(pos))
    }

    /// Insert rental maintaining sort order by span.start.
    pub fn insert_rental(&mut self, rental: Rental) {
        let pos = self
            .rentals
            .partition_point(|r| r.span.start <= rental.span.start);
        self.rentals.insert(pos, rental);
    }

    pub fn remove_rental(&mut self, id: Ulid) -> Option<Rental> {
        let pos = self.rentals.iter().position(|r| r.id == id)?;
        Some(self.rentals.remove(pos))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub provider: Provider,
    pub uid: String,
    pub name: Option<String>,
    pub access_token: Option<String>,
    pub expires_at: Option<Ms>,
    /// Last time the provider confirmed this connection. The most recent one is active.
    pub linked_at: Ms,
}

/// Identity handed over by a provider sign-in callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConnection {
    pub provider: Provider,
    pub uid: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub access_token: Option<String>,
    pub expires_at: Option<Ms>,
}

#[derive(Debug, Clone)]
pub struct UserState {
    pub id: Ulid,
    pub email: Option<String>,
    pub connections: Vec<Connection>,
}

impl UserState {
    pub fn new(id: Ulid, email: Option<String>) -> Self {
        Self {
            id,
            email,
            connections: Vec::new(),
        }
    }

    /// The most recently linked connection.
    pub fn active_connection(&self) -> Option<&Connection> {
        self.connections.iter().max_by_key(|c| c.linked_at)
    }

    pub fn connection_for(&self, provider: Provider) -> Option<&Connection> {
        self.connections.iter().find(|c| c.provider == provider)
    }

    /// Insert or refresh the connection for `conn.provider`.
    pub fn upsert_connection(&mut self, conn: Connection) {
        self.connections.retain(|c| c.provider != conn.provider);
        self.connections.push(conn);
    }
}

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserCreated {
        id: Ulid,
        email: Option<String>,
    },
    ConnectionLinked {
        user_id: Ulid,
        connection: Connection,
    },
    ConnectionRemoved {
        user_id: Ulid,
        provider: Provider,
    },
    PropertyCreated {
        id: Ulid,
        owner_id: Ulid,
        details: PropertyDetails,
    },
    PropertyDeleted {
        id: Ulid,
    },
    /// A listing together with the siblings it superseded, committed as one record.
    ListingAdmitted {
        id: Ulid,
        property_id: Ulid,
        span: Span,
        superseded: Vec<Ulid>,
    },
    ListingRemoved {
        id: Ulid,
        property_id: Ulid,
    },
    RentalBooked {
        id: Ulid,
        property_id: Ulid,
        renter_id: Ulid,
        span: Span,
    },
    RentalCancelled {
        id: Ulid,
        property_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub details: PropertyDetails,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingInfo {
    pub id: Ulid,
    pub property_id: Ulid,
    pub start: Ms,
    pub end: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RentalInfo {
    pub id: Ulid,
    pub property_id: Ulid,
    pub renter_id: Ulid,
    pub start: Ms,
    pub end: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub id: Ulid,
    pub email: Option<String>,
    pub name: Option<String>,
    pub provider: Option<Provider>,
}

/// A connection as reported to clients; the access token is never exposed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub user_id: Ulid,
    pub provider: Provider,
    pub uid: String,
    pub name: Option<String>,
    pub expires_at: Option<Ms>,
    pub linked_at: Ms,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(start: Ms, end: Ms) -> Span {
        Span::new(start, end).unwrap()
    }

    #[test]
    fn span_rejects_inverted() {
        assert_eq!(Span::new(10, 5), Err(InvalidSpan { start: 10, end: 5 }));
        assert!(Span::new(5, 5).is_ok()); // zero-length is legal
    }

    #[test]
    fn span_covers() {
        let outer = span(100, 400);
        assert!(outer.covers(&span(150, 300)));
        assert!(outer.covers(&outer));
        assert!(!outer.covers(&span(50, 200)));
    }

    #[test]
    fn provider_tags() {
        assert_eq!(Provider::from_tag("gplus"), Some(Provider::Google));
        assert_eq!(Provider::from_tag("Google"), Some(Provider::Google));
        assert_eq!(Provider::from_tag("facebook"), Some(Provider::Facebook));
        assert_eq!(Provider::from_tag("myspace"), None);
        assert_eq!(Provider::Facebook.to_string(), "facebook");
    }

    #[test]
    fn listings_stay_sorted() {
        let mut ps = PropertyState::new(Ulid::new(), Ulid::new(), PropertyDetails::default());
        for start in [300, 100, 200] {
            ps.insert_listing(Listing {
                id: Ulid::new(),
                span: span(start, start + 50),
            });
        }
        let starts: Vec<Ms> = ps.listings.iter().map(|l| l.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn remove_middle_rental_preserves_order() {
        let mut ps = PropertyState::new(Ulid::new(), Ulid::new(), PropertyDetails::default());
        let ids: Vec<Ulid> = (0..3).map(|_| Ulid::new()).collect();
        for (i, &id) in ids.iter().enumerate() {
            ps.insert_rental(Rental {
                id,
                renter_id: Ulid::new(),
                span: span((i as Ms) * 100, (i as Ms) * 100 + 50),
            });
        }
        assert!(ps.remove_rental(ids[1]).is_some());
        assert!(ps.remove_rental(ids[1]).is_none());
        assert_eq!(ps.rentals.len(), 2);
        assert_eq!(ps.rentals[0].id, ids[0]);
        assert_eq!(ps.rentals[1].id, ids[2]);
    }

    #[test]
    fn active_connection_is_most_recent() {
        let mut user = UserState::new(Ulid::new(), None);
        assert!(user.active_connection().is_none());
        user.upsert_connection(Connection {
            provider: Provider::Google,
            uid: "g1".into(),
            name: None,
            access_token: None,
            expires_at: None,
            linked_at: 10,
        });
        user.upsert_connection(Connection {
            provider: Provider::Facebook,
            uid: "f1".into(),
            name: None,
            access_token: None,
            expires_at: None,
            linked_at: 20,
        });
        assert_eq!(user.active_connection().unwrap().provider, Provider::Facebook);

        // Re-linking Google makes it active again without duplicating it.
        user.upsert_connection(Connection {
            provider: Provider::Google,
            uid: "g1".into(),
            name: Some("Sam".into()),
            access_token: None,
            expires_at: None,
            linked_at: 30,
        });
        assert_eq!(user.connections.len(), 2);
        assert_eq!(user.active_connection().unwrap().provider, Provider::Google);
        assert_eq!(user.connection_for(Provider::Facebook).unwrap().uid, "f1");
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ListingAdmitted {
            id: Ulid::new(),
            property_id: Ulid::new(),
            span: span(0, DAY),
            superseded: vec![Ulid::new()],
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
