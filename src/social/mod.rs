//! Best-effort sharing of listings, rentals and parties on the user's social network.
//!
//! Providers only *describe* the call to make ([`SocialRequest`]); delivering it is
//! the job of a [`SocialTransport`].

mod dispatch;

pub use dispatch::{LogTransport, SocialDispatcher, SocialTransport};

use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Clone)]
pub struct SocialConfig {
    /// Prefix for absolute wigwam links, e.g. `https://wigwam.example`.
    pub base_url: String,
    /// Facebook Open Graph app namespace.
    pub fb_namespace: String,
}

impl Default for SocialConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".into(),
            fb_namespace: "wigwam".into(),
        }
    }
}

impl SocialConfig {
    pub fn property_url(&self, property_id: Ulid) -> String {
        format!("{}/wigwams/{property_id}", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Listing,
    Rental,
}

/// Name of the activity posted for a new listing or rental.
pub fn action_type(kind: EventKind, provider: Provider, fb_namespace: &str) -> String {
    match (provider, kind) {
        (Provider::Google, EventKind::Listing) => "AddActivity".into(),
        (Provider::Google, EventKind::Rental) => "ReserveActivity".into(),
        (Provider::Facebook, EventKind::Listing) => format!("{fb_namespace}:list"),
        (Provider::Facebook, EventKind::Rental) => format!("{fb_namespace}:rent"),
    }
}

/// A provider API call described as data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocialRequest {
    /// Google+ app activity written to the user's vault.
    Moment {
        activity: String,
        target_url: String,
        result_type: Option<String>,
    },
    /// Facebook Open Graph action.
    OpenGraphAction {
        action: String,
        target_url: String,
        start: Option<Ms>,
        end: Option<Ms>,
        tags: Vec<String>,
    },
    FeedPost {
        message: String,
        link: String,
        name: String,
        picture: Option<String>,
        caption: Option<String>,
    },
    CalendarEvent {
        summary: String,
        location: Option<String>,
        start: Ms,
        end: Ms,
    },
    RevokeToken,
}

/// A request addressed to one provider on behalf of one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocialCall {
    pub provider: Provider,
    pub user_id: Ulid,
    pub access_token: Option<String>,
    pub request: SocialRequest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocialError {
    /// The provider has no such feature.
    Unsupported {
        provider: Provider,
        feature: &'static str,
    },
    /// The user has no connection to use.
    NotConnected(Ulid),
    Transport(String),
    QueueClosed,
}

impl std::fmt::Display for SocialError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocialError::Unsupported { provider, feature } => {
                write!(f, "provider {provider} is missing feature: {feature}")
            }
            SocialError::NotConnected(id) => write!(f, "user {id} has no social connection"),
            SocialError::Transport(e) => write!(f, "social transport error: {e}"),
            SocialError::QueueClosed => write!(f, "social dispatcher shut down"),
        }
    }
}

impl std::error::Error for SocialError {}

/// What gets shared after a listing or rental is created.
#[derive(Debug, Clone, Copy)]
pub struct SharedEvent {
    pub kind: EventKind,
    pub property_id: Ulid,
    pub span: Span,
}

/// Per-provider capability.
pub trait SocialProvider: Send + Sync {
    fn share_event(&self, config: &SocialConfig, event: &SharedEvent) -> SocialRequest;

    fn share_wigwam(
        &self,
        config: &SocialConfig,
        property: &PropertyInfo,
        friends: &[String],
    ) -> Result<Vec<SocialRequest>, SocialError>;

    fn create_calendar_event(&self, property: &PropertyInfo, rental: &Span) -> SocialRequest;

    /// Call to make when the user signs out, if the provider needs one.
    fn disconnect(&self) -> Option<SocialRequest>;
}

pub struct GooglePlus;

pub struct Facebook;

/// Resolve the capability for a provider tag.
pub fn social_provider(provider: Provider) -> &'static dyn SocialProvider {
    match provider {
        Provider::Google => &GooglePlus,
        Provider::Facebook => &Facebook,
    }
}

fn party_summary(property: &PropertyInfo) -> String {
    format!("Party at {}", property.details.name)
}

impl SocialProvider for GooglePlus {
    fn share_event(&self, config: &SocialConfig, event: &SharedEvent) -> SocialRequest {
        let activity = action_type(event.kind, Provider::Google, &config.fb_namespace);
        SocialRequest::Moment {
            activity: format!("http://schemas.google.com/{activity}"),
            target_url: config.property_url(event.property_id),
            result_type: (event.kind == EventKind::Rental)
                .then(|| "http://schemas.google.com/Reservation".to_string()),
        }
    }

    fn share_wigwam(
        &self,
        _config: &SocialConfig,
        _property: &PropertyInfo,
        _friends: &[String],
    ) -> Result<Vec<SocialRequest>, SocialError> {
        Err(SocialError::Unsupported {
            provider: Provider::Google,
            feature: "share wigwam",
        })
    }

    fn create_calendar_event(&self, property: &PropertyInfo, rental: &Span) -> SocialRequest {
        SocialRequest::CalendarEvent {
            summary: party_summary(property),
            location: property.details.location.clone(),
            start: rental.start,
            end: rental.end,
        }
    }

    fn disconnect(&self) -> Option<SocialRequest> {
        Some(SocialRequest::RevokeToken)
    }
}

impl SocialProvider for Facebook {
    fn share_event(&self, config: &SocialConfig, event: &SharedEvent) -> SocialRequest {
        SocialRequest::OpenGraphAction {
            action: action_type(event.kind, Provider::Facebook, &config.fb_namespace),
            target_url: config.property_url(event.property_id),
            start: Some(event.span.start),
            end: Some(event.span.end),
            tags: Vec::new(),
        }
    }

    fn share_wigwam(
        &self,
        config: &SocialConfig,
        property: &PropertyInfo,
        friends: &[String],
    ) -> Result<Vec<SocialRequest>, SocialError> {
        let link = config.property_url(property.id);
        Ok(vec![
            SocialRequest::OpenGraphAction {
                action: format!("{}:share", config.fb_namespace),
                target_url: link.clone(),
                start: None,
                end: None,
                tags: friends.to_vec(),
            },
            SocialRequest::FeedPost {
                message: "Check out this wigwam!".into(),
                link,
                name: property.details.name.clone(),
                picture: property.details.picture_url.clone(),
                caption: property.details.description.clone(),
            },
        ])
    }

    fn create_calendar_event(&self, property: &PropertyInfo, rental: &Span) -> SocialRequest {
        SocialRequest::CalendarEvent {
            summary: party_summary(property),
            location: None,
            start: rental.start,
            end: rental.end,
        }
    }

    fn disconnect(&self) -> Option<SocialRequest> {
        // Facebook tokens are dropped locally; there is nothing to revoke.
        None
    }
}
