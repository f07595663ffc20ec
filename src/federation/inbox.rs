//! Inbox processor
//!
//! Authenticates one queued delivery and hands it to the content handler.
//!
//! Steps, in order:
//! 1. derive the signer's host from the signature `keyId`
//! 2. require every identifier in the activity to live on that host
//! 3. drop deliveries from blocked instances
//! 4. find the sending actor, fetching and storing it when unknown
//! 5. verify the HTTP signature against the actor's key
//! 6. dispatch to the content handler
//! 7. record instance telemetry in the background
//!
//! Permanent failures end in `Ok(InboxOutcome::Dropped(_))`. Only failures
//! worth retrying are returned as `Err`, which makes the queue redeliver.

use super::document::{Activity, detect_system};
use super::host::{SignerIdentity, validate_activity_hosts};
use super::instance::InstanceRegistry;
use super::actor::ActorStore;
use super::resolver::{Resolver, ResolverConfig};
use super::signature::{SignatureParams, verify_signature};
use crate::data::RemoteActor;
use crate::error::FederationError;
use crate::metrics::{ACTIVITYPUB_ACTIVITIES_RECEIVED, INBOX_DELIVERIES_TOTAL};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// One inbound delivery as queued by the HTTP edge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryEnvelope {
    pub signature_params: SignatureParams,
    pub activity: Value,
}

/// Receives authenticated activities
///
/// Implementations must be idempotent per activity: deliveries are
/// at-least-once.
#[async_trait]
pub trait ContentHandler: Send + Sync {
    async fn dispatch(&self, actor: &RemoteActor, activity: &Activity) -> Result<(), FederationError>;
}

/// Why a delivery was deliberately not dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    InvalidActivity,
    LocalActorClaim,
    InvalidKeyId,
    HostMismatch,
    Blocked,
    ActorUnavailable,
    InvalidSignature,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidActivity => "invalid_activity",
            Self::LocalActorClaim => "local_actor_claim",
            Self::InvalidKeyId => "invalid_key_id",
            Self::HostMismatch => "host_mismatch",
            Self::Blocked => "blocked",
            Self::ActorUnavailable => "actor_unavailable",
            Self::InvalidSignature => "invalid_signature",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a handled delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxOutcome {
    Dispatched,
    Dropped(DropReason),
}

fn dropped(reason: DropReason) -> Result<InboxOutcome, FederationError> {
    INBOX_DELIVERIES_TOTAL
        .with_label_values(&[reason.as_str()])
        .inc();
    Ok(InboxOutcome::Dropped(reason))
}

/// Authenticates and dispatches inbound deliveries
pub struct InboxProcessor {
    actors: Arc<dyn ActorStore>,
    content: Arc<dyn ContentHandler>,
    instances: InstanceRegistry,
    http_client: reqwest::Client,
    resolver_config: Arc<ResolverConfig>,
}

impl InboxProcessor {
    pub fn new(
        actors: Arc<dyn ActorStore>,
        content: Arc<dyn ContentHandler>,
        instances: InstanceRegistry,
        http_client: reqwest::Client,
        resolver_config: Arc<ResolverConfig>,
    ) -> Self {
        Self {
            actors,
            content,
            instances,
            http_client,
            resolver_config,
        }
    }

    /// Process one delivery
    pub async fn process(&self, envelope: DeliveryEnvelope) -> Result<InboxOutcome, FederationError> {
        let DeliveryEnvelope {
            signature_params: params,
            activity,
        } = envelope;

        let activity = match Activity::from_value(activity) {
            Ok(activity) => activity,
            Err(e) => {
                tracing::warn!(key_id = %params.key_id, error = %e, "Dropping unparseable activity");
                return dropped(DropReason::InvalidActivity);
            }
        };

        tracing::debug!(
            key_id = %params.key_id,
            activity = %activity.summary(),
            "Processing inbox activity"
        );

        let identity = match SignerIdentity::parse(&params.key_id) {
            Ok(identity) => identity,
            Err(FederationError::LocalActorClaim(username)) => {
                tracing::warn!(
                    key_id = %params.key_id,
                    username = %username,
                    "Dropping delivery that claims to be from a local user"
                );
                return dropped(DropReason::LocalActorClaim);
            }
            Err(e) => {
                tracing::warn!(key_id = %params.key_id, error = %e, "Dropping delivery with invalid keyId");
                return dropped(DropReason::InvalidKeyId);
            }
        };
        let host = identity.host();

        if let Err(e) = validate_activity_hosts(&activity, host) {
            tracing::warn!(
                host = %host,
                activity_type = %activity.kind(),
                forwarded = activity.has_ld_signature(),
                error = %e,
                "Dropping activity with mismatched host"
            );
            return dropped(DropReason::HostMismatch);
        }

        if self.instances.is_blocked(host).await? {
            tracing::info!(host = %host, activity_type = %activity.kind(), "Dropping delivery from blocked instance");
            return dropped(DropReason::Blocked);
        }

        let known = match &identity {
            SignerIdentity::Handle { username, host } => {
                self.actors.find_by_handle(username, host).await?
            }
            SignerIdentity::Key { key_id, .. } => self.actors.find_by_key_id(key_id).await?,
        };

        let actor = match known {
            Some(actor) => actor,
            None => match self.create_actor(&activity, host).await? {
                Some(actor) => actor,
                None => return dropped(DropReason::ActorUnavailable),
            },
        };

        if !signer_matches(&identity, &actor) {
            tracing::warn!(
                key_id = %params.key_id,
                actor = %actor.uri,
                "Signature keyId does not belong to the sending actor"
            );
            return dropped(DropReason::InvalidSignature);
        }

        if let Err(e) = verify_signature(&params, &actor.public_key_pem) {
            tracing::warn!(key_id = %params.key_id, actor = %actor.uri, error = %e, "Dropping delivery with bad signature");
            return dropped(DropReason::InvalidSignature);
        }

        ACTIVITYPUB_ACTIVITIES_RECEIVED
            .with_label_values(&[activity.kind().as_str()])
            .inc();

        self.content.dispatch(&actor, &activity).await?;

        self.instances
            .spawn_record_received(actor.host.clone(), detect_system(activity.raw()));

        INBOX_DELIVERIES_TOTAL.with_label_values(&["dispatched"]).inc();
        Ok(InboxOutcome::Dispatched)
    }

    /// Fetch and store the sending actor
    ///
    /// `Ok(None)` means the actor is permanently unavailable and the
    /// delivery should be dropped.
    async fn create_actor(
        &self,
        activity: &Activity,
        host: &str,
    ) -> Result<Option<RemoteActor>, FederationError> {
        let Some(actor_uri) = activity.actor_id() else {
            tracing::warn!(host = %host, "Activity from unknown signer has no actor");
            return Ok(None);
        };

        let resolver = Resolver::new(self.http_client.clone(), self.resolver_config.clone());
        match self.actors.create(&resolver, actor_uri).await {
            Ok(actor) => Ok(Some(actor)),
            Err(e) if e.is_client_error() => {
                tracing::warn!(actor = %actor_uri, error = %e, "Ignoring activity from unavailable actor");
                Ok(None)
            }
            Err(e) if !e.is_retryable() => {
                tracing::warn!(actor = %actor_uri, error = %e, "Ignoring activity from unusable actor");
                Ok(None)
            }
            Err(e) => {
                tracing::error!(actor = %actor_uri, error = %e, "Failed to fetch sending actor");
                Err(e)
            }
        }
    }
}

/// The signing key must belong to the actor it was resolved to
fn signer_matches(identity: &SignerIdentity, actor: &RemoteActor) -> bool {
    match identity {
        SignerIdentity::Handle { username, host } => {
            actor.username_lower == *username && actor.host == *host
        }
        SignerIdentity::Key { key_id, .. } => actor.public_key_id == *key_id,
    }
}
