//! Inbound activity dispatch
//!
//! Routes verified inbox activities to their handlers: Follow/Undo manage
//! the follower set, Like/Announce surface engagement with local posts,
//! Update refreshes follower metadata. Anything else is acknowledged and
//! dropped so unknown vocabulary never bounces a remote delivery queue.

use std::sync::Arc;

use serde_json::Value;

use crate::chat::ChatSink;
use crate::data::{Database, models::Follower};
use crate::error::AppError;
use crate::federation::delivery::SignedDelivery;
use crate::federation::resolver::{ActorResolver, actor_iri_from_reference};
use crate::metrics;

/// The inbound activity vocabulary this server acts on.
///
/// Every other type maps to `Unknown` and is accepted without effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityType {
    Follow,
    Undo,
    Like,
    Announce,
    Update,
    Unknown,
}

impl ActivityType {
    pub fn parse(s: &str) -> Self {
        match s {
            "Follow" => Self::Follow,
            "Undo" => Self::Undo,
            "Like" => Self::Like,
            "Announce" => Self::Announce,
            "Update" => Self::Update,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Follow => "Follow",
            Self::Undo => "Undo",
            Self::Like => "Like",
            Self::Announce => "Announce",
            Self::Update => "Update",
            Self::Unknown => "Unknown",
        }
    }
}

/// What an activity did to local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxAction {
    /// A new follower row was created and an Accept was queued
    FollowerAdded,
    /// The follower was already known; the Follow was treated as a retry
    FollowerAlreadyPresent,
    /// An Undo(Follow) removed the follower row
    FollowerRemoved,
    /// A Like or Announce referenced at least one local post
    EngagementRecorded,
    /// Follower display metadata was refreshed from an Update
    MetadataUpdated,
    /// Nothing matched; the activity was accepted and dropped
    Ignored,
}

/// Result of handling one inbound activity.
///
/// `side_effect_errors` collects failures in best-effort work (actor
/// resolution for notifications, per-object outbox lookups) that must not
/// turn a handled activity into an inbox-level error.
#[derive(Debug)]
pub struct InboxOutcome {
    pub activity_type: ActivityType,
    pub action: InboxAction,
    pub side_effect_errors: Vec<String>,
}

impl InboxOutcome {
    fn clean(activity_type: ActivityType, action: InboxAction) -> Self {
        Self {
            activity_type,
            action,
            side_effect_errors: Vec::new(),
        }
    }
}

/// Routes verified inbound activities.
#[derive(Clone)]
pub struct InboxDispatcher {
    db: Arc<Database>,
    resolver: ActorResolver,
    delivery: SignedDelivery,
    chat: Arc<dyn ChatSink>,
}

impl InboxDispatcher {
    pub fn new(
        db: Arc<Database>,
        resolver: ActorResolver,
        delivery: SignedDelivery,
        chat: Arc<dyn ChatSink>,
    ) -> Self {
        Self {
            db,
            resolver,
            delivery,
            chat,
        }
    }

    /// Handle one verified activity.
    ///
    /// The caller has already checked the HTTP signature; this only decides
    /// what the activity means for local state.
    ///
    /// # Errors
    /// Malformed activities and store/resolution failures on the primary
    /// path. Side-effect failures land in the outcome instead.
    pub async fn handle(&self, activity: &Value) -> Result<InboxOutcome, AppError> {
        let type_str = activity
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| AppError::Validation("Activity has no type".to_string()))?;
        let activity_type = ActivityType::parse(type_str);

        metrics::ACTIVITIES_RECEIVED_TOTAL
            .with_label_values(&[activity_type.as_str()])
            .inc();

        let actor_reference = activity
            .get("actor")
            .ok_or_else(|| AppError::Validation("Activity has no actor".to_string()))?;
        let actor_iri = actor_iri_from_reference(actor_reference)?;

        tracing::debug!(activity_type = %activity_type.as_str(), actor = %actor_iri, "Handling inbound activity");

        match activity_type {
            ActivityType::Follow => self.handle_follow(activity, &actor_iri).await,
            ActivityType::Undo => self.handle_undo(activity, &actor_iri).await,
            ActivityType::Like => {
                self.handle_engagement(activity, &actor_iri, ActivityType::Like)
                    .await
            }
            ActivityType::Announce => {
                self.handle_engagement(activity, &actor_iri, ActivityType::Announce)
                    .await
            }
            ActivityType::Update => self.handle_update(activity, &actor_iri).await,
            ActivityType::Unknown => {
                tracing::debug!(activity_type = %type_str, "Ignoring unsupported activity type");
                Ok(InboxOutcome::clean(
                    ActivityType::Unknown,
                    InboxAction::Ignored,
                ))
            }
        }
    }

    async fn handle_follow(
        &self,
        activity: &Value,
        actor_iri: &str,
    ) -> Result<InboxOutcome, AppError> {
        let follow_id = activity
            .get("id")
            .and_then(|id| id.as_str())
            .ok_or_else(|| AppError::Validation("Follow activity has no id".to_string()))?;

        // The embedded reference rarely carries an inbox, so always fetch the
        // full document before committing the follower.
        let actor = self.resolver.resolve_iri(actor_iri).await?;

        let follower = Follower {
            iri: actor.iri.clone(),
            inbox: actor.inbox.clone(),
            name: Some(actor.display_name.clone()),
            avatar_url: actor.avatar_url.clone(),
            created_at: chrono::Utc::now(),
        };

        let action = match self.db.add_follower(&follower).await {
            Ok(()) => InboxAction::FollowerAdded,
            Err(e) if e.is_duplicate() => {
                tracing::debug!(actor = %actor_iri, "Follow retry from existing follower");
                InboxAction::FollowerAlreadyPresent
            }
            Err(e) => return Err(e),
        };

        // Accept goes out even on a retry, in case the first one was lost.
        // A failed Accept fails the whole Follow: the sender sees a 5xx and
        // retries, and the stored follower row makes the retry idempotent.
        self.delivery
            .send_accept(follow_id, actor.inbox.as_str())
            .await?;

        if action == InboxAction::FollowerAdded {
            self.chat.send_system_message(
                &format!(
                    "[{}]({}) just **followed**!",
                    actor.display_name,
                    actor.iri.as_str()
                ),
                false,
            );
            self.refresh_follower_gauge().await;
        }

        Ok(InboxOutcome::clean(ActivityType::Follow, action))
    }

    async fn handle_undo(
        &self,
        activity: &Value,
        actor_iri: &str,
    ) -> Result<InboxOutcome, AppError> {
        let undone_type = activity
            .get("object")
            .and_then(|object| object.get("type"))
            .and_then(|t| t.as_str());

        match undone_type {
            Some("Follow") => {
                let removed = self.db.remove_follower(actor_iri).await?;
                let action = if removed {
                    tracing::info!(actor = %actor_iri, "Follower removed");
                    self.refresh_follower_gauge().await;
                    InboxAction::FollowerRemoved
                } else {
                    tracing::debug!(actor = %actor_iri, "Undo(Follow) from non-follower");
                    InboxAction::Ignored
                };
                Ok(InboxOutcome::clean(ActivityType::Undo, action))
            }
            other => {
                tracing::debug!(undone_type = ?other, "Ignoring Undo of unsupported activity");
                Ok(InboxOutcome::clean(ActivityType::Undo, InboxAction::Ignored))
            }
        }
    }

    /// Like and Announce share a shape: they reference objects by IRI, and
    /// only references to posts this server authored produce a notification.
    async fn handle_engagement(
        &self,
        activity: &Value,
        actor_iri: &str,
        activity_type: ActivityType,
    ) -> Result<InboxOutcome, AppError> {
        let object = activity
            .get("object")
            .ok_or_else(|| AppError::Validation("Activity has no object".to_string()))?;

        let mut side_effect_errors = Vec::new();
        let mut matched = false;
        for iri in object_iris(object) {
            // A lookup failure skips this object, never its siblings.
            match self.db.get_outbox_payload_by_iri(&iri).await {
                Ok(Some(_)) => matched = true,
                Ok(None) => {
                    tracing::debug!(iri = %iri, "Engagement references an object this server never sent");
                }
                Err(e) => {
                    tracing::warn!(iri = %iri, error = %e, "Outbox lookup failed");
                    side_effect_errors.push(format!("outbox lookup: {}", e));
                }
            }
        }

        if !matched {
            return Ok(InboxOutcome {
                activity_type,
                action: InboxAction::Ignored,
                side_effect_errors,
            });
        }
        match self.resolver.resolve_iri(actor_iri).await {
            Ok(actor) => {
                let verb = match activity_type {
                    ActivityType::Announce => "re-posted",
                    _ => "liked",
                };
                self.chat.send_system_message(
                    &format!(
                        "[{}]({}) just **{}** that this stream went live!",
                        actor.display_name,
                        actor.iri.as_str(),
                        verb
                    ),
                    false,
                );
            }
            Err(e) => {
                tracing::warn!(actor = %actor_iri, error = %e, "Could not resolve engaging actor");
                side_effect_errors.push(format!("actor resolution: {}", e));
            }
        }

        Ok(InboxOutcome {
            activity_type,
            action: InboxAction::EngagementRecorded,
            side_effect_errors,
        })
    }

    async fn handle_update(
        &self,
        activity: &Value,
        actor_iri: &str,
    ) -> Result<InboxOutcome, AppError> {
        let object_type = activity
            .get("object")
            .and_then(|object| object.get("type"))
            .and_then(|t| t.as_str());

        if !matches!(object_type, Some("Person") | Some("Service") | Some("Application")) {
            tracing::debug!(object_type = ?object_type, "Ignoring Update of non-actor object");
            return Ok(InboxOutcome::clean(
                ActivityType::Update,
                InboxAction::Ignored,
            ));
        }

        // The embedded document can be partial; fetch the authoritative one.
        let actor = self.resolver.resolve_iri(actor_iri).await?;
        self.db
            .update_follower_metadata(
                actor.iri.as_str(),
                actor.inbox.as_str(),
                Some(&actor.display_name),
                actor.avatar_url.as_deref(),
            )
            .await?;

        tracing::info!(actor = %actor_iri, "Refreshed follower metadata");
        Ok(InboxOutcome::clean(
            ActivityType::Update,
            InboxAction::MetadataUpdated,
        ))
    }

    async fn refresh_follower_gauge(&self) {
        if let Ok(count) = self.db.count_followers().await {
            metrics::FOLLOWERS_TOTAL.set(count);
        }
    }
}

/// Collect object IRIs from an activity's `object` property.
///
/// Accepts a single IRI, an embedded object with an `id`, or an array
/// mixing both.
fn object_iris(object: &Value) -> Vec<String> {
    match object {
        Value::String(iri) => vec![iri.clone()],
        Value::Object(map) => map
            .get("id")
            .and_then(|id| id.as_str())
            .map(|id| vec![id.to_string()])
            .unwrap_or_default(),
        Value::Array(entries) => entries.iter().flat_map(object_iris).collect(),
        _ => Vec::new(),
    }
}
