//! Pairing Engine
//!
//! Turns two queued users into a new ephemeral conversation, never pairing
//! users who already share a saved conversation. Also owns the two other
//! operations that depend on the ephemeral/saved distinction: promoting a
//! conversation to saved, and deactivating a participant.

use std::sync::Arc;

use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cleanup::CleanupHandle;
use crate::error::AppError;
use crate::queue::{ClaimOutcome, QueueEntry, QueueHandle};
use crate::store::{Conversation, ConversationStore, UserDirectory};
use crate::types::{ConversationId, ConversationKind, UserId};

/// Name given to conversations created by matchmaking
pub const RANDOM_CHAT_NAME: &str = "Random Chat";

/// Prefix added to a conversation's name when it is saved
pub const SAVED_PREFIX: &str = "Saved Chat - ";

/// Outcome of a successful `find_match`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairingResult {
    /// The requester
    pub user_a: UserId,
    /// The partner drawn from the queue
    pub user_b: UserId,
    pub partner_name: String,
    pub conversation_id: ConversationId,
}

#[derive(Clone)]
pub struct PairingEngine {
    queue: QueueHandle,
    conversations: Arc<dyn ConversationStore>,
    users: Arc<dyn UserDirectory>,
    cleanup: CleanupHandle,
}

impl PairingEngine {
    pub fn new(
        queue: QueueHandle,
        conversations: Arc<dyn ConversationStore>,
        users: Arc<dyn UserDirectory>,
        cleanup: CleanupHandle,
    ) -> Self {
        Self {
            queue,
            conversations,
            users,
            cleanup,
        }
    }

    /// Queue the requester and try to pair them with a random eligible user
    ///
    /// `NoCandidateAvailable` leaves the requester queued. Store failures are
    /// reported as `Store` so callers can tell the two apart; the requester is
    /// queued in that case too.
    pub async fn find_match(&self, requester: UserId) -> Result<PairingResult, AppError> {
        let display_name = self.users.display_name(requester).await?;
        self.queue.enqueue(requester, display_name).await?;
        self.queue.evict_stale().await?;

        let mut eligible = self.eligible_candidates(requester).await?;
        eligible.shuffle(&mut rand::thread_rng());

        for candidate in eligible {
            match self.queue.claim_pair(requester, candidate.user_id).await? {
                ClaimOutcome::Claimed { requester, partner } => {
                    return self.open_conversation(requester, partner).await;
                }
                ClaimOutcome::PartnerGone => {
                    debug!(
                        "Candidate {} left the queue before pairing, trying next",
                        candidate.user_id
                    );
                }
                ClaimOutcome::RequesterGone => {
                    return Err(AppError::Conflict(
                        "already paired by a concurrent request".into(),
                    ));
                }
            }
        }

        debug!("No candidate available for {}", requester);
        Err(AppError::NoCandidateAvailable)
    }

    /// Queued users minus the requester and anyone sharing a saved conversation with them
    async fn eligible_candidates(&self, requester: UserId) -> Result<Vec<QueueEntry>, AppError> {
        let candidates = self.queue.candidates(requester).await?;
        let mut eligible = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            if self
                .conversations
                .has_saved_conversation_between(requester, candidate.user_id)
                .await?
            {
                debug!(
                    "{} excluded for {}: saved conversation exists",
                    candidate.display_name, requester
                );
                continue;
            }
            eligible.push(candidate);
        }

        Ok(eligible)
    }

    /// Both entries are already out of the queue; put them back if the store fails
    async fn open_conversation(
        &self,
        requester: QueueEntry,
        partner: QueueEntry,
    ) -> Result<PairingResult, AppError> {
        match self.create_ephemeral(requester.user_id, partner.user_id).await {
            Ok(conversation_id) => {
                info!(
                    "Paired {} with {} in conversation {}",
                    requester.user_id, partner.user_id, conversation_id
                );
                Ok(PairingResult {
                    user_a: requester.user_id,
                    user_b: partner.user_id,
                    partner_name: partner.display_name,
                    conversation_id,
                })
            }
            Err(e) => {
                warn!(
                    "Pairing {} with {} failed, restoring queue: {}",
                    requester.user_id, partner.user_id, e
                );
                self.queue.restore(vec![requester, partner]).await?;
                Err(e)
            }
        }
    }

    async fn create_ephemeral(&self, a: UserId, b: UserId) -> Result<ConversationId, AppError> {
        let conversation_id = self
            .conversations
            .create_conversation(ConversationKind::Ephemeral, RANDOM_CHAT_NAME, a)
            .await?;

        for user_id in [a, b] {
            if let Err(e) = self.conversations.add_participant(conversation_id, user_id).await {
                if let Err(cleanup) = self.conversations.delete_conversation(conversation_id).await {
                    let transient = AppError::Transient(format!(
                        "could not delete half-created conversation {}: {}",
                        conversation_id, cleanup
                    ));
                    warn!("{}", transient);
                }
                return Err(e.into());
            }
        }

        Ok(conversation_id)
    }

    /// Flip a conversation to saved so the pair is never randomly matched again
    pub async fn promote_to_saved(
        &self,
        conversation_id: ConversationId,
        requester: UserId,
    ) -> Result<Conversation, AppError> {
        let conversation = self.conversations.conversation(conversation_id).await?;
        self.require_participant(conversation_id, requester).await?;

        let name = format!("{}{}", SAVED_PREFIX, conversation.name);
        let saved = self
            .conversations
            .save_conversation(conversation_id, &name)
            .await?;
        info!("User {} saved conversation {}", requester, conversation_id);

        Ok(saved)
    }

    /// Mark the user inactive and schedule a deferred deletion check
    pub async fn deactivate_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<(), AppError> {
        self.require_participant(conversation_id, user_id).await?;
        self.conversations
            .set_participant_active(conversation_id, user_id, false)
            .await?;
        self.cleanup.schedule(conversation_id).await?;
        info!("User {} skipped conversation {}", user_id, conversation_id);
        Ok(())
    }

    /// Undo a skip within the grace window
    pub async fn reactivate_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<(), AppError> {
        self.require_participant(conversation_id, user_id).await?;
        self.conversations
            .set_participant_active(conversation_id, user_id, true)
            .await?;
        Ok(())
    }

    async fn require_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<(), AppError> {
        if self
            .conversations
            .is_participant(conversation_id, user_id)
            .await?
        {
            Ok(())
        } else {
            Err(AppError::Unauthorized("not a participant of this conversation".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::{CleanupScheduler, DEFAULT_GRACE};
    use crate::clock::SystemClock;
    use crate::error::StoreError;
    use crate::queue::{QueueActor, QueueConfig};
    use crate::store::{InMemoryStore, Participant};
    use async_trait::async_trait;

    struct Fixture {
        engine: PairingEngine,
        queue: QueueHandle,
        store: Arc<InMemoryStore>,
        cleanup: CleanupHandle,
    }

    fn fixture_with(store: Arc<InMemoryStore>, conversations: Arc<dyn ConversationStore>) -> Fixture {
        let queue = QueueActor::spawn(32, Arc::new(SystemClock), QueueConfig::default());
        let cleanup = CleanupScheduler::spawn(8, conversations.clone(), DEFAULT_GRACE);
        let engine = PairingEngine::new(queue.clone(), conversations, store.clone(), cleanup.clone());
        Fixture {
            engine,
            queue,
            store,
            cleanup,
        }
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        fixture_with(store.clone(), store)
    }

    async fn user(f: &Fixture, name: &str) -> UserId {
        let id = UserId::new();
        f.store.add_user(id, name).await;
        id
    }

    async fn saved_between(store: &InMemoryStore, a: UserId, b: UserId) {
        let id = store
            .create_conversation(ConversationKind::Saved, "saved", a)
            .await
            .unwrap();
        store.add_participant(id, a).await.unwrap();
        store.add_participant(id, b).await.unwrap();
    }

    #[tokio::test]
    async fn test_alone_in_queue_gets_no_candidate_and_stays_queued() {
        let f = fixture();
        let x = user(&f, "x").await;

        let err = f.engine.find_match(x).await.unwrap_err();
        assert!(matches!(err, AppError::NoCandidateAvailable));
        assert_eq!(f.queue.size().await.unwrap(), 1);
        assert!(f.queue.touch(x).await.unwrap());
    }

    #[tokio::test]
    async fn test_pairs_two_queued_users() {
        let f = fixture();
        let x = user(&f, "x").await;
        let y = user(&f, "yuki").await;
        f.queue.enqueue(y, "yuki".into()).await.unwrap();

        let result = f.engine.find_match(x).await.unwrap();

        assert_eq!(result.user_a, x);
        assert_eq!(result.user_b, y);
        assert_eq!(result.partner_name, "yuki");
        assert_eq!(f.queue.size().await.unwrap(), 0);

        let conversation = f.store.conversation(result.conversation_id).await.unwrap();
        assert_eq!(conversation.kind, ConversationKind::Ephemeral);
        let mut members: Vec<_> = f
            .store
            .participants(result.conversation_id)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.user_id)
            .collect();
        members.sort();
        let mut expected = vec![x, y];
        expected.sort();
        assert_eq!(members, expected);
    }

    #[tokio::test]
    async fn test_saved_pair_is_not_matched_again() {
        let f = fixture();
        let x = user(&f, "x").await;
        let y = user(&f, "y").await;
        saved_between(&f.store, x, y).await;
        f.queue.enqueue(y, "y".into()).await.unwrap();

        let err = f.engine.find_match(x).await.unwrap_err();
        assert!(matches!(err, AppError::NoCandidateAvailable));
        assert_eq!(f.queue.size().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_never_pairs_with_saved_partner_among_many() {
        let f = fixture();
        let x = user(&f, "x").await;
        let saved: Vec<_> = (0..3).map(|_| UserId::new()).collect();
        for s in &saved {
            saved_between(&f.store, x, *s).await;
            f.queue.enqueue(*s, "saved".into()).await.unwrap();
        }
        let fresh = user(&f, "fresh").await;
        f.queue.enqueue(fresh, "fresh".into()).await.unwrap();

        let result = f.engine.find_match(x).await.unwrap();
        assert_eq!(result.user_b, fresh);
        assert_eq!(f.queue.size().await.unwrap(), saved.len());
    }

    #[tokio::test]
    async fn test_unknown_requester_is_not_found() {
        let f = fixture();
        let err = f.engine.find_match(UserId::new()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert_eq!(f.queue.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_produce_one_pairing() {
        let f = fixture();
        let x = user(&f, "x").await;
        let y = user(&f, "y").await;

        let (rx, ry) = tokio::join!(f.engine.find_match(x), f.engine.find_match(y));

        let paired: Vec<_> = [&rx, &ry].into_iter().filter(|r| r.is_ok()).collect();
        assert_eq!(paired.len(), 1);
        for r in [&rx, &ry] {
            if let Err(e) = r {
                assert!(matches!(
                    e,
                    AppError::Conflict(_) | AppError::NoCandidateAvailable
                ));
            }
        }
        assert_eq!(f.queue.size().await.unwrap(), 0);
    }

    /// Delegates to the in-memory store but fails every participant insert
    struct BrokenParticipants(Arc<InMemoryStore>);

    #[async_trait]
    impl ConversationStore for BrokenParticipants {
        async fn create_conversation(
            &self,
            kind: ConversationKind,
            name: &str,
            creator: UserId,
        ) -> Result<ConversationId, StoreError> {
            self.0.create_conversation(kind, name, creator).await
        }
        async fn add_participant(&self, _: ConversationId, _: UserId) -> Result<(), StoreError> {
            Err(StoreError::Backend("write timeout".into()))
        }
        async fn conversation(&self, id: ConversationId) -> Result<Conversation, StoreError> {
            self.0.conversation(id).await
        }
        async fn participants(&self, id: ConversationId) -> Result<Vec<Participant>, StoreError> {
            self.0.participants(id).await
        }
        async fn is_participant(&self, id: ConversationId, u: UserId) -> Result<bool, StoreError> {
            self.0.is_participant(id, u).await
        }
        async fn has_saved_conversation_between(
            &self,
            a: UserId,
            b: UserId,
        ) -> Result<bool, StoreError> {
            self.0.has_saved_conversation_between(a, b).await
        }
        async fn save_conversation(
            &self,
            id: ConversationId,
            name: &str,
        ) -> Result<Conversation, StoreError> {
            self.0.save_conversation(id, name).await
        }
        async fn set_participant_active(
            &self,
            id: ConversationId,
            u: UserId,
            active: bool,
        ) -> Result<(), StoreError> {
            self.0.set_participant_active(id, u, active).await
        }
        async fn count_active_participants(&self, id: ConversationId) -> Result<usize, StoreError> {
            self.0.count_active_participants(id).await
        }
        async fn delete_conversation(&self, id: ConversationId) -> Result<(), StoreError> {
            self.0.delete_conversation(id).await
        }
    }

    #[tokio::test]
    async fn test_store_failure_restores_both_queue_entries() {
        let store = Arc::new(InMemoryStore::new());
        let f = fixture_with(store.clone(), Arc::new(BrokenParticipants(store.clone())));
        let x = user(&f, "x").await;
        let y = user(&f, "y").await;
        f.queue.enqueue(y, "y".into()).await.unwrap();

        let err = f.engine.find_match(x).await.unwrap_err();

        assert!(matches!(err, AppError::Store(_)));
        assert_eq!(f.queue.size().await.unwrap(), 2);
        assert!(f.queue.touch(x).await.unwrap());
        assert!(f.queue.touch(y).await.unwrap());
    }

    #[tokio::test]
    async fn test_promote_to_saved() {
        let f = fixture();
        let x = user(&f, "x").await;
        let y = user(&f, "y").await;
        f.queue.enqueue(y, "y".into()).await.unwrap();
        let paired = f.engine.find_match(x).await.unwrap();

        let err = f
            .engine
            .promote_to_saved(paired.conversation_id, UserId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));

        let err = f
            .engine
            .promote_to_saved(ConversationId::new(), x)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let saved = f
            .engine
            .promote_to_saved(paired.conversation_id, y)
            .await
            .unwrap();
        assert_eq!(saved.kind, ConversationKind::Saved);
        assert_eq!(saved.name, format!("{}{}", SAVED_PREFIX, RANDOM_CHAT_NAME));
        assert!(f.store.has_saved_conversation_between(x, y).await.unwrap());

        let err = f
            .engine
            .promote_to_saved(paired.conversation_id, x)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_promote_conflicts_with_existing_saved_pair() {
        let f = fixture();
        let x = user(&f, "x").await;
        let y = user(&f, "y").await;
        let id = f
            .store
            .create_conversation(ConversationKind::Ephemeral, RANDOM_CHAT_NAME, x)
            .await
            .unwrap();
        f.store.add_participant(id, x).await.unwrap();
        f.store.add_participant(id, y).await.unwrap();
        saved_between(&f.store, x, y).await;

        let err = f.engine.promote_to_saved(id, x).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(
            f.store.conversation(id).await.unwrap().kind,
            ConversationKind::Ephemeral
        );
    }

    #[tokio::test]
    async fn test_concurrent_promotes_leave_one_saved_conversation() {
        let f = fixture();
        let x = user(&f, "x").await;
        let y = user(&f, "y").await;
        let mut chats = Vec::new();
        for _ in 0..2 {
            let id = f
                .store
                .create_conversation(ConversationKind::Ephemeral, RANDOM_CHAT_NAME, x)
                .await
                .unwrap();
            f.store.add_participant(id, x).await.unwrap();
            f.store.add_participant(id, y).await.unwrap();
            chats.push(id);
        }

        let (first, second) = tokio::join!(
            f.engine.promote_to_saved(chats[0], x),
            f.engine.promote_to_saved(chats[1], y)
        );

        assert_eq!([&first, &second].iter().filter(|r| r.is_ok()).count(), 1);
        assert!([&first, &second]
            .iter()
            .any(|r| matches!(r, Err(AppError::Conflict(_)))));

        let mut saved = 0;
        for id in chats {
            if f.store.conversation(id).await.unwrap().kind == ConversationKind::Saved {
                saved += 1;
            }
        }
        assert_eq!(saved, 1);
    }

    #[tokio::test]
    async fn test_deactivate_participant_schedules_cleanup() {
        let f = fixture();
        let x = user(&f, "x").await;
        let y = user(&f, "y").await;
        f.queue.enqueue(y, "y".into()).await.unwrap();
        let paired = f.engine.find_match(x).await.unwrap();

        let err = f
            .engine
            .deactivate_participant(paired.conversation_id, UserId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));

        f.engine
            .deactivate_participant(paired.conversation_id, x)
            .await
            .unwrap();
        f.engine
            .deactivate_participant(paired.conversation_id, y)
            .await
            .unwrap();

        assert_eq!(
            f.store
                .count_active_participants(paired.conversation_id)
                .await
                .unwrap(),
            0
        );
        // Two skips on one conversation share a single pending check
        assert_eq!(f.cleanup.pending().await.unwrap(), 1);

        f.engine
            .reactivate_participant(paired.conversation_id, x)
            .await
            .unwrap();
        assert_eq!(
            f.store
                .count_active_participants(paired.conversation_id)
                .await
                .unwrap(),
            1
        );
    }
}
