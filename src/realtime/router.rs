//! Interprets inbound frames and routes the results through the hub.
//!
//! Every failure here is per-frame: it is logged and the frame is dropped.
//! Nothing is reported back to the sending peer.

use super::hub::Hub;
use super::protocol::{InboundFrame, MessageView, OutboundFrame};
use crate::store::{ConversationStore, FriendDirectory, MessageStore, StoreError};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
enum RouteError {
    #[error("cannot message yourself")]
    SelfMessage,
    #[error("{user_id} is not a participant of conversation {conversation_id}")]
    NotParticipant {
        user_id: String,
        conversation_id: String,
    },
    #[error("message {message_id} is not in conversation {conversation_id}")]
    ForeignMessage {
        message_id: String,
        conversation_id: String,
    },
    #[error("conversation {0} not found")]
    UnknownConversation(String),
    #[error("message {0} not found")]
    UnknownMessage(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct MessageRouter {
    hub: Hub,
    conversations: Arc<dyn ConversationStore>,
    messages: Arc<dyn MessageStore>,
    friends: Arc<dyn FriendDirectory>,
}

impl MessageRouter {
    pub fn new(
        hub: Hub,
        conversations: Arc<dyn ConversationStore>,
        messages: Arc<dyn MessageStore>,
        friends: Arc<dyn FriendDirectory>,
    ) -> Self {
        Self {
            hub,
            conversations,
            messages,
            friends,
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Decode one text frame from `sender` and act on it.
    pub fn dispatch(&self, sender: &str, raw: &str) {
        let frame = match serde_json::from_str::<InboundFrame>(raw) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(user_id = %sender, error = %e, "Dropping undecodable frame");
                return;
            }
        };
        let kind = frame.kind();

        let result = match frame {
            InboundFrame::Msg {
                to,
                encrypted_content,
                temp_id,
            } => self.handle_message(sender, &to, &encrypted_content, temp_id),
            InboundFrame::Read {
                message_id,
                conversation_id,
            } => self.handle_read(sender, &message_id, &conversation_id),
            InboundFrame::Typing {
                to,
                conversation_id,
            } => {
                self.handle_typing(sender, &to, conversation_id);
                Ok(())
            }
        };

        if let Err(e) = result {
            match e {
                RouteError::Store(StoreError::NotFound(_)) => {
                    tracing::debug!(user_id = %sender, frame = kind, error = %e, "Frame rejected")
                }
                RouteError::Store(_) => {
                    tracing::warn!(user_id = %sender, frame = kind, error = %e, "Frame failed")
                }
                _ => tracing::debug!(user_id = %sender, frame = kind, error = %e, "Frame rejected"),
            }
        }
    }

    /// Persist, confirm to the sender, then forward if the recipient is online.
    fn handle_message(
        &self,
        sender: &str,
        to: &str,
        encrypted_content: &str,
        temp_id: String,
    ) -> Result<(), RouteError> {
        if to == sender {
            return Err(RouteError::SelfMessage);
        }
        let conversation = self.conversations.get_or_create(sender, to)?;
        if !conversation.has_participant(sender) {
            return Err(RouteError::NotParticipant {
                user_id: sender.to_string(),
                conversation_id: conversation.id,
            });
        }

        let stored = self
            .messages
            .create_message(&conversation.id, sender, encrypted_content)?;
        let view = MessageView::from(&stored);

        self.hub.send(
            sender,
            &OutboundFrame::Delivered {
                temp_id,
                message: view.clone(),
            },
        );

        if self.hub.send(to, &OutboundFrame::Msg(view)) {
            self.messages.mark_delivered(&stored.id)?;
            tracing::debug!(message_id = %stored.id, "Message forwarded");
        }
        Ok(())
    }

    fn handle_read(
        &self,
        reader: &str,
        message_id: &str,
        conversation_id: &str,
    ) -> Result<(), RouteError> {
        let conversation = self
            .conversations
            .find_conversation(conversation_id)?
            .ok_or_else(|| RouteError::UnknownConversation(conversation_id.to_string()))?;
        if !conversation.has_participant(reader) {
            return Err(RouteError::NotParticipant {
                user_id: reader.to_string(),
                conversation_id: conversation.id,
            });
        }
        let message = self
            .messages
            .find_message(message_id)?
            .ok_or_else(|| RouteError::UnknownMessage(message_id.to_string()))?;
        if message.conversation_id != conversation.id {
            return Err(RouteError::ForeignMessage {
                message_id: message_id.to_string(),
                conversation_id: conversation.id,
            });
        }

        self.messages.mark_read(message_id)?;
        self.hub.send(
            conversation.peer_of(reader),
            &OutboundFrame::Read {
                message_id: message_id.to_string(),
                by: reader.to_string(),
            },
        );
        Ok(())
    }

    fn handle_typing(&self, sender: &str, to: &str, conversation_id: String) {
        self.hub.send(
            to,
            &OutboundFrame::Typing {
                from: sender.to_string(),
                conversation_id,
            },
        );
    }

    /// Tell `user_id`'s friends that they came online or went offline.
    pub fn announce_presence(&self, user_id: &str, online: bool) {
        let friends = match self.friends.friends_of(user_id) {
            Ok(friends) => friends,
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Friend lookup failed");
                return;
            }
        };
        let frame = if online {
            OutboundFrame::Online {
                user_id: user_id.to_string(),
            }
        } else {
            OutboundFrame::Offline {
                user_id: user_id.to_string(),
            }
        };
        let reached = self.hub.broadcast(&friends, &frame);
        tracing::debug!(user_id = %user_id, online, reached, "Presence announced");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::hub::tests::FakeConnection;
    use crate::store::sqlite::tests::seed_user;
    use crate::store::SqliteStore;

    async fn setup() -> (Arc<SqliteStore>, MessageRouter) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        for id in ["alice", "bob", "carol", "dave"] {
            seed_user(&store, id);
        }
        let router = MessageRouter::new(
            Hub::spawn(),
            store.clone(),
            store.clone(),
            store.clone(),
        );
        (store, router)
    }

    fn msg_frame(to: &str, temp_id: &str) -> String {
        serde_json::json!({
            "t": "msg",
            "p": {"to": to, "encrypted_content": "ciphertext", "temp_id": temp_id}
        })
        .to_string()
    }

    #[tokio::test]
    async fn offline_recipient_still_yields_one_delivered() {
        let (store, router) = setup().await;
        let alice = FakeConnection::new("alice");
        router.hub().register(alice.clone()).await;

        router.dispatch("alice", &msg_frame("bob", "tmp-1"));

        assert_eq!(alice.kinds(), vec!["delivered"]);
        let frames = alice.frames.lock();
        let OutboundFrame::Delivered { temp_id, message } = &frames[0] else {
            panic!("expected delivered frame");
        };
        assert_eq!(temp_id, "tmp-1");
        let stored = store.find_message(&message.id).unwrap().unwrap();
        assert!(stored.delivered_at.is_none());
    }

    #[tokio::test]
    async fn online_recipient_gets_msg_and_it_is_marked_delivered() {
        let (store, router) = setup().await;
        let alice = FakeConnection::new("alice");
        let bob = FakeConnection::new("bob");
        router.hub().register(alice.clone()).await;
        router.hub().register(bob.clone()).await;

        router.dispatch("alice", &msg_frame("bob", "tmp-2"));

        assert_eq!(alice.kinds(), vec!["delivered"]);
        assert_eq!(bob.kinds(), vec!["msg"]);
        let OutboundFrame::Msg(view) = bob.frames.lock()[0].clone() else {
            panic!("expected msg frame");
        };
        assert_eq!(view.sender_id, "alice");
        assert_eq!(view.encrypted_content, "ciphertext");
        assert!(store
            .find_message(&view.id)
            .unwrap()
            .unwrap()
            .delivered_at
            .is_some());
    }

    #[tokio::test]
    async fn self_message_is_dropped() {
        let (_store, router) = setup().await;
        let alice = FakeConnection::new("alice");
        router.hub().register(alice.clone()).await;
        router.dispatch("alice", &msg_frame("alice", "tmp"));
        assert!(alice.kinds().is_empty());
    }

    #[tokio::test]
    async fn message_to_unknown_user_is_dropped() {
        let (store, router) = setup().await;
        let alice = FakeConnection::new("alice");
        router.hub().register(alice.clone()).await;

        router.dispatch("alice", &msg_frame("ghost", "tmp-3"));
        router.dispatch("alice", &msg_frame("", "tmp-4"));

        assert!(alice.kinds().is_empty());
        assert!(matches!(
            store.get_or_create("alice", "ghost"),
            Err(crate::store::StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn read_receipt_goes_to_the_other_participant() {
        let (store, router) = setup().await;
        let alice = FakeConnection::new("alice");
        let bob = FakeConnection::new("bob");
        router.hub().register(alice.clone()).await;
        router.hub().register(bob.clone()).await;

        let conv = store.get_or_create("alice", "bob").unwrap();
        let msg = store.create_message(&conv.id, "alice", "ct").unwrap();
        let read = serde_json::json!({
            "t": "read",
            "p": {"message_id": msg.id, "conversation_id": conv.id}
        });
        router.dispatch("bob", &read.to_string());

        assert_eq!(
            alice.frames.lock().as_slice(),
            &[OutboundFrame::Read {
                message_id: msg.id.clone(),
                by: "bob".into()
            }]
        );
        assert!(bob.kinds().is_empty());
        assert!(store.find_message(&msg.id).unwrap().unwrap().read_at.is_some());
    }

    #[tokio::test]
    async fn outsiders_cannot_mark_read() {
        let (store, router) = setup().await;
        let alice = FakeConnection::new("alice");
        router.hub().register(alice.clone()).await;

        let conv = store.get_or_create("alice", "bob").unwrap();
        let msg = store.create_message(&conv.id, "alice", "ct").unwrap();
        let read = serde_json::json!({
            "t": "read",
            "p": {"message_id": msg.id, "conversation_id": conv.id}
        });
        router.dispatch("mallory", &read.to_string());

        assert!(alice.kinds().is_empty());
        assert!(store.find_message(&msg.id).unwrap().unwrap().read_at.is_none());
    }

    #[tokio::test]
    async fn read_of_message_from_other_conversation_is_dropped() {
        let (store, router) = setup().await;
        let carol = FakeConnection::new("carol");
        router.hub().register(carol.clone()).await;

        let theirs = store.get_or_create("carol", "dave").unwrap();
        let msg = store.create_message(&theirs.id, "carol", "ct").unwrap();
        let ours = store.get_or_create("bob", "carol").unwrap();
        let read = serde_json::json!({
            "t": "read",
            "p": {"message_id": msg.id, "conversation_id": ours.id}
        });
        router.dispatch("bob", &read.to_string());

        assert!(carol.kinds().is_empty());
        assert!(store.find_message(&msg.id).unwrap().unwrap().read_at.is_none());
    }

    #[tokio::test]
    async fn typing_is_forwarded() {
        let (_store, router) = setup().await;
        let bob = FakeConnection::new("bob");
        router.hub().register(bob.clone()).await;

        let typing = r#"{"t":"typing","p":{"to":"bob","conversation_id":"c1"}}"#;
        router.dispatch("alice", typing);

        assert_eq!(
            bob.frames.lock().as_slice(),
            &[OutboundFrame::Typing {
                from: "alice".into(),
                conversation_id: "c1".into()
            }]
        );
    }

    #[tokio::test]
    async fn garbage_is_ignored() {
        let (_store, router) = setup().await;
        let alice = FakeConnection::new("alice");
        router.hub().register(alice.clone()).await;
        router.dispatch("alice", "{not json");
        router.dispatch("alice", r#"{"t":"unknown","p":{}}"#);
        assert!(alice.kinds().is_empty());
    }

    #[tokio::test]
    async fn presence_reaches_online_friends_only() {
        let (store, router) = setup().await;
        store.link_friends("alice", "bob").unwrap();
        store.link_friends("alice", "carol").unwrap();
        let bob = FakeConnection::new("bob");
        let dave = FakeConnection::new("dave");
        router.hub().register(bob.clone()).await;
        router.hub().register(dave.clone()).await;

        router.announce_presence("alice", true);
        router.announce_presence("alice", false);

        assert_eq!(bob.kinds(), vec!["online", "offline"]);
        assert!(dave.kinds().is_empty());
    }
}
