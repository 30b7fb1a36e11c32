//! Conversation transcript and streamed reply assembly.
//!
//! Tokens are appended verbatim to the open assistant message, addressed by its
//! [`MessageId`]. `chat_end` seals it; the sealed text is what gets spoken.

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Assistant,
    System,
}

impl Speaker {
    pub fn label(&self) -> &'static str {
        match self {
            Speaker::User => "You",
            Speaker::Assistant => "Mentexa",
            Speaker::System => "System",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationMessage {
    pub id: MessageId,
    pub speaker: Speaker,
    pub text: String,
    /// Still receiving `chat_token` fragments.
    pub streaming: bool,
    pub at: DateTime<Utc>,
}

/// A reply sealed by `chat_end`.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedReply {
    pub id: MessageId,
    pub text: String,
}

/// Ordered, append-only conversation with at most one open assistant message.
#[derive(Debug, Default)]
pub struct Conversation {
    messages: Vec<ConversationMessage>,
    next_id: u64,
    open_reply: Option<MessageId>,
}

impl Conversation {
    pub fn new(greeting: Option<&str>) -> Self {
        let mut conversation = Self::default();
        if let Some(text) = greeting {
            conversation.push(Speaker::System, text.to_string(), false);
        }
        conversation
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    pub fn get(&self, id: MessageId) -> Option<&ConversationMessage> {
        self.index_of(id).map(|i| &self.messages[i])
    }

    pub fn open_reply(&self) -> Option<MessageId> {
        self.open_reply
    }

    /// Append a finished user transcript.
    pub fn push_user(&mut self, text: impl Into<String>) -> MessageId {
        self.push(Speaker::User, text.into(), false)
    }

    /// Merge one reply fragment.
    ///
    /// Continues the open reply when it is still the last message; otherwise
    /// seals it (unspoken) and opens a new one seeded with `fragment`.
    pub fn append_token(&mut self, fragment: &str) -> MessageId {
        if let Some(id) = self.open_reply {
            let is_tail = self.messages.last().map(|m| m.id) == Some(id);
            if is_tail {
                if let Some(msg) = self.messages.last_mut() {
                    msg.text.push_str(fragment);
                    trace!("reply {:?} += {:?}", id, fragment);
                }
                return id;
            }
            debug!("reply {:?} interrupted by a newer message, sealing it", id);
            self.seal(id);
        }

        let id = self.push(Speaker::Assistant, fragment.to_string(), true);
        self.open_reply = Some(id);
        id
    }

    /// Seal the open reply. `None` when nothing is streaming, or when a newer
    /// message has overtaken it: that reply is sealed but not returned for playback.
    pub fn finish_reply(&mut self) -> Option<FinishedReply> {
        let id = self.open_reply?;
        let is_tail = self.messages.last().map(|m| m.id) == Some(id);
        self.seal(id)?;
        if !is_tail {
            debug!("reply {:?} is no longer the last message, not speaking it", id);
            return None;
        }
        self.get(id).map(|m| FinishedReply {
            id,
            text: m.text.clone(),
        })
    }

    fn seal(&mut self, id: MessageId) -> Option<()> {
        if self.open_reply == Some(id) {
            self.open_reply = None;
        }
        let index = self.index_of(id)?;
        self.messages[index].streaming = false;
        Some(())
    }

    fn push(&mut self, speaker: Speaker, text: String, streaming: bool) -> MessageId {
        let id = MessageId(self.next_id);
        self.next_id += 1;
        self.messages.push(ConversationMessage {
            id,
            speaker,
            text,
            streaming,
            at: Utc::now(),
        });
        id
    }

    // Ids are handed out in increasing order, so the sequence is sorted by id.
    fn index_of(&self, id: MessageId) -> Option<usize> {
        self.messages.binary_search_by_key(&id, |m| m.id).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_concatenate_in_arrival_order() {
        let mut c = Conversation::new(None);
        let a = c.append_token("Hel");
        let b = c.append_token("lo ");
        let d = c.append_token("world");
        assert_eq!(a, b);
        assert_eq!(b, d);

        let done = c.finish_reply().unwrap();
        assert_eq!(done.text, "Hello world");

        let msgs = c.messages();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].speaker, Speaker::Assistant);
        assert!(!msgs[0].streaming);
    }

    #[test]
    fn fragments_are_not_trimmed_or_deduplicated() {
        let mut c = Conversation::new(None);
        for f in [" a", " a", "", "  "] {
            c.append_token(f);
        }
        assert_eq!(c.finish_reply().unwrap().text, " a a  ");
    }

    #[test]
    fn chat_end_without_open_reply_is_none() {
        let mut c = Conversation::new(Some("Welcome to Mentexa."));
        assert!(c.finish_reply().is_none());

        c.append_token("hi");
        assert!(c.finish_reply().is_some());
        // Second chat_end has nothing left to seal.
        assert!(c.finish_reply().is_none());
    }

    #[test]
    fn sealed_reply_is_never_edited_again() {
        let mut c = Conversation::new(None);
        let first = c.append_token("one");
        c.finish_reply();
        let second = c.append_token("two");

        assert_ne!(first, second);
        assert_eq!(c.get(first).unwrap().text, "one");
        assert_eq!(c.get(second).unwrap().text, "two");
        assert!(c.get(second).unwrap().streaming);
    }

    #[test]
    fn transcript_between_tokens_starts_a_new_reply() {
        let mut c = Conversation::new(None);
        let first = c.append_token("partial");
        c.push_user("wait");
        let second = c.append_token("fresh");

        assert_ne!(first, second);
        assert!(!c.get(first).unwrap().streaming);
        assert_eq!(c.open_reply(), Some(second));
        assert_eq!(c.messages().iter().filter(|m| m.streaming).count(), 1);
        assert_eq!(c.finish_reply().unwrap().text, "fresh");
    }

    #[test]
    fn chat_end_after_a_newer_transcript_seals_silently() {
        let mut c = Conversation::new(None);
        let stale = c.append_token("stale reply");
        c.push_user("new question");

        assert!(c.finish_reply().is_none());
        assert!(!c.get(stale).unwrap().streaming);
        assert_eq!(c.open_reply(), None);
        assert_eq!(c.messages().last().unwrap().speaker, Speaker::User);
    }

    #[test]
    fn greeting_opens_the_conversation() {
        let c = Conversation::new(Some("Welcome to Mentexa."));
        assert_eq!(c.messages().len(), 1);
        assert_eq!(c.messages()[0].speaker, Speaker::System);
    }
}
