//! Size-bounded message batches.

use super::types::OutgoingMessage;

/// Fixed cost of the batch envelope itself.
const BATCH_OVERHEAD_BYTES: usize = 24;

/// Fixed cost per message on top of its body and properties.
const MESSAGE_OVERHEAD_BYTES: usize = 58;

/// An ordered set of messages that is sent in a single operation.
///
/// Messages are only accepted while the estimated encoded size stays within
/// `max_size_bytes`; a rejected message leaves the batch untouched.
#[derive(Debug, Clone)]
pub struct MessageBatch {
    max_size_bytes: usize,
    size_bytes: usize,
    messages: Vec<OutgoingMessage>,
}

impl MessageBatch {
    pub fn new(max_size_bytes: usize) -> Self {
        Self {
            max_size_bytes,
            size_bytes: BATCH_OVERHEAD_BYTES,
            messages: Vec::new(),
        }
    }

    /// Estimated encoded size of a single message.
    pub fn encoded_size(message: &OutgoingMessage) -> usize {
        MESSAGE_OVERHEAD_BYTES
            + message.body.len()
            + message.message_id.as_ref().map_or(0, String::len)
            + message.content_type.as_ref().map_or(0, String::len)
    }

    /// Append `message` if it fits. Returns `false` and drops nothing otherwise.
    pub fn try_add(&mut self, message: OutgoingMessage) -> bool {
        let size = Self::encoded_size(&message);
        match self.size_bytes.checked_add(size) {
            Some(total) if total <= self.max_size_bytes => {
                self.size_bytes = total;
                self.messages.push(message);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn max_size_bytes(&self) -> usize {
        self.max_size_bytes
    }

    pub fn messages(&self) -> &[OutgoingMessage] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<OutgoingMessage> {
        self.messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_batch() {
        let batch = MessageBatch::new(1024);
        assert!(batch.is_empty());
        assert_eq!(batch.size_bytes(), BATCH_OVERHEAD_BYTES);
    }

    #[test]
    fn test_add_keeps_insertion_order() {
        let mut batch = MessageBatch::new(1024);
        for i in 1..=3 {
            assert!(batch.try_add(OutgoingMessage::text(format!("Message {i}"))));
        }
        let bodies: Vec<_> = batch.messages().iter().map(|m| m.body_text().into_owned()).collect();
        assert_eq!(bodies, vec!["Message 1", "Message 2", "Message 3"]);
    }

    #[test]
    fn test_rejects_message_past_limit() {
        let one = MessageBatch::encoded_size(&OutgoingMessage::text("Message 1"));
        let mut batch = MessageBatch::new(BATCH_OVERHEAD_BYTES + 2 * one);

        assert!(batch.try_add(OutgoingMessage::text("Message 1")));
        assert!(batch.try_add(OutgoingMessage::text("Message 2")));
        assert!(!batch.try_add(OutgoingMessage::text("Message 3")));

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.size_bytes(), batch.max_size_bytes());
    }

    #[test]
    fn test_oversized_message_never_fits() {
        let mut batch = MessageBatch::new(128);
        assert!(!batch.try_add(OutgoingMessage::new(vec![0u8; 256])));
        assert!(batch.is_empty());
        // A smaller message still fits afterwards
        assert!(batch.try_add(OutgoingMessage::new(b"ok".to_vec())));
    }
}
