//! Sync handshake messages and the handler that answers them.
//!
//! Each message is a varint tag followed by a length-prefixed payload:
//!
//! ```text
//! 0 SyncStep1  encoded state vector of the sender
//! 1 SyncStep2  update bringing the sender of step 1 up to date
//! 2 Update     incremental update produced by a local transaction
//! ```
//!
//! A peer opens a session by sending step 1; the other side replies with
//! step 2 and usually sends its own step 1 so both directions converge.

use crate::error::{Result, SyncError};
use tracing::{debug, trace};
use weft_codec::{Decoder, Encoder};
use weft_core::{Doc, Origin, ReadTxn, StateVector};

pub const MSG_SYNC_STEP_1: u64 = 0;
pub const MSG_SYNC_STEP_2: u64 = 1;
pub const MSG_UPDATE: u64 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    SyncStep1(StateVector),
    SyncStep2(Vec<u8>),
    Update(Vec<u8>),
}

impl SyncMessage {
    pub fn tag(&self) -> u64 {
        match self {
            SyncMessage::SyncStep1(_) => MSG_SYNC_STEP_1,
            SyncMessage::SyncStep2(_) => MSG_SYNC_STEP_2,
            SyncMessage::Update(_) => MSG_UPDATE,
        }
    }

    pub fn encode_into(&self, enc: &mut Encoder) {
        enc.write_var_u64(self.tag());
        match self {
            SyncMessage::SyncStep1(sv) => enc.write_var_buf(&sv.encode()),
            SyncMessage::SyncStep2(update) | SyncMessage::Update(update) => enc.write_var_buf(update),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        self.encode_into(&mut enc);
        enc.into_vec()
    }

    pub fn decode_from(dec: &mut Decoder<'_>) -> Result<Self> {
        let tag = dec.read_var_u64()?;
        let payload = dec.read_var_buf()?;
        match tag {
            MSG_SYNC_STEP_1 => Ok(SyncMessage::SyncStep1(StateVector::decode(payload)?)),
            MSG_SYNC_STEP_2 => Ok(SyncMessage::SyncStep2(payload.to_vec())),
            MSG_UPDATE => Ok(SyncMessage::Update(payload.to_vec())),
            other => Err(SyncError::UnknownMessage(other)),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Self::decode_from(&mut Decoder::new(bytes))
    }

    /// Decode every message in a buffer holding several back to back.
    pub fn decode_all(bytes: &[u8]) -> Result<Vec<Self>> {
        let mut dec = Decoder::new(bytes);
        let mut messages = Vec::new();
        while dec.has_content() {
            messages.push(Self::decode_from(&mut dec)?);
        }
        Ok(messages)
    }
}

/// Reactions to incoming sync messages. The default methods implement the
/// standard handshake; override them to add authorization or bookkeeping.
pub trait Protocol {
    /// First message of a session.
    fn start(&self, doc: &Doc) -> SyncMessage {
        SyncMessage::SyncStep1(doc.state_vector())
    }

    fn handle_sync_step1(&self, doc: &Doc, sv: StateVector) -> Result<Option<SyncMessage>> {
        let update = doc.encode_state_as_update_v2(&sv);
        trace!(bytes = update.len(), "answering sync step 1");
        Ok(Some(SyncMessage::SyncStep2(update)))
    }

    fn handle_sync_step2(&self, doc: &mut Doc, update: &[u8], origin: Option<Origin>) -> Result<Option<SyncMessage>> {
        doc.apply_update_v2_with(update, origin)?;
        Ok(None)
    }

    fn handle_update(&self, doc: &mut Doc, update: &[u8], origin: Option<Origin>) -> Result<Option<SyncMessage>> {
        doc.apply_update_v2_with(update, origin)?;
        Ok(None)
    }

    /// Dispatch `message` and return the reply, if any. `origin` is attached
    /// to the transaction applying a received update.
    fn handle(&self, doc: &mut Doc, message: SyncMessage, origin: Option<Origin>) -> Result<Option<SyncMessage>> {
        debug!(tag = message.tag(), "handling sync message");
        match message {
            SyncMessage::SyncStep1(sv) => self.handle_sync_step1(doc, sv),
            SyncMessage::SyncStep2(update) => self.handle_sync_step2(doc, &update, origin),
            SyncMessage::Update(update) => self.handle_update(doc, &update, origin),
        }
    }
}

/// The standard handshake without customization.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultProtocol;

impl Protocol for DefaultProtocol {}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::DocOptions;

    fn doc(client: u64) -> Doc {
        Doc::with_options(DocOptions::builder().client_id(client).build())
    }

    #[test]
    fn test_message_encoding() {
        let mut sv = StateVector::new();
        sv.set(7, 42);
        let messages = vec![
            SyncMessage::SyncStep1(sv),
            SyncMessage::SyncStep2(vec![1, 2, 3]),
            SyncMessage::Update(vec![]),
        ];
        let mut enc = Encoder::new();
        for message in &messages {
            message.encode_into(&mut enc);
        }
        assert_eq!(SyncMessage::decode_all(&enc.into_vec()).unwrap(), messages);
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let mut enc = Encoder::new();
        enc.write_var_u64(9);
        enc.write_var_buf(&[]);
        assert_eq!(
            SyncMessage::decode(&enc.into_vec()),
            Err(SyncError::UnknownMessage(9))
        );
    }

    #[test]
    fn test_truncated_message_is_rejected() {
        let bytes = SyncMessage::Update(vec![0; 10]).encode();
        assert!(matches!(
            SyncMessage::decode(&bytes[..5]),
            Err(SyncError::Codec(_))
        ));
    }

    #[test]
    fn test_handshake_brings_both_sides_up_to_date() {
        let mut a = doc(1);
        let mut b = doc(2);
        let text_a = a.get_text("t");
        let text_b = b.get_text("t");
        {
            let mut txn = a.transact_mut();
            text_a.insert(&mut txn, 0, "left ").unwrap();
        }
        {
            let mut txn = b.transact_mut();
            text_b.insert(&mut txn, 0, "right").unwrap();
        }

        let protocol = DefaultProtocol;
        let step1_a = protocol.start(&a);
        let step1_b = protocol.start(&b);
        let step2_for_a = protocol.handle(&mut b, step1_a, None).unwrap().unwrap();
        let step2_for_b = protocol.handle(&mut a, step1_b, None).unwrap().unwrap();
        assert!(protocol.handle(&mut a, step2_for_a, None).unwrap().is_none());
        assert!(protocol.handle(&mut b, step2_for_b, None).unwrap().is_none());

        assert_eq!(text_a.get_string(&a), "left right");
        assert_eq!(text_b.get_string(&b), "left right");
    }
}
