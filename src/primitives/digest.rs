use {
  super::authority::{AuthorityId, Voter},
  parity_scale_codec::{Decode, Encode},
};

/// Four ASCII bytes identifying the consensus engine a digest item
/// is addressed to.
pub type ConsensusEngineId = [u8; 4];

/// Engine id of the finality gadget.
pub const GRANDPA_ENGINE_ID: ConsensusEngineId = *b"GRND";

/// Engine id of the slot-based block producer.
pub const BABE_ENGINE_ID: ConsensusEngineId = *b"BABE";

/// Slot-claim tag inside a BABE pre-runtime digest that marks the
/// block as produced in a primary slot.
const PRIMARY_SLOT_CLAIM: u8 = 1;

/// A single metadata item attached to a block header.
///
/// The variant indices are part of the wire format and must not be
/// reordered.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum DigestItem {
  #[codec(index = 0)]
  Other(Vec<u8>),
  #[codec(index = 4)]
  Consensus(ConsensusEngineId, Vec<u8>),
  #[codec(index = 5)]
  Seal(ConsensusEngineId, Vec<u8>),
  #[codec(index = 6)]
  PreRuntime(ConsensusEngineId, Vec<u8>),
}

impl DigestItem {
  /// Returns the consensus message carried by this item, if any.
  /// Only `Consensus` items are interpreted by this crate.
  pub fn as_consensus(&self) -> Option<ConsensusDigest> {
    match self {
      DigestItem::Consensus(engine, data) => Some(ConsensusDigest {
        engine: *engine,
        data: data.clone(),
      }),
      _ => None,
    }
  }
}

/// Ordered list of digest items attached to a header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct Digest {
  pub logs: Vec<DigestItem>,
}

impl Digest {
  /// All consensus messages in this digest, in header order.
  pub fn consensus_messages(
    &self,
  ) -> impl Iterator<Item = ConsensusDigest> + '_ {
    self.logs.iter().filter_map(DigestItem::as_consensus)
  }

  /// True when the header carries a BABE pre-runtime item claiming
  /// a primary slot. Feeds the block tree's per-node primary flag.
  pub fn has_primary_slot_claim(&self) -> bool {
    self.logs.iter().any(|item| match item {
      DigestItem::PreRuntime(engine, data) => {
        *engine == BABE_ENGINE_ID && data.first() == Some(&PRIMARY_SLOT_CLAIM)
      }
      _ => false,
    })
  }
}

/// An extracted consensus digest: the engine it is addressed to and
/// the raw payload. The payload's first byte is the message tag,
/// followed by the SCALE body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusDigest {
  pub engine: ConsensusEngineId,
  pub data: Vec<u8>,
}

/// Messages the finality gadget publishes through block digests.
///
/// Tag values are consensus-critical wire format.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum GrandpaConsensusMessage {
  /// Rotate to the given voter set once the block `delay` blocks
  /// after the announcing one is finalized.
  #[codec(index = 1)]
  ScheduledChange { voters: Vec<Voter>, delay: u32 },

  /// Rotate to the given voter set once the block `delay` blocks
  /// after the announcing one is imported. Used for emergency
  /// rotation on forks.
  #[codec(index = 2)]
  ForcedChange { voters: Vec<Voter>, delay: u32 },

  /// A voter misbehaved and should be ignored.
  #[codec(index = 3)]
  OnDisabled { id: u64 },

  /// Suspend finality voting after `delay` blocks.
  #[codec(index = 4)]
  Pause { delay: u32 },

  /// Resume finality voting after `delay` blocks.
  #[codec(index = 5)]
  Resume { delay: u32 },
}

/// Messages the block producer publishes through block digests.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum BabeConsensusMessage {
  /// Authorities and randomness for the upcoming epoch.
  #[codec(index = 1)]
  NextEpochData {
    authorities: Vec<(AuthorityId, u64)>,
    randomness: [u8; 32],
  },

  /// A block-production authority was disabled.
  #[codec(index = 2)]
  OnDisabled { id: u32 },

  /// Chain constants for the upcoming epoch.
  #[codec(index = 3)]
  NextConfigData {
    c1: u64,
    c2: u64,
    secondary_slots: u8,
  },
}

/// Per-epoch authority data handed to the external epoch registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochData {
  pub authorities: Vec<(AuthorityId, u64)>,
  pub randomness: [u8; 32],
}

/// Per-epoch configuration handed to the external epoch registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigData {
  pub c1: u64,
  pub c2: u64,
  pub secondary_slots: u8,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn digest_item_wire_indices() {
    let consensus = DigestItem::Consensus(GRANDPA_ENGINE_ID, vec![]);
    let seal = DigestItem::Seal(BABE_ENGINE_ID, vec![]);
    let pre = DigestItem::PreRuntime(BABE_ENGINE_ID, vec![]);
    let other = DigestItem::Other(vec![]);

    assert_eq!(consensus.encode()[0], 4);
    assert_eq!(seal.encode()[0], 5);
    assert_eq!(pre.encode()[0], 6);
    assert_eq!(other.encode()[0], 0);
  }

  #[test]
  fn grandpa_message_tags() {
    let voters = vec![Voter {
      id: AuthorityId([7; 32]),
      weight: 1,
    }];

    let cases = [
      (
        GrandpaConsensusMessage::ScheduledChange {
          voters: voters.clone(),
          delay: 5,
        },
        1u8,
      ),
      (
        GrandpaConsensusMessage::ForcedChange { voters, delay: 5 },
        2u8,
      ),
      (GrandpaConsensusMessage::OnDisabled { id: 3 }, 3u8),
      (GrandpaConsensusMessage::Pause { delay: 2 }, 4u8),
      (GrandpaConsensusMessage::Resume { delay: 2 }, 5u8),
    ];

    for (message, tag) in cases {
      let encoded = message.encode();
      assert_eq!(encoded[0], tag);
      assert_eq!(
        GrandpaConsensusMessage::decode(&mut &encoded[..]).unwrap(),
        message
      );
    }
  }

  #[test]
  fn babe_message_tags() {
    let cases = [
      (
        BabeConsensusMessage::NextEpochData {
          authorities: vec![(AuthorityId([1; 32]), 1)],
          randomness: [9; 32],
        },
        1u8,
      ),
      (BabeConsensusMessage::OnDisabled { id: 2 }, 2u8),
      (
        BabeConsensusMessage::NextConfigData {
          c1: 1,
          c2: 4,
          secondary_slots: 2,
        },
        3u8,
      ),
    ];

    for (message, tag) in cases {
      let encoded = message.encode();
      assert_eq!(encoded[0], tag);
      assert_eq!(
        BabeConsensusMessage::decode(&mut &encoded[..]).unwrap(),
        message
      );
    }
  }

  #[test]
  fn scheduled_change_payload_matches_reference_bytes() {
    let message = GrandpaConsensusMessage::ScheduledChange {
      voters: vec![Voter::new(AuthorityId([0x11; 32]), 1)],
      delay: 5,
    };

    // tag, compact voter count, key, le weight, le delay
    let expected = hex::decode(concat!(
      "01",
      "04",
      "1111111111111111111111111111111111111111111111111111111111111111",
      "0100000000000000",
      "05000000",
    ))
    .unwrap();

    assert_eq!(message.encode(), expected);
  }

  #[test]
  fn primary_slot_claim_detection() {
    let primary = Digest {
      logs: vec![DigestItem::PreRuntime(BABE_ENGINE_ID, vec![1, 0, 0])],
    };
    let secondary = Digest {
      logs: vec![DigestItem::PreRuntime(BABE_ENGINE_ID, vec![2, 0, 0])],
    };
    let unrelated = Digest {
      logs: vec![DigestItem::PreRuntime(GRANDPA_ENGINE_ID, vec![1])],
    };

    assert!(primary.has_primary_slot_claim());
    assert!(!secondary.has_primary_slot_claim());
    assert!(!unrelated.has_primary_slot_claim());
    assert!(!Digest::default().has_primary_slot_claim());
  }

  #[test]
  fn consensus_extraction_skips_other_kinds() {
    let digest = Digest {
      logs: vec![
        DigestItem::Seal(BABE_ENGINE_ID, vec![1]),
        DigestItem::Consensus(GRANDPA_ENGINE_ID, vec![4, 2, 0, 0, 0]),
        DigestItem::Other(vec![5]),
      ],
    };

    let messages: Vec<_> = digest.consensus_messages().collect();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].engine, GRANDPA_ENGINE_ID);
    assert_eq!(messages[0].data, vec![4, 2, 0, 0, 0]);
  }
}
