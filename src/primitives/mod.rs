mod authority;
mod digest;
mod header;

pub use {
  authority::{AuthorityId, Voter},
  digest::{
    BabeConsensusMessage,
    ConfigData,
    ConsensusDigest,
    ConsensusEngineId,
    Digest,
    DigestItem,
    EpochData,
    GrandpaConsensusMessage,
    BABE_ENGINE_ID,
    GRANDPA_ENGINE_ID,
  },
  header::{blake2_256, BlockNumber, Hash, Header},
};
