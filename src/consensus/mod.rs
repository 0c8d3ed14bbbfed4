pub mod authorities;
pub mod blocktree;
pub mod digest;
pub mod events;
pub mod state;

pub use {
  authorities::AuthoritySets,
  blocktree::BlockTree,
  digest::{
    BlockProducer,
    DigestHandler,
    DigestHandlerConfig,
    EpochState,
    Verifier,
  },
  events::{BlockEvents, NotificationStream},
  state::BlockState,
};
