//! Consumes consensus digests from imported headers and turns them
//! into correctly-timed mutations of the voter-set registry, the
//! epoch registry and the block producer.
//!
//! At most one change of each kind is in flight at a time. A
//! scheduled change waits for its trigger block to be finalized, a
//! forced change only for it to be imported, which is what makes
//! forced changes usable for emergency rotation on forks.

use {
  super::{
    authorities::{self, AuthoritySets},
    events,
    state::BlockState,
  },
  crate::primitives::{
    AuthorityId,
    BabeConsensusMessage,
    BlockNumber,
    ConfigData,
    ConsensusDigest,
    ConsensusEngineId,
    EpochData,
    GrandpaConsensusMessage,
    Header,
    Voter,
    BABE_ENGINE_ID,
    GRANDPA_ENGINE_ID,
  },
  parity_scale_codec::Decode,
  std::sync::{Arc, Mutex},
  thiserror::Error,
  tokio::sync::{mpsc, watch},
  tracing::{debug, error, warn},
};

/// Buffer depth of the imported/finalized subscriptions. Deep
/// enough to ride out bursts of block imports during sync.
const NOTIFICATION_BUFFER: usize = 16;

/// Errors produced by external collaborators behind the seam
/// traits.
pub type CollaboratorError = Box<dyn std::error::Error + Send + Sync>;

/// Registry of per-epoch block-production parameters, owned by the
/// slot-based producer subsystem.
pub trait EpochState: Send + Sync {
  fn epoch_for_block(
    &self,
    header: &Header,
  ) -> Result<u64, CollaboratorError>;

  fn set_epoch_data(
    &self,
    epoch: u64,
    data: EpochData,
  ) -> Result<(), CollaboratorError>;

  fn set_config_data(
    &self,
    epoch: u64,
    data: ConfigData,
  ) -> Result<(), CollaboratorError>;
}

/// The slot-based block producer, told when one of its authorities
/// is disabled.
pub trait BlockProducer: Send + Sync {
  fn set_on_disabled(&self, authority_index: u32);
}

/// The block verifier, told from which block an authority is
/// disabled.
pub trait Verifier: Send + Sync {
  fn set_on_disabled(
    &self,
    authority_index: u32,
    header: &Header,
  ) -> Result<(), CollaboratorError>;
}

#[derive(Debug, Error)]
pub enum Error {
  #[error("unknown consensus engine id {0:?}")]
  UnknownEngine(ConsensusEngineId),

  #[error("malformed consensus digest: {0}")]
  Codec(#[from] parity_scale_codec::Error),

  /// A second forced change was announced while one is pending.
  /// This is a protocol violation and must bubble up.
  #[error("a forced authority change is already pending")]
  ForcedChangePending,

  /// Only raised when strict scheduled-change handling is enabled.
  #[error("a scheduled authority change is already pending")]
  ScheduledChangePending,

  #[error(transparent)]
  Authorities(#[from] authorities::Error),

  #[error(transparent)]
  Subscription(#[from] events::Error),

  #[error("epoch registry failure: {0}")]
  EpochState(CollaboratorError),

  #[error("verifier failure: {0}")]
  Verifier(CollaboratorError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DigestHandlerConfig {
  /// By default a scheduled change announced while another is
  /// pending is quietly ignored. Enable to treat that as a
  /// protocol violation instead.
  pub strict_scheduled_changes: bool,
}

#[derive(Debug, Clone)]
struct AuthorityChange {
  voters: Vec<Voter>,
  at_block: BlockNumber,
}

#[derive(Debug, Clone, Copy)]
struct PauseSignal {
  at_block: BlockNumber,
}

#[derive(Debug, Clone, Copy)]
struct ResumeSignal {
  at_block: BlockNumber,
}

/// At most one pending slot per kind. Owned by the handler's event
/// task; everyone else reads through the mutex.
#[derive(Debug, Default)]
struct PendingChanges {
  scheduled_change: Option<AuthorityChange>,
  forced_change: Option<AuthorityChange>,
  pause: Option<PauseSignal>,
  resume: Option<ResumeSignal>,
}

struct EventChannels {
  imported: mpsc::Receiver<Header>,
  finalized: mpsc::Receiver<Header>,
  shutdown: watch::Receiver<bool>,
}

pub struct DigestHandler {
  block_state: Arc<BlockState>,
  epoch_state: Arc<dyn EpochState>,
  authority_sets: Arc<AuthoritySets>,
  block_producer: Arc<dyn BlockProducer>,
  verifier: Arc<dyn Verifier>,
  config: DigestHandlerConfig,
  pending: Mutex<PendingChanges>,
  channels: Mutex<Option<EventChannels>>,
  imported_id: u8,
  finalized_id: u8,
  shutdown: watch::Sender<bool>,
}

impl DigestHandler {
  /// Creates the handler and subscribes it to the imported and
  /// finalized streams.
  pub fn new(
    block_state: Arc<BlockState>,
    epoch_state: Arc<dyn EpochState>,
    authority_sets: Arc<AuthoritySets>,
    block_producer: Arc<dyn BlockProducer>,
    verifier: Arc<dyn Verifier>,
    config: DigestHandlerConfig,
  ) -> Result<Arc<Self>, Error> {
    let (imported_tx, imported_rx) = mpsc::channel(NOTIFICATION_BUFFER);
    let (finalized_tx, finalized_rx) = mpsc::channel(NOTIFICATION_BUFFER);
    let imported_id = block_state.register_imported_channel(imported_tx)?;
    let finalized_id =
      block_state.register_finalized_channel(finalized_tx)?;

    let (shutdown, shutdown_rx) = watch::channel(false);

    Ok(Arc::new(Self {
      block_state,
      epoch_state,
      authority_sets,
      block_producer,
      verifier,
      config,
      pending: Mutex::new(PendingChanges::default()),
      channels: Mutex::new(Some(EventChannels {
        imported: imported_rx,
        finalized: finalized_rx,
        shutdown: shutdown_rx,
      })),
      imported_id,
      finalized_id,
      shutdown,
    }))
  }

  /// Spawns the event loop that applies matured changes as their
  /// trigger blocks are imported or finalized.
  pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
    let handler = Arc::clone(self);
    let channels = handler
      .channels
      .lock()
      .expect("digest handler lock poisoned")
      .take();

    tokio::spawn(async move {
      match channels {
        Some(channels) => handler.run(channels).await,
        None => warn!("digest handler started twice, ignoring"),
      }
    })
  }

  /// Cooperative shutdown: the event loop stops reading, both
  /// subscriptions are dropped and in-flight events are discarded.
  pub fn stop(&self) {
    let _ = self.shutdown.send(true);
    self.block_state.unregister_imported_channel(self.imported_id);
    self
      .block_state
      .unregister_finalized_channel(self.finalized_id);
  }

  async fn run(&self, mut channels: EventChannels) {
    loop {
      tokio::select! {
        // imported before finalized, so both events for one block
        // are seen in that order
        biased;

        _ = channels.shutdown.changed() => return,

        imported = channels.imported.recv() => match imported {
          Some(header) => self.handle_imported(header.number),
          None => return,
        },

        finalized = channels.finalized.recv() => match finalized {
          Some(header) => self.handle_finalized(header.number),
          None => return,
        },
      }
    }
  }

  /// Block number of the next upcoming authority-set event, used
  /// by the finality gadget to arm its timers. `u64::MAX` when
  /// nothing is pending.
  pub fn next_grandpa_authority_change(&self) -> BlockNumber {
    let pending = self.pending.lock().expect("digest handler lock poisoned");

    [
      pending.scheduled_change.as_ref().map(|c| c.at_block),
      pending.forced_change.as_ref().map(|c| c.at_block),
      pending.pause.map(|p| p.at_block),
      pending.resume.map(|r| r.at_block),
    ]
    .into_iter()
    .flatten()
    .min()
    .unwrap_or(BlockNumber::MAX)
  }

  /// Parses a consensus digest from the given header and records or
  /// applies the message it carries. A malformed digest fails only
  /// the announcing block; protocol violations bubble up.
  pub fn handle_consensus_digest(
    &self,
    digest: &ConsensusDigest,
    header: &Header,
  ) -> Result<(), Error> {
    match digest.engine {
      GRANDPA_ENGINE_ID => {
        let message =
          GrandpaConsensusMessage::decode(&mut &digest.data[..])?;
        match message {
          GrandpaConsensusMessage::ScheduledChange { voters, delay } => {
            self.handle_scheduled_change(voters, delay, header)
          }
          GrandpaConsensusMessage::ForcedChange { voters, delay } => {
            self.handle_forced_change(voters, delay, header)
          }
          GrandpaConsensusMessage::Pause { delay } => {
            self.handle_pause(delay)
          }
          GrandpaConsensusMessage::Resume { delay } => {
            self.handle_resume(delay)
          }
          GrandpaConsensusMessage::OnDisabled { id } => {
            // voter disabling is handled inside the finality
            // gadget itself, nothing to schedule here
            debug!(authority = id, "ignoring grandpa disable notice");
            Ok(())
          }
        }
      }
      BABE_ENGINE_ID => {
        let message = BabeConsensusMessage::decode(&mut &digest.data[..])?;
        match message {
          BabeConsensusMessage::NextEpochData {
            authorities,
            randomness,
          } => self.handle_next_epoch_data(authorities, randomness, header),
          BabeConsensusMessage::NextConfigData {
            c1,
            c2,
            secondary_slots,
          } => self.handle_next_config_data(c1, c2, secondary_slots, header),
          BabeConsensusMessage::OnDisabled { id } => {
            self
              .verifier
              .set_on_disabled(id, header)
              .map_err(Error::Verifier)?;
            self.block_producer.set_on_disabled(id);
            Ok(())
          }
        }
      }
      engine => Err(Error::UnknownEngine(engine)),
    }
  }

  fn handle_scheduled_change(
    &self,
    voters: Vec<Voter>,
    delay: u32,
    header: &Header,
  ) -> Result<(), Error> {
    let best = self.block_state.best_block_header();

    {
      let mut pending =
        self.pending.lock().expect("digest handler lock poisoned");
      if pending.scheduled_change.is_some() {
        if self.config.strict_scheduled_changes {
          return Err(Error::ScheduledChangePending);
        }
        debug!("scheduled authority change already pending, ignoring");
        return Ok(());
      }

      // the pending trigger height is measured from the current
      // best block, while the registry records the height derived
      // from the announcing header; both bases are part of the
      // observable protocol and kept as-is
      pending.scheduled_change = Some(AuthorityChange {
        voters: voters.clone(),
        at_block: best.number + delay as u64,
      });
    }

    debug!(
      delay,
      voters = voters.len(),
      announced_in = %header,
      "handling scheduled authority change"
    );
    self
      .authority_sets
      .set_next_change(&voters, header.number + delay as u64)?;
    Ok(())
  }

  fn handle_forced_change(
    &self,
    voters: Vec<Voter>,
    delay: u32,
    header: &Header,
  ) -> Result<(), Error> {
    {
      let mut pending =
        self.pending.lock().expect("digest handler lock poisoned");
      if pending.forced_change.is_some() {
        return Err(Error::ForcedChangePending);
      }

      pending.forced_change = Some(AuthorityChange {
        voters: voters.clone(),
        at_block: header.number + delay as u64,
      });
    }

    debug!(
      delay,
      voters = voters.len(),
      announced_in = %header,
      "handling forced authority change"
    );
    self
      .authority_sets
      .set_next_change(&voters, header.number + delay as u64)?;
    Ok(())
  }

  fn handle_pause(&self, delay: u32) -> Result<(), Error> {
    let best = self.block_state.best_block_header();
    // the trigger sits one block short of best + delay; consensus
    // compatibility requires this exact height
    let at_block = (best.number + delay as u64).saturating_sub(1);

    let mut pending =
      self.pending.lock().expect("digest handler lock poisoned");
    pending.pause = Some(PauseSignal { at_block });
    debug!(at_block, "finality pause signalled");
    Ok(())
  }

  fn handle_resume(&self, delay: u32) -> Result<(), Error> {
    let best = self.block_state.best_block_header();
    let at_block = (best.number + delay as u64).saturating_sub(1);

    let mut pending =
      self.pending.lock().expect("digest handler lock poisoned");
    pending.resume = Some(ResumeSignal { at_block });
    debug!(at_block, "finality resume signalled");
    Ok(())
  }

  fn handle_next_epoch_data(
    &self,
    authorities: Vec<(AuthorityId, u64)>,
    randomness: [u8; 32],
    header: &Header,
  ) -> Result<(), Error> {
    let epoch = self
      .epoch_state
      .epoch_for_block(header)
      .map_err(Error::EpochState)?;

    debug!(
      block = header.number,
      epoch = epoch + 1,
      authorities = authorities.len(),
      "setting epoch data for upcoming epoch"
    );
    self
      .epoch_state
      .set_epoch_data(epoch + 1, EpochData {
        authorities,
        randomness,
      })
      .map_err(Error::EpochState)
  }

  fn handle_next_config_data(
    &self,
    c1: u64,
    c2: u64,
    secondary_slots: u8,
    header: &Header,
  ) -> Result<(), Error> {
    let epoch = self
      .epoch_state
      .epoch_for_block(header)
      .map_err(Error::EpochState)?;

    debug!(
      block = header.number,
      epoch = epoch + 1,
      "setting config data for upcoming epoch"
    );
    self
      .epoch_state
      .set_config_data(epoch + 1, ConfigData {
        c1,
        c2,
        secondary_slots,
      })
      .map_err(Error::EpochState)
  }

  /// Applies pending changes whose trigger is reaching the given
  /// block number on import: forced changes and resumes.
  fn handle_imported(&self, number: BlockNumber) {
    let mut pending =
      self.pending.lock().expect("digest handler lock poisoned");

    if let Some(resume) = pending.resume {
      if number == resume.at_block {
        debug!(at_block = number, "finality resumed");
        pending.resume = None;
      }
    }

    if let Some(forced) = &pending.forced_change {
      if number == forced.at_block {
        match self.authority_sets.increment_set_id() {
          Ok(set_id) => {
            debug!(set_id, at_block = number, "forced change applied")
          }
          Err(cause) => {
            error!(%cause, "failed to rotate authority set")
          }
        }
        pending.forced_change = None;
      }
    }
  }

  /// Applies pending changes whose trigger is reaching the given
  /// block number on finalization: pauses and scheduled changes.
  /// Finalizing at or past a pending forced change discards it,
  /// since the fork it was announced on lost.
  fn handle_finalized(&self, number: BlockNumber) {
    let mut pending =
      self.pending.lock().expect("digest handler lock poisoned");

    if let Some(pause) = pending.pause {
      if number == pause.at_block {
        debug!(at_block = number, "finality paused");
        pending.pause = None;
      }
    }

    if let Some(scheduled) = &pending.scheduled_change {
      if number == scheduled.at_block {
        match self.authority_sets.increment_set_id() {
          Ok(set_id) => {
            debug!(set_id, at_block = number, "scheduled change applied")
          }
          Err(cause) => {
            error!(%cause, "failed to rotate authority set")
          }
        }
        pending.scheduled_change = None;
      }
    }

    if let Some(forced) = &pending.forced_change {
      if number >= forced.at_block {
        warn!(
          at_block = forced.at_block,
          finalized = number,
          "discarding forced change overridden by finalization"
        );
        pending.forced_change = None;
      }
    }
  }
}
